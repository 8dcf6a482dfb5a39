//! RDMA fabric abstraction
//!
//! The RDMA adapter only needs three things from a fabric: its domain
//! addresses, one-time registration of a memory region, and one-sided writes
//! into a remote registered region. [`LoopbackFabric`] provides those inside
//! a single process by resolving remote keys to registered arenas, which is
//! what the tests and the `rdma-client` binary run against.

use crate::memory::{Arena, Region};
use crate::protocol::{DomainAddress, MemoryRegionDescriptor, MemoryRegionRemoteKey, ValueLocation};
use anyhow::{anyhow, Result};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Configuration for the RDMA transport
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Node ID for this transport instance
    pub node_id: u32,
    /// Number of NICs/domains to use
    pub num_domains: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            node_id: 0,
            num_domains: 1,
        }
    }
}

/// One-sided write of `src` (inside a registered region) into `dst`
#[derive(Debug)]
pub struct TransferRequest<'a> {
    pub src: &'a [u8],
    pub dst: &'a ValueLocation,
}

/// Result of a transfer operation
#[derive(Clone, Debug)]
pub struct TransferResult {
    pub bytes_transferred: u64,
}

/// Operations a fabric provides
pub trait Fabric: Send + Sync {
    /// Get the domain addresses for this fabric
    fn domain_addresses(&self) -> Vec<DomainAddress>;

    /// Register an arena for remote access
    fn register_memory(&self, arena: Arc<Arena>) -> Result<MemoryRegionDescriptor>;

    /// Drop a registration
    fn deregister_memory(&self, descriptor: &MemoryRegionDescriptor);

    /// Write and wait for the completion
    fn write(&self, request: TransferRequest<'_>) -> Result<TransferResult>;
}

/// RDMA transport handle, cheap to clone
#[derive(Clone)]
pub struct RdmaTransport {
    inner: Arc<dyn Fabric>,
    transfers: Arc<AtomicU64>,
    bytes: Arc<AtomicU64>,
}

impl RdmaTransport {
    /// Create a transport over the in-process loopback fabric
    pub fn loopback(config: TransportConfig) -> Self {
        let inner: Arc<dyn Fabric> = Arc::new(LoopbackFabric::new(&config));
        Self::with_fabric(inner)
    }

    pub fn with_fabric(inner: Arc<dyn Fabric>) -> Self {
        Self {
            inner,
            transfers: Arc::new(AtomicU64::new(0)),
            bytes: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Get the domain addresses for this transport
    pub fn domain_addresses(&self) -> Vec<DomainAddress> {
        self.inner.domain_addresses()
    }

    /// Register memory for RDMA access
    pub fn register_memory(&self, arena: Arc<Arena>) -> Result<MemoryRegionDescriptor> {
        self.inner.register_memory(arena)
    }

    pub fn deregister_memory(&self, descriptor: &MemoryRegionDescriptor) {
        self.inner.deregister_memory(descriptor)
    }

    /// Submit a write and wait for its completion
    pub fn write(&self, request: TransferRequest<'_>) -> Result<TransferResult> {
        let result = self.inner.write(request)?;
        self.transfers.fetch_add(1, Ordering::Relaxed);
        self.bytes
            .fetch_add(result.bytes_transferred, Ordering::Relaxed);
        Ok(result)
    }

    /// (completed transfers, bytes moved)
    pub fn counters(&self) -> (u64, u64) {
        (
            self.transfers.load(Ordering::Relaxed),
            self.bytes.load(Ordering::Relaxed),
        )
    }
}

/// Fabric that moves bytes between arenas registered in this process
pub struct LoopbackFabric {
    domain_addresses: Vec<DomainAddress>,
    regions: DashMap<MemoryRegionRemoteKey, Arc<Arena>>,
    next_rkey: AtomicU64,
}

impl LoopbackFabric {
    pub fn new(config: &TransportConfig) -> Self {
        let domain_addresses = (0..config.num_domains)
            .map(|i| {
                DomainAddress::new(
                    format!("loopback://node{}/domain{}", config.node_id, i).into_bytes(),
                )
            })
            .collect();

        Self {
            domain_addresses,
            regions: DashMap::new(),
            next_rkey: AtomicU64::new(1),
        }
    }
}

impl Fabric for LoopbackFabric {
    fn domain_addresses(&self) -> Vec<DomainAddress> {
        self.domain_addresses.clone()
    }

    fn register_memory(&self, arena: Arc<Arena>) -> Result<MemoryRegionDescriptor> {
        let rkey = MemoryRegionRemoteKey(self.next_rkey.fetch_add(1, Ordering::Relaxed));
        let descriptor = MemoryRegionDescriptor::new(
            arena.base_addr(),
            arena.capacity() as u64,
            self.domain_addresses
                .iter()
                .map(|addr| (addr.clone(), rkey))
                .collect(),
        );

        tracing::debug!(
            "Loopback registered region: ptr={:#x} len={} rkey={}",
            descriptor.ptr,
            descriptor.len,
            rkey.0
        );
        self.regions.insert(rkey, arena);
        Ok(descriptor)
    }

    fn deregister_memory(&self, descriptor: &MemoryRegionDescriptor) {
        for (_, rkey) in descriptor.addr_rkey_list.iter() {
            self.regions.remove(rkey);
        }
    }

    fn write(&self, request: TransferRequest<'_>) -> Result<TransferResult> {
        let dst = request.dst;
        let len = request.src.len() as u64;
        if len > dst.length {
            return Err(anyhow!(
                "transfer of {} bytes exceeds destination window of {}",
                len,
                dst.length
            ));
        }

        let rkey = dst
            .mr_descriptor
            .first_rkey()
            .ok_or_else(|| anyhow!("destination descriptor has no remote key"))?;
        let target = self
            .regions
            .get(&rkey)
            .map(|r| Arc::clone(r.value()))
            .ok_or_else(|| anyhow!("remote key {} is not registered", rkey.0))?;

        target
            .write(Region::new(dst.offset as usize, request.src.len()), request.src)
            .map_err(|e| anyhow!("loopback write failed: {}", e))?;

        tracing::trace!(
            "Loopback write: rkey={} dst_offset={} length={}",
            rkey.0,
            dst.offset,
            len
        );

        Ok(TransferResult {
            bytes_transferred: len,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::ArenaConfig;

    fn arena(capacity: usize) -> Arc<Arena> {
        Arc::new(
            Arena::new(ArenaConfig {
                capacity,
                alignment: 8,
            })
            .unwrap(),
        )
    }

    #[test]
    fn test_loopback_transfer() {
        let transport = RdmaTransport::loopback(TransportConfig {
            node_id: 1,
            num_domains: 2,
        });
        assert_eq!(transport.domain_addresses().len(), 2);

        let dst_arena = arena(64);
        let descriptor = transport.register_memory(Arc::clone(&dst_arena)).unwrap();
        assert_eq!(descriptor.addr_rkey_list.len(), 2);

        let location = ValueLocation::new(2, descriptor, 8, 16);
        let src = [1u8, 2, 3, 4, 5];
        let result = transport
            .write(TransferRequest {
                src: &src,
                dst: &location,
            })
            .unwrap();
        assert_eq!(result.bytes_transferred, 5);

        let copied = dst_arena.read(Region::new(8, 5)).unwrap();
        assert_eq!(&copied[..], &src);
        assert_eq!(transport.counters(), (1, 5));
    }

    #[test]
    fn test_loopback_rejects_overflow_and_unknown_key() {
        let transport = RdmaTransport::loopback(TransportConfig::default());
        let dst_arena = arena(64);
        let descriptor = transport.register_memory(dst_arena).unwrap();

        let small = ValueLocation::new(2, descriptor.clone(), 0, 2);
        let request = TransferRequest {
            src: b"too long",
            dst: &small,
        };
        assert!(transport.write(request).is_err());

        transport.deregister_memory(&descriptor);
        let location = ValueLocation::new(2, descriptor, 0, 16);
        let request = TransferRequest {
            src: b"x",
            dst: &location,
        };
        assert!(transport.write(request).is_err());
        assert_eq!(transport.counters(), (0, 0));
    }
}
