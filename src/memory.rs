//! Object store backend: a fixed-capacity arena for object payloads
//!
//! The arena is one contiguous buffer so an RDMA fabric can register it once
//! and serve reads without intermediate copies. Space is carved out by a
//! first-fit free-list allocator that coalesces adjacent free ranges.
//! The backend knows nothing about keys or eviction.

use crate::error::{CacheError, CacheResult};
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Configuration for the arena
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ArenaConfig {
    /// Total size of the arena in bytes
    pub capacity: usize,
    /// Alignment for region offsets (must be a power of two)
    pub alignment: usize,
}

impl Default for ArenaConfig {
    fn default() -> Self {
        Self {
            capacity: 1024 * 1024 * 1024, // 1GB default
            alignment: 64,
        }
    }
}

/// A region of the arena, by index. Never a raw pointer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Region {
    pub offset: usize,
    pub len: usize,
}

impl Region {
    pub fn new(offset: usize, len: usize) -> Self {
        Self { offset, len }
    }

    pub fn end(&self) -> usize {
        self.offset + self.len
    }
}

/// First-fit allocator over `[0, capacity)`.
///
/// Free space is kept as an offset-ordered map of disjoint, non-adjacent
/// ranges. Allocations are rounded up to the alignment so every reserved
/// range starts and ends on an aligned boundary.
struct FreeListAllocator {
    capacity: usize,
    alignment: usize,
    /// offset -> length
    free: BTreeMap<usize, usize>,
    /// offset -> reserved (aligned) length
    reserved: BTreeMap<usize, usize>,
    used: usize,
}

impl FreeListAllocator {
    fn new(capacity: usize, alignment: usize) -> Self {
        let mut free = BTreeMap::new();
        if capacity > 0 {
            free.insert(0, capacity);
        }
        Self {
            capacity,
            alignment,
            free,
            reserved: BTreeMap::new(),
            used: 0,
        }
    }

    fn reserved_len(&self, size: usize) -> Option<usize> {
        size.checked_add(self.alignment - 1)
            .map(|s| s & !(self.alignment - 1))
    }

    fn allocate(&mut self, size: usize) -> Option<usize> {
        let needed = self.reserved_len(size)?;
        let (offset, block_len) = self
            .free
            .iter()
            .find(|(_, len)| **len >= needed)
            .map(|(&off, &len)| (off, len))?;

        self.free.remove(&offset);
        if block_len > needed {
            self.free.insert(offset + needed, block_len - needed);
        }
        self.reserved.insert(offset, needed);
        self.used += needed;
        Some(offset)
    }

    fn deallocate(&mut self, offset: usize) -> CacheResult<usize> {
        let len = self.reserved.remove(&offset).ok_or_else(|| {
            CacheError::internal(format!("free of unreserved offset {}", offset))
        })?;
        self.used -= len;

        let mut start = offset;
        let mut end = offset + len;

        // Merge with the preceding free range if it touches us
        if let Some((&prev_off, &prev_len)) = self.free.range(..start).next_back() {
            if prev_off + prev_len == start {
                self.free.remove(&prev_off);
                start = prev_off;
            }
        }
        // ...and with the following one
        if let Some(&next_len) = self.free.get(&end) {
            self.free.remove(&end);
            end += next_len;
        }

        self.free.insert(start, end - start);
        Ok(len)
    }

    fn largest_free(&self) -> usize {
        self.free.values().copied().max().unwrap_or(0)
    }

    /// Whether `size` would fit once the reservation at `offset` is freed
    /// and merged with its free neighbours. Nothing is modified.
    fn fits_after_free(&self, size: usize, offset: usize) -> bool {
        let Some(needed) = self.reserved_len(size) else {
            return false;
        };
        if self.largest_free() >= needed {
            return true;
        }
        let Some(&len) = self.reserved.get(&offset) else {
            return false;
        };

        let mut start = offset;
        let mut end = offset + len;
        if let Some((&prev_off, &prev_len)) = self.free.range(..start).next_back() {
            if prev_off + prev_len == start {
                start = prev_off;
            }
        }
        if let Some(&next_len) = self.free.get(&end) {
            end += next_len;
        }
        end - start >= needed
    }

    fn available(&self) -> usize {
        self.capacity - self.used
    }
}

/// Fixed-capacity arena holding object payloads
pub struct Arena {
    /// The actual memory buffer; never resized after construction
    buffer: RwLock<Box<[u8]>>,
    /// Base address of the buffer, for fabric registration
    base_addr: u64,
    capacity: usize,
    /// Allocator state, locked independently of the bytes
    allocator: Mutex<FreeListAllocator>,
}

impl Arena {
    /// Create a new arena with the given configuration
    pub fn new(config: ArenaConfig) -> CacheResult<Self> {
        if config.alignment == 0 || !config.alignment.is_power_of_two() {
            return Err(CacheError::InvalidSize(format!(
                "alignment {} is not a power of two",
                config.alignment
            )));
        }

        let buffer = vec![0u8; config.capacity].into_boxed_slice();
        let base_addr = buffer.as_ptr() as u64;

        tracing::debug!(
            "Arena created: capacity={} alignment={}",
            config.capacity,
            config.alignment
        );

        Ok(Self {
            buffer: RwLock::new(buffer),
            base_addr,
            capacity: config.capacity,
            allocator: Mutex::new(FreeListAllocator::new(config.capacity, config.alignment)),
        })
    }

    /// Reserve a region of `size` bytes
    pub fn allocate(&self, size: usize) -> CacheResult<Region> {
        if size == 0 {
            return Err(CacheError::InvalidSize("zero-length allocation".into()));
        }
        let offset = self
            .allocator
            .lock()
            .allocate(size)
            .ok_or(CacheError::OutOfSpace { needed: size })?;

        Ok(Region::new(offset, size))
    }

    /// Return a region to the free list
    pub fn free(&self, region: Region) -> CacheResult<()> {
        self.check_bounds(region)?;
        self.allocator.lock().deallocate(region.offset)?;
        Ok(())
    }

    /// Copy `data` into the start of `region`
    pub fn write(&self, region: Region, data: &[u8]) -> CacheResult<()> {
        self.check_bounds(region)?;
        if data.len() > region.len {
            return Err(CacheError::internal(format!(
                "write of {} bytes into region of {}",
                data.len(),
                region.len
            )));
        }
        let mut buffer = self.buffer.write();
        buffer[region.offset..region.offset + data.len()].copy_from_slice(data);
        Ok(())
    }

    /// Copy a region out of the arena
    pub fn read(&self, region: Region) -> CacheResult<Bytes> {
        self.with_region(region, Bytes::copy_from_slice)
    }

    /// Borrow a region's bytes without copying
    pub fn with_region<R>(&self, region: Region, f: impl FnOnce(&[u8]) -> R) -> CacheResult<R> {
        self.check_bounds(region)?;
        let buffer = self.buffer.read();
        Ok(f(&buffer[region.offset..region.end()]))
    }

    fn check_bounds(&self, region: Region) -> CacheResult<()> {
        match region.offset.checked_add(region.len) {
            Some(end) if end <= self.capacity => Ok(()),
            _ => Err(CacheError::internal(format!(
                "region {}+{} outside arena of {} bytes",
                region.offset, region.len, self.capacity
            ))),
        }
    }

    /// Largest contiguous allocation that would currently succeed
    pub fn largest_free(&self) -> usize {
        self.allocator.lock().largest_free()
    }

    /// Whether an allocation of `size` bytes would currently succeed
    pub fn can_allocate(&self, size: usize) -> bool {
        let alloc = self.allocator.lock();
        alloc
            .reserved_len(size)
            .map(|needed| needed <= alloc.largest_free())
            .unwrap_or(false)
    }

    /// Whether an allocation of `size` bytes would succeed after `region`
    /// is freed
    pub fn can_allocate_after_free(&self, size: usize, region: Region) -> bool {
        self.allocator.lock().fits_after_free(size, region.offset)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Base address of the arena buffer
    pub fn base_addr(&self) -> u64 {
        self.base_addr
    }

    /// Get arena statistics
    pub fn stats(&self) -> ArenaStats {
        let alloc = self.allocator.lock();
        ArenaStats {
            total: self.capacity,
            used: alloc.used,
            available: alloc.available(),
            largest_free: alloc.largest_free(),
            free_ranges: alloc.free.len(),
        }
    }
}

/// Arena statistics
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ArenaStats {
    pub total: usize,
    pub used: usize,
    pub available: usize,
    pub largest_free: usize,
    /// Number of disjoint free ranges; more than one means fragmentation
    pub free_ranges: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn arena(capacity: usize, alignment: usize) -> Arena {
        Arena::new(ArenaConfig {
            capacity,
            alignment,
        })
        .unwrap()
    }

    #[test]
    fn test_arena_allocation() {
        let arena = arena(4096, 64);

        let r1 = arena.allocate(100).unwrap();
        assert_eq!(r1.offset, 0);
        assert_eq!(r1.len, 100);

        let r2 = arena.allocate(200).unwrap();
        assert_eq!(r2.offset, 128);
        assert_eq!(arena.stats().used, 128 + 256);
    }

    #[test]
    fn test_arena_write_read() {
        let arena = arena(4096, 64);
        let region = arena.allocate(12).unwrap();

        arena.write(region, b"Hello, RDMA!").unwrap();
        assert_eq!(&arena.read(region).unwrap()[..], b"Hello, RDMA!");
    }

    #[test]
    fn test_free_coalesces_neighbours() {
        let arena = arena(300, 1);
        let a = arena.allocate(100).unwrap();
        let b = arena.allocate(100).unwrap();
        let c = arena.allocate(100).unwrap();
        assert!(arena.allocate(1).is_err());

        arena.free(a).unwrap();
        arena.free(c).unwrap();
        assert_eq!(arena.stats().free_ranges, 2);
        assert_eq!(arena.largest_free(), 100);

        arena.free(b).unwrap();
        let stats = arena.stats();
        assert_eq!(stats.free_ranges, 1);
        assert_eq!(stats.largest_free, 300);
        assert_eq!(stats.used, 0);
    }

    #[test]
    fn test_fragmentation_is_out_of_space() {
        let arena = arena(300, 1);
        let a = arena.allocate(100).unwrap();
        let _b = arena.allocate(100).unwrap();
        let c = arena.allocate(100).unwrap();
        arena.free(a).unwrap();
        arena.free(c).unwrap();

        // 200 bytes free in total but no 150-byte hole
        assert_eq!(arena.stats().available, 200);
        assert_eq!(
            arena.allocate(150),
            Err(CacheError::OutOfSpace { needed: 150 })
        );
        assert!(!arena.can_allocate(150));
        assert!(arena.can_allocate(100));
    }

    #[test]
    fn test_can_allocate_after_free_merges_neighbours() {
        let arena = arena(100, 1);
        let a = arena.allocate(40).unwrap();
        let b = arena.allocate(50).unwrap();

        assert!(!arena.can_allocate(50));
        // b plus the 10-byte tail
        assert!(arena.can_allocate_after_free(60, b));
        assert!(!arena.can_allocate_after_free(61, b));
        assert!(arena.can_allocate_after_free(40, a));
        assert!(!arena.can_allocate_after_free(41, a));
        // Nothing was actually freed
        assert_eq!(arena.stats().used, 90);

        arena.free(a).unwrap();
        assert!(arena.can_allocate_after_free(100, b));
    }

    #[test]
    fn test_double_free_is_internal_error() {
        let arena = arena(256, 8);
        let region = arena.allocate(16).unwrap();
        arena.free(region).unwrap();
        assert!(matches!(arena.free(region), Err(CacheError::Internal(_))));
        assert_eq!(arena.stats().used, 0);
    }

    #[test]
    fn test_out_of_bounds_region_rejected() {
        let arena = arena(256, 8);
        let bogus = Region::new(250, 16);
        assert!(matches!(arena.read(bogus), Err(CacheError::Internal(_))));
        assert!(matches!(arena.write(bogus, b"x"), Err(CacheError::Internal(_))));
        assert!(matches!(arena.free(bogus), Err(CacheError::Internal(_))));
    }

    #[test]
    fn test_zero_and_bad_alignment() {
        assert!(Arena::new(ArenaConfig {
            capacity: 64,
            alignment: 3
        })
        .is_err());
        let arena = arena(64, 8);
        assert!(matches!(arena.allocate(0), Err(CacheError::InvalidSize(_))));
    }
}
