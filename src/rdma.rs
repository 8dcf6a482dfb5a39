//! RDMA transport adapter
//!
//! Work requests posted by connected clients are serviced by a pool of OS
//! worker threads. A get is answered by writing the value straight out of
//! the registered cache arena into the client's registered receive buffer;
//! the response only carries the status and the value length.
//!
//! The arena is registered with the fabric once, when the adapter starts.

use crate::cache::{CacheManager, ObjectHandle};
use crate::dispatcher::{Dispatcher, TransportAdapter, TransportContext, TransportKind};
use crate::error::{CacheError, CacheResult};
use crate::memory::{Arena, ArenaConfig, Region};
use crate::protocol::{Key, MemoryRegionDescriptor, OpKind, Request, Response, Status, ValueLocation};
use crate::transport::{RdmaTransport, TransferRequest};
use anyhow::{anyhow, Result};
use bytes::Bytes;
use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// RDMA adapter configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RdmaConfig {
    /// Number of worker threads servicing completions
    pub worker_threads: usize,
    /// Depth of the shared receive queue
    pub queue_depth: usize,
}

impl Default for RdmaConfig {
    fn default() -> Self {
        Self {
            worker_threads: 4,
            queue_depth: 1024,
        }
    }
}

enum WorkRequest {
    Recv {
        ctx: TransportContext,
        request: Request,
        reply: Sender<Response>,
    },
    Disconnect {
        ctx: TransportContext,
    },
}

/// Delivers get values with one-sided writes
struct RdmaDelivery {
    transport: RdmaTransport,
}

impl TransportAdapter for RdmaDelivery {
    fn kind(&self) -> TransportKind {
        TransportKind::Rdma
    }

    fn deliver(
        &self,
        cache: &CacheManager,
        handle: &ObjectHandle,
        request: &Request,
    ) -> CacheResult<Option<Bytes>> {
        let location = request
            .response_location
            .as_ref()
            .ok_or_else(|| CacheError::InvalidSize("get without a receive buffer".into()))?;
        if (handle.size as u64) > location.length {
            return Err(CacheError::InvalidSize(format!(
                "value of {} bytes does not fit receive window of {}",
                handle.size, location.length
            )));
        }

        cache
            .with_object(handle, |bytes| {
                self.transport.write(TransferRequest {
                    src: bytes,
                    dst: location,
                })
            })?
            .map_err(|e| CacheError::internal(format!("RDMA write failed: {}", e)))?;

        Ok(None)
    }
}

/// RDMA adapter: owns the worker pool and the arena registration
pub struct RdmaAdapter {
    dispatcher: Arc<Dispatcher>,
    transport: RdmaTransport,
    arena_descriptor: MemoryRegionDescriptor,
    queue: Sender<WorkRequest>,
    shutdown: Mutex<Option<Sender<()>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl RdmaAdapter {
    /// Register the cache arena and start the worker pool
    pub fn start(
        dispatcher: Arc<Dispatcher>,
        transport: RdmaTransport,
        config: RdmaConfig,
    ) -> Result<Self> {
        let arena_descriptor = transport.register_memory(Arc::clone(dispatcher.cache().arena()))?;

        tracing::info!(
            "RDMA adapter registered arena: ptr={:#x} len={} domains={}",
            arena_descriptor.ptr,
            arena_descriptor.len,
            arena_descriptor.addr_rkey_list.len()
        );

        let (queue, work) = channel::bounded(config.queue_depth.max(1));
        let (shutdown_tx, shutdown_rx) = channel::bounded::<()>(0);
        let delivery = Arc::new(RdmaDelivery {
            transport: transport.clone(),
        });

        let mut workers = Vec::with_capacity(config.worker_threads);
        for i in 0..config.worker_threads.max(1) {
            let dispatcher = Arc::clone(&dispatcher);
            let delivery = Arc::clone(&delivery);
            let work = work.clone();
            let shutdown = shutdown_rx.clone();
            let handle = std::thread::Builder::new()
                .name(format!("rdma-worker-{}", i))
                .spawn(move || worker_loop(dispatcher, delivery, work, shutdown))?;
            workers.push(handle);
        }

        tracing::info!("RDMA adapter started {} workers", workers.len());

        Ok(Self {
            dispatcher,
            transport,
            arena_descriptor,
            queue,
            shutdown: Mutex::new(Some(shutdown_tx)),
            workers: Mutex::new(workers),
        })
    }

    /// Descriptor of the registered cache arena
    pub fn arena_descriptor(&self) -> &MemoryRegionDescriptor {
        &self.arena_descriptor
    }

    pub fn transport(&self) -> &RdmaTransport {
        &self.transport
    }

    /// Accept a client connection
    pub fn connect(&self, client_id: u32) -> RdmaConnection {
        let ctx = self.dispatcher.open_connection(TransportKind::Rdma);
        tracing::info!(
            "RDMA client {} connected as conn={}",
            client_id,
            ctx.connection.0
        );
        RdmaConnection {
            ctx,
            queue: self.queue.clone(),
            timeout: Duration::from_secs(30),
        }
    }

    /// Stop the workers and drop the arena registration
    pub fn shutdown(&self) {
        if self.shutdown.lock().take().is_none() {
            return;
        }
        for worker in self.workers.lock().drain(..) {
            if worker.join().is_err() {
                tracing::error!("RDMA worker panicked");
            }
        }
        self.transport.deregister_memory(&self.arena_descriptor);
        tracing::info!("RDMA adapter stopped");
    }
}

impl Drop for RdmaAdapter {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(
    dispatcher: Arc<Dispatcher>,
    delivery: Arc<RdmaDelivery>,
    work: Receiver<WorkRequest>,
    shutdown: Receiver<()>,
) {
    loop {
        channel::select! {
            recv(work) -> msg => match msg {
                Ok(wr) => handle_work(&dispatcher, &delivery, wr),
                Err(_) => return,
            },
            recv(shutdown) -> _ => break,
        }
    }

    // Drain what was already posted so teardown still releases leases
    while let Ok(wr) = work.try_recv() {
        handle_work(&dispatcher, &delivery, wr);
    }
}

fn handle_work(dispatcher: &Dispatcher, delivery: &RdmaDelivery, wr: WorkRequest) {
    match wr {
        WorkRequest::Recv {
            ctx,
            request,
            reply,
        } => {
            let response = dispatcher.dispatch(delivery, &ctx, request);
            if reply.send(response).is_err() {
                tracing::debug!(
                    "RDMA conn={} went away before its reply",
                    ctx.connection.0
                );
            }
        }
        WorkRequest::Disconnect { ctx } => {
            dispatcher.disconnect(&ctx);
        }
    }
}

/// A client's queue pair into the adapter
pub struct RdmaConnection {
    ctx: TransportContext,
    queue: Sender<WorkRequest>,
    timeout: Duration,
}

impl RdmaConnection {
    pub fn context(&self) -> &TransportContext {
        &self.ctx
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Post a request; its completion arrives on the returned channel
    pub fn post(&self, request: Request) -> Result<Receiver<Response>> {
        let (reply, completion) = channel::bounded(1);
        self.queue
            .send(WorkRequest::Recv {
                ctx: self.ctx,
                request,
                reply,
            })
            .map_err(|_| anyhow!("RDMA adapter is shut down"))?;
        Ok(completion)
    }

    /// Post a request and wait for its completion
    pub fn call(&self, request: Request) -> Result<Response> {
        let request_id = request.request_id;
        self.post(request)?
            .recv_timeout(self.timeout)
            .map_err(|e| anyhow!("request {} did not complete: {}", request_id, e))
    }
}

impl Drop for RdmaConnection {
    fn drop(&mut self) {
        // Teardown must give back anything still leased for this connection
        let _ = self.queue.send(WorkRequest::Disconnect { ctx: self.ctx });
    }
}

/// RDMA client configuration
#[derive(Clone, Debug)]
pub struct RdmaClientConfig {
    pub client_id: u32,
    /// Receive buffer size for RDMA transfers
    pub receive_buffer_size: usize,
    /// Receive window reserved per get
    pub max_value_size: usize,
    /// How long a call waits for its completion
    pub request_timeout: Duration,
}

impl Default for RdmaClientConfig {
    fn default() -> Self {
        Self {
            client_id: 1,
            receive_buffer_size: 64 * 1024 * 1024, // 64MB default
            max_value_size: 1024 * 1024,           // 1MB max value
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// Client that receives values through its own registered buffer
pub struct RdmaCacheClient {
    config: RdmaClientConfig,
    connection: RdmaConnection,
    transport: RdmaTransport,
    receive_buffer: Arc<Arena>,
    descriptor: MemoryRegionDescriptor,
    request_counter: AtomicU64,
    /// Windows of timed-out gets. The server may still write into them, so
    /// they stay reserved until their completion arrives.
    abandoned: Mutex<Vec<(Region, Receiver<Response>)>>,
}

impl RdmaCacheClient {
    /// Register a receive buffer and connect to `adapter`
    pub fn connect(adapter: &RdmaAdapter, config: RdmaClientConfig) -> Result<Self> {
        let receive_buffer = Arc::new(Arena::new(ArenaConfig {
            capacity: config.receive_buffer_size,
            alignment: 64,
        })?);
        let transport = adapter.transport().clone();
        let descriptor = transport.register_memory(Arc::clone(&receive_buffer))?;
        let mut connection = adapter.connect(config.client_id);
        connection.set_timeout(config.request_timeout);

        Ok(Self {
            config,
            connection,
            transport,
            receive_buffer,
            descriptor,
            request_counter: AtomicU64::new(0),
            abandoned: Mutex::new(Vec::new()),
        })
    }

    fn next_request_id(&self) -> u64 {
        self.request_counter.fetch_add(1, Ordering::Relaxed)
    }

    /// Get a value; the server writes it into our receive buffer
    pub fn get(&self, key: &[u8]) -> Result<Vec<u8>> {
        self.reclaim_abandoned();

        let window = self.receive_buffer.allocate(self.config.max_value_size)?;
        let location = ValueLocation::new(
            self.config.client_id,
            self.descriptor.clone(),
            window.offset as u64,
            window.len as u64,
        );

        let request_id = self.next_request_id();
        let request = Request::get(request_id, Key::new(key)).with_response_location(location);
        let completion = match self.connection.post(request) {
            Ok(completion) => completion,
            Err(e) => {
                self.receive_buffer.free(window)?;
                return Err(e);
            }
        };

        let response = match completion.recv_timeout(self.connection.timeout()) {
            Ok(response) => response,
            Err(RecvTimeoutError::Timeout) => {
                tracing::warn!(
                    "GET request {} timed out; keeping window at offset {} reserved",
                    request_id,
                    window.offset
                );
                self.abandoned.lock().push((window, completion));
                return Err(anyhow!("request {} did not complete: timed out", request_id));
            }
            Err(RecvTimeoutError::Disconnected) => {
                self.receive_buffer.free(window)?;
                return Err(anyhow!("request {} dropped by the adapter", request_id));
            }
        };

        let result = if response.status != Status::Ok {
            Err(anyhow!(
                "GET failed ({:?}): {}",
                response.status,
                response.error_message
            ))
        } else {
            self.receive_buffer
                .read(Region::new(window.offset, response.length as usize))
                .map(|value| value.to_vec())
                .map_err(Into::into)
        };

        self.receive_buffer.free(window)?;
        result
    }

    /// Free the windows of timed-out gets whose completion has since arrived
    fn reclaim_abandoned(&self) {
        self.abandoned.lock().retain(|(window, completion)| {
            match completion.try_recv() {
                Err(TryRecvError::Empty) => true,
                _ => {
                    if let Err(e) = self.receive_buffer.free(*window) {
                        tracing::error!("Failed to free receive window {:?}: {}", window, e);
                    }
                    false
                }
            }
        });
    }

    /// Receive windows still held by timed-out gets
    pub fn abandoned_windows(&self) -> usize {
        self.abandoned.lock().len()
    }

    /// Put a value; small payloads travel inline with the request
    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        let request = Request::put(self.next_request_id(), Key::new(key), value.to_vec());
        let response = self.connection.call(request)?;
        if response.status != Status::Ok {
            return Err(anyhow!(
                "PUT failed ({:?}): {}",
                response.status,
                response.error_message
            ));
        }
        Ok(())
    }

    /// Delete a value. Returns whether the key existed.
    pub fn delete(&self, key: &[u8]) -> Result<bool> {
        let request = Request::delete(self.next_request_id(), Key::new(key));
        let response = self.connection.call(request)?;
        match response.status {
            Status::Ok => Ok(true),
            Status::NotFound => Ok(false),
            other => Err(anyhow!("DELETE failed ({:?}): {}", other, response.error_message)),
        }
    }

    /// Send a raw request over this connection
    pub fn call(&self, op: OpKind, key: &[u8]) -> Result<Response> {
        self.connection
            .call(Request::new(self.next_request_id(), op, Key::new(key)))
    }

    pub fn receive_buffer_stats(&self) -> crate::memory::ArenaStats {
        self.receive_buffer.stats()
    }
}

impl Drop for RdmaCacheClient {
    fn drop(&mut self) {
        self.transport.deregister_memory(&self.descriptor);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheConfig;
    use crate::transport::TransportConfig;

    fn adapter(capacity: usize) -> RdmaAdapter {
        let cache = CacheManager::new(CacheConfig::with_capacity(capacity, capacity / 2)).unwrap();
        let dispatcher = Arc::new(Dispatcher::new(Arc::new(cache)));
        RdmaAdapter::start(
            dispatcher,
            RdmaTransport::loopback(TransportConfig::default()),
            RdmaConfig {
                worker_threads: 2,
                queue_depth: 16,
            },
        )
        .unwrap()
    }

    fn client(adapter: &RdmaAdapter, client_id: u32) -> RdmaCacheClient {
        RdmaCacheClient::connect(
            adapter,
            RdmaClientConfig {
                client_id,
                receive_buffer_size: 64 * 1024,
                max_value_size: 4096,
                ..Default::default()
            },
        )
        .unwrap()
    }

    #[test]
    fn test_put_get_over_loopback() {
        let adapter = adapter(64 * 1024);
        let client = client(&adapter, 1);

        client.put(b"key1", b"value1").unwrap();
        assert_eq!(client.get(b"key1").unwrap(), b"value1");
        assert!(client.get(b"missing").is_err());

        assert!(client.delete(b"key1").unwrap());
        assert!(!client.delete(b"key1").unwrap());

        // Every receive window went back to the pool
        assert_eq!(client.receive_buffer_stats().used, 0);
        let (transfers, bytes) = adapter.transport().counters();
        assert_eq!((transfers, bytes), (1, 6));
    }

    #[test]
    fn test_value_larger_than_window() {
        let adapter = adapter(64 * 1024);
        let client = client(&adapter, 1);
        client.put(b"big", &vec![7u8; 8192]).unwrap();

        let err = client.get(b"big").unwrap_err();
        assert!(err.to_string().contains("InvalidSize"));
        assert_eq!(
            adapter.dispatcher.cache().ref_count(&Key::from("big")),
            Some(0)
        );
    }

    #[test]
    fn test_get_without_location_is_rejected() {
        let adapter = adapter(4096);
        let client = client(&adapter, 1);
        client.put(b"k", b"v").unwrap();

        let response = client.call(OpKind::Get, b"k").unwrap();
        assert_eq!(response.status, Status::InvalidSize);
    }

    #[test]
    fn test_disconnect_releases_leases() {
        let adapter = adapter(4096);
        let cache = Arc::clone(adapter.dispatcher.cache());
        cache.put(Key::from("k"), b"v").unwrap();

        let conn = adapter.connect(9);
        adapter
            .dispatcher
            .begin_get(conn.context(), 1, &Key::from("k"))
            .unwrap();
        assert_eq!(cache.ref_count(&Key::from("k")), Some(1));

        drop(conn);
        adapter.shutdown();
        assert_eq!(cache.ref_count(&Key::from("k")), Some(0));
    }

    #[test]
    fn test_timed_out_get_keeps_window_until_completion() {
        let adapter = adapter(64 * 1024);
        let client = RdmaCacheClient::connect(
            &adapter,
            RdmaClientConfig {
                client_id: 3,
                receive_buffer_size: 64 * 1024,
                max_value_size: 4096,
                request_timeout: Duration::from_millis(200),
            },
        )
        .unwrap();
        client.put(b"k", b"payload").unwrap();

        // Holding the receive buffer stalls the worker's write into it
        let stalled = client
            .receive_buffer
            .with_region(Region::new(0, 1), |_| {
                let result = client.get(b"k");
                (result.is_err(), client.receive_buffer_stats().used)
            })
            .unwrap();
        assert_eq!(stalled, (true, 4096));
        assert_eq!(client.abandoned_windows(), 1);

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        loop {
            assert_eq!(client.get(b"k").unwrap(), b"payload");
            if client.abandoned_windows() == 0 {
                break;
            }
            assert!(std::time::Instant::now() < deadline);
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(client.receive_buffer_stats().used, 0);
        assert_eq!(adapter.dispatcher.cache().ref_count(&Key::from("k")), Some(0));
    }

    #[test]
    fn test_call_after_shutdown_fails() {
        let adapter = adapter(4096);
        let client = client(&adapter, 1);
        adapter.shutdown();
        adapter.shutdown();
        assert!(client.put(b"k", b"v").is_err());
    }
}
