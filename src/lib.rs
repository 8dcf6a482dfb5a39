//! Single-node object cache with pluggable TCP and RDMA transports.
//!
//! Objects live in one contiguous [`memory::Arena`]. The [`cache::CacheManager`]
//! owns the key index, leases and eviction; the [`dispatcher::Dispatcher`]
//! turns transport requests into cache operations and makes sure every lease
//! taken for a transfer is given back.

pub mod cache;
pub mod client;
pub mod dispatcher;
pub mod error;
pub mod memory;
pub mod protocol;
pub mod rdma;
pub mod recency;
pub mod server;
pub mod transport;

pub use cache::{CacheConfig, CacheManager, CacheStats, ObjectHandle};
pub use client::{TcpCacheClient, TcpClientConfig};
pub use dispatcher::{Dispatcher, TransportAdapter, TransportKind};
pub use error::{CacheError, CacheResult};
pub use protocol::{Key, MemoryRegionDescriptor, OpKind, Request, Response, Status, ValueLocation};
pub use rdma::{RdmaAdapter, RdmaCacheClient, RdmaClientConfig};
pub use server::{run_server, CacheServer, ServerConfig};
pub use transport::{RdmaTransport, TransportConfig};
