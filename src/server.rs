//! Cache server: wires the cache manager, the dispatcher and both transport
//! adapters together, and runs the TCP accept loop.
//!
//! TCP connections speak length-prefixed frames (see [`crate::protocol`]).
//! Each connection gets a reader task that dispatches requests and a writer
//! task that sends responses back, so a slow client socket never holds a
//! cache lock.

use crate::cache::{CacheConfig, CacheManager, ObjectHandle};
use crate::dispatcher::{Dispatcher, TransportAdapter, TransportContext, TransportKind};
use crate::error::{CacheError, CacheResult};
use crate::protocol::{encode_frame, read_frame, Request, Response};
use crate::rdma::{RdmaAdapter, RdmaConfig};
use crate::transport::{RdmaTransport, TransportConfig};
use anyhow::{Context, Result};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

/// Server configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Server node ID
    pub node_id: u32,
    /// TCP listen address
    pub listen_addr: String,
    /// Cache manager and arena settings
    pub cache: CacheConfig,
    /// Fabric settings
    pub transport: TransportConfig,
    /// RDMA adapter settings; `None` disables the adapter
    pub rdma: Option<RdmaConfig>,
    /// Close TCP connections idle for this many seconds (0 = never)
    pub idle_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            node_id: 0,
            listen_addr: "127.0.0.1:12345".to_string(),
            cache: CacheConfig::default(),
            transport: TransportConfig::default(),
            rdma: None,
            idle_timeout_secs: 0,
        }
    }
}

impl ServerConfig {
    /// Load a JSON config file; missing fields take their defaults
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        serde_json::from_str(&text).with_context(|| format!("parsing config {}", path.display()))
    }
}

/// Copies get values into the response frame
struct TcpDelivery;

impl TransportAdapter for TcpDelivery {
    fn kind(&self) -> TransportKind {
        TransportKind::Tcp
    }

    fn deliver(
        &self,
        cache: &CacheManager,
        handle: &ObjectHandle,
        _request: &Request,
    ) -> CacheResult<Option<Bytes>> {
        cache.read(handle).map(Some)
    }
}

/// Object cache server
pub struct CacheServer {
    config: ServerConfig,
    dispatcher: Arc<Dispatcher>,
    rdma: Option<RdmaAdapter>,
}

impl CacheServer {
    /// Create a new cache server
    pub fn new(config: ServerConfig) -> Result<Self> {
        let cache = CacheManager::new(config.cache.clone())?;
        let dispatcher = Arc::new(Dispatcher::new(Arc::new(cache)));

        let rdma = match &config.rdma {
            Some(rdma_config) => {
                let mut transport_config = config.transport.clone();
                transport_config.node_id = config.node_id;
                let transport = RdmaTransport::loopback(transport_config);
                Some(RdmaAdapter::start(
                    Arc::clone(&dispatcher),
                    transport,
                    rdma_config.clone(),
                )?)
            }
            None => None,
        };

        Ok(Self {
            config,
            dispatcher,
            rdma,
        })
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn cache(&self) -> &Arc<CacheManager> {
        self.dispatcher.cache()
    }

    /// The RDMA adapter, if enabled
    pub fn rdma(&self) -> Option<&RdmaAdapter> {
        self.rdma.as_ref()
    }

    /// Accept TCP connections until `shutdown` resolves
    pub async fn serve_with_shutdown<F>(self: Arc<Self>, listener: TcpListener, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(conn) => conn,
                        Err(e) => {
                            tracing::warn!("Accept failed: {}", e);
                            continue;
                        }
                    };
                    let server = Arc::clone(&self);
                    tokio::spawn(async move {
                        if let Err(e) = server.handle_connection(stream).await {
                            tracing::warn!("Connection from {} ended with error: {}", peer, e);
                        }
                    });
                }
                _ = &mut shutdown => {
                    tracing::info!("Shutting down TCP listener");
                    break;
                }
            }
        }

        if let Some(rdma) = &self.rdma {
            rdma.shutdown();
        }
        Ok(())
    }

    /// Accept TCP connections forever
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        self.serve_with_shutdown(listener, std::future::pending()).await
    }

    async fn handle_connection(&self, stream: TcpStream) -> Result<()> {
        stream.set_nodelay(true)?;
        let ctx = self.dispatcher.open_connection(TransportKind::Tcp);
        let (mut reader, mut writer) = stream.into_split();
        let (tx, mut rx) = mpsc::channel::<Response>(256);

        let writer_task = tokio::spawn(async move {
            while let Some(response) = rx.recv().await {
                let frame = response_frame(&response)?;
                writer.write_all(&frame).await?;
                writer.flush().await?;
            }
            Ok::<_, anyhow::Error>(())
        });

        let result = self.read_loop(&ctx, &mut reader, tx).await;

        // Always give back whatever this connection still holds
        self.dispatcher.disconnect(&ctx);

        let written = writer_task.await?;
        result.and(written)
    }

    async fn read_loop(
        &self,
        ctx: &TransportContext,
        reader: &mut tokio::net::tcp::OwnedReadHalf,
        tx: mpsc::Sender<Response>,
    ) -> Result<()> {
        let idle = match self.config.idle_timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        };

        loop {
            let frame = match idle {
                Some(limit) => match tokio::time::timeout(limit, read_frame::<_, Request>(reader)).await {
                    Ok(frame) => frame?,
                    Err(_) => {
                        tracing::info!("Closing idle connection conn={}", ctx.connection.0);
                        return Ok(());
                    }
                },
                None => read_frame::<_, Request>(reader).await?,
            };

            let Some(request) = frame else {
                return Ok(());
            };

            let response = self.dispatcher.dispatch(&TcpDelivery, ctx, request);
            if tx.send(response).await.is_err() {
                // Writer is gone; the socket is dead
                return Ok(());
            }
        }
    }
}

/// Encode a response for the wire. A response that cannot be framed is
/// answered with an `InternalError` under the same request ID instead.
fn response_frame(response: &Response) -> Result<Vec<u8>> {
    match encode_frame(response) {
        Ok(frame) => Ok(frame),
        Err(e) => {
            tracing::error!(
                "Failed to encode response to request {}: {}",
                response.request_id,
                e
            );
            let fallback = Response::error(
                response.request_id,
                &CacheError::internal(format!("response could not be encoded: {}", e)),
            );
            encode_frame(&fallback)
        }
    }
}

/// Bind, serve until Ctrl-C
pub async fn run_server(config: ServerConfig) -> Result<()> {
    let listener = TcpListener::bind(&config.listen_addr)
        .await
        .with_context(|| format!("binding {}", config.listen_addr))?;
    let server = Arc::new(CacheServer::new(config)?);

    tracing::info!(
        "Starting cache manager on {} (rdma adapter: {})",
        listener.local_addr()?,
        if server.rdma().is_some() { "loopback" } else { "disabled" }
    );

    server
        .serve_with_shutdown(listener, async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Key, Status, MAX_FRAME_LEN};

    #[test]
    fn test_server_creation() {
        let config = ServerConfig {
            cache: CacheConfig::with_capacity(1024 * 1024, 4096),
            ..Default::default()
        };
        let server = CacheServer::new(config).unwrap();
        assert!(server.cache().is_empty());
        assert!(server.rdma().is_none());
    }

    #[test]
    fn test_server_with_rdma() {
        let config = ServerConfig {
            cache: CacheConfig::with_capacity(1024 * 1024, 4096),
            rdma: Some(RdmaConfig {
                worker_threads: 1,
                queue_depth: 8,
            }),
            ..Default::default()
        };
        let server = CacheServer::new(config).unwrap();
        let rdma = server.rdma().unwrap();
        assert_eq!(rdma.arena_descriptor().len, 1024 * 1024);
    }

    #[test]
    fn test_put_and_lookup() {
        let config = ServerConfig {
            cache: CacheConfig::with_capacity(1024 * 1024, 4096),
            ..Default::default()
        };
        let server = CacheServer::new(config).unwrap();
        let ctx = server.dispatcher().open_connection(TransportKind::Tcp);

        let resp = server
            .dispatcher()
            .dispatch(&TcpDelivery, &ctx, Request::put(1, Key::from("key1"), "value1"));
        assert!(resp.status.is_ok());
        assert!(server.cache().contains(&Key::from("key1")));

        let resp = server
            .dispatcher()
            .dispatch(&TcpDelivery, &ctx, Request::get(2, Key::from("key1")));
        assert_eq!(resp.payload.as_deref(), Some(&b"value1"[..]));
    }

    #[test]
    fn test_unencodable_response_becomes_internal_error() {
        let oversized = Response::with_payload(9, Bytes::from(vec![0u8; MAX_FRAME_LEN]));
        let frame = response_frame(&oversized).unwrap();
        assert!(frame.len() < 1024);

        let decoded: Response = bincode::deserialize(&frame[4..]).unwrap();
        assert_eq!(decoded.request_id, 9);
        assert_eq!(decoded.status, Status::InternalError);
        assert!(decoded.payload.is_none());

        let small = Response::with_length(10, 3);
        assert_eq!(response_frame(&small).unwrap(), encode_frame(&small).unwrap());
    }

    #[test]
    fn test_config_from_json_uses_defaults() {
        let json = r#"{ "listen_addr": "127.0.0.1:0", "cache": { "max_object_size": 128 } }"#;
        let config: ServerConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.listen_addr, "127.0.0.1:0");
        assert_eq!(config.cache.max_object_size, 128);
        assert_eq!(config.cache.arena.capacity, 1024 * 1024 * 1024);
        assert!(config.rdma.is_none());
    }
}
