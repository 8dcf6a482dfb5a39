//! TCP cache client
//!
//! Requests are pipelined over a single connection: every call registers a
//! completion under its request ID and a background task routes responses
//! back as they arrive, in whatever order the server finishes them.

use crate::cache::CacheStats;
use crate::protocol::{read_frame, write_frame, Key, OpKind, Request, Response, Status};
use anyhow::{anyhow, Context, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// Client configuration
#[derive(Clone, Debug)]
pub struct TcpClientConfig {
    /// Server address
    pub server_addr: String,
    /// How long a single call may wait for its response
    pub request_timeout: Duration,
}

impl Default for TcpClientConfig {
    fn default() -> Self {
        Self {
            server_addr: "127.0.0.1:12345".to_string(),
            request_timeout: Duration::from_secs(30),
        }
    }
}

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<Response>>>>;

/// Pipelined TCP cache client
pub struct TcpCacheClient {
    config: TcpClientConfig,
    writer: tokio::sync::Mutex<OwnedWriteHalf>,
    /// Completions for in-flight requests
    pending: PendingMap,
    closed: Arc<AtomicBool>,
    request_counter: AtomicU64,
    reader_task: JoinHandle<()>,
}

impl TcpCacheClient {
    /// Connect to the server
    pub async fn connect(config: TcpClientConfig) -> Result<Self> {
        tracing::info!("Connecting to cache manager at {}", config.server_addr);

        let stream = TcpStream::connect(&config.server_addr)
            .await
            .with_context(|| format!("connecting to {}", config.server_addr))?;
        stream.set_nodelay(true)?;
        let (reader, writer) = stream.into_split();

        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let closed = Arc::new(AtomicBool::new(false));
        let reader_task = tokio::spawn(route_responses(
            reader,
            Arc::clone(&pending),
            Arc::clone(&closed),
        ));

        Ok(Self {
            config,
            writer: tokio::sync::Mutex::new(writer),
            pending,
            closed,
            request_counter: AtomicU64::new(0),
            reader_task,
        })
    }

    /// Shorthand for [`TcpCacheClient::connect`] with default settings
    pub async fn connect_to(server_addr: impl Into<String>) -> Result<Self> {
        Self::connect(TcpClientConfig {
            server_addr: server_addr.into(),
            ..Default::default()
        })
        .await
    }

    fn next_request_id(&self) -> u64 {
        self.request_counter.fetch_add(1, Ordering::Relaxed)
    }

    /// Send a request and wait for its response, whatever the status
    pub async fn call(&self, request: Request) -> Result<Response> {
        let request_id = request.request_id;
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(request_id, tx);

        if self.closed.load(Ordering::SeqCst) {
            self.pending.lock().remove(&request_id);
            return Err(anyhow!("connection closed"));
        }

        let sent = {
            let mut writer = self.writer.lock().await;
            write_frame(&mut *writer, &request).await
        };
        if let Err(e) = sent {
            self.pending.lock().remove(&request_id);
            return Err(e);
        }

        match tokio::time::timeout(self.config.request_timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(anyhow!("connection closed before response to request {}", request_id)),
            Err(_) => {
                self.pending.lock().remove(&request_id);
                Err(anyhow!("request {} timed out", request_id))
            }
        }
    }

    async fn call_op(&self, op: OpKind, key: &[u8]) -> Result<Response> {
        self.call(Request::new(self.next_request_id(), op, Key::new(key)))
            .await
    }

    /// Get a value
    pub async fn get(&self, key: &[u8]) -> Result<Vec<u8>> {
        let response = self.call_op(OpKind::Get, key).await?;
        match response.status {
            Status::Ok => Ok(response.payload.map(|p| p.to_vec()).unwrap_or_default()),
            other => Err(anyhow!("GET failed ({:?}): {}", other, response.error_message)),
        }
    }

    /// Put a value
    pub async fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        let request = Request::put(self.next_request_id(), Key::new(key), value.to_vec());
        let response = self.call(request).await?;
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
    pub async fn delete(&self, key: &[u8]) -> Result<bool> {
        let response = self.call_op(OpKind::Delete, key).await?;
        match response.status {
            Status::Ok => Ok(true),
            Status::NotFound => Ok(false),
            other => Err(anyhow!("DELETE failed ({:?}): {}", other, response.error_message)),
        }
    }

    pub async fn exists(&self, key: &[u8]) -> Result<bool> {
        let response = self.call_op(OpKind::Exists, key).await?;
        match response.status {
            Status::Ok => Ok(true),
            Status::NotFound => Ok(false),
            other => Err(anyhow!("EXISTS failed ({:?}): {}", other, response.error_message)),
        }
    }

    /// Size of the stored value, or `None` if absent
    pub async fn size(&self, key: &[u8]) -> Result<Option<u64>> {
        let response = self.call_op(OpKind::Size, key).await?;
        match response.status {
            Status::Ok => Ok(Some(response.length)),
            Status::NotFound => Ok(None),
            other => Err(anyhow!("SIZE failed ({:?}): {}", other, response.error_message)),
        }
    }

    /// Fetch server-side cache statistics
    pub async fn stats(&self) -> Result<CacheStats> {
        let response = self.call_op(OpKind::Stats, &[]).await?;
        if response.status != Status::Ok {
            return Err(anyhow!("STATS failed: {}", response.error_message));
        }
        let payload = response
            .payload
            .ok_or_else(|| anyhow!("STATS response without payload"))?;
        Ok(serde_json::from_slice(&payload)?)
    }

    /// Round-trip a no-op request
    pub async fn ping(&self) -> Result<bool> {
        let response = self.call_op(OpKind::Ping, &[]).await?;
        Ok(response.status.is_ok())
    }

    /// Check if connected
    pub fn is_connected(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
    }

    pub fn server_addr(&self) -> &str {
        &self.config.server_addr
    }
}

impl Drop for TcpCacheClient {
    fn drop(&mut self) {
        self.reader_task.abort();
    }
}

async fn route_responses(mut reader: OwnedReadHalf, pending: PendingMap, closed: Arc<AtomicBool>) {
    loop {
        match read_frame::<_, Response>(&mut reader).await {
            Ok(Some(response)) => {
                let waiter = pending.lock().remove(&response.request_id);
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(response);
                    }
                    None => tracing::warn!(
                        "Dropping response for unknown request {}",
                        response.request_id
                    ),
                }
            }
            Ok(None) => {
                tracing::debug!("Server closed the connection");
                break;
            }
            Err(e) => {
                tracing::warn!("Connection read failed: {}", e);
                break;
            }
        }
    }

    closed.store(true, Ordering::SeqCst);
    // Wake every caller still waiting
    pending.lock().clear();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Status;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_client_connect_failure() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        assert!(TcpCacheClient::connect_to(addr.to_string()).await.is_err());
    }

    #[tokio::test]
    async fn test_responses_routed_by_request_id() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        // Answers two requests in reverse order
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let first: Request = read_frame(&mut stream).await.unwrap().unwrap();
            let second: Request = read_frame(&mut stream).await.unwrap().unwrap();
            for req in [second, first] {
                let mut resp = Response::ok(req.request_id);
                resp.length = req.request_id + 100;
                write_frame(&mut stream, &resp).await.unwrap();
            }
        });

        let client = TcpCacheClient::connect_to(addr.to_string()).await.unwrap();
        let (a, b) = tokio::join!(
            client.call(Request::new(7, OpKind::Size, Key::from("a"))),
            client.call(Request::new(8, OpKind::Size, Key::from("b"))),
        );
        let (a, b) = (a.unwrap(), b.unwrap());
        assert_eq!(a.status, Status::Ok);
        assert_eq!(a.length, 107);
        assert_eq!(b.length, 108);
    }

    #[tokio::test]
    async fn test_server_close_fails_pending_calls() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let _req: Option<Request> = read_frame(&mut stream).await.unwrap();
            // Close without answering
        });

        let client = TcpCacheClient::connect_to(addr.to_string()).await.unwrap();
        assert!(client.ping().await.is_err());
        assert!(!client.is_connected());
    }
}
