//! Request dispatcher
//!
//! Routes abstract requests from any transport adapter into cache manager
//! calls and packages the result into a response for the same connection.
//! The only state kept here is the set of gets whose transfer is still in
//! flight, so a dropped connection can give its leases back.

use crate::cache::{CacheManager, LeaseId, ObjectHandle};
use crate::error::{CacheError, CacheResult};
use crate::protocol::{Key, OpKind, Request, Response};
use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Which transport a request arrived on
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransportKind {
    Tcp,
    Rdma,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Tcp => write!(f, "tcp"),
            TransportKind::Rdma => write!(f, "rdma"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub u64);

/// Originating transport context of a request
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TransportContext {
    pub kind: TransportKind,
    pub connection: ConnectionId,
}

/// The capability every transport provides to the dispatcher: moving a
/// leased value to the client that asked for it.
pub trait TransportAdapter: Send + Sync {
    fn kind(&self) -> TransportKind;

    /// Transfer the value behind `handle` for `request`.
    ///
    /// Returns the bytes to attach to the response when the transport carries
    /// values inline, or `None` when the value was placed out of band.
    fn deliver(
        &self,
        cache: &CacheManager,
        handle: &ObjectHandle,
        request: &Request,
    ) -> CacheResult<Option<Bytes>>;
}

struct InFlight {
    key: Key,
    lease: LeaseId,
    started: Instant,
}

/// Routes requests from every transport into one cache manager
pub struct Dispatcher {
    cache: Arc<CacheManager>,
    in_flight: DashMap<(ConnectionId, u64), InFlight>,
    next_connection: AtomicU64,
}

impl Dispatcher {
    pub fn new(cache: Arc<CacheManager>) -> Self {
        Self {
            cache,
            in_flight: DashMap::new(),
            next_connection: AtomicU64::new(1),
        }
    }

    pub fn cache(&self) -> &Arc<CacheManager> {
        &self.cache
    }

    /// Allocate a context for a newly accepted connection
    pub fn open_connection(&self, kind: TransportKind) -> TransportContext {
        let id = self.next_connection.fetch_add(1, Ordering::Relaxed);
        tracing::debug!("Connection opened: {}#{}", kind, id);
        TransportContext {
            kind,
            connection: ConnectionId(id),
        }
    }

    /// Handle one request end to end
    pub fn dispatch(
        &self,
        adapter: &dyn TransportAdapter,
        ctx: &TransportContext,
        request: Request,
    ) -> Response {
        debug_assert_eq!(adapter.kind(), ctx.kind);
        let request_id = request.request_id;

        tracing::debug!(
            "{} request: op={:?} key={} request_id={} conn={}",
            ctx.kind,
            request.op,
            request.key,
            request_id,
            ctx.connection.0
        );

        let result = match request.op {
            OpKind::Get => self.handle_get(adapter, ctx, &request),
            OpKind::Put => match request.payload.as_ref() {
                Some(payload) => self
                    .cache
                    .put(request.key.clone(), payload)
                    .map(|()| Response::ok(request_id)),
                None => Err(CacheError::InvalidSize("put without payload".into())),
            },
            OpKind::Delete => self
                .cache
                .delete(&request.key)
                .map(|()| Response::ok(request_id)),
            OpKind::Exists => {
                if self.cache.contains(&request.key) {
                    Ok(Response::ok(request_id))
                } else {
                    Err(CacheError::NotFound)
                }
            }
            OpKind::Size => self
                .cache
                .object_size(&request.key)
                .map(|size| Response::with_length(request_id, size as u64)),
            OpKind::Stats => serde_json::to_vec(&self.cache.stats())
                .map(|json| Response::with_payload(request_id, Bytes::from(json)))
                .map_err(|e| CacheError::internal(format!("stats encoding: {}", e))),
            OpKind::Ping => Ok(Response::ok(request_id)),
        };

        match result {
            Ok(response) => response,
            Err(err) => {
                match &err {
                    CacheError::Internal(msg) => tracing::error!(
                        "{} {:?} failed: key={} request_id={} error={}",
                        ctx.kind,
                        request.op,
                        request.key,
                        request_id,
                        msg
                    ),
                    CacheError::NotFound => tracing::debug!(
                        "{} {:?} not found: key={} request_id={}",
                        ctx.kind,
                        request.op,
                        request.key,
                        request_id
                    ),
                    other => tracing::warn!(
                        "{} {:?} failed: key={} request_id={} error={}",
                        ctx.kind,
                        request.op,
                        request.key,
                        request_id,
                        other
                    ),
                }
                Response::error(request_id, &err)
            }
        }
    }

    fn handle_get(
        &self,
        adapter: &dyn TransportAdapter,
        ctx: &TransportContext,
        request: &Request,
    ) -> CacheResult<Response> {
        let handle = self.begin_get(ctx, request.request_id, &request.key)?;
        let delivered = adapter.deliver(&self.cache, &handle, request);
        // Release on every path, including a failed transfer
        let finished = self.finish(ctx, request.request_id);

        let payload = delivered?;
        finished?;
        Ok(match payload {
            Some(bytes) => Response::with_payload(request.request_id, bytes),
            None => Response::with_length(request.request_id, handle.size as u64),
        })
    }

    /// Lease `key` and record the transfer as in flight for `ctx`
    pub fn begin_get(
        &self,
        ctx: &TransportContext,
        request_id: u64,
        key: &Key,
    ) -> CacheResult<ObjectHandle> {
        let handle = self.cache.get(key)?;
        match self.in_flight.entry((ctx.connection, request_id)) {
            Entry::Occupied(_) => {
                self.cache.release_lease(&handle.key, handle.lease)?;
                Err(CacheError::internal(format!(
                    "request_id={} already in flight on conn={}",
                    request_id, ctx.connection.0
                )))
            }
            Entry::Vacant(slot) => {
                slot.insert(InFlight {
                    key: handle.key.clone(),
                    lease: handle.lease,
                    started: Instant::now(),
                });
                Ok(handle)
            }
        }
    }

    /// Complete an in-flight transfer and release its lease
    pub fn finish(&self, ctx: &TransportContext, request_id: u64) -> CacheResult<()> {
        let (_, flight) = self
            .in_flight
            .remove(&(ctx.connection, request_id))
            .ok_or(CacheError::NotFound)?;
        tracing::trace!(
            "Transfer done: key={} {} in {:?}",
            flight.key,
            flight.lease,
            flight.started.elapsed()
        );
        self.cache.release_lease(&flight.key, flight.lease)
    }

    /// Release every lease still in flight for a dropped connection.
    /// Returns the number of leases released.
    pub fn disconnect(&self, ctx: &TransportContext) -> usize {
        let pending: Vec<_> = self
            .in_flight
            .iter()
            .filter(|e| e.key().0 == ctx.connection)
            .map(|e| *e.key())
            .collect();

        let mut released = 0;
        for slot in pending {
            if let Some((_, flight)) = self.in_flight.remove(&slot) {
                match self.cache.release_lease(&flight.key, flight.lease) {
                    Ok(()) => released += 1,
                    Err(e) => tracing::error!(
                        "Failed to release {} for key={} on disconnect: {}",
                        flight.lease,
                        flight.key,
                        e
                    ),
                }
            }
        }

        if released > 0 {
            tracing::info!(
                "Connection {}#{} dropped with {} transfers in flight",
                ctx.kind,
                ctx.connection.0,
                released
            );
        } else {
            tracing::debug!("Connection closed: {}#{}", ctx.kind, ctx.connection.0);
        }
        released
    }

    /// Number of transfers currently in flight
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }
}
