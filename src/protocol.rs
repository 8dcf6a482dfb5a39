//! Protocol types for the object cache
//!
//! These are the transport-independent request/response records every
//! adapter translates into, the RDMA memory-region descriptors exchanged at
//! registration time, and the length-prefixed frame codec used over TCP.

use anyhow::{anyhow, Result};
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::fmt;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Longest key accepted by the cache
pub const MAX_KEY_LEN: usize = 256;

/// Frame bytes reserved for request/response fields around the value
pub const FRAME_HEADROOM: usize = 64 * 1024;

/// Largest value a single frame can carry
pub const MAX_VALUE_LEN: usize = 64 * 1024 * 1024;

/// Largest frame body accepted on a TCP connection
pub const MAX_FRAME_LEN: usize = MAX_VALUE_LEN + FRAME_HEADROOM;

/// Opaque object identifier. Equality is exact-byte comparison.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Key(SmallVec<[u8; 32]>);

impl Key {
    pub fn new(bytes: &[u8]) -> Self {
        Self(SmallVec::from_slice(bytes))
    }

    /// Encode a 64-bit object id as 8 big-endian bytes
    pub fn from_object_id(oid: u64) -> Self {
        Self::new(&oid.to_be_bytes())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<&str> for Key {
    fn from(s: &str) -> Self {
        Self::new(s.as_bytes())
    }
}

impl From<&[u8]> for Key {
    fn from(b: &[u8]) -> Self {
        Self::new(b)
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for &b in self.0.iter() {
            if b.is_ascii_graphic() {
                write!(f, "{}", b as char)?;
            } else {
                write!(f, "\\x{:02x}", b)?;
            }
        }
        Ok(())
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Key(\"{}\")", self)
    }
}

/// Operation carried by a request
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpKind {
    Get,
    Put,
    Delete,
    /// Existence check without taking a lease
    Exists,
    /// Stored size of an object
    Size,
    /// Cache statistics as a JSON payload
    Stats,
    /// Liveness probe
    Ping,
}

/// Outcome of a request as seen by the client
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Status {
    Ok,
    NotFound,
    OutOfSpace,
    InvalidSize,
    Conflict,
    InternalError,
}

impl Status {
    pub fn is_ok(&self) -> bool {
        matches!(self, Status::Ok)
    }
}

/// Transport-independent request record
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Request {
    /// Correlation token chosen by the client
    pub request_id: u64,
    pub op: OpKind,
    pub key: Key,
    /// Value for puts
    pub payload: Option<Bytes>,
    /// Where an RDMA adapter should write the value of a get
    pub response_location: Option<ValueLocation>,
}

impl Request {
    pub fn new(request_id: u64, op: OpKind, key: Key) -> Self {
        Self {
            request_id,
            op,
            key,
            payload: None,
            response_location: None,
        }
    }

    pub fn get(request_id: u64, key: Key) -> Self {
        Self::new(request_id, OpKind::Get, key)
    }

    pub fn put(request_id: u64, key: Key, value: impl Into<Bytes>) -> Self {
        Self {
            payload: Some(value.into()),
            ..Self::new(request_id, OpKind::Put, key)
        }
    }

    pub fn delete(request_id: u64, key: Key) -> Self {
        Self::new(request_id, OpKind::Delete, key)
    }

    pub fn with_response_location(mut self, location: ValueLocation) -> Self {
        self.response_location = Some(location);
        self
    }
}

/// Transport-independent response record
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Response {
    pub request_id: u64,
    pub status: Status,
    /// Value bytes for copying transports
    pub payload: Option<Bytes>,
    /// Length of the value (also set when the value travelled out of band)
    pub length: u64,
    pub error_message: String,
}

impl Response {
    pub fn ok(request_id: u64) -> Self {
        Self {
            request_id,
            status: Status::Ok,
            payload: None,
            length: 0,
            error_message: String::new(),
        }
    }

    pub fn with_payload(request_id: u64, payload: Bytes) -> Self {
        Self {
            length: payload.len() as u64,
            payload: Some(payload),
            ..Self::ok(request_id)
        }
    }

    pub fn with_length(request_id: u64, length: u64) -> Self {
        Self {
            length,
            ..Self::ok(request_id)
        }
    }

    pub fn error(request_id: u64, err: &crate::error::CacheError) -> Self {
        Self {
            request_id,
            status: err.status(),
            payload: None,
            length: 0,
            error_message: err.to_string(),
        }
    }
}

/// Network address of an RDMA domain (NIC)
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct DomainAddress(pub Vec<u8>);

impl DomainAddress {
    pub fn new(addr: Vec<u8>) -> Self {
        Self(addr)
    }
}

/// Remote key for RDMA memory access
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct MemoryRegionRemoteKey(pub u64);

/// Descriptor for a memory region that can be accessed remotely via RDMA
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct MemoryRegionDescriptor {
    /// Base address of the registered region
    pub ptr: u64,
    /// Length of the registered region
    pub len: u64,
    /// Per-domain address and remote key pairs
    pub addr_rkey_list: SmallVec<[(DomainAddress, MemoryRegionRemoteKey); 4]>,
}

impl MemoryRegionDescriptor {
    pub fn new(
        ptr: u64,
        len: u64,
        addr_rkey_list: Vec<(DomainAddress, MemoryRegionRemoteKey)>,
    ) -> Self {
        Self {
            ptr,
            len,
            addr_rkey_list: SmallVec::from_vec(addr_rkey_list),
        }
    }

    pub fn first_rkey(&self) -> Option<MemoryRegionRemoteKey> {
        self.addr_rkey_list.first().map(|(_, rkey)| *rkey)
    }
}

/// Location inside a remote registered region
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ValueLocation {
    /// Node ID that owns this memory
    pub node_id: u32,
    /// RDMA memory region descriptor
    pub mr_descriptor: MemoryRegionDescriptor,
    /// Offset within the memory region
    pub offset: u64,
    /// Bytes available at `offset`
    pub length: u64,
}

impl ValueLocation {
    pub fn new(
        node_id: u32,
        mr_descriptor: MemoryRegionDescriptor,
        offset: u64,
        length: u64,
    ) -> Self {
        Self {
            node_id,
            mr_descriptor,
            offset,
            length,
        }
    }
}

/// Serialize a message into a length-prefixed frame
pub fn encode_frame<T: Serialize>(msg: &T) -> Result<Vec<u8>> {
    let body = bincode::serialize(msg)?;
    if body.len() > MAX_FRAME_LEN {
        return Err(anyhow!(
            "frame of {} bytes exceeds limit of {}",
            body.len(),
            MAX_FRAME_LEN
        ));
    }
    let mut frame = Vec::with_capacity(4 + body.len());
    frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Write one length-prefixed frame
pub async fn write_frame<W, T>(writer: &mut W, msg: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let frame = encode_frame(msg)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one length-prefixed frame.
///
/// Returns `Ok(None)` when the peer closed the connection cleanly before a
/// new frame started.
pub async fn read_frame<R, T>(reader: &mut R) -> Result<Option<T>>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Err(anyhow!(
            "incoming frame of {} bytes exceeds limit of {}",
            len,
            MAX_FRAME_LEN
        ));
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(Some(bincode::deserialize(&body)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_display_escapes_binary() {
        let key = Key::new(b"ab\x00");
        assert_eq!(key.to_string(), "ab\\x00");
        assert_eq!(Key::from_object_id(1).len(), 8);
    }

    #[test]
    fn test_key_equality_is_exact_bytes() {
        assert_eq!(Key::from("a"), Key::new(b"a"));
        assert_ne!(Key::from("a"), Key::new(b"a\0"));
    }

    #[tokio::test]
    async fn test_frame_over_duplex() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let request = Request::put(7, Key::from("k"), Bytes::from_static(b"value"));
        write_frame(&mut a, &request).await.unwrap();

        let decoded: Request = read_frame(&mut b).await.unwrap().unwrap();
        assert_eq!(decoded.request_id, 7);
        assert_eq!(decoded.op, OpKind::Put);
        assert_eq!(decoded.key, Key::from("k"));
        assert_eq!(decoded.payload.as_deref(), Some(&b"value"[..]));
    }

    #[tokio::test]
    async fn test_read_frame_clean_eof() {
        let (a, mut b) = tokio::io::duplex(64);
        drop(a);
        let decoded: Option<Request> = read_frame(&mut b).await.unwrap();
        assert!(decoded.is_none());
    }

    #[tokio::test]
    async fn test_read_frame_rejects_oversized() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(&(u32::MAX).to_be_bytes()).await.unwrap();
        let result: Result<Option<Request>> = read_frame(&mut b).await;
        assert!(result.is_err());
    }
}
