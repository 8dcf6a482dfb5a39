//! Typed errors surfaced by the cache manager and the arena.
//!
//! Every variant maps onto exactly one wire [`Status`], so adapters never
//! have to invent their own error vocabulary.

use crate::protocol::Status;
use thiserror::Error;

/// Errors returned by cache and backend operations
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CacheError {
    /// Key (or lease) is not present
    #[error("key not found")]
    NotFound,

    /// Payload is empty, larger than the configured object limit, or the key is too long
    #[error("invalid size: {0}")]
    InvalidSize(String),

    /// The arena could not satisfy the allocation even after eviction
    #[error("out of space: need {needed} bytes")]
    OutOfSpace { needed: usize },

    /// A put raced with an outstanding pending delete on the same key
    #[error("conflict: key has a pending delete")]
    Conflict,

    /// Invariant violation or corrupted handle; fails only the current request
    #[error("internal error: {0}")]
    Internal(String),
}

impl CacheError {
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Wire status for this error
    pub fn status(&self) -> Status {
        match self {
            Self::NotFound => Status::NotFound,
            Self::InvalidSize(_) => Status::InvalidSize,
            Self::OutOfSpace { .. } => Status::OutOfSpace,
            Self::Conflict => Status::Conflict,
            Self::Internal(_) => Status::InternalError,
        }
    }
}

pub type CacheResult<T> = std::result::Result<T, CacheError>;
