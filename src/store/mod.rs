// Key-value store contract the lock protocol runs on
//
// Every operation is single-key and atomic. `watch` + `exec` gives an
// optimistic transaction: `exec` aborts if a watched key was written,
// deleted or expired by anyone after it was watched.

pub mod memory;
#[cfg(feature = "redis")]
pub mod redis;

pub use memory::{MemoryConnection, MemoryServer};
#[cfg(feature = "redis")]
pub use self::redis::RedisStore;

use crate::Result;
use async_trait::async_trait;
use std::time::Duration;

/// Remaining lifetime of a key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ttl {
    /// Key does not exist
    Missing,
    /// Key exists without an expiration
    Persistent,
    /// Key expires after the given duration
    Expires(Duration),
}

/// A write queued inside a transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxOp {
    Del(String),
    Expire(String, Duration),
    Set(String, String),
}

/// Result of committing a transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecOutcome {
    Committed,
    /// A watched key changed; nothing was applied
    Aborted,
}

/// A connection to the shared store.
///
/// Watches belong to the connection they were issued on, so two handles
/// that interleave transactions need two connections.
#[async_trait]
pub trait Store: Send + Sync + std::fmt::Debug {
    /// Set `key` only if it does not exist. Returns whether it was set.
    async fn set_nx(&self, key: &str, value: &str) -> Result<bool>;

    /// Unconditional write; clears any expiration on the key.
    async fn set(&self, key: &str, value: &str) -> Result<()>;

    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Set the key's expiration. Returns false if the key does not exist.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool>;

    async fn ttl(&self, key: &str) -> Result<Ttl>;

    /// Returns whether a key was removed.
    async fn del(&self, key: &str) -> Result<bool>;

    /// Increment an integer value, creating it at zero. Keeps the expiration.
    async fn incr(&self, key: &str) -> Result<i64>;

    async fn watch(&self, key: &str) -> Result<()>;

    /// Drop every watch held by this connection.
    async fn unwatch(&self) -> Result<()>;

    /// Apply `ops` atomically unless a watched key changed. Clears watches.
    async fn exec(&self, ops: Vec<TxOp>) -> Result<ExecOutcome>;
}
