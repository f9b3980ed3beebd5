#![forbid(unsafe_code)]
#![warn(clippy::all)]

//! Distributed mutual exclusion on top of a key-value store with atomic
//! single-key writes and watch-based optimistic transactions.
//!
//! ```no_run
//! use kvlock::{DistributedLock, LockOptions, MemoryServer};
//! use std::time::Duration;
//!
//! # async fn example() -> kvlock::Result<()> {
//! let server = MemoryServer::new();
//! let options = LockOptions::default().with_lease_duration(Duration::from_secs(30));
//!
//! let lock = DistributedLock::new(server.connect(), "invoices", options)?;
//! lock.lock_with(|_lock| async {
//!     // exclusive section
//! })
//! .await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod lock;
pub mod store;

pub mod test_utils;

pub use config::LockOptions;
pub use error::{Error, Result};
pub use lock::{DistributedLock, Hook, ReleaseOutcome};
pub use store::{ExecOutcome, MemoryConnection, MemoryServer, Store, Ttl, TxOp};
#[cfg(feature = "redis")]
pub use store::RedisStore;
