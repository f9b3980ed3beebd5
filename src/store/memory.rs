//! In-process store with per-connection watches.
//!
//! [`MemoryServer`] owns the keyspace; every [`MemoryConnection`] handed out
//! by [`MemoryServer::connect`] behaves like a separate client of the same
//! server. Expiration is lazy and measured with [`tokio::time::Instant`], so a
//! paused tokio clock drives lease expiry in tests.

use super::{ExecOutcome, Store, Ttl, TxOp};
use crate::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

/// Keys plus a version per key. A version moves on every write, delete or
/// expiry of that key and is kept after the key is gone, so a watch can
/// tell "deleted and recreated" apart from "untouched".
#[derive(Debug, Default)]
struct Keyspace {
    entries: HashMap<String, Entry>,
    versions: HashMap<String, u64>,
    clock: u64,
}

impl Keyspace {
    fn touch(&mut self, key: &str) {
        self.clock += 1;
        self.versions.insert(key.to_string(), self.clock);
    }

    /// Drop the key if its lease ran out.
    fn purge_expired(&mut self, key: &str, now: Instant) {
        let expired = matches!(
            self.entries.get(key),
            Some(Entry { expires_at: Some(at), .. }) if *at <= now
        );
        if expired {
            self.entries.remove(key);
            self.touch(key);
        }
    }

    fn live(&mut self, key: &str) -> Option<&mut Entry> {
        self.purge_expired(key, Instant::now());
        self.entries.get_mut(key)
    }

    fn version(&mut self, key: &str) -> u64 {
        self.purge_expired(key, Instant::now());
        self.versions.get(key).copied().unwrap_or(0)
    }

    fn set(&mut self, key: &str, value: &str) {
        self.entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: None,
            },
        );
        self.touch(key);
    }

    fn expire(&mut self, key: &str, ttl: Duration) -> Result<bool> {
        let deadline = deadline(ttl)?;
        let Some(entry) = self.live(key) else {
            return Ok(false);
        };
        if ttl.is_zero() {
            self.entries.remove(key);
        } else {
            entry.expires_at = Some(deadline);
        }
        self.touch(key);
        Ok(true)
    }

    fn del(&mut self, key: &str) -> bool {
        if self.live(key).is_none() {
            return false;
        }
        self.entries.remove(key);
        self.touch(key);
        true
    }

    fn apply(&mut self, op: &TxOp) {
        match op {
            TxOp::Del(key) => {
                self.del(key);
            }
            TxOp::Expire(key, ttl) => {
                // deadlines are checked before any op is applied
                let _ = self.expire(key, *ttl);
            }
            TxOp::Set(key, value) => self.set(key, value),
        }
    }
}

fn deadline(ttl: Duration) -> Result<Instant> {
    Instant::now()
        .checked_add(ttl)
        .ok_or_else(|| Error::Store(format!("expiration of {ttl:?} is out of range")))
}

/// Shared in-memory keyspace.
#[derive(Debug, Clone, Default)]
pub struct MemoryServer {
    keyspace: Arc<Mutex<Keyspace>>,
}

impl MemoryServer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a new client connection with its own watch set.
    pub fn connect(&self) -> Arc<MemoryConnection> {
        Arc::new(MemoryConnection {
            keyspace: self.keyspace.clone(),
            watched: Mutex::new(Vec::new()),
        })
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.keyspace
            .lock()
            .entries
            .values()
            .filter(|entry| entry.expires_at.map_or(true, |at| at > now))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One client of a [`MemoryServer`].
#[derive(Debug)]
pub struct MemoryConnection {
    keyspace: Arc<Mutex<Keyspace>>,
    /// (key, version at watch time)
    watched: Mutex<Vec<(String, u64)>>,
}

#[async_trait]
impl Store for MemoryConnection {
    async fn set_nx(&self, key: &str, value: &str) -> Result<bool> {
        let mut keyspace = self.keyspace.lock();
        if keyspace.live(key).is_some() {
            return Ok(false);
        }
        keyspace.set(key, value);
        Ok(true)
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.keyspace.lock().set(key, value);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.keyspace.lock().live(key).map(|entry| entry.value.clone()))
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        self.keyspace.lock().expire(key, ttl)
    }

    async fn ttl(&self, key: &str) -> Result<Ttl> {
        let mut keyspace = self.keyspace.lock();
        let now = Instant::now();
        Ok(match keyspace.live(key) {
            None => Ttl::Missing,
            Some(Entry { expires_at: None, .. }) => Ttl::Persistent,
            Some(Entry {
                expires_at: Some(at),
                ..
            }) => Ttl::Expires(at.saturating_duration_since(now)),
        })
    }

    async fn del(&self, key: &str) -> Result<bool> {
        Ok(self.keyspace.lock().del(key))
    }

    async fn incr(&self, key: &str) -> Result<i64> {
        let mut keyspace = self.keyspace.lock();
        let (current, expires_at) = match keyspace.live(key) {
            Some(entry) => {
                let current: i64 = entry
                    .value
                    .parse()
                    .map_err(|_| Error::Store(format!("value at {key:?} is not an integer")))?;
                (current, entry.expires_at)
            }
            None => (0, None),
        };
        let next = current + 1;
        keyspace.entries.insert(
            key.to_string(),
            Entry {
                value: next.to_string(),
                expires_at,
            },
        );
        keyspace.touch(key);
        Ok(next)
    }

    async fn watch(&self, key: &str) -> Result<()> {
        let version = self.keyspace.lock().version(key);
        self.watched.lock().push((key.to_string(), version));
        Ok(())
    }

    async fn unwatch(&self) -> Result<()> {
        self.watched.lock().clear();
        Ok(())
    }

    async fn exec(&self, ops: Vec<TxOp>) -> Result<ExecOutcome> {
        let watched = std::mem::take(&mut *self.watched.lock());
        for op in &ops {
            if let TxOp::Expire(_, ttl) = op {
                deadline(*ttl)?;
            }
        }
        let mut keyspace = self.keyspace.lock();

        let changed = watched
            .iter()
            .any(|(key, version)| keyspace.version(key) != *version);
        if changed {
            return Ok(ExecOutcome::Aborted);
        }

        for op in &ops {
            keyspace.apply(op);
        }
        Ok(ExecOutcome::Committed)
    }
}
