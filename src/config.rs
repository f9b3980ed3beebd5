// Lock options: timeouts, lease length and key namespacing

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::Path;
use std::time::Duration;

/// Default time spent polling for a lock before giving up (5 seconds)
pub const DEFAULT_ACQUIRE_TIMEOUT_MS: u64 = 5_000;

/// Default lease applied to an acquired lock (10 seconds)
pub const DEFAULT_LEASE_DURATION_MS: u64 = 10_000;

/// Default sleep between acquisition attempts
pub const DEFAULT_RETRY_INTERVAL_MS: u64 = 1;

/// Namespace prepended to every resource name
pub const DEFAULT_KEY_PREFIX: &str = "lock:";

/// Options shared by every handle created from them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockOptions {
    /// Upper bound on the acquisition loop, in milliseconds.
    pub acquire_timeout_ms: u64,
    /// Expiration written to the key once acquired, in milliseconds.
    pub lease_duration_ms: u64,
    /// Fixed sleep between acquisition attempts, in milliseconds.
    pub retry_interval_ms: u64,
    /// Prefix turning a resource name into a store key.
    pub key_prefix: String,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self {
            acquire_timeout_ms: DEFAULT_ACQUIRE_TIMEOUT_MS,
            lease_duration_ms: DEFAULT_LEASE_DURATION_MS,
            retry_interval_ms: DEFAULT_RETRY_INTERVAL_MS,
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
        }
    }
}

/// Whole milliseconds, rounded up so a non-zero duration never becomes zero.
fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_nanos().div_ceil(1_000_000)).unwrap_or(u64::MAX)
}

impl LockOptions {
    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout_ms = millis(timeout);
        self
    }

    pub fn with_lease_duration(mut self, lease: Duration) -> Self {
        self.lease_duration_ms = millis(lease);
        self
    }

    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval_ms = millis(interval);
        self
    }

    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    pub fn lease_duration(&self) -> Duration {
        Duration::from_millis(self.lease_duration_ms)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }

    /// Store key for a resource name.
    pub fn key_for(&self, resource: &str) -> String {
        format!("{}{}", self.key_prefix, resource)
    }

    /// Reject options the lock protocol cannot work with.
    ///
    /// A zero lease would delete the key the moment it is acquired, and a
    /// zero retry interval turns the acquisition loop into a hot spin.
    pub fn validate(&self) -> Result<()> {
        if self.lease_duration_ms == 0 {
            return Err(Error::InvalidConfig(
                "lease_duration_ms must be greater than zero".into(),
            ));
        }
        if self.retry_interval_ms == 0 {
            return Err(Error::InvalidConfig(
                "retry_interval_ms must be greater than zero".into(),
            ));
        }
        Ok(())
    }

    /// Load options from a JSON file; missing fields keep their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let options: LockOptions = serde_json::from_str(&raw)?;
        options.validate()?;
        Ok(options)
    }

    /// Defaults overlaid with `KVLOCK_*` environment variables.
    pub fn from_env() -> Result<Self> {
        let mut options = Self::default();
        if let Some(ms) = env_millis("KVLOCK_ACQUIRE_TIMEOUT_MS")? {
            options.acquire_timeout_ms = ms;
        }
        if let Some(ms) = env_millis("KVLOCK_LEASE_DURATION_MS")? {
            options.lease_duration_ms = ms;
        }
        if let Some(ms) = env_millis("KVLOCK_RETRY_INTERVAL_MS")? {
            options.retry_interval_ms = ms;
        }
        if let Ok(prefix) = env::var("KVLOCK_KEY_PREFIX") {
            options.key_prefix = prefix;
        }
        options.validate()?;
        Ok(options)
    }
}

fn env_millis(name: &str) -> Result<Option<u64>> {
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| Error::InvalidConfig(format!("{name} must be a whole number of milliseconds, got {raw:?}"))),
        Err(_) => Ok(None),
    }
}
