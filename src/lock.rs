//! Distributed mutex over a [`Store`].
//!
//! Ownership is plain value equality: the key holds the holder id of the
//! handle that owns it. Acquisition is `SETNX` followed by a separate
//! expiration write; release and extension check ownership and mutate
//! inside a watched transaction so the check cannot go stale in between.
//!
//! A holder that dies between `SETNX` and the expiration write leaves a key
//! with no lease. Acquirers repair that by giving the key an expiration
//! (without claiming it) and keep polling until it is gone.

use crate::config::LockOptions;
use crate::store::{ExecOutcome, Store, Ttl, TxOp};
use crate::{Error, Result};
use futures::future::BoxFuture;
use futures::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::instrument::WithSubscriber;
use tracing::dispatcher::Dispatch;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Callback run under the transaction's watch, right before the write.
pub type Hook<S> = Arc<dyn Fn(Arc<S>) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// What `unlock` did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// The key was ours and has been deleted
    Released,
    /// The key was not ours (expired, reclaimed, or never acquired); nothing was touched
    NotOwner,
}

enum Attempt {
    Committed,
    NotOwner,
    Conflict,
}

pub struct DistributedLock<S: Store + ?Sized> {
    store: Arc<S>,
    key: String,
    holder_id: String,
    options: LockOptions,
    before_release: Option<Hook<S>>,
    before_extend: Option<Hook<S>>,
    logger: Option<Dispatch>,
}

impl<S: Store + ?Sized> std::fmt::Debug for DistributedLock<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DistributedLock")
            .field("key", &self.key)
            .field("holder_id", &self.holder_id)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl<S: Store + ?Sized + 'static> DistributedLock<S> {
    /// Create a handle for `resource` with a fresh holder id. Nothing is
    /// written to the store until [`lock`](Self::lock) or
    /// [`acquire`](Self::acquire) is called.
    pub fn new(store: Arc<S>, resource: &str, options: LockOptions) -> Result<Self> {
        if resource.is_empty() {
            return Err(Error::InvalidConfig("resource name must not be empty".into()));
        }
        options.validate()?;

        Ok(Self {
            store,
            key: options.key_for(resource),
            holder_id: Uuid::new_v4().to_string(),
            options,
            before_release: None,
            before_extend: None,
            logger: None,
        })
    }

    /// Create a handle and lock it.
    pub async fn obtain(store: Arc<S>, resource: &str, options: LockOptions) -> Result<Self> {
        let lock = Self::new(store, resource, options)?;
        lock.lock().await?;
        Ok(lock)
    }

    /// Send this handle's log events to `logger` instead of the default subscriber.
    pub fn with_logger(mut self, logger: impl Into<Dispatch>) -> Self {
        self.logger = Some(logger.into());
        self
    }

    pub fn with_before_release<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(Arc<S>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.set_before_release(hook);
        self
    }

    pub fn with_before_extend<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(Arc<S>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.set_before_extend(hook);
        self
    }

    pub fn set_before_release<F, Fut>(&mut self, hook: F)
    where
        F: Fn(Arc<S>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.before_release = Some(boxed_hook(hook));
    }

    pub fn set_before_extend<F, Fut>(&mut self, hook: F)
    where
        F: Fn(Arc<S>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.before_extend = Some(boxed_hook(hook));
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn holder_id(&self) -> &str {
        &self.holder_id
    }

    pub fn options(&self) -> &LockOptions {
        &self.options
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Acquire the lock or fail with [`Error::LockAcquisition`].
    pub async fn lock(&self) -> Result<()> {
        if self.acquire().await? {
            Ok(())
        } else {
            Err(Error::LockAcquisition {
                key: self.key.clone(),
                timeout: self.options.acquire_timeout(),
            })
        }
    }

    /// Acquire, run `work` while holding the lock, then release.
    ///
    /// The release happens whether `work` returns or panics; a panic is
    /// resumed after the lock is given back.
    pub async fn lock_with<'a, F, Fut, T>(&'a self, work: F) -> Result<T>
    where
        F: FnOnce(&'a Self) -> Fut,
        Fut: Future<Output = T> + 'a,
    {
        self.lock().await?;

        let outcome = AssertUnwindSafe(work(self)).catch_unwind().await;
        let released = self.unlock().await;

        match outcome {
            Ok(value) => {
                released?;
                Ok(value)
            }
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }

    /// Poll until the lock is ours or the acquire timeout passes.
    ///
    /// Returns `Ok(false)` on timeout.
    pub async fn acquire(&self) -> Result<bool> {
        self.logged(self.acquire_loop()).await
    }

    async fn acquire_loop(&self) -> Result<bool> {
        let deadline = Instant::now() + self.options.acquire_timeout();

        while Instant::now() < deadline {
            debug!(key = %self.key, "attempting to acquire lock");

            if self.store.set_nx(&self.key, &self.holder_id).await? {
                info!(key = %self.key, holder = %self.holder_id, "lock acquired");
                self.add_expiration(self.options.lease_duration()).await?;
                return Ok(true);
            }

            if self.has_missing_expiration().await? {
                // holder most likely crashed before setting the lease
                debug!(key = %self.key, "expiration missing on lock");
                self.add_expiration(self.options.lease_duration()).await?;
            }

            tokio::time::sleep(self.options.retry_interval()).await;
        }

        debug!(key = %self.key, timeout = ?self.options.acquire_timeout(), "gave up acquiring lock");
        Ok(false)
    }

    /// Release the lock if this handle still owns it.
    ///
    /// Retries for as long as the key keeps changing under the watch.
    pub async fn unlock(&self) -> Result<ReleaseOutcome> {
        self.logged(self.release_loop()).await
    }

    async fn release_loop(&self) -> Result<ReleaseOutcome> {
        loop {
            debug!(key = %self.key, "releasing lock");
            let op = TxOp::Del(self.key.clone());
            match self.watched_attempt(self.before_release.as_ref(), op).await? {
                Attempt::Committed => {
                    info!(key = %self.key, holder = %self.holder_id, "lock released");
                    return Ok(ReleaseOutcome::Released);
                }
                Attempt::NotOwner => {
                    debug!(key = %self.key, holder = %self.holder_id, "not the lock owner, nothing to release");
                    return Ok(ReleaseOutcome::NotOwner);
                }
                Attempt::Conflict => {
                    warn!(key = %self.key, "lock changed while attempting to release - retrying");
                }
            }
        }
    }

    /// Set the lease to `duration` from now.
    ///
    /// Fails with [`Error::LockExtension`] if the lock is no longer ours.
    pub async fn extend(&self, duration: Duration) -> Result<()> {
        self.logged(self.extend_loop(duration)).await
    }

    async fn extend_loop(&self, duration: Duration) -> Result<()> {
        if duration.is_zero() {
            return Err(Error::InvalidConfig("lease extension must be greater than zero".into()));
        }
        if Instant::now().checked_add(duration).is_none() {
            return Err(Error::InvalidConfig(format!("lease extension of {duration:?} is out of range")));
        }

        loop {
            debug!(key = %self.key, duration = ?duration, "extending lock");
            let op = TxOp::Expire(self.key.clone(), duration);
            match self.watched_attempt(self.before_extend.as_ref(), op).await? {
                Attempt::Committed => {
                    debug!(key = %self.key, duration = ?duration, "lock extended");
                    return Ok(());
                }
                Attempt::NotOwner => {
                    warn!(key = %self.key, holder = %self.holder_id, "cannot extend a lock we no longer hold");
                    return Err(Error::LockExtension {
                        key: self.key.clone(),
                        holder: self.holder_id.clone(),
                    });
                }
                Attempt::Conflict => {
                    warn!(key = %self.key, "lock changed while attempting to extend - retrying");
                }
            }
        }
    }

    /// Whether the store currently attributes the key to this handle.
    pub async fn is_locked(&self) -> Result<bool> {
        self.is_owner().await
    }

    /// Whether the key exists with no expiration, i.e. its holder never
    /// finished setting the lease.
    pub async fn has_missing_expiration(&self) -> Result<bool> {
        Ok(self.store.ttl(&self.key).await? == Ttl::Persistent)
    }

    async fn add_expiration(&self, lease: Duration) -> Result<()> {
        debug!(key = %self.key, lease = ?lease, "adding expiration to lock");
        self.store.expire(&self.key, lease).await?;
        Ok(())
    }

    async fn is_owner(&self) -> Result<bool> {
        Ok(self.store.get(&self.key).await?.as_deref() == Some(self.holder_id.as_str()))
    }

    /// Watch the key, confirm ownership, run `hook`, then commit `op`.
    async fn watched_attempt(&self, hook: Option<&Hook<S>>, op: TxOp) -> Result<Attempt> {
        self.store.watch(&self.key).await?;

        match self.attempt_under_watch(hook, op).await {
            // exec already dropped the watch
            Ok(attempt @ (Attempt::Committed | Attempt::Conflict)) => Ok(attempt),
            Ok(Attempt::NotOwner) => {
                self.store.unwatch().await?;
                Ok(Attempt::NotOwner)
            }
            Err(err) => {
                if let Err(unwatch_err) = self.store.unwatch().await {
                    warn!(key = %self.key, error = %unwatch_err, "failed to drop watch");
                }
                Err(err)
            }
        }
    }

    async fn attempt_under_watch(&self, hook: Option<&Hook<S>>, op: TxOp) -> Result<Attempt> {
        if !self.is_owner().await? {
            return Ok(Attempt::NotOwner);
        }

        if let Some(hook) = hook {
            debug!(key = %self.key, "running before hook");
            hook(self.store.clone()).await?;
        }

        Ok(match self.store.exec(vec![op]).await? {
            ExecOutcome::Committed => Attempt::Committed,
            ExecOutcome::Aborted => Attempt::Conflict,
        })
    }

    async fn logged<F: Future>(&self, fut: F) -> F::Output {
        match &self.logger {
            Some(logger) => fut.with_subscriber(logger.clone()).await,
            None => fut.await,
        }
    }
}

fn boxed_hook<S, F, Fut>(hook: F) -> Hook<S>
where
    S: ?Sized + 'static,
    F: Fn(Arc<S>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(move |store| hook(store).boxed())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryConnection, MemoryServer};

    fn options() -> LockOptions {
        LockOptions::default()
    }

    fn handle(server: &MemoryServer, options: LockOptions) -> DistributedLock<MemoryConnection> {
        DistributedLock::new(server.connect(), "test", options).unwrap()
    }

    #[tokio::test]
    async fn test_acquire_and_release() {
        let server = MemoryServer::new();
        let lock = handle(&server, options());

        lock.lock().await.unwrap();
        let conn = server.connect();
        assert_eq!(conn.get("lock:test").await.unwrap().as_deref(), Some(lock.holder_id()));
        assert!(lock.is_locked().await.unwrap());

        assert_eq!(lock.unlock().await.unwrap(), ReleaseOutcome::Released);
        assert_eq!(conn.get("lock:test").await.unwrap(), None);
        assert!(!lock.is_locked().await.unwrap());
    }

    #[tokio::test]
    async fn test_acquire_sets_lease() {
        let server = MemoryServer::new();
        let lock = handle(&server, options().with_lease_duration(Duration::from_secs(10)));
        lock.lock().await.unwrap();

        match server.connect().ttl("lock:test").await.unwrap() {
            Ttl::Expires(left) => assert!(left <= Duration::from_secs(10) && left > Duration::from_secs(9)),
            other => panic!("expected a lease, got {other:?}"),
        }
        assert!(!lock.has_missing_expiration().await.unwrap());
    }

    #[tokio::test]
    async fn test_second_unlock_is_not_owner() {
        let server = MemoryServer::new();
        let lock = handle(&server, options());
        lock.lock().await.unwrap();

        assert_eq!(lock.unlock().await.unwrap(), ReleaseOutcome::Released);
        assert_eq!(lock.unlock().await.unwrap(), ReleaseOutcome::NotOwner);
    }

    #[tokio::test]
    async fn test_holder_ids_are_unique() {
        let server = MemoryServer::new();
        let a = handle(&server, options());
        let b = handle(&server, options());
        assert_ne!(a.holder_id(), b.holder_id());
        assert_eq!(a.key(), b.key());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_when_held() {
        let server = MemoryServer::new();
        let holder = handle(&server, options());
        holder.lock().await.unwrap();

        let waiter = handle(&server, options().with_acquire_timeout(Duration::from_secs(1)));
        let err = waiter.lock().await.unwrap_err();
        assert!(matches!(err, Error::LockAcquisition { .. }));
        assert!(err.is_recoverable());
        assert!(holder.is_locked().await.unwrap());
    }

    #[tokio::test]
    async fn test_empty_resource_rejected() {
        let server = MemoryServer::new();
        let result = DistributedLock::new(server.connect(), "", options());
        assert!(matches!(result, Err(Error::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn test_extend_rejects_zero() {
        let server = MemoryServer::new();
        let lock = handle(&server, options());
        lock.lock().await.unwrap();
        assert!(matches!(lock.extend(Duration::ZERO).await, Err(Error::InvalidConfig(_))));
        assert!(lock.is_locked().await.unwrap());
    }

    #[tokio::test]
    async fn test_extend_rejects_out_of_range_duration() {
        let server = MemoryServer::new();
        let lock = handle(&server, options());
        lock.lock().await.unwrap();
        assert!(matches!(lock.extend(Duration::MAX).await, Err(Error::InvalidConfig(_))));
        assert!(lock.is_locked().await.unwrap());
        assert!(matches!(lock.store().ttl(lock.key()).await.unwrap(), Ttl::Expires(_)));
    }

    #[tokio::test]
    async fn test_hook_error_propagates_and_keeps_lock() {
        let server = MemoryServer::new();
        let lock = handle(&server, options())
            .with_before_release(|_store| async { Err::<(), Error>(Error::Other(anyhow::anyhow!("hook failed"))) });
        lock.lock().await.unwrap();

        assert!(matches!(lock.unlock().await, Err(Error::Other(_))));
        assert!(lock.is_locked().await.unwrap());
    }
}
