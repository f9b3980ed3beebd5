use crate::{
    config::LockOptions,
    lock::{DistributedLock, ReleaseOutcome},
    store::{ExecOutcome, MemoryServer, Store, Ttl, TxOp},
    Error, Result,
};
use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{debug, warn};

/// Store wrapper that sleeps before every call, widening the windows in
/// which concurrent handles can interleave.
#[derive(Debug)]
pub struct DelayedStore<S: ?Sized> {
    inner: Arc<S>,
    delay: Duration,
}

impl<S: Store + ?Sized> DelayedStore<S> {
    pub fn new(inner: Arc<S>, delay: Duration) -> Self {
        Self { inner, delay }
    }

    async fn pause(&self) {
        if !self.delay.is_zero() {
            sleep(self.delay).await;
        }
    }
}

#[async_trait]
impl<S: Store + ?Sized> Store for DelayedStore<S> {
    async fn set_nx(&self, key: &str, value: &str) -> Result<bool> {
        self.pause().await;
        self.inner.set_nx(key, value).await
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.pause().await;
        self.inner.set(key, value).await
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.pause().await;
        self.inner.get(key).await
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        self.pause().await;
        self.inner.expire(key, ttl).await
    }

    async fn ttl(&self, key: &str) -> Result<Ttl> {
        self.pause().await;
        self.inner.ttl(key).await
    }

    async fn del(&self, key: &str) -> Result<bool> {
        self.pause().await;
        self.inner.del(key).await
    }

    async fn incr(&self, key: &str) -> Result<i64> {
        self.pause().await;
        self.inner.incr(key).await
    }

    async fn watch(&self, key: &str) -> Result<()> {
        self.pause().await;
        self.inner.watch(key).await
    }

    async fn unwatch(&self) -> Result<()> {
        self.pause().await;
        self.inner.unwatch().await
    }

    async fn exec(&self, ops: Vec<TxOp>) -> Result<ExecOutcome> {
        self.pause().await;
        self.inner.exec(ops).await
    }
}

#[derive(Debug, Clone)]
pub struct StressConfig {
    pub resource: String,
    pub counter_key: String,
    pub workers: usize,
    pub iterations: usize,
    /// Sleep between a worker's critical sections
    pub pause: Duration,
    /// Latency injected into every store call
    pub store_delay: Duration,
    pub options: LockOptions,
}

impl Default for StressConfig {
    fn default() -> Self {
        Self {
            resource: "stress".to_string(),
            counter_key: "num_locks".to_string(),
            workers: 10,
            iterations: 10,
            pause: Duration::from_millis(10),
            store_delay: Duration::ZERO,
            options: LockOptions::default().with_lease_duration(Duration::from_secs(1)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StressReport {
    /// Counter value left in the store
    pub counter: i64,
    /// Critical sections that ran
    pub entries: u64,
    /// Acquisitions that timed out
    pub timeouts: u64,
    /// Critical sections whose store calls failed
    pub errors: u64,
    /// Most handles ever inside the critical section at once
    pub max_concurrent: usize,
}

/// Run `workers` tasks that each take the lock `iterations` times and bump
/// a counter with a deliberately non-atomic read-then-write.
///
/// Every attempt uses a fresh connection and handle. Lost or doubled
/// updates show up as `counter != entries`.
pub async fn run_stress(server: &MemoryServer, config: StressConfig) -> Result<StressReport> {
    let entries = Arc::new(AtomicU64::new(0));
    let timeouts = Arc::new(AtomicU64::new(0));
    let errors = Arc::new(AtomicU64::new(0));
    let inside = Arc::new(AtomicUsize::new(0));
    let max_concurrent = Arc::new(AtomicUsize::new(0));

    let mut tasks = Vec::with_capacity(config.workers);
    for worker in 0..config.workers {
        let server = server.clone();
        let config = config.clone();
        let entries = entries.clone();
        let timeouts = timeouts.clone();
        let errors = errors.clone();
        let inside = inside.clone();
        let max_concurrent = max_concurrent.clone();

        tasks.push(tokio::spawn(async move {
            let (entries, inside, max_concurrent) = (&entries, &inside, &max_concurrent);
            let counter_key = config.counter_key.as_str();

            for _ in 0..config.iterations {
                let store = Arc::new(DelayedStore::new(server.connect(), config.store_delay));
                let lock = DistributedLock::new(store, &config.resource, config.options.clone())?;

                let result = lock
                    .lock_with(|lock| async move {
                        let now_inside = inside.fetch_add(1, Ordering::SeqCst) + 1;
                        max_concurrent.fetch_max(now_inside, Ordering::SeqCst);

                        let section = async {
                            let store = lock.store();
                            let current = match store.get(counter_key).await? {
                                Some(raw) => raw
                                    .parse::<i64>()
                                    .map_err(|_| Error::Store(format!("counter holds {raw:?}")))?,
                                None => 0,
                            };
                            tokio::task::yield_now().await;
                            store.set(counter_key, &(current + 1).to_string()).await
                        }
                        .await;

                        inside.fetch_sub(1, Ordering::SeqCst);
                        section?;
                        entries.fetch_add(1, Ordering::SeqCst);
                        Ok::<_, Error>(())
                    })
                    .await;

                match result {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => {
                        warn!(worker, error = %err, "stress critical section failed");
                        errors.fetch_add(1, Ordering::SeqCst);
                    }
                    Err(err) if err.is_recoverable() => {
                        debug!(worker, error = %err, "stress worker timed out");
                        timeouts.fetch_add(1, Ordering::SeqCst);
                    }
                    Err(err) => return Err(err),
                }

                sleep(config.pause).await;
            }
            Ok::<_, Error>(())
        }));
    }

    for task in tasks {
        task.await
            .map_err(|e| Error::Other(anyhow::anyhow!("stress worker panicked: {e}")))??;
    }

    let counter = match server.connect().get(&config.counter_key).await? {
        Some(raw) => raw
            .parse()
            .map_err(|_| Error::Store(format!("counter holds {raw:?}")))?,
        None => 0,
    };

    Ok(StressReport {
        counter,
        entries: entries.load(Ordering::SeqCst),
        timeouts: timeouts.load(Ordering::SeqCst),
        errors: errors.load(Ordering::SeqCst),
        max_concurrent: max_concurrent.load(Ordering::SeqCst),
    })
}

/// Wall-clock timings of repeated lock/unlock cycles on one handle.
#[derive(Debug, Clone, Copy)]
pub struct CycleTimings {
    pub cycles: u32,
    pub total: Duration,
    pub slowest: Duration,
}

impl CycleTimings {
    pub fn mean(&self) -> Duration {
        if self.cycles == 0 {
            Duration::ZERO
        } else {
            self.total / self.cycles
        }
    }
}

/// Run `cycles` lock/unlock rounds and record how long each took. A round
/// that times out or finds the lock taken by someone else is an error.
pub async fn time_lock_cycles<S>(lock: &DistributedLock<S>, cycles: u32) -> Result<CycleTimings>
where
    S: Store + ?Sized + 'static,
{
    let mut timings = CycleTimings {
        cycles,
        total: Duration::ZERO,
        slowest: Duration::ZERO,
    };
    for _ in 0..cycles {
        let started = Instant::now();
        lock.lock().await?;
        if lock.unlock().await? != ReleaseOutcome::Released {
            return Err(Error::Store(format!("lost {} before releasing it", lock.key())));
        }
        let elapsed = started.elapsed();
        timings.total += elapsed;
        timings.slowest = timings.slowest.max(elapsed);
    }
    debug!(key = %lock.key(), ?timings, "lock cycles timed");
    Ok(timings)
}
