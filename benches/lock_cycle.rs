use criterion::{criterion_group, criterion_main, Criterion};
use kvlock::{DistributedLock, LockOptions, MemoryServer, Store};
use tokio::runtime::Runtime;

fn lock_cycle_benchmark(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let server = MemoryServer::new();

    c.bench_function("uncontended lock + unlock", |b| {
        let lock = DistributedLock::new(server.connect(), "bench", LockOptions::default()).unwrap();
        b.to_async(&rt).iter(|| async {
            lock.lock().await.unwrap();
            lock.unlock().await.unwrap();
        })
    });

    c.bench_function("lock_with scoped section", |b| {
        let lock = DistributedLock::new(server.connect(), "bench_scoped", LockOptions::default()).unwrap();
        b.to_async(&rt).iter(|| async {
            lock.lock_with(|lock| async move { lock.store().incr("bench_counter").await })
                .await
                .unwrap()
                .unwrap();
        })
    });
}

criterion_group!(benches, lock_cycle_benchmark);
criterion_main!(benches);
