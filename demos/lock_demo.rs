use kvlock::{DistributedLock, Error, LockOptions, MemoryServer, Store};
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let server = MemoryServer::new();

    println!("1. Scoped critical section");
    let options = LockOptions::default().with_lease_duration(Duration::from_secs(5));
    let lock = DistributedLock::new(server.connect(), "report", options.clone())?;
    lock.lock_with(|lock| async move {
        println!("   holding {} as {}", lock.key(), lock.holder_id());
    })
    .await?;
    println!("   released: locked = {}", lock.is_locked().await?);

    println!("2. A second client times out while the first holds the lock");
    let first = DistributedLock::obtain(server.connect(), "report", options.clone()).await?;
    let second = DistributedLock::new(
        server.connect(),
        "report",
        options.clone().with_acquire_timeout(Duration::from_millis(200)),
    )?;
    match second.lock().await {
        Err(err @ Error::LockAcquisition { .. }) => println!("   {err}"),
        other => println!("   unexpected: {other:?}"),
    }

    println!("3. Extending the lease");
    first.extend(Duration::from_secs(30)).await?;
    println!("   ttl now {:?}", server.connect().ttl(first.key()).await?);
    first.unlock().await?;

    println!("4. Recovering a lock whose holder crashed before setting a lease");
    server.connect().set("lock:report", "crashed-holder").await?;
    let recovered = DistributedLock::obtain(
        server.connect(),
        "report",
        options.with_lease_duration(Duration::from_millis(300)),
    )
    .await?;
    println!("   recovered by {}", recovered.holder_id());
    recovered.unlock().await?;

    Ok(())
}
