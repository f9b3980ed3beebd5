use anyhow::{anyhow, Context, Result};
use kvlock::test_utils::{run_stress, StressConfig};
use kvlock::{LockOptions, MemoryServer};
use std::env;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn usage(program: &str) -> ! {
    eprintln!("Usage: {} stress <workers> <iterations>", program);
    eprintln!("       {} run <resource> <command> [args...]", program);
    eprintln!();
    eprintln!("Lock options come from KVLOCK_ACQUIRE_TIMEOUT_MS, KVLOCK_LEASE_DURATION_MS,");
    eprintln!("KVLOCK_RETRY_INTERVAL_MS and KVLOCK_KEY_PREFIX. `run` connects to KVLOCK_REDIS_URL.");
    std::process::exit(1);
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args: Vec<String> = env::args().collect();
    let program = args.first().map(String::as_str).unwrap_or("kvlock");
    let options = LockOptions::from_env().context("invalid lock options")?;

    match args.get(1).map(String::as_str) {
        Some("stress") if args.len() == 4 => {
            let workers = args[2].parse().context("workers must be a number")?;
            let iterations = args[3].parse().context("iterations must be a number")?;
            stress(workers, iterations, options).await
        }
        Some("run") if args.len() >= 4 => {
            let code = run(&args[2], &args[3], &args[4..], options).await?;
            std::process::exit(code);
        }
        _ => usage(program),
    }
}

async fn stress(workers: usize, iterations: usize, options: LockOptions) -> Result<()> {
    let server = MemoryServer::new();
    let config = StressConfig {
        workers,
        iterations,
        options,
        ..StressConfig::default()
    };

    info!(workers, iterations, "starting stress run");
    let report = run_stress(&server, config).await?;

    println!("critical sections: {}", report.entries);
    println!("counter:           {}", report.counter);
    println!("timeouts:          {}", report.timeouts);
    println!("store errors:      {}", report.errors);
    println!("max concurrent:    {}", report.max_concurrent);

    if report.counter != report.entries as i64 || report.max_concurrent > 1 {
        return Err(anyhow!("mutual exclusion violated"));
    }
    Ok(())
}

#[cfg(feature = "redis")]
async fn run(resource: &str, command: &str, args: &[String], options: LockOptions) -> Result<i32> {
    use kvlock::{DistributedLock, RedisStore};
    use std::sync::Arc;

    let url = env::var("KVLOCK_REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1/".to_string());
    let store = Arc::new(RedisStore::connect(&url).await?);
    let lock = DistributedLock::new(store, resource, options)?;

    info!(key = lock.key(), command, "running command under lock");
    let status = lock
        .lock_with(|_lock| async {
            tokio::process::Command::new(command).args(args).status().await
        })
        .await??;

    Ok(status.code().unwrap_or(1))
}

#[cfg(not(feature = "redis"))]
async fn run(_resource: &str, _command: &str, _args: &[String], _options: LockOptions) -> Result<i32> {
    Err(anyhow!("kvlock was built without the `redis` feature"))
}
