use kvlock::{DistributedLock, LockOptions, MemoryServer};
use parking_lot::Mutex;
use std::io;
use std::sync::Arc;
use tracing::dispatcher::Dispatch;

#[derive(Clone, Default)]
struct CapturedLogs(Arc<Mutex<Vec<u8>>>);

impl CapturedLogs {
    fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock()).into_owned()
    }
}

impl io::Write for CapturedLogs {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn capturing_logger(logs: &CapturedLogs) -> Dispatch {
    let logs = logs.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_ansi(false)
        .with_writer(move || logs.clone())
        .finish();
    Dispatch::new(subscriber)
}

#[tokio::test]
async fn test_injected_logger_receives_protocol_events() {
    let server = MemoryServer::new();
    let logs = CapturedLogs::default();
    let lock = DistributedLock::new(server.connect(), "logged", LockOptions::default())
        .unwrap()
        .with_logger(capturing_logger(&logs));

    lock.lock().await.unwrap();
    lock.unlock().await.unwrap();

    let output = logs.contents();
    assert!(output.contains("lock acquired"), "missing acquire event in {output}");
    assert!(output.contains("lock released"), "missing release event in {output}");
    assert!(output.contains("lock:logged"));
    assert!(output.contains(lock.holder_id()));
}

#[tokio::test]
async fn test_loggers_are_per_handle() {
    let server = MemoryServer::new();
    let logs = CapturedLogs::default();
    let _logged = DistributedLock::new(server.connect(), "a", LockOptions::default())
        .unwrap()
        .with_logger(capturing_logger(&logs));
    let silent = DistributedLock::new(server.connect(), "b", LockOptions::default()).unwrap();

    silent.lock().await.unwrap();
    silent.unlock().await.unwrap();

    assert!(logs.contents().is_empty());
}
