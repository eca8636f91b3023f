//! Readiness tracking.

use crate::storage::SqlSplitStorage;
use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use std::io;
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// One-way flag that threads can block on until it is set.
#[derive(Debug, Default)]
pub struct ReadyFlag {
    ready: Mutex<bool>,
    cond: Condvar,
}

impl ReadyFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the flag and wake every waiter.
    pub fn set(&self) {
        let mut ready = self.ready.lock().unwrap_or_else(PoisonError::into_inner);
        *ready = true;
        self.cond.notify_all();
    }

    pub fn is_set(&self) -> bool {
        *self.ready.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Block until the flag is set or `timeout` elapses. Returns whether it is set.
    pub fn wait(&self, timeout: Duration) -> bool {
        let ready = self.ready.lock().unwrap_or_else(PoisonError::into_inner);
        let (ready, _) = self
            .cond
            .wait_timeout_while(ready, timeout, |ready| !*ready)
            .unwrap_or_else(PoisonError::into_inner);
        *ready
    }
}

/// Background thread that sets a [`ReadyFlag`] once the store holds flag
/// definitions.
pub struct ReadinessWatcher {
    shutdown: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl ReadinessWatcher {
    /// Start watching. The store is checked immediately, then every `poll_interval`.
    pub fn spawn(
        splits: SqlSplitStorage,
        flag: Arc<ReadyFlag>,
        poll_interval: Duration,
    ) -> io::Result<Self> {
        let (shutdown, shutdown_rx) = bounded::<()>(0);

        let handle = thread::Builder::new()
            .name("SDKInitializer".to_string())
            .spawn(move || loop {
                match splits.has_definitions() {
                    Ok(true) => {
                        tracing::info!("flag definitions found, factory is ready");
                        flag.set();
                        return;
                    }
                    Ok(false) => tracing::trace!("no flag definitions yet"),
                    Err(e) => tracing::warn!(error = %e, "failed to check flag store"),
                }

                match shutdown_rx.recv_timeout(poll_interval) {
                    Err(RecvTimeoutError::Timeout) => continue,
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => return,
                }
            })?;

        Ok(Self {
            shutdown: Some(shutdown),
            handle: Some(handle),
        })
    }

    /// Stop the thread and wait for it to exit.
    pub fn stop(&mut self) {
        // Dropping the sender disconnects the channel.
        self.shutdown.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for ReadinessWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Split;
    use crate::storage::DbClient;
    use std::time::Instant;

    #[test]
    fn test_flag_wait_times_out() {
        let flag = ReadyFlag::new();
        assert!(!flag.wait(Duration::ZERO));

        let start = Instant::now();
        assert!(!flag.wait(Duration::from_millis(50)));
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn test_flag_wakes_waiters() {
        let flag = Arc::new(ReadyFlag::new());
        let setter = Arc::clone(&flag);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            setter.set();
        });

        assert!(flag.wait(Duration::from_secs(5)));
        assert!(flag.is_set());
        handle.join().unwrap();
    }

    #[test]
    fn test_watcher_sees_definitions_written_later() {
        let splits = SqlSplitStorage::new(DbClient::in_memory().unwrap());
        let flag = Arc::new(ReadyFlag::new());
        let mut watcher =
            ReadinessWatcher::spawn(splits.clone(), Arc::clone(&flag), Duration::from_millis(10))
                .unwrap();

        assert!(!flag.wait(Duration::from_millis(30)));
        splits.put(&Split::new("flag", "user", "off")).unwrap();
        assert!(flag.wait(Duration::from_secs(5)));
        watcher.stop();
    }

    #[test]
    fn test_watcher_stops_promptly() {
        let splits = SqlSplitStorage::new(DbClient::in_memory().unwrap());
        let flag = Arc::new(ReadyFlag::new());
        let mut watcher =
            ReadinessWatcher::spawn(splits, Arc::clone(&flag), Duration::from_secs(60)).unwrap();

        let start = Instant::now();
        watcher.stop();
        assert!(start.elapsed() < Duration::from_secs(5));
        assert!(!flag.is_set());
    }
}
