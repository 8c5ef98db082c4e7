//! Lifecycle management for the per-device workers.
//! Starts one session task per top-level device and stops them all within a
//! bounded window.

use crate::error::{Result, TuyaError};
use crate::registry::DeviceRegistry;
use crate::session::{DeviceSession, SessionHandle, SessionOptions, StateUpdate};
use crate::transport::Connector;
use log::{info, warn};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tokio::time::{Duration, timeout};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// Maximizes the file descriptor limit for the current process.
///
/// Each device holds one socket for its whole lifetime. On non-Unix
/// systems this does nothing.
pub fn maximize_fd_limit() -> Result<()> {
    #[cfg(unix)]
    {
        let (soft, hard) = rlimit::getrlimit(rlimit::Resource::NOFILE)
            .map_err(|e| TuyaError::Io(format!("Failed to get rlimit: {}", e)))?;

        if soft < hard {
            rlimit::setrlimit(rlimit::Resource::NOFILE, hard, hard)
                .map_err(|e| TuyaError::Io(format!("Failed to set rlimit: {}", e)))?;
            info!("File descriptor limit increased from {} to {}", soft, hard);
        }
    }
    Ok(())
}

/// Owns one worker per top-level device.
///
/// Sub-devices share their gateway's worker. Workers never share failures:
/// each one retries its own connection forever until stopped.
pub struct WorkerSupervisor<C: Connector> {
    registry: DeviceRegistry,
    connector: C,
    options: SessionOptions,
    cancel_token: CancellationToken,
    tracker: TaskTracker,
    handles: HashMap<String, SessionHandle>,
    aborts: Vec<AbortHandle>,
}

impl<C: Connector> WorkerSupervisor<C> {
    pub fn new(registry: DeviceRegistry, connector: C, options: SessionOptions) -> Self {
        Self {
            registry,
            connector,
            options,
            cancel_token: CancellationToken::new(),
            tracker: TaskTracker::new(),
            handles: HashMap::new(),
            aborts: Vec::new(),
        }
    }

    /// Spawns a worker for every registered device that is not running yet.
    ///
    /// All workers report state into `events`. Returns the command handles,
    /// keyed by device identifier.
    pub fn start_all(
        &mut self,
        events: mpsc::Sender<StateUpdate>,
    ) -> HashMap<String, SessionHandle> {
        for device in self.registry.devices() {
            if self.handles.contains_key(&device.id) {
                continue;
            }
            let (session, handle) = DeviceSession::new(
                Arc::new(device.clone()),
                self.connector.clone(),
                self.options.clone(),
                events.clone(),
            );
            let task = self.tracker.spawn(session.run(self.cancel_token.child_token()));
            self.aborts.push(task.abort_handle());
            self.handles.insert(device.id.clone(), handle);
        }
        info!("Started {} device workers", self.handles.len());
        self.handles.clone()
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Signals every worker to stop and waits for them for at most `window`.
    ///
    /// Workers still running after the window are aborted.
    pub async fn stop_all(&mut self, window: Duration) {
        self.cancel_token.cancel();
        self.tracker.close();

        if timeout(window, self.tracker.wait()).await.is_err() {
            warn!(
                "Workers did not stop within {}ms, aborting the rest",
                window.as_millis()
            );
            for abort in &self.aborts {
                abort.abort();
            }
        } else {
            info!("All {} device workers stopped", self.handles.len());
        }
        self.aborts.clear();
        self.handles.clear();
    }
}

impl<C: Connector> Drop for WorkerSupervisor<C> {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionState;
    use std::io;
    use tokio::io::DuplexStream;

    #[derive(Clone)]
    struct Unreachable;

    impl Connector for Unreachable {
        type Stream = DuplexStream;

        async fn connect(&self, _address: &str, _port: u16) -> io::Result<DuplexStream> {
            Err(io::Error::from(io::ErrorKind::ConnectionRefused))
        }
    }

    fn registry() -> DeviceRegistry {
        DeviceRegistry::from_json(
            r#"[
                {"name": "a", "id": "1", "ip": "h", "key": "0123456789abcdef", "version": 3.3},
                {"name": "b", "id": "2", "ip": "h", "key": "0123456789abcdef", "version": 3.5,
                 "subDevices": [{"name": "c", "id": "3", "cid": "cc"}]}
            ]"#,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn one_worker_per_top_level_device() {
        let options = SessionOptions {
            reconnect_min: Duration::from_millis(10),
            reconnect_max: Duration::from_millis(20),
            ..Default::default()
        };
        let mut supervisor = WorkerSupervisor::new(registry(), Unreachable, options);
        let (events, _rx) = mpsc::channel(8);

        let handles = supervisor.start_all(events.clone());
        assert_eq!(handles.len(), 2);
        assert!(handles.contains_key("1") && handles.contains_key("2"));

        // Starting again does not duplicate workers
        supervisor.start_all(events);
        assert_eq!(supervisor.len(), 2);

        supervisor.stop_all(Duration::from_secs(1)).await;
        assert!(supervisor.is_empty());
        for handle in handles.values() {
            assert_eq!(handle.state(), SessionState::Disconnected);
        }
    }
}
