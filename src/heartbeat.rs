use crate::prelude::*;

use std::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Periodic liveness record for the site, independent of mode. A heartbeat
/// that cannot be recorded is logged and skipped.
pub struct HeartbeatMonitor {
    coordinator: Coordinator,
    task: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl HeartbeatMonitor {
    pub fn new(coordinator: Coordinator) -> Self {
        Self {
            coordinator,
            task: Mutex::new(None),
        }
    }

    /// No-op if already running.
    pub fn start(&self) -> Result<()> {
        let mut task = self.task.lock().map_err(|_| anyhow!("heartbeat lock poisoned"))?;
        if task.is_some() {
            return Ok(());
        }

        let token = CancellationToken::new();
        let handle = tokio::spawn(Self::run(self.coordinator.clone(), token.clone()));
        *task = Some((token, handle));

        self.coordinator.set_heartbeat_running(true);
        info!("heartbeat started");

        Ok(())
    }

    /// No-op if not running.
    pub async fn stop(&self) -> Result<()> {
        let task = self.task.lock().map_err(|_| anyhow!("heartbeat lock poisoned"))?.take();

        if let Some((token, handle)) = task {
            token.cancel();
            if let Err(err) = handle.await {
                error!("heartbeat task: {}", err);
            }
            self.coordinator.set_heartbeat_running(false);
            info!("heartbeat stopped");
        }

        Ok(())
    }

    pub fn running(&self) -> bool {
        self.task.lock().map(|t| t.is_some()).unwrap_or(false)
    }

    async fn run(coordinator: Coordinator, token: CancellationToken) {
        loop {
            // re-read every time, the interval can change at runtime
            let interval = coordinator.config().heartbeat().interval;

            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }

            match coordinator.record_current_heartbeat().await {
                Ok(outcome) => debug!("heartbeat {} recorded, published {}", outcome.id, outcome.published),
                Err(err) => warn!("heartbeat skipped: {}", err),
            }
        }
    }
}
