use crate::prelude::*;

use tokio::time::Instant;

/// Polling loop for one device. The interval comes from the current mode,
/// so a mode change moves the next poll but never interrupts one in flight.
pub struct Poller {
    coordinator: Coordinator,
    device_id: String,
}

impl Poller {
    pub fn new(coordinator: Coordinator, device_id: String) -> Self {
        Self {
            coordinator,
            device_id,
        }
    }

    pub async fn start(&self) -> Result<()> {
        let mut shutdown = self.coordinator.channels().shutdown.subscribe();
        let mut mode = self.coordinator.subscribe_mode();

        info!("polling {}", self.device_id);

        loop {
            let started = Instant::now();
            self.poll().await;

            loop {
                let interval = self.coordinator.config().poll_interval(*mode.borrow_and_update());
                let deadline = started
                    .checked_add(interval)
                    .unwrap_or_else(|| started + Config::MAX_INTERVAL);
                tokio::select! {
                    _ = shutdown.recv() => {
                        info!("poller {} exiting", self.device_id);
                        return Ok(());
                    }
                    _ = tokio::time::sleep_until(deadline) => break,
                    // recompute the deadline for the new mode
                    changed = mode.changed() => {
                        if changed.is_err() {
                            return Ok(());
                        }
                    }
                }
            }
        }
    }

    async fn poll(&self) {
        let reading = match self.coordinator.reader().read_device(&self.device_id).await {
            Ok(reading) => reading,
            Err(err) => {
                warn!("poll {}: {}", self.device_id, err);
                return;
            }
        };

        match self.coordinator.ingest_device_reading(&reading).await {
            Ok(outcome) => debug!(
                "polled {}: {} fields, cached as {}, published {}",
                self.device_id,
                reading.fields.len(),
                outcome.id,
                outcome.published
            ),
            Err(err) => error!("poll {}: caching reading failed: {}", self.device_id, err),
        }
    }
}
