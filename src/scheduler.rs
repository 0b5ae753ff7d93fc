use crate::prelude::*;

use chrono::{DateTime, Utc};

/// Background maintenance: the periodic sync timer and the retention purge.
#[derive(Clone)]
pub struct Scheduler {
    config: ConfigWrapper,
    coordinator: Coordinator,
}

impl Scheduler {
    pub fn new(config: ConfigWrapper, coordinator: Coordinator) -> Self {
        Self { config, coordinator }
    }

    pub async fn start(&self) -> Result<()> {
        futures::try_join!(self.sync_timer(), self.purge_timer())?;

        Ok(())
    }

    async fn sync_timer(&self) -> Result<()> {
        let schedule = self.config.sync();
        if !schedule.enabled {
            info!("periodic sync disabled");
            return Ok(());
        }

        let mut shutdown = self.coordinator.channels().shutdown.subscribe();
        let mut interval = tokio::time::interval(schedule.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                _ = interval.tick() => {}
            }

            if !self.coordinator.mode().transmits() {
                trace!("offline, skipping periodic sync");
                continue;
            }

            let result = self.coordinator.drain_backlog(schedule.max_passes).await;
            if !result.success {
                warn!(
                    "periodic sync: {} (uploaded {})",
                    result.error.as_deref().unwrap_or("failed"),
                    result.uploaded
                );
            }
        }

        Ok(())
    }

    async fn purge_timer(&self) -> Result<()> {
        let cron = self.config.cache().purge_cron;
        let mut shutdown = self.coordinator.channels().shutdown.subscribe();

        loop {
            let next = Self::next_run(&cron, &Utils::utc())?;
            let wait = (next - Utils::utc()).to_std().unwrap_or_default();
            debug!("next cache purge at {}", Utils::iso8601(&next));

            tokio::select! {
                _ = shutdown.recv() => break,
                _ = tokio::time::sleep(wait) => {}
            }

            if let Err(err) = self.coordinator.purge().await {
                error!("cache purge failed: {}", err);
            }
        }

        Ok(())
    }

    fn next_run(cron: &str, after: &DateTime<Utc>) -> Result<DateTime<Utc>> {
        cron_parser::parse(cron, after).map_err(|err| anyhow!("invalid purge schedule {:?}: {:?}", cron, err))
    }
}
