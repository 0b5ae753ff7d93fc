use crate::cache::Table;
use crate::prelude::*;

use std::sync::Arc;

/// Most readings pushed in one pass.
pub const READING_BATCH: u32 = 100;
/// Most heartbeats pushed in one pass.
pub const HEARTBEAT_BATCH: u32 = 50;

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct SyncResult {
    pub success: bool,
    pub uploaded: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SyncResult {
    pub fn ok(uploaded: u64) -> Self {
        Self {
            success: true,
            uploaded,
            error: None,
        }
    }

    pub fn failed(uploaded: u64, error: impl Into<String>) -> Self {
        Self {
            success: false,
            uploaded,
            error: Some(error.into()),
        }
    }
}

/// Drains the local cache into the remote store in bounded batches.
///
/// Only one pass runs at a time; a call made while another pass is in flight
/// returns straight away with a failure instead of waiting.
#[derive(Clone)]
pub struct SyncEngine {
    cache: Arc<LocalCache>,
    remote: Option<Arc<dyn RemoteStore>>,
    in_flight: Arc<tokio::sync::Mutex<()>>,
}

impl SyncEngine {
    pub fn new(cache: Arc<LocalCache>, remote: Option<Arc<dyn RemoteStore>>) -> Self {
        Self {
            cache,
            remote,
            in_flight: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    pub fn configured(&self) -> bool {
        self.remote.is_some()
    }

    pub async fn sync_cached_data(&self) -> SyncResult {
        let _guard = match self.in_flight.try_lock() {
            Ok(guard) => guard,
            Err(_) => {
                debug!("sync requested while another pass is running");
                return SyncResult::failed(0, "sync already in progress");
            }
        };

        let remote = match &self.remote {
            Some(remote) => remote.as_ref(),
            None => return SyncResult::failed(0, "remote store not configured"),
        };

        let mut uploaded = 0;
        for (table, limit) in [(Table::Readings, READING_BATCH), (Table::Heartbeats, HEARTBEAT_BATCH)] {
            match self.drain(remote, table, limit).await {
                Ok(n) => uploaded += n,
                Err(PassError { uploaded: n, error }) => {
                    uploaded += n;
                    error!("sync aborted after {} rows: {}", uploaded, error);
                    return SyncResult::failed(uploaded, error);
                }
            }
        }

        if uploaded > 0 {
            info!("sync uploaded {} rows", uploaded);
        }

        SyncResult::ok(uploaded)
    }

    /// Repeats `sync_cached_data` until nothing is pending, a pass makes no
    /// progress, or `max_passes` have run. Returns the combined result and the
    /// number of passes made.
    pub async fn drain_backlog(&self, max_passes: u32) -> (SyncResult, u32) {
        let mut total = 0;
        let mut passes = 0;

        while passes < max_passes.max(1) {
            let result = self.sync_cached_data().await;
            passes += 1;
            total += result.uploaded;

            if !result.success {
                return (SyncResult { uploaded: total, ..result }, passes);
            }
            if result.uploaded == 0 {
                break;
            }

            match self.cache.stats().await {
                Ok(stats) if stats.pending_readings == 0 && stats.pending_heartbeats == 0 => break,
                Ok(_) => continue,
                Err(err) => return (SyncResult::failed(total, err.to_string()), passes),
            }
        }

        (SyncResult::ok(total), passes)
    }

    // row-level rejections are logged and skipped; anything that means the
    // remote store or the cache itself is unusable ends the pass
    async fn drain(&self, remote: &dyn RemoteStore, table: Table, limit: u32) -> Result<u64, PassError> {
        let mut uploaded = 0;

        let rows = self
            .cache
            .drain_unuploaded(table, limit)
            .await
            .map_err(|err| PassError::new(uploaded, format!("reading cache: {}", err)))?;

        for row in rows {
            match remote.insert(&row).await {
                Ok(()) => {
                    self.cache
                        .mark_uploaded(table, row.id())
                        .await
                        .map_err(|err| PassError::new(uploaded, format!("marking {:?} {}: {}", table, row.id(), err)))?;
                    uploaded += 1;
                }
                Err(err) if err.is_connection() => {
                    return Err(PassError::new(uploaded, err.to_string()));
                }
                Err(err) => {
                    warn!("{:?} row {} not uploaded: {}", table, row.id(), err);
                }
            }
        }

        Ok(uploaded)
    }
}

struct PassError {
    uploaded: u64,
    error: String,
}

impl PassError {
    fn new(uploaded: u64, error: String) -> Self {
        Self { uploaded, error }
    }
}
