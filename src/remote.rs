use crate::cache::{CachedHeartbeat, CachedReading, CachedRow};
use crate::error::RemoteError;
use crate::prelude::*;

use async_trait::async_trait;
use reqwest::StatusCode;

pub const READINGS_TABLE: &str = "sensor_readings";
pub const HEARTBEATS_TABLE: &str = "site_heartbeats";

/// Where cached rows end up. One row per call; callers may repeat a call for a
/// row whose acknowledgement was lost, so implementations must tolerate
/// duplicates.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    async fn insert_reading(&self, reading: &CachedReading) -> Result<(), RemoteError>;

    async fn insert_heartbeat(&self, heartbeat: &CachedHeartbeat) -> Result<(), RemoteError>;

    async fn insert(&self, row: &CachedRow) -> Result<(), RemoteError> {
        match row {
            CachedRow::Reading(r) => self.insert_reading(r).await,
            CachedRow::Heartbeat(h) => self.insert_heartbeat(h).await,
        }
    }
}

#[derive(Debug, PartialEq, Serialize)]
pub struct SensorReadingRow {
    pub sensor_id: String,
    pub value: Option<f64>,
    pub unit: Option<String>,
    pub timestamp: String,
    pub metadata: serde_json::Value,
}

impl From<&CachedReading> for SensorReadingRow {
    fn from(r: &CachedReading) -> Self {
        Self {
            sensor_id: r.sensor_id.clone(),
            value: r.payload.get("value").and_then(|v| v.as_f64()),
            unit: r.payload.get("unit").and_then(|v| v.as_str()).map(str::to_string),
            timestamp: r.timestamp.clone(),
            metadata: serde_json::json!({
                "site_id": r.site_id,
                "payload": r.payload,
            }),
        }
    }
}

#[derive(Debug, PartialEq, Serialize)]
pub struct SiteHeartbeatRow {
    pub site_id: String,
    pub power_mode: Mode,
    pub battery_level: Option<f64>,
    pub network_type: String,
    pub signal_strength: Option<i64>,
    pub received_at: String,
}

impl From<&CachedHeartbeat> for SiteHeartbeatRow {
    fn from(h: &CachedHeartbeat) -> Self {
        Self {
            site_id: h.site_id.clone(),
            power_mode: h.power_mode,
            battery_level: h.battery_level,
            network_type: h.network_type.clone(),
            signal_strength: h.signal_strength,
            received_at: h.timestamp.clone(),
        }
    }
}

/// PostgREST-style REST endpoint (`{url}/rest/v1/{table}`) authenticated
/// with an API key.
#[derive(Clone, Debug)]
pub struct RestStore {
    client: reqwest::Client,
    base_url: String,
    key: String,
}

impl RestStore {
    pub fn new(url: &str, key: &str, timeout: std::time::Duration) -> Result<Self> {
        url::Url::parse(url).map_err(|err| anyhow!("invalid remote store URL {}: {}", url, err))?;

        let client = reqwest::Client::builder().timeout(timeout).build()?;

        Ok(Self {
            client,
            base_url: url.trim_end_matches('/').to_string(),
            key: key.to_string(),
        })
    }

    /// `None` when the remote store has not been configured.
    pub fn from_config(config: &config::Remote) -> Result<Option<Self>> {
        match (&config.url, &config.key) {
            (Some(url), Some(key)) if config.configured() => Ok(Some(Self::new(url, key, config.timeout)?)),
            _ => Ok(None),
        }
    }

    fn table_url(&self, table: &str) -> String {
        format!("{}/rest/v1/{}", self.base_url, table)
    }

    async fn post<T: Serialize + Sync>(&self, table: &str, row: &T) -> Result<(), RemoteError> {
        let response = self
            .client
            .post(self.table_url(table))
            .header("apikey", &self.key)
            .bearer_auth(&self.key)
            .header("Prefer", "return=minimal")
            .json(row)
            .send()
            .await
            .map_err(|err| RemoteError::Connection(err.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                Err(RemoteError::Connection(format!("{} {}: {}", table, status, body)))
            }
            _ => Err(RemoteError::Rejected(format!("{} {}: {}", table, status, body))),
        }
    }
}

#[async_trait]
impl RemoteStore for RestStore {
    async fn insert_reading(&self, reading: &CachedReading) -> Result<(), RemoteError> {
        self.post(READINGS_TABLE, &SensorReadingRow::from(reading)).await
    }

    async fn insert_heartbeat(&self, heartbeat: &CachedHeartbeat) -> Result<(), RemoteError> {
        self.post(HEARTBEATS_TABLE, &SiteHeartbeatRow::from(heartbeat)).await
    }
}
