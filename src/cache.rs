use crate::prelude::*;

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Table {
    Readings,
    Heartbeats,
}

impl Table {
    fn name(&self) -> &'static str {
        match self {
            Table::Readings => "readings",
            Table::Heartbeats => "heartbeats",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct CachedReading {
    pub id: i64,
    pub site_id: String,
    pub sensor_id: String,
    pub payload: serde_json::Value,
    pub timestamp: String,
    pub uploaded: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct CachedHeartbeat {
    pub id: i64,
    pub site_id: String,
    pub power_mode: Mode,
    pub battery_level: Option<f64>,
    pub network_type: String,
    pub signal_strength: Option<i64>,
    pub timestamp: String,
    pub uploaded: bool,
}

#[derive(Clone, Debug, PartialEq)]
pub enum CachedRow {
    Reading(CachedReading),
    Heartbeat(CachedHeartbeat),
}

impl CachedRow {
    pub fn id(&self) -> i64 {
        match self {
            CachedRow::Reading(r) => r.id,
            CachedRow::Heartbeat(h) => h.id,
        }
    }

    pub fn table(&self) -> Table {
        match self {
            CachedRow::Reading(_) => Table::Readings,
            CachedRow::Heartbeat(_) => Table::Heartbeats,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct NewHeartbeat {
    pub site_id: String,
    pub power_mode: Mode,
    pub battery_level: Option<f64>,
    pub network_type: String,
    pub signal_strength: Option<i64>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct CacheStats {
    pub pending_readings: u64,
    pub total_readings: u64,
    pub pending_heartbeats: u64,
    pub total_heartbeats: u64,
    pub oldest_pending: Option<String>,
    pub online: bool,
}

/// Embedded SQLite store for everything that still has to reach the remote
/// store. The `uploaded` flag on each row is the only record of what is
/// outstanding.
///
/// The pool holds exactly one connection, so writers from the polling path,
/// the pub/sub path and the sync path are serialized by the pool itself.
#[derive(Debug)]
pub struct LocalCache {
    pool: SqlitePool,
    online: AtomicBool,
}

impl LocalCache {
    pub async fn open(url: &str) -> Result<Self> {
        info!("opening local cache at {}", url);

        let mut options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .busy_timeout(Duration::from_secs(5));
        if !url.contains(":memory:") {
            options = options.journal_mode(SqliteJournalMode::Wal);
        }

        // idle/lifetime limits off: for an in-memory database, recycling the
        // only connection would discard the data
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None::<Duration>)
            .max_lifetime(None::<Duration>)
            .acquire_timeout(Duration::from_secs(30))
            .connect_with(options)
            .await?;

        sqlx::migrate!("db/migrations/sqlite").run(&pool).await?;

        Ok(Self {
            pool,
            online: AtomicBool::new(false),
        })
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::Release);
    }

    pub fn online(&self) -> bool {
        self.online.load(Ordering::Acquire)
    }

    /// Returns the new row id. `timestamp` must be RFC 3339; it is stored
    /// normalised to UTC.
    pub async fn insert_reading(
        &self,
        site_id: &str,
        sensor_id: &str,
        payload: &serde_json::Value,
        timestamp: &str,
    ) -> Result<i64> {
        let timestamp = Utils::normalize_timestamp(timestamp)?;

        let id = sqlx::query(
            "INSERT INTO readings (site_id, sensor_id, payload, timestamp) VALUES ($1, $2, $3, $4)",
        )
        .bind(site_id)
        .bind(sensor_id)
        .bind(serde_json::to_string(payload)?)
        .bind(&timestamp)
        .execute(&self.pool)
        .await?
        .last_insert_rowid();

        trace!("cached reading {} from {}/{}", id, site_id, sensor_id);

        Ok(id)
    }

    pub async fn insert_heartbeat(&self, heartbeat: &NewHeartbeat) -> Result<i64> {
        let id = sqlx::query(
            "INSERT INTO heartbeats (site_id, power_mode, battery_level, network_type, signal_strength, timestamp)
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(&heartbeat.site_id)
        .bind(heartbeat.power_mode.as_str())
        .bind(heartbeat.battery_level)
        .bind(&heartbeat.network_type)
        .bind(heartbeat.signal_strength)
        .bind(Utils::iso8601(&heartbeat.timestamp))
        .execute(&self.pool)
        .await?
        .last_insert_rowid();

        trace!("cached heartbeat {} for {}", id, heartbeat.site_id);

        Ok(id)
    }

    /// Up to `limit` not-yet-uploaded rows, oldest first. Rows stay pending
    /// until `mark_uploaded` is called for them.
    pub async fn drain_unuploaded(&self, table: Table, limit: u32) -> Result<Vec<CachedRow>> {
        let query = format!(
            "SELECT * FROM {} WHERE uploaded = 0 ORDER BY timestamp ASC, id ASC LIMIT $1",
            table.name()
        );

        sqlx::query(&query)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?
            .iter()
            .map(|row| Self::decode_row(table, row))
            .collect()
    }

    pub async fn mark_uploaded(&self, table: Table, id: i64) -> Result<()> {
        let query = format!("UPDATE {} SET uploaded = 1 WHERE id = $1", table.name());
        sqlx::query(&query).bind(id).execute(&self.pool).await?;

        Ok(())
    }

    /// Deletes already-uploaded rows older than `horizon` from both tables.
    /// Pending rows are never touched, whatever their age.
    pub async fn purge_uploaded_older_than(&self, horizon: DateTime<Utc>) -> Result<u64> {
        let horizon = Utils::iso8601(&horizon);
        let mut tx = self.pool.begin().await?;

        let mut deleted = 0;
        for table in [Table::Readings, Table::Heartbeats] {
            let query = format!("DELETE FROM {} WHERE uploaded = 1 AND timestamp < $1", table.name());
            deleted += sqlx::query(&query)
                .bind(&horizon)
                .execute(&mut *tx)
                .await?
                .rows_affected();
        }

        tx.commit().await?;

        if deleted > 0 {
            info!("purged {} uploaded rows older than {}", deleted, horizon);
        }

        Ok(deleted)
    }

    pub async fn stats(&self) -> Result<CacheStats> {
        let row = sqlx::query(
            "SELECT
                (SELECT COUNT(*) FROM readings WHERE uploaded = 0) AS pending_readings,
                (SELECT COUNT(*) FROM readings) AS total_readings,
                (SELECT COUNT(*) FROM heartbeats WHERE uploaded = 0) AS pending_heartbeats,
                (SELECT COUNT(*) FROM heartbeats) AS total_heartbeats,
                (SELECT MIN(ts) FROM (
                    SELECT MIN(timestamp) AS ts FROM readings WHERE uploaded = 0
                    UNION ALL
                    SELECT MIN(timestamp) AS ts FROM heartbeats WHERE uploaded = 0
                )) AS oldest_pending",
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(CacheStats {
            pending_readings: row.try_get::<i64, _>("pending_readings")? as u64,
            total_readings: row.try_get::<i64, _>("total_readings")? as u64,
            pending_heartbeats: row.try_get::<i64, _>("pending_heartbeats")? as u64,
            total_heartbeats: row.try_get::<i64, _>("total_heartbeats")? as u64,
            oldest_pending: row.try_get("oldest_pending")?,
            online: self.online(),
        })
    }

    pub async fn reading(&self, id: i64) -> Result<Option<CachedReading>> {
        match self.row(Table::Readings, id).await? {
            Some(CachedRow::Reading(r)) => Ok(Some(r)),
            _ => Ok(None),
        }
    }

    pub async fn heartbeat(&self, id: i64) -> Result<Option<CachedHeartbeat>> {
        match self.row(Table::Heartbeats, id).await? {
            Some(CachedRow::Heartbeat(h)) => Ok(Some(h)),
            _ => Ok(None),
        }
    }

    async fn row(&self, table: Table, id: i64) -> Result<Option<CachedRow>> {
        let query = format!("SELECT * FROM {} WHERE id = $1", table.name());

        sqlx::query(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .map(|row| Self::decode_row(table, &row))
            .transpose()
    }

    fn decode_row(table: Table, row: &SqliteRow) -> Result<CachedRow> {
        let r = match table {
            Table::Readings => CachedRow::Reading(CachedReading {
                id: row.try_get("id")?,
                site_id: row.try_get("site_id")?,
                sensor_id: row.try_get("sensor_id")?,
                payload: serde_json::from_str(row.try_get::<&str, _>("payload")?)?,
                timestamp: row.try_get("timestamp")?,
                uploaded: row.try_get("uploaded")?,
            }),
            Table::Heartbeats => CachedRow::Heartbeat(CachedHeartbeat {
                id: row.try_get("id")?,
                site_id: row.try_get("site_id")?,
                power_mode: Mode::from_str(row.try_get("power_mode")?)?,
                battery_level: row.try_get("battery_level")?,
                network_type: row.try_get("network_type")?,
                signal_strength: row.try_get("signal_strength")?,
                timestamp: row.try_get("timestamp")?,
                uploaded: row.try_get("uploaded")?,
            }),
        };

        Ok(r)
    }
}
