use crate::cache::NewHeartbeat;
use crate::command::Command;
use crate::mqtt::Inbound;
use crate::poller::Poller;
use crate::prelude::*;

use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestRequest {
    pub site_id: String,
    pub sensor_id: String,
    pub data: serde_json::Value,
    #[serde(default)]
    pub timestamp: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    pub site_id: String,
    pub power_mode: Mode,
    pub battery_level: Option<f64>,
    pub network_type: String,
    pub signal_strength: Option<i64>,
    #[serde(default)]
    pub timestamp: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct IngestOutcome {
    pub id: i64,
    pub published: bool,
}

#[derive(Debug, Serialize)]
pub struct ModeTransition {
    pub previous: Mode,
    pub current: Mode,
    pub sync_triggered: bool,
    /// The catch-up sync pass started by this transition, if any.
    #[serde(skip)]
    pub sync: Option<JoinHandle<SyncResult>>,
}

/// Last-known conditions at the site, reported with every heartbeat.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SiteConditions {
    pub battery_level: Option<f64>,
    pub network_type: String,
    pub signal_strength: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct GatewayStats {
    pub readings_cached: u64,
    pub heartbeats_cached: u64,
    pub published: u64,
    pub publish_failed: u64,
    pub publish_skipped: u64,
    pub messages_received: u64,
    pub messages_rejected: u64,
    pub sync_passes: u64,
    pub rows_uploaded: u64,
}

impl GatewayStats {
    pub fn print_summary(&self) {
        info!("Gateway Statistics:");
        info!("  Cache:");
        info!("    Readings cached: {}", self.readings_cached);
        info!("    Heartbeats cached: {}", self.heartbeats_cached);
        info!("  MQTT:");
        info!("    Published: {}", self.published);
        info!("    Failed: {}", self.publish_failed);
        info!("    Skipped (offline): {}", self.publish_skipped);
        info!("    Messages received: {}", self.messages_received);
        info!("    Messages rejected: {}", self.messages_rejected);
        info!("  Sync:");
        info!("    Passes: {}", self.sync_passes);
        info!("    Rows uploaded: {}", self.rows_uploaded);
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct GatewayStatus {
    pub site_id: String,
    pub mode: Mode,
    pub mqtt_connected: bool,
    pub remote_configured: bool,
    pub devices: Vec<String>,
    pub heartbeat_running: bool,
    pub conditions: SiteConditions,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache: Option<CacheStats>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_error: Option<String>,
    pub stats: GatewayStats,
}

enum Record {
    Reading {
        site_id: String,
        sensor_id: String,
        data: serde_json::Value,
        timestamp: String,
    },
    Heartbeat(NewHeartbeat),
}

/// Owns the operating mode and wires device readings and inbound messages
/// into the cache, the broker and the sync engine.
#[derive(Clone)]
pub struct Coordinator {
    config: ConfigWrapper,
    channels: Channels,
    cache: Arc<LocalCache>,
    sync: SyncEngine,
    publisher: Arc<dyn Publisher>,
    reader: Arc<dyn DeviceReader>,
    mode: Arc<watch::Sender<Mode>>,
    conditions: Arc<Mutex<SiteConditions>>,
    heartbeat_running: Arc<AtomicBool>,
    pub stats: Arc<Mutex<GatewayStats>>,
}

impl Coordinator {
    pub fn new(
        config: ConfigWrapper,
        channels: Channels,
        cache: Arc<LocalCache>,
        sync: SyncEngine,
        publisher: Arc<dyn Publisher>,
        reader: Arc<dyn DeviceReader>,
    ) -> Self {
        let mode = config.initial_mode();
        cache.set_online(mode.transmits());

        let conditions = SiteConditions {
            network_type: config.heartbeat().network_type,
            ..Default::default()
        };

        Self {
            config,
            channels,
            cache,
            sync,
            publisher,
            reader,
            mode: Arc::new(watch::channel(mode).0),
            conditions: Arc::new(Mutex::new(conditions)),
            heartbeat_running: Arc::new(AtomicBool::new(false)),
            stats: Arc::new(Mutex::new(GatewayStats::default())),
        }
    }

    pub async fn start(&self, inbound: mpsc::Receiver<mqtt::Message>) -> Result<()> {
        let pollers = self
            .reader
            .devices()
            .into_iter()
            .map(|device| Poller::new(self.clone(), device.id().to_string()))
            .collect::<Vec<_>>();

        info!("coordinator starting with {} device poller(s)", pollers.len());

        futures::try_join!(
            self.mqtt_receiver(inbound),
            futures::future::try_join_all(pollers.iter().map(|p| p.start()))
        )?;

        Ok(())
    }

    pub fn stop(&self) {
        if let Ok(stats) = self.stats.lock() {
            stats.print_summary();
        }
    }

    pub fn config(&self) -> &ConfigWrapper {
        &self.config
    }

    pub fn channels(&self) -> &Channels {
        &self.channels
    }

    pub fn reader(&self) -> &Arc<dyn DeviceReader> {
        &self.reader
    }

    // Mode {{{
    pub fn mode(&self) -> Mode {
        *self.mode.borrow()
    }

    pub fn subscribe_mode(&self) -> watch::Receiver<Mode> {
        self.mode.subscribe()
    }

    /// Switches mode. Moving into a transmitting mode from a different mode
    /// spawns one sync pass; the transition does not wait for it. Must be
    /// called from within the runtime.
    pub fn set_mode(&self, mode: Mode) -> ModeTransition {
        let previous = self.mode.send_replace(mode);
        self.cache.set_online(mode.transmits());

        if previous == mode {
            debug!("mode already {}", mode);
            return ModeTransition {
                previous,
                current: mode,
                sync_triggered: false,
                sync: None,
            };
        }

        info!("mode {} -> {}", previous, mode);

        let sync = mode.transmits().then(|| {
            let this = self.clone();
            tokio::spawn(async move { this.sync_cached_data().await })
        });

        ModeTransition {
            previous,
            current: mode,
            sync_triggered: sync.is_some(),
            sync,
        }
    }

    pub fn set_mode_str(&self, mode: &str) -> Result<ModeTransition> {
        Ok(self.set_mode(Mode::from_str(mode)?))
    } // }}}

    // Ingest {{{
    /// Caches the reading, then publishes it if the mode allows.
    pub async fn ingest_data(&self, request: IngestRequest) -> Result<IngestOutcome> {
        let timestamp = match &request.timestamp {
            Some(ts) => Utils::normalize_timestamp(ts)?,
            None => Utils::now_iso8601(),
        };

        self.store_and_forward(Record::Reading {
            site_id: request.site_id,
            sensor_id: request.sensor_id,
            data: request.data,
            timestamp,
        })
        .await
    }

    pub async fn record_heartbeat(&self, request: HeartbeatRequest) -> Result<IngestOutcome> {
        let timestamp = match &request.timestamp {
            Some(ts) => Utils::parse_timestamp(ts)?,
            None => Utils::utc(),
        };

        self.store_and_forward(Record::Heartbeat(NewHeartbeat {
            site_id: request.site_id,
            power_mode: request.power_mode,
            battery_level: request.battery_level,
            network_type: request.network_type,
            signal_strength: request.signal_strength,
            timestamp,
        }))
        .await
    }

    /// A heartbeat for this site from the current mode and site conditions.
    pub async fn record_current_heartbeat(&self) -> Result<IngestOutcome> {
        let conditions = self.conditions();

        self.record_heartbeat(HeartbeatRequest {
            site_id: self.config.site_id(),
            power_mode: self.mode(),
            battery_level: conditions.battery_level,
            network_type: conditions.network_type,
            signal_strength: conditions.signal_strength,
            timestamp: None,
        })
        .await
    }

    pub async fn ingest_device_reading(&self, reading: &DeviceReading) -> Result<IngestOutcome> {
        if let Some(level) = reading.battery_level() {
            if let Ok(mut conditions) = self.conditions.lock() {
                conditions.battery_level = Some(level);
            }
        }

        self.ingest_data(IngestRequest {
            site_id: self.config.site_id(),
            sensor_id: reading.device_id.clone(),
            data: reading.to_payload(),
            timestamp: Some(reading.timestamp.clone()),
        })
        .await
    }

    pub async fn read_devices(&self) -> Result<Vec<DeviceReading>> {
        let readings = self.reader.read_all_devices().await;
        for reading in &readings {
            self.ingest_device_reading(reading).await?;
        }
        Ok(readings)
    }

    // the one path both readings and heartbeats take: cache first, the cache
    // insert error (if any) goes straight back to the caller
    async fn store_and_forward(&self, record: Record) -> Result<IngestOutcome> {
        let mode = self.mode();

        let (id, topic, payload) = match record {
            Record::Reading {
                site_id,
                sensor_id,
                data,
                timestamp,
            } => {
                let id = self
                    .cache
                    .insert_reading(&site_id, &sensor_id, &data, &timestamp)
                    .await?;
                self.count(|s| s.readings_cached += 1);

                let payload = json!({
                    "site_id": site_id,
                    "sensor_id": sensor_id,
                    "data": data,
                    "timestamp": timestamp,
                });
                (id, mqtt::telemetry_topic(&site_id, &sensor_id), payload)
            }
            Record::Heartbeat(heartbeat) => {
                let id = self.cache.insert_heartbeat(&heartbeat).await?;
                self.count(|s| s.heartbeats_cached += 1);

                let payload = json!({
                    "site_id": heartbeat.site_id,
                    "power_mode": heartbeat.power_mode,
                    "battery_level": heartbeat.battery_level,
                    "network_type": heartbeat.network_type,
                    "signal_strength": heartbeat.signal_strength,
                    "timestamp": Utils::iso8601(&heartbeat.timestamp),
                });
                (id, mqtt::heartbeat_topic(&heartbeat.site_id), payload)
            }
        };

        let published = self.forward(mode, &topic, &payload);

        Ok(IngestOutcome { id, published })
    }

    fn forward(&self, mode: Mode, topic: &str, payload: &serde_json::Value) -> bool {
        if !mode.transmits() {
            trace!("offline, not publishing to {}", topic);
            self.count(|s| s.publish_skipped += 1);
            return false;
        }

        let sent = self.publisher.publish(topic, &payload.to_string());
        if sent {
            self.count(|s| s.published += 1);
        } else {
            self.count(|s| s.publish_failed += 1);
            match mode {
                Mode::LowPower => debug!("best-effort publish to {} dropped", topic),
                _ => warn!("publish to {} failed, data remains cached", topic),
            }
        }

        sent
    } // }}}

    // Sync & cache {{{
    pub async fn sync_cached_data(&self) -> SyncResult {
        let result = self.sync.sync_cached_data().await;
        self.count(|s| {
            s.sync_passes += 1;
            s.rows_uploaded += result.uploaded;
        });
        result
    }

    pub async fn drain_backlog(&self, max_passes: u32) -> SyncResult {
        let (result, passes) = self.sync.drain_backlog(max_passes).await;
        self.count(|s| {
            s.sync_passes += passes as u64;
            s.rows_uploaded += result.uploaded;
        });
        result
    }

    pub async fn cache_stats(&self) -> Result<CacheStats> {
        self.cache.stats().await
    }

    /// Drops uploaded history older than the retention period.
    pub async fn purge(&self) -> Result<u64> {
        let cache = self.config.cache();
        let horizon = Utils::utc()
            .checked_sub_signed(cache.retention())
            .ok_or_else(|| anyhow!("retention of {} days is out of range", cache.retention_days))?;
        self.cache.purge_uploaded_older_than(horizon).await
    } // }}}

    // Status {{{
    pub fn conditions(&self) -> SiteConditions {
        self.conditions.lock().map(|c| c.clone()).unwrap_or_default()
    }

    /// Fed by `network_type` / `signal_strength` in site config messages.
    pub fn update_network(&self, network_type: &str, signal_strength: Option<i64>) {
        if let Ok(mut conditions) = self.conditions.lock() {
            conditions.network_type = network_type.to_string();
            conditions.signal_strength = signal_strength;
        }
    }

    pub fn set_heartbeat_running(&self, running: bool) {
        self.heartbeat_running.store(running, Ordering::Release);
    }

    pub async fn status(&self) -> GatewayStatus {
        let (cache, cache_error) = match self.cache.stats().await {
            Ok(stats) => (Some(stats), None),
            Err(err) => (None, Some(err.to_string())),
        };

        GatewayStatus {
            site_id: self.config.site_id(),
            mode: self.mode(),
            mqtt_connected: self.publisher.is_connected(),
            remote_configured: self.sync.configured(),
            devices: self.reader.devices().iter().map(|d| d.id().to_string()).collect(),
            heartbeat_running: self.heartbeat_running.load(Ordering::Acquire),
            conditions: self.conditions(),
            cache,
            cache_error,
            stats: self.stats.lock().map(|s| s.clone()).unwrap_or_default(),
        }
    }

    fn count(&self, f: impl FnOnce(&mut GatewayStats)) {
        if let Ok(mut stats) = self.stats.lock() {
            f(&mut stats);
        }
    } // }}}

    // Inbound {{{
    async fn mqtt_receiver(&self, mut inbound: mpsc::Receiver<mqtt::Message>) -> Result<()> {
        let mut shutdown = self.channels.shutdown.subscribe();

        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                message = inbound.recv() => match message {
                    Some(message) => {
                        if let Err(err) = self.process_message(message).await {
                            self.count(|s| s.messages_rejected += 1);
                            warn!("{:#}", err);
                        }
                    }
                    None => break,
                },
            }
        }

        info!("coordinator receiver exiting");
        Ok(())
    }

    async fn process_message(&self, message: mqtt::Message) -> Result<()> {
        self.count(|s| s.messages_received += 1);

        match message.to_inbound(&self.config.site_id())? {
            Inbound::Data(request) => {
                self.ingest_data(request).await?;
            }
            Inbound::Command(command) => {
                info!("parsed command {:?}", command);
                let reply = match self.process_command(&command).await {
                    Ok(result) => json!({ "success": true, "result": result }),
                    Err(err) => {
                        warn!("command {} failed: {}", command.name(), err);
                        json!({ "success": false, "error": err.to_string() })
                    }
                };
                if self.mode().transmits() {
                    let topic = command.to_result_topic(&self.config.site_id());
                    self.publisher.publish(&topic, &reply.to_string());
                }
            }
            Inbound::Config(update) => {
                self.config.apply_update(&update)?;
                if update.network_changed() {
                    let current = self.conditions();
                    self.update_network(
                        update.network_type.as_deref().unwrap_or(&current.network_type),
                        update.signal_strength.or(current.signal_strength),
                    );
                }
            }
        }

        Ok(())
    }

    async fn process_command(&self, command: &Command) -> Result<serde_json::Value> {
        use Command::*;

        let result = match command {
            SetMode { mode } => serde_json::to_value(self.set_mode_str(mode)?)?,
            Sync => serde_json::to_value(self.sync_cached_data().await)?,
            ReadDevices => json!({ "readings": self.read_devices().await? }),
            Heartbeat => serde_json::to_value(self.record_current_heartbeat().await?)?,
            Purge => json!({ "purged": self.purge().await? }),
        };

        Ok(result)
    } // }}}
}
