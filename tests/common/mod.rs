#![allow(dead_code)]

use solar_gateway::cache::{CachedHeartbeat, CachedReading};
use solar_gateway::coordinator::IngestRequest;
use solar_gateway::device::SimulatedReader;
use solar_gateway::error::RemoteError;
use solar_gateway::prelude::*;

use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;

pub fn common_setup() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub struct Factory;

impl Factory {
    pub fn base_config() -> Config {
        let mut config = Config::default();
        config.site_id = "S1".to_string();
        config.polling.mock = true;
        config
    }

    pub fn config() -> ConfigWrapper {
        ConfigWrapper::from_config(Self::base_config())
    }

    pub async fn cache() -> Arc<LocalCache> {
        Arc::new(LocalCache::open("sqlite::memory:").await.unwrap())
    }

    pub fn reading(sensor_id: &str, data: serde_json::Value, timestamp: Option<&str>) -> IngestRequest {
        IngestRequest {
            site_id: "S1".to_string(),
            sensor_id: sensor_id.to_string(),
            data,
            timestamp: timestamp.map(str::to_string),
        }
    }

    /// A coordinator over an in-memory cache, a connected fake publisher and
    /// no devices.
    pub async fn gateway(remote: Option<Arc<dyn RemoteStore>>) -> Gateway {
        Self::gateway_with(remote, FakePublisher::connected()).await
    }

    pub async fn gateway_with(remote: Option<Arc<dyn RemoteStore>>, publisher: Arc<FakePublisher>) -> Gateway {
        Self::build(Self::base_config(), remote, publisher, Arc::new(NoDevices)).await
    }

    /// A coordinator over the simulated inverter-1 and battery-1.
    pub async fn simulated_gateway(config: Config, remote: Option<Arc<dyn RemoteStore>>) -> Gateway {
        let reader = Arc::new(SimulatedReader::new(Vec::new()));
        Self::build(config, remote, FakePublisher::connected(), reader).await
    }

    pub async fn build(
        config: Config,
        remote: Option<Arc<dyn RemoteStore>>,
        publisher: Arc<FakePublisher>,
        reader: Arc<dyn DeviceReader>,
    ) -> Gateway {
        let config = ConfigWrapper::from_config(config);
        let (channels, inbound) = Channels::new(16);
        let cache = Self::cache().await;
        let sync = SyncEngine::new(cache.clone(), remote);

        let coordinator = Coordinator::new(
            config,
            channels.clone(),
            cache.clone(),
            sync,
            publisher.clone(),
            reader,
        );

        Gateway {
            coordinator,
            cache,
            publisher,
            channels,
            inbound: Some(inbound),
        }
    }
}

pub struct Gateway {
    pub coordinator: Coordinator,
    pub cache: Arc<LocalCache>,
    pub publisher: Arc<FakePublisher>,
    pub channels: Channels,
    pub inbound: Option<mpsc::Receiver<mqtt::Message>>,
}

impl Gateway {
    pub async fn pending_readings(&self) -> u64 {
        self.cache.stats().await.unwrap().pending_readings
    }

    pub async fn total_readings(&self) -> u64 {
        self.cache.stats().await.unwrap().total_readings
    }

    /// Runs the coordinator (receiver and pollers) in the background.
    pub fn spawn(&mut self) -> JoinHandle<Result<()>> {
        let inbound = self.inbound.take().unwrap();
        let coordinator = self.coordinator.clone();
        tokio::spawn(async move { coordinator.start(inbound).await })
    }

    /// Signals shutdown and waits for `handle` to finish cleanly.
    pub async fn shutdown(&self, handle: JoinHandle<Result<()>>) {
        self.channels.shutdown();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("task did not stop on shutdown")
            .unwrap()
            .unwrap();
    }

    pub fn telemetry_topics(&self) -> Vec<String> {
        self.publisher
            .calls()
            .into_iter()
            .map(|(topic, _)| topic)
            .filter(|topic| topic.starts_with("S1/telemetry/"))
            .collect()
    }
}

// FakePublisher {{{
#[derive(Default)]
pub struct FakePublisher {
    connected: AtomicBool,
    calls: Mutex<Vec<(String, String)>>,
}

impl FakePublisher {
    pub fn connected() -> Arc<Self> {
        let p = Self::default();
        p.connected.store(true, Ordering::SeqCst);
        Arc::new(p)
    }

    pub fn disconnected() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn publish_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn calls(&self) -> Vec<(String, String)> {
        self.calls.lock().unwrap().clone()
    }
}

impl Publisher for FakePublisher {
    fn publish(&self, topic: &str, payload: &str) -> bool {
        self.calls
            .lock()
            .unwrap()
            .push((topic.to_string(), payload.to_string()));
        self.is_connected()
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
} // }}}

// FakeRemote {{{
#[derive(Default)]
pub struct FakeRemote {
    reject: Mutex<HashSet<String>>,
    down: AtomicBool,
    delay: Option<Duration>,
    pub readings: Mutex<Vec<CachedReading>>,
    pub heartbeats: Mutex<Vec<CachedHeartbeat>>,
}

impl FakeRemote {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn slow(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay: Some(delay),
            ..Default::default()
        })
    }

    /// Rows from this sensor get a row-level rejection.
    pub fn reject_sensor(&self, sensor_id: &str) {
        self.reject.lock().unwrap().insert(sensor_id.to_string());
    }

    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    pub fn accepted_sensors(&self) -> Vec<String> {
        self.readings
            .lock()
            .unwrap()
            .iter()
            .map(|r| r.sensor_id.clone())
            .collect()
    }

    async fn check(&self) -> Result<(), RemoteError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.down.load(Ordering::SeqCst) {
            return Err(RemoteError::Connection("connection refused".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteStore for FakeRemote {
    async fn insert_reading(&self, reading: &CachedReading) -> Result<(), RemoteError> {
        self.check().await?;
        if self.reject.lock().unwrap().contains(&reading.sensor_id) {
            return Err(RemoteError::Rejected(format!("bad row {}", reading.id)));
        }
        self.readings.lock().unwrap().push(reading.clone());
        Ok(())
    }

    async fn insert_heartbeat(&self, heartbeat: &CachedHeartbeat) -> Result<(), RemoteError> {
        self.check().await?;
        self.heartbeats.lock().unwrap().push(heartbeat.clone());
        Ok(())
    }
} // }}}

pub struct NoDevices;

#[async_trait]
impl DeviceReader for NoDevices {
    fn devices(&self) -> Vec<config::Device> {
        Vec::new()
    }

    async fn read_device(&self, id: &str) -> Result<DeviceReading> {
        bail!("unknown device {}", id)
    }
}

/// Polls `f` until it returns true or a second has passed.
pub async fn eventually<F, Fut>(f: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    within(Duration::from_secs(1), f).await
}

pub async fn within<F, Fut>(limit: Duration, mut f: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..(limit.as_millis() / 10).max(1) {
        if f().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}
