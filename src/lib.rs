pub mod cache;
pub mod channels;
pub mod command;
pub mod config;
pub mod coordinator;
pub mod device;
pub mod error;
pub mod heartbeat;
pub mod mode;
pub mod mqtt;
pub mod options;
pub mod poller;
pub mod prelude;
pub mod register;
pub mod remote;
pub mod scheduler;
pub mod sync;
pub mod utils;

const CARGO_PKG_VERSION: &str = env!("CARGO_PKG_VERSION");

use crate::device::{ModbusReader, SimulatedReader};
use crate::heartbeat::HeartbeatMonitor;
use crate::mqtt::Mqtt;
use crate::prelude::*;
use crate::remote::RestStore;
use crate::scheduler::Scheduler;

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Everything `app` started, so it can be stopped in order.
pub struct Components {
    pub coordinator: Coordinator,
    pub heartbeat: Arc<HeartbeatMonitor>,
    pub cache: Arc<LocalCache>,
    pub channels: Channels,
    pub handles: Vec<(&'static str, JoinHandle<Result<()>>)>,
}

impl Components {
    /// Heartbeats first so nothing new is written, then every loop via the
    /// shutdown broadcast, and the cache last.
    pub async fn stop(self) {
        info!("Stopping all components...");

        if let Err(err) = self.heartbeat.stop().await {
            error!("stopping heartbeat: {}", err);
        }

        self.channels.shutdown();

        for (name, handle) in self.handles {
            match handle.await {
                Ok(Ok(())) => debug!("{} stopped", name),
                Ok(Err(err)) => error!("{} task failed: {:#}", name, err),
                Err(err) => error!("Error waiting for {} task: {}", name, err),
            }
        }

        self.coordinator.stop();
        self.cache.close().await;

        info!("Shutdown complete");
    }
}

/// Safe to call more than once; only the first call installs the logger.
pub fn init_logging(level: &str) {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format(|buf, record| {
            writeln!(
                buf,
                "[{} {} {}] {}",
                chrono::Local::now().format("%Y-%m-%dT%H:%M:%S%.3f"),
                record.level(),
                record.module_path().unwrap_or(""),
                record.args()
            )
        })
        .write_style(env_logger::WriteStyle::Never)
        .try_init();
}

pub async fn app(options: Options) -> Result<()> {
    let config = ConfigWrapper::new(&options)?;

    init_logging(&config.loglevel());
    info!("solar-gateway {} starting", CARGO_PKG_VERSION);
    config.log_summary();

    let components = start(config, options.runtime).await?;
    let mut shutdown = components.channels.shutdown.subscribe();

    let limit = async {
        match options.runtime {
            Some(secs) => tokio::time::sleep(Duration::from_secs(secs)).await,
            None => std::future::pending().await,
        }
    };

    tokio::select! {
        res = tokio::signal::ctrl_c() => {
            if let Err(err) = res {
                error!("Failed to listen for ctrl+c: {}", err);
            }
            info!("Shutdown signal received, stopping components...");
        }
        _ = limit => info!("runtime limit reached, stopping components..."),
        _ = shutdown.recv() => {}
    }

    components.stop().await;

    Ok(())
}

async fn start(config: ConfigWrapper, runtime: Option<u64>) -> Result<Components> {
    if let Some(secs) = runtime {
        info!("will run for {}s", secs);
    }

    info!("Initializing components...");

    let (channels, inbound) = Channels::new(config.mqtt().inbound_capacity);

    info!("  Opening LocalCache...");
    let cache = Arc::new(LocalCache::open(&config.cache().url).await?);

    info!("  Creating SyncEngine...");
    let remote: Option<Arc<dyn RemoteStore>> = match RestStore::from_config(&config.remote())? {
        Some(store) => Some(Arc::new(store)),
        None => {
            warn!("remote store not configured, cached data will stay local");
            None
        }
    };
    let sync = SyncEngine::new(cache.clone(), remote);

    info!("  Creating DeviceReader...");
    let polling = config.polling();
    let reader: Arc<dyn DeviceReader> = if polling.mock {
        Arc::new(SimulatedReader::new(config.devices()))
    } else {
        Arc::new(ModbusReader::connect(config.devices(), polling.read_timeout).await)
    };

    info!("  Creating MQTT client...");
    let mqtt = Arc::new(Mqtt::new(config.clone(), channels.clone()));

    info!("  Creating Coordinator...");
    let coordinator = Coordinator::new(
        config.clone(),
        channels.clone(),
        cache.clone(),
        sync,
        mqtt.clone(),
        reader,
    );

    let mut handles: Vec<(&'static str, JoinHandle<Result<()>>)> = Vec::new();

    let m = mqtt.clone();
    handles.push(("mqtt", tokio::spawn(async move { m.start().await })));

    let c = coordinator.clone();
    handles.push(("coordinator", tokio::spawn(async move { c.start(inbound).await })));

    info!("  Creating Scheduler...");
    let scheduler = Scheduler::new(config.clone(), coordinator.clone());
    handles.push(("scheduler", tokio::spawn(async move { scheduler.start().await })));

    let heartbeat = Arc::new(HeartbeatMonitor::new(coordinator.clone()));
    if config.heartbeat().enabled {
        heartbeat.start()?;
    }

    info!("Components started");

    Ok(Components {
        coordinator,
        heartbeat,
        cache,
        channels,
        handles,
    })
}
