use crate::prelude::*;
use crate::register::RegisterMap;

use serde_with::{serde_as, DurationSeconds};
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    pub site_id: String,
    pub loglevel: String,
    pub initial_mode: Mode,

    pub mqtt: Mqtt,
    pub remote: Remote,
    pub cache: Cache,
    pub polling: Polling,
    pub heartbeat: Heartbeat,
    pub sync: SyncSchedule,

    pub devices: Vec<Device>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            site_id: Config::default_site_id(),
            loglevel: Config::default_loglevel(),
            initial_mode: Mode::Normal,
            mqtt: Mqtt::default(),
            remote: Remote::default(),
            cache: Cache::default(),
            polling: Polling::default(),
            heartbeat: Heartbeat::default(),
            sync: SyncSchedule::default(),
            devices: Vec::new(),
        }
    }
}

// Device {{{
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceClass {
    Inverter,
    Battery,
}

impl std::fmt::Display for DeviceClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceClass::Inverter => write!(f, "inverter"),
            DeviceClass::Battery => write!(f, "battery"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(tag = "transport", rename_all = "snake_case")]
pub enum Connection {
    Tcp {
        host: String,
        #[serde(default = "Config::default_modbus_port")]
        port: u16,
        #[serde(default = "Config::default_unit_id")]
        unit_id: u8,
    },
    Rtu {
        path: String,
        #[serde(default = "Config::default_baud_rate")]
        baud_rate: u32,
        #[serde(default = "Config::default_unit_id")]
        unit_id: u8,
    },
}

impl std::fmt::Display for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Connection::Tcp { host, port, unit_id } => write!(f, "tcp://{}:{} (unit {})", host, port, unit_id),
            Connection::Rtu { path, baud_rate, unit_id } => write!(f, "rtu://{}@{} (unit {})", path, baud_rate, unit_id),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct Device {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub class: DeviceClass,
    pub connection: Option<Connection>,
    #[serde(default)]
    pub registers: RegisterMap,
}
impl Device {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        if self.name.is_empty() {
            &self.id
        } else {
            &self.name
        }
    }

    pub fn class(&self) -> DeviceClass {
        self.class
    }

    pub fn connection(&self) -> Option<&Connection> {
        self.connection.as_ref()
    }

    pub fn registers(&self) -> &RegisterMap {
        &self.registers
    }
} // }}}

// Mqtt {{{
#[serde_as]
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Mqtt {
    pub enabled: bool,

    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,

    pub namespace: String,

    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(rename = "reconnect_delay_secs")]
    pub reconnect_delay: Duration,

    pub inbound_capacity: usize,
}

impl Default for Mqtt {
    fn default() -> Self {
        Self {
            enabled: true,
            host: "localhost".to_string(),
            port: 1883,
            username: None,
            password: None,
            namespace: "solar".to_string(),
            reconnect_delay: Duration::from_secs(5),
            inbound_capacity: 256,
        }
    }
}

impl Mqtt {
    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn username(&self) -> &Option<String> {
        &self.username
    }

    pub fn password(&self) -> &Option<String> {
        &self.password
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }
} // }}}

// Remote {{{
#[serde_as]
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Remote {
    pub url: Option<String>,
    pub key: Option<String>,

    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(rename = "timeout_secs")]
    pub timeout: Duration,
}

impl Default for Remote {
    fn default() -> Self {
        Self {
            url: None,
            key: None,
            timeout: Duration::from_secs(10),
        }
    }
}

impl Remote {
    /// Both halves of the credentials are present; without them the gateway
    /// has no write-capable remote connection.
    pub fn configured(&self) -> bool {
        matches!((&self.url, &self.key), (Some(u), Some(k)) if !u.is_empty() && !k.is_empty())
    }
} // }}}

// Cache {{{
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Cache {
    pub url: String,
    pub retention_days: u32,
    pub purge_cron: String,
}

impl Default for Cache {
    fn default() -> Self {
        Self {
            url: "sqlite://gateway-cache.db".to_string(),
            retention_days: 7,
            purge_cron: "0 * * * *".to_string(),
        }
    }
}

impl Cache {
    pub const MAX_RETENTION_DAYS: u32 = 36_500;

    pub fn retention(&self) -> chrono::Duration {
        chrono::Duration::days(self.retention_days as i64)
    }
} // }}}

// Polling {{{
#[serde_as]
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Polling {
    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(rename = "interval_secs")]
    pub interval: Duration,

    pub low_power_multiplier: u32,
    pub offline_multiplier: u32,

    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(rename = "read_timeout_secs")]
    pub read_timeout: Duration,

    pub mock: bool,
}

impl Default for Polling {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            low_power_multiplier: 3,
            offline_multiplier: 6,
            read_timeout: Duration::from_secs(5),
            mock: false,
        }
    }
}

impl Polling {
    pub const MAX_MULTIPLIER: u32 = 1000;

    pub fn interval_for(&self, mode: Mode) -> Duration {
        let multiplier = match mode {
            Mode::Normal => 1,
            Mode::LowPower => self.low_power_multiplier,
            Mode::Offline => self.offline_multiplier,
        };
        self.interval.saturating_mul(multiplier)
    }
} // }}}

// Heartbeat {{{
#[serde_as]
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Heartbeat {
    pub enabled: bool,

    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(rename = "interval_secs")]
    pub interval: Duration,

    pub network_type: String,
}

impl Default for Heartbeat {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(60),
            network_type: "unknown".to_string(),
        }
    }
} // }}}

// Sync {{{
#[serde_as]
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct SyncSchedule {
    pub enabled: bool,

    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(rename = "interval_secs")]
    pub interval: Duration,

    pub max_passes: u32,
}

impl Default for SyncSchedule {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(300),
            max_passes: 10,
        }
    }
} // }}}

/// Runtime adjustments received on the site config topic.
#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigUpdate {
    pub poll_interval_secs: Option<u64>,
    pub heartbeat_interval_secs: Option<u64>,
    pub low_power_multiplier: Option<u32>,
    pub offline_multiplier: Option<u32>,
    pub network_type: Option<String>,
    pub signal_strength: Option<i64>,
}

impl ConfigUpdate {
    pub fn network_changed(&self) -> bool {
        self.network_type.is_some() || self.signal_strength.is_some()
    }

    fn check(&self) -> Result<()> {
        for (name, secs) in [
            ("poll_interval_secs", self.poll_interval_secs),
            ("heartbeat_interval_secs", self.heartbeat_interval_secs),
        ] {
            if let Some(secs) = secs {
                Config::check_interval(name, Duration::from_secs(secs))?;
            }
        }
        for (name, m) in [
            ("low_power_multiplier", self.low_power_multiplier),
            ("offline_multiplier", self.offline_multiplier),
        ] {
            if let Some(m) = m {
                Config::check_multiplier(name, m)?;
            }
        }
        if self.network_type.as_deref().is_some_and(|t| t.trim().is_empty()) {
            bail!("network_type cannot be empty");
        }

        Ok(())
    }
}

pub struct ConfigWrapper {
    config: Arc<Mutex<Config>>,
}

impl Clone for ConfigWrapper {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
        }
    }
}

impl ConfigWrapper {
    pub fn new(options: &Options) -> Result<Self> {
        Ok(Self::from_config(Config::from_options(options)?))
    }

    pub fn from_config(config: Config) -> Self {
        Self {
            config: Arc::new(Mutex::new(config)),
        }
    }

    // a panic while holding the lock cannot leave Config half-written, every
    // mutation below is a plain field store
    fn lock(&self) -> MutexGuard<'_, Config> {
        self.config.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn site_id(&self) -> String {
        self.lock().site_id.clone()
    }

    pub fn loglevel(&self) -> String {
        self.lock().loglevel.clone()
    }

    pub fn initial_mode(&self) -> Mode {
        self.lock().initial_mode
    }

    pub fn mqtt(&self) -> Mqtt {
        self.lock().mqtt.clone()
    }

    pub fn remote(&self) -> Remote {
        self.lock().remote.clone()
    }

    pub fn cache(&self) -> Cache {
        self.lock().cache.clone()
    }

    pub fn polling(&self) -> Polling {
        self.lock().polling.clone()
    }

    pub fn poll_interval(&self, mode: Mode) -> Duration {
        self.lock().polling.interval_for(mode)
    }

    pub fn heartbeat(&self) -> Heartbeat {
        self.lock().heartbeat.clone()
    }

    pub fn sync(&self) -> SyncSchedule {
        self.lock().sync.clone()
    }

    pub fn devices(&self) -> Vec<Device> {
        self.lock().devices.clone()
    }

    pub fn log_summary(&self) {
        self.lock().log_summary()
    }

    /// All-or-nothing: an update with any out-of-range value changes nothing.
    pub fn apply_update(&self, update: &ConfigUpdate) -> Result<()> {
        update.check()?;

        let mut config = self.lock();
        if let Some(secs) = update.poll_interval_secs {
            info!("poll interval now {}s", secs);
            config.polling.interval = Duration::from_secs(secs);
        }
        if let Some(secs) = update.heartbeat_interval_secs {
            info!("heartbeat interval now {}s", secs);
            config.heartbeat.interval = Duration::from_secs(secs);
        }
        if let Some(m) = update.low_power_multiplier {
            info!("low_power polling multiplier now {}", m);
            config.polling.low_power_multiplier = m;
        }
        if let Some(m) = update.offline_multiplier {
            info!("offline polling multiplier now {}", m);
            config.polling.offline_multiplier = m;
        }
        if let Some(network_type) = &update.network_type {
            info!("network type now {}", network_type);
            config.heartbeat.network_type = network_type.clone();
        }

        Ok(())
    }
}

impl Config {
    /// Longest accepted polling, heartbeat or sync interval.
    pub const MAX_INTERVAL: Duration = Duration::from_secs(86_400);

    pub fn new(file: &str) -> Result<Self> {
        info!("Reading configuration from {}", file);
        let content = std::fs::read_to_string(file)
            .map_err(|err| anyhow!("error reading {}: {}", file, err))?;

        Ok(serde_yaml::from_str(&content)?)
    }

    /// Config file (or built-in defaults when no file is given and the default
    /// one does not exist), then environment/command line overrides.
    pub fn from_options(options: &Options) -> Result<Self> {
        let mut config = match &options.config_file {
            Some(file) => Self::new(file)?,
            None if std::path::Path::new(Options::DEFAULT_CONFIG_FILE).exists() => {
                Self::new(Options::DEFAULT_CONFIG_FILE)?
            }
            None => {
                info!("no config file, using defaults");
                Self::default()
            }
        };

        config.apply_overrides(options)?;
        config.validate()?;

        Ok(config)
    }

    pub fn apply_overrides(&mut self, options: &Options) -> Result<()> {
        if let Some(site_id) = &options.site_id {
            self.site_id = site_id.clone();
        }

        if let Some(broker) = &options.mqtt_broker_url {
            let url = url::Url::parse(broker)
                .map_err(|err| anyhow!("invalid MQTT broker URL {}: {}", broker, err))?;
            self.mqtt.enabled = true;
            self.mqtt.host = url
                .host_str()
                .ok_or_else(|| anyhow!("MQTT broker URL {} has no host", broker))?
                .to_string();
            self.mqtt.port = url.port().unwrap_or_else(|| match url.scheme() {
                "mqtts" | "ssl" => 8883,
                _ => 1883,
            });
            if !url.username().is_empty() {
                self.mqtt.username = Some(url.username().to_string());
            }
            if let Some(password) = url.password() {
                self.mqtt.password = Some(password.to_string());
            }
        }
        if let Some(username) = &options.mqtt_username {
            self.mqtt.username = Some(username.clone());
        }
        if let Some(password) = &options.mqtt_password {
            self.mqtt.password = Some(password.clone());
        }

        if let Some(url) = &options.remote_store_url {
            self.remote.url = Some(url.clone());
        }
        if let Some(key) = &options.remote_store_key {
            self.remote.key = Some(key.clone());
        }

        if let Some(url) = &options.cache_url {
            self.cache.url = url.clone();
        }
        if let Some(mock) = options.mock_devices {
            self.polling.mock = mock;
        }
        if let Some(level) = &options.log_level {
            self.loglevel = level.clone();
        }

        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.site_id.trim().is_empty() {
            bail!("site_id cannot be empty");
        }

        if self.mqtt.enabled {
            if self.mqtt.port == 0 {
                bail!("mqtt.port must be between 1 and 65535");
            }
            if self.mqtt.host.is_empty() {
                bail!("mqtt.host cannot be empty");
            }
            if self.mqtt.inbound_capacity == 0 {
                bail!("mqtt.inbound_capacity must be greater than zero");
            }
        }

        if let Some(u) = &self.remote.url {
            if let Err(e) = url::Url::parse(u) {
                bail!("invalid remote store URL {}: {}", u, e);
            }
        }

        Self::check_interval("polling.interval_secs", self.polling.interval)?;
        Self::check_interval("polling.read_timeout_secs", self.polling.read_timeout)?;
        Self::check_interval("heartbeat.interval_secs", self.heartbeat.interval)?;
        Self::check_interval("sync.interval_secs", self.sync.interval)?;
        Self::check_multiplier("polling.low_power_multiplier", self.polling.low_power_multiplier)?;
        Self::check_multiplier("polling.offline_multiplier", self.polling.offline_multiplier)?;

        if self.cache.retention_days > Cache::MAX_RETENTION_DAYS {
            bail!(
                "cache.retention_days must be at most {}, got {}",
                Cache::MAX_RETENTION_DAYS,
                self.cache.retention_days
            );
        }

        if let Err(e) = cron_parser::parse(&self.cache.purge_cron, &chrono::Utc::now()) {
            bail!("invalid cache.purge_cron {:?}: {:?}", self.cache.purge_cron, e);
        }

        let mut seen = HashSet::new();
        for device in &self.devices {
            if device.id.is_empty() {
                bail!("device id cannot be empty");
            }
            if !seen.insert(device.id.as_str()) {
                bail!("duplicate device id {}", device.id);
            }
            for (field, register) in &device.registers {
                if !register.scale.is_finite() || register.scale == 0.0 {
                    bail!("device {} register {} has invalid scale {}", device.id, field, register.scale);
                }
            }
        }

        Ok(())
    }

    pub fn log_summary(&self) {
        info!("Configuration loaded successfully:");
        info!("  Site: {}", self.site_id);
        info!("  Initial mode: {}", self.initial_mode);
        info!("  MQTT: {}", if self.mqtt.enabled { "enabled" } else { "disabled" });
        if self.mqtt.enabled {
            info!("    Host: {}", self.mqtt.host);
            info!("    Port: {}", self.mqtt.port);
            info!("    Namespace: {}", self.mqtt.namespace);
        }
        info!("  Remote store: {}", self.remote.url.as_deref().unwrap_or("not configured"));
        info!("  Cache: {} (retention {} days)", self.cache.url, self.cache.retention_days);
        info!(
            "  Polling: every {}s (x{} low_power, x{} offline), {}",
            self.polling.interval.as_secs(),
            self.polling.low_power_multiplier,
            self.polling.offline_multiplier,
            if self.polling.mock { "simulated" } else { "live" }
        );
        info!("  Devices: {} configured", self.devices.len());
        for device in &self.devices {
            info!(
                "    {} ({}, {}): {} registers via {}",
                device.id,
                device.name(),
                device.class,
                device.registers.len(),
                device.connection.as_ref().map(|c| c.to_string()).unwrap_or_else(|| "no transport".to_string())
            );
        }
    }

    fn check_interval(name: &str, interval: Duration) -> Result<()> {
        if interval.is_zero() || interval > Self::MAX_INTERVAL {
            bail!(
                "{} must be between 1 and {} seconds, got {}",
                name,
                Self::MAX_INTERVAL.as_secs(),
                interval.as_secs()
            );
        }
        Ok(())
    }

    fn check_multiplier(name: &str, multiplier: u32) -> Result<()> {
        if multiplier == 0 || multiplier > Polling::MAX_MULTIPLIER {
            bail!("{} must be between 1 and {}, got {}", name, Polling::MAX_MULTIPLIER, multiplier);
        }
        Ok(())
    }

    fn default_site_id() -> String {
        "site-1".to_string()
    }

    fn default_loglevel() -> String {
        "info".to_string()
    }

    fn default_modbus_port() -> u16 {
        502
    }

    fn default_unit_id() -> u8 {
        1
    }

    fn default_baud_rate() -> u32 {
        9600
    }
}
