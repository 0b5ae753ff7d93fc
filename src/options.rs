use clap::Parser;

/// Solar Gateway - offline-first edge data plane for a solar site
#[derive(Debug, Default, Parser)]
#[clap(author, version)]
pub struct Options {
    /// Config file to read (defaults to config.yaml if present)
    #[clap(short = 'c', long = "config", env = "GATEWAY_CONFIG")]
    pub config_file: Option<String>,

    /// Optional runtime limit in seconds
    #[clap(short = 't', long = "time")]
    pub runtime: Option<u64>,

    #[clap(long, env = "SITE_ID")]
    pub site_id: Option<String>,

    /// mqtt://[user:pass@]host[:port]
    #[clap(long, env = "MQTT_BROKER_URL")]
    pub mqtt_broker_url: Option<String>,

    #[clap(long, env = "MQTT_USERNAME")]
    pub mqtt_username: Option<String>,

    #[clap(long, env = "MQTT_PASSWORD", hide_env_values = true)]
    pub mqtt_password: Option<String>,

    #[clap(long, env = "REMOTE_STORE_URL")]
    pub remote_store_url: Option<String>,

    #[clap(long, env = "REMOTE_STORE_KEY", hide_env_values = true)]
    pub remote_store_key: Option<String>,

    /// Simulate devices instead of polling the field bus
    #[clap(long, env = "MOCK_DEVICES")]
    pub mock_devices: Option<bool>,

    #[clap(long, env = "CACHE_URL")]
    pub cache_url: Option<String>,

    #[clap(long, env = "LOG_LEVEL")]
    pub log_level: Option<String>,
}

impl Options {
    pub const DEFAULT_CONFIG_FILE: &'static str = "config.yaml";

    pub fn new() -> Self {
        Self::parse()
    }
}
