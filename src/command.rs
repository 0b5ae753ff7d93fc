use crate::prelude::*;

/// Operator commands received on the site command topic, e.g.
/// `{"command": "set_mode", "mode": "offline"}`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum Command {
    // validated by the coordinator, so that a bad value gets a result message
    SetMode { mode: String },
    Sync,
    ReadDevices,
    Heartbeat,
    Purge,
}

impl Command {
    pub fn name(&self) -> &'static str {
        use Command::*;

        match self {
            SetMode { .. } => "set_mode",
            Sync => "sync",
            ReadDevices => "read_devices",
            Heartbeat => "heartbeat",
            Purge => "purge",
        }
    }

    pub fn to_result_topic(&self, site_id: &str) -> String {
        format!("{}/result/{}", site_id, self.name())
    }
}
