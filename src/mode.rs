use crate::prelude::*;

/// The gateway's operating posture. Changes only on explicit request, never
/// as a side effect of poll or publish failures.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    #[default]
    Normal,
    LowPower,
    Offline,
}

impl Mode {
    pub const ALL: [Mode; 3] = [Mode::Normal, Mode::LowPower, Mode::Offline];

    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Normal => "normal",
            Mode::LowPower => "low_power",
            Mode::Offline => "offline",
        }
    }

    /// Whether anything should be sent over the link in this mode.
    pub fn transmits(&self) -> bool {
        !matches!(self, Mode::Offline)
    }
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Mode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Mode::ALL
            .into_iter()
            .find(|m| m.as_str() == s)
            .ok_or_else(|| anyhow!("invalid mode {:?}, expected one of normal, low_power, offline", s))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_modes() {
        assert_eq!(Mode::from_str("normal").unwrap(), Mode::Normal);
        assert_eq!(Mode::from_str("low_power").unwrap(), Mode::LowPower);
        assert_eq!(Mode::from_str("offline").unwrap(), Mode::Offline);
    }

    #[test]
    fn rejects_unknown_modes() {
        assert!(Mode::from_str("turbo").is_err());
        assert!(Mode::from_str("Normal").is_err());
        assert!(Mode::from_str("").is_err());
    }

    #[test]
    fn serde_names_match_display() {
        for mode in Mode::ALL {
            assert_eq!(serde_json::to_string(&mode).unwrap(), format!("\"{}\"", mode));
        }
    }
}
