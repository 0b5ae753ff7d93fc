use crate::prelude::*;

use chrono::{DateTime, SecondsFormat, Utc};

pub struct Utils;

impl Utils {
    pub fn utc() -> DateTime<Utc> {
        Utc::now()
    }

    // every timestamp that reaches the cache goes through here, so that string
    // comparison in SQLite orders rows chronologically
    pub fn iso8601(dt: &DateTime<Utc>) -> String {
        dt.to_rfc3339_opts(SecondsFormat::Millis, true)
    }

    pub fn now_iso8601() -> String {
        Self::iso8601(&Self::utc())
    }

    pub fn parse_timestamp(s: &str) -> Result<DateTime<Utc>> {
        DateTime::parse_from_rfc3339(s)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|err| anyhow!("invalid timestamp {:?}: {}", s, err))
    }

    pub fn normalize_timestamp(s: &str) -> Result<String> {
        Ok(Self::iso8601(&Self::parse_timestamp(s)?))
    }
}
