//! Typed view of a Grocy config entry

use std::time::Duration;

use ha_config_entries::{ConfigEntry, SetupError};
use ha_core::consts::{CONF_API_KEY, CONF_URL};
use tracing::warn;

use crate::consts::{CONF_SCAN_INTERVAL, DEFAULT_SCAN_INTERVAL, MIN_SCAN_INTERVAL};

/// Where and how to reach one Grocy instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionProfile {
    pub base_url: String,
    pub api_key: String,
    /// As stored in the entry options; see [`ConnectionProfile::poll_interval`]
    pub scan_interval: i64,
}

impl ConnectionProfile {
    pub fn from_entry(entry: &ConfigEntry) -> Result<Self, SetupError> {
        let field = |key: &str| {
            entry
                .data_str(key)
                .filter(|value| !value.is_empty())
                .map(str::to_string)
                .ok_or_else(|| SetupError::InvalidEntry(format!("missing {key}")))
        };

        Ok(Self {
            base_url: field(CONF_URL)?,
            api_key: field(CONF_API_KEY)?,
            scan_interval: entry
                .option_i64(CONF_SCAN_INTERVAL)
                .unwrap_or(DEFAULT_SCAN_INTERVAL),
        })
    }

    /// Interval between refreshes, never shorter than [`MIN_SCAN_INTERVAL`]
    pub fn poll_interval(&self) -> Duration {
        if self.scan_interval < MIN_SCAN_INTERVAL {
            warn!(
                "Scan interval {}s is below the minimum, polling every {}s",
                self.scan_interval, MIN_SCAN_INTERVAL
            );
        }
        Duration::from_secs(self.scan_interval.max(MIN_SCAN_INTERVAL).unsigned_abs())
    }
}

/// Unique id for a Grocy URL: the same instance with or without a trailing slash
pub fn normalize_url(url: &str) -> String {
    url.trim().trim_end_matches('/').to_lowercase()
}
