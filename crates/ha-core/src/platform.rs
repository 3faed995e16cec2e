//! Entity platforms an integration can forward its config entries to

use serde::{Deserialize, Serialize};
use std::fmt;

/// Entity platform (entity domain)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    Sensor,
}

impl Platform {
    /// Entity domain string used in entity ids
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Sensor => "sensor",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
