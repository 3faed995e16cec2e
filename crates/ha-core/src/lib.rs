//! Core types for the Home Assistant host
//!
//! Types shared between the host crates and integrations: [`EntityId`],
//! [`State`], [`Context`] and the entity [`Platform`] an integration
//! forwards its entries to.

mod context;
mod entity_id;
mod platform;
mod state;

pub use context::Context;
pub use entity_id::{EntityId, EntityIdError};
pub use platform::Platform;
pub use state::{Attributes, State};

/// Maximum length for a state value
pub const MAX_STATE_LENGTH: usize = 255;

/// State value used when the entity has no value yet
pub const STATE_UNKNOWN: &str = "unknown";

/// Common attribute and configuration keys
pub mod consts {
    pub const ATTR_FRIENDLY_NAME: &str = "friendly_name";
    pub const ATTR_ICON: &str = "icon";
    pub const ATTR_UNIT_OF_MEASUREMENT: &str = "unit_of_measurement";
    pub const ATTR_STATE_CLASS: &str = "state_class";
    /// Present and `false` while an entity shows values from before a failed refresh
    pub const ATTR_AVAILABLE: &str = "available";
    pub const ATTR_LAST_ERROR: &str = "last_error";

    pub const CONF_URL: &str = "url";
    pub const CONF_API_KEY: &str = "api_key";
}

/// Events published by the host
pub mod events {
    use crate::{EntityId, State};

    /// Event type for state changes
    pub const STATE_CHANGED: &str = "state_changed";

    /// Payload of a state change; `new_state` is `None` on removal
    #[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
    pub struct StateChangedData {
        pub entity_id: EntityId,
        pub old_state: Option<State>,
        pub new_state: Option<State>,
    }
}
