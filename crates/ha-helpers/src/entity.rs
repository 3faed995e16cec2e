//! Coordinator-backed entities

use ha_core::consts::{
    ATTR_AVAILABLE, ATTR_FRIENDLY_NAME, ATTR_ICON, ATTR_LAST_ERROR, ATTR_STATE_CLASS,
    ATTR_UNIT_OF_MEASUREMENT,
};
use ha_core::{Attributes, STATE_UNKNOWN};
use serde_json::Value;

use crate::update_coordinator::CoordinatorStatus;

/// An entity whose state is computed from coordinator data
///
/// The platform calls [`CoordinatorEntity::state`] and
/// [`CoordinatorEntity::status_attributes`] every time the coordinator
/// publishes, so implementations only map data to values.
pub trait CoordinatorEntity<T>: Send + Sync {
    /// Stable id, unique per config entry
    fn unique_id(&self) -> String;

    /// Display name, also the source of the generated entity id
    fn name(&self) -> String;

    fn icon(&self) -> Option<&'static str> {
        None
    }

    fn unit_of_measurement(&self) -> Option<&'static str> {
        None
    }

    fn state_class(&self) -> Option<&'static str> {
        None
    }

    /// State value derived from the data
    fn native_value(&self, data: &T) -> Value;

    fn extra_state_attributes(&self, _data: &T) -> Attributes {
        Attributes::new()
    }

    /// State string; `unknown` before the first successful refresh
    fn state(&self, data: Option<&T>) -> String {
        match data.map(|data| self.native_value(data)) {
            None | Some(Value::Null) => STATE_UNKNOWN.to_string(),
            Some(Value::String(s)) => s,
            Some(other) => other.to_string(),
        }
    }

    /// Metadata attributes merged with the extra attributes
    fn state_attributes(&self, data: Option<&T>) -> Attributes {
        let mut attributes = data
            .map(|data| self.extra_state_attributes(data))
            .unwrap_or_default();

        attributes.insert(ATTR_FRIENDLY_NAME.to_string(), self.name().into());
        if let Some(icon) = self.icon() {
            attributes.insert(ATTR_ICON.to_string(), icon.into());
        }
        if let Some(unit) = self.unit_of_measurement() {
            attributes.insert(ATTR_UNIT_OF_MEASUREMENT.to_string(), unit.into());
        }
        if let Some(state_class) = self.state_class() {
            attributes.insert(ATTR_STATE_CLASS.to_string(), state_class.into());
        }
        attributes
    }

    /// Attributes for a coordinator publication
    ///
    /// After a failed refresh the data is the last good snapshot; the
    /// attributes then carry `available: false` and the refresh error.
    fn status_attributes(&self, status: &CoordinatorStatus<T>) -> Attributes {
        let mut attributes = self.state_attributes(status.data.as_deref());
        if !status.last_update_success {
            attributes.insert(ATTR_AVAILABLE.to_string(), false.into());
            if let Some(err) = &status.last_error {
                attributes.insert(ATTR_LAST_ERROR.to_string(), err.as_str().into());
            }
        }
        attributes
    }
}
