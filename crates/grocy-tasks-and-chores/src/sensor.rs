//! Sensors for open Grocy tasks and chores
//!
//! Each sensor's state is the number of items; the full list is exposed as
//! an attribute.

use std::sync::Arc;

use ha_core::{Attributes, EntityIdError, Platform};
use ha_helpers::{CoordinatorEntity, DataUpdateCoordinator, EntityPlatform};
use ha_state_store::SharedStateStore;
use serde_json::Value;

use crate::coordinator::GrocyData;

const STATE_CLASS_MEASUREMENT: &str = "measurement";

pub struct GrocyTasksSensor {
    entry_id: String,
}

impl GrocyTasksSensor {
    pub fn new(entry_id: impl Into<String>) -> Self {
        Self {
            entry_id: entry_id.into(),
        }
    }
}

impl CoordinatorEntity<GrocyData> for GrocyTasksSensor {
    fn unique_id(&self) -> String {
        format!("{}_tasks", self.entry_id)
    }

    fn name(&self) -> String {
        "Grocy Tasks".to_string()
    }

    fn icon(&self) -> Option<&'static str> {
        Some("mdi:checkbox-marked-circle-outline")
    }

    fn unit_of_measurement(&self) -> Option<&'static str> {
        Some("tasks")
    }

    fn state_class(&self) -> Option<&'static str> {
        Some(STATE_CLASS_MEASUREMENT)
    }

    fn native_value(&self, data: &GrocyData) -> Value {
        data.tasks.len().into()
    }

    fn extra_state_attributes(&self, data: &GrocyData) -> Attributes {
        let mut attributes = Attributes::new();
        attributes.insert("tasks".to_string(), Value::Array(data.tasks.clone()));
        attributes
    }
}

pub struct GrocyChoresSensor {
    entry_id: String,
}

impl GrocyChoresSensor {
    pub fn new(entry_id: impl Into<String>) -> Self {
        Self {
            entry_id: entry_id.into(),
        }
    }
}

impl CoordinatorEntity<GrocyData> for GrocyChoresSensor {
    fn unique_id(&self) -> String {
        format!("{}_chores", self.entry_id)
    }

    fn name(&self) -> String {
        "Grocy Chores".to_string()
    }

    fn icon(&self) -> Option<&'static str> {
        Some("mdi:broom")
    }

    fn unit_of_measurement(&self) -> Option<&'static str> {
        Some("chores")
    }

    fn state_class(&self) -> Option<&'static str> {
        Some(STATE_CLASS_MEASUREMENT)
    }

    fn native_value(&self, data: &GrocyData) -> Value {
        data.chores.len().into()
    }

    fn extra_state_attributes(&self, data: &GrocyData) -> Attributes {
        let mut attributes = Attributes::new();
        attributes.insert("chores".to_string(), Value::Array(data.chores.clone()));
        attributes
    }
}

/// Add the tasks and chores sensors of one entry
pub fn setup_entities(
    states: SharedStateStore,
    coordinator: &Arc<DataUpdateCoordinator<GrocyData>>,
    entry_id: &str,
) -> Result<EntityPlatform, EntityIdError> {
    let entities: Vec<Box<dyn CoordinatorEntity<GrocyData>>> = vec![
        Box::new(GrocyTasksSensor::new(entry_id)),
        Box::new(GrocyChoresSensor::new(entry_id)),
    ];
    EntityPlatform::add_coordinator_entities(Platform::Sensor, states, coordinator, entities)
}
