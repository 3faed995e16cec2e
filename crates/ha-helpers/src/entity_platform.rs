//! Entity Platform
//!
//! Owns the entities of one config entry on one platform. Entity ids are
//! generated from entity names (`sensor.grocy_tasks`) with a numeric suffix
//! when the id is already taken. States are written once when entities are
//! added and again on every coordinator publication.

use std::sync::Arc;

use ha_core::{Context, EntityId, EntityIdError, Platform};
use ha_state_store::SharedStateStore;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::entity::CoordinatorEntity;
use crate::update_coordinator::{CoordinatorStatus, DataUpdateCoordinator};

/// Object id used when an entity name slugifies to nothing
const FALLBACK_OBJECT_ID: &str = "unnamed";

pub struct EntityPlatform {
    platform: Platform,
    states: SharedStateStore,
    entity_ids: Vec<EntityId>,
    listener: Option<JoinHandle<()>>,
}

impl EntityPlatform {
    /// Add entities backed by `coordinator` and keep them in sync with it
    pub fn add_coordinator_entities<T: Send + Sync + 'static>(
        platform: Platform,
        states: SharedStateStore,
        coordinator: &DataUpdateCoordinator<T>,
        entities: Vec<Box<dyn CoordinatorEntity<T>>>,
    ) -> Result<Self, EntityIdError> {
        let status = coordinator.status();
        let mut entity_ids = Vec::with_capacity(entities.len());

        for entity in &entities {
            let entity_id = generate_entity_id(&states, platform, &entity.name())?;
            write_state(&states, entity.as_ref(), &entity_id, &status);
            info!("Added {} ({})", entity_id, entity.unique_id());
            entity_ids.push(entity_id);
        }

        let mut rx = coordinator.subscribe();
        let listener = {
            let states = states.clone();
            let entity_ids = entity_ids.clone();
            tokio::spawn(async move {
                while rx.changed().await.is_ok() {
                    // Failed refreshes still carry the last good data
                    let status = rx.borrow_and_update().clone();
                    for (entity, entity_id) in entities.iter().zip(&entity_ids) {
                        write_state(&states, entity.as_ref(), entity_id, &status);
                    }
                }
            })
        };

        Ok(Self {
            platform,
            states,
            entity_ids,
            listener: Some(listener),
        })
    }

    pub fn platform(&self) -> Platform {
        self.platform
    }

    pub fn entity_ids(&self) -> &[EntityId] {
        &self.entity_ids
    }

    /// Stop tracking the coordinator and remove all entity states
    pub fn unload(&mut self) {
        if let Some(listener) = self.listener.take() {
            listener.abort();
        }
        for entity_id in self.entity_ids.drain(..) {
            self.states.remove(&entity_id);
            debug!("Removed {}", entity_id);
        }
    }
}

impl Drop for EntityPlatform {
    fn drop(&mut self) {
        if let Some(listener) = self.listener.take() {
            listener.abort();
        }
    }
}

fn write_state<T>(
    states: &SharedStateStore,
    entity: &dyn CoordinatorEntity<T>,
    entity_id: &EntityId,
    status: &CoordinatorStatus<T>,
) {
    states.set(
        entity_id.clone(),
        entity.state(status.data.as_deref()),
        entity.status_attributes(status),
        Context::new(),
    );
}

/// `<platform>.<slugified name>`, suffixed `_2`, `_3`, ... when taken
fn generate_entity_id(
    states: &SharedStateStore,
    platform: Platform,
    name: &str,
) -> Result<EntityId, EntityIdError> {
    let object_id = slug::slugify(name).replace('-', "_");
    let object_id = if object_id.is_empty() {
        FALLBACK_OBJECT_ID.to_string()
    } else {
        object_id
    };

    let base = EntityId::new(platform.as_str(), object_id)?;
    let mut candidate = base.clone();
    let mut n = 2;
    while states.contains(&candidate.to_string()) {
        candidate = base.with_suffix(n);
        n += 1;
    }
    Ok(candidate)
}
