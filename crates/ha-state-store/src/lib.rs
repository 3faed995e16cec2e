//! Entity state storage with domain indexing
//!
//! The [`StateStore`] holds the current state of every entity written by
//! integrations, keeps a per-domain index, and broadcasts a
//! [`StateChangedData`] to subscribers for every write and removal.

use dashmap::DashMap;
use ha_core::events::StateChangedData;
use ha_core::{Attributes, Context, EntityId, State, MAX_STATE_LENGTH, STATE_UNKNOWN};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, instrument, trace, warn};

/// Capacity of the state change channel
const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Current state of all entities
pub struct StateStore {
    /// Entity states keyed by entity_id string
    states: DashMap<String, State>,
    /// entity_ids by domain
    domain_index: DashMap<String, Vec<String>>,
    /// State change notifications
    changes: broadcast::Sender<StateChangedData>,
}

impl StateStore {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(DEFAULT_CHANNEL_CAPACITY);
        Self {
            states: DashMap::new(),
            domain_index: DashMap::new(),
            changes,
        }
    }

    /// Subscribe to state changes
    pub fn subscribe(&self) -> broadcast::Receiver<StateChangedData> {
        self.changes.subscribe()
    }

    /// Set the state of an entity
    ///
    /// `last_changed` only moves when the value differs from the previous
    /// one. Values longer than [`MAX_STATE_LENGTH`] are replaced by
    /// `unknown`.
    #[instrument(skip(self, state, attributes, context), fields(entity_id = %entity_id))]
    pub fn set(
        &self,
        entity_id: EntityId,
        state: impl Into<String>,
        attributes: Attributes,
        context: Context,
    ) -> State {
        let mut state = state.into();
        if state.len() > MAX_STATE_LENGTH {
            warn!(
                "State value is {} characters, longer than {}; storing '{}'",
                state.len(),
                MAX_STATE_LENGTH,
                STATE_UNKNOWN
            );
            state = STATE_UNKNOWN.to_string();
        }

        let key = entity_id.to_string();
        let old_state = self.get(&key);

        let new_state = match &old_state {
            Some(existing) => existing.with_update(state, attributes, context),
            None => State::new(entity_id.clone(), state, attributes, context),
        };

        debug!(
            state = %new_state.state,
            changed = old_state.as_ref().map(|s| s.state != new_state.state).unwrap_or(true),
            "Setting entity state"
        );

        self.states.insert(key.clone(), new_state.clone());

        if old_state.is_none() {
            self.domain_index
                .entry(entity_id.domain().to_string())
                .or_default()
                .push(key);
        }

        // No receivers is not an error
        let _ = self.changes.send(StateChangedData {
            entity_id,
            old_state,
            new_state: Some(new_state.clone()),
        });

        new_state
    }

    pub fn get(&self, entity_id: &str) -> Option<State> {
        self.states.get(entity_id).map(|s| s.clone())
    }

    /// State value only
    pub fn get_state(&self, entity_id: &str) -> Option<String> {
        self.states.get(entity_id).map(|s| s.state.clone())
    }

    pub fn contains(&self, entity_id: &str) -> bool {
        self.states.contains_key(entity_id)
    }

    /// All entity IDs of a domain, in insertion order
    pub fn entity_ids(&self, domain: &str) -> Vec<String> {
        self.domain_index
            .get(domain)
            .map(|v| v.clone())
            .unwrap_or_default()
    }

    /// Remove an entity's state, notifying subscribers with `new_state: None`
    #[instrument(skip(self), fields(entity_id = %entity_id))]
    pub fn remove(&self, entity_id: &EntityId) -> Option<State> {
        let key = entity_id.to_string();
        let old_state = self.states.remove(&key).map(|(_, s)| s)?;

        trace!("Removing entity state");
        if let Some(mut ids) = self.domain_index.get_mut(entity_id.domain()) {
            ids.retain(|id| id != &key);
        }

        let _ = self.changes.send(StateChangedData {
            entity_id: entity_id.clone(),
            old_state: Some(old_state.clone()),
            new_state: None,
        });

        Some(old_state)
    }

    pub fn entity_count(&self) -> usize {
        self.states.len()
    }
}

impl Default for StateStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Thread-safe wrapper for StateStore
pub type SharedStateStore = Arc<StateStore>;
