//! Integration interface
//!
//! An [`Integration`] is what the config entries manager calls into: it
//! supplies the flows that create and edit its entries, sets an entry up and
//! hands back an [`EntryRuntime`] that owns everything the loaded entry
//! needs until it is unloaded.

use async_trait::async_trait;
use ha_state_store::SharedStateStore;
use thiserror::Error;

use crate::entry::ConfigEntry;
use crate::flow::FlowHandler;

/// Host services handed to integrations during setup
#[derive(Clone)]
pub struct SetupContext {
    /// Where entities write their states
    pub states: SharedStateStore,
}

impl SetupContext {
    pub fn new(states: SharedStateStore) -> Self {
        Self { states }
    }
}

/// Why an integration could not set up an entry
#[derive(Debug, Error)]
pub enum SetupError {
    /// The remote side did not answer the first refresh
    #[error("integration not ready: {0}")]
    NotReady(String),

    /// The stored entry cannot be used
    #[error("invalid config entry: {0}")]
    InvalidEntry(String),
}

/// Per-entry state owned by a loaded integration
#[async_trait]
pub trait EntryRuntime: Send + Sync {
    /// Stop background work and remove entities; `false` reports a failed unload
    async fn unload(&self) -> bool;
}

#[async_trait]
pub trait Integration: Send + Sync {
    /// Integration domain, also the `domain` of its config entries
    fn domain(&self) -> &'static str;

    /// Flow that creates a new entry
    fn config_flow(&self) -> Box<dyn FlowHandler>;

    /// Flow that edits the options of an existing entry
    fn options_flow(&self, _entry: &ConfigEntry) -> Option<Box<dyn FlowHandler>> {
        None
    }

    /// Set up a config entry
    async fn setup_entry(
        &self,
        ctx: &SetupContext,
        entry: &ConfigEntry,
    ) -> Result<Box<dyn EntryRuntime>, SetupError>;
}
