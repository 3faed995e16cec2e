//! Grocy Tasks and Chores
//!
//! Polls a self-hosted Grocy instance for open tasks and chores and exposes
//! their counts as two sensors (`sensor.grocy_tasks`, `sensor.grocy_chores`).
//!
//! - [`config_flow`] - URL and API key entry, scan interval options
//! - [`api`] - Grocy REST client
//! - [`coordinator`] - Periodic fetch of tasks and chores
//! - [`sensor`] - Tasks and chores sensors
//!
//! Register [`GrocyIntegration`] with the config entries manager; each loaded
//! entry owns a [`GrocyRuntime`].

pub mod api;
pub mod config_flow;
pub mod consts;
pub mod coordinator;
pub mod profile;
pub mod sensor;

use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use ha_config_entries::{
    ConfigEntry, EntryRuntime, FlowHandler, Integration, SetupContext, SetupError,
};
use ha_helpers::{DataUpdateCoordinator, EntityPlatform};
use tracing::info;

pub use api::{ApiError, GrocyApi, GrocyClient};
pub use config_flow::{validate_input, GrocyConfigFlow, GrocyOptionsFlow, ValidationError};
pub use consts::DOMAIN;
pub use coordinator::{GrocyData, GrocyDataUpdater};
pub use profile::ConnectionProfile;

/// The Grocy tasks and chores integration
#[derive(Clone, Default)]
pub struct GrocyIntegration {
    http: reqwest::Client,
}

impl GrocyIntegration {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a preconfigured HTTP client for validation and polling
    pub fn with_client(http: reqwest::Client) -> Self {
        Self { http }
    }
}

#[async_trait]
impl Integration for GrocyIntegration {
    fn domain(&self) -> &'static str {
        DOMAIN
    }

    fn config_flow(&self) -> Box<dyn FlowHandler> {
        Box::new(GrocyConfigFlow::new(self.http.clone()))
    }

    fn options_flow(&self, entry: &ConfigEntry) -> Option<Box<dyn FlowHandler>> {
        Some(Box::new(GrocyOptionsFlow::new(entry)))
    }

    async fn setup_entry(
        &self,
        ctx: &SetupContext,
        entry: &ConfigEntry,
    ) -> Result<Box<dyn EntryRuntime>, SetupError> {
        let profile = ConnectionProfile::from_entry(entry)?;
        let client = Arc::new(GrocyApi::new(
            self.http.clone(),
            &profile.base_url,
            &profile.api_key,
        ));
        let runtime = GrocyRuntime::start(ctx, entry, &profile, client).await?;
        Ok(Box::new(runtime))
    }
}

/// Everything a loaded Grocy entry owns
pub struct GrocyRuntime {
    coordinator: Arc<DataUpdateCoordinator<GrocyData>>,
    platform: Mutex<EntityPlatform>,
}

impl GrocyRuntime {
    /// First refresh, sensors, then the refresh timer
    ///
    /// Fails without creating entities when the first refresh fails.
    pub async fn start(
        ctx: &SetupContext,
        entry: &ConfigEntry,
        profile: &ConnectionProfile,
        client: Arc<dyn GrocyClient>,
    ) -> Result<Self, SetupError> {
        let interval = if entry.pref_disable_polling {
            None
        } else {
            Some(profile.poll_interval())
        };
        let coordinator = Arc::new(DataUpdateCoordinator::<GrocyData>::new(
            DOMAIN,
            interval,
            Arc::new(GrocyDataUpdater::new(client)),
        ));

        coordinator
            .first_refresh()
            .await
            .map_err(|err| SetupError::NotReady(err.to_string()))?;

        let platform = sensor::setup_entities(ctx.states.clone(), &coordinator, &entry.entry_id)
            .map_err(|err| SetupError::InvalidEntry(err.to_string()))?;
        coordinator.start();

        info!(
            "Grocy at {} set up for entry {}",
            profile.base_url, entry.entry_id
        );
        Ok(Self {
            coordinator,
            platform: Mutex::new(platform),
        })
    }

    pub fn coordinator(&self) -> &Arc<DataUpdateCoordinator<GrocyData>> {
        &self.coordinator
    }
}

#[async_trait]
impl EntryRuntime for GrocyRuntime {
    async fn unload(&self) -> bool {
        self.coordinator.shutdown();
        self.platform
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .unload();
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::tests::FakeGrocy;
    use ha_core::consts::{CONF_API_KEY, CONF_URL};
    use ha_state_store::StateStore;
    use serde_json::json;
    use std::collections::HashMap;
    use std::time::Duration;

    fn entry() -> ConfigEntry {
        ConfigEntry::new(DOMAIN, consts::DEFAULT_NAME).with_data(HashMap::from([
            (CONF_URL.to_string(), json!("http://grocy.local")),
            (CONF_API_KEY.to_string(), json!("secret")),
        ]))
    }

    fn context() -> SetupContext {
        SetupContext::new(Arc::new(StateStore::new()))
    }

    #[tokio::test(start_paused = true)]
    async fn test_setup_creates_sensors() {
        let ctx = context();
        let entry = entry();
        let profile = ConnectionProfile::from_entry(&entry).unwrap();
        let fake = Arc::new(FakeGrocy::with(
            vec![json!({"id": "a"}), json!({"id": "b"})],
            vec![json!({"id": "c"})],
        ));

        let runtime = GrocyRuntime::start(&ctx, &entry, &profile, fake)
            .await
            .unwrap();

        let tasks = ctx.states.get("sensor.grocy_tasks").unwrap();
        assert_eq!(tasks.state, "2");
        assert_eq!(tasks.attributes["tasks"], json!([{"id": "a"}, {"id": "b"}]));
        assert_eq!(ctx.states.get_state("sensor.grocy_chores").unwrap(), "1");
        assert!(runtime.coordinator().is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_keeps_last_values() {
        let ctx = context();
        let entry = entry();
        let profile = ConnectionProfile::from_entry(&entry).unwrap();
        let fake = Arc::new(FakeGrocy::with(
            vec![json!({"id": "a"}), json!({"id": "b"})],
            vec![json!({"id": "c"})],
        ));

        let runtime = GrocyRuntime::start(&ctx, &entry, &profile, fake.clone())
            .await
            .unwrap();

        *fake.tasks.lock().unwrap() = vec![];
        *fake.delay.lock().unwrap() = Some(Duration::from_secs(30));
        assert!(runtime.coordinator().refresh().await.is_err());
        tokio::task::yield_now().await;

        assert!(!runtime.coordinator().last_update_success());
        assert!(runtime
            .coordinator()
            .last_error()
            .unwrap()
            .contains("timed out"));
        assert_eq!(ctx.states.get_state("sensor.grocy_tasks").unwrap(), "2");
        assert_eq!(ctx.states.get_state("sensor.grocy_chores").unwrap(), "1");
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_refreshes_sensors() {
        let ctx = context();
        let entry = entry();
        let profile = ConnectionProfile::from_entry(&entry).unwrap();
        let fake = Arc::new(FakeGrocy::with(vec![], vec![]));

        let _runtime = GrocyRuntime::start(&ctx, &entry, &profile, fake.clone())
            .await
            .unwrap();
        assert_eq!(ctx.states.get_state("sensor.grocy_tasks").unwrap(), "0");

        *fake.tasks.lock().unwrap() = vec![json!({"id": 1})];
        tokio::time::sleep(Duration::from_secs(61)).await;

        assert_eq!(ctx.states.get_state("sensor.grocy_tasks").unwrap(), "1");
    }

    #[tokio::test]
    async fn test_first_refresh_failure_aborts_setup() {
        let ctx = context();
        let entry = entry();
        let profile = ConnectionProfile::from_entry(&entry).unwrap();
        let fake = Arc::new(FakeGrocy::default());
        *fake.chores_status.lock().unwrap() = Some(503);

        let result = GrocyRuntime::start(&ctx, &entry, &profile, fake).await;

        assert!(matches!(result, Err(SetupError::NotReady(_))));
        assert_eq!(ctx.states.entity_count(), 0);
    }

    #[tokio::test]
    async fn test_polling_disabled() {
        let ctx = context();
        let mut entry = entry();
        entry.pref_disable_polling = true;
        let profile = ConnectionProfile::from_entry(&entry).unwrap();

        let runtime = GrocyRuntime::start(&ctx, &entry, &profile, Arc::new(FakeGrocy::default()))
            .await
            .unwrap();

        assert!(!runtime.coordinator().is_running());
        assert_eq!(runtime.coordinator().update_interval(), None);
    }

    #[tokio::test]
    async fn test_unload_removes_sensors() {
        let ctx = context();
        let entry = entry();
        let profile = ConnectionProfile::from_entry(&entry).unwrap();

        let runtime = GrocyRuntime::start(&ctx, &entry, &profile, Arc::new(FakeGrocy::default()))
            .await
            .unwrap();
        assert_eq!(ctx.states.entity_count(), 2);

        assert!(runtime.unload().await);
        assert_eq!(ctx.states.entity_count(), 0);
        assert!(!runtime.coordinator().is_running());
    }

    #[test]
    fn test_integration_flows() {
        let integration = GrocyIntegration::new();
        assert_eq!(integration.domain(), DOMAIN);
        assert_eq!(integration.config_flow().init_step(), "user");
        assert_eq!(
            integration.options_flow(&entry()).unwrap().init_step(),
            "init"
        );
    }
}
