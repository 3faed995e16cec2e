//! Config Flow Engine
//!
//! Flows are step-based dialogs owned by an integration. A flow handler
//! answers each step with a [`StepResult`]: show a form (optionally with
//! errors), create an entry, or abort. The [`FlowManager`] tracks active
//! flows by id, feeds user input to the current step and turns a finished
//! flow into a persisted config entry (config flows) or saved options
//! (options flows).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::entry::{ConfigEntry, ConfigEntryUpdate};
use crate::manager::{ConfigEntries, ConfigEntriesError};

/// Submitted form values
pub type FlowInput = HashMap<String, serde_json::Value>;

/// Abort reason when a flow would duplicate an existing entry
pub const ABORT_ALREADY_CONFIGURED: &str = "already_configured";

#[derive(Debug, Error)]
pub enum FlowError {
    #[error("Flow {0} not found")]
    UnknownFlow(String),

    #[error("No integration registered for domain {0}")]
    UnknownHandler(String),

    #[error("Flow has no step {0}")]
    UnknownStep(String),

    #[error("Config entry not found: {0}")]
    UnknownEntry(String),

    #[error("Integration {0} has no options flow")]
    OptionsNotSupported(String),

    #[error(transparent)]
    ConfigEntries(#[from] ConfigEntriesError),
}

/// Value type of a form field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    String,
    Integer,
}

/// Form field schema
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FormField {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
    pub required: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<serde_json::Value>,
}

impl FormField {
    pub fn required(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            required: true,
            default: None,
        }
    }

    pub fn optional(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            required: false,
            ..Self::required(name, field_type)
        }
    }

    pub fn with_default(mut self, default: impl Into<serde_json::Value>) -> Self {
        self.default = Some(default.into());
        self
    }
}

/// Outcome of a single flow step
#[derive(Debug, Clone)]
pub enum StepResult {
    ShowForm {
        step_id: String,
        data_schema: Vec<FormField>,
        errors: HashMap<String, String>,
    },
    CreateEntry {
        title: String,
        data: FlowInput,
        unique_id: Option<String>,
    },
    Abort {
        reason: String,
    },
}

impl StepResult {
    pub fn show_form(step_id: impl Into<String>, data_schema: Vec<FormField>) -> Self {
        Self::ShowForm {
            step_id: step_id.into(),
            data_schema,
            errors: HashMap::new(),
        }
    }

    pub fn create_entry(title: impl Into<String>, data: FlowInput) -> Self {
        Self::CreateEntry {
            title: title.into(),
            data,
            unique_id: None,
        }
    }

    pub fn abort(reason: impl Into<String>) -> Self {
        Self::Abort {
            reason: reason.into(),
        }
    }
}

/// A step-based flow
#[async_trait]
pub trait FlowHandler: Send + Sync {
    /// Step run (without input) when the flow starts
    fn init_step(&self) -> &'static str;

    /// Version stamped on entries created by this flow
    fn version(&self) -> u32 {
        1
    }

    /// Run `step_id`; `user_input` is `None` when the step is first shown
    async fn step(
        &mut self,
        step_id: &str,
        user_input: Option<FlowInput>,
    ) -> Result<StepResult, FlowError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowResultType {
    Form,
    CreateEntry,
    Abort,
}

/// Result returned to the host for each step
#[derive(Debug, Clone, Serialize)]
pub struct FlowResult {
    pub flow_id: String,
    /// Integration domain
    pub handler: String,
    #[serde(rename = "type")]
    pub result_type: FlowResultType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
    /// Always present, empty when the result is not a form
    pub data_schema: Vec<FormField>,
    pub errors: Option<HashMap<String, String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<u32>,
    /// For create_entry: the created entry id or saved options
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
}

impl FlowResult {
    fn new(flow_id: &str, handler: &str, result_type: FlowResultType) -> Self {
        Self {
            flow_id: flow_id.to_string(),
            handler: handler.to_string(),
            result_type,
            step_id: None,
            data_schema: Vec::new(),
            errors: None,
            title: None,
            reason: None,
            version: None,
            result: None,
        }
    }

    /// Form-level error (`errors["base"]`)
    pub fn base_error(&self) -> Option<&str> {
        self.errors
            .as_ref()
            .and_then(|e| e.get("base"))
            .map(String::as_str)
    }

    /// Default value of a form field
    pub fn field_default(&self, name: &str) -> Option<&serde_json::Value> {
        self.data_schema
            .iter()
            .find(|f| f.name == name)
            .and_then(|f| f.default.as_ref())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum FlowKind {
    Config,
    Options { entry_id: String },
}

struct ActiveFlow {
    /// Integration domain
    handler: String,
    kind: FlowKind,
    current_step: String,
    flow: Box<dyn FlowHandler>,
}

/// Tracks active flows and applies their results
pub struct FlowManager {
    entries: Arc<ConfigEntries>,
    flows: Mutex<HashMap<String, ActiveFlow>>,
}

impl FlowManager {
    pub fn new(entries: Arc<ConfigEntries>) -> Self {
        Self {
            entries,
            flows: Mutex::new(HashMap::new()),
        }
    }

    /// Start a config flow for an integration domain
    pub async fn start_flow(&self, handler: &str) -> Result<FlowResult, FlowError> {
        let integration = self
            .entries
            .integration(handler)
            .ok_or_else(|| FlowError::UnknownHandler(handler.to_string()))?;

        let active = ActiveFlow {
            handler: handler.to_string(),
            kind: FlowKind::Config,
            current_step: String::new(),
            flow: integration.config_flow(),
        };
        self.start(active).await
    }

    /// Start an options flow for an existing entry
    pub async fn start_options_flow(&self, entry_id: &str) -> Result<FlowResult, FlowError> {
        let entry = self
            .entries
            .get(entry_id)
            .ok_or_else(|| FlowError::UnknownEntry(entry_id.to_string()))?;
        let integration = self
            .entries
            .integration(&entry.domain)
            .ok_or_else(|| FlowError::UnknownHandler(entry.domain.clone()))?;
        let flow = integration
            .options_flow(&entry)
            .ok_or_else(|| FlowError::OptionsNotSupported(entry.domain.clone()))?;

        let active = ActiveFlow {
            handler: entry.domain.clone(),
            kind: FlowKind::Options {
                entry_id: entry_id.to_string(),
            },
            current_step: String::new(),
            flow,
        };
        self.start(active).await
    }

    async fn start(&self, mut active: ActiveFlow) -> Result<FlowResult, FlowError> {
        let flow_id = Ulid::new().to_string().to_lowercase();
        info!(
            "Starting {:?} flow for {} with flow_id {}",
            active.kind, active.handler, flow_id
        );

        let init_step = active.flow.init_step();
        let step = active.flow.step(init_step, None).await?;
        active.current_step = init_step.to_string();
        self.apply(flow_id, active, step).await
    }

    /// Submit user input to the current step of a flow
    pub async fn progress_flow(
        &self,
        flow_id: &str,
        user_input: FlowInput,
    ) -> Result<FlowResult, FlowError> {
        let mut active = self
            .flows
            .lock()
            .await
            .remove(flow_id)
            .ok_or_else(|| FlowError::UnknownFlow(flow_id.to_string()))?;

        info!(
            "Progressing flow {} for {} at step {}",
            flow_id, active.handler, active.current_step
        );

        let step_id = active.current_step.clone();
        match active.flow.step(&step_id, Some(user_input)).await {
            Ok(step) => self.apply(flow_id.to_string(), active, step).await,
            Err(err) => {
                self.flows.lock().await.insert(flow_id.to_string(), active);
                Err(err)
            }
        }
    }

    /// Drop an active flow
    pub async fn abort_flow(&self, flow_id: &str) -> Result<(), FlowError> {
        self.flows
            .lock()
            .await
            .remove(flow_id)
            .map(|_| debug!("Aborted flow {}", flow_id))
            .ok_or_else(|| FlowError::UnknownFlow(flow_id.to_string()))
    }

    /// Active flows as JSON
    pub async fn list_flows(&self) -> Vec<serde_json::Value> {
        let flows = self.flows.lock().await;
        flows
            .iter()
            .map(|(flow_id, flow)| {
                let source = match &flow.kind {
                    FlowKind::Config => serde_json::json!({ "source": "user" }),
                    FlowKind::Options { entry_id } => {
                        serde_json::json!({ "source": "options", "entry_id": entry_id })
                    }
                };
                serde_json::json!({
                    "flow_id": flow_id,
                    "handler": flow.handler,
                    "step_id": flow.current_step,
                    "context": source,
                })
            })
            .collect()
    }

    async fn apply(
        &self,
        flow_id: String,
        mut active: ActiveFlow,
        step: StepResult,
    ) -> Result<FlowResult, FlowError> {
        match step {
            StepResult::ShowForm {
                step_id,
                data_schema,
                errors,
            } => {
                let mut result = FlowResult::new(&flow_id, &active.handler, FlowResultType::Form);
                result.step_id = Some(step_id.clone());
                result.data_schema = data_schema;
                result.errors = (!errors.is_empty()).then_some(errors);

                active.current_step = step_id;
                self.flows.lock().await.insert(flow_id, active);
                Ok(result)
            }
            StepResult::Abort { reason } => {
                info!("Flow {} aborted: {}", flow_id, reason);
                let mut result = FlowResult::new(&flow_id, &active.handler, FlowResultType::Abort);
                result.reason = Some(reason);
                Ok(result)
            }
            StepResult::CreateEntry {
                title,
                data,
                unique_id,
            } => {
                let created = match active.kind.clone() {
                    FlowKind::Config => {
                        self.create_entry(&flow_id, &active, title, data, unique_id)
                            .await
                    }
                    FlowKind::Options { entry_id } => {
                        self.save_options(&flow_id, &active, &entry_id, data).await
                    }
                };
                // Nothing was stored; the same input can be submitted again
                if created.is_err() {
                    self.flows.lock().await.insert(flow_id, active);
                }
                created
            }
        }
    }

    async fn create_entry(
        &self,
        flow_id: &str,
        active: &ActiveFlow,
        title: String,
        data: FlowInput,
        unique_id: Option<String>,
    ) -> Result<FlowResult, FlowError> {
        if let Some(ref unique_id) = unique_id {
            if self
                .entries
                .get_by_unique_id(&active.handler, unique_id)
                .is_some()
            {
                info!(
                    "Flow {} aborted: {} already configured with {}",
                    flow_id, active.handler, unique_id
                );
                let mut result = FlowResult::new(flow_id, &active.handler, FlowResultType::Abort);
                result.reason = Some(ABORT_ALREADY_CONFIGURED.to_string());
                return Ok(result);
            }
        }

        let mut entry = ConfigEntry::new(&active.handler, &title)
            .with_data(data)
            .with_version(active.flow.version());
        if let Some(unique_id) = unique_id {
            entry = entry.with_unique_id(unique_id);
        }

        let entry = self.entries.add(entry).await?;
        info!("Flow {} created entry {}", flow_id, entry.entry_id);

        // A failed setup keeps the entry; its state records the reason
        if let Err(err) = self.entries.setup(&entry.entry_id).await {
            warn!("Entry {} created but not set up: {}", entry.entry_id, err);
        }

        let mut result = FlowResult::new(flow_id, &active.handler, FlowResultType::CreateEntry);
        result.title = Some(title);
        result.version = Some(entry.version);
        result.result = Some(serde_json::json!({ "entry_id": entry.entry_id }));
        Ok(result)
    }

    async fn save_options(
        &self,
        flow_id: &str,
        active: &ActiveFlow,
        entry_id: &str,
        options: FlowInput,
    ) -> Result<FlowResult, FlowError> {
        let updated = self
            .entries
            .update(entry_id, ConfigEntryUpdate::new().options(options.clone()))
            .await?;
        info!("Flow {} saved options for entry {}", flow_id, entry_id);

        // Loaded entries pick up new options by reloading
        if updated.is_loaded() {
            if let Err(err) = self.entries.reload(entry_id).await {
                warn!("Reload after options update failed for {}: {}", entry_id, err);
            }
        }

        let mut result = FlowResult::new(flow_id, &active.handler, FlowResultType::CreateEntry);
        result.title = Some(String::new());
        result.result = Some(serde_json::to_value(&options).unwrap_or_default());
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::ConfigEntryState;
    use crate::integration::SetupContext;
    use crate::test_support::{DemoIntegration, DEMO_DOMAIN};
    use ha_state_store::StateStore;
    use ha_storage::Storage;
    use serde_json::json;
    use std::sync::atomic::Ordering;
    use tempfile::TempDir;

    fn setup(integration: DemoIntegration) -> (TempDir, Arc<ConfigEntries>, FlowManager) {
        let dir = TempDir::new().unwrap();
        let entries = Arc::new(ConfigEntries::new(
            Arc::new(Storage::new(dir.path())),
            SetupContext::new(Arc::new(StateStore::new())),
        ));
        entries.register_integration(Arc::new(integration));
        let flows = FlowManager::new(entries.clone());
        (dir, entries, flows)
    }

    fn input(pairs: &[(&str, serde_json::Value)]) -> FlowInput {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[tokio::test]
    async fn test_start_shows_first_form() {
        let (_dir, _entries, flows) = setup(DemoIntegration::default());

        let result = flows.start_flow(DEMO_DOMAIN).await.unwrap();
        assert_eq!(result.result_type, FlowResultType::Form);
        assert_eq!(result.step_id.as_deref(), Some("user"));
        assert_eq!(result.data_schema[0].name, "name");
        assert!(result.errors.is_none());
        assert_eq!(flows.list_flows().await.len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_handler() {
        let (_dir, _entries, flows) = setup(DemoIntegration::default());
        assert!(matches!(
            flows.start_flow("nope").await,
            Err(FlowError::UnknownHandler(_))
        ));
    }

    #[tokio::test]
    async fn test_form_error_keeps_flow_open() {
        let (_dir, entries, flows) = setup(DemoIntegration::default());
        let started = flows.start_flow(DEMO_DOMAIN).await.unwrap();

        let result = flows
            .progress_flow(&started.flow_id, input(&[("name", json!(""))]))
            .await
            .unwrap();

        assert_eq!(result.result_type, FlowResultType::Form);
        assert_eq!(result.base_error(), Some("invalid_name"));
        assert!(entries.is_empty());
        assert_eq!(flows.list_flows().await.len(), 1);
    }

    #[tokio::test]
    async fn test_failed_persist_keeps_flow_for_retry() {
        let (dir, entries, flows) = setup(DemoIntegration::default());
        let storage_dir = dir.path().join(".storage");
        std::fs::write(&storage_dir, "").unwrap();
        let started = flows.start_flow(DEMO_DOMAIN).await.unwrap();

        let result = flows
            .progress_flow(&started.flow_id, input(&[("name", json!("kitchen"))]))
            .await;
        assert!(matches!(result, Err(FlowError::ConfigEntries(_))));
        assert!(entries.is_empty());
        assert_eq!(flows.list_flows().await.len(), 1);

        std::fs::remove_file(&storage_dir).unwrap();
        let result = flows
            .progress_flow(&started.flow_id, input(&[("name", json!("kitchen"))]))
            .await
            .unwrap();
        assert_eq!(result.result_type, FlowResultType::CreateEntry);
        assert_eq!(entries.len(), 1);
        assert!(flows.list_flows().await.is_empty());
    }

    #[tokio::test]
    async fn test_create_entry_persists_and_sets_up() {
        let integration = DemoIntegration::default();
        let setups = integration.setups.clone();
        let (_dir, entries, flows) = setup(integration);
        let started = flows.start_flow(DEMO_DOMAIN).await.unwrap();

        let result = flows
            .progress_flow(&started.flow_id, input(&[("name", json!("kitchen"))]))
            .await
            .unwrap();

        assert_eq!(result.result_type, FlowResultType::CreateEntry);
        assert_eq!(result.title.as_deref(), Some("kitchen"));
        assert_eq!(entries.len(), 1);

        let entry_id = result.result.unwrap()["entry_id"]
            .as_str()
            .unwrap()
            .to_string();
        let entry = entries.get(&entry_id).unwrap();
        assert_eq!(entry.data_str("name"), Some("kitchen"));
        assert!(entry.is_loaded());
        assert_eq!(setups.load(Ordering::SeqCst), 1);
        assert!(flows.list_flows().await.is_empty());
    }

    #[tokio::test]
    async fn test_failed_setup_still_creates_entry() {
        let (_dir, entries, flows) = setup(DemoIntegration::failing());
        let started = flows.start_flow(DEMO_DOMAIN).await.unwrap();

        let result = flows
            .progress_flow(&started.flow_id, input(&[("name", json!("garage"))]))
            .await
            .unwrap();

        assert_eq!(result.result_type, FlowResultType::CreateEntry);
        let entry = entries.iter().next().unwrap();
        assert_eq!(entry.state, ConfigEntryState::SetupError);
    }

    #[tokio::test]
    async fn test_duplicate_unique_id_aborts() {
        let (_dir, entries, flows) = setup(DemoIntegration::default());

        let first = flows.start_flow(DEMO_DOMAIN).await.unwrap();
        flows
            .progress_flow(&first.flow_id, input(&[("name", json!("kitchen"))]))
            .await
            .unwrap();

        let second = flows.start_flow(DEMO_DOMAIN).await.unwrap();
        let result = flows
            .progress_flow(&second.flow_id, input(&[("name", json!("kitchen"))]))
            .await
            .unwrap();

        assert_eq!(result.result_type, FlowResultType::Abort);
        assert_eq!(result.reason.as_deref(), Some(ABORT_ALREADY_CONFIGURED));
        assert_eq!(entries.len(), 1);
    }

    #[tokio::test]
    async fn test_options_flow_updates_and_reloads() {
        let integration = DemoIntegration::default();
        let (setups, unloads) = (integration.setups.clone(), integration.unloads.clone());
        let (_dir, entries, flows) = setup(integration);

        let started = flows.start_flow(DEMO_DOMAIN).await.unwrap();
        let created = flows
            .progress_flow(&started.flow_id, input(&[("name", json!("kitchen"))]))
            .await
            .unwrap();
        let entry_id = created.result.unwrap()["entry_id"]
            .as_str()
            .unwrap()
            .to_string();

        let form = flows.start_options_flow(&entry_id).await.unwrap();
        assert_eq!(form.step_id.as_deref(), Some("init"));
        assert_eq!(form.field_default("count"), Some(&json!(1)));

        let saved = flows
            .progress_flow(&form.flow_id, input(&[("count", json!(5))]))
            .await
            .unwrap();
        assert_eq!(saved.result_type, FlowResultType::CreateEntry);

        let entry = entries.get(&entry_id).unwrap();
        assert_eq!(entry.option_i64("count"), Some(5));
        assert_eq!(entry.data_str("name"), Some("kitchen"));
        assert!(entry.is_loaded());
        assert_eq!(setups.load(Ordering::SeqCst), 2);
        assert_eq!(unloads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_options_flow_for_missing_entry() {
        let (_dir, _entries, flows) = setup(DemoIntegration::default());
        assert!(matches!(
            flows.start_options_flow("missing").await,
            Err(FlowError::UnknownEntry(_))
        ));
    }

    #[tokio::test]
    async fn test_abort_and_progress_unknown_flow() {
        let (_dir, _entries, flows) = setup(DemoIntegration::default());
        let started = flows.start_flow(DEMO_DOMAIN).await.unwrap();

        tokio_test::assert_ok!(flows.abort_flow(&started.flow_id).await);
        tokio_test::assert_err!(flows.abort_flow(&started.flow_id).await);
        assert!(matches!(
            flows
                .progress_flow(&started.flow_id, FlowInput::new())
                .await,
            Err(FlowError::UnknownFlow(_))
        ));
    }

    #[test]
    fn test_flow_result_serialization() {
        let mut result = FlowResult::new("abc", DEMO_DOMAIN, FlowResultType::Form);
        result.step_id = Some("user".to_string());
        result.data_schema = vec![
            FormField::required("url", FieldType::String),
            FormField::optional("scan_interval", FieldType::Integer)
                .with_default(60),
        ];

        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["type"], "form");
        assert_eq!(json["errors"], serde_json::Value::Null);
        assert_eq!(json["data_schema"][0]["type"], "string");
        assert_eq!(json["data_schema"][1]["default"], 60);
        assert!(json.get("title").is_none());
    }
}
