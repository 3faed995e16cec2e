//! Home Assistant Rust Server
//!
//! Loads the config entries stored under `CONFIG_DIR/.storage`, sets them
//! up and runs until Ctrl-C. Without a Grocy entry the Grocy config flow is
//! run in the terminal first.
//!
//! Usage: `homeassistant [CONFIG_DIR]` (default `config`). Log filtering
//! follows `RUST_LOG` (default `info`).

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context as _, Result};
use grocy_tasks_and_chores::{GrocyIntegration, DOMAIN as GROCY_DOMAIN};
use ha_config_entries::{
    ConfigEntries, FieldType, FlowInput, FlowManager, FlowResult, FlowResultType, FormField,
    SetupContext,
};
use ha_core::events::{StateChangedData, STATE_CHANGED};
use ha_state_store::StateStore;
use ha_storage::Storage;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};
use tokio::sync::broadcast;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

const DEFAULT_CONFIG_DIR: &str = "config";

/// The central Home Assistant instance
pub struct HomeAssistant {
    /// Entity states
    pub states: Arc<StateStore>,
    /// Config entries and their integrations
    pub config_entries: Arc<ConfigEntries>,
    /// Config and options flows
    pub flows: FlowManager,
}

impl HomeAssistant {
    /// Create a new Home Assistant instance storing its data in `config_dir`
    pub fn new(config_dir: impl Into<PathBuf>) -> Self {
        let states = Arc::new(StateStore::new());
        let storage = Arc::new(Storage::new(config_dir.into()));
        let config_entries = Arc::new(ConfigEntries::new(
            storage,
            SetupContext::new(states.clone()),
        ));
        config_entries.register_integration(Arc::new(GrocyIntegration::new()));
        let flows = FlowManager::new(config_entries.clone());

        Self {
            states,
            config_entries,
            flows,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(true)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config_dir = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_DIR));
    info!("Starting Home Assistant (Rust) with config {}", config_dir.display());

    let hass = HomeAssistant::new(&config_dir);
    hass.config_entries
        .load()
        .await
        .context("loading config entries")?;

    for (entry_id, result) in hass.config_entries.setup_all().await {
        if let Err(err) = result {
            error!("Config entry {} failed to set up: {}", entry_id, err);
        }
    }

    let state_log = tokio::spawn(log_state_changes(hass.states.subscribe()));

    if hass.config_entries.get_by_domain(GROCY_DOMAIN).is_empty() {
        info!("No Grocy instance configured yet");
        run_config_flow(&hass.flows, GROCY_DOMAIN).await?;
    }

    info!("Home Assistant is running");

    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");

    hass.config_entries.unload_all().await;
    state_log.abort();

    Ok(())
}

async fn log_state_changes(mut changes: broadcast::Receiver<StateChangedData>) {
    loop {
        match changes.recv().await {
            Ok(change) => match change.new_state {
                Some(state) => {
                    let entity_id = &change.entity_id;
                    info!(event = STATE_CHANGED, "{} = {}", entity_id, state.state)
                }
                None => info!(event = STATE_CHANGED, "{} removed", change.entity_id),
            },
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!("State log lagged by {} changes", n);
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

/// Drive a config flow from the terminal until it creates an entry or aborts
async fn run_config_flow(flows: &FlowManager, domain: &str) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut result = flows.start_flow(domain).await?;

    loop {
        match result.result_type {
            FlowResultType::Form => {
                let input = prompt_form(&mut lines, &result).await?;
                result = flows.progress_flow(&result.flow_id, input).await?;
            }
            FlowResultType::CreateEntry => {
                info!(
                    "Created {} entry {}",
                    domain,
                    result.title.as_deref().unwrap_or_default()
                );
                return Ok(());
            }
            FlowResultType::Abort => {
                warn!(
                    "Setup of {} aborted: {}",
                    domain,
                    result.reason.as_deref().unwrap_or("unknown")
                );
                return Ok(());
            }
        }
    }
}

async fn prompt_form(lines: &mut Lines<BufReader<Stdin>>, form: &FlowResult) -> Result<FlowInput> {
    if let Some(errors) = &form.errors {
        for (field, code) in errors {
            println!("error ({field}): {code}");
        }
    }

    let mut input = FlowInput::new();
    for field in &form.data_schema {
        match &field.default {
            Some(default) => print!("{} [{}]: ", field.name, display_default(default)),
            None => print!("{}: ", field.name),
        }
        std::io::stdout().flush()?;

        let Some(line) = lines.next_line().await? else {
            bail!("stdin closed during {} setup", form.handler);
        };
        if let Some(value) = field_value(field, &line) {
            input.insert(field.name.clone(), value);
        }
    }
    Ok(input)
}

fn display_default(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Value for a typed answer; empty answers fall back to the default
fn field_value(field: &FormField, answer: &str) -> Option<Value> {
    let answer = answer.trim();
    if answer.is_empty() {
        return field.default.clone();
    }
    match field.field_type {
        FieldType::Integer => Some(
            answer
                .parse::<i64>()
                .map(Value::from)
                .unwrap_or_else(|_| Value::from(answer)),
        ),
        FieldType::String => Some(Value::from(answer)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_field_value() {
        let url = FormField::required("url", FieldType::String);
        assert_eq!(
            field_value(&url, " http://grocy.local \n"),
            Some(json!("http://grocy.local"))
        );
        assert_eq!(field_value(&url, ""), None);

        let interval = FormField::optional("scan_interval", FieldType::Integer)
            .with_default(60);
        assert_eq!(field_value(&interval, "120"), Some(json!(120)));
        assert_eq!(field_value(&interval, ""), Some(json!(60)));
        assert_eq!(field_value(&interval, "soon"), Some(json!("soon")));
    }
}
