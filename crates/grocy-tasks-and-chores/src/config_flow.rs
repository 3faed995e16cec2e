//! Config flow for the Grocy tasks and chores integration
//!
//! The `user` step asks for the Grocy URL and API key and only creates an
//! entry once a call to the system info endpoint succeeded with them. The
//! options flow (`init` step) edits the scan interval.

use std::collections::HashMap;

use async_trait::async_trait;
use ha_config_entries::{
    ConfigEntry, FieldType, FlowError, FlowHandler, FlowInput, FormField, StepResult,
};
use ha_core::consts::{CONF_API_KEY, CONF_URL};
use reqwest::{Client, Url};
use serde_json::Value;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::api::{ApiError, GrocyApi, GrocyClient};
use crate::consts::{CONF_SCAN_INTERVAL, DEFAULT_NAME, DEFAULT_SCAN_INTERVAL};
use crate::profile::normalize_url;

pub const STEP_USER: &str = "user";
pub const STEP_INIT: &str = "init";

/// Why user input was rejected
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("invalid URL: {0}")]
    InvalidUrl(String),

    #[error("cannot connect: {0}")]
    CannotConnect(#[source] ApiError),

    #[error("invalid authentication: {0}")]
    InvalidAuth(#[source] ApiError),

    #[error("unexpected error: {0}")]
    Unknown(String),
}

impl ValidationError {
    /// Error code shown in the form
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidUrl(_) => "invalid_url",
            Self::CannotConnect(_) => "cannot_connect",
            Self::InvalidAuth(_) => "invalid_auth",
            Self::Unknown(_) => "unknown",
        }
    }
}

impl From<ApiError> for ValidationError {
    fn from(err: ApiError) -> Self {
        match err {
            ApiError::Transport { .. } | ApiError::Timeout { .. } | ApiError::Status { .. } => {
                Self::CannotConnect(err)
            }
            ApiError::Unauthorized { .. } => Self::InvalidAuth(err),
            ApiError::Request { .. } | ApiError::Decode { .. } => Self::Unknown(err.to_string()),
        }
    }
}

/// Validated connection, ready to become an entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedInfo {
    pub title: String,
}

/// Check that `url` is absolute and that Grocy answers there with `api_key`
pub async fn validate_input(
    http: &Client,
    url: &str,
    api_key: &str,
) -> Result<ValidatedInfo, ValidationError> {
    let parsed = Url::parse(url).map_err(|err| {
        error!("Invalid URL format: {}", err);
        ValidationError::InvalidUrl(err.to_string())
    })?;
    if !parsed.has_host() {
        error!("Invalid URL format: {} has no host", url);
        return Err(ValidationError::InvalidUrl(format!("{url} has no host")));
    }
    // The parser repairs `http:host` into `http://host/`
    if !url.contains("://") {
        error!("Invalid URL format: {} has no authority separator", url);
        return Err(ValidationError::InvalidUrl(format!("{url} is missing '://'")));
    }

    let api = GrocyApi::new(http.clone(), url, api_key);
    api.system_info().await.map_err(|err| {
        let err = ValidationError::from(err);
        error!("Validation of {} failed: {}", url, err);
        err
    })?;

    Ok(ValidatedInfo {
        title: DEFAULT_NAME.to_string(),
    })
}

/// Non-empty string field from submitted input
fn input_str<'a>(input: &'a FlowInput, key: &str) -> Option<&'a str> {
    input
        .get(key)
        .and_then(Value::as_str)
        .filter(|value| !value.trim().is_empty())
}

/// Creates a Grocy entry from URL and API key
pub struct GrocyConfigFlow {
    http: Client,
}

impl GrocyConfigFlow {
    pub fn new(http: Client) -> Self {
        Self { http }
    }

    /// The `user` form; `url` is echoed back as its default
    fn user_form(url: Option<&str>, errors: HashMap<String, String>) -> StepResult {
        let mut url_field = FormField::required(CONF_URL, FieldType::String);
        if let Some(url) = url {
            url_field = url_field.with_default(url);
        }
        StepResult::ShowForm {
            step_id: STEP_USER.to_string(),
            data_schema: vec![
                url_field,
                FormField::required(CONF_API_KEY, FieldType::String),
            ],
            errors,
        }
    }

    async fn step_user(&self, user_input: Option<FlowInput>) -> StepResult {
        let Some(input) = user_input else {
            return Self::user_form(None, HashMap::new());
        };

        let url = input_str(&input, CONF_URL);
        let api_key = input_str(&input, CONF_API_KEY);
        let (Some(url), Some(api_key)) = (url, api_key) else {
            let errors = [CONF_URL, CONF_API_KEY]
                .into_iter()
                .filter(|key| input_str(&input, key).is_none())
                .map(|key| (key.to_string(), "required".to_string()))
                .collect();
            return Self::user_form(url, errors);
        };

        match validate_input(&self.http, url, api_key).await {
            Ok(info) => {
                info!("Validated Grocy at {}", url);
                StepResult::CreateEntry {
                    title: info.title,
                    data: HashMap::from([
                        (CONF_URL.to_string(), Value::from(url)),
                        (CONF_API_KEY.to_string(), Value::from(api_key)),
                    ]),
                    unique_id: Some(normalize_url(url)),
                }
            }
            Err(err) => {
                let errors = HashMap::from([("base".to_string(), err.code().to_string())]);
                Self::user_form(Some(url), errors)
            }
        }
    }
}

#[async_trait]
impl FlowHandler for GrocyConfigFlow {
    fn init_step(&self) -> &'static str {
        STEP_USER
    }

    async fn step(
        &mut self,
        step_id: &str,
        user_input: Option<FlowInput>,
    ) -> Result<StepResult, FlowError> {
        match step_id {
            STEP_USER => Ok(self.step_user(user_input).await),
            other => Err(FlowError::UnknownStep(other.to_string())),
        }
    }
}

/// Edits the scan interval of an existing entry
pub struct GrocyOptionsFlow {
    current_interval: i64,
}

impl GrocyOptionsFlow {
    pub fn new(entry: &ConfigEntry) -> Self {
        Self {
            current_interval: entry
                .option_i64(CONF_SCAN_INTERVAL)
                .unwrap_or(DEFAULT_SCAN_INTERVAL),
        }
    }

    fn init_form(&self, errors: HashMap<String, String>) -> StepResult {
        StepResult::ShowForm {
            step_id: STEP_INIT.to_string(),
            data_schema: vec![
                FormField::optional(CONF_SCAN_INTERVAL, FieldType::Integer)
                    .with_default(self.current_interval),
            ],
            errors,
        }
    }
}

/// Integer from JSON, also accepting integer strings typed into a prompt
fn parse_interval(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

#[async_trait]
impl FlowHandler for GrocyOptionsFlow {
    fn init_step(&self) -> &'static str {
        STEP_INIT
    }

    async fn step(
        &mut self,
        step_id: &str,
        user_input: Option<FlowInput>,
    ) -> Result<StepResult, FlowError> {
        if step_id != STEP_INIT {
            return Err(FlowError::UnknownStep(step_id.to_string()));
        }
        let Some(input) = user_input else {
            return Ok(self.init_form(HashMap::new()));
        };

        let interval = match input.get(CONF_SCAN_INTERVAL) {
            None | Some(Value::Null) => self.current_interval,
            Some(value) => match parse_interval(value) {
                Some(interval) => interval,
                None => {
                    warn!("Rejected scan interval {}", value);
                    let errors = HashMap::from([(
                        "base".to_string(),
                        "invalid_scan_interval".to_string(),
                    )]);
                    return Ok(self.init_form(errors));
                }
            },
        };

        Ok(StepResult::create_entry(
            "",
            HashMap::from([(CONF_SCAN_INTERVAL.to_string(), Value::from(interval))]),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consts::DOMAIN;
    use serde_json::json;

    fn input(pairs: &[(&str, Value)]) -> FlowInput {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    fn base_error(result: &StepResult) -> Option<&str> {
        match result {
            StepResult::ShowForm { errors, .. } => errors.get("base").map(String::as_str),
            _ => None,
        }
    }

    #[tokio::test]
    async fn test_malformed_urls_rejected_without_request() {
        let http = Client::new();
        let malformed = [
            "grocy.local",
            "localhost:9283",
            "not a url",
            "",
            "mailto:admin@grocy.local",
            "http:grocy.local",
            "https:/grocy.local",
        ];
        for url in malformed {
            let err = validate_input(&http, url, "key").await.unwrap_err();
            assert!(
                matches!(err, ValidationError::InvalidUrl(_)),
                "{url}: {err:?}"
            );
            assert_eq!(err.code(), "invalid_url");
        }
    }

    #[test]
    fn test_api_error_classification() {
        let url = "http://grocy.local".to_string();
        let unauthorized = ApiError::Unauthorized {
            url: url.clone(),
            status: 401,
        };
        let status = ApiError::Status {
            url: url.clone(),
            status: 500,
        };
        let timeout = ApiError::Timeout { url };

        assert_eq!(ValidationError::from(unauthorized).code(), "invalid_auth");
        assert_eq!(ValidationError::from(status).code(), "cannot_connect");
        assert_eq!(ValidationError::from(timeout).code(), "cannot_connect");
    }

    #[tokio::test]
    async fn test_user_step_shows_form() {
        let mut flow = GrocyConfigFlow::new(Client::new());
        assert_eq!(flow.init_step(), STEP_USER);

        let result = flow.step(STEP_USER, None).await.unwrap();
        let StepResult::ShowForm {
            data_schema,
            errors,
            ..
        } = result
        else {
            panic!("expected a form");
        };
        let names: Vec<_> = data_schema.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, [CONF_URL, CONF_API_KEY]);
        assert!(data_schema.iter().all(|f| f.required));
        assert!(errors.is_empty());
    }

    #[tokio::test]
    async fn test_user_step_missing_fields() {
        let mut flow = GrocyConfigFlow::new(Client::new());
        let result = flow
            .step(
                STEP_USER,
                Some(input(&[(CONF_URL, json!("http://grocy.local"))])),
            )
            .await
            .unwrap();

        let StepResult::ShowForm {
            data_schema,
            errors,
            ..
        } = result
        else {
            panic!("expected a form");
        };
        assert_eq!(
            errors.get(CONF_API_KEY).map(String::as_str),
            Some("required")
        );
        assert!(!errors.contains_key(CONF_URL));
        assert_eq!(data_schema[0].default, Some(json!("http://grocy.local")));
    }

    #[tokio::test]
    async fn test_user_step_invalid_url_echoes_input() {
        let mut flow = GrocyConfigFlow::new(Client::new());
        let result = flow
            .step(
                STEP_USER,
                Some(input(&[
                    (CONF_URL, json!("grocy.local")),
                    (CONF_API_KEY, json!("secret")),
                ])),
            )
            .await
            .unwrap();

        assert_eq!(base_error(&result), Some("invalid_url"));
        let StepResult::ShowForm { data_schema, .. } = result else {
            panic!("expected a form");
        };
        assert_eq!(data_schema[0].default, Some(json!("grocy.local")));
        assert_eq!(data_schema[1].default, None);
    }

    #[tokio::test]
    async fn test_unknown_step() {
        let mut flow = GrocyConfigFlow::new(Client::new());
        assert!(matches!(
            flow.step("reauth", None).await,
            Err(FlowError::UnknownStep(_))
        ));
    }

    fn entry_with_interval(interval: Option<i64>) -> ConfigEntry {
        let options = interval
            .map(|i| HashMap::from([(CONF_SCAN_INTERVAL.to_string(), json!(i))]))
            .unwrap_or_default();
        ConfigEntry::new(DOMAIN, DEFAULT_NAME).with_options(options)
    }

    #[tokio::test]
    async fn test_options_form_defaults() {
        for (stored, expected) in [(None, 60), (Some(300), 300)] {
            let mut flow = GrocyOptionsFlow::new(&entry_with_interval(stored));
            let StepResult::ShowForm { data_schema, .. } =
                flow.step(STEP_INIT, None).await.unwrap()
            else {
                panic!("expected a form");
            };
            assert_eq!(data_schema[0].name, CONF_SCAN_INTERVAL);
            assert!(!data_schema[0].required);
            assert_eq!(data_schema[0].default, Some(json!(expected)));
        }
    }

    #[tokio::test]
    async fn test_options_stores_value_verbatim() {
        let mut flow = GrocyOptionsFlow::new(&entry_with_interval(None));
        for (submitted, stored) in [(json!(120), 120), (json!("45"), 45), (json!(-1), -1)] {
            let result = flow
                .step(STEP_INIT, Some(input(&[(CONF_SCAN_INTERVAL, submitted)])))
                .await
                .unwrap();
            let StepResult::CreateEntry { data, .. } = result else {
                panic!("expected create_entry");
            };
            assert_eq!(data[CONF_SCAN_INTERVAL], json!(stored));
        }
    }

    #[tokio::test]
    async fn test_options_rejects_non_integer() {
        let mut flow = GrocyOptionsFlow::new(&entry_with_interval(Some(90)));
        let result = flow
            .step(STEP_INIT, Some(input(&[(CONF_SCAN_INTERVAL, json!("soon"))])))
            .await
            .unwrap();
        assert_eq!(base_error(&result), Some("invalid_scan_interval"));
    }

    #[tokio::test]
    async fn test_options_empty_submission_keeps_current() {
        let mut flow = GrocyOptionsFlow::new(&entry_with_interval(Some(90)));
        let result = flow.step(STEP_INIT, Some(FlowInput::new())).await.unwrap();
        let StepResult::CreateEntry { data, .. } = result else {
            panic!("expected create_entry");
        };
        assert_eq!(data[CONF_SCAN_INTERVAL], json!(90));
    }
}
