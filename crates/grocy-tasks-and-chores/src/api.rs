//! Grocy REST client
//!
//! Every call sends the API key in the `GROCY-API-KEY` header and returns
//! the decoded JSON as-is. Failures come back as an [`ApiError`] kind so
//! callers can tell auth rejections from unreachable servers and from
//! unexpected responses.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, instrument};

use crate::consts::{
    API_CHORES_ENDPOINT, API_KEY_HEADER, API_SYSTEM_INFO_ENDPOINT, API_TASKS_ENDPOINT,
    VALIDATION_TIMEOUT,
};

#[derive(Debug, Error)]
pub enum ApiError {
    /// The request could not be built (bad URL, bad header value)
    #[error("invalid request to {url}: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("cannot reach {url}: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("request to {url} timed out")]
    Timeout { url: String },

    #[error("{url} rejected the API key (HTTP {status})")]
    Unauthorized { url: String, status: u16 },

    #[error("{url} returned HTTP {status}")]
    Status { url: String, status: u16 },

    #[error("invalid response from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: reqwest::Error,
    },
}

impl ApiError {
    fn from_reqwest(url: &str, err: reqwest::Error) -> Self {
        let url = url.to_string();
        if err.is_timeout() {
            Self::Timeout { url }
        } else if err.is_builder() {
            Self::Request { url, source: err }
        } else if err.is_decode() {
            Self::Decode { url, source: err }
        } else {
            Self::Transport { url, source: err }
        }
    }
}

/// Calls made against a Grocy instance
#[async_trait]
pub trait GrocyClient: Send + Sync {
    /// `GET /api/system/info`, used to check connectivity and the key
    async fn system_info(&self) -> Result<Value, ApiError>;

    /// `GET /api/tasks`
    async fn get_tasks(&self) -> Result<Vec<Value>, ApiError>;

    /// `GET /api/chores`
    async fn get_chores(&self) -> Result<Vec<Value>, ApiError>;
}

/// [`GrocyClient`] over HTTP
#[derive(Clone)]
pub struct GrocyApi {
    http: Client,
    base_url: String,
    api_key: String,
}

impl GrocyApi {
    pub fn new(http: Client, base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        let base_url: String = base_url.into();
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.into(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, endpoint: &str) -> String {
        format!("{}{}", self.base_url, endpoint)
    }

    #[instrument(skip(self), fields(base_url = %self.base_url))]
    async fn get_json<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        timeout: Option<Duration>,
    ) -> Result<T, ApiError> {
        let url = self.url(endpoint);
        let mut request = self.http.get(&url).header(API_KEY_HEADER, &self.api_key);
        if let Some(timeout) = timeout {
            request = request.timeout(timeout);
        }

        let response = request
            .send()
            .await
            .map_err(|err| ApiError::from_reqwest(&url, err))?;

        let status = response.status();
        debug!(status = status.as_u16(), "GET {}", endpoint);
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(ApiError::Unauthorized {
                url,
                status: status.as_u16(),
            });
        }
        if !status.is_success() {
            return Err(ApiError::Status {
                url,
                status: status.as_u16(),
            });
        }

        response
            .json::<T>()
            .await
            .map_err(|err| ApiError::from_reqwest(&url, err))
    }
}

#[async_trait]
impl GrocyClient for GrocyApi {
    async fn system_info(&self) -> Result<Value, ApiError> {
        self.get_json(API_SYSTEM_INFO_ENDPOINT, Some(VALIDATION_TIMEOUT))
            .await
    }

    async fn get_tasks(&self) -> Result<Vec<Value>, ApiError> {
        self.get_json(API_TASKS_ENDPOINT, None).await
    }

    async fn get_chores(&self) -> Result<Vec<Value>, ApiError> {
        self.get_json(API_CHORES_ENDPOINT, None).await
    }
}
