//! Polling of Grocy tasks and chores

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ha_helpers::{UpdateFailed, UpdateMethod};
use serde_json::Value;

use crate::api::GrocyClient;
use crate::consts::UPDATE_TIMEOUT;

/// One poll result; both lists in the order Grocy returned them
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GrocyData {
    pub tasks: Vec<Value>,
    pub chores: Vec<Value>,
}

/// Fetches tasks then chores, failing the whole cycle if either call fails
pub struct GrocyDataUpdater {
    client: Arc<dyn GrocyClient>,
    timeout: Duration,
}

impl GrocyDataUpdater {
    pub fn new(client: Arc<dyn GrocyClient>) -> Self {
        Self {
            client,
            timeout: UPDATE_TIMEOUT,
        }
    }
}

#[async_trait]
impl UpdateMethod<GrocyData> for GrocyDataUpdater {
    async fn update(&self) -> Result<GrocyData, UpdateFailed> {
        let fetch = async {
            let tasks = self.client.get_tasks().await?;
            let chores = self.client.get_chores().await?;
            Ok::<_, crate::api::ApiError>(GrocyData { tasks, chores })
        };

        match tokio::time::timeout(self.timeout, fetch).await {
            Ok(Ok(data)) => Ok(data),
            Ok(Err(err)) => Err(UpdateFailed::new(format!(
                "Error communicating with API: {err}"
            ))),
            Err(_) => Err(UpdateFailed::new(format!(
                "Error communicating with API: timed out after {:?}",
                self.timeout
            ))),
        }
    }
}
