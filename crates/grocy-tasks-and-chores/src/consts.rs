//! Constants for the Grocy tasks and chores integration

use std::time::Duration;

pub const DOMAIN: &str = "grocy_tasks_and_chores";
pub const DEFAULT_NAME: &str = "Grocy Tasks and Chores";

pub const CONF_SCAN_INTERVAL: &str = "scan_interval";
/// Seconds
pub const DEFAULT_SCAN_INTERVAL: i64 = 60;
/// Shortest interval actually polled; one cycle may take up to [`UPDATE_TIMEOUT`]
pub const MIN_SCAN_INTERVAL: i64 = 10;

pub const API_SYSTEM_INFO_ENDPOINT: &str = "/api/system/info";
pub const API_TASKS_ENDPOINT: &str = "/api/tasks";
pub const API_CHORES_ENDPOINT: &str = "/api/chores";
pub const API_KEY_HEADER: &str = "GROCY-API-KEY";

/// Bound on one refresh cycle (tasks and chores)
pub const UPDATE_TIMEOUT: Duration = Duration::from_secs(10);
/// Bound on the system info call made while validating input
pub const VALIDATION_TIMEOUT: Duration = Duration::from_secs(10);
