//! Sink configuration
//!
//! Keys follow the property names Kafka Connect deployments already use
//! (`kudu.master`, `max.retries`, ...); the dashed names are accepted as
//! aliases. A [`KuduSinkConfig`] can be read from YAML (with `${VAR}` and
//! `${VAR:-default}` expansion) or from a flat property map, and is turned
//! into an immutable [`ResolvedConfig`] once at startup.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::LazyLock;
use std::time::Duration;
use tracing::debug;
use validator::Validate;

use crate::batch::BatchSettings;
use crate::client::{MasterAddress, SessionOptions};
use crate::error::{ConnectError, Result};
use crate::mutation::OperationKind;
use crate::pool::{default_max_sessions, PoolConfig};
use crate::retry::{RetryPolicy, RowErrorPolicy};
use crate::router::RoutingConfig;

/// Pre-compiled regex for environment variable expansion
static ENV_VAR_REGEX: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(r"\$\{([a-zA-Z_][a-zA-Z0-9_]*)(?::-([^}]*))?\}")
        .expect("env var regex pattern is invalid - this is a bug")
});

/// Keys whose values stay strings when loading a property map
const STRING_KEYS: &[&str] = &[
    "kudu.master",
    "master-address-list",
    "kudu.table.field",
    "table-field",
    "kudu.table.filter",
    "table-filter",
    "kudu.operation",
    "kudu.row.error.policy",
];

/// Marker for "use the built-in default" on signed numeric options
const UNSET: i64 = -1;

/// Kudu sink connector configuration
#[derive(Debug, Clone, Serialize, Deserialize, Validate, JsonSchema)]
pub struct KuduSinkConfig {
    /// Comma-separated `host[:port]` list of masters
    #[serde(rename = "kudu.master", alias = "master-address-list")]
    #[validate(length(min = 1))]
    pub master_addresses: String,

    /// Session pool size; -1 uses twice the available parallelism
    #[serde(
        rename = "kudu.worker.count",
        alias = "worker-count",
        default = "default_unset_i32"
    )]
    pub worker_count: i32,

    /// User operation timeout in milliseconds; -1 uses 30 seconds
    #[serde(
        rename = "kudu.operation.timeout.ms",
        alias = "operation-timeout-ms",
        default = "default_unset_i64"
    )]
    pub operation_timeout_ms: i64,

    /// Socket read timeout in milliseconds; -1 uses 10 seconds
    #[serde(
        rename = "kudu.socket.read.timeout.ms",
        alias = "socket-read-timeout-ms",
        default = "default_unset_i64"
    )]
    pub socket_read_timeout_ms: i64,

    /// Record field naming the target table (defaults to the topic)
    #[serde(rename = "kudu.table.field", alias = "table-field", default)]
    pub table_field: Option<String>,

    /// Substring a table name must contain to receive writes
    #[serde(rename = "kudu.table.filter", alias = "table-filter", default)]
    pub table_filter: Option<String>,

    /// Merge record key fields into the row
    #[serde(rename = "kudu.key.insert", alias = "key-insert", default)]
    pub key_insert: bool,

    /// Mutation kind applied for every row
    #[serde(rename = "kudu.operation", default)]
    pub operation: OperationKind,

    /// Handling of rows the cluster rejects permanently
    #[serde(rename = "kudu.row.error.policy", default)]
    pub row_error_policy: RowErrorPolicy,

    /// Resubmissions of a failed batch before the task fails (default: 10)
    #[serde(
        rename = "max.retries",
        alias = "max-retries",
        default = "default_max_retries"
    )]
    pub max_retries: u32,

    /// Fixed delay before a resubmission in milliseconds (default: 3000)
    #[serde(
        rename = "retry.backoff.ms",
        alias = "retry-backoff-ms",
        default = "default_retry_backoff_ms"
    )]
    pub retry_backoff_ms: u64,

    /// Rows per batch (default: 1000)
    #[serde(rename = "batch.max.rows", default = "default_batch_max_rows")]
    #[validate(range(min = 1, max = 1000000))]
    pub batch_max_rows: usize,

    /// Maximum time a batch stays open in milliseconds (default: 1000)
    #[serde(rename = "batch.linger.ms", default = "default_batch_linger_ms")]
    pub batch_linger_ms: u64,

    /// Drain deadline on close in milliseconds (default: 30000)
    #[serde(rename = "shutdown.timeout.ms", default = "default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,
}

fn default_unset_i32() -> i32 {
    UNSET as i32
}

fn default_unset_i64() -> i64 {
    UNSET
}

fn default_max_retries() -> u32 {
    10
}

fn default_retry_backoff_ms() -> u64 {
    3000
}

fn default_batch_max_rows() -> usize {
    1000
}

fn default_batch_linger_ms() -> u64 {
    1000
}

fn default_shutdown_timeout_ms() -> u64 {
    30_000
}

impl KuduSinkConfig {
    /// Configuration with every option at its default
    pub fn new(master_addresses: impl Into<String>) -> Self {
        Self {
            master_addresses: master_addresses.into(),
            worker_count: default_unset_i32(),
            operation_timeout_ms: default_unset_i64(),
            socket_read_timeout_ms: default_unset_i64(),
            table_field: None,
            table_filter: None,
            key_insert: false,
            operation: OperationKind::default(),
            row_error_policy: RowErrorPolicy::default(),
            max_retries: default_max_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
            batch_max_rows: default_batch_max_rows(),
            batch_linger_ms: default_batch_linger_ms(),
            shutdown_timeout_ms: default_shutdown_timeout_ms(),
        }
    }

    /// Load configuration from a YAML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            ConnectError::config(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;
        let config = Self::from_yaml_str(&content)?;
        debug!(path = %path.display(), "Loaded sink configuration");
        Ok(config)
    }

    /// Parse YAML, expanding environment variables first
    pub fn from_yaml_str(content: &str) -> Result<Self> {
        let expanded = expand_env_vars(content);
        let config: Self = serde_yaml::from_str(&expanded)
            .map_err(|e| ConnectError::config(format!("Failed to parse config: {}", e)))?;
        config.check()?;
        Ok(config)
    }

    /// Build from a flat string property map as handed over by a Connect host
    pub fn from_properties(properties: &HashMap<String, String>) -> Result<Self> {
        let map: serde_json::Map<String, serde_json::Value> = properties
            .iter()
            .map(|(key, raw)| (key.clone(), property_value(key, raw)))
            .collect();

        let config: Self = serde_json::from_value(serde_json::Value::Object(map))
            .map_err(|e| ConnectError::config(format!("Invalid properties: {}", e)))?;
        config.check()?;
        Ok(config)
    }

    /// Run the declarative validation rules
    pub fn check(&self) -> Result<()> {
        self.validate()
            .map_err(|e| ConnectError::config(format!("Validation failed: {}", e)))
    }

    /// Apply defaults and cross-field checks
    pub fn resolve(&self) -> Result<ResolvedConfig> {
        self.check()?;

        let masters = MasterAddress::parse_list(&self.master_addresses)?;

        let worker_count = match self.worker_count {
            -1 => default_max_sessions(),
            n if n >= 1 => n as usize,
            n => {
                return Err(ConnectError::config(format!(
                    "kudu.worker.count must be -1 or at least 1, got {}",
                    n
                )))
            }
        };

        let defaults = SessionOptions::default();
        let session = SessionOptions {
            operation_timeout: timeout_or(
                "kudu.operation.timeout.ms",
                self.operation_timeout_ms,
                defaults.operation_timeout,
            )?,
            socket_read_timeout: timeout_or(
                "kudu.socket.read.timeout.ms",
                self.socket_read_timeout_ms,
                defaults.socket_read_timeout,
            )?,
        };

        let routing = RoutingConfig {
            table_field: non_empty(&self.table_field),
            table_filter: non_empty(&self.table_filter),
        };

        let retry = RetryPolicy::fixed(self.max_retries, Duration::from_millis(self.retry_backoff_ms))
            .with_row_error_policy(self.row_error_policy);

        let batch = BatchSettings::default()
            .with_max_rows(self.batch_max_rows)
            .with_linger(Duration::from_millis(self.batch_linger_ms));

        Ok(ResolvedConfig {
            masters,
            worker_count,
            session,
            routing,
            key_insert: self.key_insert,
            operation: self.operation,
            retry,
            batch,
            shutdown_timeout: Duration::from_millis(self.shutdown_timeout_ms),
        })
    }
}

/// Validated settings consumed by the sink task
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub masters: Vec<MasterAddress>,
    pub worker_count: usize,
    pub session: SessionOptions,
    pub routing: RoutingConfig,
    pub key_insert: bool,
    pub operation: OperationKind,
    pub retry: RetryPolicy,
    pub batch: BatchSettings,
    pub shutdown_timeout: Duration,
}

impl ResolvedConfig {
    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            masters: self.masters.clone(),
            max_sessions: self.worker_count,
            session: self.session,
        }
    }
}

/// Expand environment variables in the format ${VAR} or ${VAR:-default}
fn expand_env_vars(content: &str) -> String {
    ENV_VAR_REGEX
        .replace_all(content, |caps: &regex::Captures| {
            let var_name = &caps[1];
            let default = caps.get(2).map(|m| m.as_str());

            std::env::var(var_name).unwrap_or_else(|_| default.unwrap_or("").to_string())
        })
        .to_string()
}

fn property_value(key: &str, raw: &str) -> serde_json::Value {
    let trimmed = raw.trim();
    if STRING_KEYS.contains(&key) {
        return serde_json::Value::String(trimmed.to_string());
    }
    if let Ok(n) = trimmed.parse::<i64>() {
        return n.into();
    }
    if let Ok(b) = trimmed.parse::<bool>() {
        return b.into();
    }
    serde_json::Value::String(trimmed.to_string())
}

fn timeout_or(key: &str, millis: i64, default: Duration) -> Result<Duration> {
    match millis {
        UNSET => Ok(default),
        n if n > 0 => Ok(Duration::from_millis(n as u64)),
        n => Err(ConnectError::config(format!(
            "{} must be -1 or positive, got {}",
            key, n
        ))),
    }
}

fn non_empty(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}
