//! Typed configuration for queues and stores.
//!
//! Options come from TOML (file or string) with every field defaulted,
//! then `BATCHQ_*` environment variables override them. The database URL
//! is wrapped in `secrecy::SecretString` so it never reaches the logs.

pub mod secrets;

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Error, Result};
use crate::model::Order;
use secrets::SecretString;

/// Behaviour of one queue.
#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct QueueOptions {
    /// Cancel the batch running a task when the same id is pushed again.
    pub cancel_if_running: bool,
    pub order: Order,
    /// Maximum tasks per claimed batch.
    pub batch_size: usize,
    /// Wait this long for a batch to fill before claiming.
    pub batch_delay_ms: u64,
    /// Maximum batches in flight.
    pub concurrent: usize,
    /// Per-batch time limit. Unset means no limit.
    pub max_timeout_ms: Option<u64>,
    /// Retries allowed after the first failed attempt.
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    /// Pause after a batch ends before admitting the next one.
    pub after_process_delay_ms: u64,
    /// Start processing stored tasks as soon as the store connects.
    pub auto_resume: bool,
    pub store_max_retries: u32,
    pub store_retry_timeout_ms: u64,
    pub precondition_retry_timeout_ms: u64,
    pub store: StoreSpec,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            cancel_if_running: false,
            order: Order::Fifo,
            batch_size: 1,
            batch_delay_ms: 0,
            concurrent: 1,
            max_timeout_ms: None,
            max_retries: 0,
            retry_delay_ms: 0,
            after_process_delay_ms: 0,
            auto_resume: true,
            store_max_retries: 3,
            store_retry_timeout_ms: 1000,
            precondition_retry_timeout_ms: 1000,
            store: StoreSpec::default(),
        }
    }
}

impl QueueOptions {
    pub fn batch_delay(&self) -> Duration {
        Duration::from_millis(self.batch_delay_ms)
    }

    pub fn max_timeout(&self) -> Option<Duration> {
        self.max_timeout_ms.map(Duration::from_millis)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn after_process_delay(&self) -> Duration {
        Duration::from_millis(self.after_process_delay_ms)
    }

    pub fn store_retry_timeout(&self) -> Duration {
        Duration::from_millis(self.store_retry_timeout_ms)
    }

    pub fn precondition_retry_timeout(&self) -> Duration {
        Duration::from_millis(self.precondition_retry_timeout_ms)
    }

    /// Reject options no queue can run with.
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(Error::Config("batch_size must be at least 1".into()));
        }
        if self.concurrent == 0 {
            return Err(Error::Config("concurrent must be at least 1".into()));
        }
        Ok(())
    }

    /// Apply `BATCHQ_*` environment overrides.
    pub fn with_env_overrides(mut self) -> Result<Self> {
        if let Some(v) = parsed_var("BATCHQ_BATCH_SIZE")? {
            self.batch_size = v;
        }
        if let Some(v) = parsed_var("BATCHQ_BATCH_DELAY_MS")? {
            self.batch_delay_ms = v;
        }
        if let Some(v) = parsed_var("BATCHQ_CONCURRENT")? {
            self.concurrent = v;
        }
        if let Some(v) = parsed_var("BATCHQ_MAX_TIMEOUT_MS")? {
            self.max_timeout_ms = Some(v);
        }
        if let Some(v) = parsed_var("BATCHQ_MAX_RETRIES")? {
            self.max_retries = v;
        }
        if let Some(v) = parsed_var("BATCHQ_RETRY_DELAY_MS")? {
            self.retry_delay_ms = v;
        }
        if let Ok(order) = std::env::var("BATCHQ_ORDER") {
            self.order = match order.as_str() {
                "fifo" => Order::Fifo,
                "filo" | "lifo" => Order::Filo,
                other => {
                    return Err(Error::Config(format!("BATCHQ_ORDER: unknown order {other}")));
                }
            };
        }
        if let Ok(kind) = std::env::var("BATCHQ_STORE") {
            self.store.kind = kind;
        }
        if let Ok(path) = std::env::var("BATCHQ_STORE_PATH") {
            self.store.path = Some(path);
        }
        if let Ok(table) = std::env::var("BATCHQ_STORE_TABLE") {
            self.store.table = table;
        }
        if let Ok(url) = std::env::var("DATABASE_URL") {
            self.store.url = Some(SecretString::from(url));
        }
        Ok(self)
    }
}

/// Which store a queue persists into.
#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StoreSpec {
    /// Registry tag: `memory`, `sqlite`, `postgres`, or a custom kind.
    pub kind: String,
    /// SQLite file. Unset means an in-memory database.
    pub path: Option<String>,
    /// Connection URL. Takes precedence over `path`.
    #[serde(deserialize_with = "secrets::deserialize_optional")]
    pub url: Option<SecretString>,
    pub table: String,
}

impl Default for StoreSpec {
    fn default() -> Self {
        Self {
            kind: "memory".to_string(),
            path: None,
            url: None,
            table: "tasks".to_string(),
        }
    }
}

impl StoreSpec {
    pub fn memory() -> Self {
        Self::default()
    }

    pub fn sqlite(path: Option<&str>) -> Self {
        Self {
            kind: "sqlite".to_string(),
            path: path.map(str::to_string),
            ..Self::default()
        }
    }

    pub fn postgres(url: impl Into<String>) -> Self {
        Self {
            kind: "postgres".to_string(),
            url: Some(SecretString::from(url.into())),
            ..Self::default()
        }
    }
}

/// Process-level configuration: the queue plus telemetry settings.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    pub queue: QueueOptions,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            queue: QueueOptions::default(),
            otel_endpoint: None,
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    pub fn from_toml_str(source: &str) -> Result<Self> {
        toml::from_str(source).map_err(|e| Error::Config(format!("invalid config: {e}")))
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let source = std::fs::read_to_string(path)?;
        Self::from_toml_str(&source)
    }

    /// Load configuration for the current process.
    ///
    /// Reads the TOML file named by `BATCHQ_CONFIG` if set, then applies
    /// environment overrides. In local dev, call `dotenvy::dotenv().ok()`
    /// before this.
    pub fn from_env() -> Result<Self> {
        let mut config = match std::env::var("BATCHQ_CONFIG") {
            Ok(path) => Self::from_file(path)?,
            Err(_) => Self::default(),
        };
        config.queue = config.queue.with_env_overrides()?;
        if let Ok(endpoint) = std::env::var("OTEL_ENDPOINT") {
            config.otel_endpoint = Some(endpoint);
        }
        if let Ok(level) = std::env::var("LOG_LEVEL") {
            config.log_level = level;
        }
        config.queue.validate()?;
        Ok(config)
    }
}

fn parsed_var<T>(name: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .parse()
            .map(Some)
            .map_err(|e| Error::Config(format!("{name}: {e}"))),
        Err(_) => Ok(None),
    }
}
