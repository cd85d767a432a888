extern crate config as _;

use std::path::Path;
use std::time::Duration;

use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};

use super::{AppError, AppResult};

pub static GLOBAL_CONFIG: OnceCell<ConsoleConfig> = OnceCell::new();
pub fn global_config() -> &'static ConsoleConfig {
    GLOBAL_CONFIG.get_or_init(ConsoleConfig::default)
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct GeneralConfig {
    pub name: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            name: env!("CARGO_PKG_NAME").to_string(),
        }
    }
}

/// Settings for talking to the cluster behind the console.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct KafkaConfig {
    /// Upper bound for partition/offset listing, separate from the overall request deadline.
    pub metadata_timeout_ms: u64,
    /// How long an idle poll waits before returning an empty batch.
    pub poll_interval_ms: u64,
    /// Maximum number of records a single poll hands back per partition.
    pub max_poll_records: usize,
}

impl Default for KafkaConfig {
    fn default() -> Self {
        Self {
            metadata_timeout_ms: 6000,
            poll_interval_ms: 100,
            max_poll_records: 500,
        }
    }
}

impl KafkaConfig {
    pub fn metadata_timeout(&self) -> Duration {
        Duration::from_millis(self.metadata_timeout_ms)
    }
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ListMessagesConfig {
    pub default_page_size: usize,
    /// Time budget for a single filter evaluation.
    pub filter_timeout_ms: u64,
}

impl Default for ListMessagesConfig {
    fn default() -> Self {
        Self {
            default_page_size: 50,
            filter_timeout_ms: 1000,
        }
    }
}

impl ListMessagesConfig {
    pub fn filter_timeout(&self) -> Duration {
        Duration::from_millis(self.filter_timeout_ms)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct TracingConfig {
    /// export spans and metrics over OTLP, otherwise log to stdout only
    pub otlp_enabled: bool,
    pub log_dir: String,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            otlp_enabled: false,
            log_dir: "logs".to_string(),
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize, Clone)]
pub struct DemoTopic {
    pub name: String,
    pub partitions: i32,
    pub messages_per_partition: i64,
}

/// Topics seeded into the in-process cluster used by the CLI.
#[derive(Debug, Default, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct DemoConfig {
    pub topics: Vec<DemoTopic>,
}

#[derive(Debug, Default, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ConsoleConfig {
    pub general: GeneralConfig,
    pub kafka: KafkaConfig,
    pub list_messages: ListMessagesConfig,
    pub tracing: TracingConfig,
    pub demo: DemoConfig,
}

impl ConsoleConfig {
    pub fn set_up_config<P: AsRef<Path>>(path: P) -> AppResult<ConsoleConfig> {
        let path_str = path
            .as_ref()
            .to_str()
            .ok_or(AppError::InvalidArgument(format!(
                "config file path: {}",
                path.as_ref().to_string_lossy()
            )))?;
        let config = config::Config::builder()
            .add_source(config::File::with_name(path_str))
            .add_source(config::Environment::with_prefix("STONECONSOLE").separator("__"))
            .build()?;

        let console_config: ConsoleConfig = config.try_deserialize()?;

        Ok(console_config)
    }
}
