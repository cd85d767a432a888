pub use app_error::{AppError, AppResult};
pub use config::{
    global_config, ConsoleConfig, DemoConfig, DemoTopic, GeneralConfig, KafkaConfig,
    ListMessagesConfig, TracingConfig, GLOBAL_CONFIG,
};
pub use tracing_config::{setup_local_tracing, setup_tracing, OtelGuard};

mod app_error;
mod config;
mod tracing_config;
