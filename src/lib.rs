pub mod client;
pub mod consume;
pub mod message;
pub mod service;

pub use client::{KafkaClient, MemoryCluster};
pub use consume::{
    decode_page_token, ListMessageRequest, ListMessagesProgress, MessagePage, MessageService,
    RecordFilter, StartOffset,
};
pub use message::{ConsumedRecord, TopicPartition};
pub use service::GLOBAL_CONFIG;
pub use service::{
    global_config, setup_local_tracing, setup_tracing, AppError, AppResult, ConsoleConfig,
};
