pub use record::{ConsumedRecord, RecordHeader};
pub use topic_partition::TopicPartition;

mod record;
mod topic_partition;
