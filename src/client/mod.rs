// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Kafka client collaborator
//!
//! The listing engine never speaks the wire protocol itself. It needs four
//! capabilities from whatever client sits underneath:
//! - partition listing for a topic
//! - start (low watermark) and end (high watermark) offset listing
//! - offset lookup by timestamp
//! - a streaming fetch session assigned to explicit partition/offset pairs
//!
//! [`MemoryCluster`] implements them in process for the CLI demo and the tests.

use std::collections::BTreeMap;
use std::future::Future;

use crate::message::ConsumedRecord;
use crate::AppResult;

pub use memory::{MemoryCluster, MemorySession};

mod memory;

/// One partition's answer to an offset listing. Brokers may answer for some
/// partitions and fail for others, so the error travels per partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListedOffset {
    pub partition_id: i32,
    pub offset: i64,
    pub error: Option<String>,
}

impl ListedOffset {
    pub fn ok(partition_id: i32, offset: i64) -> Self {
        Self {
            partition_id,
            offset,
            error: None,
        }
    }

    pub fn failed(partition_id: i32, error: impl Into<String>) -> Self {
        Self {
            partition_id,
            offset: -1,
            error: Some(error.into()),
        }
    }
}

pub type ListedOffsets = BTreeMap<i32, ListedOffset>;

/// Where a consume session starts reading a partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssignOffset {
    At(i64),
    /// The partition's end offset at assignment time, i.e. only future records.
    End,
}

/// Every call returns `AppError::UpstreamUnavailable` when the cluster cannot be
/// reached at all and `AppError::UnknownTopic` when the topic does not exist.
pub trait KafkaClient: Send + Sync {
    type Session: ConsumeSession;

    fn list_partitions(&self, topic: &str) -> impl Future<Output = AppResult<Vec<i32>>> + Send;

    fn list_start_offsets(
        &self,
        topic: &str,
        partitions: &[i32],
    ) -> impl Future<Output = AppResult<ListedOffsets>> + Send;

    fn list_end_offsets(
        &self,
        topic: &str,
        partitions: &[i32],
    ) -> impl Future<Output = AppResult<ListedOffsets>> + Send;

    /// Offset of the first record with a timestamp >= `timestamp_ms`, -1 when there is none.
    fn list_offsets_after_timestamp(
        &self,
        topic: &str,
        partitions: &[i32],
        timestamp_ms: i64,
    ) -> impl Future<Output = AppResult<ListedOffsets>> + Send;

    fn assign(
        &self,
        topic: &str,
        assignments: BTreeMap<i32, AssignOffset>,
    ) -> impl Future<Output = AppResult<Self::Session>> + Send;
}

/// A single consumer assigned to a fixed set of partitions. Dropping the session
/// releases it.
pub trait ConsumeSession: Send {
    /// Next batch of records in per-partition offset order. An empty batch means
    /// nothing new arrived during the poll interval.
    ///
    /// Offsets are assumed dense: every offset between the low and the high
    /// watermark is eventually returned. A gap at the end of a planned range,
    /// as left by compaction or transaction markers, keeps a bounded fetch
    /// polling until it is cancelled.
    fn poll(&mut self) -> impl Future<Output = AppResult<Vec<ConsumedRecord>>> + Send;
}
