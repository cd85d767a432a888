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

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::RwLock;
use tracing::{debug, trace};

use crate::message::{ConsumedRecord, TopicPartition};
use crate::service::{DemoConfig, KafkaConfig};
use crate::{AppError, AppResult};

use super::{AssignOffset, ConsumeSession, KafkaClient, ListedOffset, ListedOffsets};

#[derive(Debug, Default)]
struct PartitionLog {
    log_start_offset: i64,
    records: Vec<ConsumedRecord>,
    offline_reason: Option<String>,
}

impl PartitionLog {
    fn high_watermark(&self) -> i64 {
        self.log_start_offset + self.records.len() as i64
    }

    fn read_from(&self, offset: i64, max_records: usize) -> &[ConsumedRecord] {
        let start = (offset.max(self.log_start_offset) - self.log_start_offset) as usize;
        if start >= self.records.len() {
            return &[];
        }
        let end = (start + max_records).min(self.records.len());
        &self.records[start..end]
    }
}

#[derive(Debug, Default)]
struct ClusterState {
    topics: DashMap<String, Vec<Arc<RwLock<PartitionLog>>>>,
    offline: AtomicBool,
}

impl ClusterState {
    fn check_online(&self) -> AppResult<()> {
        if self.offline.load(Ordering::Acquire) {
            return Err(AppError::UpstreamUnavailable(
                "no broker reachable".to_string(),
            ));
        }
        Ok(())
    }

    fn partitions(&self, topic: &str) -> AppResult<Vec<Arc<RwLock<PartitionLog>>>> {
        self.check_online()?;
        self.topics
            .get(topic)
            .map(|partitions| partitions.clone())
            .ok_or_else(|| AppError::UnknownTopic(topic.to_string()))
    }

    fn partition(&self, topic: &str, partition: i32) -> AppResult<Arc<RwLock<PartitionLog>>> {
        let partitions = self.partitions(topic)?;
        usize::try_from(partition)
            .ok()
            .and_then(|idx| partitions.get(idx).cloned())
            .ok_or_else(|| {
                AppError::InvalidArgument(format!(
                    "unknown partition {}",
                    TopicPartition::new(topic, partition)
                ))
            })
    }

    fn list_offsets<F>(
        &self,
        topic: &str,
        partitions: &[i32],
        lookup: F,
    ) -> AppResult<ListedOffsets>
    where
        F: Fn(&PartitionLog) -> i64,
    {
        let logs = self.partitions(topic)?;
        let mut offsets = BTreeMap::new();
        for &partition_id in partitions {
            let listed = match usize::try_from(partition_id).ok().and_then(|idx| logs.get(idx)) {
                None => ListedOffset::failed(partition_id, "UNKNOWN_TOPIC_OR_PARTITION"),
                Some(log) => {
                    let log = log.read();
                    match &log.offline_reason {
                        Some(reason) => ListedOffset::failed(partition_id, reason.clone()),
                        None => ListedOffset::ok(partition_id, lookup(&log)),
                    }
                }
            };
            offsets.insert(partition_id, listed);
        }
        Ok(offsets)
    }
}

/// An in-process cluster whose partition logs have no offset gaps. Cloning
/// shares the same state.
#[derive(Debug, Clone)]
pub struct MemoryCluster {
    state: Arc<ClusterState>,
    poll_interval: Duration,
    max_poll_records: usize,
}

impl Default for MemoryCluster {
    fn default() -> Self {
        Self::from_config(&KafkaConfig::default())
    }
}

impl MemoryCluster {
    pub fn new(poll_interval: Duration, max_poll_records: usize) -> Self {
        Self {
            state: Arc::new(ClusterState::default()),
            poll_interval,
            max_poll_records: max_poll_records.max(1),
        }
    }

    pub fn from_config(kafka_config: &KafkaConfig) -> Self {
        Self::new(kafka_config.poll_interval(), kafka_config.max_poll_records)
    }

    pub fn create_topic(&self, topic: &str, partitions: i32) -> AppResult<()> {
        if partitions <= 0 {
            return Err(AppError::InvalidArgument(format!(
                "topic {} needs at least one partition, got {}",
                topic, partitions
            )));
        }
        if self.state.topics.contains_key(topic) {
            return Err(AppError::InvalidArgument(format!(
                "topic {} already exists",
                topic
            )));
        }
        let logs = (0..partitions)
            .map(|_| Arc::new(RwLock::new(PartitionLog::default())))
            .collect();
        self.state.topics.insert(topic.to_string(), logs);
        debug!("created topic {} with {} partitions", topic, partitions);
        Ok(())
    }

    /// Grows the topic to `total` partitions, which invalidates existing page tokens.
    pub fn add_partitions(&self, topic: &str, total: i32) -> AppResult<()> {
        let mut logs = self
            .state
            .topics
            .get_mut(topic)
            .ok_or_else(|| AppError::UnknownTopic(topic.to_string()))?;
        let current = logs.len() as i32;
        if total <= current {
            return Err(AppError::InvalidArgument(format!(
                "topic {} already has {} partitions",
                topic, current
            )));
        }
        for _ in current..total {
            logs.push(Arc::new(RwLock::new(PartitionLog::default())));
        }
        Ok(())
    }

    pub fn produce(
        &self,
        topic: &str,
        partition: i32,
        key: Option<Bytes>,
        value: Option<Bytes>,
        timestamp_ms: i64,
    ) -> AppResult<i64> {
        let log = self.state.partition(topic, partition)?;
        let mut log = log.write();
        let offset = log.high_watermark();
        log.records
            .push(ConsumedRecord::new(partition, offset, timestamp_ms, key, value));
        trace!("produced {}@{}", TopicPartition::new(topic, partition), offset);
        Ok(offset)
    }

    /// Retention: drops every record below `offset`, moving the low watermark up.
    pub fn delete_records_before(&self, topic: &str, partition: i32, offset: i64) -> AppResult<()> {
        let log = self.state.partition(topic, partition)?;
        let mut log = log.write();
        let target = offset.min(log.high_watermark());
        if target <= log.log_start_offset {
            return Ok(());
        }
        let removed = (target - log.log_start_offset) as usize;
        log.records.drain(..removed);
        log.log_start_offset = target;
        Ok(())
    }

    pub fn set_offline(&self, offline: bool) {
        self.state.offline.store(offline, Ordering::Release);
    }

    /// Makes offset listings fail for one partition, as if its leader were down.
    pub fn set_partition_offline(
        &self,
        topic: &str,
        partition: i32,
        reason: Option<String>,
    ) -> AppResult<()> {
        let log = self.state.partition(topic, partition)?;
        log.write().offline_reason = reason;
        Ok(())
    }

    /// Creates the configured demo topics and fills every partition with JSON
    /// values, one second apart starting at `base_timestamp_ms`.
    pub fn seed(&self, demo: &DemoConfig, base_timestamp_ms: i64) -> AppResult<()> {
        for topic in &demo.topics {
            self.create_topic(&topic.name, topic.partitions)?;
            for partition in 0..topic.partitions {
                for i in 0..topic.messages_per_partition {
                    let key = Bytes::from(format!("key-{}", i));
                    let value = Bytes::from(format!(
                        r#"{{"partition":{},"seq":{}}}"#,
                        partition, i
                    ));
                    self.produce(
                        &topic.name,
                        partition,
                        Some(key),
                        Some(value),
                        base_timestamp_ms + i * 1000,
                    )?;
                }
            }
        }
        Ok(())
    }
}

impl KafkaClient for MemoryCluster {
    type Session = MemorySession;

    async fn list_partitions(&self, topic: &str) -> AppResult<Vec<i32>> {
        let logs = self.state.partitions(topic)?;
        Ok((0..logs.len() as i32).collect())
    }

    async fn list_start_offsets(
        &self,
        topic: &str,
        partitions: &[i32],
    ) -> AppResult<ListedOffsets> {
        self.state
            .list_offsets(topic, partitions, |log| log.log_start_offset)
    }

    async fn list_end_offsets(&self, topic: &str, partitions: &[i32]) -> AppResult<ListedOffsets> {
        self.state
            .list_offsets(topic, partitions, PartitionLog::high_watermark)
    }

    async fn list_offsets_after_timestamp(
        &self,
        topic: &str,
        partitions: &[i32],
        timestamp_ms: i64,
    ) -> AppResult<ListedOffsets> {
        self.state.list_offsets(topic, partitions, |log| {
            log.records
                .iter()
                .find(|record| record.timestamp_ms >= timestamp_ms)
                .map_or(-1, |record| record.offset)
        })
    }

    async fn assign(
        &self,
        topic: &str,
        assignments: BTreeMap<i32, AssignOffset>,
    ) -> AppResult<MemorySession> {
        let mut positions = BTreeMap::new();
        for (partition_id, assign_offset) in assignments {
            let log = self.state.partition(topic, partition_id)?;
            let position = match assign_offset {
                AssignOffset::At(offset) => offset,
                AssignOffset::End => log.read().high_watermark(),
            };
            positions.insert(partition_id, (log, position));
        }
        debug!(
            "assigned session on topic {} to {} partitions",
            topic,
            positions.len()
        );
        Ok(MemorySession {
            state: self.state.clone(),
            positions,
            poll_interval: self.poll_interval,
            max_poll_records: self.max_poll_records,
        })
    }
}

#[derive(Debug)]
pub struct MemorySession {
    state: Arc<ClusterState>,
    positions: BTreeMap<i32, (Arc<RwLock<PartitionLog>>, i64)>,
    poll_interval: Duration,
    max_poll_records: usize,
}

impl MemorySession {
    fn read_available(&mut self) -> Vec<ConsumedRecord> {
        let mut batch = Vec::new();
        for (log, position) in self.positions.values_mut() {
            let log = log.read();
            // an offset below the low watermark resets to the earliest retained record
            let records = log.read_from(*position, self.max_poll_records);
            if let Some(last) = records.last() {
                *position = last.offset + 1;
                batch.extend_from_slice(records);
            }
        }
        batch
    }
}

impl ConsumeSession for MemorySession {
    async fn poll(&mut self) -> AppResult<Vec<ConsumedRecord>> {
        self.state.check_online()?;
        let batch = self.read_available();
        if batch.is_empty() {
            tokio::time::sleep(self.poll_interval).await;
        }
        Ok(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cluster_with_topic(partitions: i32, messages: i64) -> MemoryCluster {
        let cluster = MemoryCluster::new(Duration::from_millis(5), 100);
        cluster.create_topic("orders", partitions).unwrap();
        for partition in 0..partitions {
            for i in 0..messages {
                cluster
                    .produce("orders", partition, None, Some(Bytes::from("v")), i * 10)
                    .unwrap();
            }
        }
        cluster
    }

    #[tokio::test]
    async fn test_watermarks_follow_retention() {
        let cluster = cluster_with_topic(2, 20);
        cluster.delete_records_before("orders", 1, 5).unwrap();

        let starts = cluster.list_start_offsets("orders", &[0, 1]).await.unwrap();
        let ends = cluster.list_end_offsets("orders", &[0, 1]).await.unwrap();
        assert_eq!(starts[&0].offset, 0);
        assert_eq!(starts[&1].offset, 5);
        assert_eq!(ends[&0].offset, 20);
        assert_eq!(ends[&1].offset, 20);
    }

    #[tokio::test]
    async fn test_offsets_after_timestamp() {
        let cluster = cluster_with_topic(1, 10);
        let offsets = cluster
            .list_offsets_after_timestamp("orders", &[0], 35)
            .await
            .unwrap();
        assert_eq!(offsets[&0].offset, 4);

        let offsets = cluster
            .list_offsets_after_timestamp("orders", &[0], 10_000)
            .await
            .unwrap();
        assert_eq!(offsets[&0].offset, -1);
    }

    #[tokio::test]
    async fn test_offline_partition_fails_alone() {
        let cluster = cluster_with_topic(3, 1);
        cluster
            .set_partition_offline("orders", 2, Some("LEADER_NOT_AVAILABLE".to_string()))
            .unwrap();
        let ends = cluster.list_end_offsets("orders", &[0, 1, 2, 7]).await.unwrap();
        assert!(ends[&0].error.is_none());
        assert_eq!(ends[&2].error.as_deref(), Some("LEADER_NOT_AVAILABLE"));
        assert!(ends[&7].error.is_some());
    }

    #[tokio::test]
    async fn test_offline_cluster() {
        let cluster = cluster_with_topic(1, 1);
        cluster.set_offline(true);
        assert!(matches!(
            cluster.list_partitions("orders").await,
            Err(AppError::UpstreamUnavailable(_))
        ));
        assert!(matches!(
            cluster.list_partitions("missing").await,
            Err(AppError::UpstreamUnavailable(_))
        ));
        cluster.set_offline(false);
        assert!(matches!(
            cluster.list_partitions("missing").await,
            Err(AppError::UnknownTopic(_))
        ));
    }

    #[tokio::test]
    async fn test_session_reads_from_assigned_offsets() {
        let cluster = cluster_with_topic(2, 5);
        let mut assignments = BTreeMap::new();
        assignments.insert(0, AssignOffset::At(3));
        assignments.insert(1, AssignOffset::End);
        let mut session = cluster.assign("orders", assignments).await.unwrap();

        let batch = session.poll().await.unwrap();
        assert_eq!(
            batch.iter().map(|r| (r.partition_id, r.offset)).collect::<Vec<_>>(),
            vec![(0, 3), (0, 4)]
        );
        assert!(session.poll().await.unwrap().is_empty());

        cluster.produce("orders", 1, None, None, 0).unwrap();
        let batch = session.poll().await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!((batch[0].partition_id, batch[0].offset), (1, 5));
    }
}
