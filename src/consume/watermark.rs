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
use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::client::{KafkaClient, ListedOffsets};
use crate::message::TopicPartition;
use crate::{AppError, AppResult};

/// Offset bounds of one partition. `low` is the oldest retained offset, `high`
/// the offset the next produced record will get.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatermarkBounds {
    pub partition_id: i32,
    pub low: i64,
    pub high: i64,
}

impl WatermarkBounds {
    /// Start and end offsets are listed separately, so retention may move the
    /// low watermark past a stale high one; the bounds collapse to an empty range then.
    pub fn new(partition_id: i32, low: i64, high: i64) -> Self {
        Self {
            partition_id,
            low: low.min(high),
            high,
        }
    }

    pub fn message_count(&self) -> i64 {
        self.high - self.low
    }

    pub fn is_empty(&self) -> bool {
        self.low == self.high
    }
}

/// Watermarks of the partitions that answered, plus the reason for each that did not.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Watermarks {
    pub bounds: BTreeMap<i32, WatermarkBounds>,
    pub failures: BTreeMap<i32, String>,
}

impl Watermarks {
    pub fn from_bounds(bounds: impl IntoIterator<Item = WatermarkBounds>) -> Self {
        Self {
            bounds: bounds.into_iter().map(|b| (b.partition_id, b)).collect(),
            failures: BTreeMap::new(),
        }
    }

    pub fn get(&self, partition_id: i32) -> Option<&WatermarkBounds> {
        self.bounds.get(&partition_id)
    }

    /// Moves a partition from the usable set to the failed set.
    pub fn mark_failed(&mut self, partition_id: i32, reason: impl Into<String>) {
        self.bounds.remove(&partition_id);
        self.failures.insert(partition_id, reason.into());
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TimestampOffsets {
    /// First offset at or after the timestamp, -1 when every record is older.
    pub offsets: BTreeMap<i32, i64>,
    pub failures: BTreeMap<i32, String>,
}

/// Looks up partition bounds through the client, bounded by the metadata timeout.
#[derive(Debug)]
pub struct WatermarkResolver<'a, C> {
    client: &'a C,
    timeout: Duration,
}

impl<'a, C: KafkaClient> WatermarkResolver<'a, C> {
    pub fn new(client: &'a C, timeout: Duration) -> Self {
        Self { client, timeout }
    }

    async fn bounded<T, F>(&self, topic: &str, what: &str, fut: F) -> AppResult<T>
    where
        F: Future<Output = T>,
    {
        tokio::time::timeout(self.timeout, fut).await.map_err(|_| {
            AppError::UpstreamUnavailable(format!(
                "listing {} of topic {} timed out after {:?}",
                what, topic, self.timeout
            ))
        })
    }

    /// Start and end offsets are requested concurrently. Losing the cluster
    /// fails the call; losing single partitions only lands them in `failures`.
    pub async fn get_watermarks(
        &self,
        topic: &str,
        partition_ids: &[i32],
    ) -> AppResult<Watermarks> {
        let mut watermarks = Watermarks::default();
        if partition_ids.is_empty() {
            return Ok(watermarks);
        }

        let (starts, ends) = self
            .bounded(topic, "watermarks", async {
                tokio::join!(
                    self.client.list_start_offsets(topic, partition_ids),
                    self.client.list_end_offsets(topic, partition_ids)
                )
            })
            .await?;
        let starts = starts.map_err(|e| e.with_topic_context(topic, "listing start offsets"))?;
        let ends = ends.map_err(|e| e.with_topic_context(topic, "listing end offsets"))?;

        for &partition_id in partition_ids {
            match merge_bounds(partition_id, &starts, &ends) {
                Ok(bounds) => {
                    watermarks.bounds.insert(partition_id, bounds);
                }
                Err(reason) => {
                    warn!(
                        "failed to get watermarks of {}: {}",
                        TopicPartition::new(topic, partition_id),
                        reason
                    );
                    watermarks.failures.insert(partition_id, reason);
                }
            }
        }
        debug!(
            "resolved watermarks of topic {}: {} ok, {} failed",
            topic,
            watermarks.bounds.len(),
            watermarks.failures.len()
        );
        Ok(watermarks)
    }

    pub async fn resolve_offsets_by_timestamp(
        &self,
        topic: &str,
        partition_ids: &[i32],
        timestamp_ms: i64,
    ) -> AppResult<TimestampOffsets> {
        let mut resolved = TimestampOffsets::default();
        if partition_ids.is_empty() {
            return Ok(resolved);
        }

        let listed = self
            .bounded(
                topic,
                "offsets by timestamp",
                self.client
                    .list_offsets_after_timestamp(topic, partition_ids, timestamp_ms),
            )
            .await?
            .map_err(|e| e.with_topic_context(topic, "listing offsets by timestamp"))?;

        for &partition_id in partition_ids {
            match listed.get(&partition_id) {
                Some(listed) if listed.error.is_none() => {
                    resolved.offsets.insert(partition_id, listed.offset);
                }
                Some(listed) => {
                    let reason = format!(
                        "offset by timestamp: {}",
                        listed.error.as_deref().unwrap_or_default()
                    );
                    resolved.failures.insert(partition_id, reason);
                }
                None => {
                    resolved
                        .failures
                        .insert(partition_id, "offset by timestamp: no response".to_string());
                }
            }
        }
        Ok(resolved)
    }
}

fn merge_bounds(
    partition_id: i32,
    starts: &ListedOffsets,
    ends: &ListedOffsets,
) -> Result<WatermarkBounds, String> {
    let start = starts
        .get(&partition_id)
        .ok_or_else(|| "start offset: no response".to_string())?;
    if let Some(err) = &start.error {
        return Err(format!("start offset: {}", err));
    }
    let end = ends
        .get(&partition_id)
        .ok_or_else(|| "end offset: no response".to_string())?;
    if let Some(err) = &end.error {
        return Err(format!("end offset: {}", err));
    }
    Ok(WatermarkBounds::new(partition_id, start.offset, end.offset))
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use crate::client::MemoryCluster;

    use super::*;

    fn cluster() -> MemoryCluster {
        let cluster = MemoryCluster::new(Duration::from_millis(5), 100);
        cluster.create_topic("orders", 3).unwrap();
        for partition in 0..3 {
            for i in 0..10 {
                cluster
                    .produce("orders", partition, None, Some(Bytes::from("v")), i * 100)
                    .unwrap();
            }
        }
        cluster
    }

    #[test]
    fn test_bounds_never_invert() {
        let bounds = WatermarkBounds::new(0, 12, 10);
        assert_eq!(bounds.low, 10);
        assert!(bounds.is_empty());
        assert_eq!(bounds.message_count(), 0);
    }

    #[tokio::test]
    async fn test_get_watermarks() {
        let cluster = cluster();
        cluster.delete_records_before("orders", 2, 4).unwrap();
        let resolver = WatermarkResolver::new(&cluster, Duration::from_secs(1));

        let watermarks = resolver.get_watermarks("orders", &[0, 1, 2]).await.unwrap();
        assert!(watermarks.failures.is_empty());
        assert_eq!(watermarks.get(0), Some(&WatermarkBounds::new(0, 0, 10)));
        assert_eq!(watermarks.get(2), Some(&WatermarkBounds::new(2, 4, 10)));
    }

    #[tokio::test]
    async fn test_partial_failure_is_tolerated() {
        let cluster = cluster();
        cluster
            .set_partition_offline("orders", 1, Some("NOT_LEADER_FOR_PARTITION".to_string()))
            .unwrap();
        let resolver = WatermarkResolver::new(&cluster, Duration::from_secs(1));

        let watermarks = resolver.get_watermarks("orders", &[0, 1, 2]).await.unwrap();
        assert_eq!(watermarks.bounds.keys().copied().collect::<Vec<_>>(), vec![0, 2]);
        assert!(watermarks.failures[&1].contains("NOT_LEADER_FOR_PARTITION"));
    }

    #[tokio::test]
    async fn test_unreachable_cluster_fails_whole_call() {
        let cluster = cluster();
        cluster.set_offline(true);
        let resolver = WatermarkResolver::new(&cluster, Duration::from_secs(1));

        let err = resolver.get_watermarks("orders", &[0]).await.unwrap_err();
        assert!(matches!(err, AppError::UpstreamUnavailable(ref msg) if msg.contains("orders")));
    }

    #[tokio::test]
    async fn test_resolve_offsets_by_timestamp() {
        let cluster = cluster();
        let resolver = WatermarkResolver::new(&cluster, Duration::from_secs(1));

        let resolved = resolver
            .resolve_offsets_by_timestamp("orders", &[0, 1], 450)
            .await
            .unwrap();
        assert_eq!(resolved.offsets[&0], 5);
        assert_eq!(resolved.offsets[&1], 5);

        let resolved = resolver
            .resolve_offsets_by_timestamp("orders", &[0], 1_000_000)
            .await
            .unwrap();
        assert_eq!(resolved.offsets[&0], -1);
    }
}
