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
use std::pin::Pin;
use std::time::{Duration, Instant};

use opentelemetry::metrics::Counter;
use opentelemetry::{global, KeyValue};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::client::{ConsumeSession, KafkaClient};
use crate::message::{ConsumedRecord, TopicPartition};
use crate::{AppError, AppResult};

use super::plan::ConsumePlan;

/// Caller supplied predicate deciding which consumed records are delivered.
/// It is opaque to the engine: a script, a compiled expression or a closure.
pub trait RecordFilter: Send + Sync {
    fn matches<'a>(
        &'a self,
        record: &'a ConsumedRecord,
    ) -> Pin<Box<dyn Future<Output = Result<bool, String>> + Send + 'a>>;
}

impl<F> RecordFilter for F
where
    F: Fn(&ConsumedRecord) -> Result<bool, String> + Send + Sync,
{
    fn matches<'a>(
        &'a self,
        record: &'a ConsumedRecord,
    ) -> Pin<Box<dyn Future<Output = Result<bool, String>> + Send + 'a>> {
        Box::pin(std::future::ready(self(record)))
    }
}

/// Receives the progress of a listing, typically to stream it to a UI.
pub trait ListMessagesProgress: Send {
    fn on_phase(&mut self, phase: &str);
    /// A record passed the filter.
    fn on_message(&mut self, record: &ConsumedRecord);
    /// A record in range was read, whether or not it passed the filter.
    fn on_message_consumed(&mut self, size_bytes: usize);
    fn on_complete(&mut self, elapsed_ms: u64, is_cancelled: bool);
    fn on_error(&mut self, msg: &str);
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PartitionFetchState {
    pub consumed: i64,
    pub delivered: i64,
    pub last_offset: Option<i64>,
    /// Reached the end offset or its message budget.
    pub done: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchOutcome {
    pub consumed: i64,
    pub delivered: i64,
    /// The caller gave up; what was delivered so far stays valid.
    pub cancelled: bool,
    pub partitions: BTreeMap<i32, PartitionFetchState>,
}

impl FetchOutcome {
    fn all_done(&self) -> bool {
        self.partitions.values().all(|state| state.done)
    }
}

struct FetchMetrics {
    consumed: Counter<u64>,
    consumed_bytes: Counter<u64>,
    delivered: Counter<u64>,
}

impl FetchMetrics {
    fn new() -> Self {
        let meter = global::meter(env!("CARGO_PKG_NAME"));
        Self {
            consumed: meter
                .u64_counter("list_messages.consumed")
                .with_description("records read while listing messages")
                .init(),
            consumed_bytes: meter
                .u64_counter("list_messages.consumed_bytes")
                .with_description("payload bytes read while listing messages")
                .init(),
            delivered: meter
                .u64_counter("list_messages.delivered")
                .with_description("records handed to the caller")
                .init(),
        }
    }
}

/// Streams the records of a consume plan to a progress receiver.
pub struct FetchOrchestrator<'a, C> {
    client: &'a C,
    filter_timeout: Duration,
    metrics: FetchMetrics,
}

impl<'a, C: KafkaClient> FetchOrchestrator<'a, C> {
    /// A zero `filter_timeout` lets filter evaluations run unbounded.
    pub fn new(client: &'a C, filter_timeout: Duration) -> Self {
        Self {
            client,
            filter_timeout,
            metrics: FetchMetrics::new(),
        }
    }

    async fn evaluate(
        &self,
        filter: &dyn RecordFilter,
        record: &ConsumedRecord,
    ) -> Result<bool, String> {
        if self.filter_timeout.is_zero() {
            return filter.matches(record).await;
        }
        match tokio::time::timeout(self.filter_timeout, filter.matches(record)).await {
            Ok(result) => result,
            Err(_) => Err(format!(
                "evaluation exceeded the timeout of {:?}",
                self.filter_timeout
            )),
        }
    }

    /// Consumes `plan` until `message_count` records were delivered, every
    /// partition reached its end offset or budget, or `cancel` fires.
    ///
    /// A failing filter aborts the whole fetch: `on_error` is called and
    /// `AppError::FilterPredicate` returned. Cancellation is not an error, it is
    /// reported through `on_complete` and `FetchOutcome::cancelled`.
    pub async fn fetch<P: ListMessagesProgress>(
        &self,
        topic: &str,
        plan: &ConsumePlan,
        message_count: i64,
        filter: Option<&dyn RecordFilter>,
        cancel: &CancellationToken,
        progress: &mut P,
    ) -> AppResult<FetchOutcome> {
        let started = Instant::now();
        let mut outcome = FetchOutcome::default();
        for (&partition_id, req) in plan {
            let empty = !req.is_live_tail() && req.range_len() == 0;
            outcome.partitions.insert(
                partition_id,
                PartitionFetchState {
                    done: empty || req.max_message_count <= 0,
                    ..Default::default()
                },
            );
        }

        let assignments: BTreeMap<_, _> = plan
            .iter()
            .filter(|(id, _)| !outcome.partitions[*id].done)
            .map(|(&id, req)| (id, req.assign_offset()))
            .collect();
        if message_count <= 0 || assignments.is_empty() {
            progress.on_complete(started.elapsed().as_millis() as u64, false);
            return Ok(outcome);
        }
        if cancel.is_cancelled() {
            outcome.cancelled = true;
            progress.on_complete(started.elapsed().as_millis() as u64, true);
            return Ok(outcome);
        }

        let mut session = match self.client.assign(topic, assignments).await {
            Ok(session) => session,
            Err(e) => {
                let err = e.with_topic_context(topic, "assigning partitions");
                progress.on_error(&err.to_string());
                return Err(err);
            }
        };
        let mut consumed_bytes = 0u64;

        'poll: while outcome.delivered < message_count && !outcome.all_done() {
            let batch = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!("fetch from topic {} cancelled", topic);
                    outcome.cancelled = true;
                    break 'poll;
                }
                batch = session.poll() => batch,
            };
            let batch = match batch {
                Ok(batch) => batch,
                Err(e) => {
                    let err = e.with_topic_context(topic, "polling records");
                    progress.on_error(&err.to_string());
                    return Err(err);
                }
            };
            trace!("polled {} records from topic {}", batch.len(), topic);

            for record in batch {
                let Some(req) = plan.get(&record.partition_id) else {
                    continue;
                };
                let Some(state) = outcome.partitions.get_mut(&record.partition_id) else {
                    continue;
                };
                if state.done || (!req.is_live_tail() && record.offset < req.start_offset) {
                    continue;
                }
                if record.offset > req.end_offset {
                    state.done = true;
                    continue;
                }

                let size = record.size_bytes();
                progress.on_message_consumed(size);
                consumed_bytes += size as u64;
                state.consumed += 1;
                outcome.consumed += 1;

                let accepted = match filter {
                    None => true,
                    Some(filter) => match self.evaluate(filter, &record).await {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            let msg = format!(
                                "failed to evaluate filter on {} offset {}: {}",
                                TopicPartition::new(topic, record.partition_id),
                                record.offset,
                                e
                            );
                            warn!("{}", msg);
                            progress.on_error(&msg);
                            return Err(AppError::FilterPredicate(msg));
                        }
                    },
                };

                state.last_offset = Some(record.offset);
                if accepted {
                    progress.on_message(&record);
                    state.delivered += 1;
                    outcome.delivered += 1;
                }
                if record.offset >= req.end_offset || state.delivered >= req.max_message_count {
                    state.done = true;
                }
                if outcome.delivered >= message_count {
                    break 'poll;
                }
            }
        }
        drop(session);

        let attributes = [KeyValue::new("topic", topic.to_string())];
        self.metrics
            .consumed
            .add(outcome.consumed as u64, &attributes);
        self.metrics.consumed_bytes.add(consumed_bytes, &attributes);
        self.metrics
            .delivered
            .add(outcome.delivered as u64, &attributes);

        let elapsed_ms = started.elapsed().as_millis() as u64;
        debug!(
            "fetched topic {}: consumed {}, delivered {}, cancelled {}, {} ms",
            topic, outcome.consumed, outcome.delivered, outcome.cancelled, elapsed_ms
        );
        progress.on_complete(elapsed_ms, outcome.cancelled);
        Ok(outcome)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use bytes::Bytes;
    use rstest::{fixture, rstest};

    use super::*;
    use crate::client::MemoryCluster;
    use crate::consume::plan::calculate_consume_requests;
    use crate::consume::request::{ListMessageRequest, StartOffset};
    use crate::consume::watermark::{WatermarkBounds, Watermarks};
    use crate::service::setup_local_tracing;

    #[derive(Debug, Default)]
    pub(crate) struct RecordingProgress {
        pub phases: Vec<String>,
        pub messages: Vec<(i32, i64)>,
        pub consumed: usize,
        pub consumed_bytes: usize,
        pub completed: Option<bool>,
        pub errors: Vec<String>,
    }

    impl ListMessagesProgress for RecordingProgress {
        fn on_phase(&mut self, phase: &str) {
            self.phases.push(phase.to_string());
        }
        fn on_message(&mut self, record: &ConsumedRecord) {
            self.messages.push((record.partition_id, record.offset));
        }
        fn on_message_consumed(&mut self, size_bytes: usize) {
            self.consumed += 1;
            self.consumed_bytes += size_bytes;
        }
        fn on_complete(&mut self, _elapsed_ms: u64, is_cancelled: bool) {
            self.completed = Some(is_cancelled);
        }
        fn on_error(&mut self, msg: &str) {
            self.errors.push(msg.to_string());
        }
    }

    #[fixture]
    #[once]
    fn setup() {
        setup_local_tracing().expect("failed to setup tracing");
    }

    fn cluster(layout: &[i64]) -> MemoryCluster {
        let cluster = MemoryCluster::new(Duration::from_millis(5), 3);
        cluster.create_topic("orders", layout.len() as i32).unwrap();
        for (partition, &count) in layout.iter().enumerate() {
            for i in 0..count {
                cluster
                    .produce(
                        "orders",
                        partition as i32,
                        Some(Bytes::from(format!("k{}", i))),
                        Some(Bytes::from(format!("v{}", i))),
                        i,
                    )
                    .unwrap();
            }
        }
        cluster
    }

    fn plan_for(request: &ListMessageRequest, layout: &[i64]) -> ConsumePlan {
        let marks = Watermarks::from_bounds(
            layout
                .iter()
                .enumerate()
                .map(|(p, &count)| WatermarkBounds::new(p as i32, 0, count)),
        );
        calculate_consume_requests(request, &marks, &BTreeMap::new())
    }

    #[rstest]
    #[tokio::test]
    async fn test_fetch_honours_plan(_setup: ()) {
        let layout = [30, 10, 0];
        let cluster = cluster(&layout);
        let request = ListMessageRequest::new("orders", StartOffset::Oldest, 25);
        let plan = plan_for(&request, &layout);
        let orchestrator = FetchOrchestrator::new(&cluster, Duration::from_secs(1));
        let mut progress = RecordingProgress::default();

        let outcome = orchestrator
            .fetch("orders", &plan, 25, None, &CancellationToken::new(), &mut progress)
            .await
            .unwrap();

        assert_eq!(outcome.delivered, 25);
        assert!(!outcome.cancelled);
        assert_eq!(outcome.partitions[&0].delivered, 15);
        assert_eq!(outcome.partitions[&1].delivered, 10);
        assert_eq!(progress.messages.len(), 25);
        assert_eq!(progress.consumed, 25);
        assert_eq!(progress.completed, Some(false));
        let p0: Vec<i64> = progress
            .messages
            .iter()
            .filter(|(p, _)| *p == 0)
            .map(|(_, o)| *o)
            .collect();
        assert_eq!(p0, (0..15).collect::<Vec<_>>());
    }

    #[rstest]
    #[tokio::test]
    async fn test_recent_fetch_reads_tail_of_each_partition(_setup: ()) {
        let layout = [20, 20];
        let cluster = cluster(&layout);
        let request = ListMessageRequest::new("orders", StartOffset::Recent, 6);
        let plan = plan_for(&request, &layout);
        let orchestrator = FetchOrchestrator::new(&cluster, Duration::from_secs(1));
        let mut progress = RecordingProgress::default();

        orchestrator
            .fetch("orders", &plan, 6, None, &CancellationToken::new(), &mut progress)
            .await
            .unwrap();

        let mut messages = progress.messages.clone();
        messages.sort();
        assert_eq!(
            messages,
            vec![(0, 17), (0, 18), (0, 19), (1, 17), (1, 18), (1, 19)]
        );
    }

    #[rstest]
    #[tokio::test]
    async fn test_filter_counts_consumed_but_delivers_matches(_setup: ()) {
        let layout = [50];
        let cluster = cluster(&layout);
        let request = ListMessageRequest::new("orders", StartOffset::Oldest, 5)
            .with_filter_code("offset % 5 == 0");
        let plan = plan_for(&request, &layout);
        let orchestrator = FetchOrchestrator::new(&cluster, Duration::from_secs(1));
        let filter =
            |record: &ConsumedRecord| -> Result<bool, String> { Ok(record.offset % 5 == 0) };
        let mut progress = RecordingProgress::default();

        let outcome = orchestrator
            .fetch(
                "orders",
                &plan,
                5,
                Some(&filter),
                &CancellationToken::new(),
                &mut progress,
            )
            .await
            .unwrap();

        assert_eq!(outcome.delivered, 5);
        assert_eq!(
            progress.messages,
            vec![(0, 0), (0, 5), (0, 10), (0, 15), (0, 20)]
        );
        assert_eq!(progress.consumed, 21);
    }

    #[rstest]
    #[tokio::test]
    async fn test_filter_error_aborts_fetch(_setup: ()) {
        let layout = [10, 10];
        let cluster = cluster(&layout);
        let request =
            ListMessageRequest::new("orders", StartOffset::Oldest, 20).with_filter_code("boom");
        let plan = plan_for(&request, &layout);
        let orchestrator = FetchOrchestrator::new(&cluster, Duration::from_secs(1));
        let filter = |record: &ConsumedRecord| {
            if record.offset == 2 {
                Err("ReferenceError: valu is not defined".to_string())
            } else {
                Ok(true)
            }
        };
        let mut progress = RecordingProgress::default();

        let err = orchestrator
            .fetch(
                "orders",
                &plan,
                20,
                Some(&filter),
                &CancellationToken::new(),
                &mut progress,
            )
            .await
            .unwrap_err();

        assert!(matches!(err, AppError::FilterPredicate(ref msg) if msg.contains("valu")));
        assert_eq!(progress.errors.len(), 1);
        assert_eq!(progress.completed, None);
        assert!(progress.messages.len() < 20);
    }

    struct SlowFilter;

    impl RecordFilter for SlowFilter {
        fn matches<'a>(
            &'a self,
            _record: &'a ConsumedRecord,
        ) -> Pin<Box<dyn Future<Output = Result<bool, String>> + Send + 'a>> {
            Box::pin(async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(true)
            })
        }
    }

    #[rstest]
    #[tokio::test(start_paused = true)]
    async fn test_filter_timeout_aborts_fetch(_setup: ()) {
        let layout = [3];
        let cluster = cluster(&layout);
        let request =
            ListMessageRequest::new("orders", StartOffset::Oldest, 3).with_filter_code("slow");
        let plan = plan_for(&request, &layout);
        let orchestrator = FetchOrchestrator::new(&cluster, Duration::from_millis(50));
        let mut progress = RecordingProgress::default();

        let err = orchestrator
            .fetch(
                "orders",
                &plan,
                3,
                Some(&SlowFilter),
                &CancellationToken::new(),
                &mut progress,
            )
            .await
            .unwrap_err();

        assert!(matches!(err, AppError::FilterPredicate(ref msg) if msg.contains("timeout")));
        assert!(progress.messages.is_empty());
    }

    #[rstest]
    #[tokio::test]
    async fn test_live_tail_cancellation(_setup: ()) {
        let layout = [5, 5];
        let cluster = cluster(&layout);
        let request = ListMessageRequest::new("orders", StartOffset::Newest, 10);
        let plan = plan_for(&request, &layout);
        let orchestrator = FetchOrchestrator::new(&cluster, Duration::from_secs(1));
        let cancel = CancellationToken::new();
        let mut progress = RecordingProgress::default();

        let producer = {
            let cluster = cluster.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(30)).await;
                cluster.produce("orders", 1, None, Some(Bytes::from("new")), 99).unwrap();
                tokio::time::sleep(Duration::from_millis(30)).await;
                cancel.cancel();
            })
        };

        let outcome = orchestrator
            .fetch("orders", &plan, 10, None, &cancel, &mut progress)
            .await
            .unwrap();
        producer.await.unwrap();

        assert!(outcome.cancelled);
        assert_eq!(progress.completed, Some(true));
        assert_eq!(progress.messages, vec![(1, 5)]);
    }

    #[rstest]
    #[tokio::test]
    async fn test_missing_tail_offsets_wait_for_cancellation(_setup: ()) {
        // watermarks promise offsets 0..8 but the log only holds 0..5
        let cluster = cluster(&[5]);
        let marks = Watermarks::from_bounds([WatermarkBounds::new(0, 0, 8)]);
        let request = ListMessageRequest::new("orders", StartOffset::Oldest, 8);
        let plan = calculate_consume_requests(&request, &marks, &BTreeMap::new());
        let orchestrator = FetchOrchestrator::new(&cluster, Duration::from_secs(1));
        let cancel = CancellationToken::new();
        let mut progress = RecordingProgress::default();

        let canceller = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                cancel.cancel();
            })
        };

        let outcome = orchestrator
            .fetch("orders", &plan, 8, None, &cancel, &mut progress)
            .await
            .unwrap();
        canceller.await.unwrap();

        assert!(outcome.cancelled);
        assert_eq!(outcome.delivered, 5);
        assert!(!outcome.partitions[&0].done);
        assert_eq!(progress.completed, Some(true));
    }

    #[rstest]
    #[tokio::test]
    async fn test_empty_plan_completes_immediately(_setup: ()) {
        let cluster = cluster(&[0]);
        let orchestrator = FetchOrchestrator::new(&cluster, Duration::from_secs(1));
        let mut progress = RecordingProgress::default();

        let outcome = orchestrator
            .fetch(
                "orders",
                &ConsumePlan::new(),
                10,
                None,
                &CancellationToken::new(),
                &mut progress,
            )
            .await
            .unwrap();
        assert_eq!(outcome, FetchOutcome::default());
        assert_eq!(progress.completed, Some(false));
    }

    #[rstest]
    #[tokio::test]
    async fn test_unreachable_cluster_during_fetch(_setup: ()) {
        let layout = [10];
        let cluster = cluster(&layout);
        let request = ListMessageRequest::new("orders", StartOffset::Oldest, 5);
        let plan = plan_for(&request, &layout);
        let orchestrator = FetchOrchestrator::new(&cluster, Duration::from_secs(1));
        let mut progress = RecordingProgress::default();
        cluster.set_offline(true);

        let err = orchestrator
            .fetch("orders", &plan, 5, None, &CancellationToken::new(), &mut progress)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::UpstreamUnavailable(ref msg) if msg.contains("orders")));
        assert_eq!(progress.errors.len(), 1);
        assert!(progress.errors[0].contains("orders"));
    }
}
