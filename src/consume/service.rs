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

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use crate::client::KafkaClient;
use crate::message::TopicPartition;
use crate::service::{global_config, KafkaConfig, ListMessagesConfig};
use crate::{AppError, AppResult};

use super::fetch::{FetchOrchestrator, FetchOutcome, ListMessagesProgress, RecordFilter};
use super::page_token::{create_initial_page_token, decode_page_token, Direction, PageToken};
use super::plan::{calculate_consume_requests, plan_message_count, ConsumePlan};
use super::request::{ListMessageRequest, StartOffset};
use super::watermark::{WatermarkResolver, Watermarks};

pub const PHASE_GET_PARTITIONS: &str = "Get Partitions";
pub const PHASE_GET_WATERMARKS: &str = "Get Watermarks and calculate consuming requests";
pub const PHASE_CONSUMING: &str = "Consuming messages";

/// One served page of a paged listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessagePage {
    pub outcome: FetchOutcome,
    /// `None` once every partition is exhausted or the page was cancelled.
    pub next_page_token: Option<String>,
}

/// Entry point of message listing: resolves partitions and watermarks, plans the
/// consumption and streams the records to a progress receiver.
#[derive(Debug)]
pub struct MessageService<C> {
    client: C,
    kafka_config: KafkaConfig,
    list_config: ListMessagesConfig,
}

fn report<P: ListMessagesProgress>(progress: &mut P, err: AppError) -> AppError {
    progress.on_error(&err.to_string());
    err
}

fn report_partition_failures<P: ListMessagesProgress>(
    progress: &mut P,
    topic: &str,
    failures: &BTreeMap<i32, String>,
) {
    for (&partition_id, reason) in failures {
        progress.on_error(&format!(
            "skipping partition {}: {}",
            TopicPartition::new(topic, partition_id),
            reason
        ));
    }
}

impl<C: KafkaClient> MessageService<C> {
    pub fn new(client: C, kafka_config: KafkaConfig, list_config: ListMessagesConfig) -> Self {
        Self {
            client,
            kafka_config,
            list_config,
        }
    }

    pub fn from_global_config(client: C) -> Self {
        let config = global_config();
        Self::new(client, config.kafka.clone(), config.list_messages.clone())
    }

    pub fn client(&self) -> &C {
        &self.client
    }

    fn check_filter(
        request: &ListMessageRequest,
        filter: Option<&dyn RecordFilter>,
    ) -> AppResult<()> {
        if request.topic_name.is_empty() {
            return Err(AppError::InvalidArgument("topic name must not be empty".to_string()));
        }
        match (request.has_filter(), filter.is_some()) {
            (true, false) => Err(AppError::InvalidArgument(
                "filter code given but no filter supplied".to_string(),
            )),
            (false, true) => Err(AppError::InvalidArgument(
                "filter supplied without filter code".to_string(),
            )),
            _ => Ok(()),
        }
    }

    async fn select_partitions(&self, request: &ListMessageRequest) -> AppResult<Vec<i32>> {
        let topic = &request.topic_name;
        let partitions = tokio::time::timeout(
            self.kafka_config.metadata_timeout(),
            self.client.list_partitions(topic),
        )
        .await
        .map_err(|_| {
            AppError::UpstreamUnavailable(format!(
                "listing partitions of topic {} timed out",
                topic
            ))
        })?
        .map_err(|e| e.with_topic_context(topic, "listing partitions"))?;

        if request.selects_all_partitions() {
            return Ok(partitions);
        }
        if partitions.contains(&request.partition_id) {
            Ok(vec![request.partition_id])
        } else {
            Err(AppError::InvalidArgument(format!(
                "partition {} does not exist in topic {} ({} partitions)",
                request.partition_id,
                topic,
                partitions.len()
            )))
        }
    }

    /// Watermarks of the selected partitions; for timestamp listings partitions
    /// whose timestamp lookup failed are moved to the failures too.
    async fn resolve(
        &self,
        request: &ListMessageRequest,
        partitions: &[i32],
    ) -> AppResult<(Watermarks, BTreeMap<i32, i64>)> {
        let resolver = WatermarkResolver::new(&self.client, self.kafka_config.metadata_timeout());
        let topic = &request.topic_name;
        let mut watermarks = resolver.get_watermarks(topic, partitions).await?;
        if request.start_offset != StartOffset::Timestamp {
            return Ok((watermarks, BTreeMap::new()));
        }

        let healthy: Vec<i32> = watermarks.bounds.keys().copied().collect();
        let resolved = resolver
            .resolve_offsets_by_timestamp(topic, &healthy, request.start_timestamp)
            .await?;
        for (partition_id, reason) in resolved.failures {
            watermarks.mark_failed(partition_id, reason);
        }
        Ok((watermarks, resolved.offsets))
    }

    /// Lists up to `request.message_count` messages.
    #[instrument(skip_all, fields(topic = %request.topic_name, start = %request.start_offset))]
    pub async fn list_messages<P: ListMessagesProgress>(
        &self,
        request: &ListMessageRequest,
        filter: Option<&dyn RecordFilter>,
        cancel: &CancellationToken,
        progress: &mut P,
    ) -> AppResult<FetchOutcome> {
        Self::check_filter(request, filter).map_err(|e| report(progress, e))?;
        let topic = &request.topic_name;

        progress.on_phase(PHASE_GET_PARTITIONS);
        let partitions = self
            .select_partitions(request)
            .await
            .map_err(|e| report(progress, e))?;

        progress.on_phase(PHASE_GET_WATERMARKS);
        let (watermarks, timestamp_offsets) = self
            .resolve(request, &partitions)
            .await
            .map_err(|e| report(progress, e))?;
        report_partition_failures(progress, topic, &watermarks.failures);
        let plan = calculate_consume_requests(request, &watermarks, &timestamp_offsets);
        debug!(
            "consume plan for topic {}: {} partitions, {} messages",
            topic,
            plan.len(),
            plan_message_count(&plan)
        );

        progress.on_phase(PHASE_CONSUMING);
        let orchestrator = FetchOrchestrator::new(&self.client, self.list_config.filter_timeout());
        orchestrator
            .fetch(topic, &plan, request.message_count, filter, cancel, progress)
            .await
    }

    fn page_size(&self, request: &ListMessageRequest) -> AppResult<i32> {
        let page_size = if request.page_size == 0 {
            self.list_config.default_page_size
        } else {
            request.page_size
        };
        i32::try_from(page_size)
            .map_err(|_| AppError::InvalidArgument(format!("page_size {} out of range", page_size)))
    }

    async fn first_page_token(
        &self,
        request: &ListMessageRequest,
        partitions: &[i32],
    ) -> AppResult<PageToken> {
        let resolver = WatermarkResolver::new(&self.client, self.kafka_config.metadata_timeout());
        let watermarks = resolver
            .get_watermarks(&request.topic_name, partitions)
            .await?;
        // every partition needs a cursor, otherwise the next page would look repartitioned
        if !watermarks.failures.is_empty() {
            let failed: Vec<String> = watermarks
                .failures
                .iter()
                .map(|(id, reason)| format!("{}: {}", id, reason))
                .collect();
            return Err(AppError::UpstreamUnavailable(format!(
                "cannot start paging topic {}, partitions unavailable: {}",
                request.topic_name,
                failed.join(", ")
            )));
        }
        let start_offsets: BTreeMap<i32, i64> =
            watermarks.bounds.values().map(|b| (b.partition_id, b.low)).collect();
        let end_offsets: BTreeMap<i32, i64> =
            watermarks.bounds.values().map(|b| (b.partition_id, b.high)).collect();
        create_initial_page_token(
            &request.topic_name,
            &start_offsets,
            &end_offsets,
            self.page_size(request)?,
            Direction::Descending,
        )
    }

    /// Serves one page. Without `page_token` a descending token starting at the
    /// newest records is created; otherwise the token is validated against the
    /// request and the topic before anything is consumed.
    ///
    /// Filters are not supported: a page has to hold exactly `page_size` messages.
    #[instrument(skip_all, fields(topic = %request.topic_name, first_page = page_token.is_none()))]
    pub async fn list_messages_paged<P: ListMessagesProgress>(
        &self,
        request: &ListMessageRequest,
        page_token: Option<&str>,
        cancel: &CancellationToken,
        progress: &mut P,
    ) -> AppResult<MessagePage> {
        if request.has_filter() {
            return Err(report(
                progress,
                AppError::InvalidArgument("paged listings do not support filters".to_string()),
            ));
        }
        Self::check_filter(request, None).map_err(|e| report(progress, e))?;
        let topic = &request.topic_name;

        let decoded = match page_token {
            Some(encoded) => {
                let token = decode_page_token(encoded).map_err(|e| report(progress, e))?;
                if token.topic_name != *topic {
                    return Err(report(
                        progress,
                        AppError::TokenValidation(format!(
                            "topic_name mismatch: token belongs to {}, request is for {}",
                            token.topic_name, topic
                        )),
                    ));
                }
                Some(token)
            }
            None => None,
        };

        progress.on_phase(PHASE_GET_PARTITIONS);
        let partitions = self
            .select_partitions(request)
            .await
            .map_err(|e| report(progress, e))?;

        progress.on_phase(PHASE_GET_WATERMARKS);
        let (mut token, failures) = match decoded {
            None => {
                let token = self
                    .first_page_token(request, &partitions)
                    .await
                    .map_err(|e| report(progress, e))?;
                (token, BTreeMap::new())
            }
            Some(mut token) => {
                let repartitioned = partitions.len() != token.partition_count as usize
                    || partitions.iter().any(|id| token.cursor(*id).is_none());
                if repartitioned {
                    return Err(report(
                        progress,
                        AppError::TokenValidation(format!(
                            "partition count mismatch: token covers {} partitions, \
                             topic {} now has {}",
                            token.partition_count,
                            topic,
                            partitions.len()
                        )),
                    ));
                }
                let resolver =
                    WatermarkResolver::new(&self.client, self.kafka_config.metadata_timeout());
                let watermarks = resolver
                    .get_watermarks(topic, &partitions)
                    .await
                    .map_err(|e| report(progress, e))?;
                token.refresh_watermarks(&watermarks);
                (token, watermarks.failures)
            }
        };
        report_partition_failures(progress, topic, &failures);

        let mut plan = token.calculate_consume_requests();
        plan.retain(|id, _| !failures.contains_key(id));
        let message_count = plan_message_count(&plan);

        progress.on_phase(PHASE_CONSUMING);
        let orchestrator = FetchOrchestrator::new(&self.client, self.list_config.filter_timeout());
        let outcome = orchestrator
            .fetch(topic, &plan, message_count, None, cancel, progress)
            .await?;

        if outcome.cancelled {
            info!("paged listing of topic {} cancelled, dropping its cursor", topic);
            return Ok(MessagePage {
                outcome,
                next_page_token: None,
            });
        }
        advance_cursors(&mut token, &plan, &outcome)?;
        let next_page_token = if token.has_more() {
            Some(token.encode()?)
        } else {
            None
        };
        Ok(MessagePage {
            outcome,
            next_page_token,
        })
    }
}

fn advance_cursors(
    token: &mut PageToken,
    plan: &ConsumePlan,
    outcome: &FetchOutcome,
) -> AppResult<()> {
    for (&partition_id, req) in plan {
        let last_offset = outcome
            .partitions
            .get(&partition_id)
            .and_then(|state| state.last_offset);
        let budget_end = req.start_offset + req.max_message_count - 1;
        let to = last_offset.map_or(budget_end, |last| last.max(budget_end));
        token.advance(partition_id, req.start_offset, to)?;
    }
    Ok(())
}
