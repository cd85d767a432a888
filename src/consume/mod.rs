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

//! Message listing: watermark resolution, consume planning, page tokens and the
//! fetch loop, tied together by [`MessageService`].

mod fetch;
mod page_token;
mod plan;
mod request;
mod service;
mod watermark;

pub use fetch::{
    FetchOrchestrator, FetchOutcome, ListMessagesProgress, PartitionFetchState, RecordFilter,
};
pub use page_token::{
    create_initial_page_token, decode_page_token, Direction, PageToken, PartitionCursor,
    MAX_PAGE_FANOUT, MAX_PAGE_SIZE, MIN_PAGE_SIZE,
};
pub use plan::{
    calculate_consume_requests, plan_message_count, ConsumePlan, PartitionConsumeRequest,
    OFFSET_FUTURE, OFFSET_UNBOUNDED,
};
pub use request::{
    ListMessageRequest, StartOffset, ALL_PARTITIONS, START_OFFSET_NEWEST, START_OFFSET_OLDEST,
    START_OFFSET_RECENT, START_OFFSET_TIMESTAMP,
};
pub use service::{
    MessagePage, MessageService, PHASE_CONSUMING, PHASE_GET_PARTITIONS, PHASE_GET_WATERMARKS,
};
pub use watermark::{TimestampOffsets, WatermarkBounds, WatermarkResolver, Watermarks};
