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

//! Consume plan calculation
//!
//! Turns a listing request plus partition watermarks into one consume request
//! per partition. When every record in range will be delivered (no filter, no
//! live tail) the requested message count is spread over the partitions one
//! message at a time, in ascending partition order, until the budget is spent or
//! every partition is drained. Otherwise each partition gets the full count and
//! the fetch stops once enough records were accepted.

use std::collections::BTreeMap;

use serde::Serialize;
use tracing::{debug, trace};

use crate::client::AssignOffset;

use super::request::{ListMessageRequest, StartOffset};
use super::watermark::Watermarks;

/// Start offset of a live-tail request: only records produced from now on.
pub const OFFSET_FUTURE: i64 = -1;
/// End offset of a live-tail request.
pub const OFFSET_UNBOUNDED: i64 = i64::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PartitionConsumeRequest {
    pub partition_id: i32,
    pub start_offset: i64,
    /// Inclusive.
    pub end_offset: i64,
    pub max_message_count: i64,
    /// The partition cannot contribute more than it is already budgeted.
    pub is_drained: bool,
    pub low_water_mark: i64,
    pub high_water_mark: i64,
}

impl PartitionConsumeRequest {
    pub fn is_live_tail(&self) -> bool {
        self.end_offset == OFFSET_UNBOUNDED
    }

    /// Number of offsets between start and end, zero for an empty range.
    pub fn range_len(&self) -> i64 {
        (self.end_offset - self.start_offset + 1).max(0)
    }

    pub fn assign_offset(&self) -> AssignOffset {
        if self.start_offset == OFFSET_FUTURE && self.is_live_tail() {
            AssignOffset::End
        } else {
            AssignOffset::At(self.start_offset)
        }
    }
}

/// Consume requests keyed and iterated by partition id.
pub type ConsumePlan = BTreeMap<i32, PartitionConsumeRequest>;

pub fn plan_message_count(plan: &ConsumePlan) -> i64 {
    plan.values().map(|req| req.max_message_count).sum()
}

/// How a granted message extends a partition's range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Walk {
    /// The range ends at a fixed offset and grows towards the low watermark.
    Backward,
    /// The range starts at a fixed offset and grows towards its end offset.
    Forward,
}

impl Walk {
    fn at_bound(self, req: &PartitionConsumeRequest) -> bool {
        match self {
            Walk::Backward => req.start_offset <= req.low_water_mark,
            Walk::Forward => req.range_len() <= req.max_message_count,
        }
    }
}

/// Hands out `budget` messages one at a time across the not yet drained
/// partitions, in ascending partition order, and drops the partitions that got
/// nothing. Returns the part of the budget that could not be placed.
///
/// A partition is marked drained as soon as its range is covered, including on
/// the grant that spends the last message of the budget.
pub(crate) fn balance(plan: &mut ConsumePlan, budget: i64, walk: Walk) -> i64 {
    let mut remaining = budget.max(0);
    while remaining > 0 {
        let mut yielded = false;
        for req in plan.values_mut() {
            if remaining == 0 {
                break;
            }
            if req.is_drained {
                continue;
            }
            if walk.at_bound(req) {
                req.is_drained = true;
                continue;
            }
            if walk == Walk::Backward {
                req.start_offset -= 1;
            }
            req.max_message_count += 1;
            remaining -= 1;
            yielded = true;
            if walk.at_bound(req) {
                req.is_drained = true;
            }
        }
        if !yielded {
            break;
        }
    }
    plan.retain(|_, req| req.max_message_count > 0);
    remaining
}

/// Builds the per-partition consume requests for `request`.
///
/// `watermarks` must only hold the partitions to read. `timestamp_offsets` is only
/// consulted for `StartOffset::Timestamp`; partitions missing from it are skipped.
pub fn calculate_consume_requests(
    request: &ListMessageRequest,
    watermarks: &Watermarks,
    timestamp_offsets: &BTreeMap<i32, i64>,
) -> ConsumePlan {
    let mut plan = ConsumePlan::new();
    if request.message_count <= 0 || watermarks.bounds.is_empty() {
        return plan;
    }
    let predictable = request.is_predictable();

    for bounds in watermarks.bounds.values() {
        let (low, high) = (bounds.low, bounds.high);
        let clamp = |offset: i64| offset.max(low).min(high);
        let (start_offset, end_offset) = match request.start_offset {
            StartOffset::Recent if predictable => (high, high - 1),
            StartOffset::Recent => (clamp(high - 1 - request.message_count), high - 1),
            StartOffset::Oldest => (low, high - 1),
            StartOffset::Newest => (OFFSET_FUTURE, OFFSET_UNBOUNDED),
            StartOffset::Timestamp => {
                let Some(&offset) = timestamp_offsets.get(&bounds.partition_id) else {
                    debug!(
                        "no timestamp offset for partition {}, skipping it",
                        bounds.partition_id
                    );
                    continue;
                };
                // every record is older than the timestamp
                let offset = if offset < 0 { high - 1 } else { offset };
                (clamp(offset), high - 1)
            }
            StartOffset::Custom(offset) => (clamp(offset), high - 1),
        };

        let mut req = PartitionConsumeRequest {
            partition_id: bounds.partition_id,
            start_offset,
            end_offset,
            max_message_count: 0,
            is_drained: false,
            low_water_mark: low,
            high_water_mark: high,
        };
        if !predictable {
            req.max_message_count = request.message_count;
            req.is_drained = !req.is_live_tail() && req.range_len() <= req.max_message_count;
        }
        plan.insert(bounds.partition_id, req);
    }

    if predictable {
        let walk = if request.start_offset == StartOffset::Recent {
            Walk::Backward
        } else {
            Walk::Forward
        };
        let unplaced = balance(&mut plan, request.message_count, walk);
        trace!(
            "balanced {} messages over {} partitions, {} unplaced",
            request.message_count,
            plan.len(),
            unplaced
        );
    }
    plan
}
