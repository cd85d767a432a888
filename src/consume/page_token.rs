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

//! Page tokens
//!
//! A page token is the whole pagination state of a paged listing, handed to the
//! caller as an opaque string and sent back for the next page. Nothing is kept on
//! the server, so any instance can serve the next page.
//!
//! Wire format: base64url (no padding) of a compact JSON object
//!
//! ```text
//! {"t":"orders","pc":2,"p":[{"id":0,"no":99,"lw":0,"hw":100},...],"d":"desc","ps":50}
//! ```
//!
//! Cursors only move towards their boundary. A token cannot be rewound, and a
//! token of a topic whose partition count changed has to be thrown away.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{Display, Formatter};
use std::str::FromStr;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::{AppError, AppResult};

use super::plan::{balance, ConsumePlan, PartitionConsumeRequest, Walk};
use super::watermark::Watermarks;

pub const MIN_PAGE_SIZE: i32 = 1;
pub const MAX_PAGE_SIZE: i32 = 500;
/// Upper bound of `page_size * partition_count`.
pub const MAX_PAGE_FANOUT: i64 = 100_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    #[serde(rename = "asc")]
    Ascending,
    #[serde(rename = "desc")]
    Descending,
}

impl FromStr for Direction {
    type Err = AppError;

    fn from_str(s: &str) -> AppResult<Self> {
        match s.to_ascii_lowercase().as_str() {
            "asc" | "ascending" => Ok(Direction::Ascending),
            "desc" | "descending" => Ok(Direction::Descending),
            other => Err(AppError::InvalidArgument(format!(
                "unknown direction {:?}, expected asc or desc",
                other
            ))),
        }
    }
}

impl Display for Direction {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::Ascending => write!(f, "asc"),
            Direction::Descending => write!(f, "desc"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionCursor {
    pub id: i32,
    /// Next offset to read; -1 once a descending cursor walked past offset 0.
    #[serde(rename = "no")]
    pub next_offset: i64,
    #[serde(rename = "lw")]
    pub low_water_mark: i64,
    #[serde(rename = "hw")]
    pub high_water_mark: i64,
}

impl PartitionCursor {
    pub fn is_exhausted(&self, direction: Direction) -> bool {
        match direction {
            Direction::Descending => self.next_offset < self.low_water_mark,
            Direction::Ascending => self.next_offset >= self.high_water_mark,
        }
    }

    fn validate(&self, direction: Direction) -> AppResult<()> {
        if self.low_water_mark < 0 {
            return Err(invalid(format!(
                "partition {}: low_water_mark {} is negative",
                self.id, self.low_water_mark
            )));
        }
        if self.high_water_mark < 0 {
            return Err(invalid(format!(
                "partition {}: high_water_mark {} is negative",
                self.id, self.high_water_mark
            )));
        }
        if self.high_water_mark < self.low_water_mark {
            return Err(invalid(format!(
                "partition {}: high_water_mark {} is below low_water_mark {}",
                self.id, self.high_water_mark, self.low_water_mark
            )));
        }
        if self.next_offset < -1 {
            return Err(invalid(format!(
                "partition {}: next_offset {} is below -1",
                self.id, self.next_offset
            )));
        }
        match direction {
            Direction::Descending if self.next_offset > self.high_water_mark - 1 => {
                Err(invalid(format!(
                    "partition {}: next_offset {} is not below high_water_mark {}",
                    self.id, self.next_offset, self.high_water_mark
                )))
            }
            Direction::Ascending if self.next_offset < self.low_water_mark => Err(invalid(format!(
                "partition {}: next_offset {} is below low_water_mark {}",
                self.id, self.next_offset, self.low_water_mark
            ))),
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageToken {
    #[serde(rename = "t")]
    pub topic_name: String,
    #[serde(rename = "pc")]
    pub partition_count: i32,
    #[serde(rename = "p")]
    pub partitions: Vec<PartitionCursor>,
    #[serde(rename = "d")]
    pub direction: Direction,
    #[serde(rename = "ps")]
    pub page_size: i32,
}

fn invalid(msg: String) -> AppError {
    AppError::TokenValidation(msg)
}

/// Builds the first token of a paged listing from the partitions' start and end
/// offsets. Partitions without an end offset (deleted meanwhile) are skipped.
pub fn create_initial_page_token(
    topic: &str,
    start_offsets: &BTreeMap<i32, i64>,
    end_offsets: &BTreeMap<i32, i64>,
    page_size: i32,
    direction: Direction,
) -> AppResult<PageToken> {
    if !(MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&page_size) {
        return Err(AppError::InvalidArgument(format!(
            "page_size {} out of range [{}, {}]",
            page_size, MIN_PAGE_SIZE, MAX_PAGE_SIZE
        )));
    }

    let partitions: Vec<PartitionCursor> = start_offsets
        .iter()
        .filter_map(|(&id, &low)| {
            let high = *end_offsets.get(&id)?;
            let next_offset = match direction {
                Direction::Descending => high - 1,
                Direction::Ascending => low,
            };
            Some(PartitionCursor {
                id,
                next_offset,
                low_water_mark: low,
                high_water_mark: high,
            })
        })
        .collect();
    if partitions.is_empty() {
        return Err(AppError::InvalidArgument(format!(
            "no partitions with known offsets in topic {}",
            topic
        )));
    }

    let token = PageToken {
        topic_name: topic.to_string(),
        partition_count: partitions.len() as i32,
        partitions,
        direction,
        page_size,
    };
    token
        .validate()
        .map_err(|e| AppError::InvalidArgument(e.to_string()))?;
    Ok(token)
}

/// Decodes and validates a token received from a caller.
pub fn decode_page_token(encoded: &str) -> AppResult<PageToken> {
    let raw = URL_SAFE_NO_PAD
        .decode(encoded.trim().as_bytes())
        .map_err(|e| AppError::TokenDecode(e.to_string()))?;
    let token: PageToken = serde_json::from_slice(&raw)?;
    token.validate()?;
    Ok(token)
}

impl PageToken {
    /// Serializes the token. An invalid token is never handed out.
    pub fn encode(&self) -> AppResult<String> {
        self.validate()?;
        let raw = serde_json::to_vec(self)?;
        Ok(URL_SAFE_NO_PAD.encode(raw))
    }

    pub fn validate(&self) -> AppResult<()> {
        if self.topic_name.is_empty() {
            return Err(invalid("topic_name must not be empty".to_string()));
        }
        if self.partition_count <= 0 {
            return Err(invalid(format!(
                "partition_count {} must be positive",
                self.partition_count
            )));
        }
        if self.partitions.len() != self.partition_count as usize {
            return Err(invalid(format!(
                "partition count mismatch: partition_count is {} but {} cursors are present",
                self.partition_count,
                self.partitions.len()
            )));
        }
        if !(MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&self.page_size) {
            return Err(invalid(format!(
                "page_size {} out of range [{}, {}]",
                self.page_size, MIN_PAGE_SIZE, MAX_PAGE_SIZE
            )));
        }
        let fanout = self.page_size as i64 * self.partition_count as i64;
        if fanout > MAX_PAGE_FANOUT {
            return Err(invalid(format!(
                "page_size {} times partition_count {} exceeds {}",
                self.page_size, self.partition_count, MAX_PAGE_FANOUT
            )));
        }
        let mut seen = BTreeSet::new();
        for cursor in &self.partitions {
            if !seen.insert(cursor.id) {
                return Err(invalid(format!(
                    "partition {} appears more than once",
                    cursor.id
                )));
            }
            cursor.validate(self.direction)?;
        }
        Ok(())
    }

    pub fn cursor(&self, partition_id: i32) -> Option<&PartitionCursor> {
        self.partitions.iter().find(|c| c.id == partition_id)
    }

    pub fn has_more(&self) -> bool {
        self.partitions
            .iter()
            .any(|c| !c.is_exhausted(self.direction))
    }

    /// Unknown partitions count as exhausted.
    pub fn is_exhausted(&self, partition_id: i32) -> bool {
        self.cursor(partition_id)
            .map_or(true, |c| c.is_exhausted(self.direction))
    }

    /// Records that `[from, to]` of a partition was served. Descending cursors move
    /// below `from`, ascending ones above `to`; a cursor never moves back.
    pub fn advance(&mut self, partition_id: i32, from: i64, to: i64) -> AppResult<()> {
        let direction = self.direction;
        let cursor = self
            .partitions
            .iter_mut()
            .find(|c| c.id == partition_id)
            .ok_or_else(|| {
                AppError::InvalidArgument(format!(
                    "partition {} is not part of the page token",
                    partition_id
                ))
            })?;
        cursor.next_offset = match direction {
            Direction::Descending => cursor.next_offset.min(from - 1).max(-1),
            Direction::Ascending => cursor.next_offset.max(to + 1),
        };
        trace!(
            "advanced partition {} cursor to {}",
            partition_id,
            cursor.next_offset
        );
        Ok(())
    }

    /// Applies freshly fetched watermarks. Retention only ever raises the low
    /// watermark; ascending tokens also follow new records past the old high
    /// watermark, descending ones keep the ceiling of their first page. Either
    /// way the cursor ends up inside the offsets the partition really has.
    pub fn refresh_watermarks(&mut self, watermarks: &Watermarks) {
        for cursor in self.partitions.iter_mut() {
            let Some(bounds) = watermarks.get(cursor.id) else {
                continue;
            };
            cursor.high_water_mark = match self.direction {
                Direction::Ascending => cursor.high_water_mark.max(bounds.high),
                Direction::Descending => cursor.high_water_mark.min(bounds.high),
            };
            cursor.low_water_mark = cursor
                .low_water_mark
                .max(bounds.low)
                .min(cursor.high_water_mark);
            cursor.next_offset = match self.direction {
                Direction::Ascending => cursor
                    .next_offset
                    .max(cursor.low_water_mark)
                    .min(cursor.high_water_mark),
                Direction::Descending => cursor.next_offset.min(cursor.high_water_mark - 1),
            };
        }
    }

    /// Plans the next page: `page_size` messages spread over the cursors that are
    /// not exhausted, each range continuing where its cursor stopped.
    pub fn calculate_consume_requests(&self) -> ConsumePlan {
        let mut plan = ConsumePlan::new();
        for cursor in &self.partitions {
            if cursor.is_exhausted(self.direction) {
                continue;
            }
            let (start_offset, end_offset) = match self.direction {
                Direction::Descending => (cursor.next_offset + 1, cursor.next_offset),
                Direction::Ascending => (cursor.next_offset, cursor.high_water_mark - 1),
            };
            plan.insert(
                cursor.id,
                PartitionConsumeRequest {
                    partition_id: cursor.id,
                    start_offset,
                    end_offset,
                    max_message_count: 0,
                    is_drained: false,
                    low_water_mark: cursor.low_water_mark,
                    high_water_mark: cursor.high_water_mark,
                },
            );
        }
        let walk = match self.direction {
            Direction::Descending => Walk::Backward,
            Direction::Ascending => Walk::Forward,
        };
        balance(&mut plan, self.page_size as i64, walk);
        plan
    }
}
