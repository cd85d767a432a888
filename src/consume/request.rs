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

use std::fmt::{Display, Formatter};

use crate::{AppError, AppResult};

/// Partition selector meaning "every partition of the topic".
pub const ALL_PARTITIONS: i32 = -1;

pub const START_OFFSET_RECENT: i64 = -1;
pub const START_OFFSET_OLDEST: i64 = -2;
pub const START_OFFSET_NEWEST: i64 = -3;
pub const START_OFFSET_TIMESTAMP: i64 = -4;

/// Where a listing starts. Converts losslessly to and from the sentinel values
/// callers put on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StartOffset {
    /// The most recent N messages.
    Recent,
    /// From the low watermark onwards.
    Oldest,
    /// Live tail: only records produced after the request started.
    Newest,
    /// From the first record at or after `ListMessageRequest::start_timestamp`.
    Timestamp,
    Custom(i64),
}

impl StartOffset {
    pub fn as_i64(self) -> i64 {
        match self {
            StartOffset::Recent => START_OFFSET_RECENT,
            StartOffset::Oldest => START_OFFSET_OLDEST,
            StartOffset::Newest => START_OFFSET_NEWEST,
            StartOffset::Timestamp => START_OFFSET_TIMESTAMP,
            StartOffset::Custom(offset) => offset,
        }
    }
}

impl TryFrom<i64> for StartOffset {
    type Error = AppError;

    fn try_from(value: i64) -> AppResult<Self> {
        match value {
            START_OFFSET_RECENT => Ok(StartOffset::Recent),
            START_OFFSET_OLDEST => Ok(StartOffset::Oldest),
            START_OFFSET_NEWEST => Ok(StartOffset::Newest),
            START_OFFSET_TIMESTAMP => Ok(StartOffset::Timestamp),
            offset if offset >= 0 => Ok(StartOffset::Custom(offset)),
            other => Err(AppError::InvalidArgument(format!(
                "unknown start offset sentinel {}",
                other
            ))),
        }
    }
}

impl Display for StartOffset {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            StartOffset::Recent => write!(f, "recent"),
            StartOffset::Oldest => write!(f, "oldest"),
            StartOffset::Newest => write!(f, "newest"),
            StartOffset::Timestamp => write!(f, "timestamp"),
            StartOffset::Custom(offset) => write!(f, "offset {}", offset),
        }
    }
}

/// One "list messages" call. Built per request and consumed once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListMessageRequest {
    pub topic_name: String,
    pub partition_id: i32,
    pub start_offset: StartOffset,
    /// Only read when `start_offset` is `StartOffset::Timestamp`.
    pub start_timestamp: i64,
    pub message_count: i64,
    /// Source of the caller's record filter. Only its presence matters here: a
    /// filtered listing cannot know up front how many records each partition yields.
    pub filter_code: String,
    /// Page size for paged listings.
    pub page_size: usize,
}

impl ListMessageRequest {
    pub fn new(
        topic_name: impl Into<String>,
        start_offset: StartOffset,
        message_count: i64,
    ) -> Self {
        Self {
            topic_name: topic_name.into(),
            partition_id: ALL_PARTITIONS,
            start_offset,
            start_timestamp: 0,
            message_count,
            filter_code: String::new(),
            page_size: 0,
        }
    }

    pub fn with_partition(mut self, partition_id: i32) -> Self {
        self.partition_id = partition_id;
        self
    }

    pub fn with_start_timestamp(mut self, start_timestamp: i64) -> Self {
        self.start_timestamp = start_timestamp;
        self
    }

    pub fn with_filter_code(mut self, filter_code: impl Into<String>) -> Self {
        self.filter_code = filter_code.into();
        self
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn has_filter(&self) -> bool {
        !self.filter_code.trim().is_empty()
    }

    /// Balancing only works when every record in range is delivered: not for the
    /// live tail and not behind a filter.
    pub fn is_predictable(&self) -> bool {
        self.start_offset != StartOffset::Newest && !self.has_filter()
    }

    pub fn selects_all_partitions(&self) -> bool {
        self.partition_id == ALL_PARTITIONS
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case(-1, StartOffset::Recent)]
    #[case(-2, StartOffset::Oldest)]
    #[case(-3, StartOffset::Newest)]
    #[case(-4, StartOffset::Timestamp)]
    #[case(0, StartOffset::Custom(0))]
    #[case(42, StartOffset::Custom(42))]
    fn test_start_offset_sentinels(#[case] raw: i64, #[case] expected: StartOffset) {
        let parsed = StartOffset::try_from(raw).unwrap();
        assert_eq!(parsed, expected);
        assert_eq!(parsed.as_i64(), raw);
    }

    #[test]
    fn test_unknown_sentinel_rejected() {
        assert!(matches!(
            StartOffset::try_from(-5),
            Err(AppError::InvalidArgument(_))
        ));
    }

    #[rstest]
    #[case(StartOffset::Recent, "", true)]
    #[case(StartOffset::Oldest, "", true)]
    #[case(StartOffset::Newest, "", false)]
    #[case(StartOffset::Oldest, "return value.id > 3", false)]
    #[case(StartOffset::Custom(7), "   ", true)]
    fn test_predictability(
        #[case] start_offset: StartOffset,
        #[case] filter_code: &str,
        #[case] predictable: bool,
    ) {
        let request =
            ListMessageRequest::new("orders", start_offset, 10).with_filter_code(filter_code);
        assert_eq!(request.is_predictable(), predictable);
    }
}
