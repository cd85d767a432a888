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

use bytes::Bytes;
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecordHeader {
    pub key: String,
    pub value: Option<Bytes>,
}

impl RecordHeader {
    pub fn new<T: AsRef<[u8]>>(key: impl Into<String>, value: T) -> RecordHeader {
        RecordHeader {
            key: key.into(),
            value: {
                if value.as_ref().is_empty() {
                    None
                } else {
                    Some(Bytes::copy_from_slice(value.as_ref()))
                }
            },
        }
    }

    pub fn size(&self) -> usize {
        self.key.len() + self.value.as_ref().map_or(0, |v| v.len())
    }
}

/// A record as handed out by a consume session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConsumedRecord {
    pub partition_id: i32,
    pub offset: i64,
    pub timestamp_ms: i64,
    pub key: Option<Bytes>,
    pub value: Option<Bytes>,
    pub headers: Vec<RecordHeader>,
}

impl ConsumedRecord {
    pub fn new(
        partition_id: i32,
        offset: i64,
        timestamp_ms: i64,
        key: Option<Bytes>,
        value: Option<Bytes>,
    ) -> Self {
        Self {
            partition_id,
            offset,
            timestamp_ms,
            key,
            value,
            headers: Vec::new(),
        }
    }

    pub fn with_headers(mut self, headers: Vec<RecordHeader>) -> Self {
        self.headers = headers;
        self
    }

    /// Payload size used for throughput accounting: key, value and headers.
    pub fn size_bytes(&self) -> usize {
        self.key.as_ref().map_or(0, |k| k.len())
            + self.value.as_ref().map_or(0, |v| v.len())
            + self.headers.iter().map(RecordHeader::size).sum::<usize>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_size_bytes_counts_key_value_and_headers() {
        let record = ConsumedRecord::new(
            0,
            10,
            1_700_000_000_000,
            Some(Bytes::from_static(b"key")),
            Some(Bytes::from_static(b"value")),
        )
        .with_headers(vec![
            RecordHeader::new("trace", b"abc"),
            RecordHeader::new("empty", b""),
        ]);
        assert_eq!(record.size_bytes(), 3 + 5 + (5 + 3) + 5);
        assert_eq!(record.headers[1].value, None);
    }

    #[test]
    fn test_size_bytes_tombstone() {
        let record = ConsumedRecord::new(1, 0, 0, Some(Bytes::from_static(b"k")), None);
        assert_eq!(record.size_bytes(), 1);
    }
}
