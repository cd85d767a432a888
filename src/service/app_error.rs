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

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// general errors
    #[error("illegal state: {0}")]
    IllegalState(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("config file error: {0}")]
    ConfigFileError(#[from] config::ConfigError),

    /// upstream cluster errors
    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error("unknown topic: {0}")]
    UnknownTopic(String),

    /// page token errors, kept apart so callers can tell a tampered or stale
    /// cursor from a malformed request
    #[error("failed to decode page token: {0}")]
    TokenDecode(String),

    #[error("failed to parse page token: {0}")]
    TokenParse(#[from] serde_json::Error),

    #[error("invalid page token: {0}")]
    TokenValidation(String),

    /// record filter errors
    #[error("filter predicate failed: {0}")]
    FilterPredicate(String),
}

impl AppError {
    /// Validation failures never reach the cluster and are fixed by the caller
    /// restarting pagination.
    pub fn is_recoverable_by_restart(&self) -> bool {
        matches!(
            self,
            AppError::TokenDecode(_) | AppError::TokenParse(_) | AppError::TokenValidation(_)
        )
    }

    /// Prefixes an upstream failure with the call and topic it happened on. Other
    /// variants already carry their context.
    pub fn with_topic_context(self, topic: &str, what: &str) -> AppError {
        match self {
            AppError::UpstreamUnavailable(msg) => {
                AppError::UpstreamUnavailable(format!("{} of topic {}: {}", what, topic, msg))
            }
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_context_only_wraps_upstream_errors() {
        let err = AppError::UpstreamUnavailable("no broker reachable".to_string())
            .with_topic_context("orders", "polling records");
        assert_eq!(
            err.to_string(),
            "upstream unavailable: polling records of topic orders: no broker reachable"
        );

        let err = AppError::UnknownTopic("orders".to_string()).with_topic_context("orders", "x");
        assert!(matches!(err, AppError::UnknownTopic(_)));
    }
}
