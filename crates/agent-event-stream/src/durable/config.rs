use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::retry::RetryPolicy;
use crate::errors::ConsumerError;
use crate::fanout::DEFAULT_SUBSCRIBER_QUEUE;

/// Settings for [`DurableConsumer`](super::DurableConsumer).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DurableConfig {
    /// Directory holding one partition file per run.
    #[serde(default = "default_storage_path")]
    pub storage_path: PathBuf,
    /// Hot cache size per run; oldest-by-seq is evicted first.
    #[serde(default = "default_max_memory_events")]
    pub max_memory_events: usize,
    /// Buffered events (across runs) that trigger an immediate flush.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,
    /// Age, from event timestamp, after which stored events are swept.
    #[serde(default = "default_retention_secs")]
    pub retention_secs: u64,
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
    #[serde(default = "default_subscriber_queue")]
    pub subscriber_queue_capacity: usize,
    #[serde(default)]
    pub retry: RetryPolicy,
}

fn default_storage_path() -> PathBuf {
    PathBuf::from("./agent_events")
}

const fn default_max_memory_events() -> usize {
    1_000
}

const fn default_batch_size() -> usize {
    100
}

const fn default_flush_interval_ms() -> u64 {
    10_000
}

const fn default_retention_secs() -> u64 {
    30 * 24 * 3_600
}

const fn default_sweep_interval_ms() -> u64 {
    3_600_000
}

const fn default_subscriber_queue() -> usize {
    DEFAULT_SUBSCRIBER_QUEUE
}

impl Default for DurableConfig {
    fn default() -> Self {
        Self::new(default_storage_path())
    }
}

impl DurableConfig {
    pub fn new(storage_path: impl Into<PathBuf>) -> Self {
        Self {
            storage_path: storage_path.into(),
            max_memory_events: default_max_memory_events(),
            batch_size: default_batch_size(),
            flush_interval_ms: default_flush_interval_ms(),
            retention_secs: default_retention_secs(),
            sweep_interval_ms: default_sweep_interval_ms(),
            subscriber_queue_capacity: default_subscriber_queue(),
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_max_memory_events(mut self, max: usize) -> Self {
        self.max_memory_events = max;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention_secs = retention.as_secs();
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn with_subscriber_queue_capacity(mut self, capacity: usize) -> Self {
        self.subscriber_queue_capacity = capacity;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub(crate) fn validate(&self) -> Result<(), ConsumerError> {
        let checks = [
            (self.max_memory_events == 0, "max_memory_events must be greater than 0"),
            (self.batch_size == 0, "batch_size must be greater than 0"),
            (self.flush_interval_ms == 0, "flush_interval must be greater than 0"),
            (self.retention_secs == 0, "retention must be greater than 0"),
            (self.sweep_interval_ms == 0, "sweep_interval must be greater than 0"),
            (
                self.subscriber_queue_capacity == 0,
                "subscriber_queue_capacity must be greater than 0",
            ),
            (self.retry.max_attempts == 0, "retry.max_attempts must be at least 1"),
        ];
        for (failed, message) in checks {
            if failed {
                return Err(ConsumerError::Config(message.into()));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_follow_documented_values() {
        let config = DurableConfig::default();
        assert_eq!(config.max_memory_events, 1_000);
        assert_eq!(config.batch_size, 100);
        assert_eq!(config.flush_interval(), Duration::from_secs(10));
        assert_eq!(config.retention(), Duration::from_secs(30 * 24 * 3_600));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn deserializes_partial_config() {
        let config: DurableConfig =
            serde_json::from_str(r#"{"storage_path": "/tmp/ev", "batch_size": 2}"#).unwrap();
        assert_eq!(config.storage_path, PathBuf::from("/tmp/ev"));
        assert_eq!(config.batch_size, 2);
        assert_eq!(config.max_memory_events, 1_000);
    }

    #[test]
    fn zero_batch_size_is_rejected() {
        let err = DurableConfig::new("/tmp/x").with_batch_size(0).validate();
        assert!(matches!(err, Err(ConsumerError::Config(msg)) if msg.contains("batch_size")));
    }
}
