use std::collections::VecDeque;
use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::error;

use crate::consumer::{
    ConsumerStats, EventConsumer, EventHandler, SubscriptionStats, SubscriptionToken,
};
use crate::errors::ConsumerError;
use crate::event::AgentEvent;
use crate::fanout::{DEFAULT_SUBSCRIBER_QUEUE, SubscriberHub};

/// Settings for [`MemoryConsumer`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryConsumerConfig {
    /// Events kept per run; the oldest are evicted first.
    #[serde(default = "default_max_per_run")]
    pub max_per_run: usize,
    /// Bounded queue length per subscription.
    #[serde(default = "default_subscriber_queue")]
    pub subscriber_queue_capacity: usize,
}

const fn default_max_per_run() -> usize {
    5_000
}

const fn default_subscriber_queue() -> usize {
    DEFAULT_SUBSCRIBER_QUEUE
}

impl Default for MemoryConsumerConfig {
    fn default() -> Self {
        Self {
            max_per_run: default_max_per_run(),
            subscriber_queue_capacity: default_subscriber_queue(),
        }
    }
}

#[derive(Default)]
struct RunLog {
    events: VecDeque<Arc<AgentEvent>>,
    last_seq: u64,
}

/// Memory-only consumer: a bounded ring of events per run, lost at process end.
pub struct MemoryConsumer {
    config: MemoryConsumerConfig,
    runs: DashMap<String, RunLog>,
    hub: SubscriberHub,
}

impl MemoryConsumer {
    pub fn new(config: MemoryConsumerConfig) -> Result<Self, ConsumerError> {
        if config.max_per_run == 0 {
            return Err(ConsumerError::Config(
                "max_per_run must be greater than 0".into(),
            ));
        }
        if config.subscriber_queue_capacity == 0 {
            return Err(ConsumerError::Config(
                "subscriber_queue_capacity must be greater than 0".into(),
            ));
        }
        Ok(Self {
            hub: SubscriberHub::new(config.subscriber_queue_capacity),
            runs: DashMap::new(),
            config,
        })
    }

    /// Removes the run's events and subscribers.
    pub fn purge(&self, run_id: &str) {
        self.runs.remove(run_id);
        self.hub.remove_run(run_id);
    }

    pub fn stats(&self) -> ConsumerStats {
        let (dropped_events, handler_failures) = self.hub.totals();
        ConsumerStats {
            memory_events: self.runs.iter().map(|r| r.value().events.len()).sum(),
            buffered_events: 0,
            partitions: 0,
            subscribers: self.hub.subscriber_count(),
            dropped_events,
            handler_failures,
        }
    }
}

impl Default for MemoryConsumer {
    fn default() -> Self {
        Self {
            hub: SubscriberHub::new(DEFAULT_SUBSCRIBER_QUEUE),
            runs: DashMap::new(),
            config: MemoryConsumerConfig::default(),
        }
    }
}

#[async_trait::async_trait]
impl EventConsumer for MemoryConsumer {
    async fn publish(&self, event: AgentEvent) -> Result<(), ConsumerError> {
        let event = Arc::new(event);
        let mut log = self.runs.entry(event.run_id().to_string()).or_default();
        let expected = log.last_seq + 1;
        if event.seq() != expected {
            error!(run_id = event.run_id(), expected, actual = event.seq(), "seq ordering violation");
            return Err(ConsumerError::OrderingViolation {
                run_id: event.run_id().to_string(),
                expected,
                actual: event.seq(),
            });
        }
        log.last_seq = event.seq();
        self.hub.dispatch(&event);
        if log.events.len() >= self.config.max_per_run {
            log.events.pop_front();
        }
        log.events.push_back(event);
        Ok(())
    }

    async fn subscribe(
        &self,
        run_id: &str,
        handler: Arc<dyn EventHandler>,
    ) -> Result<SubscriptionToken, ConsumerError> {
        Ok(self.hub.subscribe(run_id, handler))
    }

    async fn unsubscribe(&self, run_id: &str, token: SubscriptionToken) {
        self.hub.unsubscribe(run_id, token);
    }

    async fn fetch(
        &self,
        run_id: &str,
        from_seq: Option<u64>,
    ) -> Result<Vec<AgentEvent>, ConsumerError> {
        let from = from_seq.unwrap_or(0);
        let log = self
            .runs
            .get(run_id)
            .ok_or_else(|| ConsumerError::unknown_run(run_id))?;
        Ok(log
            .events
            .iter()
            .filter(|e| e.seq() >= from)
            .map(|e| AgentEvent::clone(e))
            .collect())
    }

    async fn close_run(&self, run_id: &str) -> Result<(), ConsumerError> {
        self.hub.close_run(run_id);
        Ok(())
    }

    fn subscription_stats(
        &self,
        run_id: &str,
        token: SubscriptionToken,
    ) -> Result<SubscriptionStats, ConsumerError> {
        self.hub.stats(run_id, token)
    }
}
