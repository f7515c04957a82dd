use std::fmt;
use std::future::Future;
use std::sync::Arc;

use crate::errors::{ConsumerError, HandlerError};
use crate::event::AgentEvent;

/// Opaque handle returned by `subscribe`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionToken(pub(crate) u64);

impl SubscriptionToken {
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for SubscriptionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Receives the events of one run.
///
/// Each subscription gets its own queue and task, so a slow or failing
/// handler only affects itself.
#[async_trait::async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: Arc<AgentEvent>) -> Result<(), HandlerError>;

    /// Called once after the run was closed and every queued event was handled.
    async fn on_close(&self, _run_id: &str) {}
}

struct FnHandler<F> {
    f: F,
}

#[async_trait::async_trait]
impl<F, Fut> EventHandler for FnHandler<F>
where
    F: Fn(Arc<AgentEvent>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send,
{
    async fn handle(&self, event: Arc<AgentEvent>) -> Result<(), HandlerError> {
        (self.f)(event).await
    }
}

/// Adapts an async closure into an [`EventHandler`].
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn EventHandler>
where
    F: Fn(Arc<AgentEvent>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    Arc::new(FnHandler { f })
}

/// Per-subscription delivery counters.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SubscriptionStats {
    /// Events the handler accepted.
    pub delivered: u64,
    /// Events discarded because the queue was full (oldest first).
    pub dropped: u64,
    /// Handler errors and panics.
    pub failed: u64,
    /// Message of the most recent handler failure.
    pub last_error: Option<String>,
    /// Events waiting in the queue.
    pub queued: usize,
}

/// Point-in-time consumer counters.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ConsumerStats {
    /// Events held in memory across all runs.
    pub memory_events: usize,
    /// Events buffered for the durable tier but not yet confirmed on disk.
    pub buffered_events: usize,
    /// Run partitions present in the durable tier.
    pub partitions: usize,
    /// Live subscriptions across all runs.
    pub subscribers: usize,
    /// Events dropped from saturated subscriber queues.
    pub dropped_events: u64,
    /// Handler failures caught at the dispatch boundary.
    pub handler_failures: u64,
}

/// Capability interface shared by the memory-only and durable consumers.
#[async_trait::async_trait]
pub trait EventConsumer: Send + Sync {
    /// Fans the event out to the run's subscribers and retains it.
    ///
    /// Live dispatch happens before any storage work; a returned storage
    /// error never retracts it.
    async fn publish(&self, event: AgentEvent) -> Result<(), ConsumerError>;

    /// Registers a handler for future events of `run_id`.
    async fn subscribe(
        &self,
        run_id: &str,
        handler: Arc<dyn EventHandler>,
    ) -> Result<SubscriptionToken, ConsumerError>;

    /// Removes a subscription. Unknown tokens are ignored.
    async fn unsubscribe(&self, run_id: &str, token: SubscriptionToken);

    /// Retained events of a run with `seq >= from_seq`, in seq order.
    async fn fetch(
        &self,
        run_id: &str,
        from_seq: Option<u64>,
    ) -> Result<Vec<AgentEvent>, ConsumerError>;

    /// Ends a run: subscribers drain and detach, buffered data is settled.
    async fn close_run(&self, run_id: &str) -> Result<(), ConsumerError>;

    fn subscription_stats(
        &self,
        run_id: &str,
        token: SubscriptionToken,
    ) -> Result<SubscriptionStats, ConsumerError>;
}
