//! Per-subscriber queues and delivery tasks.
//!
//! Publishing only enqueues; every subscription is drained by its own task.
//! A full queue drops its oldest event and counts the drop, so a slow handler
//! sees gaps but never reordered events.

use std::collections::{BTreeMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use dashmap::DashMap;
use futures::FutureExt as _;
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::consumer::{EventHandler, SubscriptionStats, SubscriptionToken};
use crate::errors::ConsumerError;
use crate::event::AgentEvent;

/// Default bounded queue length per subscription.
pub const DEFAULT_SUBSCRIBER_QUEUE: usize = 1024;

struct Slot {
    run_id: String,
    token: SubscriptionToken,
    capacity: usize,
    queue: Mutex<VecDeque<Arc<AgentEvent>>>,
    notify: Notify,
    /// Cleared by unsubscribe: queued events are skipped.
    active: AtomicBool,
    /// Set by run close: queued events are delivered, then the task exits.
    draining: AtomicBool,
    delivered: AtomicU64,
    dropped: AtomicU64,
    failed: AtomicU64,
    last_error: Mutex<Option<String>>,
    /// Hub-wide counters; they keep counting after the slot is removed.
    totals: Arc<Totals>,
}

#[derive(Default)]
struct Totals {
    dropped: AtomicU64,
    failed: AtomicU64,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Slot {
    fn enqueue(&self, event: Arc<AgentEvent>) {
        let mut queue = lock(&self.queue);
        if queue.len() >= self.capacity {
            queue.pop_front();
            let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            self.totals.dropped.fetch_add(1, Ordering::Relaxed);
            warn!(run_id = %self.run_id, token = %self.token, dropped, "subscriber queue full, dropping oldest event");
        }
        queue.push_back(event);
        drop(queue);
        self.notify.notify_one();
    }

    fn pop(&self) -> Option<Arc<AgentEvent>> {
        lock(&self.queue).pop_front()
    }

    fn stats(&self) -> SubscriptionStats {
        SubscriptionStats {
            delivered: self.delivered.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            last_error: lock(&self.last_error).clone(),
            queued: lock(&self.queue).len(),
        }
    }

    fn record_failure(&self, message: String) {
        self.failed.fetch_add(1, Ordering::Relaxed);
        self.totals.failed.fetch_add(1, Ordering::Relaxed);
        warn!(run_id = %self.run_id, token = %self.token, error = %message, "subscriber handler failed");
        *lock(&self.last_error) = Some(message);
    }
}

async fn deliver_loop(slot: Arc<Slot>, handler: Arc<dyn EventHandler>) {
    loop {
        if !slot.active.load(Ordering::Acquire) {
            break;
        }
        let Some(event) = slot.pop() else {
            if slot.draining.load(Ordering::Acquire) {
                handler.on_close(&slot.run_id).await;
                break;
            }
            slot.notify.notified().await;
            continue;
        };
        let outcome = AssertUnwindSafe(handler.handle(event.clone()))
            .catch_unwind()
            .await;
        match outcome {
            Ok(Ok(())) => {
                slot.delivered.fetch_add(1, Ordering::Relaxed);
            }
            Ok(Err(err)) => slot.record_failure(err.message),
            Err(_) => slot.record_failure(format!("handler panicked at seq {}", event.seq())),
        }
    }
    debug!(run_id = %slot.run_id, token = %slot.token, "subscriber task finished");
}

/// Subscriber table for all runs, sharded per run id.
pub(crate) struct SubscriberHub {
    runs: DashMap<String, BTreeMap<SubscriptionToken, Arc<Slot>>>,
    next_token: AtomicU64,
    queue_capacity: usize,
    totals: Arc<Totals>,
}

impl SubscriberHub {
    pub(crate) fn new(queue_capacity: usize) -> Self {
        Self {
            runs: DashMap::new(),
            next_token: AtomicU64::new(1),
            queue_capacity: queue_capacity.max(1),
            totals: Arc::default(),
        }
    }

    /// Registers the handler and spawns its delivery task. Requires a tokio runtime.
    pub(crate) fn subscribe(&self, run_id: &str, handler: Arc<dyn EventHandler>) -> SubscriptionToken {
        let token = SubscriptionToken(self.next_token.fetch_add(1, Ordering::Relaxed));
        let slot = Arc::new(Slot {
            run_id: run_id.to_string(),
            token,
            capacity: self.queue_capacity,
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            active: AtomicBool::new(true),
            draining: AtomicBool::new(false),
            delivered: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            last_error: Mutex::new(None),
            totals: self.totals.clone(),
        });
        self.runs
            .entry(run_id.to_string())
            .or_default()
            .insert(token, slot.clone());
        tokio::spawn(deliver_loop(slot, handler));
        debug!(run_id, %token, "subscribed");
        token
    }

    /// Returns false when the token was not subscribed.
    pub(crate) fn unsubscribe(&self, run_id: &str, token: SubscriptionToken) -> bool {
        let removed = {
            let Some(mut subs) = self.runs.get_mut(run_id) else {
                return false;
            };
            subs.remove(&token)
        };
        self.runs.remove_if(run_id, |_, subs| subs.is_empty());
        let Some(slot) = removed else {
            return false;
        };
        slot.active.store(false, Ordering::Release);
        lock(&slot.queue).clear();
        slot.notify.notify_one();
        debug!(run_id, %token, "unsubscribed");
        true
    }

    /// Enqueues the event for every current subscriber of its run.
    ///
    /// The run's shard stays locked while enqueueing, so an unsubscribe that
    /// returned earlier can never receive this event.
    pub(crate) fn dispatch(&self, event: &Arc<AgentEvent>) -> usize {
        let Some(subs) = self.runs.get(event.run_id()) else {
            return 0;
        };
        for slot in subs.values() {
            slot.enqueue(event.clone());
        }
        subs.len()
    }

    /// Detaches every subscriber of the run after its queue drains.
    pub(crate) fn close_run(&self, run_id: &str) {
        let Some((_, subs)) = self.runs.remove(run_id) else {
            return;
        };
        for slot in subs.values() {
            slot.draining.store(true, Ordering::Release);
            slot.notify.notify_one();
        }
    }

    /// Closes every run that still has subscribers.
    pub(crate) fn close_all(&self) {
        let run_ids: Vec<String> = self.runs.iter().map(|entry| entry.key().clone()).collect();
        if !run_ids.is_empty() {
            debug!(runs = run_ids.len(), "detaching all subscribers");
        }
        for run_id in run_ids {
            self.close_run(&run_id);
        }
    }

    /// Drops every subscriber of the run without delivering queued events.
    pub(crate) fn remove_run(&self, run_id: &str) {
        let Some((_, subs)) = self.runs.remove(run_id) else {
            return;
        };
        for slot in subs.values() {
            slot.active.store(false, Ordering::Release);
            lock(&slot.queue).clear();
            slot.notify.notify_one();
        }
    }

    pub(crate) fn has_subscribers(&self, run_id: &str) -> bool {
        self.runs.get(run_id).is_some_and(|subs| !subs.is_empty())
    }

    pub(crate) fn stats(
        &self,
        run_id: &str,
        token: SubscriptionToken,
    ) -> Result<SubscriptionStats, ConsumerError> {
        self.runs
            .get(run_id)
            .and_then(|subs| subs.get(&token).map(|slot| slot.stats()))
            .ok_or_else(|| ConsumerError::UnknownToken {
                run_id: run_id.to_string(),
                token: token.as_u64(),
            })
    }

    pub(crate) fn subscriber_count(&self) -> usize {
        self.runs.iter().map(|entry| entry.value().len()).sum()
    }

    /// Total (dropped, failed) across live and removed subscriptions.
    pub(crate) fn totals(&self) -> (u64, u64) {
        (
            self.totals.dropped.load(Ordering::Relaxed),
            self.totals.failed.load(Ordering::Relaxed),
        )
    }
}

impl Drop for SubscriberHub {
    fn drop(&mut self) {
        self.close_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consumer::handler_fn;
    use crate::errors::HandlerError;
    use crate::record::{ExecutionRecord, Role};
    use std::time::Duration;
    use tokio::sync::mpsc;
    use uuid::Uuid;

    fn event(run_id: &str, seq: u64) -> Arc<AgentEvent> {
        let record = ExecutionRecord::new(Uuid::new_v4(), seq, Role::Assistant).with_content("x");
        Arc::new(AgentEvent::new(run_id, seq, "test", record))
    }

    fn collecting() -> (Arc<dyn EventHandler>, mpsc::UnboundedReceiver<u64>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handler = handler_fn(move |event: Arc<AgentEvent>| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(event.seq());
                Ok(())
            }
        });
        (handler, rx)
    }

    async fn recv(rx: &mut mpsc::UnboundedReceiver<u64>) -> u64 {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out")
            .expect("channel closed")
    }

    #[tokio::test]
    async fn failing_handler_does_not_block_other_subscribers() {
        let hub = SubscriberHub::new(16);
        let failing = handler_fn(|_event: Arc<AgentEvent>| async { Err(HandlerError::new("boom")) });
        let bad = hub.subscribe("run", failing);
        let (good, mut rx) = collecting();
        hub.subscribe("run", good);

        for seq in 1..=3 {
            hub.dispatch(&event("run", seq));
        }
        assert_eq!(recv(&mut rx).await, 1);
        assert_eq!(recv(&mut rx).await, 2);
        assert_eq!(recv(&mut rx).await, 3);

        tokio::time::sleep(Duration::from_millis(50)).await;
        let stats = hub.stats("run", bad).unwrap();
        assert_eq!(stats.failed, 3);
        assert_eq!(stats.last_error.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn panicking_handler_is_contained() {
        let hub = SubscriberHub::new(16);
        let panicking = handler_fn(|_event: Arc<AgentEvent>| async { panic!("handler bug") });
        let token = hub.subscribe("run", panicking);
        hub.dispatch(&event("run", 1));
        hub.dispatch(&event("run", 2));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(hub.stats("run", token).unwrap().failed, 2);
    }

    #[tokio::test]
    async fn saturated_queue_drops_oldest_and_counts() {
        let hub = SubscriberHub::new(2);
        let gate = Arc::new(Notify::new());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handler_gate = gate.clone();
        let slow = handler_fn(move |event: Arc<AgentEvent>| {
            let gate = handler_gate.clone();
            let tx = tx.clone();
            async move {
                if event.seq() == 1 {
                    gate.notified().await;
                }
                let _ = tx.send(event.seq());
                Ok(())
            }
        });
        let token = hub.subscribe("run", slow);
        hub.dispatch(&event("run", 1));
        tokio::time::sleep(Duration::from_millis(50)).await;
        for seq in 2..=5 {
            hub.dispatch(&event("run", seq));
        }
        gate.notify_one();

        assert_eq!(recv(&mut rx).await, 1);
        assert_eq!(recv(&mut rx).await, 4);
        assert_eq!(recv(&mut rx).await, 5);
        assert_eq!(hub.stats("run", token).unwrap().dropped, 2);
    }

    #[tokio::test]
    async fn unsubscribe_is_idempotent_and_stops_delivery() {
        let hub = SubscriberHub::new(16);
        let (handler, mut rx) = collecting();
        let token = hub.subscribe("run", handler);
        hub.dispatch(&event("run", 1));
        assert_eq!(recv(&mut rx).await, 1);

        assert!(hub.unsubscribe("run", token));
        assert!(!hub.unsubscribe("run", token));
        assert!(!hub.has_subscribers("run"));
        assert_eq!(hub.dispatch(&event("run", 2)), 0);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn failures_while_draining_count_in_totals() {
        let hub = SubscriberHub::new(16);
        let gate = Arc::new(Notify::new());
        let handler_gate = gate.clone();
        let failing = handler_fn(move |event: Arc<AgentEvent>| {
            let gate = handler_gate.clone();
            async move {
                if event.seq() == 1 {
                    gate.notified().await;
                }
                Err(HandlerError::new("rejected"))
            }
        });
        hub.subscribe("run", failing);
        hub.dispatch(&event("run", 1));
        hub.dispatch(&event("run", 2));
        tokio::time::sleep(Duration::from_millis(50)).await;
        hub.close_run("run");
        assert_eq!(hub.totals(), (0, 0));

        gate.notify_one();
        for _ in 0..200 {
            if hub.totals() == (0, 2) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(hub.totals(), (0, 2));
    }

    #[tokio::test]
    async fn dropping_the_hub_ends_delivery_tasks() {
        let hub = SubscriberHub::new(16);
        let (handler, mut rx) = collecting();
        hub.subscribe("run", handler);
        hub.dispatch(&event("run", 1));
        drop(hub);

        assert_eq!(recv(&mut rx).await, 1);
        let ended = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await;
        assert_eq!(ended.unwrap(), None);
    }

    #[tokio::test]
    async fn close_run_drains_queue_then_calls_on_close() {
        struct Recorder {
            seen: Mutex<Vec<u64>>,
            closed: mpsc::UnboundedSender<Vec<u64>>,
        }

        #[async_trait::async_trait]
        impl EventHandler for Recorder {
            async fn handle(&self, event: Arc<AgentEvent>) -> Result<(), HandlerError> {
                lock(&self.seen).push(event.seq());
                Ok(())
            }

            async fn on_close(&self, _run_id: &str) {
                let _ = self.closed.send(lock(&self.seen).clone());
            }
        }

        let hub = SubscriberHub::new(16);
        let (tx, mut rx) = mpsc::unbounded_channel();
        hub.subscribe(
            "run",
            Arc::new(Recorder {
                seen: Mutex::new(Vec::new()),
                closed: tx,
            }),
        );
        for seq in 1..=4 {
            hub.dispatch(&event("run", seq));
        }
        hub.close_run("run");
        let seen = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(seen, vec![1, 2, 3, 4]);
        assert_eq!(hub.subscriber_count(), 0);
    }
}
