//! Run identity and seq assignment for emission.
//!
//! A [`RunContext`] is an explicit value. It can also be bound to the current
//! task with [`RunContext::scope`], which lets deeply nested agent code call
//! the free [`emit`] without threading the handle through every signature.
//! The binding is task-local: spawned tasks must enter `scope` themselves.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures::{Stream, StreamExt as _};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::debug;

use crate::consumer::EventConsumer;
use crate::errors::ConsumerError;
use crate::event::AgentEvent;
use crate::record::ExecutionRecord;

tokio::task_local! {
    static CURRENT_RUN: Arc<RunContext>;
}

/// Identity and seq range of a run at a point in time.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionSnapshot {
    pub run_id: String,
    pub agent_name: String,
    pub first_seq: Option<u64>,
    pub last_seq: Option<u64>,
}

#[derive(Default)]
struct SeqState {
    last_seq: u64,
    first_seq: Option<u64>,
}

/// Emission handle for one run.
pub struct RunContext {
    run_id: String,
    agent_name: String,
    consumer: Arc<dyn EventConsumer>,
    seq: Mutex<SeqState>,
    closed: AtomicBool,
}

impl RunContext {
    pub fn new(
        run_id: impl Into<String>,
        agent_name: impl Into<String>,
        consumer: Arc<dyn EventConsumer>,
    ) -> Arc<Self> {
        Arc::new(Self {
            run_id: run_id.into(),
            agent_name: agent_name.into(),
            consumer,
            seq: Mutex::new(SeqState::default()),
            closed: AtomicBool::new(false),
        })
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn agent_name(&self) -> &str {
        &self.agent_name
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Builds the next envelope and hands it to the consumer exactly once.
    ///
    /// Seq assignment and publication happen under one per-run lock, so
    /// concurrent emitters are serialized and consumers observe seq in order.
    /// A storage error is returned after the event was already delivered live;
    /// the seq stays consumed.
    pub async fn emit(&self, record: ExecutionRecord) -> Result<AgentEvent, ConsumerError> {
        let mut state = self.seq.lock().await;
        if self.is_closed() {
            return Err(ConsumerError::context(format!(
                "run {} is closed",
                self.run_id
            )));
        }
        let seq = state.last_seq + 1;
        let event = AgentEvent::new(self.run_id.clone(), seq, self.agent_name.clone(), record);
        let published = self.consumer.publish(event.clone()).await;
        if let Err(err) = &published
            && !err.is_storage()
        {
            return Err(err.clone());
        }
        state.last_seq = seq;
        state.first_seq.get_or_insert(seq);
        debug!(run_id = %self.run_id, seq, "event emitted");
        published.map(|()| event)
    }

    /// Emits every record of a finite delta sequence, stopping at the first
    /// upstream or emission error. Returns the number of emitted events.
    pub async fn emit_stream<S, E>(&self, records: S) -> Result<u64, EmitStreamError<E>>
    where
        S: Stream<Item = Result<ExecutionRecord, E>>,
    {
        let mut records = std::pin::pin!(records);
        let mut emitted = 0_u64;
        while let Some(next) = records.next().await {
            let record = next.map_err(EmitStreamError::Upstream)?;
            self.emit(record).await.map_err(EmitStreamError::Emit)?;
            emitted += 1;
        }
        Ok(emitted)
    }

    pub async fn snapshot(&self) -> ExecutionSnapshot {
        let state = self.seq.lock().await;
        ExecutionSnapshot {
            run_id: self.run_id.clone(),
            agent_name: self.agent_name.clone(),
            first_seq: state.first_seq,
            last_seq: (state.last_seq > 0).then_some(state.last_seq),
        }
    }

    /// Ends the run. Later emissions fail with a context error; the consumer
    /// detaches subscribers and settles buffered data.
    pub async fn close(&self) -> Result<(), ConsumerError> {
        let _state = self.seq.lock().await;
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        debug!(run_id = %self.run_id, "run closed");
        self.consumer.close_run(&self.run_id).await
    }

    /// Runs `fut` with this context bound for the free [`emit`] function.
    pub async fn scope<F: Future>(self: Arc<Self>, fut: F) -> F::Output {
        CURRENT_RUN.scope(self, fut).await
    }
}

/// Failure while draining a delta sequence into a run.
#[derive(Debug, thiserror::Error)]
pub enum EmitStreamError<E> {
    #[error("upstream stream failed: {0}")]
    Upstream(E),
    #[error(transparent)]
    Emit(ConsumerError),
}

/// The context bound to the current task, if any.
pub fn current() -> Option<Arc<RunContext>> {
    CURRENT_RUN.try_with(Arc::clone).ok()
}

pub fn current_run_id() -> Option<String> {
    CURRENT_RUN.try_with(|ctx| ctx.run_id.clone()).ok()
}

pub fn current_agent_name() -> Option<String> {
    CURRENT_RUN.try_with(|ctx| ctx.agent_name.clone()).ok()
}

/// Emits through the context bound to the current task.
pub async fn emit(record: ExecutionRecord) -> Result<AgentEvent, ConsumerError> {
    let ctx = current().ok_or_else(|| ConsumerError::context("no run bound to the current task"))?;
    ctx.emit(record).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consumer::handler_fn;
    use crate::memory::MemoryConsumer;
    use crate::record::Role;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use uuid::Uuid;

    fn chunk(index: u64) -> ExecutionRecord {
        ExecutionRecord::new(Uuid::new_v4(), index, Role::Assistant).with_content("x")
    }

    #[tokio::test]
    async fn emit_without_bound_run_is_context_error() {
        let err = emit(chunk(0)).await.unwrap_err();
        assert!(matches!(err, ConsumerError::Context(_)));
        assert!(current_run_id().is_none());
    }

    #[tokio::test]
    async fn scoped_emit_assigns_seq_from_one() {
        let consumer = Arc::new(MemoryConsumer::default());
        let ctx = RunContext::new("run-1", "writer", consumer.clone());
        let seqs = ctx
            .clone()
            .scope(async {
                assert_eq!(current_agent_name().as_deref(), Some("writer"));
                let a = emit(chunk(0)).await.unwrap().seq();
                let b = emit(chunk(1)).await.unwrap().seq();
                vec![a, b]
            })
            .await;
        assert_eq!(seqs, vec![1, 2]);
        let snapshot = ctx.snapshot().await;
        assert_eq!(snapshot.first_seq, Some(1));
        assert_eq!(snapshot.last_seq, Some(2));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_emitters_produce_gapless_ordered_seq() {
        let consumer = Arc::new(MemoryConsumer::default());
        let (tx, mut rx) = mpsc::unbounded_channel();
        consumer
            .subscribe(
                "run-c",
                handler_fn(move |e: Arc<AgentEvent>| {
                    let tx = tx.clone();
                    async move {
                        let _ = tx.send(e.seq());
                        Ok(())
                    }
                }),
            )
            .await
            .unwrap();
        let ctx = RunContext::new("run-c", "parallel", consumer.clone());

        let mut tasks = Vec::new();
        for worker in 0..8_u64 {
            let ctx = ctx.clone();
            tasks.push(tokio::spawn(async move {
                for i in 0..25 {
                    ctx.emit(chunk(worker * 100 + i)).await.unwrap();
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        let mut observed = Vec::new();
        while observed.len() < 200 {
            let seq = tokio::time::timeout(Duration::from_secs(2), rx.recv())
                .await
                .unwrap()
                .unwrap();
            observed.push(seq);
        }
        let expected: Vec<u64> = (1..=200).collect();
        assert_eq!(observed, expected);
    }

    #[tokio::test]
    async fn closed_run_rejects_emission() {
        let consumer = Arc::new(MemoryConsumer::default());
        let ctx = RunContext::new("run-x", "a", consumer);
        ctx.emit(chunk(0)).await.unwrap();
        ctx.close().await.unwrap();
        ctx.close().await.unwrap();
        assert!(matches!(
            ctx.emit(chunk(1)).await,
            Err(ConsumerError::Context(_))
        ));
    }

    #[tokio::test]
    async fn emit_stream_stops_at_upstream_error() {
        let consumer = Arc::new(MemoryConsumer::default());
        let ctx = RunContext::new("run-s", "a", consumer.clone());
        let records = futures::stream::iter(vec![
            Ok(chunk(0)),
            Ok(chunk(1)),
            Err("connection reset"),
            Ok(chunk(2)),
        ]);
        let err = ctx.emit_stream(records).await.unwrap_err();
        assert!(matches!(err, EmitStreamError::Upstream("connection reset")));
        assert_eq!(consumer.fetch("run-s", None).await.unwrap().len(), 2);
    }
}
