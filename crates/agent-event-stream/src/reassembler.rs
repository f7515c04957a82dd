//! Folds the chunk records of a stream into one finalized message.
//!
//! Content is keyed by chunk index, so arrival order does not matter; the
//! terminal record triggers finalization. Streams that never terminate are
//! force-finalized by the idle timeout, the open-stream cap, or
//! [`StreamReassembler::finish_all`], and are marked incomplete. So are
//! streams that were open when events of the run went missing.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::consumer::EventHandler;
use crate::errors::HandlerError;
use crate::event::AgentEvent;
use crate::record::{Content, ExecutionRecord, Role, ToolCall};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReassemblerConfig {
    /// Streams without a record for this long are force-finalized.
    ///
    /// Checked when a record arrives. A [`ReassemblingSubscriber`] of a run
    /// that has gone quiet only evicts on
    /// [`ReassemblingSubscriber::evict_idle`] or when the run closes.
    #[serde(default)]
    pub idle_timeout_ms: Option<u64>,
    /// Opening a stream beyond this cap force-finalizes the least recently
    /// active one.
    #[serde(default)]
    pub max_open_streams: Option<usize>,
    /// How many finalized stream ids are remembered to drop late records.
    #[serde(default = "default_finalized_memory")]
    pub finalized_memory: usize,
}

const fn default_finalized_memory() -> usize {
    1_024
}

impl Default for ReassemblerConfig {
    fn default() -> Self {
        Self {
            idle_timeout_ms: None,
            max_open_streams: None,
            finalized_memory: default_finalized_memory(),
        }
    }
}

impl ReassemblerConfig {
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn with_max_open_streams(mut self, max: usize) -> Self {
        self.max_open_streams = Some(max.max(1));
        self
    }

    pub fn with_finalized_memory(mut self, entries: usize) -> Self {
        self.finalized_memory = entries;
        self
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout_ms.map(Duration::from_millis)
    }
}

/// A reassembled stream.
#[derive(Clone, Debug, PartialEq)]
pub struct FinalizedMessage {
    pub stream_id: Uuid,
    pub role: Role,
    /// Text deltas joined in ascending index order.
    pub content: String,
    /// Structured content parts in ascending index order.
    pub structured: Vec<Value>,
    /// Ordered by chunk index, then arrival.
    pub tool_calls: Vec<ToolCall>,
    /// Latest reasoning text seen.
    pub reasoning: Option<String>,
    /// False when the stream was force-finalized without its terminal record,
    /// or when records may be missing because events of the run were lost.
    pub complete: bool,
}

struct OpenStream {
    role: Role,
    parts: BTreeMap<u64, Content>,
    tool_calls: Vec<(u64, u64, ToolCall)>,
    reasoning: Option<String>,
    arrivals: u64,
    last_seen: Instant,
    /// Records of this stream may have been lost.
    lossy: bool,
}

impl OpenStream {
    fn new(role: Role, now: Instant) -> Self {
        Self {
            role,
            parts: BTreeMap::new(),
            tool_calls: Vec::new(),
            reasoning: None,
            arrivals: 0,
            last_seen: now,
            lossy: false,
        }
    }

    fn absorb(&mut self, record: ExecutionRecord, now: Instant) {
        self.last_seen = now;
        self.arrivals += 1;
        if let Some(content) = record.content {
            self.parts.insert(record.index, content);
        }
        if let Some(call) = record.tool_call {
            self.tool_calls.push((record.index, self.arrivals, call));
        }
        if record.reasoning.is_some() {
            self.reasoning = record.reasoning;
        }
    }

    fn finalize(mut self, stream_id: Uuid, terminated: bool) -> FinalizedMessage {
        let mut content = String::new();
        let mut structured = Vec::new();
        for part in self.parts.into_values() {
            match part {
                Content::Text(text) => content.push_str(&text),
                Content::Json(value) => structured.push(value),
            }
        }
        self.tool_calls.sort_by_key(|(index, arrival, _)| (*index, *arrival));
        FinalizedMessage {
            stream_id,
            role: self.role,
            content,
            structured,
            tool_calls: self.tool_calls.into_iter().map(|(_, _, call)| call).collect(),
            reasoning: self.reasoning,
            complete: terminated && !self.lossy,
        }
    }
}

/// Per-stream accumulator for the records of one run.
pub struct StreamReassembler {
    config: ReassemblerConfig,
    open: HashMap<Uuid, OpenStream>,
    finalized_order: VecDeque<Uuid>,
    finalized: HashSet<Uuid>,
    evicted: Vec<FinalizedMessage>,
    late_records: u64,
    /// The stream of the next record may have lost earlier records.
    gap_pending: bool,
    gaps: u64,
}

impl Default for StreamReassembler {
    fn default() -> Self {
        Self::new(ReassemblerConfig::default())
    }
}

impl StreamReassembler {
    pub fn new(config: ReassemblerConfig) -> Self {
        Self {
            config,
            open: HashMap::new(),
            finalized_order: VecDeque::new(),
            finalized: HashSet::new(),
            evicted: Vec::new(),
            late_records: 0,
            gap_pending: false,
            gaps: 0,
        }
    }

    /// Folds one record in. Returns the finalized message when the record
    /// carries the terminal flag.
    ///
    /// Opening a stream past the open-stream cap evicts another one; collect
    /// those with [`drain_evicted`](Self::drain_evicted).
    pub fn push(&mut self, record: ExecutionRecord) -> Option<FinalizedMessage> {
        self.push_at(record, Instant::now())
    }

    fn push_at(&mut self, record: ExecutionRecord, now: Instant) -> Option<FinalizedMessage> {
        let stream_id = record.stream_id;
        if self.finalized.contains(&stream_id) {
            self.late_records += 1;
            warn!(%stream_id, index = record.index, "record for finalized stream dropped");
            return None;
        }
        if !self.open.contains_key(&stream_id) {
            self.enforce_cap();
        }
        let terminal = record.is_terminal;
        let stream = self
            .open
            .entry(stream_id)
            .or_insert_with(|| OpenStream::new(record.role, now));
        if std::mem::take(&mut self.gap_pending) {
            stream.lossy = true;
        }
        stream.absorb(record, now);
        if !terminal {
            return None;
        }
        let stream = self.open.remove(&stream_id)?;
        self.remember(stream_id);
        debug!(%stream_id, chunks = stream.arrivals, lossy = stream.lossy, "stream finalized");
        Some(stream.finalize(stream_id, true))
    }

    /// Notes that records went missing before the next one. Every open
    /// stream, and the stream of the next record, finalizes incomplete.
    pub fn mark_gap(&mut self) {
        self.gaps += 1;
        self.gap_pending = true;
        for stream in self.open.values_mut() {
            stream.lossy = true;
        }
    }

    /// Times [`mark_gap`](Self::mark_gap) was called.
    pub fn gaps(&self) -> u64 {
        self.gaps
    }

    /// Force-finalizes streams idle for longer than the configured timeout.
    pub fn evict_idle(&mut self, now: Instant) -> Vec<FinalizedMessage> {
        let Some(timeout) = self.config.idle_timeout() else {
            return Vec::new();
        };
        let mut idle: Vec<(Instant, Uuid)> = self
            .open
            .iter()
            .filter(|(_, s)| now.saturating_duration_since(s.last_seen) >= timeout)
            .map(|(id, s)| (s.last_seen, *id))
            .collect();
        idle.sort();
        idle.into_iter()
            .filter_map(|(_, id)| self.force_finalize(id))
            .collect()
    }

    /// Messages force-finalized by the open-stream cap since the last call.
    pub fn drain_evicted(&mut self) -> Vec<FinalizedMessage> {
        std::mem::take(&mut self.evicted)
    }

    /// Force-finalizes every open stream, least recently active first.
    pub fn finish_all(&mut self) -> Vec<FinalizedMessage> {
        let mut ids: Vec<(Instant, Uuid)> =
            self.open.iter().map(|(id, s)| (s.last_seen, *id)).collect();
        ids.sort();
        let mut finished = self.drain_evicted();
        finished.extend(ids.into_iter().filter_map(|(_, id)| self.force_finalize(id)));
        finished
    }

    pub fn open_streams(&self) -> usize {
        self.open.len()
    }

    /// Records that arrived after their stream was finalized.
    pub fn late_records(&self) -> u64 {
        self.late_records
    }

    fn enforce_cap(&mut self) {
        let Some(max) = self.config.max_open_streams else {
            return;
        };
        while self.open.len() >= max {
            let Some(oldest) = self
                .open
                .iter()
                .min_by_key(|(_, s)| s.last_seen)
                .map(|(id, _)| *id)
            else {
                return;
            };
            if let Some(message) = self.force_finalize(oldest) {
                self.evicted.push(message);
            }
        }
    }

    fn force_finalize(&mut self, stream_id: Uuid) -> Option<FinalizedMessage> {
        let stream = self.open.remove(&stream_id)?;
        self.remember(stream_id);
        warn!(%stream_id, chunks = stream.arrivals, "stream force-finalized without terminal record");
        Some(stream.finalize(stream_id, false))
    }

    fn remember(&mut self, stream_id: Uuid) {
        if self.config.finalized_memory == 0 {
            return;
        }
        if self.finalized.insert(stream_id) {
            self.finalized_order.push_back(stream_id);
        }
        while self.finalized_order.len() > self.config.finalized_memory {
            if let Some(forgotten) = self.finalized_order.pop_front() {
                self.finalized.remove(&forgotten);
            }
        }
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Subscriber that reassembles a run's streams and forwards finalized
/// messages over a bounded channel.
///
/// A full channel holds the handler back, which lets the subscription queue
/// absorb or drop events instead of stalling the producer.
///
/// A jump in `seq` (the subscription queue dropped events) marks the open
/// streams as lossy, so they finalize with `complete = false`.
pub struct ReassemblingSubscriber {
    reassembler: Mutex<StreamReassembler>,
    tx: mpsc::Sender<FinalizedMessage>,
    finish_on_close: bool,
    /// Highest seq handled; 0 before the first event.
    last_seq: AtomicU64,
}

impl ReassemblingSubscriber {
    pub fn channel(
        config: ReassemblerConfig,
        capacity: usize,
    ) -> (Self, mpsc::Receiver<FinalizedMessage>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let subscriber = Self {
            reassembler: Mutex::new(StreamReassembler::new(config)),
            tx,
            finish_on_close: true,
            last_seq: AtomicU64::new(0),
        };
        (subscriber, rx)
    }

    /// Whether open streams are force-finalized when the run closes (default true).
    pub fn finish_on_close(mut self, finish: bool) -> Self {
        self.finish_on_close = finish;
        self
    }

    pub fn late_records(&self) -> u64 {
        lock(&self.reassembler).late_records()
    }

    pub fn open_streams(&self) -> usize {
        lock(&self.reassembler).open_streams()
    }

    /// Seq jumps seen, each one a run of events this subscriber never got.
    pub fn gaps(&self) -> u64 {
        lock(&self.reassembler).gaps()
    }

    /// Force-finalizes idle streams now and forwards them. Call it on a
    /// timer when a run can go quiet with streams open.
    pub async fn evict_idle(&self) -> Result<usize, HandlerError> {
        let idle = lock(&self.reassembler).evict_idle(Instant::now());
        let count = idle.len();
        self.forward(idle).await?;
        Ok(count)
    }

    async fn forward(&self, messages: Vec<FinalizedMessage>) -> Result<(), HandlerError> {
        for message in messages {
            self.tx
                .send(message)
                .await
                .map_err(|_| HandlerError::new("finalized message receiver dropped"))?;
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl EventHandler for ReassemblingSubscriber {
    async fn handle(&self, event: Arc<AgentEvent>) -> Result<(), HandlerError> {
        let seq = event.seq();
        let previous = self.last_seq.swap(seq, Ordering::AcqRel);
        let ready = {
            let mut reassembler = lock(&self.reassembler);
            if previous != 0 && seq > previous + 1 {
                warn!(run_id = event.run_id(), previous, seq, "events missing before reassembly");
                reassembler.mark_gap();
            }
            let now = Instant::now();
            let finalized = reassembler.push_at(event.record().clone(), now);
            let mut ready = reassembler.drain_evicted();
            ready.extend(finalized);
            ready.extend(reassembler.evict_idle(now));
            ready
        };
        self.forward(ready).await
    }

    async fn on_close(&self, run_id: &str) {
        if !self.finish_on_close {
            return;
        }
        let open = lock(&self.reassembler).finish_all();
        if open.is_empty() {
            return;
        }
        debug!(run_id, streams = open.len(), "open streams finished on run close");
        if let Err(err) = self.forward(open).await {
            warn!(run_id, error = %err, "could not forward finished streams");
        }
    }
}
