//! Durable consumer: a bounded hot cache per run in front of an append-only
//! log with one partition file per run.
//!
//! ## Write path
//!
//! `publish` validates seq, dispatches to live subscribers, then buffers the
//! event. Nothing on that path waits for disk. A background loop appends the
//! buffered events of each run as one batch when the flush interval elapses
//! or when `batch_size` events are buffered, whichever comes first.
//!
//! A batch moves from `pending` to `inflight` before it is written and leaves
//! memory only after the append was synced. Failed appends are retried with
//! backoff; once retries are exhausted the failure is reported to the next
//! `publish` of that run (and to `flush`), and the batch stays buffered.
//!
//! ## Locking
//!
//! Every run owns a state mutex and a writer mutex. There is no global lock:
//! a slow or failing partition never holds back another run.

mod config;
mod index;
mod log;
mod retry;

use std::collections::{BTreeMap, VecDeque};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::future::join_all;
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

pub use config::DurableConfig;
pub use index::RunSummary;
pub use retry::RetryPolicy;

use crate::consumer::{
    ConsumerStats, EventConsumer, EventHandler, SubscriptionStats, SubscriptionToken,
};
use crate::errors::ConsumerError;
use crate::event::AgentEvent;
use crate::fanout::SubscriberHub;
use self::index::RunIndex;
use self::log::{PartitionSummary, Retained};

/// What startup recovery found in the storage directory.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Runs indexed and available to `fetch`.
    pub runs: usize,
    /// Partitions cut at a corruption boundary or skipped as unreadable.
    pub damaged_partitions: usize,
}

/// Outcome of one retention sweep.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub removed_events: usize,
    pub deleted_partitions: usize,
    pub rewritten_partitions: usize,
    /// Runs left alone because they have subscribers or unflushed events.
    pub skipped_runs: usize,
}

#[derive(Default)]
struct PartitionState {
    cache: VecDeque<Arc<AgentEvent>>,
    pending: Vec<Arc<AgentEvent>>,
    inflight: Vec<Arc<AgentEvent>>,
    last_seq: u64,
    /// Exhausted-retry failure not yet reported to an emitter.
    failure: Option<String>,
    /// Removed from the partition table; publishers must look it up again.
    retired: bool,
}

impl PartitionState {
    fn has_unflushed(&self) -> bool {
        !self.pending.is_empty() || !self.inflight.is_empty()
    }

    fn lowest_seq(&self) -> Option<u64> {
        [
            self.inflight.first(),
            self.pending.first(),
            self.cache.front(),
        ]
        .into_iter()
        .flatten()
        .map(|e| e.seq())
        .min()
    }
}

struct Partition {
    state: tokio::sync::Mutex<PartitionState>,
    /// Serializes appends, sweeps and purges of this partition.
    writer: tokio::sync::Mutex<()>,
}

impl Partition {
    fn new(last_seq: u64) -> Self {
        Self {
            state: tokio::sync::Mutex::new(PartitionState {
                last_seq,
                ..Default::default()
            }),
            writer: tokio::sync::Mutex::new(()),
        }
    }
}

struct Inner {
    config: DurableConfig,
    hub: SubscriberHub,
    partitions: DashMap<String, Arc<Partition>>,
    index: RunIndex,
    buffered: AtomicUsize,
    flush_requested: Notify,
}

impl Inner {
    fn partition(&self, run_id: &str) -> Arc<Partition> {
        self.partitions
            .entry(run_id.to_string())
            .or_insert_with(|| Arc::new(Partition::new(self.index.last_seq(run_id).unwrap_or(0))))
            .clone()
    }

    fn existing_partition(&self, run_id: &str) -> Option<Arc<Partition>> {
        self.partitions.get(run_id).map(|p| p.value().clone())
    }

    fn path_for(&self, run_id: &str) -> PathBuf {
        log::partition_path(&self.config.storage_path, run_id)
    }

    async fn publish(&self, event: AgentEvent) -> Result<(), ConsumerError> {
        let event = Arc::new(event);
        let run_id = event.run_id();
        let (failure, buffered) = loop {
            let partition = self.partition(run_id);
            let mut state = partition.state.lock().await;
            if state.retired {
                continue;
            }

            let expected = state.last_seq + 1;
            if event.seq() != expected {
                error!(run_id, expected, actual = event.seq(), "seq ordering violation");
                return Err(ConsumerError::OrderingViolation {
                    run_id: run_id.to_string(),
                    expected,
                    actual: event.seq(),
                });
            }
            state.last_seq = event.seq();

            let subscribers = self.hub.dispatch(&event);
            debug!(run_id, seq = event.seq(), subscribers, "event dispatched");

            if state.cache.len() >= self.config.max_memory_events {
                state.cache.pop_front();
            }
            state.cache.push_back(event.clone());
            state.pending.push(event.clone());
            let buffered = self.buffered.fetch_add(1, Ordering::AcqRel) + 1;
            break (state.failure.take(), buffered);
        };

        if buffered >= self.config.batch_size {
            self.flush_requested.notify_one();
        }
        match failure {
            Some(message) => Err(ConsumerError::storage(run_id, message)),
            None => Ok(()),
        }
    }

    /// Appends everything buffered for the run. Returns the batch length.
    async fn flush_partition(
        &self,
        run_id: &str,
        partition: &Partition,
    ) -> Result<usize, ConsumerError> {
        let _writer = partition.writer.lock().await;
        let batch = {
            let mut state = partition.state.lock().await;
            let pending = std::mem::take(&mut state.pending);
            state.inflight.extend(pending);
            state.inflight.clone()
        };
        if batch.is_empty() {
            return Ok(0);
        }

        let bytes = Arc::new(
            log::encode_batch(&batch).map_err(|e| ConsumerError::storage(run_id, e.to_string()))?,
        );
        let path = self.path_for(run_id);
        let mut attempts = 0_u32;
        loop {
            attempts += 1;
            let (path, bytes) = (path.clone(), bytes.clone());
            let written = tokio::task::spawn_blocking(move || log::append_batch(&path, &bytes))
                .await
                .unwrap_or_else(|join| Err(io::Error::other(join.to_string())));
            let Err(err) = written else {
                break;
            };
            if !self.config.retry.allows_attempt(attempts) {
                let message = format!("append failed after {attempts} attempts: {err}");
                error!(run_id, attempts, error = %err, "giving up on batch append");
                partition.state.lock().await.failure = Some(message.clone());
                return Err(ConsumerError::storage(run_id, message));
            }
            let delay = self.config.retry.delay_after(attempts);
            warn!(run_id, attempt = attempts, error = %err, delay_ms = delay.as_millis() as u64, "batch append failed, retrying");
            tokio::time::sleep(delay).await;
        }

        if let Some(summary) = PartitionSummary::of_events(&batch) {
            self.index.record_append(run_id, &summary);
        }
        {
            let mut state = partition.state.lock().await;
            state.inflight.clear();
            state.failure = None;
        }
        self.buffered.fetch_sub(batch.len(), Ordering::AcqRel);
        debug!(run_id, events = batch.len(), attempts, "batch flushed");
        Ok(batch.len())
    }

    /// Flushes every run concurrently; reports the first failure.
    async fn flush_all(&self) -> Result<usize, ConsumerError> {
        let partitions: Vec<(String, Arc<Partition>)> = self
            .partitions
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        let results = join_all(
            partitions
                .iter()
                .map(|(run_id, partition)| self.flush_partition(run_id, partition)),
        )
        .await;
        let mut flushed = 0;
        let mut first_error = None;
        for result in results {
            match result {
                Ok(n) => flushed += n,
                Err(err) => {
                    first_error.get_or_insert(err);
                }
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(flushed),
        }
    }

    async fn sweep_at(&self, now: DateTime<Utc>) -> Result<SweepReport, ConsumerError> {
        let retention = chrono::Duration::from_std(self.config.retention())
            .map_err(|e| ConsumerError::Config(format!("retention out of range: {e}")))?;
        let mut report = SweepReport::default();
        // a retention reaching past the earliest representable time keeps everything
        let Some(cutoff) = now.checked_sub_signed(retention) else {
            debug!(retention_secs = self.config.retention_secs, "retention exceeds time range, nothing expires");
            return Ok(report);
        };
        let mut first_error = None;

        for run_id in self.index.runs_with_data_before(cutoff) {
            if self.hub.has_subscribers(&run_id) {
                debug!(run_id, "sweep skipped run with live subscribers");
                report.skipped_runs += 1;
                continue;
            }
            let partition = self.existing_partition(&run_id);
            let _writer = match &partition {
                Some(p) => Some(p.writer.lock().await),
                None => None,
            };
            if let Some(p) = &partition
                && p.state.lock().await.has_unflushed()
            {
                debug!(run_id, "sweep skipped run with unflushed events");
                report.skipped_runs += 1;
                continue;
            }

            let path = self.path_for(&run_id);
            let outcome = tokio::task::spawn_blocking(move || log::retain_since(&path, cutoff))
                .await
                .unwrap_or_else(|join| Err(io::Error::other(join.to_string())));
            match outcome {
                Ok(Retained::Untouched) => {}
                Ok(Retained::Rewritten { removed, summary }) => {
                    self.index.insert(&run_id, summary);
                    report.removed_events += removed;
                    report.rewritten_partitions += 1;
                }
                Ok(Retained::Deleted { removed }) => {
                    self.index.remove(&run_id);
                    report.removed_events += removed;
                    report.deleted_partitions += 1;
                }
                Err(err) if err.kind() == io::ErrorKind::NotFound => {
                    self.index.remove(&run_id);
                }
                Err(err) => {
                    warn!(run_id, error = %err, "retention sweep failed for partition");
                    first_error.get_or_insert(ConsumerError::storage(&run_id, err.to_string()));
                    continue;
                }
            }
            if let Some(p) = &partition {
                p.state
                    .lock()
                    .await
                    .cache
                    .retain(|e| e.timestamp() >= cutoff);
            }
        }

        if report.removed_events > 0 {
            info!(
                removed = report.removed_events,
                deleted = report.deleted_partitions,
                rewritten = report.rewritten_partitions,
                "retention sweep removed expired events"
            );
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(report),
        }
    }

    async fn fetch(
        &self,
        run_id: &str,
        from_seq: Option<u64>,
    ) -> Result<Vec<AgentEvent>, ConsumerError> {
        let from = from_seq.unwrap_or(0).max(1);
        let partition = self.existing_partition(run_id);
        if partition.is_none() && !self.index.contains(run_id) {
            return Err(ConsumerError::unknown_run(run_id));
        }

        let mut merged: BTreeMap<u64, Arc<AgentEvent>> = BTreeMap::new();
        let mut lowest_in_memory = None;
        if let Some(p) = &partition {
            let state = p.state.lock().await;
            for event in state
                .inflight
                .iter()
                .chain(&state.pending)
                .chain(&state.cache)
            {
                if event.seq() >= from {
                    merged.insert(event.seq(), event.clone());
                }
            }
            lowest_in_memory = state.lowest_seq();
        }

        let memory_covers = lowest_in_memory.is_some_and(|low| low <= from);
        if !memory_covers && self.index.contains(run_id) {
            let path = self.path_for(run_id);
            let stored = tokio::task::spawn_blocking(move || log::read_partition(&path, from))
                .await
                .unwrap_or_else(|join| Err(io::Error::other(join.to_string())))
                .map_err(|e| ConsumerError::storage(run_id, e.to_string()))?;
            for event in stored {
                merged.entry(event.seq()).or_insert_with(|| Arc::new(event));
            }
        }
        Ok(merged
            .into_values()
            .map(Arc::unwrap_or_clone)
            .collect())
    }

    async fn close_run(&self, run_id: &str) -> Result<(), ConsumerError> {
        self.hub.close_run(run_id);
        let Some(partition) = self.existing_partition(run_id) else {
            return Ok(());
        };
        self.flush_partition(run_id, &partition).await?;

        let _writer = partition.writer.lock().await;
        let mut state = partition.state.lock().await;
        if state.has_unflushed() {
            return Ok(());
        }
        state.retired = true;
        self.partitions.remove(run_id);
        debug!(run_id, "hot partition released");
        Ok(())
    }

    async fn purge(&self, run_id: &str) -> Result<(), ConsumerError> {
        self.hub.remove_run(run_id);
        if let Some(partition) = self.existing_partition(run_id) {
            let _writer = partition.writer.lock().await;
            let mut state = partition.state.lock().await;
            let unflushed = state.pending.len() + state.inflight.len();
            state.retired = true;
            state.pending.clear();
            state.inflight.clear();
            state.cache.clear();
            self.partitions.remove(run_id);
            self.buffered.fetch_sub(unflushed, Ordering::AcqRel);
        }
        self.index.remove(run_id);
        let path = self.path_for(run_id);
        tokio::task::spawn_blocking(move || match std::fs::remove_file(&path) {
            Err(err) if err.kind() != io::ErrorKind::NotFound => Err(err),
            _ => Ok(()),
        })
        .await
        .unwrap_or_else(|join| Err(io::Error::other(join.to_string())))
        .map_err(|e| ConsumerError::storage(run_id, e.to_string()))?;
        info!(run_id, "run purged");
        Ok(())
    }

    async fn stats(&self) -> ConsumerStats {
        let partitions: Vec<Arc<Partition>> =
            self.partitions.iter().map(|e| e.value().clone()).collect();
        let mut memory_events = 0;
        for partition in partitions {
            memory_events += partition.state.lock().await.cache.len();
        }
        let (dropped_events, handler_failures) = self.hub.totals();
        ConsumerStats {
            memory_events,
            buffered_events: self.buffered.load(Ordering::Acquire),
            partitions: self.index.len(),
            subscribers: self.hub.subscriber_count(),
            dropped_events,
            handler_failures,
        }
    }
}

async fn flush_loop(inner: Arc<Inner>, mut shutdown: watch::Receiver<bool>) {
    let period = inner.config.flush_interval();
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            () = inner.flush_requested.notified() => {
                ticker.reset();
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
                continue;
            }
        }
        if let Err(err) = inner.flush_all().await {
            warn!(error = %err, "background flush failed");
        }
    }
    debug!("flush loop stopped");
}

async fn sweep_loop(inner: Arc<Inner>, mut shutdown: watch::Receiver<bool>) {
    let period = inner.config.sweep_interval();
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
                continue;
            }
        }
        if let Err(err) = inner.sweep_at(Utc::now()).await {
            warn!(error = %err, "retention sweep failed");
        }
    }
    debug!("sweep loop stopped");
}

struct Recovered {
    runs: Vec<(String, PartitionSummary)>,
    damaged: usize,
}

/// Rebuilds the run index from partition headers, cutting damaged partitions
/// at their corruption boundary.
fn recover(dir: &Path) -> io::Result<Recovered> {
    std::fs::create_dir_all(dir)?;
    let mut recovered = Recovered {
        runs: Vec::new(),
        damaged: 0,
    };
    for (run_id, path) in log::list_partitions(dir)? {
        let scan = match log::scan_partition(&path) {
            Ok(scan) => scan,
            Err(err) => {
                warn!(run_id, error = %err, "unreadable partition skipped");
                recovered.damaged += 1;
                continue;
            }
        };
        if let Some(found) = &scan.run_id
            && *found != run_id
        {
            warn!(run_id, found = %found, "partition holds another run's events, skipped");
            recovered.damaged += 1;
            continue;
        }
        if scan.is_damaged() {
            recovered.damaged += 1;
            warn!(
                run_id,
                valid_len = scan.valid_len,
                file_len = scan.file_len,
                "partition damaged, keeping readable prefix"
            );
            match log::truncate_at(&path, scan.valid_len) {
                Ok(sidecar) => info!(run_id, sidecar = %sidecar.display(), "damaged tail moved aside"),
                Err(err) => warn!(run_id, error = %err, "could not truncate damaged partition"),
            }
        }
        if let Some(summary) = scan.summary {
            recovered.runs.push((run_id, summary));
        }
    }
    Ok(recovered)
}

/// Memory cache + append-only log consumer.
///
/// Background flush and sweep tasks start in [`DurableConsumer::open`] and
/// stop on [`DurableConsumer::shutdown`] or drop.
pub struct DurableConsumer {
    inner: Arc<Inner>,
    recovery: RecoveryReport,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl DurableConsumer {
    /// Validates the config, recovers the storage directory and starts the
    /// background tasks. Requires a tokio runtime.
    pub async fn open(config: DurableConfig) -> Result<Self, ConsumerError> {
        config.validate()?;
        let dir = config.storage_path.clone();
        let recovered = tokio::task::spawn_blocking(move || recover(&dir))
            .await
            .unwrap_or_else(|join| Err(io::Error::other(join.to_string())))
            .map_err(|e| {
                ConsumerError::storage(
                    "*",
                    format!("recovery of {} failed: {e}", config.storage_path.display()),
                )
            })?;

        let index = RunIndex::default();
        for (run_id, summary) in recovered.runs {
            index.insert(&run_id, summary);
        }
        let recovery = RecoveryReport {
            runs: index.len(),
            damaged_partitions: recovered.damaged,
        };
        info!(
            path = %config.storage_path.display(),
            runs = recovery.runs,
            damaged = recovery.damaged_partitions,
            "durable tier recovered"
        );

        let inner = Arc::new(Inner {
            hub: SubscriberHub::new(config.subscriber_queue_capacity),
            partitions: DashMap::new(),
            index,
            buffered: AtomicUsize::new(0),
            flush_requested: Notify::new(),
            config,
        });
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let tasks = vec![
            tokio::spawn(flush_loop(inner.clone(), shutdown_rx.clone())),
            tokio::spawn(sweep_loop(inner.clone(), shutdown_rx)),
        ];
        Ok(Self {
            inner,
            recovery,
            shutdown_tx,
            tasks: Mutex::new(tasks),
        })
    }

    pub fn config(&self) -> &DurableConfig {
        &self.inner.config
    }

    pub fn recovery_report(&self) -> &RecoveryReport {
        &self.recovery
    }

    /// Runs available from the durable tier.
    pub fn runs(&self) -> Vec<RunSummary> {
        self.inner
            .index
            .run_ids()
            .iter()
            .filter_map(|run_id| self.inner.index.summary(run_id))
            .collect()
    }

    pub fn run_summary(&self, run_id: &str) -> Option<RunSummary> {
        self.inner.index.summary(run_id)
    }

    /// Appends everything buffered now, bypassing the interval.
    pub async fn flush(&self) -> Result<usize, ConsumerError> {
        self.inner.flush_all().await
    }

    /// Applies the retention policy now.
    pub async fn sweep(&self) -> Result<SweepReport, ConsumerError> {
        self.inner.sweep_at(Utc::now()).await
    }

    /// Deletes every trace of a run, on disk included.
    pub async fn purge(&self, run_id: &str) -> Result<(), ConsumerError> {
        self.inner.purge(run_id).await
    }

    pub async fn stats(&self) -> ConsumerStats {
        self.inner.stats().await
    }

    /// Stops background work, detaches every subscriber once its queue has
    /// drained, and flushes what is still buffered.
    pub async fn shutdown(&self) -> Result<(), ConsumerError> {
        let _ = self.shutdown_tx.send(true);
        self.inner.hub.close_all();
        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner));
        for task in tasks {
            let _ = task.await;
        }
        self.inner.flush_all().await.map(|_| ())
    }
}

impl Drop for DurableConsumer {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
        self.inner.hub.close_all();
    }
}

#[async_trait::async_trait]
impl EventConsumer for DurableConsumer {
    async fn publish(&self, event: AgentEvent) -> Result<(), ConsumerError> {
        self.inner.publish(event).await
    }

    async fn subscribe(
        &self,
        run_id: &str,
        handler: Arc<dyn EventHandler>,
    ) -> Result<SubscriptionToken, ConsumerError> {
        Ok(self.inner.hub.subscribe(run_id, handler))
    }

    async fn unsubscribe(&self, run_id: &str, token: SubscriptionToken) {
        self.inner.hub.unsubscribe(run_id, token);
    }

    async fn fetch(
        &self,
        run_id: &str,
        from_seq: Option<u64>,
    ) -> Result<Vec<AgentEvent>, ConsumerError> {
        self.inner.fetch(run_id, from_seq).await
    }

    async fn close_run(&self, run_id: &str) -> Result<(), ConsumerError> {
        self.inner.close_run(run_id).await
    }

    fn subscription_stats(
        &self,
        run_id: &str,
        token: SubscriptionToken,
    ) -> Result<SubscriptionStats, ConsumerError> {
        self.inner.hub.stats(run_id, token)
    }
}
