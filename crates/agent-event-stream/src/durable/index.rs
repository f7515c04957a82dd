use chrono::{DateTime, Utc};
use dashmap::DashMap;

use super::log::PartitionSummary;

/// Seq range and age of a run available from the durable tier.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RunSummary {
    pub run_id: String,
    pub first_seq: u64,
    pub last_seq: u64,
    pub events: usize,
    pub oldest: DateTime<Utc>,
    pub newest: DateTime<Utc>,
}

/// Runs present on disk, keyed by run id.
#[derive(Default)]
pub(crate) struct RunIndex {
    runs: DashMap<String, PartitionSummary>,
}

impl RunIndex {
    pub fn insert(&self, run_id: &str, summary: PartitionSummary) {
        self.runs.insert(run_id.to_string(), summary);
    }

    /// Records a batch that was just appended to the run's partition.
    pub fn record_append(&self, run_id: &str, batch: &PartitionSummary) {
        self.runs
            .entry(run_id.to_string())
            .and_modify(|existing| existing.extend(batch))
            .or_insert_with(|| batch.clone());
    }

    pub fn remove(&self, run_id: &str) {
        self.runs.remove(run_id);
    }

    pub fn contains(&self, run_id: &str) -> bool {
        self.runs.contains_key(run_id)
    }

    pub fn last_seq(&self, run_id: &str) -> Option<u64> {
        self.runs.get(run_id).map(|s| s.last_seq)
    }

    pub fn summary(&self, run_id: &str) -> Option<RunSummary> {
        self.runs.get(run_id).map(|s| RunSummary {
            run_id: run_id.to_string(),
            first_seq: s.first_seq,
            last_seq: s.last_seq,
            events: s.count,
            oldest: s.oldest,
            newest: s.newest,
        })
    }

    /// Runs holding at least one event older than `cutoff`.
    pub fn runs_with_data_before(&self, cutoff: DateTime<Utc>) -> Vec<String> {
        self.runs
            .iter()
            .filter(|entry| entry.value().oldest < cutoff)
            .map(|entry| entry.key().clone())
            .collect()
    }

    pub fn run_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.runs.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.runs.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn summary(first: u64, last: u64, oldest: DateTime<Utc>) -> PartitionSummary {
        PartitionSummary {
            first_seq: first,
            last_seq: last,
            count: (last - first + 1) as usize,
            oldest,
            newest: oldest,
        }
    }

    #[test]
    fn appends_extend_the_seq_range() {
        let index = RunIndex::default();
        let now = Utc::now();
        index.record_append("r", &summary(1, 2, now - Duration::hours(1)));
        index.record_append("r", &summary(3, 5, now));
        let s = index.summary("r").unwrap();
        assert_eq!((s.first_seq, s.last_seq, s.events), (1, 5, 5));
        assert_eq!(s.oldest, now - Duration::hours(1));
        assert_eq!(s.newest, now);
    }

    #[test]
    fn expired_lookup_uses_oldest_event() {
        let index = RunIndex::default();
        let now = Utc::now();
        index.insert("old", summary(1, 1, now - Duration::days(40)));
        index.insert("new", summary(1, 1, now));
        assert_eq!(index.runs_with_data_before(now - Duration::days(30)), vec!["old".to_string()]);
        assert_eq!(index.run_ids(), vec!["new".to_string(), "old".to_string()]);
    }
}
