//! Partition files: one newline-delimited JSON log per run.
//!
//! Every record is a full envelope on its own line, so a torn tail is
//! detected without touching the rest of the file. All functions here are
//! blocking and run on the blocking pool.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read as _, Seek as _, SeekFrom, Write as _};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::event::{AgentEvent, EventHeader};

pub(crate) const PARTITION_EXTENSION: &str = "jsonl";
const SIDECAR_EXTENSION: &str = "corrupt";

/// Index entry for a run partition, built from headers only.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct PartitionSummary {
    pub first_seq: u64,
    pub last_seq: u64,
    pub count: usize,
    pub oldest: DateTime<Utc>,
    pub newest: DateTime<Utc>,
}

impl PartitionSummary {
    fn start(seq: u64, timestamp: DateTime<Utc>) -> Self {
        Self {
            first_seq: seq,
            last_seq: seq,
            count: 1,
            oldest: timestamp,
            newest: timestamp,
        }
    }

    fn include(&mut self, seq: u64, timestamp: DateTime<Utc>) {
        self.last_seq = seq;
        self.count += 1;
        self.oldest = self.oldest.min(timestamp);
        self.newest = self.newest.max(timestamp);
    }

    fn of_headers<'a>(headers: impl IntoIterator<Item = &'a EventHeader>) -> Option<Self> {
        let mut summary: Option<Self> = None;
        for header in headers {
            match summary.as_mut() {
                Some(s) => s.include(header.seq, header.timestamp),
                None => summary = Some(Self::start(header.seq, header.timestamp)),
            }
        }
        summary
    }

    /// Extends this summary with a batch appended after it.
    pub fn extend(&mut self, later: &PartitionSummary) {
        self.last_seq = later.last_seq;
        self.count += later.count;
        self.oldest = self.oldest.min(later.oldest);
        self.newest = self.newest.max(later.newest);
    }

    pub fn of_events(events: &[Arc<AgentEvent>]) -> Option<Self> {
        let (first, rest) = events.split_first()?;
        let mut summary = Self::start(first.seq(), first.timestamp());
        for event in rest {
            summary.include(event.seq(), event.timestamp());
        }
        Some(summary)
    }
}

/// Result of scanning one partition file.
#[derive(Debug)]
pub(crate) struct PartitionScan {
    pub run_id: Option<String>,
    pub summary: Option<PartitionSummary>,
    /// Length of the readable prefix.
    pub valid_len: u64,
    pub file_len: u64,
}

impl PartitionScan {
    pub fn is_damaged(&self) -> bool {
        self.valid_len < self.file_len
    }
}

/// File name for a run: the run id percent-encoded so any id is a safe,
/// unique file name.
pub(crate) fn partition_file_name(run_id: &str) -> String {
    let mut name = String::with_capacity(run_id.len() + 6);
    for byte in run_id.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'-' || byte == b'_' {
            name.push(byte as char);
        } else {
            name.push_str(&format!("%{byte:02X}"));
        }
    }
    name.push('.');
    name.push_str(PARTITION_EXTENSION);
    name
}

pub(crate) fn run_id_from_file_name(name: &str) -> Option<String> {
    let stem = name.strip_suffix(&format!(".{PARTITION_EXTENSION}"))?;
    let bytes = stem.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = stem.get(i + 1..i + 3)?;
            out.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}

pub(crate) fn partition_path(dir: &Path, run_id: &str) -> PathBuf {
    dir.join(partition_file_name(run_id))
}

pub(crate) fn encode_batch(events: &[Arc<AgentEvent>]) -> Result<Vec<u8>, serde_json::Error> {
    let mut buf = Vec::new();
    for event in events {
        serde_json::to_writer(&mut buf, event.as_ref())?;
        buf.push(b'\n');
    }
    Ok(buf)
}

/// Appends a whole batch and syncs it. On failure the file is cut back to its
/// previous length so a retry cannot duplicate or tear records.
pub(crate) fn append_batch(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    let before = file.metadata()?.len();
    let written = file.write_all(bytes).and_then(|()| file.sync_data());
    if let Err(err) = written {
        let _ = file.set_len(before);
        return Err(err);
    }
    Ok(())
}

struct Walk<T> {
    items: Vec<T>,
    valid_len: u64,
}

/// Walks complete lines until the first unparsable line, seq regression, or
/// unterminated tail.
fn walk<'a, T>(bytes: &'a [u8], mut parse: impl FnMut(&'a [u8]) -> Option<(u64, T)>) -> Walk<T> {
    let mut items = Vec::new();
    let mut offset = 0_usize;
    let mut last_seq = 0_u64;
    while offset < bytes.len() {
        let Some(rel_end) = bytes[offset..].iter().position(|b| *b == b'\n') else {
            break;
        };
        let line = &bytes[offset..offset + rel_end];
        let Some((seq, item)) = parse(line) else {
            break;
        };
        if seq <= last_seq {
            break;
        }
        last_seq = seq;
        items.push(item);
        offset += rel_end + 1;
    }
    Walk {
        items,
        valid_len: offset as u64,
    }
}

fn read_all(path: &Path) -> io::Result<Vec<u8>> {
    let mut bytes = Vec::new();
    File::open(path)?.read_to_end(&mut bytes)?;
    Ok(bytes)
}

/// Builds the index entry for a partition without keeping payloads.
pub(crate) fn scan_partition(path: &Path) -> io::Result<PartitionScan> {
    let bytes = read_all(path)?;
    let mut run_id: Option<String> = None;
    let walk = walk(&bytes, |line| {
        let header: EventHeader = serde_json::from_slice(line).ok()?;
        let expected = run_id.get_or_insert_with(|| header.run_id.clone());
        if *expected != header.run_id {
            return None;
        }
        Some((header.seq, header))
    });
    Ok(PartitionScan {
        run_id,
        summary: PartitionSummary::of_headers(&walk.items),
        valid_len: walk.valid_len,
        file_len: bytes.len() as u64,
    })
}

/// Reads the readable prefix of a partition, keeping events with `seq >= from_seq`.
pub(crate) fn read_partition(path: &Path, from_seq: u64) -> io::Result<Vec<AgentEvent>> {
    let bytes = match read_all(path) {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err),
    };
    let walk = walk(&bytes, |line| {
        let event: AgentEvent = serde_json::from_slice(line).ok()?;
        Some((event.seq(), event))
    });
    Ok(walk
        .items
        .into_iter()
        .filter(|e| e.seq() >= from_seq)
        .collect())
}

/// Cuts a damaged partition at its corruption boundary. The discarded bytes
/// are moved to a sidecar file, which is returned.
pub(crate) fn truncate_at(path: &Path, valid_len: u64) -> io::Result<PathBuf> {
    let mut file = OpenOptions::new().read(true).write(true).open(path)?;
    file.seek(SeekFrom::Start(valid_len))?;
    let mut tail = Vec::new();
    file.read_to_end(&mut tail)?;

    let mut sidecar = path.as_os_str().to_owned();
    sidecar.push(".");
    sidecar.push(SIDECAR_EXTENSION);
    let sidecar = PathBuf::from(sidecar);
    let mut out = OpenOptions::new().create(true).append(true).open(&sidecar)?;
    out.write_all(&tail)?;
    out.sync_data()?;

    file.set_len(valid_len)?;
    file.sync_data()?;
    Ok(sidecar)
}

/// Outcome of applying retention to one partition.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Retained {
    /// Nothing was older than the cutoff.
    Untouched,
    /// Some records were removed; the rest are summarized.
    Rewritten { removed: usize, summary: PartitionSummary },
    /// Every record was older than the cutoff; the file is gone.
    Deleted { removed: usize },
}

/// Drops records with a timestamp before `cutoff`, keeping the raw bytes of
/// the rest. Rewrites go through a temp file and rename.
pub(crate) fn retain_since(path: &Path, cutoff: DateTime<Utc>) -> io::Result<Retained> {
    let bytes = read_all(path)?;
    let walk = walk(&bytes, |line| {
        let header: EventHeader = serde_json::from_slice(line).ok()?;
        Some((header.seq, (header, line)))
    });
    let total = walk.items.len();
    let kept: Vec<_> = walk
        .items
        .into_iter()
        .filter(|(header, _)| header.timestamp >= cutoff)
        .collect();
    let removed = total - kept.len();
    if removed == 0 {
        return Ok(Retained::Untouched);
    }
    let Some(summary) = PartitionSummary::of_headers(kept.iter().map(|(header, _)| header)) else {
        fs::remove_file(path)?;
        return Ok(Retained::Deleted { removed });
    };

    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    {
        let mut out = File::create(&tmp)?;
        for (_, line) in &kept {
            out.write_all(line)?;
            out.write_all(b"\n")?;
        }
        out.sync_data()?;
    }
    fs::rename(&tmp, path)?;
    Ok(Retained::Rewritten { removed, summary })
}

/// Partition files in the storage directory.
pub(crate) fn list_partitions(dir: &Path) -> io::Result<Vec<(String, PathBuf)>> {
    let mut out = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        let Some(run_id) = run_id_from_file_name(name) else {
            continue;
        };
        if partition_file_name(&run_id) != name {
            continue;
        }
        out.push((run_id, entry.path()));
    }
    out.sort();
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{ExecutionRecord, Role};
    use chrono::Duration as ChronoDuration;
    use uuid::Uuid;

    fn event_at(run_id: &str, seq: u64, timestamp: DateTime<Utc>) -> Arc<AgentEvent> {
        let record = ExecutionRecord::new(Uuid::new_v4(), seq, Role::Assistant)
            .with_content(format!("chunk-{seq}"));
        Arc::new(AgentEvent::with_timestamp(run_id, seq, "log", record, timestamp))
    }

    fn events(run_id: &str, seqs: std::ops::RangeInclusive<u64>) -> Vec<Arc<AgentEvent>> {
        seqs.map(|seq| event_at(run_id, seq, Utc::now())).collect()
    }

    #[test]
    fn file_names_round_trip_any_run_id() {
        for run_id in ["plain-run_1", "a/b c", "ünïcode", "50%.jsonl"] {
            let name = partition_file_name(run_id);
            assert!(!name.contains('/'));
            assert_eq!(run_id_from_file_name(&name).as_deref(), Some(run_id));
        }
        assert_eq!(run_id_from_file_name("notes.txt"), None);
    }

    #[test]
    fn appended_batches_read_back_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = partition_path(dir.path(), "run");
        append_batch(&path, &encode_batch(&events("run", 1..=3)).unwrap()).unwrap();
        append_batch(&path, &encode_batch(&events("run", 4..=5)).unwrap()).unwrap();

        let seqs: Vec<u64> = read_partition(&path, 2)
            .unwrap()
            .iter()
            .map(AgentEvent::seq)
            .collect();
        assert_eq!(seqs, vec![2, 3, 4, 5]);

        let scan = scan_partition(&path).unwrap();
        assert_eq!(scan.run_id.as_deref(), Some("run"));
        let summary = scan.summary.as_ref().unwrap();
        assert_eq!((summary.first_seq, summary.last_seq, summary.count), (1, 5, 5));
        assert!(!scan.is_damaged());
    }

    #[test]
    fn torn_tail_is_isolated_and_moved_to_sidecar() {
        let dir = tempfile::tempdir().unwrap();
        let path = partition_path(dir.path(), "run");
        append_batch(&path, &encode_batch(&events("run", 1..=2)).unwrap()).unwrap();
        let intact_len = fs::metadata(&path).unwrap().len();
        append_batch(&path, br#"{"v":1,"run_id":"run","seq":3,"times"#).unwrap();

        let scan = scan_partition(&path).unwrap();
        assert!(scan.is_damaged());
        assert_eq!(scan.valid_len, intact_len);
        assert_eq!(read_partition(&path, 0).unwrap().len(), 2);

        let sidecar = truncate_at(&path, scan.valid_len).unwrap();
        assert_eq!(fs::metadata(&path).unwrap().len(), intact_len);
        assert!(fs::read_to_string(sidecar).unwrap().starts_with(r#"{"v":1"#));
        assert!(!scan_partition(&path).unwrap().is_damaged());
    }

    #[test]
    fn garbage_line_stops_reading_at_boundary() {
        let dir = tempfile::tempdir().unwrap();
        let path = partition_path(dir.path(), "run");
        append_batch(&path, &encode_batch(&events("run", 1..=1)).unwrap()).unwrap();
        append_batch(&path, b"not json\n").unwrap();
        append_batch(&path, &encode_batch(&events("run", 2..=2)).unwrap()).unwrap();
        let read = read_partition(&path, 0).unwrap();
        assert_eq!(read.len(), 1);
        assert_eq!(scan_partition(&path).unwrap().summary.unwrap().last_seq, 1);
    }

    #[test]
    fn retention_keeps_recent_records_byte_for_byte() {
        let dir = tempfile::tempdir().unwrap();
        let path = partition_path(dir.path(), "run");
        let now = Utc::now();
        let batch = vec![
            event_at("run", 1, now - ChronoDuration::days(10)),
            event_at("run", 2, now - ChronoDuration::days(9)),
            event_at("run", 3, now),
        ];
        append_batch(&path, &encode_batch(&batch).unwrap()).unwrap();
        let expected_tail = encode_batch(&batch[2..]).unwrap();

        match retain_since(&path, now - ChronoDuration::days(1)).unwrap() {
            Retained::Rewritten { removed, summary } => {
                assert_eq!(removed, 2);
                assert_eq!(summary.first_seq, 3);
            }
            other => panic!("expected rewrite, got {other:?}"),
        }
        assert_eq!(fs::read(&path).unwrap(), expected_tail);

        assert_eq!(
            retain_since(&path, now - ChronoDuration::days(1)).unwrap(),
            Retained::Untouched
        );
        assert_eq!(
            retain_since(&path, now + ChronoDuration::days(1)).unwrap(),
            Retained::Deleted { removed: 1 }
        );
        assert!(!path.exists());
    }
}
