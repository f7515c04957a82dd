use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::record::ExecutionRecord;

/// Current envelope version.
pub const EVENT_VERSION: u32 = 1;

/// Immutable envelope for one increment of agent progress.
///
/// Envelopes are created by the emission path only; fields are read through
/// accessors so a delivered event cannot be altered by a subscriber.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AgentEvent {
    v: u32,
    run_id: String,
    seq: u64,
    timestamp: DateTime<Utc>,
    agent: String,
    execution_record: ExecutionRecord,
}

impl AgentEvent {
    pub(crate) fn new(
        run_id: impl Into<String>,
        seq: u64,
        agent: impl Into<String>,
        execution_record: ExecutionRecord,
    ) -> Self {
        Self::with_timestamp(run_id, seq, agent, execution_record, Utc::now())
    }

    pub(crate) fn with_timestamp(
        run_id: impl Into<String>,
        seq: u64,
        agent: impl Into<String>,
        execution_record: ExecutionRecord,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            v: EVENT_VERSION,
            run_id: run_id.into(),
            seq,
            timestamp,
            agent: agent.into(),
            execution_record,
        }
    }

    pub fn version(&self) -> u32 {
        self.v
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Run-scoped delivery order, starting at 1.
    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn agent(&self) -> &str {
        &self.agent
    }

    pub fn record(&self) -> &ExecutionRecord {
        &self.execution_record
    }
}

/// Envelope fields needed to index a stored event without its payload.
#[derive(Clone, Debug, Deserialize)]
pub(crate) struct EventHeader {
    pub run_id: String,
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Role;
    use uuid::Uuid;

    #[test]
    fn envelope_serializes_versioned_fields() {
        let record = ExecutionRecord::new(Uuid::new_v4(), 0, Role::Tool).terminal();
        let event = AgentEvent::new("run-a", 1, "scanner", record);
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["v"], serde_json::json!(EVENT_VERSION));
        assert_eq!(value["seq"], serde_json::json!(1));
        assert_eq!(value["agent"], serde_json::json!("scanner"));
        assert!(value["execution_record"]["is_stop"].as_bool().unwrap());
    }

    #[test]
    fn header_reads_envelope_without_payload_fields() {
        let record = ExecutionRecord::new(Uuid::new_v4(), 0, Role::Assistant).with_content("x");
        let event = AgentEvent::new("run-h", 7, "a", record);
        let line = serde_json::to_string(&event).unwrap();
        let header: EventHeader = serde_json::from_str(&line).unwrap();
        assert_eq!(header.run_id, "run-h");
        assert_eq!(header.seq, 7);
        assert_eq!(header.timestamp, event.timestamp());
    }
}
