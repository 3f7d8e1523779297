//! Correlation table
//!
//! The table is the single source of truth for whether a task is still
//! outstanding. It holds no lock of its own; the coordinator owns it behind
//! one mutex so dispatch, result matching and the timeout sweep are
//! serialized. Whoever removes a record first wins; the loser sees `None`.

use chrono::{DateTime, Utc};
use courier_sdk::{Capability, CorrelationId, DispatchError, TaskEnvelope};
use std::collections::HashMap;
use std::time::Duration;

/// Bookkeeping for one dispatched task
#[derive(Debug, Clone, PartialEq)]
pub struct CorrelationRecord {
    pub correlation_id: CorrelationId,
    pub conversation_id: String,
    pub capability: Capability,
    pub artifact_name: Option<String>,
    pub issued_at: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
}

impl CorrelationRecord {
    /// Record for `task` expiring `timeout` after it was issued
    pub fn for_task(task: &TaskEnvelope, timeout: Duration) -> Self {
        let timeout = chrono::Duration::from_std(timeout).unwrap_or(chrono::Duration::MAX);
        Self {
            correlation_id: task.correlation_id.clone(),
            conversation_id: task.conversation_id.clone(),
            capability: task.capability,
            artifact_name: task.payload_ref.file_name.clone(),
            issued_at: task.issued_at,
            deadline: task
                .issued_at
                .checked_add_signed(timeout)
                .unwrap_or(DateTime::<Utc>::MAX_UTC),
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.deadline
    }
}

/// Open correlation records keyed by correlation id
#[derive(Debug, Default)]
pub struct CorrelationTable {
    records: HashMap<CorrelationId, CorrelationRecord>,
}

impl CorrelationTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a record; at most one may exist per correlation id
    pub fn insert(&mut self, record: CorrelationRecord) -> Result<(), DispatchError> {
        if self.records.contains_key(&record.correlation_id) {
            return Err(DispatchError::DuplicateCorrelation(
                record.correlation_id.to_string(),
            ));
        }
        self.records.insert(record.correlation_id.clone(), record);
        Ok(())
    }

    /// Close the record matching a result
    ///
    /// `None` when the record was already evicted or resolved.
    pub fn resolve(&mut self, correlation_id: &CorrelationId) -> Option<CorrelationRecord> {
        self.records.remove(correlation_id)
    }

    /// Drop a record whose task was never published
    pub fn discard(&mut self, correlation_id: &CorrelationId) -> bool {
        self.records.remove(correlation_id).is_some()
    }

    /// Remove and return every record whose deadline has passed, oldest first
    pub fn evict_expired(&mut self, now: DateTime<Utc>) -> Vec<CorrelationRecord> {
        let expired: Vec<CorrelationId> = self
            .records
            .values()
            .filter(|r| r.is_expired(now))
            .map(|r| r.correlation_id.clone())
            .collect();

        let mut evicted: Vec<CorrelationRecord> = expired
            .iter()
            .filter_map(|id| self.records.remove(id))
            .collect();
        evicted.sort_by_key(|r| r.deadline);
        evicted
    }

    /// Open records of one conversation, in issue order
    pub fn outstanding_for(&self, conversation_id: &str) -> Vec<&CorrelationRecord> {
        let mut records: Vec<&CorrelationRecord> = self
            .records
            .values()
            .filter(|r| r.conversation_id == conversation_id)
            .collect();
        records.sort_by_key(|r| r.issued_at);
        records
    }

    pub fn has_outstanding(&self, conversation_id: &str) -> bool {
        self.records
            .values()
            .any(|r| r.conversation_id == conversation_id)
    }

    pub fn contains(&self, correlation_id: &CorrelationId) -> bool {
        self.records.contains_key(correlation_id)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_sdk::PayloadRef;

    fn task(conversation: &str) -> TaskEnvelope {
        TaskEnvelope::new(
            Capability::Document,
            conversation,
            "U1",
            PayloadRef::telegram("F").with_file_name("a.pdf"),
        )
    }

    #[test]
    fn test_deadline_is_issue_time_plus_timeout() {
        let task = task("C1");
        let record = CorrelationRecord::for_task(&task, Duration::from_secs(60));
        assert_eq!(record.deadline - record.issued_at, chrono::Duration::seconds(60));
        assert_eq!(record.artifact_name.as_deref(), Some("a.pdf"));
    }

    #[test]
    fn test_duplicate_insert_rejected() {
        let mut table = CorrelationTable::new();
        let record = CorrelationRecord::for_task(&task("C1"), Duration::from_secs(60));

        table.insert(record.clone()).unwrap();
        let err = table.insert(record).unwrap_err();
        assert!(matches!(err, DispatchError::DuplicateCorrelation(_)));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_resolve_is_first_writer_wins() {
        let mut table = CorrelationTable::new();
        let record = CorrelationRecord::for_task(&task("C1"), Duration::from_secs(60));
        let id = record.correlation_id.clone();
        table.insert(record).unwrap();

        assert!(table.resolve(&id).is_some());
        assert!(table.resolve(&id).is_none());
        assert!(table.is_empty());
    }

    #[test]
    fn test_evict_expired_leaves_live_records() {
        let mut table = CorrelationTable::new();
        let short = CorrelationRecord::for_task(&task("C1"), Duration::from_secs(10));
        let long = CorrelationRecord::for_task(&task("C1"), Duration::from_secs(1000));
        let short_id = short.correlation_id.clone();
        let now = short.issued_at;
        table.insert(short).unwrap();
        table.insert(long).unwrap();

        assert!(table.evict_expired(now).is_empty());

        let evicted = table.evict_expired(now + chrono::Duration::seconds(10));
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].correlation_id, short_id);
        assert_eq!(table.len(), 1);

        // A late result for the evicted task finds nothing
        assert!(table.resolve(&short_id).is_none());
    }

    #[test]
    fn test_outstanding_per_conversation() {
        let mut table = CorrelationTable::new();
        table
            .insert(CorrelationRecord::for_task(&task("C1"), Duration::from_secs(60)))
            .unwrap();
        table
            .insert(CorrelationRecord::for_task(&task("C2"), Duration::from_secs(60)))
            .unwrap();

        assert_eq!(table.outstanding_for("C1").len(), 1);
        assert!(table.has_outstanding("C2"));
        assert!(!table.has_outstanding("C3"));
    }

    #[test]
    fn test_discard() {
        let mut table = CorrelationTable::new();
        let record = CorrelationRecord::for_task(&task("C1"), Duration::from_secs(60));
        let id = record.correlation_id.clone();
        table.insert(record).unwrap();

        assert!(table.discard(&id));
        assert!(!table.discard(&id));
        assert!(!table.contains(&id));
    }
}
