//! Correlation supervisor
//!
//! Periodic sweep that evicts records past their deadline. It runs on the
//! coordinator's event loop, so it never races result matching: a record is
//! either resolved by its result or evicted here, never both.

use chrono::{DateTime, Utc};
use courier_sdk::DispatchError;
use std::time::Duration;
use tokio::time::{Interval, MissedTickBehavior};

use super::correlation::{CorrelationRecord, CorrelationTable};

#[derive(Debug, Clone)]
pub struct Supervisor {
    interval: Duration,
}

impl Supervisor {
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Timer driving the sweep; late ticks are delayed, not bunched up
    pub fn ticker(&self) -> Interval {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker
    }

    /// Evict expired records as of `now`
    pub fn sweep(&self, table: &mut CorrelationTable, now: DateTime<Utc>) -> Vec<CorrelationRecord> {
        let evicted = table.evict_expired(now);
        for record in &evicted {
            let err = DispatchError::DispatchTimeout(record.correlation_id.to_string());
            tracing::warn!(
                "{} ({} task for conversation {}, deadline {})",
                err,
                record.capability,
                record.conversation_id,
                record.deadline
            );
        }
        if !evicted.is_empty() {
            tracing::debug!("Sweep evicted {}, {} still outstanding", evicted.len(), table.len());
        }
        evicted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_sdk::{Capability, PayloadRef, TaskEnvelope};

    #[test]
    fn test_sweep_only_evicts_past_deadline() {
        let supervisor = Supervisor::new(Duration::from_secs(5));
        let mut table = CorrelationTable::new();

        let task = TaskEnvelope::new(Capability::Image, "C1", "U1", PayloadRef::telegram("P"));
        let record = CorrelationRecord::for_task(&task, Duration::from_secs(30));
        let deadline = record.deadline;
        table.insert(record).unwrap();

        let before = deadline - chrono::Duration::seconds(1);
        assert!(supervisor.sweep(&mut table, before).is_empty());
        assert_eq!(table.len(), 1);

        let evicted = supervisor.sweep(&mut table, deadline);
        assert_eq!(evicted.len(), 1);
        assert!(table.is_empty());

        // Second sweep is a no-op
        assert!(supervisor.sweep(&mut table, deadline).is_empty());
    }

    #[tokio::test]
    async fn test_ticker_fires() {
        let supervisor = Supervisor::new(Duration::from_millis(10));
        let mut ticker = supervisor.ticker();
        ticker.tick().await;
        tokio::time::timeout(Duration::from_secs(1), ticker.tick())
            .await
            .unwrap();
    }
}
