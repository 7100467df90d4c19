//! Router and buffer counters.
//!
//! Aggregated per engine so per-chunk activity can stay at trace level while the
//! summary still shows what happened during a workflow.

use crate::session::DropReason;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouterMetrics {
    pub partials: u64,
    pub step_updates: u64,
    pub flushes: u64,
    pub flushed_entries: u64,
    pub stale_dropped: u64,
    pub misrouted_dropped: u64,
    pub orphaned_dropped: u64,
    pub workflows_finished: u64,
}

impl RouterMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_partial(&mut self) {
        self.partials += 1;
    }

    pub fn record_step_update(&mut self) {
        self.step_updates += 1;
    }

    pub fn record_flush(&mut self, entries: usize) {
        if entries == 0 {
            return;
        }
        self.flushes += 1;
        self.flushed_entries += entries as u64;
    }

    pub fn record_drop(&mut self, reason: &DropReason) {
        match reason {
            DropReason::StaleSession { .. } => self.stale_dropped += 1,
            DropReason::UnrecognizedStep { .. } => self.misrouted_dropped += 1,
            DropReason::NoActiveTurn | DropReason::MissingProvider { .. } => {
                self.orphaned_dropped += 1
            }
        }
    }

    pub fn record_workflow_finished(&mut self) {
        self.workflows_finished += 1;
    }

    pub fn dropped(&self) -> u64 {
        self.stale_dropped + self.misrouted_dropped + self.orphaned_dropped
    }

    pub fn log_summary(&self) {
        let coalescing = if self.flushes == 0 {
            0.0
        } else {
            self.partials as f64 / self.flushes as f64
        };
        tracing::info!(
            target: "flight_recorder",
            "[ENGINE] Partials: {} | Step updates: {} | Flushes: {} ({:.1} partials/flush) | Dropped: stale={} misrouted={} orphaned={}",
            self.partials,
            self.step_updates,
            self.flushes,
            coalescing,
            self.stale_dropped,
            self.misrouted_dropped,
            self.orphaned_dropped
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SessionId;

    #[test]
    fn test_drop_reasons_are_bucketed() {
        let mut m = RouterMetrics::new();
        m.record_drop(&DropReason::StaleSession {
            expected: None,
            got: SessionId::from("s"),
        });
        m.record_drop(&DropReason::UnrecognizedStep {
            step_id: "x".into(),
        });
        m.record_drop(&DropReason::NoActiveTurn);
        assert_eq!((m.stale_dropped, m.misrouted_dropped, m.orphaned_dropped), (1, 1, 1));
        assert_eq!(m.dropped(), 3);
    }

    #[test]
    fn test_empty_flush_not_counted() {
        let mut m = RouterMetrics::new();
        m.record_flush(0);
        m.record_flush(3);
        assert_eq!(m.flushes, 1);
        assert_eq!(m.flushed_entries, 3);
    }
}
