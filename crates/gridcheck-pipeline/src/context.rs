//! Per-run execution context and counters.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Mutable per-run state shared across stage boundaries.
///
/// Counters are updated with relaxed atomic increments from any worker;
/// they are the only cross-stage synchronization besides the payload
/// stream itself. The context is created at run start and discarded when
/// the run completes.
pub struct ExecutionContext {
    pub run_id: Uuid,
    pub job_id: Uuid,
    pub started_at: DateTime<Utc>,
    started: Instant,

    total_sent: AtomicU64,
    total_received: AtomicU64,
    total_filtered: AtomicU64,
    total_evaluated: AtomicU64,
    total_saved: AtomicU64,
    total_failed: AtomicU64,
}

impl ExecutionContext {
    pub fn new(job_id: Uuid) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            job_id,
            started_at: Utc::now(),
            started: Instant::now(),
            total_sent: AtomicU64::new(0),
            total_received: AtomicU64::new(0),
            total_filtered: AtomicU64::new(0),
            total_evaluated: AtomicU64::new(0),
            total_saved: AtomicU64::new(0),
            total_failed: AtomicU64::new(0),
        }
    }

    pub fn inc_sent(&self) {
        self.total_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_received(&self) {
        self.total_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_filtered(&self) {
        self.total_filtered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_evaluated(&self) {
        self.total_evaluated.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_saved(&self, n: u64) {
        self.total_saved.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_failed(&self, n: u64) {
        self.total_failed.fetch_add(n, Ordering::Relaxed);
    }

    pub fn total_sent(&self) -> u64 {
        self.total_sent.load(Ordering::Relaxed)
    }

    pub fn total_received(&self) -> u64 {
        self.total_received.load(Ordering::Relaxed)
    }

    pub fn total_filtered(&self) -> u64 {
        self.total_filtered.load(Ordering::Relaxed)
    }

    pub fn total_evaluated(&self) -> u64 {
        self.total_evaluated.load(Ordering::Relaxed)
    }

    pub fn total_saved(&self) -> u64 {
        self.total_saved.load(Ordering::Relaxed)
    }

    pub fn total_failed(&self) -> u64 {
        self.total_failed.load(Ordering::Relaxed)
    }

    /// Wall-clock time since the run started.
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Freeze the counters into a serializable report.
    pub fn snapshot(&self) -> ContextSnapshot {
        ContextSnapshot {
            run_id: self.run_id,
            job_id: self.job_id,
            started_at: self.started_at,
            elapsed_ms: self.elapsed().as_millis() as u64,
            total_sent: self.total_sent(),
            total_received: self.total_received(),
            total_filtered: self.total_filtered(),
            total_evaluated: self.total_evaluated(),
            total_saved: self.total_saved(),
            total_failed: self.total_failed(),
        }
    }
}

/// Final (or in-flight) counter report for a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextSnapshot {
    pub run_id: Uuid,
    pub job_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub elapsed_ms: u64,
    pub total_sent: u64,
    pub total_received: u64,
    pub total_filtered: u64,
    pub total_evaluated: u64,
    pub total_saved: u64,
    pub total_failed: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let ctx = ExecutionContext::new(Uuid::new_v4());
        ctx.inc_sent();
        ctx.inc_sent();
        ctx.inc_received();
        ctx.add_saved(5);
        ctx.add_failed(1);

        let snapshot = ctx.snapshot();
        assert_eq!(snapshot.total_sent, 2);
        assert_eq!(snapshot.total_received, 1);
        assert_eq!(snapshot.total_saved, 5);
        assert_eq!(snapshot.total_failed, 1);
    }

    #[test]
    fn test_snapshot_serializes() {
        let ctx = ExecutionContext::new(Uuid::new_v4());
        let json = serde_json::to_string(&ctx.snapshot()).unwrap();
        assert!(json.contains("total_sent"));
    }
}
