//! State shared across connection threads.
//!
//! The reconciler sits behind a mutex so snapshots from concurrent
//! connections and the watchdog are applied one at a time. Reads take the
//! same lock, so a listing and its total always describe the same state.

use proctrack_protocol::{ProcessIdentity, ProcessRecord, RecentProcesses, Snapshot};
use serde::Serialize;
use std::sync::{Mutex, MutexGuard};

use crate::db::SnapshotLogEntry;
use crate::error::{ReconcileError, StoreError};
use crate::reconcile::{ReconcileOutcome, Reconciler};

const SECS_PER_HOUR: i64 = 60 * 60;

pub struct SharedState {
    reconciler: Mutex<Reconciler>,
    stats: Mutex<ReconcileStats>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileStats {
    pub ingests: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_ingest_at: Option<i64>,
    pub watchdog_runs: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_watchdog_at: Option<i64>,
    pub ended_by_timeout: u64,
    pub ended_by_absence: u64,
    pub failures: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl SharedState {
    pub fn new(reconciler: Reconciler) -> Self {
        Self {
            reconciler: Mutex::new(reconciler),
            stats: Mutex::new(ReconcileStats::default()),
        }
    }

    pub fn timeout_secs(&self) -> i64 {
        self.reconciler().timeout_secs()
    }

    pub fn ingest(
        &self,
        snapshot: &Snapshot,
        now: i64,
    ) -> Result<ReconcileOutcome, ReconcileError> {
        let result = self.reconciler().reconcile(&snapshot.processes, now);

        let mut stats = self.stats();
        match &result {
            Ok(outcome) => {
                stats.ingests += 1;
                stats.last_ingest_at = Some(now);
                stats.ended_by_timeout += outcome.timed_out as u64;
                stats.ended_by_absence += outcome.absent as u64;
                tracing::info!(
                    observed = outcome.observed,
                    timed_out = outcome.timed_out,
                    absent = outcome.absent,
                    attempts = outcome.attempts,
                    "Snapshot reconciled"
                );
            }
            Err(err) => {
                stats.failures += 1;
                stats.last_error = Some(err.to_string());
            }
        }
        result
    }

    /// Timeout sweep without a snapshot.
    pub fn run_watchdog(&self, now: i64) -> Result<usize, ReconcileError> {
        let result = self.reconciler().expire(now);

        let mut stats = self.stats();
        match &result {
            Ok(ended) => {
                stats.watchdog_runs += 1;
                stats.last_watchdog_at = Some(now);
                stats.ended_by_timeout += *ended as u64;
                if *ended > 0 {
                    tracing::info!(ended, "Watchdog expired silent processes");
                }
            }
            Err(err) => {
                stats.failures += 1;
                stats.last_error = Some(err.to_string());
            }
        }
        result
    }

    pub fn recent(&self, limit: usize) -> Result<RecentProcesses, StoreError> {
        let reconciler = self.reconciler();
        let db = reconciler.db();
        let processes = db.query_recent(limit)?;
        let total = db.count_all()?;
        Ok(RecentProcesses { processes, total })
    }

    pub fn process(
        &self,
        identity: ProcessIdentity,
    ) -> Result<Option<ProcessRecord>, StoreError> {
        self.reconciler().db().get_process(identity)
    }

    pub fn active_count(&self) -> Result<u64, StoreError> {
        self.reconciler().db().count_active()
    }

    pub fn snapshots(&self, limit: usize) -> Result<Vec<SnapshotLogEntry>, StoreError> {
        self.reconciler().db().list_snapshots(limit)
    }

    pub fn prune_history(&self, now: i64, retention_hours: i64) -> Result<u64, StoreError> {
        let cutoff = now.saturating_sub(retention_hours.saturating_mul(SECS_PER_HOUR));
        self.reconciler().db().prune_snapshots(cutoff)
    }

    pub fn stats_snapshot(&self) -> ReconcileStats {
        self.stats().clone()
    }

    // A panic mid-reconcile leaves no partial state behind (the transaction
    // rolls back), so a poisoned lock is safe to keep using.
    fn reconciler(&self) -> MutexGuard<'_, Reconciler> {
        self.reconciler
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn stats(&self) -> MutexGuard<'_, ReconcileStats> {
        self.stats
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
