//! Presence reconciliation.
//!
//! Each snapshot is applied in three steps, in one transaction:
//!
//! 1. timeout sweep: ACTIVE rows not seen within the timeout become ENDED
//! 2. upsert: every observed identity is inserted or refreshed as ACTIVE
//! 3. absence sweep: ACTIVE rows missing from the snapshot become ENDED
//!
//! Step 2 runs after step 1 so a process that is still reported wins over a
//! stale timeout. Step 3 runs last so nothing just observed can be ended.
//! The watchdog runs step 1 alone, which is the only way a process whose
//! agent went silent ever leaves ACTIVE.

use proctrack_protocol::{ProcessIdentity, ProcessObservation};
use serde::Serialize;
use std::collections::BTreeSet;
use std::thread;
use tracing::{debug, warn};

use crate::config::RetryConfig;
use crate::db::{Db, SnapshotLogEntry};
use crate::error::{ReconcileError, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ReconcileOutcome {
    /// Distinct identities in the snapshot.
    pub observed: usize,
    /// Rows ended by the timeout sweep.
    pub timed_out: usize,
    /// Rows ended by the absence sweep.
    pub absent: usize,
    pub attempts: u32,
}

pub struct Reconciler {
    db: Db,
    timeout_secs: i64,
    retry: RetryConfig,
}

impl Reconciler {
    pub fn new(db: Db, timeout_secs: i64, retry: RetryConfig) -> Self {
        Self {
            db,
            timeout_secs,
            retry,
        }
    }

    pub fn db(&self) -> &Db {
        &self.db
    }

    pub fn timeout_secs(&self) -> i64 {
        self.timeout_secs
    }

    pub fn reconcile(
        &self,
        observations: &[ProcessObservation],
        now: i64,
    ) -> Result<ReconcileOutcome, ReconcileError> {
        let present: Vec<ProcessIdentity> = observations
            .iter()
            .map(ProcessObservation::identity)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        let ((timed_out, absent), attempts) = self.with_retry("reconcile", |db| {
            db.transaction(|tx| {
                let timed_out = tx.sweep_timeout(now, self.timeout_secs)?;
                for process in observations {
                    tx.upsert(process, now)?;
                }
                let absent = tx.mark_absent_not_in(&present)?;
                tx.record_snapshot(&SnapshotLogEntry {
                    recorded_at: now,
                    observed: present.len(),
                    timed_out,
                    absent,
                })?;
                Ok((timed_out, absent))
            })
        })?;

        Ok(ReconcileOutcome {
            observed: present.len(),
            timed_out,
            absent,
            attempts,
        })
    }

    /// Runs the timeout sweep on its own. Returns how many rows were ended.
    pub fn expire(&self, now: i64) -> Result<usize, ReconcileError> {
        let (ended, _) = self.with_retry("expire", |db| {
            db.transaction(|tx| tx.sweep_timeout(now, self.timeout_secs))
        })?;
        Ok(ended)
    }

    /// Re-runs `op` wholesale while it fails with a transient store error.
    fn with_retry<T>(
        &self,
        label: &str,
        mut op: impl FnMut(&Db) -> Result<T, StoreError>,
    ) -> Result<(T, u32), ReconcileError> {
        let max_attempts = self.retry.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match op(&self.db) {
                Ok(value) => return Ok((value, attempt)),
                Err(err) if err.is_transient() => {
                    if attempt >= max_attempts {
                        return Err(ReconcileError::RetriesExhausted {
                            attempts: attempt,
                            source: err,
                        });
                    }
                    warn!(
                        error = %err,
                        attempt,
                        max_attempts,
                        "Transient store error during {}; retrying",
                        label
                    );
                    thread::sleep(self.retry.delay());
                    attempt += 1;
                }
                Err(err) => {
                    debug!(error = %err, "{} failed", label);
                    return Err(ReconcileError::Store(err));
                }
            }
        }
    }
}
