//! SQLite persistence for proctrack-daemon.
//!
//! This is the single-writer store backing the daemon: a `processes` table
//! keyed by process identity (pid, start_time) and a `snapshots` log with one
//! row per reconciled snapshot. Rows in `processes` are never deleted; an
//! ENDED row is the history of that process instance.
//!
//! All writes go through [`Db::transaction`]. Every call opens its own
//! connection, so a transaction is also the scope of the connection.

use fs_err as fs;
use proctrack_protocol::{ProcessIdentity, ProcessObservation, ProcessRecord, ProcessStatus};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, TransactionBehavior};
use serde::Serialize;
use std::path::PathBuf;

use crate::error::StoreError;

const RECORD_COLUMNS: &str = "pid, name, path, start_time, last_seen, status";

pub struct Db {
    path: PathBuf,
}

/// Write handle for one reconcile. Dropping it without a commit rolls back.
pub struct StoreTx<'conn> {
    tx: rusqlite::Transaction<'conn>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SnapshotLogEntry {
    pub recorded_at: i64,
    pub observed: usize,
    pub timed_out: usize,
    pub absent: usize,
}

type RawRecord = (i64, String, String, i64, i64, String);

impl Db {
    pub fn new(path: PathBuf) -> Result<Self, StoreError> {
        let db = Self { path };
        db.init_schema()?;
        Ok(db)
    }

    /// Runs `op` inside one IMMEDIATE transaction and commits it.
    ///
    /// IMMEDIATE takes the write lock up front, so two reconciles against the
    /// same file can never interleave their sweeps.
    pub fn transaction<T>(
        &self,
        op: impl FnOnce(&StoreTx<'_>) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        self.with_connection(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let store = StoreTx { tx };
            let value = op(&store)?;
            store.tx.commit()?;
            Ok(value)
        })
    }

    /// Most recently seen rows first.
    pub fn query_recent(&self, limit: usize) -> Result<Vec<ProcessRecord>, StoreError> {
        self.with_connection(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM processes \
                 ORDER BY last_seen DESC, start_time DESC, pid ASC \
                 LIMIT ?1",
                RECORD_COLUMNS
            ))?;

            let rows = stmt.query_map(params![limit as i64], read_raw_record)?;

            let mut records = Vec::new();
            for row in rows {
                records.push(decode_record(row?)?);
            }
            Ok(records)
        })
    }

    pub fn count_all(&self) -> Result<u64, StoreError> {
        self.with_connection(|conn| {
            let count = conn.query_row("SELECT COUNT(*) FROM processes", [], |row| {
                row.get::<_, i64>(0)
            })?;
            Ok(count as u64)
        })
    }

    pub fn count_active(&self) -> Result<u64, StoreError> {
        self.with_connection(|conn| {
            let count = conn.query_row(
                "SELECT COUNT(*) FROM processes WHERE status = ?1",
                params![ProcessStatus::Active.as_str()],
                |row| row.get::<_, i64>(0),
            )?;
            Ok(count as u64)
        })
    }

    pub fn get_process(
        &self,
        identity: ProcessIdentity,
    ) -> Result<Option<ProcessRecord>, StoreError> {
        self.with_connection(|conn| {
            let raw = conn
                .query_row(
                    &format!(
                        "SELECT {} FROM processes WHERE pid = ?1 AND start_time = ?2",
                        RECORD_COLUMNS
                    ),
                    params![identity.pid as i64, identity.start_time],
                    read_raw_record,
                )
                .optional()?;
            raw.map(decode_record).transpose()
        })
    }

    pub fn list_snapshots(&self, limit: usize) -> Result<Vec<SnapshotLogEntry>, StoreError> {
        self.with_connection(|conn| {
            let mut stmt = conn.prepare(
                "SELECT recorded_at, observed, timed_out, absent FROM snapshots \
                 ORDER BY recorded_at DESC, id DESC LIMIT ?1",
            )?;

            let rows = stmt.query_map(params![limit as i64], |row| {
                Ok(SnapshotLogEntry {
                    recorded_at: row.get(0)?,
                    observed: row.get::<_, i64>(1)? as usize,
                    timed_out: row.get::<_, i64>(2)? as usize,
                    absent: row.get::<_, i64>(3)? as usize,
                })
            })?;

            let mut entries = Vec::new();
            for row in rows {
                entries.push(row?);
            }
            Ok(entries)
        })
    }

    pub fn prune_snapshots(&self, cutoff: i64) -> Result<u64, StoreError> {
        self.with_connection(|conn| {
            let removed =
                conn.execute("DELETE FROM snapshots WHERE recorded_at < ?1", params![cutoff])?;
            Ok(removed as u64)
        })
    }

    fn init_schema(&self) -> Result<(), StoreError> {
        self.with_connection(|conn| {
            conn.execute_batch(
                "BEGIN;
                 CREATE TABLE IF NOT EXISTS processes (
                    pid INTEGER NOT NULL,
                    start_time INTEGER NOT NULL,
                    name TEXT NOT NULL,
                    path TEXT NOT NULL,
                    last_seen INTEGER NOT NULL,
                    status TEXT NOT NULL CHECK (status IN ('ACTIVE', 'ENDED')),
                    PRIMARY KEY (pid, start_time)
                 );
                 CREATE INDEX IF NOT EXISTS processes_status_last_seen
                    ON processes (status, last_seen);
                 CREATE INDEX IF NOT EXISTS processes_last_seen
                    ON processes (last_seen DESC);
                 CREATE TABLE IF NOT EXISTS snapshots (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    recorded_at INTEGER NOT NULL,
                    observed INTEGER NOT NULL,
                    timed_out INTEGER NOT NULL,
                    absent INTEGER NOT NULL
                 );
                 COMMIT;",
            )?;
            Ok(())
        })
    }

    fn with_connection<T>(
        &self,
        op: impl FnOnce(&mut Connection) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut conn = self.open()?;
        op(&mut conn)
    }

    fn open(&self) -> Result<Connection, StoreError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_FULL_MUTEX;

        let conn = Connection::open_with_flags(&self.path, flags)?;

        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.pragma_update(None, "busy_timeout", 5000)?;

        Ok(conn)
    }
}

impl StoreTx<'_> {
    /// Ends every ACTIVE row last seen strictly before `now - timeout_secs`.
    pub fn sweep_timeout(&self, now: i64, timeout_secs: i64) -> Result<usize, StoreError> {
        let cutoff = now.saturating_sub(timeout_secs);
        let ended = self.tx.execute(
            "UPDATE processes SET status = ?1 WHERE status = ?2 AND last_seen < ?3",
            params![
                ProcessStatus::Ended.as_str(),
                ProcessStatus::Active.as_str(),
                cutoff
            ],
        )?;
        Ok(ended)
    }

    /// Insert-or-update by identity. An existing row is refreshed and made
    /// ACTIVE again, whatever its previous status.
    pub fn upsert(&self, process: &ProcessObservation, now: i64) -> Result<(), StoreError> {
        self.tx.execute(
            "INSERT INTO processes (pid, start_time, name, path, last_seen, status) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6) \
             ON CONFLICT(pid, start_time) DO UPDATE SET \
                name = excluded.name, \
                path = excluded.path, \
                last_seen = excluded.last_seen, \
                status = excluded.status",
            params![
                process.pid as i64,
                process.start_time,
                process.name,
                process.path,
                now,
                ProcessStatus::Active.as_str()
            ],
        )?;
        Ok(())
    }

    /// Ends every ACTIVE row whose identity is not in `present`.
    ///
    /// An empty `present` ends all ACTIVE rows.
    pub fn mark_absent_not_in(&self, present: &[ProcessIdentity]) -> Result<usize, StoreError> {
        if present.is_empty() {
            let ended = self.tx.execute(
                "UPDATE processes SET status = ?1 WHERE status = ?2",
                params![ProcessStatus::Ended.as_str(), ProcessStatus::Active.as_str()],
            )?;
            return Ok(ended);
        }

        // Staged in a temp table so snapshot size is not bounded by the
        // bind-parameter limit.
        self.tx.execute_batch(
            "CREATE TEMP TABLE IF NOT EXISTS present_identities (
                pid INTEGER NOT NULL,
                start_time INTEGER NOT NULL,
                PRIMARY KEY (pid, start_time)
             ) WITHOUT ROWID;
             DELETE FROM temp.present_identities;",
        )?;
        {
            let mut insert = self.tx.prepare_cached(
                "INSERT OR IGNORE INTO temp.present_identities (pid, start_time) VALUES (?1, ?2)",
            )?;
            for identity in present {
                insert.execute(params![identity.pid as i64, identity.start_time])?;
            }
        }

        let ended = self.tx.execute(
            "UPDATE processes SET status = ?1 \
             WHERE status = ?2 \
               AND NOT EXISTS ( \
                   SELECT 1 FROM temp.present_identities p \
                   WHERE p.pid = processes.pid AND p.start_time = processes.start_time \
               )",
            params![ProcessStatus::Ended.as_str(), ProcessStatus::Active.as_str()],
        )?;
        self.tx.execute("DELETE FROM temp.present_identities", [])?;
        Ok(ended)
    }

    pub fn record_snapshot(&self, entry: &SnapshotLogEntry) -> Result<(), StoreError> {
        self.tx.execute(
            "INSERT INTO snapshots (recorded_at, observed, timed_out, absent) \
             VALUES (?1, ?2, ?3, ?4)",
            params![
                entry.recorded_at,
                entry.observed as i64,
                entry.timed_out as i64,
                entry.absent as i64
            ],
        )?;
        Ok(())
    }
}

fn read_raw_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawRecord> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
    ))
}

fn decode_record(raw: RawRecord) -> Result<ProcessRecord, StoreError> {
    let (pid, name, path, start_time, last_seen, status_raw) = raw;
    let pid = u32::try_from(pid)
        .map_err(|_| StoreError::Corrupt(format!("pid out of range: {}", pid)))?;
    let status = ProcessStatus::parse(&status_raw)
        .ok_or_else(|| StoreError::Corrupt(format!("Unknown process status: {}", status_raw)))?;

    Ok(ProcessRecord {
        pid,
        name,
        path,
        start_time,
        last_seen,
        status,
    })
}
