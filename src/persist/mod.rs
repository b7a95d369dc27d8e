//! Durable registrar state: an operation log plus periodic snapshots.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │                    Store                      │
//! ├──────────────────────────────────────────────┤
//! │  ┌───────────────┐   ┌────────────────────┐  │
//! │  │ OperationLog  │   │ registrar.snapshot │  │
//! │  │ (append-only) │   │ (tmp + rename)     │  │
//! │  └───────┬───────┘   └─────────┬──────────┘  │
//! │          └──────────┬──────────┘             │
//! │                     ↓                        │
//! │           ┌───────────────────┐              │
//! │           │  FileLock (flock) │              │
//! │           └───────────────────┘              │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! Recovery loads the snapshot (if any) and then replays the log records the
//! snapshot does not already cover.

mod codec;
mod file_lock;
pub mod log;
pub mod snapshot;

use std::fs;
use std::io::{Error as IoError, ErrorKind};
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::error::{RegistrarError, RegistrarResult};

pub use codec::{FORMAT_VERSION, IMPLEMENTATION_TAG, MAGIC};
pub use file_lock::{owner_pid, FileLock};
pub use log::{LogEntry, LogRecord, OperationLog};
pub use snapshot::{SnapshotData, SnapshotHeader, SnapshotWriter};

pub const LOG_FILE: &str = "registrar.log";
pub const SNAPSHOT_FILE: &str = "registrar.snapshot";

/// What was found on disk at open.
#[derive(Debug)]
pub struct Recovered {
    pub snapshot: Option<SnapshotData>,
    pub records: Vec<LogRecord>,
}

impl Recovered {
    /// True if nothing has ever been persisted here.
    #[must_use]
    pub fn is_fresh(&self) -> bool {
        self.snapshot.is_none() && self.records.is_empty()
    }
}

/// Maps storage failures at the recovery boundary: malformed data is
/// unrecoverable, anything else is an I/O problem.
pub(crate) fn recovery_error(what: &str, e: &IoError) -> RegistrarError {
    match e.kind() {
        ErrorKind::InvalidData => RegistrarError::unrecoverable(format!("{what}: {e}")),
        _ => RegistrarError::storage(format!("{what}: {e}")),
    }
}

/// Owner of a locked data directory.
#[derive(Debug)]
pub struct Store {
    dir: PathBuf,
    _lock: FileLock,
    log: OperationLog,
}

impl Store {
    /// Locks `dir`, reads the snapshot and the log.
    pub fn open(dir: &Path, sync_on_write: bool) -> RegistrarResult<(Self, Recovered)> {
        fs::create_dir_all(dir)
            .map_err(|e| RegistrarError::storage(format!("failed to create data directory: {e}")))?;

        let lock = FileLock::acquire(dir).map_err(|e| RegistrarError::storage(format!("failed to acquire lock: {e}")))?;

        match snapshot::remove_stale_temps(dir) {
            Ok(0) => {}
            Ok(n) => debug!(removed = n, "removed stale snapshot temp files"),
            Err(e) => return Err(RegistrarError::storage(format!("failed to scan data directory: {e}"))),
        }

        let snapshot =
            snapshot::read_snapshot(&dir.join(SNAPSHOT_FILE)).map_err(|e| recovery_error("failed to read snapshot", &e))?;
        let log = OperationLog::open(&dir.join(LOG_FILE), sync_on_write)
            .map_err(|e| recovery_error("failed to open log", &e))?;
        let entries = log.replay().map_err(|e| recovery_error("failed to replay log", &e))?;

        // A crash between snapshot commit and log truncation leaves records
        // the snapshot already holds.
        let covered = snapshot.as_ref().map_or(0, |s| s.header.log_sequence);
        log.advance_sequence(covered);
        let total = entries.len();
        let records: Vec<LogRecord> = entries
            .into_iter()
            .filter(|e| e.sequence > covered)
            .map(|e| e.record)
            .collect();
        if records.len() < total {
            warn!(
                skipped = total - records.len(),
                covered_through = covered,
                "log holds records already in the snapshot; skipping them"
            );
        }

        info!(
            dir = %dir.display(),
            snapshot = snapshot.is_some(),
            records = records.len(),
            "opened registrar store"
        );

        Ok((
            Self {
                dir: dir.to_path_buf(),
                _lock: lock,
                log,
            },
            Recovered { snapshot, records },
        ))
    }

    pub fn append(&self, record: &LogRecord) -> RegistrarResult<()> {
        self.log
            .append(record)
            .map_err(|e| RegistrarError::storage(format!("log append ({}) failed: {e}", record.kind())))
            .map(|_| ())
    }

    #[must_use]
    pub fn records_since_snapshot(&self) -> u64 {
        self.log.record_count()
    }

    /// Starts a snapshot covering every record logged so far; commit it
    /// with [`Store::commit_snapshot`]. The caller must keep appends out
    /// until then.
    pub fn begin_snapshot(&self, mut header: SnapshotHeader) -> RegistrarResult<SnapshotWriter> {
        header.log_sequence = self.log.last_sequence();
        SnapshotWriter::new(self.dir.join(SNAPSHOT_FILE), &header)
            .map_err(|e| RegistrarError::storage(format!("failed to start snapshot: {e}")))
    }

    /// Renames the snapshot into place, then empties the log it covers.
    pub fn commit_snapshot(&self, writer: SnapshotWriter) -> RegistrarResult<()> {
        writer
            .finalize()
            .map_err(|e| RegistrarError::storage(format!("failed to commit snapshot: {e}")))?;
        self.log
            .truncate()
            .map_err(|e| RegistrarError::storage(format!("failed to truncate log after snapshot: {e}")))
    }

    /// Flushes the log. Called once at shutdown.
    pub fn close(&self) -> RegistrarResult<()> {
        self.log
            .sync()
            .map_err(|e| RegistrarError::storage(format!("failed to sync log: {e}")))
    }
}
