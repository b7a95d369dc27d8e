//! Append-only operation log.
//!
//! Every mutating operation is appended as one [`LogRecord`] before it is
//! applied. Lease expirations are never logged: replay restores absolute
//! expirations and the sweepers reap whatever has lapsed.
//!
//! Each record carries a sequence number that keeps rising across
//! truncations. A snapshot stores the last sequence it covers, so a log that
//! survived a crash between snapshot commit and truncation is skipped rather
//! than applied twice.
//!
//! # File Format
//! ```text
//! [HEADER: see codec]
//! [ENTRY 1: codec-framed LogEntry]
//! [ENTRY 2: codec-framed LogEntry]
//! ...
//! ```

use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Error as IoError, ErrorKind, Read, Result as IoResult, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::config::Tunables;
use crate::ids::{EventId, LeaseId, ServiceId};
use crate::model::{EntryRep, EventRegRecord, SvcReg};

use super::codec;

/// One logged operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LogRecord {
    /// Written first into a fresh log so the registrar keeps its ID even
    /// if it crashes before the first snapshot.
    Identity { registrar_id: ServiceId },
    ServiceRegistered { reg: SvcReg },
    ServiceLeaseRenewed {
        service_id: ServiceId,
        lease_id: LeaseId,
        expiration: i64,
    },
    ServiceLeaseCancelled { service_id: ServiceId, lease_id: LeaseId },
    EventRegistered { reg: EventRegRecord },
    EventLeaseRenewed {
        event_id: EventId,
        lease_id: LeaseId,
        expiration: i64,
    },
    EventLeaseCancelled { event_id: EventId, lease_id: LeaseId },
    AttributesAdded {
        service_id: ServiceId,
        lease_id: LeaseId,
        attributes: Vec<EntryRep>,
    },
    AttributesModified {
        service_id: ServiceId,
        lease_id: LeaseId,
        templates: Vec<EntryRep>,
        changes: Vec<Option<EntryRep>>,
    },
    AttributesSet {
        service_id: ServiceId,
        lease_id: LeaseId,
        attributes: Vec<EntryRep>,
    },
    TunablesChanged { tunables: Tunables },
}

/// A record with its position in the log's history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub sequence: u64,
    pub record: LogRecord,
}

impl LogRecord {
    /// Short name for diagnostics.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Identity { .. } => "identity",
            Self::ServiceRegistered { .. } => "service_registered",
            Self::ServiceLeaseRenewed { .. } => "service_lease_renewed",
            Self::ServiceLeaseCancelled { .. } => "service_lease_cancelled",
            Self::EventRegistered { .. } => "event_registered",
            Self::EventLeaseRenewed { .. } => "event_lease_renewed",
            Self::EventLeaseCancelled { .. } => "event_lease_cancelled",
            Self::AttributesAdded { .. } => "attributes_added",
            Self::AttributesModified { .. } => "attributes_modified",
            Self::AttributesSet { .. } => "attributes_set",
            Self::TunablesChanged { .. } => "tunables_changed",
        }
    }
}

struct LogWriter {
    writer: BufWriter<File>,
    /// File length after the last fully written record.
    committed_len: u64,
    records: u64,
    /// Sequence of the last record written or replayed.
    last_sequence: u64,
}

/// The operation log.
///
/// Thread-safe via internal mutex; the registrar additionally serializes
/// appends under its write lock.
pub struct OperationLog {
    path: PathBuf,
    inner: Mutex<LogWriter>,
    sync_on_write: bool,
}

impl std::fmt::Debug for OperationLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationLog")
            .field("path", &self.path)
            .field("records", &self.record_count())
            .finish_non_exhaustive()
    }
}

impl OperationLog {
    /// Opens the log, creating it with a fresh header if missing or empty.
    ///
    /// An existing header is validated; a mismatch is `InvalidData`.
    pub fn open(path: &Path, sync_on_write: bool) -> IoResult<Self> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        if file.metadata()?.len() == 0 {
            codec::write_header(&mut file)?;
            if sync_on_write {
                file.sync_all()?;
            }
        } else {
            codec::read_header(&mut BufReader::new(&mut file))?;
        }

        let committed_len = file.seek(SeekFrom::End(0))?;
        Ok(Self {
            path: path.to_path_buf(),
            inner: Mutex::new(LogWriter {
                writer: BufWriter::new(file),
                committed_len,
                records: 0,
                last_sequence: 0,
            }),
            sync_on_write,
        })
    }

    /// Appends one record and returns its sequence. On failure the file is
    /// cut back to the last complete record so a later append cannot follow
    /// garbage.
    pub fn append(&self, record: &LogRecord) -> IoResult<u64> {
        let mut inner = self.inner.lock();
        let entry = LogEntry {
            sequence: inner.last_sequence + 1,
            record: record.clone(),
        };
        let encoded = codec::encode(&entry)?;

        let result = inner.writer.write_all(&encoded).and_then(|()| inner.writer.flush()).and_then(|()| {
            if self.sync_on_write {
                inner.writer.get_ref().sync_data()
            } else {
                Ok(())
            }
        });

        match result {
            Ok(()) => {
                inner.committed_len += encoded.len() as u64;
                inner.records += 1;
                inner.last_sequence = entry.sequence;
                Ok(entry.sequence)
            }
            Err(e) => {
                if let Err(rollback) = Self::rollback(&self.path, &mut inner) {
                    warn!(path = %self.path.display(), error = %rollback, "failed to roll back partial log append");
                }
                Err(e)
            }
        }
    }

    fn rollback(path: &Path, inner: &mut LogWriter) -> IoResult<()> {
        let len = inner.committed_len;
        Self::reset_writer(path, inner, len)
    }

    /// Cuts the file to `len` and points the writer at the new end. Bytes
    /// still buffered in the old writer are discarded, not flushed.
    fn reset_writer(path: &Path, inner: &mut LogWriter, len: u64) -> IoResult<()> {
        let mut file = OpenOptions::new().read(true).write(true).open(path)?;
        file.set_len(len)?;
        file.seek(SeekFrom::End(0))?;
        let old = std::mem::replace(&mut inner.writer, BufWriter::new(file));
        let _ = old.into_parts();
        inner.committed_len = len;
        Ok(())
    }

    /// Reads every entry from the start of the log.
    pub fn iter(&self) -> IoResult<LogIterator> {
        LogIterator::new(&self.path)
    }

    /// Reads every entry for recovery. A torn tail is cut off so new
    /// appends follow the last complete record; any other defect fails and
    /// leaves the file untouched.
    pub fn replay(&self) -> IoResult<Vec<LogEntry>> {
        let mut iter = self.iter()?;
        let mut entries: Vec<LogEntry> = Vec::new();
        for entry in iter.by_ref() {
            let entry = entry?;
            if let Some(prev) = entries.last() {
                if entry.sequence <= prev.sequence {
                    return Err(IoError::new(
                        ErrorKind::InvalidData,
                        format!("log sequence {} follows {}", entry.sequence, prev.sequence),
                    ));
                }
            }
            entries.push(entry);
        }
        let mut inner = self.inner.lock();
        if iter.torn {
            warn!(
                path = %self.path.display(),
                kept_bytes = iter.good_end,
                "cutting torn record from end of log"
            );
            Self::reset_writer(&self.path, &mut inner, iter.good_end)?;
        }
        inner.records = entries.len() as u64;
        if let Some(last) = entries.last() {
            inner.last_sequence = inner.last_sequence.max(last.sequence);
        }
        Ok(entries)
    }

    /// Records appended or replayed since the last truncation.
    #[must_use]
    pub fn record_count(&self) -> u64 {
        self.inner.lock().records
    }

    /// Sequence of the newest record this log has written or replayed.
    #[must_use]
    pub fn last_sequence(&self) -> u64 {
        self.inner.lock().last_sequence
    }

    /// Continues numbering after `sequence`. Used when a snapshot covers
    /// records newer than anything left in the log.
    pub fn advance_sequence(&self, sequence: u64) {
        let mut inner = self.inner.lock();
        inner.last_sequence = inner.last_sequence.max(sequence);
    }

    /// Empties the log back to a bare header. Only call once a snapshot
    /// covering every record has been committed. Sequence numbering carries
    /// on from where it was.
    pub fn truncate(&self) -> IoResult<()> {
        let mut inner = self.inner.lock();
        inner.writer.flush()?;

        let mut file = OpenOptions::new().read(true).write(true).open(&self.path)?;
        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        codec::write_header(&mut file)?;
        file.sync_all()?;

        inner.committed_len = codec::header_len();
        inner.records = 0;
        inner.writer = BufWriter::new(file);
        Ok(())
    }

    /// Flushes and syncs pending writes.
    pub fn sync(&self) -> IoResult<()> {
        let mut inner = self.inner.lock();
        inner.writer.flush()?;
        inner.writer.get_ref().sync_all()
    }
}

/// Iterator over log entries.
///
/// A record cut short by end-of-file ends iteration when nothing valid
/// follows it: it is the torn tail of an append that never completed. If a
/// whole record does follow, the short one had a damaged length prefix and
/// is yielded as `InvalidData`, as is any other defect.
pub struct LogIterator {
    reader: BufReader<File>,
    file_size: u64,
    /// Offset just past the last complete record.
    good_end: u64,
    torn: bool,
}

impl LogIterator {
    fn new(path: &Path) -> IoResult<Self> {
        let file = File::open(path)?;
        let file_size = file.metadata()?.len();
        let mut reader = BufReader::new(file);
        codec::read_header(&mut reader)?;
        Ok(Self {
            reader,
            file_size,
            good_end: codec::header_len(),
            torn: false,
        })
    }

    fn at_eof(&mut self) -> IoResult<bool> {
        Ok(self.reader.stream_position()? >= self.file_size)
    }

    /// Decides what a short read at `good_end` means.
    fn classify_short_read(&mut self, eof: IoError) -> IoResult<()> {
        self.reader.seek(SeekFrom::Start(self.good_end))?;
        let mut rest = Vec::new();
        self.reader.read_to_end(&mut rest)?;
        match codec::find_frame(&rest) {
            None => {
                self.torn = true;
                Ok(())
            }
            Some(at) => Err(IoError::new(
                ErrorKind::InvalidData,
                format!(
                    "record at offset {} overruns the file ({eof}) but a complete record follows at offset {}",
                    self.good_end,
                    self.good_end + at as u64
                ),
            )),
        }
    }
}

impl Iterator for LogIterator {
    type Item = IoResult<LogEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.at_eof() {
            Ok(true) => return None,
            Ok(false) => {}
            Err(e) => return Some(Err(e)),
        }
        match codec::decode(&mut self.reader) {
            Ok(record) => match self.reader.stream_position() {
                Ok(pos) => {
                    self.good_end = pos;
                    Some(Ok(record))
                }
                Err(e) => Some(Err(e)),
            },
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => match self.classify_short_read(e) {
                Ok(()) => None,
                Err(e) => Some(Err(e)),
            },
            Err(e) => Some(Err(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn cancel() -> LogRecord {
        LogRecord::ServiceLeaseCancelled {
            service_id: ServiceId::new(),
            lease_id: LeaseId::new(),
        }
    }

    #[test]
    fn test_append_and_iterate_across_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("registrar.log");
        let first = cancel();
        {
            let log = OperationLog::open(&path, true).unwrap();
            log.append(&first).unwrap();
            log.append(&LogRecord::TunablesChanged {
                tunables: Tunables::default(),
            })
            .unwrap();
            assert_eq!(log.record_count(), 2);
        }

        let log = OperationLog::open(&path, true).unwrap();
        let entries: Vec<_> = log.iter().unwrap().collect::<IoResult<_>>().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].record, first);
        assert_eq!(entries[1].record.kind(), "tunables_changed");
        assert_eq!((entries[0].sequence, entries[1].sequence), (1, 2));
    }

    #[test]
    fn test_sequence_survives_truncate_and_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("registrar.log");
        {
            let log = OperationLog::open(&path, false).unwrap();
            assert_eq!(log.append(&cancel()).unwrap(), 1);
            assert_eq!(log.append(&cancel()).unwrap(), 2);
            log.truncate().unwrap();
            assert_eq!(log.last_sequence(), 2);
            assert_eq!(log.append(&cancel()).unwrap(), 3);
        }

        let log = OperationLog::open(&path, false).unwrap();
        let entries = log.replay().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].sequence, 3);
        assert_eq!(log.append(&cancel()).unwrap(), 4);

        // An empty log resumes after whatever a snapshot covered.
        log.truncate().unwrap();
        log.advance_sequence(10);
        log.advance_sequence(7);
        assert_eq!(log.append(&cancel()).unwrap(), 11);
    }

    #[test]
    fn test_truncate_leaves_empty_log() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("registrar.log");
        let log = OperationLog::open(&path, false).unwrap();
        log.append(&cancel()).unwrap();
        log.truncate().unwrap();
        assert_eq!(log.record_count(), 0);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), codec::header_len());

        log.append(&cancel()).unwrap();
        drop(log);
        let log = OperationLog::open(&path, false).unwrap();
        assert_eq!(log.iter().unwrap().count(), 1);
    }

    #[test]
    fn test_torn_tail_is_end_of_log() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("registrar.log");
        {
            let log = OperationLog::open(&path, true).unwrap();
            log.append(&cancel()).unwrap();
            log.append(&cancel()).unwrap();
        }
        let len = std::fs::metadata(&path).unwrap().len();
        OpenOptions::new().write(true).open(&path).unwrap().set_len(len - 5).unwrap();

        let log = OperationLog::open(&path, true).unwrap();
        assert_eq!(log.replay().unwrap().len(), 1);
        assert_eq!(log.record_count(), 1);

        // The torn bytes are gone; a new append lands right after record one.
        log.append(&cancel()).unwrap();
        drop(log);
        let log = OperationLog::open(&path, true).unwrap();
        assert_eq!(log.replay().unwrap().len(), 2);
    }

    #[test]
    fn test_corrupt_record_is_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("registrar.log");
        {
            let log = OperationLog::open(&path, true).unwrap();
            log.append(&cancel()).unwrap();
            log.append(&cancel()).unwrap();
        }
        let mut bytes = std::fs::read(&path).unwrap();
        let at = codec::header_len() as usize + 6;
        bytes[at] ^= 0xFF;
        std::fs::write(&path, bytes).unwrap();

        let log = OperationLog::open(&path, true).unwrap();
        assert_eq!(log.replay().unwrap_err().kind(), ErrorKind::InvalidData);
    }

    #[test]
    fn test_damaged_length_is_not_a_torn_tail() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("registrar.log");
        {
            let log = OperationLog::open(&path, true).unwrap();
            for _ in 0..3 {
                log.append(&cancel()).unwrap();
            }
        }
        let mut bytes = std::fs::read(&path).unwrap();
        // Make the first record claim 64 KiB more than it has.
        bytes[codec::header_len() as usize + 2] ^= 0x01;
        std::fs::write(&path, &bytes).unwrap();

        let log = OperationLog::open(&path, true).unwrap();
        let err = log.replay().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidData);
        assert!(err.to_string().contains("complete record follows"));
        drop(log);
        assert_eq!(std::fs::read(&path).unwrap(), bytes);
    }

    #[test]
    fn test_foreign_file_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("registrar.log");
        std::fs::write(&path, b"XLOG\x01garbage").unwrap();
        let err = OperationLog::open(&path, true).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidData);
    }
}
