//! Full-state snapshots.
//!
//! A snapshot is written to a temporary file, fsynced and renamed over the
//! previous one, so the file on disk is always either the old or the new
//! snapshot. Only after the rename may the log be truncated.
//!
//! # File Format
//! ```text
//! [HEADER: see codec]
//! [SnapshotHeader]
//! [SvcReg] x header.services
//! [EventRegRecord] x header.events
//! ```

use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, Error as IoError, ErrorKind, Result as IoResult, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::Tunables;
use crate::ids::ServiceId;
use crate::model::{EventRegRecord, SvcReg};

use super::codec;

/// Leading record of a snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotHeader {
    pub registrar_id: ServiceId,
    /// Next event ID to hand out. Never lowered, so cancelled IDs are not
    /// reissued.
    pub next_event_id: u64,
    pub tunables: Tunables,
    pub services: u64,
    pub events: u64,
    /// Sequence of the last log record reflected in this snapshot.
    pub log_sequence: u64,
    /// Wall time the snapshot was taken, milliseconds since the epoch.
    pub taken_at: i64,
}

/// Decoded snapshot contents.
#[derive(Debug, Clone)]
pub struct SnapshotData {
    pub header: SnapshotHeader,
    pub services: Vec<SvcReg>,
    pub events: Vec<EventRegRecord>,
}

/// Builder for a snapshot file, committed atomically by [`finalize`].
///
/// [`finalize`]: SnapshotWriter::finalize
pub struct SnapshotWriter {
    temp_path: Option<PathBuf>,
    final_path: PathBuf,
    writer: Option<BufWriter<File>>,
    expected: (u64, u64),
    written: (u64, u64),
}

impl SnapshotWriter {
    pub fn new(final_path: PathBuf, header: &SnapshotHeader) -> IoResult<Self> {
        let temp_path = final_path.with_extension(format!("snapshot.tmp.{}", Uuid::new_v4()));
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&temp_path)?;

        let mut writer = BufWriter::new(file);
        codec::write_header(&mut writer)?;
        writer.write_all(&codec::encode(header)?)?;

        Ok(Self {
            temp_path: Some(temp_path),
            final_path,
            writer: Some(writer),
            expected: (header.services, header.events),
            written: (0, 0),
        })
    }

    fn writer(&mut self) -> IoResult<&mut BufWriter<File>> {
        self.writer
            .as_mut()
            .ok_or_else(|| IoError::new(ErrorKind::Other, "writer already consumed"))
    }

    /// Services must all be written before any event.
    pub fn write_service(&mut self, reg: &SvcReg) -> IoResult<()> {
        if self.written.1 > 0 {
            return Err(IoError::new(ErrorKind::InvalidInput, "service written after events"));
        }
        let bytes = codec::encode(reg)?;
        self.writer()?.write_all(&bytes)?;
        self.written.0 += 1;
        Ok(())
    }

    pub fn write_event(&mut self, reg: &EventRegRecord) -> IoResult<()> {
        let bytes = codec::encode(reg)?;
        self.writer()?.write_all(&bytes)?;
        self.written.1 += 1;
        Ok(())
    }

    /// Flushes, fsyncs and renames over the previous snapshot. This is the
    /// commit point.
    pub fn finalize(mut self) -> IoResult<()> {
        if self.written != self.expected {
            return Err(IoError::new(
                ErrorKind::InvalidInput,
                format!(
                    "snapshot header promised {:?} (services, events), wrote {:?}",
                    self.expected, self.written
                ),
            ));
        }
        let mut writer = self
            .writer
            .take()
            .ok_or_else(|| IoError::new(ErrorKind::Other, "writer already consumed"))?;
        let temp_path = self
            .temp_path
            .take()
            .ok_or_else(|| IoError::new(ErrorKind::Other, "temp_path already consumed"))?;

        writer.flush()?;
        writer.get_ref().sync_all()?;
        drop(writer);

        fs::rename(&temp_path, &self.final_path)?;
        sync_parent(&self.final_path)
    }
}

impl Drop for SnapshotWriter {
    fn drop(&mut self) {
        // Best-effort cleanup of an abandoned temp file.
        if let Some(ref temp_path) = self.temp_path {
            if temp_path.exists() {
                let _ = fs::remove_file(temp_path);
            }
        }
    }
}

#[cfg(unix)]
fn sync_parent(path: &Path) -> IoResult<()> {
    match path.parent() {
        Some(dir) => File::open(dir)?.sync_all(),
        None => Ok(()),
    }
}

#[cfg(not(unix))]
fn sync_parent(_path: &Path) -> IoResult<()> {
    Ok(())
}

/// Reads a snapshot. `Ok(None)` if none has been written yet.
///
/// The file is only ever replaced whole, so a short read is corruption,
/// reported as `InvalidData` like any other defect.
pub fn read_snapshot(path: &Path) -> IoResult<Option<SnapshotData>> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };
    let mut reader = BufReader::new(file);
    read_body(&mut reader)
        .map(Some)
        .map_err(|e| match e.kind() {
            ErrorKind::UnexpectedEof => IoError::new(ErrorKind::InvalidData, format!("truncated snapshot: {e}")),
            _ => e,
        })
}

fn read_body(reader: &mut BufReader<File>) -> IoResult<SnapshotData> {
    codec::read_header(reader)?;
    let header: SnapshotHeader = codec::decode(reader)?;
    let services = (0..header.services)
        .map(|_| codec::decode::<SvcReg>(reader))
        .collect::<IoResult<Vec<_>>>()?;
    let events = (0..header.events)
        .map(|_| codec::decode::<EventRegRecord>(reader))
        .collect::<IoResult<Vec<_>>>()?;
    Ok(SnapshotData {
        header,
        services,
        events,
    })
}

/// Removes temp files left behind by a crash mid-snapshot.
pub fn remove_stale_temps(dir: &Path) -> IoResult<usize> {
    let mut removed = 0;
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        let is_temp = path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.contains(".snapshot.tmp."));
        if is_temp && fs::remove_file(&path).is_ok() {
            removed += 1;
        }
    }
    Ok(removed)
}
