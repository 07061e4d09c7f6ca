//! Durable JSON Lines append writer.
//!
//! One writer owns the output file handle. Every record becomes exactly one
//! line (serde_json escapes all control characters, so a serialized record
//! can never contain a raw newline), issued as a single write on the
//! append-mode handle inside the lock: concurrent appends never interleave
//! and a kill between appends never leaves a partial line behind.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

use crate::error::{CaptureError, CaptureResult};
use crate::model::FlowRecord;

/// Durability/throughput tradeoff for the capture log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Durability {
    /// Write and fsync every record before `append` returns. A record that
    /// was accepted survives an immediate process crash.
    FlushEachWrite,
    /// Accumulate up to `max_buffered` lines in memory and write+fsync them
    /// as one batch. Higher throughput; a crash can lose the buffered tail.
    Batched { max_buffered: usize },
}

impl Default for Durability {
    fn default() -> Self {
        Durability::FlushEachWrite
    }
}

/// Destination for encoded records. Abstracted so tests can observe appends
/// without a real file.
pub trait RecordSink: Send + Sync {
    fn append(&self, record: &FlowRecord) -> CaptureResult<()>;
    fn flush(&self) -> CaptureResult<()>;
}

struct Inner {
    /// None once closed; appends then fail with `Closed`.
    file: Option<File>,
    buffer: Vec<u8>,
    buffered_lines: usize,
}

/// Append-only writer for the capture log file.
pub struct AppendWriter {
    path: PathBuf,
    durability: Durability,
    inner: Mutex<Inner>,
}

impl AppendWriter {
    /// Open (creating if absent) the target file for appending.
    pub fn open(path: &Path, durability: Durability) -> CaptureResult<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| CaptureError::Io {
                path: path.to_path_buf(),
                source: e,
            })?;
        Ok(Self {
            path: path.to_path_buf(),
            durability,
            inner: Mutex::new(Inner {
                file: Some(file),
                buffer: Vec::new(),
                buffered_lines: 0,
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Flush buffered lines and sync, keeping the handle open.
    pub fn flush(&self) -> CaptureResult<()> {
        let mut inner = self.inner.lock();
        self.write_buffered(&mut inner)
    }

    /// Flush, sync and drop the file handle. Idempotent; subsequent appends
    /// fail with [`CaptureError::Closed`].
    pub fn close(&self) -> CaptureResult<()> {
        let mut inner = self.inner.lock();
        if inner.file.is_none() {
            return Ok(());
        }
        let result = self.write_buffered(&mut inner);
        inner.file = None;
        result
    }

    pub fn is_open(&self) -> bool {
        self.inner.lock().file.is_some()
    }

    fn io_err(&self, source: std::io::Error) -> CaptureError {
        CaptureError::Io {
            path: self.path.clone(),
            source,
        }
    }

    /// Write out everything buffered and sync the file. Caller holds the
    /// lock. No-op on a closed handle.
    fn write_buffered(&self, inner: &mut Inner) -> CaptureResult<()> {
        let Some(file) = inner.file.as_mut() else {
            return Ok(());
        };
        if !inner.buffer.is_empty() {
            file.write_all(&inner.buffer).map_err(|e| CaptureError::Io {
                path: self.path.clone(),
                source: e,
            })?;
            inner.buffer.clear();
            inner.buffered_lines = 0;
        }
        file.sync_all().map_err(|e| CaptureError::Io {
            path: self.path.clone(),
            source: e,
        })?;
        Ok(())
    }
}

impl RecordSink for AppendWriter {
    /// Serialize `record` to its single-line form and append it. The
    /// critical section covers serialize-to-bytes hand-off, write and flush
    /// only; once this returns under [`Durability::FlushEachWrite`], the
    /// line is on disk.
    fn append(&self, record: &FlowRecord) -> CaptureResult<()> {
        let mut line = serde_json::to_vec(record).map_err(|e| CaptureError::Encoding {
            flow_id: record.id.clone(),
            reason: format!("record serialization failed: {e}"),
        })?;
        line.push(b'\n');

        let mut inner = self.inner.lock();
        if inner.file.is_none() {
            return Err(CaptureError::Closed);
        }
        match self.durability {
            Durability::FlushEachWrite => {
                let file = inner.file.as_mut().expect("checked above");
                file.write_all(&line).map_err(|e| self.io_err(e))?;
                file.sync_all().map_err(|e| self.io_err(e))?;
            }
            Durability::Batched { max_buffered } => {
                inner.buffer.extend_from_slice(&line);
                inner.buffered_lines += 1;
                if inner.buffered_lines >= max_buffered.max(1) {
                    self.write_buffered(&mut inner)?;
                }
            }
        }
        Ok(())
    }

    fn flush(&self) -> CaptureResult<()> {
        AppendWriter::flush(self)
    }
}
