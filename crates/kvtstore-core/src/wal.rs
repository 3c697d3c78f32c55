//! Write-ahead logger and replay reader
//!
//! Every record is flushed before the corresponding in-memory change takes
//! effect. The logger appends to a single open log file; rotation is driven
//! by the checkpointer, which hands over the next file path. Record ids are
//! dense from 1 within each log file.
//!
//! The reader replays a whole file at startup. A checksum mismatch or a
//! non-dense record id in the middle of a file is fatal corruption; an
//! incomplete record at the end of the file is the crash point and
//! terminates replay cleanly.

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::durability::durable_sync;
use crate::error::{KvtError, KvtResult};
use crate::format::{decode_binary_frame, decode_text_frame, encode_frame, FrameRead, LogOp};

/// Append-only log writer.
///
/// A disabled logger (ephemeral engines) accepts every call and does
/// nothing, so callers never branch on persistence.
pub struct WalLogger {
    file: Option<File>,
    path: PathBuf,
    text: bool,
    fsync: bool,
    next_record_id: u64,
    payload_bytes: u64,
    staged: Option<Vec<u8>>,
}

impl WalLogger {
    /// A logger that drops everything.
    pub fn disabled() -> Self {
        Self {
            file: None,
            path: PathBuf::new(),
            text: false,
            fsync: false,
            next_record_id: 1,
            payload_bytes: 0,
            staged: None,
        }
    }

    /// Open `path` for appending. `next_record_id` and `payload_bytes`
    /// resume the counters of a partially filled log.
    pub fn open(
        path: PathBuf,
        text: bool,
        fsync: bool,
        next_record_id: u64,
        payload_bytes: u64,
    ) -> KvtResult<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| KvtError::Io {
                path: Some(path.clone()),
                kind: e.kind(),
                message: format!("failed to open log file: {}", e),
            })?;
        Ok(Self {
            file: Some(file),
            path,
            text,
            fsync,
            next_record_id,
            payload_bytes,
            staged: None,
        })
    }

    /// Frame a record and stage it for the next flush. Returns the record id.
    pub fn start_entry(&mut self, payload: &str) -> u64 {
        let id = self.next_record_id;
        if self.file.is_some() {
            self.staged = Some(encode_frame(id, payload, self.text));
        }
        self.next_record_id += 1;
        self.payload_bytes += payload.len() as u64;
        id
    }

    /// Write the staged record to the file, syncing when configured.
    pub fn flush_entry(&mut self) -> KvtResult<()> {
        let Some(buf) = self.staged.take() else {
            return Ok(());
        };
        let Some(file) = self.file.as_mut() else {
            return Ok(());
        };
        file.write_all(&buf).map_err(|e| KvtError::Io {
            path: Some(self.path.clone()),
            kind: e.kind(),
            message: format!("log append failed: {}", e),
        })?;
        if self.fsync {
            durable_sync(file).map_err(|e| KvtError::Io {
                path: Some(self.path.clone()),
                kind: e.kind(),
                message: format!("log sync failed: {}", e),
            })?;
        }
        Ok(())
    }

    /// Frame, write, and (optionally) sync one record.
    pub fn append(&mut self, payload: &str) -> KvtResult<u64> {
        let id = self.start_entry(payload);
        self.flush_entry()?;
        Ok(id)
    }

    /// Accumulated payload bytes in the active log, the rotation measure.
    pub fn total_bytes_written(&self) -> u64 {
        self.payload_bytes
    }

    /// Close the current file and continue appending to `path` with fresh
    /// counters. The old file is synced first so nothing is lost across the
    /// switch.
    pub fn rotate_to(&mut self, path: PathBuf) -> KvtResult<()> {
        if let Some(file) = self.file.as_ref() {
            durable_sync(file).map_err(|e| KvtError::Io {
                path: Some(self.path.clone()),
                kind: e.kind(),
                message: format!("log sync before rotation failed: {}", e),
            })?;
        } else {
            return Ok(());
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| KvtError::Io {
                path: Some(path.clone()),
                kind: e.kind(),
                message: format!("failed to open rotated log file: {}", e),
            })?;

        self.file = Some(file);
        self.path = path;
        self.next_record_id = 1;
        self.payload_bytes = 0;
        self.staged = None;
        Ok(())
    }

    /// Sync and drop the file handle. Further appends are no-ops.
    pub fn close(&mut self) -> KvtResult<()> {
        if let Some(file) = self.file.take() {
            durable_sync(&file).map_err(|e| KvtError::Io {
                path: Some(self.path.clone()),
                kind: e.kind(),
                message: format!("log sync on close failed: {}", e),
            })?;
        }
        Ok(())
    }

    pub fn current_path(&self) -> &Path {
        &self.path
    }
}

/// Everything replay needs from one log file.
#[derive(Debug)]
pub struct LogContents {
    pub ops: Vec<LogOp>,
    /// Id of the last whole record, 0 when the file held none.
    pub last_record_id: u64,
    /// Sum of payload lengths of the whole records.
    pub payload_bytes: u64,
    /// Byte length of the whole-record prefix; anything beyond is a torn
    /// tail from the crash.
    pub clean_len: u64,
}

/// Read and verify a log file.
pub fn read_log(path: &Path, text: bool) -> KvtResult<LogContents> {
    let mut file = File::open(path).map_err(|e| KvtError::Io {
        path: Some(path.to_path_buf()),
        kind: e.kind(),
        message: format!("failed to open log for replay: {}", e),
    })?;
    let mut buf = Vec::new();
    file.read_to_end(&mut buf).map_err(|e| KvtError::Io {
        path: Some(path.to_path_buf()),
        kind: e.kind(),
        message: format!("failed to read log: {}", e),
    })?;

    let mut contents = LogContents {
        ops: Vec::new(),
        last_record_id: 0,
        payload_bytes: 0,
        clean_len: 0,
    };
    let mut offset = 0usize;

    while offset < buf.len() {
        let frame = if text {
            decode_text_frame(&buf, offset, path)?
        } else {
            decode_binary_frame(&buf, offset, path)?
        };

        match frame {
            FrameRead::Torn => {
                debug!(
                    path = %path.display(),
                    offset,
                    "torn record at end of log, stopping replay"
                );
                break;
            }
            FrameRead::Record { id, payload, next_offset } => {
                let expected = contents.last_record_id + 1;
                if id != expected {
                    return Err(KvtError::Corrupted {
                        path: path.to_path_buf(),
                        offset: offset as u64,
                        reason: format!("record id {} out of sequence, expected {}", id, expected),
                    });
                }
                let op = LogOp::decode(&payload).map_err(|reason| KvtError::Corrupted {
                    path: path.to_path_buf(),
                    offset: offset as u64,
                    reason,
                })?;
                contents.payload_bytes += payload.len() as u64;
                contents.last_record_id = id;
                contents.clean_len = next_offset as u64;
                contents.ops.push(op);
                offset = next_offset;
            }
        }
    }

    Ok(contents)
}

/// Cut a torn tail off a log file so appending resumes after the last whole
/// record.
pub fn truncate_to(path: &Path, clean_len: u64) -> KvtResult<()> {
    let file = OpenOptions::new().write(true).open(path).map_err(|e| KvtError::Io {
        path: Some(path.to_path_buf()),
        kind: e.kind(),
        message: format!("failed to open log for truncation: {}", e),
    })?;
    file.set_len(clean_len).map_err(|e| KvtError::Io {
        path: Some(path.to_path_buf()),
        kind: e.kind(),
        message: format!("failed to truncate torn log tail: {}", e),
    })?;
    Ok(())
}
