//! Snapshot checkpoints, file discovery, and retention
//!
//! A snapshot `kvt_checkpoint_<N>` is the full database state produced from
//! the tail of log `kvt_log_<N-1>`; after a rotation the engine appends to
//! `kvt_log_<N>` and the next snapshot will be `N+1`.
//!
//! Snapshot layout (all integers little-endian):
//! header `num_tables(u64) next_table_id(u64) next_tx_id(u64)`, then per
//! table `name_len(u64) name id(u64) partition_len(u64) partition
//! num_entries(u64)` followed by `key_len(u64) key data_len(u64) data
//! metadata(i32)` per entry.
//!
//! Snapshots are written to a temp path, synced, and renamed into place so a
//! crash mid-write never leaves a half snapshot under the real name.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::catalog::{Catalog, PartitionMethod, Table};
use crate::durability::durable_sync;
use crate::error::{KvtError, KvtResult};
use crate::storage::{Entry, TableData};

const SNAPSHOT_PREFIX: &str = "kvt_checkpoint_";
const LOG_PREFIX: &str = "kvt_log_";

/// Path of snapshot `id` under `dir`.
pub fn snapshot_path(dir: &Path, id: u64) -> PathBuf {
    dir.join(format!("{}{}", SNAPSHOT_PREFIX, id))
}

/// Path of log `id` under `dir`.
pub fn log_path(dir: &Path, id: u64) -> PathBuf {
    dir.join(format!("{}{}", LOG_PREFIX, id))
}

/// Snapshot and log ids present in a data directory.
#[derive(Debug, Default)]
pub struct Discovery {
    pub snapshots: Vec<u64>,
    pub logs: Vec<u64>,
}

impl Discovery {
    pub fn latest_snapshot(&self) -> Option<u64> {
        self.snapshots.iter().copied().max()
    }

    pub fn latest_log(&self) -> Option<u64> {
        self.logs.iter().copied().max()
    }
}

/// Scan `dir` for snapshot and log files, parsing the integer after the
/// last underscore. Foreign files are ignored.
pub fn discover(dir: &Path) -> KvtResult<Discovery> {
    let mut found = Discovery::default();
    let entries = fs::read_dir(dir).map_err(|e| KvtError::Io {
        path: Some(dir.to_path_buf()),
        kind: e.kind(),
        message: format!("failed to read data directory: {}", e),
    })?;
    for entry in entries {
        let entry = entry.map_err(|e| KvtError::Io {
            path: Some(dir.to_path_buf()),
            kind: e.kind(),
            message: format!("failed to read directory entry: {}", e),
        })?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        let Some((_, id)) = name.rsplit_once('_') else { continue };
        let Ok(id) = id.parse::<u64>() else { continue };
        if name.starts_with(SNAPSHOT_PREFIX) {
            found.snapshots.push(id);
        } else if name.starts_with(LOG_PREFIX) {
            found.logs.push(id);
        }
    }
    Ok(found)
}

// ---------------------------------------------------------------------------
// Snapshot serialization
// ---------------------------------------------------------------------------

fn put_u64(buf: &mut Vec<u8>, v: u64) {
    buf.extend_from_slice(&v.to_le_bytes());
}

fn put_bytes(buf: &mut Vec<u8>, bytes: &[u8]) {
    put_u64(buf, bytes.len() as u64);
    buf.extend_from_slice(bytes);
}

/// Serialize the full database state and atomically install it as snapshot
/// `id`. Returns the final path.
pub fn write_snapshot(
    dir: &Path,
    id: u64,
    catalog: &Catalog,
    next_tx_id: u64,
    fsync: bool,
) -> KvtResult<PathBuf> {
    let mut buf = Vec::new();
    put_u64(&mut buf, catalog.table_count() as u64);
    put_u64(&mut buf, catalog.next_table_id());
    put_u64(&mut buf, next_tx_id);

    for table in catalog.tables_ordered() {
        put_bytes(&mut buf, table.name.as_bytes());
        put_u64(&mut buf, table.id);
        put_bytes(&mut buf, table.partition.as_str().as_bytes());
        put_u64(&mut buf, table.data.len() as u64);
        for (key, entry) in &table.data {
            put_bytes(&mut buf, key);
            put_bytes(&mut buf, &entry.data);
            buf.extend_from_slice(&entry.metadata.to_le_bytes());
        }
    }

    let final_path = snapshot_path(dir, id);
    let temp_path = dir.join(format!("{}{}.tmp", SNAPSHOT_PREFIX, id));

    {
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&temp_path)
            .map_err(|e| KvtError::Io {
                path: Some(temp_path.clone()),
                kind: e.kind(),
                message: format!("failed to create snapshot temp file: {}", e),
            })?;
        file.write_all(&buf).map_err(|e| KvtError::Io {
            path: Some(temp_path.clone()),
            kind: e.kind(),
            message: format!("failed to write snapshot: {}", e),
        })?;
        if fsync {
            durable_sync(&file).map_err(|e| KvtError::Io {
                path: Some(temp_path.clone()),
                kind: e.kind(),
                message: format!("failed to sync snapshot: {}", e),
            })?;
        }
    }

    fs::rename(&temp_path, &final_path).map_err(|e| KvtError::Io {
        path: Some(final_path.clone()),
        kind: e.kind(),
        message: format!("failed to install snapshot: {}", e),
    })?;

    if fsync {
        if let Ok(dir_file) = File::open(dir) {
            let _ = durable_sync(&dir_file);
        }
    }

    Ok(final_path)
}

/// Cursor over the snapshot byte buffer with bounds-checked reads.
struct SnapshotReader<'a> {
    buf: &'a [u8],
    offset: usize,
    path: &'a Path,
}

impl<'a> SnapshotReader<'a> {
    fn corrupt(&self, reason: String) -> KvtError {
        KvtError::Corrupted {
            path: self.path.to_path_buf(),
            offset: self.offset as u64,
            reason,
        }
    }

    fn take(&mut self, n: usize, what: &str) -> KvtResult<&'a [u8]> {
        if self.offset + n > self.buf.len() {
            return Err(self.corrupt(format!(
                "truncated snapshot: need {} bytes for {}, {} left",
                n,
                what,
                self.buf.len() - self.offset
            )));
        }
        let slice = &self.buf[self.offset..self.offset + n];
        self.offset += n;
        Ok(slice)
    }

    fn u64(&mut self, what: &str) -> KvtResult<u64> {
        let bytes = self.take(8, what)?;
        Ok(u64::from_le_bytes(bytes.try_into().expect("8-byte slice")))
    }

    fn i32(&mut self, what: &str) -> KvtResult<i32> {
        let bytes = self.take(4, what)?;
        Ok(i32::from_le_bytes(bytes.try_into().expect("4-byte slice")))
    }

    fn bytes(&mut self, what: &str) -> KvtResult<Vec<u8>> {
        let len = self.u64(what)? as usize;
        if len > self.buf.len() {
            return Err(self.corrupt(format!("{} length {} exceeds file size", what, len)));
        }
        Ok(self.take(len, what)?.to_vec())
    }
}

/// Load a snapshot file back into a catalog and the transaction counter.
pub fn load_snapshot(path: &Path) -> KvtResult<(Catalog, u64)> {
    let mut file = File::open(path).map_err(|e| KvtError::Io {
        path: Some(path.to_path_buf()),
        kind: e.kind(),
        message: format!("failed to open snapshot: {}", e),
    })?;
    let mut buf = Vec::new();
    file.read_to_end(&mut buf).map_err(|e| KvtError::Io {
        path: Some(path.to_path_buf()),
        kind: e.kind(),
        message: format!("failed to read snapshot: {}", e),
    })?;

    let mut reader = SnapshotReader { buf: &buf, offset: 0, path };
    let num_tables = reader.u64("num_tables")?;
    let next_table_id = reader.u64("next_table_id")?;
    let next_tx_id = reader.u64("next_tx_id")?;

    let mut tables = Vec::new();
    for _ in 0..num_tables {
        let name = String::from_utf8(reader.bytes("table name")?)
            .map_err(|_| reader.corrupt("table name is not UTF-8".into()))?;
        let id = reader.u64("table id")?;
        let partition_token = String::from_utf8(reader.bytes("partition method")?)
            .map_err(|_| reader.corrupt("partition method is not UTF-8".into()))?;
        let partition = PartitionMethod::parse(&partition_token)
            .map_err(|_| reader.corrupt(format!("bad partition method '{}'", partition_token)))?;
        let num_entries = reader.u64("num_entries")?;

        let mut data = TableData::new();
        for _ in 0..num_entries {
            let key = reader.bytes("entry key")?;
            let value = reader.bytes("entry data")?;
            let metadata = reader.i32("entry metadata")?;
            data.insert(key, Entry::new(value, metadata));
        }
        tables.push(Table { id, name, partition, data });
    }

    if reader.offset != buf.len() {
        return Err(reader.corrupt("trailing bytes after last table".into()));
    }

    Ok((Catalog::from_parts(tables, next_table_id), next_tx_id))
}

// ---------------------------------------------------------------------------
// Rotation bookkeeping
// ---------------------------------------------------------------------------

/// Rotation state and retention policy. The engine drives it synchronously
/// on the committing thread; there is no background work.
pub struct Checkpointer {
    dir: PathBuf,
    /// Id of the next snapshot to produce.
    next_snapshot_id: u64,
    keep_history: u64,
    fsync: bool,
    /// Size limit was exceeded but active transactions blocked the
    /// snapshot; retried at the next quiescent commit boundary.
    pending: bool,
}

impl Checkpointer {
    pub fn new(dir: PathBuf, next_snapshot_id: u64, keep_history: u64, fsync: bool) -> Self {
        Self { dir, next_snapshot_id, keep_history, fsync, pending: false }
    }

    pub fn next_snapshot_id(&self) -> u64 {
        self.next_snapshot_id
    }

    pub fn mark_pending(&mut self) {
        self.pending = true;
    }

    pub fn is_pending(&self) -> bool {
        self.pending
    }

    /// Write snapshot `next_snapshot_id`, advance the counter, and prune old
    /// generations. Returns the path of the new log the caller must switch
    /// to.
    pub fn rotate(&mut self, catalog: &Catalog, next_tx_id: u64) -> KvtResult<PathBuf> {
        let id = self.next_snapshot_id;
        write_snapshot(&self.dir, id, catalog, next_tx_id, self.fsync)?;
        self.next_snapshot_id = id + 1;
        self.pending = false;
        info!(snapshot = id, "wrote checkpoint, rotating log");
        self.prune(id);
        Ok(log_path(&self.dir, id))
    }

    /// Remove snapshots and logs older than `keep_history` generations
    /// behind `newest`. Removal failures are reported and otherwise ignored;
    /// stale files are retried at the next rotation.
    fn prune(&self, newest: u64) {
        let Some(oldest_kept) = newest.checked_sub(self.keep_history - 1) else {
            return;
        };
        let Ok(found) = discover(&self.dir) else {
            return;
        };
        for id in found.snapshots {
            if id < oldest_kept {
                remove_quietly(&snapshot_path(&self.dir, id));
            }
        }
        for id in found.logs {
            // log N-1 is paired with snapshot N
            if id + 1 < oldest_kept {
                remove_quietly(&log_path(&self.dir, id));
            }
        }
    }
}

fn remove_quietly(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        warn!(path = %path.display(), error = %e, "failed to prune old file");
    }
}
