//! Configuration for the kvtstore engine
//!
//! All knobs are fixed before `KvtEngine::open`; the engine never re-reads
//! configuration at runtime.

use crate::error::{KvtError, KvtResult};

/// Concurrency-control strategy selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Concurrency {
    /// At most one transaction at a time, no staging, no rollback.
    SingleWriter,
    /// Strict two-phase locking with exclusive per-key locks.
    Pessimistic,
    /// Optimistic validation with per-entry versions.
    Optimistic,
}

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Write a WAL and snapshots under the data directory. When false the
    /// engine is purely in-memory and never touches disk.
    pub persist: bool,
    /// Call the platform sync primitive after every flushed log record and
    /// snapshot. Off by default; durability is then up to the host OS.
    pub fsync: bool,
    /// Accumulated payload bytes in the active log that trigger a snapshot
    /// and log rotation.
    pub log_size_limit_bytes: u64,
    /// Number of snapshot/log generations retained after a rotation.
    pub keep_history: u64,
    /// Frame log records as readable text lines instead of binary.
    pub text_log: bool,
    /// Concurrency-control strategy for all transactions.
    pub concurrency: Concurrency,
}

impl Config {
    /// Durable configuration with the standard limits.
    pub fn durable() -> Self {
        Self {
            persist: true,
            fsync: false,
            log_size_limit_bytes: 16 * 1024 * 1024,
            keep_history: 5,
            text_log: false,
            concurrency: Concurrency::Pessimistic,
        }
    }

    /// In-memory configuration for tests and embedding: no files, no fsync.
    pub fn ephemeral() -> Self {
        Self {
            persist: false,
            ..Self::durable()
        }
    }

    /// Validate all configuration parameters.
    pub fn validate(&self) -> KvtResult<()> {
        if self.persist && self.log_size_limit_bytes < 1024 {
            return Err(KvtError::ConfigInvalid {
                message: "log_size_limit_bytes must be >= 1KB".into(),
            });
        }
        if self.persist && self.keep_history == 0 {
            return Err(KvtError::ConfigInvalid {
                message: "keep_history must be >= 1".into(),
            });
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::durable()
    }
}
