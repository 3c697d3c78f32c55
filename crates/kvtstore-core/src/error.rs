//! Error types for kvtstore operations
//!
//! Every public operation reports its outcome through the KvtError enum.
//! Data-path variants mirror the store's error taxonomy (conflicts, missing
//! keys, transaction misuse); the I/O and corruption variants belong to the
//! startup path, where they are fatal.

use std::error::Error;
use std::fmt;
use std::io;
use std::path::PathBuf;

/// kvtstore error taxonomy.
#[derive(Debug, Clone)]
pub enum KvtError {
    /// The engine has been shut down (or was never opened)
    NotInitialized,

    /// A table with this name already exists
    TableAlreadyExists {
        /// The conflicting table name
        name: String,
    },

    /// No table matches the given id or name
    TableNotFound {
        /// Human-readable description of the lookup (`id 7` or `'users'`)
        table: String,
    },

    /// Partition method was neither "hash" nor "range"
    InvalidPartitionMethod {
        /// The rejected token
        token: String,
    },

    /// No active transaction has this id
    TransactionNotFound {
        /// The unknown transaction id
        tx_id: u64,
    },

    /// Single-writer mode: another transaction is already active
    TransactionAlreadyRunning {
        /// Id of the transaction currently holding the store
        active: u64,
    },

    /// Single-writer mode retains no undo, so rollback cannot be honored;
    /// the transaction stays active and must be committed
    RollbackNotSupported,

    /// The key is absent from the store and the transaction's write set
    KeyNotFound,

    /// The key was deleted by the current transaction
    KeyDeleted,

    /// The key is locked by another transaction (2PL); the caller must
    /// roll back and retry
    KeyLocked {
        /// Transaction id holding the lock
        holder: u64,
    },

    /// Optimistic validation failed; the transaction observed data that has
    /// since changed and must be rolled back
    StaleData,

    /// The transaction already hit a conflict (KeyLocked / StaleData);
    /// commit is refused until it is rolled back
    TransactionPoisoned {
        /// The conflicted transaction's id
        tx_id: u64,
    },

    /// An auto-commit write cannot be isolated in the current mode
    OneShotWriteNotAllowed,

    /// An auto-commit delete cannot be isolated in the current mode
    OneShotDeleteNotAllowed,

    /// One or more operations in a batch failed
    BatchNotFullySuccess {
        /// Concatenated per-operation diagnostics
        detail: String,
    },

    /// A user-supplied process callback reported failure
    ExtFuncError {
        /// Message produced by the callback
        message: String,
    },

    /// A configuration parameter failed validation before open
    ConfigInvalid {
        /// Which parameter and why
        message: String,
    },

    /// I/O operation failed
    Io {
        /// File path where the error occurred, when known
        path: Option<PathBuf>,
        /// Underlying I/O error kind
        kind: io::ErrorKind,
        /// Human-readable description
        message: String,
    },

    /// A snapshot or log file is structurally damaged; fatal at startup
    Corrupted {
        /// Path of the damaged file
        path: PathBuf,
        /// Byte offset where corruption was detected
        offset: u64,
        /// Description of the corruption
        reason: String,
    },

    /// A log record's stored checksum does not match its payload; fatal
    ChecksumMismatch {
        /// Path of the log file
        path: PathBuf,
        /// Record id whose checksum failed
        record_id: u64,
        /// Checksum stored in the record header
        expected: u32,
        /// Checksum recomputed from the payload
        actual: u32,
    },

    /// Anything that does not fit the taxonomy above
    Unknown {
        /// Human-readable description
        message: String,
    },
}

impl fmt::Display for KvtError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KvtError::NotInitialized => write!(f, "store is not initialized"),

            KvtError::TableAlreadyExists { name } => {
                write!(f, "table '{}' already exists", name)
            }

            KvtError::TableNotFound { table } => write!(f, "table {} not found", table),

            KvtError::InvalidPartitionMethod { token } => {
                write!(f, "invalid partition method '{}': must be 'hash' or 'range'", token)
            }

            KvtError::TransactionNotFound { tx_id } => {
                write!(f, "transaction {} not found", tx_id)
            }

            KvtError::TransactionAlreadyRunning { active } => {
                write!(f, "transaction {} is already running", active)
            }

            KvtError::RollbackNotSupported => {
                write!(f, "rollback is not supported in single-writer mode")
            }

            KvtError::KeyNotFound => write!(f, "key not found"),

            KvtError::KeyDeleted => write!(f, "key deleted in current transaction"),

            KvtError::KeyLocked { holder } => {
                write!(f, "key locked by transaction {}", holder)
            }

            KvtError::StaleData => write!(f, "transaction has stale data"),

            KvtError::TransactionPoisoned { tx_id } => {
                write!(f, "transaction {} hit a conflict and must be rolled back", tx_id)
            }

            KvtError::OneShotWriteNotAllowed => {
                write!(f, "one-shot write not allowed while a transaction is active")
            }

            KvtError::OneShotDeleteNotAllowed => {
                write!(f, "one-shot delete not allowed while a transaction is active")
            }

            KvtError::BatchNotFullySuccess { detail } => {
                write!(f, "batch not fully successful: {}", detail)
            }

            KvtError::ExtFuncError { message } => {
                write!(f, "external function error: {}", message)
            }

            KvtError::ConfigInvalid { message } => {
                write!(f, "invalid configuration: {}", message)
            }

            KvtError::Io { path, kind, message } => {
                if let Some(path) = path {
                    write!(f, "I/O error in {}: {} ({})", path.display(), message, kind)
                } else {
                    write!(f, "I/O error: {} ({})", message, kind)
                }
            }

            KvtError::Corrupted { path, offset, reason } => {
                write!(f, "corrupted file {} at offset {}: {}", path.display(), offset, reason)
            }

            KvtError::ChecksumMismatch { path, record_id, expected, actual } => {
                write!(
                    f,
                    "checksum mismatch in {} record {}: expected 0x{:08x}, got 0x{:08x}",
                    path.display(),
                    record_id,
                    expected,
                    actual
                )
            }

            KvtError::Unknown { message } => write!(f, "{}", message),
        }
    }
}

impl Error for KvtError {}

/// Convert std::io::Error to KvtError::Io without path context
impl From<io::Error> for KvtError {
    fn from(err: io::Error) -> Self {
        KvtError::Io {
            path: None,
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

impl KvtError {
    /// True for errors that terminate startup: damaged snapshots, damaged
    /// log records, file-ordering violations.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            KvtError::Corrupted { .. } | KvtError::ChecksumMismatch { .. }
        )
    }
}

/// Result type alias for kvtstore operations
pub type KvtResult<T> = Result<T, KvtError>;
