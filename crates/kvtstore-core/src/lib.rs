//! kvtstore — transactional multi-table key-value store
//!
//! An in-memory store with durable persistence: every mutating operation is
//! appended to a write-ahead log before it takes effect, and snapshot
//! checkpoints bound replay time and log growth.
//!
//! # Architecture
//!
//! - **Catalog**: table name/id registry with dense, never-reused ids
//! - **Storage**: per-table ordered keyspace of byte keys and values
//! - **Concurrency**: three interchangeable strategies behind one contract:
//!   single-writer (no CC), strict two-phase locking, and optimistic
//!   validation with per-entry versions
//! - **Process engine**: user callbacks transforming one value or a key
//!   range atomically inside a transaction
//! - **WAL + checkpoints**: checksummed records, size-triggered rotation,
//!   bounded retention, startup replay
//!
//! Transaction id 0 means auto-commit: the operation runs atomically and is
//! logged as a standalone record.
//!
//! ```no_run
//! use kvtstore_core::{Config, KvtEngine};
//!
//! # fn main() -> kvtstore_core::KvtResult<()> {
//! let store = KvtEngine::open("/var/lib/kvt", Config::durable())?;
//! let table = store.create_table("users", "hash")?;
//!
//! store.set(0, table, b"alice", b"crimson")?;
//! assert_eq!(store.get(0, table, b"alice")?, b"crimson");
//!
//! let tx = store.start_tx()?;
//! store.set(tx, table, b"bob", b"teal")?;
//! store.commit_tx(tx)?;
//! # Ok(())
//! # }
//! ```

pub mod catalog;
pub mod checkpoint;
pub mod config;
pub mod durability;
pub mod engine;
pub mod error;
pub mod format;
pub mod process;
pub mod storage;
pub mod txn;
pub mod wal;

mod optimistic;
mod pessimistic;
mod single_writer;

// Re-export the surface most hosts need
pub use catalog::PartitionMethod;
pub use config::{Concurrency, Config};
pub use engine::{BatchOp, BatchOpResult, KvtEngine};
pub use error::{KvtError, KvtResult};
pub use process::{ProcessInput, ProcessOutput};
pub use storage::{Entry, ScanOutcome, ScanStatus};
