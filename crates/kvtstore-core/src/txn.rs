//! Transaction records and the active-transaction registry
//!
//! A transaction stages its effects in three sets keyed by (table id, key):
//! the read set holds entry snapshots for validation and locking discipline,
//! the write set holds staged values, the delete set marks staged deletes.
//! A key never sits in the write and delete set at once: staging one removes
//! the other.

use hashbrown::{HashMap, HashSet};

use crate::error::{KvtError, KvtResult};
use crate::storage::Entry;

/// A key qualified by its table id.
pub type TableKey = (u64, Vec<u8>);

/// A transaction-local view of one key.
pub enum LocalEffect<'a> {
    /// The transaction staged this value.
    Written(&'a [u8]),
    /// The transaction staged a delete.
    Deleted,
}

/// One active transaction.
#[derive(Debug)]
pub struct Transaction {
    pub id: u64,
    /// Entry snapshots taken at read time. For keys that were absent the
    /// snapshot metadata is `VERSION_ABSENT`.
    pub read_set: HashMap<TableKey, Entry>,
    /// Staged writes: key -> new value bytes.
    pub write_set: HashMap<TableKey, Vec<u8>>,
    /// Staged deletes.
    pub delete_set: HashSet<TableKey>,
    /// 2PL: keys whose stored entry metadata this transaction holds.
    pub locks: HashSet<TableKey>,
    /// Set after a conflict (KeyLocked / StaleData); the only legal next
    /// step is rollback.
    pub poisoned: bool,
}

impl Transaction {
    fn new(id: u64) -> Self {
        Self {
            id,
            read_set: HashMap::new(),
            write_set: HashMap::new(),
            delete_set: HashSet::new(),
            locks: HashSet::new(),
            poisoned: false,
        }
    }

    /// Stage a write; clears any staged delete on the same key.
    pub fn stage_write(&mut self, key: TableKey, value: Vec<u8>) {
        self.delete_set.remove(&key);
        self.write_set.insert(key, value);
    }

    /// Stage a delete; clears any staged write on the same key.
    pub fn stage_delete(&mut self, key: TableKey) {
        self.write_set.remove(&key);
        self.delete_set.insert(key);
    }

    /// The transaction-local effect for a key, if any.
    pub fn local_effect(&self, key: &TableKey) -> Option<LocalEffect<'_>> {
        if self.delete_set.contains(key) {
            return Some(LocalEffect::Deleted);
        }
        self.write_set.get(key).map(|v| LocalEffect::Written(v))
    }

    /// Record an observed entry snapshot the first time a key is read.
    pub fn observe(&mut self, key: TableKey, snapshot: Entry) {
        self.read_set.entry(key).or_insert(snapshot);
    }

    /// Structural invariants, checked when the sanity level asks for it.
    pub fn verify_invariants(&self) -> Result<(), String> {
        for key in &self.delete_set {
            if self.write_set.contains_key(key) {
                return Err(format!(
                    "transaction {}: key in both write and delete set",
                    self.id
                ));
            }
            if !self.read_set.contains_key(key) {
                return Err(format!(
                    "transaction {}: deleted key missing from read set",
                    self.id
                ));
            }
        }
        Ok(())
    }
}

/// Registry of active transactions and the dense id counter. Id 0 is
/// reserved for auto-commit and never allocated.
#[derive(Debug)]
pub struct TxnRegistry {
    active: HashMap<u64, Transaction>,
    next_tx_id: u64,
}

impl TxnRegistry {
    pub fn new() -> Self {
        Self { active: HashMap::new(), next_tx_id: 1 }
    }

    /// Begin a transaction with the next dense id.
    pub fn begin(&mut self) -> u64 {
        let id = self.next_tx_id;
        self.next_tx_id += 1;
        self.active.insert(id, Transaction::new(id));
        id
    }

    /// Begin a transaction with a known id (log replay). Keeps the counter
    /// ahead of every id ever seen.
    pub fn begin_with_id(&mut self, id: u64) {
        if id >= self.next_tx_id {
            self.next_tx_id = id + 1;
        }
        self.active.insert(id, Transaction::new(id));
    }

    pub fn get(&self, tx_id: u64) -> KvtResult<&Transaction> {
        self.active.get(&tx_id).ok_or(KvtError::TransactionNotFound { tx_id })
    }

    pub fn get_mut(&mut self, tx_id: u64) -> KvtResult<&mut Transaction> {
        self.active.get_mut(&tx_id).ok_or(KvtError::TransactionNotFound { tx_id })
    }

    pub fn remove(&mut self, tx_id: u64) -> KvtResult<Transaction> {
        self.active.remove(&tx_id).ok_or(KvtError::TransactionNotFound { tx_id })
    }

    pub fn contains(&self, tx_id: u64) -> bool {
        self.active.contains_key(&tx_id)
    }

    pub fn is_quiescent(&self) -> bool {
        self.active.is_empty()
    }

    /// Id of the single active transaction, if exactly one is running.
    pub fn sole_active(&self) -> Option<u64> {
        if self.active.len() == 1 {
            self.active.keys().next().copied()
        } else {
            None
        }
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    /// Ids of every active transaction, in ascending order.
    pub fn active_ids(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.active.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn next_tx_id(&self) -> u64 {
        self.next_tx_id
    }

    /// Restore the counter from a snapshot header.
    pub fn set_next_tx_id(&mut self, next: u64) {
        self.next_tx_id = next.max(1);
    }
}

impl Default for TxnRegistry {
    fn default() -> Self {
        Self::new()
    }
}
