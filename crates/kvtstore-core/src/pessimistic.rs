//! Strict two-phase locking
//!
//! The entry metadata word is the lock holder: 0 means unlocked, any other
//! value is the owning transaction id. Locks are exclusive, taken on reads
//! as well as writes, re-entrant for their owner, and held from first
//! acquire until commit or rollback. Conflicts never wait: the operation
//! returns KeyLocked immediately and the transaction must be rolled back.
//!
//! Keys that do not exist yet cannot carry a lock word, so staged writes on
//! absent keys register in a side map of phantom locks with the same
//! conflict rules.

use crate::engine::EngineState;
use crate::error::{KvtError, KvtResult};
use crate::storage::{self, Entry, ScanOutcome, ScanStatus, UNLOCKED, VERSION_ABSENT};
use crate::txn::{LocalEffect, TableKey};

fn lock_word(tx_id: u64) -> i32 {
    tx_id as i32
}

fn holder_of(metadata: i32) -> u64 {
    u64::from(metadata as u32)
}

pub(crate) fn get(
    state: &mut EngineState,
    tx_id: u64,
    table_id: u64,
    key: &[u8],
) -> KvtResult<Vec<u8>> {
    let EngineState { catalog, txns, phantom_locks } = state;

    if tx_id == 0 {
        // an unconflicted one-shot read is an instantaneous acquire-release
        if let Some(&holder) = phantom_locks.get(&(table_id, key.to_vec())) {
            return Err(KvtError::KeyLocked { holder });
        }
        let table = catalog.table(table_id)?;
        let Some(entry) = table.data.get(key) else {
            return Err(KvtError::KeyNotFound);
        };
        if entry.metadata != UNLOCKED {
            return Err(KvtError::KeyLocked { holder: holder_of(entry.metadata) });
        }
        return Ok(entry.data.clone());
    }

    let tx = txns.get_mut(tx_id)?;
    let tkey: TableKey = (table_id, key.to_vec());
    match tx.local_effect(&tkey) {
        Some(LocalEffect::Deleted) => return Err(KvtError::KeyDeleted),
        Some(LocalEffect::Written(value)) => return Ok(value.to_vec()),
        None => {}
    }

    let table = catalog.table_mut(table_id)?;
    match table.data.get_mut(key) {
        Some(entry) => {
            if entry.metadata == UNLOCKED {
                tx.observe(tkey.clone(), Entry::new(entry.data.clone(), UNLOCKED));
                entry.metadata = lock_word(tx_id);
                tx.locks.insert(tkey);
                Ok(entry.data.clone())
            } else if entry.metadata == lock_word(tx_id) {
                tx.observe(tkey, Entry::new(entry.data.clone(), UNLOCKED));
                Ok(entry.data.clone())
            } else {
                tx.poisoned = true;
                Err(KvtError::KeyLocked { holder: holder_of(entry.metadata) })
            }
        }
        None => match phantom_locks.get(&tkey) {
            Some(&holder) if holder != tx_id => {
                tx.poisoned = true;
                Err(KvtError::KeyLocked { holder })
            }
            _ => Err(KvtError::KeyNotFound),
        },
    }
}

pub(crate) fn set(
    state: &mut EngineState,
    tx_id: u64,
    table_id: u64,
    key: &[u8],
    value: Vec<u8>,
) -> KvtResult<()> {
    let EngineState { catalog, txns, phantom_locks } = state;
    let tx = txns.get_mut(tx_id)?;
    let tkey: TableKey = (table_id, key.to_vec());

    // restage: the lock is already ours
    if tx.write_set.contains_key(&tkey) || tx.delete_set.contains(&tkey) {
        tx.stage_write(tkey, value);
        return Ok(());
    }

    let table = catalog.table_mut(table_id)?;
    match table.data.get_mut(key) {
        Some(entry) => {
            if entry.metadata == UNLOCKED {
                tx.observe(tkey.clone(), Entry::new(entry.data.clone(), UNLOCKED));
                entry.metadata = lock_word(tx_id);
                tx.locks.insert(tkey.clone());
                tx.stage_write(tkey, value);
                Ok(())
            } else if entry.metadata == lock_word(tx_id) {
                tx.stage_write(tkey, value);
                Ok(())
            } else {
                tx.poisoned = true;
                Err(KvtError::KeyLocked { holder: holder_of(entry.metadata) })
            }
        }
        None => match phantom_locks.get(&tkey) {
            Some(&holder) if holder != tx_id => {
                tx.poisoned = true;
                Err(KvtError::KeyLocked { holder })
            }
            _ => {
                phantom_locks.insert(tkey.clone(), tx_id);
                tx.observe(tkey.clone(), Entry::new(Vec::new(), VERSION_ABSENT));
                tx.stage_write(tkey, value);
                Ok(())
            }
        },
    }
}

pub(crate) fn del(
    state: &mut EngineState,
    tx_id: u64,
    table_id: u64,
    key: &[u8],
) -> KvtResult<()> {
    let EngineState { catalog, txns, phantom_locks } = state;
    let tx = txns.get_mut(tx_id)?;
    let tkey: TableKey = (table_id, key.to_vec());

    match tx.local_effect(&tkey) {
        Some(LocalEffect::Deleted) => return Err(KvtError::KeyDeleted),
        Some(LocalEffect::Written(_)) => {
            tx.stage_delete(tkey);
            return Ok(());
        }
        None => {}
    }

    let table = catalog.table_mut(table_id)?;
    match table.data.get_mut(key) {
        Some(entry) => {
            if entry.metadata == UNLOCKED {
                tx.observe(tkey.clone(), Entry::new(entry.data.clone(), UNLOCKED));
                entry.metadata = lock_word(tx_id);
                tx.locks.insert(tkey.clone());
                tx.stage_delete(tkey);
                Ok(())
            } else if entry.metadata == lock_word(tx_id) {
                tx.observe(tkey.clone(), Entry::new(entry.data.clone(), UNLOCKED));
                tx.stage_delete(tkey);
                Ok(())
            } else {
                tx.poisoned = true;
                Err(KvtError::KeyLocked { holder: holder_of(entry.metadata) })
            }
        }
        None => match phantom_locks.get(&tkey) {
            Some(&holder) if holder != tx_id => {
                tx.poisoned = true;
                Err(KvtError::KeyLocked { holder })
            }
            _ => Err(KvtError::KeyNotFound),
        },
    }
}

pub(crate) fn scan(
    state: &mut EngineState,
    tx_id: u64,
    table_id: u64,
    start: &[u8],
    end: Option<&[u8]>,
    limit: u64,
) -> KvtResult<ScanOutcome> {
    let EngineState { catalog, txns, phantom_locks: _ } = state;

    if tx_id == 0 {
        let table = catalog.table(table_id)?;
        let mut items = Vec::new();
        let mut status = ScanStatus::Complete;
        for (key, entry) in storage::range(&table.data, start, end) {
            // keys past the limit cutoff are never yielded, so their lock
            // state must not affect the outcome
            if !storage::within_limit(items.len(), limit) {
                status = ScanStatus::LimitReached;
                break;
            }
            if entry.metadata != UNLOCKED {
                return Err(KvtError::KeyLocked { holder: holder_of(entry.metadata) });
            }
            items.push((key.clone(), entry.data.clone()));
        }
        return Ok(ScanOutcome { items, status });
    }

    let tx = txns.get_mut(tx_id)?;
    let table = catalog.table_mut(table_id)?;

    // staged new and overwritten keys of this table within the range
    let mut staged: Vec<(Vec<u8>, Vec<u8>)> = tx
        .write_set
        .iter()
        .filter(|((t, k), _)| {
            *t == table_id
                && k.as_slice() >= start
                && end.map_or(true, |e| k.as_slice() < e)
        })
        .map(|((_, k), v)| (k.clone(), v.clone()))
        .collect();
    staged.sort();

    let mut items: Vec<(Vec<u8>, Vec<u8>)> = Vec::new();
    let mut to_lock: Vec<(Vec<u8>, Vec<u8>)> = Vec::new();
    let mut status = ScanStatus::Complete;

    let mut committed = storage::range(&table.data, start, end).peekable();
    let mut staged = staged.into_iter().peekable();

    loop {
        let staged_first = match (committed.peek(), staged.peek()) {
            (None, None) => break,
            (Some(_), None) => false,
            (None, Some(_)) => true,
            (Some((ck, _)), Some((sk, _))) => sk.as_slice() <= ck.as_slice(),
        };

        if staged_first {
            let Some((sk, sv)) = staged.next() else { break };
            if let Some((ck, _)) = committed.peek() {
                if **ck == sk {
                    committed.next();
                }
            }
            if !storage::within_limit(items.len(), limit) {
                status = ScanStatus::LimitReached;
                break;
            }
            items.push((sk, sv));
        } else {
            let Some((ck, entry)) = committed.next() else { break };
            let tkey: TableKey = (table_id, ck.clone());
            if tx.delete_set.contains(&tkey) {
                continue;
            }
            if !storage::within_limit(items.len(), limit) {
                status = ScanStatus::LimitReached;
                break;
            }
            if entry.metadata == UNLOCKED {
                to_lock.push((ck.clone(), entry.data.clone()));
            } else if entry.metadata != lock_word(tx_id) {
                tx.poisoned = true;
                return Err(KvtError::KeyLocked { holder: holder_of(entry.metadata) });
            }
            items.push((ck.clone(), entry.data.clone()));
        }
    }
    drop(committed);
    drop(staged);

    // every yielded committed key gets locked
    for (key, snapshot) in to_lock {
        if let Some(entry) = table.data.get_mut(&key) {
            entry.metadata = lock_word(tx_id);
        }
        let tkey: TableKey = (table_id, key);
        tx.observe(tkey.clone(), Entry::new(snapshot, UNLOCKED));
        tx.locks.insert(tkey);
    }

    Ok(ScanOutcome { items, status })
}

pub(crate) fn oneshot_set_check(state: &EngineState, table_id: u64, key: &[u8]) -> KvtResult<()> {
    if let Some(&holder) = state.phantom_locks.get(&(table_id, key.to_vec())) {
        return Err(KvtError::KeyLocked { holder });
    }
    let table = state.catalog.table(table_id)?;
    if let Some(entry) = table.data.get(key) {
        if entry.metadata != UNLOCKED {
            return Err(KvtError::KeyLocked { holder: holder_of(entry.metadata) });
        }
    }
    Ok(())
}

pub(crate) fn oneshot_set_apply(
    state: &mut EngineState,
    table_id: u64,
    key: &[u8],
    value: Vec<u8>,
) -> KvtResult<()> {
    let table = state.catalog.table_mut(table_id)?;
    table.data.insert(key.to_vec(), Entry::new(value, UNLOCKED));
    Ok(())
}

pub(crate) fn oneshot_del_check(state: &EngineState, table_id: u64, key: &[u8]) -> KvtResult<()> {
    if let Some(&holder) = state.phantom_locks.get(&(table_id, key.to_vec())) {
        return Err(KvtError::KeyLocked { holder });
    }
    let table = state.catalog.table(table_id)?;
    let Some(entry) = table.data.get(key) else {
        return Err(KvtError::KeyNotFound);
    };
    if entry.metadata != UNLOCKED {
        return Err(KvtError::KeyLocked { holder: holder_of(entry.metadata) });
    }
    Ok(())
}

pub(crate) fn oneshot_del_apply(
    state: &mut EngineState,
    table_id: u64,
    key: &[u8],
) -> KvtResult<()> {
    let table = state.catalog.table_mut(table_id)?;
    table.data.remove(key);
    Ok(())
}

pub(crate) fn commit_check(state: &EngineState, tx_id: u64) -> KvtResult<()> {
    let tx = state.txns.get(tx_id)?;
    if tx.poisoned {
        return Err(KvtError::TransactionPoisoned { tx_id });
    }
    Ok(())
}

/// Apply the staged sets in key order, then release every lock the
/// transaction holds.
pub(crate) fn commit_apply(state: &mut EngineState, tx_id: u64) -> KvtResult<()> {
    let mut tx = state.txns.remove(tx_id)?;

    let mut writes: Vec<(TableKey, Vec<u8>)> = tx.write_set.drain().collect();
    writes.sort_by(|a, b| a.0.cmp(&b.0));
    for ((table_id, key), value) in writes {
        if let Ok(table) = state.catalog.table_mut(table_id) {
            table.data.insert(key, Entry::new(value, UNLOCKED));
        }
    }

    let mut deletes: Vec<TableKey> = tx.delete_set.drain().collect();
    deletes.sort();
    for (table_id, key) in deletes {
        if let Ok(table) = state.catalog.table_mut(table_id) {
            table.data.remove(&key);
        }
    }

    release_locks(state, &mut tx);
    Ok(())
}

/// Discard the staged sets and release every lock.
pub(crate) fn rollback_apply(state: &mut EngineState, tx_id: u64) -> KvtResult<()> {
    let mut tx = state.txns.remove(tx_id)?;
    release_locks(state, &mut tx);
    Ok(())
}

fn release_locks(state: &mut EngineState, tx: &mut crate::txn::Transaction) {
    let word = lock_word(tx.id);
    for (table_id, key) in tx.locks.drain() {
        if let Ok(table) = state.catalog.table_mut(table_id) {
            if let Some(entry) = table.data.get_mut(&key) {
                if entry.metadata == word {
                    entry.metadata = UNLOCKED;
                }
            }
        }
    }
    state.phantom_locks.retain(|_, holder| *holder != tx.id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::PartitionMethod;

    fn state_with_data() -> (EngineState, u64) {
        let mut state = EngineState::new();
        let table_id = state.catalog.create_table("t", PartitionMethod::Range).unwrap();
        let table = state.catalog.table_mut(table_id).unwrap();
        table.data.insert(b"a".to_vec(), Entry::new(b"1".to_vec(), UNLOCKED));
        table.data.insert(b"b".to_vec(), Entry::new(b"2".to_vec(), UNLOCKED));
        (state, table_id)
    }

    #[test]
    fn test_get_takes_exclusive_lock() {
        let (mut state, table_id) = state_with_data();
        let tx = state.txns.begin();

        assert_eq!(get(&mut state, tx, table_id, b"a").unwrap(), b"1");
        let meta = state.catalog.table(table_id).unwrap().data[&b"a".to_vec()].metadata;
        assert_eq!(meta, tx as i32);

        // re-entrant for the owner
        assert_eq!(get(&mut state, tx, table_id, b"a").unwrap(), b"1");

        // another transaction conflicts immediately
        let other = state.txns.begin();
        assert!(matches!(
            get(&mut state, other, table_id, b"a"),
            Err(KvtError::KeyLocked { holder }) if holder == tx
        ));
        assert!(state.txns.get(other).unwrap().poisoned);
    }

    #[test]
    fn test_read_your_writes_and_deletes() {
        let (mut state, table_id) = state_with_data();
        let tx = state.txns.begin();

        set(&mut state, tx, table_id, b"a", b"new".to_vec()).unwrap();
        assert_eq!(get(&mut state, tx, table_id, b"a").unwrap(), b"new");
        // committed store untouched while staged
        let stored = &state.catalog.table(table_id).unwrap().data[&b"a".to_vec()];
        assert_eq!(stored.data, b"1");

        del(&mut state, tx, table_id, b"a").unwrap();
        assert!(matches!(get(&mut state, tx, table_id, b"a"), Err(KvtError::KeyDeleted)));
        assert!(matches!(del(&mut state, tx, table_id, b"a"), Err(KvtError::KeyDeleted)));
    }

    #[test]
    fn test_absent_key_write_uses_phantom_lock() {
        let (mut state, table_id) = state_with_data();
        let tx = state.txns.begin();

        set(&mut state, tx, table_id, b"new", b"x".to_vec()).unwrap();
        assert_eq!(state.phantom_locks.get(&(table_id, b"new".to_vec())), Some(&tx));

        let other = state.txns.begin();
        assert!(matches!(
            set(&mut state, other, table_id, b"new", b"y".to_vec()),
            Err(KvtError::KeyLocked { holder }) if holder == tx
        ));
        assert!(matches!(
            get(&mut state, other, table_id, b"new"),
            Err(KvtError::KeyLocked { .. })
        ));

        rollback_apply(&mut state, tx).unwrap();
        assert!(state.phantom_locks.is_empty());
        // rolled back: the key never existed
        assert!(matches!(get(&mut state, 0, table_id, b"new"), Err(KvtError::KeyNotFound)));
    }

    #[test]
    fn test_commit_applies_in_key_order_and_releases() {
        let (mut state, table_id) = state_with_data();
        let tx = state.txns.begin();

        set(&mut state, tx, table_id, b"c", b"3".to_vec()).unwrap();
        set(&mut state, tx, table_id, b"a", b"one".to_vec()).unwrap();
        del(&mut state, tx, table_id, b"b").unwrap();

        commit_check(&state, tx).unwrap();
        commit_apply(&mut state, tx).unwrap();

        let table = state.catalog.table(table_id).unwrap();
        assert_eq!(table.data[&b"a".to_vec()], Entry::new(b"one".to_vec(), UNLOCKED));
        assert_eq!(table.data[&b"c".to_vec()], Entry::new(b"3".to_vec(), UNLOCKED));
        assert!(!table.data.contains_key(&b"b".to_vec()));
        assert!(state.phantom_locks.is_empty());
        assert!(state.txns.is_quiescent());
    }

    #[test]
    fn test_rollback_releases_get_locks() {
        let (mut state, table_id) = state_with_data();
        let tx = state.txns.begin();
        get(&mut state, tx, table_id, b"a").unwrap();

        rollback_apply(&mut state, tx).unwrap();
        let meta = state.catalog.table(table_id).unwrap().data[&b"a".to_vec()].metadata;
        assert_eq!(meta, UNLOCKED);
    }

    #[test]
    fn test_poisoned_commit_rejected() {
        let (mut state, table_id) = state_with_data();
        let tx = state.txns.begin();
        let other = state.txns.begin();
        get(&mut state, tx, table_id, b"a").unwrap();
        let _ = set(&mut state, other, table_id, b"a", b"x".to_vec());

        assert!(matches!(
            commit_check(&state, other),
            Err(KvtError::TransactionPoisoned { tx_id }) if tx_id == other
        ));
        rollback_apply(&mut state, other).unwrap();
    }

    #[test]
    fn test_scan_locks_every_yielded_key() {
        let (mut state, table_id) = state_with_data();
        let tx = state.txns.begin();

        let outcome = scan(&mut state, tx, table_id, b"", None, 0).unwrap();
        assert_eq!(outcome.items.len(), 2);

        let table = state.catalog.table(table_id).unwrap();
        assert_eq!(table.data[&b"a".to_vec()].metadata, tx as i32);
        assert_eq!(table.data[&b"b".to_vec()].metadata, tx as i32);
    }

    #[test]
    fn test_scan_overlays_writes_and_skips_deletes() {
        let (mut state, table_id) = state_with_data();
        let tx = state.txns.begin();

        set(&mut state, tx, table_id, b"ab", b"mid".to_vec()).unwrap();
        set(&mut state, tx, table_id, b"a", b"changed".to_vec()).unwrap();
        del(&mut state, tx, table_id, b"b").unwrap();

        let outcome = scan(&mut state, tx, table_id, b"", None, 0).unwrap();
        assert_eq!(
            outcome.items,
            vec![
                (b"a".to_vec(), b"changed".to_vec()),
                (b"ab".to_vec(), b"mid".to_vec()),
            ]
        );
        assert_eq!(outcome.status, ScanStatus::Complete);
    }

    #[test]
    fn test_oneshot_scan_ignores_locks_past_the_limit() {
        let (mut state, table_id) = state_with_data();
        let tx = state.txns.begin();
        get(&mut state, tx, table_id, b"b").unwrap(); // locks "b"

        // "b" sits beyond the cutoff, so the scan truncates instead of
        // failing with KeyLocked
        let outcome = scan(&mut state, 0, table_id, b"", None, 1).unwrap();
        assert_eq!(outcome.items, vec![(b"a".to_vec(), b"1".to_vec())]);
        assert_eq!(outcome.status, ScanStatus::LimitReached);

        // with the limit lifted the lock conflicts as usual
        assert!(matches!(
            scan(&mut state, 0, table_id, b"", None, 0),
            Err(KvtError::KeyLocked { holder }) if holder == tx
        ));
    }

    #[test]
    fn test_scan_conflicts_with_foreign_lock() {
        let (mut state, table_id) = state_with_data();
        let tx = state.txns.begin();
        get(&mut state, tx, table_id, b"b").unwrap();

        let other = state.txns.begin();
        assert!(matches!(
            scan(&mut state, other, table_id, b"", None, 0),
            Err(KvtError::KeyLocked { holder }) if holder == tx
        ));
    }

    #[test]
    fn test_oneshot_conflicts_and_applies() {
        let (mut state, table_id) = state_with_data();

        oneshot_set_check(&state, table_id, b"a").unwrap();
        oneshot_set_apply(&mut state, table_id, b"a", b"direct".to_vec()).unwrap();
        assert_eq!(get(&mut state, 0, table_id, b"a").unwrap(), b"direct");

        let tx = state.txns.begin();
        get(&mut state, tx, table_id, b"a").unwrap();
        assert!(matches!(
            oneshot_set_check(&state, table_id, b"a"),
            Err(KvtError::KeyLocked { .. })
        ));
        assert!(matches!(
            oneshot_del_check(&state, table_id, b"a"),
            Err(KvtError::KeyLocked { .. })
        ));
    }
}
