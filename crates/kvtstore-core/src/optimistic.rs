//! Optimistic concurrency control
//!
//! Entry metadata is a monotonically increasing version number; -1 marks a
//! tombstone kept so concurrent readers can still validate. Reads snapshot
//! the observed version into the transaction's read set, writes and deletes
//! stage locally, and commit validates every observed version against the
//! store under the engine's commit latch before applying.
//!
//! The stored version of a mutated key becomes
//! `max(prior version, observed version) + 1`, counting absent keys and
//! tombstones as -1.

use crate::engine::EngineState;
use crate::error::{KvtError, KvtResult};
use crate::storage::{self, Entry, ScanOutcome, ScanStatus, TOMBSTONE, VERSION_ABSENT};
use crate::txn::{LocalEffect, TableKey};

/// Version arithmetic treats the absent sentinel like a tombstone.
fn effective(version: i32) -> i32 {
    if version == VERSION_ABSENT {
        TOMBSTONE
    } else {
        version
    }
}

pub(crate) fn get(
    state: &mut EngineState,
    tx_id: u64,
    table_id: u64,
    key: &[u8],
) -> KvtResult<Vec<u8>> {
    if tx_id == 0 {
        let table = state.catalog.table(table_id)?;
        return match table.data.get(key) {
            Some(entry) if !entry.is_tombstone() => Ok(entry.data.clone()),
            _ => Err(KvtError::KeyNotFound),
        };
    }

    let EngineState { catalog, txns, .. } = state;
    let tx = txns.get_mut(tx_id)?;
    let tkey: TableKey = (table_id, key.to_vec());
    match tx.local_effect(&tkey) {
        Some(LocalEffect::Deleted) => return Err(KvtError::KeyDeleted),
        Some(LocalEffect::Written(value)) => return Ok(value.to_vec()),
        None => {}
    }

    let table = catalog.table(table_id)?;
    match table.data.get(key) {
        Some(entry) if entry.is_tombstone() => {
            tx.observe(tkey, Entry::new(Vec::new(), TOMBSTONE));
            Err(KvtError::KeyNotFound)
        }
        Some(entry) => {
            tx.observe(tkey, entry.clone());
            Ok(entry.data.clone())
        }
        None => {
            tx.observe(tkey, Entry::new(Vec::new(), VERSION_ABSENT));
            Err(KvtError::KeyNotFound)
        }
    }
}

pub(crate) fn set(
    state: &mut EngineState,
    tx_id: u64,
    table_id: u64,
    key: &[u8],
    value: Vec<u8>,
) -> KvtResult<()> {
    let EngineState { catalog, txns, .. } = state;
    let tx = txns.get_mut(tx_id)?;
    let table = catalog.table(table_id)?;
    let tkey: TableKey = (table_id, key.to_vec());

    let snapshot = match table.data.get(key) {
        Some(entry) => entry.clone(),
        None => Entry::new(Vec::new(), VERSION_ABSENT),
    };
    tx.observe(tkey.clone(), snapshot);
    tx.stage_write(tkey, value);
    Ok(())
}

pub(crate) fn del(
    state: &mut EngineState,
    tx_id: u64,
    table_id: u64,
    key: &[u8],
) -> KvtResult<()> {
    let EngineState { catalog, txns, .. } = state;
    let tx = txns.get_mut(tx_id)?;
    let table = catalog.table(table_id)?;
    let tkey: TableKey = (table_id, key.to_vec());

    match tx.local_effect(&tkey) {
        Some(LocalEffect::Deleted) => return Err(KvtError::KeyDeleted),
        Some(LocalEffect::Written(_)) => {
            tx.stage_delete(tkey);
            return Ok(());
        }
        None => {}
    }

    match table.data.get(key) {
        Some(entry) if !entry.is_tombstone() => {
            tx.observe(tkey.clone(), entry.clone());
            tx.stage_delete(tkey);
            Ok(())
        }
        _ => Err(KvtError::KeyNotFound),
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
    if tx_id == 0 {
        let table = state.catalog.table(table_id)?;
        let mut items = Vec::new();
        let mut status = ScanStatus::Complete;
        for (key, entry) in storage::range(&table.data, start, end) {
            if entry.is_tombstone() {
                continue;
            }
            if !storage::within_limit(items.len(), limit) {
                status = ScanStatus::LimitReached;
                break;
            }
            items.push((key.clone(), entry.data.clone()));
        }
        return Ok(ScanOutcome { items, status });
    }

    let EngineState { catalog, txns, .. } = state;
    let tx = txns.get_mut(tx_id)?;
    let table = catalog.table(table_id)?;

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
    let mut observed: Vec<(Vec<u8>, Entry)> = Vec::new();
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
            if entry.is_tombstone() {
                observed.push((ck.clone(), Entry::new(Vec::new(), TOMBSTONE)));
                continue;
            }
            if !storage::within_limit(items.len(), limit) {
                status = ScanStatus::LimitReached;
                break;
            }
            observed.push((ck.clone(), entry.clone()));
            items.push((ck.clone(), entry.data.clone()));
        }
    }

    for (key, snapshot) in observed {
        tx.observe((table_id, key), snapshot);
    }

    Ok(ScanOutcome { items, status })
}

pub(crate) fn oneshot_set_check(state: &EngineState, table_id: u64) -> KvtResult<()> {
    state.catalog.table(table_id)?;
    Ok(())
}

/// One-shot set: a trivially valid commit under the commit latch.
pub(crate) fn oneshot_set_apply(
    state: &mut EngineState,
    table_id: u64,
    key: &[u8],
    value: Vec<u8>,
) -> KvtResult<()> {
    let table = state.catalog.table_mut(table_id)?;
    let prior = table.data.get(key).map(|e| e.metadata).unwrap_or(VERSION_ABSENT);
    table
        .data
        .insert(key.to_vec(), Entry::new(value, effective(prior) + 1));
    Ok(())
}

pub(crate) fn oneshot_del_check(state: &EngineState, table_id: u64, key: &[u8]) -> KvtResult<()> {
    let table = state.catalog.table(table_id)?;
    match table.data.get(key) {
        Some(entry) if !entry.is_tombstone() => Ok(()),
        _ => Err(KvtError::KeyNotFound),
    }
}

pub(crate) fn oneshot_del_apply(
    state: &mut EngineState,
    table_id: u64,
    key: &[u8],
) -> KvtResult<()> {
    let table = state.catalog.table_mut(table_id)?;
    if let Some(entry) = table.data.get_mut(key) {
        entry.metadata = TOMBSTONE;
        entry.data.clear();
    }
    Ok(())
}

/// Validate the read set under the commit latch: every observed version
/// must still be the stored version.
pub(crate) fn commit_check(state: &mut EngineState, tx_id: u64) -> KvtResult<()> {
    let tx = state.txns.get(tx_id)?;
    if tx.poisoned {
        return Err(KvtError::TransactionPoisoned { tx_id });
    }

    let mut stale = false;
    for ((table_id, key), snapshot) in &tx.read_set {
        let current = state
            .catalog
            .table(*table_id)
            .ok()
            .and_then(|table| table.data.get(key))
            .map(|entry| entry.metadata)
            .unwrap_or(VERSION_ABSENT);
        if current != snapshot.metadata {
            stale = true;
            break;
        }
    }

    if stale {
        state.txns.get_mut(tx_id)?.poisoned = true;
        return Err(KvtError::StaleData);
    }
    Ok(())
}

/// Apply writes then deletes in key order, bumping versions past everything
/// the transaction observed.
pub(crate) fn commit_apply(state: &mut EngineState, tx_id: u64) -> KvtResult<()> {
    let mut tx = state.txns.remove(tx_id)?;

    let mut writes: Vec<(TableKey, Vec<u8>)> = tx.write_set.drain().collect();
    writes.sort_by(|a, b| a.0.cmp(&b.0));
    for ((table_id, key), value) in writes {
        let Ok(table) = state.catalog.table_mut(table_id) else {
            continue; // table dropped mid-transaction
        };
        let observed = tx
            .read_set
            .get(&(table_id, key.clone()))
            .map(|e| e.metadata)
            .unwrap_or(VERSION_ABSENT);
        let prior = table.data.get(&key).map(|e| e.metadata).unwrap_or(VERSION_ABSENT);
        let next = effective(prior).max(effective(observed)) + 1;
        table.data.insert(key, Entry::new(value, next));
    }

    let mut deletes: Vec<TableKey> = tx.delete_set.drain().collect();
    deletes.sort();
    for (table_id, key) in deletes {
        let Ok(table) = state.catalog.table_mut(table_id) else {
            continue;
        };
        match table.data.get_mut(&key) {
            Some(entry) => {
                entry.metadata = TOMBSTONE;
                entry.data.clear();
            }
            None => {
                table.data.insert(key, Entry::new(Vec::new(), TOMBSTONE));
            }
        }
    }

    Ok(())
}

/// Aborted transactions leave no trace in global state.
pub(crate) fn rollback_apply(state: &mut EngineState, tx_id: u64) -> KvtResult<()> {
    state.txns.remove(tx_id)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::PartitionMethod;

    fn state_with_data() -> (EngineState, u64) {
        let mut state = EngineState::new();
        let table_id = state.catalog.create_table("t", PartitionMethod::Range).unwrap();
        let table = state.catalog.table_mut(table_id).unwrap();
        table.data.insert(b"a".to_vec(), Entry::new(b"1".to_vec(), 0));
        table.data.insert(b"b".to_vec(), Entry::new(b"2".to_vec(), 3));
        (state, table_id)
    }

    #[test]
    fn test_get_snapshots_version() {
        let (mut state, table_id) = state_with_data();
        let tx = state.txns.begin();

        assert_eq!(get(&mut state, tx, table_id, b"b").unwrap(), b"2");
        let snap = &state.txns.get(tx).unwrap().read_set[&(table_id, b"b".to_vec())];
        assert_eq!(snap.metadata, 3);

        assert!(matches!(get(&mut state, tx, table_id, b"nope"), Err(KvtError::KeyNotFound)));
        let snap = &state.txns.get(tx).unwrap().read_set[&(table_id, b"nope".to_vec())];
        assert_eq!(snap.metadata, VERSION_ABSENT);
    }

    #[test]
    fn test_first_committer_wins() {
        let (mut state, table_id) = state_with_data();
        let tx1 = state.txns.begin();
        let tx2 = state.txns.begin();

        // both observe the key absent, both write it
        let _ = get(&mut state, tx1, table_id, b"y");
        let _ = get(&mut state, tx2, table_id, b"y");
        set(&mut state, tx1, table_id, b"y", b"first".to_vec()).unwrap();
        set(&mut state, tx2, table_id, b"y", b"second".to_vec()).unwrap();

        commit_check(&mut state, tx1).unwrap();
        commit_apply(&mut state, tx1).unwrap();

        // the loser validates against the now-present version
        assert!(matches!(commit_check(&mut state, tx2), Err(KvtError::StaleData)));
        assert!(state.txns.get(tx2).unwrap().poisoned);
        // a retried commit is refused outright
        assert!(matches!(
            commit_check(&mut state, tx2),
            Err(KvtError::TransactionPoisoned { tx_id }) if tx_id == tx2
        ));
        rollback_apply(&mut state, tx2).unwrap();

        assert_eq!(get(&mut state, 0, table_id, b"y").unwrap(), b"first");
    }

    #[test]
    fn test_versions_bump_past_observations() {
        let (mut state, table_id) = state_with_data();
        let tx = state.txns.begin();

        set(&mut state, tx, table_id, b"b", b"new".to_vec()).unwrap();
        commit_check(&mut state, tx).unwrap();
        commit_apply(&mut state, tx).unwrap();

        let entry = &state.catalog.table(table_id).unwrap().data[&b"b".to_vec()];
        assert_eq!(entry.metadata, 4);
        assert_eq!(entry.data, b"new");
    }

    #[test]
    fn test_delete_leaves_tombstone() {
        let (mut state, table_id) = state_with_data();
        let tx = state.txns.begin();

        del(&mut state, tx, table_id, b"a").unwrap();
        assert!(matches!(get(&mut state, tx, table_id, b"a"), Err(KvtError::KeyDeleted)));
        commit_check(&mut state, tx).unwrap();
        commit_apply(&mut state, tx).unwrap();

        // tombstone retained with cleared data
        let entry = &state.catalog.table(table_id).unwrap().data[&b"a".to_vec()];
        assert!(entry.is_tombstone());
        assert!(entry.data.is_empty());
        assert!(matches!(get(&mut state, 0, table_id, b"a"), Err(KvtError::KeyNotFound)));
    }

    #[test]
    fn test_reader_of_deleted_key_goes_stale() {
        let (mut state, table_id) = state_with_data();
        let reader = state.txns.begin();
        get(&mut state, reader, table_id, b"a").unwrap();

        let deleter = state.txns.begin();
        del(&mut state, deleter, table_id, b"a").unwrap();
        commit_check(&mut state, deleter).unwrap();
        commit_apply(&mut state, deleter).unwrap();

        set(&mut state, reader, table_id, b"other", b"x".to_vec()).unwrap();
        assert!(matches!(commit_check(&mut state, reader), Err(KvtError::StaleData)));
    }

    #[test]
    fn test_write_after_tombstone_bumps_past_observed() {
        let (mut state, table_id) = state_with_data();

        // observe version 3, then the key gets tombstoned by someone else
        let tx = state.txns.begin();
        get(&mut state, tx, table_id, b"b").unwrap();
        set(&mut state, tx, table_id, b"b", b"mine".to_vec()).unwrap();

        oneshot_del_apply(&mut state, table_id, b"b").unwrap();

        // validation catches the tombstone
        assert!(matches!(commit_check(&mut state, tx), Err(KvtError::StaleData)));
        rollback_apply(&mut state, tx).unwrap();

        // a fresh writer that observed the tombstone resurrects the key
        let tx = state.txns.begin();
        let _ = get(&mut state, tx, table_id, b"b");
        set(&mut state, tx, table_id, b"b", b"back".to_vec()).unwrap();
        commit_check(&mut state, tx).unwrap();
        commit_apply(&mut state, tx).unwrap();

        let entry = &state.catalog.table(table_id).unwrap().data[&b"b".to_vec()];
        assert_eq!(entry.data, b"back");
        assert_eq!(entry.metadata, 0); // max(-1, -1) + 1
    }

    #[test]
    fn test_set_then_del_then_set_keeps_sets_disjoint() {
        let (mut state, table_id) = state_with_data();
        let tx = state.txns.begin();

        set(&mut state, tx, table_id, b"k", b"v1".to_vec()).unwrap();
        del(&mut state, tx, table_id, b"k").unwrap();
        set(&mut state, tx, table_id, b"k", b"v2".to_vec()).unwrap();

        let record = state.txns.get(tx).unwrap();
        record.verify_invariants().unwrap();
        assert_eq!(get(&mut state, tx, table_id, b"k").unwrap(), b"v2");
    }

    #[test]
    fn test_scan_overlay_and_tombstones() {
        let (mut state, table_id) = state_with_data();
        oneshot_del_apply(&mut state, table_id, b"a").unwrap(); // tombstone

        let tx = state.txns.begin();
        set(&mut state, tx, table_id, b"c", b"staged".to_vec()).unwrap();

        let outcome = scan(&mut state, tx, table_id, b"", None, 0).unwrap();
        assert_eq!(
            outcome.items,
            vec![(b"b".to_vec(), b"2".to_vec()), (b"c".to_vec(), b"staged".to_vec())]
        );

        // the tombstone was visited and its version observed
        let record = state.txns.get(tx).unwrap();
        assert_eq!(record.read_set[&(table_id, b"a".to_vec())].metadata, TOMBSTONE);
    }

    #[test]
    fn test_scan_under_limit_validates_visited_only() {
        let (mut state, table_id) = state_with_data();
        let tx = state.txns.begin();

        let outcome = scan(&mut state, tx, table_id, b"", None, 1).unwrap();
        assert_eq!(outcome.items, vec![(b"a".to_vec(), b"1".to_vec())]);
        assert!(outcome.limit_reached());

        // "b" was beyond the cutoff: mutating it elsewhere must not stale us
        oneshot_set_apply(&mut state, table_id, b"b", b"other".to_vec()).unwrap();
        commit_check(&mut state, tx).unwrap();
    }

    #[test]
    fn test_rollback_has_no_side_effects() {
        let (mut state, table_id) = state_with_data();
        let before = state.catalog.table(table_id).unwrap().data.clone();

        let tx = state.txns.begin();
        set(&mut state, tx, table_id, b"a", b"dirty".to_vec()).unwrap();
        del(&mut state, tx, table_id, b"b").unwrap();
        rollback_apply(&mut state, tx).unwrap();

        assert_eq!(state.catalog.table(table_id).unwrap().data, before);
        assert!(state.txns.is_quiescent());
    }
}
