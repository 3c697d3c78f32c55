//! No-CC single-writer strategy
//!
//! At most one transaction is active at a time and writes go straight to
//! storage, so the log and checkpoint machinery can be exercised without
//! concurrency-control overhead. There is no undo: rollback is unsupported
//! and the engine reports it as such; the transaction stays active and must
//! be committed to release the store.
//!
//! One-shot writes are rejected while a transaction is active because no
//! staging area exists to isolate them.

use crate::engine::EngineState;
use crate::error::{KvtError, KvtResult};
use crate::storage::{self, Entry, ScanOutcome, ScanStatus, UNLOCKED};

fn active_blocker(state: &EngineState) -> Option<u64> {
    state.txns.active_ids().first().copied()
}

pub(crate) fn start_check(state: &EngineState) -> KvtResult<()> {
    match active_blocker(state) {
        Some(active) => Err(KvtError::TransactionAlreadyRunning { active }),
        None => Ok(()),
    }
}

pub(crate) fn get(
    state: &EngineState,
    tx_id: u64,
    table_id: u64,
    key: &[u8],
) -> KvtResult<Vec<u8>> {
    if tx_id != 0 {
        state.txns.get(tx_id)?;
    }
    let table = state.catalog.table(table_id)?;
    table
        .data
        .get(key)
        .map(|entry| entry.data.clone())
        .ok_or(KvtError::KeyNotFound)
}

pub(crate) fn set(
    state: &mut EngineState,
    tx_id: u64,
    table_id: u64,
    key: &[u8],
    value: Vec<u8>,
) -> KvtResult<()> {
    state.txns.get(tx_id)?;
    let table = state.catalog.table_mut(table_id)?;
    table.data.insert(key.to_vec(), Entry::new(value, UNLOCKED));
    Ok(())
}

pub(crate) fn del(
    state: &mut EngineState,
    tx_id: u64,
    table_id: u64,
    key: &[u8],
) -> KvtResult<()> {
    state.txns.get(tx_id)?;
    let table = state.catalog.table_mut(table_id)?;
    table.data.remove(key).map(|_| ()).ok_or(KvtError::KeyNotFound)
}

pub(crate) fn scan(
    state: &EngineState,
    tx_id: u64,
    table_id: u64,
    start: &[u8],
    end: Option<&[u8]>,
    limit: u64,
) -> KvtResult<ScanOutcome> {
    if tx_id != 0 {
        state.txns.get(tx_id)?;
    }
    let table = state.catalog.table(table_id)?;
    let mut items = Vec::new();
    let mut status = ScanStatus::Complete;
    for (key, entry) in storage::range(&table.data, start, end) {
        if !storage::within_limit(items.len(), limit) {
            status = ScanStatus::LimitReached;
            break;
        }
        items.push((key.clone(), entry.data.clone()));
    }
    Ok(ScanOutcome { items, status })
}

pub(crate) fn oneshot_set_check(state: &EngineState, table_id: u64) -> KvtResult<()> {
    if !state.txns.is_quiescent() {
        return Err(KvtError::OneShotWriteNotAllowed);
    }
    state.catalog.table(table_id)?;
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
    if !state.txns.is_quiescent() {
        return Err(KvtError::OneShotDeleteNotAllowed);
    }
    let table = state.catalog.table(table_id)?;
    if !table.data.contains_key(key) {
        return Err(KvtError::KeyNotFound);
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
    state.txns.get(tx_id)?;
    Ok(())
}

/// Writes already sit in storage; commit only retires the transaction.
pub(crate) fn commit_apply(state: &mut EngineState, tx_id: u64) -> KvtResult<()> {
    state.txns.remove(tx_id)?;
    Ok(())
}
