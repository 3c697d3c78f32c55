//! Callback-driven value transformation
//!
//! `process_one` applies a user callback to a single value; `range_process`
//! walks a key range in chunks and applies the callback to every entry,
//! with `range_first`/`range_last` flags so aggregation callbacks can
//! initialize and finalize an accumulator carried in their own state.
//!
//! Callbacks mutate exactly one entry through the output sink and must not
//! call back into the store; re-entry is undefined and unsupported.
//! Everything runs under the caller's transaction, composed from the
//! engine's get/set/del primitives, so a rolled-back transaction discards
//! every callback effect.

use crate::engine::{EngineState, KvtEngine};
use crate::error::{KvtError, KvtResult};
use crate::storage::key_successor;

/// Rows fetched per scan chunk during a range walk.
const CHUNK_ROWS: u64 = 128;

/// Read-only view handed to a process callback.
pub struct ProcessInput<'a> {
    /// Key under transformation; None on the final aggregation call.
    pub key: Option<&'a [u8]>,
    /// Current value; None on the final aggregation call.
    pub value: Option<&'a [u8]>,
    /// Caller-supplied parameter, also the natural home for accumulator
    /// state across a range walk.
    pub parameter: &'a [u8],
    /// True exactly on the first invocation of the whole operation.
    pub range_first: bool,
    /// True on the final invocation issued after the range is exhausted.
    pub range_last: bool,
}

/// Output sink filled by a process callback.
#[derive(Default)]
pub struct ProcessOutput {
    /// Replacement value to write back, if any.
    pub update_value: Option<Vec<u8>>,
    /// Delete the key instead. Mutually exclusive with `update_value`.
    pub delete_key: bool,
    /// Value surfaced to the caller; on failure, the error message.
    pub return_value: Option<Vec<u8>>,
}

/// Run the callback once and police its output contract.
fn invoke<F>(func: &mut F, input: &ProcessInput<'_>) -> KvtResult<ProcessOutput>
where
    F: FnMut(&ProcessInput<'_>, &mut ProcessOutput) -> bool,
{
    let mut output = ProcessOutput::default();
    if !func(input, &mut output) {
        let message = match output.return_value {
            Some(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            None => "process callback failed".to_string(),
        };
        return Err(KvtError::ExtFuncError { message });
    }
    if output.update_value.is_some() && output.delete_key {
        return Err(KvtError::ExtFuncError {
            message: "callback produced both an updated value and a delete".into(),
        });
    }
    Ok(output)
}

/// Transform one key. The callback never runs for an absent key.
pub(crate) fn process_one<F>(
    engine: &KvtEngine,
    state: &mut EngineState,
    tx_id: u64,
    table_id: u64,
    key: &[u8],
    func: &mut F,
    parameter: &[u8],
) -> KvtResult<Vec<u8>>
where
    F: FnMut(&ProcessInput<'_>, &mut ProcessOutput) -> bool,
{
    let value = engine.op_get(state, tx_id, table_id, key)?;

    let input = ProcessInput {
        key: Some(key),
        value: Some(&value),
        parameter,
        range_first: false,
        range_last: false,
    };
    let output = invoke(func, &input)?;

    if let Some(new_value) = output.update_value {
        engine.op_set(state, tx_id, table_id, key, new_value)?;
    } else if output.delete_key {
        engine.op_del(state, tx_id, table_id, key)?;
    }

    Ok(output.return_value.unwrap_or_default())
}

/// Walk `[key_start, key_end)` applying the callback to every entry, at
/// most `limit` of them (0 = unlimited). Returns one (key, return value)
/// pair per callback that produced a return value; the final aggregation
/// invocation contributes an entry with an empty key.
pub(crate) fn range_process<F>(
    engine: &KvtEngine,
    state: &mut EngineState,
    tx_id: u64,
    table_id: u64,
    key_start: &[u8],
    key_end: Option<&[u8]>,
    limit: u64,
    func: &mut F,
    parameter: &[u8],
) -> KvtResult<Vec<(Vec<u8>, Vec<u8>)>>
where
    F: FnMut(&ProcessInput<'_>, &mut ProcessOutput) -> bool,
{
    let mut results = Vec::new();
    let mut first = true;
    let mut processed = 0u64;
    let mut cursor = key_start.to_vec();

    loop {
        let chunk = if limit == 0 {
            CHUNK_ROWS
        } else {
            CHUNK_ROWS.min(limit - processed)
        };
        if chunk == 0 {
            break;
        }

        let outcome = engine.op_scan(state, tx_id, table_id, &cursor, key_end, chunk)?;
        let row_count = outcome.items.len();

        for (key, value) in &outcome.items {
            let input = ProcessInput {
                key: Some(key),
                value: Some(value),
                parameter,
                range_first: first,
                range_last: false,
            };
            first = false;
            let output = invoke(func, &input)?;

            if let Some(new_value) = output.update_value {
                engine.op_set(state, tx_id, table_id, key, new_value)?;
            } else if output.delete_key {
                engine.op_del(state, tx_id, table_id, key)?;
            }
            if let Some(rv) = output.return_value {
                results.push((key.clone(), rv));
            }
            processed += 1;
        }

        if (row_count as u64) < chunk {
            break; // range exhausted
        }
        if limit != 0 && processed >= limit {
            break;
        }
        match outcome.items.last() {
            Some((last_key, _)) => cursor = key_successor(last_key),
            None => break,
        }
    }

    // final invocation with null key/value so aggregations can emit
    let input = ProcessInput {
        key: None,
        value: None,
        parameter,
        range_first: first,
        range_last: true,
    };
    let output = invoke(func, &input)?;
    if output.update_value.is_some() || output.delete_key {
        return Err(KvtError::ExtFuncError {
            message: "callback requested a mutation on the final aggregation call".into(),
        });
    }
    if let Some(rv) = output.return_value {
        results.push((Vec::new(), rv));
    }

    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invoke_failure_surfaces_message() {
        let mut cb = |_: &ProcessInput<'_>, out: &mut ProcessOutput| {
            out.return_value = Some(b"bad input".to_vec());
            false
        };
        let input = ProcessInput {
            key: Some(&b"k"[..]),
            value: Some(&b"v"[..]),
            parameter: b"",
            range_first: false,
            range_last: false,
        };
        match invoke(&mut cb, &input) {
            Err(KvtError::ExtFuncError { message }) => assert_eq!(message, "bad input"),
            other => panic!("expected ExtFuncError, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_invoke_rejects_update_plus_delete() {
        let mut cb = |_: &ProcessInput<'_>, out: &mut ProcessOutput| {
            out.update_value = Some(b"x".to_vec());
            out.delete_key = true;
            true
        };
        let input = ProcessInput {
            key: Some(&b"k"[..]),
            value: Some(&b"v"[..]),
            parameter: b"",
            range_first: false,
            range_last: false,
        };
        assert!(matches!(invoke(&mut cb, &input), Err(KvtError::ExtFuncError { .. })));
    }

    #[test]
    fn test_invoke_failure_without_message() {
        let mut cb = |_: &ProcessInput<'_>, _: &mut ProcessOutput| false;
        let input = ProcessInput {
            key: Some(&b"k"[..]),
            value: Some(&b"v"[..]),
            parameter: b"",
            range_first: false,
            range_last: false,
        };
        match invoke(&mut cb, &input) {
            Err(KvtError::ExtFuncError { message }) => {
                assert_eq!(message, "process callback failed")
            }
            other => panic!("expected ExtFuncError, got {:?}", other.map(|_| ())),
        }
    }
}
