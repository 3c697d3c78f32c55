//! Storage primitives: entries and the ordered per-table keyspace
//!
//! Keys are opaque byte strings compared lexicographically over unsigned
//! bytes. Each entry carries the value bytes plus a 32-bit metadata word
//! owned by the concurrency-control strategy: the lock holder under 2PL
//! (0 = unlocked), the version number under OCC (-1 = tombstone).

use std::collections::BTreeMap;
use std::ops::Bound;

/// Metadata value of an unlocked entry (2PL).
pub const UNLOCKED: i32 = 0;

/// Metadata value of a tombstone (OCC): logically deleted, version retained
/// so concurrent readers can still validate.
pub const TOMBSTONE: i32 = -1;

/// Read-set sentinel for a key that was absent when observed. Never stored
/// in an entry.
pub const VERSION_ABSENT: i32 = i32::MIN;

/// The stored unit: value bytes plus the CC metadata word.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub data: Vec<u8>,
    pub metadata: i32,
}

impl Entry {
    pub fn new(data: Vec<u8>, metadata: i32) -> Self {
        Self { data, metadata }
    }

    /// OCC: whether this entry is a tombstone.
    pub fn is_tombstone(&self) -> bool {
        self.metadata == TOMBSTONE
    }
}

/// Ordered keyspace of one table.
pub type TableData = BTreeMap<Vec<u8>, Entry>;

/// How a scan ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanStatus {
    /// The range was exhausted before the limit.
    Complete,
    /// The item limit cut the scan short; results are valid.
    LimitReached,
}

/// Result of a range scan: pairs in ascending key order plus how the scan
/// ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanOutcome {
    pub items: Vec<(Vec<u8>, Vec<u8>)>,
    pub status: ScanStatus,
}

impl ScanOutcome {
    pub fn limit_reached(&self) -> bool {
        self.status == ScanStatus::LimitReached
    }
}

/// Smallest key strictly greater than `key`: append one zero byte.
pub fn key_successor(key: &[u8]) -> Vec<u8> {
    let mut next = Vec::with_capacity(key.len() + 1);
    next.extend_from_slice(key);
    next.push(0);
    next
}

/// Iterate the committed entries of `data` within `[start, end)`, where an
/// `end` of `None` runs to the end of the table.
pub fn range<'a>(
    data: &'a TableData,
    start: &[u8],
    end: Option<&[u8]>,
) -> impl Iterator<Item = (&'a Vec<u8>, &'a Entry)> {
    let upper: Bound<Vec<u8>> = match end {
        Some(end) => Bound::Excluded(end.to_vec()),
        None => Bound::Unbounded,
    };
    data.range((Bound::Included(start.to_vec()), upper))
}

/// True when `limit` (0 = unlimited) still admits more items.
pub fn within_limit(count: usize, limit: u64) -> bool {
    limit == 0 || (count as u64) < limit
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(pairs: &[(&[u8], &[u8])]) -> TableData {
        pairs
            .iter()
            .map(|(k, v)| (k.to_vec(), Entry::new(v.to_vec(), 0)))
            .collect()
    }

    #[test]
    fn test_range_inclusive_exclusive() {
        let data = table(&[(&b"a"[..], &b"1"[..]), (b"b", b"2"), (b"c", b"3")]);
        let keys: Vec<_> =
            range(&data, b"a", Some(&b"c"[..])).map(|(k, _)| k.clone()).collect();
        assert_eq!(keys, vec![b"a".to_vec(), b"b".to_vec()]);
    }

    #[test]
    fn test_range_open_end() {
        let data = table(&[(&b"a"[..], &b"1"[..]), (b"b", b"2"), (b"c", b"3")]);
        let keys: Vec<_> = range(&data, b"b", None).map(|(k, _)| k.clone()).collect();
        assert_eq!(keys, vec![b"b".to_vec(), b"c".to_vec()]);
    }

    #[test]
    fn test_range_empty_start_is_smallest() {
        let data = table(&[(&b"a"[..], &b"1"[..]), (b"b", b"2")]);
        let keys: Vec<_> = range(&data, b"", None).map(|(k, _)| k.clone()).collect();
        assert_eq!(keys.len(), 2);
    }

    #[test]
    fn test_range_is_lexicographic_unsigned() {
        let data = table(&[(&[0x01][..], &b"lo"[..]), (&[0x7f][..], b"mid"), (&[0xff][..], b"hi")]);
        let keys: Vec<_> = range(&data, &[], None).map(|(k, _)| k.clone()).collect();
        assert_eq!(keys, vec![vec![0x01], vec![0x7f], vec![0xff]]);
    }

    #[test]
    fn test_key_successor_orders_tightly() {
        let succ = key_successor(b"ab");
        assert_eq!(succ, b"ab\x00");
        assert!(succ.as_slice() > b"ab".as_slice());
        // nothing fits between a key and its successor
        assert!(succ.as_slice() <= b"ab\x00".as_slice());
    }

    #[test]
    fn test_within_limit_zero_is_unlimited() {
        assert!(within_limit(1_000_000, 0));
        assert!(within_limit(1, 2));
        assert!(!within_limit(2, 2));
    }

    #[test]
    fn test_tombstone_flag() {
        assert!(Entry::new(Vec::new(), TOMBSTONE).is_tombstone());
        assert!(!Entry::new(b"v".to_vec(), 4).is_tombstone());
    }
}
