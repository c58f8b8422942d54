//! A contiguous map from key ranges to values.
//!
//! The map always covers the whole keyspace `[b"", [0xff])`: it is created
//! with a default value at the empty key and `insert` replaces a range by
//! splitting the boundaries it overlaps. Values shared across a split (for
//! example `Arc`s) are cloned by handle, so one record can span several
//! boundaries.

use std::collections::BTreeMap;
use std::ops::Bound;

use crate::keys::{Key, KeyRange};

#[derive(Clone, Debug)]
pub struct RangeMap<V> {
    // Boundary key -> value covering [key, next boundary).
    entries: BTreeMap<Key, V>,
    end: Key,
}

impl<V: Clone> RangeMap<V> {
    pub fn new(default: V) -> Self {
        let mut entries = BTreeMap::new();
        entries.insert(Vec::new(), default);
        Self {
            entries,
            end: KeyRange::all().end,
        }
    }

    /// Number of boundaries, including the initial one.
    pub fn boundary_count(&self) -> usize {
        self.entries.len()
    }

    /// The value covering `key`.
    pub fn value_at(&self, key: &[u8]) -> &V {
        self.entries
            .range::<[u8], _>((Bound::Unbounded, Bound::Included(key)))
            .next_back()
            .map(|(_, v)| v)
            .expect("range map covers the whole keyspace")
    }

    /// Replace the value over `range`, keeping coverage contiguous.
    pub fn insert(&mut self, range: &KeyRange, value: V) {
        if range.is_empty() {
            return;
        }
        // The value that must resume at range.end.
        let resume = self.value_at(&range.end).clone();

        let doomed: Vec<Key> = self
            .entries
            .range::<[u8], _>((
                Bound::Included(range.begin.as_slice()),
                Bound::Excluded(range.end.as_slice()),
            ))
            .map(|(k, _)| k.clone())
            .collect();
        for key in doomed {
            self.entries.remove(&key);
        }

        if range.end < self.end && !self.entries.contains_key(&range.end) {
            self.entries.insert(range.end.clone(), resume);
        }
        self.entries.insert(range.begin.clone(), value);
    }

    /// All ranges overlapping `range`, in key order.
    pub fn intersecting_ranges(&self, range: &KeyRange) -> Vec<(KeyRange, &V)> {
        self.ranges()
            .filter(|(r, _)| r.intersects(range))
            .collect()
    }

    /// Every `(range, value)` pair covering the keyspace, in key order.
    pub fn ranges(&self) -> impl Iterator<Item = (KeyRange, &V)> {
        let mut iter = self.entries.iter().peekable();
        std::iter::from_fn(move || {
            let (begin, value) = iter.next()?;
            let end = iter
                .peek()
                .map(|(k, _)| (*k).clone())
                .unwrap_or_else(|| self.end.clone());
            Some((KeyRange::new(begin.clone(), end), value))
        })
    }

    /// Remove up to `limit` boundaries above the base entry. Returns the
    /// number removed; callers clearing a large map interleave batches with
    /// yields.
    pub fn drain_boundaries(&mut self, limit: usize) -> usize {
        let doomed: Vec<Key> = self
            .entries
            .keys()
            .filter(|k| !k.is_empty())
            .take(limit)
            .cloned()
            .collect();
        for key in &doomed {
            self.entries.remove(key);
        }
        doomed.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn range(begin: &[u8], end: &[u8]) -> KeyRange {
        KeyRange::new(begin.to_vec(), end.to_vec())
    }

    #[test]
    fn insert_splits_and_stays_contiguous() {
        let mut map = RangeMap::new(0u32);
        map.insert(&range(b"b", b"d"), 1);
        map.insert(&range(b"f", b"h"), 2);

        let ranges: Vec<(KeyRange, u32)> =
            map.ranges().map(|(r, v)| (r, *v)).collect();
        assert_eq!(
            ranges,
            vec![
                (range(b"", b"b"), 0),
                (range(b"b", b"d"), 1),
                (range(b"d", b"f"), 0),
                (range(b"f", b"h"), 2),
                (range(b"h", &[0xff]), 0),
            ]
        );

        // Coverage is contiguous: every range begins where the previous ended.
        for pair in ranges.windows(2) {
            assert_eq!(pair[0].0.end, pair[1].0.begin);
        }
    }

    #[test]
    fn insert_over_existing_boundaries_replaces_them() {
        let mut map = RangeMap::new(0u32);
        map.insert(&range(b"b", b"d"), 1);
        map.insert(&range(b"d", b"f"), 2);
        map.insert(&range(b"a", b"e"), 9);

        assert_eq!(*map.value_at(b"a"), 9);
        assert_eq!(*map.value_at(b"d"), 9);
        // The tail of the partially overlapped range keeps its value.
        assert_eq!(*map.value_at(b"e"), 2);
        assert_eq!(*map.value_at(b"f"), 0);
    }

    #[test]
    fn intersecting_ranges_reports_overlaps_only() {
        let mut map = RangeMap::new(0u32);
        map.insert(&range(b"b", b"d"), 1);
        map.insert(&range(b"f", b"h"), 2);

        let hits: Vec<u32> = map
            .intersecting_ranges(&range(b"c", b"g"))
            .into_iter()
            .map(|(_, v)| *v)
            .collect();
        assert_eq!(hits, vec![1, 0, 2]);
    }

    #[test]
    fn drain_boundaries_leaves_base_coverage() {
        let mut map = RangeMap::new(0u32);
        for i in 0..10u8 {
            map.insert(&range(&[b'a' + i], &[b'a' + i + 1]), i as u32);
        }
        assert!(map.boundary_count() > 10);

        let mut batches = 0;
        while map.drain_boundaries(3) > 0 {
            batches += 1;
        }
        assert!(batches >= 4);
        assert_eq!(map.boundary_count(), 1);
        assert_eq!(*map.value_at(b"zzz"), *map.value_at(b""));
    }
}
