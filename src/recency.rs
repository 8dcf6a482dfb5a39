//! Recency index for LRU eviction
//!
//! Every touch stamps an entry with the next value of a logical clock, so
//! two entries never share a stamp and entries touched in one batch keep
//! their insertion order.

use crate::protocol::Key;
use std::collections::BTreeMap;

#[derive(Debug, Default)]
pub struct RecencyIndex {
    clock: u64,
    /// stamp -> key, oldest first
    order: BTreeMap<u64, Key>,
}

impl RecencyIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate the next stamp without recording anything
    pub fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    /// Record `key` as most recently used and return its stamp
    pub fn insert(&mut self, key: Key) -> u64 {
        let stamp = self.tick();
        self.order.insert(stamp, key);
        stamp
    }

    /// Move the entry stamped `old` to the most recent position
    pub fn touch(&mut self, old: u64) -> Option<u64> {
        let key = self.order.remove(&old)?;
        Some(self.insert(key))
    }

    pub fn remove(&mut self, stamp: u64) -> Option<Key> {
        self.order.remove(&stamp)
    }

    /// Keys from least to most recently used
    pub fn iter_lru(&self) -> impl Iterator<Item = (u64, &Key)> {
        self.order.iter().map(|(&stamp, key)| (stamp, key))
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insertion_order_breaks_ties() {
        let mut index = RecencyIndex::new();
        for name in ["a", "b", "c"] {
            index.insert(Key::from(name));
        }
        let order: Vec<_> = index.iter_lru().map(|(_, k)| k.clone()).collect();
        assert_eq!(order, vec![Key::from("a"), Key::from("b"), Key::from("c")]);
    }

    #[test]
    fn test_touch_moves_to_back() {
        let mut index = RecencyIndex::new();
        let a = index.insert(Key::from("a"));
        index.insert(Key::from("b"));

        let a2 = index.touch(a).unwrap();
        assert!(a2 > a);
        let first = index.iter_lru().next().map(|(_, k)| k.clone());
        assert_eq!(first, Some(Key::from("b")));
        assert!(index.touch(a).is_none());
        assert_eq!(index.len(), 2);
    }
}
