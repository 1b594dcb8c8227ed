//! Recycling pools
//!
//! A scope with a reuse key is not disposed when it leaves its parent. It is
//! parked in a pool owned by the nearest ancestor node and handed back to the
//! next child lookup under that node asking for the same reuse key and node
//! kind. Pools are bounded; an item that does not fit is returned to the
//! caller, which then disposes it.

use rustc_hash::FxHashMap;
use std::hash::Hash;

use crate::key::ReuseKey;
use crate::tree::NodeKind;

/// Pool key of a recycled scope
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct PoolKey {
    pub reuse_key: ReuseKey,
    pub kind: NodeKind,
}

impl PoolKey {
    pub fn new(reuse_key: ReuseKey, kind: NodeKind) -> Self {
        Self { reuse_key, kind }
    }
}

/// Something that can park items under a key and hand them out again
pub trait Recyclable<K> {
    type Item;

    /// Park an item. Gives the item back when there is no room for it.
    fn recycle(&mut self, key: K, item: Self::Item) -> Result<(), Self::Item>;

    /// Take the most recently parked item for `key`
    fn reuse(&mut self, key: &K) -> Option<Self::Item>;
}

/// Bounded keyed pool
#[derive(Debug)]
pub struct RecyclePool<K, T> {
    capacity: usize,
    len: usize,
    entries: FxHashMap<K, Vec<T>>,
}

impl<K: Hash + Eq, T> RecyclePool<K, T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            len: 0,
            entries: FxHashMap::default(),
        }
    }

    /// Number of parked items across all keys
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Empty the pool, returning every parked item
    pub fn drain(&mut self) -> Vec<T> {
        self.len = 0;
        self.entries.drain().flat_map(|(_, items)| items).collect()
    }
}

impl<K: Hash + Eq, T> Recyclable<K> for RecyclePool<K, T> {
    type Item = T;

    fn recycle(&mut self, key: K, item: T) -> Result<(), T> {
        if self.len >= self.capacity {
            return Err(item);
        }
        self.entries.entry(key).or_default().push(item);
        self.len += 1;
        Ok(())
    }

    fn reuse(&mut self, key: &K) -> Option<T> {
        let items = self.entries.get_mut(key)?;
        let item = items.pop()?;
        if items.is_empty() {
            self.entries.remove(key);
        }
        self.len -= 1;
        Some(item)
    }
}
