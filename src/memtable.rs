//! In-memory ordered table accepting recent writes.
//!
//! The memtable is the first stop for every mutation. It wraps a
//! `crossbeam-skiplist` map, which gives lock-free concurrent readers and
//! writers over lexicographically ordered byte-string keys, with an atomic
//! byte-size accumulator the engine uses as its flush trigger.
//!
//! Deletions insert a tombstone (`None` value) rather than unlinking the
//! node: a plain removal would resurrect older versions of the key still
//! sitting in SSTs. Tombstones flow through freeze, flush and compaction
//! and are only dropped once they reach the deepest level.
//!
//! Memtables progress through two states: **active** (accepts writes) and
//! **frozen** (read-only, queued for flushing). The freeze transition is a
//! single atomic swap so concurrent writers either land before the freeze
//! or observe `Error::ReadOnly` and retry against the replacement table.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crossbeam_skiplist::SkipMap;

use crate::error::{Error, Result};

/// A binding as stored in the memtable: `None` is a tombstone.
pub type Binding = Option<Vec<u8>>;

/// In-memory sorted table with atomic size tracking and freeze state.
#[derive(Debug, Default)]
pub struct Memtable {
    data: SkipMap<Vec<u8>, Binding>,
    bytes: AtomicUsize,
    frozen: AtomicBool,
}

impl Memtable {
    /// Creates a new empty memtable.
    pub fn new() -> Self {
        Self {
            data: SkipMap::new(),
            bytes: AtomicUsize::new(0),
            frozen: AtomicBool::new(false),
        }
    }

    /// Inserts or overwrites a binding.
    pub fn put(&self, key: Vec<u8>, value: Vec<u8>) -> Result<()> {
        self.write(key, Some(value))
    }

    /// Records a tombstone for the key.
    pub fn delete(&self, key: Vec<u8>) -> Result<()> {
        self.write(key, None)
    }

    fn write(&self, key: Vec<u8>, value: Binding) -> Result<()> {
        if self.frozen.load(Ordering::SeqCst) {
            return Err(Error::ReadOnly);
        }

        let new_size = key.len() + value.as_ref().map_or(0, |v| v.len());
        let old_size = self
            .data
            .get(&key)
            .map(|entry| entry.key().len() + entry.value().as_ref().map_or(0, |v| v.len()));
        self.data.insert(key, value);

        // The accumulator is approximate under concurrent overwrites of the
        // same key; the flush trigger only needs a rough figure.
        match old_size {
            Some(old) if old > new_size => {
                self.bytes.fetch_sub(old - new_size, Ordering::SeqCst);
            }
            Some(old) => {
                self.bytes.fetch_add(new_size - old, Ordering::SeqCst);
            }
            None => {
                self.bytes.fetch_add(new_size, Ordering::SeqCst);
            }
        }
        Ok(())
    }

    /// Returns the current binding for the key: `None` when the key has
    /// never been written here, `Some(None)` when it is tombstoned.
    pub fn get(&self, key: &[u8]) -> Option<Binding> {
        self.data.get(key).map(|entry| entry.value().clone())
    }

    /// Number of live bindings (tombstones included).
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Approximate bytes held: sum of key and value lengths.
    pub fn byte_size(&self) -> usize {
        self.bytes.load(Ordering::SeqCst)
    }

    /// Prevents further writes. Fails if already frozen.
    pub fn freeze(&self) -> Result<()> {
        if self.frozen.swap(true, Ordering::SeqCst) {
            return Err(Error::ReadOnly);
        }
        Ok(())
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen.load(Ordering::SeqCst)
    }

    /// Ascending iteration over all bindings, tombstones included.
    pub fn iter(&self) -> impl Iterator<Item = (Vec<u8>, Binding)> + '_ {
        self.data
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
    }

    /// The first binding at or above the bound. Backs the cursor-style
    /// scan iterator, which re-seeks instead of borrowing the map.
    pub fn lower_bound(&self, bound: std::ops::Bound<&[u8]>) -> Option<(Vec<u8>, Binding)> {
        self.data
            .lower_bound(bound)
            .map(|entry| (entry.key().clone(), entry.value().clone()))
    }
}
