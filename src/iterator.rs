//! Merged ordered scans across every data source in the engine.
//!
//! A scan draws from the active memtable, each frozen memtable and every
//! table in the manifest tip at once. The sources are individually
//! sorted, so a min-heap over their heads yields the globally smallest
//! key at each step. Sources are registered newest-first; on duplicate
//! keys the entry from the lowest-numbered (newest) source wins and the
//! older bindings are skipped, which also lets a tombstone silently erase
//! every older version of its key from the scan.
//!
//! Every source owns an `Arc` of its backing structure and re-derives its
//! position on each step (a cursor re-seek for the memtable, an owned
//! decoded block for tables), so a `ScanIterator` borrows nothing and can
//! outlive the engine locks it was created under.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::ops::Bound;
use std::sync::Arc;

use crate::error::Result;
use crate::memtable::{Binding, Memtable};
use crate::sstable::Table;

/// A boxed sorted source of bindings.
pub type KvSource = Box<dyn Iterator<Item = Result<(Vec<u8>, Binding)>> + Send>;

struct HeapEntry {
    key: Vec<u8>,
    value: Binding,
    source: usize,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key && self.source == other.source
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed on key for min-heap behavior; on equal keys the lower
        // source index (the newer data source) pops first.
        match other.key.cmp(&self.key) {
            Ordering::Equal => other.source.cmp(&self.source),
            ord => ord,
        }
    }
}

/// Merges sorted sources into one ascending, deduplicated, live-only
/// stream of key-value pairs within a key range.
pub struct ScanIterator {
    sources: Vec<KvSource>,
    heap: BinaryHeap<HeapEntry>,
    last_key: Option<Vec<u8>>,
    end: Bound<Vec<u8>>,
    failed: Option<crate::error::Error>,
    done: bool,
}

impl ScanIterator {
    /// `sources` must be ordered newest first; each must already honor
    /// the scan's start bound.
    pub fn new(sources: Vec<KvSource>, end: Bound<Vec<u8>>) -> Self {
        let mut iter = Self {
            sources,
            heap: BinaryHeap::new(),
            last_key: None,
            end,
            failed: None,
            done: false,
        };
        for source in 0..iter.sources.len() {
            iter.refill(source);
        }
        iter
    }

    fn refill(&mut self, source: usize) {
        match self.sources[source].next() {
            Some(Ok((key, value))) => self.heap.push(HeapEntry { key, value, source }),
            Some(Err(e)) => self.failed = Some(e),
            None => {}
        }
    }

    fn past_end(&self, key: &[u8]) -> bool {
        match &self.end {
            Bound::Included(end) => key > end.as_slice(),
            Bound::Excluded(end) => key >= end.as_slice(),
            Bound::Unbounded => false,
        }
    }
}

impl Iterator for ScanIterator {
    type Item = Result<(Vec<u8>, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        if let Some(e) = self.failed.take() {
            self.done = true;
            return Some(Err(e));
        }
        while let Some(entry) = self.heap.pop() {
            self.refill(entry.source);

            if self.past_end(&entry.key) {
                self.done = true;
                self.heap.clear();
                return None;
            }
            // Older bindings of an already-yielded key are shadowed.
            if self.last_key.as_deref() == Some(entry.key.as_slice()) {
                continue;
            }
            self.last_key = Some(entry.key.clone());

            match entry.value {
                // A tombstone erases the key; the shadow check above
                // swallows the older live versions.
                None => continue,
                Some(value) => return Some(Ok((entry.key, value))),
            }
        }
        self.done = true;
        None
    }
}

/// Cursor-style scan over a memtable: owns the `Arc` and re-seeks past
/// the last yielded key on every step, so concurrent writers never block
/// the scan and the iterator borrows nothing.
pub struct MemtableScanIter {
    memtable: Arc<Memtable>,
    cursor: Option<Vec<u8>>,
    start: Bound<Vec<u8>>,
    exhausted: bool,
}

impl MemtableScanIter {
    pub fn new(memtable: Arc<Memtable>, start: Bound<Vec<u8>>) -> Self {
        Self {
            memtable,
            cursor: None,
            start,
            exhausted: false,
        }
    }
}

impl Iterator for MemtableScanIter {
    type Item = Result<(Vec<u8>, Binding)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.exhausted {
            return None;
        }
        let bound = match &self.cursor {
            Some(key) => Bound::Excluded(key.as_slice()),
            None => match &self.start {
                Bound::Included(key) => Bound::Included(key.as_slice()),
                Bound::Excluded(key) => Bound::Excluded(key.as_slice()),
                Bound::Unbounded => Bound::Unbounded,
            },
        };
        match self.memtable.lower_bound(bound) {
            Some((key, value)) => {
                self.cursor = Some(key.clone());
                Some(Ok((key, value)))
            }
            None => {
                self.exhausted = true;
                None
            }
        }
    }
}

/// Owned scan over one table: decodes blocks into owned entry vectors,
/// starting at the block the start bound lands in.
pub struct TableScanIter {
    table: Arc<Table>,
    next_block: usize,
    entries: Vec<(Vec<u8>, Binding)>,
    pos: usize,
    start: Bound<Vec<u8>>,
    seeking: bool,
}

impl TableScanIter {
    pub fn new(table: Arc<Table>, start: Bound<Vec<u8>>) -> Self {
        let next_block = match &start {
            Bound::Included(key) | Bound::Excluded(key) => table.block_index_for(key).unwrap_or(0),
            Bound::Unbounded => 0,
        };
        Self {
            table,
            next_block,
            entries: Vec::new(),
            pos: 0,
            start,
            seeking: true,
        }
    }

    fn before_start(&self, key: &[u8]) -> bool {
        match &self.start {
            Bound::Included(start) => key < start.as_slice(),
            Bound::Excluded(start) => key <= start.as_slice(),
            Bound::Unbounded => false,
        }
    }
}

impl Iterator for TableScanIter {
    type Item = Result<(Vec<u8>, Binding)>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.pos < self.entries.len() {
                let entry = self.entries[self.pos].clone();
                self.pos += 1;
                if self.seeking {
                    if self.before_start(&entry.0) {
                        continue;
                    }
                    self.seeking = false;
                }
                return Some(Ok(entry));
            }
            if self.next_block >= self.table.block_count() {
                return None;
            }
            match self.table.read_block(self.next_block) {
                Ok(block) => {
                    self.entries = block.into_entries();
                    self.pos = 0;
                    self.next_block += 1;
                }
                Err(e) => {
                    self.next_block = self.table.block_count();
                    return Some(Err(e));
                }
            }
        }
    }
}

/// Clones a borrowed range bound into an owned one.
pub fn owned_bound(bound: Bound<&Vec<u8>>) -> Bound<Vec<u8>> {
    match bound {
        Bound::Included(key) => Bound::Included(key.clone()),
        Bound::Excluded(key) => Bound::Excluded(key.clone()),
        Bound::Unbounded => Bound::Unbounded,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source(entries: Vec<(&[u8], Option<&[u8]>)>) -> KvSource {
        Box::new(
            entries
                .into_iter()
                .map(|(key, value)| Ok((key.to_vec(), value.map(|v| v.to_vec()))))
                .collect::<Vec<_>>()
                .into_iter(),
        )
    }

    #[test]
    fn test_merges_in_key_order() {
        let merged = ScanIterator::new(
            vec![
                source(vec![(b"a", Some(b"1")), (b"d", Some(b"1"))]),
                source(vec![(b"b", Some(b"2")), (b"e", Some(b"2"))]),
                source(vec![(b"c", Some(b"3"))]),
            ],
            Bound::Unbounded,
        );

        let keys: Vec<_> = merged
            .collect::<Result<Vec<_>>>()
            .expect("scan failed")
            .into_iter()
            .map(|(key, _)| key)
            .collect();
        assert_eq!(
            keys,
            vec![
                b"a".to_vec(),
                b"b".to_vec(),
                b"c".to_vec(),
                b"d".to_vec(),
                b"e".to_vec()
            ]
        );
    }

    #[test]
    fn test_newest_source_wins_duplicates() {
        let merged = ScanIterator::new(
            vec![
                source(vec![(b"k", Some(b"new"))]),
                source(vec![(b"k", Some(b"old"))]),
            ],
            Bound::Unbounded,
        );

        let entries: Vec<_> = merged.collect::<Result<Vec<_>>>().expect("scan failed");
        assert_eq!(entries, vec![(b"k".to_vec(), b"new".to_vec())]);
    }

    #[test]
    fn test_tombstone_erases_older_versions() {
        let merged = ScanIterator::new(
            vec![
                source(vec![(b"a", Some(b"live")), (b"b", None)]),
                source(vec![(b"b", Some(b"dead")), (b"c", Some(b"live"))]),
            ],
            Bound::Unbounded,
        );

        let keys: Vec<_> = merged
            .collect::<Result<Vec<_>>>()
            .expect("scan failed")
            .into_iter()
            .map(|(key, _)| key)
            .collect();
        assert_eq!(keys, vec![b"a".to_vec(), b"c".to_vec()]);
    }

    #[test]
    fn test_stops_at_end_bound() {
        let merged = ScanIterator::new(
            vec![source(vec![
                (b"a", Some(b"1")),
                (b"b", Some(b"1")),
                (b"c", Some(b"1")),
            ])],
            Bound::Excluded(b"c".to_vec()),
        );
        let keys: Vec<_> = merged
            .collect::<Result<Vec<_>>>()
            .expect("scan failed")
            .into_iter()
            .map(|(key, _)| key)
            .collect();
        assert_eq!(keys, vec![b"a".to_vec(), b"b".to_vec()]);

        let merged = ScanIterator::new(
            vec![source(vec![(b"a", Some(b"1")), (b"c", Some(b"1"))])],
            Bound::Included(b"a".to_vec()),
        );
        let keys: Vec<_> = merged
            .collect::<Result<Vec<_>>>()
            .expect("scan failed")
            .into_iter()
            .map(|(key, _)| key)
            .collect();
        assert_eq!(keys, vec![b"a".to_vec()]);
    }

    #[test]
    fn test_memtable_scan_iter() {
        let memtable = Arc::new(Memtable::new());
        memtable
            .put(b"b".to_vec(), b"2".to_vec())
            .expect("put failed");
        memtable
            .put(b"a".to_vec(), b"1".to_vec())
            .expect("put failed");
        memtable.delete(b"c".to_vec()).expect("delete failed");

        let scanned: Vec<_> = MemtableScanIter::new(Arc::clone(&memtable), Bound::Unbounded)
            .collect::<Result<Vec<_>>>()
            .expect("scan failed");
        assert_eq!(
            scanned,
            vec![
                (b"a".to_vec(), Some(b"1".to_vec())),
                (b"b".to_vec(), Some(b"2".to_vec())),
                (b"c".to_vec(), None),
            ]
        );

        let from_b: Vec<_> = MemtableScanIter::new(memtable, Bound::Included(b"b".to_vec()))
            .collect::<Result<Vec<_>>>()
            .expect("scan failed");
        assert_eq!(from_b.len(), 2);
        assert_eq!(from_b[0].0, b"b".to_vec());
    }
}
