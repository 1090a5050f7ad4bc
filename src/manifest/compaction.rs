//! Size-tiered compaction: merging a level into its successor.
//!
//! When a level's byte size crosses its threshold, every table in it is
//! merged with the overlapping tables of the next level into one new
//! table, which is spliced between the untouched neighbours so the
//! target level keeps its non-overlapping, ascending-key invariant.
//!
//! The merge runs a min-heap over the input iterators, ordered by key and
//! tie-broken by a priority counter assigned at push time: newer sources
//! get higher counters and win on equal keys. Consecutive duplicates in
//! the merged stream are collapsed, keeping the winner. Tombstones are
//! carried forward except when the target is the deepest level, where
//! nothing older can hide beneath them.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;

use crate::cache::BlockCache;
use crate::config::CompressionConfig;
use crate::error::Result;
use crate::memtable::Binding;
use crate::sstable::{self, Table, TableBuilder, TableIterator};

use super::{level_threshold, Level, Manifest, MAX_LEVELS};

/// Everything a compaction needs from the engine.
pub struct CompactionCtx<'a> {
    pub dir: &'a std::path::Path,
    pub compression: CompressionConfig,
    pub block_size: usize,
    pub cache: Option<Arc<BlockCache>>,
    pub next_sst_id: &'a AtomicU64,
}

struct HeapEntry {
    key: Vec<u8>,
    value: Binding,
    priority: u64,
    source: usize,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key && self.priority == other.priority
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
        // Reversed on key for min-heap behavior; on equal keys the higher
        // priority (newer source) pops first and wins the dedup.
        match other.key.cmp(&self.key) {
            Ordering::Equal => self.priority.cmp(&other.priority),
            ord => ord,
        }
    }
}

/// Merges table iterators in key order, newest source winning ties.
struct MergeIter<'a> {
    sources: Vec<TableIterator<'a>>,
    heap: BinaryHeap<HeapEntry>,
    failed: Option<crate::error::Error>,
}

impl<'a> MergeIter<'a> {
    /// `inputs` are (iterator, priority) pairs; higher priority = newer.
    fn new(inputs: Vec<(TableIterator<'a>, u64)>) -> Self {
        let mut merge = Self {
            sources: Vec::with_capacity(inputs.len()),
            heap: BinaryHeap::new(),
            failed: None,
        };
        for (mut iter, priority) in inputs {
            let source = merge.sources.len();
            match iter.next() {
                Some(Ok((key, value))) => merge.heap.push(HeapEntry {
                    key,
                    value,
                    priority,
                    source,
                }),
                Some(Err(e)) => merge.failed = Some(e),
                None => {}
            }
            merge.sources.push(iter);
        }
        merge
    }
}

impl Iterator for MergeIter<'_> {
    type Item = Result<(Vec<u8>, Binding)>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(e) = self.failed.take() {
            return Some(Err(e));
        }
        let entry = self.heap.pop()?;
        match self.sources[entry.source].next() {
            Some(Ok((key, value))) => self.heap.push(HeapEntry {
                key,
                value,
                priority: entry.priority,
                source: entry.source,
            }),
            Some(Err(e)) => self.failed = Some(e),
            None => {}
        }
        Some(Ok((entry.key, entry.value)))
    }
}

/// Compacts every over-threshold level bottom-up, stopping at the first
/// level under threshold. Returns the ids of all retired tables; the
/// caller unlinks their files once the new manifest version is published.
pub fn compact(manifest: &mut Manifest, ctx: &CompactionCtx) -> Result<Vec<u64>> {
    compact_from(manifest, 0, ctx)
}

/// The threshold-driven compaction loop, starting at the given level.
pub fn compact_from(
    manifest: &mut Manifest,
    start: usize,
    ctx: &CompactionCtx,
) -> Result<Vec<u64>> {
    let mut retired = Vec::new();
    let mut level = start;
    while level < manifest.levels().len() && level < MAX_LEVELS - 1 {
        if manifest.levels()[level].byte_size() <= level_threshold(level) {
            break;
        }
        retired.extend(compact_level(manifest, level, ctx)?);
        level += 1;
    }
    Ok(retired)
}

/// Merges level `source` into level `source + 1`.
pub fn compact_level(
    manifest: &mut Manifest,
    source: usize,
    ctx: &CompactionCtx,
) -> Result<Vec<u64>> {
    let target = source + 1;
    if manifest.levels()[source].is_empty() {
        return Ok(Vec::new());
    }
    while manifest.levels().len() <= target {
        let number = manifest.levels().len();
        manifest.levels_mut().push(Level::new(number));
    }

    let source_tables: Vec<Arc<Table>> = manifest.levels()[source].tables().to_vec();
    let min_key = source_tables
        .iter()
        .map(|t| t.first_key())
        .min()
        .expect("source level is non-empty")
        .to_vec();
    let max_key = source_tables
        .iter()
        .map(|t| t.last_key())
        .max()
        .expect("source level is non-empty")
        .to_vec();

    // Partition the target level around the source key range.
    let mut left: Vec<Arc<Table>> = Vec::new();
    let mut overlap: Vec<Arc<Table>> = Vec::new();
    let mut right: Vec<Arc<Table>> = Vec::new();
    for table in manifest.levels()[target].tables() {
        if table.last_key() < min_key.as_slice() {
            left.push(Arc::clone(table));
        } else if table.first_key() > max_key.as_slice() {
            right.push(Arc::clone(table));
        } else {
            overlap.push(Arc::clone(table));
        }
    }

    let new_id = ctx
        .next_sst_id
        .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
    tracing::info!(
        source_level = source,
        target_level = target,
        source_tables = source_tables.len(),
        overlapping_tables = overlap.len(),
        new_table = new_id,
        "starting compaction"
    );

    // Priorities: target-level tables are oldest, then the source level's
    // tables from oldest to newest append order.
    let mut priority = 0u64;
    let mut inputs = Vec::with_capacity(overlap.len() + source_tables.len());
    for table in &overlap {
        inputs.push((table.iter(), priority));
        priority += 1;
    }
    for table in &source_tables {
        inputs.push((table.iter(), priority));
        priority += 1;
    }

    // Tombstones only drop when nothing older can exist below the target.
    let drop_tombstones = target == manifest.levels().len() - 1;

    let mut builder = TableBuilder::new(ctx.block_size, ctx.compression);
    let mut last_key: Option<Vec<u8>> = None;
    let mut dropped = 0u64;
    for item in MergeIter::new(inputs) {
        let (key, value) = item?;
        if last_key.as_deref() == Some(key.as_slice()) {
            continue;
        }
        last_key = Some(key.clone());
        if value.is_none() && drop_tombstones {
            dropped += 1;
            continue;
        }
        builder.add(&key, value.as_deref())?;
    }

    let new_table = if builder.is_empty() {
        None
    } else {
        let path = sstable::table_path(ctx.dir, new_id);
        builder.write_to(&path)?;
        Some(Arc::new(Table::open(
            path,
            new_id,
            ctx.compression,
            ctx.cache.clone(),
        )?))
    };

    let retired: Vec<u64> = source_tables
        .iter()
        .chain(overlap.iter())
        .map(|t| t.id())
        .collect();

    manifest.levels_mut()[source].tables_mut().clear();
    let mut rebuilt = left;
    let entry_count = new_table.as_ref().map_or(0, |t| t.entry_count());
    if let Some(table) = new_table {
        manifest.note_sst_id(table.id());
        rebuilt.push(table);
    }
    rebuilt.extend(right);
    *manifest.levels_mut()[target].tables_mut() = rebuilt;

    tracing::info!(
        source_level = source,
        target_level = target,
        retired_tables = retired.len(),
        merged_entries = entry_count,
        dropped_tombstones = dropped,
        "completed compaction"
    );
    Ok(retired)
}
