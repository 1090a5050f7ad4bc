//! The storage engine: active memtable, frozen-memtable queue, manifest
//! versions, block cache and the background flush worker, behind a single
//! `put`/`delete`/`get` interface.
//!
//! # Write path
//!
//! Writes land in the active memtable. When its byte size crosses the
//! configured ceiling, the writer freezes it, swaps in a fresh table and
//! queues the frozen one for the flush worker. The worker drains the
//! queue oldest-first: each frozen table becomes a level-0 SST, the
//! manifest gains a new version, and compaction runs when level 0 has
//! outgrown its threshold.
//!
//! # Read path
//!
//! Reads consult the active memtable, then frozen memtables newest to
//! oldest, then the newest manifest version. The first binding wins, and
//! a tombstone binding means "not found" without looking further down.

use std::collections::VecDeque;
use std::fs;
use std::ops::RangeBounds;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::cache::{BlockCache, CacheStats};
use crate::config::DbConfig;
use crate::error::{Error, Result};
use crate::iterator::{owned_bound, KvSource, MemtableScanIter, ScanIterator, TableScanIter};
use crate::manifest::{self, CompactionCtx, Manifest};
use crate::memtable::{Binding, Memtable};
use crate::sstable::{self, Table, TableBuilder};

struct Shared {
    config: DbConfig,
    active: RwLock<Arc<Memtable>>,
    frozen: Mutex<VecDeque<Arc<Memtable>>>,
    /// Wakes the flush worker when the frozen queue gains a table.
    work_cv: Condvar,
    /// Wakes `flush()` waiters when the worker goes idle.
    idle_cv: Condvar,
    flushing: AtomicBool,
    /// Append-only list of manifest versions; the last one is the read tip.
    manifests: RwLock<Vec<Arc<Manifest>>>,
    cache: Option<Arc<BlockCache>>,
    next_sst_id: AtomicU64,
    stop: AtomicBool,
}

/// Snapshot of engine state for monitoring and tests.
#[derive(Debug, Clone)]
pub struct DbStats {
    pub active_bytes: usize,
    pub frozen_count: usize,
    pub level_count: usize,
    pub total_tables: usize,
    pub level_sizes: Vec<u64>,
    pub level_tables: Vec<usize>,
    pub level_entries: Vec<u64>,
    pub manifest_version: u64,
    pub next_sst_id: u64,
    pub cache: Option<CacheStats>,
}

pub struct Db {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Db {
    /// Opens the engine, recovering from the manifest when one exists.
    pub fn open(config: DbConfig) -> Result<Db> {
        fs::create_dir_all(&config.dir)?;

        let cache = config
            .enable_block_cache
            .then(|| Arc::new(BlockCache::new(config.block_cache.clone())));

        let manifest = Manifest::load(&config.dir, config.compression, cache.clone())?
            .unwrap_or_default();
        let next_sst_id = manifest.max_sst_id() + 1;
        tracing::info!(
            dir = %config.dir.display(),
            manifest_version = manifest.version(),
            tables = manifest.table_count(),
            next_sst_id,
            "opened storage engine"
        );

        let shared = Arc::new(Shared {
            config,
            active: RwLock::new(Arc::new(Memtable::new())),
            frozen: Mutex::new(VecDeque::new()),
            work_cv: Condvar::new(),
            idle_cv: Condvar::new(),
            flushing: AtomicBool::new(false),
            manifests: RwLock::new(vec![Arc::new(manifest)]),
            cache,
            next_sst_id: AtomicU64::new(next_sst_id),
            stop: AtomicBool::new(false),
        });

        let worker_shared = Arc::clone(&shared);
        let worker = thread::Builder::new()
            .name("emberkv-flush".to_string())
            .spawn(move || run_flush_worker(worker_shared))?;

        Ok(Db {
            shared,
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Inserts or overwrites a binding.
    pub fn put(&self, key: &[u8], value: Vec<u8>) -> Result<()> {
        self.write(key, Some(value))
    }

    /// Records a tombstone for the key.
    pub fn delete(&self, key: &[u8]) -> Result<()> {
        self.write(key, None)
    }

    fn write(&self, key: &[u8], value: Binding) -> Result<()> {
        if self.shared.stop.load(Ordering::SeqCst) {
            return Err(Error::Stopped);
        }
        loop {
            // Hold the read lock across the insert so a concurrent freeze
            // (which takes the write lock) cannot interleave with it.
            let active = self.shared.active.read().unwrap();
            let result = match &value {
                Some(v) => active.put(key.to_vec(), v.clone()),
                None => active.delete(key.to_vec()),
            };
            match result {
                Ok(()) => {
                    let full = active.byte_size() > self.shared.config.memtable_max_size;
                    drop(active);
                    if full {
                        self.freeze_active();
                    }
                    return Ok(());
                }
                Err(Error::ReadOnly) => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Looks up a key across memtables and the newest manifest version.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        if let Some(binding) = self.shared.active.read().unwrap().get(key) {
            return Ok(binding);
        }

        {
            let frozen = self.shared.frozen.lock().unwrap();
            for memtable in frozen.iter().rev() {
                if let Some(binding) = memtable.get(key) {
                    return Ok(binding);
                }
            }
        }

        let tip = self.manifest_tip();
        Ok(tip.get(key)?.flatten())
    }

    fn manifest_tip(&self) -> Arc<Manifest> {
        let manifests = self.shared.manifests.read().unwrap();
        Arc::clone(manifests.last().expect("manifest list is never empty"))
    }

    /// Ordered scan of live bindings within the key range, merged across
    /// the active memtable, frozen memtables and the manifest tip. The
    /// iterator owns snapshots of its sources, so it stays valid while
    /// writes, flushes and compactions continue.
    pub fn scan(&self, range: impl RangeBounds<Vec<u8>>) -> ScanIterator {
        let start = owned_bound(range.start_bound());
        let end = owned_bound(range.end_bound());

        let mut sources: Vec<KvSource> = Vec::new();
        let active = Arc::clone(&self.shared.active.read().unwrap());
        sources.push(Box::new(MemtableScanIter::new(active, start.clone())));
        {
            let frozen = self.shared.frozen.lock().unwrap();
            for memtable in frozen.iter().rev() {
                sources.push(Box::new(MemtableScanIter::new(
                    Arc::clone(memtable),
                    start.clone(),
                )));
            }
        }

        let tip = self.manifest_tip();
        for (number, level) in tip.levels().iter().enumerate() {
            if number == 0 {
                for table in level.tables().iter().rev() {
                    sources.push(Box::new(TableScanIter::new(
                        Arc::clone(table),
                        start.clone(),
                    )));
                }
            } else {
                for table in level.tables() {
                    sources.push(Box::new(TableScanIter::new(
                        Arc::clone(table),
                        start.clone(),
                    )));
                }
            }
        }

        ScanIterator::new(sources, end)
    }

    /// Freezes the active memtable and queues it for flushing. A no-op
    /// when the active table is empty: zero-entry SSTs are never built.
    pub fn freeze_active(&self) {
        let old = {
            let mut active = self.shared.active.write().unwrap();
            if active.is_empty() || active.freeze().is_err() {
                return;
            }
            let old = Arc::clone(&active);
            *active = Arc::new(Memtable::new());
            old
        };

        let mut frozen = self.shared.frozen.lock().unwrap();
        frozen.push_back(old);
        self.shared.work_cv.notify_one();
    }

    /// Blocks until every frozen memtable has been flushed.
    pub fn flush(&self) -> Result<()> {
        let mut frozen = self.shared.frozen.lock().unwrap();
        while !frozen.is_empty() || self.shared.flushing.load(Ordering::SeqCst) {
            if self.shared.stop.load(Ordering::SeqCst) {
                return Err(Error::Stopped);
            }
            let (guard, _) = self
                .shared
                .idle_cv
                .wait_timeout(frozen, Duration::from_millis(50))
                .unwrap();
            frozen = guard;
        }
        Ok(())
    }

    /// Runs compaction on the newest manifest version: level 0 is always
    /// merged down, deeper levels follow while over their thresholds, and
    /// the resulting version is published and persisted.
    pub fn compact(&self) -> Result<()> {
        let retired = {
            let mut manifests = self.shared.manifests.write().unwrap();
            let tip = manifests.last().expect("manifest list is never empty");
            if tip.levels()[0].is_empty() {
                return Ok(());
            }
            let mut next = (**tip).clone();
            let ctx = CompactionCtx {
                dir: &self.shared.config.dir,
                compression: self.shared.config.compression,
                block_size: self.shared.config.block_size,
                cache: self.shared.cache.clone(),
                next_sst_id: &self.shared.next_sst_id,
            };
            let mut retired = manifest::compact_level(&mut next, 0, &ctx)?;
            retired.extend(manifest::compact_from(&mut next, 1, &ctx)?);
            next.save(&self.shared.config.dir)?;
            manifests.push(Arc::new(next));
            retired
        };
        unlink_retired(&self.shared, &retired);
        Ok(())
    }

    pub fn stats(&self) -> DbStats {
        let tip = self.manifest_tip();
        DbStats {
            active_bytes: self.shared.active.read().unwrap().byte_size(),
            frozen_count: self.shared.frozen.lock().unwrap().len(),
            level_count: tip.levels().len(),
            total_tables: tip.table_count(),
            level_sizes: tip.levels().iter().map(|l| l.byte_size()).collect(),
            level_tables: tip.levels().iter().map(|l| l.table_count()).collect(),
            level_entries: tip
                .levels()
                .iter()
                .map(|l| l.tables().iter().map(|t| t.entry_count()).sum())
                .collect(),
            manifest_version: tip.version(),
            next_sst_id: self.shared.next_sst_id.load(Ordering::SeqCst),
            cache: self.shared.cache.as_ref().map(|c| c.stats()),
        }
    }

    /// Logs a health snapshot and returns it.
    pub fn status(&self) -> DbStats {
        let stats = self.stats();
        tracing::info!(
            active_bytes = stats.active_bytes,
            frozen = stats.frozen_count,
            levels = stats.level_count,
            tables = stats.total_tables,
            manifest_version = stats.manifest_version,
            "engine status"
        );
        if stats.frozen_count > 8 {
            tracing::warn!(
                frozen = stats.frozen_count,
                "flush worker is falling behind"
            );
        }
        stats
    }
}

impl Drop for Db {
    fn drop(&mut self) {
        // Get buffered writes onto disk before the worker exits.
        self.freeze_active();
        self.shared.stop.store(true, Ordering::SeqCst);
        self.shared.work_cv.notify_all();
        self.shared.idle_cv.notify_all();
        if let Some(handle) = self.worker.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

fn run_flush_worker(shared: Arc<Shared>) {
    loop {
        let memtable = {
            let mut frozen = shared.frozen.lock().unwrap();
            loop {
                if let Some(memtable) = frozen.pop_front() {
                    shared.flushing.store(true, Ordering::SeqCst);
                    break Some(memtable);
                }
                if shared.stop.load(Ordering::SeqCst) {
                    break None;
                }
                frozen = shared.work_cv.wait(frozen).unwrap();
            }
        };
        let Some(memtable) = memtable else { break };

        let result = flush_one(&shared, &memtable);
        shared.flushing.store(false, Ordering::SeqCst);
        match result {
            Ok(table_id) => {
                tracing::info!(table_id, entries = memtable.len(), "flushed memtable");
            }
            Err(e) if shared.stop.load(Ordering::SeqCst) => {
                tracing::error!(error = %e, "flush failed during shutdown, memtable dropped");
            }
            Err(e) => {
                tracing::warn!(error = %e, "flush failed, retrying");
                let mut frozen = shared.frozen.lock().unwrap();
                frozen.push_front(memtable);
                let _ = shared
                    .work_cv
                    .wait_timeout(frozen, Duration::from_millis(100));
                continue;
            }
        }
        shared.idle_cv.notify_all();
    }
    shared.idle_cv.notify_all();
}

fn flush_one(shared: &Shared, memtable: &Memtable) -> Result<u64> {
    let id = shared.next_sst_id.fetch_add(1, Ordering::SeqCst);
    let path = sstable::table_path(&shared.config.dir, id);

    let mut builder = TableBuilder::new(shared.config.block_size, shared.config.compression);
    for (key, value) in memtable.iter() {
        builder.add(&key, value.as_deref())?;
    }
    if let Err(e) = builder.write_to(&path) {
        let _ = fs::remove_file(&path);
        return Err(e);
    }
    let table = Arc::new(Table::open(
        &path,
        id,
        shared.config.compression,
        shared.cache.clone(),
    )?);

    let retired = {
        let mut manifests = shared.manifests.write().unwrap();
        let tip = manifests.last().expect("manifest list is never empty");
        let mut next = tip.insert_and_update(table);
        let mut retired = Vec::new();
        if next.can_compact() {
            let ctx = CompactionCtx {
                dir: &shared.config.dir,
                compression: shared.config.compression,
                block_size: shared.config.block_size,
                cache: shared.cache.clone(),
                next_sst_id: &shared.next_sst_id,
            };
            retired = manifest::compact(&mut next, &ctx)?;
        }
        next.save(&shared.config.dir)?;
        manifests.push(Arc::new(next));
        retired
    };
    unlink_retired(shared, &retired);
    Ok(id)
}

fn unlink_retired(shared: &Shared, retired: &[u64]) {
    for &id in retired {
        let path = sstable::table_path(&shared.config.dir, id);
        if let Err(e) = fs::remove_file(&path) {
            tracing::warn!(table_id = id, error = %e, "failed to unlink retired table");
        }
    }
}
