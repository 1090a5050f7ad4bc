//! The replicated log: a bounded ring buffer of entries plus the apply
//! worker that feeds committed entries into the storage engine.
//!
//! Four indices describe the log, with the standing invariant
//! `start_index <= last_applied <= committed <= index`:
//!
//! - `start_index`: last index *before* the oldest entry still held
//! - `index`: last appended entry (0 when empty)
//! - `committed`: highest index known replicated on a majority
//! - `last_applied`: highest index executed against the engine
//!
//! The apply worker sleeps on a condition variable that `update_commit`
//! signals, then executes entries strictly in index order, each at most
//! once. Leader-side `wait_committed` waiters share the same signal.
//!
//! Only `committed` is persisted: an 8-byte little-endian value in
//! `raft_log_meta`, memory-mapped and rewritten at shutdown. On startup
//! all four indices seed from it; the entries themselves live in the
//! engine (everything up to `committed` was applied before shutdown) and
//! the tail is re-fetched from the leader.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use byteorder::{ByteOrder, LittleEndian};
use memmap2::MmapMut;

use crate::db::Db;
use crate::error::{Error, Result};
use crate::raft::message::{Entry, Op};

/// Ring buffer capacity in entries.
pub const LOG_CAPACITY: usize = 1 << 18;

const META_FILE: &str = "raft_log_meta";

/// Fixed-capacity FIFO of entries.
struct Ring {
    slots: Vec<Option<Entry>>,
    head: usize,
    len: usize,
}

impl Ring {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: (0..capacity).map(|_| None).collect(),
            head: 0,
            len: 0,
        }
    }

    fn push_back(&mut self, entry: Entry) -> bool {
        if self.len == self.slots.len() {
            return false;
        }
        let tail = (self.head + self.len) % self.slots.len();
        self.slots[tail] = Some(entry);
        self.len += 1;
        true
    }

    fn pop_back(&mut self) -> Option<Entry> {
        if self.len == 0 {
            return None;
        }
        self.len -= 1;
        let tail = (self.head + self.len) % self.slots.len();
        self.slots[tail].take()
    }

    /// Entry at offset `i` from the front, 0-based.
    fn get(&self, i: usize) -> Option<&Entry> {
        if i >= self.len {
            return None;
        }
        self.slots[(self.head + i) % self.slots.len()].as_ref()
    }

    fn len(&self) -> usize {
        self.len
    }
}

struct LogInner {
    ring: Ring,
    start_index: u64,
    committed: u64,
    last_applied: u64,
}

pub struct RaftLog {
    inner: Mutex<LogInner>,
    /// Mirrors the ring's last index so shippers read it without the lock.
    index: AtomicU64,
    /// Signals commit advances to the apply worker and put waiters.
    commit_cv: Condvar,
    stop: AtomicBool,
    db: Arc<Db>,
    dir: PathBuf,
    apply_worker: Mutex<Option<JoinHandle<()>>>,
}

impl RaftLog {
    /// Opens the log, seeding indices from the persisted commit point, and
    /// starts the apply worker.
    pub fn open(dir: impl Into<PathBuf>, db: Arc<Db>) -> Result<Arc<RaftLog>> {
        Self::open_with_capacity(dir, db, LOG_CAPACITY)
    }

    fn open_with_capacity(
        dir: impl Into<PathBuf>,
        db: Arc<Db>,
        capacity: usize,
    ) -> Result<Arc<RaftLog>> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        let committed = read_meta(&dir.join(META_FILE))?;
        tracing::info!(committed, "opened replicated log");

        let log = Arc::new(RaftLog {
            inner: Mutex::new(LogInner {
                ring: Ring::with_capacity(capacity),
                start_index: committed,
                committed,
                last_applied: committed,
            }),
            index: AtomicU64::new(committed),
            commit_cv: Condvar::new(),
            stop: AtomicBool::new(false),
            db,
            dir,
            apply_worker: Mutex::new(None),
        });

        let worker_log = Arc::clone(&log);
        let handle = thread::Builder::new()
            .name("emberkv-apply".to_string())
            .spawn(move || run_apply_worker(worker_log))?;
        *log.apply_worker.lock().unwrap() = Some(handle);
        Ok(log)
    }

    /// Last appended index; lock-free.
    pub fn index(&self) -> u64 {
        self.index.load(Ordering::SeqCst)
    }

    pub fn committed(&self) -> u64 {
        self.inner.lock().unwrap().committed
    }

    pub fn last_applied(&self) -> u64 {
        self.inner.lock().unwrap().last_applied
    }

    pub fn start_index(&self) -> u64 {
        self.inner.lock().unwrap().start_index
    }

    /// Appends a leader-side mutation, returning its assigned index.
    pub fn append(&self, key: Vec<u8>, value: Vec<u8>, op: Op, term: u64) -> Result<u64> {
        let mut inner = self.inner.lock().unwrap();
        if self.stop.load(Ordering::SeqCst) {
            return Err(Error::Stopped);
        }
        let index = self.index.load(Ordering::SeqCst) + 1;
        let entry = Entry {
            key,
            value,
            op,
            term,
            index,
        };
        if !inner.ring.push_back(entry) {
            return Err(Error::LogFull);
        }
        self.index.store(index, Ordering::SeqCst);
        Ok(index)
    }

    /// Appends a pre-formed entry from the leader. Its index must follow
    /// the current tail exactly.
    pub fn append_entry(&self, entry: Entry) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if self.stop.load(Ordering::SeqCst) {
            return Err(Error::Stopped);
        }
        let index = self.index.load(Ordering::SeqCst);
        if entry.index != index + 1 {
            return Err(Error::InvalidOperation(format!(
                "entry index {} does not follow tail {index}",
                entry.index
            )));
        }
        if !inner.ring.push_back(entry) {
            return Err(Error::LogFull);
        }
        self.index.store(index + 1, Ordering::SeqCst);
        Ok(())
    }

    /// Random access; valid for `start_index < index <= self.index()`.
    pub fn entry_at(&self, index: u64) -> Option<Entry> {
        let inner = self.inner.lock().unwrap();
        if index <= inner.start_index {
            return None;
        }
        inner.ring.get((index - inner.start_index - 1) as usize).cloned()
    }

    pub fn term_at(&self, index: u64) -> Option<u64> {
        let inner = self.inner.lock().unwrap();
        if index <= inner.start_index {
            return None;
        }
        inner
            .ring
            .get((index - inner.start_index - 1) as usize)
            .map(|entry| entry.term)
    }

    /// Drops tail entries until the last index equals `expected_last`.
    /// Never truncates below the commit point; the effective target is
    /// clamped there.
    pub fn truncate_to(&self, expected_last: u64) {
        let mut inner = self.inner.lock().unwrap();
        let target = expected_last.max(inner.committed);
        if target > expected_last {
            tracing::warn!(
                expected_last,
                committed = inner.committed,
                "refusing to truncate below commit point"
            );
        }
        let mut index = self.index.load(Ordering::SeqCst);
        while index > target {
            inner.ring.pop_back();
            index -= 1;
        }
        self.index.store(index, Ordering::SeqCst);
    }

    /// Raises the commit point: `committed <- min(index, max(committed,
    /// leader_commit))`, waking the apply worker and any waiters.
    pub fn update_commit(&self, leader_commit: u64) {
        let mut inner = self.inner.lock().unwrap();
        let index = self.index.load(Ordering::SeqCst);
        let next = leader_commit.max(inner.committed).min(index);
        if next != inner.committed {
            inner.committed = next;
            self.commit_cv.notify_all();
        }
    }

    /// Blocks until `committed >= index`, the deadline passes, or the log
    /// stops. Returns whether the commit point reached the index.
    pub fn wait_committed(&self, index: u64, timeout: Duration) -> Result<bool> {
        let deadline = std::time::Instant::now() + timeout;
        let mut inner = self.inner.lock().unwrap();
        loop {
            if inner.committed >= index {
                return Ok(true);
            }
            if self.stop.load(Ordering::SeqCst) {
                return Err(Error::Stopped);
            }
            let now = std::time::Instant::now();
            if now >= deadline {
                return Ok(false);
            }
            let (guard, _) = self
                .commit_cv
                .wait_timeout(inner, deadline - now)
                .unwrap();
            inner = guard;
        }
    }

    /// Blocks until every committed entry has been applied to the engine.
    pub fn wait_applied(&self, timeout: Duration) -> bool {
        let deadline = std::time::Instant::now() + timeout;
        let mut inner = self.inner.lock().unwrap();
        while inner.last_applied < inner.committed {
            let now = std::time::Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, _) = self
                .commit_cv
                .wait_timeout(inner, (deadline - now).min(Duration::from_millis(20)))
                .unwrap();
            inner = guard;
        }
        true
    }

    /// Stops the apply worker (draining committed entries first) and
    /// persists the commit point.
    pub fn shutdown(&self) {
        if self.stop.swap(true, Ordering::SeqCst) {
            return;
        }
        self.commit_cv.notify_all();
        if let Some(handle) = self.apply_worker.lock().unwrap().take() {
            let _ = handle.join();
        }
        let committed = self.inner.lock().unwrap().committed;
        if let Err(e) = write_meta(&self.dir.join(META_FILE), committed) {
            tracing::error!(error = %e, "failed to persist replicated log metadata");
        } else {
            tracing::info!(committed, "persisted replicated log metadata");
        }
    }
}

impl Drop for RaftLog {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_apply_worker(log: Arc<RaftLog>) {
    loop {
        let entry = {
            let mut inner = log.inner.lock().unwrap();
            loop {
                if inner.last_applied < inner.committed {
                    let next = inner.last_applied + 1;
                    let offset = (next - inner.start_index - 1) as usize;
                    break inner.ring.get(offset).cloned();
                }
                if log.stop.load(Ordering::SeqCst) {
                    return;
                }
                inner = log.commit_cv.wait(inner).unwrap();
            }
        };

        // A committed index below the ring start means those entries were
        // already applied before a restart; just advance past them.
        let applied = match &entry {
            None => Ok(()),
            Some(entry) => match entry.op {
                Op::Put => log.db.put(&entry.key, entry.value.clone()),
                Op::Delete => log.db.delete(&entry.key),
            },
        };

        match applied {
            Ok(()) => {
                let mut inner = log.inner.lock().unwrap();
                inner.last_applied += 1;
                log.commit_cv.notify_all();
            }
            Err(e) => {
                tracing::warn!(error = %e, "apply failed, retrying");
                thread::sleep(Duration::from_millis(10));
            }
        }
    }
}

fn read_meta(path: &Path) -> Result<u64> {
    match std::fs::read(path) {
        Ok(data) if data.len() >= 8 => Ok(LittleEndian::read_u64(&data[0..8])),
        Ok(data) => Err(Error::Corruption(format!(
            "replicated log metadata holds {} bytes, want 8",
            data.len()
        ))),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
        Err(e) => Err(e.into()),
    }
}

fn write_meta(path: &Path, committed: u64) -> Result<()> {
    let file = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(false)
        .open(path)?;
    file.set_len(8)?;
    // Safety: the mapping is private to this call and flushed before drop.
    let mut mmap = unsafe { MmapMut::map_mut(&file)? };
    LittleEndian::write_u64(&mut mmap[0..8], committed);
    mmap.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DbConfig;
    use tempfile::TempDir;

    fn open_db(dir: &TempDir) -> Arc<Db> {
        Arc::new(Db::open(DbConfig::new(dir.path())).expect("failed to open db"))
    }

    fn append_n(log: &RaftLog, n: usize, term: u64) {
        for i in 0..n {
            log.append(
                format!("k{i}").into_bytes(),
                format!("v{i}").into_bytes(),
                Op::Put,
                term,
            )
            .expect("append failed");
        }
    }

    #[test]
    fn test_ring_push_pop_get() {
        let mut ring = Ring::with_capacity(4);
        for i in 0..4u64 {
            assert!(ring.push_back(Entry {
                key: vec![i as u8],
                value: vec![],
                op: Op::Put,
                term: 1,
                index: i + 1,
            }));
        }
        assert!(!ring.push_back(Entry {
            key: vec![9],
            value: vec![],
            op: Op::Put,
            term: 1,
            index: 5,
        }));
        assert_eq!(ring.len(), 4);
        assert_eq!(ring.get(0).expect("missing entry").index, 1);
        assert_eq!(ring.get(3).expect("missing entry").index, 4);
        assert!(ring.get(4).is_none());

        assert_eq!(ring.pop_back().expect("missing entry").index, 4);
        assert_eq!(ring.len(), 3);

        // The freed slot is reusable; the ring wraps.
        assert!(ring.push_back(Entry {
            key: vec![9],
            value: vec![],
            op: Op::Put,
            term: 1,
            index: 4,
        }));
        assert_eq!(ring.get(3).expect("missing entry").key, vec![9]);
    }

    #[test]
    fn test_append_assigns_monotonic_indices() {
        let dir = TempDir::new().expect("failed to create temp dir");
        let log = RaftLog::open(dir.path(), open_db(&dir)).expect("failed to open log");

        let first = log
            .append(b"a".to_vec(), b"1".to_vec(), Op::Put, 1)
            .expect("append failed");
        let second = log
            .append(b"b".to_vec(), b"2".to_vec(), Op::Put, 1)
            .expect("append failed");

        assert_eq!(first, 1);
        assert_eq!(second, 2);
        assert_eq!(log.index(), 2);
        assert_eq!(log.entry_at(1).expect("missing entry").key, b"a".to_vec());
        assert_eq!(log.term_at(2), Some(1));
        assert!(log.entry_at(3).is_none());
        assert!(log.entry_at(0).is_none());

        log.shutdown();
    }

    #[test]
    fn test_append_entry_requires_sequential_index() {
        let dir = TempDir::new().expect("failed to create temp dir");
        let log = RaftLog::open(dir.path(), open_db(&dir)).expect("failed to open log");

        let entry = |index| Entry {
            key: b"k".to_vec(),
            value: b"v".to_vec(),
            op: Op::Put,
            term: 1,
            index,
        };
        assert!(matches!(
            log.append_entry(entry(2)),
            Err(Error::InvalidOperation(_))
        ));
        log.append_entry(entry(1)).expect("append failed");
        log.append_entry(entry(2)).expect("append failed");
        assert_eq!(log.index(), 2);

        log.shutdown();
    }

    #[test]
    fn test_log_full() {
        let dir = TempDir::new().expect("failed to create temp dir");
        let log = RaftLog::open_with_capacity(dir.path(), open_db(&dir), 4)
            .expect("failed to open log");

        append_n(&log, 4, 1);
        assert!(matches!(
            log.append(b"k".to_vec(), b"v".to_vec(), Op::Put, 1),
            Err(Error::LogFull)
        ));

        log.shutdown();
    }

    #[test]
    fn test_update_commit_clamps_and_is_monotonic() {
        let dir = TempDir::new().expect("failed to create temp dir");
        let log = RaftLog::open(dir.path(), open_db(&dir)).expect("failed to open log");

        append_n(&log, 3, 1);
        log.update_commit(2);
        assert_eq!(log.committed(), 2);

        // Leader commit beyond our tail clamps to the tail.
        log.update_commit(10);
        assert_eq!(log.committed(), 3);

        // Never regresses.
        log.update_commit(1);
        assert_eq!(log.committed(), 3);

        log.shutdown();
    }

    #[test]
    fn test_truncate_to_clamps_at_commit_point() {
        let dir = TempDir::new().expect("failed to create temp dir");
        let log = RaftLog::open(dir.path(), open_db(&dir)).expect("failed to open log");

        append_n(&log, 5, 1);
        log.update_commit(2);

        log.truncate_to(3);
        assert_eq!(log.index(), 3);

        log.truncate_to(1);
        assert_eq!(log.index(), 2, "must not drop committed entries");

        log.shutdown();
    }

    #[test]
    fn test_apply_worker_feeds_engine_in_order() {
        let dir = TempDir::new().expect("failed to create temp dir");
        let db = open_db(&dir);
        let log = RaftLog::open(dir.path(), Arc::clone(&db)).expect("failed to open log");

        log.append(b"k".to_vec(), b"v1".to_vec(), Op::Put, 1)
            .expect("append failed");
        log.append(b"k".to_vec(), b"v2".to_vec(), Op::Put, 1)
            .expect("append failed");
        log.append(b"gone".to_vec(), b"x".to_vec(), Op::Put, 1)
            .expect("append failed");
        log.append(b"gone".to_vec(), Vec::new(), Op::Delete, 1)
            .expect("append failed");

        log.update_commit(4);
        assert!(log.wait_applied(Duration::from_secs(5)), "apply timed out");

        assert_eq!(log.last_applied(), 4);
        assert_eq!(db.get(b"k").expect("get failed"), Some(b"v2".to_vec()));
        assert_eq!(db.get(b"gone").expect("get failed"), None);

        log.shutdown();
    }

    #[test]
    fn test_wait_committed() {
        let dir = TempDir::new().expect("failed to create temp dir");
        let log = RaftLog::open(dir.path(), open_db(&dir)).expect("failed to open log");

        append_n(&log, 1, 1);
        assert!(!log
            .wait_committed(1, Duration::from_millis(50))
            .expect("wait failed"));

        let waiter = {
            let log = Arc::clone(&log);
            thread::spawn(move || log.wait_committed(1, Duration::from_secs(5)))
        };
        thread::sleep(Duration::from_millis(20));
        log.update_commit(1);
        assert!(waiter
            .join()
            .expect("waiter panicked")
            .expect("wait failed"));

        log.shutdown();
    }

    #[test]
    fn test_meta_persistence_roundtrip() {
        let dir = TempDir::new().expect("failed to create temp dir");
        {
            let db = open_db(&dir);
            let log = RaftLog::open(dir.path(), db).expect("failed to open log");
            append_n(&log, 3, 1);
            log.update_commit(3);
            assert!(log.wait_applied(Duration::from_secs(5)));
            log.shutdown();
        }

        let db = open_db(&dir);
        let log = RaftLog::open(dir.path(), db).expect("failed to open log");
        // All indices seed from the persisted commit point; the tail is
        // gone and will be re-fetched from the leader.
        assert_eq!(log.start_index(), 3);
        assert_eq!(log.index(), 3);
        assert_eq!(log.committed(), 3);
        assert_eq!(log.last_applied(), 3);
        assert!(log.entry_at(3).is_none());

        log.shutdown();
    }

    #[test]
    fn test_invariant_ordering_of_indices() {
        let dir = TempDir::new().expect("failed to create temp dir");
        let log = RaftLog::open(dir.path(), open_db(&dir)).expect("failed to open log");

        append_n(&log, 10, 2);
        log.update_commit(7);
        assert!(log.wait_applied(Duration::from_secs(5)));

        let start = log.start_index();
        let applied = log.last_applied();
        let committed = log.committed();
        let index = log.index();
        assert!(start <= applied && applied <= committed && committed <= index);
        assert_eq!(committed, 7);
        assert_eq!(index, 10);

        log.shutdown();
    }
}
