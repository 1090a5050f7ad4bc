//! The manifest: a versioned, copy-on-write catalog of sorted tables
//! arranged into levels.
//!
//! Every mutation (a flush insert or a compaction) produces a brand-new
//! `Manifest` value with a bumped version; published versions are shared
//! behind `Arc` and never change, so readers work against a consistent
//! snapshot while the flush worker prepares the next one. A concurrent
//! read sees either the old version or the new, never a half-built one.
//!
//! On-disk format, all integers little-endian u64:
//!
//! ```text
//! [version:8][level_count:8]
//!   per level: [sst_id:8]... [0xFFFFFFFFFFFFFFFF:8]
//! ```
//!
//! The all-ones sentinel terminates each level's id list. The file is
//! rewritten through a temp file and an atomic rename every time a new
//! version is published, so a crash always leaves a readable catalog.

pub mod compaction;
pub mod level;

pub use compaction::{compact, compact_from, compact_level, CompactionCtx};
pub use level::Level;

use std::fs::{self, File};
use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use byteorder::{ByteOrder, LittleEndian};

use crate::cache::BlockCache;
use crate::config::CompressionConfig;
use crate::error::{Error, Result};
use crate::memtable::Binding;
use crate::sstable::{self, Table};

/// Maximum number of levels.
pub const MAX_LEVELS: usize = 5;

const MANIFEST_FILE: &str = "manifest";
const LEVEL_SENTINEL: u64 = u64::MAX;

/// Byte-size threshold above which a level is compacted into the next.
pub fn level_threshold(level: usize) -> u64 {
    const THRESHOLDS: [u64; MAX_LEVELS] = [
        1024,
        10 * 1024 * 1024,
        100 * 1024 * 1024,
        1000 * 1024 * 1024,
        10000 * 1024 * 1024,
    ];
    THRESHOLDS[level.min(MAX_LEVELS - 1)]
}

#[derive(Debug, Clone)]
pub struct Manifest {
    version: u64,
    levels: Vec<Level>,
    max_sst_id: u64,
}

impl Default for Manifest {
    fn default() -> Self {
        Self::new()
    }
}

impl Manifest {
    pub fn new() -> Self {
        Self {
            version: 1,
            levels: vec![Level::new(0)],
            max_sst_id: 0,
        }
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn max_sst_id(&self) -> u64 {
        self.max_sst_id
    }

    pub fn levels(&self) -> &[Level] {
        &self.levels
    }

    pub(crate) fn levels_mut(&mut self) -> &mut Vec<Level> {
        &mut self.levels
    }

    pub(crate) fn note_sst_id(&mut self, id: u64) {
        self.max_sst_id = self.max_sst_id.max(id);
    }

    /// Total number of tables across all levels.
    pub fn table_count(&self) -> usize {
        self.levels.iter().map(|level| level.table_count()).sum()
    }

    /// Ids of every table referenced by this version.
    pub fn table_ids(&self) -> Vec<u64> {
        self.levels
            .iter()
            .flat_map(|level| level.tables().iter().map(|table| table.id()))
            .collect()
    }

    /// Looks up a key level by level, lowest (newest) first. Returns
    /// `Some(None)` when the newest binding is a tombstone.
    pub fn get(&self, key: &[u8]) -> Result<Option<Binding>> {
        for level in &self.levels {
            if let Some(binding) = level.get(key)? {
                return Ok(Some(binding));
            }
        }
        Ok(None)
    }

    /// Produces the next version with the table appended to level 0.
    pub fn insert_and_update(&self, table: Arc<Table>) -> Manifest {
        let mut next = self.clone();
        next.version += 1;
        next.max_sst_id = next.max_sst_id.max(table.id());
        next.levels[0].push(table);
        next
    }

    /// True when level 0 has outgrown its threshold.
    pub fn can_compact(&self) -> bool {
        self.levels[0].byte_size() > level_threshold(0)
    }

    /// Serializes this version to `dir/manifest` via temp file + rename.
    pub fn save(&self, dir: &Path) -> Result<()> {
        let mut buf = Vec::with_capacity(16 + self.table_count() * 8 + self.levels.len() * 8);
        let mut word = [0u8; 8];
        LittleEndian::write_u64(&mut word, self.version);
        buf.extend_from_slice(&word);
        LittleEndian::write_u64(&mut word, self.levels.len() as u64);
        buf.extend_from_slice(&word);
        for level in &self.levels {
            for table in level.tables() {
                LittleEndian::write_u64(&mut word, table.id());
                buf.extend_from_slice(&word);
            }
            LittleEndian::write_u64(&mut word, LEVEL_SENTINEL);
            buf.extend_from_slice(&word);
        }

        let tmp = dir.join(format!("{MANIFEST_FILE}.tmp"));
        let mut file = File::create(&tmp)?;
        file.write_all(&buf)?;
        file.sync_all()?;
        fs::rename(&tmp, dir.join(MANIFEST_FILE))?;
        Ok(())
    }

    /// Loads the newest catalog from `dir/manifest`, opening every table
    /// it references. Returns `None` when no manifest exists yet; fails
    /// closed when the file or any referenced table is unreadable.
    pub fn load(
        dir: &Path,
        compression: CompressionConfig,
        cache: Option<Arc<BlockCache>>,
    ) -> Result<Option<Manifest>> {
        let path = dir.join(MANIFEST_FILE);
        let data = match fs::read(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if data.len() < 16 || data.len() % 8 != 0 {
            return Err(Error::Corruption(format!(
                "manifest has invalid length {}",
                data.len()
            )));
        }

        let version = LittleEndian::read_u64(&data[0..8]);
        let level_count = LittleEndian::read_u64(&data[8..16]) as usize;
        if level_count == 0 || level_count > MAX_LEVELS {
            return Err(Error::Corruption(format!(
                "manifest has {level_count} levels"
            )));
        }

        let mut levels = Vec::with_capacity(level_count);
        let mut max_sst_id = 0;
        let mut pos = 16;
        for number in 0..level_count {
            let mut level = Level::new(number);
            loop {
                if pos + 8 > data.len() {
                    return Err(Error::Corruption("manifest level truncated".to_string()));
                }
                let id = LittleEndian::read_u64(&data[pos..pos + 8]);
                pos += 8;
                if id == LEVEL_SENTINEL {
                    break;
                }
                let table = Table::open(
                    sstable::table_path(dir, id),
                    id,
                    compression,
                    cache.clone(),
                )?;
                max_sst_id = max_sst_id.max(id);
                level.push(Arc::new(table));
            }
            levels.push(level);
        }
        if pos != data.len() {
            return Err(Error::Corruption(format!(
                "manifest has {} trailing bytes",
                data.len() - pos
            )));
        }

        Ok(Some(Manifest {
            version,
            levels,
            max_sst_id,
        }))
    }
}
