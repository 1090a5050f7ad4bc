//! SST file lifecycle: building, opening and reading.
//!
//! File layout:
//!
//! ```text
//! +-------------------+
//! | Index Block       |
//! +-------------------+
//! | Data Block 0      |
//! +-------------------+
//! | Data Block 1      |
//! +-------------------+
//! | ...               |
//! +-------------------+
//! ```
//!
//! The index block leads the file, so the builder buffers every encoded
//! data block, computes the index size, and only then lays the file down
//! in one pass. Readers memory-map the file, keep the parsed index in
//! memory, and fetch data blocks through the block cache under the key
//! `(sst_id, block_offset)`.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use memmap2::Mmap;

use super::block::{self, Block, BlockBuilder};
use super::index::Index;
use crate::cache::BlockCache;
use crate::config::CompressionConfig;
use crate::error::{Error, Result};
use crate::memtable::Binding;

/// Builds an SST from an ascending entry stream.
pub struct TableBuilder {
    target_block_size: usize,
    compression: CompressionConfig,
    blocks: Vec<(Vec<u8>, Vec<u8>)>,
    current: BlockBuilder,
    last_key: Option<Vec<u8>>,
    entries: usize,
}

impl TableBuilder {
    pub fn new(target_block_size: usize, compression: CompressionConfig) -> Self {
        Self {
            target_block_size,
            compression,
            blocks: Vec::new(),
            current: BlockBuilder::new(),
            last_key: None,
            entries: 0,
        }
    }

    /// Adds an entry. Keys must be strictly ascending; duplicates are a
    /// caller bug and rejected.
    pub fn add(&mut self, key: &[u8], value: Option<&[u8]>) -> Result<()> {
        if let Some(last) = &self.last_key {
            if key <= last.as_slice() {
                return Err(Error::InvalidOperation(format!(
                    "keys must be added in ascending order: {key:?} after {last:?}"
                )));
            }
        }
        self.last_key = Some(key.to_vec());
        self.entries += 1;

        self.current.add(key, value);
        if self.current.payload_len() >= self.target_block_size {
            self.cut()?;
        }
        Ok(())
    }

    fn cut(&mut self) -> Result<()> {
        if self.current.is_empty() {
            return Ok(());
        }
        let builder = std::mem::take(&mut self.current);
        let first_key = builder
            .first_key()
            .expect("non-empty builder has a first key")
            .to_vec();
        let encoded = builder.finish(&self.compression)?;
        self.blocks.push((first_key, encoded));
        Ok(())
    }

    pub fn entry_count(&self) -> usize {
        self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries == 0
    }

    /// Writes the finished table to `path`. Refuses to write a table with
    /// no entries.
    pub fn write_to(mut self, path: &Path) -> Result<()> {
        self.cut()?;
        if self.blocks.is_empty() {
            return Err(Error::InvalidOperation(
                "refusing to write an empty table".to_string(),
            ));
        }

        let index_size =
            Index::encoded_size(self.blocks.iter().map(|(first_key, _)| first_key.len()));
        let mut index = Index::new();
        let mut offset = index_size as u64;
        for (first_key, encoded) in &self.blocks {
            index.push(first_key.clone(), offset);
            offset += encoded.len() as u64;
        }

        let mut file = OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(path)?;
        file.write_all(&index.encode())?;
        for (_, encoded) in &self.blocks {
            file.write_all(encoded)?;
        }
        file.sync_all()?;
        Ok(())
    }
}

/// An open, immutable sorted table.
pub struct Table {
    id: u64,
    path: PathBuf,
    mmap: Mmap,
    index: Index,
    first_key: Vec<u8>,
    last_key: Vec<u8>,
    entry_count: u64,
    compression: CompressionConfig,
    cache: Option<Arc<BlockCache>>,
}

impl Table {
    /// Opens and memory-maps the table file, parsing the index block and
    /// validating block extents. Fails closed on any inconsistency.
    pub fn open(
        path: impl Into<PathBuf>,
        id: u64,
        compression: CompressionConfig,
        cache: Option<Arc<BlockCache>>,
    ) -> Result<Table> {
        let path = path.into();
        let file = File::open(&path)
            .map_err(|e| Error::Io(format!("failed to open {}: {e}", path.display())))?;
        // Safety: the file is never written after creation; tables are
        // immutable once built.
        let mmap = unsafe { Mmap::map(&file)? };

        let index = Index::decode(&mmap)?;
        if index.is_empty() {
            return Err(Error::Corruption(format!(
                "table {} has an empty index",
                path.display()
            )));
        }
        let file_len = mmap.len() as u64;
        for (i, entry) in index.entries().iter().enumerate() {
            let end = index
                .entries()
                .get(i + 1)
                .map(|next| next.offset)
                .unwrap_or(file_len);
            if entry.offset >= end || end > file_len {
                return Err(Error::Corruption(format!(
                    "table {} block {i} spans {}..{end} beyond file length {file_len}",
                    path.display(),
                    entry.offset
                )));
            }
        }

        let first_key = index.entries()[0].first_key.clone();

        // Walk block headers for the total entry count, and decode the last
        // block for the table's last key; compaction needs the key range.
        let mut entry_count = 0;
        for i in 0..index.len() {
            let raw = Self::raw_block(&mmap, &index, i);
            entry_count += block::entry_count(raw, &compression)?;
        }
        let last_block = Block::decode(Self::raw_block(&mmap, &index, index.len() - 1), &compression)?;
        let last_key = last_block
            .entries()
            .last()
            .ok_or_else(|| {
                Error::Corruption(format!("table {} has an empty last block", path.display()))
            })?
            .0
            .clone();

        Ok(Table {
            id,
            path,
            mmap,
            index,
            first_key,
            last_key,
            entry_count,
            compression,
            cache,
        })
    }

    fn raw_block<'a>(mmap: &'a Mmap, index: &Index, i: usize) -> &'a [u8] {
        let start = index.entries()[i].offset as usize;
        let end = index
            .entries()
            .get(i + 1)
            .map(|next| next.offset as usize)
            .unwrap_or(mmap.len());
        &mmap[start..end]
    }

    /// Fetches and decodes one data block, consulting the cache first.
    fn block(&self, i: usize) -> Result<Block> {
        let offset = self.index.entries()[i].offset;
        if let Some(cache) = &self.cache {
            if let Some(raw) = cache.get(self.id, offset) {
                return Block::decode(&raw, &self.compression);
            }
            let raw = Arc::new(Self::raw_block(&self.mmap, &self.index, i).to_vec());
            let parsed = Block::decode(&raw, &self.compression)?;
            cache.put(self.id, offset, raw);
            return Ok(parsed);
        }
        Block::decode(Self::raw_block(&self.mmap, &self.index, i), &self.compression)
    }

    /// Point lookup. Returns `Some(None)` when the key is tombstoned here.
    pub fn get(&self, key: &[u8]) -> Result<Option<Binding>> {
        let Some(i) = self.index.find(key) else {
            return Ok(None);
        };
        Ok(self.block(i)?.get(key))
    }

    /// Index of the data block whose key range may hold the key.
    pub fn block_index_for(&self, key: &[u8]) -> Option<usize> {
        self.index.find(key)
    }

    /// Fetches and decodes one data block through the cache.
    pub fn read_block(&self, i: usize) -> Result<Block> {
        self.block(i)
    }

    /// Ascending iteration over every entry in the table.
    pub fn iter(&self) -> TableIterator<'_> {
        TableIterator {
            table: self,
            next_block: 0,
            entries: Vec::new(),
            pos: 0,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn first_key(&self) -> &[u8] {
        &self.first_key
    }

    pub fn last_key(&self) -> &[u8] {
        &self.last_key
    }

    pub fn entry_count(&self) -> u64 {
        self.entry_count
    }

    /// Size of the backing file in bytes.
    pub fn byte_size(&self) -> u64 {
        self.mmap.len() as u64
    }

    pub fn block_count(&self) -> usize {
        self.index.len()
    }
}

impl std::fmt::Debug for Table {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Table")
            .field("id", &self.id)
            .field("path", &self.path)
            .field("blocks", &self.index.len())
            .field("entries", &self.entry_count)
            .finish()
    }
}

/// Lazy ascending iterator over all entries of a table, one block at a time.
pub struct TableIterator<'a> {
    table: &'a Table,
    next_block: usize,
    entries: Vec<(Vec<u8>, Binding)>,
    pos: usize,
}

impl Iterator for TableIterator<'_> {
    type Item = Result<(Vec<u8>, Binding)>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.pos < self.entries.len() {
                let entry = self.entries[self.pos].clone();
                self.pos += 1;
                return Some(Ok(entry));
            }
            if self.next_block >= self.table.block_count() {
                return None;
            }
            match self.table.block(self.next_block) {
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compression::Codec;
    use crate::config::BlockCacheConfig;
    use tempfile::TempDir;

    fn entries(n: usize) -> Vec<(Vec<u8>, Binding)> {
        (0..n)
            .map(|i| {
                let key = format!("key_{i:04}").into_bytes();
                let value = if i % 7 == 3 {
                    None
                } else {
                    Some(format!("value_{i:04}").into_bytes())
                };
                (key, value)
            })
            .collect()
    }

    fn build_table(
        dir: &TempDir,
        id: u64,
        block_size: usize,
        compression: CompressionConfig,
        data: &[(Vec<u8>, Binding)],
    ) -> Table {
        let path = dir.path().join(format!("{id}.sst"));
        let mut builder = TableBuilder::new(block_size, compression);
        for (key, value) in data {
            builder.add(key, value.as_deref()).expect("add failed");
        }
        builder.write_to(&path).expect("failed to write table");
        Table::open(&path, id, compression, None).expect("failed to open table")
    }

    #[test]
    fn test_build_and_read_roundtrip() {
        let dir = TempDir::new().expect("failed to create temp dir");
        let data = entries(100);
        let table = build_table(&dir, 1, 256, CompressionConfig::default(), &data);

        assert!(table.block_count() > 1, "expected multiple blocks");
        assert_eq!(table.entry_count(), 100);
        assert_eq!(table.first_key(), b"key_0000");
        assert_eq!(table.last_key(), b"key_0099");

        for (key, value) in &data {
            assert_eq!(table.get(key).expect("get failed"), Some(value.clone()));
        }
        assert_eq!(table.get(b"missing").expect("get failed"), None);
    }

    #[test]
    fn test_iteration_reproduces_input_order() {
        let dir = TempDir::new().expect("failed to create temp dir");
        let data = entries(200);
        let table = build_table(&dir, 2, 128, CompressionConfig::default(), &data);

        let scanned: Vec<_> = table
            .iter()
            .collect::<Result<Vec<_>>>()
            .expect("iteration failed");
        assert_eq!(scanned, data);
    }

    #[test]
    fn test_compressed_table_roundtrip() {
        for codec in [Codec::Lz4, Codec::Snappy] {
            let dir = TempDir::new().expect("failed to create temp dir");
            let compression = CompressionConfig::default()
                .codec(codec)
                .enabled(true)
                .min_size_to_compress(16);
            let data = entries(150);
            let table = build_table(&dir, 3, 512, compression, &data);

            let scanned: Vec<_> = table
                .iter()
                .collect::<Result<Vec<_>>>()
                .expect("iteration failed");
            assert_eq!(scanned, data);
            assert_eq!(
                table.get(b"key_0003").expect("get failed"),
                Some(None),
                "tombstone must survive compression"
            );
        }
    }

    #[test]
    fn test_single_entry_table() {
        let dir = TempDir::new().expect("failed to create temp dir");
        let data = vec![(b"only".to_vec(), Some(b"one".to_vec()))];
        let table = build_table(&dir, 4, 4096, CompressionConfig::default(), &data);

        assert_eq!(table.block_count(), 1);
        assert_eq!(table.entry_count(), 1);
        assert_eq!(
            table.get(b"only").expect("get failed"),
            Some(Some(b"one".to_vec()))
        );
        assert_eq!(table.get(b"other").expect("get failed"), None);
    }

    #[test]
    fn test_empty_builder_refuses_to_write() {
        let dir = TempDir::new().expect("failed to create temp dir");
        let builder = TableBuilder::new(4096, CompressionConfig::default());
        assert!(matches!(
            builder.write_to(&dir.path().join("0.sst")),
            Err(Error::InvalidOperation(_))
        ));
    }

    #[test]
    fn test_out_of_order_keys_rejected() {
        let mut builder = TableBuilder::new(4096, CompressionConfig::default());
        builder.add(b"b", Some(b"1")).expect("add failed");
        assert!(matches!(
            builder.add(b"a", Some(b"2")),
            Err(Error::InvalidOperation(_))
        ));
        assert!(matches!(
            builder.add(b"b", Some(b"2")),
            Err(Error::InvalidOperation(_))
        ));
    }

    #[test]
    fn test_open_missing_file_fails() {
        let dir = TempDir::new().expect("failed to create temp dir");
        assert!(Table::open(
            dir.path().join("9.sst"),
            9,
            CompressionConfig::default(),
            None
        )
        .is_err());
    }

    #[test]
    fn test_open_truncated_file_fails_closed() {
        let dir = TempDir::new().expect("failed to create temp dir");
        let data = entries(50);
        let path = dir.path().join("5.sst");
        let mut builder = TableBuilder::new(256, CompressionConfig::default());
        for (key, value) in &data {
            builder.add(key, value.as_deref()).expect("add failed");
        }
        builder.write_to(&path).expect("failed to write table");

        let bytes = std::fs::read(&path).expect("failed to read file");
        std::fs::write(&path, &bytes[..bytes.len() / 2]).expect("failed to truncate");

        assert!(Table::open(&path, 5, CompressionConfig::default(), None).is_err());
    }

    #[test]
    fn test_block_cache_is_populated_and_hit() {
        let dir = TempDir::new().expect("failed to create temp dir");
        let data = entries(100);
        let path = dir.path().join("6.sst");
        let mut builder = TableBuilder::new(256, CompressionConfig::default());
        for (key, value) in &data {
            builder.add(key, value.as_deref()).expect("add failed");
        }
        builder.write_to(&path).expect("failed to write table");

        let cache = Arc::new(BlockCache::new(
            BlockCacheConfig::default()
                .min_block_size(64)
                .max_block_size(64 * 1024),
        ));
        let table = Table::open(&path, 6, CompressionConfig::default(), Some(Arc::clone(&cache)))
            .expect("failed to open table");

        table.get(b"key_0000").expect("get failed");
        let after_first = cache.stats();
        assert!(after_first.count > 0, "block should have been cached");

        table.get(b"key_0000").expect("get failed");
        let after_second = cache.stats();
        assert!(after_second.hits > after_first.hits, "second read should hit");
    }
}
