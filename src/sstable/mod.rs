//! Immutable sorted tables: the persistent form of a frozen memtable.
//!
//! An SST holds a sequence of data blocks whose keys are strictly
//! increasing across the whole file, fronted by an index block mapping
//! each data block's first key to its offset. Every data block carries
//! its own Bloom filter so point lookups touch at most one block, and
//! usually none when the key is absent.

pub mod block;
pub mod index;
pub mod table;

pub use block::{Block, BlockBuilder};
pub use index::Index;
pub use table::{Table, TableBuilder, TableIterator};

use std::path::{Path, PathBuf};

/// Path of the table file for an SST id within a database directory.
pub fn table_path(dir: &Path, id: u64) -> PathBuf {
    dir.join(format!("{id}.sst"))
}
