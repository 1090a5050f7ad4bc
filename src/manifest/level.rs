//! A level: one rung of the LSM tree, holding a run of sorted tables.
//!
//! Level 0 receives freshly flushed tables whose key ranges may overlap,
//! so reads probe it newest-first. Levels 1 and up are produced by
//! compaction: their tables are pairwise non-overlapping and kept in
//! ascending key order, so a read binary-searches on first keys and
//! probes a single candidate table.

use std::sync::Arc;

use crate::error::Result;
use crate::memtable::Binding;
use crate::sstable::Table;

#[derive(Debug, Clone)]
pub struct Level {
    number: usize,
    tables: Vec<Arc<Table>>,
}

impl Level {
    pub fn new(number: usize) -> Self {
        Self {
            number,
            tables: Vec::new(),
        }
    }

    pub fn number(&self) -> usize {
        self.number
    }

    pub fn push(&mut self, table: Arc<Table>) {
        self.tables.push(table);
    }

    pub fn tables(&self) -> &[Arc<Table>] {
        &self.tables
    }

    pub fn tables_mut(&mut self) -> &mut Vec<Arc<Table>> {
        &mut self.tables
    }

    pub fn table_count(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    /// Total bytes of all table files in this level.
    pub fn byte_size(&self) -> u64 {
        self.tables.iter().map(|table| table.byte_size()).sum()
    }

    /// Looks up a key in this level. Returns `Some(None)` on a tombstone.
    pub fn get(&self, key: &[u8]) -> Result<Option<Binding>> {
        if self.number == 0 {
            // Ranges may overlap; newest table wins.
            for table in self.tables.iter().rev() {
                if let Some(binding) = table.get(key)? {
                    return Ok(Some(binding));
                }
            }
            return Ok(None);
        }

        // Non-overlapping run: the unique candidate is the table with the
        // largest first key <= key.
        let after = self
            .tables
            .partition_point(|table| table.first_key() <= key);
        match after.checked_sub(1) {
            Some(i) => self.tables[i].get(key),
            None => Ok(None),
        }
    }
}
