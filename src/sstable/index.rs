//! The index block: the SST header mapping each data block's first key to
//! its absolute file offset.
//!
//! ```text
//! [index_block_size:8][data_block_count:8]
//!   per data block: [block_offset:8][first_key_len:8][first_key]
//! ```
//!
//! Offsets are absolute within the file, so the first data block's offset
//! equals the index block's own encoded size.

use byteorder::{ByteOrder, LittleEndian};

use crate::error::{Error, Result};

#[derive(Debug, Clone)]
pub struct IndexEntry {
    pub offset: u64,
    pub first_key: Vec<u8>,
}

#[derive(Debug, Clone, Default)]
pub struct Index {
    entries: Vec<IndexEntry>,
}

impl Index {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    pub fn push(&mut self, first_key: Vec<u8>, offset: u64) {
        self.entries.push(IndexEntry { offset, first_key });
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[IndexEntry] {
        &self.entries
    }

    /// The index of the candidate data block for a key: the block with the
    /// largest first key <= key. None when the key sorts before everything.
    pub fn find(&self, key: &[u8]) -> Option<usize> {
        let after = self
            .entries
            .partition_point(|entry| entry.first_key.as_slice() <= key);
        after.checked_sub(1)
    }

    /// Bytes the encoded index occupies for the given first keys.
    pub fn encoded_size(first_key_lens: impl Iterator<Item = usize>) -> usize {
        16 + first_key_lens.map(|len| 16 + len).sum::<usize>()
    }

    pub fn encode(&self) -> Vec<u8> {
        let size = Self::encoded_size(self.entries.iter().map(|e| e.first_key.len()));
        let mut out = Vec::with_capacity(size);
        let mut word = [0u8; 8];

        LittleEndian::write_u64(&mut word, size as u64);
        out.extend_from_slice(&word);
        LittleEndian::write_u64(&mut word, self.entries.len() as u64);
        out.extend_from_slice(&word);
        for entry in &self.entries {
            LittleEndian::write_u64(&mut word, entry.offset);
            out.extend_from_slice(&word);
            LittleEndian::write_u64(&mut word, entry.first_key.len() as u64);
            out.extend_from_slice(&word);
            out.extend_from_slice(&entry.first_key);
        }
        out
    }

    pub fn decode(data: &[u8]) -> Result<Index> {
        if data.len() < 16 {
            return Err(Error::Corruption("index block truncated".to_string()));
        }
        let size = LittleEndian::read_u64(&data[0..8]) as usize;
        let count = LittleEndian::read_u64(&data[8..16]) as usize;
        if size < 16 || size > data.len() {
            return Err(Error::Corruption(format!(
                "index block claims {size} bytes, file holds {}",
                data.len()
            )));
        }

        let mut entries = Vec::with_capacity(count.min(1024));
        let mut pos = 16;
        for _ in 0..count {
            if pos + 16 > size {
                return Err(Error::Corruption("index entry truncated".to_string()));
            }
            let offset = LittleEndian::read_u64(&data[pos..pos + 8]);
            let key_len = LittleEndian::read_u64(&data[pos + 8..pos + 16]) as usize;
            pos += 16;
            if pos + key_len > size {
                return Err(Error::Corruption("index entry key truncated".to_string()));
            }
            let first_key = data[pos..pos + key_len].to_vec();
            pos += key_len;
            entries.push(IndexEntry { offset, first_key });
        }

        if pos != size {
            return Err(Error::Corruption(format!(
                "index block has {} trailing bytes",
                size - pos
            )));
        }
        Ok(Index { entries })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_index() -> Index {
        let mut index = Index::new();
        index.push(b"apple".to_vec(), 100);
        index.push(b"melon".to_vec(), 200);
        index.push(b"peach".to_vec(), 300);
        index
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let index = sample_index();
        let encoded = index.encode();
        assert_eq!(
            encoded.len(),
            Index::encoded_size(index.entries().iter().map(|e| e.first_key.len()))
        );

        let decoded = Index::decode(&encoded).expect("failed to decode index");
        assert_eq!(decoded.len(), 3);
        assert_eq!(decoded.entries()[1].offset, 200);
        assert_eq!(decoded.entries()[1].first_key, b"melon".to_vec());
    }

    #[test]
    fn test_find_picks_largest_first_key_leq() {
        let index = sample_index();

        assert_eq!(index.find(b"apple"), Some(0));
        assert_eq!(index.find(b"banana"), Some(0));
        assert_eq!(index.find(b"melon"), Some(1));
        assert_eq!(index.find(b"nectarine"), Some(1));
        assert_eq!(index.find(b"zucchini"), Some(2));
        assert_eq!(index.find(b"aardvark"), None);
    }

    #[test]
    fn test_decode_truncated_fails() {
        let encoded = sample_index().encode();
        assert!(matches!(
            Index::decode(&encoded[..10]),
            Err(Error::Corruption(_))
        ));
        assert!(matches!(
            Index::decode(&encoded[..encoded.len() - 3]),
            Err(Error::Corruption(_))
        ));
    }

    #[test]
    fn test_decode_tolerates_trailing_file_data() {
        // The index block sits at the front of the file; decode must stop
        // at its own recorded size.
        let mut encoded = sample_index().encode();
        encoded.extend_from_slice(&[0xab; 64]);
        let decoded = Index::decode(&encoded).expect("failed to decode index");
        assert_eq!(decoded.len(), 3);
    }
}
