//! Data block encoding and decoding.
//!
//! A data block is the unit of caching and Bloom filtering. Two encodings
//! exist, chosen table-wide at build time:
//!
//! Plain form (compression disabled):
//!
//! ```text
//! [block_size:8][bloom][entry_count:8]
//!   per entry: [key_len:8][value_len:8][key][value]
//! ```
//!
//! where `block_size` counts the whole block including its own field.
//!
//! Flagged form (compression enabled):
//!
//! ```text
//! [original_size:8][flags:1][bloom][entry_count:8][payload]
//! ```
//!
//! where `original_size` is the size the plain form would have, the flags
//! byte carries the compressed bit and codec tag, the Bloom filter and
//! count stay plaintext, and the payload is the entry region, compressed
//! when the flags say so.
//!
//! A tombstone is encoded as `value_len == u64::MAX` with no value bytes.

use byteorder::{ByteOrder, LittleEndian};

use crate::bloom::BloomFilter;
use crate::compression;
use crate::config::CompressionConfig;
use crate::error::{Error, Result};
use crate::memtable::Binding;

/// Sentinel value length marking a tombstone entry.
const TOMBSTONE_LEN: u64 = u64::MAX;

/// Target false-positive rate for per-block Bloom filters.
const BLOOM_FPR: f64 = 0.01;

/// Accumulates ascending entries for one data block.
pub struct BlockBuilder {
    entries: Vec<(Vec<u8>, Binding)>,
    payload_len: usize,
}

impl BlockBuilder {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            payload_len: 0,
        }
    }

    /// Adds an entry. Keys must arrive in strictly ascending order; the
    /// table builder upholds that.
    pub fn add(&mut self, key: &[u8], value: Option<&[u8]>) {
        self.payload_len += 16 + key.len() + value.map_or(0, |v| v.len());
        self.entries
            .push((key.to_vec(), value.map(|v| v.to_vec())));
    }

    /// Encoded entry bytes accumulated so far; the table builder cuts a
    /// block once this crosses the target block size.
    pub fn payload_len(&self) -> usize {
        self.payload_len
    }

    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn first_key(&self) -> Option<&[u8]> {
        self.entries.first().map(|(key, _)| key.as_slice())
    }

    fn encode_payload(&self) -> Vec<u8> {
        let mut payload = Vec::with_capacity(self.payload_len);
        let mut word = [0u8; 8];
        for (key, value) in &self.entries {
            LittleEndian::write_u64(&mut word, key.len() as u64);
            payload.extend_from_slice(&word);
            match value {
                Some(value) => {
                    LittleEndian::write_u64(&mut word, value.len() as u64);
                    payload.extend_from_slice(&word);
                    payload.extend_from_slice(key);
                    payload.extend_from_slice(value);
                }
                None => {
                    LittleEndian::write_u64(&mut word, TOMBSTONE_LEN);
                    payload.extend_from_slice(&word);
                    payload.extend_from_slice(key);
                }
            }
        }
        payload
    }

    /// Encodes the block in the form selected by the compression config.
    pub fn finish(self, compression: &CompressionConfig) -> Result<Vec<u8>> {
        let mut bloom = BloomFilter::new(self.entries.len(), BLOOM_FPR);
        for (key, _) in &self.entries {
            bloom.insert(key);
        }

        let payload = self.encode_payload();
        let mut bloom_bytes = Vec::with_capacity(bloom.serialized_size());
        bloom.write_to(&mut bloom_bytes);

        let mut word = [0u8; 8];
        if !compression.enabled {
            let block_size = 8 + bloom_bytes.len() + 8 + payload.len();
            let mut out = Vec::with_capacity(block_size);
            LittleEndian::write_u64(&mut word, block_size as u64);
            out.extend_from_slice(&word);
            out.extend_from_slice(&bloom_bytes);
            LittleEndian::write_u64(&mut word, self.entries.len() as u64);
            out.extend_from_slice(&word);
            out.extend_from_slice(&payload);
            return Ok(out);
        }

        let original_size = 8 + bloom_bytes.len() + 8 + payload.len();
        let (flags, body) = if compression.should_compress(payload.len()) {
            let compressed = compression::compress(compression.codec, &payload)?;
            if compressed.len() < payload.len() {
                (compression::encode_flags(compression.codec, true), compressed)
            } else {
                (compression::encode_flags(compression.codec, false), payload)
            }
        } else {
            (compression::encode_flags(compression.codec, false), payload)
        };

        let mut out = Vec::with_capacity(9 + bloom_bytes.len() + 8 + body.len());
        LittleEndian::write_u64(&mut word, original_size as u64);
        out.extend_from_slice(&word);
        out.push(flags);
        out.extend_from_slice(&bloom_bytes);
        LittleEndian::write_u64(&mut word, self.entries.len() as u64);
        out.extend_from_slice(&word);
        out.extend_from_slice(&body);
        Ok(out)
    }
}

impl Default for BlockBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// A decoded data block: Bloom filter plus the sorted entry list.
pub struct Block {
    bloom: BloomFilter,
    entries: Vec<(Vec<u8>, Binding)>,
}

impl Block {
    /// Decodes a block from its raw bytes, using the same compression
    /// config the table was built with.
    pub fn decode(raw: &[u8], compression: &CompressionConfig) -> Result<Block> {
        if raw.len() < 8 {
            return Err(Error::Corruption("data block truncated".to_string()));
        }

        let (bloom, entry_count, payload) = if !compression.enabled {
            let block_size = LittleEndian::read_u64(&raw[0..8]) as usize;
            if block_size != raw.len() {
                return Err(Error::Corruption(format!(
                    "data block size mismatch: header says {block_size}, have {}",
                    raw.len()
                )));
            }
            let (bloom, bloom_len) = BloomFilter::read_from(&raw[8..])?;
            let count_at = 8 + bloom_len;
            if raw.len() < count_at + 8 {
                return Err(Error::Corruption("data block count truncated".to_string()));
            }
            let entry_count = LittleEndian::read_u64(&raw[count_at..count_at + 8]);
            (bloom, entry_count, raw[count_at + 8..].to_vec())
        } else {
            if raw.len() < 9 {
                return Err(Error::Corruption("data block truncated".to_string()));
            }
            let (codec, compressed) = compression::decode_flags(raw[8])?;
            let (bloom, bloom_len) = BloomFilter::read_from(&raw[9..])?;
            let count_at = 9 + bloom_len;
            if raw.len() < count_at + 8 {
                return Err(Error::Corruption("data block count truncated".to_string()));
            }
            let entry_count = LittleEndian::read_u64(&raw[count_at..count_at + 8]);
            let body = &raw[count_at + 8..];
            let payload = if compressed {
                compression::decompress(codec, body)?
            } else {
                body.to_vec()
            };
            (bloom, entry_count, payload)
        };

        let entries = Self::parse_entries(&payload, entry_count as usize)?;
        Ok(Block { bloom, entries })
    }

    fn parse_entries(payload: &[u8], expected: usize) -> Result<Vec<(Vec<u8>, Binding)>> {
        let mut entries = Vec::with_capacity(expected);
        let mut pos = 0;
        while pos < payload.len() {
            if payload.len() - pos < 16 {
                return Err(Error::Corruption("entry header truncated".to_string()));
            }
            let key_len = LittleEndian::read_u64(&payload[pos..pos + 8]) as usize;
            let value_len = LittleEndian::read_u64(&payload[pos + 8..pos + 16]);
            pos += 16;

            if payload.len() - pos < key_len {
                return Err(Error::Corruption("entry key truncated".to_string()));
            }
            let key = payload[pos..pos + key_len].to_vec();
            pos += key_len;

            let value = if value_len == TOMBSTONE_LEN {
                None
            } else {
                let value_len = value_len as usize;
                if payload.len() - pos < value_len {
                    return Err(Error::Corruption("entry value truncated".to_string()));
                }
                let value = payload[pos..pos + value_len].to_vec();
                pos += value_len;
                Some(value)
            };
            entries.push((key, value));
        }

        if entries.len() != expected {
            return Err(Error::Corruption(format!(
                "data block holds {} entries, header says {expected}",
                entries.len()
            )));
        }
        Ok(entries)
    }

    /// Looks up a key. Returns `Some(None)` for a tombstone hit.
    pub fn get(&self, key: &[u8]) -> Option<Binding> {
        if !self.bloom.contains(key) {
            return None;
        }
        self.entries
            .binary_search_by(|(entry_key, _)| entry_key.as_slice().cmp(key))
            .ok()
            .map(|i| self.entries[i].1.clone())
    }

    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    pub fn entries(&self) -> &[(Vec<u8>, Binding)] {
        &self.entries
    }

    /// Consumes the block, yielding its entries in order.
    pub fn into_entries(self) -> Vec<(Vec<u8>, Binding)> {
        self.entries
    }
}

/// Reads the entry count out of an encoded block without parsing entries.
pub fn entry_count(raw: &[u8], compression: &CompressionConfig) -> Result<u64> {
    let header = if compression.enabled { 9 } else { 8 };
    if raw.len() < header {
        return Err(Error::Corruption("data block truncated".to_string()));
    }
    let (_, bloom_len) = BloomFilter::read_from(&raw[header..])?;
    let count_at = header + bloom_len;
    if raw.len() < count_at + 8 {
        return Err(Error::Corruption("data block count truncated".to_string()));
    }
    Ok(LittleEndian::read_u64(&raw[count_at..count_at + 8]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compression::Codec;

    fn build_block(compression: &CompressionConfig) -> Vec<u8> {
        let mut builder = BlockBuilder::new();
        builder.add(b"apple", Some(b"fruit"));
        builder.add(b"banana", Some(b"fruit"));
        builder.add(b"carrot", None);
        builder.add(b"daikon", Some(b"vegetable"));
        builder.finish(compression).expect("failed to encode block")
    }

    #[test]
    fn test_plain_roundtrip() {
        let compression = CompressionConfig::default();
        let raw = build_block(&compression);
        let block = Block::decode(&raw, &compression).expect("failed to decode block");

        assert_eq!(block.entry_count(), 4);
        assert_eq!(block.get(b"apple"), Some(Some(b"fruit".to_vec())));
        assert_eq!(block.get(b"carrot"), Some(None));
        assert_eq!(block.get(b"beet"), None);
    }

    #[test]
    fn test_compressed_roundtrip() {
        for codec in [Codec::Lz4, Codec::Snappy] {
            let compression = CompressionConfig::default()
                .codec(codec)
                .enabled(true)
                .min_size_to_compress(1);
            let raw = build_block(&compression);
            let block = Block::decode(&raw, &compression).expect("failed to decode block");

            assert_eq!(block.get(b"daikon"), Some(Some(b"vegetable".to_vec())));
            assert_eq!(block.get(b"carrot"), Some(None));
            assert_eq!(block.get(b"absent"), None);
        }
    }

    #[test]
    fn test_incompressible_payload_stored_raw() {
        // A tiny payload below the compression floor keeps the flags bit
        // clear but must still round-trip through the flagged form.
        let compression = CompressionConfig::default()
            .codec(Codec::Lz4)
            .enabled(true)
            .min_size_to_compress(1 << 20);
        let raw = build_block(&compression);
        let block = Block::decode(&raw, &compression).expect("failed to decode block");
        assert_eq!(block.get(b"apple"), Some(Some(b"fruit".to_vec())));
    }

    #[test]
    fn test_entry_count_peek() {
        let compression = CompressionConfig::default();
        let raw = build_block(&compression);
        assert_eq!(
            entry_count(&raw, &compression).expect("failed to read count"),
            4
        );

        let compressed = CompressionConfig::default().codec(Codec::Lz4).enabled(true);
        let raw = build_block(&compressed);
        assert_eq!(
            entry_count(&raw, &compressed).expect("failed to read count"),
            4
        );
    }

    #[test]
    fn test_truncated_block_fails_closed() {
        let compression = CompressionConfig::default();
        let raw = build_block(&compression);

        assert!(matches!(
            Block::decode(&raw[..raw.len() - 1], &compression),
            Err(Error::Corruption(_))
        ));
        assert!(matches!(
            Block::decode(&raw[..4], &compression),
            Err(Error::Corruption(_))
        ));
    }

    #[test]
    fn test_entries_are_ordered() {
        let compression = CompressionConfig::default();
        let raw = build_block(&compression);
        let block = Block::decode(&raw, &compression).expect("failed to decode block");

        let keys: Vec<_> = block.entries().iter().map(|(k, _)| k.clone()).collect();
        let mut sorted = keys.clone();
        sorted.sort();
        assert_eq!(keys, sorted);
    }
}
