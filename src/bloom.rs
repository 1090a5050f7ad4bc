//! Per-block Bloom filter: a probabilistic negative membership test that
//! lets the read path skip data blocks that cannot contain a key.
//!
//! Sizing follows the classic derivation with a safety margin: for `n`
//! expected keys at false-positive rate `p`, the bit-array length is
//! `m = ⌊-n·ln(p)/(ln 2)² · 2.35⌋ + 1` and the hash count is
//! `k = max(1, ⌊0.69·m/n⌋)`. Each of the `k` hash functions is a seeded
//! polynomial hash; the seeds are drawn at build time and serialized with
//! the filter so readers reproduce the same bit positions.
//!
//! Serialized layout, all integers little-endian u64:
//!
//! ```text
//! [hash_count][bit_length][seed_0 .. seed_k-1][pad][bit words]
//! ```
//!
//! The pad is `8 - (offset & 7)` bytes, which inserts a full 8-byte gap
//! when the header is already aligned; existing files depend on that exact
//! width. The word array holds `bit_length / 64 + 1` u64s.

use byteorder::{ByteOrder, LittleEndian};
use rand::Rng;

use crate::error::{Error, Result};

#[derive(Debug, Clone)]
pub struct BloomFilter {
    seeds: Vec<u64>,
    bits: Vec<u64>,
    bit_len: u64,
}

impl BloomFilter {
    /// Sizes a filter for `n` expected inserts at target false-positive
    /// rate `p`. `n` is clamped to at least 1.
    pub fn new(n: usize, p: f64) -> Self {
        let n = n.max(1);
        let ln2 = std::f64::consts::LN_2;
        let bit_len = (-p.ln() * n as f64 / (ln2 * ln2) * 2.35) as u64 + 1;
        let hash_count = ((0.69 * bit_len as f64 / n as f64) as usize).max(1);

        let mut rng = rand::thread_rng();
        let seeds = (0..hash_count).map(|_| rng.gen::<u64>()).collect();

        Self {
            seeds,
            bits: vec![0; (bit_len / 64 + 1) as usize],
            bit_len,
        }
    }

    fn hash(key: &[u8], seed: u64) -> u64 {
        key.iter().fold(0u64, |acc, &byte| {
            acc.wrapping_mul(seed).wrapping_add(byte as u64)
        })
    }

    /// Sets the `k` bit positions for the key. Re-inserting is harmless.
    pub fn insert(&mut self, key: &[u8]) {
        for &seed in &self.seeds {
            let bit = Self::hash(key, seed) % self.bit_len;
            self.bits[(bit / 64) as usize] |= 1u64 << (bit & 63);
        }
    }

    /// Returns false only when the key was definitely never inserted.
    pub fn contains(&self, key: &[u8]) -> bool {
        self.seeds.iter().all(|&seed| {
            let bit = Self::hash(key, seed) % self.bit_len;
            self.bits[(bit / 64) as usize] & (1u64 << (bit & 63)) != 0
        })
    }

    fn pad_len(header_len: usize) -> usize {
        8 - (header_len & 7)
    }

    /// Bytes the serialized form occupies.
    pub fn serialized_size(&self) -> usize {
        let header = (2 + self.seeds.len()) * 8;
        header + Self::pad_len(header) + self.bits.len() * 8
    }

    /// Appends the serialized filter to `out`.
    pub fn write_to(&self, out: &mut Vec<u8>) {
        let mut word = [0u8; 8];
        LittleEndian::write_u64(&mut word, self.seeds.len() as u64);
        out.extend_from_slice(&word);
        LittleEndian::write_u64(&mut word, self.bit_len);
        out.extend_from_slice(&word);
        for &seed in &self.seeds {
            LittleEndian::write_u64(&mut word, seed);
            out.extend_from_slice(&word);
        }
        out.resize(out.len() + Self::pad_len((2 + self.seeds.len()) * 8), 0);
        for &bits in &self.bits {
            LittleEndian::write_u64(&mut word, bits);
            out.extend_from_slice(&word);
        }
    }

    /// Parses a filter from the front of `buf`, returning it together with
    /// the number of bytes consumed.
    pub fn read_from(buf: &[u8]) -> Result<(Self, usize)> {
        if buf.len() < 16 {
            return Err(Error::Corruption("bloom filter header truncated".to_string()));
        }
        let hash_count = LittleEndian::read_u64(&buf[0..8]) as usize;
        let bit_len = LittleEndian::read_u64(&buf[8..16]);
        if bit_len == 0 {
            return Err(Error::Corruption("bloom filter has zero length".to_string()));
        }

        let header = (2 + hash_count) * 8;
        let words = (bit_len / 64 + 1) as usize;
        let total = header + Self::pad_len(header) + words * 8;
        if buf.len() < total {
            return Err(Error::Corruption("bloom filter body truncated".to_string()));
        }

        let mut seeds = Vec::with_capacity(hash_count);
        for i in 0..hash_count {
            seeds.push(LittleEndian::read_u64(&buf[16 + i * 8..24 + i * 8]));
        }
        let bits_start = header + Self::pad_len(header);
        let mut bits = Vec::with_capacity(words);
        for i in 0..words {
            bits.push(LittleEndian::read_u64(
                &buf[bits_start + i * 8..bits_start + (i + 1) * 8],
            ));
        }

        Ok((
            Self {
                seeds,
                bits,
                bit_len,
            },
            total,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_false_negatives() {
        let mut filter = BloomFilter::new(1000, 0.01);
        let keys: Vec<Vec<u8>> = (0..1000).map(|i| format!("key_{i:04}").into_bytes()).collect();

        for key in &keys {
            filter.insert(key);
        }
        for key in &keys {
            assert!(filter.contains(key), "inserted key reported absent");
        }
    }

    #[test]
    fn test_mostly_rejects_absent_keys() {
        let mut filter = BloomFilter::new(1000, 0.01);
        for i in 0..1000 {
            filter.insert(format!("key_{i:04}").as_bytes());
        }

        let false_positives = (0..1000)
            .filter(|i| filter.contains(format!("other_{i:04}").as_bytes()))
            .count();
        // 1% target rate with margin; anywhere near half would mean the
        // hashing is broken.
        assert!(false_positives < 100, "{false_positives} false positives");
    }

    #[test]
    fn test_serialize_roundtrip_preserves_answers() {
        let mut filter = BloomFilter::new(100, 0.01);
        for i in 0..100 {
            filter.insert(format!("k{i}").as_bytes());
        }

        let mut buf = Vec::new();
        filter.write_to(&mut buf);
        assert_eq!(buf.len(), filter.serialized_size());

        let (loaded, consumed) = BloomFilter::read_from(&buf).expect("failed to load filter");
        assert_eq!(consumed, buf.len());

        for i in 0..100 {
            assert!(loaded.contains(format!("k{i}").as_bytes()));
        }
        for i in 0..100 {
            let probe = format!("absent{i}");
            assert_eq!(
                filter.contains(probe.as_bytes()),
                loaded.contains(probe.as_bytes())
            );
        }
    }

    #[test]
    fn test_load_consumes_exact_length_with_trailing_data() {
        let mut filter = BloomFilter::new(10, 0.01);
        filter.insert(b"abc");

        let mut buf = Vec::new();
        filter.write_to(&mut buf);
        let expected = buf.len();
        buf.extend_from_slice(b"trailing garbage");

        let (_, consumed) = BloomFilter::read_from(&buf).expect("failed to load filter");
        assert_eq!(consumed, expected);
    }

    #[test]
    fn test_single_key_filter() {
        let mut filter = BloomFilter::new(1, 0.01);
        filter.insert(b"only");
        assert!(filter.contains(b"only"));
        assert!(filter.serialized_size() >= 24);

        let mut buf = Vec::new();
        filter.write_to(&mut buf);
        let (loaded, _) = BloomFilter::read_from(&buf).expect("failed to load filter");
        assert!(loaded.contains(b"only"));
    }

    #[test]
    fn test_truncated_input_fails_closed() {
        let mut filter = BloomFilter::new(10, 0.01);
        filter.insert(b"abc");
        let mut buf = Vec::new();
        filter.write_to(&mut buf);

        buf.truncate(buf.len() - 1);
        assert!(matches!(
            BloomFilter::read_from(&buf),
            Err(Error::Corruption(_))
        ));
        assert!(matches!(
            BloomFilter::read_from(&buf[..8]),
            Err(Error::Corruption(_))
        ));
    }
}
