//! Data block compression codecs.
//!
//! Blocks carry a one-byte flags field: bit 0 records whether the payload
//! is compressed, bits 1-2 carry the codec tag so files remain decodable
//! if the configured codec changes later. Both codecs are self-describing
//! about the uncompressed length, so decompression needs no side channel.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

const FLAG_COMPRESSED: u8 = 0x01;
const CODEC_SHIFT: u8 = 1;
const CODEC_MASK: u8 = 0x03;

/// Available block codecs.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Codec {
    None = 0,
    Lz4 = 1,
    Snappy = 2,
}

impl Codec {
    pub fn from_tag(tag: u8) -> Result<Codec> {
        match tag {
            0 => Ok(Codec::None),
            1 => Ok(Codec::Lz4),
            2 => Ok(Codec::Snappy),
            other => Err(Error::Corruption(format!("unknown codec tag {other}"))),
        }
    }

    pub fn tag(self) -> u8 {
        self as u8
    }
}

/// Packs the compressed bit and codec tag into a block flags byte.
pub fn encode_flags(codec: Codec, compressed: bool) -> u8 {
    let mut flags = codec.tag() << CODEC_SHIFT;
    if compressed {
        flags |= FLAG_COMPRESSED;
    }
    flags
}

/// Splits a block flags byte into its codec and compressed bit.
pub fn decode_flags(flags: u8) -> Result<(Codec, bool)> {
    let codec = Codec::from_tag((flags >> CODEC_SHIFT) & CODEC_MASK)?;
    Ok((codec, flags & FLAG_COMPRESSED != 0))
}

pub fn compress(codec: Codec, data: &[u8]) -> Result<Vec<u8>> {
    match codec {
        Codec::None => Ok(data.to_vec()),
        Codec::Lz4 => Ok(lz4_flex::compress_prepend_size(data)),
        Codec::Snappy => snap::raw::Encoder::new()
            .compress_vec(data)
            .map_err(|e| Error::Corruption(format!("snappy compression failed: {e}"))),
    }
}

pub fn decompress(codec: Codec, data: &[u8]) -> Result<Vec<u8>> {
    match codec {
        Codec::None => Ok(data.to_vec()),
        Codec::Lz4 => lz4_flex::decompress_size_prepended(data)
            .map_err(|e| Error::Corruption(format!("lz4 decompression failed: {e}"))),
        Codec::Snappy => snap::raw::Decoder::new()
            .decompress_vec(data)
            .map_err(|e| Error::Corruption(format!("snappy decompression failed: {e}"))),
    }
}
