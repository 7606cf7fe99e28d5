use std::io::{Read, Write};

use serde::{Deserialize, Serialize};

use cairn_types::{CairnError, Result};

const TAG_NONE: u8 = 0x00;
const TAG_FLATE: u8 = 0x01;
const TAG_GZIP: u8 = 0x02;
const TAG_LZMA: u8 = 0x03;
const TAG_ZLIB: u8 = 0x04;
const TAG_ZSTD: u8 = 0x05;

/// Maximum decompressed output size (32 MiB = 4x max chunk size).
/// Prevents decompression bombs from consuming unbounded memory.
const MAX_DECOMPRESS_SIZE: u64 = 32 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Compression {
    #[default]
    None,
    Flate,
    Gzip,
    Lzma,
    Zlib,
    Zstd,
}

impl Compression {
    /// Parse from a config string like "gzip", "zstd", "none".
    pub fn from_name(name: &str) -> Result<Self> {
        match name {
            "none" => Ok(Compression::None),
            "flate" => Ok(Compression::Flate),
            "gzip" => Ok(Compression::Gzip),
            "lzma" => Ok(Compression::Lzma),
            "zlib" => Ok(Compression::Zlib),
            "zstd" => Ok(Compression::Zstd),
            other => Err(CairnError::Config(format!(
                "unknown compression algorithm: {other}"
            ))),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Compression::None => "none",
            Compression::Flate => "flate",
            Compression::Gzip => "gzip",
            Compression::Lzma => "lzma",
            Compression::Zlib => "zlib",
            Compression::Zstd => "zstd",
        }
    }
}

/// Compress data and prepend a 1-byte tag identifying the codec.
pub fn compress(compression: Compression, data: &[u8]) -> Result<Vec<u8>> {
    match compression {
        Compression::None => {
            let mut out = Vec::with_capacity(1 + data.len());
            out.push(TAG_NONE);
            out.extend_from_slice(data);
            Ok(out)
        }
        Compression::Flate => {
            let mut encoder = flate2::write::DeflateEncoder::new(
                tagged_buf(TAG_FLATE, data.len()),
                flate2::Compression::default(),
            );
            encoder.write_all(data)?;
            Ok(encoder.finish()?)
        }
        Compression::Gzip => {
            let mut encoder = flate2::write::GzEncoder::new(
                tagged_buf(TAG_GZIP, data.len()),
                flate2::Compression::default(),
            );
            encoder.write_all(data)?;
            Ok(encoder.finish()?)
        }
        Compression::Zlib => {
            let mut encoder = flate2::write::ZlibEncoder::new(
                tagged_buf(TAG_ZLIB, data.len()),
                flate2::Compression::default(),
            );
            encoder.write_all(data)?;
            Ok(encoder.finish()?)
        }
        Compression::Lzma => {
            let mut encoder = xz2::write::XzEncoder::new(tagged_buf(TAG_LZMA, data.len()), 6);
            encoder.write_all(data)?;
            Ok(encoder.finish()?)
        }
        Compression::Zstd => {
            let compressed = zstd::bulk::compress(data, 0)
                .map_err(|e| CairnError::Other(format!("zstd compress: {e}")))?;
            let mut out = Vec::with_capacity(1 + compressed.len());
            out.push(TAG_ZSTD);
            out.extend_from_slice(&compressed);
            Ok(out)
        }
    }
}

fn tagged_buf(tag: u8, capacity_hint: usize) -> Vec<u8> {
    let mut buf = Vec::with_capacity(1 + capacity_hint / 2);
    buf.push(tag);
    buf
}

/// Decompress data by reading the 1-byte tag prefix and dispatching.
pub fn decompress(data: &[u8]) -> Result<Vec<u8>> {
    if data.is_empty() {
        return Err(CairnError::Decompression("empty data".into()));
    }
    let tag = data[0];
    let payload = &data[1..];
    match tag {
        TAG_NONE => Ok(payload.to_vec()),
        TAG_FLATE => read_capped(
            flate2::read::DeflateDecoder::new(payload),
            payload.len(),
            "flate",
        ),
        TAG_GZIP => read_capped(
            flate2::read::GzDecoder::new(payload),
            payload.len(),
            "gzip",
        ),
        TAG_ZLIB => read_capped(
            flate2::read::ZlibDecoder::new(payload),
            payload.len(),
            "zlib",
        ),
        TAG_LZMA => read_capped(
            xz2::read::XzDecoder::new(payload),
            payload.len(),
            "lzma",
        ),
        TAG_ZSTD => {
            let decoder = zstd::stream::Decoder::new(std::io::Cursor::new(payload))
                .map_err(|e| CairnError::Decompression(format!("zstd init: {e}")))?;
            read_capped(decoder, payload.len(), "zstd")
        }
        _ => Err(CairnError::UnknownCompressionTag(tag)),
    }
}

/// Drain a decoder into a Vec, enforcing `MAX_DECOMPRESS_SIZE`.
fn read_capped<R: Read>(decoder: R, capacity_hint: usize, codec: &str) -> Result<Vec<u8>> {
    let mut output = Vec::with_capacity(capacity_hint.min(MAX_DECOMPRESS_SIZE as usize));
    decoder
        .take(MAX_DECOMPRESS_SIZE + 1)
        .read_to_end(&mut output)
        .map_err(|e| CairnError::Decompression(format!("{codec}: {e}")))?;
    if output.len() as u64 > MAX_DECOMPRESS_SIZE {
        return Err(CairnError::Decompression(format!(
            "{codec}: decompressed size exceeds limit of {MAX_DECOMPRESS_SIZE} bytes"
        )));
    }
    Ok(output)
}
