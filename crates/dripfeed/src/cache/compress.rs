//! DEFLATE compression for durable copies.

use std::io::{self, Read, Write};

use flate2::Compression;
use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;

/// Compressed output is kept only below this share of the input size
const WORTHWHILE_RATIO: f64 = 0.8;

pub fn compress(data: &[u8]) -> io::Result<Vec<u8>> {
    let mut encoder = DeflateEncoder::new(Vec::with_capacity(data.len() / 2), Compression::default());
    encoder.write_all(data)?;
    encoder.finish()
}

pub fn decompress(data: &[u8]) -> io::Result<Vec<u8>> {
    let mut decoder = DeflateDecoder::new(data);
    let mut out = Vec::with_capacity(data.len() * 2);
    decoder.read_to_end(&mut out)?;
    Ok(out)
}

/// Compress `data` if that shrinks it below 80% of its size
pub fn compress_if_worthwhile(data: &[u8]) -> Option<Vec<u8>> {
    if data.is_empty() {
        return None;
    }
    let compressed = compress(data).ok()?;
    ((compressed.len() as f64) < data.len() as f64 * WORTHWHILE_RATIO).then_some(compressed)
}
