//! Gzip compression and fixed-size chunking of large payloads.

use std::io::{Read, Write};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use xconf_core::{CodecError, XconfResult};

/// Gzip-compress `data`.
pub fn compress(data: &[u8]) -> XconfResult<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(data)
        .map_err(|e| CodecError::Compression {
            reason: e.to_string(),
        })?;
    Ok(encoder.finish().map_err(|e| CodecError::Compression {
        reason: e.to_string(),
    })?)
}

/// Inflate a gzip stream produced by [`compress`].
pub fn decompress(data: &[u8]) -> XconfResult<Vec<u8>> {
    let mut decoder = GzDecoder::new(data);
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .map_err(|e| CodecError::Compression {
            reason: e.to_string(),
        })?;
    Ok(out)
}

/// Split `data` into chunks of at most `chunk_size` bytes.
///
/// Empty input yields a single empty chunk so the part count is never zero.
pub fn split_chunks(data: &[u8], chunk_size: usize) -> Vec<Vec<u8>> {
    if data.is_empty() || chunk_size == 0 {
        return vec![data.to_vec()];
    }
    data.chunks(chunk_size).map(<[u8]>::to_vec).collect()
}

pub fn join_chunks(chunks: &[Vec<u8>]) -> Vec<u8> {
    chunks.concat()
}
