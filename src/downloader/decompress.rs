//! LZ4 frame decompression for chunk payloads

use std::io::Read;

use crate::error::{Error, Result};
use crate::types::CompressionCodec;

/// Turn a downloaded object into the raw Arrow IPC stream it wraps
///
/// `size_hint` pre-sizes the output buffer (usually the leased estimate).
/// Runs synchronously; callers on the async runtime go through `spawn_blocking`.
pub fn decompress(
    codec: CompressionCodec,
    payload: Vec<u8>,
    size_hint: usize,
) -> Result<Vec<u8>> {
    match codec {
        CompressionCodec::None => Ok(payload),
        CompressionCodec::Lz4 => {
            let mut decoder = lz4_flex::frame::FrameDecoder::new(payload.as_slice());
            let mut out = Vec::with_capacity(size_hint);
            decoder
                .read_to_end(&mut out)
                .map_err(|e| Error::DataIntegrity(format!("LZ4 frame decode failed: {e}")))?;
            Ok(out)
        }
    }
}

/// Bytes by which an LZ4 chunk's output outgrew the decompressed share of its lease
///
/// The lease covers the compressed object plus the estimated output; `None` means the
/// output fit.
pub(crate) fn lz4_overrun(
    lease_bytes: u64,
    byte_length: u64,
    decompressed_len: u64,
) -> Option<u64> {
    let reserved = lease_bytes.saturating_sub(byte_length);
    (decompressed_len > reserved).then(|| decompressed_len - reserved)
}
