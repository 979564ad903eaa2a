// Payload compression (zstd)
//
// Compressed payload layout: original_len(2, BE) | zstd frame. The declared
// length bounds decompression so a hostile frame cannot balloon memory.

use crate::wire::codec::{WireError, MAX_PAYLOAD_SIZE};

const ZSTD_LEVEL: i32 = 3;

/// Compress `data`, returning None when compression does not save space
pub fn compress(data: &[u8]) -> Option<Vec<u8>> {
    if data.is_empty() || data.len() > MAX_PAYLOAD_SIZE {
        return None;
    }
    let compressed = zstd::bulk::compress(data, ZSTD_LEVEL).ok()?;
    if compressed.len() + 2 >= data.len() {
        return None;
    }

    let mut out = Vec::with_capacity(compressed.len() + 2);
    out.extend_from_slice(&(data.len() as u16).to_be_bytes());
    out.extend_from_slice(&compressed);
    Some(out)
}

/// Reverse of [`compress`]
pub fn decompress(data: &[u8]) -> Result<Vec<u8>, WireError> {
    if data.len() < 2 {
        return Err(WireError::Decompression("missing length prefix".to_string()));
    }
    let original_len = u16::from_be_bytes([data[0], data[1]]) as usize;
    let out = zstd::bulk::decompress(&data[2..], original_len)
        .map_err(|e| WireError::Decompression(e.to_string()))?;
    if out.len() != original_len {
        return Err(WireError::Decompression(format!(
            "length mismatch: declared {}, got {}",
            original_len,
            out.len()
        )));
    }
    Ok(out)
}
