//! Binary blob framing for generation files.
//!
//! # Blob Layout
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │ Magic (4B): file kind, e.g. "LANC"      │
//! │ Format version (4B, LE)                 │
//! │ Payload length (8B, LE)                 │
//! │ CRC32 of payload (4B, LE)               │
//! ├─────────────────────────────────────────┤
//! │ Payload (postcard)                      │
//! └─────────────────────────────────────────┘
//! ```
//!
//! A blob that fails any of these checks is reported as structural
//! corruption; nothing is partially decoded.

use std::fs::File;
use std::io::Write;
use std::path::Path;

use serde::de::DeserializeOwned;
use serde::Serialize;

use super::error::{PersistenceError, PersistenceResult};

/// Current format version.
pub const FORMAT_VERSION: u32 = 1;

/// Anchor vector table.
pub const ANCHORS_MAGIC: [u8; 4] = *b"LANC";
/// In-memory graph adjacency.
pub const GRAPH_MAGIC: [u8; 4] = *b"LGRF";
/// PQ codebooks.
pub const CODEBOOK_MAGIC: [u8; 4] = *b"LCBK";
/// Main delta store.
pub const DELTAS_MAGIC: [u8; 4] = *b"LDLT";
/// One delta-segment entry referenced from the segment WAL.
pub const SEGMENT_RECORD_MAGIC: [u8; 4] = *b"LSEG";

/// Size of the blob header in bytes.
pub const HEADER_LEN: usize = 4 + 4 + 8 + 4;

/// Frame `payload` with a header.
pub fn encode_blob(magic: [u8; 4], payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
    out.extend_from_slice(&magic);
    out.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
    out.extend_from_slice(&(payload.len() as u64).to_le_bytes());
    out.extend_from_slice(&crc32fast::hash(payload).to_le_bytes());
    out.extend_from_slice(payload);
    out
}

/// Validate the header of `bytes` and return the payload slice.
pub fn decode_blob(magic: [u8; 4], bytes: &[u8]) -> PersistenceResult<&[u8]> {
    if bytes.len() < HEADER_LEN {
        return Err(PersistenceError::Format(format!(
            "blob truncated: {} bytes, header needs {}",
            bytes.len(),
            HEADER_LEN
        )));
    }
    if bytes[0..4] != magic {
        return Err(PersistenceError::Format(format!(
            "bad magic: expected {:?}, got {:?}",
            String::from_utf8_lossy(&magic),
            String::from_utf8_lossy(&bytes[0..4])
        )));
    }
    let version = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
    if version != FORMAT_VERSION {
        return Err(PersistenceError::Format(format!(
            "unsupported format version {version} (expected {FORMAT_VERSION})"
        )));
    }
    let mut len_buf = [0u8; 8];
    len_buf.copy_from_slice(&bytes[8..16]);
    let len = u64::from_le_bytes(len_buf) as usize;
    let expected = u32::from_le_bytes([bytes[16], bytes[17], bytes[18], bytes[19]]);

    let payload = &bytes[HEADER_LEN..];
    if payload.len() != len {
        return Err(PersistenceError::Format(format!(
            "payload length mismatch: header says {len}, found {}",
            payload.len()
        )));
    }
    let actual = crc32fast::hash(payload);
    if actual != expected {
        return Err(PersistenceError::ChecksumMismatch { expected, actual });
    }
    Ok(payload)
}

/// Serialize `value` with postcard and write it as a framed blob, fsynced.
pub fn write_blob<T: Serialize>(path: &Path, magic: [u8; 4], value: &T) -> PersistenceResult<()> {
    let payload = postcard::to_allocvec(value)?;
    let bytes = encode_blob(magic, &payload);
    let mut file = File::create(path)?;
    file.write_all(&bytes)?;
    file.sync_all()?;
    Ok(())
}

/// Read and verify a framed blob written by [`write_blob`].
pub fn read_blob<T: DeserializeOwned>(path: &Path, magic: [u8; 4]) -> PersistenceResult<T> {
    let bytes = std::fs::read(path).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => PersistenceError::NotFound(path.display().to_string()),
        _ => PersistenceError::Io(e),
    })?;
    let payload = decode_blob(magic, &bytes)?;
    Ok(postcard::from_bytes(payload)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_accepts_own_output() {
        let blob = encode_blob(ANCHORS_MAGIC, b"hello");
        assert_eq!(decode_blob(ANCHORS_MAGIC, &blob).unwrap(), b"hello");
    }

    #[test]
    fn flipped_payload_byte_is_checksum_mismatch() {
        let mut blob = encode_blob(DELTAS_MAGIC, b"payload bytes");
        let last = blob.len() - 1;
        blob[last] ^= 0xff;
        assert!(matches!(
            decode_blob(DELTAS_MAGIC, &blob),
            Err(PersistenceError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn wrong_magic_is_format_error() {
        let blob = encode_blob(GRAPH_MAGIC, b"x");
        assert!(matches!(
            decode_blob(CODEBOOK_MAGIC, &blob),
            Err(PersistenceError::Format(_))
        ));
    }

    #[test]
    fn truncated_blob_is_rejected() {
        let blob = encode_blob(GRAPH_MAGIC, b"abcdef");
        let err = decode_blob(GRAPH_MAGIC, &blob[..blob.len() - 2]).unwrap_err();
        assert!(err.is_structural());
    }
}
