//! Test fixtures for generating test data.

use base64::{Engine as _, engine::general_purpose};
use bytes::Bytes;

/// User agent of the client that uploads in 1 MiB blocks.
#[allow(dead_code)]
pub const SMALL_BLOCK_USER_AGENT: &str = "azsdk-go-azblob/v1.2.0 (go1.22; linux)";

/// Generate deterministic test data based on a seed.
pub fn seeded_bytes(seed: u64, len: usize) -> Bytes {
    let mut data = vec![0u8; len];
    let mut state = seed;

    for chunk in data.chunks_mut(8) {
        // Simple LCG for deterministic data
        state = state.wrapping_mul(6364136223846793005).wrapping_add(1);
        let bytes = state.to_le_bytes();
        for (i, byte) in chunk.iter_mut().enumerate() {
            *byte = bytes[i % 8];
        }
    }

    Bytes::from(data)
}

/// Split data into chunks of specified size.
#[allow(dead_code)]
pub fn split_into_chunks(data: &[u8], chunk_size: usize) -> Vec<Bytes> {
    data.chunks(chunk_size)
        .map(Bytes::copy_from_slice)
        .collect()
}

/// 64 byte block id with the index big-endian at offset 16.
#[allow(dead_code)]
pub fn binary_block_id(index: u32) -> String {
    let mut raw = [0x5Au8; 64];
    raw[16..20].copy_from_slice(&index.to_be_bytes());
    general_purpose::STANDARD.encode(raw)
}

/// 48 byte block id: a 36 character id followed by the zero padded index.
#[allow(dead_code)]
pub fn text_block_id(index: u32) -> String {
    let raw = format!("6f0d6a41-2c7e-4b8e-9a51-3d2f7c9b1e04{index:012}");
    general_purpose::STANDARD.encode(raw)
}

/// Percent-encode a base64 block id for use in a query string.
#[allow(dead_code)]
pub fn query_escape(value: &str) -> String {
    value
        .replace('+', "%2B")
        .replace('/', "%2F")
        .replace('=', "%3D")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seeded_bytes_deterministic() {
        let a = seeded_bytes(42, 100);
        let b = seeded_bytes(42, 100);
        assert_eq!(a, b);

        let c = seeded_bytes(43, 100);
        assert_ne!(a, c);
    }

    #[test]
    fn block_id_layouts_have_expected_lengths() {
        let binary = general_purpose::STANDARD.decode(binary_block_id(7)).unwrap();
        assert_eq!(binary.len(), 64);
        let text = general_purpose::STANDARD.decode(text_block_id(7)).unwrap();
        assert_eq!(text.len(), 48);
    }
}
