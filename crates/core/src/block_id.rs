//! Block identifier decoding for block-blob style chunk uploads.
//!
//! Clients address each chunk of a multi-part upload with an opaque base64
//! token. Two encodings are seen in the wild and are told apart purely by the
//! decoded length:
//!
//! - 64 bytes: the chunk index is a big-endian `u32` at byte offset 16.
//! - 48 bytes: UTF-8 text made of a 36 character identifier followed by the
//!   chunk index in base 10.
//!
//! The chunk size is not part of the token. It is inferred from the client's
//! user agent, see [`chunk_size_for_user_agent`].

use crate::error::{Error, Result};
use crate::{DEFAULT_CHUNK_SIZE, SMALL_CHUNK_SIZE, SMALL_CHUNK_USER_AGENT_PREFIX};
use base64::{Engine as _, engine::general_purpose};
use std::fmt;

/// Decoded length of the binary block id layout.
pub const BINARY_LAYOUT_LEN: usize = 64;

/// Decoded length of the textual block id layout.
pub const TEXT_LAYOUT_LEN: usize = 48;

/// Byte offset of the big-endian chunk index inside the binary layout.
const BINARY_INDEX_OFFSET: usize = 16;

/// Length of the identifier prefix inside the textual layout.
const TEXT_PREFIX_LEN: usize = 36;

/// A raw, still encoded, block identifier as sent by the client.
#[derive(Clone, PartialEq, Eq)]
pub struct BlockId(String);

impl BlockId {
    /// Wrap a raw block id taken from a request.
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// The raw value as received.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Decode the chunk index carried by this block id.
    pub fn chunk_index(&self) -> Result<u64> {
        let decoded = decode_base64(&self.0)?;
        match decoded.len() {
            BINARY_LAYOUT_LEN => {
                let mut index = [0u8; 4];
                index.copy_from_slice(&decoded[BINARY_INDEX_OFFSET..BINARY_INDEX_OFFSET + 4]);
                Ok(u64::from(u32::from_be_bytes(index)))
            }
            TEXT_LAYOUT_LEN => {
                let text = std::str::from_utf8(&decoded)
                    .map_err(|_| Error::InvalidBlockId(self.0.clone()))?;
                let suffix = text
                    .get(TEXT_PREFIX_LEN..)
                    .ok_or_else(|| Error::InvalidBlockId(self.0.clone()))?;
                if suffix.is_empty() || !suffix.bytes().all(|b| b.is_ascii_digit()) {
                    return Err(Error::InvalidBlockId(self.0.clone()));
                }
                suffix
                    .parse::<u64>()
                    .map_err(|_| Error::InvalidBlockId(self.0.clone()))
            }
            _ => Err(Error::InvalidBlockId(self.0.clone())),
        }
    }
}

impl fmt::Debug for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlockId({})", self.0)
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Query decoders turn `+` into a space, so put it back before decoding.
fn decode_base64(raw: &str) -> Result<Vec<u8>> {
    let normalized = raw.replace(' ', "+");
    general_purpose::STANDARD
        .decode(&normalized)
        .or_else(|_| general_purpose::URL_SAFE.decode(&normalized))
        .map_err(|_| Error::InvalidBlockId(raw.to_string()))
}

/// Chunk size the given client uses when splitting an upload.
pub fn chunk_size_for_user_agent(user_agent: Option<&str>) -> u64 {
    match user_agent {
        Some(ua) if ua.starts_with(SMALL_CHUNK_USER_AGENT_PREFIX) => SMALL_CHUNK_SIZE,
        _ => DEFAULT_CHUNK_SIZE,
    }
}

/// Position of one chunk inside the object being uploaded.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChunkAddress {
    /// Zero-based chunk index.
    pub index: u64,
    /// Byte offset of the chunk's first byte.
    pub offset: u64,
}

impl ChunkAddress {
    /// Whole-object upload with no block id.
    pub const WHOLE: ChunkAddress = ChunkAddress {
        index: 0,
        offset: 0,
    };

    /// Address of a write that names its byte offset directly, as
    /// `Content-Range` uploads do. The chunk size is one byte, so the index
    /// equals the offset.
    pub fn at_offset(offset: u64) -> Self {
        Self {
            index: offset,
            offset,
        }
    }

    /// Resolve the address of a block upload request.
    ///
    /// A missing block id means the body is the whole object.
    pub fn resolve(block_id: Option<&BlockId>, user_agent: Option<&str>) -> Result<Self> {
        let Some(block_id) = block_id else {
            return Ok(Self::WHOLE);
        };
        let index = block_id.chunk_index()?;
        let chunk_size = chunk_size_for_user_agent(user_agent);
        let offset = index.checked_mul(chunk_size).ok_or_else(|| {
            Error::InvalidBlockId(format!("{block_id} (chunk index {index} overflows offset)"))
        })?;
        Ok(Self { index, offset })
    }
}
