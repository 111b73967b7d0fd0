//! Core domain types and shared logic for the depot cache server.
//!
//! This crate defines the data model used across all other crates:
//! - Cache entry identity and lifecycle states
//! - Upload session lifecycle
//! - Block identifier decoding for chunked uploads
//! - Clock abstraction for scheduled sweeps
//! - Configuration

pub mod block_id;
pub mod clock;
pub mod config;
pub mod entry;
pub mod error;
pub mod schedule;
pub mod size;
pub mod upload;

pub use block_id::{BlockId, ChunkAddress};
pub use clock::{Clock, ManualClock, SystemClock};
pub use entry::{EntryKey, EntryState};
pub use error::{Error, Result};
pub use schedule::CronSchedule;
pub use upload::{ByteRange, CoverageError, UploadId, UploadState, check_coverage};

/// Chunk size used by the Go azblob SDK (1 MiB).
pub const SMALL_CHUNK_SIZE: u64 = 1024 * 1024;

/// Chunk size used by every other block-blob client (64 MiB).
pub const DEFAULT_CHUNK_SIZE: u64 = 64 * 1024 * 1024;

/// User-agent prefix identifying clients that upload in small chunks.
pub const SMALL_CHUNK_USER_AGENT_PREFIX: &str = "azsdk-go-azblob";
