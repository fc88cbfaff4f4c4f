//! Wire shapes for resumable, chunked uploads.
//!
//! These types are what the engine hands back to its callers: the outcome
//! of `prepare`, per-session info records, and owner-scoped listings. They
//! carry no behaviour beyond parsing chunk designators.

pub mod types;

pub use types::{
    ChunkDesignator, ChunkRecord, ParseChunkError, PrepareOutcome, ResumableInfo, ResumableList,
    SessionStatus,
};

/// Designator used in chunk names and `prepare` requests to signal that no
/// further chunks will arrive.
pub const END_OF_STREAM: &str = "end";
