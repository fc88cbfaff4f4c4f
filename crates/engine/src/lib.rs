//! Upload-session manager for resumable, chunked file uploads.
//!
//! A client splits a file into numbered chunks and writes each one to the
//! path returned by [`Resumables::prepare`]. Chunks are folded into a
//! partial artifact strictly in order by [`Resumables::merge_chunk`], and
//! [`Resumables::finalise`] renames the partial artifact to its final
//! location once the end-of-stream marker arrives.
//!
//! Sessions are keyed by upload id and scoped to an owner. Lookups by any
//! other owner behave as if the session did not exist.

mod checksum;
mod guard;
mod index;
mod merge;
mod nonblocking;
mod options;
mod paths;
mod resumables;
mod store;
mod types;

pub use checksum::{calculate_file_checksum, checksum_bytes, md5_hex};
pub use guard::{authorize, authorize_owner, may_delete};
pub use index::SessionIndex;
pub use merge::MergeEngine;
pub use nonblocking::AsyncResumables;
pub use options::EngineOptions;
pub use paths::{
    chunk_file_name, final_artifact_path, index_file_path, parse_chunk_name,
    partial_artifact_path, resolve_chunk_path, staging_dir, validate_namespace_key,
    validate_segment,
};
pub use resumables::Resumables;
pub use store::{ChunkDigest, ChunkHandle, ChunkStore, OpenMode};
pub use types::UploadSession;

pub use resumable_protocol::{
    ChunkDesignator, ChunkRecord, END_OF_STREAM, PrepareOutcome, ResumableInfo, ResumableList,
    SessionStatus,
};

/// Errors produced by the upload engine.
#[derive(Debug, thiserror::Error)]
pub enum ResumableError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("index error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("chunk out of order: expected {expected}, got {requested}")]
    ChunkOutOfOrder { expected: u64, requested: u64 },

    #[error("chunk {0} already merged")]
    AlreadyMerged(u64),

    #[error("upload incomplete: {0}")]
    IncompleteUpload(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("upload already complete: {0}")]
    AlreadyComplete(String),

    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("invalid chunk: {0}")]
    InvalidChunk(String),

    #[error("background task failed: {0}")]
    Background(String),
}

/// Convenience alias used throughout the engine.
pub type Result<T> = std::result::Result<T, ResumableError>;
