use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use resumable_protocol::{ChunkRecord, ResumableInfo, SessionStatus};

use crate::{ResumableError, Result};

/// Persistent state of one upload, as stored in the session index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadSession {
    pub id: String,
    pub owner: String,
    pub filename: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace_key: Option<String>,
    #[serde(default)]
    pub group: String,
    pub status: SessionStatus,
    /// Merged chunks keyed by chunk number.
    #[serde(default)]
    pub chunks: BTreeMap<u64, ChunkRecord>,
    /// Highest merged chunk number (0 when nothing is merged yet).
    #[serde(default)]
    pub max_chunk: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl UploadSession {
    /// Creates a new active session with no merged chunks.
    pub fn new(
        id: String,
        owner: String,
        filename: String,
        namespace_key: Option<String>,
        group: String,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            owner,
            filename,
            namespace_key,
            group,
            status: SessionStatus::Active,
            chunks: BTreeMap::new(),
            max_chunk: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == SessionStatus::Active
    }

    /// Record of the most recently merged chunk.
    pub fn last_record(&self) -> Option<&ChunkRecord> {
        self.chunks.get(&self.max_chunk)
    }

    /// Length the partial artifact must have.
    pub fn next_offset(&self) -> u64 {
        self.last_record().map_or(0, |r| r.next_offset)
    }

    /// Chunk number the next merge must carry.
    pub fn expected_chunk(&self) -> u64 {
        self.max_chunk + 1
    }

    /// Appends the record for the next chunk.
    ///
    /// Offsets are derived here rather than accepted from the caller, so
    /// they always partition the merged stream without gaps.
    pub fn record_chunk(
        &mut self,
        chunk_number: u64,
        byte_size: u64,
        digest: String,
    ) -> Result<ChunkRecord> {
        if chunk_number <= self.max_chunk {
            return Err(ResumableError::AlreadyMerged(chunk_number));
        }
        if chunk_number != self.expected_chunk() {
            return Err(ResumableError::ChunkOutOfOrder {
                expected: self.expected_chunk(),
                requested: chunk_number,
            });
        }

        let previous_offset = self.next_offset();
        let record = ChunkRecord {
            chunk_number,
            byte_size,
            digest,
            previous_offset,
            next_offset: previous_offset + byte_size,
        };
        self.chunks.insert(chunk_number, record.clone());
        self.max_chunk = chunk_number;
        self.updated_at = Utc::now();
        Ok(record)
    }

    /// Marks the session complete.
    pub fn complete(&mut self) {
        self.status = SessionStatus::Complete;
        self.updated_at = Utc::now();
    }

    /// Inspection record describing the most recently merged chunk.
    pub fn info(&self) -> ResumableInfo {
        let last = self.last_record();
        ResumableInfo {
            filename: self.filename.clone(),
            id: self.id.clone(),
            max_chunk: self.max_chunk,
            chunk_size: last.map_or(0, |r| r.byte_size),
            digest: last.map(|r| r.digest.clone()),
            previous_offset: last.map_or(0, |r| r.previous_offset),
            next_offset: last.map_or(0, |r| r.next_offset),
            group: self.group.clone(),
            namespace_key: self.namespace_key.clone(),
        }
    }
}
