use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::END_OF_STREAM;

/// Error returned when a chunk designator cannot be parsed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid chunk designator: {0:?}")]
pub struct ParseChunkError(pub String);

/// Identifies a chunk within an upload: a positive sequence number, or the
/// end-of-stream marker.
///
/// Serializes as a JSON number for numbered chunks and as `"end"` for the
/// marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "RawDesignator", into = "RawDesignator")]
pub enum ChunkDesignator {
    Number(u64),
    End,
}

impl ChunkDesignator {
    /// Returns the chunk number, or `None` for the end marker.
    pub fn number(self) -> Option<u64> {
        match self {
            Self::Number(n) => Some(n),
            Self::End => None,
        }
    }

    pub fn is_end(self) -> bool {
        matches!(self, Self::End)
    }
}

impl fmt::Display for ChunkDesignator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::End => f.write_str(END_OF_STREAM),
        }
    }
}

impl FromStr for ChunkDesignator {
    type Err = ParseChunkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == END_OF_STREAM {
            return Ok(Self::End);
        }
        // Reject signs and whitespace that `u64::from_str` would otherwise accept.
        if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
            return Err(ParseChunkError(s.to_string()));
        }
        match s.parse::<u64>() {
            Ok(0) | Err(_) => Err(ParseChunkError(s.to_string())),
            Ok(n) => Ok(Self::Number(n)),
        }
    }
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum RawDesignator {
    Number(u64),
    Text(String),
}

impl TryFrom<RawDesignator> for ChunkDesignator {
    type Error = ParseChunkError;

    fn try_from(raw: RawDesignator) -> Result<Self, Self::Error> {
        match raw {
            RawDesignator::Number(0) => Err(ParseChunkError("0".into())),
            RawDesignator::Number(n) => Ok(Self::Number(n)),
            RawDesignator::Text(s) => s.parse(),
        }
    }
}

impl From<ChunkDesignator> for RawDesignator {
    fn from(chunk: ChunkDesignator) -> Self {
        match chunk {
            ChunkDesignator::Number(n) => Self::Number(n),
            ChunkDesignator::End => Self::Text(END_OF_STREAM.to_string()),
        }
    }
}

/// Lifecycle state of an upload session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Accepting chunks; listable by its owner.
    Active,
    /// Final artifact produced; no further transitions.
    Complete,
    /// Removed by its owner. Never persisted.
    Deleted,
}

/// A merged chunk's position within the artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkRecord {
    pub chunk_number: u64,
    pub byte_size: u64,
    /// Hex-encoded MD5 of the chunk bytes.
    pub digest: String,
    pub previous_offset: u64,
    pub next_offset: u64,
}

/// Inspection record for an active session.
///
/// Size, digest and offsets describe the most recently merged chunk. A
/// session with nothing merged yet reports zeroes and no digest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumableInfo {
    pub filename: String,
    pub id: String,
    pub max_chunk: u64,
    pub chunk_size: u64,
    pub digest: Option<String>,
    pub previous_offset: u64,
    pub next_offset: u64,
    pub group: String,
    pub namespace_key: Option<String>,
}

/// Owner-scoped listing of active sessions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumableList {
    pub resumables: Vec<ResumableInfo>,
}

/// Result of preparing a chunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrepareOutcome {
    pub chunk: ChunkDesignator,
    pub upload_id: String,
    /// Record of the last merged chunk, if any. Lets a resuming client
    /// find the offset it should continue from.
    pub previous: Option<ChunkRecord>,
    pub is_new: bool,
    /// Chunk location relative to the engine's work directory.
    pub chunk_path: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn designator_parses_numbers_and_end() {
        assert_eq!("1".parse::<ChunkDesignator>(), Ok(ChunkDesignator::Number(1)));
        assert_eq!("42".parse::<ChunkDesignator>(), Ok(ChunkDesignator::Number(42)));
        assert_eq!("end".parse::<ChunkDesignator>(), Ok(ChunkDesignator::End));
    }

    #[test]
    fn designator_rejects_zero_and_garbage() {
        assert!("0".parse::<ChunkDesignator>().is_err());
        assert!("".parse::<ChunkDesignator>().is_err());
        assert!("-1".parse::<ChunkDesignator>().is_err());
        assert!("+3".parse::<ChunkDesignator>().is_err());
        assert!("END".parse::<ChunkDesignator>().is_err());
        assert!("1.5".parse::<ChunkDesignator>().is_err());
    }

    #[test]
    fn designator_display() {
        assert_eq!(ChunkDesignator::Number(7).to_string(), "7");
        assert_eq!(ChunkDesignator::End.to_string(), "end");
    }

    #[test]
    fn designator_json_shape() {
        assert_eq!(serde_json::to_string(&ChunkDesignator::Number(3)).unwrap(), "3");
        assert_eq!(serde_json::to_string(&ChunkDesignator::End).unwrap(), "\"end\"");

        let n: ChunkDesignator = serde_json::from_str("3").unwrap();
        assert_eq!(n, ChunkDesignator::Number(3));
        let s: ChunkDesignator = serde_json::from_str("\"12\"").unwrap();
        assert_eq!(s, ChunkDesignator::Number(12));
        let e: ChunkDesignator = serde_json::from_str("\"end\"").unwrap();
        assert_eq!(e, ChunkDesignator::End);
        assert!(serde_json::from_str::<ChunkDesignator>("0").is_err());
    }

    #[test]
    fn status_serialization() {
        assert_eq!(
            serde_json::to_string(&SessionStatus::Active).unwrap(),
            "\"active\""
        );
        assert_eq!(
            serde_json::to_string(&SessionStatus::Complete).unwrap(),
            "\"complete\""
        );
    }

    #[test]
    fn info_field_names() {
        let info = ResumableInfo {
            filename: "file3".into(),
            id: "u1".into(),
            max_chunk: 1,
            chunk_size: 29,
            digest: None,
            previous_offset: 0,
            next_offset: 29,
            group: "g".into(),
            namespace_key: None,
        };
        let value = serde_json::to_value(&info).unwrap();
        for field in [
            "filename",
            "id",
            "max_chunk",
            "chunk_size",
            "digest",
            "previous_offset",
            "next_offset",
            "group",
            "namespace_key",
        ] {
            assert!(value.get(field).is_some(), "missing field {field}");
        }
        assert!(value["namespace_key"].is_null());
    }

    #[test]
    fn list_wraps_resumables() {
        let list = ResumableList::default();
        assert_eq!(serde_json::to_string(&list).unwrap(), r#"{"resumables":[]}"#);
    }

    #[test]
    fn prepare_outcome_without_previous() {
        let outcome = PrepareOutcome {
            chunk: ChunkDesignator::Number(1),
            upload_id: "u1".into(),
            previous: None,
            is_new: true,
            chunk_path: "u1/file.chunk.1".into(),
        };
        let value = serde_json::to_value(&outcome).unwrap();
        assert_eq!(value["chunk"], 1);
        assert!(value["previous"].is_null());
        assert_eq!(value["is_new"], true);
    }
}
