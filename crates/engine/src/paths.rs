//! Deterministic storage layout under the work directory.
//!
//! ```text
//! <work_dir>/
//!   .index/<upload_id>.json                          session metadata
//!   <upload_id>[/<key>]/<filename>.chunk.<n|end>     chunk sources
//!   <upload_id>[/<key>]/<filename>.part              partial artifact
//!   .complete/<owner>/<upload_id>[/<key>]/<filename> final artifact
//! ```
//!
//! Everything an upload stages lives under its upload id, so uploads of
//! identically named files never collide, and removing one directory
//! discards a session's leftovers.

use std::path::{Component, Path, PathBuf};

use resumable_protocol::ChunkDesignator;

use crate::{ResumableError, Result};

/// Directory holding one metadata document per session.
pub const INDEX_DIR: &str = ".index";

/// Directory holding finalised artifacts.
pub const COMPLETE_DIR: &str = ".complete";

const CHUNK_INFIX: &str = ".chunk.";
const PARTIAL_SUFFIX: &str = ".part";

/// Validates that `value` is exactly one normal path component.
///
/// `kind` names the value in the error message.
pub fn validate_segment(kind: &str, value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(ResumableError::InvalidPath(format!("empty {kind}")));
    }
    if value.contains('/') || value.contains('\\') {
        return Err(ResumableError::InvalidPath(format!(
            "{kind} must not contain separators: {value}"
        )));
    }
    let mut components = Path::new(value).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) => Ok(()),
        _ => Err(ResumableError::InvalidPath(format!(
            "{kind} is not a plain name: {value}"
        ))),
    }
}

/// Validates an upload id. Ids starting with `.` would shadow the reserved
/// index and completion directories.
pub(crate) fn validate_upload_id(upload_id: &str) -> Result<()> {
    validate_segment("upload id", upload_id)?;
    if upload_id.starts_with('.') {
        return Err(ResumableError::InvalidPath(format!(
            "upload id must not start with '.': {upload_id}"
        )));
    }
    Ok(())
}

/// Validates that a namespace key is a relative path that stays inside the
/// upload's staging directory.
pub fn validate_namespace_key(key: &str) -> Result<()> {
    validate_relative("namespace key", key)
}

/// Validates that `value` is a relative path that cannot escape the
/// directory it is joined onto.
///
/// Rejects:
/// - Empty paths, or paths naming no directory at all (`.`)
/// - Absolute paths
/// - Parent directory traversal (`..`)
/// - Windows prefix components (`C:`, `\\server`)
pub(crate) fn validate_relative(kind: &str, value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(ResumableError::InvalidPath(format!("empty {kind}")));
    }

    let path = Path::new(value);
    if path.is_absolute() {
        return Err(ResumableError::InvalidPath(format!(
            "absolute {kind} not allowed: {value}"
        )));
    }

    let mut normal = 0usize;
    for component in path.components() {
        match component {
            Component::Normal(_) => normal += 1,
            Component::CurDir => {}
            Component::ParentDir => {
                return Err(ResumableError::InvalidPath(format!(
                    "parent directory traversal not allowed: {value}"
                )));
            }
            Component::Prefix(_) | Component::RootDir => {
                return Err(ResumableError::InvalidPath(format!(
                    "absolute {kind} not allowed: {value}"
                )));
            }
        }
    }
    if normal == 0 {
        return Err(ResumableError::InvalidPath(format!(
            "{kind} names nothing: {value}"
        )));
    }
    Ok(())
}

/// Validates the identity inputs shared by every path derivation.
pub(crate) fn validate_identity(
    filename: &str,
    upload_id: &str,
    namespace_key: Option<&str>,
) -> Result<()> {
    validate_segment("filename", filename)?;
    validate_upload_id(upload_id)?;
    if let Some(key) = namespace_key {
        validate_namespace_key(key)?;
    }
    Ok(())
}

/// Base name of a chunk file: `<filename>.chunk.<n|end>`.
pub fn chunk_file_name(filename: &str, chunk: ChunkDesignator) -> String {
    format!("{filename}{CHUNK_INFIX}{chunk}")
}

/// Directory, relative to the work directory, where an upload stages its
/// chunks and partial artifact.
pub fn staging_dir(upload_id: &str, namespace_key: Option<&str>) -> PathBuf {
    let dir = PathBuf::from(upload_id);
    match namespace_key {
        Some(key) => dir.join(key),
        None => dir,
    }
}

/// Resolves the chunk location, relative to the work directory.
///
/// Pure function of its inputs: `<upload_id>[/<key>]/<filename>.chunk.<n|end>`.
pub fn resolve_chunk_path(
    filename: &str,
    chunk: ChunkDesignator,
    upload_id: &str,
    namespace_key: Option<&str>,
) -> Result<String> {
    validate_identity(filename, upload_id, namespace_key)?;
    let name = chunk_file_name(filename, chunk);
    Ok(match namespace_key {
        Some(key) => format!("{upload_id}/{key}/{name}"),
        None => format!("{upload_id}/{name}"),
    })
}

/// Partial artifact location, relative to the work directory.
pub fn partial_artifact_path(
    filename: &str,
    upload_id: &str,
    namespace_key: Option<&str>,
) -> PathBuf {
    staging_dir(upload_id, namespace_key).join(format!("{filename}{PARTIAL_SUFFIX}"))
}

/// Final artifact location, relative to the work directory.
pub fn final_artifact_path(
    owner: &str,
    filename: &str,
    upload_id: &str,
    namespace_key: Option<&str>,
) -> PathBuf {
    let dir = Path::new(COMPLETE_DIR).join(owner).join(upload_id);
    match namespace_key {
        Some(key) => dir.join(key).join(filename),
        None => dir.join(filename),
    }
}

/// Session metadata document, relative to the work directory.
pub fn index_file_path(upload_id: &str) -> PathBuf {
    Path::new(INDEX_DIR).join(format!("{upload_id}.json"))
}

/// Splits a chunk name (base name or relative path) into its filename and
/// designator.
pub fn parse_chunk_name(name: &str) -> Result<(String, ChunkDesignator)> {
    let base = Path::new(name)
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| ResumableError::InvalidChunk(format!("no file name in {name:?}")))?;

    let (filename, designator) = base
        .rsplit_once(CHUNK_INFIX)
        .ok_or_else(|| ResumableError::InvalidChunk(format!("not a chunk name: {base}")))?;

    if filename.is_empty() {
        return Err(ResumableError::InvalidChunk(format!(
            "chunk name has no filename: {base}"
        )));
    }

    let chunk = designator
        .parse::<ChunkDesignator>()
        .map_err(|e| ResumableError::InvalidChunk(e.to_string()))?;
    Ok((filename.to_string(), chunk))
}
