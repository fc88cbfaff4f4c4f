use std::path::{Path, PathBuf};
use std::sync::Arc;

use resumable_protocol::{ChunkDesignator, PrepareOutcome, ResumableInfo, ResumableList};

use crate::paths::validate_relative;
use crate::{
    ChunkHandle, ChunkStore, EngineOptions, MergeEngine, OpenMode, ResumableError, Result,
    SessionIndex,
};

/// Entry point for serial resumable uploads rooted at one work directory.
///
/// Instances are cheap: every `Resumables` opened on the same directory
/// shares one [`SessionIndex`].
pub struct Resumables {
    index: Arc<SessionIndex>,
    store: ChunkStore,
    engine: MergeEngine,
    options: EngineOptions,
}

impl Resumables {
    /// Opens the work directory with default options.
    pub fn open(work_dir: impl AsRef<Path>) -> Result<Self> {
        Self::with_options(work_dir, &EngineOptions::default())
    }

    pub fn with_options(work_dir: impl AsRef<Path>, options: &EngineOptions) -> Result<Self> {
        let index = SessionIndex::open(work_dir.as_ref())?;
        let store = ChunkStore::new(options);
        let engine = MergeEngine::new(Arc::clone(&index), store.clone());
        Ok(Self {
            index,
            store,
            engine,
            options: options.clone(),
        })
    }

    /// The canonical work directory.
    pub fn work_dir(&self) -> &Path {
        self.index.root()
    }

    pub fn index(&self) -> &Arc<SessionIndex> {
        &self.index
    }

    pub fn store(&self) -> &ChunkStore {
        &self.store
    }

    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    /// Resolves a path returned by [`prepare`](Self::prepare) against the
    /// work directory.
    pub fn absolute(&self, chunk_path: &str) -> Result<PathBuf> {
        validate_relative("chunk path", chunk_path)?;
        Ok(self.index.absolute(chunk_path))
    }

    /// Registers the next chunk of an upload and returns where to write it.
    ///
    /// `chunk` is a positive chunk number or `"end"`.
    pub fn prepare(
        &self,
        filename: &str,
        chunk: &str,
        upload_id: &str,
        group: &str,
        owner: &str,
        namespace_key: Option<&str>,
    ) -> Result<PrepareOutcome> {
        let chunk = chunk
            .parse::<ChunkDesignator>()
            .map_err(|e| ResumableError::InvalidChunk(e.to_string()))?;
        self.index
            .prepare(filename, chunk, upload_id, group, owner, namespace_key)
    }

    /// Opens the chunk at a prepared path for streamed writing.
    pub fn acquire_chunk(&self, chunk_path: &str, mode: OpenMode) -> Result<ChunkHandle> {
        self.store.acquire(&self.absolute(chunk_path)?, mode)
    }

    /// Writes a whole chunk body to a prepared path.
    pub fn write_chunk(&self, chunk_path: &str, data: &[u8]) -> Result<u64> {
        self.store.write_chunk(&self.absolute(chunk_path)?, data)
    }

    /// Merges a written chunk; see [`MergeEngine::merge`].
    pub fn merge_chunk(&self, owner: &str, upload_id: &str, chunk_name: &str) -> Result<PathBuf> {
        self.engine.merge(owner, upload_id, chunk_name)
    }

    /// Completes an upload; see [`MergeEngine::finalise`].
    pub fn finalise(&self, owner: &str, upload_id: &str, end_marker_name: &str) -> Result<PathBuf> {
        self.engine.finalise(owner, upload_id, end_marker_name)
    }

    pub fn info(&self, owner: &str, filename: &str, upload_id: &str) -> Result<ResumableInfo> {
        Ok(self.index.get_session(owner, filename, upload_id)?.info())
    }

    /// Active uploads owned by `owner`.
    pub fn list_all(&self, owner: &str) -> ResumableList {
        ResumableList {
            resumables: self
                .index
                .list_sessions(owner)
                .iter()
                .map(|session| session.info())
                .collect(),
        }
    }

    /// Deletes an active upload. Returns `false` if `owner` has no such
    /// upload.
    pub fn delete(&self, owner: &str, filename: &str, upload_id: &str) -> Result<bool> {
        self.index.delete(owner, filename, upload_id)
    }
}
