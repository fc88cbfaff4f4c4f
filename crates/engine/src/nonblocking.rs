//! Async facade over [`Resumables`] for tokio services.
//!
//! Every call does blocking disk I/O and may wait on a session's exclusive
//! scope, so each one runs on the blocking pool.

use std::path::PathBuf;
use std::sync::Arc;

use resumable_protocol::{PrepareOutcome, ResumableInfo, ResumableList};

use crate::{ResumableError, Result, Resumables};

#[derive(Clone)]
pub struct AsyncResumables {
    inner: Arc<Resumables>,
}

impl AsyncResumables {
    pub fn new(inner: Resumables) -> Self {
        Self {
            inner: Arc::new(inner),
        }
    }

    /// The wrapped synchronous handle.
    pub fn inner(&self) -> &Resumables {
        &self.inner
    }

    async fn run<T, F>(&self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Resumables) -> Result<T> + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || op(&*inner))
            .await
            .map_err(|e| ResumableError::Background(format!("task join error: {e}")))?
    }

    pub async fn prepare(
        &self,
        filename: String,
        chunk: String,
        upload_id: String,
        group: String,
        owner: String,
        namespace_key: Option<String>,
    ) -> Result<PrepareOutcome> {
        self.run(move |r| {
            r.prepare(
                &filename,
                &chunk,
                &upload_id,
                &group,
                &owner,
                namespace_key.as_deref(),
            )
        })
        .await
    }

    /// Writes a whole chunk body to a prepared path.
    pub async fn write_chunk(&self, chunk_path: String, data: Vec<u8>) -> Result<u64> {
        self.run(move |r| r.write_chunk(&chunk_path, &data)).await
    }

    pub async fn merge_chunk(
        &self,
        owner: String,
        upload_id: String,
        chunk_name: String,
    ) -> Result<PathBuf> {
        self.run(move |r| r.merge_chunk(&owner, &upload_id, &chunk_name))
            .await
    }

    pub async fn finalise(
        &self,
        owner: String,
        upload_id: String,
        end_marker_name: String,
    ) -> Result<PathBuf> {
        self.run(move |r| r.finalise(&owner, &upload_id, &end_marker_name))
            .await
    }

    pub async fn info(
        &self,
        owner: String,
        filename: String,
        upload_id: String,
    ) -> Result<ResumableInfo> {
        self.run(move |r| r.info(&owner, &filename, &upload_id))
            .await
    }

    pub async fn list_all(&self, owner: String) -> Result<ResumableList> {
        self.run(move |r| Ok(r.list_all(&owner))).await
    }

    pub async fn delete(&self, owner: String, filename: String, upload_id: String) -> Result<bool> {
        self.run(move |r| r.delete(&owner, &filename, &upload_id))
            .await
    }
}
