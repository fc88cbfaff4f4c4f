use std::path::PathBuf;
use std::sync::Arc;

use resumable_protocol::ChunkDesignator;
use tracing::{debug, info, warn};

use crate::guard::authorize_owner;
use crate::paths::{final_artifact_path, parse_chunk_name, partial_artifact_path, resolve_chunk_path};
use crate::{ChunkStore, ResumableError, Result, SessionIndex, UploadSession};

/// Folds chunks into a session's partial artifact in strict order and
/// promotes the artifact once the upload ends.
pub struct MergeEngine {
    index: Arc<SessionIndex>,
    store: ChunkStore,
}

impl MergeEngine {
    pub fn new(index: Arc<SessionIndex>, store: ChunkStore) -> Self {
        Self { index, store }
    }

    /// Appends the named chunk to the partial artifact and records it.
    ///
    /// `chunk_name` is the chunk's base name or the path returned by
    /// prepare. Only the immediate successor of the last merged chunk is
    /// accepted. Returns the absolute partial artifact path.
    pub fn merge(&self, owner: &str, upload_id: &str, chunk_name: &str) -> Result<PathBuf> {
        let entry = self.index.lookup(upload_id)?;
        authorize_owner(&entry.snapshot(), owner)?;

        let _guard = entry.lock_exclusive();
        let session = entry.snapshot();
        authorize_owner(&session, owner)?;

        let chunk_number = match Self::parse_for(&session, chunk_name)? {
            ChunkDesignator::Number(n) => n,
            ChunkDesignator::End => {
                return Err(ResumableError::InvalidChunk(format!(
                    "{chunk_name} is the end marker; finalise the upload instead"
                )));
            }
        };
        if chunk_number <= session.max_chunk {
            return Err(ResumableError::AlreadyMerged(chunk_number));
        }
        if chunk_number != session.expected_chunk() {
            return Err(ResumableError::ChunkOutOfOrder {
                expected: session.expected_chunk(),
                requested: chunk_number,
            });
        }

        let key = session.namespace_key.as_deref();
        let source = self.index.absolute(resolve_chunk_path(
            &session.filename,
            ChunkDesignator::Number(chunk_number),
            upload_id,
            key,
        )?);
        let partial = self
            .index
            .absolute(partial_artifact_path(&session.filename, upload_id, key));

        let measured = self
            .store
            .append_into(&source, &partial, session.next_offset())?;
        let record =
            self.index
                .commit_chunk(&entry, chunk_number, measured.byte_size, measured.digest)?;

        if let Err(e) = std::fs::remove_file(&source) {
            warn!(path = %source.display(), error = %e, "failed to remove merged chunk");
        }

        debug!(
            upload_id,
            chunk = chunk_number,
            bytes = record.byte_size,
            next_offset = record.next_offset,
            "chunk merged"
        );
        Ok(partial)
    }

    /// Promotes the partial artifact to its final location and completes the
    /// session. Returns the absolute final artifact path.
    ///
    /// The artifact is renamed, never copied, so readers can't observe a
    /// half-written final file.
    pub fn finalise(&self, owner: &str, upload_id: &str, end_marker_name: &str) -> Result<PathBuf> {
        let entry = self.index.lookup(upload_id)?;
        authorize_owner(&entry.snapshot(), owner)?;

        let _guard = entry.lock_exclusive();
        let session = entry.snapshot();
        authorize_owner(&session, owner)?;

        if !Self::parse_for(&session, end_marker_name)?.is_end() {
            return Err(ResumableError::InvalidChunk(format!(
                "{end_marker_name} is not an end marker"
            )));
        }
        if session.max_chunk == 0 {
            return Err(ResumableError::IncompleteUpload(format!(
                "upload {upload_id} has no merged chunks"
            )));
        }

        let key = session.namespace_key.as_deref();
        let partial = self
            .index
            .absolute(partial_artifact_path(&session.filename, upload_id, key));
        let target = self.index.absolute(final_artifact_path(
            &session.owner,
            &session.filename,
            upload_id,
            key,
        ));

        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        // A previous attempt may have renamed the artifact and then failed to
        // record completion.
        let already_promoted = !partial.exists()
            && std::fs::metadata(&target).is_ok_and(|m| m.len() == session.next_offset());
        if !already_promoted {
            std::fs::rename(&partial, &target)?;
        }

        self.index.commit_complete(&entry)?;

        if let Err(e) = std::fs::remove_dir_all(self.index.absolute(upload_id)) {
            warn!(upload_id, error = %e, "failed to clean up staging directory");
        }

        info!(
            upload_id,
            owner = %session.owner,
            bytes = session.next_offset(),
            path = %target.display(),
            "upload finalised"
        );
        Ok(target)
    }

    /// Parses a chunk name and checks it belongs to the session's file.
    fn parse_for(session: &UploadSession, chunk_name: &str) -> Result<ChunkDesignator> {
        let (filename, chunk) = parse_chunk_name(chunk_name)?;
        if filename != session.filename {
            return Err(ResumableError::InvalidChunk(format!(
                "{chunk_name} does not belong to {}",
                session.filename
            )));
        }
        Ok(chunk)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{EngineOptions, SessionStatus, calculate_file_checksum, checksum_bytes, md5_hex};
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        index: Arc<SessionIndex>,
        store: ChunkStore,
        engine: MergeEngine,
        upload_id: String,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let index = SessionIndex::open(dir.path()).unwrap();
        let store = ChunkStore::new(&EngineOptions::default());
        let engine = MergeEngine::new(Arc::clone(&index), store.clone());
        Fixture {
            _dir: dir,
            index,
            store,
            engine,
            upload_id: uuid::Uuid::new_v4().to_string(),
        }
    }

    impl Fixture {
        /// Prepares and writes chunk `n`, returning its relative path.
        fn stage(&self, n: u64, data: &[u8]) -> String {
            let out = self
                .index
                .prepare("f", ChunkDesignator::Number(n), &self.upload_id, "g", "o", None)
                .unwrap();
            self.store
                .write_chunk(&self.index.absolute(&out.chunk_path), data)
                .unwrap();
            out.chunk_path
        }
    }

    #[test]
    fn merges_in_order_and_finalises() {
        let fx = fixture();
        let p1 = fx.stage(1, b"hello ");
        let partial = fx.engine.merge("o", &fx.upload_id, &p1).unwrap();
        assert_eq!(std::fs::read(&partial).unwrap(), b"hello ");
        assert!(!fx.index.absolute(&p1).exists());

        let p2 = fx.stage(2, b"world");
        fx.engine.merge("o", &fx.upload_id, &p2).unwrap();
        assert_eq!(std::fs::read(&partial).unwrap(), b"hello world");

        let session = fx.index.get_session("o", "f", &fx.upload_id).unwrap();
        assert_eq!(session.next_offset(), 11);
        assert_eq!(session.chunks[&2].digest, md5_hex(b"world"));

        let end = fx
            .index
            .prepare("f", ChunkDesignator::End, &fx.upload_id, "g", "o", None)
            .unwrap();
        let done = fx.engine.finalise("o", &fx.upload_id, &end.chunk_path).unwrap();

        assert!(!partial.exists());
        assert_eq!(
            calculate_file_checksum(&done).unwrap(),
            checksum_bytes(b"hello world")
        );
        assert!(!fx.index.absolute(&fx.upload_id).exists());
        assert!(fx.index.list_sessions("o").is_empty());
    }

    #[test]
    fn rejects_out_of_order_and_remerge() {
        let fx = fixture();
        let p1 = fx.stage(1, b"one");

        let p2 = fx.index.absolute(format!("{}/f.chunk.2", fx.upload_id));
        fx.store.write_chunk(&p2, b"two").unwrap();
        assert!(matches!(
            fx.engine.merge("o", &fx.upload_id, "f.chunk.2"),
            Err(ResumableError::ChunkOutOfOrder {
                expected: 1,
                requested: 2
            })
        ));

        fx.engine.merge("o", &fx.upload_id, &p1).unwrap();
        assert!(matches!(
            fx.engine.merge("o", &fx.upload_id, "f.chunk.1"),
            Err(ResumableError::AlreadyMerged(1))
        ));

        // Chunk 2 was written early; it merges once its predecessor is in.
        let partial = fx.engine.merge("o", &fx.upload_id, "f.chunk.2").unwrap();
        assert_eq!(std::fs::read(partial).unwrap(), b"onetwo");
    }

    #[test]
    fn retry_after_lost_record_does_not_double_append() {
        let fx = fixture();
        let p1 = fx.stage(1, b"first");
        let partial = fx.engine.merge("o", &fx.upload_id, &p1).unwrap();

        // Chunk 2 reached the artifact but its record was never written.
        let p2 = fx.stage(2, b"second");
        fx.store
            .append_into(&fx.index.absolute(&p2), &partial, 5)
            .unwrap();
        assert_eq!(std::fs::read(&partial).unwrap(), b"firstsecond");

        fx.engine.merge("o", &fx.upload_id, &p2).unwrap();
        assert_eq!(std::fs::read(&partial).unwrap(), b"firstsecond");
        let session = fx.index.get_session("o", "f", &fx.upload_id).unwrap();
        assert_eq!(session.next_offset(), 11);
    }

    #[test]
    fn failed_read_leaves_index_untouched() {
        let fx = fixture();
        fx.index
            .prepare("f", ChunkDesignator::Number(1), &fx.upload_id, "g", "o", None)
            .unwrap();

        // Chunk file never written.
        assert!(matches!(
            fx.engine.merge("o", &fx.upload_id, "f.chunk.1"),
            Err(ResumableError::Io(_))
        ));
        let session = fx.index.get_session("o", "f", &fx.upload_id).unwrap();
        assert_eq!(session.max_chunk, 0);
    }

    #[test]
    fn end_marker_cannot_be_merged() {
        let fx = fixture();
        let p1 = fx.stage(1, b"x");
        fx.engine.merge("o", &fx.upload_id, &p1).unwrap();
        assert!(matches!(
            fx.engine.merge("o", &fx.upload_id, "f.chunk.end"),
            Err(ResumableError::InvalidChunk(_))
        ));
    }

    #[test]
    fn foreign_chunk_names_rejected() {
        let fx = fixture();
        fx.stage(1, b"x");
        assert!(matches!(
            fx.engine.merge("o", &fx.upload_id, "other.chunk.1"),
            Err(ResumableError::InvalidChunk(_))
        ));
        assert!(matches!(
            fx.engine.finalise("o", &fx.upload_id, "f.chunk.1"),
            Err(ResumableError::InvalidChunk(_))
        ));
    }

    #[test]
    fn finalise_requires_merged_chunk() {
        let fx = fixture();
        fx.stage(1, b"x");
        assert!(matches!(
            fx.engine.finalise("o", &fx.upload_id, "f.chunk.end"),
            Err(ResumableError::IncompleteUpload(_))
        ));
    }

    #[test]
    fn other_owner_cannot_merge_or_finalise() {
        let fx = fixture();
        let p1 = fx.stage(1, b"x");
        assert!(matches!(
            fx.engine.merge("mallory", &fx.upload_id, &p1),
            Err(ResumableError::NotFound(_))
        ));
        fx.engine.merge("o", &fx.upload_id, &p1).unwrap();
        assert!(matches!(
            fx.engine.finalise("mallory", &fx.upload_id, "f.chunk.end"),
            Err(ResumableError::NotFound(_))
        ));
    }

    #[test]
    fn completed_session_is_closed() {
        let fx = fixture();
        let p1 = fx.stage(1, b"x");
        fx.engine.merge("o", &fx.upload_id, &p1).unwrap();
        fx.engine
            .finalise("o", &fx.upload_id, "f.chunk.end")
            .unwrap();

        assert!(matches!(
            fx.engine.finalise("o", &fx.upload_id, "f.chunk.end"),
            Err(ResumableError::NotFound(_))
        ));
        assert!(matches!(
            fx.index
                .prepare("f", ChunkDesignator::Number(2), &fx.upload_id, "g", "o", None),
            Err(ResumableError::AlreadyComplete(_))
        ));
        assert!(!fx.index.delete("o", "f", &fx.upload_id).unwrap());
    }

    #[test]
    fn finalise_after_unrecorded_rename() {
        let fx = fixture();
        let p1 = fx.stage(1, b"promoted ");
        fx.engine.merge("o", &fx.upload_id, &p1).unwrap();
        let p2 = fx.stage(2, b"already");
        let partial = fx.engine.merge("o", &fx.upload_id, &p2).unwrap();

        // The rename happened but completion was never recorded.
        let target = fx
            .index
            .absolute(final_artifact_path("o", "f", &fx.upload_id, None));
        std::fs::create_dir_all(target.parent().unwrap()).unwrap();
        std::fs::rename(&partial, &target).unwrap();
        assert!(fx.index.get_session("o", "f", &fx.upload_id).is_ok());

        let done = fx
            .engine
            .finalise("o", &fx.upload_id, "f.chunk.end")
            .unwrap();
        assert_eq!(done, target);
        assert_eq!(std::fs::read(&done).unwrap(), b"promoted already");
        assert_eq!(
            fx.index.entry(&fx.upload_id).unwrap().snapshot().status,
            SessionStatus::Complete
        );
        assert!(fx.index.list_sessions("o").is_empty());
    }

    #[test]
    fn finalise_without_partial_or_target_fails() {
        let fx = fixture();
        let p1 = fx.stage(1, b"x");
        let partial = fx.engine.merge("o", &fx.upload_id, &p1).unwrap();
        std::fs::remove_file(&partial).unwrap();

        assert!(matches!(
            fx.engine.finalise("o", &fx.upload_id, "f.chunk.end"),
            Err(ResumableError::Io(_))
        ));
        assert!(fx.index.get_session("o", "f", &fx.upload_id).is_ok());
    }

    #[test]
    fn merge_after_delete_is_not_found() {
        let fx = fixture();
        let p1 = fx.stage(1, b"x");
        assert!(fx.index.delete("o", "f", &fx.upload_id).unwrap());
        assert!(matches!(
            fx.engine.merge("o", &fx.upload_id, &p1),
            Err(ResumableError::NotFound(_))
        ));
    }

    #[test]
    fn concurrent_merges_on_separate_uploads() {
        use std::thread;

        let dir = TempDir::new().unwrap();
        let index = SessionIndex::open(dir.path()).unwrap();
        let store = ChunkStore::new(&EngineOptions {
            sync_writes: false,
            ..EngineOptions::default()
        });
        let engine = Arc::new(MergeEngine::new(Arc::clone(&index), store.clone()));

        let mut handles = vec![];
        for i in 0..8 {
            let index = Arc::clone(&index);
            let engine = Arc::clone(&engine);
            let store = store.clone();
            handles.push(thread::spawn(move || {
                let upload_id = uuid::Uuid::new_v4().to_string();
                let mut expected = Vec::new();
                for n in 1..=10u64 {
                    let out = index
                        .prepare("f", ChunkDesignator::Number(n), &upload_id, "g", "o", None)
                        .unwrap();
                    let data = format!("upload {i} chunk {n};").into_bytes();
                    store
                        .write_chunk(&index.absolute(&out.chunk_path), &data)
                        .unwrap();
                    engine.merge("o", &upload_id, &out.chunk_path).unwrap();
                    expected.extend_from_slice(&data);
                }
                let done = engine
                    .finalise("o", &upload_id, "f.chunk.end")
                    .unwrap();
                assert_eq!(std::fs::read(done).unwrap(), expected);
            }));
        }

        for h in handles {
            h.join().unwrap();
        }
        assert!(index.list_sessions("o").is_empty());
    }

    #[test]
    fn concurrent_retries_of_same_chunk_merge_once() {
        use std::thread;

        let fx = fixture();
        let p1 = fx.stage(1, b"only once");
        let engine = Arc::new(fx.engine);

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let engine = Arc::clone(&engine);
                let upload_id = fx.upload_id.clone();
                let p1 = p1.clone();
                thread::spawn(move || engine.merge("o", &upload_id, &p1))
            })
            .collect();

        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(
            results
                .iter()
                .filter_map(|r| r.as_ref().err())
                .all(|e| matches!(e, ResumableError::AlreadyMerged(1)))
        );

        let session = fx.index.get_session("o", "f", &fx.upload_id).unwrap();
        assert_eq!(session.next_offset(), 9);
    }
}
