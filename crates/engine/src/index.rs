use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{
    Arc, Mutex, MutexGuard, OnceLock, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard,
};

use resumable_protocol::{ChunkDesignator, ChunkRecord, PrepareOutcome, SessionStatus};
use tracing::{debug, info, warn};

use crate::guard::{authorize, may_delete};
use crate::paths::{
    INDEX_DIR, index_file_path, resolve_chunk_path, staging_dir, validate_identity,
    validate_segment,
};
use crate::{ResumableError, Result, UploadSession};

/// Indexes shared by every caller in the process, one per canonical work
/// directory. Entries live until the process exits.
static REGISTRY: OnceLock<Mutex<HashMap<PathBuf, Arc<SessionIndex>>>> = OnceLock::new();

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// One session plus the exclusive scope serializing its merges.
pub(crate) struct SessionEntry {
    session: RwLock<UploadSession>,
    /// Held for the whole of merge, finalise and delete. Session metadata
    /// is only ever replaced while this is held.
    exclusive: Mutex<()>,
}

impl SessionEntry {
    fn new(session: UploadSession) -> Self {
        Self {
            session: RwLock::new(session),
            exclusive: Mutex::new(()),
        }
    }

    pub(crate) fn snapshot(&self) -> UploadSession {
        read(&self.session).clone()
    }

    pub(crate) fn lock_exclusive(&self) -> MutexGuard<'_, ()> {
        lock(&self.exclusive)
    }

    fn publish(&self, session: UploadSession) {
        *write(&self.session) = session;
    }

    fn mark_deleted(&self) {
        write(&self.session).status = SessionStatus::Deleted;
    }
}

/// Persistent mapping from upload id to session metadata.
///
/// Each session is stored as `<work_dir>/.index/<upload_id>.json` and
/// mirrored in memory. Documents are rewritten only after the file effect
/// they describe has succeeded.
pub struct SessionIndex {
    root: PathBuf,
    sessions: RwLock<HashMap<String, Arc<SessionEntry>>>,
}

impl SessionIndex {
    /// Returns the process-wide index for `work_dir`, loading it from disk
    /// on first access.
    pub fn open(work_dir: &Path) -> Result<Arc<Self>> {
        std::fs::create_dir_all(work_dir.join(INDEX_DIR))?;
        let root = std::fs::canonicalize(work_dir)?;

        let registry = REGISTRY.get_or_init(Default::default);
        let mut indexes = lock(registry);
        if let Some(index) = indexes.get(&root) {
            return Ok(Arc::clone(index));
        }

        let index = Arc::new(Self::load(root.clone())?);
        indexes.insert(root, Arc::clone(&index));
        Ok(index)
    }

    fn load(root: PathBuf) -> Result<Self> {
        let mut sessions = HashMap::new();

        for entry in std::fs::read_dir(root.join(INDEX_DIR))?.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let session = match std::fs::read(&path)
                .map_err(ResumableError::from)
                .and_then(|data| serde_json::from_slice::<UploadSession>(&data).map_err(Into::into))
            {
                Ok(session) => session,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "skipping unreadable session document");
                    continue;
                }
            };
            let stem = path.file_stem().and_then(|s| s.to_str());
            if stem != Some(session.id.as_str()) || session.status == SessionStatus::Deleted {
                warn!(path = %path.display(), "skipping inconsistent session document");
                continue;
            }
            sessions.insert(session.id.clone(), Arc::new(SessionEntry::new(session)));
        }

        info!(root = %root.display(), sessions = sessions.len(), "session index loaded");
        Ok(Self {
            root,
            sessions: RwLock::new(sessions),
        })
    }

    /// The canonical work directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolves a path relative to the work directory.
    pub fn absolute(&self, relative: impl AsRef<Path>) -> PathBuf {
        self.root.join(relative)
    }

    pub(crate) fn entry(&self, upload_id: &str) -> Option<Arc<SessionEntry>> {
        read(&self.sessions).get(upload_id).cloned()
    }

    pub(crate) fn lookup(&self, upload_id: &str) -> Result<Arc<SessionEntry>> {
        self.entry(upload_id)
            .ok_or_else(|| ResumableError::NotFound(format!("no active upload {upload_id}")))
    }

    /// Creates or advances a session and returns where the chunk goes.
    ///
    /// The first call for an upload id must be for chunk 1 and creates the
    /// session. Later calls must name the chunk after the last merged one,
    /// or the end marker once at least one chunk is merged. Repeating a
    /// prepare for a chunk that has not been merged yet is allowed.
    pub fn prepare(
        &self,
        filename: &str,
        chunk: ChunkDesignator,
        upload_id: &str,
        group: &str,
        owner: &str,
        namespace_key: Option<&str>,
    ) -> Result<PrepareOutcome> {
        validate_segment("owner", owner)?;
        validate_identity(filename, upload_id, namespace_key)?;
        let chunk_path = resolve_chunk_path(filename, chunk, upload_id, namespace_key)?;

        let (entry, is_new) = match self.entry(upload_id) {
            Some(entry) => (entry, false),
            None => match chunk {
                ChunkDesignator::Number(1) => self.create(UploadSession::new(
                    upload_id.to_string(),
                    owner.to_string(),
                    filename.to_string(),
                    namespace_key.map(str::to_string),
                    group.to_string(),
                ))?,
                ChunkDesignator::Number(n) => {
                    return Err(ResumableError::ChunkOutOfOrder {
                        expected: 1,
                        requested: n,
                    });
                }
                ChunkDesignator::End => {
                    return Err(ResumableError::IncompleteUpload(format!(
                        "upload {upload_id} has no chunks"
                    )));
                }
            },
        };

        let session = if is_new {
            entry.snapshot()
        } else {
            // Under the exclusive scope a concurrent delete either finishes
            // first or removes the directory created here.
            let _guard = entry.lock_exclusive();
            let session = entry.snapshot();
            Self::check_advance(&session, chunk, owner, filename, namespace_key)?;
            if let Some(parent) = Path::new(&chunk_path).parent() {
                std::fs::create_dir_all(self.absolute(parent))?;
            }
            session
        };

        debug!(upload_id, %chunk, is_new, "chunk prepared");
        Ok(PrepareOutcome {
            chunk,
            upload_id: upload_id.to_string(),
            previous: session.last_record().cloned(),
            is_new,
            chunk_path,
        })
    }

    fn check_advance(
        session: &UploadSession,
        chunk: ChunkDesignator,
        owner: &str,
        filename: &str,
        namespace_key: Option<&str>,
    ) -> Result<()> {
        if session.owner == owner && session.status == SessionStatus::Complete {
            return Err(ResumableError::AlreadyComplete(session.id.clone()));
        }
        authorize(session, owner, filename)?;
        if session.namespace_key.as_deref() != namespace_key {
            return Err(ResumableError::NotFound(format!(
                "no active upload {}",
                session.id
            )));
        }

        match chunk {
            ChunkDesignator::Number(n) if n == session.expected_chunk() => Ok(()),
            ChunkDesignator::Number(n) => Err(ResumableError::ChunkOutOfOrder {
                expected: session.expected_chunk(),
                requested: n,
            }),
            ChunkDesignator::End if session.max_chunk == 0 => Err(
                ResumableError::IncompleteUpload(format!("upload {} has no chunks", session.id)),
            ),
            ChunkDesignator::End => Ok(()),
        }
    }

    /// Inserts a new session, staging its directory and document.
    ///
    /// Returns the existing entry instead if another caller created the
    /// same upload id first. The new entry's exclusive scope is held until
    /// its document is on disk, so no merge can commit before it.
    fn create(&self, session: UploadSession) -> Result<(Arc<SessionEntry>, bool)> {
        let entry = Arc::new(SessionEntry::new(session.clone()));
        {
            let _guard = entry.lock_exclusive();
            {
                let mut sessions = write(&self.sessions);
                if let Some(existing) = sessions.get(&session.id) {
                    return Ok((Arc::clone(existing), false));
                }
                sessions.insert(session.id.clone(), Arc::clone(&entry));
            }

            if let Err(e) = self.stage(&session) {
                entry.mark_deleted();
                self.forget(&session.id, &entry);
                return Err(e);
            }
        }

        info!(
            upload_id = %session.id,
            owner = %session.owner,
            filename = %session.filename,
            "upload session created"
        );
        Ok((entry, true))
    }

    fn stage(&self, session: &UploadSession) -> Result<()> {
        std::fs::create_dir_all(
            self.absolute(staging_dir(&session.id, session.namespace_key.as_deref())),
        )?;
        self.persist(session)
    }

    /// Removes `upload_id` from the map if it still points at `entry`.
    fn forget(&self, upload_id: &str, entry: &Arc<SessionEntry>) {
        let mut sessions = write(&self.sessions);
        if sessions
            .get(upload_id)
            .is_some_and(|current| Arc::ptr_eq(current, entry))
        {
            sessions.remove(upload_id);
        }
    }

    /// Writes the session document through a temporary file and rename.
    fn persist(&self, session: &UploadSession) -> Result<()> {
        let path = self.absolute(index_file_path(&session.id));
        let tmp = path.with_extension("json.tmp");

        let data = serde_json::to_vec_pretty(session)?;
        {
            let mut file = std::fs::File::create(&tmp)?;
            file.write_all(&data)?;
            file.sync_all()?;
        }
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    /// Appends a chunk record to the session.
    ///
    /// Takes the session's exclusive scope. Use this only when the bytes
    /// were folded into the partial artifact outside [`crate::MergeEngine`].
    pub fn record_chunk(
        &self,
        upload_id: &str,
        chunk_number: u64,
        byte_size: u64,
        digest: String,
    ) -> Result<ChunkRecord> {
        let entry = self.lookup(upload_id)?;
        let _guard = entry.lock_exclusive();
        self.commit_chunk(&entry, chunk_number, byte_size, digest)
    }

    /// Persists and publishes a chunk record. Caller holds the exclusive
    /// scope.
    pub(crate) fn commit_chunk(
        &self,
        entry: &SessionEntry,
        chunk_number: u64,
        byte_size: u64,
        digest: String,
    ) -> Result<ChunkRecord> {
        let mut updated = entry.snapshot();
        if !updated.is_active() {
            return Err(ResumableError::NotFound(format!(
                "no active upload {}",
                updated.id
            )));
        }
        let record = updated.record_chunk(chunk_number, byte_size, digest)?;
        self.persist(&updated)?;
        entry.publish(updated);
        Ok(record)
    }

    /// Persists and publishes the completed session. Caller holds the
    /// exclusive scope.
    pub(crate) fn commit_complete(&self, entry: &SessionEntry) -> Result<UploadSession> {
        let mut updated = entry.snapshot();
        updated.complete();
        self.persist(&updated)?;
        entry.publish(updated.clone());
        Ok(updated)
    }

    /// Looks up an active session owned by `owner`.
    pub fn get_session(&self, owner: &str, filename: &str, upload_id: &str) -> Result<UploadSession> {
        let session = self.lookup(upload_id)?.snapshot();
        authorize(&session, owner, filename)?;
        Ok(session)
    }

    /// Active sessions owned by `owner`, oldest first.
    pub fn list_sessions(&self, owner: &str) -> Vec<UploadSession> {
        let entries: Vec<Arc<SessionEntry>> = read(&self.sessions).values().cloned().collect();

        let mut sessions: Vec<UploadSession> = entries
            .iter()
            .map(|entry| entry.snapshot())
            .filter(|session| session.owner == owner && session.is_active())
            .collect();
        sessions.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        sessions
    }

    /// Removes an active session's metadata, chunks and partial artifact.
    ///
    /// Returns `Ok(false)` when `owner` has no such active session. Waits
    /// for an in-flight merge on the same upload before removing files.
    pub fn delete(&self, owner: &str, filename: &str, upload_id: &str) -> Result<bool> {
        let Some(entry) = self.entry(upload_id) else {
            return Ok(false);
        };
        if !may_delete(&entry.snapshot(), owner, filename) {
            return Ok(false);
        }

        let _guard = entry.lock_exclusive();
        // The session may have completed or been deleted while we waited.
        if !may_delete(&entry.snapshot(), owner, filename) {
            return Ok(false);
        }

        match std::fs::remove_dir_all(self.absolute(upload_id)) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        match std::fs::remove_file(self.absolute(index_file_path(upload_id))) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        entry.mark_deleted();
        self.forget(upload_id, &entry);

        info!(upload_id, owner, "upload session deleted");
        Ok(true)
    }
}
