//! Owner checks applied to every session-scoped operation.
//!
//! A mismatch is reported exactly like a missing session, so callers cannot
//! discover upload ids that belong to someone else.

use crate::{ResumableError, Result, UploadSession};

fn not_found(upload_id: &str) -> ResumableError {
    ResumableError::NotFound(format!("no active upload {upload_id}"))
}

/// Authorizes access by owner alone, for operations addressed by chunk name.
pub fn authorize_owner(session: &UploadSession, owner: &str) -> Result<()> {
    if session.owner != owner || !session.is_active() {
        return Err(not_found(&session.id));
    }
    Ok(())
}

/// Authorizes a lookup addressed by `(owner, filename, upload_id)`.
pub fn authorize(session: &UploadSession, owner: &str, filename: &str) -> Result<()> {
    authorize_owner(session, owner)?;
    if session.filename != filename {
        return Err(not_found(&session.id));
    }
    Ok(())
}

/// Whether `owner` may delete the session as addressed.
pub fn may_delete(session: &UploadSession, owner: &str, filename: &str) -> bool {
    authorize(session, owner, filename).is_ok()
}
