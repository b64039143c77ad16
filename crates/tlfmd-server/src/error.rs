use thiserror::Error;
use tlfmd_core::{BranchId, ContextError, LockId, MdId, Revision, SuccessorError, TlfId, UserId};

pub type ServerResult<T> = Result<T, ServerError>;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("bad request: {reason}")]
    BadRequest { reason: String },

    #[error("{uid} is not authorized for folder {tlf}")]
    Unauthorized { uid: UserId, tlf: String },

    #[error("no classic folder exists for this handle")]
    ClassicTlfDoesNotExist,

    #[error("lock {lock_id} on folder {tlf} is held by another session")]
    LockConflict { tlf: TlfId, lock_id: LockId },

    #[error("revision conflict: expected {expected}, got {actual}")]
    ConflictRevision { expected: Revision, actual: Revision },

    #[error("predecessor conflict: expected {expected}, got {actual}")]
    ConflictPrevRoot { expected: MdId, actual: MdId },

    #[error("device already has branch {existing} on folder {tlf}")]
    BranchConflict { tlf: TlfId, existing: BranchId },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("no such key bundle: {0}")]
    NoSuchKeyBundle(String),

    #[error("session already registered for updates on folder {tlf}")]
    DuplicateRegistration { tlf: TlfId },

    #[error("update registration was cancelled")]
    RegistrationCancelled,

    #[error("metadata server is shut down")]
    Shutdown,

    #[error(transparent)]
    Context(#[from] ContextError),

    #[error("codec error: {0}")]
    Codec(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ServerError {
    pub fn bad_request(reason: impl Into<String>) -> Self {
        ServerError::BadRequest {
            reason: reason.into(),
        }
    }

    /// Conditions a caller may retry: lock contention and losing a write race.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ServerError::LockConflict { .. }
                | ServerError::ConflictRevision { .. }
                | ServerError::ConflictPrevRoot { .. }
        )
    }

    /// Map a failed successor check at Put time to the conflict it implies.
    pub fn from_successor(err: SuccessorError) -> Self {
        match err {
            SuccessorError::RevisionMismatch { curr, next } => ServerError::ConflictRevision {
                expected: curr.next(),
                actual: next,
            },
            SuccessorError::PrevRootMismatch { expected, actual } => {
                ServerError::ConflictPrevRoot { expected, actual }
            }
            other => ServerError::bad_request(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_successor_mapping() {
        let err = ServerError::from_successor(SuccessorError::RevisionMismatch {
            curr: Revision(5),
            next: Revision(7),
        });
        assert!(matches!(
            err,
            ServerError::ConflictRevision {
                expected: Revision(6),
                actual: Revision(7)
            }
        ));
        assert!(err.is_retryable());

        let err = ServerError::from_successor(SuccessorError::UnmergedToMerged);
        assert!(matches!(err, ServerError::BadRequest { .. }));
        assert!(!err.is_retryable());
    }
}
