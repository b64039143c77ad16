use thiserror::Error;
use tlfmd_core::{ContextError, KeyGen, Revision, UserId, VerifyingKey};
use tlfmd_server::ServerError;

pub type OpsResult<T> = Result<T, MdOpsError>;

#[derive(Debug, Error)]
pub enum MdOpsError {
    #[error(transparent)]
    Server(#[from] ServerError),

    #[error("metadata mismatch for folder {tlf} at revision {revision}: {reason}")]
    Mismatch {
        revision: Revision,
        tlf: String,
        reason: String,
    },

    #[error("revision {revision} of folder {tlf} was written by key {key} after it was revoked (last allowed revision {limit})")]
    WrittenAfterRevoke {
        tlf: String,
        revision: Revision,
        limit: Revision,
        key: VerifyingKey,
    },

    #[error("merkle publication gap too large: {reason}")]
    MerkleGapTooLarge { reason: String },

    #[error("server clock offset of {offset_ms}ms exceeds {max_ms}ms")]
    ServerClockOffsetTooLarge { offset_ms: i64, max_ms: i64 },

    #[error("cannot verify key {key} for {uid}: {reason}")]
    UnverifiableKey {
        uid: String,
        key: VerifyingKey,
        reason: String,
    },

    #[error("merged put called with unmerged metadata")]
    UnexpectedUnmergedPut,

    #[error("embedded block changes too large: {size} bytes (max {max})")]
    EmbeddedChangesTooLarge { size: usize, max: usize },

    #[error("no key for generation {key_gen} of folder {tlf}")]
    KeyGenerationNotFound { tlf: String, key_gen: KeyGen },

    #[error("{user} may not read folder {tlf}")]
    ReadAccess { user: UserId, tlf: String },

    #[error("handle mismatch: requested {expected}, metadata has {actual}")]
    HandleMismatch { expected: String, actual: String },

    #[error("cannot decrypt folder {tlf} at revision {revision}: {reason}")]
    Decryption {
        tlf: String,
        revision: Revision,
        reason: String,
    },

    #[error("missing revisions in folder {tlf}: {reason}")]
    MissingRevisions { tlf: String, reason: String },

    #[error("merkle root {seqno} not confirmed by the global tree: {reason}")]
    UntrustedMerkleRoot { seqno: i64, reason: String },

    #[error("resolved revision {revision} was committed but pruning the branch failed: {source}")]
    BranchPruneAfterResolve {
        revision: Revision,
        #[source]
        source: ServerError,
    },

    #[error(transparent)]
    Cancelled(#[from] ContextError),

    #[error("crypto error: {0}")]
    Crypto(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl MdOpsError {
    pub fn mismatch(tlf: impl ToString, revision: Revision, reason: impl ToString) -> Self {
        MdOpsError::Mismatch {
            revision,
            tlf: tlf.to_string(),
            reason: reason.to_string(),
        }
    }

    /// True when the failure proves the revision untrustworthy, as opposed
    /// to a transient or environmental failure.
    pub fn is_verification_failure(&self) -> bool {
        matches!(
            self,
            MdOpsError::Mismatch { .. }
                | MdOpsError::WrittenAfterRevoke { .. }
                | MdOpsError::MerkleGapTooLarge { .. }
                | MdOpsError::UntrustedMerkleRoot { .. }
                | MdOpsError::UnverifiableKey { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tlfmd_core::TlfId;

    #[test]
    fn test_mismatch_message_names_revision() {
        let err = MdOpsError::mismatch(TlfId::default(), Revision(7), "bad prev");
        let msg = err.to_string();
        assert!(msg.contains("revision 7"), "{msg}");
        assert!(err.is_verification_failure());
    }

    #[test]
    fn test_context_errors_are_not_verification_failures() {
        let err: MdOpsError = ContextError::Cancelled.into();
        assert!(!err.is_verification_failure());
    }
}
