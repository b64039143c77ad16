use thiserror::Error;

use crate::types::{BranchId, MdId, Revision, TlfId};

/// Why one revision cannot follow another.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SuccessorError {
    #[error("revision {revision} is final and cannot have a successor")]
    Finalized { revision: Revision },

    #[error("folder mismatch: current {curr}, next {next}")]
    TlfMismatch { curr: TlfId, next: TlfId },

    #[error("revision mismatch: current {curr}, next {next}")]
    RevisionMismatch { curr: Revision, next: Revision },

    #[error("predecessor mismatch: expected {expected}, got {actual}")]
    PrevRootMismatch { expected: MdId, actual: MdId },

    #[error("branch mismatch: current {curr}, next {next}")]
    BranchMismatch { curr: BranchId, next: BranchId },

    #[error("an unmerged revision cannot be followed by a merged one")]
    UnmergedToMerged,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid metadata: {0}")]
pub struct InvalidMetadata(pub String);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ContextError {
    #[error("request cancelled")]
    Cancelled,

    #[error("request deadline exceeded")]
    DeadlineExceeded,
}
