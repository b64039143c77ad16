//! tlfmd-core: shared types for the folder metadata store and its
//! verification engine.

pub mod clock;
pub mod codec;
pub mod config;
pub mod context;
pub mod error;
pub mod handle;
pub mod key_bundle;
pub mod merkle;
pub mod metadata;
pub mod session;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use context::RequestContext;
pub use error::{ContextError, InvalidMetadata, SuccessorError};
pub use handle::TlfHandle;
pub use key_bundle::{KeyBundles, ReaderKeyBundle, WrappedTlfKey, WriterKeyBundle};
pub use merkle::{EncryptedMerkleLeaf, KbfsMerkleRoot, MerkleLeaf, MerkleRootRef, MerkleTreeId, NextMd, RevokedKeyInfo};
pub use metadata::{
    BareRootMetadata, BlockChanges, MetadataFlags, PrivateMetadata, RootMetadataSigned, SignatureInfo,
    WriterFlags, WriterMetadata,
};
pub use session::{NoTeams, Session, SessionSource, StaticSession, TeamMembership};
pub use types::{
    BranchId, CryptPublicKey, KeyGen, LockContext, LockId, MdId, MdPriority, MergeStatus, MetadataVer,
    ReaderKeyBundleId, Revision, TeamId, TlfId, TlfType, UserId, VerifyingKey, WriterKeyBundleId,
};
