//! tlfmd-ops: the metadata verification and publication engine.
//!
//! [`MdOps`] sits between callers and an [`MdServer`](tlfmd_server::MdServer).
//! Every revision it returns has had its private section decrypted, both
//! signatures checked, and its signer keys verified for the time it was
//! written. Revisions signed by since-revoked keys are accepted only with
//! Merkle evidence that they predate the revocation.

pub mod cache;
mod decrypt;
pub mod error;
pub mod keys;
pub mod merkle_cache;
pub mod metadata;
pub mod ops;
mod revocation;
pub mod services;
pub mod verify;

pub use cache::{IdCache, KeyBundleCache, MdCache};
pub use error::{MdOpsError, OpsResult};
pub use keys::{add_device_key, BundleKeyManager, KeyManager};
pub use merkle_cache::{MerkleChainCache, RevocationCache};
pub use metadata::{ImmutableRootMetadata, RootMetadata};
pub use ops::{MdOps, MdOpsBuilder, OpsCaches};
pub use services::{KeyPki, KeyStatus, MerkleService, NoTeamCrypto, TeamCrypto};
pub use verify::VerifyMode;
