//! tlfmd-server: the metadata revision store.
//!
//! Keeps, per folder and branch, an append-only list of signed revisions and
//! enforces who may append what:
//!
//! - every block must be well formed, signed, and written by the session
//! - each append must be the valid successor of the current head
//! - a device owns at most one unmerged branch per folder
//! - leases serialize writers that ask for them
//!
//! [`MdServerMemory`] keeps everything in memory; [`MdServerDisk`] adds a
//! JSON snapshot for restarts.

pub mod api;
pub mod disk;
pub mod error;
pub mod inspect;
mod lock;
pub mod memory;
mod state;
pub mod update;
pub mod validate;

pub use api::MdServer;
pub use disk::MdServerDisk;
pub use error::{ServerError, ServerResult};
pub use inspect::{AuditFinding, AuditReport, BlockSummary, BranchSummary, FolderSummary};
pub use memory::MdServerMemory;
pub use update::UpdateWaiter;
