//! Decrypted revisions: the mutable working copy a writer builds and the
//! verified, immutable form the engine hands back from reads.

use std::ops::Deref;
use std::sync::Arc;
use std::time::SystemTime;

use tlfmd_core::{
    BareRootMetadata, BlockChanges, BranchId, KeyBundles, KeyGen, MdId, MergeStatus, PrivateMetadata,
    ReaderKeyBundle, Revision, SuccessorError, TlfHandle, TlfId, VerifyingKey, WriterKeyBundle,
};

/// A revision with its private section in the clear.
#[derive(Debug, Clone)]
pub struct RootMetadata {
    pub bare: BareRootMetadata,
    pub data: PrivateMetadata,
    pub bundles: Option<KeyBundles>,
}

impl RootMetadata {
    /// Revision 1 of a new folder.
    pub fn new_initial(id: TlfId, handle: &TlfHandle) -> Self {
        Self {
            bare: BareRootMetadata::new_initial(id, handle),
            data: PrivateMetadata::default(),
            bundles: None,
        }
    }

    pub fn tlf_id(&self) -> TlfId {
        self.bare.tlf_id()
    }

    pub fn revision(&self) -> Revision {
        self.bare.revision
    }

    pub fn branch_id(&self) -> BranchId {
        self.bare.branch_id()
    }

    pub fn merge_status(&self) -> MergeStatus {
        self.bare.merge_status()
    }

    pub fn key_gen(&self) -> KeyGen {
        self.bare.latest_key_gen
    }

    pub fn handle(&self) -> TlfHandle {
        self.bare.handle()
    }

    /// Attach key bundles and point the revision at them. Bundles whose ID
    /// differs from what the revision referenced are flagged for upload.
    pub fn set_key_bundles(&mut self, writer: WriterKeyBundle, reader: ReaderKeyBundle) -> anyhow::Result<()> {
        let wkb_id = writer.id()?;
        let rkb_id = reader.id()?;
        let bundles = KeyBundles {
            writer_new: wkb_id != self.bare.writer_key_bundle_id,
            reader_new: rkb_id != self.bare.reader_key_bundle_id,
            writer,
            reader,
        };
        self.bare.writer_key_bundle_id = wkb_id;
        self.bare.reader_key_bundle_id = rkb_id;
        self.bundles = Some(bundles);
        Ok(())
    }
}

#[derive(Debug)]
struct Inner {
    rmd: RootMetadata,
    md_id: MdId,
    last_writer_verifying_key: VerifyingKey,
    local_timestamp: SystemTime,
    put_to_server: bool,
}

/// A verified revision. Cheap to clone; never mutated.
#[derive(Debug, Clone)]
pub struct ImmutableRootMetadata {
    inner: Arc<Inner>,
}

impl ImmutableRootMetadata {
    pub fn new(
        rmd: RootMetadata,
        md_id: MdId,
        last_writer_verifying_key: VerifyingKey,
        local_timestamp: SystemTime,
        put_to_server: bool,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                rmd,
                md_id,
                last_writer_verifying_key,
                local_timestamp,
                put_to_server,
            }),
        }
    }

    pub fn md_id(&self) -> MdId {
        self.inner.md_id
    }

    pub fn last_writer_verifying_key(&self) -> &VerifyingKey {
        &self.inner.last_writer_verifying_key
    }

    /// Server timestamp translated to the local clock.
    pub fn local_timestamp(&self) -> SystemTime {
        self.inner.local_timestamp
    }

    pub fn put_to_server(&self) -> bool {
        self.inner.put_to_server
    }

    pub fn check_valid_successor(&self, next: &ImmutableRootMetadata) -> Result<(), SuccessorError> {
        self.bare.check_valid_successor(&self.md_id(), &next.bare)
    }

    /// Working copy of the next revision on the same branch. Bundles are
    /// carried over as already uploaded and block changes start empty.
    pub fn make_successor(&self) -> RootMetadata {
        let bundles = self.bundles.clone().map(|mut b| {
            b.writer_new = false;
            b.reader_new = false;
            b
        });
        RootMetadata {
            bare: self.bare.make_successor(self.md_id()),
            data: PrivateMetadata {
                changes: BlockChanges::default(),
                ..self.data.clone()
            },
            bundles,
        }
    }
}

impl Deref for ImmutableRootMetadata {
    type Target = RootMetadata;

    fn deref(&self) -> &RootMetadata {
        &self.inner.rmd
    }
}
