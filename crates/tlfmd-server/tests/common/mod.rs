//! Shared fixtures: devices that sign blocks and talk to one store.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::{Duration, UNIX_EPOCH};

use tlfmd_core::config::ServerConfig;
use tlfmd_core::{
    codec, BareRootMetadata, BranchId, CryptPublicKey, ManualClock, NoTeams, RootMetadataSigned, Session,
    StaticSession, TlfHandle, TlfId, UserId,
};
use tlfmd_crypto::SigningIdentity;
use tlfmd_server::MdServerMemory;

pub struct Device {
    pub uid: UserId,
    pub signer: SigningIdentity,
    pub crypt_key: CryptPublicKey,
}

impl Device {
    pub fn new(uid: &str, n: u8) -> Self {
        Self {
            uid: UserId::new(uid),
            signer: SigningIdentity::from_seed(&[n; 32]),
            crypt_key: CryptPublicKey([n; 32]),
        }
    }

    pub fn session(&self) -> Arc<StaticSession> {
        Arc::new(StaticSession(Session {
            uid: self.uid.clone(),
            name: self.uid.to_string(),
            verifying_key: self.signer.verifying_key(),
            crypt_public_key: self.crypt_key,
        }))
    }

    /// Stamp this device as the last modifier and sign both layers.
    pub fn sign(&self, mut md: BareRootMetadata) -> RootMetadataSigned {
        md.last_modifying_user = self.uid.clone();
        if !md.is_writer_metadata_copied() {
            md.writer_metadata.last_modifying_writer = self.uid.clone();
            md.writer_metadata_sig = self.signer.sign(&md.writer_metadata_payload().unwrap());
        }
        let sig = self.signer.sign(&codec::encode(&md).unwrap());
        RootMetadataSigned::new(md, sig)
    }

    pub fn initial(&self, id: TlfId, handle: &TlfHandle) -> RootMetadataSigned {
        self.sign(BareRootMetadata::new_initial(id, handle))
    }

    /// Merged successor of `prev`.
    pub fn next(&self, prev: &RootMetadataSigned) -> RootMetadataSigned {
        let mut md = prev.md.make_successor(prev.md_id().unwrap());
        md.writer_metadata.disk_usage += 1;
        self.sign(md)
    }

    /// Unmerged successor of `prev` on branch `bid`.
    pub fn next_unmerged(&self, prev: &RootMetadataSigned, bid: BranchId) -> RootMetadataSigned {
        let mut md = prev.md.make_successor(prev.md_id().unwrap());
        md.set_unmerged(bid);
        md.writer_metadata.disk_usage += 1;
        self.sign(md)
    }
}

pub fn alice() -> Device {
    Device::new("alice", 1)
}

pub fn bob() -> Device {
    Device::new("bob", 2)
}

pub fn mallory() -> Device {
    Device::new("mallory", 9)
}

pub fn private_handle() -> TlfHandle {
    TlfHandle::private([UserId::new("alice"), UserId::new("bob")], [UserId::new("carol")])
}

pub fn test_config() -> ServerConfig {
    ServerConfig {
        lock_retry_poll_ms: 10,
        ..ServerConfig::default()
    }
}

pub fn manual_clock() -> Arc<ManualClock> {
    Arc::new(ManualClock::new(UNIX_EPOCH + Duration::from_secs(1_700_000_000)))
}

pub fn store_for(device: &Device, clock: Arc<ManualClock>) -> MdServerMemory {
    MdServerMemory::new(test_config(), device.session(), Arc::new(NoTeams), clock)
}
