//! Writer and reader key bundles.
//!
//! A bundle maps each user's devices to the TLF crypt keys wrapped for that
//! device, one entry per key generation. Bundles are immutable and addressed
//! by the hash of their canonical encoding.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::codec;
use crate::types::{CryptPublicKey, KeyGen, ReaderKeyBundleId, UserId, WriterKeyBundleId};

/// One TLF crypt key generation wrapped for a single device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WrappedTlfKey {
    pub key_gen: KeyGen,
    #[serde(with = "codec::b64")]
    pub wrapped: Vec<u8>,
}

pub type DeviceKeyMap = BTreeMap<UserId, BTreeMap<CryptPublicKey, Vec<WrappedTlfKey>>>;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriterKeyBundle {
    pub devices: DeviceKeyMap,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReaderKeyBundle {
    pub devices: DeviceKeyMap,
}

fn wrapped_for<'a>(
    devices: &'a DeviceKeyMap,
    uid: &UserId,
    device: &CryptPublicKey,
    key_gen: KeyGen,
) -> Option<&'a WrappedTlfKey> {
    devices
        .get(uid)?
        .get(device)?
        .iter()
        .find(|k| k.key_gen == key_gen)
}

impl WriterKeyBundle {
    pub fn id(&self) -> anyhow::Result<WriterKeyBundleId> {
        Ok(WriterKeyBundleId(codec::content_hash(self)?))
    }

    pub fn wrapped_key(&self, uid: &UserId, device: &CryptPublicKey, key_gen: KeyGen) -> Option<&WrappedTlfKey> {
        wrapped_for(&self.devices, uid, device, key_gen)
    }
}

impl ReaderKeyBundle {
    pub fn id(&self) -> anyhow::Result<ReaderKeyBundleId> {
        Ok(ReaderKeyBundleId(codec::content_hash(self)?))
    }

    pub fn wrapped_key(&self, uid: &UserId, device: &CryptPublicKey, key_gen: KeyGen) -> Option<&WrappedTlfKey> {
        wrapped_for(&self.devices, uid, device, key_gen)
    }
}

/// Key bundles referenced by a revision, with flags marking the ones the
/// revision introduces (these are uploaded with the Put).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyBundles {
    pub writer: WriterKeyBundle,
    pub reader: ReaderKeyBundle,
    pub writer_new: bool,
    pub reader_new: bool,
}

impl KeyBundles {
    /// Look up a wrapped key in the writer bundle, then the reader bundle.
    pub fn wrapped_key(&self, uid: &UserId, device: &CryptPublicKey, key_gen: KeyGen) -> Option<&WrappedTlfKey> {
        self.writer
            .wrapped_key(uid, device, key_gen)
            .or_else(|| self.reader.wrapped_key(uid, device, key_gen))
    }
}
