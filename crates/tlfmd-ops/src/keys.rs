//! Folder key lookup for the local device.

use anyhow::Context;
use async_trait::async_trait;
use tlfmd_core::key_bundle::DeviceKeyMap;
use tlfmd_core::{BareRootMetadata, KeyBundles, KeyGen, RequestContext, TlfId, UserId, WrappedTlfKey};
use tlfmd_crypto::{unwrap_tlf_key, wrap_tlf_key, DeviceSecret, TlfCryptKey};
use tracing::trace;

/// Finds the TLF crypt key a revision was encrypted with.
#[async_trait]
pub trait KeyManager: Send + Sync {
    /// The key for `key_gen` as seen through `bundles`. `Ok(None)` means the
    /// bundles carry nothing for this device at that generation.
    async fn tlf_crypt_key(
        &self,
        ctx: &RequestContext,
        md: &BareRootMetadata,
        bundles: Option<&KeyBundles>,
        key_gen: KeyGen,
    ) -> anyhow::Result<Option<TlfCryptKey>>;
}

/// Unwraps keys from key bundles with this device's secret.
#[derive(Debug)]
pub struct BundleKeyManager {
    uid: UserId,
    device: DeviceSecret,
}

impl BundleKeyManager {
    pub fn new(uid: UserId, device: DeviceSecret) -> Self {
        Self { uid, device }
    }
}

#[async_trait]
impl KeyManager for BundleKeyManager {
    async fn tlf_crypt_key(
        &self,
        _ctx: &RequestContext,
        md: &BareRootMetadata,
        bundles: Option<&KeyBundles>,
        key_gen: KeyGen,
    ) -> anyhow::Result<Option<TlfCryptKey>> {
        let Some(bundles) = bundles else {
            return Ok(None);
        };
        let device = self.device.public_key();
        let Some(wrapped) = bundles.wrapped_key(&self.uid, &device, key_gen) else {
            trace!(uid = %self.uid, key_gen = %key_gen, "no wrapped key for this device");
            return Ok(None);
        };
        let key = unwrap_tlf_key(&self.device, &md.tlf_id(), key_gen, &wrapped.wrapped)
            .with_context(|| format!("unwrapping key generation {key_gen} for {}", self.uid))?;
        Ok(Some(key))
    }
}

/// Add `key` for generation `key_gen` to `devices`, wrapped for `device`.
pub fn add_device_key(
    devices: &mut DeviceKeyMap,
    uid: &UserId,
    device: &DeviceSecret,
    tlf: &TlfId,
    key_gen: KeyGen,
    key: &TlfCryptKey,
) -> anyhow::Result<()> {
    let wrapped = wrap_tlf_key(device, tlf, key_gen, key)?;
    let keys = devices
        .entry(uid.clone())
        .or_default()
        .entry(device.public_key())
        .or_default();
    keys.retain(|k| k.key_gen != key_gen);
    keys.push(WrappedTlfKey { key_gen, wrapped });
    Ok(())
}
