//! Device secrets, TLF crypt keys, and wrapping one under the other

use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    XChaCha20Poly1305, XNonce,
};
use hkdf::Hkdf;
use rand::RngCore;
use sha2::Sha256;
use tlfmd_core::{CryptPublicKey, KeyGen, TlfId};
use zeroize::Zeroize;

use crate::{KEY_SIZE, NONCE_SIZE, TAG_SIZE};

/// A folder's symmetric key for one key generation. Zeroized on drop.
#[derive(Clone, PartialEq, Eq)]
pub struct TlfCryptKey {
    bytes: [u8; KEY_SIZE],
}

impl TlfCryptKey {
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }
}

impl Drop for TlfCryptKey {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl std::fmt::Debug for TlfCryptKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlfCryptKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// A device's long-lived secret. Zeroized on drop.
#[derive(Clone)]
pub struct DeviceSecret {
    bytes: [u8; KEY_SIZE],
}

impl DeviceSecret {
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self { bytes }
    }

    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_SIZE];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self { bytes }
    }

    /// Identifier of this device in key bundles and branch records.
    pub fn public_key(&self) -> CryptPublicKey {
        CryptPublicKey(blake3::derive_key("tlfmd 2024 device crypt public key", &self.bytes))
    }

    fn wrap_key(&self) -> anyhow::Result<[u8; KEY_SIZE]> {
        hkdf_derive(&self.bytes, b"tlfmd-tlf-key-wrap")
    }
}

impl Drop for DeviceSecret {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl std::fmt::Debug for DeviceSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceSecret")
            .field("public", &self.public_key())
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// Generate a random TLF crypt key.
pub fn generate_tlf_crypt_key() -> TlfCryptKey {
    let mut bytes = [0u8; KEY_SIZE];
    rand::thread_rng().fill_bytes(&mut bytes);
    TlfCryptKey::from_bytes(bytes)
}

/// HKDF-SHA256 key derivation with a domain-specific info string.
pub(crate) fn hkdf_derive(ikm: &[u8; KEY_SIZE], info: &[u8]) -> anyhow::Result<[u8; KEY_SIZE]> {
    let hkdf = Hkdf::<Sha256>::new(None, ikm);
    let mut okm = [0u8; KEY_SIZE];
    hkdf.expand(info, &mut okm)
        .map_err(|e| anyhow::anyhow!("HKDF expand failed: {e}"))?;
    Ok(okm)
}

fn wrap_aad(tlf: &TlfId, key_gen: KeyGen) -> Vec<u8> {
    let mut aad = Vec::with_capacity(16 + 4);
    aad.extend_from_slice(tlf.as_bytes());
    aad.extend_from_slice(&key_gen.0.to_be_bytes());
    aad
}

/// Wrap a TLF crypt key for one device.
///
/// Output: `[24-byte nonce][ciphertext + 16-byte tag]`, bound to the folder
/// and key generation through the AAD.
pub fn wrap_tlf_key(
    device: &DeviceSecret,
    tlf: &TlfId,
    key_gen: KeyGen,
    key: &TlfCryptKey,
) -> anyhow::Result<Vec<u8>> {
    let mut wrap_key = device.wrap_key()?;
    let cipher = XChaCha20Poly1305::new((&wrap_key).into());
    wrap_key.zeroize();

    let mut nonce_bytes = [0u8; NONCE_SIZE];
    rand::thread_rng().fill_bytes(&mut nonce_bytes);
    let nonce = XNonce::from_slice(&nonce_bytes);
    let aad = wrap_aad(tlf, key_gen);

    let ciphertext = cipher
        .encrypt(
            nonce,
            Payload {
                msg: key.as_bytes().as_ref(),
                aad: &aad,
            },
        )
        .map_err(|e| anyhow::anyhow!("key wrapping failed: {e}"))?;

    let mut result = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    result.extend_from_slice(&nonce_bytes);
    result.extend_from_slice(&ciphertext);
    Ok(result)
}

/// Unwrap a TLF crypt key previously wrapped with [`wrap_tlf_key`].
pub fn unwrap_tlf_key(
    device: &DeviceSecret,
    tlf: &TlfId,
    key_gen: KeyGen,
    wrapped: &[u8],
) -> anyhow::Result<TlfCryptKey> {
    if wrapped.len() != NONCE_SIZE + KEY_SIZE + TAG_SIZE {
        anyhow::bail!(
            "wrapped key has wrong size: {} bytes (expected {})",
            wrapped.len(),
            NONCE_SIZE + KEY_SIZE + TAG_SIZE
        );
    }

    let (nonce_bytes, ciphertext) = wrapped.split_at(NONCE_SIZE);
    let nonce = XNonce::from_slice(nonce_bytes);
    let mut wrap_key = device.wrap_key()?;
    let cipher = XChaCha20Poly1305::new((&wrap_key).into());
    wrap_key.zeroize();
    let aad = wrap_aad(tlf, key_gen);

    let mut plaintext = cipher
        .decrypt(
            nonce,
            Payload {
                msg: ciphertext,
                aad: &aad,
            },
        )
        .map_err(|_| anyhow::anyhow!("key unwrapping failed: wrong device or corrupted bundle"))?;

    let mut key_bytes = [0u8; KEY_SIZE];
    key_bytes.copy_from_slice(&plaintext);
    plaintext.zeroize();
    Ok(TlfCryptKey::from_bytes(key_bytes))
}
