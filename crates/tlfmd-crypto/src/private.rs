//! Private-section encryption
//!
//! Encrypted private section format (binary):
//! ```text
//! [24 bytes: random nonce][N bytes: ciphertext][16 bytes: Poly1305 tag]
//! AAD = tlf_id (16 bytes) || key_gen (4 bytes, big-endian)
//! ```
//!
//! The AAD binds the section to its folder and key generation, so a section
//! cannot be replayed into another folder or relabeled with another key.

use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    XChaCha20Poly1305, XNonce,
};
use rand::RngCore;
use tlfmd_core::{KeyGen, TlfId};

use crate::keys::TlfCryptKey;
use crate::{NONCE_SIZE, TAG_SIZE};

fn build_aad(tlf: &TlfId, key_gen: KeyGen) -> [u8; 20] {
    let mut aad = [0u8; 20];
    aad[..16].copy_from_slice(tlf.as_bytes());
    aad[16..].copy_from_slice(&key_gen.0.to_be_bytes());
    aad
}

/// Encrypt an encoded private section under the folder key for `key_gen`.
pub fn encrypt_private_metadata(
    key: &TlfCryptKey,
    tlf: &TlfId,
    key_gen: KeyGen,
    plaintext: &[u8],
) -> anyhow::Result<Vec<u8>> {
    let cipher = XChaCha20Poly1305::new(key.as_bytes().into());

    let mut nonce_bytes = [0u8; NONCE_SIZE];
    rand::thread_rng().fill_bytes(&mut nonce_bytes);
    let nonce = XNonce::from_slice(&nonce_bytes);
    let aad = build_aad(tlf, key_gen);

    let ciphertext = cipher
        .encrypt(
            nonce,
            Payload {
                msg: plaintext,
                aad: &aad,
            },
        )
        .map_err(|e| anyhow::anyhow!("private metadata encryption failed: {e}"))?;

    let mut result = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    result.extend_from_slice(&nonce_bytes);
    result.extend_from_slice(&ciphertext);
    Ok(result)
}

/// Decrypt an encrypted private section.
pub fn decrypt_private_metadata(
    key: &TlfCryptKey,
    tlf: &TlfId,
    key_gen: KeyGen,
    encrypted: &[u8],
) -> anyhow::Result<Vec<u8>> {
    if encrypted.len() < NONCE_SIZE + TAG_SIZE {
        anyhow::bail!(
            "encrypted private metadata too short: {} bytes (minimum {})",
            encrypted.len(),
            NONCE_SIZE + TAG_SIZE
        );
    }

    let (nonce_bytes, ciphertext) = encrypted.split_at(NONCE_SIZE);
    let nonce = XNonce::from_slice(nonce_bytes);
    let cipher = XChaCha20Poly1305::new(key.as_bytes().into());
    let aad = build_aad(tlf, key_gen);

    cipher
        .decrypt(
            nonce,
            Payload {
                msg: ciphertext,
                aad: &aad,
            },
        )
        .map_err(|_| anyhow::anyhow!("private metadata decryption failed: wrong key generation or corrupted data"))
}
