//! Merkle leaf encryption for non-public folders
//!
//! The nonce comes from the KBFS root the leaf was published under, so the
//! ciphertext is stored without a nonce prefix.

use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    XChaCha20Poly1305, XNonce,
};
use tlfmd_core::{codec, EncryptedMerkleLeaf, MerkleLeaf, TlfId};
use zeroize::Zeroize;

use crate::keys::hkdf_derive;
use crate::NONCE_SIZE;

pub const MERKLE_LEAF_VERSION: u8 = 1;

fn leaf_cipher(tlf_private_key: &[u8; 32]) -> anyhow::Result<XChaCha20Poly1305> {
    let mut key = hkdf_derive(tlf_private_key, b"tlfmd-merkle-leaf")?;
    let cipher = XChaCha20Poly1305::new((&key).into());
    key.zeroize();
    Ok(cipher)
}

pub fn encrypt_merkle_leaf(
    tlf_private_key: &[u8; 32],
    tlf: &TlfId,
    nonce: &[u8; NONCE_SIZE],
    leaf: &MerkleLeaf,
) -> anyhow::Result<EncryptedMerkleLeaf> {
    let plaintext = codec::encode(leaf)?;
    let encrypted_data = leaf_cipher(tlf_private_key)?
        .encrypt(
            XNonce::from_slice(nonce),
            Payload {
                msg: &plaintext,
                aad: tlf.as_bytes(),
            },
        )
        .map_err(|e| anyhow::anyhow!("merkle leaf encryption failed: {e}"))?;
    Ok(EncryptedMerkleLeaf {
        version: MERKLE_LEAF_VERSION,
        encrypted_data,
    })
}

pub fn decrypt_merkle_leaf(
    tlf_private_key: &[u8; 32],
    tlf: &TlfId,
    nonce: &[u8; NONCE_SIZE],
    leaf: &EncryptedMerkleLeaf,
) -> anyhow::Result<MerkleLeaf> {
    if leaf.version != MERKLE_LEAF_VERSION {
        anyhow::bail!("unsupported merkle leaf version {}", leaf.version);
    }
    let plaintext = leaf_cipher(tlf_private_key)?
        .decrypt(
            XNonce::from_slice(nonce),
            Payload {
                msg: &leaf.encrypted_data,
                aad: tlf.as_bytes(),
            },
        )
        .map_err(|_| anyhow::anyhow!("merkle leaf decryption failed"))?;
    codec::decode(&plaintext)
}
