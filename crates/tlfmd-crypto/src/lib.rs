//! tlfmd-crypto: signing and encryption of folder metadata
//!
//! Key hierarchy:
//! ```text
//! Device secret (256-bit, per device)
//!   ├── Crypt public key (BLAKE3 derive_key of the secret; identifies the device)
//!   └── Wrap key (HKDF, domain="tlfmd-tlf-key-wrap")
//!       └── TLF crypt key, one per key generation, wrapped into key bundles
//!           └── Private section AEAD: XChaCha20-Poly1305 (nonce=random_192bit, AAD=tlf_id||key_gen)
//! TLF private key (stored in the private section of each key generation)
//!   └── Merkle leaf key (HKDF, domain="tlfmd-merkle-leaf"), nonce from the KBFS root
//! Signing key (Ed25519, per device)
//! ```

pub mod keys;
pub mod merkle_leaf;
pub mod private;
pub mod sign;

pub use keys::{generate_tlf_crypt_key, unwrap_tlf_key, wrap_tlf_key, DeviceSecret, TlfCryptKey};
pub use merkle_leaf::{decrypt_merkle_leaf, encrypt_merkle_leaf};
pub use private::{decrypt_private_metadata, encrypt_private_metadata};
pub use sign::{verify_signature, SigningIdentity};

/// Size of a symmetric key in bytes (256-bit)
pub const KEY_SIZE: usize = 32;

/// Size of an XChaCha20-Poly1305 nonce (192-bit)
pub const NONCE_SIZE: usize = 24;

/// Size of a Poly1305 authentication tag
pub const TAG_SIZE: usize = 16;

/// Signature scheme version recorded in `SignatureInfo`
pub const SIG_VERSION_ED25519: u8 = 1;
