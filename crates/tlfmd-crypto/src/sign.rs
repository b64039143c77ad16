//! Ed25519 signatures over canonical metadata encodings

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier};
use rand::RngCore;
use tlfmd_core::{SignatureInfo, VerifyingKey};
use zeroize::Zeroize;

use crate::SIG_VERSION_ED25519;

/// A device signing key.
#[derive(Clone)]
pub struct SigningIdentity {
    key: SigningKey,
}

impl SigningIdentity {
    pub fn generate() -> Self {
        let mut seed = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut seed);
        let key = SigningKey::from_bytes(&seed);
        seed.zeroize();
        Self { key }
    }

    pub fn from_seed(seed: &[u8; 32]) -> Self {
        Self {
            key: SigningKey::from_bytes(seed),
        }
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        VerifyingKey(self.key.verifying_key().to_bytes())
    }

    pub fn sign(&self, payload: &[u8]) -> SignatureInfo {
        let signature: Signature = self.key.sign(payload);
        SignatureInfo {
            version: SIG_VERSION_ED25519,
            signature: signature.to_bytes().to_vec(),
            verifying_key: self.verifying_key(),
        }
    }
}

impl std::fmt::Debug for SigningIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SigningIdentity")
            .field("verifying_key", &self.verifying_key())
            .finish()
    }
}

/// Check `sig` over `payload` against the key recorded in `sig`.
pub fn verify_signature(payload: &[u8], sig: &SignatureInfo) -> anyhow::Result<()> {
    if sig.version != SIG_VERSION_ED25519 {
        anyhow::bail!("unsupported signature version {}", sig.version);
    }
    let key = ed25519_dalek::VerifyingKey::from_bytes(sig.verifying_key.as_bytes())
        .map_err(|e| anyhow::anyhow!("malformed verifying key {}: {e}", sig.verifying_key))?;
    let signature = Signature::from_slice(&sig.signature)
        .map_err(|e| anyhow::anyhow!("malformed signature: {e}"))?;
    key.verify(payload, &signature)
        .map_err(|_| anyhow::anyhow!("signature does not verify under {}", sig.verifying_key))
}
