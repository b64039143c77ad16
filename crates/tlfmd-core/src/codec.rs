//! Canonical encoding used for content hashes and signatures.
//!
//! Every hashed or signed structure is a field-ordered struct whose maps are
//! `BTreeMap`s, so `serde_json` output is deterministic for equal values.

use anyhow::Context;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Encode a value in canonical form.
pub fn encode<T: Serialize>(value: &T) -> anyhow::Result<Vec<u8>> {
    serde_json::to_vec(value).context("canonical encode failed")
}

/// Decode a canonically encoded value.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> anyhow::Result<T> {
    serde_json::from_slice(bytes).context("canonical decode failed")
}

/// BLAKE3 of the canonical encoding.
pub fn content_hash<T: Serialize>(value: &T) -> anyhow::Result<[u8; 32]> {
    let bytes = encode(value)?;
    Ok(*blake3::hash(&bytes).as_bytes())
}

/// Serde adapter storing opaque bytes as standard base64.
pub mod b64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(s).map_err(serde::de::Error::custom)
    }
}

/// Same as [`b64`] for a list of byte strings.
pub mod b64_vec {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(items: &[Vec<u8>], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(items.iter().map(|b| STANDARD.encode(b)))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<Vec<u8>>, D::Error> {
        let raw = Vec::<String>::deserialize(deserializer)?;
        raw.into_iter()
            .map(|s| STANDARD.decode(s).map_err(serde::de::Error::custom))
            .collect()
    }
}
