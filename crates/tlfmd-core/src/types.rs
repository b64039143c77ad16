//! Identifiers and small value types shared by the store and the engine.

use std::fmt;
use std::ops::Add;
use std::str::FromStr;

use rand::RngCore;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Declares a fixed-width byte identifier that displays and serializes as
/// lowercase hex. The all-zero value is the "null" identifier.
macro_rules! byte_id {
    ($(#[$meta:meta])* $name:ident, $len:expr) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
        pub struct $name(pub [u8; $len]);

        impl $name {
            pub const LEN: usize = $len;

            pub fn from_bytes(bytes: [u8; $len]) -> Self {
                Self(bytes)
            }

            pub fn as_bytes(&self) -> &[u8; $len] {
                &self.0
            }

            pub fn is_zero(&self) -> bool {
                self.0.iter().all(|b| *b == 0)
            }

            pub fn to_hex(&self) -> String {
                hex::encode(self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.to_hex())
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.to_hex())
            }
        }

        impl FromStr for $name {
            type Err = IdParseError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let raw = hex::decode(s).map_err(|e| IdParseError {
                    kind: stringify!($name),
                    reason: e.to_string(),
                })?;
                let bytes: [u8; $len] = raw.try_into().map_err(|v: Vec<u8>| IdParseError {
                    kind: stringify!($name),
                    reason: format!("expected {} bytes, got {}", $len, v.len()),
                })?;
                Ok(Self(bytes))
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(&self.to_hex())
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let s = String::deserialize(deserializer)?;
                s.parse().map_err(serde::de::Error::custom)
            }
        }
    };
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid {kind}: {reason}")]
pub struct IdParseError {
    pub kind: &'static str,
    pub reason: String,
}

byte_id!(
    /// Folder identifier. The final byte encodes the folder type.
    TlfId,
    16
);

byte_id!(
    /// Identifies a device-local unmerged history. `BranchId::NULL` marks the
    /// merged branch.
    BranchId,
    16
);

byte_id!(
    /// Content hash of a bare metadata revision.
    MdId,
    32
);

byte_id!(
    /// Content-derived identifier of a writer key bundle.
    WriterKeyBundleId,
    32
);

byte_id!(
    /// Content-derived identifier of a reader key bundle.
    ReaderKeyBundleId,
    32
);

byte_id!(
    /// Public half of a device encryption key; identifies the device for
    /// branch records and key bundles.
    CryptPublicKey,
    32
);

byte_id!(
    /// Ed25519 verifying key bytes.
    VerifyingKey,
    32
);

const TLF_SUFFIX_PRIVATE: u8 = 0x16;
const TLF_SUFFIX_PUBLIC: u8 = 0x17;
const TLF_SUFFIX_TEAM: u8 = 0x26;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TlfType {
    Private,
    Public,
    SingleTeam,
}

impl TlfType {
    fn suffix(self) -> u8 {
        match self {
            TlfType::Private => TLF_SUFFIX_PRIVATE,
            TlfType::Public => TLF_SUFFIX_PUBLIC,
            TlfType::SingleTeam => TLF_SUFFIX_TEAM,
        }
    }
}

impl fmt::Display for TlfType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TlfType::Private => "private",
            TlfType::Public => "public",
            TlfType::SingleTeam => "team",
        };
        f.write_str(s)
    }
}

impl TlfId {
    /// Allocate a fresh random folder ID of the given type.
    pub fn random(tlf_type: TlfType) -> Self {
        let mut bytes = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut bytes[..15]);
        bytes[15] = tlf_type.suffix();
        Self(bytes)
    }

    pub fn tlf_type(&self) -> Option<TlfType> {
        match self.0[15] {
            TLF_SUFFIX_PRIVATE => Some(TlfType::Private),
            TLF_SUFFIX_PUBLIC => Some(TlfType::Public),
            TLF_SUFFIX_TEAM => Some(TlfType::SingleTeam),
            _ => None,
        }
    }
}

impl BranchId {
    pub const NULL: BranchId = BranchId([0u8; 16]);

    pub fn random() -> Self {
        loop {
            let mut bytes = [0u8; 16];
            rand::thread_rng().fill_bytes(&mut bytes);
            let bid = Self(bytes);
            if !bid.is_null() {
                return bid;
            }
        }
    }

    pub fn is_null(&self) -> bool {
        self.is_zero()
    }
}

impl MdId {
    pub const NULL: MdId = MdId([0u8; 32]);
}

/// Whether a revision belongs to the canonical history or a device branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeStatus {
    Merged,
    Unmerged,
}

impl fmt::Display for MergeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MergeStatus::Merged => f.write_str("merged"),
            MergeStatus::Unmerged => f.write_str("unmerged"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Revision(pub i64);

impl Revision {
    pub const UNINITIALIZED: Revision = Revision(0);
    pub const INITIAL: Revision = Revision(1);

    pub fn next(self) -> Revision {
        Revision(self.0 + 1)
    }

    pub fn prev(self) -> Revision {
        Revision(self.0 - 1)
    }

    pub fn is_valid(self) -> bool {
        self.0 >= Self::INITIAL.0
    }
}

impl Add<i64> for Revision {
    type Output = Revision;

    fn add(self, rhs: i64) -> Revision {
        Revision(self.0 + rhs)
    }
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// TLF key generation. Public folders use `KeyGen::PUBLIC`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct KeyGen(pub i32);

impl KeyGen {
    pub const PUBLIC: KeyGen = KeyGen(-1);
    pub const FIRST: KeyGen = KeyGen(1);
}

impl fmt::Display for KeyGen {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub String);

impl UserId {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TeamId(pub String);

impl fmt::Display for TeamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Server-issued lock identifier, scoped to one folder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LockId(pub u64);

impl fmt::Display for LockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lock requirements attached to a Put.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockContext {
    pub require_lock_id: LockId,
    pub release_after_success: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MdPriority {
    #[default]
    Normal,
    High,
}

/// Metadata format version carried by every block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MetadataVer(pub u32);

impl MetadataVer {
    pub const CURRENT: MetadataVer = MetadataVer(3);
}

impl Default for MetadataVer {
    fn default() -> Self {
        Self::CURRENT
    }
}
