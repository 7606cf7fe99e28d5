use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Sentinel accepted wherever a volume or snapshot id is expected,
/// resolving to the most recently added volume / most recent snapshot.
pub const LATEST: &str = "latest";

/// An 8-byte random snapshot identifier (16 hex chars).
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SnapshotId(pub [u8; 8]);

/// An 8-byte random volume identifier (16 hex chars).
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VolumeId(pub [u8; 8]);

macro_rules! impl_id {
    ($name:ident, $label:expr) => {
        impl $name {
            /// Generate a random id.
            pub fn generate() -> Self {
                let mut buf = [0u8; 8];
                rand::thread_rng().fill_bytes(&mut buf);
                $name(buf)
            }

            pub fn to_hex(&self) -> String {
                hex::encode(self.0)
            }

            /// Parse from a 16-character hex string.
            pub fn from_hex(hex_str: &str) -> std::result::Result<Self, String> {
                let bytes = hex::decode(hex_str).map_err(|e| format!("invalid hex: {e}"))?;
                if bytes.len() != 8 {
                    return Err(format!("expected 8 bytes, got {}", bytes.len()));
                }
                let mut arr = [0u8; 8];
                arr.copy_from_slice(&bytes);
                Ok($name(arr))
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($label, "({})"), self.to_hex())
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.to_hex())
            }
        }
    };
}

impl_id!(SnapshotId, "SnapshotId");
impl_id!(VolumeId, "VolumeId");

impl SnapshotId {
    /// Storage key path: `snapshots/<hex>`.
    pub fn storage_key(&self) -> String {
        format!("snapshots/{}", self.to_hex())
    }
}
