mod wal;

pub use wal::{RecoveredTxn, Transaction, Wal};

use serde::{Deserialize, Serialize};
use thiserror::Error;

// Update names understood by the metadata stores. The set is closed: the
// replay path refuses anything else so a corrupted record cannot silently
// turn into a no-op.
pub const UPDATE_FILE_INSERT: &str = "file-insert";
pub const UPDATE_FILE_DELETE: &str = "file-delete";
pub const UPDATE_PARTIAL_DELETE: &str = "partial-delete";
pub const UPDATE_DIR_METADATA: &str = "dir-metadata";
pub const UPDATE_DIR_DELETE: &str = "dir-delete";

/// Returns true if `name` is one of the update names the metadata stores
/// know how to apply.
pub fn is_known_update(name: &str) -> bool {
    matches!(
        name,
        UPDATE_FILE_INSERT
            | UPDATE_FILE_DELETE
            | UPDATE_PARTIAL_DELETE
            | UPDATE_DIR_METADATA
            | UPDATE_DIR_DELETE
    )
}

#[derive(Error, Debug)]
pub enum WalError {
    #[error("wal setup failed: {0}")]
    Setup(String),
    #[error("wal apply failed: {0}")]
    Apply(String),
    #[error("wal corrupt: {0}")]
    Corrupt(String),
    #[error("wal I/O error: {0}")]
    Io(String),
}

pub type WalResult<T> = std::result::Result<T, WalError>;

impl From<std::io::Error> for WalError {
    fn from(err: std::io::Error) -> Self {
        WalError::Io(err.to_string())
    }
}

/// A single named update inside a transaction. The payload is an opaque
/// serialized instruction; its schema is owned by whoever registered the
/// name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Update {
    pub name: String,
    #[serde(with = "hex_bytes")]
    pub payload: Vec<u8>,
}

impl Update {
    pub fn new(name: &str, payload: Vec<u8>) -> Self {
        Self {
            name: name.to_string(),
            payload,
        }
    }
}

pub(crate) mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        hex::decode(&s).map_err(serde::de::Error::custom)
    }
}
