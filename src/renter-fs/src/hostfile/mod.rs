pub mod file;
pub mod format;
pub mod snapshot;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

use crate::{FsError, FsResult};

/// Extension of the on-disk serialization of a hosted file.
pub const RFILE_EXTENSION: &str = ".rfile";

/// Number of unused host key table entries tolerated before the table is
/// compacted.
pub const HOST_TABLE_PRUNE_THRESHOLD: usize = 50;

/// A 32-byte merkle root.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Hash256(pub [u8; 32]);

impl Hash256 {
    pub fn from_hex(s: &str) -> FsResult<Self> {
        let bytes = hex::decode(s).map_err(|e| FsError::Invalid(format!("bad hash: {}", e)))?;
        if bytes.len() != 32 {
            return Err(FsError::Invalid(format!("bad hash length: {}", bytes.len())));
        }
        let mut out = [0u8; 32];
        out.copy_from_slice(&bytes);
        Ok(Self(out))
    }

    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }
}

impl fmt::Display for Hash256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl Serialize for Hash256 {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(self.0))
    }
}

impl<'de> Deserialize<'de> for Hash256 {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Hash256::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// The public key of a remote host in the canonical `<algo>:<hex>` string
/// form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HostKey(String);

impl HostKey {
    pub fn new(raw: &str) -> FsResult<Self> {
        match raw.split_once(':') {
            Some((algo, key)) if !algo.is_empty() && !key.is_empty() => {
                Ok(Self(raw.to_string()))
            }
            _ => Err(FsError::Invalid(format!("bad host key: {}", raw))),
        }
    }

    pub fn ed25519(key: &[u8]) -> Self {
        Self(format!("ed25519:{}", hex::encode(key)))
    }

    pub fn algo(&self) -> &str {
        self.0.split_once(':').map(|(a, _)| a).unwrap_or("")
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for HostKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Stable identifier of a file, immutable across renames.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FileUid(String);

impl FileUid {
    pub fn generate() -> Self {
        let mut bytes = [0u8; 16];
        rand::Rng::fill(&mut rand::thread_rng(), &mut bytes);
        Self(hex::encode(bytes))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FileUid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Erasure coding parameters: `data_pieces` (k) shards are enough to
/// recover a chunk, `total_pieces` (n) are produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErasureParams {
    pub data_pieces: u32,
    pub total_pieces: u32,
}

impl ErasureParams {
    pub fn new(data_pieces: u32, total_pieces: u32) -> FsResult<Self> {
        if data_pieces == 0 || total_pieces < data_pieces {
            return Err(FsError::Invalid(format!(
                "bad erasure params: {}/{}",
                data_pieces, total_pieces
            )));
        }
        Ok(Self {
            data_pieces,
            total_pieces,
        })
    }

    pub fn min_pieces(&self) -> u32 {
        self.data_pieces
    }

    pub fn num_pieces(&self) -> u32 {
        self.total_pieces
    }
}

/// Cipher used to encrypt the file content. The key material is opaque to
/// the core.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CipherSuite {
    pub cipher_type: String,
    #[serde(with = "hex_vec")]
    pub key: Vec<u8>,
}

impl CipherSuite {
    pub fn plain() -> Self {
        Self {
            cipher_type: "plaintext".to_string(),
            key: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PartialChunkStatus {
    Invalid,
    Incomplete,
    Completed,
}

/// Where the trailing sub-chunk of this file lives once packed into a
/// shared combined file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartialChunkInfo {
    pub status: PartialChunkStatus,
    /// Chunk index inside the combined file.
    pub combined_index: u64,
    /// Byte offset of this file's data inside the combined chunk.
    pub offset: u64,
    pub length: u64,
}

/// One stored shard: which host table entry holds it and the merkle root
/// that addresses it. The erasure piece index is the slot the piece lives
/// in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Piece {
    pub host_offset: u32,
    pub merkle_root: Hash256,
}

/// One erasure-coded chunk: `total_pieces` slots, each holding the pieces
/// known for that erasure index, plus a stuck marker maintained by the
/// repair logic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub extension: [u8; 16],
    pub stuck: bool,
    pub pieces: Vec<Vec<Piece>>,
}

impl Chunk {
    pub fn new(num_pieces: u32) -> Self {
        Self {
            extension: [0u8; 16],
            stuck: false,
            pieces: vec![Vec::new(); num_pieces as usize],
        }
    }

    /// Total number of stored pieces across all slots.
    pub fn num_pieces(&self) -> usize {
        self.pieces.iter().map(|slot| slot.len()).sum()
    }
}

/// An entry of the de-duplicated per-file host key table. `used` marks
/// entries referenced by a live contract; unused entries are pruning
/// candidates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostKeyEntry {
    pub key: HostKey,
    pub used: bool,
}

/// The file header. Serialized as JSON into the reserved header pages of
/// the `.rfile`; `host_table_offset` and `chunk_table_offset` locate the
/// binary tables that follow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileMeta {
    pub file_size: u64,
    pub piece_size: u64,
    pub erasure: ErasureParams,
    pub cipher: CipherSuite,
    pub uid: FileUid,
    pub mode: u32,

    pub create_time: u64,
    pub access_time: u64,
    pub change_time: u64,
    pub mod_time: u64,
    #[serde(default)]
    pub last_health_check_time: u64,

    /// Path of the local origin of the file, empty if the file was never
    /// on this machine.
    #[serde(default)]
    pub local_path: String,
    #[serde(default)]
    pub share_links: Vec<String>,

    pub host_table_offset: u64,
    pub chunk_table_offset: u64,
    pub num_chunks: u64,

    #[serde(default)]
    pub has_partial_chunk: bool,
    #[serde(default)]
    pub partial_chunks: Vec<PartialChunkInfo>,

    // Derived summary, refreshed after health computations. Authoritative
    // data lives in the chunk table and the contractor's host maps.
    #[serde(default)]
    pub cached_health: f64,
    #[serde(default)]
    pub cached_stuck_health: f64,
    #[serde(default = "default_redundancy")]
    pub cached_redundancy: f64,
    #[serde(default = "default_redundancy")]
    pub cached_user_redundancy: f64,
    #[serde(default)]
    pub cached_expiration: u64,
    #[serde(default)]
    pub cached_uploaded_bytes: u64,
    #[serde(default)]
    pub cached_upload_progress: f64,
    #[serde(default)]
    pub num_stuck_chunks: u64,
}

fn default_redundancy() -> f64 {
    -1.0
}

impl FileMeta {
    /// Bytes of logical file data per chunk.
    pub fn chunk_size(&self) -> u64 {
        self.piece_size * self.erasure.data_pieces as u64
    }
}

/// The per-file values a directory walk needs when recomputing aggregate
/// metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct BubbledFileMetadata {
    pub uid: FileUid,
    pub health: f64,
    pub stuck_health: f64,
    pub redundancy: f64,
    pub num_stuck_chunks: u64,
    pub size: u64,
    pub mod_time: u64,
    pub last_health_check_time: u64,
    pub on_disk: bool,
}

pub(crate) mod hex_vec {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        hex::decode(&s).map_err(serde::de::Error::custom)
    }
}
