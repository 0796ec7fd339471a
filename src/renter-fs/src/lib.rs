mod deps;
mod fspath;
mod health;
mod hostdir;
mod hostfile;
mod persist;
mod tree;

pub use deps::{is_disk_fault, DirEntryInfo, DiskFs, FaultyFs, FileStat, FsDeps, FAULTY_FS_ERROR};
pub use fspath::FsPath;
pub use health::{file_health, HealthInfo};
pub use hostdir::{
    DirMetadata, HostedDir, DEFAULT_DIR_HEALTH, DEFAULT_DIR_REDUNDANCY, DIR_METADATA_NAME,
    METADATA_VERSION,
};
pub use hostfile::file::{FileParams, HostedFile, PARTIAL_EXTENSION};
pub use hostfile::format::{
    marshaled_chunk_size, pages_for, HASH_SIZE, MARSHALED_CHUNK_OVERHEAD, MARSHALED_PIECE_SIZE,
    PAGE_SIZE,
};
pub use hostfile::snapshot::{Snapshot, SnapshotChunk, SnapshotPiece, SnapshotReader};
pub use hostfile::{
    BubbledFileMetadata, Chunk, CipherSuite, ErasureParams, FileMeta, FileUid, Hash256, HostKey,
    HostKeyEntry, PartialChunkInfo, PartialChunkStatus, Piece, HOST_TABLE_PRUNE_THRESHOLD,
    RFILE_EXTENSION,
};
pub use persist::{
    apply_update, create_and_apply_transaction, dir_delete_update, dir_metadata_update,
    file_delete_update, file_insert_update, partial_delete_update, replay_recovered,
};
pub use tree::fs_core::{health_percentage, FileInfo, FsCore};
pub use tree::{DirHandle, FileHandle};

use thiserror::Error;
pub use wal_lib::{Update, Wal, WalError};

#[derive(Error, Debug)]
pub enum FsError {
    #[error("not found: {0}")]
    NotExist(String),
    #[error("already exists: {0}")]
    Exists(String),
    #[error("deleted: {0}")]
    Deleted(String),
    #[error("path collides with an existing entry of a different kind: {0}")]
    PathOverload(String),
    #[error("invalid: {0}")]
    Invalid(String),
    #[error("disk fault: {0}")]
    DiskFault(String),
    #[error("operation cancelled by shutdown")]
    Cancelled,
    #[error("wal error: {0}")]
    Wal(#[from] WalError),
    #[error("internal error: {0}")]
    Internal(String),
}

impl FsError {
    pub fn is_not_exist(&self) -> bool {
        matches!(self, FsError::NotExist(_))
    }
}

pub type FsResult<T> = std::result::Result<T, FsError>;

impl From<std::io::Error> for FsError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => FsError::NotExist(err.to_string()),
            std::io::ErrorKind::AlreadyExists => FsError::Exists(err.to_string()),
            _ => FsError::DiskFault(err.to_string()),
        }
    }
}

/// Returns the current unix time in seconds. The zero value is reserved for
/// "never"/"unset" everywhere in the metadata.
pub fn unix_timestamp() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
