//! WAL update payloads and the replay/apply path shared by the file and
//! directory stores. Every update is idempotent: replaying any prefix of
//! the log and then the whole log lands on the same on-disk state.

use log::{debug, error};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use wal_lib::{
    RecoveredTxn, Update, Wal, UPDATE_DIR_DELETE, UPDATE_DIR_METADATA, UPDATE_FILE_DELETE,
    UPDATE_FILE_INSERT, UPDATE_PARTIAL_DELETE,
};

use crate::deps::FsDeps;
use crate::hostfile::hex_vec;
use crate::{FsError, FsResult};

#[derive(Debug, Serialize, Deserialize)]
struct FileInsertData {
    path: PathBuf,
    offset: u64,
    #[serde(with = "hex_vec")]
    bytes: Vec<u8>,
}

#[derive(Debug, Serialize, Deserialize)]
struct PathOnlyData {
    path: PathBuf,
}

#[derive(Debug, Serialize, Deserialize)]
struct DirMetadataData {
    path: PathBuf,
    #[serde(with = "hex_vec")]
    bytes: Vec<u8>,
}

fn encode<T: Serialize>(name: &str, data: &T) -> Update {
    // Payload encoding cannot fail for these plain structs.
    let payload = serde_json::to_vec(data).expect("encode wal payload");
    Update::new(name, payload)
}

/// Overwrites a byte range of a file's on-disk serialization.
pub fn file_insert_update(path: &Path, offset: u64, bytes: Vec<u8>) -> Update {
    encode(
        UPDATE_FILE_INSERT,
        &FileInsertData {
            path: path.to_path_buf(),
            offset,
            bytes,
        },
    )
}

pub fn file_delete_update(path: &Path) -> Update {
    encode(
        UPDATE_FILE_DELETE,
        &PathOnlyData {
            path: path.to_path_buf(),
        },
    )
}

pub fn partial_delete_update(path: &Path) -> Update {
    encode(
        UPDATE_PARTIAL_DELETE,
        &PathOnlyData {
            path: path.to_path_buf(),
        },
    )
}

/// Replaces a directory's metadata blob.
pub fn dir_metadata_update(path: &Path, bytes: Vec<u8>) -> Update {
    encode(
        UPDATE_DIR_METADATA,
        &DirMetadataData {
            path: path.to_path_buf(),
            bytes,
        },
    )
}

pub fn dir_delete_update(path: &Path) -> Update {
    encode(
        UPDATE_DIR_DELETE,
        &PathOnlyData {
            path: path.to_path_buf(),
        },
    )
}

fn decode<'a, T: Deserialize<'a>>(update: &'a Update) -> FsResult<T> {
    serde_json::from_slice(&update.payload)
        .map_err(|e| FsError::Invalid(format!("bad {} payload: {}", update.name, e)))
}

fn ignore_not_found(result: std::io::Result<()>) -> FsResult<()> {
    match result {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(FsError::DiskFault(e.to_string())),
    }
}

/// Applies a single named update to the live on-disk state.
pub async fn apply_update(deps: &dyn FsDeps, update: &Update) -> FsResult<()> {
    match update.name.as_str() {
        UPDATE_FILE_INSERT => {
            let data: FileInsertData = decode(update)?;
            if let Some(parent) = data.path.parent() {
                deps.create_dir_all(parent)
                    .await
                    .map_err(|e| FsError::DiskFault(e.to_string()))?;
            }
            deps.write_at(&data.path, data.offset, &data.bytes)
                .await
                .map_err(|e| FsError::DiskFault(e.to_string()))
        }
        UPDATE_FILE_DELETE | UPDATE_PARTIAL_DELETE => {
            let data: PathOnlyData = decode(update)?;
            ignore_not_found(deps.remove(&data.path).await)
        }
        UPDATE_DIR_METADATA => {
            let data: DirMetadataData = decode(update)?;
            if let Some(parent) = data.path.parent() {
                deps.create_dir_all(parent)
                    .await
                    .map_err(|e| FsError::DiskFault(e.to_string()))?;
            }
            deps.write_all(&data.path, &data.bytes)
                .await
                .map_err(|e| FsError::DiskFault(e.to_string()))
        }
        UPDATE_DIR_DELETE => {
            let data: PathOnlyData = decode(update)?;
            ignore_not_found(deps.remove(&data.path).await)?;
            // The directory itself goes away lazily once nothing is left
            // inside it.
            if let Some(parent) = data.path.parent() {
                let _ = deps.remove_dir(parent).await;
            }
            Ok(())
        }
        other => Err(FsError::Invalid(format!("unknown wal update: {}", other))),
    }
}

/// Runs `updates` through a WAL transaction and applies them. Once the
/// transaction's setup is complete the process is committed: an apply
/// failure at that point escalates, the log will finish the job on the
/// next start.
pub async fn create_and_apply_transaction(
    wal: &Arc<Wal>,
    deps: &Arc<dyn FsDeps>,
    updates: Vec<Update>,
) -> FsResult<()> {
    let mut txn = wal
        .new_transaction(updates)
        .await
        .map_err(FsError::Wal)?;
    txn.setup_complete().await.map_err(FsError::Wal)?;
    for update in txn.updates().to_vec() {
        if let Err(e) = apply_update(deps.as_ref(), &update).await {
            error!(
                "failed to apply committed wal update {}: {}",
                update.name, e
            );
            panic!("wal apply failed after commit point: {}", e);
        }
    }
    txn.updates_applied().await.map_err(FsError::Wal)?;
    Ok(())
}

/// Replays transactions recovered by [`Wal::open`]. Must run before any
/// file or directory is opened for user traffic.
pub async fn replay_recovered(
    deps: &Arc<dyn FsDeps>,
    recovered: Vec<RecoveredTxn>,
) -> FsResult<()> {
    for txn in recovered {
        for update in txn.updates.iter() {
            apply_update(deps.as_ref(), update).await?;
        }
        debug!("wal replay: applied {} update(s)", txn.updates.len());
        txn.release().await.map_err(FsError::Wal)?;
    }
    Ok(())
}
