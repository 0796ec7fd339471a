//! The per-directory metadata store. Each directory carries exactly one
//! `.rdir` file: a JSON blob of local health fields plus the `aggregate_*`
//! counterparts summarizing the whole subtree, maintained by the bubble
//! walks.

use log::debug;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;

use wal_lib::{Update, Wal};

use crate::deps::FsDeps;
use crate::persist::{create_and_apply_transaction, dir_delete_update, dir_metadata_update};
use crate::{unix_timestamp, FsError, FsResult};

/// Name of the metadata file inside every tracked directory.
pub const DIR_METADATA_NAME: &str = ".rdir";

/// Default health of a fresh (or unreadable) directory. Zero keeps empty
/// directories from looking like repair work.
pub const DEFAULT_DIR_HEALTH: f64 = 0.0;

/// Default redundancy of a fresh (or unreadable) directory.
pub const DEFAULT_DIR_REDUNDANCY: f64 = -1.0;

pub const METADATA_VERSION: &str = "1.0";

const DEFAULT_DIR_MODE: u32 = 0o700;

fn default_redundancy() -> f64 {
    DEFAULT_DIR_REDUNDANCY
}

/// The persisted directory metadata. `aggregate_*` fields describe the
/// subtree rooted here, the rest only this directory's direct children.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DirMetadata {
    #[serde(default)]
    pub aggregate_health: f64,
    #[serde(default)]
    pub aggregate_last_health_check_time: u64,
    #[serde(default = "default_redundancy")]
    pub aggregate_min_redundancy: f64,
    #[serde(default)]
    pub aggregate_mod_time: u64,
    #[serde(default)]
    pub aggregate_num_files: u64,
    #[serde(default)]
    pub aggregate_num_stuck_chunks: u64,
    #[serde(default)]
    pub aggregate_num_sub_dirs: u64,
    #[serde(default)]
    pub aggregate_remote_health: f64,
    #[serde(default)]
    pub aggregate_size: u64,
    #[serde(default)]
    pub aggregate_stuck_health: f64,

    #[serde(default)]
    pub health: f64,
    #[serde(default)]
    pub last_health_check_time: u64,
    #[serde(default = "default_redundancy")]
    pub min_redundancy: f64,
    #[serde(default)]
    pub mod_time: u64,
    #[serde(default)]
    pub num_files: u64,
    #[serde(default)]
    pub num_stuck_chunks: u64,
    #[serde(default)]
    pub num_sub_dirs: u64,
    #[serde(default)]
    pub remote_health: f64,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub stuck_health: f64,

    #[serde(default)]
    pub mode: u32,
    #[serde(default)]
    pub version: String,
}

impl DirMetadata {
    /// Metadata of a freshly created directory.
    pub fn new(mode: u32) -> Self {
        let now = unix_timestamp();
        Self {
            aggregate_health: DEFAULT_DIR_HEALTH,
            aggregate_last_health_check_time: 0,
            aggregate_min_redundancy: DEFAULT_DIR_REDUNDANCY,
            aggregate_mod_time: now,
            aggregate_num_files: 0,
            aggregate_num_stuck_chunks: 0,
            aggregate_num_sub_dirs: 0,
            aggregate_remote_health: DEFAULT_DIR_HEALTH,
            aggregate_size: 0,
            aggregate_stuck_health: DEFAULT_DIR_HEALTH,
            health: DEFAULT_DIR_HEALTH,
            last_health_check_time: 0,
            min_redundancy: DEFAULT_DIR_REDUNDANCY,
            mod_time: now,
            num_files: 0,
            num_stuck_chunks: 0,
            num_sub_dirs: 0,
            remote_health: DEFAULT_DIR_HEALTH,
            size: 0,
            stuck_health: DEFAULT_DIR_HEALTH,
            mode,
            version: METADATA_VERSION.to_string(),
        }
    }

    fn encode(&self) -> FsResult<Vec<u8>> {
        serde_json::to_vec_pretty(self)
            .map_err(|e| FsError::Internal(format!("encode dir metadata: {}", e)))
    }
}

struct DirState {
    metadata: DirMetadata,
    /// The directory itself; the metadata blob lives at
    /// `disk_path/.rdir`.
    disk_path: PathBuf,
    deleted: bool,
}

/// The in-memory handle on one tracked directory.
pub struct HostedDir {
    state: Mutex<DirState>,
    wal: Arc<Wal>,
    deps: Arc<dyn FsDeps>,
}

fn metadata_path(dir: &Path) -> PathBuf {
    dir.join(DIR_METADATA_NAME)
}

impl HostedDir {
    /// The WAL update that initializes the metadata blob of `dir`.
    pub fn create_update(dir: &Path, metadata: &DirMetadata) -> FsResult<Update> {
        Ok(dir_metadata_update(&metadata_path(dir), metadata.encode()?))
    }

    /// Creates a directory with fresh metadata. Fails with `Exists` when
    /// the metadata blob is already there.
    pub async fn create(
        dir: &Path,
        mode: u32,
        wal: Arc<Wal>,
        deps: Arc<dyn FsDeps>,
    ) -> FsResult<Arc<Self>> {
        if deps.stat(&metadata_path(dir)).await.is_ok() {
            return Err(FsError::Exists(dir.display().to_string()));
        }
        let metadata = DirMetadata::new(mode);
        let update = Self::create_update(dir, &metadata)?;
        create_and_apply_transaction(&wal, &deps, vec![update]).await?;
        debug!("created directory metadata for {}", dir.display());
        Ok(Arc::new(Self {
            state: Mutex::new(DirState {
                metadata,
                disk_path: dir.to_path_buf(),
                deleted: false,
            }),
            wal,
            deps,
        }))
    }

    /// Makes sure every directory from `root` down to `dir` has a
    /// metadata blob, creating the missing ones in one transaction.
    pub async fn create_all(
        dir: &Path,
        root: &Path,
        mode: u32,
        wal: &Arc<Wal>,
        deps: &Arc<dyn FsDeps>,
    ) -> FsResult<()> {
        let mut updates = Vec::new();
        let mut current = dir.to_path_buf();
        loop {
            if deps.stat(&metadata_path(&current)).await.is_err() {
                updates.push(Self::create_update(&current, &DirMetadata::new(mode))?);
            }
            if current == root {
                break;
            }
            match current.parent() {
                Some(parent) if current.starts_with(root) => current = parent.to_path_buf(),
                _ => {
                    return Err(FsError::Invalid(format!(
                        "{} is outside {}",
                        dir.display(),
                        root.display()
                    )))
                }
            }
        }
        if updates.is_empty() {
            return Ok(());
        }
        create_and_apply_transaction(wal, deps, updates).await
    }

    /// Loads the metadata blob of `dir`. A blob written before versioning
    /// is upgraded in memory; persistence rides along with the next write.
    pub async fn load(dir: &Path, wal: Arc<Wal>, deps: Arc<dyn FsDeps>) -> FsResult<Arc<Self>> {
        let raw = deps
            .read_all(&metadata_path(dir))
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => FsError::NotExist(dir.display().to_string()),
                _ => FsError::DiskFault(e.to_string()),
            })?;
        let mut metadata: DirMetadata = serde_json::from_slice(&raw)
            .map_err(|e| FsError::Invalid(format!("decode {}: {}", dir.display(), e)))?;
        if metadata.version.is_empty() && metadata.mode == 0 {
            metadata.mode = DEFAULT_DIR_MODE;
            metadata.version = METADATA_VERSION.to_string();
        }
        Ok(Arc::new(Self {
            state: Mutex::new(DirState {
                metadata,
                disk_path: dir.to_path_buf(),
                deleted: false,
            }),
            wal,
            deps,
        }))
    }

    pub async fn metadata(&self) -> DirMetadata {
        self.state.lock().await.metadata.clone()
    }

    pub async fn disk_path(&self) -> PathBuf {
        self.state.lock().await.disk_path.clone()
    }

    pub async fn is_deleted(&self) -> bool {
        self.state.lock().await.deleted
    }

    async fn persist_locked(&self, state: &DirState) -> FsResult<()> {
        let update = dir_metadata_update(
            &metadata_path(&state.disk_path),
            state.metadata.encode()?,
        );
        create_and_apply_transaction(&self.wal, &self.deps, vec![update]).await
    }

    /// Replaces the whole metadata blob.
    pub async fn update_metadata(&self, metadata: DirMetadata) -> FsResult<()> {
        let mut state = self.state.lock().await;
        if state.deleted {
            return Err(FsError::Deleted(state.disk_path.display().to_string()));
        }
        state.metadata = metadata;
        self.persist_locked(&state).await
    }

    /// Replaces the bubbled subset of the metadata, keeping the
    /// directory's own `mode` and `version`.
    pub async fn update_bubbled_metadata(&self, mut metadata: DirMetadata) -> FsResult<()> {
        let mut state = self.state.lock().await;
        if state.deleted {
            return Err(FsError::Deleted(state.disk_path.display().to_string()));
        }
        metadata.mode = state.metadata.mode;
        metadata.version = state.metadata.version.clone();
        state.metadata = metadata;
        self.persist_locked(&state).await
    }

    /// Writes only the health check timestamps, used when a full bubble
    /// is already running elsewhere.
    pub async fn update_last_health_check_time(
        &self,
        aggregate: u64,
        local: u64,
    ) -> FsResult<()> {
        let mut state = self.state.lock().await;
        if state.deleted {
            return Err(FsError::Deleted(state.disk_path.display().to_string()));
        }
        state.metadata.aggregate_last_health_check_time = aggregate;
        state.metadata.last_health_check_time = local;
        self.persist_locked(&state).await
    }

    /// Tombstones the directory and queues removal of its metadata blob.
    pub async fn delete(&self) -> FsResult<()> {
        let mut state = self.state.lock().await;
        if state.deleted {
            return Ok(());
        }
        let update = dir_delete_update(&metadata_path(&state.disk_path));
        state.deleted = true;
        create_and_apply_transaction(&self.wal, &self.deps, vec![update]).await
    }

    /// Moves the directory on disk. Loaded children keep working through
    /// their own paths; the caller is responsible for fixing those up.
    pub async fn rename(&self, target: &Path) -> FsResult<()> {
        let mut state = self.state.lock().await;
        if state.deleted {
            return Err(FsError::Deleted(state.disk_path.display().to_string()));
        }
        if self.deps.stat(target).await.is_ok() {
            return Err(FsError::PathOverload(target.display().to_string()));
        }
        if let Some(parent) = target.parent() {
            self.deps
                .create_dir_all(parent)
                .await
                .map_err(|e| FsError::DiskFault(e.to_string()))?;
        }
        self.deps
            .rename(&state.disk_path, target)
            .await
            .map_err(|e| FsError::DiskFault(e.to_string()))?;
        state.disk_path = target.to_path_buf();
        Ok(())
    }

    /// Refreshes the in-memory disk path after a parent directory moved.
    pub async fn set_disk_path(&self, target: &Path) {
        self.state.lock().await.disk_path = target.to_path_buf();
    }

    // Tombstones the in-memory state without touching the disk; used by
    // recursive directory deletion where one transaction already covers
    // the whole subtree.
    pub(crate) async fn mark_deleted(&self) {
        self.state.lock().await.deleted = true;
    }
}
