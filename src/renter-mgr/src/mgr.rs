use log::info;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

use renter_fs::{
    replay_recovered, DirHandle, FileHandle, FileInfo, FileParams, FsCore, FsDeps, FsPath,
    FsResult, Hash256, HostKey, Snapshot,
};
use wal_lib::Wal;

use crate::alerts::AlertRegistry;
use crate::bubble::BubbleMgr;
use crate::contractor::HostContractor;
use crate::task_group::TaskGroup;
use crate::ApiResult;

/// Name of the write-ahead log inside the repository root.
pub const WAL_FILE_NAME: &str = "renter.wal";

/// Top-level wiring of the metadata core: the repository tree, the bubble
/// coordinator, the alert registry and the signal channels the repair
/// loops listen on.
pub struct RenterMgr {
    fs: Arc<FsCore>,
    bubble: BubbleMgr,
    alerts: Arc<AlertRegistry>,
    contractor: Arc<dyn HostContractor>,
    tg: TaskGroup,
    repair_needed_rx: Mutex<Option<mpsc::Receiver<()>>>,
    stuck_chunk_found_rx: Mutex<Option<mpsc::Receiver<()>>>,
}

impl RenterMgr {
    /// Opens (or initializes) the repository at `root`. Replays the WAL
    /// before any node is served.
    pub async fn new(
        root: &Path,
        deps: Arc<dyn FsDeps>,
        contractor: Arc<dyn HostContractor>,
    ) -> FsResult<Self> {
        deps.create_dir_all(root)
            .await
            .map_err(|e| renter_fs::FsError::DiskFault(e.to_string()))?;
        let (wal, recovered) = Wal::open(root.join(WAL_FILE_NAME)).await?;
        if !recovered.is_empty() {
            info!("replaying {} unreleased wal transaction(s)", recovered.len());
        }
        replay_recovered(&deps, recovered).await?;

        let fs = Arc::new(FsCore::new(root, wal, deps).await?);
        let alerts = Arc::new(AlertRegistry::new());
        let tg = TaskGroup::new();
        let (repair_tx, repair_rx) = mpsc::channel(1);
        let (stuck_tx, stuck_rx) = mpsc::channel(1);
        let bubble = BubbleMgr::new(
            fs.clone(),
            contractor.clone(),
            alerts.clone(),
            repair_tx,
            stuck_tx,
            tg.clone(),
        );
        Ok(Self {
            fs,
            bubble,
            alerts,
            contractor,
            tg,
            repair_needed_rx: Mutex::new(Some(repair_rx)),
            stuck_chunk_found_rx: Mutex::new(Some(stuck_rx)),
        })
    }

    pub fn fs(&self) -> &Arc<FsCore> {
        &self.fs
    }

    pub fn alerts(&self) -> &Arc<AlertRegistry> {
        &self.alerts
    }

    pub fn bubble_mgr(&self) -> &BubbleMgr {
        &self.bubble
    }

    pub fn task_group(&self) -> &TaskGroup {
        &self.tg
    }

    /// Hands the capacity-1 repair wake-up channel to the repair loop.
    /// Can be taken once.
    pub fn take_repair_needed(&self) -> Option<mpsc::Receiver<()>> {
        self.repair_needed_rx.lock().unwrap().take()
    }

    /// Hands the capacity-1 stuck-chunk wake-up channel to the stuck
    /// loop. Can be taken once.
    pub fn take_stuck_chunk_found(&self) -> Option<mpsc::Receiver<()>> {
        self.stuck_chunk_found_rx.lock().unwrap().take()
    }

    pub async fn open_file(&self, path: &FsPath) -> ApiResult<FileHandle> {
        Ok(self.fs.open_file(path).await?)
    }

    pub async fn open_dir(&self, path: &FsPath) -> ApiResult<DirHandle> {
        Ok(self.fs.open_dir(path).await?)
    }

    /// Creates a file along with any missing parent directories and
    /// queues a bubble so the new entry shows up in the aggregates.
    pub async fn create_file(&self, path: &FsPath, params: FileParams) -> ApiResult<FileHandle> {
        let handle = self.fs.create_file(path, params).await?;
        self.bubble.bubble(&path.dir());
        Ok(handle)
    }

    /// Deletes a file or directory subtree, then re-bubbles the parent.
    pub async fn delete(&self, path: &FsPath) -> ApiResult<()> {
        self.fs.delete(path).await?;
        self.bubble.bubble(&path.dir());
        Ok(())
    }

    /// Renames a file and re-bubbles both affected directories.
    pub async fn rename_file(&self, old: &FsPath, new: &FsPath) -> ApiResult<()> {
        self.fs.rename_file(old, new).await?;
        self.bubble.bubble(&old.dir());
        self.bubble.bubble(&new.dir());
        Ok(())
    }

    /// Renames a directory subtree and re-bubbles both affected parents.
    pub async fn rename_dir(&self, old: &FsPath, new: &FsPath) -> ApiResult<()> {
        self.fs.rename_dir(old, new).await?;
        self.bubble.bubble(&old.dir());
        self.bubble.bubble(&new.dir());
        Ok(())
    }

    /// Records a piece on an open file and queues a bubble of the file's
    /// directory. Idempotent like the underlying store operation.
    pub async fn add_piece(
        &self,
        handle: &FileHandle,
        host: &HostKey,
        chunk_index: u64,
        piece_index: u32,
        merkle_root: Hash256,
    ) -> ApiResult<()> {
        handle
            .file()
            .add_piece(host, chunk_index, piece_index, merkle_root)
            .await?;
        self.bubble.bubble(&handle.fs_path().dir());
        Ok(())
    }

    pub async fn snapshot(&self, handle: &FileHandle) -> ApiResult<Snapshot> {
        Ok(handle.file().snapshot(handle.fs_path()).await?)
    }

    pub async fn snapshot_range(
        &self,
        handle: &FileHandle,
        offset: u64,
        length: u64,
    ) -> ApiResult<Snapshot> {
        Ok(handle
            .file()
            .snapshot_range(handle.fs_path(), offset, length)
            .await?)
    }

    /// Queues a bubble of `path`; returns immediately.
    pub fn bubble(&self, path: &FsPath) {
        self.bubble.bubble(path);
    }

    /// The derived view of an open file against the contractor's current
    /// host maps.
    pub async fn file_info(&self, handle: &FileHandle) -> ApiResult<FileInfo> {
        let maps = self.contractor.contract_and_utility_maps().await;
        Ok(self
            .fs
            .file_info(handle, &maps.offline, &maps.good_for_renew, &maps.contract_ends())
            .await?)
    }

    /// Signals shutdown and waits for in-flight bubbles to drain.
    pub async fn stop(&self) {
        self.tg.stop().await;
    }
}
