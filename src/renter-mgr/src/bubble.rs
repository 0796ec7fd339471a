//! The bubble coordinator. A bubble recomputes one directory's aggregate
//! metadata from its children, writes it, and moves on to the parent, all
//! the way to the root. Concurrent requests against the same directory
//! coalesce: one walk runs, a second request parks as pending and is
//! honored by exactly one follow-up walk.

use log::{debug, warn};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

use renter_fs::{
    unix_timestamp, BubbledFileMetadata, DirMetadata, FsCore, FsError, FsPath, FsResult,
    DEFAULT_DIR_HEALTH,
};

use crate::alerts::{file_low_redundancy_alert_id, AlertRegistry, AlertSeverity};
use crate::contractor::{HostContractor, UtilityMaps};
use crate::task_group::TaskGroup;
use crate::{ALERT_LOW_REDUNDANCY_THRESHOLD, NUM_BUBBLE_WORKERS, REPAIR_THRESHOLD};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BubbleStatus {
    Active,
    Pending,
}

pub(crate) struct BubbleState {
    fs: Arc<FsCore>,
    contractor: Arc<dyn HostContractor>,
    alerts: Arc<AlertRegistry>,
    repair_needed: mpsc::Sender<()>,
    stuck_chunk_found: mpsc::Sender<()>,
    tg: TaskGroup,
    // One entry per directory with a bubble in flight, keyed by path.
    updates: Mutex<HashMap<String, BubbleStatus>>,
}

/// Coalescing coordinator for aggregate-metadata recomputation.
#[derive(Clone)]
pub struct BubbleMgr {
    pub(crate) state: Arc<BubbleState>,
}

impl BubbleMgr {
    pub fn new(
        fs: Arc<FsCore>,
        contractor: Arc<dyn HostContractor>,
        alerts: Arc<AlertRegistry>,
        repair_needed: mpsc::Sender<()>,
        stuck_chunk_found: mpsc::Sender<()>,
        tg: TaskGroup,
    ) -> Self {
        Self {
            state: Arc::new(BubbleState {
                fs,
                contractor,
                alerts,
                repair_needed,
                stuck_chunk_found,
                tg,
                updates: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Queues a bubble of `path` and returns immediately. Dropped
    /// silently once shutdown has begun.
    pub fn bubble(&self, path: &FsPath) {
        let state = self.state.clone();
        let path = path.clone();
        let _ = self.state.tg.launch(async move {
            if let Err(e) = Self::managed_bubble(&state, &path).await {
                if !matches!(e, FsError::Cancelled) {
                    debug!("bubble of {} failed: {}", path, e);
                }
            }
        });
    }

    /// True once no bubble is running or parked anywhere.
    pub fn is_quiet(&self) -> bool {
        self.state.updates.lock().unwrap().is_empty()
    }

    // Boxed so the mutual recursion between `managed_bubble` and
    // `perform_bubble` (via the directory-metadata walk, which can
    // schedule a fresh `managed_bubble` for a freshly-discovered child)
    // doesn't produce a structurally self-referential future type.
    fn managed_bubble<'a>(
        state: &'a Arc<BubbleState>,
        path: &'a FsPath,
    ) -> Pin<Box<dyn Future<Output = FsResult<()>> + Send + 'a>> {
        Box::pin(async move {
            if !Self::prepare_bubble(state, path) {
                // Someone else walks this directory and will re-walk it for
                // us; the health-check timestamp is still refreshed so the
                // health loop doesn't starve this directory.
                return Self::update_last_health_check_time(state, path).await;
            }
            Self::perform_bubble(state, path).await
        })
    }

    // Claims the walk of `path`. Returns false when another walk is
    // already running, leaving a pending marker behind so that walk's
    // completion schedules a fresh one.
    pub(crate) fn prepare_bubble(state: &Arc<BubbleState>, path: &FsPath) -> bool {
        let mut updates = state.updates.lock().unwrap();
        match updates.get(path.as_str()) {
            None => {
                updates.insert(path.as_str().to_string(), BubbleStatus::Active);
                true
            }
            Some(_) => {
                updates.insert(path.as_str().to_string(), BubbleStatus::Pending);
                false
            }
        }
    }

    // Ends the walk of `path`. A pending marker means requests arrived
    // mid-walk: exactly one follow-up walk is spawned for all of them.
    pub(crate) fn complete_bubble(state: &Arc<BubbleState>, path: &FsPath) {
        let respawn = {
            let mut updates = state.updates.lock().unwrap();
            match updates.get(path.as_str()).copied() {
                Some(BubbleStatus::Active) => {
                    updates.remove(path.as_str());
                    false
                }
                Some(BubbleStatus::Pending) => {
                    updates.insert(path.as_str().to_string(), BubbleStatus::Active);
                    true
                }
                // Completing without a prepared entry means the
                // coordinator state is corrupt.
                None => panic!("bubble completed without a prepared entry: {}", path),
            }
        };
        if respawn {
            let state2 = state.clone();
            let path2 = path.clone();
            if state
                .tg
                .launch(async move {
                    let _ = Self::perform_bubble(&state2, &path2).await;
                })
                .is_err()
            {
                // Shutdown: the pending walk is abandoned, drop the claim.
                state.updates.lock().unwrap().remove(path.as_str());
            }
        }
    }

    // One full walk of `path`: aggregate the children, write the result,
    // then hand the baton to the parent. Completion and the parent bubble
    // happen whether or not the walk itself succeeded.
    async fn perform_bubble(state: &Arc<BubbleState>, path: &FsPath) -> FsResult<()> {
        let result = Self::bubble_body(state, path).await;
        Self::complete_bubble(state, path);
        if !path.is_root() {
            let parent = path.dir();
            let state2 = state.clone();
            let _ = state.tg.launch(async move {
                let _ = Self::managed_bubble(&state2, &parent).await;
            });
        }
        result
    }

    async fn bubble_body(state: &Arc<BubbleState>, path: &FsPath) -> FsResult<()> {
        let metadata = Self::calculate_directory_metadata(state, path).await?;
        let aggregate_health = metadata.aggregate_health;
        let aggregate_num_stuck_chunks = metadata.aggregate_num_stuck_chunks;

        match state.fs.open_dir(path).await {
            Ok(handle) => {
                if let Err(e) = handle.dir().update_bubbled_metadata(metadata).await {
                    warn!("could not write bubbled metadata of {}: {}", path, e);
                }
                handle.close();
            }
            Err(e) => warn!("could not open {} to write bubbled metadata: {}", path, e),
        }

        // The repair loops start at the root, so only a root bubble is
        // worth a wake-up. Both channels are capacity one: send or skip.
        if path.is_root() {
            if aggregate_health >= REPAIR_THRESHOLD {
                let _ = state.repair_needed.try_send(());
            }
            if aggregate_num_stuck_chunks > 0 {
                let _ = state.stuck_chunk_found.try_send(());
            }
        }
        Ok(())
    }

    // Recomputes the aggregate metadata of `path` from its on-disk
    // children. Per-child failures are logged and skipped; a broken child
    // must not stall the whole tree.
    async fn calculate_directory_metadata(
        state: &Arc<BubbleState>,
        path: &FsPath,
    ) -> FsResult<DirMetadata> {
        let now = unix_timestamp();
        let mut metadata = bubble_start_metadata(now);

        let (file_paths, dir_paths) = match state.fs.read_dir(path).await {
            Ok(children) => children,
            Err(e) => {
                warn!("could not read children of {}: {}", path, e);
                return Err(e);
            }
        };
        let maps = state.contractor.contract_and_utility_maps().await;

        let file_metadatas = Self::calculate_file_metadatas(state, file_paths, &maps).await?;
        let dir_metadatas = Self::directory_metadatas(state, dir_paths).await?;

        for entry in file_metadatas {
            let fm = entry.md;
            let max_health = fm.health.max(fm.stuck_health);
            let alert_id = file_low_redundancy_alert_id(&fm.uid);
            if max_health >= ALERT_LOW_REDUNDANCY_THRESHOLD {
                state.alerts.register_alert(
                    &alert_id,
                    "file has low redundancy",
                    &format!(
                        "file {} has a health of {:.2} and a redundancy of {:.2}",
                        entry.fs_path, max_health, fm.redundancy
                    ),
                    AlertSeverity::Warning,
                );
            } else {
                state.alerts.unregister_alert(&alert_id);
            }

            // Files are created without a health check time; treat a
            // zero value as "being checked right now".
            let last_check = if fm.last_health_check_time == 0 {
                now
            } else {
                fm.last_health_check_time
            };

            metadata.aggregate_num_files += 1;
            metadata.aggregate_num_stuck_chunks += fm.num_stuck_chunks;
            metadata.aggregate_size += fm.size;
            metadata.num_files += 1;
            metadata.num_stuck_chunks += fm.num_stuck_chunks;
            metadata.size += fm.size;

            metadata.health = metadata.health.max(fm.health);
            metadata.stuck_health = metadata.stuck_health.max(fm.stuck_health);
            metadata.last_health_check_time = metadata.last_health_check_time.min(last_check);
            if fm.redundancy != -1.0 {
                metadata.min_redundancy = metadata.min_redundancy.min(fm.redundancy);
            }
            metadata.mod_time = metadata.mod_time.max(fm.mod_time);
            if !fm.on_disk {
                metadata.remote_health = metadata.remote_health.max(fm.health);
            }

            metadata.aggregate_health = metadata.aggregate_health.max(fm.health);
            metadata.aggregate_stuck_health = metadata.aggregate_stuck_health.max(fm.stuck_health);
            if fm.redundancy != -1.0 {
                metadata.aggregate_min_redundancy =
                    metadata.aggregate_min_redundancy.min(fm.redundancy);
            }
            metadata.aggregate_last_health_check_time =
                metadata.aggregate_last_health_check_time.min(last_check);
            metadata.aggregate_mod_time = metadata.aggregate_mod_time.max(fm.mod_time);
            if !fm.on_disk {
                metadata.aggregate_remote_health =
                    metadata.aggregate_remote_health.max(fm.health);
            }
        }

        for (dir_path, dm) in dir_metadatas {
            // A subdirectory that was never health-checked gets bubbled
            // on its own so its metadata heals.
            let child_last_check = if dm.aggregate_last_health_check_time == 0 {
                let state2 = state.clone();
                let child = dir_path.clone();
                if state
                    .tg
                    .launch(async move {
                        let _ = Self::managed_bubble(&state2, &child).await;
                    })
                    .is_err()
                {
                    debug!("shutdown before bubbling fresh directory {}", dir_path);
                }
                now
            } else {
                dm.aggregate_last_health_check_time
            };

            metadata.aggregate_num_files += dm.aggregate_num_files;
            metadata.aggregate_num_stuck_chunks += dm.aggregate_num_stuck_chunks;
            metadata.aggregate_num_sub_dirs += dm.aggregate_num_sub_dirs + 1;
            metadata.aggregate_size += dm.aggregate_size;
            metadata.num_sub_dirs += 1;

            metadata.aggregate_health = metadata.aggregate_health.max(dm.aggregate_health);
            metadata.aggregate_stuck_health = metadata
                .aggregate_stuck_health
                .max(dm.aggregate_stuck_health);
            metadata.aggregate_remote_health = metadata
                .aggregate_remote_health
                .max(dm.aggregate_remote_health);
            if dm.aggregate_min_redundancy != -1.0 {
                metadata.aggregate_min_redundancy = metadata
                    .aggregate_min_redundancy
                    .min(dm.aggregate_min_redundancy);
            }
            metadata.aggregate_last_health_check_time = metadata
                .aggregate_last_health_check_time
                .min(child_last_check);
            metadata.aggregate_mod_time = metadata.aggregate_mod_time.max(dm.aggregate_mod_time);
        }

        // An empty directory still deserves fresh timestamps, and the
        // untouched redundancy sentinel reads as "empty" downstream.
        if metadata.aggregate_mod_time == 0 {
            metadata.aggregate_mod_time = now;
        }
        if metadata.mod_time == 0 {
            metadata.mod_time = now;
        }
        if metadata.aggregate_min_redundancy == f64::MAX {
            metadata.aggregate_min_redundancy = -1.0;
        }
        if metadata.min_redundancy == f64::MAX {
            metadata.min_redundancy = -1.0;
        }

        Ok(metadata)
    }

    // Computes the bubbled metadata of many files on a bounded worker
    // pool. Individual failures are logged and skipped; the walk uses
    // whatever survived.
    async fn calculate_file_metadatas(
        state: &Arc<BubbleState>,
        paths: Vec<FsPath>,
        maps: &UtilityMaps,
    ) -> FsResult<Vec<FileBubbleData>> {
        let results = Arc::new(Mutex::new(Vec::with_capacity(paths.len())));
        let (tx, rx) = mpsc::channel::<FsPath>(NUM_BUBBLE_WORKERS);
        let rx = Arc::new(tokio::sync::Mutex::new(rx));

        let mut workers = Vec::with_capacity(NUM_BUBBLE_WORKERS);
        for _ in 0..NUM_BUBBLE_WORKERS {
            let state = state.clone();
            let maps = maps.clone();
            let rx = rx.clone();
            let results = results.clone();
            workers.push(tokio::spawn(async move {
                loop {
                    if state.tg.is_stopped() {
                        return;
                    }
                    let Some(path) = rx.lock().await.recv().await else {
                        return;
                    };
                    match Self::calculate_file_metadata(&state, &path, &maps).await {
                        Ok(md) => results.lock().unwrap().push(md),
                        Err(e) => {
                            warn!("skipping file {} during bubble: {}", path, e)
                        }
                    }
                }
            }));
        }
        for path in paths {
            if tx.send(path).await.is_err() {
                break;
            }
        }
        drop(tx);
        for worker in workers {
            let _ = worker.await;
        }
        if state.tg.is_stopped() {
            return Err(FsError::Cancelled);
        }
        let results = Arc::try_unwrap(results)
            .map_err(|_| FsError::Internal("file metadata workers still running".to_string()))?
            .into_inner()
            .unwrap();
        Ok(results)
    }

    async fn calculate_file_metadata(
        state: &Arc<BubbleState>,
        path: &FsPath,
        maps: &UtilityMaps,
    ) -> FsResult<FileBubbleData> {
        let handle = state.fs.open_file(path).await?;
        let info = handle
            .file()
            .health(&maps.offline, &maps.good_for_renew)
            .await?;
        let meta = handle.file().metadata().await;
        let expiration = handle.file().expiration(&maps.contract_ends()).await;
        handle.file().update_cached_health(&info, expiration).await;

        let on_disk = !meta.local_path.is_empty()
            && state
                .fs
                .deps()
                .stat(std::path::Path::new(&meta.local_path))
                .await
                .is_ok();
        if !on_disk && info.redundancy < 1.0 {
            debug!(
                "file not on disk and possibly unrecoverable: local {:?}, path {}",
                meta.local_path, path
            );
        }
        handle.close();
        Ok(FileBubbleData {
            fs_path: path.clone(),
            md: BubbledFileMetadata {
                uid: meta.uid,
                health: info.health,
                stuck_health: info.stuck_health,
                redundancy: info.redundancy,
                num_stuck_chunks: info.num_stuck_chunks,
                size: meta.file_size,
                mod_time: meta.mod_time,
                last_health_check_time: meta.last_health_check_time,
                on_disk,
            },
        })
    }

    // Reads the persisted aggregate metadata of many directories on the
    // same kind of worker pool as the file pass.
    async fn directory_metadatas(
        state: &Arc<BubbleState>,
        paths: Vec<FsPath>,
    ) -> FsResult<Vec<(FsPath, DirMetadata)>> {
        let results = Arc::new(Mutex::new(Vec::with_capacity(paths.len())));
        let (tx, rx) = mpsc::channel::<FsPath>(NUM_BUBBLE_WORKERS);
        let rx = Arc::new(tokio::sync::Mutex::new(rx));

        let mut workers = Vec::with_capacity(NUM_BUBBLE_WORKERS);
        for _ in 0..NUM_BUBBLE_WORKERS {
            let state = state.clone();
            let rx = rx.clone();
            let results = results.clone();
            workers.push(tokio::spawn(async move {
                loop {
                    if state.tg.is_stopped() {
                        return;
                    }
                    let Some(path) = rx.lock().await.recv().await else {
                        return;
                    };
                    match Self::directory_metadata(&state, &path).await {
                        Ok(md) => results.lock().unwrap().push((path, md)),
                        Err(e) => {
                            warn!("skipping directory {} during bubble: {}", path, e)
                        }
                    }
                }
            }));
        }
        for path in paths {
            if tx.send(path).await.is_err() {
                break;
            }
        }
        drop(tx);
        for worker in workers {
            let _ = worker.await;
        }
        if state.tg.is_stopped() {
            return Err(FsError::Cancelled);
        }
        let results = Arc::try_unwrap(results)
            .map_err(|_| FsError::Internal("dir metadata workers still running".to_string()))?
            .into_inner()
            .unwrap();
        Ok(results)
    }

    async fn directory_metadata(state: &Arc<BubbleState>, path: &FsPath) -> FsResult<DirMetadata> {
        let handle = state.fs.open_dir(path).await?;
        let md = handle.dir().metadata().await;
        handle.close();
        Ok(md)
    }

    // The cheap fallback for deferred callers: pull the oldest aggregate
    // health check time out of the subdirectories and persist just the
    // timestamps.
    async fn update_last_health_check_time(
        state: &Arc<BubbleState>,
        path: &FsPath,
    ) -> FsResult<()> {
        let (_, dir_paths) = state.fs.read_dir(path).await?;
        let mut aggregate = unix_timestamp();
        for dir_path in dir_paths {
            if state.tg.is_stopped() {
                return Err(FsError::Cancelled);
            }
            let md = Self::directory_metadata(state, &dir_path).await?;
            aggregate = aggregate.min(md.aggregate_last_health_check_time);
        }
        let handle = state.fs.open_dir(path).await?;
        let result = handle
            .dir()
            .update_last_health_check_time(aggregate, unix_timestamp())
            .await;
        handle.close();
        result
    }
}

// The per-file values carried through a bubble walk, tagged with the path
// for logging and alert text.
struct FileBubbleData {
    fs_path: FsPath,
    md: BubbledFileMetadata,
}

// The starting point of an aggregation: worst-case trackers at their
// identity values, redundancy at the sentinel that becomes -1 when no
// child contributes.
fn bubble_start_metadata(now: u64) -> DirMetadata {
    DirMetadata {
        aggregate_health: DEFAULT_DIR_HEALTH,
        aggregate_last_health_check_time: now,
        aggregate_min_redundancy: f64::MAX,
        aggregate_mod_time: 0,
        aggregate_num_files: 0,
        aggregate_num_stuck_chunks: 0,
        aggregate_num_sub_dirs: 0,
        aggregate_remote_health: DEFAULT_DIR_HEALTH,
        aggregate_size: 0,
        aggregate_stuck_health: DEFAULT_DIR_HEALTH,
        health: DEFAULT_DIR_HEALTH,
        last_health_check_time: now,
        min_redundancy: f64::MAX,
        mod_time: 0,
        num_files: 0,
        num_stuck_chunks: 0,
        num_sub_dirs: 0,
        remote_health: DEFAULT_DIR_HEALTH,
        size: 0,
        stuck_health: DEFAULT_DIR_HEALTH,
        mode: 0,
        version: String::new(),
    }
}
