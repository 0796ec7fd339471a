use log::warn;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use wal_lib::{Update, Wal};

use super::dir_node::DirNode;
use super::file_node::FileNode;
use super::{next_id, DirHandle, FileHandle};
use crate::deps::FsDeps;
use crate::fspath::FsPath;
use crate::health::HealthInfo;
use crate::hostdir::{HostedDir, DIR_METADATA_NAME};
use crate::hostfile::file::{FileParams, HostedFile, PARTIAL_EXTENSION};
use crate::hostfile::{FileUid, HostKey, RFILE_EXTENSION};
use crate::persist::{dir_delete_update, file_delete_update, partial_delete_update};
use crate::{FsError, FsResult};

const DEFAULT_DIR_MODE: u32 = 0o700;

/// The derived, user-facing view of one file.
#[derive(Debug, Clone)]
pub struct FileInfo {
    pub fs_path: FsPath,
    pub uid: FileUid,
    pub file_size: u64,
    pub mode: u32,
    pub cipher_type: String,
    pub local_path: String,
    pub share_links: Vec<String>,

    pub create_time: u64,
    pub access_time: u64,
    pub change_time: u64,
    pub mod_time: u64,

    pub health: f64,
    pub stuck_health: f64,
    pub max_health: f64,
    pub max_health_percent: f64,
    pub redundancy: f64,
    pub user_redundancy: f64,
    pub available: bool,
    pub recoverable: bool,
    pub on_disk: bool,
    pub stuck: bool,
    pub num_stuck_chunks: u64,

    pub expiration: u64,
    pub upload_progress: f64,
    pub uploaded_bytes: u64,
}

/// Maps a health value onto the 0-100 scale shown to users; anything at
/// or beyond 1.25 is flat zero.
pub fn health_percentage(health: f64) -> f64 {
    (100.0 * (1.25 - health) / 1.25).clamp(0.0, 100.0)
}

/// The repository facade: a lazily loaded node tree rooted at the
/// repository directory, backed by the WAL'd metadata stores.
pub struct FsCore {
    root_sys: PathBuf,
    root: Arc<DirNode>,
    wal: Arc<Wal>,
    deps: Arc<dyn FsDeps>,
}

impl FsCore {
    /// Opens the repository at `root_sys`, creating its root metadata on
    /// first use. WAL recovery must have happened before this is called.
    pub async fn new(
        root_sys: &Path,
        wal: Arc<Wal>,
        deps: Arc<dyn FsDeps>,
    ) -> FsResult<Self> {
        HostedDir::create_all(root_sys, root_sys, DEFAULT_DIR_MODE, &wal, &deps).await?;
        let root_dir = HostedDir::load(root_sys, wal.clone(), deps.clone()).await?;
        Ok(Self {
            root_sys: root_sys.to_path_buf(),
            root: DirNode::new_root(root_dir),
            wal,
            deps,
        })
    }

    pub fn root_sys_path(&self) -> &Path {
        &self.root_sys
    }

    pub fn deps(&self) -> &Arc<dyn FsDeps> {
        &self.deps
    }

    fn dir_sys_path(&self, path: &FsPath) -> PathBuf {
        path.to_sys_path(&self.root_sys)
    }

    fn file_sys_path(&self, path: &FsPath) -> PathBuf {
        let mut sys = path.dir().to_sys_path(&self.root_sys);
        sys.push(format!("{}{}", path.name(), RFILE_EXTENSION));
        sys
    }

    /// Walks to the directory node at `path`, loading nodes from disk as
    /// needed.
    async fn walk_dir(&self, path: &FsPath) -> FsResult<Arc<DirNode>> {
        let mut current = self.root.clone();
        let mut current_path = FsPath::root();
        let mut sys = self.root_sys.clone();
        for segment in path.segments() {
            sys.push(segment);
            current_path = current_path.join(segment)?;
            let child = match current.loaded_dir(segment) {
                Some(child) => child,
                None => {
                    let stat = self
                        .deps
                        .stat(&sys)
                        .await
                        .map_err(|_| FsError::NotExist(path.to_string()))?;
                    if !stat.is_dir {
                        return Err(FsError::NotExist(path.to_string()));
                    }
                    let hosted =
                        HostedDir::load(&sys, self.wal.clone(), self.deps.clone()).await?;
                    let node = DirNode::new_child(
                        segment.to_string(),
                        current_path.clone(),
                        &current,
                        hosted,
                    );
                    current.insert_dir(segment, node)
                }
            };
            current = child;
        }
        Ok(current)
    }

    /// Opens a handle on the directory at `path`.
    pub async fn open_dir(&self, path: &FsPath) -> FsResult<DirHandle> {
        loop {
            let node = self.walk_dir(path).await?;
            if node.dir.is_deleted().await {
                return Err(FsError::Deleted(path.to_string()));
            }
            let id = next_id();
            if node.try_add_handle(id) {
                return Ok(DirHandle::new(node, id));
            }
            // The node was unlinked between the walk and the handle
            // registration; walk again to load a fresh one.
        }
    }

    /// Opens a handle on the file at `path`.
    pub async fn open_file(&self, path: &FsPath) -> FsResult<FileHandle> {
        if path.is_root() {
            return Err(FsError::Invalid("root is not a file".to_string()));
        }
        let name = path.name().to_string();
        loop {
            let parent = self.walk_dir(&path.dir()).await?;
            let node = match parent.loaded_file(&name) {
                Some(node) => node,
                None => {
                    let sys = self.file_sys_path(path);
                    let hosted =
                        HostedFile::load(&sys, self.wal.clone(), self.deps.clone()).await?;
                    let node = FileNode::new(name.clone(), path.clone(), &parent, hosted);
                    parent.insert_file(&name, node)
                }
            };
            if node.file.is_deleted().await {
                return Err(FsError::Deleted(path.to_string()));
            }
            let id = next_id();
            if node.try_add_handle(id) {
                return Ok(FileHandle::new(node, id));
            }
        }
    }

    /// Creates a file (and any missing parent directories) and returns a
    /// handle on it.
    pub async fn create_file(&self, path: &FsPath, params: FileParams) -> FsResult<FileHandle> {
        if path.is_root() {
            return Err(FsError::Invalid("root is not a file".to_string()));
        }
        if self.deps.stat(&self.dir_sys_path(path)).await.is_ok() {
            return Err(FsError::PathOverload(path.to_string()));
        }
        let parent_sys = self.dir_sys_path(&path.dir());
        HostedDir::create_all(&parent_sys, &self.root_sys, DEFAULT_DIR_MODE, &self.wal, &self.deps)
            .await?;
        let parent = self.walk_dir(&path.dir()).await?;
        let name = path.name().to_string();
        if parent.child_exists(&name) {
            return Err(FsError::Exists(path.to_string()));
        }

        let hosted = HostedFile::create(
            &self.file_sys_path(path),
            params,
            self.wal.clone(),
            self.deps.clone(),
        )
        .await?;
        let node = FileNode::new(name.clone(), path.clone(), &parent, hosted);
        let node = parent.insert_file(&name, node);
        let id = next_id();
        if !node.try_add_handle(id) {
            return Err(FsError::Internal(format!(
                "fresh node for {} already unlinked",
                path
            )));
        }
        Ok(FileHandle::new(node, id))
    }

    /// Tombstones and removes the file or directory at `path`. Directory
    /// removal takes the whole subtree with it.
    pub async fn delete(&self, path: &FsPath) -> FsResult<()> {
        if path.is_root() {
            return Err(FsError::Invalid("cannot delete the root".to_string()));
        }
        match self.open_file(path).await {
            Ok(handle) => {
                handle.file().delete().await?;
                if let Some(parent) = handle.node.parent() {
                    DirNode::remove_file_child(&parent, &handle.node);
                }
                Ok(())
            }
            Err(FsError::NotExist(_)) => self.delete_dir(path).await,
            Err(e) => Err(e),
        }
    }

    async fn delete_dir(&self, path: &FsPath) -> FsResult<()> {
        let node = self.walk_dir(path).await?;
        if node.dir.is_deleted().await {
            return Err(FsError::Deleted(path.to_string()));
        }

        // One transaction deletes the whole subtree bottom-up; the
        // directories themselves disappear lazily as they empty out.
        let mut updates = Vec::new();
        self.collect_delete_updates(&self.dir_sys_path(path), &mut updates)
            .await?;
        crate::persist::create_and_apply_transaction(&self.wal, &self.deps, updates).await?;

        let (dirs, files) = DirNode::collect_subtree(&node);
        for file in files {
            file.file.mark_deleted().await;
        }
        for dir in &dirs {
            dir.dir.mark_deleted().await;
        }
        if let Some(parent) = node.parent() {
            DirNode::remove_dir_child(&parent, &node);
        }
        Ok(())
    }

    // Walks the on-disk subtree depth-first, queueing deletes for every
    // file, partial companion and directory metadata blob.
    async fn collect_delete_updates(
        &self,
        dir_sys: &Path,
        updates: &mut Vec<Update>,
    ) -> FsResult<()> {
        let mut stack = vec![dir_sys.to_path_buf()];
        let mut dirs_seen = Vec::new();
        while let Some(dir) = stack.pop() {
            let entries = self
                .deps
                .read_dir(&dir)
                .await
                .map_err(|e| FsError::DiskFault(e.to_string()))?;
            for entry in entries {
                let entry_path = dir.join(&entry.name);
                if entry.is_dir {
                    stack.push(entry_path);
                } else if entry.name.ends_with(RFILE_EXTENSION) {
                    updates.push(file_delete_update(&entry_path));
                } else if entry.name.ends_with(PARTIAL_EXTENSION) {
                    updates.push(partial_delete_update(&entry_path));
                }
            }
            dirs_seen.push(dir);
        }
        // Children's metadata before the parents' so directory removal can
        // cascade.
        for dir in dirs_seen.into_iter().rev() {
            updates.push(dir_delete_update(&dir.join(DIR_METADATA_NAME)));
        }
        Ok(())
    }

    /// Moves a file to a new path, creating the target's parent chain as
    /// needed.
    pub async fn rename_file(&self, old: &FsPath, new: &FsPath) -> FsResult<()> {
        if old.is_root() || new.is_root() {
            return Err(FsError::Invalid("cannot rename the root".to_string()));
        }
        let handle = self.open_file(old).await?;
        if self.deps.stat(&self.dir_sys_path(new)).await.is_ok() {
            return Err(FsError::PathOverload(new.to_string()));
        }
        let new_parent_sys = self.dir_sys_path(&new.dir());
        HostedDir::create_all(
            &new_parent_sys,
            &self.root_sys,
            DEFAULT_DIR_MODE,
            &self.wal,
            &self.deps,
        )
        .await?;
        let new_parent = self.walk_dir(&new.dir()).await?;
        if new_parent.child_exists(new.name()) {
            return Err(FsError::Exists(new.to_string()));
        }

        // The disk moves first; the tree is relinked right after. A
        // concurrent open of the old path in between reloads and fails
        // with NotExist, same as after the rename completes.
        handle.file().rename(&self.file_sys_path(new)).await?;

        let Some(old_parent) = handle.node.parent() else {
            return Err(FsError::Internal(format!("{} detached during rename", old)));
        };
        Self::relink_file(&old_parent, &new_parent, &handle.node, new);
        // TODO: prune the now possibly empty old parent chain the way
        // close does.
        Ok(())
    }

    fn relink_file(
        old_parent: &Arc<DirNode>,
        new_parent: &Arc<DirNode>,
        node: &Arc<FileNode>,
        new_path: &FsPath,
    ) {
        let same = Arc::ptr_eq(old_parent, new_parent);
        // Sibling locks in lexical path order.
        let (first, second) = if same || old_parent.fs_path() <= new_parent.fs_path() {
            (old_parent, new_parent)
        } else {
            (new_parent, old_parent)
        };
        let first_state = first.state.lock().unwrap();
        let second_state = if same {
            None
        } else {
            Some(second.state.lock().unwrap())
        };
        let mut state = node.state.lock().unwrap();

        let (mut old_state, mut new_state) = if same {
            (first_state, None)
        } else if Arc::ptr_eq(first, old_parent) {
            (first_state, second_state)
        } else {
            (second_state.unwrap(), Some(first_state))
        };

        if let Some(existing) = old_state.files.get(&state.name) {
            if Arc::ptr_eq(existing, node) {
                old_state.files.remove(&state.name);
            }
        }
        state.name = new_path.name().to_string();
        state.fs_path = new_path.clone();
        state.parent = Arc::downgrade(new_parent);
        let target = new_state.as_mut().unwrap_or(&mut old_state);
        if target
            .files
            .insert(state.name.clone(), node.clone())
            .is_some()
        {
            warn!("rename displaced a concurrently opened node at {}", new_path);
        }
    }

    /// Moves a directory (and its loaded subtree) to a new path.
    pub async fn rename_dir(&self, old: &FsPath, new: &FsPath) -> FsResult<()> {
        if old.is_root() || new.is_root() {
            return Err(FsError::Invalid("cannot rename the root".to_string()));
        }
        let node = self.walk_dir(old).await?;
        if node.dir.is_deleted().await {
            return Err(FsError::Deleted(old.to_string()));
        }
        if self.deps.stat(&self.file_sys_path(new)).await.is_ok() {
            return Err(FsError::PathOverload(new.to_string()));
        }
        let new_parent_sys = self.dir_sys_path(&new.dir());
        HostedDir::create_all(
            &new_parent_sys,
            &self.root_sys,
            DEFAULT_DIR_MODE,
            &self.wal,
            &self.deps,
        )
        .await?;
        let new_parent = self.walk_dir(&new.dir()).await?;
        if new_parent.child_exists(new.name()) {
            return Err(FsError::Exists(new.to_string()));
        }

        node.dir.rename(&self.dir_sys_path(new)).await?;

        let Some(old_parent) = node.parent() else {
            return Err(FsError::Internal(format!("{} detached during rename", old)));
        };
        Self::relink_dir(&old_parent, &new_parent, &node, new);

        // Fix up the loaded subtree: tree paths first, then the disk
        // paths held by the hosted objects.
        let (dirs, files) = DirNode::collect_subtree(&node);
        let mut dir_paths = Vec::with_capacity(dirs.len());
        let mut file_paths = Vec::with_capacity(files.len());
        for dir in &dirs {
            let fs_path = Self::swap_prefix_locked_dir(dir, old, new);
            dir_paths.push((dir.clone(), self.dir_sys_path(&fs_path)));
        }
        for file in &files {
            let fs_path = Self::swap_prefix_locked_file(file, old, new);
            file_paths.push((file.clone(), self.file_sys_path(&fs_path)));
        }
        for (dir, sys) in dir_paths {
            dir.dir.set_disk_path(&sys).await;
        }
        for (file, sys) in file_paths {
            file.file.set_disk_path(&sys).await;
        }
        Ok(())
    }

    // Rewrites `path` from under `old` to under `new`. None when `path`
    // is not inside `old`; the match is on whole segments, "ab/c" is not
    // inside "a".
    fn swapped_prefix(path: &FsPath, old: &FsPath, new: &FsPath) -> Option<FsPath> {
        let rest = path.as_str().strip_prefix(old.as_str())?;
        if !rest.is_empty() && !rest.starts_with('/') {
            return None;
        }
        FsPath::new(&format!("{}{}", new.as_str(), rest)).ok()
    }

    fn swap_prefix_locked_dir(node: &Arc<DirNode>, old: &FsPath, new: &FsPath) -> FsPath {
        let mut state = node.state.lock().unwrap();
        if let Some(p) = Self::swapped_prefix(&state.fs_path, old, new) {
            state.fs_path = p;
        }
        state.fs_path.clone()
    }

    fn swap_prefix_locked_file(node: &Arc<FileNode>, old: &FsPath, new: &FsPath) -> FsPath {
        let mut state = node.state.lock().unwrap();
        if let Some(p) = Self::swapped_prefix(&state.fs_path, old, new) {
            state.fs_path = p;
        }
        state.fs_path.clone()
    }

    fn relink_dir(
        old_parent: &Arc<DirNode>,
        new_parent: &Arc<DirNode>,
        node: &Arc<DirNode>,
        new_path: &FsPath,
    ) {
        let same = Arc::ptr_eq(old_parent, new_parent);
        let (first, second) = if same || old_parent.fs_path() <= new_parent.fs_path() {
            (old_parent, new_parent)
        } else {
            (new_parent, old_parent)
        };
        let first_state = first.state.lock().unwrap();
        let second_state = if same {
            None
        } else {
            Some(second.state.lock().unwrap())
        };
        let mut state = node.state.lock().unwrap();

        let (mut old_state, mut new_state) = if same {
            (first_state, None)
        } else if Arc::ptr_eq(first, old_parent) {
            (first_state, second_state)
        } else {
            (second_state.unwrap(), Some(first_state))
        };

        if let Some(existing) = old_state.dirs.get(&state.name) {
            if Arc::ptr_eq(existing, node) {
                old_state.dirs.remove(&state.name);
            }
        }
        state.name = new_path.name().to_string();
        state.fs_path = new_path.clone();
        state.parent = Arc::downgrade(new_parent);
        let target = new_state.as_mut().unwrap_or(&mut old_state);
        if target
            .dirs
            .insert(state.name.clone(), node.clone())
            .is_some()
        {
            warn!("rename displaced a concurrently opened node at {}", new_path);
        }
    }

    /// Lists the tracked entries directly inside `path`, split into file
    /// and directory paths.
    pub async fn read_dir(&self, path: &FsPath) -> FsResult<(Vec<FsPath>, Vec<FsPath>)> {
        let entries = self
            .deps
            .read_dir(&self.dir_sys_path(path))
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => FsError::NotExist(path.to_string()),
                _ => FsError::DiskFault(e.to_string()),
            })?;
        let mut files = Vec::new();
        let mut dirs = Vec::new();
        for entry in entries {
            if entry.is_dir {
                dirs.push(path.join(&entry.name)?);
            } else if let Some(stem) = entry.name.strip_suffix(RFILE_EXTENSION) {
                if !stem.is_empty() {
                    files.push(path.join(stem)?);
                }
            }
        }
        Ok((files, dirs))
    }

    /// Builds the derived view of an open file against the given host
    /// maps, refreshing the file's cached summary along the way.
    pub async fn file_info(
        &self,
        handle: &FileHandle,
        offline: &HashMap<HostKey, bool>,
        good_for_renew: &HashMap<HostKey, bool>,
        contract_ends: &HashMap<HostKey, u64>,
    ) -> FsResult<FileInfo> {
        let file = handle.file();
        let meta = file.metadata().await;
        let health: HealthInfo = file.health(offline, good_for_renew).await?;
        let (upload_progress, uploaded_bytes) = file.upload_progress_and_bytes().await;
        let expiration = file.expiration(contract_ends).await;
        file.update_cached_health(&health, expiration).await;

        let on_disk = !meta.local_path.is_empty()
            && self.deps.stat(Path::new(&meta.local_path)).await.is_ok();
        let max_health = health.health.max(health.stuck_health);
        Ok(FileInfo {
            fs_path: handle.fs_path(),
            uid: meta.uid,
            file_size: meta.file_size,
            mode: meta.mode,
            cipher_type: meta.cipher.cipher_type,
            local_path: meta.local_path,
            share_links: meta.share_links,
            create_time: meta.create_time,
            access_time: meta.access_time,
            change_time: meta.change_time,
            mod_time: meta.mod_time,
            health: health.health,
            stuck_health: health.stuck_health,
            max_health,
            max_health_percent: health_percentage(max_health),
            redundancy: health.redundancy,
            user_redundancy: health.user_redundancy,
            // Availability promises the user a download, so it is judged
            // on the good-for-renew-clamped redundancy.
            available: health.user_redundancy >= 1.0,
            recoverable: on_disk || health.user_redundancy >= 1.0,
            on_disk,
            stuck: health.num_stuck_chunks > 0,
            num_stuck_chunks: health.num_stuck_chunks,
            expiration,
            upload_progress,
            uploaded_bytes,
        })
    }

    /// The number of loaded (in-memory) nodes under the root, root
    /// excluded. Diagnostics and tests only.
    pub fn loaded_node_count(&self) -> usize {
        let (dirs, files) = DirNode::collect_subtree(&self.root);
        dirs.len() - 1 + files.len()
    }
}
