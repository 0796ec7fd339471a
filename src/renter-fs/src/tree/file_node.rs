use std::collections::HashSet;
use std::sync::{Arc, Mutex, Weak};

use super::dir_node::DirNode;
use crate::fspath::FsPath;
use crate::hostfile::file::HostedFile;

pub(crate) struct FileNodeState {
    pub name: String,
    pub fs_path: FsPath,
    pub parent: Weak<DirNode>,
    pub handles: HashSet<u64>,
}

/// A loaded file in the tree. The node owns tree bookkeeping only; the
/// file's data lives behind [`HostedFile`]'s own lock.
pub(crate) struct FileNode {
    pub state: Mutex<FileNodeState>,
    pub file: Arc<HostedFile>,
}

impl FileNode {
    pub fn new(
        name: String,
        fs_path: FsPath,
        parent: &Arc<DirNode>,
        file: Arc<HostedFile>,
    ) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(FileNodeState {
                name,
                fs_path,
                parent: Arc::downgrade(parent),
                handles: HashSet::new(),
            }),
            file,
        })
    }

    pub fn fs_path(&self) -> FsPath {
        self.state.lock().unwrap().fs_path.clone()
    }

    pub fn parent(&self) -> Option<Arc<DirNode>> {
        self.state.lock().unwrap().parent.upgrade()
    }

    /// Registers a new handle. Fails when the node has been unlinked from
    /// the tree, in which case the caller reloads it.
    pub fn try_add_handle(&self, id: u64) -> bool {
        let mut state = self.state.lock().unwrap();
        if state.parent.upgrade().is_none() {
            return false;
        }
        state.handles.insert(id);
        true
    }

    /// Drops a handle. When it was the last one the node is unlinked from
    /// its parent and the parent chain is unlinked iteratively as far as
    /// it is empty.
    pub fn close_handle(node: &Arc<Self>, id: u64) {
        loop {
            let Some(parent) = node.parent() else {
                // Already unlinked; just forget the handle.
                node.state.lock().unwrap().handles.remove(&id);
                return;
            };
            let mut parent_state = parent.state.lock().unwrap();
            let mut state = node.state.lock().unwrap();
            let unchanged = state
                .parent
                .upgrade()
                .map(|p| Arc::ptr_eq(&p, &parent))
                .unwrap_or(false);
            if !unchanged {
                // The node moved between the peek and the lock; retry
                // with the new parent.
                drop(state);
                drop(parent_state);
                continue;
            }
            state.handles.remove(&id);
            let mut ascend = false;
            if state.handles.is_empty() {
                if let Some(existing) = parent_state.files.get(&state.name) {
                    if Arc::ptr_eq(existing, node) {
                        parent_state.files.remove(&state.name);
                    }
                }
                state.parent = Weak::new();
                ascend = true;
            }
            drop(state);
            drop(parent_state);
            if ascend {
                DirNode::try_unlink_iteratively(parent);
            }
            return;
        }
    }
}
