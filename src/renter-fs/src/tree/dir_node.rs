use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, Weak};

use super::file_node::FileNode;
use crate::fspath::FsPath;
use crate::hostdir::HostedDir;

pub(crate) struct DirNodeState {
    pub name: String,
    pub fs_path: FsPath,
    pub parent: Weak<DirNode>,
    pub handles: HashSet<u64>,
    pub files: HashMap<String, Arc<FileNode>>,
    pub dirs: HashMap<String, Arc<DirNode>>,
}

/// A loaded directory in the tree. Holds strong references to its loaded
/// children; children refer back only weakly, so ownership always flows
/// down from the root.
pub(crate) struct DirNode {
    pub is_root: bool,
    pub state: Mutex<DirNodeState>,
    pub dir: Arc<HostedDir>,
}

impl DirNode {
    pub fn new_root(dir: Arc<HostedDir>) -> Arc<Self> {
        Arc::new(Self {
            is_root: true,
            state: Mutex::new(DirNodeState {
                name: String::new(),
                fs_path: FsPath::root(),
                parent: Weak::new(),
                handles: HashSet::new(),
                files: HashMap::new(),
                dirs: HashMap::new(),
            }),
            dir,
        })
    }

    pub fn new_child(
        name: String,
        fs_path: FsPath,
        parent: &Arc<DirNode>,
        dir: Arc<HostedDir>,
    ) -> Arc<Self> {
        Arc::new(Self {
            is_root: false,
            state: Mutex::new(DirNodeState {
                name,
                fs_path,
                parent: Arc::downgrade(parent),
                handles: HashSet::new(),
                files: HashMap::new(),
                dirs: HashMap::new(),
            }),
            dir,
        })
    }

    pub fn fs_path(&self) -> FsPath {
        self.state.lock().unwrap().fs_path.clone()
    }

    pub fn parent(&self) -> Option<Arc<DirNode>> {
        self.state.lock().unwrap().parent.upgrade()
    }

    /// Registers a new handle; fails when the node has been unlinked.
    pub fn try_add_handle(&self, id: u64) -> bool {
        let mut state = self.state.lock().unwrap();
        if !self.is_root && state.parent.upgrade().is_none() {
            return false;
        }
        state.handles.insert(id);
        true
    }

    pub fn close_handle(node: &Arc<Self>, id: u64) {
        node.state.lock().unwrap().handles.remove(&id);
        Self::try_unlink_iteratively(node.clone());
    }

    /// Walks up from `node`, unlinking every directory that has neither
    /// handles nor loaded children. Iterative by construction so deep
    /// trees cannot blow the stack; each step holds exactly the parent's
    /// and the node's mutex, parent first.
    pub fn try_unlink_iteratively(node: Arc<Self>) {
        let mut node = node;
        loop {
            let Some(parent) = node.parent() else {
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
                drop(state);
                drop(parent_state);
                continue;
            }
            let removable =
                state.handles.is_empty() && state.files.is_empty() && state.dirs.is_empty();
            if !removable {
                return;
            }
            if let Some(existing) = parent_state.dirs.get(&state.name) {
                if Arc::ptr_eq(existing, &node) {
                    parent_state.dirs.remove(&state.name);
                }
            }
            state.parent = Weak::new();
            drop(state);
            drop(parent_state);
            node = parent;
        }
    }

    /// Looks up a loaded child directory.
    pub fn loaded_dir(&self, name: &str) -> Option<Arc<DirNode>> {
        self.state.lock().unwrap().dirs.get(name).cloned()
    }

    /// Looks up a loaded child file.
    pub fn loaded_file(&self, name: &str) -> Option<Arc<FileNode>> {
        self.state.lock().unwrap().files.get(name).cloned()
    }

    /// True if a loaded child of either kind carries `name`.
    pub fn child_exists(&self, name: &str) -> bool {
        let state = self.state.lock().unwrap();
        state.files.contains_key(name) || state.dirs.contains_key(name)
    }

    /// Inserts `child`, or returns the child that won the race.
    pub fn insert_dir(&self, name: &str, child: Arc<DirNode>) -> Arc<DirNode> {
        let mut state = self.state.lock().unwrap();
        if let Some(existing) = state.dirs.get(name) {
            return existing.clone();
        }
        state.dirs.insert(name.to_string(), child.clone());
        child
    }

    pub fn insert_file(&self, name: &str, child: Arc<FileNode>) -> Arc<FileNode> {
        let mut state = self.state.lock().unwrap();
        if let Some(existing) = state.files.get(name) {
            return existing.clone();
        }
        state.files.insert(name.to_string(), child.clone());
        child
    }

    /// Unlinks a tombstoned child file node, then prunes the parent chain.
    pub fn remove_file_child(parent: &Arc<Self>, child: &Arc<FileNode>) {
        {
            let mut parent_state = parent.state.lock().unwrap();
            let mut state = child.state.lock().unwrap();
            if let Some(existing) = parent_state.files.get(&state.name) {
                if Arc::ptr_eq(existing, child) {
                    parent_state.files.remove(&state.name);
                }
            }
            state.parent = Weak::new();
        }
        Self::try_unlink_iteratively(parent.clone());
    }

    /// Unlinks a tombstoned child directory node, then prunes the parent
    /// chain.
    pub fn remove_dir_child(parent: &Arc<Self>, child: &Arc<DirNode>) {
        {
            let mut parent_state = parent.state.lock().unwrap();
            let mut state = child.state.lock().unwrap();
            if let Some(existing) = parent_state.dirs.get(&state.name) {
                if Arc::ptr_eq(existing, child) {
                    parent_state.dirs.remove(&state.name);
                }
            }
            state.parent = Weak::new();
        }
        Self::try_unlink_iteratively(parent.clone());
    }

    /// Collects every loaded node of the subtree rooted at `node`,
    /// including `node` itself.
    pub fn collect_subtree(node: &Arc<Self>) -> (Vec<Arc<DirNode>>, Vec<Arc<FileNode>>) {
        let mut dirs = vec![node.clone()];
        let mut files = Vec::new();
        let mut queue = vec![node.clone()];
        while let Some(dir) = queue.pop() {
            let state = dir.state.lock().unwrap();
            for child in state.files.values() {
                files.push(child.clone());
            }
            for child in state.dirs.values() {
                dirs.push(child.clone());
                queue.push(child.clone());
            }
        }
        (dirs, files)
    }
}
