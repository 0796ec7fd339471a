//! The in-memory node tree over the on-disk repository. Nodes are
//! reference counted and lazily loaded; a node stays linked into its
//! parent while it has open handles or loaded children and is unlinked
//! iteratively up the tree when the last one goes away.
//!
//! Lock discipline: a parent's mutex is always taken before a child's,
//! never the other way around; sibling locks are taken in lexical order of
//! their paths. None of these std mutexes is ever held across an await.

mod dir_node;
mod file_node;
pub mod fs_core;

#[cfg(test)]
mod tree_tests;

pub(crate) use dir_node::DirNode;
pub(crate) use file_node::FileNode;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::fspath::FsPath;
use crate::hostdir::HostedDir;
use crate::hostfile::file::HostedFile;

static NEXT_HANDLE_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique handle id.
pub(crate) fn next_id() -> u64 {
    NEXT_HANDLE_ID.fetch_add(1, Ordering::Relaxed)
}

/// An open reference to a file node. The node stays linked into the tree
/// until every handle on it is closed.
pub struct FileHandle {
    pub(crate) node: Arc<FileNode>,
    pub(crate) id: u64,
    closed: bool,
}

impl FileHandle {
    pub(crate) fn new(node: Arc<FileNode>, id: u64) -> Self {
        Self {
            node,
            id,
            closed: false,
        }
    }

    pub fn file(&self) -> &Arc<HostedFile> {
        &self.node.file
    }

    pub fn fs_path(&self) -> FsPath {
        self.node.fs_path()
    }

    /// Releases the handle, unlinking the node (and empty ancestors) when
    /// this was the last reference.
    pub fn close(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if !self.closed {
            self.closed = true;
            FileNode::close_handle(&self.node, self.id);
        }
    }
}

impl Drop for FileHandle {
    fn drop(&mut self) {
        self.release();
    }
}

/// An open reference to a directory node.
pub struct DirHandle {
    pub(crate) node: Arc<DirNode>,
    pub(crate) id: u64,
    closed: bool,
}

impl DirHandle {
    pub(crate) fn new(node: Arc<DirNode>, id: u64) -> Self {
        Self {
            node,
            id,
            closed: false,
        }
    }

    pub fn dir(&self) -> &Arc<HostedDir> {
        &self.node.dir
    }

    pub fn fs_path(&self) -> FsPath {
        self.node.fs_path()
    }

    pub fn close(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if !self.closed {
            self.closed = true;
            DirNode::close_handle(&self.node, self.id);
        }
    }
}

impl Drop for DirHandle {
    fn drop(&mut self) {
        self.release();
    }
}
