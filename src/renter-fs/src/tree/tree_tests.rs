use std::collections::HashMap;
use std::sync::Arc;

use wal_lib::Wal;

use crate::deps::{DiskFs, FsDeps};
use crate::fspath::FsPath;
use crate::hostfile::file::FileParams;
use crate::hostfile::{CipherSuite, ErasureParams, Hash256, HostKey};
use crate::tree::fs_core::FsCore;
use crate::FsError;

async fn test_fs() -> (tempfile::TempDir, FsCore) {
    let dir = tempfile::tempdir().unwrap();
    let (wal, recovered) = Wal::open(dir.path().join("renter.wal")).await.unwrap();
    assert!(recovered.is_empty());
    let deps: Arc<dyn FsDeps> = Arc::new(DiskFs);
    let fs = FsCore::new(dir.path(), wal, deps).await.unwrap();
    (dir, fs)
}

fn params(file_size: u64, k: u32, n: u32) -> FileParams {
    FileParams {
        file_size,
        piece_size: 1 << 20,
        erasure: ErasureParams::new(k, n).unwrap(),
        cipher: CipherSuite::plain(),
        mode: 0o666,
        local_path: String::new(),
    }
}

fn p(raw: &str) -> FsPath {
    FsPath::new(raw).unwrap()
}

#[tokio::test]
async fn test_create_then_close_unlinks_chain() {
    let (_tmp, fs) = test_fs().await;
    let handle = fs.create_file(&p("x/y/z"), params(1 << 20, 1, 4)).await.unwrap();
    // z plus its two loaded ancestors.
    assert_eq!(fs.loaded_node_count(), 3);
    handle.close();
    assert_eq!(fs.loaded_node_count(), 0);
}

// Four handles on one file: the node survives until the very last close,
// then the whole empty chain unlinks.
#[tokio::test]
async fn test_last_handle_closes_chain() {
    let (_tmp, fs) = test_fs().await;
    let path = p("x/y/z");
    let h1 = fs.create_file(&path, params(1 << 20, 1, 4)).await.unwrap();
    let h2 = fs.open_file(&path).await.unwrap();
    let h3 = fs.open_file(&path).await.unwrap();
    let h4 = fs.open_file(&path).await.unwrap();

    h1.close();
    h2.close();
    h3.close();
    assert_eq!(fs.loaded_node_count(), 3, "live handle must keep the chain");

    h4.close();
    assert_eq!(fs.loaded_node_count(), 0);
}

#[tokio::test]
async fn test_open_after_close_reloads() {
    let (_tmp, fs) = test_fs().await;
    let path = p("a/f");
    let uid = {
        let handle = fs.create_file(&path, params(1 << 20, 1, 4)).await.unwrap();
        handle.file().uid().clone()
    };
    assert_eq!(fs.loaded_node_count(), 0);
    let handle = fs.open_file(&path).await.unwrap();
    assert_eq!(handle.file().uid(), &uid);
}

#[tokio::test]
async fn test_dir_with_open_child_stays_linked() {
    let (_tmp, fs) = test_fs().await;
    let file_handle = fs.create_file(&p("a/f"), params(1 << 20, 1, 4)).await.unwrap();
    let dir_handle = fs.open_dir(&p("a")).await.unwrap();
    dir_handle.close();
    // Directory keeps its place: a loaded child is as good as a handle.
    assert_eq!(fs.loaded_node_count(), 2);
    file_handle.close();
    assert_eq!(fs.loaded_node_count(), 0);
}

#[tokio::test]
async fn test_open_missing_file() {
    let (_tmp, fs) = test_fs().await;
    assert!(matches!(
        fs.open_file(&p("nope")).await,
        Err(FsError::NotExist(_))
    ));
    assert!(matches!(
        fs.open_dir(&p("nope")).await,
        Err(FsError::NotExist(_))
    ));
}

#[tokio::test]
async fn test_create_conflicts() {
    let (_tmp, fs) = test_fs().await;
    let h = fs.create_file(&p("a/f"), params(1 << 20, 1, 4)).await.unwrap();
    assert!(matches!(
        fs.create_file(&p("a/f"), params(1 << 20, 1, 4)).await,
        Err(FsError::Exists(_))
    ));
    // A directory in the way of a file path is an overload, not Exists.
    assert!(matches!(
        fs.create_file(&p("a"), params(1 << 20, 1, 4)).await,
        Err(FsError::PathOverload(_))
    ));
    h.close();
}

#[tokio::test]
async fn test_delete_file() {
    let (_tmp, fs) = test_fs().await;
    let path = p("a/f");
    let handle = fs.create_file(&path, params(1 << 20, 1, 4)).await.unwrap();
    fs.delete(&path).await.unwrap();

    // The tombstoned handle fails loudly, a fresh open sees nothing.
    assert!(matches!(
        handle
            .file()
            .add_piece(&HostKey::ed25519(&[1u8; 32]), 0, 0, Hash256::default())
            .await,
        Err(FsError::Deleted(_))
    ));
    assert!(matches!(fs.open_file(&path).await, Err(FsError::NotExist(_))));
    handle.close();
}

#[tokio::test]
async fn test_delete_dir_takes_subtree() {
    let (_tmp, fs) = test_fs().await;
    fs.create_file(&p("a/b/f1"), params(1 << 20, 1, 4))
        .await
        .unwrap()
        .close();
    fs.create_file(&p("a/c/f2"), params(1 << 20, 1, 4))
        .await
        .unwrap()
        .close();

    fs.delete(&p("a")).await.unwrap();
    assert!(matches!(fs.open_dir(&p("a")).await, Err(FsError::NotExist(_))));
    assert!(matches!(
        fs.open_file(&p("a/b/f1")).await,
        Err(FsError::NotExist(_))
    ));
    let (files, dirs) = fs.read_dir(&FsPath::root()).await.unwrap();
    assert!(files.is_empty());
    assert!(dirs.is_empty());
}

#[tokio::test]
async fn test_delete_missing() {
    let (_tmp, fs) = test_fs().await;
    assert!(matches!(fs.delete(&p("ghost")).await, Err(FsError::NotExist(_))));
}

#[tokio::test]
async fn test_rename_file() {
    let (_tmp, fs) = test_fs().await;
    let old = p("a/f");
    let new = p("b/sub/g");
    let uid = {
        let h = fs.create_file(&old, params(1 << 20, 1, 4)).await.unwrap();
        h.file().uid().clone()
    };
    fs.rename_file(&old, &new).await.unwrap();

    assert!(matches!(fs.open_file(&old).await, Err(FsError::NotExist(_))));
    let h = fs.open_file(&new).await.unwrap();
    assert_eq!(h.file().uid(), &uid);
    assert_eq!(h.fs_path(), new);
}

#[tokio::test]
async fn test_rename_file_onto_existing_fails() {
    let (_tmp, fs) = test_fs().await;
    fs.create_file(&p("a/f"), params(1 << 20, 1, 4)).await.unwrap().close();
    fs.create_file(&p("a/g"), params(1 << 20, 1, 4)).await.unwrap().close();
    assert!(matches!(
        fs.rename_file(&p("a/f"), &p("a/g")).await,
        Err(FsError::Exists(_)) | Err(FsError::PathOverload(_))
    ));
}

#[tokio::test]
async fn test_rename_dir_follows_loaded_subtree() {
    let (_tmp, fs) = test_fs().await;
    let handle = fs
        .create_file(&p("a/b/f"), params(1 << 20, 1, 4))
        .await
        .unwrap();
    fs.rename_dir(&p("a"), &p("z")).await.unwrap();

    assert_eq!(handle.fs_path(), p("z/b/f"));
    // The held handle keeps working against the moved backing file.
    handle
        .file()
        .add_piece(&HostKey::ed25519(&[1u8; 32]), 0, 0, Hash256([1u8; 32]))
        .await
        .unwrap();
    let reopened = fs.open_file(&p("z/b/f")).await.unwrap();
    assert_eq!(reopened.file().uid(), handle.file().uid());
    assert!(matches!(
        fs.open_file(&p("a/b/f")).await,
        Err(FsError::NotExist(_))
    ));
}

#[tokio::test]
async fn test_read_dir_splits_files_and_dirs() {
    let (_tmp, fs) = test_fs().await;
    fs.create_file(&p("a/f1"), params(1 << 20, 1, 4)).await.unwrap().close();
    fs.create_file(&p("a/sub/f2"), params(1 << 20, 1, 4))
        .await
        .unwrap()
        .close();

    let (files, dirs) = fs.read_dir(&p("a")).await.unwrap();
    assert_eq!(files, vec![p("a/f1")]);
    assert_eq!(dirs, vec![p("a/sub")]);
}

#[tokio::test]
async fn test_file_info() {
    let (_tmp, fs) = test_fs().await;
    let handle = fs.create_file(&p("a/f"), params(1 << 20, 1, 10)).await.unwrap();
    let host = HostKey::ed25519(&[1u8; 32]);
    handle
        .file()
        .add_piece(&host, 0, 0, Hash256([2u8; 32]))
        .await
        .unwrap();

    let offline: HashMap<HostKey, bool> = [(host.clone(), false)].into();
    let gfr: HashMap<HostKey, bool> = [(host.clone(), true)].into();
    let ends: HashMap<HostKey, u64> = [(host.clone(), 424242)].into();
    let info = fs.file_info(&handle, &offline, &gfr, &ends).await.unwrap();

    assert_eq!(info.health, 0.0);
    assert_eq!(info.redundancy, 1.0);
    assert!(info.available);
    assert!(!info.stuck);
    assert_eq!(info.expiration, 424242);
    assert_eq!(info.max_health_percent, 100.0);
    assert_eq!(info.fs_path, p("a/f"));
}

// A host that is online but no longer good for renew still serves reads
// today, yet the file cannot be promised to the user: availability and
// recoverability follow the clamped user redundancy.
#[tokio::test]
async fn test_file_info_clamps_availability_to_renewing_hosts() {
    let (_tmp, fs) = test_fs().await;
    let handle = fs.create_file(&p("a/f"), params(1 << 20, 1, 10)).await.unwrap();
    let host = HostKey::ed25519(&[2u8; 32]);
    handle
        .file()
        .add_piece(&host, 0, 0, Hash256([6u8; 32]))
        .await
        .unwrap();

    let offline: HashMap<HostKey, bool> = [(host.clone(), false)].into();
    let gfr: HashMap<HostKey, bool> = [(host.clone(), false)].into();
    let info = fs
        .file_info(&handle, &offline, &gfr, &HashMap::new())
        .await
        .unwrap();

    assert_eq!(info.health, 0.0);
    assert_eq!(info.redundancy, 1.0);
    assert_eq!(info.user_redundancy, 0.0);
    assert!(!info.available);
    assert!(!info.recoverable);
}

#[tokio::test]
async fn test_concurrent_opens_share_one_node() {
    let (_tmp, fs) = test_fs().await;
    let path = p("a/f");
    fs.create_file(&path, params(1 << 20, 1, 4)).await.unwrap().close();

    let fs = Arc::new(fs);
    let mut tasks = Vec::new();
    for _ in 0..8 {
        let fs = fs.clone();
        let path = path.clone();
        tasks.push(tokio::spawn(async move {
            let h = fs.open_file(&path).await.unwrap();
            let uid = h.file().uid().clone();
            h.close();
            uid
        }));
    }
    let mut uids = Vec::new();
    for t in tasks {
        uids.push(t.await.unwrap());
    }
    uids.dedup();
    assert_eq!(uids.len(), 1);
    assert_eq!(fs.loaded_node_count(), 0);
}
