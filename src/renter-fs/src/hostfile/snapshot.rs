//! Frozen read views of a file. A snapshot is a deep copy with host table
//! offsets dereferenced to keys, so it stays valid however the live file
//! mutates afterwards.

use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, ReadBuf};
use tokio::sync::OwnedRwLockReadGuard;

use super::file::{FileState, HostedFile};
use super::{
    CipherSuite, ErasureParams, FileUid, Hash256, HostKey, PartialChunkInfo, PartialChunkStatus,
};
use crate::fspath::FsPath;
use crate::{FsError, FsResult};

#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotPiece {
    pub host_key: HostKey,
    pub merkle_root: Hash256,
}

/// One chunk of a snapshot. A chunk outside the snapshot's range is a
/// stub: index only, no piece slots.
#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotChunk {
    pub index: u64,
    pub stuck: bool,
    pub pieces: Vec<Vec<SnapshotPiece>>,
}

impl SnapshotChunk {
    pub fn is_stub(&self) -> bool {
        self.pieces.is_empty()
    }
}

/// An immutable deep copy of a file's download-relevant content.
#[derive(Debug, Clone)]
pub struct Snapshot {
    chunks: Vec<SnapshotChunk>,
    file_size: u64,
    piece_size: u64,
    erasure: ErasureParams,
    cipher: CipherSuite,
    mode: u32,
    host_keys: Vec<HostKey>,
    local_path: String,
    fs_path: FsPath,
    has_partial_chunk: bool,
    partial_chunks: Vec<PartialChunkInfo>,
    uid: FileUid,
}

impl Snapshot {
    pub fn chunk_size(&self) -> u64 {
        self.piece_size * self.erasure.data_pieces as u64
    }

    pub fn num_chunks(&self) -> u64 {
        self.chunks.len() as u64
    }

    pub fn chunk(&self, index: u64) -> &SnapshotChunk {
        &self.chunks[index as usize]
    }

    pub fn pieces(&self, index: u64) -> &[Vec<SnapshotPiece>] {
        &self.chunks[index as usize].pieces
    }

    /// The chunk containing `offset` and the offset within that chunk.
    pub fn chunk_index_by_offset(&self, offset: u64) -> (u64, u64) {
        (offset / self.chunk_size(), offset % self.chunk_size())
    }

    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    pub fn piece_size(&self) -> u64 {
        self.piece_size
    }

    pub fn erasure(&self) -> &ErasureParams {
        &self.erasure
    }

    pub fn cipher(&self) -> &CipherSuite {
        &self.cipher
    }

    pub fn mode(&self) -> u32 {
        self.mode
    }

    pub fn host_keys(&self) -> &[HostKey] {
        &self.host_keys
    }

    pub fn local_path(&self) -> &str {
        &self.local_path
    }

    pub fn fs_path(&self) -> &FsPath {
        &self.fs_path
    }

    pub fn has_partial_chunk(&self) -> bool {
        self.has_partial_chunk
    }

    pub fn partial_chunks(&self) -> &[PartialChunkInfo] {
        &self.partial_chunks
    }

    pub fn uid(&self) -> &FileUid {
        &self.uid
    }
}

/// Reads the raw on-disk serialization of a file while holding its read
/// lock. No operation that needs the file's write lock can proceed until
/// the reader is dropped, so nothing done with the reader may call back
/// into a locking operation of the same file.
pub struct SnapshotReader {
    file: tokio::fs::File,
    len: u64,
    _guard: OwnedRwLockReadGuard<FileState>,
}

impl SnapshotReader {
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl AsyncRead for SnapshotReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.file).poll_read(cx, buf)
    }
}

impl HostedFile {
    /// Deep-copies the whole chunk range into a frozen snapshot.
    pub async fn snapshot(&self, fs_path: FsPath) -> FsResult<Snapshot> {
        self.snapshot_inner(fs_path, None).await
    }

    /// Like [`HostedFile::snapshot`] but only materializes the chunks
    /// covering `[offset, offset + length)`; everything else becomes an
    /// index-only stub. A zero `length` materializes nothing.
    pub async fn snapshot_range(
        &self,
        fs_path: FsPath,
        offset: u64,
        length: u64,
    ) -> FsResult<Snapshot> {
        self.snapshot_inner(fs_path, Some((offset, length))).await
    }

    async fn snapshot_inner(
        &self,
        fs_path: FsPath,
        range: Option<(u64, u64)>,
    ) -> FsResult<Snapshot> {
        let state = self.state.read().await;
        if state.deleted {
            return Err(FsError::Deleted(state.disk_path.display().to_string()));
        }
        let chunk_size = state.meta.chunk_size();
        let logical_chunks = state.meta.num_chunks
            + if state.meta.has_partial_chunk { 1 } else { 0 };

        // An empty range keeps every chunk a stub; the final chunk is
        // excluded when the range ends exactly on a chunk boundary.
        let (min_chunk, max_chunk) = match range {
            None => (0, logical_chunks.saturating_sub(1)),
            Some((_, 0)) => (1, 0),
            Some((offset, length)) => {
                let min = offset / chunk_size;
                let mut max = (offset + length) / chunk_size;
                if max > 0 && (offset + length) % chunk_size == 0 {
                    max -= 1;
                }
                (min, max)
            }
        };

        let mut chunks = Vec::with_capacity(logical_chunks as usize);
        for index in 0..logical_chunks {
            if index < min_chunk || index > max_chunk {
                chunks.push(SnapshotChunk {
                    index,
                    stuck: false,
                    pieces: Vec::new(),
                });
                continue;
            }
            if index >= state.meta.num_chunks {
                chunks.push(Self::partial_snapshot_chunk(&state, index).await?);
                continue;
            }
            let chunk = &state.chunks[index as usize];
            let pieces = chunk
                .pieces
                .iter()
                .map(|slot| {
                    slot.iter()
                        .filter_map(|p| {
                            state.host_table.get(p.host_offset as usize).map(|e| SnapshotPiece {
                                host_key: e.key.clone(),
                                merkle_root: p.merkle_root,
                            })
                        })
                        .collect()
                })
                .collect();
            chunks.push(SnapshotChunk {
                index,
                stuck: chunk.stuck,
                pieces,
            });
        }

        Ok(Snapshot {
            chunks,
            file_size: state.meta.file_size,
            piece_size: state.meta.piece_size,
            erasure: state.meta.erasure,
            cipher: state.meta.cipher.clone(),
            mode: state.meta.mode,
            host_keys: state.host_table.iter().map(|e| e.key.clone()).collect(),
            local_path: state.meta.local_path.clone(),
            fs_path,
            has_partial_chunk: state.meta.has_partial_chunk,
            partial_chunks: state.meta.partial_chunks.clone(),
            uid: state.meta.uid.clone(),
        })
    }

    // The trailing sub-chunk: completed partial chunks read their pieces
    // out of the combined file, incomplete ones materialize as empty
    // slots awaiting packing.
    async fn partial_snapshot_chunk(state: &FileState, index: u64) -> FsResult<SnapshotChunk> {
        let completed = state
            .meta
            .partial_chunks
            .iter()
            .find(|pc| pc.status == PartialChunkStatus::Completed);
        if let (Some(pc), Some(partials)) = (completed, state.partials.as_ref()) {
            let combined = partials.dereferenced_pieces(pc.combined_index).await?;
            return Ok(SnapshotChunk {
                index,
                stuck: false,
                pieces: combined
                    .into_iter()
                    .map(|slot| {
                        slot.into_iter()
                            .map(|(host_key, merkle_root)| SnapshotPiece {
                                host_key,
                                merkle_root,
                            })
                            .collect()
                    })
                    .collect(),
            });
        }
        Ok(SnapshotChunk {
            index,
            stuck: false,
            pieces: vec![Vec::new(); state.meta.erasure.total_pieces as usize],
        })
    }

    /// Opens the raw `.rfile` for reading. The file's read lock is held
    /// until the returned reader is dropped.
    pub async fn snapshot_reader(&self) -> FsResult<SnapshotReader> {
        let guard = self.state.clone().read_owned().await;
        if guard.deleted {
            return Err(FsError::Deleted(guard.disk_path.display().to_string()));
        }
        let file = self
            .deps
            .open(&guard.disk_path)
            .await
            .map_err(|e| FsError::DiskFault(e.to_string()))?;
        let len = self
            .deps
            .stat(&guard.disk_path)
            .await
            .map_err(|e| FsError::DiskFault(e.to_string()))?
            .len;
        Ok(SnapshotReader {
            file,
            len,
            _guard: guard,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::super::file::tests::{test_env, test_params};
    use super::super::file::HostedFile;
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn test_snapshot_isolation() {
        let (dir, wal, deps) = test_env().await;
        let file = HostedFile::create(
            &dir.path().join("f.rfile"),
            test_params(1 << 20, 1, 10),
            wal,
            deps,
        )
        .await
        .unwrap();

        let before = file.snapshot(FsPath::new("f").unwrap()).await.unwrap();
        let host = HostKey::ed25519(&[1u8; 32]);
        file.add_piece(&host, 0, 2, Hash256([9u8; 32])).await.unwrap();
        let after = file.snapshot(FsPath::new("f").unwrap()).await.unwrap();

        assert!(before.pieces(0)[2].is_empty());
        assert_eq!(
            after.pieces(0)[2],
            vec![SnapshotPiece {
                host_key: host,
                merkle_root: Hash256([9u8; 32]),
            }]
        );
    }

    // A range over chunks 4..8 of a 1 MiB chunk-size file materializes
    // exactly chunks 4 through 7.
    #[tokio::test]
    async fn test_snapshot_range_boundaries() {
        let (dir, wal, deps) = test_env().await;
        let file = HostedFile::create(
            &dir.path().join("f.rfile"),
            test_params(10 << 20, 1, 4),
            wal,
            deps,
        )
        .await
        .unwrap();
        assert_eq!(file.num_chunks().await, 10);

        let snap = file
            .snapshot_range(FsPath::new("f").unwrap(), 4 << 20, 4 << 20)
            .await
            .unwrap();
        for i in 0..10u64 {
            let materialized = (4..=7).contains(&i);
            assert_eq!(!snap.chunk(i).is_stub(), materialized, "chunk {}", i);
        }
    }

    #[tokio::test]
    async fn test_snapshot_range_zero_length_is_all_stubs() {
        let (dir, wal, deps) = test_env().await;
        let file = HostedFile::create(
            &dir.path().join("f.rfile"),
            test_params(3 << 20, 1, 4),
            wal,
            deps,
        )
        .await
        .unwrap();
        let snap = file
            .snapshot_range(FsPath::new("f").unwrap(), 1 << 20, 0)
            .await
            .unwrap();
        assert_eq!(snap.num_chunks(), 3);
        for i in 0..3 {
            assert!(snap.chunk(i).is_stub());
        }
    }

    #[tokio::test]
    async fn test_incomplete_partial_chunk_has_empty_slots() {
        let (dir, wal, deps) = test_env().await;
        let file = HostedFile::create(
            &dir.path().join("f.rfile"),
            test_params(1 << 20, 1, 4),
            wal,
            deps,
        )
        .await
        .unwrap();
        {
            let mut state = file.state.write().await;
            state.meta.has_partial_chunk = true;
            state.meta.partial_chunks.push(PartialChunkInfo {
                status: PartialChunkStatus::Incomplete,
                combined_index: 0,
                offset: 0,
                length: 100,
            });
        }
        let snap = file.snapshot(FsPath::new("f").unwrap()).await.unwrap();
        assert_eq!(snap.num_chunks(), 2);
        let partial = snap.chunk(1);
        assert_eq!(partial.pieces.len(), 4);
        assert!(partial.pieces.iter().all(|slot| slot.is_empty()));
    }

    #[tokio::test]
    async fn test_completed_partial_chunk_reads_combined_file() {
        let (dir, wal, deps) = test_env().await;
        let file = HostedFile::create(
            &dir.path().join("f.rfile"),
            test_params(1 << 20, 1, 4),
            wal.clone(),
            deps.clone(),
        )
        .await
        .unwrap();
        let combined = HostedFile::create(
            &dir.path().join("combined.rfile"),
            test_params(2 << 20, 1, 4),
            wal,
            deps,
        )
        .await
        .unwrap();
        let host = HostKey::ed25519(&[7u8; 32]);
        combined
            .add_piece(&host, 1, 0, Hash256([4u8; 32]))
            .await
            .unwrap();
        {
            let mut state = file.state.write().await;
            state.meta.has_partial_chunk = true;
            state.meta.partial_chunks.push(PartialChunkInfo {
                status: PartialChunkStatus::Completed,
                combined_index: 1,
                offset: 0,
                length: 100,
            });
        }
        file.set_partials_file(Some(combined)).await;

        let snap = file.snapshot(FsPath::new("f").unwrap()).await.unwrap();
        assert_eq!(
            snap.pieces(1)[0],
            vec![SnapshotPiece {
                host_key: host,
                merkle_root: Hash256([4u8; 32]),
            }]
        );
    }

    #[tokio::test]
    async fn test_snapshot_reader_blocks_writers() {
        let (dir, wal, deps) = test_env().await;
        let file = HostedFile::create(
            &dir.path().join("f.rfile"),
            test_params(1 << 20, 1, 4),
            wal,
            deps,
        )
        .await
        .unwrap();

        let reader = file.snapshot_reader().await.unwrap();
        assert!(file.state.clone().try_write_owned().is_err());

        let mut raw = Vec::new();
        let mut reader = reader;
        reader.read_to_end(&mut raw).await.unwrap();
        assert_eq!(raw.len() as u64, reader.len());

        drop(reader);
        assert!(file.state.clone().try_write_owned().is_ok());
    }
}
