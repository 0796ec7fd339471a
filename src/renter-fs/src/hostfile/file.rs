use log::debug;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;

use wal_lib::{Update, Wal};

use super::format::{
    marshal_chunk, marshal_header, marshal_host_table, marshaled_chunk_size, unmarshal_chunk,
    unmarshal_header, unmarshal_host_table, DEFAULT_RESERVED_PAGES, PAGE_SIZE,
};
use super::{
    Chunk, CipherSuite, ErasureParams, FileMeta, FileUid, Hash256, HostKey, HostKeyEntry, Piece,
    HOST_TABLE_PRUNE_THRESHOLD,
};
use crate::deps::FsDeps;
use crate::health::{self, HealthInfo};
use crate::persist::{
    create_and_apply_transaction, file_delete_update, file_insert_update, partial_delete_update,
};
use crate::{unix_timestamp, FsError, FsResult};

/// Extension of the companion file holding a not-yet-combined trailing
/// sub-chunk.
pub const PARTIAL_EXTENSION: &str = ".partial";

/// Parameters of a freshly created file.
#[derive(Debug, Clone)]
pub struct FileParams {
    pub file_size: u64,
    pub piece_size: u64,
    pub erasure: ErasureParams,
    pub cipher: CipherSuite,
    pub mode: u32,
    pub local_path: String,
}

pub(crate) struct FileState {
    pub meta: FileMeta,
    pub host_table: Vec<HostKeyEntry>,
    pub chunks: Vec<Chunk>,
    pub disk_path: PathBuf,
    pub deleted: bool,
    /// The combined file holding this file's completed partial chunk, if
    /// any. Always locked after this file, never before.
    pub partials: Option<Arc<HostedFile>>,
}

impl FileState {
    fn chunk_disk_offset(&self, index: u64) -> u64 {
        self.meta.chunk_table_offset
            + index * marshaled_chunk_size(self.meta.erasure.total_pieces as usize) as u64
    }

    fn host_key_of(&self, offset: u32) -> Option<&HostKey> {
        self.host_table.get(offset as usize).map(|e| &e.key)
    }
}

/// The in-memory handle on one `.rfile`. All mutations run under the write
/// half of the data lock and reach disk through the WAL; snapshots run
/// under the read half.
pub struct HostedFile {
    pub(crate) state: Arc<RwLock<FileState>>,
    pub(crate) wal: Arc<Wal>,
    pub(crate) deps: Arc<dyn FsDeps>,
    uid: FileUid,
}

impl HostedFile {
    /// Creates a new blank file at `disk_path` and persists its initial
    /// serialization through the WAL.
    pub async fn create(
        disk_path: &Path,
        params: FileParams,
        wal: Arc<Wal>,
        deps: Arc<dyn FsDeps>,
    ) -> FsResult<Arc<Self>> {
        if params.piece_size == 0 {
            return Err(FsError::Invalid("zero piece size".to_string()));
        }
        if deps.stat(disk_path).await.is_ok() {
            return Err(FsError::Exists(disk_path.display().to_string()));
        }

        let chunk_size = params.piece_size * params.erasure.data_pieces as u64;
        let num_chunks = (params.file_size + chunk_size - 1) / chunk_size;
        let now = unix_timestamp();
        let uid = FileUid::generate();
        let mut meta = FileMeta {
            file_size: params.file_size,
            piece_size: params.piece_size,
            erasure: params.erasure,
            cipher: params.cipher,
            uid: uid.clone(),
            mode: params.mode,
            create_time: now,
            access_time: now,
            change_time: now,
            mod_time: now,
            last_health_check_time: 0,
            local_path: params.local_path,
            share_links: Vec::new(),
            host_table_offset: 0,
            chunk_table_offset: 0,
            num_chunks,
            has_partial_chunk: false,
            partial_chunks: Vec::new(),
            cached_health: 0.0,
            cached_stuck_health: 0.0,
            cached_redundancy: -1.0,
            cached_user_redundancy: -1.0,
            cached_expiration: 0,
            cached_uploaded_bytes: 0,
            cached_upload_progress: 0.0,
            num_stuck_chunks: 0,
        };
        let host_table: Vec<HostKeyEntry> = Vec::new();
        let chunks: Vec<Chunk> = (0..num_chunks)
            .map(|_| Chunk::new(meta.erasure.total_pieces))
            .collect();

        // Place the tables: the host table grows downward from the chunk
        // table offset, both inside the reserved header pages.
        let table_bytes = marshal_host_table(&host_table)?;
        let mut reserved = DEFAULT_RESERVED_PAGES;
        loop {
            meta.chunk_table_offset = reserved * PAGE_SIZE as u64;
            meta.host_table_offset = meta.chunk_table_offset - table_bytes.len() as u64;
            let header = marshal_header(&meta)?;
            if header.len() as u64 <= meta.host_table_offset {
                break;
            }
            reserved += 1;
        }

        let header = marshal_header(&meta)?;
        let stride = marshaled_chunk_size(meta.erasure.total_pieces as usize);
        let mut image = vec![0u8; meta.chunk_table_offset as usize + stride * chunks.len()];
        image[..header.len()].copy_from_slice(&header);
        image[meta.host_table_offset as usize..meta.chunk_table_offset as usize]
            .copy_from_slice(&table_bytes);
        for (i, chunk) in chunks.iter().enumerate() {
            let record = marshal_chunk(chunk, meta.erasure.total_pieces as usize)?;
            let off = meta.chunk_table_offset as usize + i * stride;
            image[off..off + stride].copy_from_slice(&record);
        }

        let updates = vec![file_insert_update(disk_path, 0, image)];
        create_and_apply_transaction(&wal, &deps, updates).await?;
        debug!(
            "created file {} ({} chunks, {}/{} erasure)",
            disk_path.display(),
            num_chunks,
            meta.erasure.data_pieces,
            meta.erasure.total_pieces
        );

        Ok(Arc::new(Self {
            state: Arc::new(RwLock::new(FileState {
                meta,
                host_table,
                chunks,
                disk_path: disk_path.to_path_buf(),
                deleted: false,
                partials: None,
            })),
            wal,
            deps,
            uid,
        }))
    }

    /// Loads an existing `.rfile` from disk.
    pub async fn load(
        disk_path: &Path,
        wal: Arc<Wal>,
        deps: Arc<dyn FsDeps>,
    ) -> FsResult<Arc<Self>> {
        let raw = deps
            .read_all(disk_path)
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => FsError::NotExist(disk_path.display().to_string()),
                _ => FsError::DiskFault(e.to_string()),
            })?;
        let meta = unmarshal_header(&raw)?;
        if meta.host_table_offset > meta.chunk_table_offset
            || meta.chunk_table_offset as usize > raw.len()
        {
            return Err(FsError::Invalid(format!(
                "bad table offsets in {}",
                disk_path.display()
            )));
        }
        let host_table = unmarshal_host_table(
            &raw[meta.host_table_offset as usize..meta.chunk_table_offset as usize],
        )?;
        let stride = marshaled_chunk_size(meta.erasure.total_pieces as usize);
        let mut chunks = Vec::with_capacity(meta.num_chunks as usize);
        for i in 0..meta.num_chunks {
            let off = meta.chunk_table_offset as usize + i as usize * stride;
            if off + stride > raw.len() {
                return Err(FsError::Invalid(format!(
                    "chunk {} out of bounds in {}",
                    i,
                    disk_path.display()
                )));
            }
            chunks.push(unmarshal_chunk(
                &raw[off..off + stride],
                meta.erasure.total_pieces as usize,
            )?);
        }
        for chunk in &chunks {
            for slot in &chunk.pieces {
                for piece in slot {
                    if piece.host_offset as usize >= host_table.len() {
                        return Err(FsError::Invalid(format!(
                            "piece references host {} of {}",
                            piece.host_offset,
                            host_table.len()
                        )));
                    }
                }
            }
        }
        let uid = meta.uid.clone();
        Ok(Arc::new(Self {
            state: Arc::new(RwLock::new(FileState {
                meta,
                host_table,
                chunks,
                disk_path: disk_path.to_path_buf(),
                deleted: false,
                partials: None,
            })),
            wal,
            deps,
            uid,
        }))
    }

    pub fn uid(&self) -> &FileUid {
        &self.uid
    }

    pub async fn metadata(&self) -> FileMeta {
        self.state.read().await.meta.clone()
    }

    pub async fn disk_path(&self) -> PathBuf {
        self.state.read().await.disk_path.clone()
    }

    pub async fn is_deleted(&self) -> bool {
        self.state.read().await.deleted
    }

    pub async fn num_chunks(&self) -> u64 {
        self.state.read().await.meta.num_chunks
    }

    /// Wires up the combined file that holds this file's packed trailing
    /// sub-chunk.
    pub async fn set_partials_file(&self, partials: Option<Arc<HostedFile>>) {
        self.state.write().await.partials = partials;
    }

    // Serializes the header and host key table into their updates. The
    // chunk table is pinned where creation put it: a header that no
    // longer fits in front of it is refused, never silently relocated.
    fn header_updates(state: &mut FileState) -> FsResult<Vec<Update>> {
        let table_bytes = marshal_host_table(&state.host_table)?;
        if table_bytes.len() as u64 >= state.meta.chunk_table_offset {
            return Err(FsError::Internal(format!(
                "host table larger than header region: {}",
                table_bytes.len()
            )));
        }
        state.meta.host_table_offset = state.meta.chunk_table_offset - table_bytes.len() as u64;
        let header = marshal_header(&state.meta)?;
        if header.len() as u64 > state.meta.host_table_offset {
            return Err(FsError::Internal(format!(
                "header and host table ({} bytes) outgrew the {} bytes reserved in {}",
                header.len() + table_bytes.len(),
                state.meta.chunk_table_offset,
                state.disk_path.display()
            )));
        }

        Ok(vec![
            file_insert_update(&state.disk_path, 0, header),
            file_insert_update(&state.disk_path, state.meta.host_table_offset, table_bytes),
        ])
    }

    fn chunk_update(state: &FileState, index: u64) -> FsResult<Update> {
        let record = marshal_chunk(
            &state.chunks[index as usize],
            state.meta.erasure.total_pieces as usize,
        )?;
        Ok(file_insert_update(
            &state.disk_path,
            state.chunk_disk_offset(index),
            record,
        ))
    }

    /// Records that `host` stores the piece `piece_index` of chunk
    /// `chunk_index` under `merkle_root`. Adding a piece that is already
    /// present is a no-op and touches neither the WAL nor `mod_time`.
    pub async fn add_piece(
        &self,
        host: &HostKey,
        chunk_index: u64,
        piece_index: u32,
        merkle_root: Hash256,
    ) -> FsResult<()> {
        let mut state = self.state.write().await;
        if state.deleted {
            return Err(FsError::Deleted(state.disk_path.display().to_string()));
        }
        if chunk_index >= state.meta.num_chunks {
            return Err(FsError::Invalid(format!(
                "chunk {} of {}",
                chunk_index, state.meta.num_chunks
            )));
        }
        if piece_index >= state.meta.erasure.total_pieces {
            return Err(FsError::Invalid(format!(
                "piece {} of {}",
                piece_index, state.meta.erasure.total_pieces
            )));
        }

        let slot = &state.chunks[chunk_index as usize].pieces[piece_index as usize];
        let duplicate = slot.iter().any(|p| {
            p.merkle_root == merkle_root
                && state.host_key_of(p.host_offset).map(|k| k == host).unwrap_or(false)
        });
        if duplicate {
            return Ok(());
        }

        let host_offset = match state.host_table.iter().position(|e| &e.key == host) {
            Some(i) => {
                state.host_table[i].used = true;
                i as u32
            }
            None => {
                state.host_table.push(HostKeyEntry {
                    key: host.clone(),
                    used: true,
                });
                (state.host_table.len() - 1) as u32
            }
        };

        let total = state.meta.erasure.total_pieces as usize;
        if state.chunks[chunk_index as usize].num_pieces() >= total {
            return Err(FsError::Internal(format!(
                "chunk {} record full ({} pieces)",
                chunk_index, total
            )));
        }
        state.chunks[chunk_index as usize].pieces[piece_index as usize].push(Piece {
            host_offset,
            merkle_root,
        });
        state.meta.mod_time = unix_timestamp();

        let mut updates = Self::header_updates(&mut state)?;
        updates.push(Self::chunk_update(&state, chunk_index)?);
        create_and_apply_transaction(&self.wal, &self.deps, updates).await
    }

    /// Extends the chunk table to `new_count` zero-initialized records.
    /// Shrinking is a no-op.
    pub async fn grow_num_chunks(&self, new_count: u64) -> FsResult<()> {
        let mut state = self.state.write().await;
        if state.deleted {
            return Err(FsError::Deleted(state.disk_path.display().to_string()));
        }
        if new_count <= state.meta.num_chunks {
            return Ok(());
        }
        let first_new = state.meta.num_chunks;
        for _ in first_new..new_count {
            let chunk = Chunk::new(state.meta.erasure.total_pieces);
            state.chunks.push(chunk);
        }
        state.meta.num_chunks = new_count;
        state.meta.mod_time = unix_timestamp();

        let mut updates = Self::header_updates(&mut state)?;
        for i in first_new..new_count {
            updates.push(Self::chunk_update(&state, i)?);
        }
        create_and_apply_transaction(&self.wal, &self.deps, updates).await
    }

    /// Flips the stuck marker of a chunk and persists it.
    pub async fn set_stuck(&self, chunk_index: u64, stuck: bool) -> FsResult<()> {
        let mut state = self.state.write().await;
        if state.deleted {
            return Err(FsError::Deleted(state.disk_path.display().to_string()));
        }
        if chunk_index >= state.meta.num_chunks {
            return Err(FsError::Invalid(format!(
                "chunk {} of {}",
                chunk_index, state.meta.num_chunks
            )));
        }
        if state.chunks[chunk_index as usize].stuck == stuck {
            return Ok(());
        }
        state.chunks[chunk_index as usize].stuck = stuck;
        state.meta.num_stuck_chunks = state.chunks.iter().filter(|c| c.stuck).count() as u64;
        state.meta.mod_time = unix_timestamp();

        let mut updates = Self::header_updates(&mut state)?;
        updates.push(Self::chunk_update(&state, chunk_index)?);
        create_and_apply_transaction(&self.wal, &self.deps, updates).await
    }

    /// Moves the backing `.rfile` to `new_disk_path`. The rename itself is
    /// not atomic with respect to the WAL.
    pub async fn rename(&self, new_disk_path: &Path) -> FsResult<()> {
        let mut state = self.state.write().await;
        if state.deleted {
            return Err(FsError::Deleted(state.disk_path.display().to_string()));
        }
        if self.deps.stat(new_disk_path).await.is_ok() {
            return Err(FsError::PathOverload(new_disk_path.display().to_string()));
        }
        if let Some(parent) = new_disk_path.parent() {
            self.deps
                .create_dir_all(parent)
                .await
                .map_err(|e| FsError::DiskFault(e.to_string()))?;
        }
        self.deps
            .rename(&state.disk_path, new_disk_path)
            .await
            .map_err(|e| FsError::DiskFault(e.to_string()))?;
        state.disk_path = new_disk_path.to_path_buf();
        state.meta.change_time = unix_timestamp();
        Ok(())
    }

    /// Tombstones the file and queues the on-disk removal. Every later
    /// operation on this file fails with `Deleted`.
    pub async fn delete(&self) -> FsResult<()> {
        let mut state = self.state.write().await;
        if state.deleted {
            return Ok(());
        }
        let mut updates = vec![file_delete_update(&state.disk_path)];
        if state.meta.has_partial_chunk {
            let mut partial = state.disk_path.as_os_str().to_owned();
            partial.push(PARTIAL_EXTENSION);
            updates.push(partial_delete_update(Path::new(&partial)));
        }
        state.deleted = true;
        create_and_apply_transaction(&self.wal, &self.deps, updates).await
    }

    // Tombstones the in-memory state without touching the disk; used by
    // recursive directory deletion where one transaction already covers
    // the whole subtree.
    pub(crate) async fn mark_deleted(&self) {
        self.state.write().await.deleted = true;
    }

    // Refreshes the cached disk path after an ancestor directory moved.
    pub(crate) async fn set_disk_path(&self, path: &Path) {
        self.state.write().await.disk_path = path.to_path_buf();
    }

    /// Computes the current health summary from the chunk table and the
    /// contractor's liveness maps.
    pub async fn health(
        &self,
        offline: &HashMap<HostKey, bool>,
        good_for_renew: &HashMap<HostKey, bool>,
    ) -> FsResult<HealthInfo> {
        let state = self.state.read().await;
        if state.deleted {
            return Err(FsError::Deleted(state.disk_path.display().to_string()));
        }
        Ok(health::file_health(
            &state.chunks,
            &state.host_table,
            &state.meta.erasure,
            offline,
            good_for_renew,
        ))
    }

    /// Refreshes the derived summary kept in the header. Memory-only: the
    /// cache rides along with the next persisted header write.
    pub async fn update_cached_health(&self, info: &HealthInfo, expiration: u64) {
        let mut state = self.state.write().await;
        state.meta.cached_health = info.health;
        state.meta.cached_stuck_health = info.stuck_health;
        state.meta.cached_redundancy = info.redundancy;
        state.meta.cached_user_redundancy = info.user_redundancy;
        state.meta.cached_expiration = expiration;
        let (progress, bytes) = Self::progress_locked(&state);
        state.meta.cached_upload_progress = progress;
        state.meta.cached_uploaded_bytes = bytes;
    }

    /// Persists a new last-health-check time.
    pub async fn update_last_health_check_time(&self, t: u64) -> FsResult<()> {
        let mut state = self.state.write().await;
        if state.deleted {
            return Err(FsError::Deleted(state.disk_path.display().to_string()));
        }
        state.meta.last_health_check_time = t;
        let updates = Self::header_updates(&mut state)?;
        create_and_apply_transaction(&self.wal, &self.deps, updates).await
    }

    fn progress_locked(state: &FileState) -> (f64, u64) {
        if state.meta.num_chunks == 0 {
            return (100.0, 0);
        }
        let needed = state.meta.num_chunks * state.meta.erasure.total_pieces as u64;
        let have: u64 = state
            .chunks
            .iter()
            .map(|c| (c.num_pieces() as u64).min(state.meta.erasure.total_pieces as u64))
            .sum();
        let progress = (100.0 * have as f64 / needed as f64).min(100.0);
        (progress, have * state.meta.piece_size)
    }

    /// Upload progress in percent and the number of uploaded bytes.
    pub async fn upload_progress_and_bytes(&self) -> (f64, u64) {
        let state = self.state.read().await;
        Self::progress_locked(&state)
    }

    /// Latest end height over the hosts in the table that still have a
    /// contract; 0 when none do.
    pub async fn expiration(&self, contract_ends: &HashMap<HostKey, u64>) -> u64 {
        let state = self.state.read().await;
        state
            .host_table
            .iter()
            .filter_map(|e| contract_ends.get(&e.key).copied())
            .max()
            .unwrap_or(0)
    }

    /// Marks the given hosts as still in use and compacts the table once
    /// too many dead entries accumulate. Compaction rewrites every chunk
    /// record since piece host offsets move.
    pub async fn update_used_hosts(&self, used: &[HostKey]) -> FsResult<()> {
        let mut state = self.state.write().await;
        if state.deleted {
            return Err(FsError::Deleted(state.disk_path.display().to_string()));
        }
        let used_set: HashSet<&HostKey> = used.iter().collect();
        for entry in state.host_table.iter_mut() {
            entry.used = used_set.contains(&entry.key);
        }

        let referenced: HashSet<u32> = state
            .chunks
            .iter()
            .flat_map(|c| c.pieces.iter())
            .flat_map(|slot| slot.iter())
            .map(|p| p.host_offset)
            .collect();
        let dead = state
            .host_table
            .iter()
            .enumerate()
            .filter(|(i, e)| !e.used && !referenced.contains(&(*i as u32)))
            .count();

        let mut updates;
        if dead > HOST_TABLE_PRUNE_THRESHOLD {
            let mut remap: HashMap<u32, u32> = HashMap::new();
            let mut kept = Vec::with_capacity(state.host_table.len() - dead);
            for (i, entry) in state.host_table.iter().enumerate() {
                if entry.used || referenced.contains(&(i as u32)) {
                    remap.insert(i as u32, kept.len() as u32);
                    kept.push(entry.clone());
                }
            }
            state.host_table = kept;
            for chunk in state.chunks.iter_mut() {
                for slot in chunk.pieces.iter_mut() {
                    for piece in slot.iter_mut() {
                        piece.host_offset = remap[&piece.host_offset];
                    }
                }
            }
            debug!(
                "pruned {} host key entries from {}",
                dead,
                state.disk_path.display()
            );
            updates = Self::header_updates(&mut state)?;
            for i in 0..state.meta.num_chunks {
                updates.push(Self::chunk_update(&state, i)?);
            }
        } else {
            updates = Self::header_updates(&mut state)?;
        }
        create_and_apply_transaction(&self.wal, &self.deps, updates).await
    }

    /// The pieces of one chunk with host table offsets dereferenced to
    /// keys, in slot order.
    pub async fn dereferenced_pieces(
        &self,
        chunk_index: u64,
    ) -> FsResult<Vec<Vec<(HostKey, Hash256)>>> {
        let state = self.state.read().await;
        if chunk_index >= state.meta.num_chunks {
            return Err(FsError::Invalid(format!(
                "chunk {} of {}",
                chunk_index, state.meta.num_chunks
            )));
        }
        Ok(state.chunks[chunk_index as usize]
            .pieces
            .iter()
            .map(|slot| {
                slot.iter()
                    .filter_map(|p| {
                        state
                            .host_key_of(p.host_offset)
                            .map(|k| (k.clone(), p.merkle_root))
                    })
                    .collect()
            })
            .collect())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::deps::DiskFs;

    pub(crate) async fn test_env() -> (tempfile::TempDir, Arc<Wal>, Arc<dyn FsDeps>) {
        let dir = tempfile::tempdir().unwrap();
        let (wal, recovered) = Wal::open(dir.path().join("renter.wal")).await.unwrap();
        assert!(recovered.is_empty());
        (dir, wal, Arc::new(DiskFs))
    }

    pub(crate) fn test_params(file_size: u64, k: u32, n: u32) -> FileParams {
        FileParams {
            file_size,
            piece_size: 1 << 20,
            erasure: ErasureParams::new(k, n).unwrap(),
            cipher: CipherSuite::plain(),
            mode: 0o666,
            local_path: String::new(),
        }
    }

    #[tokio::test]
    async fn test_create_load_roundtrip() {
        let (dir, wal, deps) = test_env().await;
        let path = dir.path().join("f.rfile");
        let file = HostedFile::create(&path, test_params(1 << 20, 1, 10), wal.clone(), deps.clone())
            .await
            .unwrap();
        assert_eq!(file.num_chunks().await, 1);

        let host = HostKey::ed25519(&[1u8; 32]);
        file.add_piece(&host, 0, 0, Hash256([3u8; 32])).await.unwrap();

        let loaded = HostedFile::load(&path, wal, deps).await.unwrap();
        let meta = loaded.metadata().await;
        assert_eq!(meta.file_size, 1 << 20);
        assert_eq!(meta.num_chunks, 1);
        assert_eq!(meta.uid, file.metadata().await.uid);
        let pieces = loaded.dereferenced_pieces(0).await.unwrap();
        assert_eq!(pieces[0], vec![(host, Hash256([3u8; 32]))]);
    }

    #[tokio::test]
    async fn test_add_piece_is_idempotent() {
        let (dir, wal, deps) = test_env().await;
        let path = dir.path().join("f.rfile");
        let file = HostedFile::create(&path, test_params(1 << 20, 1, 10), wal, deps)
            .await
            .unwrap();
        let host = HostKey::ed25519(&[1u8; 32]);
        let root = Hash256([3u8; 32]);
        file.add_piece(&host, 0, 4, root).await.unwrap();
        let mod_time = file.metadata().await.mod_time;
        file.add_piece(&host, 0, 4, root).await.unwrap();

        let pieces = file.dereferenced_pieces(0).await.unwrap();
        assert_eq!(pieces[4].len(), 1);
        assert_eq!(file.metadata().await.mod_time, mod_time);
    }

    #[tokio::test]
    async fn test_add_piece_bounds() {
        let (dir, wal, deps) = test_env().await;
        let file = HostedFile::create(
            &dir.path().join("f.rfile"),
            test_params(1 << 20, 1, 10),
            wal,
            deps,
        )
        .await
        .unwrap();
        let host = HostKey::ed25519(&[1u8; 32]);
        assert!(matches!(
            file.add_piece(&host, 1, 0, Hash256::default()).await,
            Err(FsError::Invalid(_))
        ));
        assert!(matches!(
            file.add_piece(&host, 0, 10, Hash256::default()).await,
            Err(FsError::Invalid(_))
        ));
    }

    #[tokio::test]
    async fn test_grow_num_chunks() {
        let (dir, wal, deps) = test_env().await;
        let path = dir.path().join("f.rfile");
        let file = HostedFile::create(&path, test_params(1 << 20, 1, 4), wal.clone(), deps.clone())
            .await
            .unwrap();
        file.grow_num_chunks(3).await.unwrap();
        assert_eq!(file.num_chunks().await, 3);
        // Shrinking is a no-op.
        file.grow_num_chunks(2).await.unwrap();
        assert_eq!(file.num_chunks().await, 3);

        let loaded = HostedFile::load(&path, wal, deps).await.unwrap();
        assert_eq!(loaded.num_chunks().await, 3);
    }

    #[tokio::test]
    async fn test_delete_tombstones() {
        let (dir, wal, deps) = test_env().await;
        let path = dir.path().join("f.rfile");
        let file = HostedFile::create(&path, test_params(1 << 20, 1, 4), wal, deps)
            .await
            .unwrap();
        file.delete().await.unwrap();
        assert!(file.is_deleted().await);
        assert!(tokio::fs::metadata(&path).await.is_err());
        assert!(matches!(
            file.add_piece(&HostKey::ed25519(&[1u8; 32]), 0, 0, Hash256::default())
                .await,
            Err(FsError::Deleted(_))
        ));
        // Deleting twice is fine.
        file.delete().await.unwrap();
    }

    #[tokio::test]
    async fn test_set_stuck_updates_counter() {
        let (dir, wal, deps) = test_env().await;
        let path = dir.path().join("f.rfile");
        let file = HostedFile::create(&path, test_params(3 << 20, 1, 4), wal.clone(), deps.clone())
            .await
            .unwrap();
        file.set_stuck(1, true).await.unwrap();
        assert_eq!(file.metadata().await.num_stuck_chunks, 1);

        let loaded = HostedFile::load(&path, wal, deps).await.unwrap();
        assert_eq!(loaded.metadata().await.num_stuck_chunks, 1);
        file.set_stuck(1, false).await.unwrap();
        assert_eq!(file.metadata().await.num_stuck_chunks, 0);
    }

    #[tokio::test]
    async fn test_rename_moves_backing_file() {
        let (dir, wal, deps) = test_env().await;
        let path = dir.path().join("f.rfile");
        let file = HostedFile::create(&path, test_params(1 << 20, 1, 4), wal, deps)
            .await
            .unwrap();
        let target = dir.path().join("sub").join("g.rfile");
        file.rename(&target).await.unwrap();
        assert!(tokio::fs::metadata(&target).await.is_ok());
        assert!(tokio::fs::metadata(&path).await.is_err());
        assert_eq!(file.disk_path().await, target);
    }

    #[tokio::test]
    async fn test_rename_to_existing_is_overload() {
        let (dir, wal, deps) = test_env().await;
        let file = HostedFile::create(
            &dir.path().join("f.rfile"),
            test_params(1 << 20, 1, 4),
            wal.clone(),
            deps.clone(),
        )
        .await
        .unwrap();
        let _other = HostedFile::create(&dir.path().join("g.rfile"), test_params(1 << 20, 1, 4), wal, deps)
            .await
            .unwrap();
        assert!(matches!(
            file.rename(&dir.path().join("g.rfile")).await,
            Err(FsError::PathOverload(_))
        ));
    }

    #[tokio::test]
    async fn test_host_table_prunes_dead_entries() {
        let (dir, wal, deps) = test_env().await;
        let path = dir.path().join("f.rfile");
        let file = HostedFile::create(&path, test_params(1 << 20, 1, 200), wal.clone(), deps.clone())
            .await
            .unwrap();
        // Fill the table with hosts, then reference only the last one.
        for i in 0..60u8 {
            file.add_piece(&HostKey::ed25519(&[i; 32]), 0, i as u32, Hash256([i; 32]))
                .await
                .unwrap();
        }
        {
            // Drop the pieces of the first 55 hosts so their entries go
            // dead, keeping the table intact.
            let mut state = file.state.write().await;
            for slot in state.chunks[0].pieces.iter_mut().take(55) {
                slot.clear();
            }
        }
        let keeper = HostKey::ed25519(&[59u8; 32]);
        file.update_used_hosts(&[keeper.clone()]).await.unwrap();

        let state = file.state.read().await;
        assert!(state.host_table.len() < 60);
        assert!(state.host_table.iter().any(|e| e.key == keeper));
        // Remaining pieces still resolve.
        for slot in &state.chunks[0].pieces {
            for piece in slot {
                assert!((piece.host_offset as usize) < state.host_table.len());
            }
        }
    }

    // Every new host costs header-region space. The chunk table never
    // moves, so once the reserved page fills up further growth is refused
    // with a loud error and the persisted file stays intact.
    #[tokio::test]
    async fn test_header_growth_past_reservation_fails() {
        let (dir, wal, deps) = test_env().await;
        let path = dir.path().join("f.rfile");
        let file = HostedFile::create(&path, test_params(1 << 20, 1, 200), wal.clone(), deps.clone())
            .await
            .unwrap();
        assert_eq!(file.metadata().await.chunk_table_offset, PAGE_SIZE as u64);

        let mut hit_limit = false;
        let mut persisted = 0u32;
        for i in 0..60u8 {
            match file
                .add_piece(&HostKey::ed25519(&[i; 32]), 0, i as u32, Hash256([i; 32]))
                .await
            {
                Ok(()) => persisted += 1,
                Err(FsError::Internal(_)) => {
                    hit_limit = true;
                    break;
                }
                Err(e) => panic!("unexpected error: {}", e),
            }
        }
        assert!(hit_limit, "header region never filled up");
        assert!(persisted > 0);

        // The chunk table stayed where creation put it and the last
        // persisted state still loads.
        let meta = file.metadata().await;
        assert_eq!(meta.chunk_table_offset, PAGE_SIZE as u64);
        let loaded = HostedFile::load(&path, wal, deps).await.unwrap();
        let pieces = loaded.dereferenced_pieces(0).await.unwrap();
        let loaded_count: usize = pieces.iter().map(|slot| slot.len()).sum();
        assert_eq!(loaded_count as u32, persisted);
    }

    #[tokio::test]
    async fn test_upload_progress() {
        let (dir, wal, deps) = test_env().await;
        let file = HostedFile::create(
            &dir.path().join("f.rfile"),
            test_params(1 << 20, 1, 2),
            wal,
            deps,
        )
        .await
        .unwrap();
        let (progress, bytes) = file.upload_progress_and_bytes().await;
        assert_eq!(progress, 0.0);
        assert_eq!(bytes, 0);
        file.add_piece(&HostKey::ed25519(&[1u8; 32]), 0, 0, Hash256::default())
            .await
            .unwrap();
        let (progress, bytes) = file.upload_progress_and_bytes().await;
        assert_eq!(progress, 50.0);
        assert_eq!(bytes, 1 << 20);
    }
}
