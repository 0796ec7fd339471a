//! Pure health and redundancy math over a file's chunk table and the
//! contractor's host liveness maps. Lower health is better; 0 means fully
//! redundant, 1 means no piece of some chunk is retrievable.

use std::collections::{HashMap, HashSet};

use crate::hostfile::{Chunk, ErasureParams, HostKey, HostKeyEntry};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HealthInfo {
    pub health: f64,
    pub stuck_health: f64,
    pub num_stuck_chunks: u64,
    /// Min over chunks of online-hosts / data-pieces; -1 for a file with
    /// no chunks.
    pub redundancy: f64,
    /// Like `redundancy` but counting only hosts that are also good for
    /// renew.
    pub user_redundancy: f64,
}

fn is_offline(host: &HostKey, offline: &HashMap<HostKey, bool>) -> bool {
    // A host the contractor does not know about is presumed offline.
    offline.get(host).copied().unwrap_or(true)
}

fn is_good_for_renew(host: &HostKey, good_for_renew: &HashMap<HostKey, bool>) -> bool {
    good_for_renew.get(host).copied().unwrap_or(false)
}

/// Counts the distinct online hosts holding pieces of `chunk`, and the
/// subset of those that are good for renew. A host holding several pieces
/// of the chunk counts once.
pub fn chunk_host_counts(
    chunk: &Chunk,
    host_table: &[HostKeyEntry],
    offline: &HashMap<HostKey, bool>,
    good_for_renew: &HashMap<HostKey, bool>,
) -> (usize, usize) {
    let mut online: HashSet<&HostKey> = HashSet::new();
    let mut renewing: HashSet<&HostKey> = HashSet::new();
    for slot in &chunk.pieces {
        for piece in slot {
            let Some(entry) = host_table.get(piece.host_offset as usize) else {
                continue;
            };
            if is_offline(&entry.key, offline) {
                continue;
            }
            online.insert(&entry.key);
            if is_good_for_renew(&entry.key, good_for_renew) {
                renewing.insert(&entry.key);
            }
        }
    }
    (online.len(), renewing.len())
}

/// Health of a single chunk given `good` online hosts: 0 when at least
/// `data_pieces` hosts answer, 1 when none do.
pub fn chunk_health(erasure: &ErasureParams, good: usize) -> f64 {
    let k = erasure.data_pieces as f64;
    (k - (good as f64).min(k)) / k
}

/// Computes the full health summary of a file.
pub fn file_health(
    chunks: &[Chunk],
    host_table: &[HostKeyEntry],
    erasure: &ErasureParams,
    offline: &HashMap<HostKey, bool>,
    good_for_renew: &HashMap<HostKey, bool>,
) -> HealthInfo {
    let k = erasure.data_pieces as f64;
    let mut info = HealthInfo {
        health: 0.0,
        stuck_health: 0.0,
        num_stuck_chunks: 0,
        redundancy: -1.0,
        user_redundancy: -1.0,
    };
    if chunks.is_empty() {
        return info;
    }

    let mut min_redundancy = f64::MAX;
    let mut min_user_redundancy = f64::MAX;
    for chunk in chunks {
        let (online, renewing) = chunk_host_counts(chunk, host_table, offline, good_for_renew);
        let health = chunk_health(erasure, online);
        if chunk.stuck {
            info.num_stuck_chunks += 1;
            info.stuck_health = info.stuck_health.max(health);
        } else {
            info.health = info.health.max(health);
        }
        min_redundancy = min_redundancy.min(online as f64 / k);
        min_user_redundancy = min_user_redundancy.min(renewing as f64 / k);
    }
    info.redundancy = min_redundancy;
    info.user_redundancy = min_user_redundancy.min(min_redundancy);
    info
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hostfile::{Hash256, Piece};

    fn single_piece_chunk(host_offset: u32, num_pieces: u32) -> Chunk {
        let mut chunk = Chunk::new(num_pieces);
        chunk.pieces[0].push(Piece {
            host_offset,
            merkle_root: Hash256([5u8; 32]),
        });
        chunk
    }

    fn table(keys: &[HostKey]) -> Vec<HostKeyEntry> {
        keys.iter()
            .map(|k| HostKeyEntry {
                key: k.clone(),
                used: true,
            })
            .collect()
    }

    #[test]
    fn test_single_online_host() {
        let host = HostKey::ed25519(&[1u8; 32]);
        let erasure = ErasureParams::new(1, 10).unwrap();
        let chunks = vec![single_piece_chunk(0, 10)];
        let offline: HashMap<HostKey, bool> = [(host.clone(), false)].into();
        let gfr: HashMap<HostKey, bool> = [(host.clone(), true)].into();

        let info = file_health(&chunks, &table(&[host]), &erasure, &offline, &gfr);
        assert_eq!(info.health, 0.0);
        assert_eq!(info.redundancy, 1.0);
        assert_eq!(info.user_redundancy, 1.0);
        assert_eq!(info.num_stuck_chunks, 0);
    }

    #[test]
    fn test_offline_host_means_unhealthy() {
        let host = HostKey::ed25519(&[1u8; 32]);
        let erasure = ErasureParams::new(1, 10).unwrap();
        let chunks = vec![single_piece_chunk(0, 10)];
        let offline: HashMap<HostKey, bool> = [(host.clone(), true)].into();
        let gfr: HashMap<HostKey, bool> = HashMap::new();

        let info = file_health(&chunks, &table(&[host]), &erasure, &offline, &gfr);
        assert_eq!(info.health, 1.0);
        assert_eq!(info.redundancy, 0.0);
    }

    #[test]
    fn test_same_host_counts_once() {
        let host = HostKey::ed25519(&[1u8; 32]);
        let erasure = ErasureParams::new(2, 4).unwrap();
        let mut chunk = Chunk::new(4);
        chunk.pieces[0].push(Piece {
            host_offset: 0,
            merkle_root: Hash256([1u8; 32]),
        });
        chunk.pieces[1].push(Piece {
            host_offset: 0,
            merkle_root: Hash256([2u8; 32]),
        });
        let offline: HashMap<HostKey, bool> = [(host.clone(), false)].into();

        let info = file_health(
            &[chunk],
            &table(&[host]),
            &erasure,
            &offline,
            &HashMap::new(),
        );
        // One distinct host out of two needed.
        assert_eq!(info.health, 0.5);
        assert_eq!(info.redundancy, 0.5);
    }

    #[test]
    fn test_stuck_chunks_tracked_separately() {
        let host = HostKey::ed25519(&[1u8; 32]);
        let erasure = ErasureParams::new(1, 2).unwrap();
        let mut stuck = single_piece_chunk(0, 2);
        stuck.stuck = true;
        let healthy = single_piece_chunk(0, 2);
        let offline: HashMap<HostKey, bool> = [(host.clone(), true)].into();

        let info = file_health(
            &[stuck, healthy],
            &table(&[host]),
            &erasure,
            &offline,
            &HashMap::new(),
        );
        assert_eq!(info.num_stuck_chunks, 1);
        assert_eq!(info.stuck_health, 1.0);
        assert_eq!(info.health, 1.0);
    }

    #[test]
    fn test_unknown_host_offset_is_tolerated() {
        let erasure = ErasureParams::new(1, 2).unwrap();
        let chunks = vec![single_piece_chunk(7, 2)];
        let info = file_health(&chunks, &[], &erasure, &HashMap::new(), &HashMap::new());
        assert_eq!(info.health, 1.0);
    }

    #[test]
    fn test_no_chunks_is_no_data_sentinel() {
        let erasure = ErasureParams::new(1, 2).unwrap();
        let info = file_health(&[], &[], &erasure, &HashMap::new(), &HashMap::new());
        assert_eq!(info.redundancy, -1.0);
        assert_eq!(info.health, 0.0);
    }
}
