//! Binary layout of the `.rfile` serialization: a page-aligned JSON header,
//! the host key table, then the fixed-stride chunk table.

use super::{Chunk, FileMeta, Hash256, HostKey, HostKeyEntry, Piece};
use crate::{FsError, FsResult};

/// Size of a physical page on disk.
pub const PAGE_SIZE: usize = 4096;

/// Minimum number of pages reserved for the header of a freshly created
/// file. Creation reserves more when the initial serialization needs
/// them; the reservation is fixed for the life of the file.
pub const DEFAULT_RESERVED_PAGES: u64 = 1;

pub const HASH_SIZE: usize = 32;

/// On-disk size of one piece: 4-byte piece index, 4-byte host table
/// offset, merkle root.
pub const MARSHALED_PIECE_SIZE: usize = 4 + 4 + HASH_SIZE;

/// On-disk size of a chunk record minus its pieces: 16-byte extension,
/// 2-byte piece count, 1-byte stuck flag.
pub const MARSHALED_CHUNK_OVERHEAD: usize = 16 + 2 + 1;

/// Stride of a chunk record for a file with `num_pieces` erasure pieces.
pub fn marshaled_chunk_size(num_pieces: usize) -> usize {
    MARSHALED_CHUNK_OVERHEAD + MARSHALED_PIECE_SIZE * num_pieces
}

/// Serializes the header: a 4-byte length prefix followed by the JSON
/// metadata. The caller pads the result into the reserved pages.
pub fn marshal_header(meta: &FileMeta) -> FsResult<Vec<u8>> {
    let json = serde_json::to_vec(meta)
        .map_err(|e| FsError::Internal(format!("encode header: {}", e)))?;
    let mut out = Vec::with_capacity(4 + json.len());
    out.extend_from_slice(&(json.len() as u32).to_le_bytes());
    out.extend_from_slice(&json);
    Ok(out)
}

pub fn unmarshal_header(buf: &[u8]) -> FsResult<FileMeta> {
    if buf.len() < 4 {
        return Err(FsError::Invalid("truncated header".to_string()));
    }
    let len = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    if buf.len() < 4 + len {
        return Err(FsError::Invalid(format!(
            "header length {} exceeds buffer {}",
            len,
            buf.len()
        )));
    }
    serde_json::from_slice(&buf[4..4 + len])
        .map_err(|e| FsError::Invalid(format!("decode header: {}", e)))
}

/// Serializes the host key table: a 4-byte entry count, then per entry a
/// used flag, a 2-byte key length and the key string.
pub fn marshal_host_table(entries: &[HostKeyEntry]) -> FsResult<Vec<u8>> {
    let mut out = Vec::new();
    out.extend_from_slice(&(entries.len() as u32).to_le_bytes());
    for entry in entries {
        let key = entry.key.as_str().as_bytes();
        if key.len() > u16::MAX as usize {
            return Err(FsError::Invalid(format!(
                "host key too long: {} bytes",
                key.len()
            )));
        }
        out.push(entry.used as u8);
        out.extend_from_slice(&(key.len() as u16).to_le_bytes());
        out.extend_from_slice(key);
    }
    Ok(out)
}

pub fn unmarshal_host_table(buf: &[u8]) -> FsResult<Vec<HostKeyEntry>> {
    if buf.len() < 4 {
        return Err(FsError::Invalid("truncated host table".to_string()));
    }
    let count = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    let mut entries = Vec::with_capacity(count);
    let mut off = 4usize;
    for _ in 0..count {
        if buf.len() < off + 3 {
            return Err(FsError::Invalid("truncated host table entry".to_string()));
        }
        let used = buf[off] != 0;
        let len = u16::from_le_bytes([buf[off + 1], buf[off + 2]]) as usize;
        off += 3;
        if buf.len() < off + len {
            return Err(FsError::Invalid("truncated host key".to_string()));
        }
        let raw = std::str::from_utf8(&buf[off..off + len])
            .map_err(|e| FsError::Invalid(format!("host key not utf-8: {}", e)))?;
        entries.push(HostKeyEntry {
            key: HostKey::new(raw)?,
            used,
        });
        off += len;
    }
    Ok(entries)
}

/// Serializes one chunk record into its fixed stride for a file with
/// `num_pieces` erasure pieces. Unused piece space is zero.
pub fn marshal_chunk(chunk: &Chunk, num_pieces: usize) -> FsResult<Vec<u8>> {
    if chunk.num_pieces() > num_pieces {
        return Err(FsError::Internal(format!(
            "chunk holds {} pieces, record fits {}",
            chunk.num_pieces(),
            num_pieces
        )));
    }
    let mut out = vec![0u8; marshaled_chunk_size(num_pieces)];
    out[..16].copy_from_slice(&chunk.extension);
    out[16..18].copy_from_slice(&(chunk.num_pieces() as u16).to_le_bytes());
    out[18] = chunk.stuck as u8;
    let mut off = MARSHALED_CHUNK_OVERHEAD;
    for (slot, pieces) in chunk.pieces.iter().enumerate() {
        for piece in pieces {
            out[off..off + 4].copy_from_slice(&(slot as u32).to_le_bytes());
            out[off + 4..off + 8].copy_from_slice(&piece.host_offset.to_le_bytes());
            out[off + 8..off + 8 + HASH_SIZE].copy_from_slice(&piece.merkle_root.0);
            off += MARSHALED_PIECE_SIZE;
        }
    }
    Ok(out)
}

pub fn unmarshal_chunk(buf: &[u8], num_pieces: usize) -> FsResult<Chunk> {
    if buf.len() < marshaled_chunk_size(num_pieces) {
        return Err(FsError::Invalid(format!(
            "chunk record too short: {} < {}",
            buf.len(),
            marshaled_chunk_size(num_pieces)
        )));
    }
    let mut extension = [0u8; 16];
    extension.copy_from_slice(&buf[..16]);
    let count = u16::from_le_bytes([buf[16], buf[17]]) as usize;
    if count > num_pieces {
        return Err(FsError::Invalid(format!(
            "chunk record claims {} pieces, limit {}",
            count, num_pieces
        )));
    }
    let stuck = buf[18] != 0;
    let mut pieces: Vec<Vec<Piece>> = vec![Vec::new(); num_pieces];
    let mut off = MARSHALED_CHUNK_OVERHEAD;
    for _ in 0..count {
        let slot = u32::from_le_bytes([buf[off], buf[off + 1], buf[off + 2], buf[off + 3]]) as usize;
        if slot >= num_pieces {
            return Err(FsError::Invalid(format!(
                "piece slot {} out of range {}",
                slot, num_pieces
            )));
        }
        let host_offset =
            u32::from_le_bytes([buf[off + 4], buf[off + 5], buf[off + 6], buf[off + 7]]);
        let mut root = [0u8; 32];
        root.copy_from_slice(&buf[off + 8..off + 8 + HASH_SIZE]);
        pieces[slot].push(Piece {
            host_offset,
            merkle_root: Hash256(root),
        });
        off += MARSHALED_PIECE_SIZE;
    }
    Ok(Chunk {
        extension,
        stuck,
        pieces,
    })
}

/// Number of pages needed to hold `len` bytes.
pub fn pages_for(len: usize) -> u64 {
    ((len + PAGE_SIZE - 1) / PAGE_SIZE) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_chunk(n: u32) -> Chunk {
        let mut chunk = Chunk::new(n);
        chunk.stuck = true;
        chunk.pieces[0].push(Piece {
            host_offset: 3,
            merkle_root: Hash256([7u8; 32]),
        });
        chunk.pieces[0].push(Piece {
            host_offset: 4,
            merkle_root: Hash256([9u8; 32]),
        });
        if n > 2 {
            chunk.pieces[2].push(Piece {
                host_offset: 0,
                merkle_root: Hash256([1u8; 32]),
            });
        }
        chunk
    }

    #[test]
    fn test_marshaled_sizes() {
        assert_eq!(MARSHALED_PIECE_SIZE, 40);
        assert_eq!(MARSHALED_CHUNK_OVERHEAD, 19);
        assert_eq!(marshaled_chunk_size(10), 19 + 400);
    }

    #[test]
    fn test_chunk_roundtrip() {
        let chunk = test_chunk(10);
        let buf = marshal_chunk(&chunk, 10).unwrap();
        assert_eq!(buf.len(), marshaled_chunk_size(10));
        let parsed = unmarshal_chunk(&buf, 10).unwrap();
        assert_eq!(parsed, chunk);
    }

    #[test]
    fn test_chunk_capacity_enforced() {
        let mut chunk = Chunk::new(2);
        for _ in 0..3 {
            chunk.pieces[1].push(Piece {
                host_offset: 0,
                merkle_root: Hash256::default(),
            });
        }
        assert!(marshal_chunk(&chunk, 2).is_err());
    }

    #[test]
    fn test_host_table_roundtrip() {
        let entries = vec![
            HostKeyEntry {
                key: HostKey::ed25519(&[1u8; 32]),
                used: true,
            },
            HostKeyEntry {
                key: HostKey::ed25519(&[2u8; 32]),
                used: false,
            },
        ];
        let buf = marshal_host_table(&entries).unwrap();
        let parsed = unmarshal_host_table(&buf).unwrap();
        assert_eq!(parsed, entries);
    }

    #[test]
    fn test_pages_for() {
        assert_eq!(pages_for(0), 0);
        assert_eq!(pages_for(1), 1);
        assert_eq!(pages_for(PAGE_SIZE), 1);
        assert_eq!(pages_for(PAGE_SIZE + 1), 2);
    }
}
