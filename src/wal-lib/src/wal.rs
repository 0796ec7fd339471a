use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt, SeekFrom};
use tokio::sync::Mutex;

use crate::{Update, WalError, WalResult};

// One record per line. Commit is the durability point: a transaction whose
// commit record hit the disk must be applied, either by the caller or by
// replay after a restart.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
enum WalRecord {
    Commit { txn: u64, updates: Vec<Update> },
    Release { txn: u64 },
}

struct WalInner {
    file: File,
    // Committed but not yet released transaction ids.
    live: std::collections::HashSet<u64>,
    next_id: u64,
}

/// Append-only write-ahead log. Updates are grouped into transactions that
/// move through created -> setup-complete -> applied -> released. Once
/// `setup_complete` returns, the transaction is committed: the updates will
/// reach the live data either through the caller or through replay.
pub struct Wal {
    path: PathBuf,
    inner: Mutex<WalInner>,
}

/// A transaction that was committed before a crash and still needs its
/// updates applied. Returned in commit order by [`Wal::open`].
pub struct RecoveredTxn {
    wal: Arc<Wal>,
    id: u64,
    pub updates: Vec<Update>,
}

impl RecoveredTxn {
    /// Signals that the updates of this recovered transaction have been
    /// applied to the live data.
    pub async fn release(self) -> WalResult<()> {
        self.wal.append_release(self.id).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TxnPhase {
    Created,
    SetupComplete,
}

/// An in-flight WAL transaction.
pub struct Transaction<'w> {
    wal: &'w Wal,
    id: u64,
    updates: Vec<Update>,
    phase: TxnPhase,
}

impl<'w> Transaction<'w> {
    pub fn updates(&self) -> &[Update] {
        &self.updates
    }

    /// Commits the transaction. After this returns Ok the caller is
    /// committed: a failure to apply the updates must escalate, the WAL
    /// will replay them on restart.
    pub async fn setup_complete(&mut self) -> WalResult<()> {
        if self.phase != TxnPhase::Created {
            return Err(WalError::Setup(format!(
                "transaction {} already set up",
                self.id
            )));
        }
        self.wal
            .append_record(&WalRecord::Commit {
                txn: self.id,
                updates: self.updates.clone(),
            })
            .await?;
        {
            let mut inner = self.wal.inner.lock().await;
            inner.live.insert(self.id);
        }
        self.phase = TxnPhase::SetupComplete;
        debug!("wal txn {} committed ({} updates)", self.id, self.updates.len());
        Ok(())
    }

    /// Signals that the updates have been applied to the live data and
    /// releases the transaction.
    pub async fn updates_applied(self) -> WalResult<()> {
        if self.phase != TxnPhase::SetupComplete {
            return Err(WalError::Apply(format!(
                "transaction {} released before setup completed",
                self.id
            )));
        }
        self.wal.append_release(self.id).await
    }
}

impl Wal {
    /// Opens the log at `path`, creating it if absent. Transactions that
    /// were committed but never released are returned in commit order; the
    /// caller must apply and release each of them before serving traffic.
    pub async fn open(path: impl AsRef<Path>) -> WalResult<(Arc<Wal>, Vec<RecoveredTxn>)> {
        let path = path.as_ref().to_path_buf();
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(WalError::Io(format!("read {}: {}", path.display(), e))),
        };

        let mut committed: BTreeMap<u64, Vec<Update>> = BTreeMap::new();
        let mut max_id = 0u64;
        let lines: Vec<&str> = content.lines().collect();
        for (i, line) in lines.iter().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let record: WalRecord = match serde_json::from_str(line) {
                Ok(r) => r,
                Err(e) => {
                    // A torn final record is the expected shape of a crash
                    // mid-append and is dropped. Anything earlier means the
                    // log itself is damaged.
                    if i + 1 == lines.len() {
                        warn!("wal: dropping torn trailing record: {}", e);
                        break;
                    }
                    return Err(WalError::Corrupt(format!(
                        "record {} of {}: {}",
                        i,
                        path.display(),
                        e
                    )));
                }
            };
            match record {
                WalRecord::Commit { txn, updates } => {
                    max_id = max_id.max(txn);
                    committed.insert(txn, updates);
                }
                WalRecord::Release { txn } => {
                    max_id = max_id.max(txn);
                    committed.remove(&txn);
                }
            }
        }

        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&path)
            .await
            .map_err(|e| WalError::Io(format!("open {}: {}", path.display(), e)))?;

        // With nothing left to replay the old records are dead weight.
        if committed.is_empty() {
            file.set_len(0).await?;
            file.seek(SeekFrom::Start(0)).await?;
            max_id = 0;
        } else {
            file.seek(SeekFrom::End(0)).await?;
        }

        let live: std::collections::HashSet<u64> = committed.keys().copied().collect();
        let wal = Arc::new(Wal {
            path,
            inner: Mutex::new(WalInner {
                file,
                live,
                next_id: max_id + 1,
            }),
        });

        let recovered = committed
            .into_iter()
            .map(|(id, updates)| RecoveredTxn {
                wal: wal.clone(),
                id,
                updates,
            })
            .collect::<Vec<_>>();
        if !recovered.is_empty() {
            debug!(
                "wal: {} unreleased transaction(s) to replay",
                recovered.len()
            );
        }
        Ok((wal, recovered))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Starts a new transaction over `updates`. The transaction is not
    /// durable until `setup_complete` returns.
    pub async fn new_transaction(&self, updates: Vec<Update>) -> WalResult<Transaction<'_>> {
        if updates.is_empty() {
            return Err(WalError::Setup("transaction without updates".to_string()));
        }
        let id = {
            let mut inner = self.inner.lock().await;
            let id = inner.next_id;
            inner.next_id += 1;
            id
        };
        Ok(Transaction {
            wal: self,
            id,
            updates,
            phase: TxnPhase::Created,
        })
    }

    async fn append_record(&self, record: &WalRecord) -> WalResult<()> {
        let mut line = serde_json::to_string(record)
            .map_err(|e| WalError::Setup(format!("encode record: {}", e)))?;
        line.push('\n');
        let mut inner = self.inner.lock().await;
        inner.file.write_all(line.as_bytes()).await?;
        inner.file.sync_all().await?;
        Ok(())
    }

    async fn append_release(&self, id: u64) -> WalResult<()> {
        let line = {
            let mut s = serde_json::to_string(&WalRecord::Release { txn: id })
                .map_err(|e| WalError::Apply(format!("encode release: {}", e)))?;
            s.push('\n');
            s
        };
        let mut inner = self.inner.lock().await;
        inner.file.write_all(line.as_bytes()).await?;
        inner.file.sync_all().await?;
        inner.live.remove(&id);
        // Opportunistic truncation keeps the log from growing without bound.
        if inner.live.is_empty() {
            inner.file.set_len(0).await?;
            inner.file.seek(SeekFrom::Start(0)).await?;
            inner.next_id = 1;
        }
        debug!("wal txn {} released", id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{UPDATE_DIR_METADATA, UPDATE_FILE_INSERT};

    fn insert_update(offset: u64) -> Update {
        Update::new(
            UPDATE_FILE_INSERT,
            serde_json::to_vec(&serde_json::json!({
                "path": "/tmp/f.rfile",
                "offset": offset,
                "bytes": "00ff"
            }))
            .unwrap(),
        )
    }

    #[tokio::test]
    async fn test_commit_release_truncates() {
        let dir = tempfile::tempdir().unwrap();
        let wal_path = dir.path().join("test.wal");
        let (wal, recovered) = Wal::open(&wal_path).await.unwrap();
        assert!(recovered.is_empty());

        let mut txn = wal
            .new_transaction(vec![insert_update(0), insert_update(4096)])
            .await
            .unwrap();
        txn.setup_complete().await.unwrap();
        assert!(tokio::fs::metadata(&wal_path).await.unwrap().len() > 0);
        txn.updates_applied().await.unwrap();

        // All transactions released, the log is truncated.
        assert_eq!(tokio::fs::metadata(&wal_path).await.unwrap().len(), 0);
    }

    #[tokio::test]
    async fn test_unreleased_txn_is_recovered_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let wal_path = dir.path().join("test.wal");
        {
            let (wal, _) = Wal::open(&wal_path).await.unwrap();
            let mut t1 = wal.new_transaction(vec![insert_update(0)]).await.unwrap();
            t1.setup_complete().await.unwrap();
            let mut t2 = wal
                .new_transaction(vec![Update::new(UPDATE_DIR_METADATA, b"{}".to_vec())])
                .await
                .unwrap();
            t2.setup_complete().await.unwrap();
            // Simulated crash: neither transaction is released.
        }

        let (_wal, recovered) = Wal::open(&wal_path).await.unwrap();
        assert_eq!(recovered.len(), 2);
        assert_eq!(recovered[0].updates[0].name, UPDATE_FILE_INSERT);
        assert_eq!(recovered[1].updates[0].name, UPDATE_DIR_METADATA);
        for txn in recovered {
            txn.release().await.unwrap();
        }

        let (_wal, recovered) = Wal::open(&wal_path).await.unwrap();
        assert!(recovered.is_empty());
    }

    #[tokio::test]
    async fn test_replay_is_idempotent_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let wal_path = dir.path().join("test.wal");
        {
            let (wal, _) = Wal::open(&wal_path).await.unwrap();
            let mut txn = wal.new_transaction(vec![insert_update(8)]).await.unwrap();
            txn.setup_complete().await.unwrap();
        }
        // Opening twice without releasing returns the same transaction both
        // times.
        {
            let (_wal, recovered) = Wal::open(&wal_path).await.unwrap();
            assert_eq!(recovered.len(), 1);
        }
        let (_wal, recovered) = Wal::open(&wal_path).await.unwrap();
        assert_eq!(recovered.len(), 1);
        assert_eq!(recovered[0].updates.len(), 1);
    }

    #[tokio::test]
    async fn test_torn_trailing_record_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let wal_path = dir.path().join("test.wal");
        {
            let (wal, _) = Wal::open(&wal_path).await.unwrap();
            let mut txn = wal.new_transaction(vec![insert_update(0)]).await.unwrap();
            txn.setup_complete().await.unwrap();
        }
        // Append half a record, as a crash mid-write would.
        let mut content = tokio::fs::read_to_string(&wal_path).await.unwrap();
        content.push_str("{\"op\":\"commit\",\"txn\":9,\"upd");
        tokio::fs::write(&wal_path, &content).await.unwrap();

        let (_wal, recovered) = Wal::open(&wal_path).await.unwrap();
        assert_eq!(recovered.len(), 1);
    }

    #[tokio::test]
    async fn test_corrupt_middle_record_fails() {
        let dir = tempfile::tempdir().unwrap();
        let wal_path = dir.path().join("test.wal");
        tokio::fs::write(
            &wal_path,
            "garbage\n{\"op\":\"release\",\"txn\":1}\n",
        )
        .await
        .unwrap();
        match Wal::open(&wal_path).await {
            Err(WalError::Corrupt(_)) => {}
            other => panic!("expected corrupt error, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn test_release_before_setup_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (wal, _) = Wal::open(dir.path().join("test.wal")).await.unwrap();
        let txn = wal.new_transaction(vec![insert_update(0)]).await.unwrap();
        assert!(matches!(
            txn.updates_applied().await,
            Err(WalError::Apply(_))
        ));
    }
}
