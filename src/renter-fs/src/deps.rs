use async_trait::async_trait;
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::io::{AsyncSeekExt, AsyncWriteExt, SeekFrom};

/// Result of a `stat` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStat {
    pub is_dir: bool,
    pub len: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntryInfo {
    pub name: String,
    pub is_dir: bool,
}

/// The filesystem capabilities the core consumes. Everything that touches
/// the disk goes through this trait so tests can inject faults.
#[async_trait]
pub trait FsDeps: Send + Sync {
    /// Opens a file for reading.
    async fn open(&self, path: &Path) -> io::Result<tokio::fs::File>;
    async fn read_all(&self, path: &Path) -> io::Result<Vec<u8>>;
    async fn write_all(&self, path: &Path, data: &[u8]) -> io::Result<()>;
    /// Writes `data` at `offset`, creating the file and extending it as
    /// needed. Durable when it returns.
    async fn write_at(&self, path: &Path, offset: u64, data: &[u8]) -> io::Result<()>;
    async fn stat(&self, path: &Path) -> io::Result<FileStat>;
    async fn rename(&self, from: &Path, to: &Path) -> io::Result<()>;
    async fn remove(&self, path: &Path) -> io::Result<()>;
    /// Removes a directory; fails unless it is empty.
    async fn remove_dir(&self, path: &Path) -> io::Result<()>;
    async fn read_dir(&self, path: &Path) -> io::Result<Vec<DirEntryInfo>>;
    async fn create_dir_all(&self, path: &Path) -> io::Result<()>;
}

/// Production implementation over tokio's fs.
pub struct DiskFs;

#[async_trait]
impl FsDeps for DiskFs {
    async fn open(&self, path: &Path) -> io::Result<tokio::fs::File> {
        tokio::fs::File::open(path).await
    }

    async fn read_all(&self, path: &Path) -> io::Result<Vec<u8>> {
        tokio::fs::read(path).await
    }

    async fn write_all(&self, path: &Path, data: &[u8]) -> io::Result<()> {
        let mut file = tokio::fs::File::create(path).await?;
        file.write_all(data).await?;
        file.sync_all().await
    }

    async fn write_at(&self, path: &Path, offset: u64, data: &[u8]) -> io::Result<()> {
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .open(path)
            .await?;
        file.seek(SeekFrom::Start(offset)).await?;
        file.write_all(data).await?;
        file.sync_all().await
    }

    async fn stat(&self, path: &Path) -> io::Result<FileStat> {
        let md = tokio::fs::metadata(path).await?;
        Ok(FileStat {
            is_dir: md.is_dir(),
            len: md.len(),
        })
    }

    async fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        tokio::fs::rename(from, to).await
    }

    async fn remove(&self, path: &Path) -> io::Result<()> {
        tokio::fs::remove_file(path).await
    }

    async fn remove_dir(&self, path: &Path) -> io::Result<()> {
        tokio::fs::remove_dir(path).await
    }

    async fn read_dir(&self, path: &Path) -> io::Result<Vec<DirEntryInfo>> {
        let mut entries = Vec::new();
        let mut rd = tokio::fs::read_dir(path).await?;
        while let Some(entry) = rd.next_entry().await? {
            let file_type = entry.file_type().await?;
            entries.push(DirEntryInfo {
                name: entry.file_name().to_string_lossy().to_string(),
                is_dir: file_type.is_dir(),
            });
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    async fn create_dir_all(&self, path: &Path) -> io::Result<()> {
        tokio::fs::create_dir_all(path).await
    }
}

/// A fault-injecting wrapper around [`DiskFs`]. While enabled, every write
/// decrements a budget; once the budget is spent all writes fail with a
/// recognizable error. Reads are never failed so recovery paths stay
/// exercisable.
pub struct FaultyFs {
    disk: DiskFs,
    enabled: AtomicBool,
    writes_left: AtomicU64,
}

pub const FAULTY_FS_ERROR: &str = "simulated disk fault";

impl FaultyFs {
    pub fn new(write_budget: u64) -> Self {
        Self {
            disk: DiskFs,
            enabled: AtomicBool::new(false),
            writes_left: AtomicU64::new(write_budget),
        }
    }

    pub fn enable(&self) {
        self.enabled.store(true, Ordering::SeqCst);
    }

    pub fn disable(&self) {
        self.enabled.store(false, Ordering::SeqCst);
    }

    pub fn reset(&self, write_budget: u64) {
        self.writes_left.store(write_budget, Ordering::SeqCst);
    }

    fn check_write(&self) -> io::Result<()> {
        if !self.enabled.load(Ordering::SeqCst) {
            return Ok(());
        }
        loop {
            let left = self.writes_left.load(Ordering::SeqCst);
            if left == 0 {
                return Err(io::Error::new(io::ErrorKind::Other, FAULTY_FS_ERROR));
            }
            if self
                .writes_left
                .compare_exchange(left, left - 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return Ok(());
            }
        }
    }
}

/// Returns true if `err` was produced by [`FaultyFs`].
pub fn is_disk_fault(err: &io::Error) -> bool {
    err.to_string().contains(FAULTY_FS_ERROR)
}

#[async_trait]
impl FsDeps for FaultyFs {
    async fn open(&self, path: &Path) -> io::Result<tokio::fs::File> {
        self.disk.open(path).await
    }

    async fn read_all(&self, path: &Path) -> io::Result<Vec<u8>> {
        self.disk.read_all(path).await
    }

    async fn write_all(&self, path: &Path, data: &[u8]) -> io::Result<()> {
        self.check_write()?;
        self.disk.write_all(path, data).await
    }

    async fn write_at(&self, path: &Path, offset: u64, data: &[u8]) -> io::Result<()> {
        self.check_write()?;
        self.disk.write_at(path, offset, data).await
    }

    async fn stat(&self, path: &Path) -> io::Result<FileStat> {
        self.disk.stat(path).await
    }

    async fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        self.check_write()?;
        self.disk.rename(from, to).await
    }

    async fn remove(&self, path: &Path) -> io::Result<()> {
        self.check_write()?;
        self.disk.remove(path).await
    }

    async fn remove_dir(&self, path: &Path) -> io::Result<()> {
        self.check_write()?;
        self.disk.remove_dir(path).await
    }

    async fn read_dir(&self, path: &Path) -> io::Result<Vec<DirEntryInfo>> {
        self.disk.read_dir(path).await
    }

    async fn create_dir_all(&self, path: &Path) -> io::Result<()> {
        self.check_write()?;
        self.disk.create_dir_all(path).await
    }
}
