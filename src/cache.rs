//! The on-disk block cache (`md_cache_*`) is an external collaborator: the
//! core only needs the capability it exposes. This module defines that
//! capability as a trait plus a reference file-backed implementation used by
//! tests and by a standalone gateway binary; a real deployment may swap in
//! any implementation that honors the same readable/writable lookaside
//! contract: a block is unreadable while being flushed, and callers must
//! interpret "not readable" as a cache miss, not an error.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;

use crate::error::{GatewayError, Result};
use crate::ids::{BlockId, BlockVersion, FileId, FileVersion, VolumeId};

/// Identifies one block's slot in the disk cache: the block identity
/// 5-tuple minus the coordinator-scoped signature material.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub volume_id: VolumeId,
    pub file_id: FileId,
    pub file_version: FileVersion,
    pub block_id: BlockId,
    pub block_version: BlockVersion,
}

impl CacheKey {
    /// File ids hash-split into 4x16-bit dirs under
    /// `{data_root}/{volume_id}/{id[63:48]}/{id[47:32]}/{id[31:16]}/{id[15:0]}/...`.
    pub fn relative_path(&self) -> PathBuf {
        let id = self.file_id.0;
        PathBuf::from(format!("{}", self.volume_id.0))
            .join(format!("{:04x}", (id >> 48) & 0xffff))
            .join(format!("{:04x}", (id >> 32) & 0xffff))
            .join(format!("{:04x}", (id >> 16) & 0xffff))
            .join(format!("{:04x}", id & 0xffff))
            .join(format!(
                "{:016X}.{}.{}.{}",
                self.file_id.0, self.file_version.0, self.block_id.0, self.block_version.0
            ))
    }
}

/// A handle onto a cached block's on-disk representation. Dirty blocks hold
/// this instead of a RAM buffer once flushed.
#[derive(Debug)]
pub struct CacheFile {
    pub(crate) file: File,
    pub(crate) len: u64,
}

impl CacheFile {
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn read_all(&mut self) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(self.len as usize);
        self.file.seek(SeekFrom::Start(0))?;
        self.file.read_to_end(&mut buf)?;
        Ok(buf)
    }

    pub(crate) fn try_clone(&self) -> Result<CacheFile> {
        Ok(CacheFile {
            file: self.file.try_clone()?,
            len: self.len,
        })
    }
}

/// A pending flush; `flush_finish` blocks on it. Modeled as a plain
/// `JoinHandle` rather than an async executor, since the rest of the
/// gateway's concurrency model is synchronous threads too.
pub struct FlushHandle {
    handle: Option<thread::JoinHandle<Result<()>>>,
}

impl FlushHandle {
    pub fn spawn<F>(work: F) -> Self
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        FlushHandle {
            handle: Some(thread::spawn(work)),
        }
    }

    /// Blocks until the flush completes.
    pub fn join(mut self) -> Result<()> {
        match self.handle.take() {
            Some(h) => h
                .join()
                .unwrap_or_else(|_| Err(GatewayError::LocalIo(std::io::Error::other("flush thread panicked")))),
            None => Ok(()),
        }
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map(|h| h.is_finished()).unwrap_or(true)
    }
}

impl std::fmt::Debug for FlushHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlushHandle").finish()
    }
}

/// The on-disk block cache capability the core consumes (`md_cache_*`),
/// out of scope as an implementation but required as an interface.
pub trait DiskCache: Send + Sync {
    /// Reads a cached block fully into RAM. Returns `NotFound` on a cache miss;
    /// this must also be returned (never an I/O error) when the block is
    /// presently being written by a concurrent flush.
    fn load(&self, key: &CacheKey) -> Result<Vec<u8>>;

    /// Begins writing `data` to the cache asynchronously, returning a handle
    /// the caller awaits with `FlushHandle::join`.
    fn begin_flush(&self, key: CacheKey, data: Arc<[u8]>) -> FlushHandle;

    /// Opens a file descriptor onto an already-flushed block, for `mmap`.
    fn open(&self, key: &CacheKey) -> Result<CacheFile>;

    /// Removes a cached block and releases its resources.
    fn evict(&self, key: &CacheKey) -> Result<()>;
}

/// Reference file-backed implementation. The real cache lives outside this
/// crate in production, but this lets the core — and its tests — run
/// standalone.
pub struct FileDiskCache {
    root: PathBuf,
}

impl FileDiskCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        FileDiskCache { root: root.into() }
    }

    fn path_for(&self, key: &CacheKey) -> PathBuf {
        self.root.join(key.relative_path())
    }
}

impl DiskCache for FileDiskCache {
    fn load(&self, key: &CacheKey) -> Result<Vec<u8>> {
        let path = self.path_for(key);
        match fs::read(&path) {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(GatewayError::NotFound(format!("block {:?} not cached", key.block_id)))
            }
            Err(e) => Err(GatewayError::LocalIo(e)),
        }
    }

    fn begin_flush(&self, key: CacheKey, data: Arc<[u8]>) -> FlushHandle {
        let path = self.path_for(&key);
        FlushHandle::spawn(move || {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            let tmp_path = path.with_extension("tmp");
            {
                let mut f = OpenOptions::new()
                    .create(true)
                    .write(true)
                    .truncate(true)
                    .open(&tmp_path)?;
                f.write_all(&data)?;
                f.sync_data()?;
            }
            fs::rename(&tmp_path, &path)?;
            Ok(())
        })
    }

    fn open(&self, key: &CacheKey) -> Result<CacheFile> {
        let path = self.path_for(key);
        let file = OpenOptions::new().read(true).write(true).open(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                GatewayError::NotFound(format!("block {:?} not cached", key.block_id))
            } else {
                GatewayError::LocalIo(e)
            }
        })?;
        let len = file.metadata()?.len();
        Ok(CacheFile { file, len })
    }

    fn evict(&self, key: &CacheKey) -> Result<()> {
        let path = self.path_for(key);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(GatewayError::LocalIo(e)),
        }
    }
}

/// Convenience constructor used by tests: a cache rooted at a fresh tempdir.
#[cfg(any(test, feature = "test-support"))]
pub fn test_cache() -> (tempfile::TempDir, FileDiskCache) {
    let dir = tempfile::tempdir().expect("tempdir");
    let cache = FileDiskCache::new(dir.path());
    (dir, cache)
}

#[allow(unused)]
fn _assert_path(p: &Path) {
    let _ = p;
}
