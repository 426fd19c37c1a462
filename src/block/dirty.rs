//! The dirty-block state machine: the unit of work the read and write paths
//! hand to the disk cache and, eventually, to replication.
//!
//! A block moves `empty -> ram-only -> flushing -> on-disk -> mmaped`, with
//! `evict-and-free` collapsing any state back to `empty`. Three flags ride
//! alongside the state: `dirty` (RAM content not yet durable), `unshared`
//! (this block owns its buffer outright and may free it), and `mmaped`.
//!
//! The `unshared` flag describes a buffer that may alias a caller's
//! stack-allocated I/O buffer until `unshare-buffer` privatizes it. Safe
//! Rust has no sound way for an `Inode`-owned `DirtyBlock` to outlive the
//! stack frame of the read/write call that handed it a slice, so the
//! zero-copy case here is modeled with `Arc<[u8]>` instead of a raw alias:
//! both the caller and the block share ownership, and `unshared` tracks
//! whether this block is still one of several owners (`false`) or has
//! privatized its own copy (`true`). `unshare_buffer` is then a real copy
//! when shared, and a cheap no-op otherwise, without a dangling-pointer risk.

use std::sync::Arc;

use crate::cache::{CacheFile, CacheKey, DiskCache, FlushHandle};
use crate::error::{GatewayError, Result};
use crate::ids::{BlockId, BlockVersion};

#[cfg(unix)]
mod mmap_unix {
    use crate::cache::CacheFile;
    use crate::error::{GatewayError, Result};
    use std::os::unix::io::AsRawFd;

    #[derive(Debug)]
    pub struct MmapRegion {
        ptr: *mut libc::c_void,
        len: usize,
    }

    // The mapping is privately-owned (MAP_PRIVATE, copy-on-write) and only
    // ever touched through `&[u8]`/`&mut [u8]` borrows of this struct, so it
    // is safe to move between threads along with the rest of `DirtyBlock`.
    unsafe impl Send for MmapRegion {}
    unsafe impl Sync for MmapRegion {}

    impl MmapRegion {
        pub fn map(file: &CacheFile) -> Result<Self> {
            let len = file.len() as usize;
            if len == 0 {
                return Err(GatewayError::InvalidArgument("cannot mmap an empty cache file".into()));
            }
            // SAFETY: `file.file` stays open for at least as long as the
            // returned region (the caller keeps the `CacheFile` alive
            // alongside the mapping), `fd` is a valid open file descriptor,
            // and the mapping length matches the file's known length.
            let ptr = unsafe {
                libc::mmap(
                    std::ptr::null_mut(),
                    len,
                    libc::PROT_READ | libc::PROT_WRITE,
                    libc::MAP_PRIVATE,
                    file.file.as_raw_fd(),
                    0,
                )
            };
            if ptr == libc::MAP_FAILED {
                return Err(GatewayError::LocalIo(std::io::Error::last_os_error()));
            }
            Ok(MmapRegion { ptr, len })
        }

        pub fn as_slice(&self) -> &[u8] {
            // SAFETY: `ptr` was returned by a successful `mmap` of `len`
            // bytes and is unmapped only in `Drop`.
            unsafe { std::slice::from_raw_parts(self.ptr as *const u8, self.len) }
        }

        pub fn as_mut_slice(&mut self) -> &mut [u8] {
            // SAFETY: see `as_slice`; `&mut self` gives exclusive access.
            unsafe { std::slice::from_raw_parts_mut(self.ptr as *mut u8, self.len) }
        }
    }

    impl Drop for MmapRegion {
        fn drop(&mut self) {
            // SAFETY: `ptr`/`len` are exactly the pair returned by `mmap`.
            unsafe {
                libc::munmap(self.ptr, self.len);
            }
        }
    }
}

#[cfg(unix)]
use mmap_unix::MmapRegion;

#[cfg(not(unix))]
#[derive(Debug)]
struct MmapRegion;

#[cfg(not(unix))]
impl MmapRegion {
    fn map(_file: &CacheFile) -> Result<Self> {
        Err(GatewayError::Unsupported("mmap is only implemented for unix targets"))
    }
    fn as_slice(&self) -> &[u8] {
        &[]
    }
    fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut []
    }
}

/// Where a block's content currently lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockState {
    /// No content loaded; the block exists only as an identity.
    Empty,
    /// Content lives in RAM (`buffer` is populated).
    RamOnly,
    /// A flush to the disk cache is in flight; no fd is held yet.
    Flushing,
    /// Content is durable in the disk cache; `cache_file` is populated.
    OnDisk,
    /// The disk cache file is mapped into the address space.
    Mmaped,
}

/// The mutable flags that ride alongside `BlockState`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BlockFlags {
    /// RAM content is newer than what the disk cache (or remote RG) holds.
    pub dirty: bool,
    /// This block owns its buffer outright and may free it.
    pub unshared: bool,
    /// The disk cache file is currently mapped.
    pub mmaped: bool,
}

enum Buf {
    Owned(Vec<u8>),
    Shared(Arc<[u8]>),
}

impl Buf {
    fn as_slice(&self) -> &[u8] {
        match self {
            Buf::Owned(v) => v.as_slice(),
            Buf::Shared(a) => a.as_ref(),
        }
    }
}

/// One block's worth of pending or cached I/O state.
pub struct DirtyBlock {
    pub block_id: BlockId,
    pub version: BlockVersion,
    state: BlockState,
    flags: BlockFlags,
    buffer: Option<Buf>,
    cache_file: Option<CacheFile>,
    mmap: Option<MmapRegion>,
    flush: Option<FlushHandle>,
}

impl std::fmt::Debug for DirtyBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirtyBlock")
            .field("block_id", &self.block_id)
            .field("version", &self.version)
            .field("state", &self.state)
            .field("flags", &self.flags)
            .finish()
    }
}

impl DirtyBlock {
    fn new(block_id: BlockId, version: BlockVersion) -> Self {
        DirtyBlock {
            block_id,
            version,
            state: BlockState::Empty,
            flags: BlockFlags::default(),
            buffer: None,
            cache_file: None,
            mmap: None,
            flush: None,
        }
    }

    /// `init-ram(copy)`: copies `data` into a privately-owned buffer.
    pub fn init_ram_copy(block_id: BlockId, version: BlockVersion, data: &[u8]) -> Self {
        let mut b = Self::new(block_id, version);
        b.buffer = Some(Buf::Owned(data.to_vec()));
        b.state = BlockState::RamOnly;
        b.flags.dirty = true;
        b.flags.unshared = true;
        b
    }

    /// `init-ram(take ownership)`: adopts an already uniquely-owned buffer.
    pub fn init_ram_owned(block_id: BlockId, version: BlockVersion, data: Vec<u8>) -> Self {
        let mut b = Self::new(block_id, version);
        b.buffer = Some(Buf::Owned(data));
        b.state = BlockState::RamOnly;
        b.flags.dirty = true;
        b.flags.unshared = true;
        b
    }

    /// Zero-copy construction from a buffer shared with the caller (e.g. a
    /// receive buffer handed to the read path). `unshared`
    /// starts `false`; call [`unshare_buffer`](Self::unshare_buffer) before
    /// retaining the block past the call that produced `data`.
    pub fn init_ram_shared(block_id: BlockId, version: BlockVersion, data: Arc<[u8]>) -> Self {
        let mut b = Self::new(block_id, version);
        b.buffer = Some(Buf::Shared(data));
        b.state = BlockState::RamOnly;
        b.flags.dirty = true;
        b.flags.unshared = false;
        b
    }

    /// `init-fd(descriptor)`: adopts an already-durable cache file; clean by
    /// construction (nothing newer is sitting in RAM).
    pub fn init_fd(block_id: BlockId, version: BlockVersion, cache_file: CacheFile) -> Self {
        let mut b = Self::new(block_id, version);
        b.cache_file = Some(cache_file);
        b.state = BlockState::OnDisk;
        b.flags.dirty = false;
        b.flags.unshared = true;
        b
    }

    /// `deep-copy`: an independent block with its own buffer and, if on disk,
    /// its own duplicated file descriptor. Never copies a live mapping —
    /// the copy is handed the on-disk state instead and may `mmap` itself.
    pub fn deep_copy(&self) -> Result<Self> {
        let mut b = Self::new(self.block_id, self.version);
        b.flags = self.flags;
        b.flags.unshared = true;
        match &self.buffer {
            Some(buf) => b.buffer = Some(Buf::Owned(buf.as_slice().to_vec())),
            None => {}
        }
        if let Some(cf) = &self.cache_file {
            b.cache_file = Some(cf.try_clone()?);
        }
        b.state = match self.state {
            BlockState::Mmaped => BlockState::OnDisk,
            other => other,
        };
        b.flags.mmaped = false;
        Ok(b)
    }

    /// `load-from-cache`: reads a block from the disk cache into RAM. The
    /// result is clean (RAM content matches what the cache held).
    pub fn load_from_cache(cache: &dyn DiskCache, key: CacheKey) -> Result<Self> {
        let data = cache.load(&key)?;
        let mut b = Self::new(key.block_id, key.block_version);
        b.buffer = Some(Buf::Owned(data));
        b.state = BlockState::RamOnly;
        b.flags.dirty = false;
        b.flags.unshared = true;
        Ok(b)
    }

    pub fn state(&self) -> BlockState {
        self.state
    }

    pub fn flags(&self) -> BlockFlags {
        self.flags
    }

    /// The block's content, from wherever it currently lives.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self.state {
            BlockState::Mmaped => self.mmap.as_ref().map(|m| m.as_slice()),
            _ => self.buffer.as_ref().map(|b| b.as_slice()),
        }
    }

    /// `flush-async`: begins writing a dirty RAM block to the disk cache and
    /// attaches the returned future. Idempotent: a no-op if the block is
    /// already flushing, already on disk, or not dirty.
    pub fn flush_async(&mut self, cache: &dyn DiskCache, key: CacheKey) -> Result<()> {
        match self.state {
            BlockState::Flushing | BlockState::OnDisk | BlockState::Mmaped => return Ok(()),
            BlockState::Empty => {
                return Err(GatewayError::InvalidArgument(
                    "flush-async called on an empty block".into(),
                ))
            }
            BlockState::RamOnly => {}
        }
        if !self.flags.dirty {
            return Ok(());
        }
        let data: Arc<[u8]> = match self.buffer.take() {
            Some(Buf::Shared(a)) => a,
            Some(Buf::Owned(v)) => Arc::from(v),
            None => {
                return Err(GatewayError::InvalidArgument(
                    "flush-async called on a block with no buffer".into(),
                ))
            }
        };
        self.buffer = Some(Buf::Shared(Arc::clone(&data)));
        self.flush = Some(cache.begin_flush(key, data));
        self.state = BlockState::Flushing;
        Ok(())
    }

    /// `flush-finish`: waits for a flush started by `flush_async`, opens the
    /// resulting cache file, and (optionally) frees the RAM buffer. Fails
    /// with `invalid-argument` if called while dirty but no flush was ever
    /// started.
    pub fn flush_finish(&mut self, cache: &dyn DiskCache, key: CacheKey, free_ram: bool) -> Result<()> {
        match self.state {
            BlockState::OnDisk | BlockState::Mmaped => return Ok(()),
            BlockState::RamOnly if !self.flags.dirty => return Ok(()),
            BlockState::RamOnly => {
                return Err(GatewayError::InvalidArgument(
                    "flush-finish called on a dirty block with no flush in progress".into(),
                ))
            }
            BlockState::Empty => {
                return Err(GatewayError::InvalidArgument(
                    "flush-finish called on an empty block".into(),
                ))
            }
            BlockState::Flushing => {}
        }
        let handle = self.flush.take().ok_or_else(|| {
            GatewayError::InvalidArgument("flush-finish called with no flush handle".into())
        })?;
        handle.join()?;
        self.cache_file = Some(cache.open(&key)?);
        self.state = BlockState::OnDisk;
        self.flags.dirty = false;
        if free_ram {
            self.buffer = None;
        }
        Ok(())
    }

    /// `mmap`: maps the disk cache file into the address space. A no-op if
    /// already mapped; requires `on-disk` state otherwise.
    pub fn mmap(&mut self) -> Result<()> {
        if self.state == BlockState::Mmaped {
            return Ok(());
        }
        let cache_file = self
            .cache_file
            .as_ref()
            .ok_or_else(|| GatewayError::InvalidArgument("mmap requires an on-disk block".into()))?;
        if self.state != BlockState::OnDisk {
            return Err(GatewayError::InvalidArgument("mmap requires an on-disk block".into()));
        }
        self.mmap = Some(MmapRegion::map(cache_file)?);
        self.state = BlockState::Mmaped;
        self.flags.mmaped = true;
        Ok(())
    }

    /// `munmap`: releases the mapping, returning to `on-disk`. A no-op if
    /// not currently mapped.
    pub fn munmap(&mut self) -> Result<()> {
        if self.state != BlockState::Mmaped {
            return Ok(());
        }
        self.mmap = None;
        self.state = BlockState::OnDisk;
        self.flags.mmaped = false;
        Ok(())
    }

    /// `unshare-buffer`: privatizes a shared RAM buffer so this block may
    /// outlive whatever else shares it. A no-op if already unshared.
    pub fn unshare_buffer(&mut self) {
        if self.flags.unshared {
            return;
        }
        if let Some(Buf::Shared(arc)) = &self.buffer {
            self.buffer = Some(Buf::Owned(arc.as_ref().to_vec()));
        }
        self.flags.unshared = true;
    }

    /// `evict-and-free`: releases any mapping, drops the cached file, and
    /// removes the block from the disk cache, returning to `empty`.
    pub fn evict_and_free(&mut self, cache: &dyn DiskCache, key: CacheKey) -> Result<()> {
        self.munmap()?;
        self.buffer = None;
        self.cache_file = None;
        self.flush = None;
        cache.evict(&key)?;
        self.state = BlockState::Empty;
        self.flags = BlockFlags::default();
        Ok(())
    }

    pub fn mark_dirty(&mut self) {
        self.flags.dirty = true;
    }

    /// Clears the dirty flag without touching state — used to install a
    /// read-ahead hint, which mirrors existing content rather than
    /// representing an unreplicated write.
    pub fn mark_clean(&mut self) {
        self.flags.dirty = false;
    }
}
