//! Per-open-file state: the manifest, the dirty-block set, freshness
//! bookkeeping, and the FIFO fsync queue. Everything that mutates a file —
//! read, write, replication, consistency — goes through one `Inode`, guarded
//! by the caller's lock: read operations hold the lock over metadata
//! inspection and release it across network I/O.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::block::DirtyBlock;
use crate::error::{GatewayError, Result};
use crate::ids::{BlockId, FileId, FileVersion, GatewayId, VolumeId, WriteNonce};
use crate::manifest::{Manifest, ManifestBlockEntry};
use crate::transport::MdEntry;
use crate::xattr::XattrStore;

/// A waiting fsync context in the per-inode FIFO queue
/// (`sync_queue_push`/`sync_queue_pop`). The payload is opaque to the inode;
/// replication attaches whatever it needs to resume a call.
pub struct SyncContext {
    pub tx_id: u64,
    pub notify: Arc<(std::sync::Mutex<bool>, std::sync::Condvar)>,
}

/// Flags carried by an inode.
#[derive(Debug, Clone, Copy, Default)]
pub struct InodeFlags {
    pub read_stale: bool,
    pub write_stale: bool,
    pub dirty: bool,
    pub vacuuming: bool,
    pub vacuumed: bool,
    pub renaming: bool,
    pub deleting: bool,
}

/// Per-open-file state.
pub struct Inode {
    pub file_id: FileId,
    pub volume_id: VolumeId,
    manifest: Manifest,
    /// MS-observed nonces.
    pub write_nonce: WriteNonce,
    pub generation: u64,
    /// Locally uncommitted nonce, bumped by every local write before it's
    /// reflected by the MS.
    pub local_write_nonce: WriteNonce,
    pub refresh_time: Instant,
    pub manifest_refresh_time: Instant,
    pub children_refresh_time: Instant,
    pub max_read_freshness_ms: u64,
    pub max_write_freshness_ms: u64,
    pub flags: InodeFlags,
    dirty_blocks: HashMap<BlockId, DirtyBlock>,
    /// Metadata-only record of blocks whose newer version has not yet been
    /// replicated, so the old version can be vacuumed.
    pub replaced_blocks: Manifest,
    /// Last successfully replicated manifest timestamp; the vacuum log cursor.
    pub old_manifest_modtime: crate::ids::ModTime,
    sync_queue: VecDeque<SyncContext>,
    pub xattrs: XattrStore,
}

impl Inode {
    /// `init-from-MS-entry`.
    pub fn init_from_ms_entry(entry: &MdEntry, manifest: Manifest, max_read_freshness_ms: u64, max_write_freshness_ms: u64) -> Self {
        let replaced_blocks = Manifest::new(manifest.volume_id, manifest.coordinator_id, manifest.file_id, manifest.file_version);
        Inode {
            file_id: entry.file_id,
            volume_id: manifest.volume_id,
            write_nonce: WriteNonce(entry.write_nonce),
            generation: 0,
            local_write_nonce: WriteNonce(entry.write_nonce),
            refresh_time: Instant::now(),
            manifest_refresh_time: Instant::now(),
            children_refresh_time: Instant::now(),
            max_read_freshness_ms,
            max_write_freshness_ms,
            flags: InodeFlags::default(),
            dirty_blocks: HashMap::new(),
            old_manifest_modtime: manifest.modtime,
            manifest,
            replaced_blocks,
            sync_queue: VecDeque::new(),
            xattrs: XattrStore::new(),
        }
    }

    /// `init-from-exported-manifest`.
    pub fn init_from_exported_manifest(manifest: Manifest, max_read_freshness_ms: u64, max_write_freshness_ms: u64) -> Self {
        let replaced_blocks = Manifest::new(manifest.volume_id, manifest.coordinator_id, manifest.file_id, manifest.file_version);
        Inode {
            file_id: manifest.file_id,
            volume_id: manifest.volume_id,
            write_nonce: WriteNonce::default(),
            generation: 0,
            local_write_nonce: WriteNonce::default(),
            refresh_time: Instant::now(),
            manifest_refresh_time: Instant::now(),
            children_refresh_time: Instant::now(),
            max_read_freshness_ms,
            max_write_freshness_ms,
            flags: InodeFlags::default(),
            dirty_blocks: HashMap::new(),
            old_manifest_modtime: manifest.modtime,
            manifest,
            replaced_blocks,
            sync_queue: VecDeque::new(),
            xattrs: XattrStore::new(),
        }
    }

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    /// Direct mutable access for callers that build up a manifest delta
    /// in place (the write path's block-entry and size updates).
    pub fn manifest_mut(&mut self) -> &mut Manifest {
        &mut self.manifest
    }

    /// Removes a block from the dirty set without any replaced-blocks
    /// bookkeeping; used when a remote patch-manifest supersedes it outright.
    pub fn drop_dirty_block(&mut self, id: BlockId) -> Option<DirtyBlock> {
        self.dirty_blocks.remove(&id)
    }

    pub fn coordinator_id(&self) -> GatewayId {
        self.manifest.coordinator_id
    }

    /// `export(parent_id, parent_name) -> md_entry`: the MS-shaped record
    /// describing the current inode state, including its exported manifest
    /// and (if present) the xattr hash.
    pub fn export(&mut self, _parent_id: FileId, _parent_name: &str) -> MdEntry {
        self.xattrs.install_builtin(
            crate::xattr::XATTR_CACHED_BLOCKS,
            self.dirty_blocks.len().to_string().into_bytes(),
        );
        self.xattrs
            .install_builtin(crate::xattr::XATTR_COORDINATOR, self.manifest.coordinator_id.0.to_string().into_bytes());
        let xattr_hash = if self.xattrs.is_empty() { None } else { Some(self.xattrs.hash()) };
        MdEntry {
            file_id: self.file_id,
            file_version: self.manifest.file_version,
            write_nonce: self.write_nonce.0,
            is_dir: false,
            size: self.manifest.size,
            coordinator_id: self.manifest.coordinator_id,
            modtime: self.manifest.modtime,
            manifest: self.manifest.clone(),
            xattr_hash,
        }
    }

    /// `manifest-replace(new_manifest)`: atomically swap the manifest; the
    /// old one is freed (dropped).
    pub fn manifest_replace(&mut self, new_manifest: Manifest) {
        self.manifest = new_manifest;
        self.manifest_refresh_time = Instant::now();
    }

    /// `manifest-merge-blocks(new_manifest)`: merge remotely-observed block
    /// metadata into the local manifest without destroying local dirty state.
    pub fn manifest_merge_blocks(&mut self, new_manifest: &Manifest) {
        self.manifest.merge_blocks_from(new_manifest);
        self.manifest_refresh_time = Instant::now();
    }

    /// `dirty-block-cache(block)`: install a block into the dirty set
    /// without the replaced-blocks bookkeeping `commit` performs.
    pub fn dirty_block_cache(&mut self, block: DirtyBlock) {
        if block.flags().dirty {
            self.flags.dirty = true;
        }
        self.dirty_blocks.insert(block.block_id, block);
    }

    /// `dirty-block-commit(block)`: install a block into the dirty set.
    /// If the id is already present and dirty, the previous version is
    /// dropped (it never reached an RG). If it is already present and
    /// corresponds to a block the MS has already recorded, move its
    /// manifest entry into `replaced_blocks` first (so vacuum can reclaim
    /// the old version once the new one replicates).
    pub fn dirty_block_commit(&mut self, block: DirtyBlock) {
        let id = block.block_id;
        if let Some(entry) = self.manifest.blocks.get(&id).copied() {
            if !entry.dirty {
                self.replaced_blocks.blocks.insert(id, entry);
            }
        }
        self.dirty_blocks.insert(id, block);
        self.flags.dirty = true;
    }

    pub fn dirty_block(&self, id: BlockId) -> Option<&DirtyBlock> {
        self.dirty_blocks.get(&id)
    }

    pub fn dirty_block_mut(&mut self, id: BlockId) -> Option<&mut DirtyBlock> {
        self.dirty_blocks.get_mut(&id)
    }

    pub fn dirty_block_ids(&self) -> Vec<BlockId> {
        self.dirty_blocks.keys().copied().collect()
    }

    /// `dirty-blocks-trim(preserve_set)`: flush all dirty blocks to cache
    /// except those named in `preserve_set`, releasing RAM. Flushes that hit
    /// `in-progress`/no-op states are treated as already handled.
    pub fn dirty_blocks_trim(
        &mut self,
        cache: &dyn crate::cache::DiskCache,
        key_for: impl Fn(BlockId) -> crate::cache::CacheKey,
        preserve_set: &[BlockId],
    ) -> Result<()> {
        for (id, block) in self.dirty_blocks.iter_mut() {
            if preserve_set.contains(id) {
                continue;
            }
            let key = key_for(*id);
            block.flush_async(cache, key)?;
            block.flush_finish(cache, key, true)?;
        }
        Ok(())
    }

    /// `dirty-blocks-extract-modified`: remove and return the dirty set;
    /// used by the sync serializer to snapshot for replication.
    pub fn dirty_blocks_extract_modified(&mut self) -> HashMap<BlockId, DirtyBlock> {
        std::mem::take(&mut self.dirty_blocks)
    }

    /// `dirty-blocks-return`: reinsert blocks into the dirty set after a
    /// failed replication, preserving anything written since the snapshot
    /// was taken.
    pub fn dirty_blocks_return(&mut self, snapshot: HashMap<BlockId, DirtyBlock>) {
        for (id, block) in snapshot {
            self.dirty_blocks.entry(id).or_insert(block);
        }
        if !self.dirty_blocks.is_empty() {
            self.flags.dirty = true;
        }
    }

    /// `truncate-find-removed(new_size) -> removed_manifest`: the set of
    /// block ids whose content is beyond `new_size` under the new length.
    pub fn truncate_find_removed(&self, new_size: u64, blocksize: u64) -> Manifest {
        let mut removed = Manifest::new(
            self.manifest.volume_id,
            self.manifest.coordinator_id,
            self.manifest.file_id,
            self.manifest.file_version,
        );
        let last_live_block = if new_size == 0 { None } else { Some(BlockId((new_size - 1) / blocksize)) };
        for (id, entry) in &self.manifest.blocks {
            let beyond = match last_live_block {
                None => true,
                Some(last) => id.0 > last.0,
            };
            if beyond {
                removed.blocks.insert(*id, *entry);
            }
        }
        removed
    }

    /// `truncate(new_size, new_version)`: update manifest size and
    /// regenerate file version.
    pub fn truncate(&mut self, new_size: u64, new_version: FileVersion) {
        self.manifest.size = new_size;
        self.manifest.file_version = new_version;
        self.manifest.modtime = crate::ids::ModTime::now();
    }

    /// `sync-queue-push(ctx)`.
    pub fn sync_queue_push(&mut self, ctx: SyncContext) {
        self.sync_queue.push_back(ctx);
    }

    /// `sync-queue-pop() -> ctx`. FIFO: returns the oldest waiting context.
    pub fn sync_queue_pop(&mut self) -> Option<SyncContext> {
        self.sync_queue.pop_front()
    }

    pub fn sync_queue_len(&self) -> usize {
        self.sync_queue.len()
    }

    /// `is_read_stale(now)`.
    pub fn is_read_stale(&self, now: Instant) -> bool {
        self.flags.read_stale
            || now.saturating_duration_since(self.refresh_time) > Duration::from_millis(self.max_read_freshness_ms)
    }

    /// `is_write_stale(now)`.
    pub fn is_write_stale(&self, now: Instant) -> bool {
        self.flags.write_stale
            || now.saturating_duration_since(self.refresh_time) > Duration::from_millis(self.max_write_freshness_ms)
    }

    pub fn is_manifest_stale(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.manifest_refresh_time) > Duration::from_millis(self.max_read_freshness_ms)
    }

    pub fn touch_refresh(&mut self) {
        self.refresh_time = Instant::now();
        self.flags.read_stale = false;
        self.flags.write_stale = false;
    }

    /// Bumps the local write nonce and modtime on a local write: a write
    /// inserts into `dirty_blocks`, bumps the local write nonce, and updates
    /// modtime.
    pub fn record_local_write(&mut self, am_coordinator: bool) {
        self.local_write_nonce = WriteNonce::random();
        if am_coordinator {
            self.manifest.modtime = crate::ids::ModTime::now();
        }
    }

    pub fn ensure_not_busy(&self) -> Result<()> {
        if self.flags.renaming {
            return Err(GatewayError::Busy("inode is being renamed".into()));
        }
        if self.flags.deleting {
            return Err(GatewayError::Busy("inode is being deleted".into()));
        }
        Ok(())
    }
}
