//! Replication: the 4-phase state machine that makes a set of
//! writes durable and globally visible, plus the `replicate_run` retry
//! wrapper that resumes from the first un-advanced phase.

use std::collections::HashMap;
use std::sync::Arc;

use crate::block::DirtyBlock;
use crate::cache::{CacheKey, DiskCache};
use crate::error::{GatewayError, Result};
use crate::ids::{BlockId, FileId, FileVersion, GatewayId, VolumeId, INVALID_BLOCK_ID};
use crate::manifest::Manifest;
use crate::transport::{
    bounded_fanout, BlockRequest, GatewayClient, GatewayEndpoint, MsClient, VacuumLogEntry, WritePayload,
};

/// One `(gateway_id, block_id)` pair still owed a transfer. `block_id =
/// INVALID_BLOCK_ID` names the manifest WRITE rather than a PUTBLOCK.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FanoutEntry {
    pub gateway_id: GatewayId,
    pub block_id: BlockId,
}

/// Per-replication snapshot state. The boolean sequence
/// `flushed_blocks, sent_vacuum_log, replicated_blocks, sent_ms_update` *is*
/// the state: re-entering the state machine after a failure resumes from the
/// first one still false.
pub struct ReplicaContext {
    pub fs_path: String,
    pub volume_id: VolumeId,
    pub file_id: FileId,
    pub coordinator_id: GatewayId,
    pub am_coordinator: bool,
    pub manifest: Manifest,
    pub dirty_blocks: HashMap<BlockId, DirtyBlock>,
    pub affected_block_ids: Vec<BlockId>,
    pub fanout_queue: Vec<FanoutEntry>,
    pub flushed_blocks: bool,
    pub sent_vacuum_log: bool,
    pub replicated_blocks: bool,
    pub sent_ms_update: bool,
    pub write_nonce: u64,
    pub size: u64,
}

impl ReplicaContext {
    /// Builds a fresh replica context from a dirty-block snapshot taken
    /// under the inode's write lock. `rg_ids` is the RG
    /// rotation for this file, excluding the coordinator.
    pub fn new(
        fs_path: String,
        manifest: Manifest,
        dirty_blocks: HashMap<BlockId, DirtyBlock>,
        am_coordinator: bool,
        write_nonce: u64,
        rg_ids: &[GatewayId],
    ) -> Self {
        let affected_block_ids: Vec<BlockId> = dirty_blocks.keys().copied().collect();
        let mut fanout_queue = Vec::with_capacity(rg_ids.len() * (affected_block_ids.len() + 1));
        for &gw in rg_ids {
            for &id in &affected_block_ids {
                fanout_queue.push(FanoutEntry { gateway_id: gw, block_id: id });
            }
            fanout_queue.push(FanoutEntry { gateway_id: gw, block_id: INVALID_BLOCK_ID });
        }
        let size = manifest.size;
        ReplicaContext {
            fs_path,
            volume_id: manifest.volume_id,
            file_id: manifest.file_id,
            coordinator_id: manifest.coordinator_id,
            am_coordinator,
            manifest,
            dirty_blocks,
            affected_block_ids,
            fanout_queue,
            flushed_blocks: false,
            sent_vacuum_log: false,
            replicated_blocks: false,
            sent_ms_update: false,
            write_nonce,
            size,
        }
    }

    /// Phase 0: flush every dirty block to the disk cache and await completion.
    fn phase_flush(&mut self, cache: &dyn DiskCache) -> Result<()> {
        if self.flushed_blocks || self.dirty_blocks.is_empty() {
            self.flushed_blocks = true;
            return Ok(());
        }
        let volume_id = self.volume_id;
        let file_id = self.file_id;
        let file_version = self.manifest.file_version;
        for (id, block) in self.dirty_blocks.iter_mut() {
            let key = CacheKey { volume_id, file_id, file_version, block_id: *id, block_version: block.version };
            block.flush_async(cache, key)?;
        }
        for (id, block) in self.dirty_blocks.iter_mut() {
            let key = CacheKey { volume_id, file_id, file_version, block_id: *id, block_version: block.version };
            block.flush_finish(cache, key, false)?;
        }
        self.flushed_blocks = true;
        Ok(())
    }

    /// Phase 1: append the vacuum-log safety net entry. Coordinator-only;
    /// a non-coordinator skips straight to phase 2.
    fn phase_vacuum_log(&mut self, ms: &dyn MsClient) -> Result<()> {
        if self.sent_vacuum_log || !self.am_coordinator {
            self.sent_vacuum_log = true;
            return Ok(());
        }
        let entry = VacuumLogEntry {
            volume_id: self.volume_id,
            coordinator_id: self.coordinator_id,
            file_id: self.file_id,
            file_version: self.manifest.file_version,
            manifest_mtime_sec: self.manifest.modtime.sec,
            manifest_mtime_nsec: self.manifest.modtime.nsec,
            affected_block_ids: self.affected_block_ids.clone(),
        };
        ms.append_vacuum_log_entry(entry).map_err(|e| match e {
            GatewayError::RemoteIo(msg) | GatewayError::Timeout(msg) => GatewayError::TryAgain(msg),
            other => other,
        })?;
        self.sent_vacuum_log = true;
        Ok(())
    }

    /// Phase 2: bounded-concurrency fan-out of chunks and the signed
    /// manifest to every entry still outstanding in the queue.
    fn phase_chunk_fanout(
        &mut self,
        client: &dyn GatewayClient,
        signing_key: &ed25519_dalek::SigningKey,
        endpoints: &HashMap<GatewayId, GatewayEndpoint>,
        concurrency_per_rg: usize,
    ) -> Result<()> {
        if self.replicated_blocks {
            return Ok(());
        }
        let pending: Vec<FanoutEntry> = self.fanout_queue.clone();
        let signed_manifest = self.manifest.sign(signing_key);
        let results = bounded_fanout(&pending, concurrency_per_rg.max(1), |entry| {
            let endpoint = endpoints
                .get(&entry.gateway_id)
                .ok_or_else(|| GatewayError::RemoteIo(format!("no endpoint for gateway {:?}", entry.gateway_id)))?;
            if entry.block_id == INVALID_BLOCK_ID {
                let payload = WritePayload {
                    volume_id: self.volume_id,
                    file_id: self.file_id,
                    coordinator_id: self.coordinator_id,
                    manifest: signed_manifest.clone(),
                };
                client.write(endpoint, &self.fs_path, &payload)
            } else {
                let block = self
                    .dirty_blocks
                    .get(&entry.block_id)
                    .ok_or_else(|| GatewayError::InvalidArgument(format!("no dirty block {:?} to replicate", entry.block_id)))?;
                let bytes = block
                    .as_bytes()
                    .ok_or_else(|| GatewayError::InvalidArgument(format!("block {:?} not materialized in RAM", entry.block_id)))?;
                let req = BlockRequest {
                    volume_id: self.volume_id,
                    file_id: self.file_id,
                    file_version: self.manifest.file_version,
                    coordinator_id: self.coordinator_id,
                    block_id: entry.block_id,
                    block_version: block.version,
                };
                client.put_block(endpoint, &self.fs_path, &req, bytes)
            }
        });

        let mut still_pending = Vec::new();
        let mut first_err = None;
        for (entry, result) in pending.into_iter().zip(results) {
            match result {
                Ok(()) => {}
                Err(e) => {
                    still_pending.push(entry);
                    if first_err.is_none() {
                        first_err = Some(e);
                    }
                }
            }
        }
        self.fanout_queue = still_pending;
        if let Some(e) = first_err {
            return Err(e);
        }
        self.replicated_blocks = true;
        Ok(())
    }

    /// Phase 3: send the new inode metadata to the MS (if coordinator) or
    /// to the coordinator (otherwise).
    fn phase_ms_update(&mut self, ms: &dyn MsClient) -> Result<()> {
        if self.sent_ms_update {
            return Ok(());
        }
        if self.am_coordinator {
            let entry = crate::transport::MdEntry {
                file_id: self.file_id,
                file_version: self.manifest.file_version,
                write_nonce: self.write_nonce,
                is_dir: false,
                size: self.size,
                coordinator_id: self.coordinator_id,
                modtime: self.manifest.modtime,
                manifest: self.manifest.clone(),
                xattr_hash: None,
            };
            ms.update(&entry)?;
        }
        self.sent_ms_update = true;
        Ok(())
    }
}

/// Arguments threaded through every phase; grouped so `replicate_run` stays
/// readable with a long parameter list.
pub struct ReplicationDeps<'a> {
    pub cache: &'a dyn DiskCache,
    pub ms: &'a dyn MsClient,
    pub client: &'a dyn GatewayClient,
    pub signing_key: Arc<ed25519_dalek::SigningKey>,
    pub endpoints: HashMap<GatewayId, GatewayEndpoint>,
    pub concurrency_per_rg: usize,
}

/// Runs the replication state machine to completion, re-entering on
/// `TryAgain` up to `max_attempts` times. Each phase is idempotent, so a
/// caller may also invoke this again later with the same context after an
/// error it chooses to retry itself.
pub fn replicate_run(ctx: &mut ReplicaContext, deps: &ReplicationDeps, max_attempts: u32) -> Result<()> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        match run_once(ctx, deps) {
            Ok(()) => return Ok(()),
            Err(GatewayError::TryAgain(msg)) if attempt < max_attempts => {
                tracing::warn!(attempt, %msg, "replication try-again, re-entering state machine");
                continue;
            }
            Err(e) => return Err(e),
        }
    }
}

fn run_once(ctx: &mut ReplicaContext, deps: &ReplicationDeps) -> Result<()> {
    ctx.phase_flush(deps.cache)?;
    ctx.phase_vacuum_log(deps.ms)?;
    ctx.phase_chunk_fanout(deps.client, &deps.signing_key, &deps.endpoints, deps.concurrency_per_rg)?;
    ctx.phase_ms_update(deps.ms)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::test_cache;
    use crate::ids::{BlockVersion, FileVersion};
    use ed25519_dalek::SigningKey;
    use rand::rngs::OsRng;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use url::Url;

    struct CountingMs {
        vacuum_log_calls: AtomicUsize,
        update_calls: AtomicUsize,
    }
    impl MsClient for CountingMs {
        fn create(&self, _p: FileId, _n: &str) -> Result<crate::transport::MdEntry> {
            unimplemented!()
        }
        fn mkdir(&self, _p: FileId, _n: &str) -> Result<crate::transport::MdEntry> {
            unimplemented!()
        }
        fn update(&self, entry: &crate::transport::MdEntry) -> Result<crate::transport::MdEntry> {
            self.update_calls.fetch_add(1, Ordering::SeqCst);
            Ok(entry.clone())
        }
        fn delete(&self, _p: FileId, _n: &str) -> Result<()> {
            unimplemented!()
        }
        fn rename(&self, _fp: FileId, _fn_: &str, _tp: FileId, _tn: &str) -> Result<crate::transport::MdEntry> {
            unimplemented!()
        }
        fn coordinate(&self, _f: FileId) -> Result<GatewayId> {
            unimplemented!()
        }
        fn getattr(&self, _f: FileId) -> Result<crate::transport::MdEntry> {
            unimplemented!()
        }
        fn getchild(&self, _p: FileId, _n: &str) -> Result<crate::transport::MdEntry> {
            unimplemented!()
        }
        fn listdir(&self, _p: FileId, _t: Option<&str>) -> Result<(Vec<crate::transport::MdEntry>, Option<String>)> {
            unimplemented!()
        }
        fn append_vacuum_log_entry(&self, _e: VacuumLogEntry) -> Result<()> {
            self.vacuum_log_calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        fn peek_vacuum_log(&self, _v: VolumeId) -> Result<Option<VacuumLogEntry>> {
            unimplemented!()
        }
        fn remove_vacuum_log_entry(&self, _v: VolumeId, _f: FileId, _fv: FileVersion) -> Result<()> {
            unimplemented!()
        }
        fn putxattr(&self, _f: FileId, _n: &str, _v: &[u8]) -> Result<()> {
            unimplemented!()
        }
        fn removexattr(&self, _f: FileId, _n: &str) -> Result<()> {
            unimplemented!()
        }
    }

    struct CountingClient {
        put_block_calls: AtomicUsize,
        write_calls: AtomicUsize,
        fail_first_n_blocks: Mutex<usize>,
    }
    impl GatewayClient for CountingClient {
        fn get_block(&self, _e: &GatewayEndpoint, _p: &str, _r: &BlockRequest) -> Result<Vec<u8>> {
            unimplemented!()
        }
        fn put_block(&self, _e: &GatewayEndpoint, _p: &str, _r: &BlockRequest, _d: &[u8]) -> Result<()> {
            let mut remaining = self.fail_first_n_blocks.lock().unwrap();
            if *remaining > 0 {
                *remaining -= 1;
                return Err(GatewayError::RemoteIo("simulated transient failure".into()));
            }
            self.put_block_calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        fn get_manifest(
            &self,
            _e: &GatewayEndpoint,
            _p: &str,
            _v: VolumeId,
            _f: FileId,
            _fv: FileVersion,
            _s: i64,
            _n: i32,
        ) -> Result<crate::manifest::SignedManifest> {
            unimplemented!()
        }
        fn write(&self, _e: &GatewayEndpoint, _p: &str, _payload: &WritePayload) -> Result<()> {
            self.write_calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn endpoints(ids: &[GatewayId]) -> HashMap<GatewayId, GatewayEndpoint> {
        ids.iter()
            .map(|id| {
                (
                    *id,
                    GatewayEndpoint {
                        gateway_id: *id,
                        base_url: Url::parse(&format!("https://rg{}.example.com/", id.0)).unwrap(),
                    },
                )
            })
            .collect()
    }

    #[test]
    fn two_rg_single_block_produces_four_transfers() {
        let manifest = Manifest::new(VolumeId(1), GatewayId(1), FileId(9), FileVersion(1));
        let mut dirty = HashMap::new();
        dirty.insert(BlockId(5), DirtyBlock::init_ram_owned(BlockId(5), BlockVersion(1), vec![1u8; 16]));
        let rgs = [GatewayId(1), GatewayId(2)];
        let mut ctx = ReplicaContext::new("/f".into(), manifest, dirty, true, 7, &rgs);
        assert_eq!(ctx.fanout_queue.len(), 4);

        let (_dir, cache) = test_cache();
        let ms = CountingMs { vacuum_log_calls: AtomicUsize::new(0), update_calls: AtomicUsize::new(0) };
        let client = CountingClient {
            put_block_calls: AtomicUsize::new(0),
            write_calls: AtomicUsize::new(0),
            fail_first_n_blocks: Mutex::new(0),
        };
        let signing_key = Arc::new(SigningKey::generate(&mut OsRng));
        let deps = ReplicationDeps {
            cache: &cache,
            ms: &ms,
            client: &client,
            signing_key,
            endpoints: endpoints(&rgs),
            concurrency_per_rg: 6,
        };

        replicate_run(&mut ctx, &deps, 5).unwrap();

        assert_eq!(client.put_block_calls.load(Ordering::SeqCst), 2);
        assert_eq!(client.write_calls.load(Ordering::SeqCst), 2);
        assert_eq!(ms.vacuum_log_calls.load(Ordering::SeqCst), 1);
        assert_eq!(ms.update_calls.load(Ordering::SeqCst), 1);
        assert!(ctx.fanout_queue.is_empty());
    }

    #[test]
    fn resuming_after_vacuum_log_does_not_resend_it() {
        let manifest = Manifest::new(VolumeId(1), GatewayId(1), FileId(9), FileVersion(1));
        let mut dirty = HashMap::new();
        dirty.insert(BlockId(5), DirtyBlock::init_ram_owned(BlockId(5), BlockVersion(1), vec![1u8; 16]));
        let rgs = [GatewayId(1)];
        let mut ctx = ReplicaContext::new("/f".into(), manifest, dirty, true, 7, &rgs);
        ctx.flushed_blocks = true;
        ctx.sent_vacuum_log = true;

        let (_dir, cache) = test_cache();
        let ms = CountingMs { vacuum_log_calls: AtomicUsize::new(0), update_calls: AtomicUsize::new(0) };
        let client = CountingClient {
            put_block_calls: AtomicUsize::new(0),
            write_calls: AtomicUsize::new(0),
            fail_first_n_blocks: Mutex::new(0),
        };
        let signing_key = Arc::new(SigningKey::generate(&mut OsRng));
        let deps = ReplicationDeps {
            cache: &cache,
            ms: &ms,
            client: &client,
            signing_key,
            endpoints: endpoints(&rgs),
            concurrency_per_rg: 6,
        };

        replicate_run(&mut ctx, &deps, 5).unwrap();
        assert_eq!(ms.vacuum_log_calls.load(Ordering::SeqCst), 0);
    }
}
