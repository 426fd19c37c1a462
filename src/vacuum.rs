//! Sync and vacuum serialization: per-inode fsync ordering and background
//! reclamation of vacuum-log entries.
//!
//! The fsync/sync-queue half follows a group-commit design: a caller either
//! becomes first-in-line or waits on a semaphore posted by the previous
//! holder. The vacuumer half is an external collaborator; the reference
//! `ChannelVacuumer` here is a plain thread+channel committer.

use std::collections::HashMap;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

use crate::error::{GatewayError, Result};
use crate::ids::{BlockId, FileId, GatewayId, ModTime, VolumeId};
use crate::inode::{Inode, SyncContext};
use crate::manifest::Manifest;
use crate::replication::{ReplicaContext, ReplicationDeps};
use crate::transport::{GatewayEndpoint, MsClient};

/// The set of blocks (and manifest timestamp) safe to reclaim once a
/// replication has superseded them: the inode's `replaced_blocks` snapshot
/// taken at fsync time.
#[derive(Debug, Clone)]
pub struct VacuumContext {
    pub volume_id: VolumeId,
    pub coordinator_id: GatewayId,
    pub file_id: FileId,
    pub manifest_mtime: ModTime,
    pub replaced_blocks: Manifest,
}

/// The vacuumer contract: enqueue a context; it is processed
/// eventually and at most once. Out of scope for this crate to implement
/// the background reclamation policy itself.
pub trait Vacuumer: Send + Sync {
    fn enqueue(&self, ctx: VacuumContext) -> Result<()>;
}

/// `vacuumer_enqueue(ctx)` with the fsync-success retry policy: retry on
/// memory pressure only, and break on success or any other error.
pub fn vacuumer_enqueue(vacuumer: &dyn Vacuumer, ctx: VacuumContext, max_local_retries: u32) -> Result<()> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        match vacuumer.enqueue(ctx.clone()) {
            Ok(()) => return Ok(()),
            Err(GatewayError::NoMemory) if attempt < max_local_retries => continue,
            Err(e) => return Err(e),
        }
    }
}

/// Reference in-process vacuumer: a background thread drains a channel and
/// removes each block's vacuum-log entry once it believes the replacement
/// version has landed. Deliberately simple — a production deployment is
/// expected to supply its own `Vacuumer` backed by durable storage.
pub struct ChannelVacuumer {
    sender: Sender<VacuumContext>,
    _worker: Option<thread::JoinHandle<()>>,
}

impl ChannelVacuumer {
    pub fn spawn(ms: Arc<dyn MsClient>) -> Self {
        let (sender, receiver): (Sender<VacuumContext>, Receiver<VacuumContext>) = mpsc::channel();
        let worker = thread::spawn(move || Self::drain_loop(receiver, ms));
        ChannelVacuumer { sender, _worker: Some(worker) }
    }

    fn drain_loop(receiver: Receiver<VacuumContext>, ms: Arc<dyn MsClient>) {
        while let Ok(ctx) = receiver.recv() {
            let _ = ms.remove_vacuum_log_entry(ctx.volume_id, ctx.file_id, ctx.replaced_blocks.file_version);
        }
    }
}

impl Vacuumer for ChannelVacuumer {
    fn enqueue(&self, ctx: VacuumContext) -> Result<()> {
        self.sender
            .send(ctx)
            .map_err(|_| GatewayError::LocalIo(std::io::Error::other("vacuumer worker thread is gone")))
    }
}

/// Snapshot taken under the inode's write lock at the start of fsync: a
/// transfer of ownership of the dirty-block set, not a share. The inode is
/// left with a fresh, empty dirty-block set.
struct FsyncSnapshot {
    manifest: Manifest,
    dirty_blocks: HashMap<BlockId, crate::block::DirtyBlock>,
    replaced_blocks: Manifest,
    am_coordinator: bool,
    write_nonce: u64,
}

fn take_snapshot(inode: &mut Inode, am_coordinator: bool) -> FsyncSnapshot {
    let manifest = inode.manifest().clone();
    let dirty_blocks = inode.dirty_blocks_extract_modified();
    let replaced_blocks = std::mem::replace(
        &mut inode.replaced_blocks,
        Manifest::new(manifest.volume_id, manifest.coordinator_id, manifest.file_id, manifest.file_version),
    );
    for entry in inode.manifest_mut().blocks.values_mut() {
        entry.dirty = false;
    }
    FsyncSnapshot { manifest, dirty_blocks, replaced_blocks, am_coordinator, write_nonce: inode.write_nonce.0 }
}

/// Runs the full fsync algorithm against an inode guarded by a
/// plain mutex, using `rg_ids`/`endpoints` to build the replication fan-out
/// queue. Blocks the caller until its turn in the FIFO sync queue and until
/// replication completes.
#[allow(clippy::too_many_arguments)]
pub fn fsync(
    inode_lock: &Mutex<Inode>,
    fs_path: &str,
    own_gateway_id: GatewayId,
    rg_ids: &[GatewayId],
    endpoints: HashMap<GatewayId, GatewayEndpoint>,
    deps_without_endpoints: (
        &dyn crate::cache::DiskCache,
        &dyn MsClient,
        &dyn crate::transport::GatewayClient,
        Arc<ed25519_dalek::SigningKey>,
        usize,
    ),
    vacuumer: &dyn Vacuumer,
    max_replicate_attempts: u32,
) -> Result<()> {
    let (cache, ms, client, signing_key, concurrency_per_rg) = deps_without_endpoints;

    let (snapshot, first_in_line, notify) = {
        let mut inode = inode_lock.lock().unwrap();
        inode.ensure_not_busy()?;
        let am_coordinator = inode.coordinator_id() == own_gateway_id;
        let snapshot = take_snapshot(&mut inode, am_coordinator);

        let notify = Arc::new((Mutex::new(false), Condvar::new()));
        let first_in_line = inode.sync_queue_len() == 0;
        if !first_in_line {
            inode.sync_queue_push(SyncContext { tx_id: rand::random::<u64>(), notify: Arc::clone(&notify) });
        }
        (snapshot, first_in_line, notify)
    };

    if !first_in_line {
        let (lock, cvar) = &*notify;
        let mut ready = lock.lock().unwrap();
        while !*ready {
            ready = cvar.wait(ready).unwrap();
        }
    }

    let mut ctx = ReplicaContext::new(
        fs_path.to_string(),
        snapshot.manifest.clone(),
        snapshot.dirty_blocks,
        snapshot.am_coordinator,
        snapshot.write_nonce,
        rg_ids,
    );
    let repl_deps = ReplicationDeps { cache, ms, client, signing_key, endpoints, concurrency_per_rg };
    let result = crate::replication::replicate_run(&mut ctx, &repl_deps, max_replicate_attempts);

    let outcome = {
        let mut inode = inode_lock.lock().unwrap();
        match &result {
            Ok(()) => {
                inode.old_manifest_modtime = snapshot.manifest.modtime;
                let vacuum_ctx = VacuumContext {
                    volume_id: snapshot.manifest.volume_id,
                    coordinator_id: snapshot.manifest.coordinator_id,
                    file_id: snapshot.manifest.file_id,
                    manifest_mtime: snapshot.manifest.modtime,
                    replaced_blocks: snapshot.replaced_blocks,
                };
                vacuumer_enqueue(vacuumer, vacuum_ctx, 5)
            }
            Err(_) => {
                inode.dirty_blocks_return(ctx.dirty_blocks);
                inode.replaced_blocks.merge_blocks_from(&snapshot.replaced_blocks);
                Ok(())
            }
        }
    };

    {
        let mut inode = inode_lock.lock().unwrap();
        if let Some(next) = inode.sync_queue_pop() {
            let (lock, cvar) = &*next.notify;
            let mut ready = lock.lock().unwrap();
            *ready = true;
            cvar.notify_one();
        }
    }

    result?;
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::{FileId, FileVersion, VolumeId};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingVacuumer {
        calls: AtomicUsize,
    }
    impl Vacuumer for CountingVacuumer {
        fn enqueue(&self, _ctx: VacuumContext) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn vacuumer_enqueue_retries_only_on_memory_pressure() {
        struct FlakyThenOk {
            remaining_pressure: Mutex<u32>,
        }
        impl Vacuumer for FlakyThenOk {
            fn enqueue(&self, _ctx: VacuumContext) -> Result<()> {
                let mut left = self.remaining_pressure.lock().unwrap();
                if *left > 0 {
                    *left -= 1;
                    return Err(GatewayError::NoMemory);
                }
                Ok(())
            }
        }
        let v = FlakyThenOk { remaining_pressure: Mutex::new(2) };
        let ctx = VacuumContext {
            volume_id: VolumeId(1),
            coordinator_id: GatewayId(1),
            file_id: FileId(1),
            manifest_mtime: ModTime { sec: 0, nsec: 0 },
            replaced_blocks: Manifest::new(VolumeId(1), GatewayId(1), FileId(1), FileVersion(1)),
        };
        assert!(vacuumer_enqueue(&v, ctx, 5).is_ok());
    }

    #[test]
    fn vacuumer_enqueue_stops_on_non_memory_error() {
        struct AlwaysBusy;
        impl Vacuumer for AlwaysBusy {
            fn enqueue(&self, _ctx: VacuumContext) -> Result<()> {
                Err(GatewayError::Busy("nope".into()))
            }
        }
        let ctx = VacuumContext {
            volume_id: VolumeId(1),
            coordinator_id: GatewayId(1),
            file_id: FileId(1),
            manifest_mtime: ModTime { sec: 0, nsec: 0 },
            replaced_blocks: Manifest::new(VolumeId(1), GatewayId(1), FileId(1), FileVersion(1)),
        };
        let result = vacuumer_enqueue(&AlwaysBusy, ctx, 5);
        assert!(matches!(result, Err(GatewayError::Busy(_))));
    }

    #[test]
    fn counting_vacuumer_sees_exactly_one_enqueue_on_success() {
        let v = CountingVacuumer { calls: AtomicUsize::new(0) };
        let ctx = VacuumContext {
            volume_id: VolumeId(1),
            coordinator_id: GatewayId(1),
            file_id: FileId(1),
            manifest_mtime: ModTime { sec: 0, nsec: 0 },
            replaced_blocks: Manifest::new(VolumeId(1), GatewayId(1), FileId(1), FileVersion(1)),
        };
        vacuumer_enqueue(&v, ctx, 5).unwrap();
        assert_eq!(v.calls.load(Ordering::SeqCst), 1);
    }
}
