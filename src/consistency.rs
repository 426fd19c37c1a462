//! Consistency protocol: path freshness, manifest freshness, and coordinator
//! handoff. This module owns the freshness *decision*;
//! [`crate::transport`] supplies the MS/peer RPCs it drives.

use std::time::Instant;

use crate::cert::Capability;
use crate::error::{GatewayError, Result};
use crate::ids::{FileId, FileVersion, GatewayId};
use crate::inode::Inode;
use crate::manifest::SignedManifest;
use crate::transport::{GatewayClient, GatewayEndpoint, MdEntry, MsClient, WritePayload};

/// One resolved path component, as observed fresh from the MS.
#[derive(Debug, Clone)]
pub struct PathComponent {
    pub file_id: FileId,
    pub file_version: FileVersion,
    pub write_nonce: u64,
}

/// `path-ensure-fresh(fs_path)`: walk from root, stopping at the first
/// stale entry, driving a child-by-child `getattr` against the MS for the
/// remainder. Returns the resolved chain; *not-found* if any component is
/// absent at the MS.
pub fn path_ensure_fresh(ms: &dyn MsClient, root: FileId, components: &[&str]) -> Result<Vec<PathComponent>> {
    let mut resolved = Vec::with_capacity(components.len());
    let mut parent = root;
    for name in components {
        let entry = ms.getchild(parent, name)?;
        resolved.push(PathComponent {
            file_id: entry.file_id,
            file_version: entry.file_version,
            write_nonce: entry.write_nonce,
        });
        parent = entry.file_id;
    }
    Ok(resolved)
}

/// `manifest-ensure-fresh(fs_path)`: refresh the inode's manifest from the
/// coordinator (first choice) or any RG (fallback) if its refresh time is
/// beyond `max_read_freshness_ms`. Verifies the coordinator's signature
/// before installing, then merges so locally-dirty blocks survive.
pub fn manifest_ensure_fresh(
    inode: &mut Inode,
    fs_path: &str,
    client: &dyn GatewayClient,
    coordinator: &GatewayEndpoint,
    fallback_rgs: &[GatewayEndpoint],
    coordinator_public_key: &ed25519_dalek::VerifyingKey,
    now: Instant,
) -> Result<()> {
    if !inode.is_manifest_stale(now) {
        return Ok(());
    }

    let m = inode.manifest();
    let fetch = |endpoint: &GatewayEndpoint| {
        client.get_manifest(
            endpoint,
            fs_path,
            m.volume_id,
            m.file_id,
            m.file_version,
            m.modtime.sec,
            m.modtime.nsec,
        )
    };

    let mut signed: Option<SignedManifest> = match fetch(coordinator) {
        Ok(sm) => Some(sm),
        Err(e) if e.is_retryable() => None,
        Err(e) => return Err(e),
    };

    if signed.is_none() {
        for rg in fallback_rgs {
            if let Ok(sm) = fetch(rg) {
                signed = Some(sm);
                break;
            }
        }
    }

    let signed = signed.ok_or_else(|| GatewayError::RemoteIo("manifest unreachable from coordinator and every RG".into()))?;
    signed.verify(coordinator_public_key)?;
    inode.manifest_merge_blocks(&signed.manifest);
    Ok(())
}

/// Outcome of attempting a coordinator-scoped action locally.
pub enum LocalAttempt<T> {
    Done(T),
    /// The file is coordinated remotely; retry against `coordinator`.
    Remote(GatewayId),
}

/// The try-or-coordinate pattern: attempt the local action; if
/// it fails because the file is remote, issue a `WRITE` to the current
/// coordinator; if that fails too, attempt to become coordinator via the MS
/// `coordinate` RPC (requires the `COORDINATE` capability). After the RPC,
/// the caller re-refreshes the path and retries locally.
pub fn try_or_coordinate<T>(
    inode: &mut Inode,
    fs_path: &str,
    have_capability: impl Fn(Capability) -> bool,
    attempt_local: impl Fn(&mut Inode) -> Result<LocalAttempt<T>>,
    client: &dyn GatewayClient,
    endpoint_for: impl Fn(GatewayId) -> GatewayEndpoint,
    write_payload: impl Fn(&Inode) -> WritePayload,
    ms: &dyn MsClient,
) -> Result<T> {
    match attempt_local(inode)? {
        LocalAttempt::Done(t) => return Ok(t),
        LocalAttempt::Remote(current_coordinator) => {
            let coordinator_endpoint = endpoint_for(current_coordinator);
            let payload = write_payload(inode);
            if client.write(&coordinator_endpoint, fs_path, &payload).is_ok() {
                return Err(GatewayError::TryAgain(
                    "write forwarded to current coordinator; caller should retry the read-modify-write locally".into(),
                ));
            }
        }
    }

    if !have_capability(Capability::Coordinate) {
        return Err(GatewayError::PermissionDenied(
            "coordinator handoff requires the COORDINATE capability".into(),
        ));
    }

    let new_coordinator = ms.coordinate(inode.file_id)?;
    inode.manifest_replace({
        let mut m = inode.manifest().clone();
        m.coordinator_id = new_coordinator;
        m
    });

    match attempt_local(inode)? {
        LocalAttempt::Done(t) => Ok(t),
        LocalAttempt::Remote(_) => Err(GatewayError::TryAgain(
            "coordinator handoff completed but path refresh has not yet observed it".into(),
        )),
    }
}

pub fn export_md_entry(inode: &mut Inode, parent_id: FileId, parent_name: &str) -> MdEntry {
    inode.export(parent_id, parent_name)
}
