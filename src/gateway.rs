//! The top-level `UserGateway`: wires the inode table, disk cache, transport
//! clients, and configuration together, and owns the one-shot global pointer
//! signal handlers need.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Instant;

use ed25519_dalek::{SigningKey, VerifyingKey};

use crate::cache::DiskCache;
use crate::cert::{Capability, GatewayCert};
use crate::config::Config;
use crate::consistency::manifest_ensure_fresh;
use crate::error::{GatewayError, Result};
use crate::ids::{FileId, GatewayId};
use crate::inode::Inode;
use crate::manifest::Manifest;
use crate::read_path;
use crate::transport::{GatewayClient, GatewayEndpoint, MsClient};
use crate::vacuum::{self, Vacuumer};
use crate::write_path;

/// Everything a running gateway process needs, shared across every
/// in-flight operation. Cheap to clone (everything behind `Arc`); pass
/// `Arc<UserGateway>` to worker threads rather than the struct itself.
pub struct UserGateway {
    pub id: GatewayId,
    pub cert: GatewayCert,
    pub config: Config,
    pub signing_key: Arc<SigningKey>,
    pub cache: Arc<dyn DiskCache>,
    pub client: Arc<dyn GatewayClient>,
    pub ms: Arc<dyn MsClient>,
    pub vacuumer: Arc<dyn Vacuumer>,
    /// The known gateway directory (coordinator and RG addresses), keyed by
    /// id. Discovery of *which* gateways hold a given file's replicas is an
    /// MS/placement concern this crate treats as out of scope; callers
    /// supply the relevant subset per call.
    endpoints: HashMap<GatewayId, GatewayEndpoint>,
    inodes: Mutex<HashMap<FileId, Arc<Mutex<Inode>>>>,
}

impl UserGateway {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: GatewayId,
        cert: GatewayCert,
        config: Config,
        signing_key: Arc<SigningKey>,
        cache: Arc<dyn DiskCache>,
        client: Arc<dyn GatewayClient>,
        ms: Arc<dyn MsClient>,
        vacuumer: Arc<dyn Vacuumer>,
        endpoints: HashMap<GatewayId, GatewayEndpoint>,
    ) -> Self {
        UserGateway {
            id,
            cert,
            config,
            signing_key,
            cache,
            client,
            ms,
            vacuumer,
            endpoints,
            inodes: Mutex::new(HashMap::new()),
        }
    }

    pub fn endpoint(&self, id: GatewayId) -> Result<GatewayEndpoint> {
        self.endpoints
            .get(&id)
            .cloned()
            .ok_or_else(|| GatewayError::RemoteIo(format!("no known address for gateway {id:?}")))
    }

    fn endpoint_subset(&self, ids: &[GatewayId]) -> Vec<GatewayEndpoint> {
        ids.iter().filter_map(|id| self.endpoints.get(id).cloned()).collect()
    }

    /// Returns the cached `Inode` handle for `file_id`, opening it from the
    /// MS/coordinator if this is the first access this process has made.
    pub fn open_inode(&self, file_id: FileId, coordinator_id: GatewayId) -> Result<Arc<Mutex<Inode>>> {
        let mut table = self.inodes.lock().unwrap();
        if let Some(existing) = table.get(&file_id) {
            return Ok(Arc::clone(existing));
        }
        let entry = self.ms.getattr(file_id)?;
        let manifest = Manifest::new(crate::ids::VolumeId(0), coordinator_id, file_id, entry.file_version);
        let inode = Inode::init_from_ms_entry(&entry, manifest, self.config.max_read_freshness_ms, self.config.max_write_freshness_ms);
        let handle = Arc::new(Mutex::new(inode));
        table.insert(file_id, Arc::clone(&handle));
        Ok(handle)
    }

    fn refresh_closure<'a>(
        &'a self,
        fs_path: &'a str,
        coordinator: &'a GatewayEndpoint,
        fallback_rgs: &'a [GatewayEndpoint],
        coordinator_key: &'a VerifyingKey,
    ) -> impl FnOnce(&mut Inode) -> Result<()> + 'a {
        move |inode: &mut Inode| {
            manifest_ensure_fresh(inode, fs_path, &*self.client, coordinator, fallback_rgs, coordinator_key, Instant::now())?;
            inode.touch_refresh();
            Ok(())
        }
    }

    /// Performs a read against an already-opened inode.
    pub fn read(
        &self,
        inode_lock: &Mutex<Inode>,
        fs_path: &str,
        buf: &mut [u8],
        offset: u64,
        rg_rotation: &[GatewayId],
        coordinator_key: &VerifyingKey,
    ) -> Result<usize> {
        let mut inode = inode_lock.lock().unwrap();
        let coordinator = self.endpoint(inode.coordinator_id())?;
        let fallback_rgs = self.endpoint_subset(rg_rotation);
        let refresh = self.refresh_closure(fs_path, &coordinator, &fallback_rgs, coordinator_key);
        let mut rotation = vec![coordinator.clone()];
        rotation.extend(fallback_rgs.iter().cloned());
        read_path::read(
            &mut inode,
            fs_path,
            buf,
            offset,
            self.config.block_size,
            &*self.cache,
            &*self.client,
            &rotation,
            self.config.read_download_concurrency,
            refresh,
        )
    }

    /// Performs a write against an already-opened inode.
    pub fn write(
        &self,
        inode_lock: &Mutex<Inode>,
        fs_path: &str,
        data: &[u8],
        offset: u64,
        coordinator_key: &VerifyingKey,
    ) -> Result<usize> {
        let mut inode = inode_lock.lock().unwrap();
        let coordinator = self.endpoint(inode.coordinator_id())?;
        let am_coordinator = inode.coordinator_id() == self.id;
        let refresh = self.refresh_closure(fs_path, &coordinator, &[], coordinator_key);
        write_path::write(
            &mut inode,
            fs_path,
            data,
            offset,
            self.config.block_size,
            &*self.cache,
            &*self.client,
            &coordinator,
            am_coordinator,
            refresh,
        )
    }

    /// Runs the fsync/replication/vacuum-handoff algorithm for one inode.
    pub fn fsync(&self, inode_lock: &Mutex<Inode>, fs_path: &str, rg_ids: &[GatewayId]) -> Result<()> {
        let endpoints = self.endpoint_subset(rg_ids).into_iter().map(|e| (e.gateway_id, e)).collect();
        vacuum::fsync(
            inode_lock,
            fs_path,
            self.id,
            rg_ids,
            endpoints,
            (&*self.cache, &*self.ms, &*self.client, Arc::clone(&self.signing_key), self.config.fanout_concurrency_per_rg),
            &*self.vacuumer,
            self.config.retry_cap,
        )
    }

    pub fn can(&self, cap: Capability) -> bool {
        self.cert.has(cap)
    }
}

static GATEWAY: Mutex<Option<Arc<UserGateway>>> = Mutex::new(None);

/// Installs the process-wide gateway pointer signal handlers read.
/// Called once from `gateway_main`; a second call replaces the previous
/// pointer (used by tests that spin up more than one gateway in-process).
pub fn install_global(gateway: Arc<UserGateway>) {
    *GATEWAY.lock().unwrap() = Some(gateway);
}

/// Reads the process-wide gateway pointer, if one has been installed.
pub fn global() -> Option<Arc<UserGateway>> {
    GATEWAY.lock().unwrap().clone()
}

/// Clears the process-wide gateway pointer (teardown on graceful shutdown).
pub fn teardown_global() {
    *GATEWAY.lock().unwrap() = None;
}

/// A handle guaranteed not to race `install_global`/`teardown_global`. Not
/// used directly by signal handlers (which must stay async-signal-safe and
/// should only flip an `AtomicBool`), but by the shutdown path that reacts
/// to that flag.
pub fn global_init_cell() -> &'static OnceLock<()> {
    static CELL: OnceLock<()> = OnceLock::new();
    &CELL
}
