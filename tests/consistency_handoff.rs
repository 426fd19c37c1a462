//! Integration tests for the coordinator try-or-coordinate handoff and
//! manifest freshness protocol.

use std::time::Instant;

use ed25519_dalek::SigningKey;
use rand::rngs::OsRng;
use url::Url;

use syndicate_ug::cert::Capability;
use syndicate_ug::consistency::{manifest_ensure_fresh, try_or_coordinate, LocalAttempt};
use syndicate_ug::error::{GatewayError, Result};
use syndicate_ug::ids::{FileId, FileVersion, GatewayId, VolumeId};
use syndicate_ug::inode::Inode;
use syndicate_ug::manifest::{Manifest, SignedManifest};
use syndicate_ug::transport::{BlockRequest, GatewayClient, GatewayEndpoint, MdEntry, MsClient, VacuumLogEntry, WritePayload};

struct ManifestServingClient {
    key: SigningKey,
}
impl GatewayClient for ManifestServingClient {
    fn get_block(&self, _e: &GatewayEndpoint, _p: &str, _r: &BlockRequest) -> Result<Vec<u8>> {
        unimplemented!()
    }
    fn put_block(&self, _e: &GatewayEndpoint, _p: &str, _r: &BlockRequest, _d: &[u8]) -> Result<()> {
        unimplemented!()
    }
    fn get_manifest(
        &self,
        _e: &GatewayEndpoint,
        _p: &str,
        volume_id: VolumeId,
        file_id: FileId,
        file_version: FileVersion,
        _s: i64,
        _n: i32,
    ) -> Result<SignedManifest> {
        let manifest = Manifest::new(volume_id, GatewayId(1), file_id, file_version);
        Ok(manifest.sign(&self.key))
    }
    fn write(&self, _e: &GatewayEndpoint, _p: &str, _payload: &WritePayload) -> Result<()> {
        unimplemented!()
    }
}

struct UnreachableManifestClient;
impl GatewayClient for UnreachableManifestClient {
    fn get_block(&self, _e: &GatewayEndpoint, _p: &str, _r: &BlockRequest) -> Result<Vec<u8>> {
        unimplemented!()
    }
    fn put_block(&self, _e: &GatewayEndpoint, _p: &str, _r: &BlockRequest, _d: &[u8]) -> Result<()> {
        unimplemented!()
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
    ) -> Result<SignedManifest> {
        Err(GatewayError::Timeout("coordinator unreachable".into()))
    }
    fn write(&self, _e: &GatewayEndpoint, _p: &str, _payload: &WritePayload) -> Result<()> {
        unimplemented!()
    }
}

fn endpoint(id: GatewayId) -> GatewayEndpoint {
    GatewayEndpoint { gateway_id: id, base_url: Url::parse(&format!("https://gw{}.example.com/", id.0)).unwrap() }
}

fn stale_inode() -> Inode {
    let manifest = Manifest::new(VolumeId(1), GatewayId(1), FileId(5), FileVersion(1));
    let inode = Inode::init_from_exported_manifest(manifest, 0, 0);
    // max_read_freshness_ms = 0 makes `is_manifest_stale` true as soon as
    // any time elapses past construction; give it a sliver of room.
    std::thread::sleep(std::time::Duration::from_millis(5));
    inode
}

#[test]
fn manifest_refresh_falls_back_to_an_rg_when_coordinator_times_out() {
    let mut inode = stale_inode();
    let key = SigningKey::generate(&mut OsRng);
    let coordinator_client = UnreachableManifestClient;
    // Coordinator fails with a retryable error; the fallback RG serves the manifest.
    let fallback = [endpoint(GatewayId(2))];

    struct Either<'a> {
        coordinator_fails: &'a UnreachableManifestClient,
        rg_serves: &'a ManifestServingClient,
    }
    impl<'a> GatewayClient for Either<'a> {
        fn get_block(&self, _e: &GatewayEndpoint, _p: &str, _r: &BlockRequest) -> Result<Vec<u8>> {
            unimplemented!()
        }
        fn put_block(&self, _e: &GatewayEndpoint, _p: &str, _r: &BlockRequest, _d: &[u8]) -> Result<()> {
            unimplemented!()
        }
        fn get_manifest(
            &self,
            e: &GatewayEndpoint,
            p: &str,
            v: VolumeId,
            f: FileId,
            fv: FileVersion,
            s: i64,
            n: i32,
        ) -> Result<SignedManifest> {
            if e.gateway_id == GatewayId(1) {
                self.coordinator_fails.get_manifest(e, p, v, f, fv, s, n)
            } else {
                self.rg_serves.get_manifest(e, p, v, f, fv, s, n)
            }
        }
        fn write(&self, _e: &GatewayEndpoint, _p: &str, _payload: &WritePayload) -> Result<()> {
            unimplemented!()
        }
    }
    let rg_client = ManifestServingClient { key: key.clone() };
    let client = Either { coordinator_fails: &coordinator_client, rg_serves: &rg_client };

    manifest_ensure_fresh(&mut inode, "/f", &client, &endpoint(GatewayId(1)), &fallback, &key.verifying_key(), Instant::now())
        .expect("fallback RG must serve the manifest");
}

struct FixedMs {
    coordinate_result: GatewayId,
}
impl MsClient for FixedMs {
    fn create(&self, _p: FileId, _n: &str) -> Result<MdEntry> {
        unimplemented!()
    }
    fn mkdir(&self, _p: FileId, _n: &str) -> Result<MdEntry> {
        unimplemented!()
    }
    fn update(&self, entry: &MdEntry) -> Result<MdEntry> {
        Ok(entry.clone())
    }
    fn delete(&self, _p: FileId, _n: &str) -> Result<()> {
        unimplemented!()
    }
    fn rename(&self, _a: FileId, _b: &str, _c: FileId, _d: &str) -> Result<MdEntry> {
        unimplemented!()
    }
    fn coordinate(&self, _f: FileId) -> Result<GatewayId> {
        Ok(self.coordinate_result)
    }
    fn getattr(&self, _f: FileId) -> Result<MdEntry> {
        unimplemented!()
    }
    fn getchild(&self, _p: FileId, _n: &str) -> Result<MdEntry> {
        unimplemented!()
    }
    fn listdir(&self, _p: FileId, _t: Option<&str>) -> Result<(Vec<MdEntry>, Option<String>)> {
        unimplemented!()
    }
    fn append_vacuum_log_entry(&self, _e: VacuumLogEntry) -> Result<()> {
        Ok(())
    }
    fn peek_vacuum_log(&self, _v: VolumeId) -> Result<Option<VacuumLogEntry>> {
        Ok(None)
    }
    fn remove_vacuum_log_entry(&self, _v: VolumeId, _f: FileId, _fv: FileVersion) -> Result<()> {
        Ok(())
    }
    fn putxattr(&self, _f: FileId, _n: &str, _v: &[u8]) -> Result<()> {
        Ok(())
    }
    fn removexattr(&self, _f: FileId, _n: &str) -> Result<()> {
        Ok(())
    }
}

struct ForwardingClient;
impl GatewayClient for ForwardingClient {
    fn get_block(&self, _e: &GatewayEndpoint, _p: &str, _r: &BlockRequest) -> Result<Vec<u8>> {
        unimplemented!()
    }
    fn put_block(&self, _e: &GatewayEndpoint, _p: &str, _r: &BlockRequest, _d: &[u8]) -> Result<()> {
        unimplemented!()
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
    ) -> Result<SignedManifest> {
        unimplemented!()
    }
    fn write(&self, _e: &GatewayEndpoint, _p: &str, _payload: &WritePayload) -> Result<()> {
        // Forwarding to the current coordinator succeeds; the local caller
        // must retry the read-modify-write rather than treat this as done.
        Ok(())
    }
}

fn sign(inode: &Inode) -> SignedManifest {
    let key = SigningKey::generate(&mut OsRng);
    inode.manifest().sign(&key)
}

// A write against a remotely-coordinated file is forwarded, and
// the caller must retry locally rather than treat the forward as a commit.
#[test]
fn remote_write_forward_requests_a_local_retry() {
    let mut inode = Inode::init_from_exported_manifest(Manifest::new(VolumeId(1), GatewayId(1), FileId(5), FileVersion(1)), 5000, 5000);
    let ms = FixedMs { coordinate_result: GatewayId(9) };
    let client = ForwardingClient;
    let endpoint = endpoint(GatewayId(2));

    let result = try_or_coordinate::<()>(
        &mut inode,
        "/f",
        |_cap| true,
        |_inode| Ok(LocalAttempt::Remote(GatewayId(2))),
        &client,
        move |id| GatewayEndpoint { gateway_id: id, base_url: endpoint.base_url.clone() },
        |inode| WritePayload { volume_id: inode.volume_id, file_id: inode.file_id, coordinator_id: inode.coordinator_id(), manifest: sign(inode) },
        &ms,
    );
    assert!(matches!(result, Err(GatewayError::TryAgain(_))));
}

// When forwarding fails and the caller holds COORDINATE, the MS
// `coordinate` RPC installs this gateway as the new coordinator and the
// local action is retried.
#[test]
fn coordinator_handoff_succeeds_and_retries_locally() {
    let mut inode = Inode::init_from_exported_manifest(Manifest::new(VolumeId(1), GatewayId(1), FileId(5), FileVersion(1)), 5000, 5000);
    let ms = FixedMs { coordinate_result: GatewayId(77) };
    struct UnreachableWriteClient;
    impl GatewayClient for UnreachableWriteClient {
        fn get_block(&self, _e: &GatewayEndpoint, _p: &str, _r: &BlockRequest) -> Result<Vec<u8>> {
            unimplemented!()
        }
        fn put_block(&self, _e: &GatewayEndpoint, _p: &str, _r: &BlockRequest, _d: &[u8]) -> Result<()> {
            unimplemented!()
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
        ) -> Result<SignedManifest> {
            unimplemented!()
        }
        fn write(&self, _e: &GatewayEndpoint, _p: &str, _payload: &WritePayload) -> Result<()> {
            Err(GatewayError::RemoteIo("current coordinator unreachable".into()))
        }
    }
    let client = UnreachableWriteClient;
    let endpoint_url = Url::parse("https://gw2.example.com/").unwrap();

    let attempts = std::cell::Cell::new(0u32);
    let result = try_or_coordinate::<&'static str>(
        &mut inode,
        "/f",
        |cap| cap == Capability::Coordinate,
        |inode| {
            attempts.set(attempts.get() + 1);
            if inode.coordinator_id() == GatewayId(77) {
                Ok(LocalAttempt::Done("committed"))
            } else {
                Ok(LocalAttempt::Remote(GatewayId(2)))
            }
        },
        &client,
        move |id| GatewayEndpoint { gateway_id: id, base_url: endpoint_url.clone() },
        |inode| WritePayload { volume_id: inode.volume_id, file_id: inode.file_id, coordinator_id: inode.coordinator_id(), manifest: sign(inode) },
        &ms,
    );

    assert_eq!(result.unwrap(), "committed");
    assert_eq!(inode.coordinator_id(), GatewayId(77));
    assert_eq!(attempts.get(), 2);
}
