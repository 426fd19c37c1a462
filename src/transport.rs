//! Wire-level collaborators: URL construction, the gateway RPC client, the
//! MS collaborator contract, and the bounded-concurrency download loop
//! shared by the read and replication paths.
//!
//! The concurrency model here is plain OS threads joined in bounded
//! batches, not an async executor. `tokio` stays in the dependency graph
//! only for the admin binary's runtime wrapper, never for this fan-out.

use std::sync::Arc;
use std::time::Duration;

use ed25519_dalek::{Signer, SigningKey};
use url::Url;

use crate::error::{from_http_status, GatewayError, Result};
use crate::ids::{BlockId, BlockVersion, FileId, FileVersion, GatewayId, ModTime, VolumeId};
use crate::manifest::{Manifest, SignedManifest};

/// One gateway's reachable address, as looked up from its MS-registered
/// certificate. Part of the `[coordinator_id, RG_1, RG_2, ...]` rotation.
#[derive(Debug, Clone)]
pub struct GatewayEndpoint {
    pub gateway_id: GatewayId,
    pub base_url: Url,
}

fn file_component(fs_path: &str, file_id: FileId, file_version: FileVersion) -> String {
    format!("{fs_path}.{file_id:X}.{}", file_version.0)
}

/// Block URL format: `{base}/SYNDICATE-DATA/{volume_id}{fs_path}.{file_id:hex}.{file_version}/{block_id}.{block_version}`.
pub fn block_url(
    base: &Url,
    volume_id: VolumeId,
    fs_path: &str,
    file_id: FileId,
    file_version: FileVersion,
    block_id: BlockId,
    block_version: BlockVersion,
) -> Result<Url> {
    let path = format!(
        "SYNDICATE-DATA/{}{}/{}.{}",
        volume_id.0,
        file_component(fs_path, file_id, file_version),
        block_id.0,
        block_version.0
    );
    base.join(&path)
        .map_err(|e| GatewayError::InvalidArgument(format!("invalid block url: {e}")))
}

/// Manifest URL format: `.../manifest.{mtime_sec}.{mtime_nsec}`.
pub fn manifest_url(
    base: &Url,
    volume_id: VolumeId,
    fs_path: &str,
    file_id: FileId,
    file_version: FileVersion,
    mtime_sec: i64,
    mtime_nsec: i32,
) -> Result<Url> {
    let path = format!(
        "SYNDICATE-DATA/{}{}/manifest.{}.{}",
        volume_id.0,
        file_component(fs_path, file_id, file_version),
        mtime_sec,
        mtime_nsec
    );
    base.join(&path)
        .map_err(|e| GatewayError::InvalidArgument(format!("invalid manifest url: {e}")))
}

/// Identifies one block operation's target, independent of transport.
#[derive(Debug, Clone, Copy)]
pub struct BlockRequest {
    pub volume_id: VolumeId,
    pub file_id: FileId,
    pub file_version: FileVersion,
    pub coordinator_id: GatewayId,
    pub block_id: BlockId,
    pub block_version: BlockVersion,
}

/// A manifest delta or metadata-only update (the `WRITE` RPC). The manifest
/// entry's fan-out slot uses `INVALID_BLOCK_ID`; this is that payload.
#[derive(Debug, Clone)]
pub struct WritePayload {
    pub volume_id: VolumeId,
    pub file_id: FileId,
    pub coordinator_id: GatewayId,
    pub manifest: SignedManifest,
}

/// RPCs a gateway issues to a peer gateway (the GETBLOCK/PUTBLOCK/
/// GETMANIFEST/WRITE/SETXATTR family). Each request is signed end-to-end by
/// the sender's private key; implementations attach that signature as a
/// transport-level header or trailer.
pub trait GatewayClient: Send + Sync {
    fn get_block(&self, endpoint: &GatewayEndpoint, fs_path: &str, req: &BlockRequest) -> Result<Vec<u8>>;
    fn put_block(&self, endpoint: &GatewayEndpoint, fs_path: &str, req: &BlockRequest, data: &[u8]) -> Result<()>;
    fn get_manifest(
        &self,
        endpoint: &GatewayEndpoint,
        fs_path: &str,
        volume_id: VolumeId,
        file_id: FileId,
        file_version: FileVersion,
        mtime_sec: i64,
        mtime_nsec: i32,
    ) -> Result<SignedManifest>;
    fn write(&self, endpoint: &GatewayEndpoint, fs_path: &str, payload: &WritePayload) -> Result<()>;
}

/// A `reqwest`-backed [`GatewayClient`]. Every request carries a signature
/// over its method+url+body in the `X-Syndicate-Signature` header, signed
/// end-to-end by the sender's private key.
pub struct HttpGatewayClient {
    http: reqwest::blocking::Client,
    signing_key: Arc<SigningKey>,
}

impl HttpGatewayClient {
    pub fn new(signing_key: Arc<SigningKey>, timeout: Duration) -> Self {
        let http = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .expect("reqwest client configuration is static and infallible here");
        HttpGatewayClient { http, signing_key }
    }

    fn signature_header(&self, method: &str, url: &Url, body: &[u8]) -> String {
        let mut signed = Vec::with_capacity(method.len() + url.as_str().len() + body.len());
        signed.extend_from_slice(method.as_bytes());
        signed.extend_from_slice(url.as_str().as_bytes());
        signed.extend_from_slice(body);
        hex::encode(self.signing_key.sign(&signed).to_bytes())
    }

    fn send(&self, method: reqwest::Method, url: Url, body: Vec<u8>) -> Result<Vec<u8>> {
        let sig = self.signature_header(method.as_str(), &url, &body);
        let resp = self
            .http
            .request(method, url.clone())
            .header("X-Syndicate-Signature", sig)
            .body(body)
            .send()
            .map_err(|e| {
                if e.is_timeout() {
                    GatewayError::Timeout(format!("request to {url} timed out"))
                } else {
                    GatewayError::RemoteIo(format!("request to {url} failed: {e}"))
                }
            })?;
        let status = resp.status().as_u16();
        if !resp.status().is_success() {
            return Err(from_http_status(status, url.to_string()));
        }
        resp.bytes()
            .map(|b| b.to_vec())
            .map_err(|e| GatewayError::RemoteIo(format!("reading response body from {url}: {e}")))
    }
}

impl GatewayClient for HttpGatewayClient {
    fn get_block(&self, endpoint: &GatewayEndpoint, fs_path: &str, req: &BlockRequest) -> Result<Vec<u8>> {
        let url = block_url(
            &endpoint.base_url,
            req.volume_id,
            fs_path,
            req.file_id,
            req.file_version,
            req.block_id,
            req.block_version,
        )?;
        self.send(reqwest::Method::GET, url, Vec::new())
    }

    fn put_block(&self, endpoint: &GatewayEndpoint, fs_path: &str, req: &BlockRequest, data: &[u8]) -> Result<()> {
        let url = block_url(
            &endpoint.base_url,
            req.volume_id,
            fs_path,
            req.file_id,
            req.file_version,
            req.block_id,
            req.block_version,
        )?;
        self.send(reqwest::Method::PUT, url, data.to_vec()).map(|_| ())
    }

    fn get_manifest(
        &self,
        endpoint: &GatewayEndpoint,
        fs_path: &str,
        volume_id: VolumeId,
        file_id: FileId,
        file_version: FileVersion,
        mtime_sec: i64,
        mtime_nsec: i32,
    ) -> Result<SignedManifest> {
        let url = manifest_url(&endpoint.base_url, volume_id, fs_path, file_id, file_version, mtime_sec, mtime_nsec)?;
        let body = self.send(reqwest::Method::GET, url, Vec::new())?;
        SignedManifest::decode(&body)
    }

    fn write(&self, endpoint: &GatewayEndpoint, fs_path: &str, payload: &WritePayload) -> Result<()> {
        let url = manifest_url(
            &endpoint.base_url,
            payload.volume_id,
            fs_path,
            payload.file_id,
            payload.manifest.manifest.file_version,
            payload.manifest.manifest.modtime.sec,
            payload.manifest.manifest.modtime.nsec,
        )?;
        self.send(reqwest::Method::POST, url, payload.manifest.encode()).map(|_| ())
    }
}

/// The metadata service's post-operation view of an inode (`md_entry`),
/// returned by every MS collaborator-contract call.
#[derive(Debug, Clone)]
pub struct MdEntry {
    pub file_id: FileId,
    pub file_version: FileVersion,
    pub write_nonce: u64,
    pub is_dir: bool,
    pub size: u64,
    pub coordinator_id: GatewayId,
    pub modtime: ModTime,
    /// The inode's exported manifest, per §4.2's `export` contract and
    /// §4.6 phase 3's MS metadata update payload.
    pub manifest: Manifest,
    /// Digest over the inode's xattr set, present only when it carries any.
    pub xattr_hash: Option<[u8; 32]>,
}

/// The MS collaborator contract: everything the gateway core asks the
/// metadata service to do. An out-of-crate concern — this is the seam, not
/// an implementation.
pub trait MsClient: Send + Sync {
    fn create(&self, parent_id: FileId, name: &str) -> Result<MdEntry>;
    fn mkdir(&self, parent_id: FileId, name: &str) -> Result<MdEntry>;
    fn update(&self, entry: &MdEntry) -> Result<MdEntry>;
    fn delete(&self, parent_id: FileId, name: &str) -> Result<()>;
    fn rename(&self, from_parent: FileId, from_name: &str, to_parent: FileId, to_name: &str) -> Result<MdEntry>;
    /// MS `coordinate` RPC: succeeds only if the caller holds `COORDINATE`.
    fn coordinate(&self, file_id: FileId) -> Result<GatewayId>;
    fn getattr(&self, file_id: FileId) -> Result<MdEntry>;
    fn getchild(&self, parent_id: FileId, name: &str) -> Result<MdEntry>;
    fn listdir(&self, parent_id: FileId, page_token: Option<&str>) -> Result<(Vec<MdEntry>, Option<String>)>;
    fn append_vacuum_log_entry(&self, entry: VacuumLogEntry) -> Result<()>;
    fn peek_vacuum_log(&self, volume_id: VolumeId) -> Result<Option<VacuumLogEntry>>;
    fn remove_vacuum_log_entry(&self, volume_id: VolumeId, file_id: FileId, file_version: FileVersion) -> Result<()>;
    fn putxattr(&self, file_id: FileId, name: &str, value: &[u8]) -> Result<()>;
    fn removexattr(&self, file_id: FileId, name: &str) -> Result<()>;
}

/// `(volume_id, coordinator_id, file_id, file_version, manifest_mtime_sec,
/// manifest_mtime_nsec, affected_block_ids)` — the vacuum-log safety net
/// written in replication phase 1.
#[derive(Debug, Clone)]
pub struct VacuumLogEntry {
    pub volume_id: VolumeId,
    pub coordinator_id: GatewayId,
    pub file_id: FileId,
    pub file_version: FileVersion,
    pub manifest_mtime_sec: i64,
    pub manifest_mtime_nsec: i32,
    pub affected_block_ids: Vec<BlockId>,
}

/// Runs `work` over `items` with at most `concurrency` threads in flight at
/// once, joining each batch before starting the next. This is the bounded
/// download loop primitive shared by the read and replication paths;
/// callers re-enqueue an item (by returning it in the failed list) to retry
/// against the next gateway in rotation.
pub fn bounded_fanout<T, R, F>(items: &[T], concurrency: usize, work: F) -> Vec<Result<R>>
where
    T: Sync,
    R: Send,
    F: Fn(&T) -> Result<R> + Sync,
{
    let concurrency = concurrency.max(1);
    let mut results = Vec::with_capacity(items.len());
    for batch in items.chunks(concurrency) {
        std::thread::scope(|scope| {
            let handles: Vec<_> = batch
                .iter()
                .map(|item| scope.spawn(|| work(item)))
                .collect();
            for h in handles {
                results.push(h.join().unwrap_or_else(|_| {
                    Err(GatewayError::LocalIo(std::io::Error::other("fanout worker thread panicked")))
                }));
            }
        });
    }
    results
}
