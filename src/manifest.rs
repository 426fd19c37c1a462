//! Per-file manifest: `block_id -> (block_version, hash, dirty_flag)` plus
//! the file identity and modtime that version the whole record. Manifests
//! are signed by their coordinator and verified by every reader against the
//! coordinator's certificate (see [`crate::cert`]).
//!
//! The wire encoding is a manual length-prefixed little-endian format: a
//! flat cursor reader/writer rather than a schema-compiler-driven format.
//! The crate carries no protobuf toolchain, so this plays the role the wire
//! protocol calls "manifest protobuf" without pulling one in.

use std::collections::BTreeMap;
use std::convert::TryInto;

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};

use crate::error::{GatewayError, Result};
use crate::ids::{BlockId, BlockVersion, FileId, FileVersion, GatewayId, ModTime, VolumeId};

pub const BLOCK_HASH_LEN: usize = 32;

/// One block's entry in a manifest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ManifestBlockEntry {
    pub block_version: BlockVersion,
    pub hash: [u8; BLOCK_HASH_LEN],
    pub dirty: bool,
}

/// The durable record of which block versions constitute a file's current
/// content. Versioned by `(file_version, modtime)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Manifest {
    pub volume_id: VolumeId,
    pub coordinator_id: GatewayId,
    pub file_id: FileId,
    pub file_version: FileVersion,
    pub modtime: ModTime,
    pub size: u64,
    pub blocks: BTreeMap<BlockId, ManifestBlockEntry>,
}

impl Manifest {
    pub fn new(
        volume_id: VolumeId,
        coordinator_id: GatewayId,
        file_id: FileId,
        file_version: FileVersion,
    ) -> Self {
        Manifest {
            volume_id,
            coordinator_id,
            file_id,
            file_version,
            modtime: ModTime::now(),
            size: 0,
            blocks: BTreeMap::new(),
        }
    }

    /// Merges remotely-observed block metadata into this manifest without
    /// touching entries not named in `other` (inode's manifest-merge-blocks).
    pub fn merge_blocks_from(&mut self, other: &Manifest) {
        for (id, entry) in &other.blocks {
            self.blocks.insert(*id, *entry);
        }
        if other.file_version.0 >= self.file_version.0 {
            self.file_version = other.file_version;
            self.modtime = other.modtime;
            self.size = other.size;
            self.coordinator_id = other.coordinator_id;
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&self.volume_id.0.to_le_bytes());
        buf.extend_from_slice(&self.coordinator_id.0.to_le_bytes());
        buf.extend_from_slice(&self.file_id.0.to_le_bytes());
        buf.extend_from_slice(&self.file_version.0.to_le_bytes());
        buf.extend_from_slice(&self.modtime.sec.to_le_bytes());
        buf.extend_from_slice(&self.modtime.nsec.to_le_bytes());
        buf.extend_from_slice(&self.size.to_le_bytes());

        let count: u32 = self
            .blocks
            .len()
            .try_into()
            .expect("manifest block count exceeds u32::MAX");
        buf.extend_from_slice(&count.to_le_bytes());
        for (id, entry) in &self.blocks {
            buf.extend_from_slice(&id.0.to_le_bytes());
            buf.extend_from_slice(&entry.block_version.0.to_le_bytes());
            buf.extend_from_slice(&entry.hash);
            buf.push(if entry.dirty { 1 } else { 0 });
        }
        buf
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut cur = Cursor::new(bytes);
        let volume_id = VolumeId(cur.read_u64()?);
        let coordinator_id = GatewayId(cur.read_u64()?);
        let file_id = FileId(cur.read_u64()?);
        let file_version = FileVersion(cur.read_u64()?);
        let sec = cur.read_i64()?;
        let nsec = cur.read_i32()?;
        let size = cur.read_u64()?;
        let count = cur.read_u32()? as usize;

        let mut blocks = BTreeMap::new();
        for _ in 0..count {
            let block_id = BlockId(cur.read_u64()?);
            let block_version = BlockVersion(cur.read_u64()?);
            let hash = cur.read_array::<BLOCK_HASH_LEN>()?;
            let dirty = match cur.read_u8()? {
                0 => false,
                1 => true,
                other => return Err(GatewayError::BadMessage(format!("invalid dirty flag byte {other}"))),
            };
            if blocks
                .insert(block_id, ManifestBlockEntry { block_version, hash, dirty })
                .is_some()
            {
                return Err(GatewayError::BadMessage(format!(
                    "duplicate block id {:?} in manifest",
                    block_id
                )));
            }
        }
        cur.ensure_consumed()?;

        Ok(Manifest {
            volume_id,
            coordinator_id,
            file_id,
            file_version,
            modtime: ModTime { sec, nsec },
            size,
            blocks,
        })
    }

    /// Signs the encoded manifest with the coordinator's private key.
    pub fn sign(&self, key: &SigningKey) -> SignedManifest {
        let bytes = self.encode();
        let signature = key.sign(&bytes);
        SignedManifest {
            manifest: self.clone(),
            signature,
        }
    }
}

/// A manifest plus the coordinator's signature over its encoded bytes.
#[derive(Debug, Clone)]
pub struct SignedManifest {
    pub manifest: Manifest,
    pub signature: Signature,
}

impl SignedManifest {
    /// Verifies the signature against the coordinator's public key before a
    /// reader installs the manifest, as part of manifest-ensure-fresh.
    pub fn verify(&self, coordinator_key: &VerifyingKey) -> Result<()> {
        let bytes = self.manifest.encode();
        coordinator_key
            .verify(&bytes, &self.signature)
            .map_err(|e| GatewayError::Protocol(format!("manifest signature verification failed: {e}")))
    }

    pub fn encode(&self) -> Vec<u8> {
        let manifest_bytes = self.manifest.encode();
        let mut buf = Vec::with_capacity(manifest_bytes.len() + 64 + 4);
        buf.extend_from_slice(&(manifest_bytes.len() as u32).to_le_bytes());
        buf.extend_from_slice(&manifest_bytes);
        buf.extend_from_slice(&self.signature.to_bytes());
        buf
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut cur = Cursor::new(bytes);
        let len = cur.read_u32()? as usize;
        let manifest_bytes = cur.read_exact(len)?;
        let manifest = Manifest::decode(manifest_bytes)?;
        let sig_bytes = cur.read_array::<64>()?;
        cur.ensure_consumed()?;
        let signature = Signature::from_bytes(&sig_bytes);
        Ok(SignedManifest { manifest, signature })
    }
}

struct Cursor<'a> {
    data: &'a [u8],
    index: usize,
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Cursor { data, index: 0 }
    }

    fn read_exact(&mut self, len: usize) -> Result<&'a [u8]> {
        if self.index + len > self.data.len() {
            return Err(GatewayError::BadMessage("unexpected end of manifest payload".into()));
        }
        let start = self.index;
        self.index += len;
        Ok(&self.data[start..start + len])
    }

    fn read_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        self.read_exact(N)?
            .try_into()
            .map_err(|_| GatewayError::BadMessage("array length mismatch in manifest payload".into()))
    }

    fn read_u8(&mut self) -> Result<u8> {
        Ok(self.read_exact(1)?[0])
    }

    fn read_u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.read_array::<4>()?))
    }

    fn read_i32(&mut self) -> Result<i32> {
        Ok(i32::from_le_bytes(self.read_array::<4>()?))
    }

    fn read_u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.read_array::<8>()?))
    }

    fn read_i64(&mut self) -> Result<i64> {
        Ok(i64::from_le_bytes(self.read_array::<8>()?))
    }

    fn ensure_consumed(&self) -> Result<()> {
        if self.index != self.data.len() {
            return Err(GatewayError::BadMessage("trailing bytes in manifest payload".into()));
        }
        Ok(())
    }
}
