//! Identity types for the block/manifest/inode data model.

use rand::RngCore;
use std::fmt;

/// Identifies a volume (a namespace of files spread across gateways and RGs).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VolumeId(pub u64);

/// Identifies a gateway (UG, RG, or MS-registered coordinator candidate).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GatewayId(pub u64);

/// Reserved gateway id meaning "no gateway" (an empty fan-out slot).
pub const GATEWAY_ID_NONE: GatewayId = GatewayId(0);

/// Identifies a file within a volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FileId(pub u64);

impl fmt::UpperHex for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::UpperHex::fmt(&self.0, f)
    }
}

/// A file's version; coordinators mint a fresh one on every metadata-changing write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FileVersion(pub u64);

/// A 0-based block index within a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(pub u64);

/// Reserved block id used by a fan-out queue entry that carries the manifest
/// itself rather than a chunk.
pub const INVALID_BLOCK_ID: BlockId = BlockId(u64::MAX);

/// A random 64-bit tag regenerated on every write to a block; makes blocks
/// content-addressed for caching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockVersion(pub u64);

impl BlockVersion {
    pub fn random() -> Self {
        BlockVersion(rand::thread_rng().next_u64())
    }
}

/// A random 64-bit value regenerated on every metadata-changing write; used
/// to detect racing updates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct WriteNonce(pub u64);

impl WriteNonce {
    pub fn random() -> Self {
        WriteNonce(rand::thread_rng().next_u64())
    }
}

/// A monotonically-observed generation counter for xattrs, separate from
/// `write_nonce` so attribute churn does not invalidate cached block content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct XattrNonce(pub u64);

/// Modification time with the (sec, nsec) split the manifest and vacuum log
/// both key on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct ModTime {
    pub sec: i64,
    pub nsec: i32,
}

impl ModTime {
    pub fn now() -> Self {
        let dur = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default();
        ModTime {
            sec: dur.as_secs() as i64,
            nsec: dur.subsec_nanos() as i32,
        }
    }
}

/// The full block identity 5-tuple.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockIdentity {
    pub volume_id: VolumeId,
    pub file_id: FileId,
    pub file_version: FileVersion,
    pub block_id: BlockId,
    pub block_version: BlockVersion,
}
