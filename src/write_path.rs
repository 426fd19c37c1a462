//! Write path: merge a user buffer into the inode's dirty set,
//! and the patch-manifest flow for writes coordinated remotely.

use sha2::{Digest, Sha256};

use crate::block::{aligned, DirtyBlock};
use crate::cache::{CacheKey, DiskCache};
use crate::error::Result;
use crate::ids::{BlockId, BlockVersion};
use crate::inode::Inode;
use crate::manifest::{Manifest, ManifestBlockEntry};
use crate::transport::{BlockRequest, GatewayClient, GatewayEndpoint};

/// Reads one unaligned edge block (head or tail) into a scratch buffer,
/// preferring the dirty set, then the disk cache, then a coordinator fetch.
/// A write hole (no manifest entry) is a zero-filled scratch buffer.
fn read_edge_block(
    inode: &Inode,
    fs_path: &str,
    id: BlockId,
    blocksize: u64,
    cache: &dyn DiskCache,
    client: &dyn GatewayClient,
    coordinator: &GatewayEndpoint,
) -> Result<Vec<u8>> {
    if let Some(entry) = inode.manifest().blocks.get(&id).copied() {
        if let Some(block) = inode.dirty_block(id) {
            if let Some(bytes) = block.as_bytes() {
                return Ok(bytes.to_vec());
            }
        }
        let key = CacheKey {
            volume_id: inode.volume_id,
            file_id: inode.file_id,
            file_version: inode.manifest().file_version,
            block_id: id,
            block_version: entry.block_version,
        };
        if let Ok(data) = cache.load(&key) {
            return Ok(data);
        }
        let req = BlockRequest {
            volume_id: inode.volume_id,
            file_id: inode.file_id,
            file_version: inode.manifest().file_version,
            coordinator_id: inode.coordinator_id(),
            block_id: id,
            block_version: entry.block_version,
        };
        let data = client.get_block(coordinator, fs_path, &req)?;
        Ok(data)
    } else {
        Ok(vec![0u8; blocksize as usize])
    }
}

/// Performs the full write-path algorithm. Returns the number of bytes
/// merged — partial writes are not an error.
#[allow(clippy::too_many_arguments)]
pub fn write(
    inode: &mut Inode,
    fs_path: &str,
    data: &[u8],
    offset: u64,
    blocksize: u64,
    cache: &dyn DiskCache,
    client: &dyn GatewayClient,
    coordinator: &GatewayEndpoint,
    am_coordinator: bool,
    refresh: impl FnOnce(&mut Inode) -> Result<()>,
) -> Result<usize> {
    // Phase 1: refresh manifest.
    refresh(inode)?;

    let len = data.len() as u64;
    if len == 0 {
        return Ok(0);
    }

    let a = aligned(offset, len, blocksize);

    // Phases 2-3: read and merge unaligned head/tail.
    let head_id = a.head_block(offset, blocksize);
    let tail_id = a.tail_block(offset, len, blocksize);

    let mut cursor: usize = 0;
    let mut new_blocks: Vec<(BlockId, Vec<u8>)> = Vec::new();

    if let Some(id) = head_id {
        let mut scratch = read_edge_block(inode, fs_path, id, blocksize, cache, client, coordinator)?;
        scratch.resize(blocksize as usize, 0);
        let block_start = id.0 * blocksize;
        let merge_start = (offset - block_start) as usize;
        let merge_len = std::cmp::min(len as usize, blocksize as usize - merge_start);
        scratch[merge_start..merge_start + merge_len].copy_from_slice(&data[0..merge_len]);
        cursor = merge_len;
        new_blocks.push((id, scratch));
    }

    // Phase 4: aligned dirty blocks, zero-copy from `data`.
    if a.has_aligned_blocks {
        for i in 0..=(a.last_aligned.0 - a.first_aligned.0) {
            let id = BlockId(a.first_aligned.0 + i);
            let end = cursor + blocksize as usize;
            new_blocks.push((id, data[cursor..end].to_vec()));
            cursor = end;
        }
    }

    if let Some(id) = tail_id {
        let mut scratch = read_edge_block(inode, fs_path, id, blocksize, cache, client, coordinator)?;
        scratch.resize(blocksize as usize, 0);
        let merge_len = data.len() - cursor;
        scratch[0..merge_len].copy_from_slice(&data[cursor..]);
        cursor += merge_len;
        new_blocks.push((id, scratch));
    }

    // Phase 5: commit to inode. Each committed block gets a fresh random
    // version, whether it fills a write hole or overwrites an existing one.
    let mut new_size = inode.manifest().size;
    for (id, bytes) in new_blocks {
        let version = BlockVersion::random();
        let hash: [u8; 32] = Sha256::digest(&bytes).into();
        let block = DirtyBlock::init_ram_owned(id, version, bytes);
        inode.dirty_block_commit(block);
        inode.manifest_mut().blocks.insert(id, ManifestBlockEntry { block_version: version, hash, dirty: true });
        let block_end = (id.0 + 1) * blocksize;
        new_size = new_size.max(block_end);
    }
    let end_of_write = offset + len;
    new_size = new_size.max(end_of_write);
    inode.manifest_mut().size = new_size;

    // Phase 6: trim. An unaligned tail means the final block stays in RAM
    // so subsequent writes can extend it without a re-read.
    if tail_id.is_some() {
        if let Some(preserve) = tail_id {
            inode.dirty_blocks_trim(cache, |id| CacheKey {
                volume_id: inode.volume_id,
                file_id: inode.file_id,
                file_version: inode.manifest().file_version,
                block_id: id,
                block_version: inode.manifest().blocks[&id].block_version,
            }, &[preserve])?;
        }
    }

    // Phase 7: timestamps.
    inode.record_local_write(am_coordinator);

    Ok(len as usize)
}

/// Patch-manifest (remote write): a remote coordinator applied
/// writes and forwarded the resulting manifest delta. Clones the current
/// manifest, applies the delta, drops any locally-cached block whose
/// version the delta superseded, and clears the matching `replaced_blocks`
/// record (the remote overwrite subsumes our vacuum duty).
pub fn apply_patch_manifest(inode: &mut Inode, delta: &Manifest) {
    let mut next = inode.manifest().clone();
    for (id, entry) in &delta.blocks {
        let superseded = next
            .blocks
            .get(id)
            .map(|existing| existing.block_version != entry.block_version)
            .unwrap_or(false);
        next.blocks.insert(*id, *entry);
        if superseded {
            let stale_local = inode.dirty_block(*id).map(|b| b.version != entry.block_version).unwrap_or(false);
            if stale_local {
                inode.drop_dirty_block(*id);
            }
            inode.replaced_blocks.blocks.remove(id);
        }
    }
    if delta.file_version.0 >= next.file_version.0 {
        next.file_version = delta.file_version;
        next.modtime = delta.modtime;
        next.size = delta.size;
    }
    inode.manifest_replace(next);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::test_cache;
    use crate::ids::{FileId, FileVersion, GatewayId, VolumeId};
    use crate::transport::GatewayEndpoint;
    use url::Url;

    struct UnreachableClient;
    impl GatewayClient for UnreachableClient {
        fn get_block(&self, _e: &GatewayEndpoint, _p: &str, _r: &BlockRequest) -> Result<Vec<u8>> {
            Err(crate::error::GatewayError::RemoteIo("unreachable in this test".into()))
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
        ) -> Result<crate::manifest::SignedManifest> {
            unimplemented!()
        }
        fn write(&self, _e: &GatewayEndpoint, _p: &str, _payload: &crate::transport::WritePayload) -> Result<()> {
            unimplemented!()
        }
    }

    fn endpoint() -> GatewayEndpoint {
        GatewayEndpoint { gateway_id: GatewayId(1), base_url: Url::parse("https://rg1.example.com/").unwrap() }
    }

    #[test]
    fn aligned_write_hole_fill_creates_manifest_entries() {
        let manifest = Manifest::new(VolumeId(1), GatewayId(1), FileId(9), FileVersion(1));
        let mut inode = crate::inode::Inode::init_from_exported_manifest(manifest, 5000, 5000);
        let (_dir, cache) = test_cache();
        let client = UnreachableClient;
        let payload = vec![7u8; 4096 * 2];
        let n = write(&mut inode, "/f", &payload, 0, 4096, &cache, &client, &endpoint(), true, |_| Ok(())).unwrap();
        assert_eq!(n, payload.len());
        assert_eq!(inode.manifest().blocks.len(), 2);
        assert_eq!(inode.manifest().size, 8192);
    }

    #[test]
    fn patch_manifest_drops_superseded_dirty_block_and_replaced_record() {
        let manifest = Manifest::new(VolumeId(1), GatewayId(1), FileId(9), FileVersion(1));
        let mut inode = crate::inode::Inode::init_from_exported_manifest(manifest, 5000, 5000);
        inode.manifest_mut().blocks.insert(
            BlockId(7),
            ManifestBlockEntry { block_version: BlockVersion(1), hash: [0u8; 32], dirty: false },
        );
        inode.dirty_block_commit(DirtyBlock::init_ram_owned(BlockId(7), BlockVersion(2), vec![1u8; 10]));
        assert!(inode.replaced_blocks.blocks.contains_key(&BlockId(7)));

        let mut delta = Manifest::new(VolumeId(1), GatewayId(1), FileId(9), FileVersion(2));
        delta.blocks.insert(
            BlockId(7),
            ManifestBlockEntry { block_version: BlockVersion(99), hash: [9u8; 32], dirty: false },
        );
        apply_patch_manifest(&mut inode, &delta);

        assert!(inode.dirty_block(BlockId(7)).is_none());
        assert!(!inode.replaced_blocks.blocks.contains_key(&BlockId(7)));
        assert_eq!(inode.manifest().blocks[&BlockId(7)].block_version, BlockVersion(99));
    }
}
