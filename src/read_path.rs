//! Read path: satisfy a `read(buf, len, offset)` against an open file handle
//! in seven phases — refresh, partition, set up receive ranges, dirty set,
//! disk cache, peers, finalize.

use std::collections::HashMap;
use std::ops::Range;

use sha2::{Digest, Sha256};

use crate::block::{aligned, DirtyBlock};
use crate::cache::{CacheKey, DiskCache};
use crate::error::{GatewayError, Result};
use crate::ids::{BlockId, BlockVersion};
use crate::inode::Inode;
use crate::transport::{bounded_fanout, BlockRequest, GatewayClient, GatewayEndpoint};

/// Per-block slice of the caller's buffer this read must populate.
struct BlockRange {
    id: BlockId,
    range: Range<usize>,
}

fn build_plan(offset: u64, len: u64, blocksize: u64) -> Vec<BlockRange> {
    let a = aligned(offset, len, blocksize);
    let mut plan = Vec::new();
    let mut cursor: usize = 0;

    if let Some(head) = a.head_block(offset, blocksize) {
        let head_len = std::cmp::min(len, blocksize - offset % blocksize) as usize;
        plan.push(BlockRange { id: head, range: cursor..cursor + head_len });
        cursor += head_len;
    }

    if a.has_aligned_blocks {
        for i in 0..=(a.last_aligned.0 - a.first_aligned.0) {
            let id = BlockId(a.first_aligned.0 + i);
            let end = cursor + blocksize as usize;
            plan.push(BlockRange { id, range: cursor..end });
            cursor = end;
        }
    }

    if let Some(tail) = a.tail_block(offset, len, blocksize) {
        plan.push(BlockRange { id: tail, range: cursor..len as usize });
    }

    plan
}

/// Performs the full read-path algorithm, writing satisfied bytes directly
/// into `buf`. Returns the number of bytes successfully populated — partial
/// reads are not an error.
#[allow(clippy::too_many_arguments)]
pub fn read(
    inode: &mut Inode,
    fs_path: &str,
    buf: &mut [u8],
    offset: u64,
    blocksize: u64,
    cache: &dyn DiskCache,
    client: &dyn GatewayClient,
    gateway_rotation: &[GatewayEndpoint],
    max_connections: usize,
    refresh: impl FnOnce(&mut Inode) -> Result<()>,
) -> Result<usize> {
    // Phase 1: refresh manifest.
    refresh(inode)?;

    let len = buf.len() as u64;
    if len == 0 {
        return Ok(0);
    }

    let version_before = inode.manifest().file_version;
    let nonce_before = inode.local_write_nonce;

    // Phase 2: partition.
    let plan = build_plan(offset, len, blocksize);

    // Phase 3: set up receive buffers — write holes are satisfied immediately.
    let mut remaining: Vec<BlockId> = Vec::new();
    let mut ranges: HashMap<BlockId, Range<usize>> = HashMap::new();
    for entry in &plan {
        if inode.manifest().blocks.contains_key(&entry.id) {
            remaining.push(entry.id);
            ranges.insert(entry.id, entry.range.clone());
        } else {
            for b in &mut buf[entry.range.clone()] {
                *b = 0;
            }
        }
    }

    // Phase 4: satisfy from dirty set. Write holes are already populated above.
    let mut populated: usize = plan
        .iter()
        .filter(|e| !inode.manifest().blocks.contains_key(&e.id))
        .map(|e| e.range.len())
        .sum();

    let mut still_remaining = Vec::new();
    for id in remaining {
        if let Some(block) = inode.dirty_block(id) {
            if let Some(bytes) = block.as_bytes() {
                let r = ranges[&id].clone();
                let n = std::cmp::min(bytes.len(), r.len());
                buf[r.start..r.start + n].copy_from_slice(&bytes[..n]);
                populated += n;
                continue;
            }
        }
        still_remaining.push(id);
    }
    let remaining = still_remaining;

    // Phase 5: satisfy from disk cache.
    let mut not_local = Vec::new();
    for id in remaining {
        let entry = inode.manifest().blocks[&id];
        let key = CacheKey {
            volume_id: inode.volume_id,
            file_id: inode.file_id,
            file_version: inode.manifest().file_version,
            block_id: id,
            block_version: entry.block_version,
        };
        match cache.load(&key) {
            Ok(data) => {
                let r = ranges[&id].clone();
                let n = std::cmp::min(data.len(), r.len());
                buf[r.start..r.start + n].copy_from_slice(&data[..n]);
                populated += n;
            }
            Err(_) => not_local.push(id),
        }
    }

    // Phase 6: satisfy from peers, rotating gateways on failure.
    let mut gw_index: HashMap<BlockId, usize> = not_local.iter().map(|id| (*id, 0usize)).collect();
    let mut pending = not_local;
    while !pending.is_empty() {
        let round = pending.clone();
        let version = inode.manifest().file_version;
        let results: Vec<Result<(BlockId, Vec<u8>)>> = bounded_fanout(&round, max_connections, |id| {
            let idx = gw_index[id];
            let gw = gateway_rotation
                .get(idx)
                .ok_or_else(|| GatewayError::RemoteIo(format!("gateway rotation exhausted for block {:?}", id)))?;
            let entry = inode.manifest().blocks[id];
            let req = BlockRequest {
                volume_id: inode.volume_id,
                file_id: inode.file_id,
                file_version: version,
                coordinator_id: inode.coordinator_id(),
                block_id: *id,
                block_version: entry.block_version,
            };
            let data = client.get_block(gw, fs_path, &req)?;
            let digest: [u8; 32] = Sha256::digest(&data).into();
            if digest != entry.hash {
                return Err(GatewayError::BadMessage(format!("block {:?} hash mismatch", id)));
            }
            Ok((*id, data))
        });

        pending.clear();
        for (id, result) in round.into_iter().zip(results) {
            match result {
                Ok((id, data)) => {
                    let r = ranges[&id].clone();
                    let n = std::cmp::min(data.len(), r.len());
                    buf[r.start..r.start + n].copy_from_slice(&data[..n]);
                    populated += n;
                }
                Err(_) => {
                    let next = gw_index[&id] + 1;
                    if next < gateway_rotation.len() {
                        gw_index.insert(id, next);
                        pending.push(id);
                    }
                    // else: gateway rotation exhausted for this block; leave unpopulated.
                }
            }
        }
    }

    // Phase 7: finalize. If nothing raced the download, cache the final
    // block of the request as a clean read-ahead hint. This implementation
    // writes straight into `buf` throughout, so there are no unaligned
    // scratch buffers left to splice back.
    if inode.manifest().file_version == version_before && inode.local_write_nonce == nonce_before {
        if let Some(last) = plan.last() {
            if let Some(r) = ranges.get(&last.id) {
                let mut hint = DirtyBlock::init_ram_copy(last.id, BlockVersion::random(), &buf[r.clone()]);
                hint.mark_clean();
                inode.dirty_block_cache(hint);
            }
        }
    }

    Ok(populated)
}
