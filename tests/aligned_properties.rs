//! Property tests for the block-alignment computation:
//! `aligned(offset, len, blocksize)` must partition `[offset, offset+len)`
//! into a head, a run of whole blocks, and a tail whose lengths sum to `len`.

use proptest::prelude::*;
use syndicate_ug::block::aligned;
use syndicate_ug::ids::BlockId;

fn head_len(offset: u64, len: u64, blocksize: u64) -> u64 {
    if offset % blocksize == 0 {
        0
    } else {
        std::cmp::min(len, blocksize - offset % blocksize)
    }
}

// Independently derived from the leftover bytes after the head, not from
// `Alignment::aligned_block_count()` — this is what actually exercises the
// partition rather than restating it.
fn expected_full_block_count(offset: u64, len: u64, blocksize: u64) -> u64 {
    let head = head_len(offset, len, blocksize);
    (len - head) / blocksize
}

fn expected_tail_len(offset: u64, len: u64, blocksize: u64) -> u64 {
    let head = head_len(offset, len, blocksize);
    (len - head) % blocksize
}

proptest! {
    #[test]
    fn partition_covers_the_whole_range(
        offset in 0u64..10_000_000,
        len in 0u64..200_000,
        blocksize in 1u64..65536,
    ) {
        let a = aligned(offset, len, blocksize);
        let head = head_len(offset, len, blocksize);
        let full_blocks = expected_full_block_count(offset, len, blocksize);
        let tail = expected_tail_len(offset, len, blocksize);

        prop_assert_eq!(head + full_blocks * blocksize + tail, len);
        prop_assert_eq!(a.aligned_block_count(), full_blocks);

        if let Some(h) = a.head_block(offset, blocksize) {
            prop_assert_eq!(h, BlockId(offset / blocksize));
        }
        if a.has_aligned_blocks {
            prop_assert!(a.first_aligned.0 <= a.last_aligned.0);
            let first_byte = a.first_aligned.0 * blocksize;
            prop_assert!(first_byte % blocksize == 0);
            prop_assert_eq!(a.last_aligned.0 - a.first_aligned.0 + 1, full_blocks);
        } else {
            prop_assert_eq!(full_blocks, 0);
        }
    }

    #[test]
    fn zero_length_never_has_aligned_blocks(offset in 0u64..1_000_000, blocksize in 1u64..65536) {
        let a = aligned(offset, 0, blocksize);
        prop_assert!(!a.has_aligned_blocks);
    }

    #[test]
    fn request_inside_one_block_has_no_aligned_run(
        offset in 0u64..65535,
        extra in 1u64..4000,
        blocksize in 4096u64..8192,
    ) {
        // Keep the whole request within a single block by construction.
        let block_start = (offset / blocksize) * blocksize;
        let room = blocksize - (offset - block_start);
        let len = std::cmp::min(extra, room.saturating_sub(1).max(1));
        if len == 0 {
            return Ok(());
        }
        let a = aligned(offset, len, blocksize);
        if offset + len <= block_start + blocksize {
            prop_assert!(!a.has_aligned_blocks);
        }
    }
}

// blocksize 4096, write 8000 bytes at offset 2000.
#[test]
fn unaligned_write_scenario_has_three_touched_blocks() {
    let a = aligned(2000, 8000, 4096);
    let head = a.head_block(2000, 4096).expect("head exists");
    let tail = a.tail_block(2000, 8000, 4096).expect("tail exists");
    assert_eq!(head, BlockId(0));
    assert_eq!(a.first_aligned, BlockId(1));
    assert_eq!(a.last_aligned, BlockId(1));
    assert_eq!(tail, BlockId(2));
}

// blocksize 4096, write 100 bytes at offset 12288 (block 3).
#[test]
fn write_hole_scenario_touches_only_block_three() {
    let a = aligned(12288, 100, 4096);
    assert!(a.head_block(12288, 4096).is_none());
    assert!(!a.has_aligned_blocks);
    assert!(a.tail_block(12288, 100, 4096).is_none());
}
