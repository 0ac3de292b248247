//! First-fit bitmap allocator over the segment arena.
//!
//! The bitmap itself lives inside the shared segment; callers operate on it
//! only while holding the global segment mutex. Every allocation scans from
//! block 0, and freed runs are never compacted, so long-lived segments can
//! fragment.

use crate::errors::MfError;

#[inline]
fn bit_is_set(bitmap: &[u8], block: usize) -> bool {
    bitmap[block / 8] & (1 << (block % 8)) != 0
}

#[inline]
fn set_range(bitmap: &mut [u8], first: usize, blocks: usize) {
    for block in first..first + blocks {
        bitmap[block / 8] |= 1 << (block % 8);
    }
}

#[inline]
fn clear_range(bitmap: &mut [u8], first: usize, blocks: usize) {
    for block in first..first + blocks {
        bitmap[block / 8] &= !(1 << (block % 8));
    }
}

/// Find and claim the first contiguous run of `blocks` free blocks.
/// Returns the run's first block index, or `None` when no sufficiently
/// large run exists anywhere.
pub fn allocate(bitmap: &mut [u8], block_count: usize, blocks: usize) -> Option<usize> {
    if blocks == 0 || blocks > block_count {
        return None;
    }
    let mut run = 0usize;
    let mut start = 0usize;
    for block in 0..block_count {
        if bit_is_set(bitmap, block) {
            run = 0;
            continue;
        }
        if run == 0 {
            start = block;
        }
        run += 1;
        if run == blocks {
            set_range(bitmap, start, blocks);
            return Some(start);
        }
    }
    None
}

/// Release a run previously returned by [`allocate`]. The caller must pass
/// the exact first block and length; ranges outside the arena or bits that
/// are already clear are reported as corruption instead of being scribbled
/// over.
pub fn free(
    bitmap: &mut [u8],
    block_count: usize,
    first: usize,
    blocks: usize,
) -> Result<(), MfError> {
    let end = first.checked_add(blocks);
    if blocks == 0 || end.map_or(true, |e| e > block_count) {
        return Err(MfError::Corrupted("free range outside the arena"));
    }
    for block in first..first + blocks {
        if !bit_is_set(bitmap, block) {
            return Err(MfError::Corrupted("double free in the block bitmap"));
        }
    }
    clear_range(bitmap, first, blocks);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const BLOCKS: usize = 64;

    fn fresh() -> Vec<u8> {
        vec![0u8; BLOCKS / 8]
    }

    #[test]
    fn allocate_then_free_round_trips() {
        let mut bitmap = fresh();
        let before = bitmap.clone();
        let first = allocate(&mut bitmap, BLOCKS, 10).unwrap();
        assert_eq!(first, 0);
        assert_ne!(bitmap, before);
        free(&mut bitmap, BLOCKS, first, 10).unwrap();
        assert_eq!(bitmap, before);
    }

    #[test]
    fn first_fit_reuses_earliest_gap() {
        let mut bitmap = fresh();
        let a = allocate(&mut bitmap, BLOCKS, 8).unwrap();
        let b = allocate(&mut bitmap, BLOCKS, 8).unwrap();
        let c = allocate(&mut bitmap, BLOCKS, 8).unwrap();
        assert_eq!((a, b, c), (0, 8, 16));

        free(&mut bitmap, BLOCKS, b, 8).unwrap();
        // A smaller request lands in b's gap, not after c.
        assert_eq!(allocate(&mut bitmap, BLOCKS, 4), Some(8));
    }

    #[test]
    fn fragmented_space_cannot_satisfy_contiguous_request() {
        let mut bitmap = fresh();
        // Claim every other 4-block chunk, leaving 32 free blocks total but
        // no run longer than 4.
        for chunk in (0..BLOCKS / 4).step_by(2) {
            set_range(&mut bitmap, chunk * 4, 4);
        }
        assert_eq!(allocate(&mut bitmap, BLOCKS, 8), None);
        assert_eq!(allocate(&mut bitmap, BLOCKS, 4), Some(4));
    }

    #[test]
    fn exhaustion_returns_none() {
        let mut bitmap = fresh();
        assert_eq!(allocate(&mut bitmap, BLOCKS, BLOCKS), Some(0));
        assert_eq!(allocate(&mut bitmap, BLOCKS, 1), None);
        assert_eq!(allocate(&mut bitmap, BLOCKS, BLOCKS + 1), None);
    }

    #[test]
    fn free_rejects_out_of_range_and_double_free() {
        let mut bitmap = fresh();
        let first = allocate(&mut bitmap, BLOCKS, 4).unwrap();
        assert!(matches!(
            free(&mut bitmap, BLOCKS, BLOCKS - 2, 4),
            Err(MfError::Corrupted(_))
        ));
        free(&mut bitmap, BLOCKS, first, 4).unwrap();
        assert!(matches!(
            free(&mut bitmap, BLOCKS, first, 4),
            Err(MfError::Corrupted(_))
        ));
    }
}
