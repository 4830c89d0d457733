//! Block allocator: roving scan head, age-sorted preallocation window, and
//! the single dirty-block slot tracking an in-progress file extension.

use alloc::vec::Vec;
use vob::Vob;

use crate::error::MediaError;
use crate::geometry::Geometry;
use crate::media::{FlashDevice, PageCache};
use crate::sector::{BlockAge, BlockIdx, BlockStatSector};

/// One free-block bitmap: bit set means "known free". Wraps a [`Vob`]
/// exactly as this codebase's `ext4` block/inode bitmaps do, but with the
/// opposite polarity (there, a set bit means in-use; here, a free block
/// pool is what the allocator actually scans, so "free" is the bit worth
/// setting).
pub(crate) struct FreeBlockBitmap(Vob);

impl FreeBlockBitmap {
    pub fn new(num_blocks: u16) -> Self {
        Self(Vob::from_elem(false, num_blocks as usize))
    }

    pub fn is_free(&self, block: u16) -> bool {
        self.0.get(block as usize).unwrap_or(false)
    }

    pub fn set_free(&mut self, block: u16, free: bool) {
        self.0.set(block as usize, free);
    }

    pub fn count_free(&self) -> u32 {
        (0..self.0.len())
            .filter(|&i| self.0.get(i).unwrap_or(false))
            .count() as u32
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockAlloc {
    pub block: BlockIdx,
    pub age: BlockAge,
}

impl BlockAlloc {
    pub const INVALID: Self = Self {
        block: BlockIdx::INVALID,
        age: BlockAge::INVALID,
    };

    pub fn is_valid(&self) -> bool {
        self.block != BlockIdx::INVALID
    }
}

/// Age-sorted window of candidate free blocks, youngest first, capped at
/// `PREALLOC_SIZE` entries.
struct Prealloc {
    entries: Vec<BlockAlloc>,
    cap: usize,
}

impl Prealloc {
    fn new(cap: usize) -> Self {
        Self {
            entries: Vec::with_capacity(cap),
            cap,
        }
    }

    /// Insert keeping ascending age order; drop the oldest if the window
    /// is full and the new candidate isn't young enough to matter.
    fn push(&mut self, candidate: BlockAlloc) {
        if self.entries.len() == self.cap {
            if let Some(oldest) = self.entries.last() {
                if oldest.age.0 < candidate.age.0 {
                    return;
                }
            }
        }
        let pos = self
            .entries
            .iter()
            .position(|e| candidate.age.0 <= e.age.0)
            .unwrap_or(self.entries.len());
        self.entries.insert(pos, candidate);
        if self.entries.len() > self.cap {
            self.entries.truncate(self.cap);
        }
    }

    /// Pop the youngest entry if it meets `threshold`, else leave the
    /// window untouched.
    fn pop_if_sufficient(&mut self, mean_free_age: i64, threshold: i64) -> Option<BlockAlloc> {
        let front = *self.entries.first()?;
        if age_is_sufficient(mean_free_age, threshold, front.age) {
            Some(self.entries.remove(0))
        } else {
            None
        }
    }
}

fn age_is_sufficient(mean_free_age: i64, threshold: i64, age: BlockAge) -> bool {
    mean_free_age - age.0 as i64 >= threshold
}

/// Identifies the owner of the single in-flight dirty block: the write
/// handle token (opaque to this module) that allocated it but has not yet
/// sealed its predecessor sector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirtyBlock {
    pub block: BlockIdx,
    pub owner: u32,
}

pub struct Allocator {
    bitmap: FreeBlockBitmap,
    prealloc: Prealloc,
    allocate_head: u16,
    num_free_blocks: u32,
    free_block_sum: u64,
    mean_free_age: i64,
    dirty_block: Option<DirtyBlock>,
    geometry: Geometry,
}

impl Allocator {
    pub fn new(geometry: Geometry) -> Self {
        Self {
            bitmap: FreeBlockBitmap::new(geometry.num_blocks),
            prealloc: Prealloc::new(geometry.prealloc_size as usize),
            allocate_head: 0,
            num_free_blocks: 0,
            free_block_sum: 0,
            mean_free_age: 0,
            dirty_block: None,
            geometry,
        }
    }

    pub fn num_free_blocks(&self) -> u32 {
        self.num_free_blocks
    }

    pub fn mean_free_age(&self) -> i64 {
        self.mean_free_age
    }

    pub fn dirty_block(&self) -> Option<DirtyBlock> {
        self.dirty_block
    }

    pub fn set_dirty_block(&mut self, dirty: Option<DirtyBlock>) {
        self.dirty_block = dirty;
    }

    /// Clears the dirty-block slot if `owner` currently holds it; used
    /// when a write handle seals its pending sector.
    pub fn clear_dirty_block_if_owned_by(&mut self, owner: u32) {
        if matches!(self.dirty_block, Some(d) if d.owner == owner) {
            self.dirty_block = None;
        }
    }

    /// Called during mount-time census (§4.7 Pass 1): record a block seen
    /// as free, along with its age, before the running aggregates exist.
    pub fn observe_free_block(&mut self, block: u16, age: BlockAge) {
        self.bitmap.set_free(block, true);
        self.num_free_blocks += 1;
        self.free_block_sum += age.0 as u64;
    }

    /// Recompute `mean_free_age` from the aggregates; call once after all
    /// blocks have been observed at mount, or after invalidate_chain
    /// finishes reclaiming blocks.
    pub fn refresh_mean_free_age(&mut self) {
        self.mean_free_age = if self.num_free_blocks > 0 {
            (self.free_block_sum / self.num_free_blocks as u64) as i64
        } else {
            0
        };
    }

    /// Mark a reclaimed block free and fold its age into the aggregates;
    /// used by `invalidate_chain`.
    pub fn reclaim_block(&mut self, block: u16, age: BlockAge) {
        self.bitmap.set_free(block, true);
        self.num_free_blocks += 1;
        self.free_block_sum += age.0 as u64;
    }

    /// Reserve a specific block outside the rover scan: used at mount when
    /// a block the census mistook for free (its directory-entry metadata
    /// was never committed before the block was handed out) turns out to
    /// already be in use. A no-op if the block isn't currently marked free.
    pub fn take_known(&mut self, block: BlockIdx, age: BlockAge) {
        if self.bitmap.is_free(block.0) {
            self.bitmap.set_free(block.0, false);
            self.num_free_blocks = self.num_free_blocks.saturating_sub(1);
            self.free_block_sum = self.free_block_sum.saturating_sub(age.0 as u64);
            self.refresh_mean_free_age();
        }
    }

    /// One scan step: if `allocate_head` is free, read its stat sector and
    /// return it as a candidate (without removing it from the bitmap);
    /// always advances the rover by one.
    fn iterate<D: FlashDevice>(
        &mut self,
        cache: &mut PageCache<D>,
    ) -> Result<BlockAlloc, MediaError> {
        let head = self.allocate_head;
        let mut result = BlockAlloc::INVALID;
        if self.bitmap.is_free(head) {
            let stat = read_block_stat(cache, head, self.geometry)?;
            result = BlockAlloc {
                block: BlockIdx(head),
                age: stat.age,
            };
        }
        self.allocate_head = (self.allocate_head + 1) % self.geometry.num_blocks;
        Ok(result)
    }

    /// Allocate(threshold): try the preallocation window first, then scan
    /// fresh blocks, decrementing `threshold` every outer step so that a
    /// nearly-full device still makes forward progress.
    pub fn allocate<D: FlashDevice>(
        &mut self,
        cache: &mut PageCache<D>,
        mut threshold: i64,
    ) -> Result<BlockAlloc, MediaError> {
        if self.num_free_blocks == 0 {
            return Ok(BlockAlloc::INVALID);
        }

        for _ in 0..self.geometry.num_blocks {
            if let Some(hit) = self.prealloc.pop_if_sufficient(self.mean_free_age, threshold) {
                self.take(hit);
                return Ok(hit);
            }

            let candidate = self.iterate(cache)?;
            if candidate.is_valid() {
                if age_is_sufficient(self.mean_free_age, threshold, candidate.age) {
                    self.take(candidate);
                    return Ok(candidate);
                } else {
                    self.prealloc.push(candidate);
                }
            }
            threshold -= 1;
        }

        Ok(BlockAlloc::INVALID)
    }

    fn take(&mut self, candidate: BlockAlloc) {
        self.bitmap.set_free(candidate.block.0, false);
        self.num_free_blocks -= 1;
        self.free_block_sum -= candidate.age.0 as u64;
        self.refresh_mean_free_age();
    }
}

fn read_block_stat<D: FlashDevice>(
    cache: &mut PageCache<D>,
    block: u16,
    geometry: Geometry,
) -> Result<BlockStatSector, MediaError> {
    cache.read_pod(block, geometry.blk_stat_sector(), 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prealloc_keeps_ascending_age_order() {
        let mut p = Prealloc::new(3);
        p.push(BlockAlloc {
            block: BlockIdx(1),
            age: BlockAge(5),
        });
        p.push(BlockAlloc {
            block: BlockIdx(2),
            age: BlockAge(1),
        });
        p.push(BlockAlloc {
            block: BlockIdx(3),
            age: BlockAge(3),
        });
        assert_eq!(p.entries[0].block, BlockIdx(2));
        assert_eq!(p.entries[1].block, BlockIdx(3));
        assert_eq!(p.entries[2].block, BlockIdx(1));
    }

    #[test]
    fn prealloc_drops_oldest_when_full_and_worse() {
        let mut p = Prealloc::new(2);
        p.push(BlockAlloc {
            block: BlockIdx(1),
            age: BlockAge(1),
        });
        p.push(BlockAlloc {
            block: BlockIdx(2),
            age: BlockAge(2),
        });
        p.push(BlockAlloc {
            block: BlockIdx(3),
            age: BlockAge(100),
        });
        assert_eq!(p.entries.len(), 2);
        assert!(p.entries.iter().all(|e| e.block != BlockIdx(3)));
    }

    #[test]
    fn age_is_sufficient_matches_formula() {
        assert!(age_is_sufficient(10, 5, BlockAge(4)));
        assert!(!age_is_sufficient(10, 5, BlockAge(6)));
        assert!(age_is_sufficient(10, 5, BlockAge(5)));
    }

    #[test]
    fn bitmap_free_count_tracks_sets() {
        let mut b = FreeBlockBitmap::new(8);
        assert_eq!(b.count_free(), 0);
        b.set_free(3, true);
        b.set_free(5, true);
        assert_eq!(b.count_free(), 2);
        b.set_free(3, false);
        assert_eq!(b.count_free(), 1);
    }
}
