//! The inode chain: a singly-linked list of directory blocks, each holding
//! a run of allocation/invalidation sector pairs, one pair per file ever
//! created.
//!
//! Modeled as a manual [`Iterator`]-shaped cursor rather than an actual
//! `Iterator` impl, since advancing it can fail (a read can return a
//! [`MediaError`]) and `prepare_new`/`find` both need to act on the cursor's
//! position rather than merely consume it.

use crate::allocator::Allocator;
use crate::error::MediaError;
use crate::geometry::Geometry;
use crate::media::{FlashDevice, PageCache};
use crate::sector::{
    BlockIdx, FileId, InodeAllocationSector, InodeIndex, InodeInitSector, InodeInitSpare,
    InodeInvalidationSector, Timestamp,
};

/// Cursor over one entry slot of the inode chain: `block`/`sector` name the
/// allocation sector of the current entry; `next_block` is the block this
/// chain continues to once `block` is exhausted (`BlockIdx::INVALID` if
/// `block` is still the last one ever allocated).
#[derive(Debug, Clone, Copy)]
pub struct InodeIterator {
    block: BlockIdx,
    next_block: BlockIdx,
    previous_block: BlockIdx,
    inode_block_idx: InodeIndex,
    sector: u16,
}

impl InodeIterator {
    pub fn block(&self) -> BlockIdx {
        self.block
    }

    pub fn sector(&self) -> u16 {
        self.sector
    }

    pub fn inode_block_idx(&self) -> InodeIndex {
        self.inode_block_idx
    }

    /// Position the cursor at the first entry of `inode0`.
    pub fn init<D: FlashDevice>(
        cache: &mut PageCache<D>,
        inode0: BlockIdx,
    ) -> Result<Self, MediaError> {
        let geometry = cache.geometry();
        let next_block = cache.next_block_via_tail(inode0)?;
        let init: InodeInitSector = cache.read_pod(inode0.0, 0, 0)?;
        let spare: InodeInitSpare = cache.read_pod_spare(inode0.0, 0)?;
        Ok(Self {
            block: inode0,
            next_block,
            previous_block: init.previous_block,
            inode_block_idx: spare.inode_index,
            sector: geometry.inode_first_entry_sector(),
        })
    }

    /// True when the current entry is the last slot a block has room for:
    /// the allocation sector and its paired invalidation sector are the
    /// last two sectors that fit before the block's reserved tail/stat
    /// sectors.
    pub fn is_last_entry(&self, geometry: Geometry) -> bool {
        self.sector + 2 > geometry.tail_sector() - 2
    }

    /// Advance to the next entry, crossing into `next_block` if the current
    /// block's entries are exhausted. Does nothing (leaves the cursor on
    /// the final, still-open entry slot) if there is no successor block yet.
    pub fn next<D: FlashDevice>(&mut self, cache: &mut PageCache<D>) -> Result<(), MediaError> {
        let geometry = cache.geometry();
        let candidate = self.sector + 2;
        if candidate > geometry.tail_sector() - 2 {
            if self.next_block == BlockIdx::INVALID {
                return Ok(());
            }
            let crossed_next = cache.next_block_via_tail(self.next_block)?;
            let spare: InodeInitSpare = cache.read_pod_spare(self.next_block.0, 0)?;
            self.previous_block = self.block;
            self.block = self.next_block;
            self.next_block = crossed_next;
            self.inode_block_idx = spare.inode_index;
            self.sector = geometry.inode_first_entry_sector();
        } else {
            self.sector = candidate;
        }
        Ok(())
    }

    /// Step backward one entry, crossing into `previous_block` if the
    /// cursor sits on the first entry of its current block.
    pub fn prev<D: FlashDevice>(&mut self, cache: &mut PageCache<D>) -> Result<(), MediaError> {
        let geometry = cache.geometry();
        if self.sector == geometry.inode_first_entry_sector() {
            if self.previous_block == BlockIdx::INVALID {
                return Ok(());
            }
            let init: InodeInitSector = cache.read_pod(self.previous_block.0, 0, 0)?;
            let spare: InodeInitSpare = cache.read_pod_spare(self.previous_block.0, 0)?;
            self.next_block = self.block;
            self.block = self.previous_block;
            self.previous_block = init.previous_block;
            self.inode_block_idx = spare.inode_index;
            self.sector = geometry.tail_sector() - 2;
        } else {
            self.sector -= 2;
        }
        Ok(())
    }

    pub fn read_allocation<D: FlashDevice>(
        &self,
        cache: &mut PageCache<D>,
    ) -> Result<InodeAllocationSector, MediaError> {
        cache.read_pod(self.block.0, self.sector, 0)
    }

    pub fn read_invalidation<D: FlashDevice>(
        &self,
        cache: &mut PageCache<D>,
    ) -> Result<InodeInvalidationSector, MediaError> {
        cache.read_pod(self.block.0, self.sector + 1, 0)
    }
}

/// Extend the inode chain with a fresh block, but only if the cursor sits
/// on the last entry slot its current block has room for and no successor
/// has been allocated yet. A no-op in every other case (called
/// unconditionally by `open_write` before writing a new directory entry).
pub fn prepare_new<D: FlashDevice>(
    iter: &mut InodeIterator,
    cache: &mut PageCache<D>,
    allocator: &mut Allocator,
    t: &mut Timestamp,
) -> Result<(), MediaError> {
    let geometry = cache.geometry();
    if !iter.is_last_entry(geometry) || iter.next_block != BlockIdx::INVALID {
        return Ok(());
    }

    let alloc = allocator.allocate(cache, 0)?;
    if !alloc.is_valid() {
        return Err(MediaError::OutOfRange);
    }

    *t = *t + 1;
    // The forward link lives in the current block's tail sector, the same
    // slot a file block's chain link occupies; `next_block_via_tail` is how
    // every cursor (this one included) discovers it again.
    let link = crate::sector::FileTailSector {
        next_block: alloc.block,
        next_age: alloc.age,
        timestamp: *t,
        bytes_in_block: 0,
    };
    cache.write_pod(iter.block.0, geometry.tail_sector(), 0, &link)?;
    cache.commit()?;

    let new_index = InodeIndex(iter.inode_block_idx.0 + 1);
    cache.write_pod(
        alloc.block.0,
        0,
        0,
        &InodeInitSector {
            timestamp: *t,
            previous_block: iter.block,
        },
    )?;
    cache.write_pod_spare(
        alloc.block.0,
        0,
        &InodeInitSpare {
            type_id: crate::sector::BlockType::Inode,
            inode_index: new_index,
        },
    )?;
    cache.commit()?;

    iter.next_block = alloc.block;
    Ok(())
}

/// Result of a directory lookup: the live file's id and first data block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FoundFile {
    pub file_id: FileId,
    pub first_block: BlockIdx,
}

/// Linear scan of the inode chain from `inode0` looking for `filename`,
/// skipping over entries whose invalidation sector marks them deleted.
/// Returns `None` once an unwritten (erased) allocation sector is reached.
pub fn find<D: FlashDevice>(
    cache: &mut PageCache<D>,
    inode0: BlockIdx,
    filename: &[u8],
) -> Result<Option<FoundFile>, MediaError> {
    let mut iter = InodeIterator::init(cache, inode0)?;
    loop {
        let allocation = iter.read_allocation(cache)?;
        if allocation.is_erased() {
            return Ok(None);
        }
        if allocation.filename_bytes() == filename {
            let invalidation = iter.read_invalidation(cache)?;
            if invalidation.is_erased() {
                return Ok(Some(FoundFile {
                    file_id: allocation.file_id,
                    first_block: allocation.first_block,
                }));
            }
        }
        let before = (iter.block, iter.sector);
        iter.next(cache)?;
        if (iter.block, iter.sector) == before {
            // No successor block and no room left in this one: end of
            // directory with nothing left to scan.
            return Ok(None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::ram::RamFlash;
    use crate::media::PageCache;
    use crate::sector::{BlockType, InodeAllocationSpare};

    fn small_geometry() -> Geometry {
        Geometry {
            sector_size: 64,
            sectors_per_page: 2,
            pages_per_block: 4,
            num_blocks: 16,
            max_fname_len: 16,
            prealloc_size: 3,
        }
    }

    fn format_inode0<D: FlashDevice>(cache: &mut PageCache<D>, block: u16) {
        cache.erase_block(block).unwrap();
        cache
            .write_pod(
                block,
                0,
                0,
                &InodeInitSector {
                    timestamp: Timestamp(0),
                    previous_block: BlockIdx::INVALID,
                },
            )
            .unwrap();
        cache
            .write_pod_spare(
                block,
                0,
                &InodeInitSpare {
                    type_id: BlockType::Inode,
                    inode_index: InodeIndex(0),
                },
            )
            .unwrap();
        cache.commit().unwrap();
    }

    #[test]
    fn find_on_empty_directory_is_none() {
        let geometry = small_geometry();
        let mut cache = PageCache::new(RamFlash::new(geometry));
        format_inode0(&mut cache, 0);
        let found = find(&mut cache, BlockIdx(0), b"missing.txt").unwrap();
        assert!(found.is_none());
    }

    #[test]
    fn find_matches_live_entry_and_skips_deleted() {
        let geometry = small_geometry();
        let mut cache = PageCache::new(RamFlash::new(geometry));
        format_inode0(&mut cache, 0);

        let mut name = [0xFFu8; 16];
        name[..7].copy_from_slice(b"del.txt");
        cache
            .write_pod(
                0,
                1,
                0,
                &InodeAllocationSector {
                    file_id: FileId(1),
                    first_block: BlockIdx(4),
                    first_block_age: crate::sector::BlockAge(0),
                    timestamp: Timestamp(1),
                    filename: name,
                },
            )
            .unwrap();
        cache
            .write_pod_spare(0, 1, &InodeAllocationSpare::sealed())
            .unwrap();
        cache
            .write_pod(
                0,
                2,
                0,
                &InodeInvalidationSector {
                    timestamp: Timestamp(5),
                    last_block: BlockIdx(4),
                },
            )
            .unwrap();
        cache.commit().unwrap();

        let mut name2 = [0xFFu8; 16];
        name2[..8].copy_from_slice(b"live.txt");
        cache
            .write_pod(
                0,
                3,
                0,
                &InodeAllocationSector {
                    file_id: FileId(2),
                    first_block: BlockIdx(5),
                    first_block_age: crate::sector::BlockAge(0),
                    timestamp: Timestamp(2),
                    filename: name2,
                },
            )
            .unwrap();
        cache
            .write_pod_spare(0, 3, &InodeAllocationSpare::sealed())
            .unwrap();
        cache.commit().unwrap();

        let found = find(&mut cache, BlockIdx(0), b"del.txt").unwrap();
        assert!(found.is_none());

        let found = find(&mut cache, BlockIdx(0), b"live.txt").unwrap();
        assert_eq!(
            found,
            Some(FoundFile {
                file_id: FileId(2),
                first_block: BlockIdx(5),
            })
        );
    }

    #[test]
    fn iterator_next_then_prev_returns_to_start() {
        let geometry = small_geometry();
        let mut cache = PageCache::new(RamFlash::new(geometry));
        format_inode0(&mut cache, 0);

        let mut iter = InodeIterator::init(&mut cache, BlockIdx(0)).unwrap();
        let start_sector = iter.sector();
        iter.next(&mut cache).unwrap();
        assert_eq!(iter.sector(), start_sector + 2);
        iter.prev(&mut cache).unwrap();
        assert_eq!(iter.sector(), start_sector);
    }
}
