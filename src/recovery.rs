//! Mount-time recovery: rebuild the allocator's free-block knowledge and
//! locate the live inode chain from whatever a prior session left behind,
//! tolerating a crash at any point in a commit sequence.
//!
//! Two passes suffice for the invariants this crate maintains:
//!
//! 1. **Census** — classify every non-bad block by its sector-0 spare type
//!    and seed the free-block bitmap from the ones that read back as truly
//!    free.
//! 2. **Chain walk** — follow the inode chain from the oldest-timestamped
//!    root candidate, reserving every block reachable from a live file's
//!    chain (undoing any census mistake caused by a torn allocation) and
//!    resuming reclamation of any file whose deletion was interrupted.

use alloc::vec::Vec;

use crate::error::FsError;
use crate::fs::Filesystem;
use crate::inode::InodeIterator;
use crate::media::FlashDevice;
use crate::sector::{
    BlockAge, BlockIdx, BlockStatSector, BlockType, BlockTypeProbe, FileId, FileInitSector,
    FileTailSector, InodeIndex, InodeInitSector, InodeInitSpare, Timestamp,
};

/// Summary of what mount-time recovery found, for callers that want to log
/// or surface it rather than silently trust the result.
#[derive(Debug, Clone, Copy, Default)]
pub struct MountReport {
    /// A second inode-0 candidate (no `previous_block`) found alongside the
    /// one chosen as the true root, left over from a torn format or a
    /// never-completed chain merge. Never auto-reclaimed.
    pub orphaned_inode0: Option<BlockIdx>,
    pub num_files: u32,
    pub num_free_blocks: u32,
}

struct InodeCandidate {
    block: BlockIdx,
    timestamp: Timestamp,
}

pub(crate) fn run<D: FlashDevice>(fsys: &mut Filesystem<D>) -> Result<MountReport, FsError> {
    let geometry = fsys.geometry;
    let mut candidates: Vec<InodeCandidate> = Vec::new();
    let mut max_ts = Timestamp(0);

    for block in 0..geometry.num_blocks {
        if fsys.cache.is_bad_block(block) {
            continue;
        }
        let probe: BlockTypeProbe = fsys.cache.read_pod_spare(block, 0)?;
        if probe.type_id == BlockType::Inode {
            let init: InodeInitSector = fsys.cache.read_pod(block, 0, 0)?;
            if init.timestamp.0 > max_ts.0 {
                max_ts = init.timestamp;
            }
            if init.previous_block == BlockIdx::INVALID {
                candidates.push(InodeCandidate {
                    block: BlockIdx(block),
                    timestamp: init.timestamp,
                });
            }
        } else if probe.type_id == BlockType::File {
            let init: FileInitSector = fsys.cache.read_pod(block, 0, 0)?;
            if init.timestamp.0 > max_ts.0 {
                max_ts = init.timestamp;
            }
        } else {
            let stat: BlockStatSector = fsys.cache.read_pod(block, geometry.blk_stat_sector(), 0)?;
            let age = if stat.is_owned() { stat.age } else { BlockAge(0) };
            fsys.allocator.observe_free_block(block, age);
        }
    }
    fsys.allocator.refresh_mean_free_age();

    if candidates.is_empty() {
        error!("mount", "no inode-0 candidate found during census");
        return Err(FsError::NoInode0);
    }
    candidates.sort_by_key(|c| c.timestamp.0);
    let inode0 = candidates[0].block;
    let orphaned_inode0 = candidates.get(1).map(|c| c.block);

    if let Some(repaired_ts) = repair_inode_chain(fsys, inode0)? {
        if repaired_ts.0 > max_ts.0 {
            max_ts = repaired_ts;
        }
    }

    let mut iter = InodeIterator::init(&mut fsys.cache, inode0)?;
    fsys.allocator.take_known(iter.block(), BlockAge(0));
    let mut current_block = iter.block();
    let mut max_file_id = FileId(0);
    let mut num_files: u32 = 0;

    loop {
        let allocation = iter.read_allocation(&mut fsys.cache)?;
        if allocation.is_erased() {
            break;
        }
        if allocation.timestamp.0 > max_ts.0 {
            max_ts = allocation.timestamp;
        }
        if allocation.file_id.0 > max_file_id.0 {
            max_file_id = allocation.file_id;
        }

        let invalidation = iter.read_invalidation(&mut fsys.cache)?;
        if invalidation.is_erased() {
            num_files += 1;
            if let Some(repaired_ts) = reserve_chain(
                fsys,
                allocation.first_block,
                allocation.first_block_age,
                allocation.file_id,
            )? {
                if repaired_ts.0 > max_ts.0 {
                    max_ts = repaired_ts;
                }
            }
        } else {
            if invalidation.timestamp.0 > max_ts.0 {
                max_ts = invalidation.timestamp;
            }
            // A deletion that was interrupted mid-chain leaves its
            // remaining blocks still typed `File`; resuming the same walk
            // finishes them. Already-reclaimed chains are a no-op here.
            fsys.invalidate_chain(allocation.first_block, allocation.file_id)?;
        }

        let before = (iter.block(), iter.sector());
        iter.next(&mut fsys.cache)?;
        if iter.block() != current_block {
            current_block = iter.block();
            fsys.allocator.take_known(current_block, BlockAge(0));
        }
        if (iter.block(), iter.sector()) == before {
            break;
        }
    }

    fsys.inode0 = inode0;
    fsys.t = max_ts + 1;
    fsys.max_file_id = max_file_id;

    Ok(MountReport {
        orphaned_inode0,
        num_files,
        num_free_blocks: fsys.allocator.num_free_blocks(),
    })
}

/// Walk the inode chain from `inode0` purely via tail links, repairing an
/// interrupted inode-block allocation if one is found (§4.7 Pass 3, INODE
/// kind): the predecessor's tail commit landed but the new block's own
/// init sector never did. At most one such block can exist system-wide
/// (the allocator's `dirty_block` invariant), so finding one ends the
/// walk. The predecessor's own `inode_index` is read directly off media
/// rather than recomputed from an entry-pair count, since the predecessor
/// itself is never the torn write (only its successor can be).
fn repair_inode_chain<D: FlashDevice>(
    fsys: &mut Filesystem<D>,
    inode0: BlockIdx,
) -> Result<Option<Timestamp>, FsError> {
    let mut block = inode0;
    loop {
        let next = fsys.cache.next_block_via_tail(block)?;
        if next == BlockIdx::INVALID {
            return Ok(None);
        }
        let probe: BlockTypeProbe = fsys.cache.read_pod_spare(next.0, 0)?;
        if probe.type_id == BlockType::Inode {
            block = next;
            continue;
        }
        let link: FileTailSector = fsys.cache.read_pod(block.0, fsys.geometry.tail_sector(), 0)?;
        let pred_spare: InodeInitSpare = fsys.cache.read_pod_spare(block.0, 0)?;
        warn!(
            "mount",
            "repairing interrupted inode-block allocation: block {} -> {}",
            block.0,
            next.0
        );
        fsys.cache.write_pod(
            next.0,
            0,
            0,
            &InodeInitSector {
                timestamp: link.timestamp,
                previous_block: block,
            },
        )?;
        fsys.cache.write_pod_spare(
            next.0,
            0,
            &InodeInitSpare {
                type_id: BlockType::Inode,
                inode_index: InodeIndex(pred_spare.inode_index.0 + 1),
            },
        )?;
        fsys.cache.commit()?;
        fsys.allocator.take_known(next, BlockAge(0));
        return Ok(Some(link.timestamp));
    }
}

/// Walk a file's block chain from `first_block`, reserving each block the
/// census may have mistaken for free because its claim spare was never
/// committed before a crash.
///
/// A successor reached via a sealed tail link that does not itself read
/// back as `FILE` is the "last allocation, interrupted" case (§4.7 Pass
/// 3): its predecessor's tail commit landed, but the crash happened before
/// the new block's own init sector was ever written. Such a block is
/// always the chain's end (nothing links `FILE`-claimed blocks onward
/// except their own not-yet-written tail), so it is repaired in place
/// rather than merely reserved, and the timestamp it is sealed with is
/// returned so the caller can fold it into the device-wide sequence.
fn reserve_chain<D: FlashDevice>(
    fsys: &mut Filesystem<D>,
    mut block: BlockIdx,
    mut age: BlockAge,
    file_id: FileId,
) -> Result<Option<Timestamp>, FsError> {
    loop {
        if block == BlockIdx::INVALID {
            return Ok(None);
        }
        fsys.allocator.take_known(block, age);
        let tail: FileTailSector = fsys.cache.read_pod(block.0, fsys.geometry.tail_sector(), 0)?;
        if !tail.has_successor() {
            return Ok(None);
        }
        let probe: BlockTypeProbe = fsys.cache.read_pod_spare(tail.next_block.0, 0)?;
        if probe.type_id != BlockType::File {
            let ts = repair_uninitialized_block(fsys, tail.next_block, tail.next_age, file_id, tail.timestamp)?;
            return Ok(Some(ts));
        }
        age = tail.next_age;
        block = tail.next_block;
    }
}

/// Complete an allocation the predecessor's tail already points to but
/// whose own init sector never landed: write it now with the age and
/// timestamp the predecessor's tail recorded for this allocation, and
/// claim it in the free-block bitmap.
fn repair_uninitialized_block<D: FlashDevice>(
    fsys: &mut Filesystem<D>,
    block: BlockIdx,
    age: BlockAge,
    file_id: FileId,
    timestamp: Timestamp,
) -> Result<Timestamp, FsError> {
    warn!("mount", "repairing interrupted file-block allocation: block {}", block.0);
    fsys.cache.write_pod(
        block.0,
        0,
        0,
        &FileInitSector {
            age,
            file_id,
            timestamp,
        },
    )?;
    fsys.cache.write_pod_spare(
        block.0,
        0,
        &crate::sector::FileInitSpare {
            type_id: BlockType::File,
            nbytes: crate::sector::NumBytes(0),
        },
    )?;
    fsys.cache.commit()?;
    fsys.allocator.take_known(block, age);
    Ok(timestamp)
}
