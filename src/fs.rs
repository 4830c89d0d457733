//! The filesystem core: one owned value per mounted device, holding the
//! page cache, the block allocator, and the slabs of open read/write
//! handles.
//!
//! Organized the way this codebase's `Ext4Fs` owns its superblock and group
//! descriptor table directly (no interior `Arc`/`RwLock` wrapping a handle
//! table on its own) — callers serialize access the ordinary Rust way, by
//! holding `&mut Filesystem<D>`. `allocate_lock`/`delete_lock` remain as
//! `spin::Mutex<()>` fields documenting the two critical sections the
//! original implementation serializes independently of the rest of the
//! filesystem, should a future embedder split this type across threads.

use alloc::string::String;
use alloc::vec::Vec;

use spin::Mutex;

use crate::allocator::{Allocator, BlockAlloc, DirtyBlock};
use crate::error::{FsError, MediaError};
use crate::file::{self, ReadState, WriteState};
use crate::geometry::{DefaultGeometry, Geometry};
use crate::inode::{self, InodeIterator};
use crate::media::{FlashDevice, PageCache};
use crate::recovery::{self, MountReport};
use crate::sector::{
    BlockIdx, BlockStatSector, BlockType, BlockTypeProbe, FileId, FileInitSector,
    FileTailSector, InodeInitSector, InodeInitSpare, InodeInvalidationSector, Timestamp,
};

/// A minimal free-list slab: stable `u32` tokens for open handles, same
/// shape as the slab this crate's ext4 inode cache keeps for live inode
/// references, generalized to own the handle state directly instead of a
/// borrowed reference.
pub(crate) struct Slab<T> {
    slots: Vec<Option<T>>,
    free: Vec<u32>,
}

impl<T> Slab<T> {
    fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
        }
    }

    pub(crate) fn insert(&mut self, value: T) -> u32 {
        if let Some(idx) = self.free.pop() {
            self.slots[idx as usize] = Some(value);
            idx
        } else {
            self.slots.push(Some(value));
            (self.slots.len() - 1) as u32
        }
    }

    pub(crate) fn get(&self, idx: u32) -> Option<&T> {
        self.slots.get(idx as usize).and_then(|s| s.as_ref())
    }

    pub(crate) fn get_mut(&mut self, idx: u32) -> Option<&mut T> {
        self.slots.get_mut(idx as usize).and_then(|s| s.as_mut())
    }

    pub(crate) fn remove(&mut self, idx: u32) -> Option<T> {
        let slot = self.slots.get_mut(idx as usize)?;
        let value = slot.take()?;
        self.free.push(idx);
        Some(value)
    }

    pub(crate) fn put(&mut self, idx: u32, value: T) {
        if (idx as usize) < self.slots.len() {
            self.slots[idx as usize] = Some(value);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FsState {
    Reset,
    Mounted,
}

/// Token for an open read handle, returned by [`Filesystem::open_read`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadFile(pub(crate) u32);

/// Token for an open write handle, returned by [`Filesystem::open_write`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteFile(pub(crate) u32);

pub struct Filesystem<D: FlashDevice> {
    pub(crate) cache: PageCache<D>,
    pub(crate) allocator: Allocator,
    pub(crate) geometry: Geometry,
    state: FsState,
    pub(crate) t: Timestamp,
    pub(crate) max_file_id: FileId,
    pub(crate) inode0: BlockIdx,
    pub(crate) allocate_lock: Mutex<()>,
    delete_lock: Mutex<()>,
    pub(crate) reads: Slab<ReadState>,
    pub(crate) writes: Slab<WriteState>,
}

impl<D: FlashDevice> Filesystem<D> {
    pub fn new(device: D) -> Self {
        let cache = PageCache::new(device);
        let geometry = cache.geometry();
        Self {
            allocator: Allocator::new(geometry),
            cache,
            geometry,
            state: FsState::Reset,
            t: Timestamp(0),
            max_file_id: FileId(0),
            inode0: BlockIdx::INVALID,
            allocate_lock: Mutex::new(()),
            delete_lock: Mutex::new(()),
            reads: Slab::new(),
            writes: Slab::new(),
        }
    }

    pub fn geometry(&self) -> Geometry {
        self.geometry
    }

    pub fn is_mounted(&self) -> bool {
        self.state == FsState::Mounted
    }

    /// Hand the underlying device back to the caller, dropping all open
    /// handles and in-RAM allocator/mount state. Used to simulate a reboot
    /// in tests: the same media can be fed into a fresh `Filesystem` and
    /// remounted without losing anything actually committed to it.
    pub fn into_device(self) -> D {
        self.cache.into_device()
    }

    /// Erase every non-bad block, stamp a stat sector recording its
    /// (preserved, if previously owned) age, and write a fresh inode-0 at
    /// the first usable block. Leaves the filesystem in the `Reset` state;
    /// [`mount`](Self::mount) must still be called before use.
    pub fn format(&mut self) -> Result<(), FsError> {
        let mut first_valid: Option<BlockIdx> = None;
        for block in 0..self.geometry.num_blocks {
            if self.cache.is_bad_block(block) {
                continue;
            }
            let age = match self
                .cache
                .read_pod::<BlockStatSector>(block, self.geometry.blk_stat_sector(), 0)
            {
                Ok(stat) if stat.is_owned() => stat.age,
                Ok(_) => {
                    debug!("format", "block {} stat key unrecognized, treating as never-owned", block);
                    crate::sector::BlockAge(0)
                }
                Err(MediaError::ReadUncorrectable) => {
                    warn!("format", "block {} stat sector uncorrectable, treating as never-owned", block);
                    crate::sector::BlockAge(0)
                }
                Err(e) => return Err(e.into()),
            };
            self.cache.erase_block(block)?;
            self.cache.write_pod(
                block,
                self.geometry.blk_stat_sector(),
                0,
                &BlockStatSector::new_owned(age),
            )?;
            self.cache.commit()?;
            if first_valid.is_none() {
                first_valid = Some(BlockIdx(block));
            }
        }

        let inode0 = first_valid.ok_or(FsError::NoInode0)?;
        self.cache.write_pod(
            inode0.0,
            0,
            0,
            &InodeInitSector {
                timestamp: Timestamp(0),
                previous_block: BlockIdx::INVALID,
            },
        )?;
        self.cache.write_pod_spare(
            inode0.0,
            0,
            &InodeInitSpare {
                type_id: BlockType::Inode,
                inode_index: crate::sector::InodeIndex(0),
            },
        )?;
        self.cache.commit()?;
        self.state = FsState::Reset;
        info!("format", "formatted, inode0 at block {}", inode0.0);
        Ok(())
    }

    /// Run mount-time recovery and bring the filesystem into the `Mounted`
    /// state. Fails with [`FsError::NoInode0`] if no inode chain can be
    /// found (the device has never been formatted, or its directory
    /// metadata is unreadable).
    pub fn mount(&mut self) -> Result<MountReport, FsError> {
        let report = recovery::run(self)?;
        self.state = FsState::Mounted;
        info!(
            "mount",
            "mounted: {} files, {} free blocks",
            report.num_files,
            report.num_free_blocks
        );
        Ok(report)
    }

    pub fn open_read(&mut self, filename: &[u8]) -> Result<ReadFile, FsError> {
        let found = inode::find(&mut self.cache, self.inode0, filename)?.ok_or(FsError::NotFound)?;
        let state = ReadState::open(&mut self.cache, found.first_block, found.file_id)?;
        Ok(ReadFile(self.reads.insert(state)))
    }

    pub fn read(&mut self, handle: ReadFile, dst: &mut [u8]) -> Result<usize, FsError> {
        let state = self.reads.get_mut(handle.0).ok_or(FsError::HandleNotOpen)?;
        Ok(state.read(&mut self.cache, dst)?)
    }

    pub fn close_read(&mut self, handle: ReadFile) -> Result<(), FsError> {
        self.reads.remove(handle.0).ok_or(FsError::HandleNotOpen)?;
        Ok(())
    }

    pub fn open_write(&mut self, filename: &[u8]) -> Result<WriteFile, FsError> {
        if filename.len() >= DefaultGeometry::MAX_FNAME_LEN {
            return Err(FsError::NameTooLong);
        }
        let found = inode::find(&mut self.cache, self.inode0, filename)?;
        let (state, is_new) = match found {
            Some(f) => (
                WriteState::open_existing(&mut self.cache, &mut self.allocator, &mut self.t, f.first_block)?,
                false,
            ),
            None => (self.create_new_file(filename)?, true),
        };
        let block = state.block;
        let token = self.writes.insert(state);
        if is_new {
            self.allocator.set_dirty_block(Some(DirtyBlock { block, owner: token }));
        }
        Ok(WriteFile(token))
    }

    pub fn write(&mut self, handle: WriteFile, src: &[u8]) -> Result<usize, FsError> {
        if self.writes.get(handle.0).is_none() {
            return Err(FsError::HandleNotOpen);
        }
        let mut written = 0usize;
        let mut remaining = src;
        while !remaining.is_empty() {
            let room = self
                .writes
                .get(handle.0)
                .ok_or(FsError::HandleNotOpen)?
                .sector_remaining_bytes as usize;
            if remaining.len() >= room {
                let chunk = &remaining[..room];
                match file::commit_file_sector(self, handle.0, Some(chunk)) {
                    Ok(()) => {
                        written += room;
                        remaining = &remaining[room..];
                    }
                    // The sector itself is already durably sealed by the
                    // time `allocate_block` fails to cross into a new one
                    // (file.rs's `run_commit` commits the sector before
                    // attempting the crossing), so `room` bytes are real
                    // and readable even though the write as a whole falls
                    // short of `src.len()`.
                    Err(FsError::AllocationExhausted) => return Ok(written + room),
                    Err(e) => return Err(e),
                }
            } else {
                let state = self.writes.get_mut(handle.0).ok_or(FsError::HandleNotOpen)?;
                let off = state.offset as usize;
                state.sector_buffer[off..off + remaining.len()].copy_from_slice(remaining);
                state.offset += remaining.len() as u32;
                state.sector_remaining_bytes -= remaining.len() as u32;
                state.bytes_in_block += remaining.len() as u32;
                state.write_head += remaining.len() as u32;
                written += remaining.len();
                remaining = &[];
            }
        }
        Ok(written)
    }

    pub fn close_write(&mut self, handle: WriteFile) -> Result<(), FsError> {
        file::commit_file_sector(self, handle.0, None)?;
        self.writes.remove(handle.0).ok_or(FsError::HandleNotOpen)?;
        self.allocator.clear_dirty_block_if_owned_by(handle.0);
        Ok(())
    }

    /// Missing files are treated as already removed: `rm` of a name that
    /// does not exist succeeds.
    pub fn rm(&mut self, filename: &[u8]) -> Result<(), FsError> {
        let found = match inode::find(&mut self.cache, self.inode0, filename)? {
            Some(f) => f,
            None => return Ok(()),
        };

        let mut last = found.first_block;
        loop {
            let next = self.cache.next_block_via_tail(last)?;
            if next == BlockIdx::INVALID {
                break;
            }
            last = next;
        }

        self.t = self.t + 1;
        let t = self.t;
        let mut iter = InodeIterator::init(&mut self.cache, self.inode0)?;
        loop {
            let allocation = iter.read_allocation(&mut self.cache)?;
            if allocation.is_erased() {
                return Err(FsError::NotFound);
            }
            if allocation.file_id == found.file_id {
                self.cache.write_pod(
                    iter.block().0,
                    iter.sector() + 1,
                    0,
                    &InodeInvalidationSector {
                        timestamp: t,
                        last_block: last,
                    },
                )?;
                self.cache.commit()?;
                break;
            }
            let before = (iter.block(), iter.sector());
            iter.next(&mut self.cache)?;
            if (iter.block(), iter.sector()) == before {
                return Err(FsError::NotFound);
            }
        }

        self.invalidate_chain(found.first_block, found.file_id)
    }

    pub fn start_ls(&mut self) -> Result<ListEntries<'_, D>, FsError> {
        let iter = InodeIterator::init(&mut self.cache, self.inode0)?;
        Ok(ListEntries {
            fs: self,
            iter,
            done: false,
        })
    }

    /// Reclaim every block of a file's chain starting at `base`, walking
    /// forward via each block's own forward link. A block whose type has
    /// already reverted to `Unallocated` (its own reclamation raced ahead
    /// of this call, e.g. during crash recovery's fix-last-deletion pass)
    /// is skipped by following its stat sector's `next_block` instead.
    pub(crate) fn invalidate_chain(&mut self, mut base: BlockIdx, file_id: FileId) -> Result<(), FsError> {
        let _guard = self.delete_lock.lock();
        loop {
            if base == BlockIdx::INVALID {
                break;
            }
            let probe: BlockTypeProbe = self.cache.read_pod_spare(base.0, 0)?;
            if probe.type_id != BlockType::File {
                let stat: BlockStatSector = self.cache.read_pod(base.0, self.geometry.blk_stat_sector(), 0)?;
                base = stat.next_block;
                continue;
            }
            let init: FileInitSector = self.cache.read_pod(base.0, 0, 0)?;
            if init.file_id != file_id {
                break;
            }
            let tail: FileTailSector = self.cache.read_pod(base.0, self.geometry.tail_sector(), 0)?;

            self.cache.erase_block(base.0)?;
            self.cache.write_pod(
                base.0,
                self.geometry.blk_stat_sector(),
                0,
                &BlockStatSector::new_owned(init.age),
            )?;
            self.cache.commit()?;
            self.allocator.reclaim_block(base.0, init.age);

            base = tail.next_block;
        }
        self.allocator.refresh_mean_free_age();
        Ok(())
    }

    /// Flush whichever write handle currently owns the dirty block if it
    /// isn't `owner`, then hand out a fresh block. Failing to find one
    /// meeting `threshold` is reported as [`FsError::AllocationExhausted`].
    pub(crate) fn allocate_block(&mut self, owner: Option<u32>, threshold: i64) -> Result<BlockAlloc, FsError> {
        if let Some(dirty) = self.allocator.dirty_block() {
            if Some(dirty.owner) != owner {
                file::commit_file_sector(self, dirty.owner, None)?;
            }
        }
        let alloc = self.allocator.allocate(&mut self.cache, threshold)?;
        if !alloc.is_valid() {
            return Err(FsError::AllocationExhausted);
        }
        Ok(alloc)
    }

    /// Extend the inode chain to a fresh writable entry slot (allocating a
    /// new inode block first if the chain's tail is full) and populate a
    /// new file's directory entry and first data block.
    fn create_new_file(&mut self, filename: &[u8]) -> Result<WriteState, FsError> {
        let mut iter = InodeIterator::init(&mut self.cache, self.inode0)?;
        loop {
            let allocation = iter.read_allocation(&mut self.cache)?;
            if allocation.is_erased() {
                break;
            }
            let before = (iter.block(), iter.sector());
            iter.next(&mut self.cache)?;
            if (iter.block(), iter.sector()) == before {
                return Err(FsError::InodeTableFull);
            }
        }

        inode::prepare_new(&mut iter, &mut self.cache, &mut self.allocator, &mut self.t)?;

        let alloc = self.allocate_block(None, 0)?;
        self.max_file_id = FileId(self.max_file_id.0 + 1);
        self.t = self.t + 1;
        let age = crate::sector::BlockAge(alloc.age.0.wrapping_add(1));

        let mut name = [0xFFu8; DefaultGeometry::MAX_FNAME_LEN];
        name[..filename.len()].copy_from_slice(filename);
        let allocation = crate::sector::InodeAllocationSector {
            file_id: self.max_file_id,
            first_block: alloc.block,
            first_block_age: age,
            timestamp: self.t,
            filename: name,
        };
        self.cache.write_pod(iter.block().0, iter.sector(), 0, &allocation)?;
        self.cache
            .write_pod_spare(iter.block().0, iter.sector(), &crate::sector::InodeAllocationSpare::sealed())?;
        self.cache.commit()?;

        Ok(WriteState::new(alloc.block, age, self.max_file_id, self.geometry))
    }
}

/// Lazy iterator over live filenames, produced by [`Filesystem::start_ls`].
/// Dropping it (rather than an explicit `stop_ls` call) ends the listing.
pub struct ListEntries<'a, D: FlashDevice> {
    fs: &'a mut Filesystem<D>,
    iter: InodeIterator,
    done: bool,
}

impl<'a, D: FlashDevice> Iterator for ListEntries<'a, D> {
    type Item = Result<String, FsError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        loop {
            let allocation = match self.iter.read_allocation(&mut self.fs.cache) {
                Ok(a) => a,
                Err(e) => {
                    self.done = true;
                    return Some(Err(e.into()));
                }
            };
            if allocation.is_erased() {
                self.done = true;
                return None;
            }
            let invalidation = match self.iter.read_invalidation(&mut self.fs.cache) {
                Ok(i) => i,
                Err(e) => {
                    self.done = true;
                    return Some(Err(e.into()));
                }
            };
            let name = if invalidation.is_erased() {
                Some(allocation.filename_str())
            } else {
                None
            };

            let before = (self.iter.block(), self.iter.sector());
            if let Err(e) = self.iter.next(&mut self.fs.cache) {
                self.done = true;
                return Some(Err(e.into()));
            }
            if (self.iter.block(), self.iter.sector()) == before {
                self.done = true;
            }

            if let Some(n) = name {
                return Some(Ok(n));
            }
            if self.done {
                return None;
            }
        }
    }
}
