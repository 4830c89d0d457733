//! Read and write handle state machines, and the append-commit sequence
//! that seals one sector of a file block at a time.
//!
//! A file block's data sectors are numbered 0..=`tail_sector`-1
//! (`tail_sector` itself holds the forward link, `blk_stat_sector` the
//! post-reclamation record). Sector 0 doubles up: it opens with the
//! block's own [`FileInitSector`] header and carries payload in the
//! remaining `SECTOR_SIZE - size_of::<FileInitSector>()` bytes, same as
//! every other data sector carries payload in all of its bytes. Once a
//! sector's spare `nbytes` is committed it is never rewritten; appending
//! to a file after reopening it always resumes at the next still-erased
//! sector rather than patching a sealed one.

use core::mem::size_of;

use alloc::vec;
use alloc::vec::Vec;

use crate::allocator::Allocator;
use crate::error::{FsError, MediaError};
use crate::fs::Filesystem;
use crate::geometry::Geometry;
use crate::media::{FlashDevice, PageCache};
use crate::sector::{
    BlockAge, BlockIdx, BlockType, FileDataSpare, FileId, FileInitSector, FileInitSpare,
    FileTailSector, NumBytes, Timestamp,
};

/// Step to the next data sector within the current block. Returns `None`
/// once stepping would land on the tail sector, leaving it to the caller
/// to follow (or write) the block's forward link instead.
fn increment_sector(sector: u16, geometry: Geometry) -> Option<u16> {
    if sector + 1 >= geometry.tail_sector() {
        None
    } else {
        Some(sector + 1)
    }
}

/// Byte offset the payload starts at within a given sector: sector 0 opens
/// with the block's own [`FileInitSector`] header, so its payload begins
/// right after it; every other data sector is payload from byte 0.
fn sector_header_len(sector: u16) -> usize {
    if sector == 0 {
        size_of::<FileInitSector>()
    } else {
        0
    }
}

/// Cursor over one file's data, reading forward only.
pub struct ReadState {
    block: BlockIdx,
    file_id: FileId,
    sector: u16,
    offset: u32,
    sector_len: u32,
    done: bool,
}

impl ReadState {
    pub fn open<D: FlashDevice>(
        cache: &mut PageCache<D>,
        first_block: BlockIdx,
        file_id: FileId,
    ) -> Result<Self, MediaError> {
        let mut state = Self {
            block: first_block,
            file_id,
            sector: 0,
            offset: 0,
            sector_len: 0,
            done: false,
        };
        state.load_current_sector(cache)?;
        Ok(state)
    }

    fn load_current_sector<D: FlashDevice>(
        &mut self,
        cache: &mut PageCache<D>,
    ) -> Result<(), MediaError> {
        if self.done {
            return Ok(());
        }
        let nbytes = if self.sector == 0 {
            let spare: FileInitSpare = cache.read_pod_spare(self.block.0, 0)?;
            spare.nbytes
        } else {
            let spare: FileDataSpare = cache.read_pod_spare(self.block.0, self.sector)?;
            spare.nbytes
        };
        if nbytes == NumBytes::EMPTY {
            self.done = true;
            self.sector_len = 0;
            self.offset = 0;
        } else {
            self.sector_len = nbytes.0 as u32;
            self.offset = 0;
        }
        Ok(())
    }

    /// Step to the next sector holding this file's data, verifying a
    /// cross-block link against `file_id` before following it: a block
    /// whose own init header names a different file is not this file's
    /// data, whatever the predecessor's tail link says, and ends the read
    /// the same as a missing successor would.
    fn advance<D: FlashDevice>(&mut self, cache: &mut PageCache<D>) -> Result<(), MediaError> {
        let geometry = cache.geometry();
        match increment_sector(self.sector, geometry) {
            Some(s) => self.sector = s,
            None => {
                let tail: FileTailSector = cache.read_pod(self.block.0, geometry.tail_sector(), 0)?;
                if !tail.has_successor() {
                    self.done = true;
                    self.sector_len = 0;
                    self.offset = 0;
                    return Ok(());
                }
                let next_init: FileInitSector = cache.read_pod(tail.next_block.0, 0, 0)?;
                if next_init.file_id != self.file_id {
                    self.done = true;
                    self.sector_len = 0;
                    self.offset = 0;
                    return Ok(());
                }
                self.block = tail.next_block;
                self.sector = 0;
            }
        }
        self.load_current_sector(cache)
    }

    /// Read up to `dst.len()` bytes, returning the number actually read
    /// (0 once the file's last written sector is exhausted).
    pub fn read<D: FlashDevice>(
        &mut self,
        cache: &mut PageCache<D>,
        dst: &mut [u8],
    ) -> Result<usize, MediaError> {
        let mut written = 0usize;
        while written < dst.len() && !self.done {
            if self.offset >= self.sector_len {
                self.advance(cache)?;
                continue;
            }
            let take = (self.sector_len - self.offset).min((dst.len() - written) as u32) as usize;
            let device_offset = sector_header_len(self.sector) + self.offset as usize;
            cache.open_sector(self.block.0, self.sector)?;
            cache.read_sector(self.sector, device_offset, &mut dst[written..written + take])?;
            self.offset += take as u32;
            written += take;
        }
        Ok(written)
    }
}

/// Cursor over one file's in-progress append, holding exactly one sector's
/// worth of unflushed bytes in `sector_buffer`.
pub struct WriteState {
    pub(crate) block: BlockIdx,
    age: BlockAge,
    file_id: FileId,
    sector: u16,
    sector_buffer: Vec<u8>,
    pub(crate) offset: u32,
    pub(crate) sector_remaining_bytes: u32,
    bytes_in_block: u32,
    write_head: u32,
    block_initialized: bool,
    sector_committed: bool,
}

impl WriteState {
    /// Begin a brand new file at `block`, whose init sector has not yet
    /// been written.
    pub fn new(block: BlockIdx, age: BlockAge, file_id: FileId, geometry: Geometry) -> Self {
        let header_len = sector_header_len(0) as u32;
        Self {
            block,
            age,
            file_id,
            sector: 0,
            sector_buffer: vec![0u8; geometry.sector_size as usize],
            offset: header_len,
            sector_remaining_bytes: geometry.sector_size - header_len,
            bytes_in_block: 0,
            write_head: 0,
            block_initialized: false,
            sector_committed: false,
        }
    }

    /// Resume appending to an existing file: walk its block chain to the
    /// end, then scan forward to the first unwritten data sector. If the
    /// last block turns out to already be completely full, a fresh block
    /// is allocated and linked right away so the cursor always lands on
    /// room to write into.
    pub fn open_existing<D: FlashDevice>(
        cache: &mut PageCache<D>,
        allocator: &mut Allocator,
        t: &mut Timestamp,
        first_block: BlockIdx,
    ) -> Result<Self, FsError> {
        let geometry = cache.geometry();
        let mut block = first_block;
        loop {
            let tail: FileTailSector = cache.read_pod(block.0, geometry.tail_sector(), 0)?;
            if tail.has_successor() {
                block = tail.next_block;
            } else {
                break;
            }
        }
        let init: FileInitSector = cache.read_pod(block.0, 0, 0)?;
        let file_id = init.file_id;

        // Sector 0's own init spare tells us whether its payload was ever
        // committed; a last block can be `!block_full` yet still have never
        // had sector 0 written at all (left behind by a close that crossed
        // into a fresh block without writing anything further into it).
        let init_spare: FileInitSpare = cache.read_pod_spare(block.0, 0)?;
        let mut sector0_written = init_spare.nbytes != NumBytes::EMPTY;
        let mut sector = 0u16;
        let mut bytes_in_block = 0u32;
        let mut block_full = false;
        if sector0_written {
            bytes_in_block += init_spare.nbytes.0 as u32;
            match increment_sector(sector, geometry) {
                Some(s) => sector = s,
                None => block_full = true,
            }
        }
        while !block_full && sector0_written {
            let spare: FileDataSpare = cache.read_pod_spare(block.0, sector)?;
            if spare.nbytes == NumBytes::EMPTY {
                break;
            }
            bytes_in_block += spare.nbytes.0 as u32;
            match increment_sector(sector, geometry) {
                Some(s) => sector = s,
                None => {
                    block_full = true;
                    break;
                }
            }
        }

        let mut age = init.age;
        if block_full {
            let alloc = allocator.allocate(cache, 0)?;
            if !alloc.is_valid() {
                return Err(FsError::AllocationExhausted);
            }
            *t = *t + 1;
            let link = FileTailSector {
                next_block: alloc.block,
                next_age: alloc.age,
                timestamp: *t,
                bytes_in_block,
            };
            cache.write_pod(block.0, geometry.tail_sector(), 0, &link)?;
            cache.commit()?;
            block = alloc.block;
            age = BlockAge(alloc.age.0.wrapping_add(1));
            sector = 0;
            bytes_in_block = 0;
            sector0_written = false;
        }

        let header_len = sector_header_len(sector) as u32;
        Ok(Self {
            block,
            age,
            file_id,
            sector,
            sector_buffer: vec![0u8; geometry.sector_size as usize],
            offset: header_len,
            sector_remaining_bytes: geometry.sector_size - header_len,
            bytes_in_block,
            write_head: bytes_in_block,
            block_initialized: if block_full { false } else { sector0_written },
            sector_committed: false,
        })
    }
}

/// Fold `data` (if any) into `owner`'s pending sector, then flush whatever
/// is buffered to flash. A full buffer always gets sealed; a partial one
/// is sealed only when `data` is `None` (an explicit close, or a forced
/// flush so another handle can take over the device's single write slot).
/// Crossing into a new block happens automatically once the current one
/// fills; a close that finds the last sector already sealed with nowhere
/// new to put data does not force that crossing, so a handle left behind
/// by an allocation failure can still be closed once its caller gives up
/// on writing more. The handle is always put back into its slab before
/// returning, including on error, so a failed allocation never strands it.
pub(crate) fn commit_file_sector<D: FlashDevice>(
    fsys: &mut Filesystem<D>,
    owner: u32,
    data: Option<&[u8]>,
) -> Result<(), FsError> {
    let mut state = fsys.writes.remove(owner).ok_or(FsError::HandleNotOpen)?;
    let result = run_commit(fsys, &mut state, owner, data);
    fsys.writes.put(owner, state);
    if result.is_ok() {
        fsys.allocator.clear_dirty_block_if_owned_by(owner);
    }
    result
}

fn run_commit<D: FlashDevice>(
    fsys: &mut Filesystem<D>,
    state: &mut WriteState,
    owner: u32,
    data: Option<&[u8]>,
) -> Result<(), FsError> {
    if let Some(chunk) = data {
        let off = state.offset as usize;
        state.sector_buffer[off..off + chunk.len()].copy_from_slice(chunk);
        state.offset += chunk.len() as u32;
        state.sector_remaining_bytes -= chunk.len() as u32;
        state.bytes_in_block += chunk.len() as u32;
        state.write_head += chunk.len() as u32;
    }

    let header_len = sector_header_len(state.sector) as u32;
    if state.offset == header_len {
        return Ok(());
    }

    // A prior commit already sealed this sector but could not cross into a
    // new block (allocator exhausted). There is nothing left to flush: an
    // explicit close should release the handle rather than retry the
    // crossing that only a fresh `write` actually needs.
    if data.is_none() && state.sector_committed {
        return Ok(());
    }

    if !state.sector_committed {
        let payload_start = header_len as usize;
        let payload_len = state.offset - header_len;
        fsys.cache.open_sector(state.block.0, state.sector)?;
        if state.sector == 0 && !state.block_initialized {
            let init = FileInitSector {
                age: state.age,
                file_id: state.file_id,
                timestamp: fsys.t,
            };
            fsys.cache.write_pod(state.block.0, 0, 0, &init)?;
        }
        fsys.cache.write_sector(
            state.sector,
            payload_start,
            &state.sector_buffer[payload_start..state.offset as usize],
        )?;
        if state.sector == 0 {
            fsys.cache.write_pod_spare(
                state.block.0,
                0,
                &FileInitSpare {
                    type_id: BlockType::File,
                    nbytes: NumBytes(payload_len as u16),
                },
            )?;
        } else {
            fsys.cache.write_pod_spare(
                state.block.0,
                state.sector,
                &FileDataSpare {
                    nbytes: NumBytes(payload_len as u16),
                },
            )?;
        }
        fsys.cache.commit()?;
        state.sector_committed = true;
        state.block_initialized = true;
    }

    match increment_sector(state.sector, fsys.geometry) {
        Some(s) => {
            state.sector = s;
            reset_buffer(state, fsys.geometry);
            Ok(())
        }
        None => {
            let alloc = fsys.allocate_block(Some(owner), 0)?;
            fsys.t = fsys.t + 1;
            let link = FileTailSector {
                next_block: alloc.block,
                next_age: alloc.age,
                timestamp: fsys.t,
                bytes_in_block: state.bytes_in_block,
            };
            fsys.cache.write_pod(state.block.0, fsys.geometry.tail_sector(), 0, &link)?;
            fsys.cache.commit()?;

            state.block = alloc.block;
            state.age = BlockAge(alloc.age.0.wrapping_add(1));
            state.sector = 0;
            state.bytes_in_block = 0;
            state.block_initialized = false;
            reset_buffer(state, fsys.geometry);
            Ok(())
        }
    }
}

fn reset_buffer(state: &mut WriteState, geometry: Geometry) {
    let header_len = sector_header_len(state.sector) as u32;
    state.offset = header_len;
    state.sector_remaining_bytes = geometry.sector_size - header_len;
    state.sector_committed = false;
    for b in state.sector_buffer.iter_mut() {
        *b = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::Geometry;

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

    #[test]
    fn increment_sector_walks_every_data_sector_then_stops_at_tail() {
        let g = small_geometry();
        assert_eq!(g.tail_sector(), 6);
        assert_eq!(increment_sector(0, g), Some(1));
        assert_eq!(increment_sector(1, g), Some(2));
        assert_eq!(increment_sector(2, g), Some(3));
        assert_eq!(increment_sector(3, g), Some(4));
        assert_eq!(increment_sector(4, g), Some(5));
        assert_eq!(increment_sector(5, g), None);
    }
}
