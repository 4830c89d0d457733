//! In-memory [`FlashDevice`] used by this crate's own test suite.
//!
//! There is no precedent in this codebase for testing a storage engine —
//! the kernel this crate's other modules were grounded on runs its
//! filesystem code only under QEMU and carries no unit tests of its own.
//! This mock follows the general convention for a `no_std` storage crate:
//! back it with a `Vec<u8>`, model erase as setting bytes to `0xFF`, and
//! optionally inject faults so recovery paths can be exercised
//! deterministically.

extern crate std;

use std::vec;
use std::vec::Vec;

use crate::error::MediaError;
use crate::geometry::Geometry;
use crate::media::{FlashDevice, ReadOutcome};

/// A fault to inject on a specific `(block, page)` commit: the page is
/// written only up to `torn_at` bytes, simulating a power loss mid-program.
#[derive(Debug, Clone, Copy)]
pub struct TornCommit {
    pub block: u16,
    pub page: u16,
    pub torn_at: usize,
}

pub struct RamFlash {
    geometry: Geometry,
    /// One contiguous region per block: `num_blocks * pages_per_block *
    /// sectors_per_page * sector_size` payload bytes, plus a fixed-size
    /// spare region per sector appended after all payload.
    payload: Vec<u8>,
    spare: Vec<u8>,
    bad_blocks: Vec<bool>,
    open: Option<(u16, u16)>,
    staged_payload: Vec<u8>,
    staged_spare: Vec<u8>,
    spare_size: usize,
    torn_commits: Vec<TornCommit>,
}

impl RamFlash {
    pub fn new(geometry: Geometry) -> Self {
        Self::with_spare_size(geometry, 16)
    }

    pub fn with_spare_size(geometry: Geometry, spare_size: usize) -> Self {
        let sectors_per_block = geometry.sectors_per_block() as usize;
        let total_sectors = geometry.num_blocks as usize * sectors_per_block;
        let payload = vec![0xFFu8; total_sectors * geometry.sector_size as usize];
        let spare = vec![0xFFu8; total_sectors * spare_size];
        Self {
            geometry,
            payload,
            spare,
            bad_blocks: vec![false; geometry.num_blocks as usize],
            open: None,
            staged_payload: vec![0xFFu8; geometry.sectors_per_page as usize * geometry.sector_size as usize],
            staged_spare: vec![0xFFu8; geometry.sectors_per_page as usize * spare_size],
            spare_size,
            torn_commits: Vec::new(),
        }
    }

    pub fn inject_torn_commit(&mut self, fault: TornCommit) {
        self.torn_commits.push(fault);
    }

    pub fn mark_bad_for_test(&mut self, block: u16) {
        self.bad_blocks[block as usize] = true;
    }

    fn global_sector(&self, block: u16, page: u16, sector_in_page: u16) -> usize {
        let sectors_per_block = self.geometry.sectors_per_block() as usize;
        block as usize * sectors_per_block
            + page as usize * self.geometry.sectors_per_page as usize
            + sector_in_page as usize
    }
}

impl FlashDevice for RamFlash {
    fn geometry(&self) -> Geometry {
        self.geometry
    }

    fn open_page(&mut self, block: u16, page: u16) -> Result<(), MediaError> {
        if block >= self.geometry.num_blocks || page >= self.geometry.pages_per_block {
            return Err(MediaError::OutOfRange);
        }
        if self.bad_blocks[block as usize] {
            return Err(MediaError::BadBlock);
        }
        // Load the page's current contents into the staging buffers so a
        // partial write (payload only, spare untouched) is possible.
        let sector_size = self.geometry.sector_size as usize;
        for s in 0..self.geometry.sectors_per_page {
            let g = self.global_sector(block, page, s);
            let dst = &mut self.staged_payload[s as usize * sector_size..(s as usize + 1) * sector_size];
            dst.copy_from_slice(&self.payload[g * sector_size..(g + 1) * sector_size]);
            let sdst =
                &mut self.staged_spare[s as usize * self.spare_size..(s as usize + 1) * self.spare_size];
            sdst.copy_from_slice(&self.spare[g * self.spare_size..(g + 1) * self.spare_size]);
        }
        self.open = Some((block, page));
        Ok(())
    }

    fn read_sector(
        &mut self,
        sector: u16,
        offset: usize,
        dst: &mut [u8],
    ) -> Result<ReadOutcome, MediaError> {
        let sector_size = self.geometry.sector_size as usize;
        let base = sector as usize * sector_size + offset;
        dst.copy_from_slice(&self.staged_payload[base..base + dst.len()]);
        Ok(ReadOutcome::Clean)
    }

    fn write_sector(&mut self, sector: u16, offset: usize, src: &[u8]) -> Result<(), MediaError> {
        let sector_size = self.geometry.sector_size as usize;
        let base = sector as usize * sector_size + offset;
        self.staged_payload[base..base + src.len()].copy_from_slice(src);
        Ok(())
    }

    fn read_spare(&mut self, sector: u16, dst: &mut [u8]) -> Result<ReadOutcome, MediaError> {
        let base = sector as usize * self.spare_size;
        dst.copy_from_slice(&self.staged_spare[base..base + dst.len()]);
        Ok(ReadOutcome::Clean)
    }

    fn write_spare(&mut self, sector: u16, src: &[u8]) -> Result<(), MediaError> {
        let base = sector as usize * self.spare_size;
        self.staged_spare[base..base + src.len()].copy_from_slice(src);
        Ok(())
    }

    fn commit(&mut self) -> Result<(), MediaError> {
        let (block, page) = self.open.ok_or(MediaError::OutOfRange)?;
        let sector_size = self.geometry.sector_size as usize;
        let torn = self
            .torn_commits
            .iter()
            .position(|f| f.block == block && f.page == page)
            .map(|i| self.torn_commits.remove(i));

        let bytes_per_page = self.geometry.sectors_per_page as usize * sector_size;
        let write_len = torn.map(|f| f.torn_at.min(bytes_per_page)).unwrap_or(bytes_per_page);

        for s in 0..self.geometry.sectors_per_page {
            let g = self.global_sector(block, page, s);
            let sector_start = s as usize * sector_size;
            let sector_end = sector_start + sector_size;
            let take = write_len.saturating_sub(sector_start).min(sector_size);
            if take > 0 {
                self.payload[g * sector_size..g * sector_size + take]
                    .copy_from_slice(&self.staged_payload[sector_start..sector_start + take]);
            }
            if torn.is_none() {
                let sbase = s as usize * self.spare_size;
                self.spare[g * self.spare_size..(g + 1) * self.spare_size]
                    .copy_from_slice(&self.staged_spare[sbase..sbase + self.spare_size]);
            }
            let _ = sector_end;
        }
        Ok(())
    }

    fn erase_block(&mut self, block: u16) -> Result<(), MediaError> {
        if block >= self.geometry.num_blocks {
            return Err(MediaError::OutOfRange);
        }
        if self.bad_blocks[block as usize] {
            return Err(MediaError::BadBlock);
        }
        let sector_size = self.geometry.sector_size as usize;
        let sectors_per_block = self.geometry.sectors_per_block() as usize;
        let start = block as usize * sectors_per_block;
        for s in start..start + sectors_per_block {
            self.payload[s * sector_size..(s + 1) * sector_size].fill(0xFF);
            self.spare[s * self.spare_size..(s + 1) * self.spare_size].fill(0xFF);
        }
        self.open = None;
        Ok(())
    }

    fn is_bad_block(&self, block: u16) -> bool {
        self.bad_blocks[block as usize]
    }

    fn mark_bad_block(&mut self, block: u16) -> Result<(), MediaError> {
        self.bad_blocks[block as usize] = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::PageCache;

    fn small_geometry() -> Geometry {
        Geometry {
            sector_size: 64,
            sectors_per_page: 2,
            pages_per_block: 4,
            num_blocks: 8,
            max_fname_len: 16,
            prealloc_size: 3,
        }
    }

    #[test]
    fn erase_then_read_is_all_ff() {
        let geometry = small_geometry();
        let mut cache = PageCache::new(RamFlash::new(geometry));
        cache.erase_block(0).unwrap();
        cache.open_sector(0, 0).unwrap();
        let mut buf = [0u8; 8];
        cache.read_sector(0, 0, &mut buf).unwrap();
        assert_eq!(buf, [0xFF; 8]);
    }

    #[test]
    fn write_then_read_round_trips() {
        let geometry = small_geometry();
        let mut cache = PageCache::new(RamFlash::new(geometry));
        cache.erase_block(0).unwrap();
        cache.open_sector(0, 0).unwrap();
        cache.write_sector(0, 0, b"hello!!!").unwrap();
        cache.commit().unwrap();
        cache.open_sector(0, 0).unwrap();
        let mut buf = [0u8; 8];
        cache.read_sector(0, 0, &mut buf).unwrap();
        assert_eq!(&buf, b"hello!!!");
    }

    #[test]
    fn torn_commit_loses_payload_but_not_reported_as_error() {
        let geometry = small_geometry();
        let mut device = RamFlash::new(geometry);
        device.inject_torn_commit(TornCommit {
            block: 0,
            page: 0,
            torn_at: 4,
        });
        let mut cache = PageCache::new(device);
        cache.erase_block(0).unwrap();
        cache.open_sector(0, 0).unwrap();
        cache.write_sector(0, 0, b"hello!!!").unwrap();
        cache.commit().unwrap();
        cache.open_sector(0, 0).unwrap();
        let mut buf = [0u8; 8];
        cache.read_sector(0, 0, &mut buf).unwrap();
        assert_eq!(&buf[..4], b"hell");
        assert_eq!(&buf[4..], [0xFF; 4]);
    }

    #[test]
    fn bad_block_rejects_open() {
        let geometry = small_geometry();
        let mut device = RamFlash::new(geometry);
        device.mark_bad_for_test(2);
        let mut cache = PageCache::new(device);
        assert!(cache.open_sector(2, 0).is_err());
    }
}
