//! Flash media abstraction and the page cache layered over it.
//!
//! Every other module touches flash only through [`PageCache`], never
//! through a raw [`FlashDevice`] directly, so "is the right page already
//! open" is decided in exactly one place.

#[cfg(any(test, feature = "test-utils"))]
pub mod ram;

use bytemuck::{Pod, Zeroable};

use crate::error::MediaError;
use crate::geometry::Geometry;
use crate::sector::BlockIdx;

/// Result of reading a sector's payload: ECC outcomes distinguish a clean
/// read from one the hardware silently corrected, from one it could not
/// correct at all. Only the last is a [`MediaError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    Clean,
    Corrected,
}

/// Blocking interface to a raw NAND device.
///
/// One page is "open" at a time; `read_sector`/`write_sector`/`read_spare`/
/// `write_spare` all act on whatever page was last opened with
/// [`open_page`](FlashDevice::open_page). `commit` programs the page;
/// nothing written since the last commit is guaranteed durable before it
/// returns.
pub trait FlashDevice {
    fn geometry(&self) -> Geometry;

    fn open_page(&mut self, block: u16, page: u16) -> Result<(), MediaError>;

    fn read_sector(
        &mut self,
        sector: u16,
        offset: usize,
        dst: &mut [u8],
    ) -> Result<ReadOutcome, MediaError>;

    fn write_sector(&mut self, sector: u16, offset: usize, src: &[u8]) -> Result<(), MediaError>;

    fn read_spare(&mut self, sector: u16, dst: &mut [u8]) -> Result<ReadOutcome, MediaError>;

    fn write_spare(&mut self, sector: u16, src: &[u8]) -> Result<(), MediaError>;

    /// Program the currently open page; nothing written to it is durable
    /// before this returns successfully.
    fn commit(&mut self) -> Result<(), MediaError>;

    fn erase_block(&mut self, block: u16) -> Result<(), MediaError>;

    fn is_bad_block(&self, block: u16) -> bool;

    fn mark_bad_block(&mut self, block: u16) -> Result<(), MediaError>;
}

#[derive(Debug, Clone, Copy)]
struct OpenPage {
    block: u16,
    page: u16,
}

/// Caches the single open page so repeated sector operations against the
/// same page skip the device's open call entirely.
pub struct PageCache<D> {
    device: D,
    open: Option<OpenPage>,
    geometry: Geometry,
}

impl<D: FlashDevice> PageCache<D> {
    pub fn new(device: D) -> Self {
        let geometry = device.geometry();
        Self {
            device,
            open: None,
            geometry,
        }
    }

    pub fn geometry(&self) -> Geometry {
        self.geometry
    }

    /// Unwrap the cache, handing the underlying device back to the caller
    /// (e.g. to remount the same media in a fresh [`crate::fs::Filesystem`]
    /// after simulating a reboot).
    pub fn into_device(self) -> D {
        self.device
    }

    pub fn device_mut(&mut self) -> &mut D {
        &mut self.device
    }

    fn page_of(&self, sector: u16) -> (u16, u16) {
        let block = sector / self.geometry.sectors_per_block();
        let sector_in_block = sector % self.geometry.sectors_per_block();
        let page = sector_in_block / self.geometry.sectors_per_page;
        (block, page)
    }

    /// Open the page containing `sector` of `block`; a no-op if that page
    /// is already cached.
    pub fn open_sector(&mut self, block: u16, sector: u16) -> Result<(), MediaError> {
        let sector_in_block = sector % self.geometry.sectors_per_block();
        let page = sector_in_block / self.geometry.sectors_per_page;
        self.open_page(block, page)
    }

    pub fn open_page(&mut self, block: u16, page: u16) -> Result<(), MediaError> {
        if let Some(open) = self.open {
            if open.block == block && open.page == page {
                return Ok(());
            }
        }
        self.device.open_page(block, page)?;
        self.open = Some(OpenPage { block, page });
        Ok(())
    }

    /// Drop the cache's notion of an open page without touching the
    /// device; used before an erase invalidates whatever page might be
    /// cached for that block.
    pub fn close_sector(&mut self) {
        self.open = None;
    }

    pub fn read_sector(
        &mut self,
        sector: u16,
        offset: usize,
        dst: &mut [u8],
    ) -> Result<ReadOutcome, MediaError> {
        let sector_in_page = sector % self.geometry.sectors_per_page;
        self.device.read_sector(sector_in_page, offset, dst)
    }

    pub fn write_sector(
        &mut self,
        sector: u16,
        offset: usize,
        src: &[u8],
    ) -> Result<(), MediaError> {
        let sector_in_page = sector % self.geometry.sectors_per_page;
        self.device.write_sector(sector_in_page, offset, src)
    }

    pub fn read_spare(&mut self, sector: u16, dst: &mut [u8]) -> Result<ReadOutcome, MediaError> {
        let sector_in_page = sector % self.geometry.sectors_per_page;
        self.device.read_spare(sector_in_page, dst)
    }

    pub fn write_spare(&mut self, sector: u16, src: &[u8]) -> Result<(), MediaError> {
        let sector_in_page = sector % self.geometry.sectors_per_page;
        self.device.write_spare(sector_in_page, src)
    }

    pub fn commit(&mut self) -> Result<(), MediaError> {
        self.device.commit()
    }

    pub fn erase_block(&mut self, block: u16) -> Result<(), MediaError> {
        self.close_sector();
        self.device.erase_block(block)
    }

    pub fn is_bad_block(&self, block: u16) -> bool {
        self.device.is_bad_block(block)
    }

    pub fn mark_bad_block(&mut self, block: u16) -> Result<(), MediaError> {
        self.device.mark_bad_block(block)
    }

    /// Follow a universal (block-stat-style or tail-style) forward link:
    /// open the tail sector of `block` and read the `next_block` field at
    /// offset 0. Returns `BlockIdx::INVALID` unchanged without touching
    /// the device.
    pub fn next_block_via_tail(&mut self, block: BlockIdx) -> Result<BlockIdx, MediaError> {
        if block == BlockIdx::INVALID {
            return Ok(block);
        }
        let tail = self.geometry.tail_sector();
        self.open_sector(block.0, tail)?;
        let mut buf = [0u8; 2];
        self.read_sector(tail, 0, &mut buf)?;
        Ok(BlockIdx(u16::from_ne_bytes(buf)))
    }

    /// Open `sector` of `block` and decode its payload at `offset` as `T`.
    pub fn read_pod<T: Pod + Zeroable>(
        &mut self,
        block: u16,
        sector: u16,
        offset: usize,
    ) -> Result<T, MediaError> {
        self.open_sector(block, sector)?;
        let mut value = T::zeroed();
        self.read_sector(sector, offset, bytemuck::bytes_of_mut(&mut value))?;
        Ok(value)
    }

    /// Open `sector` of `block` and encode `value` into its payload at
    /// `offset`; does not commit.
    pub fn write_pod<T: Pod>(
        &mut self,
        block: u16,
        sector: u16,
        offset: usize,
        value: &T,
    ) -> Result<(), MediaError> {
        self.open_sector(block, sector)?;
        self.write_sector(sector, offset, bytemuck::bytes_of(value))
    }

    /// Open `sector` of `block` and decode its spare bytes as `T`.
    pub fn read_pod_spare<T: Pod + Zeroable>(
        &mut self,
        block: u16,
        sector: u16,
    ) -> Result<T, MediaError> {
        self.open_sector(block, sector)?;
        let mut value = T::zeroed();
        self.read_spare(sector, bytemuck::bytes_of_mut(&mut value))?;
        Ok(value)
    }

    /// Open `sector` of `block` and encode `value` into its spare bytes;
    /// does not commit.
    pub fn write_pod_spare<T: Pod>(
        &mut self,
        block: u16,
        sector: u16,
        value: &T,
    ) -> Result<(), MediaError> {
        self.open_sector(block, sector)?;
        self.write_spare(sector, bytemuck::bytes_of(value))
    }
}
