//! Flash geometry: compile-time defaults plus a runtime-configurable form.
//!
//! Defaults mirror the reference device configuration (512-byte sectors,
//! 4 sectors/page, 64 pages/block, 1024 blocks, a 10-entry preallocation
//! window, 32-byte filenames).

/// Runtime geometry description. Every [`crate::fs::Filesystem`] is
/// parameterized by one of these, so a single binary can mount devices of
/// different declared sizes (and tests can exercise tiny geometries without
/// recompiling).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    pub sector_size: u32,
    pub sectors_per_page: u16,
    pub pages_per_block: u16,
    pub num_blocks: u16,
    pub max_fname_len: u8,
    pub prealloc_size: u8,
}

impl Geometry {
    pub const fn sectors_per_block(&self) -> u16 {
        self.sectors_per_page * self.pages_per_block
    }

    /// Second-to-last sector of a block: forward-link header, written
    /// second to last so it can record `bytes_in_block` once every other
    /// sector in the block is known.
    pub const fn tail_sector(&self) -> u16 {
        self.sectors_per_block() - 2
    }

    /// Last sector of a block: the post-invalidation/reclamation stat
    /// record, written once the block becomes free (or at format time).
    pub const fn blk_stat_sector(&self) -> u16 {
        self.sectors_per_block() - 1
    }

    /// First sector occupied by an inode entry's allocation half; entries
    /// occupy pairs of sectors starting here.
    pub const fn inode_first_entry_sector(&self) -> u16 {
        1
    }
}

impl Default for Geometry {
    fn default() -> Self {
        DefaultGeometry::AS_GEOMETRY
    }
}

/// Zero-sized marker carrying the default geometry as associated
/// constants, for call sites that want const-sized buffers (e.g. the
/// write handle's `sector_buffer`).
pub struct DefaultGeometry;

impl DefaultGeometry {
    pub const SECTOR_SIZE: usize = 512;
    pub const SECTORS_PER_PAGE: u16 = 4;
    pub const PAGES_PER_BLOCK: u16 = 64;
    pub const NUM_BLOCKS: u16 = 1024;
    pub const SECTORS_PER_BLOCK: u16 = Self::SECTORS_PER_PAGE * Self::PAGES_PER_BLOCK;
    pub const MAX_FNAME_LEN: usize = 32;
    pub const PREALLOC_SIZE: usize = 10;
    pub const TAIL_SECTOR: u16 = Self::SECTORS_PER_BLOCK - 2;
    pub const BLK_STAT_SECTOR: u16 = Self::SECTORS_PER_BLOCK - 1;

    pub const AS_GEOMETRY: Geometry = Geometry {
        sector_size: Self::SECTOR_SIZE as u32,
        sectors_per_page: Self::SECTORS_PER_PAGE,
        pages_per_block: Self::PAGES_PER_BLOCK,
        num_blocks: Self::NUM_BLOCKS,
        max_fname_len: Self::MAX_FNAME_LEN as u8,
        prealloc_size: Self::PREALLOC_SIZE as u8,
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_geometry_matches_const_marker() {
        let g = Geometry::default();
        assert_eq!(g.sector_size, DefaultGeometry::SECTOR_SIZE as u32);
        assert_eq!(g.sectors_per_block(), DefaultGeometry::SECTORS_PER_BLOCK);
        assert_eq!(g.tail_sector(), DefaultGeometry::TAIL_SECTOR);
        assert_eq!(g.blk_stat_sector(), DefaultGeometry::BLK_STAT_SECTOR);
    }

    #[test]
    fn small_geometry_is_self_consistent() {
        let g = Geometry {
            sector_size: 64,
            sectors_per_page: 2,
            pages_per_block: 4,
            num_blocks: 16,
            max_fname_len: 16,
            prealloc_size: 3,
        };
        assert_eq!(g.sectors_per_block(), 8);
        assert_eq!(g.tail_sector(), 6);
        assert_eq!(g.blk_stat_sector(), 7);
    }
}
