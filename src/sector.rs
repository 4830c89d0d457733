//! Typed views over the on-media sector layouts.
//!
//! Every on-disk field gets its own `#[repr(transparent)]` newtype
//! deriving [`bytemuck::Pod`]/[`bytemuck::Zeroable`], following the pattern
//! used throughout this codebase's inode layout: no raw primitive ever sits
//! directly in a composite sector struct, so a sentinel (`INVALID`, `EMPTY`)
//! is always named rather than a bare `0xFFFF` scattered through call
//! sites.

use bytemuck::{Pod, Zeroable};
use pod_enum::pod_enum;

use crate::geometry::DefaultGeometry;

macro_rules! newtype_field {
    ($name:ident, $repr:ty) => {
        #[derive(Clone, Copy, Debug, Default, Eq, PartialEq, PartialOrd, Ord, Hash, Pod, Zeroable)]
        #[repr(transparent)]
        pub struct $name(pub $repr);

        impl From<$name> for $repr {
            fn from(v: $name) -> $repr {
                v.0
            }
        }

        impl From<$repr> for $name {
            fn from(v: $repr) -> $name {
                $name(v)
            }
        }
    };
}

newtype_field!(BlockIdx, u16);
newtype_field!(BlockAge, u32);
newtype_field!(Timestamp, u32);
newtype_field!(FileId, u32);
newtype_field!(InodeIndex, u16);
newtype_field!(NumBytes, u16);

impl BlockIdx {
    pub const INVALID: Self = Self(0xFFFF);
}

impl BlockAge {
    pub const INVALID: Self = Self(0xFFFF_FFFF);
}

impl Timestamp {
    pub const INVALID: Self = Self(0xFFFF_FFFF);
}

impl FileId {
    pub const INVALID: Self = Self(0xFFFF_FFFF);
}

impl InodeIndex {
    pub const INVALID: Self = Self(0xFFFF);
}

impl NumBytes {
    /// Sentinel spare value meaning "sector never written".
    pub const EMPTY: Self = Self(0xFFFF);
}

impl core::ops::Add<u32> for Timestamp {
    type Output = Timestamp;
    fn add(self, rhs: u32) -> Timestamp {
        Timestamp(self.0.wrapping_add(rhs))
    }
}

impl core::ops::Add<u32> for BlockAge {
    type Output = BlockAge;
    fn add(self, rhs: u32) -> BlockAge {
        BlockAge(self.0.wrapping_add(rhs))
    }
}

/// Block-level claim marker, stored in the spare bytes of a block's init
/// sector. Any byte value besides the three known ones decodes to
/// `Unknown`, so a torn or garbage spare byte never produces undefined
/// behavior, only a block the allocator treats as claimed-but-foreign.
#[pod_enum]
#[repr(u8)]
pub enum BlockType {
    Unallocated = 0xFF,
    Inode = 1,
    File = 2,
}

impl Default for BlockType {
    fn default() -> Self {
        BlockType::Unallocated
    }
}

/// Marker written in an inode allocation sector's spare once the sector
/// is fully committed.
pub const COPY_COMPLETE_MARKER: u8 = 0x55;

/// Sector 0 of an inode block: links back to the previous inode block and
/// carries the block's own seal timestamp.
#[derive(Clone, Copy, Debug, Default, Pod, Zeroable)]
#[repr(C)]
pub struct InodeInitSector {
    pub timestamp: Timestamp,
    pub previous_block: BlockIdx,
}

#[derive(Clone, Copy, Debug, Default, Pod, Zeroable)]
#[repr(C)]
pub struct InodeInitSpare {
    pub type_id: BlockType,
    pub inode_index: InodeIndex,
}

/// Allocation half of one directory entry.
#[derive(Clone, Copy, Pod, Zeroable)]
#[repr(C)]
pub struct InodeAllocationSector {
    pub file_id: FileId,
    pub first_block: BlockIdx,
    pub first_block_age: BlockAge,
    pub timestamp: Timestamp,
    pub filename: [u8; DefaultGeometry::MAX_FNAME_LEN],
}

impl Default for InodeAllocationSector {
    fn default() -> Self {
        Self {
            file_id: FileId::INVALID,
            first_block: BlockIdx::INVALID,
            first_block_age: BlockAge::INVALID,
            timestamp: Timestamp::INVALID,
            filename: [0xFFu8; DefaultGeometry::MAX_FNAME_LEN],
        }
    }
}

impl core::fmt::Debug for InodeAllocationSector {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("InodeAllocationSector")
            .field("file_id", &self.file_id)
            .field("first_block", &self.first_block)
            .field("first_block_age", &self.first_block_age)
            .field("timestamp", &self.timestamp)
            .field("filename", &self.filename_str())
            .finish()
    }
}

impl InodeAllocationSector {
    /// Valid filename bytes, stopping at the first `0x00` or `0xFF`
    /// (erased flash reads back as `0xFF`, so an entry whose name was
    /// never committed must not be mistaken for a zero-length name).
    pub fn filename_bytes(&self) -> &[u8] {
        let end = self
            .filename
            .iter()
            .position(|&b| b == 0 || b == 0xFF)
            .unwrap_or(self.filename.len());
        &self.filename[..end]
    }

    #[cfg(feature = "alloc")]
    pub fn filename_str(&self) -> alloc::string::String {
        alloc::string::String::from_utf8_lossy(self.filename_bytes()).into_owned()
    }

    #[cfg(not(feature = "alloc"))]
    pub fn filename_str(&self) -> &str {
        core::str::from_utf8(self.filename_bytes()).unwrap_or("")
    }

    pub fn is_erased(&self) -> bool {
        self.file_id == FileId::INVALID
    }
}

#[derive(Clone, Copy, Debug, Default, Pod, Zeroable)]
#[repr(C)]
pub struct InodeAllocationSpare {
    pub copy_complete_marker: u8,
    _pad: [u8; 3],
}

impl InodeAllocationSpare {
    pub fn sealed() -> Self {
        Self {
            copy_complete_marker: COPY_COMPLETE_MARKER,
            _pad: [0; 3],
        }
    }

    pub fn is_sealed(&self) -> bool {
        self.copy_complete_marker == COPY_COMPLETE_MARKER
    }
}

/// Invalidation half of one directory entry; absent (erased) while the
/// file is live.
#[derive(Clone, Copy, Debug, Default, Pod, Zeroable)]
#[repr(C)]
pub struct InodeInvalidationSector {
    pub timestamp: Timestamp,
    pub last_block: BlockIdx,
}

impl InodeInvalidationSector {
    pub fn is_erased(&self) -> bool {
        self.timestamp == Timestamp::INVALID
    }
}

/// Sector 0 of a file data block.
#[derive(Clone, Copy, Debug, Default, Pod, Zeroable)]
#[repr(C)]
pub struct FileInitSector {
    pub age: BlockAge,
    pub file_id: FileId,
    pub timestamp: Timestamp,
}

#[derive(Clone, Copy, Debug, Default, Pod, Zeroable)]
#[repr(C)]
pub struct FileInitSpare {
    pub type_id: BlockType,
    pub nbytes: NumBytes,
}

/// Spare bytes of any non-init, non-tail sector in a file block.
#[derive(Clone, Copy, Debug, Default, Pod, Zeroable)]
#[repr(C)]
pub struct FileDataSpare {
    pub nbytes: NumBytes,
}

/// The forward-link header occupying the tail sector of a file block,
/// written last among the block's sectors so it doubles as the block's
/// seal.
#[derive(Clone, Copy, Debug, Default, Pod, Zeroable)]
#[repr(C)]
pub struct FileTailSector {
    pub next_block: BlockIdx,
    pub next_age: BlockAge,
    pub timestamp: Timestamp,
    pub bytes_in_block: u32,
}

impl FileTailSector {
    pub fn has_successor(&self) -> bool {
        self.next_block != BlockIdx::INVALID
    }
}

/// First field shared by every block's sector-0 spare layout; lets
/// recovery probe a block's kind without knowing which full spare type
/// applies yet.
#[derive(Clone, Copy, Debug, Default, Pod, Zeroable)]
#[repr(C)]
pub struct BlockTypeProbe {
    pub type_id: BlockType,
}

/// Reclamation record written to a block's last sector when it becomes
/// free (at format time or after `invalidate_chain` reclaims it).
#[derive(Clone, Copy, Debug, Default, Pod, Zeroable)]
#[repr(C)]
pub struct BlockStatSector {
    pub age: BlockAge,
    pub next_block: BlockIdx,
    pub next_age: BlockAge,
    pub timestamp: Timestamp,
    pub key: u32,
}

impl BlockStatSector {
    /// Fixed signature distinguishing "a stat sector we wrote" from raw
    /// erased flash (which reads back as all-`0xFF`, a 32-bit Hamming
    /// distance of 17 bits from this key — comfortably outside the
    /// single-bit tolerance classification in `is_owned`).
    pub const KEY: u32 = 0xB10C_F1A6;

    pub fn new_owned(age: BlockAge) -> Self {
        Self {
            age,
            next_block: BlockIdx::INVALID,
            next_age: BlockAge::INVALID,
            timestamp: Timestamp::INVALID,
            key: Self::KEY,
        }
    }

    /// True if `key` is within one bit flip of [`Self::KEY`]. Spare bytes
    /// are not ECC protected, so a single-bit corruption in this field
    /// must not be mistaken for "never formatted".
    pub fn is_owned(&self) -> bool {
        hamming_distance_u32(self.key, Self::KEY) <= 1
    }
}

fn hamming_distance_u32(a: u32, b: u32) -> u32 {
    (a ^ b).count_ones()
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytemuck::{bytes_of, from_bytes};

    #[test]
    fn block_type_round_trips_known_values() {
        assert_eq!(BlockType::from(0xFFu8), BlockType::Unallocated);
        assert_eq!(BlockType::from(1u8), BlockType::Inode);
        assert_eq!(BlockType::from(2u8), BlockType::File);
        assert_eq!(u8::from(BlockType::File), 2);
    }

    #[test]
    fn block_type_unknown_byte_is_safe() {
        let v = BlockType::from(7u8);
        assert_ne!(v, BlockType::Inode);
        assert_ne!(v, BlockType::File);
        assert_ne!(v, BlockType::Unallocated);
    }

    #[test]
    fn inode_allocation_sector_byte_round_trip() {
        let mut s = InodeAllocationSector {
            file_id: FileId(7),
            first_block: BlockIdx(42),
            first_block_age: BlockAge(3),
            timestamp: Timestamp(100),
            ..Default::default()
        };
        s.filename[..5].copy_from_slice(b"hello");
        let bytes = bytes_of(&s);
        let back: &InodeAllocationSector = from_bytes(bytes);
        assert_eq!(back.filename_bytes(), b"hello");
        assert_eq!(back.first_block, BlockIdx(42));
    }

    #[test]
    fn erased_allocation_sector_is_erased() {
        let s = InodeAllocationSector::default();
        assert!(s.is_erased());
        assert_eq!(s.filename_bytes(), b"");
    }

    #[test]
    fn block_stat_key_tolerates_single_bit_flip() {
        let mut s = BlockStatSector::new_owned(BlockAge(0));
        assert!(s.is_owned());
        s.key ^= 1;
        assert!(s.is_owned());
        s.key ^= 0b11;
        assert!(!s.is_owned());
    }

    #[test]
    fn erased_flash_key_is_not_owned() {
        let s = BlockStatSector {
            age: BlockAge(0xFFFF_FFFF),
            next_block: BlockIdx(0xFFFF),
            next_age: BlockAge(0xFFFF_FFFF),
            timestamp: Timestamp(0xFFFF_FFFF),
            key: 0xFFFF_FFFF,
        };
        assert!(!s.is_owned());
    }
}
