use core::fmt::Debug;

#[cfg(feature = "alloc")]
use alloc::boxed::Box;

/// Common trait implemented by every error type in this crate.
///
/// Paired with a global allocator this lets `Exception` variants carry an
/// arbitrary boxed cause without every error enum needing a generic
/// parameter.
pub trait BaseError: Debug {}

/// Return type for operations that only report success or failure.
pub type CanFail<T> = Result<(), T>;

/// Errors surfaced by a [`crate::media::FlashDevice`] implementation.
#[derive(Debug)]
pub enum MediaError {
    /// The ECC could not correct the read; the sector is lost.
    ReadUncorrectable,
    /// The targeted block is flagged bad by the device.
    BadBlock,
    /// The requested sector/page address is out of range for the device.
    OutOfRange,

    #[cfg(feature = "alloc")]
    Exception(Box<dyn BaseError>),
    #[cfg(not(feature = "alloc"))]
    Exception,
}

impl BaseError for MediaError {}

/// Errors surfaced by [`crate::fs::Filesystem`] operations.
#[derive(Debug)]
pub enum FsError {
    /// No entry with that name exists (or the entry is marked deleted).
    NotFound,
    /// Filename does not fit in `MAX_FNAME_LEN - 1` bytes.
    NameTooLong,
    /// The allocator could not find a block meeting any acceptance
    /// threshold; the media is effectively full.
    AllocationExhausted,
    /// The inode chain could not be extended with a new block.
    InodeTableFull,
    /// No inode-0 block was found during mount; the device is unformatted
    /// or its directory metadata is unreadable.
    NoInode0,
    /// The handle token does not refer to a currently open file.
    HandleNotOpen,
    /// Underlying media error.
    Media(MediaError),

    #[cfg(feature = "alloc")]
    Exception(Box<dyn BaseError>),
    #[cfg(not(feature = "alloc"))]
    Exception,
}

impl BaseError for FsError {}

impl From<MediaError> for FsError {
    fn from(e: MediaError) -> Self {
        FsError::Media(e)
    }
}

impl core::fmt::Display for MediaError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            MediaError::ReadUncorrectable => write!(f, "uncorrectable read error"),
            MediaError::BadBlock => write!(f, "block flagged bad"),
            MediaError::OutOfRange => write!(f, "sector/page address out of range"),
            #[cfg(feature = "alloc")]
            MediaError::Exception(e) => write!(f, "media exception: {:?}", e),
            #[cfg(not(feature = "alloc"))]
            MediaError::Exception => write!(f, "media exception"),
        }
    }
}

impl core::fmt::Display for FsError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            FsError::NotFound => write!(f, "file not found"),
            FsError::NameTooLong => write!(f, "filename too long"),
            FsError::AllocationExhausted => write!(f, "no free block meets allocation threshold"),
            FsError::InodeTableFull => write!(f, "could not extend inode chain"),
            FsError::NoInode0 => write!(f, "no inode-0 block found at mount"),
            FsError::HandleNotOpen => write!(f, "handle is not open"),
            FsError::Media(e) => write!(f, "{}", e),
            #[cfg(feature = "alloc")]
            FsError::Exception(e) => write!(f, "fs exception: {:?}", e),
            #[cfg(not(feature = "alloc"))]
            FsError::Exception => write!(f, "fs exception"),
        }
    }
}
