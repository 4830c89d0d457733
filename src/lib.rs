#![no_std]
#![allow(dead_code)]

//! Append-only, log-structured filesystem for raw NAND flash.
//!
//! A mounted device is one owned [`fs::Filesystem`] value, parameterized by
//! whatever [`media::FlashDevice`] the embedder supplies. Everything else
//! in this crate — the sector codec, the block allocator, the inode chain,
//! per-file read/write cursors, and mount-time recovery — is reached only
//! through that type.

#[cfg(feature = "alloc")]
extern crate alloc;

#[macro_use]
pub mod diag;

#[cfg(feature = "alloc")]
pub mod allocator;
pub mod error;
#[cfg(feature = "alloc")]
pub mod file;
#[cfg(feature = "alloc")]
pub mod fs;
pub mod geometry;
#[cfg(feature = "alloc")]
pub mod inode;
pub mod media;
#[cfg(feature = "alloc")]
pub mod recovery;
pub mod sector;

#[cfg(feature = "alloc")]
pub use error::{FsError, MediaError};
#[cfg(not(feature = "alloc"))]
pub use error::MediaError;
#[cfg(feature = "alloc")]
pub use fs::{Filesystem, ReadFile, WriteFile};
pub use geometry::{DefaultGeometry, Geometry};
pub use media::FlashDevice;
