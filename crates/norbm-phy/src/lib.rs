//! Physical-media interface for the norbm translation layer.
//!
//! The medium is modelled by the [`NorPhy`] trait: a linear byte range
//! divided into erase sectors, where writes may only clear bits (1 → 0) and
//! an erase restores a whole sector to 0xFF. Two back-ends are provided:
//! [`RamNor`] for tests (with torn-write fault injection) and, with the
//! `std` feature, [`FileNor`] for image files.

#![cfg_attr(not(feature = "std"), no_std)]

extern crate alloc;

mod ram;
pub use ram::{FaultPlan, RamNor};

#[cfg(feature = "std")]
mod file;
#[cfg(feature = "std")]
pub use file::FileNor;

/// Errors reported by a [`NorPhy`] back-end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum PhyError {
    /// The requested range lies outside the medium.
    #[error("Access out of bounds")]
    OutOfBounds,
    /// The device rejected or failed the operation.
    #[error("Device error")]
    Device,
    /// The host I/O backing the medium failed.
    #[error("I/O error")]
    Io,
}

/// Location and size of one erase sector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SectorInfo {
    /// Byte offset of the sector from the start of the medium.
    pub offset: u32,
    /// Sector size in bytes.
    pub size: u32,
}

/// A raw NOR flash device.
///
/// Offsets are absolute byte offsets into the medium. Writes must behave as
/// `new = old & data`; callers never rely on setting bits without an erase.
pub trait NorPhy {
    /// Prepares the device for use. Called once before any other access.
    fn init(&mut self) -> Result<(), PhyError>;

    /// Number of erase sectors on the medium.
    fn num_sectors(&self) -> u32;

    /// Offset and size of the given erase sector.
    fn sector_info(&self, index: u32) -> SectorInfo;

    /// Reads `buf.len()` bytes starting at `off`.
    fn read_off(&mut self, off: u32, buf: &mut [u8]) -> Result<(), PhyError>;

    /// Writes `buf` starting at `off`, clearing bits only.
    fn write_off(&mut self, off: u32, buf: &[u8]) -> Result<(), PhyError>;

    /// Erases one sector back to 0xFF.
    fn erase_sector(&mut self, index: u32) -> Result<(), PhyError>;

    /// Fast blank check, if the device supports one.
    ///
    /// `None` means unsupported; the caller falls back to reading the
    /// sector back.
    fn is_sector_blank(&self, _index: u32) -> Option<bool> {
        None
    }
}
