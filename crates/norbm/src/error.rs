//! Errors reported by the translation layer.

use norbm_phy::PhyError;

/// Errors that can occur while operating on a block-mapped NOR device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// A write to the medium failed or did not verify.
    #[error("Write error")]
    Write,
    /// A sector erase failed or did not verify.
    #[error("Erase error")]
    Erase,
    /// No physical sector could be allocated.
    #[error("Out of free sectors")]
    OutOfFreeSectors,
    /// A read from the medium failed.
    #[error("Read error")]
    Read,
    /// A CRC check failed and could not be recovered.
    #[error("CRC error")]
    Crc,
    /// On-flash state contradicts itself.
    #[error("Inconsistent data")]
    InconsistentData,
    /// No work-block descriptor could be allocated.
    #[error("Out of work blocks")]
    OutOfWorkBlocks,
    /// An ECC check found an uncorrectable bit error.
    #[error("ECC error")]
    Ecc,
    /// The requested logical sector lies outside the device.
    #[error("Logical sector out of range")]
    OutOfRange,
    /// The medium carries no (or an incompatible) format record.
    #[error("Medium is not low-level formatted")]
    NotFormatted,
    /// The instance has not been mounted.
    #[error("Not mounted")]
    NotMounted,
    /// The instance is write protected, permanently so if a fatal error
    /// was latched on the medium.
    #[error("Write protected")]
    WriteProtected,
    /// The configuration cannot be applied to this medium.
    #[error("Invalid configuration: {0}")]
    Config(&'static str),
}

impl Error {
    /// Maps a driver error from a read call.
    pub(crate) fn from_read(_: PhyError) -> Self {
        Error::Read
    }

    /// Maps a driver error from a write call.
    pub(crate) fn from_write(_: PhyError) -> Self {
        Error::Write
    }

    /// Maps a driver error from an erase call.
    pub(crate) fn from_erase(_: PhyError) -> Self {
        Error::Erase
    }
}

/// What the fatal-error callback wants done with the instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FatalPolicy {
    /// Latch the error on the medium and reject all further writes.
    WriteProtect,
    /// Report only; the instance stays writable.
    Continue,
}

/// Details handed to the fatal-error callback.
#[derive(Debug, Clone, Copy)]
pub struct FatalErrorInfo {
    /// The error that proved unrecoverable.
    pub error: Error,
    /// Physical sector the error was detected on.
    pub psi: u32,
}
