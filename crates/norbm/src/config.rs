//! Per-instance configuration.
//!
//! Everything here is applied before the first mount; the geometry stored in
//! the on-flash format record takes precedence over the corresponding knobs
//! once a medium is formatted. Hooks that the original driver kept as
//! process-wide function pointers (CRC back-end, ECC back-end, fatal-error
//! callback) are per-instance values here.

use alloc::boxed::Box;

use norbm_common::{ByteOrder, CrcApi, CrcSoftware, EccApi, EccHamming};

use crate::error::{FatalErrorInfo, FatalPolicy};

bitflags::bitflags! {
    /// Feature toggles of one instance.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Features: u16 {
        /// Blank-check every sector after erasing it.
        const ERASE_VERIFICATION = 1 << 0;
        /// Read back and compare every header and payload write.
        const WRITE_VERIFICATION = 1 << 1;
        /// Skip already-blank sectors during low-level format.
        const SKIP_BLANK_SECTORS = 1 << 2;
        /// Physically erase freed blocks right away instead of leaving
        /// them to `clean`.
        const ERASE_USED_SECTORS = 1 << 3;
        /// Stamp a signature after each successful erase so an
        /// interrupted erase is detected at mount.
        const FAIL_SAFE_ERASE = 1 << 4;
        /// Reading a logical sector that holds no data returns an error
        /// instead of the fill pattern.
        const INVALID_SECTOR_ERROR = 1 << 5;
        /// Protect headers with CRC-8 and payloads with CRC-16.
        const CRC = 1 << 6;
        /// Protect headers and payloads with single-bit-correcting ECC.
        const ECC = 1 << 7;
        /// The medium cannot rewrite a flash line between erases; headers
        /// use one section per state indicator.
        const NO_REWRITE = 1 << 8;
    }
}

/// Fatal-error callback. Invoked once per unrecoverable error; the return
/// value decides whether the instance latches write protection.
pub type OnFatalError = Box<dyn FnMut(&FatalErrorInfo) -> FatalPolicy>;

/// Configuration of one instance.
pub struct Config {
    /// Feature toggles.
    pub features: Features,
    /// Wear-leveling bound: no sector may be erased this many more times
    /// than the least-erased data block.
    pub max_erase_cnt_diff: u32,
    /// Number of work blocks; `None` picks roughly 1% of the physical
    /// sectors, clamped to `[3, 10]`.
    pub num_work_blocks: Option<u16>,
    /// Logical sector size in bytes, a power of two.
    pub log_sector_size: u32,
    /// log2 of the flash-line size; header writes happen at this
    /// granularity.
    pub ld_bytes_per_line: u8,
    /// Byte order of multi-byte header fields on the medium.
    pub byte_order: ByteOrder,
    /// First physical sector of the storage window.
    pub first_sector: u32,
    /// Number of physical sectors in the window; `None` means up to the
    /// end of the device.
    pub num_sectors: Option<u32>,
    /// Payload bytes covered by one ECC parity word.
    pub ecc_block_size: u32,
    /// Retry budget for failing reads.
    pub num_read_retries: u8,
    /// Retry budget for failing writes.
    pub num_write_retries: u8,
    /// Retry budget for failing erases.
    pub num_erase_retries: u8,
    /// Byte returned for logical sectors that hold no data.
    pub fill_pattern: u8,
    /// CRC back-end.
    pub crc: Box<dyn CrcApi>,
    /// ECC back-end.
    pub ecc: Box<dyn EccApi>,
    /// Fatal-error callback; `None` reports errors without latching.
    pub on_fatal_error: Option<OnFatalError>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            features: Features::FAIL_SAFE_ERASE | Features::WRITE_VERIFICATION,
            max_erase_cnt_diff: 5,
            num_work_blocks: None,
            log_sector_size: 512,
            ld_bytes_per_line: 4,
            byte_order: ByteOrder::Little,
            first_sector: 0,
            num_sectors: None,
            ecc_block_size: 256,
            num_read_retries: 2,
            num_write_retries: 2,
            num_erase_retries: 3,
            fill_pattern: 0xFF,
            crc: Box::new(CrcSoftware),
            ecc: Box::new(EccHamming),
            on_fatal_error: None,
        }
    }
}

impl core::fmt::Debug for Config {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Config")
            .field("features", &self.features)
            .field("max_erase_cnt_diff", &self.max_erase_cnt_diff)
            .field("num_work_blocks", &self.num_work_blocks)
            .field("log_sector_size", &self.log_sector_size)
            .field("ld_bytes_per_line", &self.ld_bytes_per_line)
            .field("byte_order", &self.byte_order)
            .field("first_sector", &self.first_sector)
            .field("num_sectors", &self.num_sectors)
            .finish_non_exhaustive()
    }
}

impl Config {
    /// Default configuration with the given feature set.
    pub fn with_features(features: Features) -> Self {
        Self {
            features,
            ..Self::default()
        }
    }

    /// Sets the wear-leveling bound.
    pub fn with_max_erase_cnt_diff(mut self, diff: u32) -> Self {
        self.max_erase_cnt_diff = diff;
        self
    }

    /// Sets the number of work blocks.
    pub fn with_num_work_blocks(mut self, n: u16) -> Self {
        self.num_work_blocks = Some(n);
        self
    }

    /// Sets the logical sector size.
    pub fn with_log_sector_size(mut self, size: u32) -> Self {
        self.log_sector_size = size;
        self
    }

    /// Restricts the instance to a window of the device.
    pub fn with_window(mut self, first_sector: u32, num_sectors: Option<u32>) -> Self {
        self.first_sector = first_sector;
        self.num_sectors = num_sectors;
        self
    }

    /// Sets the on-flash byte order.
    pub fn with_byte_order(mut self, order: ByteOrder) -> Self {
        self.byte_order = order;
        self
    }

    /// Installs the fatal-error callback.
    pub fn with_on_fatal_error(mut self, cb: OnFatalError) -> Self {
        self.on_fatal_error = Some(cb);
        self
    }

    /// Default work-block count for a device of `num_phy_sectors`.
    pub(crate) fn default_num_work_blocks(num_phy_sectors: u32) -> u16 {
        ((num_phy_sectors / 100).clamp(3, 10)) as u16
    }
}
