//! CRC back-ends for header and payload checking.
//!
//! Headers are protected by a seedable CRC-8, sector payloads by a CRC-16.
//! The default back-end is table-driven software CRC via the `crc` crate; a
//! hardware unit can be plugged in through [`CrcApi`] at instance
//! configuration time.

use crc::{CRC_8_SMBUS, CRC_16_IBM_3740, Crc};

const CRC8: Crc<u8> = Crc::<u8>::new(&CRC_8_SMBUS);
const CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_IBM_3740);

/// CRC computation back-end.
///
/// Implementations must be pure: the same seed and data always yield the
/// same checksum, regardless of call history.
pub trait CrcApi {
    /// CRC-8 over `data`, starting from `seed`.
    fn crc8(&self, seed: u8, data: &[u8]) -> u8;

    /// CRC-16 over `data`, starting from `seed`.
    fn crc16(&self, seed: u16, data: &[u8]) -> u16;
}

/// Table-driven software CRC.
#[derive(Debug, Default, Copy, Clone)]
pub struct CrcSoftware;

impl CrcApi for CrcSoftware {
    fn crc8(&self, seed: u8, data: &[u8]) -> u8 {
        let mut digest = CRC8.digest_with_initial(seed);
        digest.update(data);
        digest.finalize()
    }

    fn crc16(&self, seed: u16, data: &[u8]) -> u16 {
        let mut digest = CRC16.digest_with_initial(seed);
        digest.update(data);
        digest.finalize()
    }
}
