//! Raw records stored in physical sector 0.
//!
//! Slot 0 holds the format-info record, slot 1 (at one logical-sector-size
//! offset) the fatal-error record. Both are plain byte structures; the
//! format magic is written last so an interrupted format leaves a medium
//! that still reads as unformatted.

use core::mem::offset_of;

use bytemuck::{AnyBitPattern, NoUninit};

use crate::config::Features;
use crate::error::Error;
use crate::structures::Ctx;
use crate::structures::header::{ECC_STAT_VALID, EccSlot, ecc_slot, is_blank};

/// Identifies a low-level formatted medium.
pub const FORMAT_MAGIC: [u8; 16] = *b"norbm-low-level\0";
/// Format layout version.
pub const FORMAT_VERSION: u32 = 10001;
/// Identifies a written fatal-error record.
pub const FATAL_MAGIC: [u8; 4] = *b"nbmE";

/// Reversed-logic flag bytes: erased flash reads 0xFFFF, a written flag is
/// 0x0000.
const FLAG_SET: u16 = 0x0000;

#[repr(C, packed)]
#[derive(Clone, Copy, NoUninit, AnyBitPattern)]
pub struct RawFormatInfo {
    pub magic: [u8; 16],
    pub version: [u8; 4],
    pub bytes_per_sector: [u8; 4],
    pub num_log_blocks: [u8; 4],
    pub num_work_blocks: [u8; 2],
    /// 0x0000 when fail-safe erase is in effect.
    pub fail_safe_erase: [u8; 2],
    pub crc: u8,
    pub ecc_stat: u8,
    pub ecc: [u8; 2],
}

/// End of the CRC/ECC-covered range.
const FORMAT_CONTENT_END: usize = 32;
/// The magic line is written last; everything behind it goes first.
pub const FORMAT_MAGIC_LEN: usize = 16;

#[repr(C, packed)]
#[derive(Clone, Copy, NoUninit, AnyBitPattern)]
pub struct RawFatalInfo {
    pub magic: [u8; 4],
    pub is_write_protected: [u8; 2],
    pub has_fatal_error: [u8; 2],
    pub error_type: [u8; 2],
    pub error_psi: [u8; 4],
}

impl RawFormatInfo {
    pub fn from_bytes(bytes: &[u8]) -> &Self {
        bytemuck::from_bytes(&bytes[..size_of::<Self>()])
    }

    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::bytes_of(self)
    }
}

impl RawFatalInfo {
    pub fn from_bytes(bytes: &[u8]) -> &Self {
        bytemuck::from_bytes(&bytes[..size_of::<Self>()])
    }

    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::bytes_of(self)
    }
}

/// Parsed format record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FormatInfo {
    pub bytes_per_sector: u32,
    pub num_log_blocks: u32,
    pub num_work_blocks: u16,
    pub fail_safe_erase: bool,
}

impl FormatInfo {
    pub fn encode(&self, ctx: &Ctx) -> RawFormatInfo {
        let mut raw = RawFormatInfo {
            magic: FORMAT_MAGIC,
            version: [0xFF; 4],
            bytes_per_sector: [0xFF; 4],
            num_log_blocks: [0xFF; 4],
            num_work_blocks: [0xFF; 2],
            fail_safe_erase: [0xFF; 2],
            crc: 0xFF,
            ecc_stat: 0xFF,
            ecc: [0xFF; 2],
        };
        ctx.order.write_u32(&mut raw.version, FORMAT_VERSION);
        ctx.order
            .write_u32(&mut raw.bytes_per_sector, self.bytes_per_sector);
        ctx.order.write_u32(&mut raw.num_log_blocks, self.num_log_blocks);
        ctx.order
            .write_u16(&mut raw.num_work_blocks, self.num_work_blocks);
        ctx.order.write_u16(
            &mut raw.fail_safe_erase,
            if self.fail_safe_erase { FLAG_SET } else { 0xFFFF },
        );
        let mut content = [0u8; FORMAT_CONTENT_END];
        content.copy_from_slice(&bytemuck::bytes_of(&raw)[..FORMAT_CONTENT_END]);
        if ctx.has(Features::CRC) {
            raw.crc = ctx.crc.crc8(0, &content);
        }
        if ctx.has(Features::ECC) {
            let parity = ctx.ecc.encode(&content);
            ctx.order.write_u16(&mut raw.ecc, parity);
            raw.ecc_stat = ECC_STAT_VALID;
        }
        raw
    }

    pub fn decode(ctx: &Ctx, bytes: &[u8]) -> Result<Self, Error> {
        let mut copy = [0u8; size_of::<RawFormatInfo>()];
        copy.copy_from_slice(&bytes[..size_of::<RawFormatInfo>()]);
        if ctx.has(Features::ECC) {
            let ecc_stat = copy[offset_of!(RawFormatInfo, ecc_stat)];
            if ecc_slot(ecc_stat) != EccSlot::Valid {
                return Err(Error::NotFormatted);
            }
            let parity = ctx.order.read_u16(&copy[offset_of!(RawFormatInfo, ecc)..]);
            if ctx
                .ecc
                .decode(&mut copy[..FORMAT_CONTENT_END], parity)
                .is_err()
            {
                return Err(Error::NotFormatted);
            }
        }
        let raw = RawFormatInfo::from_bytes(&copy);
        if raw.magic != FORMAT_MAGIC {
            return Err(Error::NotFormatted);
        }
        if ctx.has(Features::CRC) && ctx.crc.crc8(0, &copy[..FORMAT_CONTENT_END]) != raw.crc {
            return Err(Error::NotFormatted);
        }
        if ctx.order.read_u32(&raw.version) != FORMAT_VERSION {
            return Err(Error::NotFormatted);
        }
        let info = Self {
            bytes_per_sector: ctx.order.read_u32(&raw.bytes_per_sector),
            num_log_blocks: ctx.order.read_u32(&raw.num_log_blocks),
            num_work_blocks: ctx.order.read_u16(&raw.num_work_blocks),
            fail_safe_erase: ctx.order.read_u16(&raw.fail_safe_erase) == FLAG_SET,
        };
        if !info.bytes_per_sector.is_power_of_two() || info.num_log_blocks == 0 {
            return Err(Error::NotFormatted);
        }
        Ok(info)
    }
}

/// Parsed fatal-error record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FatalRecord {
    pub is_write_protected: bool,
    pub has_fatal_error: bool,
    pub error: Error,
    pub error_psi: u32,
}

fn error_code(e: Error) -> u16 {
    match e {
        Error::Write => 1,
        Error::Erase => 2,
        Error::OutOfFreeSectors => 3,
        Error::Read => 4,
        Error::Crc => 5,
        Error::InconsistentData => 6,
        Error::OutOfWorkBlocks => 7,
        Error::Ecc => 8,
        _ => 0,
    }
}

fn error_from_code(code: u16) -> Error {
    match code {
        1 => Error::Write,
        2 => Error::Erase,
        3 => Error::OutOfFreeSectors,
        4 => Error::Read,
        5 => Error::Crc,
        7 => Error::OutOfWorkBlocks,
        8 => Error::Ecc,
        _ => Error::InconsistentData,
    }
}

impl FatalRecord {
    pub fn encode(&self, ctx: &Ctx) -> RawFatalInfo {
        let mut raw = RawFatalInfo {
            magic: FATAL_MAGIC,
            is_write_protected: [0xFF; 2],
            has_fatal_error: [0xFF; 2],
            error_type: [0xFF; 2],
            error_psi: [0xFF; 4],
        };
        if self.is_write_protected {
            ctx.order.write_u16(&mut raw.is_write_protected, FLAG_SET);
        }
        if self.has_fatal_error {
            ctx.order.write_u16(&mut raw.has_fatal_error, FLAG_SET);
        }
        ctx.order.write_u16(&mut raw.error_type, error_code(self.error));
        ctx.order.write_u32(&mut raw.error_psi, self.error_psi);
        raw
    }

    /// `None` when no record was ever written.
    pub fn decode(ctx: &Ctx, bytes: &[u8]) -> Option<Self> {
        let raw = RawFatalInfo::from_bytes(bytes);
        if is_blank(&bytes[..size_of::<RawFatalInfo>()]) || raw.magic != FATAL_MAGIC {
            return None;
        }
        Some(Self {
            is_write_protected: ctx.order.read_u16(&raw.is_write_protected) == FLAG_SET,
            has_fatal_error: ctx.order.read_u16(&raw.has_fatal_error) == FLAG_SET,
            error: error_from_code(ctx.order.read_u16(&raw.error_type)),
            error_psi: ctx.order.read_u32(&raw.error_psi),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::mem::offset_of;
    use norbm_common::{CrcSoftware, EccHamming};
    use static_assertions::const_assert_eq;

    const_assert_eq!(size_of::<RawFormatInfo>(), 36);
    const_assert_eq!(align_of::<RawFormatInfo>(), 1);
    const_assert_eq!(offset_of!(RawFormatInfo, magic), 0);
    const_assert_eq!(offset_of!(RawFormatInfo, version), 16);
    const_assert_eq!(offset_of!(RawFormatInfo, bytes_per_sector), 20);
    const_assert_eq!(offset_of!(RawFormatInfo, num_log_blocks), 24);
    const_assert_eq!(offset_of!(RawFormatInfo, num_work_blocks), 28);
    const_assert_eq!(offset_of!(RawFormatInfo, fail_safe_erase), 30);
    const_assert_eq!(offset_of!(RawFormatInfo, crc), 32);

    const_assert_eq!(size_of::<RawFatalInfo>(), 14);
    const_assert_eq!(align_of::<RawFatalInfo>(), 1);
    const_assert_eq!(offset_of!(RawFatalInfo, error_psi), 10);

    fn ctx(features: Features) -> Ctx<'static> {
        Ctx {
            order: Default::default(),
            features,
            crc: &CrcSoftware,
            ecc: &EccHamming,
        }
    }

    #[test]
    fn format_record_round_trip() {
        let ctx = ctx(Features::CRC | Features::ECC);
        let info = FormatInfo {
            bytes_per_sector: 512,
            num_log_blocks: 58,
            num_work_blocks: 4,
            fail_safe_erase: true,
        };
        let raw = info.encode(&ctx);
        assert_eq!(FormatInfo::decode(&ctx, raw.as_bytes()), Ok(info));
    }

    #[test]
    fn missing_magic_reads_unformatted() {
        let ctx = ctx(Features::empty());
        let info = FormatInfo {
            bytes_per_sector: 512,
            num_log_blocks: 58,
            num_work_blocks: 4,
            fail_safe_erase: false,
        };
        let mut bytes = info.encode(&ctx).as_bytes().to_vec();
        // The magic is the last line a format writes; without it the
        // record must not parse.
        bytes[..FORMAT_MAGIC_LEN].fill(0xFF);
        assert_eq!(
            FormatInfo::decode(&ctx, &bytes),
            Err(Error::NotFormatted)
        );
    }

    #[test]
    fn format_record_crc_rejects_damage() {
        let ctx = ctx(Features::CRC);
        let info = FormatInfo {
            bytes_per_sector: 2048,
            num_log_blocks: 100,
            num_work_blocks: 3,
            fail_safe_erase: true,
        };
        let mut bytes = info.encode(&ctx).as_bytes().to_vec();
        bytes[offset_of!(RawFormatInfo, num_log_blocks)] ^= 0x01;
        assert_eq!(
            FormatInfo::decode(&ctx, &bytes),
            Err(Error::NotFormatted)
        );
    }

    #[test]
    fn fatal_record_round_trip() {
        let ctx = ctx(Features::empty());
        let rec = FatalRecord {
            is_write_protected: true,
            has_fatal_error: true,
            error: Error::OutOfFreeSectors,
            error_psi: 17,
        };
        let raw = rec.encode(&ctx);
        assert_eq!(FatalRecord::decode(&ctx, raw.as_bytes()), Some(rec));
    }

    #[test]
    fn blank_fatal_record_is_none() {
        let ctx = ctx(Features::empty());
        assert_eq!(FatalRecord::decode(&ctx, &[0xFF; 32]), None);
    }
}
