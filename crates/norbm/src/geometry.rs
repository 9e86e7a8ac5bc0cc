//! Derived layout of one instance.
//!
//! Everything here is arithmetic over the configuration and the medium:
//! header sizes, section offsets, sectors per block, block counts. The
//! geometry is computed once at format/mount time and read everywhere else.

use crate::config::{Config, Features};
use crate::error::Error;
use crate::structures::raw::FormatInfo;

/// Physical-sector-header layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PshLayout {
    /// Total header size, line-aligned.
    pub len: usize,
    /// Section offsets; meaningful in no-rewrite mode only.
    pub sections: Option<PshSections>,
}

/// Section offsets of a no-rewrite PSH. Fields lines precede their
/// indicator line so the natural ascending flush order is prepare, then
/// commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PshSections {
    /// Base section: erase count, erase signature, CRC/ECC.
    pub s0: usize,
    /// Work section fields: lbi, data count, CRC/ECC.
    pub s1_fields: usize,
    /// Work indicator line.
    pub s1_ind: usize,
    /// Data section fields.
    pub s2_fields: usize,
    /// Data indicator line.
    pub s2_ind: usize,
    /// Invalid indicator line.
    pub s3_ind: usize,
}

/// Logical-sector-header layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LshLayout {
    /// Total header size, line-aligned.
    pub len: usize,
    /// Payload parity words stored in the header.
    pub num_ecc_blocks: usize,
    /// Section offsets; meaningful in no-rewrite mode only.
    pub sections: Option<LshSections>,
}

/// Section offsets of a no-rewrite LSH.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LshSections {
    /// Base section: brsi, payload CRC, payload parity, CRC/ECC.
    pub s0: usize,
    /// Valid indicator line.
    pub s1_ind: usize,
    /// Invalid indicator line.
    pub s2_ind: usize,
}

/// Rewrite-mode PSH field offsets. The CRC covers `0..PSH_CONTENT_END`
/// including the stat byte (one CRC slot per stat-bearing mutation), the
/// header ECC covers `1..PSH_CONTENT_END` (the stat byte decodes by bit
/// count on its own, so stat-only commits never need a fresh parity slot).
pub mod psh_off {
    pub const STAT: usize = 0;
    pub const DATA_CNT: usize = 1;
    pub const LBI: usize = 2;
    pub const ERASE_CNT: usize = 4;
    pub const ERASE_SIG: usize = 8;
    pub const CONTENT_END: usize = 12;
    pub const CRC_STAT: usize = 12;
    pub const CRC0: usize = 13;
    pub const NUM_CRC_SLOTS: usize = 3;
    pub const ECC_STAT0: usize = 16;
    pub const ECC_STAT1: usize = 17;
    pub const ECC0: usize = 18;
    pub const ECC1: usize = 20;
    pub const RAW_END: usize = 22;
}

/// No-rewrite PSH section-content offsets (relative to the section base).
pub mod psh_sec {
    /// s0: erase_cnt u32, erase_sig u32, crc u8, ecc_stat u8, ecc u16.
    pub const S0_ERASE_CNT: usize = 0;
    pub const S0_ERASE_SIG: usize = 4;
    pub const S0_CONTENT_END: usize = 8;
    pub const S0_CRC: usize = 8;
    pub const S0_ECC_STAT: usize = 9;
    pub const S0_ECC: usize = 10;
    pub const S0_LEN: usize = 12;
    /// s1/s2 fields: lbi u16, data_cnt u8, crc u8, ecc_stat u8, ecc u16.
    pub const F_LBI: usize = 0;
    pub const F_DATA_CNT: usize = 2;
    pub const F_CONTENT_END: usize = 3;
    pub const F_CRC: usize = 3;
    pub const F_ECC_STAT: usize = 4;
    pub const F_ECC: usize = 5;
    pub const F_LEN: usize = 7;
}

/// Complete derived geometry of one instance.
#[derive(Debug, Clone)]
pub struct Geometry {
    /// Physical sectors inside the storage window.
    pub num_phy_sectors: u32,
    /// First device sector of the window.
    pub first_sector: u32,
    /// Erase-sector size of the medium.
    pub phy_sector_size: u32,
    /// Logical sector size presented upward.
    pub log_sector_size: u32,
    /// Logical sectors per physical sector.
    pub ls_per_ps: u16,
    /// Logical blocks presented upward.
    pub num_log_blocks: u32,
    /// Work blocks held at a time.
    pub num_work_blocks: u16,
    /// Flash-line size in bytes.
    pub line_size: usize,
    /// Payload bytes covered by one parity word.
    pub ecc_block_size: u32,
    pub psh: PshLayout,
    pub lsh: LshLayout,
}

fn align_up(n: usize, line: usize) -> usize {
    n.div_ceil(line) * line
}

impl Geometry {
    /// Computes the geometry for a window of `num_window_sectors` sectors
    /// of `phy_sector_size` bytes each. `fmt` carries the authoritative
    /// values from the on-flash format record when mounting; formatting
    /// passes `None` and derives them from the configuration.
    pub fn compute(
        cfg: &Config,
        first_sector: u32,
        num_window_sectors: u32,
        phy_sector_size: u32,
        fmt: Option<&FormatInfo>,
    ) -> Result<Self, Error> {
        let line_size = 1usize << cfg.ld_bytes_per_line;
        let log_sector_size = match fmt {
            Some(f) => f.bytes_per_sector,
            None => cfg.log_sector_size,
        };
        if !log_sector_size.is_power_of_two() {
            return Err(Error::Config("logical sector size must be a power of two"));
        }
        // The fatal-error record lives at one logical-sector offset into
        // sector 0, behind the format record.
        if log_sector_size < 64 {
            return Err(Error::Config("logical sector size below 64 bytes"));
        }
        if line_size as u32 > phy_sector_size {
            return Err(Error::Config("flash line larger than a physical sector"));
        }

        let no_rewrite = cfg.features.contains(Features::NO_REWRITE);
        let ecc_block_size = cfg.ecc_block_size.min(log_sector_size);
        let num_ecc_blocks = if cfg.features.contains(Features::ECC) {
            (log_sector_size / ecc_block_size) as usize
        } else {
            0
        };

        let psh = Self::psh_layout(no_rewrite, line_size);
        let lsh = Self::lsh_layout(no_rewrite, line_size, num_ecc_blocks);

        let slot = lsh.len as u32 + log_sector_size;
        if phy_sector_size <= psh.len as u32 + slot {
            return Err(Error::Config("physical sector too small for one logical sector"));
        }
        let ls_per_ps = ((phy_sector_size - psh.len as u32) / slot).min(u16::MAX as u32) as u16;

        let num_work_blocks = match fmt {
            Some(f) => f.num_work_blocks,
            None => cfg
                .num_work_blocks
                .unwrap_or_else(|| Config::default_num_work_blocks(num_window_sectors)),
        };
        // psi 0 plus one spare so a via-copy conversion always has a
        // destination.
        let reserved = 2 + num_work_blocks as u32;
        if num_window_sectors <= reserved {
            return Err(Error::Config("too few physical sectors for the work-block count"));
        }
        // lbi is 16-bit on flash, with 0xFFFF reserved as the blank value.
        const MAX_LOG_BLOCKS: u32 = 0xFFFE;
        let num_log_blocks = match fmt {
            Some(f) => {
                if f.num_log_blocks > (num_window_sectors - reserved).min(MAX_LOG_BLOCKS) {
                    return Err(Error::NotFormatted);
                }
                f.num_log_blocks
            }
            None => (num_window_sectors - reserved).min(MAX_LOG_BLOCKS),
        };

        Ok(Self {
            num_phy_sectors: num_window_sectors,
            first_sector,
            phy_sector_size,
            log_sector_size,
            ls_per_ps,
            num_log_blocks,
            num_work_blocks,
            line_size,
            ecc_block_size,
            psh,
            lsh,
        })
    }

    fn psh_layout(no_rewrite: bool, line: usize) -> PshLayout {
        if !no_rewrite {
            return PshLayout {
                len: align_up(psh_off::RAW_END, line),
                sections: None,
            };
        }
        let s0 = 0;
        let s1_fields = s0 + align_up(psh_sec::S0_LEN, line);
        let s1_ind = s1_fields + align_up(psh_sec::F_LEN, line);
        let s2_fields = s1_ind + line;
        let s2_ind = s2_fields + align_up(psh_sec::F_LEN, line);
        let s3_ind = s2_ind + line;
        PshLayout {
            len: s3_ind + line,
            sections: Some(PshSections {
                s0,
                s1_fields,
                s1_ind,
                s2_fields,
                s2_ind,
                s3_ind,
            }),
        }
    }

    fn lsh_layout(no_rewrite: bool, line: usize, num_ecc_blocks: usize) -> LshLayout {
        let parity_bytes = 2 * num_ecc_blocks;
        if !no_rewrite {
            // stat, brsi, payload crc, payload parity, crc stat + 2 slots,
            // 2 ecc stats + 2 parity words.
            let raw_end = 5 + parity_bytes + 3 + 2 + 4;
            return LshLayout {
                len: align_up(raw_end, line),
                num_ecc_blocks,
                sections: None,
            };
        }
        // s0: brsi u16, crc_data u16, parity, crc u8, ecc_stat u8, ecc u16.
        let s0_len = 4 + parity_bytes + 4;
        let s1_ind = align_up(s0_len, line);
        let s2_ind = s1_ind + line;
        LshLayout {
            len: s2_ind + line,
            num_ecc_blocks,
            sections: Some(LshSections { s0: 0, s1_ind, s2_ind }),
        }
    }

    /// Byte offset of a physical sector from the start of the window's
    /// first sector, assuming uniform sector sizes.
    pub fn psh_off(&self, psi: u32) -> u32 {
        psi * self.phy_sector_size
    }

    /// Byte offset of the LSH of slot `srsi` inside sector `psi`.
    pub fn lsh_off(&self, psi: u32, srsi: u16) -> u32 {
        self.psh_off(psi)
            + self.psh.len as u32
            + srsi as u32 * (self.lsh.len as u32 + self.log_sector_size)
    }

    /// Byte offset of the payload of slot `srsi` inside sector `psi`.
    pub fn payload_off(&self, psi: u32, srsi: u16) -> u32 {
        self.lsh_off(psi, srsi) + self.lsh.len as u32
    }

    /// Total logical sectors presented upward.
    pub fn num_log_sectors(&self) -> u32 {
        self.num_log_blocks * self.ls_per_ps as u32
    }

    /// Splits a logical sector index into (lbi, brsi).
    pub fn split_log_sector(&self, log_sector: u32) -> (u16, u16) {
        let per = self.ls_per_ps as u32;
        ((log_sector / per) as u16, (log_sector % per) as u16)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(features: Features) -> Config {
        Config::with_features(features)
    }

    #[test]
    fn rewrite_layout_is_compact() {
        let c = cfg(Features::FAIL_SAFE_ERASE | Features::CRC);
        let geo = Geometry::compute(&c, 0, 64, 4096, None).unwrap();
        assert_eq!(geo.psh.len, 32);
        assert!(geo.psh.sections.is_none());
        // No ECC: the LSH carries no parity words.
        assert_eq!(geo.lsh.num_ecc_blocks, 0);
        assert_eq!(geo.lsh.len, 16);
        assert_eq!(geo.ls_per_ps, 7);
        assert_eq!(geo.num_log_blocks, 64 - 2 - geo.num_work_blocks as u32);
    }

    #[test]
    fn ecc_adds_payload_parity() {
        let c = cfg(Features::CRC | Features::ECC);
        let geo = Geometry::compute(&c, 0, 64, 4096, None).unwrap();
        // 512-byte payload over 256-byte blocks.
        assert_eq!(geo.lsh.num_ecc_blocks, 2);
        assert_eq!(geo.lsh.len, 32);
    }

    #[test]
    fn no_rewrite_sections_are_line_aligned() {
        let c = cfg(Features::NO_REWRITE | Features::FAIL_SAFE_ERASE | Features::CRC);
        let geo = Geometry::compute(&c, 0, 64, 4096, None).unwrap();
        let s = geo.psh.sections.unwrap();
        assert_eq!(s.s0, 0);
        assert_eq!(s.s1_fields, 16);
        assert_eq!(s.s1_ind, 32);
        assert_eq!(s.s2_fields, 48);
        assert_eq!(s.s2_ind, 64);
        assert_eq!(s.s3_ind, 80);
        assert_eq!(geo.psh.len, 96);
        let l = geo.lsh.sections.unwrap();
        assert_eq!(l.s0, 0);
        assert_eq!(l.s1_ind, 16);
        assert_eq!(l.s2_ind, 32);
        assert_eq!(geo.lsh.len, 48);
    }

    #[test]
    fn sector_too_small_is_rejected() {
        let c = cfg(Features::empty());
        let err = Geometry::compute(&c, 0, 64, 512, None).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn offsets_are_consistent() {
        let c = cfg(Features::FAIL_SAFE_ERASE);
        let geo = Geometry::compute(&c, 0, 32, 4096, None).unwrap();
        assert_eq!(geo.psh_off(1), 4096);
        assert_eq!(geo.lsh_off(1, 0), 4096 + geo.psh.len as u32);
        assert_eq!(
            geo.payload_off(1, 1),
            geo.lsh_off(1, 1) + geo.lsh.len as u32
        );
        assert_eq!(geo.split_log_sector(geo.ls_per_ps as u32 + 2), (1, 2));
    }
}
