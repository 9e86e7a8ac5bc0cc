//! On-flash structures of the block map.
//!
//! Every physical sector starts with a physical sector header ([`psh`])
//! followed by `ls_per_ps` pairs of logical sector header ([`lsh`]) and
//! payload. Physical sector 0 carries the format-info and fatal-error
//! records ([`raw`]) instead. The codecs in this module are the only place
//! that knows byte offsets; everything above works on the parsed views.
//!
//! Two layouts exist. On rewrite-capable media a header is a flat run of
//! fields mutated in place by bit-clearing writes, with a rolling CRC
//! status selecting the current checksum slot. On no-rewrite media a header
//! splits into flash-line-aligned sections, one per state indicator, each
//! written at most once per erase cycle; the state is derived by probing
//! which indicator was last set (reversed logic, 0x00 = set).

pub mod header;
pub mod lsh;
pub mod psh;
pub mod raw;

use norbm_common::{ByteOrder, CrcApi, EccApi};

use crate::config::Features;

/// Stamped after a successful erase when fail-safe erase is on.
pub const ERASE_SIGNATURE_VALID: u32 = 0x4E4F_5245;
/// Overwrites the signature before an erase starts.
pub const ERASE_SIGNATURE_INVALID: u32 = 0;
/// Erase counts above this read back as invalid.
pub const MAX_ERASE_CNT: u32 = 0xFFFF_0000;

/// State of a physical sector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SectorStat {
    /// Erased, or erased-and-stamped; no block data.
    Empty,
    /// Holds a work block.
    Work,
    /// Holds a data block.
    Valid,
    /// Superseded content awaiting erase.
    Invalid,
}

/// State of a logical sector slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LsStat {
    /// Never committed (blank, or prepared but not committed).
    Empty,
    /// Holds the live copy.
    Valid,
    /// Superseded copy.
    Invalid,
}

/// Borrowed codec context: the per-instance knobs every encode/decode
/// needs. Built on the fly from the instance fields so the phy handle can
/// stay mutably borrowed alongside it; public so image tooling and tests
/// can drive the codecs directly.
#[derive(Clone, Copy)]
pub struct Ctx<'a> {
    pub order: ByteOrder,
    pub features: Features,
    pub crc: &'a dyn CrcApi,
    pub ecc: &'a dyn EccApi,
}

impl Ctx<'_> {
    pub fn has(&self, f: Features) -> bool {
        self.features.contains(f)
    }

    /// Checking is any integrity verification at all.
    pub fn checking(&self) -> bool {
        self.features.intersects(Features::CRC | Features::ECC)
    }
}
