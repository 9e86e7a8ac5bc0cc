//! Logical sector header codec.
//!
//! An LSH precedes each payload slot inside a physical sector. It carries
//! the block-relative position of the payload, the payload CRC-16 and the
//! per-ECC-block parity words, and commits the slot with a single line
//! write: either the stat-byte flip (rewrite media) or the valid-indicator
//! section (no-rewrite media). Preparatory writes only touch blank lines,
//! so a torn write never produces a committed slot.

use alloc::vec::Vec;

use crate::config::Features;
use crate::error::Error;
use crate::geometry::{Geometry, LshSections};
use crate::structures::header::{
    ECC_STAT_INVALID, ECC_STAT_VALID, EccSlot, HeaderBuf, INDICATOR_SET, classify, crc_slot,
    crc_stat_for_slot, ecc_slot, indicator_set, is_blank,
};
use crate::structures::{Ctx, LsStat};

pub const STAT_EMPTY: u8 = 0xFF;
pub const STAT_VALID: u8 = 0xFE;
pub const STAT_INVALID: u8 = 0x00;

const STAT_CODES: [u8; 3] = [STAT_EMPTY, STAT_VALID, STAT_INVALID];
const STATS: [LsStat; 3] = [LsStat::Empty, LsStat::Valid, LsStat::Invalid];

/// Seed of the payload CRC-16.
const PAYLOAD_CRC_SEED: u16 = 0xFFFF;

/// Rewrite-mode field offsets; they depend on how many parity words the
/// payload needs, so they are computed, not constant.
struct Offs {
    brsi: usize,
    crc_data: usize,
    parity: usize,
    content_end: usize,
    crc_stat: usize,
    crc0: usize,
    ecc_stat0: usize,
    ecc_stat1: usize,
    ecc0: usize,
    ecc1: usize,
}

fn offs(num_ecc_blocks: usize) -> Offs {
    let parity = 5;
    let content_end = parity + 2 * num_ecc_blocks;
    Offs {
        brsi: 1,
        crc_data: 3,
        parity,
        content_end,
        crc_stat: content_end,
        crc0: content_end + 1,
        ecc_stat0: content_end + 3,
        ecc_stat1: content_end + 4,
        ecc0: content_end + 5,
        ecc1: content_end + 7,
    }
}

/// No-rewrite base-section offsets, relative to the section start.
mod sec {
    pub const BRSI: usize = 0;
    pub const CRC_DATA: usize = 2;
    pub const PARITY: usize = 4;
    // content end = PARITY + 2 * num_ecc_blocks, then crc u8, ecc_stat u8,
    // ecc u16.
}

/// Parsed view of an LSH.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LshInfo {
    pub stat: LsStat,
    pub brsi: u16,
    pub crc_data: u16,
    /// Payload parity words, one per ECC block; empty when ECC is off.
    pub parity: Vec<u16>,
    /// The whole header is blank.
    pub blank: bool,
}

impl LshInfo {
    fn bare(stat: LsStat) -> Self {
        Self {
            stat,
            brsi: 0,
            crc_data: 0,
            parity: Vec::new(),
            blank: false,
        }
    }
}

pub fn decode(ctx: &Ctx, geo: &Geometry, bytes: &[u8]) -> Result<LshInfo, Error> {
    if is_blank(&bytes[..geo.lsh.len]) {
        return Ok(LshInfo {
            blank: true,
            ..LshInfo::bare(LsStat::Empty)
        });
    }
    match geo.lsh.sections {
        None => decode_rewrite(ctx, geo, bytes),
        Some(s) => decode_sections(ctx, geo, bytes, &s),
    }
}

fn read_parity(ctx: &Ctx, content: &[u8], base: usize, n: usize) -> Vec<u16> {
    (0..n)
        .map(|i| ctx.order.read_u16(&content[base + 2 * i..]))
        .collect()
}

fn decode_rewrite(ctx: &Ctx, geo: &Geometry, bytes: &[u8]) -> Result<LshInfo, Error> {
    let o = offs(geo.lsh.num_ecc_blocks);
    let tolerant = ctx.has(Features::ECC) && !ctx.has(Features::CRC);
    let stat_idx = classify(bytes[0], &STAT_CODES, tolerant).ok_or(Error::InconsistentData)?;
    let stat = STATS[stat_idx];
    if stat == LsStat::Invalid {
        return Ok(LshInfo::bare(LsStat::Invalid));
    }

    let mut content = bytes[..o.ecc1 + 2].to_vec();
    if ctx.has(Features::ECC) {
        let parity_off = match (ecc_slot(content[o.ecc_stat1]), ecc_slot(content[o.ecc_stat0])) {
            (EccSlot::Valid, _) => o.ecc1,
            (_, EccSlot::Valid) => o.ecc0,
            _ => return Err(Error::Ecc),
        };
        let parity = ctx.order.read_u16(&content[parity_off..]);
        let (head, _) = content.split_at_mut(o.content_end);
        ctx.ecc
            .decode(&mut head[1..], parity)
            .map_err(|_| Error::Ecc)?;
    }
    if ctx.has(Features::CRC) {
        let slot = crc_slot(content[o.crc_stat], ctx.has(Features::ECC)).ok_or(Error::Crc)?;
        if ctx.crc.crc8(0, &content[..o.content_end]) != content[o.crc0 + slot] {
            return Err(Error::Crc);
        }
    }

    Ok(LshInfo {
        stat,
        brsi: ctx.order.read_u16(&content[o.brsi..]),
        crc_data: ctx.order.read_u16(&content[o.crc_data..]),
        parity: read_parity(ctx, &content, o.parity, geo.lsh.num_ecc_blocks),
        blank: false,
    })
}

fn decode_sections(
    ctx: &Ctx,
    geo: &Geometry,
    bytes: &[u8],
    s: &LshSections,
) -> Result<LshInfo, Error> {
    if indicator_set(bytes[s.s2_ind]) {
        return Ok(LshInfo::bare(LsStat::Invalid));
    }
    let n = geo.lsh.num_ecc_blocks;
    let content_end = sec::PARITY + 2 * n;
    let s0_len = content_end + 4;
    let s0 = &bytes[s.s0..s.s0 + s0_len];
    let committed = indicator_set(bytes[s.s1_ind]);
    if is_blank(s0) {
        if committed {
            // Valid indicator over a blank base section.
            return Err(Error::InconsistentData);
        }
        return Ok(LshInfo::bare(LsStat::Empty));
    }

    let mut content = s0.to_vec();
    if ctx.has(Features::ECC) {
        if ecc_slot(content[content_end + 1]) != EccSlot::Valid {
            return Err(Error::Ecc);
        }
        let parity = ctx.order.read_u16(&content[content_end + 2..]);
        let (head, _) = content.split_at_mut(content_end);
        ctx.ecc.decode(head, parity).map_err(|_| Error::Ecc)?;
    }
    if ctx.has(Features::CRC)
        && ctx.crc.crc8(0, &content[..content_end]) != content[content_end]
    {
        return Err(Error::Crc);
    }

    Ok(LshInfo {
        stat: if committed { LsStat::Valid } else { LsStat::Empty },
        brsi: ctx.order.read_u16(&content[sec::BRSI..]),
        crc_data: ctx.order.read_u16(&content[sec::CRC_DATA..]),
        parity: read_parity(ctx, &content, sec::PARITY, n),
        blank: false,
    })
}

fn set_u16(ctx: &Ctx, buf: &mut HeaderBuf, off: usize, value: u16) {
    let mut raw = [0u8; 2];
    ctx.order.write_u16(&mut raw, value);
    buf.set(off, &raw);
}

fn write_rewrite_fields(
    ctx: &Ctx,
    buf: &mut HeaderBuf,
    o: &Offs,
    brsi: u16,
    crc_data: u16,
    parity: &[u16],
) {
    set_u16(ctx, buf, o.brsi, brsi);
    if ctx.has(Features::CRC) {
        set_u16(ctx, buf, o.crc_data, crc_data);
    }
    for (i, &p) in parity.iter().enumerate() {
        set_u16(ctx, buf, o.parity + 2 * i, p);
    }
}

fn advance_crc(ctx: &Ctx, buf: &mut HeaderBuf, o: &Offs) {
    if !ctx.has(Features::CRC) {
        return;
    }
    let next = match crc_slot(buf.bytes()[o.crc_stat], false) {
        None => 0,
        Some(s) => s + 1,
    };
    debug_assert!(next < 2);
    let crc = ctx.crc.crc8(0, &buf.bytes()[..o.content_end]);
    buf.set_u8(o.crc0 + next, crc);
    buf.set_u8(o.crc_stat, crc_stat_for_slot(next));
}

fn write_ecc(ctx: &Ctx, buf: &mut HeaderBuf, o: &Offs, slot: usize) {
    if !ctx.has(Features::ECC) {
        return;
    }
    let parity = ctx.ecc.encode(&buf.bytes()[1..o.content_end]);
    let (stat_off, parity_off) = match slot {
        0 => (o.ecc_stat0, o.ecc0),
        _ => (o.ecc_stat1, o.ecc1),
    };
    set_u16(ctx, buf, parity_off, parity);
    buf.set_u8(stat_off, ECC_STAT_VALID);
    if slot == 1 {
        buf.set_u8(o.ecc_stat0, ECC_STAT_INVALID);
    }
}

fn write_s0(
    ctx: &Ctx,
    geo: &Geometry,
    buf: &mut HeaderBuf,
    base: usize,
    brsi: u16,
    crc_data: u16,
    parity: &[u16],
) {
    set_u16(ctx, buf, base + sec::BRSI, brsi);
    if ctx.has(Features::CRC) {
        set_u16(ctx, buf, base + sec::CRC_DATA, crc_data);
    }
    for (i, &p) in parity.iter().enumerate() {
        set_u16(ctx, buf, base + sec::PARITY + 2 * i, p);
    }
    let content_end = sec::PARITY + 2 * geo.lsh.num_ecc_blocks;
    let content = buf.bytes()[base..base + content_end].to_vec();
    if ctx.has(Features::CRC) {
        buf.set_u8(base + content_end, ctx.crc.crc8(0, &content));
    }
    if ctx.has(Features::ECC) {
        set_u16(ctx, buf, base + content_end + 2, ctx.ecc.encode(&content));
        buf.set_u8(base + content_end + 1, ECC_STAT_VALID);
    }
}

/// Prepares the slot: every field is written, the commit is not.
pub fn encode_prep(
    ctx: &Ctx,
    geo: &Geometry,
    buf: &mut HeaderBuf,
    brsi: u16,
    crc_data: u16,
    parity: &[u16],
) {
    match geo.lsh.sections {
        None => {
            let o = offs(geo.lsh.num_ecc_blocks);
            write_rewrite_fields(ctx, buf, &o, brsi, crc_data, parity);
            advance_crc(ctx, buf, &o);
            write_ecc(ctx, buf, &o, 0);
        }
        Some(s) => write_s0(ctx, geo, buf, s.s0, brsi, crc_data, parity),
    }
}

/// Commits a prepared slot; the dirty range is exactly one line.
pub fn encode_commit_valid(ctx: &Ctx, geo: &Geometry, buf: &mut HeaderBuf) {
    match geo.lsh.sections {
        None => {
            let o = offs(geo.lsh.num_ecc_blocks);
            buf.set_u8(0, STAT_VALID);
            advance_crc(ctx, buf, &o);
        }
        Some(s) => buf.set_u8(s.s1_ind, INDICATOR_SET),
    }
}

/// Prepare and commit in one flush, for slots whose payload is already on
/// the medium (the work-block path writes the payload first).
pub fn encode_valid(
    ctx: &Ctx,
    geo: &Geometry,
    buf: &mut HeaderBuf,
    brsi: u16,
    crc_data: u16,
    parity: &[u16],
) {
    encode_prep(ctx, geo, buf, brsi, crc_data, parity);
    encode_commit_valid(ctx, geo, buf);
}

/// Marks a superseded copy invalid.
pub fn encode_invalid(_ctx: &Ctx, geo: &Geometry, buf: &mut HeaderBuf) {
    match geo.lsh.sections {
        None => buf.set_u8(0, STAT_INVALID),
        Some(s) => buf.set_u8(s.s2_ind, INDICATOR_SET),
    }
}

/// Payload CRC and parity for a buffer about to be written.
pub fn payload_checks(ctx: &Ctx, geo: &Geometry, payload: &[u8]) -> (u16, Vec<u16>) {
    let crc_data = if ctx.has(Features::CRC) {
        ctx.crc.crc16(PAYLOAD_CRC_SEED, payload)
    } else {
        0xFFFF
    };
    let parity = if ctx.has(Features::ECC) {
        payload
            .chunks(geo.ecc_block_size as usize)
            .map(|block| ctx.ecc.encode(block))
            .collect()
    } else {
        Vec::new()
    };
    (crc_data, parity)
}

/// Verifies a payload read back from the medium against its header,
/// correcting single-bit errors in place. Returns the number of corrected
/// bits.
pub fn verify_payload(
    ctx: &Ctx,
    geo: &Geometry,
    info: &LshInfo,
    payload: &mut [u8],
) -> Result<u32, Error> {
    let mut corrected = 0;
    if ctx.has(Features::ECC) {
        if info.parity.len() != geo.lsh.num_ecc_blocks {
            return Err(Error::Ecc);
        }
        for (block, &parity) in payload
            .chunks_mut(geo.ecc_block_size as usize)
            .zip(&info.parity)
        {
            corrected += ctx.ecc.decode(block, parity).map_err(|_| Error::Ecc)?;
        }
    }
    if ctx.has(Features::CRC) && ctx.crc.crc16(PAYLOAD_CRC_SEED, payload) != info.crc_data {
        return Err(Error::Crc);
    }
    Ok(corrected)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use norbm_common::{CrcSoftware, EccHamming};

    fn ctx(features: Features) -> Ctx<'static> {
        Ctx {
            order: Default::default(),
            features,
            crc: &CrcSoftware,
            ecc: &EccHamming,
        }
    }

    fn geo(features: Features) -> Geometry {
        let cfg = Config::with_features(features);
        Geometry::compute(&cfg, 0, 64, 4096, None).unwrap()
    }

    fn payload(geo: &Geometry) -> Vec<u8> {
        (0..geo.log_sector_size).map(|i| (i % 251) as u8).collect()
    }

    fn slot_lifecycle(features: Features) {
        let ctx = ctx(features);
        let geo = geo(features);
        let data = payload(&geo);
        let (crc_data, parity) = payload_checks(&ctx, &geo, &data);

        let mut buf = HeaderBuf::blank(geo.lsh.len);
        encode_prep(&ctx, &geo, &mut buf, 4, crc_data, &parity);
        let info = decode(&ctx, &geo, buf.bytes()).unwrap();
        assert_eq!(info.stat, LsStat::Empty);
        assert!(!info.blank);

        encode_commit_valid(&ctx, &geo, &mut buf);
        let info = decode(&ctx, &geo, buf.bytes()).unwrap();
        assert_eq!(info.stat, LsStat::Valid);
        assert_eq!(info.brsi, 4);

        let mut read_back = data.clone();
        assert_eq!(verify_payload(&ctx, &geo, &info, &mut read_back), Ok(0));

        encode_invalid(&ctx, &geo, &mut buf);
        let info = decode(&ctx, &geo, buf.bytes()).unwrap();
        assert_eq!(info.stat, LsStat::Invalid);
    }

    #[test]
    fn slot_lifecycle_rewrite() {
        slot_lifecycle(Features::CRC | Features::ECC);
    }

    #[test]
    fn slot_lifecycle_sections() {
        slot_lifecycle(Features::CRC | Features::NO_REWRITE);
    }

    #[test]
    fn one_shot_valid_matches_prep_commit() {
        let features = Features::CRC;
        let ctx = ctx(features);
        let geo = geo(features);
        let data = payload(&geo);
        let (crc_data, parity) = payload_checks(&ctx, &geo, &data);

        let mut buf = HeaderBuf::blank(geo.lsh.len);
        encode_valid(&ctx, &geo, &mut buf, 2, crc_data, &parity);
        let info = decode(&ctx, &geo, buf.bytes()).unwrap();
        assert_eq!(info.stat, LsStat::Valid);
        assert_eq!(info.brsi, 2);
    }

    #[test]
    fn payload_bit_flip_is_corrected() {
        let features = Features::CRC | Features::ECC;
        let ctx = ctx(features);
        let geo = geo(features);
        let data = payload(&geo);
        let (crc_data, parity) = payload_checks(&ctx, &geo, &data);

        let mut buf = HeaderBuf::blank(geo.lsh.len);
        encode_valid(&ctx, &geo, &mut buf, 0, crc_data, &parity);
        let info = decode(&ctx, &geo, buf.bytes()).unwrap();

        let mut corrupted = data.clone();
        corrupted[300] ^= 0x40;
        assert_eq!(verify_payload(&ctx, &geo, &info, &mut corrupted), Ok(1));
        assert_eq!(corrupted, data);
    }

    #[test]
    fn payload_crc_catches_multi_bit_damage() {
        let features = Features::CRC;
        let ctx = ctx(features);
        let geo = geo(features);
        let data = payload(&geo);
        let (crc_data, parity) = payload_checks(&ctx, &geo, &data);

        let mut buf = HeaderBuf::blank(geo.lsh.len);
        encode_valid(&ctx, &geo, &mut buf, 0, crc_data, &parity);
        let info = decode(&ctx, &geo, buf.bytes()).unwrap();

        let mut corrupted = data.clone();
        corrupted[10] = !corrupted[10];
        assert_eq!(
            verify_payload(&ctx, &geo, &info, &mut corrupted),
            Err(Error::Crc)
        );
    }

    #[test]
    fn torn_prep_stays_uncommitted() {
        let features = Features::CRC | Features::NO_REWRITE;
        let ctx = ctx(features);
        let geo = geo(features);
        let data = payload(&geo);
        let (crc_data, parity) = payload_checks(&ctx, &geo, &data);

        let mut buf = HeaderBuf::blank(geo.lsh.len);
        encode_prep(&ctx, &geo, &mut buf, 1, crc_data, &parity);
        // Half the base section reaches the medium.
        let mut torn = buf.bytes().to_vec();
        torn[4..geo.lsh.len].fill(0xFF);
        let res = decode(&ctx, &geo, &torn);
        assert!(matches!(res, Err(Error::Crc)) || matches!(res, Ok(LshInfo { stat: LsStat::Empty, .. })));
    }
}
