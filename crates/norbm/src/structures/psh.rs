//! Physical sector header codec.
//!
//! The PSH records what a physical sector currently is: empty (with its
//! erase count and fail-safe signature), a work block, a data block, or
//! invalid content awaiting erase. State transitions only ever clear bits,
//! so the whole lifecycle fits one erase cycle of the header bytes.

use crate::config::Features;
use crate::error::Error;
use crate::geometry::{Geometry, PshSections, psh_off as off, psh_sec as sec};
use crate::structures::header::{
    ECC_STAT_INVALID, ECC_STAT_VALID, EccSlot, HeaderBuf, INDICATOR_SET, classify, crc_slot,
    crc_stat_for_slot, ecc_slot, indicator_set, is_blank,
};
use crate::structures::{Ctx, ERASE_SIGNATURE_INVALID, ERASE_SIGNATURE_VALID, SectorStat};

pub const STAT_EMPTY: u8 = 0xFF;
pub const STAT_WORK: u8 = 0xFE;
pub const STAT_VALID: u8 = 0xFC;
pub const STAT_INVALID: u8 = 0x00;

const STAT_CODES: [u8; 4] = [STAT_EMPTY, STAT_WORK, STAT_VALID, STAT_INVALID];
const STATS: [SectorStat; 4] = [
    SectorStat::Empty,
    SectorStat::Work,
    SectorStat::Valid,
    SectorStat::Invalid,
];

/// Parsed view of a PSH.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PshInfo {
    pub stat: SectorStat,
    pub lbi: u16,
    pub data_cnt: u8,
    /// `None` if the sector was never stamped (or the stamp is unreadable).
    pub erase_cnt: Option<u32>,
    /// The fail-safe erase signature is present and valid.
    pub sig_valid: bool,
    /// An allocation started but never reached its commit: the sector
    /// reads as empty but carries allocation fields.
    pub stale_alloc: bool,
    /// The whole header is blank.
    pub blank: bool,
}

impl PshInfo {
    fn empty() -> Self {
        Self {
            stat: SectorStat::Empty,
            lbi: 0,
            data_cnt: 0,
            erase_cnt: None,
            sig_valid: false,
            stale_alloc: false,
            blank: false,
        }
    }

    fn invalid() -> Self {
        Self {
            stat: SectorStat::Invalid,
            ..Self::empty()
        }
    }
}

pub fn decode(ctx: &Ctx, geo: &Geometry, bytes: &[u8]) -> Result<PshInfo, Error> {
    if is_blank(&bytes[..geo.psh.len]) {
        return Ok(PshInfo {
            blank: true,
            ..PshInfo::empty()
        });
    }
    match geo.psh.sections {
        None => decode_rewrite(ctx, bytes),
        Some(s) => decode_sections(ctx, bytes, &s),
    }
}

fn decode_rewrite(ctx: &Ctx, bytes: &[u8]) -> Result<PshInfo, Error> {
    let tolerant = ctx.has(Features::ECC) && !ctx.has(Features::CRC);
    let stat_idx =
        classify(bytes[off::STAT], &STAT_CODES, tolerant).ok_or(Error::InconsistentData)?;
    let stat = STATS[stat_idx];
    if stat == SectorStat::Invalid {
        // The invalidation broke the checksum coverage on purpose; the
        // erase count is taken as is so the wear history survives until
        // the erase (the MAX_ERASE_CNT clamp bounds a corrupted value).
        let raw = ctx.order.read_u32(&bytes[off::ERASE_CNT..]);
        return Ok(PshInfo {
            erase_cnt: (raw != u32::MAX).then_some(raw),
            ..PshInfo::invalid()
        });
    }

    let mut content = [0u8; off::RAW_END];
    content.copy_from_slice(&bytes[..off::RAW_END]);
    if ctx.has(Features::ECC) {
        let parity_off = match (
            ecc_slot(content[off::ECC_STAT1]),
            ecc_slot(content[off::ECC_STAT0]),
        ) {
            (EccSlot::Valid, _) => off::ECC1,
            (_, EccSlot::Valid) => off::ECC0,
            _ => return Err(Error::Ecc),
        };
        let parity = ctx.order.read_u16(&content[parity_off..]);
        let (head, _) = content.split_at_mut(off::CONTENT_END);
        ctx.ecc
            .decode(&mut head[1..], parity)
            .map_err(|_| Error::Ecc)?;
    }
    if ctx.has(Features::CRC) {
        let slot = crc_slot(content[off::CRC_STAT], ctx.has(Features::ECC)).ok_or(Error::Crc)?;
        if ctx.crc.crc8(0, &content[..off::CONTENT_END]) != content[off::CRC0 + slot] {
            return Err(Error::Crc);
        }
    }

    let lbi = ctx.order.read_u16(&content[off::LBI..]);
    let erase_cnt_raw = ctx.order.read_u32(&content[off::ERASE_CNT..]);
    let sig = ctx.order.read_u32(&content[off::ERASE_SIG..]);
    Ok(PshInfo {
        stat,
        lbi,
        data_cnt: content[off::DATA_CNT],
        erase_cnt: (erase_cnt_raw != u32::MAX).then_some(erase_cnt_raw),
        sig_valid: sig == ERASE_SIGNATURE_VALID,
        stale_alloc: stat == SectorStat::Empty && lbi != u16::MAX,
        blank: false,
    })
}

fn decode_sections(ctx: &Ctx, bytes: &[u8], s: &PshSections) -> Result<PshInfo, Error> {
    // The base section is decoded tolerantly: an unreadable erase stamp
    // downgrades the sector to "not verified empty", which forces an erase
    // on allocation instead of discarding live block state.
    let (erase_cnt, sig_valid) = decode_s0(ctx, &bytes[s.s0..s.s0 + sec::S0_LEN]);
    if indicator_set(bytes[s.s3_ind]) {
        return Ok(PshInfo {
            erase_cnt,
            sig_valid,
            ..PshInfo::invalid()
        });
    }
    for (ind, fields_off, stat) in [
        (s.s2_ind, s.s2_fields, SectorStat::Valid),
        (s.s1_ind, s.s1_fields, SectorStat::Work),
    ] {
        if indicator_set(bytes[ind]) {
            let (lbi, data_cnt) = decode_fields(ctx, &bytes[fields_off..fields_off + sec::F_LEN])?;
            return Ok(PshInfo {
                stat,
                lbi,
                data_cnt,
                erase_cnt,
                sig_valid,
                stale_alloc: false,
                blank: false,
            });
        }
    }
    let stale_alloc = !is_blank(&bytes[s.s1_fields..s.s1_fields + sec::F_LEN])
        || !is_blank(&bytes[s.s2_fields..s.s2_fields + sec::F_LEN]);
    Ok(PshInfo {
        erase_cnt,
        sig_valid,
        stale_alloc,
        ..PshInfo::empty()
    })
}

fn decode_s0(ctx: &Ctx, s0: &[u8]) -> (Option<u32>, bool) {
    if is_blank(s0) {
        return (None, false);
    }
    let mut content = [0u8; sec::S0_LEN];
    content.copy_from_slice(s0);
    if ctx.has(Features::ECC) {
        if ecc_slot(content[sec::S0_ECC_STAT]) != EccSlot::Valid {
            return (None, false);
        }
        let parity = ctx.order.read_u16(&content[sec::S0_ECC..]);
        let (head, _) = content.split_at_mut(sec::S0_CONTENT_END);
        if ctx.ecc.decode(head, parity).is_err() {
            return (None, false);
        }
    }
    if ctx.has(Features::CRC)
        && ctx.crc.crc8(0, &content[..sec::S0_CONTENT_END]) != content[sec::S0_CRC]
    {
        return (None, false);
    }
    let erase_cnt_raw = ctx.order.read_u32(&content[sec::S0_ERASE_CNT..]);
    let sig = ctx.order.read_u32(&content[sec::S0_ERASE_SIG..]);
    (
        (erase_cnt_raw != u32::MAX).then_some(erase_cnt_raw),
        sig == ERASE_SIGNATURE_VALID,
    )
}

fn decode_fields(ctx: &Ctx, fields: &[u8]) -> Result<(u16, u8), Error> {
    if is_blank(fields) {
        // Indicator set with blank fields: the section never got written.
        return Err(Error::InconsistentData);
    }
    let mut content = [0u8; sec::F_LEN];
    content.copy_from_slice(fields);
    if ctx.has(Features::ECC) {
        if ecc_slot(content[sec::F_ECC_STAT]) != EccSlot::Valid {
            return Err(Error::Ecc);
        }
        let parity = ctx.order.read_u16(&content[sec::F_ECC..]);
        let (head, _) = content.split_at_mut(sec::F_CONTENT_END);
        ctx.ecc.decode(head, parity).map_err(|_| Error::Ecc)?;
    }
    if ctx.has(Features::CRC)
        && ctx.crc.crc8(0, &content[..sec::F_CONTENT_END]) != content[sec::F_CRC]
    {
        return Err(Error::Crc);
    }
    Ok((
        ctx.order.read_u16(&content[sec::F_LBI..]),
        content[sec::F_DATA_CNT],
    ))
}

fn set_u16(ctx: &Ctx, buf: &mut HeaderBuf, off: usize, value: u16) {
    let mut raw = [0u8; 2];
    ctx.order.write_u16(&mut raw, value);
    buf.set(off, &raw);
}

fn set_u32(ctx: &Ctx, buf: &mut HeaderBuf, off: usize, value: u32) {
    let mut raw = [0u8; 4];
    ctx.order.write_u32(&mut raw, value);
    buf.set(off, &raw);
}

/// Writes the next CRC slot over the (already mutated) content range and
/// advances the rolling status.
fn advance_crc(ctx: &Ctx, buf: &mut HeaderBuf) {
    if !ctx.has(Features::CRC) {
        return;
    }
    let next = match crc_slot(buf.bytes()[off::CRC_STAT], false) {
        None => 0,
        Some(s) => s + 1,
    };
    debug_assert!(next < off::NUM_CRC_SLOTS);
    let crc = ctx.crc.crc8(0, &buf.bytes()[..off::CONTENT_END]);
    buf.set_u8(off::CRC0 + next, crc);
    buf.set_u8(off::CRC_STAT, crc_stat_for_slot(next));
}

/// Writes the header ECC parity into `slot`, invalidating slot 0 when the
/// second slot takes over.
fn write_ecc(ctx: &Ctx, buf: &mut HeaderBuf, slot: usize) {
    if !ctx.has(Features::ECC) {
        return;
    }
    let parity = ctx
        .ecc
        .encode(&buf.bytes()[off::STAT + 1..off::CONTENT_END]);
    let (stat_off, parity_off) = match slot {
        0 => (off::ECC_STAT0, off::ECC0),
        _ => (off::ECC_STAT1, off::ECC1),
    };
    set_u16(ctx, buf, parity_off, parity);
    buf.set_u8(stat_off, ECC_STAT_VALID);
    if slot == 1 {
        buf.set_u8(off::ECC_STAT0, ECC_STAT_INVALID);
    }
}

fn write_s0(ctx: &Ctx, buf: &mut HeaderBuf, base: usize, erase_cnt: u32, with_sig: bool) {
    set_u32(ctx, buf, base + sec::S0_ERASE_CNT, erase_cnt);
    if with_sig {
        set_u32(ctx, buf, base + sec::S0_ERASE_SIG, ERASE_SIGNATURE_VALID);
    }
    let content: [u8; sec::S0_CONTENT_END] = buf.bytes()[base..base + sec::S0_CONTENT_END]
        .try_into()
        .unwrap();
    if ctx.has(Features::CRC) {
        buf.set_u8(base + sec::S0_CRC, ctx.crc.crc8(0, &content));
    }
    if ctx.has(Features::ECC) {
        set_u16(ctx, buf, base + sec::S0_ECC, ctx.ecc.encode(&content));
        buf.set_u8(base + sec::S0_ECC_STAT, ECC_STAT_VALID);
    }
}

fn write_fields(ctx: &Ctx, buf: &mut HeaderBuf, base: usize, lbi: u16, data_cnt: u8) {
    set_u16(ctx, buf, base + sec::F_LBI, lbi);
    buf.set_u8(base + sec::F_DATA_CNT, data_cnt);
    let content: [u8; sec::F_CONTENT_END] = buf.bytes()[base..base + sec::F_CONTENT_END]
        .try_into()
        .unwrap();
    if ctx.has(Features::CRC) {
        buf.set_u8(base + sec::F_CRC, ctx.crc.crc8(0, &content));
    }
    if ctx.has(Features::ECC) {
        set_u16(ctx, buf, base + sec::F_ECC, ctx.ecc.encode(&content));
        buf.set_u8(base + sec::F_ECC_STAT, ECC_STAT_VALID);
    }
}

/// Post-erase stamp: erase count plus, with fail-safe erase, the valid
/// signature.
pub fn encode_erase_stamp(ctx: &Ctx, geo: &Geometry, buf: &mut HeaderBuf, erase_cnt: u32) {
    let with_sig = ctx.has(Features::FAIL_SAFE_ERASE);
    match geo.psh.sections {
        None => {
            set_u32(ctx, buf, off::ERASE_CNT, erase_cnt);
            if with_sig {
                set_u32(ctx, buf, off::ERASE_SIG, ERASE_SIGNATURE_VALID);
            }
            advance_crc(ctx, buf);
            write_ecc(ctx, buf, 0);
        }
        Some(s) => write_s0(ctx, buf, s.s0, erase_cnt, with_sig),
    }
}

/// Allocates the sector as a work or data block in one committed step.
pub fn encode_alloc(
    ctx: &Ctx,
    geo: &Geometry,
    buf: &mut HeaderBuf,
    stat: SectorStat,
    lbi: u16,
    data_cnt: u8,
) {
    debug_assert!(matches!(stat, SectorStat::Work | SectorStat::Valid));
    match geo.psh.sections {
        None => {
            buf.set_u8(
                off::STAT,
                if stat == SectorStat::Work {
                    STAT_WORK
                } else {
                    STAT_VALID
                },
            );
            buf.set_u8(off::DATA_CNT, data_cnt);
            set_u16(ctx, buf, off::LBI, lbi);
            advance_crc(ctx, buf);
            write_ecc(ctx, buf, 1);
        }
        Some(s) => {
            let (fields, ind) = if stat == SectorStat::Work {
                (s.s1_fields, s.s1_ind)
            } else {
                (s.s2_fields, s.s2_ind)
            };
            write_fields(ctx, buf, fields, lbi, data_cnt);
            buf.set_u8(ind, INDICATOR_SET);
        }
    }
}

/// Via-copy preparation: allocation fields without the committing stat, so
/// a torn copy is discarded at mount.
pub fn encode_prep_valid(ctx: &Ctx, geo: &Geometry, buf: &mut HeaderBuf, lbi: u16, data_cnt: u8) {
    match geo.psh.sections {
        None => {
            buf.set_u8(off::DATA_CNT, data_cnt);
            set_u16(ctx, buf, off::LBI, lbi);
            advance_crc(ctx, buf);
            write_ecc(ctx, buf, 1);
        }
        Some(s) => write_fields(ctx, buf, s.s2_fields, lbi, data_cnt),
    }
}

/// Commits a prepared sector as a data block. The single line covering the
/// mutation is the atomic commit point.
pub fn encode_commit_valid(ctx: &Ctx, geo: &Geometry, buf: &mut HeaderBuf) {
    match geo.psh.sections {
        None => {
            buf.set_u8(off::STAT, STAT_VALID);
            advance_crc(ctx, buf);
        }
        Some(s) => buf.set_u8(s.s2_ind, INDICATOR_SET),
    }
}

/// In-place conversion commit: work block becomes the data block.
pub fn encode_work_to_valid(ctx: &Ctx, geo: &Geometry, buf: &mut HeaderBuf, lbi: u16, data_cnt: u8) {
    match geo.psh.sections {
        None => {
            // The convertibility predicate rules this path out when
            // checking is enabled on rewrite media: the stat flip must not
            // need a fresh CRC slot.
            debug_assert!(!ctx.checking());
            buf.set_u8(off::STAT, STAT_VALID);
        }
        Some(s) => {
            write_fields(ctx, buf, s.s2_fields, lbi, data_cnt);
            buf.set_u8(s.s2_ind, INDICATOR_SET);
        }
    }
}

/// Marks the sector invalid (pre-erased). With fail-safe erase the
/// signature is destroyed in the same line write.
pub fn encode_invalid(ctx: &Ctx, geo: &Geometry, buf: &mut HeaderBuf) {
    match geo.psh.sections {
        None => {
            buf.set_u8(off::STAT, STAT_INVALID);
            if ctx.has(Features::FAIL_SAFE_ERASE) {
                set_u32(ctx, buf, off::ERASE_SIG, ERASE_SIGNATURE_INVALID);
            }
        }
        Some(s) => buf.set_u8(s.s3_ind, INDICATOR_SET),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::structures::header::HeaderBuf;
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

    fn lifecycle(features: Features) {
        let ctx = ctx(features);
        let geo = geo(features);
        let mut buf = HeaderBuf::blank(geo.psh.len);

        let info = decode(&ctx, &geo, buf.bytes()).unwrap();
        assert!(info.blank);

        encode_erase_stamp(&ctx, &geo, &mut buf, 7);
        let info = decode(&ctx, &geo, buf.bytes()).unwrap();
        assert_eq!(info.stat, SectorStat::Empty);
        assert_eq!(info.erase_cnt, Some(7));
        assert!(info.sig_valid);
        assert!(!info.stale_alloc);

        encode_alloc(&ctx, &geo, &mut buf, SectorStat::Work, 3, 9);
        let info = decode(&ctx, &geo, buf.bytes()).unwrap();
        assert_eq!(info.stat, SectorStat::Work);
        assert_eq!(info.lbi, 3);
        assert_eq!(info.data_cnt, 9);
        assert_eq!(info.erase_cnt, Some(7));

        encode_invalid(&ctx, &geo, &mut buf);
        let info = decode(&ctx, &geo, buf.bytes()).unwrap();
        assert_eq!(info.stat, SectorStat::Invalid);
    }

    #[test]
    fn work_lifecycle_rewrite_crc() {
        lifecycle(Features::FAIL_SAFE_ERASE | Features::CRC);
    }

    #[test]
    fn work_lifecycle_rewrite_crc_ecc() {
        lifecycle(Features::FAIL_SAFE_ERASE | Features::CRC | Features::ECC);
    }

    #[test]
    fn work_lifecycle_sections() {
        lifecycle(Features::FAIL_SAFE_ERASE | Features::CRC | Features::NO_REWRITE);
    }

    fn prep_then_commit(features: Features) {
        let ctx = ctx(features);
        let geo = geo(features);
        let mut buf = HeaderBuf::blank(geo.psh.len);
        encode_erase_stamp(&ctx, &geo, &mut buf, 1);
        encode_prep_valid(&ctx, &geo, &mut buf, 5, 2);
        // Not committed yet: still empty, but detectably stale.
        let info = decode(&ctx, &geo, buf.bytes()).unwrap();
        assert_eq!(info.stat, SectorStat::Empty);
        assert!(info.stale_alloc);

        encode_commit_valid(&ctx, &geo, &mut buf);
        let info = decode(&ctx, &geo, buf.bytes()).unwrap();
        assert_eq!(info.stat, SectorStat::Valid);
        assert_eq!(info.lbi, 5);
        assert_eq!(info.data_cnt, 2);
    }

    #[test]
    fn prep_then_commit_rewrite() {
        prep_then_commit(Features::FAIL_SAFE_ERASE | Features::CRC | Features::ECC);
    }

    #[test]
    fn prep_then_commit_sections() {
        prep_then_commit(Features::FAIL_SAFE_ERASE | Features::CRC | Features::NO_REWRITE);
    }

    #[test]
    fn ecc_recovers_flipped_field_bit() {
        let features = Features::FAIL_SAFE_ERASE | Features::ECC;
        let ctx = ctx(features);
        let geo = geo(features);
        let mut buf = HeaderBuf::blank(geo.psh.len);
        encode_erase_stamp(&ctx, &geo, &mut buf, 3);
        encode_alloc(&ctx, &geo, &mut buf, SectorStat::Valid, 11, 1);

        let mut bytes = buf.bytes().to_vec();
        bytes[off::LBI] ^= 0x04;
        let info = decode(&ctx, &geo, &bytes).unwrap();
        assert_eq!(info.lbi, 11);
    }

    #[test]
    fn corrupt_crc_is_rejected() {
        let features = Features::FAIL_SAFE_ERASE | Features::CRC;
        let ctx = ctx(features);
        let geo = geo(features);
        let mut buf = HeaderBuf::blank(geo.psh.len);
        encode_erase_stamp(&ctx, &geo, &mut buf, 3);
        encode_alloc(&ctx, &geo, &mut buf, SectorStat::Valid, 11, 1);

        let mut bytes = buf.bytes().to_vec();
        bytes[off::DATA_CNT] ^= 0x20;
        assert_eq!(decode(&ctx, &geo, &bytes), Err(Error::Crc));
    }

    #[test]
    fn commit_is_single_line() {
        let features = Features::FAIL_SAFE_ERASE | Features::CRC | Features::NO_REWRITE;
        let ctx = ctx(features);
        let geo = geo(features);
        let mut buf = HeaderBuf::blank(geo.psh.len);
        encode_erase_stamp(&ctx, &geo, &mut buf, 1);
        encode_prep_valid(&ctx, &geo, &mut buf, 5, 2);
        buf.take_dirty(geo.line_size);
        encode_commit_valid(&ctx, &geo, &mut buf);
        let (start, end) = buf.take_dirty(geo.line_size).unwrap();
        assert_eq!(end - start, geo.line_size);
    }
}
