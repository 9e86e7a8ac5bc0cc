//! Mount-scan behavior on hand-forged images: duplicate resolution,
//! discarded torn allocations, poisoned slots and active wear leveling.

use norbm::geometry::Geometry;
use norbm::structures::header::HeaderBuf;
use norbm::structures::raw::FatalRecord;
use norbm::structures::{Ctx, SectorStat, lsh, psh};
use norbm::{Config, Error, Features, Instance, SectorUsage};
use norbm_common::{ByteOrder, CrcSoftware, EccHamming};
use norbm_phy::{NorPhy, RamNor};

const NUM_SECTORS: u32 = 32;
const PHY_SECTOR: u32 = 4096;
const SECTOR: usize = 512;

fn cfg(features: Features) -> Config {
    Config::with_features(features)
        .with_num_work_blocks(3)
        .with_max_erase_cnt_diff(2)
}

fn ctx(features: Features) -> Ctx<'static> {
    Ctx {
        order: ByteOrder::Little,
        features,
        crc: &CrcSoftware,
        ecc: &EccHamming,
    }
}

fn geometry(features: Features) -> Geometry {
    Geometry::compute(&cfg(features), 0, NUM_SECTORS, PHY_SECTOR, None).unwrap()
}

fn formatted(features: Features) -> RamNor {
    let mut inst = Instance::new(RamNor::new(NUM_SECTORS, PHY_SECTOR), cfg(features));
    inst.format().unwrap();
    inst.into_phy()
}

fn pattern(b: u8) -> Vec<u8> {
    vec![b; SECTOR]
}

fn read(inst: &mut Instance<RamNor>, sector: u32) -> Vec<u8> {
    let mut buf = vec![0u8; SECTOR];
    inst.read_sector(sector, &mut buf).unwrap();
    buf
}

fn psh_buf(nor: &mut RamNor, geo: &Geometry, psi: u32) -> HeaderBuf {
    let mut bytes = vec![0u8; geo.psh.len];
    nor.read_off(geo.psh_off(psi), &mut bytes).unwrap();
    HeaderBuf::from_bytes(bytes)
}

/// Forges a data block carrying one valid sector at brsi 0.
fn forge_data_block(
    nor: &mut RamNor,
    c: &Ctx,
    geo: &Geometry,
    psi: u32,
    lbi: u16,
    data_cnt: u8,
    fill: u8,
) {
    let mut buf = psh_buf(nor, geo, psi);
    psh::encode_alloc(c, geo, &mut buf, SectorStat::Valid, lbi, data_cnt);
    nor.write_off(geo.psh_off(psi), buf.bytes()).unwrap();

    let payload = pattern(fill);
    nor.write_off(geo.payload_off(psi, 0), &payload).unwrap();
    let (crc_data, parity) = lsh::payload_checks(c, geo, &payload);
    let mut lb = HeaderBuf::blank(geo.lsh.len);
    lsh::encode_valid(c, geo, &mut lb, 0, crc_data, &parity);
    nor.write_off(geo.lsh_off(psi, 0), lb.bytes()).unwrap();
}

#[test]
fn mount_resolves_duplicate_data_blocks_by_count() {
    let features = Features::FAIL_SAFE_ERASE | Features::CRC;
    let c = ctx(features);
    let geo = geometry(features);
    let mut nor = formatted(features);

    // lbi 7 exists twice; count 0x06 is the strictly-newer copy.
    forge_data_block(&mut nor, &c, &geo, 5, 7, 0x05, 0x55);
    forge_data_block(&mut nor, &c, &geo, 6, 7, 0x06, 0x66);
    // lbi 9 exercises the modulo-256 wrap: 0x00 supersedes 0xFF.
    forge_data_block(&mut nor, &c, &geo, 8, 9, 0xFF, 0x11);
    forge_data_block(&mut nor, &c, &geo, 9, 9, 0x00, 0x22);

    let mut inst = Instance::new(nor, cfg(features));
    inst.mount().unwrap();
    let per = geo.ls_per_ps as u32;
    assert_eq!(read(&mut inst, 7 * per), pattern(0x66));
    assert_eq!(read(&mut inst, 9 * per), pattern(0x22));
    // The losers were pre-erased: clean has sectors to reclaim.
    assert!(inst.clean_cnt().unwrap() >= 2);
    inst.clean().unwrap();
    assert_eq!(read(&mut inst, 7 * per), pattern(0x66));
    assert_eq!(read(&mut inst, 9 * per), pattern(0x22));
}

#[test]
fn unfinished_allocation_is_discarded_at_mount() {
    let features = Features::FAIL_SAFE_ERASE | Features::CRC;
    let c = ctx(features);
    let geo = geometry(features);
    let mut nor = formatted(features);

    // Allocation fields without the committing stat: a torn block
    // allocation.
    let mut buf = psh_buf(&mut nor, &geo, 3);
    psh::encode_prep_valid(&c, &geo, &mut buf, 4, 0);
    nor.write_off(geo.psh_off(3), buf.bytes()).unwrap();

    let mut inst = Instance::new(nor, cfg(features));
    inst.mount().unwrap();
    let per = geo.ls_per_ps as u32;
    assert_eq!(read(&mut inst, 4 * per), pattern(0xFF));
    assert_eq!(inst.sector_usage(4 * per).unwrap(), SectorUsage::NotUsed);
    assert!(inst.clean_cnt().unwrap() >= 1);
}

#[test]
fn torn_work_slot_is_poisoned_not_reused() {
    let features = Features::FAIL_SAFE_ERASE | Features::CRC;
    let c = ctx(features);
    let geo = geometry(features);
    let mut nor = formatted(features);

    // A work block whose slot 0 got its payload torn before the header
    // was committed.
    let mut buf = psh_buf(&mut nor, &geo, 2);
    psh::encode_alloc(&c, &geo, &mut buf, SectorStat::Work, 0, 1);
    nor.write_off(geo.psh_off(2), buf.bytes()).unwrap();
    nor.write_off(geo.payload_off(2, 0), &[0xDE, 0xAD, 0xBE]).unwrap();

    let mut inst = Instance::new(nor, cfg(features));
    inst.mount().unwrap();
    assert_eq!(read(&mut inst, 0), pattern(0xFF));

    // The next write must stay clear of the poisoned slot and still read
    // back.
    inst.write_sector(0, &pattern(0x42)).unwrap();
    assert_eq!(read(&mut inst, 0), pattern(0x42));
    inst.unmount();
    inst.mount().unwrap();
    assert_eq!(read(&mut inst, 0), pattern(0x42));
}

#[test]
fn latched_fatal_record_write_protects_at_mount() {
    let features = Features::FAIL_SAFE_ERASE | Features::CRC;
    let c = ctx(features);
    let geo = geometry(features);
    let mut nor = formatted(features);

    // A previously latched fatal record in the second slot of sector 0.
    let record = FatalRecord {
        is_write_protected: true,
        has_fatal_error: true,
        error: Error::Write,
        error_psi: 9,
    };
    let raw = record.encode(&c);
    nor.write_off(geo.log_sector_size, raw.as_bytes()).unwrap();

    let mut inst = Instance::new(nor, cfg(features));
    let info = inst.mount().unwrap();
    assert!(info.has_fatal_error);
    assert!(info.is_write_protected);
    assert_eq!(
        inst.write_sector(0, &pattern(0x13)),
        Err(Error::WriteProtected)
    );
    assert_eq!(inst.clean_one(), Err(Error::WriteProtected));
    // Reads still work on a write-protected unit.
    assert_eq!(read(&mut inst, 0), pattern(0xFF));
}

#[test]
fn active_wear_leveling_moves_cold_block() {
    let features = Features::FAIL_SAFE_ERASE | Features::CRC;
    let c = ctx(features);
    let geo = geometry(features);

    let mut inst = Instance::new(RamNor::new(NUM_SECTORS, PHY_SECTOR), cfg(features));
    inst.format().unwrap();
    inst.mount().unwrap();
    // The cold block: written once, erase count 1, sitting at psi 1.
    inst.write_sector(0, &pattern(0xAB)).unwrap();
    inst.unmount();
    let mut nor = inst.into_phy();

    // Every other free sector looks heavily worn and dirty, so the next
    // allocation has to erase one and trip the wear bound.
    for psi in 2..NUM_SECTORS - 1 {
        nor.erase_sector(psi).unwrap();
        let mut buf = HeaderBuf::blank(geo.psh.len);
        psh::encode_erase_stamp(&c, &geo, &mut buf, 7);
        psh::encode_invalid(&c, &geo, &mut buf);
        nor.write_off(geo.psh_off(psi), buf.bytes()).unwrap();
    }
    let last = NUM_SECTORS - 1;
    nor.erase_sector(last).unwrap();
    let mut buf = HeaderBuf::blank(geo.psh.len);
    psh::encode_erase_stamp(&c, &geo, &mut buf, 7);
    nor.write_off(geo.psh_off(last), buf.bytes()).unwrap();

    let mut inst = Instance::new(nor, cfg(features));
    inst.mount().unwrap();
    let per = geo.ls_per_ps as u32;
    inst.write_sector(per, &pattern(0xCD)).unwrap();

    // The cold data survived the move, the new write went through, and
    // the erase ceiling reflects the recycled hot sector.
    assert_eq!(read(&mut inst, 0), pattern(0xAB));
    assert_eq!(read(&mut inst, per), pattern(0xCD));
    assert_eq!(inst.disk_info().unwrap().erase_cnt_max, 8);
    // The vacated cold sector took exactly one extra erase.
    assert_eq!(inst.phy_mut().phys_erase_cnt(1), 2);

    inst.unmount();
    inst.mount().unwrap();
    assert_eq!(read(&mut inst, 0), pattern(0xAB));
    assert_eq!(read(&mut inst, per), pattern(0xCD));
}
