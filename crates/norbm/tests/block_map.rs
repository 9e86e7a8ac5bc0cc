//! Functional tests over the RAM-backed medium.

use norbm::{Config, Error, FatalPolicy, Features, Instance, NorDevice, SectorUsage};
use norbm_phy::{FaultPlan, RamNor};
use pretty_assertions::assert_eq;

const NUM_SECTORS: u32 = 32;
const PHY_SECTOR: u32 = 4096;
const SECTOR: usize = 512;

fn cfg(features: Features) -> Config {
    Config::with_features(features).with_num_work_blocks(3)
}

fn instance(features: Features) -> Instance<RamNor> {
    let mut inst = Instance::new(RamNor::new(NUM_SECTORS, PHY_SECTOR), cfg(features));
    inst.format().unwrap();
    inst.mount().unwrap();
    inst
}

fn pattern(b: u8) -> Vec<u8> {
    vec![b; SECTOR]
}

fn read(inst: &mut Instance<RamNor>, sector: u32) -> Vec<u8> {
    let mut buf = vec![0u8; SECTOR];
    inst.read_sector(sector, &mut buf).unwrap();
    buf
}

#[test]
fn write_then_read_single_sector() {
    let mut inst = instance(Features::FAIL_SAFE_ERASE | Features::CRC);
    inst.write_sector(0, &pattern(0xAA)).unwrap();
    assert_eq!(read(&mut inst, 0), pattern(0xAA));
    assert_eq!(inst.sector_usage(0).unwrap(), SectorUsage::InUse);
    assert_eq!(inst.sector_usage(1).unwrap(), SectorUsage::NotUsed);
}

#[test]
fn unwritten_sector_reads_fill_pattern() {
    let mut inst = instance(Features::FAIL_SAFE_ERASE);
    assert_eq!(read(&mut inst, 5), pattern(0xFF));
}

#[test]
fn scattered_overwrite_merges_through_clean() {
    let mut inst = instance(Features::FAIL_SAFE_ERASE | Features::CRC);
    let per = inst.disk_info().unwrap().ls_per_ps as u32;

    // Fill one logical block, then supersede its first sector: the new
    // copy lands in a work block.
    for i in 0..per {
        inst.write_sector(i, &pattern(0xB0 + i as u8)).unwrap();
    }
    inst.write_sector(0, &pattern(0xC0)).unwrap();
    assert_eq!(read(&mut inst, 0), pattern(0xC0));
    for i in 1..per {
        assert_eq!(read(&mut inst, i), pattern(0xB0 + i as u8));
    }

    // Clean converts the work block back into exactly one data block.
    inst.clean().unwrap();
    assert_eq!(inst.clean_cnt().unwrap(), 0);
    assert!(!inst.clean_one().unwrap());
    assert_eq!(read(&mut inst, 0), pattern(0xC0));
    for i in 1..per {
        assert_eq!(read(&mut inst, i), pattern(0xB0 + i as u8));
    }
}

#[test]
fn repeated_writes_converge() {
    let mut inst = instance(Features::FAIL_SAFE_ERASE | Features::CRC);
    inst.write_sector(3, &pattern(0x11)).unwrap();
    inst.write_sector(3, &pattern(0x11)).unwrap();
    assert_eq!(read(&mut inst, 3), pattern(0x11));
    // Many supersessions of one sector must cycle work blocks without
    // running out of space.
    for round in 0..40u32 {
        inst.write_sector(3, &pattern(round as u8)).unwrap();
    }
    assert_eq!(read(&mut inst, 3), pattern(39));
}

#[test]
fn writes_across_many_blocks() {
    let mut inst = instance(Features::FAIL_SAFE_ERASE | Features::CRC);
    let info = inst.disk_info().unwrap();
    let per = info.ls_per_ps as u32;
    let blocks = info.num_log_blocks.min(8);
    for lbi in 0..blocks {
        inst.write_sector(lbi * per + 2, &pattern(0x40 + lbi as u8))
            .unwrap();
    }
    for lbi in 0..blocks {
        assert_eq!(read(&mut inst, lbi * per + 2), pattern(0x40 + lbi as u8));
    }
}

#[test]
fn trim_returns_fill_pattern() {
    let mut inst = instance(Features::FAIL_SAFE_ERASE | Features::CRC);
    inst.write_sector(0, &pattern(0xEE)).unwrap();
    inst.free_sectors(0, 1).unwrap();
    assert_eq!(read(&mut inst, 0), pattern(0xFF));
    assert_eq!(inst.sector_usage(0).unwrap(), SectorUsage::NotUsed);
}

#[test]
fn trim_with_invalid_sector_error_reports() {
    let mut inst = instance(
        Features::FAIL_SAFE_ERASE | Features::CRC | Features::INVALID_SECTOR_ERROR,
    );
    inst.write_sector(0, &pattern(0xEE)).unwrap();
    inst.free_sectors(0, 1).unwrap();
    let mut buf = vec![0u8; SECTOR];
    assert!(inst.read_sector(0, &mut buf).is_err());
}

#[test]
fn free_whole_block_releases_both_backing_blocks() {
    let mut inst = instance(Features::FAIL_SAFE_ERASE | Features::CRC);
    let per = inst.disk_info().unwrap().ls_per_ps as u32;
    for i in 0..per {
        inst.write_sector(i, &pattern(0x70)).unwrap();
    }
    // Force a work block next to the data block.
    inst.write_sector(0, &pattern(0x71)).unwrap();
    inst.free_sectors(0, per).unwrap();
    for i in 0..per {
        assert_eq!(read(&mut inst, i), pattern(0xFF));
    }
    // The freed sectors are dirty until clean erases them.
    assert!(inst.clean_cnt().unwrap() >= 2);
    inst.clean().unwrap();
    assert_eq!(inst.clean_cnt().unwrap(), 0);
}

#[test]
fn state_survives_remount() {
    let mut inst = instance(Features::FAIL_SAFE_ERASE | Features::CRC);
    let per = inst.disk_info().unwrap().ls_per_ps as u32;
    for i in 0..per {
        inst.write_sector(i, &pattern(0x90 + i as u8)).unwrap();
    }
    inst.write_sector(2, &pattern(0x21)).unwrap();

    inst.unmount();
    inst.mount().unwrap();
    assert_eq!(read(&mut inst, 2), pattern(0x21));
    for i in (0..per).filter(|&i| i != 2) {
        assert_eq!(read(&mut inst, i), pattern(0x90 + i as u8));
    }
}

#[test]
fn no_rewrite_mode_round_trips_and_converts() {
    let features = Features::FAIL_SAFE_ERASE | Features::CRC | Features::NO_REWRITE;
    let mut inst = instance(features);
    let per = inst.disk_info().unwrap().ls_per_ps as u32;
    for i in 0..per {
        inst.write_sector(i, &pattern(0x50 + i as u8)).unwrap();
    }
    inst.write_sector(0, &pattern(0x51)).unwrap();
    inst.clean().unwrap();
    assert_eq!(read(&mut inst, 0), pattern(0x51));
    for i in 1..per {
        assert_eq!(read(&mut inst, i), pattern(0x50 + i as u8));
    }
    inst.unmount();
    inst.mount().unwrap();
    assert_eq!(read(&mut inst, 0), pattern(0x51));
}

#[test]
fn ecc_corrects_a_flipped_payload_bit() {
    let features = Features::FAIL_SAFE_ERASE | Features::CRC | Features::ECC;
    let mut inst = instance(features);
    inst.write_sector(0, &pattern(0xA5)).unwrap();

    // The first data block lands in physical sector 1, slot 0.
    let geo = norbm::geometry::Geometry::compute(
        &cfg(features),
        0,
        NUM_SECTORS,
        PHY_SECTOR,
        None,
    )
    .unwrap();
    let off = geo.payload_off(1, 0) as usize;
    inst.phy_mut().image_mut()[off + 17] ^= 0x08;

    assert_eq!(read(&mut inst, 0), pattern(0xA5));
}

#[test]
fn payload_damage_reports_read_error_without_latching() {
    let features = Features::FAIL_SAFE_ERASE | Features::CRC;
    // Even a write-protect-happy callback must not get a persistent read
    // failure latched; the medium stays writable.
    let config = cfg(features)
        .with_on_fatal_error(Box::new(|_| FatalPolicy::WriteProtect));
    let mut inst = Instance::new(RamNor::new(NUM_SECTORS, PHY_SECTOR), config);
    inst.format().unwrap();
    inst.mount().unwrap();
    inst.write_sector(0, &pattern(0x33)).unwrap();

    let geo =
        norbm::geometry::Geometry::compute(&cfg(features), 0, NUM_SECTORS, PHY_SECTOR, None)
            .unwrap();
    let off = geo.payload_off(1, 0) as usize;
    // Two flipped bits: beyond any correction, the CRC must catch it.
    inst.phy_mut().image_mut()[off + 1] ^= 0x18;

    let mut buf = vec![0u8; SECTOR];
    assert_eq!(inst.read_sector(0, &mut buf), Err(Error::Crc));

    let info = inst.disk_info().unwrap();
    assert!(!info.has_fatal_error);
    assert!(!info.is_write_protected);
    inst.write_sector(1, &pattern(0x44)).unwrap();

    inst.unmount();
    let info = inst.mount().unwrap();
    assert!(!info.has_fatal_error);
    assert!(!info.is_write_protected);
    assert_eq!(read(&mut inst, 1), pattern(0x44));
}

#[test]
fn write_exhaustion_latches_write_protect_when_asked() {
    let features = Features::FAIL_SAFE_ERASE | Features::CRC;
    let config = cfg(features)
        .with_on_fatal_error(Box::new(|_| FatalPolicy::WriteProtect));
    let mut inst = Instance::new(RamNor::new(NUM_SECTORS, PHY_SECTOR), config);
    inst.format().unwrap();
    inst.mount().unwrap();
    inst.write_sector(0, &pattern(0x11)).unwrap();

    // Every write from here on fails; the retry budget runs dry.
    inst.phy_mut().arm_fault(FaultPlan {
        fail_on_write: 1,
        torn_bytes: 0,
    });
    assert_eq!(inst.write_sector(1, &pattern(0x22)), Err(Error::Write));

    // The latch holds in RAM even though the dead device also rejected
    // the on-flash record.
    let info = inst.disk_info().unwrap();
    assert!(info.has_fatal_error);
    assert!(info.is_write_protected);
    inst.phy_mut().clear_fault();
    assert_eq!(
        inst.write_sector(2, &pattern(0x33)),
        Err(Error::WriteProtected)
    );
}

#[test]
fn wear_leveling_suspension_still_writes() {
    let mut inst = instance(Features::FAIL_SAFE_ERASE | Features::CRC);
    inst.set_wear_leveling_suspended(true).unwrap();
    inst.write_sector(0, &pattern(0x61)).unwrap();
    inst.write_sector(0, &pattern(0x62)).unwrap();
    assert_eq!(read(&mut inst, 0), pattern(0x62));
}

#[test]
fn blank_medium_requires_format() {
    let mut inst = Instance::new(
        RamNor::new(NUM_SECTORS, PHY_SECTOR),
        cfg(Features::FAIL_SAFE_ERASE),
    );
    assert_eq!(inst.requires_format(), Ok(true));
    assert_eq!(inst.mount().unwrap_err(), Error::NotFormatted);
    inst.format().unwrap();
    assert_eq!(inst.requires_format(), Ok(false));
    inst.mount().unwrap();
}

#[test]
fn device_facade_multi_sector_io() {
    let mut dev = NorDevice::new(
        RamNor::new(NUM_SECTORS, PHY_SECTOR),
        cfg(Features::FAIL_SAFE_ERASE | Features::CRC),
    );
    assert_eq!(dev.name(), "nor-bm");
    assert!(dev.status().present);
    assert!(dev.requires_format().unwrap());
    dev.format_low_level().unwrap();

    let mut out = Vec::new();
    for i in 0..3u8 {
        out.extend_from_slice(&pattern(0x10 + i));
    }
    dev.write(4, &out, 3, false).unwrap();
    // repeat_same: one sector's worth of data fanned out.
    dev.write(10, &pattern(0x77), 2, true).unwrap();

    let mut buf = vec![0u8; SECTOR * 3];
    dev.read(4, &mut buf, 3).unwrap();
    assert_eq!(buf, out);
    let mut buf = vec![0u8; SECTOR * 2];
    dev.read(10, &mut buf, 2).unwrap();
    assert_eq!(buf, [pattern(0x77), pattern(0x77)].concat());

    let info = dev.dev_info().unwrap();
    assert_eq!(info.log_sector_size, SECTOR as u32);
    dev.unmount().unwrap();
}
