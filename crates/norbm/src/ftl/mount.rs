//! Low-level format and mount.
//!
//! Format erases the medium and writes the format record, magic last, so
//! an interrupted format reads back as unformatted. Mount reads the
//! record, rebuilds every RAM structure from one scan over the physical
//! sector headers, reloads the per-sector state of surviving work blocks
//! and finally picks up a latched fatal record.

use ::alloc::vec;
use ::alloc::vec::Vec;

use norbm_phy::NorPhy;

use crate::cache::{BlockCache, SlotId};
use crate::config::Features;
use crate::error::Error;
use crate::freemap::{FreeMap, SectorBitmap};
use crate::ftl::{DiskInfo, Instance, Mounted, Run};
use crate::geometry::Geometry;
use crate::l2p::L2pTable;
use crate::structures::header::HeaderBuf;
use crate::structures::psh::PshInfo;
use crate::structures::raw::{FORMAT_MAGIC_LEN, FormatInfo, FatalRecord, RawFormatInfo};
use crate::structures::{Ctx, LsStat, MAX_ERASE_CNT, SectorStat, psh};

/// Writes the dirty lines of a header buffer without a mounted instance.
fn write_header_lines<P: NorPhy>(
    phy: &mut P,
    abs_base: u32,
    buf: &mut HeaderBuf,
    line: usize,
) -> Result<(), Error> {
    let Some((start, end)) = buf.take_dirty(line) else {
        return Ok(());
    };
    let mut off = start;
    while off < end {
        let chunk = &buf.bytes()[off..(off + line).min(end)];
        phy.write_off(abs_base + off as u32, chunk)
            .map_err(Error::from_write)?;
        off += line;
    }
    Ok(())
}

impl<P: NorPhy> Instance<P> {
    /// The storage window: (first device sector, sector count, sector
    /// size, absolute base offset).
    fn window(&mut self) -> Result<(u32, u32, u32, u32), Error> {
        self.phy.init().map_err(Error::from_read)?;
        let dev = self.phy.num_sectors();
        let first = self.cfg.first_sector;
        if first >= dev {
            return Err(Error::Config("storage window outside the device"));
        }
        let avail = dev - first;
        let num = self.cfg.num_sectors.unwrap_or(avail).min(avail);
        let info = self.phy.sector_info(first);
        Ok((first, num, info.size, info.offset))
    }

    fn ctx(&self) -> Ctx<'_> {
        Ctx {
            order: self.cfg.byte_order,
            features: self.cfg.features,
            crc: &*self.cfg.crc,
            ecc: &*self.cfg.ecc,
        }
    }

    /// Whether the medium carries a valid format record.
    pub fn requires_format(&mut self) -> Result<bool, Error> {
        let (_, _, _, base) = self.window()?;
        let mut bytes = [0u8; size_of::<RawFormatInfo>()];
        self.phy
            .read_off(base, &mut bytes)
            .map_err(Error::from_read)?;
        match FormatInfo::decode(&self.ctx(), &bytes) {
            Ok(_) => Ok(false),
            Err(Error::NotFormatted) => Ok(true),
            Err(e) => Err(e),
        }
    }

    /// Low-level format: erase, stamp, write the format record.
    ///
    /// Erase counts of previously stamped sectors survive the format.
    pub fn format(&mut self) -> Result<(), Error> {
        self.mnt = None;
        let (first, num, sector_size, base) = self.window()?;
        let geo = Geometry::compute(&self.cfg, first, num, sector_size, None)?;
        log::debug!(
            "low-level format: {num} sectors, {} logical blocks, {} work blocks",
            geo.num_log_blocks,
            geo.num_work_blocks
        );

        for psi in 0..num {
            let abs = base + geo.psh_off(psi);
            let old_cnt = if psi == 0 {
                None
            } else {
                let mut bytes = vec![0u8; geo.psh.len];
                self.phy.read_off(abs, &mut bytes).map_err(Error::from_read)?;
                psh::decode(&self.ctx(), &geo, &bytes)
                    .ok()
                    .and_then(|i| i.erase_cnt)
                    .filter(|&c| c <= MAX_ERASE_CNT)
            };

            let blank = self
                .phy
                .is_sector_blank(first + psi)
                .unwrap_or(false);
            if blank && self.cfg.features.contains(Features::SKIP_BLANK_SECTORS) {
                continue;
            }
            if !blank || !self.cfg.features.contains(Features::SKIP_BLANK_SECTORS) {
                self.phy
                    .erase_sector(first + psi)
                    .map_err(Error::from_erase)?;
            }
            if psi > 0 {
                let mut buf = HeaderBuf::blank(geo.psh.len);
                psh::encode_erase_stamp(
                    &self.ctx(),
                    &geo,
                    &mut buf,
                    old_cnt.unwrap_or(0).wrapping_add(1),
                );
                write_header_lines(&mut self.phy, abs, &mut buf, geo.line_size)?;
            }
        }

        // The record body goes first, the magic line last: power loss in
        // between leaves an unformatted medium, never a half-trusted one.
        let record = FormatInfo {
            bytes_per_sector: geo.log_sector_size,
            num_log_blocks: geo.num_log_blocks,
            num_work_blocks: geo.num_work_blocks,
            fail_safe_erase: self.cfg.features.contains(Features::FAIL_SAFE_ERASE),
        };
        let raw = record.encode(&self.ctx());
        let bytes = raw.as_bytes();
        self.phy
            .write_off(base + FORMAT_MAGIC_LEN as u32, &bytes[FORMAT_MAGIC_LEN..])
            .map_err(Error::from_write)?;
        self.phy
            .write_off(base, &bytes[..FORMAT_MAGIC_LEN])
            .map_err(Error::from_write)?;
        log::debug!("low-level format done");
        Ok(())
    }

    /// Low-level mount: rebuilds all RAM state from the medium.
    pub fn mount(&mut self) -> Result<DiskInfo, Error> {
        self.mnt = None;
        let (first, num, sector_size, base) = self.window()?;

        let mut bytes = [0u8; size_of::<RawFormatInfo>()];
        self.phy
            .read_off(base, &mut bytes)
            .map_err(Error::from_read)?;
        let record = FormatInfo::decode(&self.ctx(), &bytes)?;
        // The recorded fail-safe flag wins over the configured one; the
        // emptiness rules must match what the format wrote.
        self.cfg
            .features
            .set(Features::FAIL_SAFE_ERASE, record.fail_safe_erase);

        let geo = Geometry::compute(&self.cfg, first, num, sector_size, Some(&record))?;
        log::debug!(
            "mounting: {num} sectors, {} logical blocks, {} work blocks",
            geo.num_log_blocks,
            geo.num_work_blocks
        );
        self.mnt = Some(Mounted {
            base_off: base,
            free: FreeMap::new(num),
            dirty: SectorBitmap::new(num),
            l2p: L2pTable::new(geo.num_log_blocks, num),
            work: BlockCache::new(geo.num_work_blocks, geo.ls_per_ps, true),
            data: BlockCache::new(geo.num_work_blocks, geo.ls_per_ps, false),
            erase_cnt_max: 0,
            erase_cnt_min: u32::MAX,
            num_erase_cnt_min: 0,
            mru_free: 0,
            wl_suspended: false,
            write_protected: false,
            fatal: None,
            geo,
        });

        if let Err(e) = self.run()?.mount_scan() {
            self.mnt = None;
            return Err(e);
        }
        self.disk_info()
    }
}

impl<P: NorPhy> Run<'_, P> {
    fn mount_scan(&mut self) -> Result<(), Error> {
        for psi in 1..self.m.geo.num_phy_sectors {
            match self.read_psh(psi) {
                Ok(info) => self.classify_sector(psi, &info),
                Err(Error::Read) => {
                    log::warn!("psi {psi} unreadable at mount");
                    self.m.free.mark_free(psi);
                    self.m.dirty.set(psi);
                }
                Err(e) => {
                    log::warn!("psi {psi} failed integrity at mount: {e:?}");
                    self.discard(psi);
                }
            }
        }

        let slots: Vec<SlotId> = self.m.work.iter_used().collect();
        for slot in slots {
            if self.load_work_state(slot)? {
                let lbi = self.m.work.get(slot).lbi;
                log::warn!("work block lbi {lbi} inconsistent, repairing via copy");
                if let Err(e) = self.convert_work_block_via_copy(slot) {
                    log::error!("repair of work block lbi {lbi} failed: {e:?}");
                    let psi = self.m.work.get(slot).psi;
                    self.discard(psi);
                    self.m.work.release(slot);
                }
            }
        }

        let mut bytes = vec![0u8; size_of::<crate::structures::raw::RawFatalInfo>()];
        self.read_bytes(self.m.geo.log_sector_size, &mut bytes)?;
        if let Some(record) = FatalRecord::decode(&self.ctx, &bytes) {
            log::warn!(
                "fatal record present: {:?} on psi {}",
                record.error,
                record.error_psi
            );
            self.m.fatal = Some(record);
            if record.is_write_protected || record.has_fatal_error {
                self.m.write_protected = true;
            }
        }
        Ok(())
    }

    fn classify_sector(&mut self, psi: u32, info: &PshInfo) {
        if let Some(cnt) = info.erase_cnt {
            self.note_erase_cnt(cnt);
        }
        match info.stat {
            SectorStat::Empty => {
                if info.blank {
                    // Factory blank: usable after a first erase-and-stamp.
                    self.m.free.mark_free(psi);
                } else if info.stale_alloc {
                    log::debug!("psi {psi}: unfinished allocation, discarding");
                    self.discard(psi);
                } else if self.ctx.has(Features::FAIL_SAFE_ERASE) && !info.sig_valid {
                    log::debug!("psi {psi}: interrupted erase, discarding");
                    self.discard(psi);
                } else {
                    self.m.free.mark_free(psi);
                }
            }
            SectorStat::Work => {
                if info.lbi as u32 >= self.m.geo.num_log_blocks {
                    log::warn!("psi {psi}: work block with bad lbi {}", info.lbi);
                    self.discard(psi);
                } else if self.m.work.find(info.lbi).is_some() {
                    log::warn!("psi {psi}: duplicate work block for lbi {}", info.lbi);
                    self.discard(psi);
                } else if self
                    .m
                    .work
                    .allocate(info.lbi, psi, info.data_cnt)
                    .is_none()
                {
                    log::warn!("psi {psi}: more work blocks than the format allows");
                    self.discard(psi);
                }
            }
            SectorStat::Valid => {
                if info.lbi as u32 >= self.m.geo.num_log_blocks {
                    log::warn!("psi {psi}: data block with bad lbi {}", info.lbi);
                    self.discard(psi);
                    return;
                }
                match self.m.l2p.get(info.lbi) {
                    None => {
                        self.m.l2p.set(info.lbi, Some(psi));
                        self.note_data_block(self.clamp_erase_cnt(info.erase_cnt));
                    }
                    Some(prev_psi) => self.resolve_duplicate(prev_psi, psi, info),
                }
            }
            SectorStat::Invalid => {
                self.m.free.mark_free(psi);
                self.m.dirty.set(psi);
            }
        }
    }

    /// Two data blocks carry the same lbi: the strictly-newer data count
    /// (difference of exactly 1 modulo 256) wins. Anything else violates
    /// the single-update-in-flight invariant and loses by default.
    fn resolve_duplicate(&mut self, prev_psi: u32, psi: u32, info: &PshInfo) {
        let prev = match self.read_psh(prev_psi) {
            Ok(prev) => prev,
            Err(_) => {
                self.discard(prev_psi);
                self.m.l2p.set(info.lbi, Some(psi));
                self.note_data_block(self.clamp_erase_cnt(info.erase_cnt));
                return;
            }
        };
        if info.data_cnt.wrapping_sub(prev.data_cnt) == 1 {
            log::debug!(
                "lbi {}: psi {psi} (cnt {}) supersedes psi {prev_psi} (cnt {})",
                info.lbi,
                info.data_cnt,
                prev.data_cnt
            );
            self.forget_data_block(self.clamp_erase_cnt(prev.erase_cnt));
            self.discard(prev_psi);
            self.m.l2p.set(info.lbi, Some(psi));
            self.note_data_block(self.clamp_erase_cnt(info.erase_cnt));
        } else {
            if prev.data_cnt.wrapping_sub(info.data_cnt) != 1 {
                log::warn!(
                    "lbi {}: duplicate data blocks with unordered counts {}/{}",
                    info.lbi,
                    prev.data_cnt,
                    info.data_cnt
                );
            }
            self.discard(psi);
        }
    }

    /// Pre-erases a sector that cannot be trusted.
    fn discard(&mut self, psi: u32) {
        if let Err(e) = self.mark_sector_invalid(psi) {
            log::warn!("could not invalidate psi {psi}: {e:?}");
            self.m.free.mark_free(psi);
            self.m.dirty.set(psi);
        }
    }

    /// Rebuilds the in-RAM state of one work block from its slot headers.
    /// Returns whether an inconsistency requires the block to be
    /// converted right away.
    fn load_work_state(&mut self, slot: SlotId) -> Result<bool, Error> {
        let psi = self.m.work.get(slot).psi;
        let mut needs_repair = false;
        for srsi in 0..self.m.geo.ls_per_ps {
            let info = match self.read_lsh(psi, srsi) {
                Ok(info) => info,
                Err(e) => {
                    log::warn!("work lsh ({psi},{srsi}) unreadable: {e:?}");
                    self.m.work.get_mut(slot).set_written(srsi);
                    needs_repair = true;
                    continue;
                }
            };
            match info.stat {
                LsStat::Valid => {
                    let brsi = info.brsi;
                    if brsi >= self.m.geo.ls_per_ps {
                        log::warn!("work lsh ({psi},{srsi}): bad brsi {brsi}");
                        self.m.work.get_mut(slot).set_written(srsi);
                        needs_repair = true;
                    } else if self.m.work.get(slot).assign[brsi as usize].is_some() {
                        // Two valid copies of one brsi; keep the first.
                        log::warn!("work lsh ({psi},{srsi}): duplicate copy of brsi {brsi}");
                        self.m.work.get_mut(slot).set_written(srsi);
                        needs_repair = true;
                    } else {
                        let desc = self.m.work.get_mut(slot);
                        desc.assign[brsi as usize] = Some(srsi);
                        desc.set_written(srsi);
                    }
                }
                LsStat::Invalid => self.m.work.get_mut(slot).set_written(srsi),
                LsStat::Empty if info.blank => {
                    // A blank header over a non-blank payload is a torn
                    // write; the slot is poisoned, never trusted.
                    if !self.payload_blank(psi, srsi)? {
                        log::debug!("work slot ({psi},{srsi}): torn payload, poisoning");
                        let _ = self.mark_lsh_invalid(psi, srsi);
                        self.m.work.get_mut(slot).set_written(srsi);
                    }
                }
                LsStat::Empty => {
                    // Prepared but never committed.
                    log::debug!("work slot ({psi},{srsi}): torn header, poisoning");
                    let _ = self.mark_lsh_invalid(psi, srsi);
                    self.m.work.get_mut(slot).set_written(srsi);
                }
            }
        }
        Ok(needs_repair)
    }

}
