//! Erased-block allocation and wear leveling.
//!
//! Allocation is a passive scan over the free map starting behind the
//! last hand-out: a sector that already passes the emptiness check is
//! taken as is, anything else is erased first. The active step kicks in
//! when the fresh erase count runs away from the least-erased data block
//! by the configured bound: that cold block is moved into the hot sector
//! and the vacated, barely-worn sector is handed out instead.

use crate::config::Features;
use crate::error::Error;
use crate::ftl::Run;
use crate::structures::header::HeaderBuf;
use crate::structures::psh::PshInfo;
use crate::structures::{MAX_ERASE_CNT, SectorStat, psh};

use norbm_phy::NorPhy;

impl<P: NorPhy> Run<'_, P> {
    /// Hands out an erased physical sector and its erase count.
    pub fn alloc_erased_block(&mut self) -> Result<(u32, u32), Error> {
        loop {
            if let Some(found) = self.alloc_pass()? {
                return Ok(found);
            }
            if self.m.wl_suspended {
                log::debug!("no blank sector left, lifting wear-leveling suspension");
                self.m.wl_suspended = false;
                continue;
            }
            return Err(self.fatal(Error::OutOfFreeSectors, 0));
        }
    }

    /// One scan over every free sector, starting behind the allocation
    /// hint.
    fn alloc_pass(&mut self) -> Result<Option<(u32, u32)>, Error> {
        let total = self.m.geo.num_phy_sectors;
        if total < 2 {
            return Ok(None);
        }
        let span = total - 1;
        let start = self.m.mru_free % span; // 0-based over [1, total)
        for i in 0..span {
            let psi = 1 + (start + i) % span;
            if !self.m.free.is_free(psi) {
                continue;
            }
            let info = self.read_psh(psi).ok();
            if let Some(info) = &info {
                if self.is_verified_empty(info) {
                    let cnt = self.clamp_erase_cnt(info.erase_cnt);
                    self.m.free.mark_allocated(psi);
                    self.m.mru_free = psi;
                    return Ok(Some((psi, cnt)));
                }
            }
            if self.m.wl_suspended {
                continue;
            }
            let cnt = match self.erase_and_stamp(psi) {
                Ok(cnt) => cnt,
                Err(Error::Write) => {
                    // The stamp did not stick; leave the sector dirty and
                    // try the next one.
                    self.m.dirty.set(psi);
                    continue;
                }
                Err(e) => return Err(e),
            };
            if let Some((vpsi, vcnt)) = self.wear_level_after_erase(psi, cnt)? {
                self.m.free.mark_allocated(vpsi);
                self.m.mru_free = vpsi;
                return Ok(Some((vpsi, vcnt)));
            }
            self.m.free.mark_allocated(psi);
            self.m.mru_free = psi;
            return Ok(Some((psi, cnt)));
        }
        Ok(None)
    }

    /// The emptiness check: stamped, not a torn allocation, and (with
    /// fail-safe erase) carrying the valid signature.
    fn is_verified_empty(&self, info: &PshInfo) -> bool {
        info.stat == SectorStat::Empty
            && !info.stale_alloc
            && matches!(info.erase_cnt, Some(c) if c <= MAX_ERASE_CNT)
            && (!self.ctx.has(Features::FAIL_SAFE_ERASE) || info.sig_valid)
    }

    /// Fail-safe erase protocol: destroy the signature, erase, verify,
    /// stamp the incremented count plus the fresh signature.
    pub fn erase_and_stamp(&mut self, psi: u32) -> Result<u32, Error> {
        let info = self.read_psh(psi).ok();
        let old_cnt = self.clamp_erase_cnt(info.as_ref().and_then(|i| i.erase_cnt));
        // A power cut between here and the stamp leaves a sector that can
        // never be mistaken for fully erased. An already-invalid sector
        // needs no extra write.
        if self.ctx.has(Features::FAIL_SAFE_ERASE)
            && info
                .as_ref()
                .is_some_and(|i| i.sig_valid && i.stat != SectorStat::Invalid)
        {
            let mut buf = self.load_psh_buf(psi)?;
            psh::encode_invalid(&self.ctx, &self.m.geo, &mut buf);
            let base = self.m.geo.psh_off(psi);
            self.flush_header(base, &mut buf)?;
        }

        let dev_sector = self.m.geo.first_sector + psi;
        let mut erased = false;
        for attempt in 0..=self.num_erase_retries {
            if self.phy.erase_sector(dev_sector).is_err() {
                log::warn!("erase of psi {psi} failed (attempt {attempt})");
                continue;
            }
            if !self.verify_erase(psi)? {
                log::warn!("psi {psi} not blank after erase (attempt {attempt})");
                continue;
            }
            erased = true;
            break;
        }
        if !erased {
            return Err(self.fatal(Error::OutOfFreeSectors, psi));
        }

        let new_cnt = old_cnt.wrapping_add(1);
        let mut buf = HeaderBuf::blank(self.m.geo.psh.len);
        psh::encode_erase_stamp(&self.ctx, &self.m.geo, &mut buf, new_cnt);
        let base = self.m.geo.psh_off(psi);
        self.flush_header(base, &mut buf)?;
        self.m.dirty.clear(psi);
        self.note_erase_cnt(new_cnt);
        log::trace!("psi {psi} erased, cnt {new_cnt}");
        Ok(new_cnt)
    }

    fn verify_erase(&mut self, psi: u32) -> Result<bool, Error> {
        if !self.ctx.has(Features::FAIL_SAFE_ERASE)
            && !self.ctx.has(Features::ERASE_VERIFICATION)
        {
            return Ok(true);
        }
        let dev_sector = self.m.geo.first_sector + psi;
        if let Some(blank) = self.phy.is_sector_blank(dev_sector) {
            return Ok(blank);
        }
        let size = self.m.geo.phy_sector_size;
        let mut off = 0;
        let mut chunk = [0u8; 256];
        while off < size {
            let len = chunk.len().min((size - off) as usize);
            self.read_bytes(self.m.geo.psh_off(psi) + off, &mut chunk[..len])?;
            if chunk[..len].iter().any(|&b| b != 0xFF) {
                return Ok(false);
            }
            off += len as u32;
        }
        Ok(true)
    }

    /// Active wear leveling after an erase pushed `psi` to `cnt`: move
    /// the least-erased data block into it and hand out that block's
    /// barely-worn sector instead.
    pub(crate) fn wear_level_after_erase(
        &mut self,
        psi: u32,
        cnt: u32,
    ) -> Result<Option<(u32, u32)>, Error> {
        let min = self.erase_cnt_min();
        if cnt.saturating_sub(min) < self.max_erase_cnt_diff {
            return Ok(None);
        }
        let Some((victim_psi, victim)) = self.find_data_block_with_cnt(min)? else {
            return Ok(None);
        };
        log::debug!(
            "wear leveling: moving lbi {} from psi {victim_psi} (cnt {min}) into psi {psi} (cnt {cnt})",
            victim.lbi
        );
        self.m.free.mark_allocated(psi);
        self.move_data_block(victim_psi, &victim, psi, cnt)?;
        // The vacated, barely-worn sector comes back erased and free; the
        // caller decides whether to hand it out.
        let vcnt = self.erase_and_stamp(victim_psi)?;
        Ok(Some((victim_psi, vcnt)))
    }

    /// Lowest erase count among data blocks, rescanning if the cached
    /// tracking ran out.
    fn erase_cnt_min(&mut self) -> u32 {
        if self.m.erase_cnt_min != u32::MAX && self.m.num_erase_cnt_min > 0 {
            return self.m.erase_cnt_min;
        }
        let mut min = u32::MAX;
        let mut n = 0;
        for psi in 1..self.m.geo.num_phy_sectors {
            if self.m.free.is_free(psi) {
                continue;
            }
            let Ok(info) = self.read_psh(psi) else { continue };
            if info.stat != SectorStat::Valid {
                continue;
            }
            let cnt = self.clamp_erase_cnt(info.erase_cnt);
            if cnt < min {
                min = cnt;
                n = 1;
            } else if cnt == min {
                n += 1;
            }
        }
        self.m.erase_cnt_min = min;
        self.m.num_erase_cnt_min = n;
        min
    }

    fn find_data_block_with_cnt(&mut self, cnt: u32) -> Result<Option<(u32, PshInfo)>, Error> {
        for psi in 1..self.m.geo.num_phy_sectors {
            if self.m.free.is_free(psi) {
                continue;
            }
            let Ok(info) = self.read_psh(psi) else { continue };
            if info.stat == SectorStat::Valid && self.clamp_erase_cnt(info.erase_cnt) == cnt {
                return Ok(Some((psi, info)));
            }
        }
        Ok(None)
    }
}
