//! Clean, trim and free.
//!
//! Invalid sectors are erased lazily; `clean_one` performs one unit of
//! that deferred work so the caller can bound latency, `clean` runs it to
//! completion. Freeing whole logical blocks invalidates the backing
//! blocks, partial ranges invalidate individual copies.

use ::alloc::vec::Vec;

use norbm_phy::NorPhy;

use crate::cache::SlotId;
use crate::config::Features;
use crate::error::Error;
use crate::ftl::{Instance, Run};
use crate::structures::LsStat;

impl<P: NorPhy> Instance<P> {
    /// Performs at most one unit of maintenance work. Returns whether
    /// more remains.
    pub fn clean_one(&mut self) -> Result<bool, Error> {
        let mut run = self.run()?;
        if run.m.write_protected {
            return Err(Error::WriteProtected);
        }
        run.clean_one()
    }

    /// Runs maintenance until every free sector is blank and no
    /// convertible work block remains.
    pub fn clean(&mut self) -> Result<(), Error> {
        let mut run = self.run()?;
        if run.m.write_protected {
            return Err(Error::WriteProtected);
        }
        while run.clean_one()? {}
        Ok(())
    }

    /// Upper bound of [`Self::clean_one`] calls needed to get fully
    /// clean.
    pub fn clean_cnt(&mut self) -> Result<u32, Error> {
        self.run()?.clean_cnt()
    }

    /// Frees a contiguous range of logical sectors.
    pub fn free_sectors(&mut self, first: u32, count: u32) -> Result<(), Error> {
        let mut run = self.run()?;
        if run.m.write_protected {
            return Err(Error::WriteProtected);
        }
        let total = run.m.geo.num_log_sectors();
        if first >= total || count > total - first {
            return Err(Error::OutOfRange);
        }
        run.free_logical_sectors(first, count)
    }
}

impl<P: NorPhy> Run<'_, P> {
    pub fn clean_one(&mut self) -> Result<bool, Error> {
        // One dirty free sector, erased (with the same opportunistic
        // wear-leveling move an allocation would do).
        if let Some(psi) = self.m.dirty.next_set_from(self.m.mru_free + 1) {
            let cnt = self.erase_and_stamp(psi)?;
            if self.wear_level_for_clean(psi, cnt)? {
                // The move consumed the sector and dirtied another one.
                return Ok(true);
            }
            return self.more_to_clean();
        }
        // One work block that has a data block to merge with; converting
        // a work block without one would free nothing.
        if let Some(slot) = self.convertible_work_block() {
            self.convert_work_block(slot)?;
            return self.more_to_clean();
        }
        Ok(false)
    }

    fn more_to_clean(&mut self) -> Result<bool, Error> {
        Ok(self.m.dirty.count() > 0 || self.convertible_work_block().is_some())
    }

    fn convertible_work_block(&self) -> Option<SlotId> {
        self.m
            .work
            .iter_used()
            .find(|&slot| self.m.l2p.get(self.m.work.get(slot).lbi).is_some())
    }

    /// Post-erase wear-leveling step of the clean path. The vacated cold
    /// sector comes back stamped and stays in the free pool.
    fn wear_level_for_clean(&mut self, psi: u32, cnt: u32) -> Result<bool, Error> {
        Ok(self.wear_level_after_erase(psi, cnt)?.is_some())
    }

    pub fn clean_cnt(&mut self) -> Result<u32, Error> {
        let mut cnt = self.m.dirty.count();
        let slots: Vec<SlotId> = self.m.work.iter_used().collect();
        for slot in slots {
            let desc = self.m.work.get(slot).clone();
            let src_psi = self.m.l2p.get(desc.lbi);
            let src_info = match src_psi {
                Some(psi) => self.read_psh(psi).ok().map(|i| (psi, i)),
                None => None,
            };
            let src = src_info.as_ref().map(|(psi, info)| (*psi, info));
            let has_src = src.is_some();
            cnt += match (self.in_place_allowed(&desc, src), has_src) {
                // Stat flip plus one erase of the old data block.
                (true, true) => 2,
                // Nothing to do until data arrives next to it.
                (true, false) => 0,
                // Copy, then erase work block and old data block.
                (false, true) => 3,
                // Copy, then erase the work block.
                (false, false) => 2,
            };
        }
        Ok(cnt)
    }

    pub fn free_logical_sectors(&mut self, first: u32, count: u32) -> Result<(), Error> {
        let per = self.m.geo.ls_per_ps as u32;
        let mut ls = first;
        let end = first + count;
        while ls < end {
            let (lbi, brsi) = self.m.geo.split_log_sector(ls);
            if brsi == 0 && end - ls >= per {
                self.free_whole_block(lbi)?;
                ls += per;
            } else {
                let n = (per - brsi as u32).min(end - ls);
                for i in 0..n {
                    self.free_one(lbi, brsi + i as u16)?;
                }
                ls += n;
            }
        }
        Ok(())
    }

    fn free_whole_block(&mut self, lbi: u16) -> Result<(), Error> {
        log::trace!("freeing logical block {lbi}");
        if let Some(slot) = self.m.work.find(lbi) {
            let psi = self.m.work.get(slot).psi;
            self.mark_sector_invalid(psi)?;
            self.m.work.release(slot);
            self.erase_freed(psi)?;
        }
        if let Some(psi) = self.m.l2p.get(lbi) {
            if let Ok(info) = self.read_psh(psi) {
                self.forget_data_block(self.clamp_erase_cnt(info.erase_cnt));
            }
            self.mark_sector_invalid(psi)?;
            self.m.l2p.set(lbi, None);
            self.release_data_desc(lbi);
            self.erase_freed(psi)?;
        }
        Ok(())
    }

    fn erase_freed(&mut self, psi: u32) -> Result<(), Error> {
        if self.ctx.has(Features::ERASE_USED_SECTORS) {
            self.erase_and_stamp(psi)?;
        }
        Ok(())
    }

    fn free_one(&mut self, lbi: u16, brsi: u16) -> Result<(), Error> {
        if let Some(slot) = self.m.work.find(lbi) {
            if let Some(srsi) = self.m.work.get(slot).assign[brsi as usize] {
                let psi = self.m.work.get(slot).psi;
                self.mark_lsh_invalid(psi, srsi)?;
                // The slot stays accounted as written; only the mapping
                // goes away.
                self.m.work.get_mut(slot).assign[brsi as usize] = None;
            }
        }
        if let Some(psi) = self.m.l2p.get(lbi) {
            if matches!(self.read_lsh(psi, brsi), Ok(info) if info.stat == LsStat::Valid) {
                self.mark_lsh_invalid(psi, brsi)?;
                if let Some(slot) = self.m.data.find(lbi) {
                    self.m.data.get_mut(slot).set_written(brsi);
                }
            }
        }
        Ok(())
    }
}
