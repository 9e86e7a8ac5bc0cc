//! Sector write path.
//!
//! The fast path appends straight into the data block when the native
//! slot is still blank; everything else funnels through a work block,
//! which absorbs scattered updates until conversion merges them back.
//! Every visible transition commits with a single line write, and every
//! recoverable failure converts or relocates before the retry so the
//! same bad lines are not hit twice.

use norbm_phy::NorPhy;

use crate::cache::SlotId;
use crate::config::Features;
use crate::error::Error;
use crate::ftl::{Instance, Run};
use crate::structures::{LsStat, SectorStat, lsh, psh};

impl<P: NorPhy> Instance<P> {
    /// Writes one logical sector.
    pub fn write_sector(&mut self, log_sector: u32, data: &[u8]) -> Result<(), Error> {
        let mut run = self.run()?;
        if run.m.write_protected {
            return Err(Error::WriteProtected);
        }
        if log_sector >= run.m.geo.num_log_sectors() {
            return Err(Error::OutOfRange);
        }
        if data.len() != run.m.geo.log_sector_size as usize {
            return Err(Error::OutOfRange);
        }
        run.write_logical_sector(log_sector, data)
    }
}

impl<P: NorPhy> Run<'_, P> {
    pub fn write_logical_sector(&mut self, log_sector: u32, data: &[u8]) -> Result<(), Error> {
        let (lbi, brsi) = self.m.geo.split_log_sector(log_sector);
        for attempt in 0..=self.num_write_retries {
            match self.try_write(lbi, brsi, data) {
                Ok(()) => return Ok(()),
                Err(e @ (Error::Write | Error::Read)) => {
                    log::warn!(
                        "write of sector {log_sector} failed (attempt {attempt}): {e:?}"
                    );
                }
                Err(e) => return Err(e),
            }
        }
        // Whatever tripped the last attempt, the sector could not be
        // written; exhaustion latches as a write failure.
        Err(self.fatal(Error::Write, self.m.l2p.get(lbi).unwrap_or(0)))
    }

    fn try_write(&mut self, lbi: u16, brsi: u16, data: &[u8]) -> Result<(), Error> {
        let work_slot = self.m.work.find(lbi);
        let has_work_copy =
            work_slot.is_some_and(|s| self.m.work.get(s).assign[brsi as usize].is_some());
        if !has_work_copy && self.try_direct_append(lbi, brsi, data)? {
            return Ok(());
        }
        self.write_via_work_block(lbi, brsi, data, work_slot)
    }

    /// Fast path: append at the native position of the data block.
    /// `Ok(false)` means the slot is taken and the work-block path has to
    /// absorb the write.
    fn try_direct_append(&mut self, lbi: u16, brsi: u16, data: &[u8]) -> Result<bool, Error> {
        let db_psi = match self.m.l2p.get(lbi) {
            Some(psi) => psi,
            None => self.alloc_data_block(lbi)?,
        };
        let slot = match self.m.data.find(lbi) {
            Some(slot) => {
                self.m.data.touch(slot);
                slot
            }
            None => self.load_data_desc(lbi, db_psi)?,
        };
        if self.m.data.get(slot).is_written(brsi) {
            return Ok(false);
        }
        // The header said blank; make sure no torn payload hides there.
        if !self.payload_blank(db_psi, brsi)? {
            self.m.data.get_mut(slot).set_written(brsi);
            return Ok(false);
        }

        match self.direct_append(db_psi, brsi, data) {
            Ok(()) => {
                self.m.data.get_mut(slot).set_written(brsi);
                Ok(true)
            }
            Err(Error::Write) => {
                // Do not keep poking a failing sector: move the whole
                // block elsewhere, then let the retry run the fast path
                // against the fresh copy.
                self.m.data.get_mut(slot).set_written(brsi);
                self.relocate_data_block(lbi)?;
                Err(Error::Write)
            }
            Err(e) => Err(e),
        }
    }

    fn direct_append(&mut self, psi: u32, brsi: u16, data: &[u8]) -> Result<(), Error> {
        let (crc_data, parity) = lsh::payload_checks(&self.ctx, &self.m.geo, data);
        let mut buf = self.load_lsh_buf(psi, brsi)?;
        let base = self.m.geo.lsh_off(psi, brsi);
        lsh::encode_prep(&self.ctx, &self.m.geo, &mut buf, brsi, crc_data, &parity);
        self.flush_header(base, &mut buf)?;
        self.write_payload(psi, brsi, data)?;
        lsh::encode_commit_valid(&self.ctx, &self.m.geo, &mut buf);
        self.flush_header(base, &mut buf)
    }

    /// Allocates a fresh, still-empty data block for `lbi`.
    fn alloc_data_block(&mut self, lbi: u16) -> Result<u32, Error> {
        let (psi, erase_cnt) = self.alloc_erased_block()?;
        // Keep the count relation to an existing work block intact: the
        // work block must stay exactly one ahead.
        let data_cnt = match self.m.work.find(lbi) {
            Some(slot) => self.m.work.get(slot).data_cnt.wrapping_sub(1),
            None => 0,
        };
        let mut buf = self.load_psh_buf(psi)?;
        psh::encode_alloc(&self.ctx, &self.m.geo, &mut buf, SectorStat::Valid, lbi, data_cnt);
        let base = self.m.geo.psh_off(psi);
        if let Err(e) = self.flush_header(base, &mut buf) {
            let _ = self.mark_sector_invalid(psi);
            return Err(e);
        }
        self.m.l2p.set(lbi, Some(psi));
        self.note_data_block(erase_cnt);
        log::trace!("data block lbi {lbi} allocated at psi {psi}");
        Ok(psi)
    }

    /// Builds the append-cache descriptor for a data block by reading its
    /// slot headers.
    fn load_data_desc(&mut self, lbi: u16, psi: u32) -> Result<SlotId, Error> {
        if !self.m.data.has_free_slot() {
            // Append descriptors carry no unflushed state; the oldest one
            // is simply forgotten.
            if let Some(lru) = self.m.data.lru() {
                self.m.data.release(lru);
            }
        }
        let info = self.read_psh(psi)?;
        let slot = self
            .m
            .data
            .allocate(lbi, psi, info.data_cnt)
            .ok_or(Error::InconsistentData)?;
        for srsi in 0..self.m.geo.ls_per_ps {
            let used = match self.read_lsh(psi, srsi) {
                Ok(l) => l.stat != LsStat::Empty || !l.blank,
                Err(_) => true,
            };
            if used {
                self.m.data.get_mut(slot).set_written(srsi);
            }
        }
        Ok(slot)
    }

    /// Slow path: place the copy in a work block.
    fn write_via_work_block(
        &mut self,
        lbi: u16,
        brsi: u16,
        data: &[u8],
        work_slot: Option<SlotId>,
    ) -> Result<(), Error> {
        let mut slot = match work_slot {
            Some(slot) => slot,
            None => self.alloc_work_block(lbi)?,
        };
        // Prefer the native position so the block can later convert in
        // place; a full work block converts and starts over.
        let srsi = loop {
            let desc = self.m.work.get(slot);
            if !desc.is_written(brsi) {
                break brsi;
            }
            if let Some(free) = desc.first_free_srsi(self.m.geo.ls_per_ps) {
                break free;
            }
            self.convert_work_block(slot)?;
            slot = self.alloc_work_block(lbi)?;
        };
        let work_psi = self.m.work.get(slot).psi;
        let prev_srsi = self.m.work.get(slot).assign[brsi as usize];

        if let Err(e) = self.write_slot(work_psi, srsi, brsi, data) {
            if e == Error::Write {
                // Poison the slot and retire the block so the next try
                // lands on fresh lines.
                let desc = self.m.work.get_mut(slot);
                desc.set_written(srsi);
                let _ = self.mark_lsh_invalid(work_psi, srsi);
                self.convert_work_block(slot)?;
            }
            return Err(e);
        }

        // The new copy supersedes the old one.
        if let Some(old) = prev_srsi {
            self.mark_lsh_invalid(work_psi, old)?;
        } else if self.ctx.has(Features::INVALID_SECTOR_ERROR) {
            if let Some(db_psi) = self.m.l2p.get(lbi) {
                if self.read_lsh(db_psi, brsi)?.stat == LsStat::Valid {
                    self.mark_lsh_invalid(db_psi, brsi)?;
                }
            }
        }

        let desc = self.m.work.get_mut(slot);
        desc.assign[brsi as usize] = Some(srsi);
        desc.set_written(srsi);
        self.m.work.touch(slot);
        Ok(())
    }

    /// Allocates a work block (and a descriptor, evicting the oldest via
    /// conversion if every descriptor is busy).
    pub fn alloc_work_block(&mut self, lbi: u16) -> Result<SlotId, Error> {
        if !self.m.work.has_free_slot() {
            self.evict_lru_work_block()?;
        }
        let (psi, _erase_cnt) = self.alloc_erased_block()?;
        let data_cnt = match self.m.l2p.get(lbi) {
            Some(db_psi) => self.read_psh(db_psi)?.data_cnt.wrapping_add(1),
            None => 1,
        };
        let mut buf = self.load_psh_buf(psi)?;
        psh::encode_alloc(&self.ctx, &self.m.geo, &mut buf, SectorStat::Work, lbi, data_cnt);
        let base = self.m.geo.psh_off(psi);
        if let Err(e) = self.flush_header(base, &mut buf) {
            let _ = self.mark_sector_invalid(psi);
            return Err(e);
        }
        let slot = self
            .m
            .work
            .allocate(lbi, psi, data_cnt)
            .ok_or(Error::OutOfWorkBlocks)?;
        log::trace!("work block lbi {lbi} allocated at psi {psi}");
        Ok(slot)
    }
}
