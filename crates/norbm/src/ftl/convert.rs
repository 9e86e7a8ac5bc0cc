//! Work-block conversion and data-block movement.
//!
//! A work block retires either in place (its sectors already sit at their
//! native positions, so flipping the PSH stat is enough) or via copy
//! (fresh sector, merge of work block and source data block). Both end
//! with exactly one committing line write; at any intermediate point the
//! strictly-newer data count wins duplicate resolution at mount.

use ::alloc::vec::Vec;

use norbm_phy::NorPhy;

use crate::cache::{BlockDesc, SlotId};
use crate::error::Error;
use crate::ftl::Run;
use crate::structures::psh::PshInfo;
use crate::structures::{LsStat, SectorStat, lsh, psh};

impl<P: NorPhy> Run<'_, P> {
    /// Reads one logical sector copy for merging, verifying and
    /// correcting it. `None` when the slot holds no valid copy or is too
    /// damaged to rescue.
    fn read_copy(&mut self, psi: u32, srsi: u16) -> Result<Option<Vec<u8>>, Error> {
        let info = match self.read_lsh(psi, srsi) {
            Ok(info) => info,
            Err(Error::Read) => return Err(Error::Read),
            Err(e) => {
                log::error!("lsh ({psi},{srsi}) unreadable while merging: {e:?}");
                return Ok(None);
            }
        };
        if info.stat != LsStat::Valid {
            return Ok(None);
        }
        let mut payload = ::alloc::vec![0u8; self.m.geo.log_sector_size as usize];
        for _ in 0..=self.num_read_retries {
            self.read_bytes(self.m.geo.payload_off(psi, srsi), &mut payload)?;
            match lsh::verify_payload(&self.ctx, &self.m.geo, &info, &mut payload) {
                Ok(_) => return Ok(Some(payload)),
                Err(e) => log::warn!("payload ({psi},{srsi}) failed check: {e:?}"),
            }
        }
        log::error!("payload ({psi},{srsi}) lost while merging");
        Ok(None)
    }

    /// Writes one merged copy at its native position.
    fn write_copy(&mut self, psi: u32, brsi: u16, payload: &[u8]) -> Result<(), Error> {
        self.write_slot(psi, brsi, brsi, payload)
    }

    pub fn release_data_desc(&mut self, lbi: u16) {
        if let Some(id) = self.m.data.find(lbi) {
            self.m.data.release(id);
        }
    }

    /// Whether the work block can become the data block by a stat flip
    /// alone.
    pub fn in_place_allowed(
        &mut self,
        desc: &BlockDesc,
        src: Option<(u32, &PshInfo)>,
    ) -> bool {
        // On rewrite media with checking enabled the stat flip would need
        // a CRC slot the header no longer has.
        if self.m.geo.psh.sections.is_none() && self.ctx.checking() {
            return false;
        }
        for brsi in 0..self.m.geo.ls_per_ps {
            match desc.assign[brsi as usize] {
                Some(s) if s == brsi => {}
                Some(_) => return false,
                // Without a copy of brsi, the native slot must still be
                // blank so the source copy can land there.
                None if desc.is_written(brsi) => return false,
                None => {}
            }
        }
        // The source must still be the block this work block was stacked
        // on; active wear leveling may have moved (and recounted) it.
        match src {
            Some((_, info)) => info.data_cnt.wrapping_add(1) == desc.data_cnt,
            None => true,
        }
    }

    /// Converts the work block in `slot` to a data block, choosing the
    /// cheapest safe way.
    pub fn convert_work_block(&mut self, slot: SlotId) -> Result<(), Error> {
        let desc = self.m.work.get(slot).clone();
        let src_psi = self.m.l2p.get(desc.lbi);
        let src_info = match src_psi {
            Some(psi) => Some((psi, self.read_psh(psi)?)),
            None => None,
        };
        let src = src_info.as_ref().map(|(psi, info)| (*psi, info));
        if self.in_place_allowed(&desc, src) {
            self.convert_in_place(slot, &desc, src)
        } else {
            self.convert_via_copy(slot, &desc)
        }
    }

    /// Conversion that never trusts in-place state; mount repair uses it
    /// on work blocks whose slot headers contradicted each other.
    pub(crate) fn convert_work_block_via_copy(&mut self, slot: SlotId) -> Result<(), Error> {
        let desc = self.m.work.get(slot).clone();
        self.convert_via_copy(slot, &desc)
    }

    fn convert_in_place(
        &mut self,
        slot: SlotId,
        desc: &BlockDesc,
        src: Option<(u32, &PshInfo)>,
    ) -> Result<(), Error> {
        log::debug!("converting work block lbi {} in place (psi {})", desc.lbi, desc.psi);
        for brsi in 0..self.m.geo.ls_per_ps {
            if desc.assign[brsi as usize].is_some() {
                continue;
            }
            let Some((src_psi, _)) = src else { continue };
            if let Some(payload) = self.read_copy(src_psi, brsi)? {
                self.write_copy(desc.psi, brsi, &payload)?;
            }
        }
        let work_info = self.read_psh(desc.psi)?;
        let mut buf = self.load_psh_buf(desc.psi)?;
        psh::encode_work_to_valid(&self.ctx, &self.m.geo, &mut buf, desc.lbi, desc.data_cnt);
        let base = self.m.geo.psh_off(desc.psi);
        self.flush_header(base, &mut buf)?;

        self.finish_conversion(desc, desc.psi, self.clamp_erase_cnt(work_info.erase_cnt), src)?;
        self.m.work.release(slot);
        Ok(())
    }

    fn convert_via_copy(&mut self, slot: SlotId, desc: &BlockDesc) -> Result<(), Error> {
        let (dst, dst_cnt) = self.alloc_erased_block()?;
        // The source is resolved only now: the allocation itself may have
        // wear-leveled the old data block to a different sector.
        let src_info = match self.m.l2p.get(desc.lbi) {
            Some(psi) => Some((psi, self.read_psh(psi)?)),
            None => None,
        };
        let src = src_info.as_ref().map(|(psi, info)| (*psi, info));
        log::debug!(
            "converting work block lbi {} via copy (psi {} -> {dst})",
            desc.lbi,
            desc.psi
        );
        // Strictly newer than the source, so a cut between the commit and
        // the invalidation of the old block still resolves at mount.
        let new_cnt = match src {
            Some((_, info)) => info.data_cnt.wrapping_add(1),
            None => desc.data_cnt,
        };
        let mut buf = self.load_psh_buf(dst)?;
        psh::encode_prep_valid(&self.ctx, &self.m.geo, &mut buf, desc.lbi, new_cnt);
        let base = self.m.geo.psh_off(dst);
        self.flush_header(base, &mut buf)?;

        for brsi in 0..self.m.geo.ls_per_ps {
            let payload = match desc.assign[brsi as usize] {
                Some(srsi) => self.read_copy(desc.psi, srsi)?,
                None => match src {
                    Some((src_psi, _)) => self.read_copy(src_psi, brsi)?,
                    None => None,
                },
            };
            if let Some(payload) = payload {
                self.write_copy(dst, brsi, &payload)?;
            }
        }

        psh::encode_commit_valid(&self.ctx, &self.m.geo, &mut buf);
        self.flush_header(base, &mut buf)?;

        self.mark_sector_invalid(desc.psi)?;
        self.finish_conversion(desc, dst, dst_cnt, src)?;
        self.m.work.release(slot);
        Ok(())
    }

    /// Common tail: point the map at the fresh data block and retire the
    /// old one.
    fn finish_conversion(
        &mut self,
        desc: &BlockDesc,
        new_psi: u32,
        new_erase_cnt: u32,
        src: Option<(u32, &PshInfo)>,
    ) -> Result<(), Error> {
        self.m.l2p.set(desc.lbi, Some(new_psi));
        self.note_data_block(new_erase_cnt);
        self.release_data_desc(desc.lbi);
        if let Some((src_psi, src_info)) = src {
            self.forget_data_block(self.clamp_erase_cnt(src_info.erase_cnt));
            self.mark_sector_invalid(src_psi)?;
        }
        Ok(())
    }

    /// Moves a data block into an already-erased destination sector,
    /// bumping its data count. Used by active wear leveling and by
    /// relocation after a write error.
    pub fn move_data_block(
        &mut self,
        src_psi: u32,
        src_info: &PshInfo,
        dst_psi: u32,
        dst_erase_cnt: u32,
    ) -> Result<(), Error> {
        debug_assert_eq!(src_info.stat, SectorStat::Valid);
        let new_cnt = src_info.data_cnt.wrapping_add(1);
        let mut buf = self.load_psh_buf(dst_psi)?;
        psh::encode_prep_valid(&self.ctx, &self.m.geo, &mut buf, src_info.lbi, new_cnt);
        let base = self.m.geo.psh_off(dst_psi);
        self.flush_header(base, &mut buf)?;

        for brsi in 0..self.m.geo.ls_per_ps {
            if let Some(payload) = self.read_copy(src_psi, brsi)? {
                self.write_copy(dst_psi, brsi, &payload)?;
            }
        }

        psh::encode_commit_valid(&self.ctx, &self.m.geo, &mut buf);
        self.flush_header(base, &mut buf)?;

        self.m.l2p.set(src_info.lbi, Some(dst_psi));
        self.note_data_block(dst_erase_cnt);
        self.forget_data_block(self.clamp_erase_cnt(src_info.erase_cnt));
        self.release_data_desc(src_info.lbi);
        self.mark_sector_invalid(src_psi)?;
        Ok(())
    }

    /// Relocates the data block of `lbi` away from a failing sector.
    pub fn relocate_data_block(&mut self, lbi: u16) -> Result<(), Error> {
        let (dst, dst_cnt) = self.alloc_erased_block()?;
        // Looked up after the allocation; wear leveling may just have
        // moved the block on its own.
        let Some(src_psi) = self.m.l2p.get(lbi) else {
            return Err(Error::InconsistentData);
        };
        let src_info = self.read_psh(src_psi)?;
        log::debug!("relocating data block lbi {lbi} from psi {src_psi} to {dst}");
        self.move_data_block(src_psi, &src_info, dst, dst_cnt)
    }

    /// Evicts the least recently used work block, freeing a descriptor.
    pub fn evict_lru_work_block(&mut self) -> Result<(), Error> {
        let Some(slot) = self.m.work.lru() else {
            return Err(Error::OutOfWorkBlocks);
        };
        self.convert_work_block(slot)
    }
}
