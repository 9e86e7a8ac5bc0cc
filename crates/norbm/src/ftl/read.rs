//! Sector read path.
//!
//! A work-block copy supersedes the data-block copy; a sector with
//! neither returns the fill pattern (or an error, when the instance is
//! configured to flag reads of freed sectors).

use norbm_phy::NorPhy;

use crate::config::Features;
use crate::error::Error;
use crate::ftl::{Instance, Run, SectorUsage};
use crate::structures::{LsStat, lsh};

impl<P: NorPhy> Instance<P> {
    /// Reads one logical sector into `buf`.
    pub fn read_sector(&mut self, log_sector: u32, buf: &mut [u8]) -> Result<(), Error> {
        let mut run = self.run()?;
        if log_sector >= run.m.geo.num_log_sectors() {
            return Err(Error::OutOfRange);
        }
        if buf.len() != run.m.geo.log_sector_size as usize {
            return Err(Error::OutOfRange);
        }
        run.read_logical_sector(log_sector, buf)
    }

    /// Whether a logical sector currently holds data.
    pub fn sector_usage(&mut self, log_sector: u32) -> Result<SectorUsage, Error> {
        let mut run = self.run()?;
        if log_sector >= run.m.geo.num_log_sectors() {
            return Err(Error::OutOfRange);
        }
        run.sector_usage(log_sector)
    }
}

impl<P: NorPhy> Run<'_, P> {
    /// The physical location currently holding the sector, work block
    /// first.
    fn locate(&self, lbi: u16, brsi: u16) -> Option<(u32, u16)> {
        if let Some(slot) = self.m.work.find(lbi) {
            let desc = self.m.work.get(slot);
            if let Some(srsi) = desc.assign[brsi as usize] {
                return Some((desc.psi, srsi));
            }
        }
        self.m.l2p.get(lbi).map(|psi| (psi, brsi))
    }

    pub fn read_logical_sector(&mut self, log_sector: u32, buf: &mut [u8]) -> Result<(), Error> {
        let (lbi, brsi) = self.m.geo.split_log_sector(log_sector);
        let Some((psi, srsi)) = self.locate(lbi, brsi) else {
            return self.read_unwritten(buf);
        };

        let mut last = Error::Read;
        for attempt in 0..=self.num_read_retries {
            let info = match self.read_lsh(psi, srsi) {
                Ok(info) => info,
                Err(e) => {
                    log::warn!("lsh ({psi},{srsi}) read failed (attempt {attempt}): {e:?}");
                    last = e;
                    continue;
                }
            };
            if info.stat != LsStat::Valid {
                return self.read_unwritten(buf);
            }
            if let Err(e) = self.read_bytes(self.m.geo.payload_off(psi, srsi), buf) {
                last = e;
                continue;
            }
            match lsh::verify_payload(&self.ctx, &self.m.geo, &info, buf) {
                Ok(corrected) => {
                    if corrected > 0 {
                        log::debug!("corrected {corrected} bit(s) reading sector {log_sector}");
                    }
                    return Ok(());
                }
                Err(e) => {
                    log::warn!(
                        "payload of sector {log_sector} failed check (attempt {attempt}): {e:?}"
                    );
                    last = e;
                }
            }
        }
        Err(self.fatal(last, psi))
    }

    fn read_unwritten(&mut self, buf: &mut [u8]) -> Result<(), Error> {
        buf.fill(self.fill_pattern);
        if self.ctx.has(Features::INVALID_SECTOR_ERROR) {
            return Err(Error::Read);
        }
        Ok(())
    }

    pub fn sector_usage(&mut self, log_sector: u32) -> Result<SectorUsage, Error> {
        let (lbi, brsi) = self.m.geo.split_log_sector(log_sector);
        let Some((psi, srsi)) = self.locate(lbi, brsi) else {
            return Ok(SectorUsage::NotUsed);
        };
        match self.read_lsh(psi, srsi) {
            Ok(info) if info.stat == LsStat::Valid => Ok(SectorUsage::InUse),
            Ok(_) => Ok(SectorUsage::NotUsed),
            Err(Error::Read) => Err(Error::Read),
            Err(_) => Ok(SectorUsage::NotUsed),
        }
    }
}
