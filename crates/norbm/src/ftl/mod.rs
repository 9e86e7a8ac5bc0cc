//! The translation-layer engine.
//!
//! [`Instance`] binds one configuration to one physical device. All
//! state built at mount time (free map, logical-to-physical table, block
//! caches, wear counters) lives in [`Mounted`]; the operation modules
//! work through [`Run`], a split borrow of the instance that keeps the
//! device handle usable next to the codec hooks.

mod alloc;
mod clean;
mod convert;
mod mount;
mod read;
mod write;

use ::alloc::vec;
use ::alloc::vec::Vec;

use norbm_phy::NorPhy;

use crate::cache::BlockCache;
use crate::config::{Config, Features, OnFatalError};
use crate::error::{Error, FatalErrorInfo, FatalPolicy};
use crate::freemap::{FreeMap, SectorBitmap};
use crate::geometry::Geometry;
use crate::l2p::L2pTable;
use crate::structures::header::{HeaderBuf, count_trailing_blank};
use crate::structures::psh::PshInfo;
use crate::structures::raw::FatalRecord;
use crate::structures::{Ctx, MAX_ERASE_CNT, lsh, psh};

/// Usage state of one logical sector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SectorUsage {
    /// The sector holds data.
    InUse,
    /// The sector was never written or has been freed.
    NotUsed,
}

/// Device information returned by mount and the info query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiskInfo {
    /// Logical sectors presented to the file system.
    pub num_log_sectors: u32,
    /// Size of one logical sector in bytes.
    pub log_sector_size: u32,
    /// Physical sectors inside the storage window.
    pub num_phy_sectors: u32,
    /// Logical blocks.
    pub num_log_blocks: u32,
    /// Work blocks.
    pub num_work_blocks: u16,
    /// Logical sectors per physical sector.
    pub ls_per_ps: u16,
    /// Highest erase count seen on the medium.
    pub erase_cnt_max: u32,
    /// The instance rejects writes.
    pub is_write_protected: bool,
    /// A fatal error is latched on the medium.
    pub has_fatal_error: bool,
}

/// State that exists while the instance is mounted.
pub(crate) struct Mounted {
    /// Absolute byte offset of the window's first sector.
    base_off: u32,
    geo: Geometry,
    free: FreeMap,
    /// Free sectors that still need an erase before reuse.
    dirty: SectorBitmap,
    l2p: L2pTable,
    work: BlockCache,
    data: BlockCache,
    erase_cnt_max: u32,
    /// Lowest erase count among data blocks; `u32::MAX` forces a rescan.
    erase_cnt_min: u32,
    num_erase_cnt_min: u32,
    /// Allocation scan hint.
    mru_free: u32,
    wl_suspended: bool,
    write_protected: bool,
    fatal: Option<FatalRecord>,
}

/// One block-mapped NOR unit.
pub struct Instance<P: NorPhy> {
    phy: P,
    cfg: Config,
    mnt: Option<Mounted>,
}

impl<P: NorPhy> Instance<P> {
    /// Binds a device to a configuration. Nothing touches the medium
    /// until [`Self::format`] or [`Self::mount`].
    pub fn new(phy: P, cfg: Config) -> Self {
        Self {
            phy,
            cfg,
            mnt: None,
        }
    }

    pub fn is_mounted(&self) -> bool {
        self.mnt.is_some()
    }

    /// Direct access to the device, e.g. for fault injection in tests.
    pub fn phy_mut(&mut self) -> &mut P {
        &mut self.phy
    }

    /// Releases the device.
    pub fn into_phy(self) -> P {
        self.phy
    }

    /// Drops all RAM state; the medium is left as is.
    pub fn unmount(&mut self) {
        self.mnt = None;
    }

    pub fn disk_info(&self) -> Result<DiskInfo, Error> {
        let m = self.mnt.as_ref().ok_or(Error::NotMounted)?;
        Ok(DiskInfo {
            num_log_sectors: m.geo.num_log_sectors(),
            log_sector_size: m.geo.log_sector_size,
            num_phy_sectors: m.geo.num_phy_sectors,
            num_log_blocks: m.geo.num_log_blocks,
            num_work_blocks: m.geo.num_work_blocks,
            ls_per_ps: m.geo.ls_per_ps,
            erase_cnt_max: m.erase_cnt_max,
            is_write_protected: m.write_protected,
            has_fatal_error: m.fatal.is_some_and(|f| f.has_fatal_error),
        })
    }

    /// Suspends or resumes wear leveling. While suspended, allocation
    /// only takes already-blank sectors and performs no erase; the
    /// suspension lifts itself when that runs dry.
    pub fn set_wear_leveling_suspended(&mut self, suspended: bool) -> Result<(), Error> {
        let m = self.mnt.as_mut().ok_or(Error::NotMounted)?;
        m.wl_suspended = suspended;
        Ok(())
    }

    /// Splits the instance into a [`Run`] for the operation modules.
    pub(crate) fn run(&mut self) -> Result<Run<'_, P>, Error> {
        let m = self.mnt.as_mut().ok_or(Error::NotMounted)?;
        let cfg = &mut self.cfg;
        Ok(Run {
            phy: &mut self.phy,
            ctx: Ctx {
                order: cfg.byte_order,
                features: cfg.features,
                crc: &*cfg.crc,
                ecc: &*cfg.ecc,
            },
            fatal_cb: &mut cfg.on_fatal_error,
            max_erase_cnt_diff: cfg.max_erase_cnt_diff,
            num_read_retries: cfg.num_read_retries,
            num_write_retries: cfg.num_write_retries,
            num_erase_retries: cfg.num_erase_retries,
            fill_pattern: cfg.fill_pattern,
            m,
        })
    }
}

/// Split borrow of a mounted instance.
pub(crate) struct Run<'a, P: NorPhy> {
    pub phy: &'a mut P,
    pub ctx: Ctx<'a>,
    fatal_cb: &'a mut Option<OnFatalError>,
    pub max_erase_cnt_diff: u32,
    pub num_read_retries: u8,
    pub num_write_retries: u8,
    pub num_erase_retries: u8,
    pub fill_pattern: u8,
    pub m: &'a mut Mounted,
}

impl<P: NorPhy> Run<'_, P> {
    fn has(&self, f: Features) -> bool {
        self.ctx.features.contains(f)
    }

    pub fn read_bytes(&mut self, off: u32, buf: &mut [u8]) -> Result<(), Error> {
        self.phy
            .read_off(self.m.base_off + off, buf)
            .map_err(Error::from_read)
    }

    fn read_vec(&mut self, off: u32, len: usize) -> Result<Vec<u8>, Error> {
        let mut buf = vec![0u8; len];
        self.read_bytes(off, &mut buf)?;
        Ok(buf)
    }

    /// Writes the dirty lines of a header buffer, lowest line first, one
    /// line per device write, and verifies them if configured. `base` is
    /// window-relative.
    pub fn flush_header(&mut self, base: u32, buf: &mut HeaderBuf) -> Result<(), Error> {
        let line = self.m.geo.line_size;
        let Some((start, end)) = buf.take_dirty(line) else {
            return Ok(());
        };
        let mut off = start;
        while off < end {
            let chunk = &buf.bytes()[off..(off + line).min(end)];
            self.phy
                .write_off(self.m.base_off + base + off as u32, chunk)
                .map_err(Error::from_write)?;
            off += line;
        }
        if self.has(Features::WRITE_VERIFICATION) {
            let back = self.read_vec(base + start as u32, end - start)?;
            if back != buf.bytes()[start..end] {
                return Err(Error::Write);
            }
        }
        Ok(())
    }

    /// Reads and parses the PSH of `psi`. Device errors are retried;
    /// integrity errors are the caller's to classify.
    pub fn read_psh(&mut self, psi: u32) -> Result<PshInfo, Error> {
        let bytes = self.read_header_retry(self.m.geo.psh_off(psi), self.m.geo.psh.len)?;
        psh::decode(&self.ctx, &self.m.geo, &bytes)
    }

    /// Loads the PSH bytes of `psi` into a mutable header buffer.
    pub fn load_psh_buf(&mut self, psi: u32) -> Result<HeaderBuf, Error> {
        let bytes = self.read_header_retry(self.m.geo.psh_off(psi), self.m.geo.psh.len)?;
        Ok(HeaderBuf::from_bytes(bytes))
    }

    pub fn read_lsh(&mut self, psi: u32, srsi: u16) -> Result<lsh::LshInfo, Error> {
        let bytes = self.read_header_retry(self.m.geo.lsh_off(psi, srsi), self.m.geo.lsh.len)?;
        lsh::decode(&self.ctx, &self.m.geo, &bytes)
    }

    pub fn load_lsh_buf(&mut self, psi: u32, srsi: u16) -> Result<HeaderBuf, Error> {
        let bytes = self.read_header_retry(self.m.geo.lsh_off(psi, srsi), self.m.geo.lsh.len)?;
        Ok(HeaderBuf::from_bytes(bytes))
    }

    fn read_header_retry(&mut self, off: u32, len: usize) -> Result<Vec<u8>, Error> {
        let mut last = Error::Read;
        for _ in 0..=self.num_read_retries {
            match self.read_vec(off, len) {
                Ok(bytes) => return Ok(bytes),
                Err(e) => last = e,
            }
        }
        Err(last)
    }

    /// Whether the payload area of a slot is still blank. Probed from the
    /// tail so a torn payload write is caught too.
    pub fn payload_blank(&mut self, psi: u32, srsi: u16) -> Result<bool, Error> {
        let len = self.m.geo.log_sector_size as usize;
        let bytes = self.read_vec(self.m.geo.payload_off(psi, srsi), len)?;
        Ok(count_trailing_blank(&bytes) == len)
    }

    /// Writes a payload slot and verifies it if configured.
    pub fn write_payload(&mut self, psi: u32, srsi: u16, data: &[u8]) -> Result<(), Error> {
        let off = self.m.geo.payload_off(psi, srsi);
        self.phy
            .write_off(self.m.base_off + off, data)
            .map_err(Error::from_write)?;
        if self.has(Features::WRITE_VERIFICATION) {
            let back = self.read_vec(off, data.len())?;
            if back != data {
                return Err(Error::Write);
            }
        }
        Ok(())
    }

    /// Writes one logical sector copy: payload first, then the header in
    /// one flush, so the slot only becomes visible once the payload is on
    /// the medium.
    pub fn write_slot(
        &mut self,
        psi: u32,
        srsi: u16,
        brsi: u16,
        payload: &[u8],
    ) -> Result<(), Error> {
        self.write_payload(psi, srsi, payload)?;
        let (crc_data, parity) = lsh::payload_checks(&self.ctx, &self.m.geo, payload);
        let mut buf = self.load_lsh_buf(psi, srsi)?;
        lsh::encode_valid(&self.ctx, &self.m.geo, &mut buf, brsi, crc_data, &parity);
        let base = self.m.geo.lsh_off(psi, srsi);
        self.flush_header(base, &mut buf)
    }

    /// Marks a physical sector invalid (pre-erased): it is free again but
    /// needs an erase before reuse.
    pub fn mark_sector_invalid(&mut self, psi: u32) -> Result<(), Error> {
        let mut buf = self.load_psh_buf(psi)?;
        psh::encode_invalid(&self.ctx, &self.m.geo, &mut buf);
        let base = self.m.geo.psh_off(psi);
        self.flush_header(base, &mut buf)?;
        self.m.free.mark_free(psi);
        self.m.dirty.set(psi);
        log::trace!("psi {psi} marked invalid");
        Ok(())
    }

    /// Marks a superseded logical sector copy invalid.
    pub fn mark_lsh_invalid(&mut self, psi: u32, srsi: u16) -> Result<(), Error> {
        let mut buf = self.load_lsh_buf(psi, srsi)?;
        lsh::encode_invalid(&self.ctx, &self.m.geo, &mut buf);
        let base = self.m.geo.lsh_off(psi, srsi);
        self.flush_header(base, &mut buf)
    }

    /// Substitutes out-of-range erase counts; the substitution lives in
    /// RAM only.
    pub fn clamp_erase_cnt(&self, raw: Option<u32>) -> u32 {
        match raw {
            Some(c) if c <= MAX_ERASE_CNT => c,
            _ => self.m.erase_cnt_max,
        }
    }

    /// Records a freshly stamped erase count.
    pub fn note_erase_cnt(&mut self, cnt: u32) {
        if cnt > self.m.erase_cnt_max && cnt <= MAX_ERASE_CNT {
            self.m.erase_cnt_max = cnt;
        }
    }

    /// Tracks a sector becoming a data block.
    pub fn note_data_block(&mut self, erase_cnt: u32) {
        if erase_cnt < self.m.erase_cnt_min {
            self.m.erase_cnt_min = erase_cnt;
            self.m.num_erase_cnt_min = 1;
        } else if erase_cnt == self.m.erase_cnt_min {
            self.m.num_erase_cnt_min += 1;
        }
    }

    /// Tracks a data block going away.
    pub fn forget_data_block(&mut self, erase_cnt: u32) {
        if erase_cnt == self.m.erase_cnt_min {
            self.m.num_erase_cnt_min = self.m.num_erase_cnt_min.saturating_sub(1);
            if self.m.num_erase_cnt_min == 0 {
                // Rescanned on the next wear-leveling decision.
                self.m.erase_cnt_min = u32::MAX;
            }
        }
    }

    /// Reports an unrecoverable error. If the callback asks for it, the
    /// fatal record is latched on the medium and the instance becomes
    /// permanently write protected.
    ///
    /// Read-side failures (device reads, CRC, ECC on user payload) are
    /// the exception: they are reported to the callback and the caller
    /// but never latch fatal state or write protection. The data may
    /// still be recoverable externally and the medium stays writable.
    pub fn fatal(&mut self, error: Error, psi: u32) -> Error {
        log::error!("unrecoverable {error:?} on psi {psi}");
        let info = FatalErrorInfo { error, psi };
        let policy = match self.fatal_cb.as_mut() {
            Some(cb) => cb(&info),
            None => FatalPolicy::Continue,
        };
        if matches!(error, Error::Read | Error::Crc | Error::Ecc) {
            return error;
        }
        let record = FatalRecord {
            is_write_protected: policy == FatalPolicy::WriteProtect,
            has_fatal_error: true,
            error,
            error_psi: psi,
        };
        self.m.fatal = Some(record);
        if policy == FatalPolicy::WriteProtect {
            self.m.write_protected = true;
            // Best effort: the error stands even if the latch write fails.
            if let Err(e) = self.write_fatal_record(&record) {
                log::warn!("could not latch fatal record: {e:?}");
            }
        }
        error
    }

    fn write_fatal_record(&mut self, record: &FatalRecord) -> Result<(), Error> {
        let off = self.m.geo.log_sector_size;
        let raw = record.encode(&self.ctx);
        let existing = self.read_vec(off, raw.as_bytes().len())?;
        if !crate::structures::header::is_blank(&existing) {
            // Written once; the first latch wins.
            return Ok(());
        }
        self.phy
            .write_off(self.m.base_off + off, raw.as_bytes())
            .map_err(Error::from_write)
    }
}
