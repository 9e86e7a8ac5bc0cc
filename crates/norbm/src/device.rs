//! Driver-level facade.
//!
//! [`NorDevice`] wraps an [`Instance`] behind the surface a filesystem
//! driver expects: multi-sector read/write with mount-on-first-use, plus
//! one method per maintenance command.

use norbm_phy::NorPhy;

use crate::config::Config;
use crate::error::Error;
use crate::ftl::{DiskInfo, Instance, SectorUsage};

/// Presence state reported to the filesystem layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceStatus {
    pub present: bool,
}

/// A block-mapped NOR unit with driver semantics.
pub struct NorDevice<P: NorPhy> {
    inst: Instance<P>,
}

impl<P: NorPhy> NorDevice<P> {
    pub fn new(phy: P, cfg: Config) -> Self {
        Self {
            inst: Instance::new(phy, cfg),
        }
    }

    /// Driver name.
    pub fn name(&self) -> &'static str {
        "nor-bm"
    }

    /// NOR parts do not come and go.
    pub fn status(&self) -> DeviceStatus {
        DeviceStatus { present: true }
    }

    /// The wrapped instance, for operations the facade does not cover.
    pub fn instance_mut(&mut self) -> &mut Instance<P> {
        &mut self.inst
    }

    fn ensure_mounted(&mut self) -> Result<(), Error> {
        if !self.inst.is_mounted() {
            self.inst.mount()?;
        }
        Ok(())
    }

    /// Geometry and state of the unit, mounting if necessary.
    pub fn dev_info(&mut self) -> Result<DiskInfo, Error> {
        self.ensure_mounted()?;
        self.inst.disk_info()
    }

    pub fn requires_format(&mut self) -> Result<bool, Error> {
        self.inst.requires_format()
    }

    pub fn format_low_level(&mut self) -> Result<(), Error> {
        self.inst.format()
    }

    /// Reads `count` logical sectors starting at `log_sector`.
    pub fn read(&mut self, log_sector: u32, buf: &mut [u8], count: u32) -> Result<(), Error> {
        self.ensure_mounted()?;
        let sector_size = self.inst.disk_info()?.log_sector_size as usize;
        if buf.len() != sector_size * count as usize {
            return Err(Error::OutOfRange);
        }
        for i in 0..count {
            let chunk = &mut buf[i as usize * sector_size..][..sector_size];
            self.inst.read_sector(log_sector + i, chunk)?;
        }
        Ok(())
    }

    /// Writes `count` logical sectors starting at `log_sector`. With
    /// `repeat_same`, `buf` holds one sector written `count` times.
    pub fn write(
        &mut self,
        log_sector: u32,
        buf: &[u8],
        count: u32,
        repeat_same: bool,
    ) -> Result<(), Error> {
        self.ensure_mounted()?;
        let sector_size = self.inst.disk_info()?.log_sector_size as usize;
        let expected = if repeat_same {
            sector_size
        } else {
            sector_size * count as usize
        };
        if buf.len() != expected {
            return Err(Error::OutOfRange);
        }
        for i in 0..count {
            let chunk = if repeat_same {
                buf
            } else {
                &buf[i as usize * sector_size..][..sector_size]
            };
            self.inst.write_sector(log_sector + i, chunk)?;
        }
        Ok(())
    }

    /// Unmounts after consolidating: every convertible work block is
    /// merged so the next mount starts from plain data blocks. A
    /// write-protected unit is left untouched.
    pub fn unmount(&mut self) -> Result<(), Error> {
        if self.inst.is_mounted() {
            if !self.inst.disk_info()?.is_write_protected {
                while self.inst.clean_one()? {}
            }
            self.inst.unmount();
        }
        Ok(())
    }

    /// Unmounts without touching the medium.
    pub fn unmount_forced(&mut self) {
        self.inst.unmount();
    }

    pub fn clean_one(&mut self) -> Result<bool, Error> {
        self.ensure_mounted()?;
        self.inst.clean_one()
    }

    pub fn clean(&mut self) -> Result<(), Error> {
        self.ensure_mounted()?;
        self.inst.clean()
    }

    pub fn clean_cnt(&mut self) -> Result<u32, Error> {
        self.ensure_mounted()?;
        self.inst.clean_cnt()
    }

    pub fn sector_usage(&mut self, log_sector: u32) -> Result<SectorUsage, Error> {
        self.ensure_mounted()?;
        self.inst.sector_usage(log_sector)
    }

    pub fn free_sectors(&mut self, first: u32, count: u32) -> Result<(), Error> {
        self.ensure_mounted()?;
        self.inst.free_sectors(first, count)
    }

    /// Tears the unit down, handing the device back.
    pub fn deinit(self) -> P {
        self.inst.into_phy()
    }
}
