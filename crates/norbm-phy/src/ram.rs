//! In-RAM NOR simulator.

use alloc::vec;
use alloc::vec::Vec;

use crate::{NorPhy, PhyError, SectorInfo};

/// Scripted fault for power-loss testing.
///
/// The plan counts `write_off` calls; the armed call applies only a prefix
/// of the buffer (a torn line) and then fails. Every later write and erase
/// fails too, freezing the image exactly as a power cut would leave it.
#[derive(Debug, Clone, Copy)]
pub struct FaultPlan {
    /// 1-based index of the write that tears.
    pub fail_on_write: u32,
    /// Bytes of the torn write that still reach the medium.
    pub torn_bytes: usize,
}

/// RAM-backed NOR flash with uniform sector size.
///
/// Writes AND the buffer into the image, erases restore 0xFF, and a
/// [`FaultPlan`] can cut the power mid-write. The image survives the fault:
/// tests drop the instance under test, clear the fault and mount again on
/// the same medium.
#[derive(Debug, Clone)]
pub struct RamNor {
    data: Vec<u8>,
    sector_size: u32,
    num_sectors: u32,
    erase_cnts: Vec<u32>,
    writes_seen: u32,
    fault: Option<FaultPlan>,
    dead: bool,
}

impl RamNor {
    /// Creates a blank (all-0xFF) medium.
    ///
    /// # Panics
    /// Panics if `sector_size` is not a power of two or either argument is
    /// zero.
    pub fn new(num_sectors: u32, sector_size: u32) -> Self {
        assert!(num_sectors > 0 && sector_size > 0);
        assert!(sector_size.is_power_of_two());
        Self {
            data: vec![0xFF; (num_sectors * sector_size) as usize],
            sector_size,
            num_sectors,
            erase_cnts: vec![0; num_sectors as usize],
            writes_seen: 0,
            fault: None,
            dead: false,
        }
    }

    /// Arms a torn-write fault.
    pub fn arm_fault(&mut self, plan: FaultPlan) {
        self.writes_seen = 0;
        self.fault = Some(plan);
        self.dead = false;
    }

    /// Clears a previously armed (or tripped) fault, "restoring power".
    pub fn clear_fault(&mut self) {
        self.fault = None;
        self.dead = false;
    }

    /// Number of `write_off` calls since the last fault arm.
    pub fn writes_seen(&self) -> u32 {
        self.writes_seen
    }

    /// Physical erase count of one sector (simulator bookkeeping, not the
    /// on-flash counter).
    pub fn phys_erase_cnt(&self, index: u32) -> u32 {
        self.erase_cnts[index as usize]
    }

    /// Raw image contents, for seeding mount-scan tests.
    pub fn image_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Raw image contents.
    pub fn image(&self) -> &[u8] {
        &self.data
    }

    fn check_range(&self, off: u32, len: usize) -> Result<(), PhyError> {
        if off as usize + len > self.data.len() {
            return Err(PhyError::OutOfBounds);
        }
        Ok(())
    }
}

impl NorPhy for RamNor {
    fn init(&mut self) -> Result<(), PhyError> {
        Ok(())
    }

    fn num_sectors(&self) -> u32 {
        self.num_sectors
    }

    fn sector_info(&self, index: u32) -> SectorInfo {
        SectorInfo {
            offset: index * self.sector_size,
            size: self.sector_size,
        }
    }

    fn read_off(&mut self, off: u32, buf: &mut [u8]) -> Result<(), PhyError> {
        self.check_range(off, buf.len())?;
        let off = off as usize;
        buf.copy_from_slice(&self.data[off..off + buf.len()]);
        Ok(())
    }

    fn write_off(&mut self, off: u32, buf: &[u8]) -> Result<(), PhyError> {
        self.check_range(off, buf.len())?;
        if self.dead {
            return Err(PhyError::Device);
        }
        self.writes_seen += 1;
        let mut len = buf.len();
        let mut fail = false;
        if let Some(plan) = self.fault {
            if self.writes_seen == plan.fail_on_write {
                len = plan.torn_bytes.min(len);
                fail = true;
                self.dead = true;
            }
        }
        let off = off as usize;
        for (dst, src) in self.data[off..off + len].iter_mut().zip(buf) {
            *dst &= *src;
        }
        if fail { Err(PhyError::Device) } else { Ok(()) }
    }

    fn erase_sector(&mut self, index: u32) -> Result<(), PhyError> {
        if index >= self.num_sectors {
            return Err(PhyError::OutOfBounds);
        }
        if self.dead {
            return Err(PhyError::Device);
        }
        let info = self.sector_info(index);
        let off = info.offset as usize;
        self.data[off..off + info.size as usize].fill(0xFF);
        self.erase_cnts[index as usize] += 1;
        Ok(())
    }

    fn is_sector_blank(&self, index: u32) -> Option<bool> {
        let info = self.sector_info(index);
        let off = info.offset as usize;
        Some(
            self.data[off..off + info.size as usize]
                .iter()
                .all(|&b| b == 0xFF),
        )
    }
}
