//! File-backed NOR image.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use crate::{NorPhy, PhyError, SectorInfo};

impl From<std::io::Error> for PhyError {
    fn from(_: std::io::Error) -> Self {
        PhyError::Io
    }
}

/// A NOR image stored in a file, used by the CLI.
///
/// Writes go through a read-modify-write cycle so the bit-clearing
/// semantics of the medium hold for the image too; a freshly created image
/// is all 0xFF, like a blank part.
#[derive(Debug)]
pub struct FileNor {
    file: File,
    sector_size: u32,
    num_sectors: u32,
}

impl FileNor {
    /// Opens an existing image.
    pub fn open<P: AsRef<Path>>(
        path: P,
        sector_size: u32,
    ) -> Result<Self, PhyError> {
        assert!(sector_size.is_power_of_two());
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let len = file.metadata()?.len();
        if len % sector_size as u64 != 0 || len == 0 {
            return Err(PhyError::OutOfBounds);
        }
        Ok(Self {
            file,
            sector_size,
            num_sectors: (len / sector_size as u64) as u32,
        })
    }

    /// Creates a blank image of `num_sectors` sectors, truncating any
    /// existing file.
    pub fn create<P: AsRef<Path>>(
        path: P,
        num_sectors: u32,
        sector_size: u32,
    ) -> Result<Self, PhyError> {
        assert!(sector_size.is_power_of_two());
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        let blank = vec![0xFFu8; sector_size as usize];
        for _ in 0..num_sectors {
            file.write_all(&blank)?;
        }
        file.flush()?;
        Ok(Self {
            file,
            sector_size,
            num_sectors,
        })
    }

    fn check_range(&self, off: u32, len: usize) -> Result<(), PhyError> {
        let total = self.num_sectors as u64 * self.sector_size as u64;
        if off as u64 + len as u64 > total {
            return Err(PhyError::OutOfBounds);
        }
        Ok(())
    }
}

impl NorPhy for FileNor {
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
        self.file.seek(SeekFrom::Start(off as u64))?;
        self.file.read_exact(buf)?;
        Ok(())
    }

    fn write_off(&mut self, off: u32, buf: &[u8]) -> Result<(), PhyError> {
        self.check_range(off, buf.len())?;
        let mut current = vec![0u8; buf.len()];
        self.file.seek(SeekFrom::Start(off as u64))?;
        self.file.read_exact(&mut current)?;
        for (dst, src) in current.iter_mut().zip(buf) {
            *dst &= *src;
        }
        self.file.seek(SeekFrom::Start(off as u64))?;
        self.file.write_all(&current)?;
        Ok(())
    }

    fn erase_sector(&mut self, index: u32) -> Result<(), PhyError> {
        if index >= self.num_sectors {
            return Err(PhyError::OutOfBounds);
        }
        let info = self.sector_info(index);
        self.file.seek(SeekFrom::Start(info.offset as u64))?;
        self.file.write_all(&vec![0xFFu8; info.size as usize])?;
        Ok(())
    }
}
