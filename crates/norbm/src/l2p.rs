//! Logical-to-physical block table.
//!
//! A packed bitfield mapping `lbi` to the physical sector of its data
//! block. Entries are `⌈log2(num_phy_sectors)⌉` bits wide; value 0 means
//! "no data block assigned" (sector 0 never holds one). Work blocks are
//! not recorded here; callers consult the work-block cache first.

use alloc::vec;
use alloc::vec::Vec;

#[derive(Debug, Clone)]
pub struct L2pTable {
    bits: Vec<u8>,
    width: u32,
    len: u32,
}

impl L2pTable {
    pub fn new(num_log_blocks: u32, num_phy_sectors: u32) -> Self {
        let width = match num_phy_sectors {
            0..=1 => 1,
            n => 32 - (n - 1).leading_zeros(),
        };
        let total_bits = num_log_blocks as usize * width as usize;
        Self {
            bits: vec![0; total_bits.div_ceil(8)],
            width,
            len: num_log_blocks,
        }
    }

    pub fn len(&self) -> u32 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Physical sector of the data block, or `None` if unassigned.
    pub fn get(&self, lbi: u16) -> Option<u32> {
        debug_assert!((lbi as u32) < self.len);
        let mut value = 0u32;
        let base = lbi as usize * self.width as usize;
        for i in 0..self.width as usize {
            let bit = base + i;
            if self.bits[bit / 8] >> (bit % 8) & 1 == 1 {
                value |= 1 << i;
            }
        }
        (value != 0).then_some(value)
    }

    pub fn set(&mut self, lbi: u16, psi: Option<u32>) {
        debug_assert!((lbi as u32) < self.len);
        let value = psi.unwrap_or(0);
        debug_assert!(self.width == 32 || value < (1 << self.width));
        let base = lbi as usize * self.width as usize;
        for i in 0..self.width as usize {
            let bit = base + i;
            if value >> i & 1 == 1 {
                self.bits[bit / 8] |= 1 << (bit % 8);
            } else {
                self.bits[bit / 8] &= !(1 << (bit % 8));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_width_follows_sector_count() {
        assert_eq!(L2pTable::new(10, 64).width, 6);
        assert_eq!(L2pTable::new(10, 65).width, 7);
        assert_eq!(L2pTable::new(10, 4096).width, 12);
    }

    #[test]
    fn set_get_round_trip() {
        let mut l2p = L2pTable::new(100, 1000);
        assert_eq!(l2p.get(0), None);
        l2p.set(0, Some(999));
        l2p.set(1, Some(1));
        l2p.set(99, Some(512));
        assert_eq!(l2p.get(0), Some(999));
        assert_eq!(l2p.get(1), Some(1));
        assert_eq!(l2p.get(99), Some(512));
        // Neighbours stay untouched.
        assert_eq!(l2p.get(2), None);
        l2p.set(0, None);
        assert_eq!(l2p.get(0), None);
        assert_eq!(l2p.get(1), Some(1));
    }
}
