// Test utilities for safe filesystem testing
//
// MemoryDevice backs every engine test; nothing here ever touches real
// hardware. The read/write counters let tests assert on cache behavior,
// not just on final disk contents.

use crate::device::{BlockDevice, SectorAddress};
use crate::error::FsError;

/// An in-memory block device.
pub struct MemoryDevice {
    data: Vec<u8>,
    sector_size: usize,
    reads: u64,
    writes: u64,
}

impl MemoryDevice {
    /// A zero-filled device with 512-byte sectors.
    pub fn new(sector_count: u32) -> Self {
        Self::with_sector_size(sector_count, 512)
    }

    pub fn with_sector_size(sector_count: u32, sector_size: usize) -> Self {
        assert!(sector_size.is_power_of_two());
        MemoryDevice {
            data: vec![0u8; sector_count as usize * sector_size],
            sector_size,
            reads: 0,
            writes: 0,
        }
    }

    /// Sectors read since construction or the last `reset_counters`.
    pub fn read_count(&self) -> u64 {
        self.reads
    }

    /// Sectors written since construction or the last `reset_counters`.
    pub fn write_count(&self) -> u64 {
        self.writes
    }

    pub fn reset_counters(&mut self) {
        self.reads = 0;
        self.writes = 0;
    }

    /// Direct view of a sector's bytes, bypassing the counters.
    pub fn sector(&self, address: SectorAddress) -> &[u8] {
        let start = address.0 as usize * self.sector_size;
        &self.data[start..start + self.sector_size]
    }

    fn byte_range(&self, address: SectorAddress) -> Result<std::ops::Range<usize>, FsError> {
        let start = address.0 as usize * self.sector_size;
        let end = start + self.sector_size;
        if end > self.data.len() {
            return Err(FsError::DeviceRange { sector: address.0 });
        }
        Ok(start..end)
    }
}

impl BlockDevice for MemoryDevice {
    fn read_sector(&mut self, address: SectorAddress, buf: &mut [u8]) -> Result<(), FsError> {
        let range = self.byte_range(address)?;
        buf.copy_from_slice(&self.data[range]);
        self.reads += 1;
        Ok(())
    }

    fn write_sector(&mut self, address: SectorAddress, buf: &[u8]) -> Result<(), FsError> {
        let range = self.byte_range(address)?;
        self.data[range].copy_from_slice(buf);
        self.writes += 1;
        Ok(())
    }

    fn sector_size(&self) -> usize {
        self.sector_size
    }

    fn sector_count(&self) -> u32 {
        (self.data.len() / self.sector_size) as u32
    }
}
