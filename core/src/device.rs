// Block device abstraction
//
// The filesystem engine never talks to hardware directly; everything goes
// through this trait, one sector at a time.

use std::fmt;

use crate::error::FsError;

/// Linear address of a sector on a block device, counted from sector zero
/// of the whole device (not from the start of a partition).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct SectorAddress(pub u32);

impl SectorAddress {
    /// The address `sectors` sectors past this one.
    pub fn offset(self, sectors: u32) -> SectorAddress {
        SectorAddress(self.0 + sectors)
    }
}

impl fmt::Display for SectorAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for SectorAddress {
    fn from(sector: u32) -> Self {
        SectorAddress(sector)
    }
}

/// Any storage that reads and writes fixed-size sectors: SD cards, disk
/// images, in-memory test devices.
pub trait BlockDevice {
    /// Read one sector into `buf`. `buf` must be exactly `sector_size()`
    /// bytes long.
    fn read_sector(&mut self, address: SectorAddress, buf: &mut [u8]) -> Result<(), FsError>;

    /// Write one sector from `buf`. `buf` must be exactly `sector_size()`
    /// bytes long.
    fn write_sector(&mut self, address: SectorAddress, buf: &[u8]) -> Result<(), FsError>;

    /// Bytes in a single sector. Must be a power of two.
    fn sector_size(&self) -> usize;

    /// log2 of the sector size, for shift-based address math.
    fn sector_size_shift(&self) -> u8 {
        self.sector_size().trailing_zeros() as u8
    }

    /// Total sectors on the device.
    fn sector_count(&self) -> u32;
}
