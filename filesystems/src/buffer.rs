// Single-sector buffer cache
//
// Each file handle owns one of these; the volume borrows it to move data
// between the device and the caller. The metadata records who the cached
// sector belongs to and where it sits in its cluster chain, so the engine
// can tell "already loaded" from "needs a flush and a reload".

use std::cell::RefCell;
use std::rc::Rc;

use byteorder::{ByteOrder, LittleEndian};
use fathom_core::SectorAddress;

/// Sentinel cluster value marking a position inside the fixed FAT16 root
/// directory run, which lives outside the data region and has no FAT chain.
pub const FAT16_ROOT: u32 = u32::MAX;

/// A cursor into a cluster chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainPosition {
    /// Current allocation unit (`FAT16_ROOT` inside the fixed root run).
    pub cluster: u32,
    /// First sector of the current cluster.
    pub cluster_start: SectorAddress,
    /// Sector offset within the current cluster (or within the root run).
    pub sector_offset: u32,
    /// Look-ahead at the FAT entry for `cluster`.
    pub next_cluster: u32,
}

impl ChainPosition {
    /// Placeholder for handles whose file has no clusters allocated yet.
    pub const UNSET: ChainPosition = ChainPosition {
        cluster: 0,
        cluster_start: SectorAddress(0),
        sector_offset: 0,
        next_cluster: 0,
    };

    /// Device address of the sector under the cursor.
    pub fn current_sector(&self) -> SectorAddress {
        self.cluster_start.offset(self.sector_offset)
    }
}

/// Who the cached sector belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferOwner {
    /// A sector of the volume's current directory.
    Directory,
    /// A sector of file content, tagged with the owning handle's id.
    File(u32),
}

#[derive(Debug, Clone, Copy)]
pub struct BufferMeta {
    pub owner: Option<BufferOwner>,
    pub position: ChainPosition,
    /// Set when the cached sector has been modified since it was read.
    pub dirty: bool,
}

/// One sector of cached data plus the metadata describing it.
pub struct SectorBuffer {
    data: Vec<u8>,
    meta: BufferMeta,
}

/// Several handles may share one buffer to save memory; sharing is opt-in
/// and single-threaded.
pub type SharedBuffer = Rc<RefCell<SectorBuffer>>;

impl SectorBuffer {
    pub fn new(sector_size: usize) -> Self {
        SectorBuffer {
            data: vec![0u8; sector_size],
            meta: BufferMeta {
                owner: None,
                position: ChainPosition::UNSET,
                dirty: false,
            },
        }
    }

    pub fn shared(sector_size: usize) -> SharedBuffer {
        Rc::new(RefCell::new(SectorBuffer::new(sector_size)))
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Mutable access to the raw bytes. Does not set the dirty flag;
    /// callers that modify content must `mark_dirty` themselves.
    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn meta(&self) -> &BufferMeta {
        &self.meta
    }

    pub fn meta_mut(&mut self) -> &mut BufferMeta {
        &mut self.meta
    }

    pub fn mark_dirty(&mut self) {
        self.meta.dirty = true;
    }

    pub fn is_dirty(&self) -> bool {
        self.meta.dirty
    }

    pub fn owned_by(&self, owner: BufferOwner) -> bool {
        self.meta.owner == Some(owner)
    }

    /// True when the buffer already holds `sector` on behalf of `owner`,
    /// meaning no reload is needed.
    pub fn positioned_at(&self, owner: BufferOwner, sector: SectorAddress) -> bool {
        self.owned_by(owner) && self.meta.position.current_sector() == sector
    }

    pub fn get_byte(&self, offset: usize) -> u8 {
        self.data[offset]
    }

    pub fn get_short(&self, offset: usize) -> u16 {
        LittleEndian::read_u16(&self.data[offset..])
    }

    pub fn get_long(&self, offset: usize) -> u32 {
        LittleEndian::read_u32(&self.data[offset..])
    }

    pub fn write_byte(&mut self, offset: usize, value: u8) {
        self.data[offset] = value;
        self.meta.dirty = true;
    }

    pub fn write_short(&mut self, offset: usize, value: u16) {
        LittleEndian::write_u16(&mut self.data[offset..], value);
        self.meta.dirty = true;
    }

    pub fn write_long(&mut self, offset: usize, value: u32) {
        LittleEndian::write_u32(&mut self.data[offset..], value);
        self.meta.dirty = true;
    }
}
