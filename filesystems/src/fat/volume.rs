// FAT volume: mount, geometry, FAT table access, chain traversal
//
// A mounted volume owns the block device and one cached FAT sector. Data
// sectors are cached in the per-handle `SectorBuffer`s, which the volume
// borrows for every load/flush so the dirty discipline lives in one place.

use byteorder::{ByteOrder, LittleEndian};
use log::{debug, trace};

use fathom_core::{BlockDevice, FsError, SectorAddress};

use crate::buffer::{BufferOwner, ChainPosition, SectorBuffer, FAT16_ROOT};

// Boot sector / BPB field offsets
const BYTES_PER_SECTOR_OFFSET: usize = 0x0B;
const SECTORS_PER_CLUSTER_OFFSET: usize = 0x0D;
const RESERVED_SECTORS_OFFSET: usize = 0x0E;
const FAT_COUNT_OFFSET: usize = 0x10;
const ROOT_ENTRIES_OFFSET: usize = 0x11;
const TOTAL_SECTORS_16_OFFSET: usize = 0x13;
const FAT_SIZE_16_OFFSET: usize = 0x16;
const TOTAL_SECTORS_32_OFFSET: usize = 0x20;
const FAT_SIZE_32_OFFSET: usize = 0x24;
const ROOT_CLUSTER_OFFSET: usize = 0x2C;
const LABEL_16_OFFSET: usize = 0x2B;
const LABEL_32_OFFSET: usize = 0x47;
const LABEL_LEN: usize = 11;

// MBR partition table
const PARTITION_TABLE_OFFSET: usize = 0x1BE;
const PARTITION_ROW_LEN: usize = 16;
const PARTITION_ID_OFFSET: usize = 0x04;
const PARTITION_START_OFFSET: usize = 0x08;

const DIR_ENTRY_SIZE: u32 = 32;

// Cluster-count thresholds separating FAT12/FAT16/FAT32
const FAT16_MIN_CLUSTERS: u32 = 4085;
const FAT16_MAX_CLUSTERS: u32 = 65524;

pub(crate) const FREE_CLUSTER: u32 = 0;
pub(crate) const FAT16_EOC: u32 = 0xFFF8;
pub(crate) const FAT16_EOC_MARKER: u32 = 0xFFFF;
pub(crate) const FAT32_MASK: u32 = 0x0FFF_FFFF;
pub(crate) const FAT32_EOC: u32 = 0x0FFF_FFF8;
pub(crate) const FAT32_EOC_MARKER: u32 = 0x0FFF_FFFF;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FatType {
    Fat16,
    Fat32,
}

impl FatType {
    /// Bytes per FAT entry.
    pub fn entry_size(self) -> u32 {
        match self {
            FatType::Fat16 => 2,
            FatType::Fat32 => 4,
        }
    }
}

/// A mounted FAT16 or FAT32 volume.
pub struct FatVolume<D: BlockDevice> {
    device: D,
    sector_size: usize,
    sector_shift: u8,
    spc_shift: u8,

    fat_type: FatType,
    fat_start: SectorAddress,
    fat_size: u32,
    fat_count: u8,
    first_data_sector: SectorAddress,
    cluster_count: u32,

    /// First sector of the current directory. For the FAT16 root this is
    /// the fixed run between the FATs and the data region.
    dir_first_cluster: u32,
    root_start: SectorAddress,
    root_dir_sectors: u32,

    label: String,

    // One cached FAT sector with its own dirty flag
    fat_buf: Vec<u8>,
    fat_buf_sector: u32,
    fat_dirty: bool,
    /// Entries per FAT sector, as a shift.
    fat_entry_shift: u8,

    next_file_id: u32,
}

impl<D: BlockDevice> FatVolume<D> {
    /// Mount the first (or only) FAT volume on the device.
    pub fn mount(device: D) -> Result<Self, FsError> {
        Self::mount_partition(device, 0)
    }

    /// Mount a specific primary partition. A device whose first sector is
    /// itself a boot sector (no MBR) only has partition 0.
    pub fn mount_partition(mut device: D, partition: u8) -> Result<Self, FsError> {
        let sector_size = device.sector_size();
        let sector_shift = device.sector_size_shift();
        let mut sector = vec![0u8; sector_size];
        device.read_sector(SectorAddress(0), &mut sector)?;

        // A jump instruction in byte zero means sector zero is already a
        // boot sector; otherwise treat it as an MBR.
        let boot_start = if sector[0] == 0xEB || sector[0] == 0xE9 {
            if partition != 0 {
                return Err(FsError::PartitionNotFound(partition));
            }
            SectorAddress(0)
        } else {
            if partition > 3 {
                return Err(FsError::PartitionNotFound(partition));
            }
            let row = PARTITION_TABLE_OFFSET + partition as usize * PARTITION_ROW_LEN;
            let id = sector[row + PARTITION_ID_OFFSET];
            if !is_fat_partition_id(id) {
                return Err(FsError::UnsupportedFilesystem(format!(
                    "partition type 0x{id:02X}"
                )));
            }
            let start = LittleEndian::read_u32(&sector[row + PARTITION_START_OFFSET..]);
            let start = SectorAddress(start);
            device.read_sector(start, &mut sector)?;
            start
        };

        let bytes_per_sector = LittleEndian::read_u16(&sector[BYTES_PER_SECTOR_OFFSET..]) as usize;
        if bytes_per_sector != sector_size {
            return Err(FsError::UnsupportedFilesystem(format!(
                "volume sector size {bytes_per_sector} != device sector size {sector_size}"
            )));
        }

        let sectors_per_cluster = sector[SECTORS_PER_CLUSTER_OFFSET];
        if sectors_per_cluster == 0 || !sectors_per_cluster.is_power_of_two() {
            return Err(FsError::UnsupportedSectorsPerCluster(sectors_per_cluster));
        }
        let spc_shift = sectors_per_cluster.trailing_zeros() as u8;

        let fat_count = sector[FAT_COUNT_OFFSET];
        if fat_count != 2 {
            return Err(FsError::UnsupportedFatCount(fat_count));
        }

        let reserved_sectors = LittleEndian::read_u16(&sector[RESERVED_SECTORS_OFFSET..]) as u32;
        let root_entries = LittleEndian::read_u16(&sector[ROOT_ENTRIES_OFFSET..]) as u32;
        let root_dir_sectors =
            (root_entries * DIR_ENTRY_SIZE + sector_size as u32 - 1) >> sector_shift;

        let mut fat_size = LittleEndian::read_u16(&sector[FAT_SIZE_16_OFFSET..]) as u32;
        if fat_size == 0 {
            fat_size = LittleEndian::read_u32(&sector[FAT_SIZE_32_OFFSET..]);
        }
        let mut total_sectors = LittleEndian::read_u16(&sector[TOTAL_SECTORS_16_OFFSET..]) as u32;
        if total_sectors == 0 {
            total_sectors = LittleEndian::read_u32(&sector[TOTAL_SECTORS_32_OFFSET..]);
        }

        let fat_start = boot_start.offset(reserved_sectors);
        let root_start = fat_start.offset(fat_count as u32 * fat_size);
        let first_data_sector = root_start.offset(root_dir_sectors);
        let overhead = reserved_sectors + fat_count as u32 * fat_size + root_dir_sectors;
        if total_sectors <= overhead {
            return Err(FsError::UnsupportedFilesystem(
                "boot sector leaves no data region".to_string(),
            ));
        }
        let cluster_count = (total_sectors - overhead) >> spc_shift;

        let fat_type = if cluster_count < FAT16_MIN_CLUSTERS {
            return Err(FsError::UnsupportedFilesystem(format!(
                "FAT12 ({cluster_count} clusters)"
            )));
        } else if cluster_count <= FAT16_MAX_CLUSTERS {
            FatType::Fat16
        } else {
            FatType::Fat32
        };

        let (dir_first_cluster, root_start, label_offset) = match fat_type {
            FatType::Fat16 => (FAT16_ROOT, root_start, LABEL_16_OFFSET),
            FatType::Fat32 => {
                let root_cluster = LittleEndian::read_u32(&sector[ROOT_CLUSTER_OFFSET..]);
                if root_cluster < 2 || root_cluster >= cluster_count + 2 {
                    return Err(FsError::InvalidCluster(root_cluster));
                }
                let first = first_data_sector.offset((root_cluster - 2) << spc_shift);
                (root_cluster, first, LABEL_32_OFFSET)
            }
        };
        let label = String::from_utf8_lossy(&sector[label_offset..label_offset + LABEL_LEN])
            .trim_end()
            .to_string();

        let mut fat_buf = vec![0u8; sector_size];
        device.read_sector(fat_start, &mut fat_buf)?;

        let fat_entry_shift = sector_shift - fat_type.entry_size().trailing_zeros() as u8;

        debug!(
            "mounted {fat_type:?} volume '{label}': {cluster_count} clusters of {} sectors, \
             FAT at {fat_start} x{fat_count}, data at {first_data_sector}",
            1u32 << spc_shift
        );

        Ok(FatVolume {
            device,
            sector_size,
            sector_shift,
            spc_shift,
            fat_type,
            fat_start,
            fat_size,
            fat_count,
            first_data_sector,
            cluster_count,
            dir_first_cluster,
            root_start,
            root_dir_sectors,
            label,
            fat_buf,
            fat_buf_sector: 0,
            fat_dirty: false,
            fat_entry_shift,
            next_file_id: 1,
        })
    }

    /// Flush pending FAT writes and hand the device back.
    pub fn unmount(mut self) -> Result<D, FsError> {
        self.flush_fat()?;
        Ok(self.device)
    }

    pub fn fat_type(&self) -> FatType {
        self.fat_type
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn cluster_count(&self) -> u32 {
        self.cluster_count
    }

    pub fn sector_size(&self) -> usize {
        self.sector_size
    }

    pub fn sector_shift(&self) -> u8 {
        self.sector_shift
    }

    pub fn sectors_per_cluster(&self) -> u32 {
        1 << self.spc_shift
    }

    pub fn sectors_per_cluster_shift(&self) -> u8 {
        self.spc_shift
    }

    /// Inspect the underlying device without unmounting.
    pub fn device(&self) -> &D {
        &self.device
    }

    pub(crate) fn next_file_id(&mut self) -> u32 {
        let id = self.next_file_id;
        self.next_file_id += 1;
        id
    }

    /// First sector of a data cluster. The data region starts at cluster 2.
    pub fn sector_of(&self, cluster: u32) -> Result<SectorAddress, FsError> {
        if cluster < 2 || cluster >= self.cluster_count + 2 {
            return Err(FsError::InvalidCluster(cluster));
        }
        Ok(self.first_data_sector.offset((cluster - 2) << self.spc_shift))
    }

    /// True when `value` falls in the end-of-chain bracket for this
    /// volume's FAT variant.
    pub fn is_eoc(&self, value: u32) -> bool {
        match self.fat_type {
            FatType::Fat16 => value >= FAT16_EOC,
            FatType::Fat32 => (value & FAT32_MASK) >= FAT32_EOC,
        }
    }

    pub(crate) fn eoc_marker(&self) -> u32 {
        match self.fat_type {
            FatType::Fat16 => FAT16_EOC_MARKER,
            FatType::Fat32 => FAT32_EOC_MARKER,
        }
    }

    fn load_fat_sector(&mut self, fat_sector: u32) -> Result<(), FsError> {
        if fat_sector != self.fat_buf_sector {
            self.flush_fat()?;
            self.device
                .read_sector(self.fat_start.offset(fat_sector), &mut self.fat_buf)?;
            self.fat_buf_sector = fat_sector;
        }
        Ok(())
    }

    /// Read the FAT entry for `cluster` through the cached FAT sector.
    pub fn fat_value(&mut self, cluster: u32) -> Result<u32, FsError> {
        if cluster >= self.cluster_count + 2 {
            return Err(FsError::InvalidCluster(cluster));
        }
        let fat_sector = cluster >> self.fat_entry_shift;
        self.load_fat_sector(fat_sector)?;
        let first_in_sector = fat_sector << self.fat_entry_shift;
        let offset = ((cluster - first_in_sector) * self.fat_type.entry_size()) as usize;
        Ok(match self.fat_type {
            FatType::Fat16 => LittleEndian::read_u16(&self.fat_buf[offset..]) as u32,
            FatType::Fat32 => LittleEndian::read_u32(&self.fat_buf[offset..]) & FAT32_MASK,
        })
    }

    pub(crate) fn set_fat_value(&mut self, cluster: u32, value: u32) -> Result<(), FsError> {
        if cluster < 2 || cluster >= self.cluster_count + 2 {
            return Err(FsError::InvalidCluster(cluster));
        }
        let fat_sector = cluster >> self.fat_entry_shift;
        self.load_fat_sector(fat_sector)?;
        let first_in_sector = fat_sector << self.fat_entry_shift;
        let offset = ((cluster - first_in_sector) * self.fat_type.entry_size()) as usize;
        match self.fat_type {
            FatType::Fat16 => LittleEndian::write_u16(&mut self.fat_buf[offset..], value as u16),
            FatType::Fat32 => LittleEndian::write_u32(&mut self.fat_buf[offset..], value),
        }
        self.fat_dirty = true;
        Ok(())
    }

    /// Write the cached FAT sector back to every FAT copy.
    pub fn flush_fat(&mut self) -> Result<(), FsError> {
        if self.fat_dirty {
            for copy in 0..self.fat_count as u32 {
                let sector = self
                    .fat_start
                    .offset(copy * self.fat_size + self.fat_buf_sector);
                self.device.write_sector(sector, &self.fat_buf)?;
            }
            self.fat_dirty = false;
            trace!("flushed FAT sector {}", self.fat_buf_sector);
        }
        Ok(())
    }

    /// Find a free cluster, scanning linearly from `hint` and wrapping
    /// around once. The found entry is marked end-of-chain immediately.
    pub fn find_empty_space(&mut self, hint: u32) -> Result<u32, FsError> {
        let limit = self.cluster_count + 2;
        let start = if (2..limit).contains(&hint) { hint } else { 2 };
        let mut cluster = start;
        loop {
            if self.fat_value(cluster)? == FREE_CLUSTER {
                self.set_fat_value(cluster, self.eoc_marker())?;
                debug!("allocated cluster {cluster}");
                return Ok(cluster);
            }
            cluster += 1;
            if cluster == limit {
                cluster = 2;
            }
            if cluster == start {
                return Err(FsError::VolumeFull);
            }
        }
    }

    /// Free every cluster in the chain starting at `head`. The walk is
    /// bounded by the cluster count so a cyclic chain errors out instead
    /// of spinning.
    pub fn clear_chain(&mut self, head: u32) -> Result<(), FsError> {
        let mut cluster = head;
        let mut visited = 0u32;
        loop {
            if visited > self.cluster_count {
                return Err(FsError::CorruptChain(head));
            }
            visited += 1;
            let next = self.fat_value(cluster)?;
            self.set_fat_value(cluster, FREE_CLUSTER)?;
            if self.is_eoc(next) {
                break;
            }
            if next < 2 || next >= self.cluster_count + 2 {
                return Err(FsError::CorruptChain(head));
            }
            cluster = next;
        }
        debug!("cleared chain from cluster {head} ({visited} clusters)");
        Ok(())
    }

    /// Append one cluster to the chain `position` sits on. `position`
    /// must be on the chain's last cluster (its look-ahead is EOC); the
    /// look-ahead is updated to the new cluster.
    pub(crate) fn extend_chain(&mut self, position: &mut ChainPosition) -> Result<u32, FsError> {
        if !self.is_eoc(position.next_cluster) {
            return Err(FsError::InvalidFatAppend);
        }
        let new_cluster = self.find_empty_space(position.cluster)?;
        self.set_fat_value(position.cluster, new_cluster)?;
        position.next_cluster = new_cluster;
        Ok(new_cluster)
    }

    /// Extend the directory whose last sector `buf` is positioned on.
    /// The new cluster is zero filled so the 0x00 end-of-directory
    /// convention holds in the fresh sectors.
    pub(crate) fn extend_current_directory(
        &mut self,
        buf: &mut SectorBuffer,
    ) -> Result<(), FsError> {
        let mut position = buf.meta().position;
        if position.cluster == FAT16_ROOT {
            // The FAT16 root run has a fixed size and no chain to extend
            return Err(FsError::DirectoryFull);
        }
        let new_cluster = self.extend_chain(&mut position)?;
        self.zero_cluster(new_cluster)?;
        buf.meta_mut().position = position;
        debug!("extended directory with cluster {new_cluster}");
        Ok(())
    }

    fn zero_cluster(&mut self, cluster: u32) -> Result<(), FsError> {
        let zeros = vec![0u8; self.sector_size];
        let start = self.sector_of(cluster)?;
        for sector in 0..self.sectors_per_cluster() {
            self.device.write_sector(start.offset(sector), &zeros)?;
        }
        Ok(())
    }

    /// Chain cursor for the first sector of the current directory.
    pub(crate) fn directory_start(&mut self) -> Result<ChainPosition, FsError> {
        if self.dir_first_cluster == FAT16_ROOT {
            Ok(ChainPosition {
                cluster: FAT16_ROOT,
                cluster_start: self.root_start,
                sector_offset: 0,
                next_cluster: FAT16_ROOT,
            })
        } else {
            self.position_of(self.dir_first_cluster)
        }
    }

    /// Chain cursor for the first sector of `cluster`, with the FAT
    /// look-ahead filled in.
    pub(crate) fn position_of(&mut self, cluster: u32) -> Result<ChainPosition, FsError> {
        Ok(ChainPosition {
            cluster,
            cluster_start: self.sector_of(cluster)?,
            sector_offset: 0,
            next_cluster: self.fat_value(cluster)?,
        })
    }

    /// Point `buf` at the start of the current directory, flushing first
    /// if it holds modified data.
    pub(crate) fn reload_directory_start(&mut self, buf: &mut SectorBuffer) -> Result<(), FsError> {
        let start = self.directory_start()?;
        self.reposition(buf, BufferOwner::Directory, start)
    }

    /// Write the buffered sector back if it has been modified.
    pub(crate) fn flush_buffer(&mut self, buf: &mut SectorBuffer) -> Result<(), FsError> {
        if buf.is_dirty() {
            let sector = buf.meta().position.current_sector();
            self.device.write_sector(sector, buf.data())?;
            buf.meta_mut().dirty = false;
            trace!("flushed sector {sector}");
        }
        Ok(())
    }

    /// Retarget `buf` to `position` on behalf of `owner`. A dirty buffer
    /// is flushed before the reload; if the buffer already holds the
    /// requested sector for the same owner, no device I/O happens.
    pub(crate) fn reposition(
        &mut self,
        buf: &mut SectorBuffer,
        owner: BufferOwner,
        position: ChainPosition,
    ) -> Result<(), FsError> {
        if buf.positioned_at(owner, position.current_sector()) {
            buf.meta_mut().position = position;
            return Ok(());
        }
        self.flush_buffer(buf)?;
        {
            let meta = buf.meta_mut();
            meta.owner = Some(owner);
            meta.position = position;
        }
        self.reload_buffer(buf)
    }

    /// Read the sector under `buf`'s position into the buffer. The caller
    /// must have flushed first; pending modifications are lost.
    pub(crate) fn reload_buffer(&mut self, buf: &mut SectorBuffer) -> Result<(), FsError> {
        let sector = buf.meta().position.current_sector();
        self.device.read_sector(sector, buf.data_mut())?;
        buf.meta_mut().dirty = false;
        Ok(())
    }

    /// Advance `buf` one sector along its chain and load it.
    ///
    /// Inside the FAT16 root run this is a bounded sector increment.
    /// Inside a cluster it increments the sector offset until the last
    /// sector, where the FAT look-ahead decides: a real cluster is
    /// followed, an end-of-chain value returns `EndOfChain` without
    /// moving, so the position stays on the last real cluster and the
    /// chain can still be extended from it.
    pub(crate) fn load_next_sector(&mut self, buf: &mut SectorBuffer) -> Result<(), FsError> {
        self.flush_buffer(buf)?;
        let position = buf.meta().position;

        if position.cluster == FAT16_ROOT {
            if position.sector_offset + 1 >= self.root_dir_sectors {
                return Err(FsError::EndOfChain);
            }
            buf.meta_mut().position.sector_offset += 1;
        } else if self.is_eoc(position.cluster) {
            return Err(FsError::ReadingPastEoc);
        } else if position.sector_offset + 1 < self.sectors_per_cluster() {
            buf.meta_mut().position.sector_offset += 1;
        } else if self.is_eoc(position.next_cluster) {
            return Err(FsError::EndOfChain);
        } else {
            let next = self.position_of(position.next_cluster)?;
            buf.meta_mut().position = next;
        }
        self.reload_buffer(buf)
    }
}

fn is_fat_partition_id(id: u8) -> bool {
    // FAT16 / FAT32 partition types, including the LBA variants
    matches!(id, 0x04 | 0x06 | 0x0B | 0x0C | 0x0E)
}
