// Volume formatting
//
// Builds blank FAT16/FAT32 volumes directly on a block device: boot
// sector, both FAT copies with their reserved entries, zeroed root
// region, FSInfo for FAT32. No MBR is written; the boot sector goes to
// sector zero.

use byteorder::{ByteOrder, LittleEndian};
use log::debug;

use fathom_core::{BlockDevice, FsError, SectorAddress};

use super::volume::{FAT16_EOC_MARKER, FAT32_EOC_MARKER};

const FAT16_MIN_CLUSTERS: u32 = 4085;
const FAT16_MAX_CLUSTERS: u32 = 65524;
const FAT32_MIN_CLUSTERS: u32 = 65525;
const MAX_SECTORS_PER_CLUSTER: u32 = 128;

const MEDIA_FIXED: u8 = 0xF8;
const FAT32_RESERVED_SECTORS: u32 = 32;
const FAT32_ROOT_CLUSTER: u32 = 2;
const FSINFO_SECTOR: u32 = 1;
const BACKUP_BOOT_SECTOR: u32 = 6;

#[derive(Debug, Clone)]
pub struct FormatOptions {
    /// Volume label, up to 11 characters; upper-cased on disk.
    pub label: Option<String>,
    /// Sectors per cluster; 0 picks the smallest value that fits the
    /// variant's cluster-count bounds.
    pub sectors_per_cluster: u8,
    /// Root directory entry count (FAT16 only).
    pub root_entries: u16,
}

impl Default for FormatOptions {
    fn default() -> Self {
        FormatOptions {
            label: None,
            sectors_per_cluster: 0,
            root_entries: 512,
        }
    }
}

struct Layout {
    sectors_per_cluster: u32,
    reserved_sectors: u32,
    root_dir_sectors: u32,
    fat_size: u32,
    cluster_count: u32,
}

/// Format the whole device as FAT16.
pub fn format_fat16<D: BlockDevice>(device: &mut D, options: &FormatOptions) -> Result<(), FsError> {
    let sector_size = device.sector_size() as u32;
    let total_sectors = device.sector_count();
    let reserved_sectors = 1;
    let root_dir_sectors =
        (options.root_entries as u32 * 32 + sector_size - 1) / sector_size;

    let layout = compute_layout(
        total_sectors,
        sector_size,
        reserved_sectors,
        root_dir_sectors,
        2, // FAT16 entry size
        FAT16_MIN_CLUSTERS,
        FAT16_MAX_CLUSTERS,
        options.sectors_per_cluster,
    )?;

    let mut boot = vec![0u8; sector_size as usize];
    write_bpb_common(&mut boot, &layout, total_sectors, options.root_entries);
    boot[0x26] = 0x29; // extended boot signature
    LittleEndian::write_u32(&mut boot[0x27..], volume_serial(total_sectors));
    write_label(&mut boot[0x2B..0x36], options.label.as_deref());
    boot[0x36..0x3E].copy_from_slice(b"FAT16   ");
    device.write_sector(SectorAddress(0), &boot)?;

    // Both FATs: reserved entries 0 and 1, everything else free
    let mut fat_first = vec![0u8; sector_size as usize];
    LittleEndian::write_u16(&mut fat_first[0..], 0xFF00 | MEDIA_FIXED as u16);
    LittleEndian::write_u16(&mut fat_first[2..], FAT16_EOC_MARKER as u16);
    write_fat_copies(device, &layout, &fat_first)?;

    // Zeroed root directory
    let zeros = vec![0u8; sector_size as usize];
    let root_start = reserved_sectors + 2 * layout.fat_size;
    for sector in 0..root_dir_sectors {
        device.write_sector(SectorAddress(root_start + sector), &zeros)?;
    }

    debug!(
        "formatted FAT16: {} clusters of {} sectors, FAT size {}",
        layout.cluster_count, layout.sectors_per_cluster, layout.fat_size
    );
    Ok(())
}

/// Format the whole device as FAT32.
pub fn format_fat32<D: BlockDevice>(device: &mut D, options: &FormatOptions) -> Result<(), FsError> {
    let sector_size = device.sector_size() as u32;
    let total_sectors = device.sector_count();

    let layout = compute_layout(
        total_sectors,
        sector_size,
        FAT32_RESERVED_SECTORS,
        0,
        4, // FAT32 entry size
        FAT32_MIN_CLUSTERS,
        0x0FFF_FFF0,
        options.sectors_per_cluster,
    )?;

    let mut boot = vec![0u8; sector_size as usize];
    write_bpb_common(&mut boot, &layout, total_sectors, 0);
    LittleEndian::write_u32(&mut boot[0x24..], layout.fat_size);
    LittleEndian::write_u32(&mut boot[0x2C..], FAT32_ROOT_CLUSTER);
    LittleEndian::write_u16(&mut boot[0x30..], FSINFO_SECTOR as u16);
    LittleEndian::write_u16(&mut boot[0x32..], BACKUP_BOOT_SECTOR as u16);
    boot[0x42] = 0x29;
    LittleEndian::write_u32(&mut boot[0x43..], volume_serial(total_sectors));
    write_label(&mut boot[0x47..0x52], options.label.as_deref());
    boot[0x52..0x5A].copy_from_slice(b"FAT32   ");
    device.write_sector(SectorAddress(0), &boot)?;
    device.write_sector(SectorAddress(BACKUP_BOOT_SECTOR), &boot)?;

    // FSInfo: one cluster consumed by the root directory
    let mut fsinfo = vec![0u8; sector_size as usize];
    LittleEndian::write_u32(&mut fsinfo[0x00..], 0x4161_5252);
    LittleEndian::write_u32(&mut fsinfo[0x1E4..], 0x6141_7272);
    LittleEndian::write_u32(&mut fsinfo[0x1E8..], layout.cluster_count - 1);
    LittleEndian::write_u32(&mut fsinfo[0x1EC..], FAT32_ROOT_CLUSTER + 1);
    fsinfo[0x1FE] = 0x55;
    fsinfo[0x1FF] = 0xAA;
    device.write_sector(SectorAddress(FSINFO_SECTOR), &fsinfo)?;

    // Both FATs: reserved entries plus the root directory's one-cluster chain
    let mut fat_first = vec![0u8; sector_size as usize];
    LittleEndian::write_u32(&mut fat_first[0..], 0x0FFF_FF00 | MEDIA_FIXED as u32);
    LittleEndian::write_u32(&mut fat_first[4..], FAT32_EOC_MARKER);
    LittleEndian::write_u32(&mut fat_first[8..], FAT32_EOC_MARKER);
    write_fat_copies(device, &layout, &fat_first)?;

    // Zero the root directory cluster
    let zeros = vec![0u8; sector_size as usize];
    let data_start = FAT32_RESERVED_SECTORS + 2 * layout.fat_size;
    for sector in 0..layout.sectors_per_cluster {
        device.write_sector(SectorAddress(data_start + sector), &zeros)?;
    }

    debug!(
        "formatted FAT32: {} clusters of {} sectors, FAT size {}",
        layout.cluster_count, layout.sectors_per_cluster, layout.fat_size
    );
    Ok(())
}

/// Pick sectors-per-cluster and FAT size so the cluster count lands in
/// the variant's band.
#[allow(clippy::too_many_arguments)]
fn compute_layout(
    total_sectors: u32,
    sector_size: u32,
    reserved_sectors: u32,
    root_dir_sectors: u32,
    fat_entry_size: u32,
    min_clusters: u32,
    max_clusters: u32,
    requested_spc: u8,
) -> Result<Layout, FsError> {
    let overhead = reserved_sectors + root_dir_sectors;
    if total_sectors <= overhead {
        return Err(FsError::UnsupportedFilesystem(
            "device too small to format".to_string(),
        ));
    }

    let sectors_per_cluster = if requested_spc != 0 {
        if !requested_spc.is_power_of_two() {
            return Err(FsError::UnsupportedSectorsPerCluster(requested_spc));
        }
        requested_spc as u32
    } else {
        let mut spc = 1;
        while spc < MAX_SECTORS_PER_CLUSTER && (total_sectors - overhead) / spc > max_clusters {
            spc <<= 1;
        }
        spc
    };

    // FAT size depends on the cluster count and vice versa; a couple of
    // refinement passes settle it.
    let mut fat_size = 0u32;
    for _ in 0..2 {
        let fat_sectors = 2 * fat_size;
        if total_sectors <= overhead + fat_sectors {
            return Err(FsError::UnsupportedFilesystem(
                "device too small to format".to_string(),
            ));
        }
        let clusters = (total_sectors - overhead - fat_sectors) / sectors_per_cluster;
        fat_size = ((clusters + 2) * fat_entry_size + sector_size - 1) / sector_size;
    }
    let cluster_count = (total_sectors - overhead - 2 * fat_size) / sectors_per_cluster;

    if cluster_count < min_clusters || cluster_count > max_clusters {
        return Err(FsError::UnsupportedFilesystem(format!(
            "{cluster_count} clusters does not fit the requested FAT variant"
        )));
    }

    Ok(Layout {
        sectors_per_cluster,
        reserved_sectors,
        root_dir_sectors,
        fat_size,
        cluster_count,
    })
}

/// BPB fields shared by both variants.
fn write_bpb_common(boot: &mut [u8], layout: &Layout, total_sectors: u32, root_entries: u16) {
    let sector_size = boot.len() as u16;
    boot[0] = 0xEB;
    boot[1] = 0x3C;
    boot[2] = 0x90;
    boot[3..11].copy_from_slice(b"FATHOM  ");
    LittleEndian::write_u16(&mut boot[0x0B..], sector_size);
    boot[0x0D] = layout.sectors_per_cluster as u8;
    LittleEndian::write_u16(&mut boot[0x0E..], layout.reserved_sectors as u16);
    boot[0x10] = 2; // FAT copies
    LittleEndian::write_u16(&mut boot[0x11..], root_entries);
    if total_sectors <= u16::MAX as u32 {
        LittleEndian::write_u16(&mut boot[0x13..], total_sectors as u16);
    } else {
        LittleEndian::write_u32(&mut boot[0x20..], total_sectors);
    }
    boot[0x15] = MEDIA_FIXED;
    if layout.fat_size <= u16::MAX as u32 && root_entries != 0 {
        LittleEndian::write_u16(&mut boot[0x16..], layout.fat_size as u16);
    }
    LittleEndian::write_u16(&mut boot[0x18..], 63); // sectors per track
    LittleEndian::write_u16(&mut boot[0x1A..], 255); // heads
    boot[0x1FE] = 0x55;
    boot[0x1FF] = 0xAA;
}

fn write_fat_copies<D: BlockDevice>(
    device: &mut D,
    layout: &Layout,
    first_sector: &[u8],
) -> Result<(), FsError> {
    let zeros = vec![0u8; first_sector.len()];
    for copy in 0..2 {
        let fat_start = layout.reserved_sectors + copy * layout.fat_size;
        device.write_sector(SectorAddress(fat_start), first_sector)?;
        for sector in 1..layout.fat_size {
            device.write_sector(SectorAddress(fat_start + sector), &zeros)?;
        }
    }
    Ok(())
}

fn write_label(dest: &mut [u8], label: Option<&str>) {
    dest.copy_from_slice(b"NO NAME    ");
    if let Some(label) = label {
        let upper = label.to_uppercase();
        let bytes = upper.as_bytes();
        let len = bytes.len().min(dest.len());
        dest[..len].copy_from_slice(&bytes[..len]);
    }
}

fn volume_serial(total_sectors: u32) -> u32 {
    // Stable per-geometry serial; uniqueness does not matter for us
    0x4641_5448 ^ total_sectors.rotate_left(16)
}
