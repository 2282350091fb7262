// Engine tests against in-memory devices
//
// Every volume here is created by the formatter, so the tests are fully
// hermetic: no image files, no host filesystem.

use std::io::SeekFrom;
use std::rc::Rc;

use byteorder::{ByteOrder, LittleEndian};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use fathom_core::test_utils::MemoryDevice;
use fathom_core::{BlockDevice, FsError, SectorAddress};

use crate::buffer::{BufferOwner, ChainPosition, SectorBuffer, FAT16_ROOT};

use super::dir_entry::{self, attributes, DirEntry};
use super::{format_fat16, format_fat32, FatFileReader, FatFileWriter, FatType, FatVolume, FormatOptions};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// A small FAT16 volume with 512-byte clusters, so files cross cluster
/// boundaries quickly.
fn fat16_volume() -> FatVolume<MemoryDevice> {
    fat16_volume_with(4600, FormatOptions::default())
}

fn fat16_volume_with(sectors: u32, options: FormatOptions) -> FatVolume<MemoryDevice> {
    init_logging();
    let mut device = MemoryDevice::new(sectors);
    format_fat16(&mut device, &options).unwrap();
    FatVolume::mount(device).unwrap()
}

fn fat32_volume() -> FatVolume<MemoryDevice> {
    init_logging();
    let mut device = MemoryDevice::new(70000);
    format_fat32(&mut device, &FormatOptions::default()).unwrap();
    FatVolume::mount(device).unwrap()
}

/// Parse geometry straight off the boot sector, independent of the
/// mount code under test.
struct RawGeometry {
    root_start: u32,
    data_start: u32,
}

fn raw_geometry(device: &MemoryDevice) -> RawGeometry {
    let boot = device.sector(SectorAddress(0));
    let reserved = LittleEndian::read_u16(&boot[0x0E..]) as u32;
    let mut fat_size = LittleEndian::read_u16(&boot[0x16..]) as u32;
    if fat_size == 0 {
        fat_size = LittleEndian::read_u32(&boot[0x24..]);
    }
    let root_entries = LittleEndian::read_u16(&boot[0x11..]) as u32;
    let root_sectors = (root_entries * 32 + 511) / 512;
    RawGeometry {
        root_start: reserved + 2 * fat_size,
        data_start: reserved + 2 * fat_size + root_sectors,
    }
}

/// Raw root-directory entry by slot index (FAT16 fixed root only).
fn raw_root_entry(device: &MemoryDevice, index: usize, fat_type: FatType) -> DirEntry {
    let geometry = raw_geometry(device);
    let sector = geometry.root_start + (index / 16) as u32;
    let offset = index % 16 * 32;
    let data = device.sector(SectorAddress(sector));
    DirEntry::decode(&data[offset..offset + 32], fat_type)
}

fn chain_of(vol: &mut FatVolume<MemoryDevice>, first: u32) -> Vec<u32> {
    let mut chain = vec![first];
    let mut cluster = first;
    loop {
        let next = vol.fat_value(cluster).unwrap();
        if vol.is_eoc(next) {
            return chain;
        }
        cluster = next;
        chain.push(cluster);
        assert!(chain.len() <= vol.cluster_count() as usize, "chain runs away");
    }
}

#[test]
fn mount_reads_fat16_geometry() {
    let vol = fat16_volume_with(
        4600,
        FormatOptions {
            label: Some("TESTVOL".to_string()),
            ..FormatOptions::default()
        },
    );
    assert_eq!(vol.fat_type(), FatType::Fat16);
    assert_eq!(vol.label(), "TESTVOL");
    assert_eq!(vol.sector_size(), 512);
    assert_eq!(vol.sectors_per_cluster(), 1);
    assert!(vol.cluster_count() >= 4085);
}

#[test]
fn mount_reads_fat32_geometry() {
    let vol = fat32_volume();
    assert_eq!(vol.fat_type(), FatType::Fat32);
    assert_eq!(vol.label(), "NO NAME");
    assert!(vol.cluster_count() >= 65525);
}

#[test]
fn mount_rejects_blank_device() {
    let device = MemoryDevice::new(64);
    assert!(matches!(
        FatVolume::mount(device),
        Err(FsError::UnsupportedFilesystem(_))
    ));
}

#[test]
fn mount_selects_mbr_partition() {
    init_logging();
    let mut inner = MemoryDevice::new(4600);
    format_fat16(&mut inner, &FormatOptions::default()).unwrap();

    // Relocate the volume behind an MBR at a 64-sector offset
    let mut disk = MemoryDevice::new(4700);
    for sector in 0..4600 {
        let data = inner.sector(SectorAddress(sector)).to_vec();
        disk.write_sector(SectorAddress(sector + 64), &data).unwrap();
    }
    let mut mbr = vec![0u8; 512];
    mbr[0x1BE + 0x04] = 0x06; // FAT16 partition type
    LittleEndian::write_u32(&mut mbr[0x1BE + 0x08..], 64);
    mbr[0x1FE] = 0x55;
    mbr[0x1FF] = 0xAA;
    disk.write_sector(SectorAddress(0), &mbr).unwrap();

    let vol = FatVolume::mount_partition(disk, 0).unwrap();
    assert_eq!(vol.fat_type(), FatType::Fat16);

    let disk = vol.unmount().unwrap();
    assert!(matches!(
        FatVolume::mount_partition(disk, 1),
        Err(FsError::UnsupportedFilesystem(_))
    ));
}

#[test]
fn mount_rejects_partition_index_past_table() {
    let device = MemoryDevice::new(64);
    assert!(matches!(
        FatVolume::mount_partition(device, 4),
        Err(FsError::PartitionNotFound(4))
    ));
}

// Scenario: a 600-byte write on 512-byte clusters spans two clusters,
// linked through the FAT, with the length patched once at close.
#[test]
fn write_spanning_two_clusters() {
    let mut vol = fat16_volume();
    let payload: Vec<u8> = (0..600u32).map(|i| i as u8).collect();

    let mut writer = FatFileWriter::new(&mut vol, "TEST.TXT");
    writer.open(&mut vol).unwrap();
    writer.write(&mut vol, &payload).unwrap();
    writer.close(&mut vol).unwrap();

    let entry = raw_root_entry(vol.device(), 0, FatType::Fat16);
    assert_eq!(entry.name, "TEST.TXT");
    assert_eq!(entry.length, 600);
    assert_eq!(entry.attributes, attributes::ARCHIVE);
    let chain = chain_of(&mut vol, entry.first_cluster);
    assert_eq!(chain.len(), 2);

    let mut reader = FatFileReader::new(&mut vol, "TEST.TXT");
    reader.open(&mut vol).unwrap();
    assert_eq!(reader.length(), 600);
    let mut out = vec![0u8; 600];
    assert_eq!(reader.read(&mut vol, &mut out).unwrap(), 600);
    assert_eq!(out, payload);
    assert!(reader.eof());
    assert!(matches!(reader.read_byte(&mut vol), Err(FsError::EndOfChain)));
}

// Scenario: a miss in a directory spanning three sectors touches each
// sector exactly once and reports the name as not found.
#[test]
fn find_miss_walks_full_directory_once() {
    let mut vol = fat16_volume_with(
        4600,
        FormatOptions {
            root_entries: 48, // three root sectors
            ..FormatOptions::default()
        },
    );
    for i in 0..48 {
        let mut writer = FatFileWriter::new(&mut vol, &format!("F{i:02}.TXT"));
        writer.open(&mut vol).unwrap();
        writer.close(&mut vol).unwrap();
    }

    let mut reader = FatFileReader::new(&mut vol, "MISSING.TXT");
    let reads_before = vol.device().read_count();
    let writes_before = vol.device().write_count();
    assert!(!reader.exists(&mut vol).unwrap());
    assert_eq!(vol.device().read_count() - reads_before, 3);
    assert_eq!(vol.device().write_count(), writes_before);

    assert!(matches!(
        reader.open(&mut vol),
        Err(FsError::FilenameNotFound(_))
    ));
}

// Scenario: removing a file frees its whole chain and tombstones the
// entry; the content bytes stay on disk.
#[test]
fn remove_frees_chain_and_marks_entry() {
    let mut vol = fat16_volume();
    let payload = vec![0x5Au8; 1500];

    let mut writer = FatFileWriter::new(&mut vol, "FILE.BIN");
    writer.open(&mut vol).unwrap();
    writer.write(&mut vol, &payload).unwrap();
    writer.close(&mut vol).unwrap();

    let entry = raw_root_entry(vol.device(), 0, FatType::Fat16);
    let chain = chain_of(&mut vol, entry.first_cluster);
    assert_eq!(chain.len(), 3);

    // A fresh handle locates the entry on its own
    let mut remover = FatFileWriter::new(&mut vol, "FILE.BIN");
    remover.remove(&mut vol).unwrap();

    for cluster in &chain {
        assert_eq!(vol.fat_value(*cluster).unwrap(), 0, "cluster {cluster} not freed");
    }
    let geometry = raw_geometry(vol.device());
    let root = vol.device().sector(SectorAddress(geometry.root_start));
    assert_eq!(root[0], 0xE5);
    // Content bytes are not wiped
    let data = vol.device().sector(SectorAddress(geometry.data_start + chain[0] - 2));
    assert_eq!(data[0], 0x5A);

    let mut reader = FatFileReader::new(&mut vol, "FILE.BIN");
    assert!(!reader.exists(&mut vol).unwrap());
    assert!(matches!(
        reader.open(&mut vol),
        Err(FsError::FilenameNotFound(_))
    ));

    assert!(matches!(
        FatFileWriter::new(&mut vol, "FILE.BIN").remove(&mut vol),
        Err(FsError::FilenameNotFound(_))
    ));
}

// Scenario: two handles over one shared buffer; every handoff flushes
// the other handle's pending sector first, so nothing is lost.
#[test]
fn shared_buffer_handoff_flushes() {
    let mut vol = fat16_volume();
    let shared = SectorBuffer::shared(vol.sector_size());

    let mut a = FatFileWriter::with_buffer(&mut vol, "A.TXT", Rc::clone(&shared));
    let mut b = FatFileWriter::with_buffer(&mut vol, "B.TXT", Rc::clone(&shared));
    a.open(&mut vol).unwrap();
    b.open(&mut vol).unwrap();

    a.write(&mut vol, b"alpha alpha alpha").unwrap();
    // b steals the buffer; a's dirty sector must hit the device
    b.write(&mut vol, b"bravo bravo").unwrap();
    a.seek(SeekFrom::End(0)).unwrap();
    a.write(&mut vol, b" tail").unwrap();

    a.close(&mut vol).unwrap();
    b.close(&mut vol).unwrap();

    let mut out = vec![0u8; 64];
    let mut reader = FatFileReader::new(&mut vol, "A.TXT");
    reader.open(&mut vol).unwrap();
    let n = reader.read(&mut vol, &mut out).unwrap();
    assert_eq!(&out[..n], b"alpha alpha alpha tail");

    let mut reader = FatFileReader::new(&mut vol, "B.TXT");
    reader.open(&mut vol).unwrap();
    let n = reader.read(&mut vol, &mut out).unwrap();
    assert_eq!(&out[..n], b"bravo bravo");
}

#[test]
fn dirty_sector_is_flushed_before_reposition() {
    let mut vol = fat16_volume();
    let mut writer = FatFileWriter::new(&mut vol, "X.TXT");
    writer.open(&mut vol).unwrap();
    writer.write(&mut vol, &[0xAB; 10]).unwrap();

    let entry = raw_root_entry(vol.device(), 0, FatType::Fat16);
    let geometry = raw_geometry(vol.device());
    let data_sector = SectorAddress(geometry.data_start + entry.first_cluster - 2);
    // Still buffered, not on the device yet
    assert_eq!(vol.device().sector(data_sector)[0], 0);

    // Any reposition (here: a directory scan) must flush first
    assert!(writer.exists(&mut vol).unwrap());
    assert_eq!(vol.device().sector(data_sector)[0], 0xAB);

    writer.close(&mut vol).unwrap();
}

#[test]
fn root_run_traversal_is_bounded() {
    let mut vol = fat16_volume(); // 512 root entries, 32 root sectors
    let mut buf = SectorBuffer::new(vol.sector_size());
    vol.reload_directory_start(&mut buf).unwrap();

    for _ in 0..31 {
        vol.load_next_sector(&mut buf).unwrap();
    }
    assert!(matches!(
        vol.load_next_sector(&mut buf),
        Err(FsError::EndOfChain)
    ));
    // Position is unchanged after the refusal
    assert_eq!(buf.meta().position.cluster, FAT16_ROOT);
    assert_eq!(buf.meta().position.sector_offset, 31);
}

#[test]
fn chain_traversal_stops_on_last_real_cluster() {
    let mut vol = fat16_volume();
    vol.set_fat_value(10, 11).unwrap();
    vol.set_fat_value(11, 0xFFFF).unwrap();

    let mut buf = SectorBuffer::new(vol.sector_size());
    let start = vol.position_of(10).unwrap();
    vol.reposition(&mut buf, BufferOwner::Directory, start).unwrap();

    vol.load_next_sector(&mut buf).unwrap();
    assert_eq!(buf.meta().position.cluster, 11);
    assert!(matches!(
        vol.load_next_sector(&mut buf),
        Err(FsError::EndOfChain)
    ));
    assert_eq!(buf.meta().position.cluster, 11);
}

#[test]
fn loading_from_an_eoc_position_is_an_error() {
    let mut vol = fat16_volume();
    let mut buf = SectorBuffer::new(vol.sector_size());
    buf.meta_mut().position = ChainPosition {
        cluster: 0xFFFF,
        cluster_start: SectorAddress(0),
        sector_offset: 0,
        next_cluster: 0xFFFF,
    };
    assert!(matches!(
        vol.load_next_sector(&mut buf),
        Err(FsError::ReadingPastEoc)
    ));
}

#[test]
fn find_empty_space_wraps_around() {
    let mut vol = fat16_volume();
    let last = vol.cluster_count() + 1;
    vol.set_fat_value(last, 0xFFFF).unwrap();
    assert_eq!(vol.find_empty_space(last).unwrap(), 2);
}

#[test]
fn full_volume_reports_volume_full() {
    let mut vol = fat16_volume();
    for cluster in 2..vol.cluster_count() + 2 {
        vol.set_fat_value(cluster, 0xFFFF).unwrap();
    }
    assert!(matches!(
        vol.find_empty_space(2),
        Err(FsError::VolumeFull)
    ));
}

#[test]
fn clear_chain_rejects_cycles() {
    let mut vol = fat16_volume();
    vol.set_fat_value(10, 11).unwrap();
    vol.set_fat_value(11, 10).unwrap();
    assert!(matches!(
        vol.clear_chain(10),
        Err(FsError::CorruptChain(10))
    ));
}

#[test]
fn lazy_allocation_waits_for_first_write() {
    let mut vol = fat16_volume();
    let mut writer = FatFileWriter::new(&mut vol, "EMPTY.DAT");
    writer.open(&mut vol).unwrap();
    writer.close(&mut vol).unwrap();

    let entry = raw_root_entry(vol.device(), 0, FatType::Fat16);
    assert_eq!(entry.name, "EMPTY.DAT");
    assert_eq!(entry.first_cluster, 0);
    assert_eq!(entry.length, 0);
    // No cluster was consumed
    for cluster in 2..12 {
        assert_eq!(vol.fat_value(cluster).unwrap(), 0);
    }

    writer.open(&mut vol).unwrap();
    writer.write_byte(&mut vol, 0x42).unwrap();
    writer.close(&mut vol).unwrap();

    let entry = raw_root_entry(vol.device(), 0, FatType::Fat16);
    assert!(entry.first_cluster >= 2);
    assert_eq!(entry.length, 1);
    let fat_entry = vol.fat_value(entry.first_cluster).unwrap();
    assert!(vol.is_eoc(fat_entry));
}

#[test]
fn append_grows_length_but_overwrite_does_not() {
    let mut vol = fat16_volume();
    let mut writer = FatFileWriter::new(&mut vol, "LOG.TXT");
    writer.open(&mut vol).unwrap();
    writer.write(&mut vol, b"0123456789").unwrap();
    writer.close(&mut vol).unwrap();
    assert_eq!(writer.length(), 10);

    let mut writer = FatFileWriter::new(&mut vol, "LOG.TXT");
    writer.open(&mut vol).unwrap();
    writer.write(&mut vol, b"abc").unwrap(); // overwrite in place
    assert_eq!(writer.length(), 10);
    writer.seek(SeekFrom::End(0)).unwrap();
    writer.write(&mut vol, b"XY").unwrap(); // append
    writer.close(&mut vol).unwrap();

    let entry = raw_root_entry(vol.device(), 0, FatType::Fat16);
    assert_eq!(entry.length, 12);

    let mut reader = FatFileReader::new(&mut vol, "LOG.TXT");
    reader.open(&mut vol).unwrap();
    let mut out = vec![0u8; 16];
    let n = reader.read(&mut vol, &mut out).unwrap();
    assert_eq!(&out[..n], b"abc3456789XY");
}

// A reopened handle starts walked to the first cluster, not the tail.
// Appending at an exact cluster boundary must still extend the chain.
#[test]
fn append_at_a_cluster_boundary_extends_the_chain() {
    let mut vol = fat16_volume();
    let payload = vec![0x11u8; 1024]; // exactly two 512-byte clusters

    let mut writer = FatFileWriter::new(&mut vol, "EDGE.BIN");
    writer.open(&mut vol).unwrap();
    writer.write(&mut vol, &payload).unwrap();
    writer.close(&mut vol).unwrap();

    let mut writer = FatFileWriter::new(&mut vol, "EDGE.BIN");
    writer.open(&mut vol).unwrap();
    writer.seek(SeekFrom::End(0)).unwrap();
    writer.write_byte(&mut vol, 0x22).unwrap();
    writer.close(&mut vol).unwrap();

    let entry = raw_root_entry(vol.device(), 0, FatType::Fat16);
    assert_eq!(entry.length, 1025);
    assert_eq!(chain_of(&mut vol, entry.first_cluster).len(), 3);

    let mut reader = FatFileReader::new(&mut vol, "EDGE.BIN");
    reader.open(&mut vol).unwrap();
    reader.seek(SeekFrom::Start(1024)).unwrap();
    assert_eq!(reader.read_byte(&mut vol).unwrap(), 0x22);
}

#[test]
fn seek_is_bounded_by_length() {
    let mut vol = fat16_volume();
    let mut writer = FatFileWriter::new(&mut vol, "S.DAT");
    writer.open(&mut vol).unwrap();
    writer.write(&mut vol, &[1, 2, 3, 4]).unwrap();
    writer.close(&mut vol).unwrap();

    let mut reader = FatFileReader::new(&mut vol, "S.DAT");
    reader.open(&mut vol).unwrap();
    assert_eq!(reader.seek(SeekFrom::End(0)).unwrap(), 4);
    assert!(reader.eof());
    assert_eq!(reader.seek(SeekFrom::Start(2)).unwrap(), 2);
    assert_eq!(reader.read_byte(&mut vol).unwrap(), 3);
    assert!(matches!(
        reader.seek(SeekFrom::Start(5)),
        Err(FsError::SeekOutOfRange)
    ));
    assert!(matches!(
        reader.seek(SeekFrom::Current(-100)),
        Err(FsError::SeekOutOfRange)
    ));
}

#[test]
fn random_access_reads_across_clusters() {
    let mut vol = fat16_volume();
    let mut rng = StdRng::seed_from_u64(7);
    let payload: Vec<u8> = (0..2000).map(|_| rng.gen()).collect();

    let mut writer = FatFileWriter::new(&mut vol, "RAND.BIN");
    writer.open(&mut vol).unwrap();
    writer.write(&mut vol, &payload).unwrap();
    writer.close(&mut vol).unwrap();

    let mut reader = FatFileReader::new(&mut vol, "RAND.BIN");
    reader.open(&mut vol).unwrap();
    // Jump backwards and forwards over cluster boundaries
    for &offset in &[1500u32, 0, 600, 1999, 512, 1023] {
        reader.seek(SeekFrom::Start(offset as u64)).unwrap();
        assert_eq!(
            reader.read_byte(&mut vol).unwrap(),
            payload[offset as usize],
            "byte at {offset}"
        );
    }
    reader.seek(SeekFrom::Start(0)).unwrap();
    let mut out = vec![0u8; 2000];
    assert_eq!(reader.read(&mut vol, &mut out).unwrap(), 2000);
    assert_eq!(out, payload);
}

#[test]
fn open_new_refuses_existing_file() {
    let mut vol = fat16_volume();
    let mut writer = FatFileWriter::new(&mut vol, "DUP.TXT");
    writer.open(&mut vol).unwrap();
    writer.close(&mut vol).unwrap();

    let mut second = FatFileWriter::new(&mut vol, "DUP.TXT");
    assert!(matches!(
        second.open_new(&mut vol),
        Err(FsError::FileAlreadyExists(_))
    ));
}

#[test]
fn opening_a_directory_entry_as_file_fails() {
    init_logging();
    let mut device = MemoryDevice::new(4600);
    format_fat16(&mut device, &FormatOptions::default()).unwrap();
    // Hand-craft a subdirectory entry in the first root slot
    let geometry = raw_geometry(&device);
    let mut root = device.sector(SectorAddress(geometry.root_start)).to_vec();
    root[..11].copy_from_slice(b"SUBDIR     ");
    root[dir_entry::ATTRIBUTES_OFFSET] = attributes::SUB_DIR;
    device.write_sector(SectorAddress(geometry.root_start), &root).unwrap();

    let mut vol = FatVolume::mount(device).unwrap();
    let mut reader = FatFileReader::new(&mut vol, "SUBDIR");
    assert!(matches!(reader.open(&mut vol), Err(FsError::NotAFile(_))));
}

#[test]
fn creating_with_invalid_name_fails() {
    let mut vol = fat16_volume();
    let mut writer = FatFileWriter::new(&mut vol, "THIS NAME IS BAD");
    assert!(matches!(
        writer.open(&mut vol),
        Err(FsError::InvalidFilename(_))
    ));
}

#[test]
fn handle_names_are_uppercased() {
    let mut vol = fat16_volume();
    let mut writer = FatFileWriter::new(&mut vol, "mixed.txt");
    writer.open(&mut vol).unwrap();
    writer.close(&mut vol).unwrap();

    let mut reader = FatFileReader::new(&mut vol, "MIXED.TXT");
    assert!(reader.exists(&mut vol).unwrap());
    assert_eq!(raw_root_entry(vol.device(), 0, FatType::Fat16).name, "MIXED.TXT");
}

#[test]
fn deleted_entries_are_skipped_not_reused() {
    let mut vol = fat16_volume();
    for name in ["ONE.TXT", "TWO.TXT"] {
        let mut writer = FatFileWriter::new(&mut vol, name);
        writer.open(&mut vol).unwrap();
        writer.close(&mut vol).unwrap();
    }
    FatFileWriter::new(&mut vol, "ONE.TXT").remove(&mut vol).unwrap();

    let mut writer = FatFileWriter::new(&mut vol, "THREE.TXT");
    writer.open(&mut vol).unwrap();
    writer.close(&mut vol).unwrap();

    // The tombstone stays; the new entry landed in the terminator slot
    assert_eq!(raw_root_entry(vol.device(), 1, FatType::Fat16).name, "TWO.TXT");
    assert_eq!(raw_root_entry(vol.device(), 2, FatType::Fat16).name, "THREE.TXT");
    let geometry = raw_geometry(vol.device());
    assert_eq!(vol.device().sector(SectorAddress(geometry.root_start))[0], 0xE5);

    let mut reader = FatFileReader::new(&mut vol, "TWO.TXT");
    assert!(reader.exists(&mut vol).unwrap());
}

#[test]
fn fat16_root_cannot_grow() {
    let mut vol = fat16_volume_with(
        4600,
        FormatOptions {
            root_entries: 16, // a single root sector
            ..FormatOptions::default()
        },
    );
    for i in 0..16 {
        let mut writer = FatFileWriter::new(&mut vol, &format!("R{i:02}.TXT"));
        writer.open(&mut vol).unwrap();
        writer.close(&mut vol).unwrap();
    }
    let mut writer = FatFileWriter::new(&mut vol, "OVER.TXT");
    assert!(matches!(
        writer.open(&mut vol),
        Err(FsError::DirectoryFull)
    ));
}

#[test]
fn fat32_root_directory_grows_by_a_cluster() {
    let mut vol = fat32_volume();
    assert_eq!(vol.sectors_per_cluster(), 1); // 16 entries per root cluster
    let root_cluster = 2;
    let before = vol.fat_value(root_cluster).unwrap();
    assert!(vol.is_eoc(before));

    for i in 0..17 {
        let mut writer = FatFileWriter::new(&mut vol, &format!("G{i:02}.TXT"));
        writer.open(&mut vol).unwrap();
        writer.close(&mut vol).unwrap();
    }

    // The 17th entry forced a second root cluster
    let next = vol.fat_value(root_cluster).unwrap();
    assert!(!vol.is_eoc(next));
    let after_next = vol.fat_value(next).unwrap();
    assert!(vol.is_eoc(after_next));

    for i in 0..17 {
        let mut reader = FatFileReader::new(&mut vol, &format!("G{i:02}.TXT"));
        assert!(reader.exists(&mut vol).unwrap(), "G{i:02}.TXT lost");
    }
}

#[test]
fn fat32_write_and_read_back() {
    let mut vol = fat32_volume();
    let payload: Vec<u8> = (0..1200u32).map(|i| (i * 7) as u8).collect();

    let mut writer = FatFileWriter::new(&mut vol, "DEEP.BIN");
    writer.open(&mut vol).unwrap();
    writer.write(&mut vol, &payload).unwrap();
    writer.close(&mut vol).unwrap();

    let mut reader = FatFileReader::new(&mut vol, "DEEP.BIN");
    reader.open(&mut vol).unwrap();
    assert_eq!(reader.length(), 1200);
    let mut out = vec![0u8; 1200];
    assert_eq!(reader.read(&mut vol, &mut out).unwrap(), 1200);
    assert_eq!(out, payload);

    FatFileWriter::new(&mut vol, "DEEP.BIN").remove(&mut vol).unwrap();
    let mut reader = FatFileReader::new(&mut vol, "DEEP.BIN");
    assert!(!reader.exists(&mut vol).unwrap());
}

#[test]
fn closed_handles_refuse_io() {
    let mut vol = fat16_volume();
    let mut writer = FatFileWriter::new(&mut vol, "C.TXT");
    assert!(matches!(
        writer.write_byte(&mut vol, 0),
        Err(FsError::FileNotOpen)
    ));
    writer.open(&mut vol).unwrap();
    writer.close(&mut vol).unwrap();
    assert!(matches!(
        writer.write_byte(&mut vol, 0),
        Err(FsError::FileNotOpen)
    ));

    let mut reader = FatFileReader::new(&mut vol, "C.TXT");
    assert!(matches!(reader.read_byte(&mut vol), Err(FsError::FileNotOpen)));
}

#[test]
fn larger_clusters_change_chain_granularity() {
    let mut vol = fat16_volume_with(
        9000,
        FormatOptions {
            sectors_per_cluster: 2,
            ..FormatOptions::default()
        },
    );
    assert_eq!(vol.sectors_per_cluster(), 2);

    let payload = vec![0x33u8; 1500]; // fits two 1024-byte clusters
    let mut writer = FatFileWriter::new(&mut vol, "BIG.DAT");
    writer.open(&mut vol).unwrap();
    writer.write(&mut vol, &payload).unwrap();
    writer.close(&mut vol).unwrap();

    let entry = raw_root_entry(vol.device(), 0, FatType::Fat16);
    assert_eq!(chain_of(&mut vol, entry.first_cluster).len(), 2);

    let mut reader = FatFileReader::new(&mut vol, "BIG.DAT");
    reader.open(&mut vol).unwrap();
    let mut out = vec![0u8; 1500];
    assert_eq!(reader.read(&mut vol, &mut out).unwrap(), 1500);
    assert_eq!(out, payload);
}
