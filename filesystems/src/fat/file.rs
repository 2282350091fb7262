// File handles and directory lookup
//
// `FatFile` is the state shared by the reader and writer handles: the 8.3
// name, the sector buffer, the content cursor and the location of the
// file's directory entry. Handles never borrow the volume; every
// operation takes `&mut FatVolume` so several handles can coexist.

use std::io::SeekFrom;
use std::rc::Rc;

use log::debug;

use fathom_core::{BlockDevice, FsError};

use crate::buffer::{BufferOwner, ChainPosition, SectorBuffer, SharedBuffer};

use super::dir_entry::{
    self, attributes, decode_short_name, DELETED_MARK, DIR_ENTRY_SIZE, END_OF_DIRECTORY,
    SHORT_NAME_LEN,
};
use super::volume::FatVolume;

/// Outcome of a directory scan for one name.
pub(super) enum ScanHit {
    /// The name was found; byte offset of its entry in the buffered sector.
    Match(usize),
    /// The 0x00 terminator was reached first; byte offset of the free slot.
    EndMarker(usize),
}

/// Scan the current directory for `name`, leaving `buf` positioned on the
/// sector holding the result. Deleted entries are skipped; the walk ends
/// at the 0x00 terminator or, for a directory full through its last
/// cluster, with `EndOfChain`.
pub(super) fn scan_directory<D: BlockDevice>(
    vol: &mut FatVolume<D>,
    buf: &mut SectorBuffer,
    name: &str,
) -> Result<ScanHit, FsError> {
    vol.reload_directory_start(buf)?;
    let sector_size = vol.sector_size();
    let mut offset = 0usize;
    loop {
        let first_byte = buf.get_byte(offset);
        if first_byte == END_OF_DIRECTORY {
            return Ok(ScanHit::EndMarker(offset));
        }
        if first_byte != DELETED_MARK {
            let entry_name = decode_short_name(&buf.data()[offset..offset + SHORT_NAME_LEN]);
            if entry_name == name {
                return Ok(ScanHit::Match(offset));
            }
        }
        offset += DIR_ENTRY_SIZE;
        if offset == sector_size {
            vol.load_next_sector(buf)?;
            offset = 0;
        }
    }
}

pub(super) struct FatFile {
    pub(super) id: u32,
    /// Upper-cased 8.3 name.
    pub(super) name: String,
    pub(super) buf: SharedBuffer,

    pub(super) first_cluster: u32,
    /// Chain cursor for the sector currently claimed in the buffer.
    pub(super) content_position: ChainPosition,
    /// Sector index within the file that the cursor maps to.
    pub(super) sector_index: u32,
    /// Cluster index within the file that the cursor maps to.
    pub(super) cluster_index: u32,

    /// Where the file's directory entry lives, for length patching.
    pub(super) dir_position: ChainPosition,
    pub(super) entry_offset: usize,
    /// The entry location above is valid (survives `close`).
    pub(super) located: bool,

    pub(super) length: u32,
    pub(super) cursor: u32,
    pub(super) length_modified: bool,
    pub(super) open: bool,
}

impl FatFile {
    pub(super) fn new(id: u32, name: &str, buf: SharedBuffer) -> Self {
        FatFile {
            id,
            name: name.to_uppercase(),
            buf,
            first_cluster: 0,
            content_position: ChainPosition::UNSET,
            sector_index: 0,
            cluster_index: 0,
            dir_position: ChainPosition::UNSET,
            entry_offset: 0,
            located: false,
            length: 0,
            cursor: 0,
            length_modified: false,
            open: false,
        }
    }

    /// Initialize the handle from the directory entry under `buf` at
    /// `entry_offset`. `buf` must be positioned on the entry's sector.
    pub(super) fn open_existing<D: BlockDevice>(
        &mut self,
        vol: &mut FatVolume<D>,
        entry_offset: usize,
    ) -> Result<(), FsError> {
        let buf = Rc::clone(&self.buf);
        let mut buf = buf.borrow_mut();

        if buf.get_byte(entry_offset + dir_entry::ATTRIBUTES_OFFSET) & attributes::SUB_DIR != 0 {
            return Err(FsError::NotAFile(self.name.clone()));
        }

        self.dir_position = buf.meta().position;
        self.entry_offset = entry_offset;
        self.located = true;

        let slot = &buf.data()[entry_offset..entry_offset + DIR_ENTRY_SIZE];
        self.first_cluster = dir_entry::read_first_cluster(slot, vol.fat_type());
        self.length = dir_entry::read_length(slot);
        self.cursor = 0;
        self.sector_index = 0;
        self.cluster_index = 0;
        self.length_modified = false;

        if self.first_cluster >= 2 {
            self.content_position = vol.position_of(self.first_cluster)?;
            vol.reposition(&mut buf, BufferOwner::File(self.id), self.content_position)?;
        } else {
            // Nothing allocated yet; the buffer stays on the directory
            self.content_position = ChainPosition::UNSET;
        }

        self.open = true;
        debug!(
            "opened {} ({} bytes, first cluster {})",
            self.name, self.length, self.first_cluster
        );
        Ok(())
    }

    /// Make sure the buffer holds the sector the cursor points into,
    /// reclaiming it first if another owner has repositioned it.
    pub(super) fn load_sector_under_cursor<D: BlockDevice>(
        &mut self,
        vol: &mut FatVolume<D>,
    ) -> Result<(), FsError> {
        let target = self.cursor >> vol.sector_shift();
        let owner = BufferOwner::File(self.id);
        let buf = Rc::clone(&self.buf);
        let mut buf = buf.borrow_mut();

        let mut reclaimed = false;
        if !buf.owned_by(owner) {
            vol.flush_buffer(&mut buf)?;
            let meta = buf.meta_mut();
            meta.owner = Some(owner);
            meta.position = self.content_position;
            reclaimed = true;
        }

        if target != self.sector_index {
            self.seek_sector(vol, &mut buf, target)?;
        } else if reclaimed {
            vol.reload_buffer(&mut buf)?;
        }
        Ok(())
    }

    /// Move the buffer to sector `target` of the file, walking the
    /// cluster chain forward from the current cluster, or from the first
    /// cluster when seeking backwards.
    fn seek_sector<D: BlockDevice>(
        &mut self,
        vol: &mut FatVolume<D>,
        buf: &mut SectorBuffer,
        target: u32,
    ) -> Result<(), FsError> {
        vol.flush_buffer(buf)?;
        let spc_shift = vol.sectors_per_cluster_shift();
        let target_cluster = target >> spc_shift;

        let mut position = self.content_position;
        let mut cluster_index = self.cluster_index;
        if target_cluster < cluster_index {
            position = vol.position_of(self.first_cluster)?;
            cluster_index = 0;
        }
        while cluster_index < target_cluster {
            if vol.is_eoc(position.next_cluster) {
                // Handle state is committed only on success
                return Err(FsError::ReadingPastEoc);
            }
            position = vol.position_of(position.next_cluster)?;
            cluster_index += 1;
        }

        position.sector_offset = target & (vol.sectors_per_cluster() - 1);
        self.cluster_index = cluster_index;
        self.sector_index = target;
        self.content_position = position;
        buf.meta_mut().position = position;
        vol.reload_buffer(buf)
    }

    pub(super) fn read_byte<D: BlockDevice>(
        &mut self,
        vol: &mut FatVolume<D>,
    ) -> Result<u8, FsError> {
        if !self.open {
            return Err(FsError::FileNotOpen);
        }
        if self.cursor >= self.length {
            return Err(FsError::EndOfChain);
        }
        self.load_sector_under_cursor(vol)?;
        let offset = self.cursor as usize & (vol.sector_size() - 1);
        let byte = self.buf.borrow().get_byte(offset);
        self.cursor += 1;
        Ok(byte)
    }

    pub(super) fn read<D: BlockDevice>(
        &mut self,
        vol: &mut FatVolume<D>,
        out: &mut [u8],
    ) -> Result<usize, FsError> {
        if !self.open {
            return Err(FsError::FileNotOpen);
        }
        let sector_size = vol.sector_size();
        let mut count = 0;
        while count < out.len() && self.cursor < self.length {
            self.load_sector_under_cursor(vol)?;
            let offset = self.cursor as usize & (sector_size - 1);
            let chunk = (sector_size - offset)
                .min(out.len() - count)
                .min((self.length - self.cursor) as usize);
            out[count..count + chunk]
                .copy_from_slice(&self.buf.borrow().data()[offset..offset + chunk]);
            self.cursor += chunk as u32;
            count += chunk;
        }
        Ok(count)
    }

    /// Move the cursor. The target must land inside the file (or exactly
    /// at its end); the sector itself is loaded lazily on the next access.
    pub(super) fn seek(&mut self, from: SeekFrom) -> Result<u32, FsError> {
        if !self.open {
            return Err(FsError::FileNotOpen);
        }
        let target = match from {
            SeekFrom::Start(offset) => offset as i64,
            SeekFrom::End(offset) => self.length as i64 + offset,
            SeekFrom::Current(offset) => self.cursor as i64 + offset,
        };
        if target < 0 || target > self.length as i64 {
            return Err(FsError::SeekOutOfRange);
        }
        self.cursor = target as u32;
        Ok(self.cursor)
    }
}

/// Read-only file handle.
pub struct FatFileReader {
    file: FatFile,
}

impl FatFileReader {
    /// A handle with its own sector buffer. The name is upper-cased; the
    /// file is not touched until `open`.
    pub fn new<D: BlockDevice>(vol: &mut FatVolume<D>, name: &str) -> Self {
        let id = vol.next_file_id();
        let buf = SectorBuffer::shared(vol.sector_size());
        FatFileReader {
            file: FatFile::new(id, name, buf),
        }
    }

    /// A handle sharing `buffer` with other handles.
    pub fn with_buffer<D: BlockDevice>(
        vol: &mut FatVolume<D>,
        name: &str,
        buffer: SharedBuffer,
    ) -> Self {
        let id = vol.next_file_id();
        FatFileReader {
            file: FatFile::new(id, name, buffer),
        }
    }

    pub fn open<D: BlockDevice>(&mut self, vol: &mut FatVolume<D>) -> Result<(), FsError> {
        let entry_offset = {
            let buf = Rc::clone(&self.file.buf);
            let mut buf = buf.borrow_mut();
            match scan_directory(vol, &mut buf, &self.file.name) {
                Ok(ScanHit::Match(offset)) => offset,
                // A full directory without a match is still "not found"
                Ok(ScanHit::EndMarker(_)) | Err(FsError::EndOfChain) => {
                    return Err(FsError::FilenameNotFound(self.file.name.clone()))
                }
                Err(other) => return Err(other),
            }
        };
        self.file.open_existing(vol, entry_offset)
    }

    /// Whether a file with this handle's name exists in the directory.
    pub fn exists<D: BlockDevice>(&mut self, vol: &mut FatVolume<D>) -> Result<bool, FsError> {
        let buf = Rc::clone(&self.file.buf);
        let mut buf = buf.borrow_mut();
        match scan_directory(vol, &mut buf, &self.file.name) {
            Ok(ScanHit::Match(_)) => Ok(true),
            Ok(ScanHit::EndMarker(_)) | Err(FsError::EndOfChain) => Ok(false),
            Err(other) => Err(other),
        }
    }

    /// Next byte at the cursor; `EndOfChain` signals end-of-file.
    pub fn read_byte<D: BlockDevice>(&mut self, vol: &mut FatVolume<D>) -> Result<u8, FsError> {
        self.file.read_byte(vol)
    }

    /// Fill as much of `out` as the file has left; returns bytes read.
    pub fn read<D: BlockDevice>(
        &mut self,
        vol: &mut FatVolume<D>,
        out: &mut [u8],
    ) -> Result<usize, FsError> {
        self.file.read(vol, out)
    }

    pub fn seek(&mut self, from: SeekFrom) -> Result<u32, FsError> {
        self.file.seek(from)
    }

    pub fn tell(&self) -> u32 {
        self.file.cursor
    }

    pub fn eof(&self) -> bool {
        self.file.cursor >= self.file.length
    }

    pub fn length(&self) -> u32 {
        self.file.length
    }

    pub fn name(&self) -> &str {
        &self.file.name
    }

    pub fn close(&mut self) {
        self.file.open = false;
    }
}
