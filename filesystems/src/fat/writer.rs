// Writable file handle
//
// Creation is lazy: a new entry gets a name, the ARCHIVE attribute, zero
// length and no start cluster. The first written byte allocates a cluster
// and patches the entry, so files that are created but never written cost
// nothing on disk.

use std::io::SeekFrom;
use std::rc::Rc;

use log::debug;

use fathom_core::{BlockDevice, FsError};

use crate::buffer::{BufferOwner, SectorBuffer, SharedBuffer};

use super::dir_entry::{self, attributes, DELETED_MARK, DIR_ENTRY_SIZE, SHORT_NAME_LEN};
use super::file::{scan_directory, FatFile, ScanHit};
use super::volume::FatVolume;

/// Read-write file handle with create-on-open semantics.
pub struct FatFileWriter {
    file: FatFile,
}

impl FatFileWriter {
    /// A handle with its own sector buffer. The name is upper-cased; the
    /// directory is not touched until `open`.
    pub fn new<D: BlockDevice>(vol: &mut FatVolume<D>, name: &str) -> Self {
        let id = vol.next_file_id();
        let buf = SectorBuffer::shared(vol.sector_size());
        FatFileWriter {
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
        FatFileWriter {
            file: FatFile::new(id, name, buffer),
        }
    }

    /// Open the file, creating it if the directory has no entry for the
    /// name. A full directory grows by one cluster when needed.
    pub fn open<D: BlockDevice>(&mut self, vol: &mut FatVolume<D>) -> Result<(), FsError> {
        self.open_impl(vol, false)
    }

    /// Like `open`, but fails if the file already exists.
    pub fn open_new<D: BlockDevice>(&mut self, vol: &mut FatVolume<D>) -> Result<(), FsError> {
        self.open_impl(vol, true)
    }

    fn open_impl<D: BlockDevice>(
        &mut self,
        vol: &mut FatVolume<D>,
        exclusive: bool,
    ) -> Result<(), FsError> {
        if self.file.open {
            return Ok(());
        }
        let scan = {
            let buf = Rc::clone(&self.file.buf);
            let mut buf = buf.borrow_mut();
            scan_directory(vol, &mut buf, &self.file.name)
        };
        match scan {
            Ok(ScanHit::Match(offset)) => {
                if exclusive {
                    return Err(FsError::FileAlreadyExists(self.file.name.clone()));
                }
                self.file.open_existing(vol, offset)
            }
            Ok(ScanHit::EndMarker(offset)) => {
                self.create_entry(offset)?;
                self.file.open_existing(vol, offset)
            }
            // The directory is full through its last cluster; grow it by
            // one and create in the fresh sector. The failed scan left
            // the buffer on the chain's last real sector.
            Err(FsError::EndOfChain) => {
                {
                    let buf = Rc::clone(&self.file.buf);
                    let mut buf = buf.borrow_mut();
                    vol.extend_current_directory(&mut buf)?;
                    vol.load_next_sector(&mut buf)?;
                }
                self.create_entry(0)?;
                self.file.open_existing(vol, 0)
            }
            Err(other) => Err(other),
        }
    }

    /// Write a fresh entry into the slot at `offset` of the buffered
    /// directory sector. Start cluster and length stay zero until the
    /// first write.
    fn create_entry(&mut self, offset: usize) -> Result<(), FsError> {
        let encoded = dir_entry::encode_short_name(&self.file.name)?;
        let buf = Rc::clone(&self.file.buf);
        let mut buf = buf.borrow_mut();
        let slot = &mut buf.data_mut()[offset..offset + DIR_ENTRY_SIZE];
        slot.fill(0);
        slot[..SHORT_NAME_LEN].copy_from_slice(&encoded);
        slot[dir_entry::ATTRIBUTES_OFFSET] = attributes::ARCHIVE;
        buf.mark_dirty();
        debug!("created directory entry for {}", self.file.name);
        Ok(())
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

    pub fn write_byte<D: BlockDevice>(
        &mut self,
        vol: &mut FatVolume<D>,
        value: u8,
    ) -> Result<(), FsError> {
        if !self.file.open {
            return Err(FsError::FileNotOpen);
        }
        self.ensure_capacity(vol)?;
        self.file.load_sector_under_cursor(vol)?;
        let offset = self.file.cursor as usize & (vol.sector_size() - 1);
        self.file.buf.borrow_mut().write_byte(offset, value);
        if self.file.cursor == self.file.length {
            self.file.length += 1;
            self.file.length_modified = true;
        }
        self.file.cursor += 1;
        Ok(())
    }

    pub fn write<D: BlockDevice>(
        &mut self,
        vol: &mut FatVolume<D>,
        data: &[u8],
    ) -> Result<(), FsError> {
        for &byte in data {
            self.write_byte(vol, byte)?;
        }
        Ok(())
    }

    /// Allocate storage for the byte about to be written at the cursor:
    /// the first cluster for a fresh file, or more chain links when the
    /// cursor sits past the cluster currently walked to. The walked-to
    /// cluster need not be the chain tail (a reopened handle starts at
    /// the first cluster), so the walk passes through existing links
    /// before appending.
    fn ensure_capacity<D: BlockDevice>(&mut self, vol: &mut FatVolume<D>) -> Result<(), FsError> {
        if self.file.first_cluster < 2 {
            return self.allocate_first_cluster(vol);
        }
        let required_cluster =
            (self.file.cursor >> vol.sector_shift()) >> vol.sectors_per_cluster_shift();
        if required_cluster <= self.file.cluster_index {
            return Ok(());
        }
        let mut position = self.file.content_position;
        let mut cluster_index = self.file.cluster_index;
        while cluster_index < required_cluster {
            if vol.is_eoc(position.next_cluster) {
                vol.extend_chain(&mut position)?;
            }
            position = vol.position_of(position.next_cluster)?;
            cluster_index += 1;
        }
        self.file.content_position = position;
        self.file.cluster_index = cluster_index;
        Ok(())
    }

    fn allocate_first_cluster<D: BlockDevice>(
        &mut self,
        vol: &mut FatVolume<D>,
    ) -> Result<(), FsError> {
        let cluster = vol.find_empty_space(2)?;
        self.file.first_cluster = cluster;
        self.file.content_position = vol.position_of(cluster)?;
        self.file.sector_index = 0;
        self.file.cluster_index = 0;
        debug!("first write to {}: allocated cluster {cluster}", self.file.name);

        let fat_type = vol.fat_type();
        self.patch_entry(vol, |slot| {
            dir_entry::write_first_cluster(slot, fat_type, cluster)
        })
    }

    /// The directory-entry borrow pattern: flush whatever the buffer
    /// holds, retarget it to the entry's sector, patch one field, flush
    /// again. The buffer is reclaimed lazily by the next data access.
    fn patch_entry<D: BlockDevice>(
        &mut self,
        vol: &mut FatVolume<D>,
        patch: impl FnOnce(&mut [u8]),
    ) -> Result<(), FsError> {
        let buf = Rc::clone(&self.file.buf);
        let mut buf = buf.borrow_mut();
        vol.reposition(&mut buf, BufferOwner::Directory, self.file.dir_position)?;
        let offset = self.file.entry_offset;
        patch(&mut buf.data_mut()[offset..offset + DIR_ENTRY_SIZE]);
        buf.mark_dirty();
        vol.flush_buffer(&mut buf)
    }

    /// Flush buffered data, patch the entry's length if it changed, and
    /// persist pending FAT updates.
    pub fn flush<D: BlockDevice>(&mut self, vol: &mut FatVolume<D>) -> Result<(), FsError> {
        if !self.file.open {
            return Err(FsError::FileNotOpen);
        }
        {
            // Whatever the buffer holds (our data or a freshly created
            // directory entry), it must reach the device.
            let buf = Rc::clone(&self.file.buf);
            let mut buf = buf.borrow_mut();
            vol.flush_buffer(&mut buf)?;
        }
        if self.file.length_modified {
            let length = self.file.length;
            self.patch_entry(vol, |slot| dir_entry::write_length(slot, length))?;
            self.file.length_modified = false;
        }
        vol.flush_fat()
    }

    pub fn close<D: BlockDevice>(&mut self, vol: &mut FatVolume<D>) -> Result<(), FsError> {
        self.flush(vol)?;
        self.file.open = false;
        Ok(())
    }

    /// Delete the file: mark its entry deleted and free its chain. The
    /// content bytes themselves are not wiped. Works on a closed handle
    /// by locating the entry first.
    pub fn remove<D: BlockDevice>(&mut self, vol: &mut FatVolume<D>) -> Result<(), FsError> {
        if !self.file.located {
            let entry_offset = {
                let buf = Rc::clone(&self.file.buf);
                let mut buf = buf.borrow_mut();
                match scan_directory(vol, &mut buf, &self.file.name) {
                    Ok(ScanHit::Match(offset)) => offset,
                    Ok(ScanHit::EndMarker(_)) | Err(FsError::EndOfChain) => {
                        return Err(FsError::FilenameNotFound(self.file.name.clone()))
                    }
                    Err(other) => return Err(other),
                }
            };
            self.file.open_existing(vol, entry_offset)?;
        }

        let first_cluster = self.file.first_cluster;
        {
            let buf = Rc::clone(&self.file.buf);
            let mut buf = buf.borrow_mut();
            vol.reposition(&mut buf, BufferOwner::Directory, self.file.dir_position)?;
            buf.write_byte(self.file.entry_offset, DELETED_MARK);
            vol.flush_buffer(&mut buf)?;
        }
        if first_cluster >= 2 {
            vol.clear_chain(first_cluster)?;
            vol.flush_fat()?;
        }

        self.file.open = false;
        self.file.located = false;
        self.file.length_modified = false;
        debug!("removed {}", self.file.name);
        Ok(())
    }

    pub fn read_byte<D: BlockDevice>(&mut self, vol: &mut FatVolume<D>) -> Result<u8, FsError> {
        self.file.read_byte(vol)
    }

    pub fn seek(&mut self, from: SeekFrom) -> Result<u32, FsError> {
        self.file.seek(from)
    }

    pub fn tell(&self) -> u32 {
        self.file.cursor
    }

    pub fn length(&self) -> u32 {
        self.file.length
    }

    pub fn name(&self) -> &str {
        &self.file.name
    }
}
