// Fathom Filesystems - FAT16/FAT32 engine over generic block storage
//
// The engine keeps exactly one data sector in memory per file handle and
// one FAT sector per volume, so it runs in a few hundred bytes of state.
// All persistence goes through the `fathom_core::BlockDevice` trait.

pub mod buffer;
pub mod fat;

pub use buffer::{BufferOwner, ChainPosition, SectorBuffer, SharedBuffer, FAT16_ROOT};
pub use fat::{
    format_fat16, format_fat32, FatFileReader, FatFileWriter, FatType, FatVolume, FormatOptions,
};
