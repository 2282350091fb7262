// FAT16/FAT32 filesystem engine

pub mod dir_entry;
pub mod file;
pub mod format;
pub mod volume;
pub mod writer;

pub use dir_entry::DirEntry;
pub use file::FatFileReader;
pub use format::{format_fat16, format_fat32, FormatOptions};
pub use volume::{FatType, FatVolume};
pub use writer::FatFileWriter;

#[cfg(test)]
mod tests;
