// Error types for fathom operations

use thiserror::Error;

#[derive(Debug, Error)]
pub enum FsError {
    #[error("Filename not found: {0}")]
    FilenameNotFound(String),

    /// Reached the end of a cluster chain. During a directory scan this
    /// means the directory is full through its last cluster; during a
    /// sequential read it is plain end-of-file.
    #[error("End of cluster chain")]
    EndOfChain,

    /// The current position already sits on an end-of-chain value, so
    /// there is no sector to load. Indicates caller misuse.
    #[error("Attempted to read past the end of a cluster chain")]
    ReadingPastEoc,

    #[error("Invalid 8.3 filename: {0}")]
    InvalidFilename(String),

    #[error("File already exists: {0}")]
    FileAlreadyExists(String),

    #[error("File is not open")]
    FileNotOpen,

    #[error("Entry is a directory, not a file: {0}")]
    NotAFile(String),

    #[error("No free clusters left on the volume")]
    VolumeFull,

    #[error("Directory cannot hold any more entries")]
    DirectoryFull,

    #[error("Cluster {0} is outside the volume's data region")]
    InvalidCluster(u32),

    #[error("Cannot append to a cluster that is not the end of its chain")]
    InvalidFatAppend,

    #[error("Cluster chain starting at {0} is corrupt or cyclic")]
    CorruptChain(u32),

    #[error("Seek position is outside the file")]
    SeekOutOfRange,

    #[error("Unsupported filesystem: {0}")]
    UnsupportedFilesystem(String),

    #[error("Unsupported sectors-per-cluster value: {0}")]
    UnsupportedSectorsPerCluster(u8),

    #[error("Unsupported FAT count: {0}")]
    UnsupportedFatCount(u8),

    #[error("Partition {0} not found")]
    PartitionNotFound(u8),

    #[error("Sector {sector} is beyond the end of the device")]
    DeviceRange { sector: u32 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
