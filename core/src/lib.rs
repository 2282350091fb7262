// Fathom Core - device abstraction and shared error types
//
// This crate defines the block device contract the filesystem engine is
// built on, along with the error enum shared by the whole workspace.

pub mod device;
pub mod error;
pub mod test_utils;

pub use device::{BlockDevice, SectorAddress};
pub use error::FsError;
