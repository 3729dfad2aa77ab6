//! Pure functions turning tool output into typed values.
//!
//! Nothing in here runs a process or touches the filesystem.

pub mod diskutil;
pub mod hdiutil;
pub mod rsync;
pub mod wimlib;

pub use rsync::TransferUpdate;
