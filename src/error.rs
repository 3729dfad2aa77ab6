//! Error types for winboot operations.

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for the creation engine and its services.
#[derive(Error, Debug)]
pub enum Error {
    /// The external process could not be spawned at all.
    #[error("Failed to run {program}: {source}")]
    Execution {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// Privileged execution was declined or cancelled by the user.
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Reserved. No operation currently enforces a timeout.
    #[error("Command timed out")]
    Timeout,

    #[error("Image file not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error("WIM file not found: {}", .0.display())]
    SourceNotFound(PathBuf),

    #[error("Invalid format: {0}")]
    InvalidFormat(String),

    /// A required external tool is not installed.
    #[error("{0} is not installed")]
    ToolMissing(String),

    #[error("Failed to list drives: {0}")]
    DiskListFailed(String),

    #[error("Failed to format drive: {0}")]
    FormatFailed(String),

    #[error("Failed to unmount drive: {0}")]
    UnmountFailed(String),

    #[error("Failed to eject drive: {0}")]
    EjectFailed(String),

    #[error("Failed to mount image: {0}")]
    ImageMountFailed(String),

    #[error("Failed to unmount image: {0}")]
    ImageUnmountFailed(String),

    #[error("File copy failed: {0}")]
    CopyFailed(String),

    #[error("Failed to split WIM file: {0}")]
    SplitFailed(String),

    #[error("Failed to get WIM info: {0}")]
    WimInfoFailed(String),

    #[error("No files to copy")]
    NoFilesToCopy,

    /// User-initiated abort.
    #[error("Operation cancelled by user")]
    Cancelled,

    #[error("This does not appear to be a valid Windows installation image")]
    NotAValidImage,

    #[error("USB drive is not mounted after formatting")]
    UsbNotMounted,

    /// A creation run is already in flight.
    #[error("A creation run is already in progress")]
    AlreadyRunning,

    #[error("{0}")]
    MissingSelection(String),

    #[error("Drive {device} is too small: {size} bytes, at least {minimum} bytes required")]
    DriveTooSmall { device: String, size: u64, minimum: u64 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// True when the failure came from a tool binary that does not resolve.
    pub fn is_missing_program(&self) -> bool {
        matches!(self, Error::Execution { source, .. } if source.kind() == std::io::ErrorKind::NotFound)
    }
}

/// Result type alias using the winboot error type
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::NotFound(PathBuf::from("/path/to/win.iso"));
        assert!(err.to_string().contains("/path/to/win.iso"));

        let err = Error::Cancelled;
        assert!(err.to_string().contains("cancelled"));

        let err = Error::FormatFailed("resource busy".to_string());
        assert_eq!(err.to_string(), "Failed to format drive: resource busy");
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::Other, "test");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn test_missing_program_detection() {
        let err = Error::Execution {
            program: "wimlib-imagex".to_string(),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "no such file"),
        };
        assert!(err.is_missing_program());

        let err = Error::Execution {
            program: "rsync".to_string(),
            source: std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        };
        assert!(!err.is_missing_program());
        assert!(!Error::Cancelled.is_missing_program());
    }

    #[test]
    fn test_drive_too_small_display() {
        let err = Error::DriveTooSmall {
            device: "/dev/disk4".to_string(),
            size: 4096,
            minimum: 8192,
        };
        let msg = err.to_string();
        assert!(msg.contains("/dev/disk4"));
        assert!(msg.contains("4096"));
        assert!(msg.contains("8192"));
    }
}
