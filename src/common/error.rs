//! Error handling for pagefs

use thiserror::Error;

/// Common result type for pagefs operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for filesystem, cache and bank operations
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[allow(missing_docs)] // Fields are documented by variant docs
pub enum Error {
    /// The volume has no usable pages
    #[error("volume has no usable memory")]
    NoMemory,

    /// Page index outside `0..total`
    #[error("page {page} out of range (volume has {total} pages)")]
    OutOfRange { page: usize, total: usize },

    /// Malformed or illegal path segment
    #[error("invalid path: {0}")]
    InvalidPath(String),

    /// Packet length byte larger than the page can carry
    #[error("invalid packet length {length} on page {page} (max {max})")]
    InvalidLength { page: usize, length: usize, max: usize },

    /// Packet CRC16 did not check
    #[error("invalid CRC on page {page}")]
    InvalidCrc { page: usize },

    /// Redirect chain on write-once memory loops back on itself
    #[error("circular page redirection starting at page {page}")]
    CircularRedirection { page: usize },

    /// No free page left in the page-usage bitmap
    #[error("out of space")]
    OutOfSpace,

    /// Directory walk did not find the entry
    #[error("path not found: {0}")]
    PathNotFound(String),

    /// Path already has a writer
    #[error("already open for write: {0}")]
    AlreadyOpenForWrite(String),

    /// Root header or marker combination is not a valid filesystem
    #[error("invalid filesystem: {0}")]
    InvalidFilesystem(String),

    /// Device bitmap did not read back what was written
    #[error("readback verification failed at bitmap byte {index}")]
    ReadbackVerificationFailed { index: usize },

    /// Bank or transport failure
    #[error("I/O error: {0}")]
    Io(String),

    /// Entry already exists
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Operation needs a directory
    #[error("not a directory: {0}")]
    NotADirectory(String),

    /// Operation needs a file
    #[error("not a file: {0}")]
    NotAFile(String),

    /// Directory still has entries
    #[error("directory not empty: {0}")]
    DirectoryNotEmpty(String),

    /// Entry carries the read-only bit
    #[error("read-only: {0}")]
    ReadOnly(String),

    /// `reset()` without a valid mark
    #[error("mark invalidated")]
    MarkInvalidated,

    /// Write-once page needs bits set and its bank cannot redirect
    #[error("page {page} cannot be rewritten and its bank does not support redirection")]
    RedirectUnsupported { page: usize },

    /// Bank/device combination that cannot form a volume
    #[error("invalid volume topology: {0}")]
    InvalidTopology(String),

    /// Device named by the volume is not attached
    #[error("device {0:016X} is not available")]
    DeviceUnavailable(u64),

    /// Rejected configuration
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}

impl From<Error> for std::io::Error {
    fn from(err: Error) -> Self {
        let kind = match err {
            Error::PathNotFound(_) => std::io::ErrorKind::NotFound,
            Error::AlreadyExists(_) => std::io::ErrorKind::AlreadyExists,
            Error::ReadOnly(_) => std::io::ErrorKind::PermissionDenied,
            Error::InvalidPath(_) | Error::MarkInvalidated => std::io::ErrorKind::InvalidInput,
            Error::InvalidCrc { .. } | Error::InvalidLength { .. } => std::io::ErrorKind::InvalidData,
            _ => std::io::ErrorKind::Other,
        };
        std::io::Error::new(kind, err)
    }
}

impl Error {
    /// Create an I/O error
    pub fn io<S: Into<String>>(msg: S) -> Self {
        Error::Io(msg.into())
    }

    /// Create an invalid path error
    pub fn invalid_path<S: Into<String>>(msg: S) -> Self {
        Error::InvalidPath(msg.into())
    }

    /// Create a path-not-found error
    pub fn not_found<S: Into<String>>(path: S) -> Self {
        Error::PathNotFound(path.into())
    }

    /// Create an invalid filesystem error
    pub fn invalid_filesystem<S: Into<String>>(msg: S) -> Self {
        Error::InvalidFilesystem(msg.into())
    }

    /// Create an invalid topology error
    pub fn invalid_topology<S: Into<String>>(msg: S) -> Self {
        Error::InvalidTopology(msg.into())
    }

    /// Check if this is an I/O error
    pub fn is_io(&self) -> bool {
        matches!(self, Error::Io(_))
    }

    /// Check if this is a corrupt-packet error
    pub fn is_corruption(&self) -> bool {
        matches!(self, Error::InvalidCrc { .. } | Error::InvalidLength { .. })
    }

    /// Check if this is a not found error
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::PathNotFound(_))
    }

    /// Fatal errors leave the volume unusable until an operator reformats it;
    /// they are never retried.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::CircularRedirection { .. }
                | Error::InvalidFilesystem(_)
                | Error::ReadbackVerificationFailed { .. }
                | Error::RedirectUnsupported { .. }
                | Error::InvalidTopology(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let io_err = Error::io("adapter reset");
        assert!(io_err.is_io());
        assert!(!io_err.is_fatal());

        let crc_err = Error::InvalidCrc { page: 3 };
        assert!(crc_err.is_corruption());
        assert!(!crc_err.is_fatal());

        let not_found_err = Error::not_found("/DOC/TEXT.0");
        assert!(not_found_err.is_not_found());

        assert!(Error::CircularRedirection { page: 1 }.is_fatal());
        assert!(Error::invalid_filesystem("bad marker").is_fatal());
    }

    #[test]
    fn test_error_display() {
        let error = Error::OutOfRange { page: 9, total: 4 };
        assert_eq!(error.to_string(), "page 9 out of range (volume has 4 pages)");

        let error = Error::OutOfSpace;
        assert_eq!(error.to_string(), "out of space");

        let error = Error::DeviceUnavailable(0x2D);
        assert_eq!(error.to_string(), "device 000000000000002D is not available");
    }

    #[test]
    fn test_error_from_std_io() {
        let io_error = std::io::Error::new(std::io::ErrorKind::NotFound, "File not found");
        let err: Error = io_error.into();
        assert!(err.is_io());
    }

    #[test]
    fn test_error_into_std_io() {
        let io_error: std::io::Error = Error::not_found("/A").into();
        assert_eq!(io_error.kind(), std::io::ErrorKind::NotFound);

        let io_error: std::io::Error = Error::ReadOnly("/A".into()).into();
        assert_eq!(io_error.kind(), std::io::ErrorKind::PermissionDenied);
    }
}
