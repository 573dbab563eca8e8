//! pagefs - page-based filesystem for paged non-volatile memory
//!
//! pagefs layers directories, files and free-space accounting over
//! byte-addressable memory that is organized in pages:
//! - rewritable (EEPROM-like) pages
//! - write-once (OTP/EPROM) pages whose bits only ever clear, with or
//!   without device-level page redirection
//! - volumes spanning several devices joined by a persisted device map
//!
//! All physical writes are deferred in a per-volume page cache until an
//! explicit `sync()`.

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

// Core modules
pub mod bank;
pub mod common;
pub mod fs;
pub mod storage;

// Re-exports for convenience
pub use bank::{DeviceAddress, DeviceLookup, DeviceSet, PagedMemoryBank};
pub use common::{Error, Result, VolumeOptions};
pub use fs::handle::FileHandle;
pub use fs::registry::CacheManager;
pub use fs::volume::Volume;

/// Version information
pub const VERSION_MAJOR: u32 = 0;
/// Version information
pub const VERSION_MINOR: u32 = 1;
/// Version information
pub const VERSION_PATCH: u32 = 0;
/// Version string
pub const VERSION: &str = "0.1.0";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert_eq!(VERSION, "0.1.0");
        assert_eq!(VERSION_MAJOR, 0);
        assert_eq!(VERSION_MINOR, 1);
        assert_eq!(VERSION_PATCH, 0);
    }
}
