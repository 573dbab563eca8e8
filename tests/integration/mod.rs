//! Integration test framework for pagefs
//!
//! Shared setup for the tests in `tests/`: simulated devices, a cache
//! manager over them, a scratch directory for bank images and error
//! assertions.

#![allow(dead_code)]

use pagefs::common::test_utils::{init_test_logging, TempDir, TestDevices};
use pagefs::common::{Error, Result};
use pagefs::{CacheManager, DeviceAddress, Volume};
use std::path::{Path, PathBuf};

/// Integration test environment
pub struct TestEnvironment {
    /// Temporary directory for bank images
    pub temp_dir: TempDir,
    /// Simulated devices
    pub devices: TestDevices,
}

impl TestEnvironment {
    /// Create a new test environment
    pub fn new() -> Result<Self> {
        init_test_logging();

        Ok(Self {
            temp_dir: TempDir::new()?,
            devices: TestDevices::new(),
        })
    }

    /// Path for a bank image file
    pub fn image_path(&self, name: &str) -> PathBuf {
        self.temp_dir.file_path(name)
    }

    /// Get the temp directory path
    pub fn temp_path(&self) -> &Path {
        self.temp_dir.path()
    }

    /// Cache manager over the devices attached so far
    pub fn manager(&self) -> Result<CacheManager> {
        self.devices.manager()
    }
}

/// Mounts and formats the volume of `address`.
pub fn formatted(manager: &CacheManager, address: DeviceAddress) -> Result<Volume> {
    let volume = manager.mount(address)?;
    volume.format()?;
    Ok(volume)
}

/// Writes `data` to a new file and closes it (which syncs).
pub fn write_file(volume: &Volume, path: &str, data: &[u8]) -> Result<()> {
    let mut handle = volume.create(path, false, true)?;
    handle.write(data)?;
    handle.close()
}

/// Reads a whole file.
pub fn read_file(volume: &Volume, path: &str) -> Result<Vec<u8>> {
    let mut handle = volume.open(path)?;
    let mut out = Vec::new();
    let mut buf = [0u8; 64];
    loop {
        let n = handle.read(&mut buf)?;
        if n == 0 {
            return Ok(out);
        }
        out.extend_from_slice(&buf[..n]);
    }
}

/// Helper for testing error conditions
pub struct ErrorTester;

impl ErrorTester {
    /// Test that a function returns a specific error type
    pub fn assert_error_type<T, F>(func: F, expected_predicate: fn(&Error) -> bool)
    where
        F: FnOnce() -> Result<T>,
    {
        let Err(error) = func() else {
            panic!("Expected error, got success");
        };
        assert!(
            expected_predicate(&error),
            "Error type mismatch. Got: {:?}",
            error
        );
    }

    /// Test that a function fails with `PathNotFound`
    pub fn assert_not_found<T, F>(func: F)
    where
        F: FnOnce() -> Result<T>,
    {
        Self::assert_error_type(func, Error::is_not_found);
    }

    /// Test that a function fails with an error that needs a reformat
    pub fn assert_fatal<T, F>(func: F)
    where
        F: FnOnce() -> Result<T>,
    {
        Self::assert_error_type(func, Error::is_fatal);
    }

    /// Test that a function returns a corruption error
    pub fn assert_corruption_error<T, F>(func: F)
    where
        F: FnOnce() -> Result<T>,
    {
        Self::assert_error_type(func, Error::is_corruption);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_environment_creation() {
        let env = TestEnvironment::new().expect("Should create test environment");
        assert!(env.temp_path().is_dir());
        assert!(env.image_path("a.img").starts_with(env.temp_path()));
    }

    #[test]
    fn test_error_tester() {
        ErrorTester::assert_not_found(|| -> Result<()> { Err(Error::not_found("/X")) });
        ErrorTester::assert_fatal(|| -> Result<()> { Err(Error::invalid_filesystem("bad")) });
        ErrorTester::assert_corruption_error(|| -> Result<()> {
            Err(Error::InvalidCrc { page: 3 })
        });
    }

    #[test]
    fn test_formatted_volume() {
        let mut env = TestEnvironment::new().expect("Should create test environment");
        env.devices.attach_eeprom(1, 32, 16);
        let manager = env.manager().unwrap();
        let volume = formatted(&manager, 1).unwrap();
        write_file(&volume, "/A/B", b"xyz").unwrap();
        assert_eq!(read_file(&volume, "/A/B").unwrap(), b"xyz");
    }
}
