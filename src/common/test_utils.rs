//! Test utilities for pagefs

use crate::bank::sim::EepromBank;
use crate::bank::{Device, DeviceAddress, DeviceSet, PagedMemoryBank, SharedBank};
use crate::common::{Result, VolumeOptions};
use crate::fs::registry::CacheManager;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Once};

static TEST_LOGGER_INIT: Once = Once::new();

/// Initialize logging for tests
pub fn init_test_logging() {
    TEST_LOGGER_INIT.call_once(|| {
        let _ = env_logger::builder()
            .filter_level(log::LevelFilter::Debug)
            .is_test(true)
            .try_init();
    });
}

/// Temporary directory helper for tests
pub struct TempDir {
    path: PathBuf,
}

impl TempDir {
    /// Create a new temporary directory
    ///
    /// # Errors
    ///
    /// Returns an error if the temporary directory cannot be created.
    pub fn new() -> Result<Self> {
        let path = std::env::temp_dir().join(format!("pagefs_test_{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&path)?;

        Ok(Self { path })
    }

    /// Get the path to the temporary directory
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Create a file path within the temporary directory
    pub fn file_path<S: AsRef<str>>(&self, filename: S) -> PathBuf {
        self.path.join(filename.as_ref())
    }
}

impl Drop for TempDir {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.path);
    }
}

/// Devices attached for a test.
#[derive(Default)]
pub struct TestDevices {
    /// Lookup handed to the cache manager
    pub set: DeviceSet,
}

impl TestDevices {
    /// No devices yet.
    pub fn new() -> Self {
        Self::default()
    }

    /// Attaches a one-bank device and returns a typed handle on the bank.
    pub fn attach<B: PagedMemoryBank + 'static>(
        &mut self,
        address: DeviceAddress,
        bank: B,
    ) -> Arc<Mutex<B>> {
        let bank = Arc::new(Mutex::new(bank));
        let handle: SharedBank = bank.clone();
        self.set.insert(Device::new(address, vec![handle]));
        bank
    }

    /// Attaches a rewritable device.
    pub fn attach_eeprom(
        &mut self,
        address: DeviceAddress,
        page_length: usize,
        pages: usize,
    ) -> Arc<Mutex<EepromBank>> {
        self.attach(address, EepromBank::new(page_length, pages))
    }

    /// Cache manager over the attached devices with default options.
    ///
    /// # Errors
    ///
    /// Returns an error if the default options fail validation.
    pub fn manager(&self) -> Result<CacheManager> {
        CacheManager::new(Arc::new(self.set.clone()), VolumeOptions::default())
    }
}

/// Deterministic byte pattern of `size` bytes (0, 1, .., 255, 0, ..).
#[allow(clippy::cast_possible_truncation)]
pub fn generate_test_data(size: usize) -> Vec<u8> {
    (0..size).map(|i| (i % 256) as u8).collect()
}

/// Compares file contents, reporting the first differing offset.
///
/// # Panics
///
/// Panics if the slices differ in length or content.
pub fn assert_bytes_equal(actual: &[u8], expected: &[u8], context: &str) {
    assert!(
        actual.len() == expected.len(),
        "{context}: Length mismatch - read {} bytes, wrote {}",
        actual.len(),
        expected.len()
    );
    if let Some(at) = actual.iter().zip(expected).position(|(a, e)| a != e) {
        panic!(
            "{context}: Byte mismatch at offset {at}: read 0x{:02x}, wrote 0x{:02x}",
            actual[at], expected[at]
        );
    }
}
