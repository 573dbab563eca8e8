//! Cache manager
//!
//! Maps device addresses to the live [`Volume`] built over them, so every
//! handle opened against a device shares one page cache. Entries are weak:
//! a volume is torn down when its last clone or handle is dropped, and the
//! stale entry is pruned on the next mount.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::bank::{DeviceAddress, DeviceLookup};
use crate::common::config::VolumeOptions;
use crate::common::error::Result;
use crate::fs::handle::FileHandle;
use crate::fs::volume::{Volume, WeakVolume};
use crate::{pagefs_debug, pagefs_info};

/// Owner of every mounted volume of one device lookup.
pub struct CacheManager {
    lookup: Arc<dyn DeviceLookup>,
    options: VolumeOptions,
    volumes: Mutex<HashMap<DeviceAddress, WeakVolume>>,
}

impl CacheManager {
    /// Creates a manager mounting devices found through `lookup`.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidConfig` if `options` do not validate.
    pub fn new(lookup: Arc<dyn DeviceLookup>, options: VolumeOptions) -> Result<Self> {
        options.validate()?;
        Ok(Self {
            lookup,
            options,
            volumes: Mutex::new(HashMap::new()),
        })
    }

    /// Options every volume is mounted with.
    pub fn options(&self) -> &VolumeOptions {
        &self.options
    }

    /// The volume whose devices include `address`, mounting it if needed.
    ///
    /// # Errors
    ///
    /// See [`mount_devices`](Self::mount_devices).
    pub fn mount(&self, address: DeviceAddress) -> Result<Volume> {
        self.mount_devices(&[address])
    }

    /// The volume over `addresses` (master first). A satellite or stale
    /// device list is corrected from the media, so the returned volume may
    /// span other devices than asked for.
    ///
    /// # Errors
    ///
    /// `DeviceUnavailable`, `InvalidTopology`, `InvalidFilesystem`, or a
    /// bank error reading the root page.
    pub fn mount_devices(&self, addresses: &[DeviceAddress]) -> Result<Volume> {
        let mut volumes = self.volumes.lock();
        volumes.retain(|_, weak| weak.is_live());

        if let Some(volume) = addresses
            .first()
            .and_then(|address| volumes.get(address))
            .and_then(WeakVolume::upgrade)
        {
            pagefs_debug!("Reusing mounted volume for {:016X?}", addresses);
            return Ok(volume);
        }

        let volume = Volume::mount(self.lookup.as_ref(), addresses, &self.options)?;
        let devices = volume.devices();
        for &address in &devices {
            volumes.insert(address, volume.downgrade());
        }
        // Satellite addresses the caller used resolve to the same volume
        for &address in addresses {
            volumes.insert(address, volume.downgrade());
        }
        pagefs_info!("Mounted volume over {:016X?}", devices);
        Ok(volume)
    }

    /// Opens `path` for reading on the volume of `address`.
    ///
    /// # Errors
    ///
    /// Any mount error, or see [`Volume::open`].
    pub fn open(&self, address: DeviceAddress, path: &str) -> Result<FileHandle> {
        self.mount(address)?.open(path)
    }

    /// Creates `path` on the volume of `address`.
    ///
    /// # Errors
    ///
    /// Any mount error, or see [`Volume::create`].
    pub fn create(
        &self,
        address: DeviceAddress,
        path: &str,
        is_directory: bool,
        make_parents: bool,
    ) -> Result<FileHandle> {
        self.mount(address)?.create(path, is_directory, make_parents)
    }

    /// Whether a live volume covers `address`.
    pub fn is_mounted(&self, address: DeviceAddress) -> bool {
        self.volumes
            .lock()
            .get(&address)
            .is_some_and(WeakVolume::is_live)
    }

    /// Number of distinct live volumes.
    pub fn live_volumes(&self) -> usize {
        let volumes = self.volumes.lock();
        let mut live: Vec<Volume> = Vec::new();
        for volume in volumes.values().filter_map(WeakVolume::upgrade) {
            if !live.iter().any(|v| v.same_volume(&volume)) {
                live.push(volume);
            }
        }
        live.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bank::sim::EepromBank;
    use crate::bank::{shared, Device, DeviceSet};
    use crate::common::error::Error;

    fn manager() -> CacheManager {
        let mut set = DeviceSet::new();
        set.insert(Device::new(0xA1, vec![shared(EepromBank::new(32, 16))]));
        set.insert(Device::new(0xB2, vec![shared(EepromBank::new(32, 16))]));
        CacheManager::new(Arc::new(set), VolumeOptions::default()).unwrap()
    }

    #[test]
    fn test_rejects_invalid_options() {
        let options = VolumeOptions::default().with_open_attempts(3);
        let result = CacheManager::new(Arc::new(DeviceSet::new()), options);
        assert!(matches!(result, Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_same_address_shares_volume() {
        let manager = manager();
        let a = manager.mount(0xA1).unwrap();
        let b = manager.mount(0xA1).unwrap();
        assert!(a.same_volume(&b));
        assert_eq!(manager.live_volumes(), 1);

        let other = manager.mount(0xB2).unwrap();
        assert!(!a.same_volume(&other));
        assert_eq!(manager.live_volumes(), 2);
    }

    #[test]
    fn test_volume_dropped_with_last_owner() {
        let manager = manager();
        let volume = manager.mount(0xA1).unwrap();
        volume.format().unwrap();
        let handle = volume.create("/F", false, false).unwrap();
        drop(volume);
        assert!(manager.is_mounted(0xA1));

        drop(handle);
        assert!(!manager.is_mounted(0xA1));
        assert_eq!(manager.live_volumes(), 0);
    }

    #[test]
    fn test_unknown_device() {
        let manager = manager();
        assert_eq!(manager.mount(0xFF).err(), Some(Error::DeviceUnavailable(0xFF)));
    }
}
