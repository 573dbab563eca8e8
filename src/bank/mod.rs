//! Paged memory bank contract
//!
//! A bank is one page-organized region of a device. The filesystem only
//! talks to banks through [`PagedMemoryBank`]; transports and real device
//! drivers live outside this crate. [`sim`] holds in-memory banks used by
//! the tests and by hosts without hardware.

pub mod image;
pub mod sim;

use crate::common::error::{Error, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// 64-bit device address (family code, serial, CRC8 on the wire).
pub type DeviceAddress = u64;

/// What a bank can do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BankCapabilities {
    /// Bank is free for general data (not a control or status region).
    pub general_purpose: bool,
    /// Bits can only move 1 -> 0.
    pub write_once: bool,
    /// Contents survive power loss.
    pub non_volatile: bool,
    /// Reads can return per-page extra info.
    pub extra_info: bool,
    /// `read_page_with_crc` is available.
    pub page_auto_crc: bool,
    /// `redirect_page` is available.
    pub device_redirect: bool,
    /// Device keeps a page-usage bitmap in status memory.
    pub status_bitmap: bool,
}

impl BankCapabilities {
    /// Whether the filesystem can place pages in this bank.
    pub fn is_usable(&self) -> bool {
        self.general_purpose && self.non_volatile
    }
}

/// A page-organized memory region.
///
/// Page numbers are bank-local. A page written with
/// [`write_page_packet`](PagedMemoryBank::write_page_packet) holds
/// `[len][data][crc16 footer]` where the footer is the complemented
/// CRC16 of `[len, data]`, least significant byte first.
pub trait PagedMemoryBank: Send {
    /// Capability flags.
    fn capabilities(&self) -> BankCapabilities;

    /// Bytes per page.
    fn page_length(&self) -> usize;

    /// Pages in this bank.
    fn page_count(&self) -> usize;

    /// Largest packet payload a page can carry.
    fn max_packet_data_length(&self) -> usize {
        self.page_length().saturating_sub(3)
    }

    /// Bytes of extra info returned per page.
    fn extra_info_length(&self) -> usize {
        0
    }

    /// Reads the raw page image into `buf`.
    ///
    /// `continued` hints that the previous call read `page - 1`.
    ///
    /// # Errors
    ///
    /// Returns an error if the transport fails.
    fn read_page(&mut self, page: usize, continued: bool, buf: &mut [u8]) -> Result<()>;

    /// Reads the raw page image with device-verified transfer CRC.
    ///
    /// # Errors
    ///
    /// Returns an error if the transport fails or the device CRC fails.
    fn read_page_with_crc(
        &mut self,
        page: usize,
        continued: bool,
        buf: &mut [u8],
        extra: Option<&mut [u8]>,
    ) -> Result<()> {
        let _ = (page, continued, buf, extra);
        Err(Error::io("device CRC page read not supported"))
    }

    /// Writes `data` as a packet at the start of `page`.
    ///
    /// # Errors
    ///
    /// Returns an error if the transport fails or the device rejects the write.
    fn write_page_packet(&mut self, page: usize, data: &[u8]) -> Result<()>;

    /// Page that `page` has been redirected to, or 0.
    ///
    /// # Errors
    ///
    /// Returns an error if the transport fails.
    fn get_redirected_page(&mut self, page: usize) -> Result<usize> {
        let _ = page;
        Ok(0)
    }

    /// Permanently redirects `from` to `to`.
    ///
    /// # Errors
    ///
    /// Returns an error if the bank cannot redirect or the transport fails.
    fn redirect_page(&mut self, from: usize, to: usize) -> Result<()> {
        let _ = to;
        Err(Error::RedirectUnsupported { page: from })
    }

    /// Toggles device read-back after programming.
    fn set_write_verification(&mut self, enabled: bool) {
        let _ = enabled;
    }

    /// Reads the device page-usage bitmap (active low: 0 = used).
    ///
    /// # Errors
    ///
    /// Returns an error if the bank has no status bitmap or the transport fails.
    fn read_status_bitmap(&mut self, buf: &mut [u8]) -> Result<()> {
        let _ = buf;
        Err(Error::io("bank has no status bitmap"))
    }

    /// Programs one byte of the device page-usage bitmap.
    ///
    /// # Errors
    ///
    /// Returns an error if the bank has no status bitmap or the transport fails.
    fn write_status_bitmap(&mut self, index: usize, value: u8) -> Result<()> {
        let _ = (index, value);
        Err(Error::io("bank has no status bitmap"))
    }
}

/// A bank shared between a device list and the cache that drives it.
pub type SharedBank = Arc<Mutex<dyn PagedMemoryBank>>;

/// Wraps a bank for sharing.
pub fn shared<B: PagedMemoryBank + 'static>(bank: B) -> SharedBank {
    Arc::new(Mutex::new(bank))
}

/// One physical device: an address and its banks in discovery order.
#[derive(Clone)]
pub struct Device {
    address: DeviceAddress,
    banks: Vec<SharedBank>,
}

impl Device {
    /// Create a device.
    pub fn new(address: DeviceAddress, banks: Vec<SharedBank>) -> Self {
        Self { address, banks }
    }

    /// Device address.
    pub fn address(&self) -> DeviceAddress {
        self.address
    }

    /// Banks in discovery order.
    pub fn banks(&self) -> &[SharedBank] {
        &self.banks
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("address", &format_args!("{:016X}", self.address))
            .field("banks", &self.banks.len())
            .finish()
    }
}

/// Finds attached devices by address.
pub trait DeviceLookup: Send + Sync {
    /// The device at `address`, if attached.
    fn device(&self, address: DeviceAddress) -> Option<Device>;
}

/// In-memory set of attached devices.
#[derive(Clone, Default)]
pub struct DeviceSet {
    devices: HashMap<DeviceAddress, Device>,
}

impl DeviceSet {
    /// Empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Attaches a device, replacing any device with the same address.
    pub fn insert(&mut self, device: Device) {
        self.devices.insert(device.address(), device);
    }

    /// Detaches a device.
    pub fn remove(&mut self, address: DeviceAddress) -> Option<Device> {
        self.devices.remove(&address)
    }

    /// Number of attached devices.
    pub fn len(&self) -> usize {
        self.devices.len()
    }

    /// Whether no device is attached.
    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}

impl DeviceLookup for DeviceSet {
    fn device(&self, address: DeviceAddress) -> Option<Device> {
        self.devices.get(&address).cloned()
    }
}
