//! Cache-local page state and the per-volume media classification

use crate::bank::BankCapabilities;
use crate::storage::page_constants::LOCAL_BITMAP_MAX_PAGES;

/// State of one cached page. Never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PageState {
    /// Nothing cached
    #[default]
    NotRead,
    /// Packet read and CRC-checked
    ReadCrc,
    /// Raw image read without packet validation
    ReadNoCrc,
    /// Pending write-once write; must be checked against the device first
    Verify,
    /// Superseded write-once page waiting for the device redirect
    Redirect,
    /// Pending rewritable write
    Write,
}

impl PageState {
    /// Whether the page sits in the write log.
    pub fn is_pending(self) -> bool {
        matches!(self, PageState::Verify | PageState::Redirect | PageState::Write)
    }

    /// Whether the cached packet can be served without touching the device.
    pub fn is_cached_packet(self) -> bool {
        matches!(self, PageState::ReadCrc | PageState::Verify | PageState::Write)
    }
}

/// How the pages of a volume behave when written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageClass {
    /// EEPROM-like: any page can be rewritten
    Rewritable,
    /// OTP whose device can redirect a page to another
    WriteOnceWithDeviceRedirect,
    /// OTP without device redirection
    WriteOnceNoDeviceRedirect,
}

impl PageClass {
    /// Classifies a bank.
    pub fn from_capabilities(caps: &BankCapabilities) -> Self {
        match (caps.write_once, caps.device_redirect) {
            (false, _) => PageClass::Rewritable,
            (true, true) => PageClass::WriteOnceWithDeviceRedirect,
            (true, false) => PageClass::WriteOnceNoDeviceRedirect,
        }
    }

    /// Whether page bits can only be cleared.
    pub fn is_write_once(self) -> bool {
        !matches!(self, PageClass::Rewritable)
    }

    /// Whether superseded pages can be redirected on the device.
    pub fn has_device_redirect(self) -> bool {
        matches!(self, PageClass::WriteOnceWithDeviceRedirect)
    }
}

/// Where the page-usage bitmap of a volume is stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BitmapStrategy {
    /// Device status memory, driven by the page cache
    CacheOwned,
    /// Inside the root directory header
    Local,
    /// In its own page chain, located by the root directory header
    File,
}

impl BitmapStrategy {
    /// Picks the strategy for a volume.
    pub fn select(caps: &BankCapabilities, total_pages: usize) -> Self {
        if caps.status_bitmap {
            BitmapStrategy::CacheOwned
        } else if total_pages <= LOCAL_BITMAP_MAX_PAGES {
            BitmapStrategy::Local
        } else {
            BitmapStrategy::File
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pending_states() {
        assert!(PageState::Verify.is_pending());
        assert!(PageState::Redirect.is_pending());
        assert!(PageState::Write.is_pending());
        assert!(!PageState::ReadCrc.is_pending());
        assert!(!PageState::NotRead.is_pending());
    }

    #[test]
    fn test_cached_packet_states() {
        assert!(PageState::ReadCrc.is_cached_packet());
        assert!(PageState::Write.is_cached_packet());
        assert!(!PageState::ReadNoCrc.is_cached_packet());
        assert!(!PageState::Redirect.is_cached_packet());
    }

    #[test]
    fn test_page_class_from_capabilities() {
        let mut caps = BankCapabilities::default();
        assert_eq!(PageClass::from_capabilities(&caps), PageClass::Rewritable);

        caps.write_once = true;
        assert_eq!(
            PageClass::from_capabilities(&caps),
            PageClass::WriteOnceNoDeviceRedirect
        );

        caps.device_redirect = true;
        let class = PageClass::from_capabilities(&caps);
        assert_eq!(class, PageClass::WriteOnceWithDeviceRedirect);
        assert!(class.is_write_once());
        assert!(class.has_device_redirect());
    }

    #[test]
    fn test_bitmap_strategy_select() {
        let mut caps = BankCapabilities::default();
        assert_eq!(BitmapStrategy::select(&caps, 32), BitmapStrategy::Local);
        assert_eq!(BitmapStrategy::select(&caps, 33), BitmapStrategy::File);

        caps.status_bitmap = true;
        assert_eq!(BitmapStrategy::select(&caps, 512), BitmapStrategy::CacheOwned);
    }
}
