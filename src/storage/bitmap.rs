//! Page-usage bitmap
//!
//! One bit per volume page, 1 = used. Two copies are kept: the bits last
//! known to be on the device and the bits as modified since. Flushing only
//! touches bytes that differ, so write-once media are never asked to
//! re-program a bit that is already clear.

use crate::common::error::{Error, Result};
use crate::pagefs_debug;
use crate::storage::page_constants::PageId;

/// Page-usage bitmap with a device copy and a modified copy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageBitmap {
    modified: Vec<u8>,
    device: Vec<u8>,
    total_pages: usize,
    /// Allocation cursor. Scans start here rather than at page 0; freeing a
    /// page does not move it back.
    last_free: PageId,
    write_once: bool,
}

impl PageBitmap {
    /// Bytes needed for `total_pages` bits.
    pub fn byte_len(total_pages: usize) -> usize {
        total_pages.div_ceil(8)
    }

    /// A bitmap with every page free on both copies.
    pub fn new(total_pages: usize, write_once: bool) -> Self {
        let bytes = vec![0; Self::byte_len(total_pages)];
        Self {
            modified: bytes.clone(),
            device: bytes,
            total_pages,
            last_free: 0,
            write_once,
        }
    }

    /// A bitmap whose device copy is `bytes` (1 = used).
    pub fn from_device(bytes: &[u8], total_pages: usize, write_once: bool) -> Self {
        let mut device = vec![0; Self::byte_len(total_pages)];
        let n = device.len().min(bytes.len());
        device[..n].copy_from_slice(&bytes[..n]);
        Self {
            modified: device.clone(),
            device,
            total_pages,
            last_free: 0,
            write_once,
        }
    }

    /// Pages covered.
    pub fn total_pages(&self) -> usize {
        self.total_pages
    }

    /// Whether `page` is used. Pages past the end count as used.
    pub fn is_used(&self, page: PageId) -> bool {
        if page >= self.total_pages {
            return true;
        }
        self.modified[page / 8] & (1 << (page % 8)) != 0
    }

    /// Marks `page` used.
    pub fn mark_used(&mut self, page: PageId) {
        if page < self.total_pages {
            self.modified[page / 8] |= 1 << (page % 8);
        }
    }

    /// Releases `page`. Write-once pages can never be programmed again, so
    /// on write-once media the bit stays set.
    pub fn free_page(&mut self, page: PageId) {
        if page >= self.total_pages {
            return;
        }
        if self.write_once {
            pagefs_debug!("Page {} stays allocated on write-once media", page);
            return;
        }
        self.modified[page / 8] &= !(1 << (page % 8));
    }

    /// First free page at or after the allocation cursor.
    ///
    /// # Errors
    ///
    /// Returns `Error::OutOfSpace` if no page at or after the cursor is free.
    pub fn first_free_page(&mut self) -> Result<PageId> {
        self.scan_from(self.last_free)
    }

    /// Next free page strictly after the allocation cursor.
    ///
    /// # Errors
    ///
    /// Returns `Error::OutOfSpace` if no page after the cursor is free.
    pub fn next_free_page(&mut self) -> Result<PageId> {
        self.scan_from(self.last_free + 1)
    }

    fn scan_from(&mut self, start: PageId) -> Result<PageId> {
        let page = (start..self.total_pages)
            .find(|&p| !self.is_used(p))
            .ok_or(Error::OutOfSpace)?;
        self.last_free = page;
        Ok(page)
    }

    /// Current allocation cursor.
    pub fn scan_position(&self) -> PageId {
        self.last_free
    }

    /// Rewinds the allocation cursor to page 0.
    pub fn reset_free_scan(&mut self) {
        self.last_free = 0;
    }

    /// Number of free pages anywhere in the bitmap.
    pub fn free_count(&self) -> usize {
        (0..self.total_pages).filter(|&p| !self.is_used(p)).count()
    }

    /// Whether the modified copy differs from the device copy.
    pub fn is_dirty(&self) -> bool {
        self.modified != self.device
    }

    /// `(index, device, modified)` for every byte that differs.
    pub fn changed_bytes(&self) -> Vec<(usize, u8, u8)> {
        self.device
            .iter()
            .zip(self.modified.iter())
            .enumerate()
            .filter(|(_, (d, m))| d != m)
            .map(|(i, (d, m))| (i, *d, *m))
            .collect()
    }

    /// Modified copy.
    pub fn as_bytes(&self) -> &[u8] {
        &self.modified
    }

    /// Device copy.
    pub fn device_bytes(&self) -> &[u8] {
        &self.device
    }

    /// Records that the modified copy is now on the device.
    pub fn commit(&mut self) {
        self.device.clone_from(&self.modified);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mark_and_free() {
        let mut bitmap = PageBitmap::new(10, false);
        assert_eq!(bitmap.free_count(), 10);

        bitmap.mark_used(0);
        bitmap.mark_used(9);
        assert!(bitmap.is_used(0));
        assert!(bitmap.is_used(9));
        assert!(bitmap.is_used(10));
        assert_eq!(bitmap.free_count(), 8);
        assert!(bitmap.is_dirty());

        bitmap.free_page(9);
        assert!(!bitmap.is_used(9));
    }

    #[test]
    fn test_write_once_never_frees() {
        let mut bitmap = PageBitmap::new(8, true);
        bitmap.mark_used(3);
        bitmap.free_page(3);
        assert!(bitmap.is_used(3));
    }

    #[test]
    fn test_scan_continues_from_cursor() {
        let mut bitmap = PageBitmap::new(8, false);
        bitmap.mark_used(0);

        let first = bitmap.first_free_page().unwrap();
        assert_eq!(first, 1);
        assert_eq!(bitmap.next_free_page().unwrap(), 2);

        bitmap.mark_used(1);
        bitmap.mark_used(2);
        assert_eq!(bitmap.first_free_page().unwrap(), 3);
    }

    #[test]
    fn test_free_behind_cursor_is_skipped_until_reset() {
        let mut bitmap = PageBitmap::new(4, false);
        for p in 0..4 {
            bitmap.mark_used(p);
        }
        bitmap.free_page(3);
        assert_eq!(bitmap.first_free_page().unwrap(), 3);
        bitmap.mark_used(3);

        bitmap.free_page(1);
        assert_eq!(bitmap.first_free_page(), Err(Error::OutOfSpace));
        assert_eq!(bitmap.scan_position(), 3);

        bitmap.reset_free_scan();
        assert_eq!(bitmap.first_free_page().unwrap(), 1);
    }

    #[test]
    fn test_exhausted_bitmap() {
        let mut bitmap = PageBitmap::new(4, false);
        for p in 0..4 {
            bitmap.mark_used(p);
        }
        assert_eq!(bitmap.first_free_page(), Err(Error::OutOfSpace));
        assert_eq!(bitmap.next_free_page(), Err(Error::OutOfSpace));
    }

    #[test]
    fn test_changed_bytes_and_commit() {
        let mut bitmap = PageBitmap::from_device(&[0x01, 0x00], 16, false);
        assert!(!bitmap.is_dirty());
        assert!(bitmap.is_used(0));

        bitmap.mark_used(9);
        assert_eq!(bitmap.changed_bytes(), vec![(1, 0x00, 0x02)]);

        bitmap.commit();
        assert!(!bitmap.is_dirty());
        assert_eq!(bitmap.device_bytes(), &[0x01, 0x02]);
    }
}
