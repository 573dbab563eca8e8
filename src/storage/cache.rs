//! Page cache
//!
//! One in-memory slot per volume page across every bank of every device in
//! the volume. Writes only touch the slot and the write log; the banks see
//! them when [`PageCache::sync`] drains the log, oldest first.
//!
//! Write-once pages go through `Verify`: at flush time the device page is
//! read back and the new image must only clear bits. When it would set one,
//! the image moves to a fresh page and the old page is redirected to it.

use std::collections::VecDeque;

use crate::bank::{BankCapabilities, Device, SharedBank};
use crate::common::config::VolumeOptions;
use crate::common::error::{Error, Result};
use crate::common::logging::Timer;
use crate::storage::bitmap::PageBitmap;
use crate::storage::packet::{decode_image, encode_image, is_bit_subset};
use crate::storage::page_constants::{PageId, NULL_PAGE, PACKET_OVERHEAD, ROOT_PAGE};
use crate::storage::page_state::{BitmapStrategy, PageClass, PageState};
use crate::{pagefs_debug, pagefs_error, pagefs_trace, pagefs_warn};

struct BankSlot {
    bank: SharedBank,
    start: PageId,
    pages: usize,
}

#[derive(Default)]
struct CachedPage {
    state: PageState,
    /// Packet data (valid for `ReadCrc`, `Verify`, `Write`)
    data: Vec<u8>,
    /// Physical image (valid whenever `state != NotRead`)
    image: Vec<u8>,
    redirect_loaded: bool,
}

/// Write-back cache over the banks of one volume.
pub struct PageCache {
    banks: Vec<BankSlot>,
    device_starts: Vec<PageId>,
    class: PageClass,
    caps: BankCapabilities,
    strategy: BitmapStrategy,
    total_pages: usize,
    page_length: usize,
    max_data: usize,
    pages: Vec<CachedPage>,
    redirect: Vec<PageId>,
    /// Front = most recently written, back = oldest
    write_log: VecDeque<PageId>,
    bitmap: Option<PageBitmap>,
    last_read: Option<PageId>,
}

impl PageCache {
    /// Builds a cache over the usable banks of `devices`, in order.
    ///
    /// # Errors
    ///
    /// `InvalidTopology` if banks disagree on page length, or a write-once
    /// bank is not the only bank of a single-device volume.
    pub fn new(devices: &[Device], options: &VolumeOptions) -> Result<Self> {
        let mut banks = Vec::new();
        let mut device_starts = Vec::with_capacity(devices.len());
        let mut caps: Option<BankCapabilities> = None;
        let mut page_length = 0;
        let mut max_data = usize::MAX;
        let mut total_pages = 0;

        for device in devices {
            device_starts.push(total_pages);
            for bank in device.banks() {
                let mut guard = bank.lock();
                let bank_caps = guard.capabilities();
                if !bank_caps.is_usable() || guard.page_count() == 0 {
                    continue;
                }
                if page_length != 0 && guard.page_length() != page_length {
                    return Err(Error::invalid_topology(format!(
                        "device {:016X} mixes {}-byte and {page_length}-byte pages",
                        device.address(),
                        guard.page_length()
                    )));
                }
                page_length = guard.page_length();
                max_data = max_data
                    .min(guard.max_packet_data_length())
                    .min(usize::from(u8::MAX));
                if bank_caps.write_once {
                    guard.set_write_verification(options.write_verification);
                }
                caps.get_or_insert(bank_caps);
                banks.push(BankSlot {
                    bank: bank.clone(),
                    start: total_pages,
                    pages: guard.page_count(),
                });
                total_pages += guard.page_count();
            }
        }

        let caps = caps.unwrap_or_default();
        let any_write_once = banks.iter().any(|b| b.bank.lock().capabilities().write_once);
        if any_write_once && (banks.len() > 1 || devices.len() > 1) {
            return Err(Error::invalid_topology(
                "write-once memory must be the only bank of a single-device volume",
            ));
        }
        if any_write_once && !caps.status_bitmap {
            return Err(Error::invalid_topology(
                "write-once memory needs a device status bitmap",
            ));
        }

        let class = PageClass::from_capabilities(&caps);
        let strategy = BitmapStrategy::select(&caps, total_pages);
        if page_length < PACKET_OVERHEAD {
            max_data = 0;
        }
        pagefs_debug!(
            "Page cache over {} bank(s): {} pages of {} bytes, {:?}, bitmap {:?}",
            banks.len(),
            total_pages,
            page_length,
            class,
            strategy
        );

        Ok(Self {
            banks,
            device_starts,
            class,
            caps,
            strategy,
            total_pages,
            page_length,
            max_data,
            pages: (0..total_pages).map(|_| CachedPage::default()).collect(),
            redirect: vec![NULL_PAGE; total_pages],
            write_log: VecDeque::new(),
            bitmap: None,
            last_read: None,
        })
    }

    /// Pages in the volume.
    pub fn total_pages(&self) -> usize {
        self.total_pages
    }

    /// Bytes per physical page.
    pub fn page_length(&self) -> usize {
        self.page_length
    }

    /// Largest packet payload per page.
    pub fn max_data_length(&self) -> usize {
        self.max_data
    }

    /// Media class.
    pub fn class(&self) -> PageClass {
        self.class
    }

    /// Capabilities of the first usable bank.
    pub fn capabilities(&self) -> BankCapabilities {
        self.caps
    }

    /// Where the page bitmap is persisted.
    pub fn bitmap_strategy(&self) -> BitmapStrategy {
        self.strategy
    }

    /// First volume page of each device.
    pub fn device_start_pages(&self) -> &[PageId] {
        &self.device_starts
    }

    /// Cache state of `page`.
    pub fn state(&self, page: PageId) -> PageState {
        self.pages.get(page).map_or(PageState::NotRead, |p| p.state)
    }

    /// Pending pages, oldest first.
    pub fn pending_writes(&self) -> Vec<PageId> {
        self.write_log.iter().rev().copied().collect()
    }

    /// Whether anything waits for `sync()`.
    pub fn has_pending_writes(&self) -> bool {
        !self.write_log.is_empty()
    }

    /// In-memory redirect target of `page`, or 0.
    pub fn redirected_page(&self, page: PageId) -> PageId {
        self.redirect.get(page).copied().unwrap_or(NULL_PAGE)
    }

    fn check_page(&self, page: PageId) -> Result<()> {
        if self.total_pages == 0 {
            return Err(Error::NoMemory);
        }
        if page >= self.total_pages {
            return Err(Error::OutOfRange {
                page,
                total: self.total_pages,
            });
        }
        Ok(())
    }

    fn locate(&self, page: PageId) -> (&SharedBank, usize) {
        let slot = self
            .banks
            .iter()
            .find(|b| page >= b.start && page < b.start + b.pages)
            .unwrap_or(&self.banks[0]);
        (&slot.bank, page - slot.start)
    }

    fn global(&self, bank_page: usize, like: PageId) -> PageId {
        let slot = self
            .banks
            .iter()
            .find(|b| like >= b.start && like < b.start + b.pages)
            .unwrap_or(&self.banks[0]);
        slot.start + bank_page
    }

    fn physical_read(&mut self, page: PageId, image: &mut [u8]) -> Result<()> {
        let continued = self.last_read.is_some_and(|last| last + 1 == page);
        let (bank, local) = self.locate(page);
        pagefs_trace!("Physical read of page {} (bank page {})", page, local);
        bank.lock().read_page(local, continued, image)?;
        self.last_read = Some(page);
        Ok(())
    }

    /// Follows the redirect chain of `page` to the page holding its data.
    ///
    /// # Errors
    ///
    /// `CircularRedirection` if the chain does not end within `total_pages`
    /// hops; `InvalidFilesystem` if it points outside the volume.
    pub fn resolve_redirect(&mut self, page: PageId) -> Result<PageId> {
        if !self.class.is_write_once() {
            return Ok(page);
        }
        let mut current = page;
        for _ in 0..=self.total_pages {
            self.load_redirect(current)?;
            let next = self.redirect[current];
            if next == NULL_PAGE {
                return Ok(current);
            }
            if next >= self.total_pages {
                return Err(Error::invalid_filesystem(format!(
                    "page {current} redirected outside the volume to {next}"
                )));
            }
            current = next;
        }
        pagefs_error!("Redirect chain from page {} does not terminate", page);
        Err(Error::CircularRedirection { page })
    }

    fn load_redirect(&mut self, page: PageId) -> Result<()> {
        if !self.class.has_device_redirect() || self.pages[page].redirect_loaded {
            return Ok(());
        }
        let (bank, local) = self.locate(page);
        let target = bank.lock().get_redirected_page(local)?;
        if target != NULL_PAGE {
            self.redirect[page] = self.global(target, page);
        }
        self.pages[page].redirect_loaded = true;
        Ok(())
    }

    /// Packet data stored in `page`.
    ///
    /// # Errors
    ///
    /// `NoMemory`, `OutOfRange`, `CircularRedirection`, `InvalidLength`,
    /// `InvalidCrc`, or a bank error.
    pub fn read_page_packet(&mut self, page: PageId) -> Result<Vec<u8>> {
        self.check_page(page)?;
        let page = self.resolve_redirect(page)?;
        if self.pages[page].state.is_cached_packet() {
            return Ok(self.pages[page].data.clone());
        }
        match self.class {
            PageClass::Rewritable => self.read_rewritable(page),
            PageClass::WriteOnceWithDeviceRedirect | PageClass::WriteOnceNoDeviceRedirect => {
                self.read_write_once(page)
            }
        }
    }

    fn read_rewritable(&mut self, page: PageId) -> Result<Vec<u8>> {
        let mut image = vec![0; self.page_length];
        self.physical_read(page, &mut image)?;
        match decode_image(page, &image, self.max_data) {
            Ok(data) => Ok(self.cache_packet(page, image, data)),
            Err(err) if err.is_corruption() => {
                pagefs_warn!("Page {} failed its packet check, reading again", page);
                self.pages[page].image.clone_from(&image);
                self.pages[page].state = PageState::ReadNoCrc;

                let mut again = vec![0; self.page_length];
                self.physical_read(page, &mut again)?;
                if again == self.pages[page].image {
                    pagefs_error!("Page {} is corrupt on the device", page);
                    return Err(err);
                }
                let data = decode_image(page, &again, self.max_data)?;
                Ok(self.cache_packet(page, again, data))
            }
            Err(err) => Err(err),
        }
    }

    fn read_write_once(&mut self, page: PageId) -> Result<Vec<u8>> {
        let mut image = vec![0; self.page_length];
        if self.caps.page_auto_crc {
            let (bank, local) = self.locate(page);
            let mut guard = bank.lock();
            let mut extra = vec![0; guard.extra_info_length()];
            let extra = if extra.is_empty() {
                None
            } else {
                Some(extra.as_mut_slice())
            };
            pagefs_trace!("Device-verified read of page {}", page);
            guard.read_page_with_crc(local, false, &mut image, extra)?;
        } else {
            self.physical_read(page, &mut image)?;
        }
        let data = decode_image(page, &image, self.max_data)?;
        Ok(self.cache_packet(page, image, data))
    }

    fn cache_packet(&mut self, page: PageId, image: Vec<u8>, data: Vec<u8>) -> Vec<u8> {
        let slot = &mut self.pages[page];
        slot.image = image;
        slot.data.clone_from(&data);
        slot.state = PageState::ReadCrc;
        data
    }

    /// Queues `data` as the new packet of `page`.
    ///
    /// # Errors
    ///
    /// `NoMemory`, `OutOfRange`, `InvalidLength` if `data` does not fit, or
    /// a redirect-chain error on write-once media.
    pub fn write_page_packet(&mut self, page: PageId, data: &[u8]) -> Result<()> {
        self.check_page(page)?;
        if data.len() > self.max_data {
            return Err(Error::InvalidLength {
                page,
                length: data.len(),
                max: self.max_data,
            });
        }
        let page = self.resolve_redirect(page)?;
        let slot = &mut self.pages[page];
        slot.image = encode_image(self.page_length, data);
        slot.data = data.to_vec();
        slot.state = if self.class.is_write_once() {
            PageState::Verify
        } else {
            PageState::Write
        };
        self.log_write(page);
        Ok(())
    }

    fn log_write(&mut self, page: PageId) {
        if let Some(at) = self.write_log.iter().position(|&p| p == page) {
            self.write_log.remove(at);
        }
        self.write_log.push_front(page);
    }

    /// Flushes every pending write, oldest first, then the device bitmap.
    ///
    /// Redirections queue new work; the loop runs until the log is empty.
    ///
    /// # Errors
    ///
    /// Bank errors, `OutOfSpace` when no redirect target is free,
    /// `RedirectUnsupported`, `ReadbackVerificationFailed`. The failing page
    /// stays queued.
    pub fn sync(&mut self) -> Result<()> {
        let timer = Timer::start("page cache sync");
        while let Some(&page) = self.write_log.back() {
            match self.pages[page].state {
                PageState::Verify => self.flush_verify(page)?,
                PageState::Redirect => self.flush_redirect(page)?,
                PageState::Write => self.flush_write(page)?,
                _ => {
                    self.write_log.pop_back();
                }
            }
        }
        if self.strategy == BitmapStrategy::CacheOwned {
            self.flush_status_bitmap()?;
        }
        timer.stop();
        Ok(())
    }

    fn flush_write(&mut self, page: PageId) -> Result<()> {
        let (bank, local) = self.locate(page);
        pagefs_trace!("Writing page {} (bank page {})", page, local);
        bank.lock().write_page_packet(local, &self.pages[page].data)?;
        self.pages[page].state = PageState::ReadCrc;
        self.write_log.pop_back();
        Ok(())
    }

    fn flush_verify(&mut self, page: PageId) -> Result<()> {
        let mut present = vec![0; self.page_length];
        self.physical_read(page, &mut present)?;

        if is_bit_subset(&self.pages[page].image, &present) {
            let used = self.pages[page].data.len() + PACKET_OVERHEAD;
            if present[..used] != self.pages[page].image[..used] {
                let (bank, local) = self.locate(page);
                pagefs_trace!("Programming write-once page {}", page);
                bank.lock().write_page_packet(local, &self.pages[page].data)?;
            }
            self.pages[page].state = PageState::ReadCrc;
            self.write_log.pop_back();
            return Ok(());
        }

        if !self.class.has_device_redirect() {
            pagefs_error!("Page {} needs bits set and cannot be redirected", page);
            return Err(Error::RedirectUnsupported { page });
        }

        let target = self.allocate_redirect_target(page)?;
        pagefs_debug!("Redirecting write-once page {} to page {}", page, target);

        let moved = std::mem::take(&mut self.pages[page]);
        self.pages[target] = CachedPage {
            state: PageState::Verify,
            data: moved.data,
            image: moved.image,
            redirect_loaded: true,
        };
        self.pages[page] = CachedPage {
            state: PageState::Redirect,
            image: present,
            redirect_loaded: true,
            ..CachedPage::default()
        };
        self.redirect[page] = target;

        self.write_log.pop_back();
        self.write_log.retain(|&p| p != target);
        self.write_log.push_back(page);
        self.write_log.push_back(target);
        Ok(())
    }

    fn flush_redirect(&mut self, page: PageId) -> Result<()> {
        let target = self.redirect[page];
        let (bank, local) = self.locate(page);
        let (_, local_target) = self.locate(target);
        bank.lock().redirect_page(local, local_target)?;
        self.write_log.pop_back();
        Ok(())
    }

    /// Free page to carry a redirected write. Page 0 reads as "not
    /// redirected" and `source` is the page being replaced, so both are
    /// marked used and skipped.
    fn allocate_redirect_target(&mut self, source: PageId) -> Result<PageId> {
        let bitmap = self
            .bitmap
            .as_mut()
            .ok_or_else(|| Error::invalid_filesystem("page bitmap not loaded"))?;
        let mut target = bitmap.first_free_page()?;
        while target == ROOT_PAGE || target == source {
            bitmap.mark_used(target);
            target = bitmap.next_free_page()?;
        }
        bitmap.mark_used(target);
        Ok(target)
    }

    fn status_bitmap_bank(&self) -> Result<SharedBank> {
        self.banks
            .first()
            .map(|b| b.bank.clone())
            .ok_or(Error::NoMemory)
    }

    fn status_mask(&self, index: usize) -> u8 {
        let bits = self.total_pages.saturating_sub(index * 8).min(8);
        if bits == 8 {
            0xFF
        } else {
            (1u8 << bits) - 1
        }
    }

    /// Reads the device-owned bitmap (active low on the device).
    ///
    /// # Errors
    ///
    /// Returns a bank error.
    pub fn load_status_bitmap(&mut self) -> Result<()> {
        let bank = self.status_bitmap_bank()?;
        let mut raw = vec![0; PageBitmap::byte_len(self.total_pages)];
        bank.lock().read_status_bitmap(&mut raw)?;
        let logical: Vec<u8> = raw
            .iter()
            .enumerate()
            .map(|(i, b)| !b & self.status_mask(i))
            .collect();
        self.bitmap = Some(PageBitmap::from_device(
            &logical,
            self.total_pages,
            self.class.is_write_once(),
        ));
        Ok(())
    }

    fn flush_status_bitmap(&mut self) -> Result<()> {
        let Some(bitmap) = self.bitmap.as_ref() else {
            return Ok(());
        };
        let changed = bitmap.changed_bytes();
        if changed.is_empty() {
            return Ok(());
        }
        let bank = self.status_bitmap_bank()?;
        let mut guard = bank.lock();
        for &(index, device, modified) in &changed {
            if device & !modified != 0 {
                pagefs_warn!(
                    "Status bitmap byte {} cannot release pages on write-once media",
                    index
                );
            }
            let newly_used = modified & !device;
            if newly_used == 0 {
                continue;
            }
            pagefs_debug!("Clearing status bitmap byte {} bits {:08b}", index, newly_used);
            guard.write_status_bitmap(index, !(device | newly_used))?;
        }

        let mut raw = vec![0; PageBitmap::byte_len(self.total_pages)];
        guard.read_status_bitmap(&mut raw)?;
        drop(guard);
        for &(index, device, modified) in &changed {
            let expected = device | modified;
            if !raw[index] & self.status_mask(index) != expected {
                pagefs_error!("Status bitmap byte {} did not read back", index);
                return Err(Error::ReadbackVerificationFailed { index });
            }
        }
        if let Some(bitmap) = self.bitmap.as_mut() {
            bitmap.commit();
        }
        Ok(())
    }

    /// Installs the in-memory page bitmap loaded by the directory layer.
    pub fn install_bitmap(&mut self, bitmap: PageBitmap) {
        self.bitmap = Some(bitmap);
    }

    /// Page bitmap, if loaded.
    pub fn bitmap(&self) -> Option<&PageBitmap> {
        self.bitmap.as_ref()
    }

    /// Page bitmap for allocation, if loaded.
    pub fn bitmap_mut(&mut self) -> Option<&mut PageBitmap> {
        self.bitmap.as_mut()
    }

    /// Drops clean cached pages so the next read goes to the device.
    /// Pending writes and redirections are kept.
    pub fn invalidate(&mut self) {
        for slot in &mut self.pages {
            if !slot.state.is_pending() && slot.state != PageState::Redirect {
                slot.state = PageState::NotRead;
                slot.data.clear();
                slot.image.clear();
            }
        }
        self.last_read = None;
    }

    /// Forgets everything, including pending writes and the bitmap.
    pub fn clear(&mut self) {
        for slot in &mut self.pages {
            *slot = CachedPage::default();
        }
        self.redirect.fill(NULL_PAGE);
        self.write_log.clear();
        self.bitmap = None;
        self.last_read = None;
    }
}

impl Drop for PageCache {
    fn drop(&mut self) {
        if !self.write_log.is_empty() {
            pagefs_warn!(
                "Page cache dropped with {} unflushed page(s)",
                self.write_log.len()
            );
        }
    }
}
