//! Volume and directory walker
//!
//! A [`Volume`] is the shared, lock-protected state of one mounted
//! filesystem: its page cache, the decoded root header and the set of files
//! open for writing. Every operation takes the volume lock for its whole
//! duration, so a directory walk never sees a half-applied create or delete.
//!
//! Page chains store `[payload][next]` per page with `next` a page pointer
//! of the volume's width; 0 ends the chain. Directory chains pack entries
//! after a per-chain prefix: the root header on the root page, the parent
//! back-reference on a sub-directory's first page, nothing on continuation
//! pages.

use std::collections::HashSet;
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, MutexGuard};

use crate::bank::{Device, DeviceAddress, DeviceLookup};
use crate::common::config::VolumeOptions;
use crate::common::error::{Error, Result};
use crate::common::logging::Timer;
use crate::fs::entry::{decode_entries, DirEntry};
use crate::fs::handle::FileHandle;
use crate::fs::header::{
    decode_device_map, encode_device_map, encode_satellite, BitmapLocation, DeviceMapLocation,
    HeaderCheck, RootHeader, RootRecord,
};
use crate::fs::path::{display_path, entry_equals, parse_compressed, PathEntry};
use crate::storage::bitmap::PageBitmap;
use crate::storage::cache::PageCache;
use crate::storage::packet::{next_pointer, set_next_pointer};
use crate::storage::page_constants::{
    entry_len, pointer_len, PageId, EXT_DIRECTORY, EXT_UNKNOWN, LOCAL_BITMAP_LEN, NULL_PAGE,
    ROOT_PAGE,
};
use crate::storage::page_state::BitmapStrategy;
use crate::{pagefs_debug, pagefs_error, pagefs_info, pagefs_trace, pagefs_warn};

/// Where a resolved entry lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Located {
    pub entry: DirEntry,
    /// Directory page holding the entry; `None` for the root itself
    pub dir_page: Option<PageId>,
    pub slot: usize,
    /// First page of the containing directory
    pub parent_start: PageId,
}

impl Located {
    fn root() -> Self {
        Self {
            entry: DirEntry::root(),
            dir_page: None,
            slot: 0,
            parent_start: ROOT_PAGE,
        }
    }

    pub fn is_root(&self) -> bool {
        self.dir_page.is_none()
    }
}

/// Sequential position inside a file chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Cursor {
    pub page: PageId,
    pub offset: usize,
    pub position: u64,
}

impl Cursor {
    pub fn at(page: PageId) -> Self {
        Self {
            page,
            offset: 0,
            position: 0,
        }
    }
}

struct DirPage {
    page: PageId,
    prefix: Vec<u8>,
    entries: Vec<DirEntry>,
    next: PageId,
}

/// Mutable state of a mounted volume. Only reached through the volume lock.
pub(crate) struct VolumeState {
    cache: PageCache,
    devices: Vec<DeviceAddress>,
    header: Option<RootHeader>,
    pointer_len: usize,
    bitmap_pages: Vec<PageId>,
    writers: HashSet<PageId>,
    /// Why the root header was rejected at mount
    damage: Option<String>,
}

impl VolumeState {
    fn new(cache: PageCache, devices: Vec<DeviceAddress>) -> Self {
        let pointer_len = pointer_len(cache.total_pages());
        Self {
            cache,
            devices,
            header: None,
            pointer_len,
            bitmap_pages: Vec::new(),
            writers: HashSet::new(),
            damage: None,
        }
    }

    fn header(&self) -> Result<&RootHeader> {
        self.header.as_ref().ok_or_else(|| match &self.damage {
            Some(reason) => Error::invalid_filesystem(format!("volume needs a format: {reason}")),
            None => Error::invalid_filesystem("volume is not formatted"),
        })
    }

    /// Payload bytes per page once the next pointer is taken out.
    pub fn payload_capacity(&self) -> usize {
        self.cache.max_data_length().saturating_sub(self.pointer_len)
    }

    // ---- page chains ----

    fn read_chain_page(&mut self, page: PageId) -> Result<(Vec<u8>, PageId)> {
        let mut data = self.cache.read_page_packet(page)?;
        if data.len() < self.pointer_len {
            return Err(Error::invalid_filesystem(format!(
                "page {page} is too short to hold a page pointer"
            )));
        }
        let next = next_pointer(&data, self.pointer_len);
        data.truncate(data.len() - self.pointer_len);
        Ok((data, next))
    }

    fn write_chain_page(&mut self, page: PageId, payload: &[u8], next: PageId) -> Result<()> {
        let mut data = Vec::with_capacity(payload.len() + self.pointer_len);
        data.extend_from_slice(payload);
        data.resize(payload.len() + self.pointer_len, 0);
        set_next_pointer(&mut data, self.pointer_len, next);
        self.cache.write_page_packet(page, &data)
    }

    fn chain_pages(&mut self, start: PageId) -> Result<Vec<PageId>> {
        let mut pages = Vec::new();
        let mut page = start;
        loop {
            if pages.len() >= self.cache.total_pages() {
                pagefs_error!("Page chain starting at {} does not terminate", start);
                return Err(Error::invalid_filesystem(format!(
                    "page chain starting at {start} loops"
                )));
            }
            pages.push(page);
            let (_, next) = self.read_chain_page(page)?;
            if next == NULL_PAGE {
                return Ok(pages);
            }
            page = next;
        }
    }

    fn read_chain(&mut self, start: PageId) -> Result<Vec<u8>> {
        let mut bytes = Vec::new();
        for page in self.chain_pages(start)? {
            bytes.extend(self.read_chain_page(page)?.0);
        }
        Ok(bytes)
    }

    /// Spreads `bytes` over already-linked `pages`.
    fn write_chain(&mut self, pages: &[PageId], bytes: &[u8]) -> Result<()> {
        let capacity = self.payload_capacity().max(1);
        if bytes.len().div_ceil(capacity) > pages.len() {
            return Err(Error::invalid_filesystem(format!(
                "{} bytes do not fit {} reserved pages",
                bytes.len(),
                pages.len()
            )));
        }
        let mut chunks = bytes.chunks(capacity);
        for (i, &page) in pages.iter().enumerate() {
            let next = pages.get(i + 1).copied().unwrap_or(NULL_PAGE);
            self.write_chain_page(page, chunks.next().unwrap_or(&[]), next)?;
        }
        Ok(())
    }

    // ---- allocation ----

    fn allocate_page(&mut self) -> Result<PageId> {
        let bitmap = self
            .cache
            .bitmap_mut()
            .ok_or_else(|| Error::invalid_filesystem("page bitmap not loaded"))?;
        let page = bitmap.first_free_page()?;
        bitmap.mark_used(page);
        pagefs_trace!("Allocated page {}", page);
        Ok(page)
    }

    fn release_page(&mut self, page: PageId) {
        if let Some(bitmap) = self.cache.bitmap_mut() {
            bitmap.free_page(page);
        }
    }

    /// Free pages times the payload each can hold.
    pub fn free_memory(&self) -> usize {
        self.cache
            .bitmap()
            .map_or(0, |b| b.free_count() * self.payload_capacity())
    }

    pub fn reset_free_scan(&mut self) {
        if let Some(bitmap) = self.cache.bitmap_mut() {
            bitmap.reset_free_scan();
        }
    }

    // ---- directories ----

    fn root_header_bytes(&self) -> Result<Vec<u8>> {
        let mut header = self.header()?.clone();
        if let BitmapLocation::Local(bytes) = &mut header.bitmap {
            if let Some(bitmap) = self.cache.bitmap() {
                let n = bitmap.as_bytes().len().min(LOCAL_BITMAP_LEN);
                bytes[..n].copy_from_slice(&bitmap.as_bytes()[..n]);
            }
        }
        header.encode()
    }

    fn read_dir_page(&mut self, dir_start: PageId, page: PageId) -> Result<DirPage> {
        let (payload, next) = self.read_chain_page(page)?;
        let prefix_len = match (page == dir_start, dir_start == ROOT_PAGE) {
            (false, _) => 0,
            (true, true) => RootRecord::decode(&payload)?.1,
            (true, false) => entry_len(self.pointer_len),
        };
        if payload.len() < prefix_len {
            return Err(Error::invalid_filesystem(format!(
                "directory page {page} is shorter than its header"
            )));
        }
        let entries = decode_entries(&payload[prefix_len..], self.pointer_len)?;
        Ok(DirPage {
            page,
            prefix: payload[..prefix_len].to_vec(),
            entries,
            next,
        })
    }

    fn write_dir_page(&mut self, dir: &DirPage) -> Result<()> {
        let mut payload = if dir.page == ROOT_PAGE {
            self.root_header_bytes()?
        } else {
            dir.prefix.clone()
        };
        for entry in &dir.entries {
            entry.encode_into(&mut payload, self.pointer_len);
        }
        self.write_chain_page(dir.page, &payload, dir.next)
    }

    fn read_directory(&mut self, start: PageId) -> Result<Vec<DirPage>> {
        let mut pages: Vec<DirPage> = Vec::new();
        let mut page = start;
        loop {
            if pages.len() >= self.cache.total_pages() {
                return Err(Error::invalid_filesystem(format!(
                    "directory chain starting at {start} loops"
                )));
            }
            let dir = self.read_dir_page(start, page)?;
            let next = dir.next;
            pages.push(dir);
            if next == NULL_PAGE {
                return Ok(pages);
            }
            page = next;
        }
    }

    fn find(&mut self, dir_start: PageId, segment: &PathEntry) -> Result<Option<Located>> {
        for dir in self.read_directory(dir_start)? {
            if let Some(slot) = dir.entries.iter().position(|e| e.matches(segment)) {
                return Ok(Some(Located {
                    entry: dir.entries[slot],
                    dir_page: Some(dir.page),
                    slot,
                    parent_start: dir_start,
                }));
            }
        }
        Ok(None)
    }

    /// Walks `path` from the root.
    ///
    /// # Errors
    ///
    /// `PathNotFound` when a segment is missing or a non-final segment is a
    /// file; `InvalidFilesystem` if the volume is unformatted or a directory
    /// page is malformed.
    pub fn resolve(&mut self, path: &[PathEntry]) -> Result<Located> {
        self.header()?;
        let mut current = Located::root();
        for (depth, segment) in path.iter().enumerate() {
            if !current.entry.is_directory() {
                return Err(Error::not_found(display_path(&path[..=depth])));
            }
            current = self
                .find(current.entry.start, segment)?
                .ok_or_else(|| Error::not_found(display_path(&path[..=depth])))?;
        }
        Ok(current)
    }

    /// Like [`resolve`](Self::resolve) but a missing path is `None`.
    pub fn lookup(&mut self, path: &[PathEntry]) -> Result<Option<Located>> {
        match self.resolve(path) {
            Ok(located) => Ok(Some(located)),
            Err(err) if err.is_not_found() => Ok(None),
            Err(err) => Err(err),
        }
    }

    fn store_entry(&mut self, located: &Located) -> Result<()> {
        let page = located
            .dir_page
            .ok_or_else(|| Error::invalid_path("the root directory has no entry"))?;
        let mut dir = self.read_dir_page(located.parent_start, page)?;
        let slot = dir.entries.get_mut(located.slot).ok_or_else(|| {
            Error::invalid_filesystem(format!("entry {} vanished from page {page}", located.slot))
        })?;
        *slot = located.entry;
        self.write_dir_page(&dir)
    }

    fn remove_entry(&mut self, located: &Located) -> Result<()> {
        let page = located
            .dir_page
            .ok_or_else(|| Error::invalid_path("the root directory has no entry"))?;
        let mut dir = self.read_dir_page(located.parent_start, page)?;
        if located.slot >= dir.entries.len() {
            return Err(Error::invalid_filesystem(format!(
                "entry {} vanished from page {page}",
                located.slot
            )));
        }
        dir.entries.remove(located.slot);
        if !dir.entries.is_empty() || page == located.parent_start {
            return self.write_dir_page(&dir);
        }

        // an emptied continuation page leaves the chain
        let mut previous = self
            .read_directory(located.parent_start)?
            .into_iter()
            .find(|d| d.next == page)
            .ok_or_else(|| {
                Error::invalid_filesystem(format!("directory page {page} has no predecessor"))
            })?;
        previous.next = dir.next;
        self.write_dir_page(&previous)?;
        self.release_page(page);
        pagefs_debug!("Directory page {} emptied and released", page);
        Ok(())
    }

    fn add_entry(
        &mut self,
        dir_start: PageId,
        segment: &PathEntry,
        is_directory: bool,
        reuse: Option<(PageId, usize)>,
    ) -> Result<Located> {
        let PathEntry::Name { name, ext } = *segment else {
            return Err(Error::invalid_path(format!("cannot create '{segment}'")));
        };
        let ext = match (is_directory, ext) {
            (true, _) => EXT_DIRECTORY,
            (false, EXT_UNKNOWN) => 0,
            (false, ext) => ext,
        };
        let n = self.pointer_len;
        let width = entry_len(n);

        let mut dirs = self.read_directory(dir_start)?;
        let last = dirs
            .last_mut()
            .ok_or_else(|| Error::invalid_filesystem("directory without pages"))?;
        let used = last.prefix.len() + last.entries.len() * width + n;
        let fits = used + width <= self.cache.max_data_length();

        let new_dir_page = if fits {
            None
        } else {
            Some(self.allocate_page()?)
        };
        let (start, count) = match reuse {
            Some(existing) => existing,
            None => match self.allocate_page() {
                Ok(page) => (page, usize::from(!is_directory)),
                Err(err) => {
                    if let Some(page) = new_dir_page {
                        self.release_page(page);
                    }
                    return Err(err);
                }
            },
        };

        let entry = DirEntry {
            name,
            ext,
            start,
            count,
        };
        if reuse.is_none() {
            if is_directory {
                let back = DirEntry::back_reference(dir_start).encode(n);
                self.write_chain_page(start, &back, NULL_PAGE)?;
            } else {
                self.write_chain_page(start, &[], NULL_PAGE)?;
            }
        }

        let located = match new_dir_page {
            None => {
                last.entries.push(entry);
                self.write_dir_page(last)?;
                Located {
                    entry,
                    dir_page: Some(last.page),
                    slot: last.entries.len() - 1,
                    parent_start: dir_start,
                }
            }
            Some(page) => {
                pagefs_debug!("Directory at page {} grows onto page {}", dir_start, page);
                self.write_chain_page(page, &entry.encode(n), NULL_PAGE)?;
                last.next = page;
                self.write_dir_page(last)?;
                Located {
                    entry,
                    dir_page: Some(page),
                    slot: 0,
                    parent_start: dir_start,
                }
            }
        };
        pagefs_debug!(
            "Created {} at page {} in directory {}",
            entry.display_name(),
            start,
            dir_start
        );
        Ok(located)
    }

    /// Creates the entry named by `path`.
    ///
    /// `reuse` hands an existing chain to the new entry instead of allocating
    /// one. When the create fails after queueing writes, the volume is synced
    /// before the error is returned.
    ///
    /// # Errors
    ///
    /// `AlreadyExists`, `PathNotFound` (missing parent without
    /// `make_parents`), `NotADirectory`, `OutOfSpace`, or any page error.
    pub fn create(
        &mut self,
        path: &[PathEntry],
        is_directory: bool,
        make_parents: bool,
        reuse: Option<(PageId, usize)>,
    ) -> Result<Located> {
        let result = self.create_entry(path, is_directory, make_parents, reuse);
        if let Err(err) = &result {
            pagefs_debug!("Create of {} failed: {}", display_path(path), err);
            if self.cache.has_pending_writes() || self.bitmap_dirty() {
                if let Err(sync_err) = self.sync() {
                    pagefs_warn!("Sync after failed create also failed: {}", sync_err);
                }
            }
        }
        result
    }

    fn create_entry(
        &mut self,
        path: &[PathEntry],
        is_directory: bool,
        make_parents: bool,
        reuse: Option<(PageId, usize)>,
    ) -> Result<Located> {
        self.header()?;
        let Some((last, parents)) = path.split_last() else {
            return Err(Error::AlreadyExists("/".to_string()));
        };
        let mut parent = Located::root();
        for (depth, segment) in parents.iter().enumerate() {
            parent = match self.find(parent.entry.start, segment)? {
                Some(found) if found.entry.is_directory() => found,
                Some(_) => return Err(Error::NotADirectory(display_path(&path[..=depth]))),
                None if make_parents => {
                    self.add_entry(parent.entry.start, segment, true, None)?
                }
                None => return Err(Error::not_found(display_path(&path[..=depth]))),
            };
        }
        if self.find(parent.entry.start, last)?.is_some() {
            return Err(Error::AlreadyExists(display_path(path)));
        }
        self.add_entry(parent.entry.start, last, is_directory, reuse)
    }

    /// Removes the entry at `path`, releasing a file's pages.
    ///
    /// # Errors
    ///
    /// `PathNotFound`, `InvalidPath` for the root, `ReadOnly`,
    /// `AlreadyOpenForWrite`, `DirectoryNotEmpty`.
    pub fn delete(&mut self, path: &[PathEntry]) -> Result<()> {
        let located = self.resolve(path)?;
        if located.is_root() {
            return Err(Error::invalid_path("the root directory cannot be deleted"));
        }
        if located.entry.is_read_only() {
            return Err(Error::ReadOnly(display_path(path)));
        }
        if self.writers.contains(&located.entry.start) {
            return Err(Error::AlreadyOpenForWrite(display_path(path)));
        }
        if located.entry.is_directory() {
            let dirs = self.read_directory(located.entry.start)?;
            if dirs.iter().any(|d| !d.entries.is_empty()) {
                return Err(Error::DirectoryNotEmpty(display_path(path)));
            }
        }
        let pages = self.chain_pages(located.entry.start)?;
        self.remove_entry(&located)?;
        for page in pages {
            self.release_page(page);
        }
        pagefs_debug!("Deleted {}", display_path(path));
        Ok(())
    }

    /// Moves the entry at `from` to `to`, keeping its pages.
    ///
    /// # Errors
    ///
    /// Any error of [`resolve`](Self::resolve) or [`create`](Self::create),
    /// plus `ReadOnly`, `AlreadyOpenForWrite` and `InvalidPath` when a
    /// directory would move into itself.
    pub fn rename(&mut self, from: &[PathEntry], to: &[PathEntry]) -> Result<()> {
        let source = self.resolve(from)?;
        if source.is_root() {
            return Err(Error::invalid_path("the root directory cannot be renamed"));
        }
        if source.entry.is_read_only() {
            return Err(Error::ReadOnly(display_path(from)));
        }
        if self.writers.contains(&source.entry.start) {
            return Err(Error::AlreadyOpenForWrite(display_path(from)));
        }
        let is_directory = source.entry.is_directory();
        if is_directory && is_within(to, from) {
            return Err(Error::invalid_path(format!(
                "cannot move {} into itself",
                display_path(from)
            )));
        }

        let first = if is_directory {
            Some(self.read_dir_page(source.entry.start, source.entry.start)?)
        } else {
            None
        };

        let created = self.create(
            to,
            is_directory,
            false,
            Some((source.entry.start, source.entry.count)),
        )?;
        self.finish_rename(from, to, &source, created)?;

        if let Some(mut first) = first {
            first.prefix = DirEntry::back_reference(created.parent_start).encode(self.pointer_len);
            self.write_dir_page(&first)?;
        }
        pagefs_debug!("Renamed {} to {}", display_path(from), display_path(to));
        Ok(())
    }

    /// Drops the entry at `from` once its copy at `to` exists. On failure
    /// the copy is removed again so no two entries share one chain.
    fn finish_rename(
        &mut self,
        from: &[PathEntry],
        to: &[PathEntry],
        source: &Located,
        mut created: Located,
    ) -> Result<()> {
        let mut retire = || -> Result<()> {
            if source.entry.is_hidden() {
                created.entry.set_attribute(true);
                self.store_entry(&created)?;
            }
            let stale = self.resolve(from)?;
            self.remove_entry(&stale)
        };
        let Err(err) = retire() else {
            return Ok(());
        };

        pagefs_warn!(
            "Rename of {} failed after {} was created: {}",
            display_path(from),
            display_path(to),
            err
        );
        let undone = self.resolve(to).and_then(|copy| self.remove_entry(&copy));
        if let Err(undo_err) = undone {
            pagefs_error!("Could not remove {} again: {}", display_path(to), undo_err);
        }
        Err(err)
    }

    /// Entry names of the directory at `path`.
    ///
    /// # Errors
    ///
    /// `PathNotFound`, or `NotADirectory` if `path` is a file.
    pub fn list(&mut self, path: &[PathEntry]) -> Result<Vec<String>> {
        let located = self.resolve(path)?;
        if !located.entry.is_directory() {
            return Err(Error::NotADirectory(display_path(path)));
        }
        Ok(self
            .read_directory(located.entry.start)?
            .iter()
            .flat_map(|d| d.entries.iter().map(DirEntry::display_name))
            .collect())
    }

    /// Sets the attribute bit: read-only on files, hidden on directories.
    ///
    /// # Errors
    ///
    /// `PathNotFound`, `InvalidPath` for the root, `NotAFile` /
    /// `NotADirectory` if the entry is of the other kind.
    pub fn set_attribute(&mut self, path: &[PathEntry], directory: bool, on: bool) -> Result<()> {
        let mut located = self.resolve(path)?;
        if located.is_root() {
            return Err(Error::invalid_path("the root directory has no attributes"));
        }
        match (located.entry.is_directory(), directory) {
            (true, false) => return Err(Error::NotAFile(display_path(path))),
            (false, true) => return Err(Error::NotADirectory(display_path(path))),
            _ => {}
        }
        located.entry.set_attribute(on);
        self.store_entry(&located)
    }

    /// Pages of the chain starting at the entry of `path`.
    ///
    /// # Errors
    ///
    /// `PathNotFound`, or `InvalidFilesystem` if the chain loops.
    pub fn page_list(&mut self, path: &[PathEntry]) -> Result<Vec<PageId>> {
        let located = self.resolve(path)?;
        self.chain_pages(located.entry.start)
    }

    // ---- files ----

    pub fn register_writer(&mut self, located: &Located, path: &[PathEntry]) -> Result<()> {
        if !self.writers.insert(located.entry.start) {
            return Err(Error::AlreadyOpenForWrite(display_path(path)));
        }
        Ok(())
    }

    pub fn release_writer(&mut self, start: PageId) {
        self.writers.remove(&start);
    }

    /// Cuts a file back to an empty start page.
    pub fn truncate(&mut self, located: &mut Located) -> Result<()> {
        let pages = self.chain_pages(located.entry.start)?;
        for &page in &pages[1..] {
            self.release_page(page);
        }
        self.write_chain_page(located.entry.start, &[], NULL_PAGE)?;
        if located.entry.count != 1 {
            located.entry.count = 1;
            self.store_entry(located)?;
        }
        Ok(())
    }

    /// Last page of the chain starting at `start`.
    pub fn tail_page(&mut self, start: PageId) -> Result<PageId> {
        let pages = self.chain_pages(start)?;
        Ok(pages.last().copied().unwrap_or(start))
    }

    /// Appends `buf` after the payload of `*tail`, growing the chain as
    /// needed. `*tail` and `*written` track every page and byte queued, also
    /// when an error cuts the append short.
    ///
    /// # Errors
    ///
    /// `OutOfSpace` once no page is left; the bytes that fit stay queued.
    pub fn append(
        &mut self,
        path: &[PathEntry],
        tail: &mut PageId,
        written: &mut u64,
        buf: &[u8],
    ) -> Result<()> {
        let capacity = self.payload_capacity();
        let (mut payload, _) = self.read_chain_page(*tail)?;
        let mut rest = buf;
        let mut grown = 0;
        let outcome = loop {
            let take = capacity.saturating_sub(payload.len()).min(rest.len());
            payload.extend_from_slice(&rest[..take]);
            rest = &rest[take..];
            if rest.is_empty() {
                let result = self.write_chain_page(*tail, &payload, NULL_PAGE);
                if result.is_ok() {
                    *written += take as u64;
                }
                break result;
            }
            let next = match self.allocate_page() {
                Ok(page) => page,
                Err(err) => {
                    if let Err(write_err) = self.write_chain_page(*tail, &payload, NULL_PAGE) {
                        break Err(write_err);
                    }
                    *written += take as u64;
                    break Err(err);
                }
            };
            if let Err(err) = self.write_chain_page(*tail, &payload, next) {
                self.release_page(next);
                break Err(err);
            }
            *written += take as u64;
            *tail = next;
            payload = Vec::new();
            grown += 1;
        };
        if grown > 0 {
            let mut located = self.resolve(path)?;
            located.entry.count += grown;
            self.store_entry(&located)?;
        }
        outcome
    }

    /// Reads from `cursor` into `buf`, returning the bytes copied (0 at the
    /// end of the chain).
    pub fn read_at(&mut self, cursor: &mut Cursor, buf: &mut [u8]) -> Result<usize> {
        let mut filled = 0;
        let mut hops = 0;
        while filled < buf.len() {
            let (payload, next) = self.read_chain_page(cursor.page)?;
            if cursor.offset < payload.len() {
                let n = (payload.len() - cursor.offset).min(buf.len() - filled);
                buf[filled..filled + n]
                    .copy_from_slice(&payload[cursor.offset..cursor.offset + n]);
                cursor.offset += n;
                cursor.position += n as u64;
                filled += n;
                hops = 0;
            } else if next != NULL_PAGE {
                hops += 1;
                if hops > self.cache.total_pages() {
                    return Err(Error::invalid_filesystem(format!(
                        "file chain loops at page {}",
                        cursor.page
                    )));
                }
                cursor.page = next;
                cursor.offset = 0;
            } else {
                break;
            }
        }
        Ok(filled)
    }

    // ---- volume ----

    fn bitmap_dirty(&self) -> bool {
        self.cache.bitmap().is_some_and(PageBitmap::is_dirty)
    }

    fn flush_bitmap(&mut self) -> Result<()> {
        if !self.bitmap_dirty() {
            return Ok(());
        }
        match self.cache.bitmap_strategy() {
            BitmapStrategy::CacheOwned => return Ok(()),
            BitmapStrategy::Local => {
                let root = self.read_dir_page(ROOT_PAGE, ROOT_PAGE)?;
                self.write_dir_page(&root)?;
            }
            BitmapStrategy::File => {
                let bytes = self
                    .cache
                    .bitmap()
                    .map(|b| b.as_bytes().to_vec())
                    .unwrap_or_default();
                let pages = self.bitmap_pages.clone();
                self.write_chain(&pages, &bytes)?;
            }
        }
        pagefs_debug!("Queued page bitmap ({:?})", self.cache.bitmap_strategy());
        if let Some(bitmap) = self.cache.bitmap_mut() {
            bitmap.commit();
        }
        Ok(())
    }

    /// Writes the bitmap (if the volume owns it) and flushes the cache.
    pub fn sync(&mut self) -> Result<()> {
        if self.header.is_some() {
            self.flush_bitmap()?;
        }
        self.cache.sync()
    }

    /// Checks the root page against the devices this state was built over.
    ///
    /// A root page that reads back intact but holds an unusable header is
    /// reported as `Damaged`, leaving the state mounted for a format.
    pub fn validate_header(&mut self) -> Result<HeaderCheck> {
        let total = self.cache.total_pages();
        if total == 0 {
            return Err(Error::NoMemory);
        }
        let data = match self.cache.read_page_packet(ROOT_PAGE) {
            Ok(data) => data,
            Err(err) if err.is_corruption() => {
                pagefs_info!(
                    "No filesystem on device {:016X}: {}",
                    self.devices[0],
                    err
                );
                return Ok(HeaderCheck::Unformatted);
            }
            Err(err) => return Err(err),
        };

        match self.check_root(&data, total) {
            Err(err) if err.is_corruption() || matches!(err, Error::InvalidFilesystem(_)) => {
                let reason = match err {
                    Error::InvalidFilesystem(reason) => reason,
                    other => other.to_string(),
                };
                pagefs_error!(
                    "Damaged filesystem on device {:016X}: {}",
                    self.devices[0],
                    reason
                );
                self.header = None;
                self.bitmap_pages.clear();
                self.damage = Some(reason.clone());
                Ok(HeaderCheck::Damaged(reason))
            }
            other => other,
        }
    }

    fn check_root(&mut self, data: &[u8], total: usize) -> Result<HeaderCheck> {
        let header = match RootRecord::decode(data)?.0 {
            RootRecord::Satellite { master, .. } => {
                if master == self.devices[0] {
                    return Err(Error::invalid_filesystem(format!(
                        "device {master:016X} names itself as its master"
                    )));
                }
                pagefs_info!(
                    "Device {:016X} is a satellite of {:016X}",
                    self.devices[0],
                    master
                );
                return Ok(HeaderCheck::Redirect(vec![master]));
            }
            RootRecord::Master(header) => header,
        };

        self.pointer_len = header.pointer_len;
        let expected = match &header.device_map {
            None => vec![self.devices[0]],
            Some(DeviceMapLocation::Inline(addresses)) => addresses.clone(),
            Some(DeviceMapLocation::File { start, .. }) => {
                let bytes = self.read_chain(*start)?;
                decode_device_map(&bytes)?.0
            }
        };
        if expected != self.devices {
            pagefs_info!(
                "Device map {:016X?} differs from attached {:016X?}, remounting",
                expected,
                self.devices
            );
            return Ok(HeaderCheck::Redirect(expected));
        }

        if header.pointer_len != pointer_len(total) {
            return Err(Error::invalid_filesystem(format!(
                "{}-byte page pointers on a {total}-page volume",
                header.pointer_len
            )));
        }
        if header.bitmap.strategy() != self.cache.bitmap_strategy() {
            return Err(Error::invalid_filesystem(format!(
                "root header keeps a {:?} bitmap, media needs {:?}",
                header.bitmap.strategy(),
                self.cache.bitmap_strategy()
            )));
        }

        let write_once = self.cache.class().is_write_once();
        match &header.bitmap {
            BitmapLocation::CacheOwned => self.cache.load_status_bitmap()?,
            BitmapLocation::Local(bytes) => self
                .cache
                .install_bitmap(PageBitmap::from_device(bytes, total, write_once)),
            BitmapLocation::File { start, count } => {
                let pages = self.chain_pages(*start)?;
                let bytes = self.read_chain(*start)?;
                if pages.len() != *count || bytes.len() < PageBitmap::byte_len(total) {
                    return Err(Error::invalid_filesystem(format!(
                        "bitmap file at page {start} holds {} bytes in {} pages",
                        bytes.len(),
                        pages.len()
                    )));
                }
                self.cache
                    .install_bitmap(PageBitmap::from_device(&bytes, total, write_once));
                self.bitmap_pages = pages;
            }
        }

        self.header = Some(header);
        pagefs_info!(
            "Mounted {}-page volume on {} device(s), {} bytes free",
            total,
            self.devices.len(),
            self.free_memory()
        );
        Ok(HeaderCheck::Valid)
    }

    /// Re-initializes header, bitmap and device map, dropping every file.
    ///
    /// # Errors
    ///
    /// `NoMemory` on an empty volume, `AlreadyOpenForWrite` while a writer
    /// is open, `InvalidTopology` when the root structures do not fit, or a
    /// page error while flushing.
    pub fn format(&mut self) -> Result<()> {
        let timer = Timer::start("format");
        let total = self.cache.total_pages();
        if total == 0 {
            return Err(Error::NoMemory);
        }
        if !self.writers.is_empty() {
            return Err(Error::AlreadyOpenForWrite("/".to_string()));
        }

        self.cache.clear();
        self.header = None;
        self.damage = None;
        self.bitmap_pages.clear();
        let n = pointer_len(total);
        self.pointer_len = n;
        let max_data = self.cache.max_data_length();
        let capacity = self.payload_capacity();
        if capacity == 0 {
            return Err(Error::invalid_topology("pages are too small for a filesystem"));
        }

        let strategy = self.cache.bitmap_strategy();
        if strategy == BitmapStrategy::CacheOwned {
            self.cache.load_status_bitmap()?;
        } else {
            let write_once = self.cache.class().is_write_once();
            self.cache.install_bitmap(PageBitmap::new(total, write_once));
        }
        let starts = self.cache.device_start_pages().to_vec();
        if let Some(bitmap) = self.cache.bitmap_mut() {
            for &start in &starts {
                bitmap.mark_used(start);
            }
            bitmap.reset_free_scan();
        }

        let bitmap = match strategy {
            BitmapStrategy::CacheOwned => BitmapLocation::CacheOwned,
            BitmapStrategy::Local => BitmapLocation::Local([0; LOCAL_BITMAP_LEN]),
            BitmapStrategy::File => {
                let needed = PageBitmap::byte_len(total).div_ceil(capacity);
                let pages = (0..needed)
                    .map(|_| self.allocate_page())
                    .collect::<Result<Vec<_>>>()?;
                let location = BitmapLocation::File {
                    start: pages[0],
                    count: pages.len(),
                };
                self.bitmap_pages = pages;
                location
            }
        };

        let device_map = if self.devices.len() > 1 {
            let inline = RootHeader {
                pointer_len: n,
                bitmap: bitmap.clone(),
                device_map: Some(DeviceMapLocation::Inline(self.devices.clone())),
            };
            if inline.encode()?.len() + n <= max_data {
                inline.device_map
            } else {
                let map = encode_device_map(&self.devices)?;
                let pages = (0..map.len().div_ceil(capacity))
                    .map(|_| self.allocate_page())
                    .collect::<Result<Vec<_>>>()?;
                let master_end = starts.get(1).copied().unwrap_or(total);
                if pages.iter().any(|&p| p >= master_end) {
                    return Err(Error::invalid_topology(
                        "device map does not fit on the master device",
                    ));
                }
                self.write_chain(&pages, &map)?;
                Some(DeviceMapLocation::File {
                    start: pages[0],
                    count: pages.len(),
                })
            }
        } else {
            None
        };

        self.header = Some(RootHeader {
            pointer_len: n,
            bitmap,
            device_map,
        });
        let root = self.root_header_bytes()?;
        if root.len() + n > max_data {
            self.header = None;
            return Err(Error::invalid_topology(
                "root header does not fit the root page",
            ));
        }
        self.write_chain_page(ROOT_PAGE, &root, NULL_PAGE)?;
        let master = self.devices[0];
        for &start in &starts[1..] {
            self.cache
                .write_page_packet(start, &encode_satellite(n, master))?;
        }

        self.sync()?;
        pagefs_info!(
            "Formatted {}-page volume on {} device(s)",
            total,
            self.devices.len()
        );
        timer.stop();
        Ok(())
    }
}

fn is_within(path: &[PathEntry], ancestor: &[PathEntry]) -> bool {
    path.len() > ancestor.len()
        && path.iter().zip(ancestor).all(|(a, b)| match (a, b) {
            (
                PathEntry::Name { name: an, ext: ae },
                PathEntry::Name { name: bn, ext: be },
            ) => entry_equals(an, *ae, bn, *be),
            _ => false,
        })
}

struct VolumeInner {
    state: Mutex<VolumeState>,
    options: VolumeOptions,
}

impl Drop for VolumeInner {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        if state.cache.has_pending_writes() || state.bitmap_dirty() {
            pagefs_warn!(
                "Volume {:016X?} dropped with unsynced changes; they are discarded",
                state.devices
            );
        }
    }
}

/// A mounted volume.
///
/// Cloning is cheap; clones share one page cache and one lock. The cache is
/// dropped with the last clone (including the clones held by open
/// [`FileHandle`]s).
#[derive(Clone)]
pub struct Volume {
    inner: Arc<VolumeInner>,
}

/// Non-owning reference kept by the registry.
#[derive(Clone)]
pub(crate) struct WeakVolume(Weak<VolumeInner>);

impl WeakVolume {
    pub fn upgrade(&self) -> Option<Volume> {
        self.0.upgrade().map(|inner| Volume { inner })
    }

    pub fn is_live(&self) -> bool {
        self.0.strong_count() > 0
    }
}

impl Volume {
    pub(crate) fn downgrade(&self) -> WeakVolume {
        WeakVolume(Arc::downgrade(&self.inner))
    }

    /// Builds a volume over `addresses` and settles satellite and device-map
    /// redirects.
    pub(crate) fn mount(
        lookup: &dyn DeviceLookup,
        addresses: &[DeviceAddress],
        options: &VolumeOptions,
    ) -> Result<Self> {
        let find = |address: &DeviceAddress| {
            lookup
                .device(*address)
                .ok_or(Error::DeviceUnavailable(*address))
        };
        if addresses.is_empty() {
            return Err(Error::invalid_topology("no devices given"));
        }
        let mut devices: Vec<Device> = addresses.iter().map(find).collect::<Result<_>>()?;
        let mut hops = 0;
        loop {
            let cache = PageCache::new(&devices, options)?;
            let mut state = VolumeState::new(cache, devices.iter().map(Device::address).collect());
            match state.validate_header()? {
                HeaderCheck::Valid | HeaderCheck::Unformatted | HeaderCheck::Damaged(_) => {
                    return Ok(Self {
                        inner: Arc::new(VolumeInner {
                            state: Mutex::new(state),
                            options: options.clone(),
                        }),
                    })
                }
                HeaderCheck::Redirect(next) => {
                    hops += 1;
                    if hops > options.max_redirect_hops {
                        pagefs_error!("Mount of {:016X?} keeps redirecting", addresses);
                        return Err(Error::invalid_filesystem(format!(
                            "mount did not settle after {} redirects",
                            options.max_redirect_hops
                        )));
                    }
                    devices = next.iter().map(find).collect::<Result<_>>()?;
                }
            }
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, VolumeState> {
        self.inner.state.lock()
    }

    /// Options the volume was mounted with.
    pub fn options(&self) -> &VolumeOptions {
        &self.inner.options
    }

    /// Device addresses, master first.
    pub fn devices(&self) -> Vec<DeviceAddress> {
        self.lock().devices.clone()
    }

    /// Whether both values refer to the same mounted volume.
    pub fn same_volume(&self, other: &Volume) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Live owners: volume clones plus open handles.
    pub fn owner_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    /// Whether a valid root header was found or written.
    pub fn is_formatted(&self) -> bool {
        self.lock().header.is_some()
    }

    /// Why the root header was rejected at mount, until the next format.
    pub fn damage(&self) -> Option<String> {
        self.lock().damage.clone()
    }

    /// Total pages across all devices.
    pub fn page_count(&self) -> usize {
        self.lock().cache.total_pages()
    }

    /// Usable bytes left: free pages times per-page payload.
    pub fn free_memory(&self) -> usize {
        self.lock().free_memory()
    }

    /// Whether writes are waiting for [`sync`](Self::sync).
    pub fn has_pending_writes(&self) -> bool {
        self.lock().cache.has_pending_writes()
    }

    /// Rewinds the free-page scan to page 0 so pages freed behind the
    /// allocation cursor can be reused.
    pub fn reset_free_scan(&self) {
        self.lock().reset_free_scan();
    }

    /// Drops clean cached pages; the next reads go to the devices.
    pub fn invalidate_cache(&self) {
        self.lock().cache.invalidate();
    }

    /// Erases the volume.
    ///
    /// # Errors
    ///
    /// See [`VolumeState::format`].
    pub fn format(&self) -> Result<()> {
        self.lock().format()
    }

    /// Flushes every queued write.
    ///
    /// # Errors
    ///
    /// Returns the first page or bitmap error; unflushed pages stay queued.
    pub fn sync(&self) -> Result<()> {
        self.lock().sync()
    }

    /// Unresolved handle for `path`.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidPath` if `path` does not parse.
    pub fn handle(&self, path: &str) -> Result<FileHandle> {
        Ok(FileHandle::new(self.clone(), parse_compressed(path)?))
    }

    /// Opens `path` for reading.
    ///
    /// # Errors
    ///
    /// `InvalidPath`, `PathNotFound`, or a page error after the configured
    /// number of attempts.
    pub fn open(&self, path: &str) -> Result<FileHandle> {
        let mut handle = self.handle(path)?;
        handle.open()?;
        Ok(handle)
    }

    /// Opens `path` for writing, creating the file if missing. Without
    /// `append` the file is truncated.
    ///
    /// # Errors
    ///
    /// `NotAFile`, `ReadOnly`, `AlreadyOpenForWrite`, or any create error.
    pub fn open_write(&self, path: &str, append: bool) -> Result<FileHandle> {
        let mut handle = self.handle(path)?;
        handle.open_write(append)?;
        Ok(handle)
    }

    /// Creates `path`. Files come back open for writing.
    ///
    /// # Errors
    ///
    /// `AlreadyExists`, `PathNotFound`, `OutOfSpace`, ...
    pub fn create(&self, path: &str, is_directory: bool, make_parents: bool) -> Result<FileHandle> {
        let mut handle = self.handle(path)?;
        handle.create(is_directory, make_parents)?;
        Ok(handle)
    }

    /// Names in the directory at `path`.
    ///
    /// # Errors
    ///
    /// `PathNotFound`, `NotADirectory`.
    pub fn list(&self, path: &str) -> Result<Vec<String>> {
        let path = parse_compressed(path)?;
        self.lock().list(&path)
    }

    /// Deletes `path`.
    ///
    /// # Errors
    ///
    /// See [`VolumeState::delete`].
    pub fn delete(&self, path: &str) -> Result<()> {
        let path = parse_compressed(path)?;
        self.lock().delete(&path)
    }

    /// Renames `from` to `to`.
    ///
    /// # Errors
    ///
    /// See [`VolumeState::rename`].
    pub fn rename(&self, from: &str, to: &str) -> Result<()> {
        let from = parse_compressed(from)?;
        let to = parse_compressed(to)?;
        self.lock().rename(&from, &to)
    }

    /// Pages holding `path`, in chain order.
    ///
    /// # Errors
    ///
    /// `PathNotFound`, `InvalidFilesystem`.
    pub fn get_page_list(&self, path: &str) -> Result<Vec<PageId>> {
        let path = parse_compressed(path)?;
        self.lock().page_list(&path)
    }

    /// First page of `path`.
    ///
    /// # Errors
    ///
    /// `PathNotFound`.
    pub fn get_start_page(&self, path: &str) -> Result<PageId> {
        let path = parse_compressed(path)?;
        Ok(self.lock().resolve(&path)?.entry.start)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bank::sim::EepromBank;
    use crate::bank::{shared, DeviceSet};
    use pretty_assertions::assert_eq;

    fn mounted(page_length: usize, pages: usize) -> Volume {
        let mut set = DeviceSet::new();
        set.insert(Device::new(0x42, vec![shared(EepromBank::new(page_length, pages))]));
        Volume::mount(&set, &[0x42], &VolumeOptions::default()).unwrap()
    }

    #[test]
    fn test_unformatted_volume_mounts_but_refuses_walks() {
        let volume = mounted(32, 8);
        assert!(!volume.is_formatted());
        let err = volume.list("/").unwrap_err();
        assert!(matches!(err, Error::InvalidFilesystem(_)));
    }

    #[test]
    fn test_format_local_bitmap() {
        let volume = mounted(32, 8);
        volume.format().unwrap();
        assert!(volume.is_formatted());
        assert!(!volume.has_pending_writes());
        assert_eq!(volume.list("/").unwrap(), Vec::<String>::new());
        assert_eq!(volume.free_memory(), 7 * 28);
    }

    #[test]
    fn test_create_list_delete() {
        let volume = mounted(32, 16);
        volume.format().unwrap();
        volume.create("/DOC", true, false).unwrap();
        drop(volume.create("/DOC/A.1", false, false).unwrap());
        drop(volume.create("/DOC/B", false, false).unwrap());
        assert_eq!(volume.list("/DOC").unwrap(), vec!["A.1", "B.0"]);

        volume.delete("/DOC/A.1").unwrap();
        assert_eq!(volume.list("/DOC").unwrap(), vec!["B.0"]);
        assert_eq!(
            volume.delete("/DOC"),
            Err(Error::DirectoryNotEmpty("/DOC".to_string()))
        );
        volume.delete("/DOC/B").unwrap();
        volume.delete("/DOC").unwrap();
        assert!(volume.list("/").unwrap().is_empty());
    }

    #[test]
    fn test_create_requires_parent() {
        let volume = mounted(32, 16);
        volume.format().unwrap();
        let err = volume.create("/X/Y", true, false).err().unwrap();
        assert!(err.is_not_found());
        volume.create("/X/Y", true, true).unwrap();
        assert_eq!(volume.list("/X").unwrap(), vec!["Y"]);
    }

    #[test]
    fn test_subdirectory_back_reference() {
        let volume = mounted(32, 16);
        volume.format().unwrap();
        volume.create("/P", true, false).unwrap();
        volume.create("/P/C", true, false).unwrap();
        let parent = volume.get_start_page("/P").unwrap();
        let child = volume.get_start_page("/P/C").unwrap();

        let mut state = volume.lock();
        let first = state.read_dir_page(child, child).unwrap();
        let back = DirEntry::decode(&first.prefix, 1).unwrap();
        assert!(back.is_back_reference());
        assert_eq!(back.start, parent);
    }

    #[test]
    fn test_rename_keeps_pages() {
        let volume = mounted(32, 16);
        volume.format().unwrap();
        drop(volume.create("/OLD.2", false, false).unwrap());
        let start = volume.get_start_page("/OLD.2").unwrap();
        volume.create("/DIR", true, false).unwrap();

        volume.rename("/OLD.2", "/DIR/NEW.3").unwrap();
        assert_eq!(volume.get_start_page("/DIR/NEW.3").unwrap(), start);
        assert!(volume.list("/").unwrap() == vec!["DIR"]);
    }

    #[test]
    fn test_failed_rename_removes_new_entry() {
        let volume = mounted(32, 16);
        volume.format().unwrap();
        drop(volume.create("/SRC.1", false, false).unwrap());
        let start = volume.get_start_page("/SRC.1").unwrap();

        let mut state = volume.lock();
        let source = state.resolve(&parse_compressed("/SRC.1").unwrap()).unwrap();
        let to = parse_compressed("/DST.1").unwrap();
        let created = state
            .create(&to, false, false, Some((source.entry.start, source.entry.count)))
            .unwrap();
        // dropping a source that no longer resolves fails after the copy exists
        let gone = parse_compressed("/GONE.1").unwrap();
        let err = state.finish_rename(&gone, &to, &source, created).unwrap_err();
        assert!(err.is_not_found());
        drop(state);

        assert_eq!(volume.list("/").unwrap(), vec!["SRC.1"]);
        assert_eq!(volume.get_start_page("/SRC.1").unwrap(), start);
    }

    #[test]
    fn test_directory_cannot_move_into_itself() {
        let volume = mounted(32, 16);
        volume.format().unwrap();
        volume.create("/A", true, false).unwrap();
        let err = volume.rename("/A", "/A/B").unwrap_err();
        assert!(matches!(err, Error::InvalidPath(_)));
    }

    #[test]
    fn test_attributes() {
        let volume = mounted(32, 16);
        volume.format().unwrap();
        drop(volume.create("/F.1", false, false).unwrap());
        volume.lock().set_attribute(&parse_compressed("/F.1").unwrap(), false, true).unwrap();
        assert_eq!(volume.delete("/F.1"), Err(Error::ReadOnly("/F.1".to_string())));
        assert_eq!(volume.list("/").unwrap(), vec!["F.1"]);
    }

    #[test]
    fn test_bitmap_file_volume_remounts() {
        let bank = shared(EepromBank::new(32, 40));
        let mut set = DeviceSet::new();
        set.insert(Device::new(7, vec![bank]));
        {
            let volume = Volume::mount(&set, &[7], &VolumeOptions::default()).unwrap();
            volume.format().unwrap();
            drop(volume.create("/KEEP", false, false).unwrap());
            volume.sync().unwrap();
        }
        let volume = Volume::mount(&set, &[7], &VolumeOptions::default()).unwrap();
        assert!(volume.is_formatted());
        assert_eq!(volume.list("/").unwrap(), vec!["KEEP.0"]);
        assert_eq!(volume.free_memory(), (40 - 3) * 28);
    }

    #[test]
    fn test_within() {
        let a = parse_compressed("/A").unwrap();
        let ab = parse_compressed("/A/B").unwrap();
        assert!(is_within(&ab, &a));
        assert!(!is_within(&a, &a));
        assert!(!is_within(&a, &ab));
    }
}
