//! File handles
//!
//! A [`FileHandle`] names one path on a [`Volume`]. It starts unresolved,
//! resolves on first use and then carries the entry it found plus, once
//! opened, a sequential cursor. Handles hold a clone of the volume, so the
//! volume's cache lives as long as any handle does.

use std::io;

use crate::common::error::{Error, Result};
use crate::fs::path::{display_path, parse_compressed, PathEntry};
use crate::fs::volume::{Cursor, Located, Volume};
use crate::storage::page_constants::PageId;
use crate::{pagefs_debug, pagefs_warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Resolution {
    Unresolved,
    Resolved(Located),
    NotFound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Closed,
    Reading(Cursor),
    Writing { start: PageId, tail: PageId, written: u64 },
}

#[derive(Debug, Clone, Copy)]
struct Mark {
    cursor: Cursor,
    limit: u64,
}

/// Handle on one path of a mounted volume.
pub struct FileHandle {
    volume: Volume,
    path: Vec<PathEntry>,
    resolution: Resolution,
    mode: Mode,
    mark: Option<Mark>,
}

impl FileHandle {
    pub(crate) fn new(volume: Volume, path: Vec<PathEntry>) -> Self {
        Self {
            volume,
            path,
            resolution: Resolution::Unresolved,
            mode: Mode::Closed,
            mark: None,
        }
    }

    /// Volume the handle lives on.
    pub fn volume(&self) -> &Volume {
        &self.volume
    }

    /// Compressed path, `/`-rooted.
    pub fn path(&self) -> String {
        display_path(&self.path)
    }

    /// Whether the handle is open for writing.
    pub fn is_writer(&self) -> bool {
        matches!(self.mode, Mode::Writing { .. })
    }

    /// Walks the path, retrying bank I/O errors up to the configured number
    /// of attempts. Hits and misses are remembered until the next refresh.
    fn resolve(&mut self) -> Result<Located> {
        match self.resolution {
            Resolution::Resolved(located) => return Ok(located),
            Resolution::NotFound => return Err(Error::not_found(self.path())),
            Resolution::Unresolved => {}
        }
        let attempts = self.volume.options().open_attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.volume.lock().resolve(&self.path) {
                Ok(located) => {
                    self.resolution = Resolution::Resolved(located);
                    return Ok(located);
                }
                Err(err) if err.is_io() && attempt < attempts => {
                    pagefs_warn!("Resolve of {} failed ({}), retrying", self.path(), err);
                    attempt += 1;
                }
                Err(err) => {
                    if err.is_not_found() {
                        self.resolution = Resolution::NotFound;
                    }
                    return Err(err);
                }
            }
        }
    }

    fn refresh(&mut self) -> Result<Located> {
        self.resolution = Resolution::Unresolved;
        self.resolve()
    }

    /// Opens for sequential reading from the start. Directories resolve but
    /// get no cursor.
    ///
    /// # Errors
    ///
    /// `PathNotFound`, or the last bank error once attempts run out.
    pub fn open(&mut self) -> Result<()> {
        self.release_writer();
        let located = self.refresh()?;
        self.mode = if located.entry.is_directory() {
            Mode::Closed
        } else {
            Mode::Reading(Cursor::at(located.entry.start))
        };
        self.mark = None;
        Ok(())
    }

    /// Opens for writing, creating a missing file. Without `append` the
    /// file is cut back to zero bytes.
    ///
    /// # Errors
    ///
    /// `NotAFile`, `ReadOnly`, `AlreadyOpenForWrite`, or any create error.
    pub fn open_write(&mut self, append: bool) -> Result<()> {
        if self.is_writer() {
            return Ok(());
        }
        let path = self.path.clone();
        let volume = self.volume.clone();
        let mut state = volume.lock();
        let mut located = match state.lookup(&path)? {
            Some(located) => located,
            None => state.create(&path, false, false, None)?,
        };
        if located.entry.is_directory() {
            return Err(Error::NotAFile(self.path()));
        }
        if located.entry.is_read_only() {
            return Err(Error::ReadOnly(self.path()));
        }
        state.register_writer(&located, &path)?;
        let tail = if append {
            state.tail_page(located.entry.start)
        } else {
            state.truncate(&mut located).map(|()| located.entry.start)
        };
        let tail = match tail {
            Ok(tail) => tail,
            Err(err) => {
                state.release_writer(located.entry.start);
                return Err(err);
            }
        };
        drop(state);

        pagefs_debug!("Opened {} for writing", self.path());
        self.resolution = Resolution::Resolved(located);
        self.mode = Mode::Writing {
            start: located.entry.start,
            tail,
            written: 0,
        };
        self.mark = None;
        Ok(())
    }

    /// Creates the entry. A new file comes back open for writing.
    ///
    /// # Errors
    ///
    /// `AlreadyExists`, `PathNotFound` for a missing parent without
    /// `make_parents`, `OutOfSpace`, ...
    pub fn create(&mut self, is_directory: bool, make_parents: bool) -> Result<()> {
        let path = self.path.clone();
        let volume = self.volume.clone();
        let mut state = volume.lock();
        let located = state.create(&path, is_directory, make_parents, None)?;
        if !is_directory {
            state.register_writer(&located, &path)?;
        }
        drop(state);

        self.resolution = Resolution::Resolved(located);
        self.mode = if is_directory {
            Mode::Closed
        } else {
            Mode::Writing {
                start: located.entry.start,
                tail: located.entry.start,
                written: 0,
            }
        };
        Ok(())
    }

    // ---- metadata ----

    fn located(&mut self) -> Result<Option<Located>> {
        match self.refresh() {
            Ok(located) => Ok(Some(located)),
            Err(err) if err.is_not_found() => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Whether the path names an entry.
    ///
    /// # Errors
    ///
    /// Any error other than a miss.
    pub fn exists(&mut self) -> Result<bool> {
        Ok(self.located()?.is_some())
    }

    /// Whether the path names a file.
    ///
    /// # Errors
    ///
    /// Any error other than a miss.
    pub fn is_file(&mut self) -> Result<bool> {
        Ok(self.located()?.is_some_and(|l| !l.entry.is_directory()))
    }

    /// Whether the path names a directory.
    ///
    /// # Errors
    ///
    /// Any error other than a miss.
    pub fn is_directory(&mut self) -> Result<bool> {
        Ok(self.located()?.is_some_and(|l| l.entry.is_directory()))
    }

    /// Whether the path names a hidden directory.
    ///
    /// # Errors
    ///
    /// Any error other than a miss.
    pub fn is_hidden(&mut self) -> Result<bool> {
        Ok(self.located()?.is_some_and(|l| l.entry.is_hidden()))
    }

    /// Whether the path names a file without the read-only bit.
    ///
    /// # Errors
    ///
    /// Any error other than a miss.
    pub fn can_write(&mut self) -> Result<bool> {
        Ok(self
            .located()?
            .is_some_and(|l| !l.entry.is_directory() && !l.entry.is_read_only()))
    }

    /// Length estimate: pages in the chain times the payload per page.
    ///
    /// # Errors
    ///
    /// `PathNotFound`.
    pub fn length(&mut self) -> Result<u64> {
        let located = self.refresh()?;
        let capacity = self.volume.lock().payload_capacity();
        Ok((located.entry.count * capacity) as u64)
    }

    /// Entry names of this directory.
    ///
    /// # Errors
    ///
    /// `PathNotFound`, `NotADirectory`.
    pub fn list(&self) -> Result<Vec<String>> {
        self.volume.lock().list(&self.path)
    }

    /// Deletes the entry.
    ///
    /// # Errors
    ///
    /// `ReadOnly`, `AlreadyOpenForWrite`, `DirectoryNotEmpty`, ...
    pub fn delete(&mut self) -> Result<()> {
        if self.is_writer() {
            return Err(Error::AlreadyOpenForWrite(self.path()));
        }
        self.volume.lock().delete(&self.path)?;
        self.resolution = Resolution::Unresolved;
        self.mode = Mode::Closed;
        Ok(())
    }

    /// Moves the entry to `dest`; the handle follows it.
    ///
    /// # Errors
    ///
    /// `InvalidPath`, `AlreadyExists`, `ReadOnly`, `AlreadyOpenForWrite`, ...
    pub fn rename_to(&mut self, dest: &str) -> Result<()> {
        let dest = parse_compressed(dest)?;
        self.volume.lock().rename(&self.path, &dest)?;
        self.path = dest;
        self.resolution = Resolution::Unresolved;
        self.mode = Mode::Closed;
        self.mark = None;
        Ok(())
    }

    /// Sets the read-only bit on a file.
    ///
    /// # Errors
    ///
    /// `PathNotFound`, `NotAFile`.
    pub fn set_read_only(&mut self) -> Result<()> {
        self.volume.lock().set_attribute(&self.path, false, true)
    }

    /// Sets the hidden bit on a directory.
    ///
    /// # Errors
    ///
    /// `PathNotFound`, `NotADirectory`.
    pub fn set_hidden(&mut self, hidden: bool) -> Result<()> {
        self.volume.lock().set_attribute(&self.path, true, hidden)
    }

    /// Pages of the entry's chain.
    ///
    /// # Errors
    ///
    /// `PathNotFound`.
    pub fn page_list(&self) -> Result<Vec<PageId>> {
        self.volume.lock().page_list(&self.path)
    }

    // ---- streaming ----

    fn reader(&mut self) -> Result<&mut Cursor> {
        if let Mode::Closed = self.mode {
            self.open()?;
        }
        match &mut self.mode {
            Mode::Reading(cursor) => Ok(cursor),
            Mode::Writing { .. } => Err(Error::io(format!(
                "{} is open for writing",
                display_path(&self.path)
            ))),
            Mode::Closed => Err(Error::NotAFile(display_path(&self.path))),
        }
    }

    /// Reads up to `buf.len()` bytes; 0 means end of file.
    ///
    /// # Errors
    ///
    /// `NotAFile` on a directory, or a page error.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let volume = self.volume.clone();
        let cursor = self.reader()?;
        let n = volume.lock().read_at(cursor, buf)?;
        Ok(n)
    }

    /// Skips up to `n` bytes and returns how many were skipped.
    ///
    /// # Errors
    ///
    /// As [`read`](Self::read).
    pub fn skip(&mut self, n: u64) -> Result<u64> {
        let mut scratch = [0u8; 256];
        let mut skipped = 0;
        while skipped < n {
            let want = usize::try_from(n - skipped).map_or(scratch.len(), |r| r.min(scratch.len()));
            let got = self.read(&mut scratch[..want])?;
            if got == 0 {
                break;
            }
            skipped += got as u64;
        }
        Ok(skipped)
    }

    /// Remembers the read position. [`reset`](Self::reset) returns to it
    /// while at most `limit` bytes have been consumed since.
    pub fn mark(&mut self, limit: u64) {
        self.mark = match self.mode {
            Mode::Reading(cursor) => Some(Mark { cursor, limit }),
            _ => None,
        };
    }

    /// Returns to the marked position.
    ///
    /// # Errors
    ///
    /// `MarkInvalidated` without a mark or after reading past its limit.
    pub fn reset(&mut self) -> Result<()> {
        let Some(mark) = self.mark else {
            return Err(Error::MarkInvalidated);
        };
        let Mode::Reading(cursor) = &mut self.mode else {
            return Err(Error::MarkInvalidated);
        };
        if cursor.position - mark.cursor.position > mark.limit {
            self.mark = None;
            return Err(Error::MarkInvalidated);
        }
        *cursor = mark.cursor;
        Ok(())
    }

    /// Bytes read or written through this handle since it was opened.
    pub fn position(&self) -> u64 {
        match self.mode {
            Mode::Reading(cursor) => cursor.position,
            Mode::Writing { written, .. } => written,
            Mode::Closed => 0,
        }
    }

    /// Appends `buf` to the file.
    ///
    /// # Errors
    ///
    /// `OutOfSpace` when the volume fills up; the bytes that fit are kept
    /// and later writes continue after them. Writing on a handle that is
    /// not open for writing is an `Io` error.
    pub fn write(&mut self, buf: &[u8]) -> Result<()> {
        let Mode::Writing { tail, written, .. } = &mut self.mode else {
            return Err(Error::io(format!(
                "{} is not open for writing",
                display_path(&self.path)
            )));
        };
        self.volume.lock().append(&self.path, tail, written, buf)
    }

    /// Flushes the whole volume.
    ///
    /// # Errors
    ///
    /// See [`Volume::sync`].
    pub fn sync(&self) -> Result<()> {
        self.volume.sync()
    }

    fn release_writer(&mut self) {
        if let Mode::Writing { start, .. } = self.mode {
            self.volume.lock().release_writer(start);
            self.mode = Mode::Closed;
        }
    }

    /// Ends reading or writing. Closing a writer flushes the volume when
    /// the volume was mounted with `sync_on_close`.
    ///
    /// # Errors
    ///
    /// Any error of the flush.
    pub fn close(&mut self) -> Result<()> {
        let was_writer = self.is_writer();
        self.release_writer();
        self.mode = Mode::Closed;
        self.mark = None;
        if was_writer && self.volume.options().sync_on_close {
            self.volume.sync()?;
        }
        Ok(())
    }
}

impl Drop for FileHandle {
    fn drop(&mut self) {
        self.release_writer();
    }
}

impl io::Read for FileHandle {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        FileHandle::read(self, buf).map_err(io::Error::from)
    }
}

impl io::Write for FileHandle {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        FileHandle::write(self, buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.sync().map_err(io::Error::from)
    }
}
