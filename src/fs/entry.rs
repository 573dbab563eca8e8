//! Directory entry codec
//!
//! On media an entry is `name[4] ext start[N] count[N]`, pointers little
//! endian, N fixed per volume.

use crate::common::error::{Error, Result};
use crate::fs::path::{display_name, entry_equals, PathEntry};
use crate::storage::packet::{read_pointer, write_pointer};
use crate::storage::page_constants::{
    entry_len, PageId, EXT_ATTRIBUTE_BIT, EXT_DIRECTORY, NAME_EXT_LEN, NAME_LEN, NAME_PAD,
};

const BACK_REFERENCE_NAME: [u8; NAME_LEN] = [b'.', b'.', NAME_PAD, NAME_PAD];

/// One directory entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirEntry {
    /// Space-padded name
    pub name: [u8; NAME_LEN],
    /// Extension byte including the attribute bit
    pub ext: u8,
    /// First page of the entry's chain
    pub start: PageId,
    /// Pages in the chain (files); 0 for directories
    pub count: usize,
}

impl DirEntry {
    /// Entry standing for the root directory itself.
    pub fn root() -> Self {
        Self {
            name: [NAME_PAD; NAME_LEN],
            ext: EXT_DIRECTORY,
            start: 0,
            count: 0,
        }
    }

    /// Header entry of a sub-directory's first page, pointing at the parent.
    pub fn back_reference(parent_start: PageId) -> Self {
        Self {
            name: BACK_REFERENCE_NAME,
            ext: EXT_DIRECTORY,
            start: parent_start,
            count: 0,
        }
    }

    /// Decodes one entry from the front of `bytes`.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidFilesystem` if `bytes` is too short.
    pub fn decode(bytes: &[u8], pointer_len: usize) -> Result<Self> {
        if bytes.len() < entry_len(pointer_len) {
            return Err(Error::invalid_filesystem(format!(
                "directory entry truncated at {} bytes",
                bytes.len()
            )));
        }
        let mut name = [0; NAME_LEN];
        name.copy_from_slice(&bytes[..NAME_LEN]);
        Ok(Self {
            name,
            ext: bytes[NAME_LEN],
            start: read_pointer(&bytes[NAME_EXT_LEN..], pointer_len),
            count: read_pointer(&bytes[NAME_EXT_LEN + pointer_len..], pointer_len),
        })
    }

    /// Appends the encoded entry to `out`.
    pub fn encode_into(&self, out: &mut Vec<u8>, pointer_len: usize) {
        out.extend_from_slice(&self.name);
        out.push(self.ext);
        let at = out.len();
        out.resize(at + 2 * pointer_len, 0);
        write_pointer(&mut out[at..], pointer_len, self.start);
        write_pointer(&mut out[at + pointer_len..], pointer_len, self.count);
    }

    /// Encoded entry.
    pub fn encode(&self, pointer_len: usize) -> Vec<u8> {
        let mut out = Vec::with_capacity(entry_len(pointer_len));
        self.encode_into(&mut out, pointer_len);
        out
    }

    /// Whether this entry is a directory.
    pub fn is_directory(&self) -> bool {
        self.ext & !EXT_ATTRIBUTE_BIT == EXT_DIRECTORY
    }

    /// File extension without the attribute bit.
    pub fn extension(&self) -> u8 {
        self.ext & !EXT_ATTRIBUTE_BIT
    }

    /// Read-only bit (files only).
    pub fn is_read_only(&self) -> bool {
        !self.is_directory() && self.ext & EXT_ATTRIBUTE_BIT != 0
    }

    /// Hidden bit (directories only).
    pub fn is_hidden(&self) -> bool {
        self.is_directory() && self.ext & EXT_ATTRIBUTE_BIT != 0
    }

    /// Sets or clears the attribute bit.
    pub fn set_attribute(&mut self, on: bool) {
        if on {
            self.ext |= EXT_ATTRIBUTE_BIT;
        } else {
            self.ext &= !EXT_ATTRIBUTE_BIT;
        }
    }

    /// Whether this is a sub-directory's parent back-reference.
    pub fn is_back_reference(&self) -> bool {
        self.name == BACK_REFERENCE_NAME
    }

    /// Whether `segment` names this entry.
    pub fn matches(&self, segment: &PathEntry) -> bool {
        match segment {
            PathEntry::Name { name, ext } => entry_equals(name, *ext, &self.name, self.ext),
            PathEntry::Current | PathEntry::Parent => false,
        }
    }

    /// Name as listed: `NAME.ext` for files, `NAME` for directories.
    pub fn display_name(&self) -> String {
        display_name(&self.name, self.ext)
    }
}

/// Decodes consecutive entries filling `bytes`.
///
/// # Errors
///
/// Returns `Error::InvalidFilesystem` if `bytes` is not a whole number of
/// entries.
pub fn decode_entries(bytes: &[u8], pointer_len: usize) -> Result<Vec<DirEntry>> {
    let width = entry_len(pointer_len);
    if bytes.len() % width != 0 {
        return Err(Error::invalid_filesystem(format!(
            "{} bytes of directory entries is not a multiple of {width}",
            bytes.len()
        )));
    }
    bytes
        .chunks(width)
        .map(|chunk| DirEntry::decode(chunk, pointer_len))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::path::parse_path;
    use crate::storage::page_constants::EXT_UNKNOWN;
    use pretty_assertions::assert_eq;

    fn file(name: &str, ext: u8, start: PageId, count: usize) -> DirEntry {
        let mut padded = [NAME_PAD; NAME_LEN];
        padded[..name.len()].copy_from_slice(name.as_bytes());
        DirEntry {
            name: padded,
            ext,
            start,
            count,
        }
    }

    #[test]
    fn test_short_pointer_layout() {
        let entry = file("TEXT", 0, 5, 2);
        assert_eq!(entry.encode(1), b"TEXT\x00\x05\x02");
    }

    #[test]
    fn test_long_pointer_layout() {
        let entry = file("AB", 7, 0x0123, 0x0201);
        assert_eq!(entry.encode(2), b"AB  \x07\x23\x01\x01\x02");
        assert_eq!(DirEntry::decode(&entry.encode(2), 2).unwrap(), entry);
    }

    #[test]
    fn test_decode_entries_rejects_partial() {
        let mut bytes = file("A", 0, 1, 1).encode(1);
        bytes.push(0);
        assert!(decode_entries(&bytes, 1).is_err());
        assert_eq!(decode_entries(&bytes[..7], 1).unwrap().len(), 1);
    }

    #[test]
    fn test_attributes() {
        let mut entry = file("RO", 3, 1, 1);
        assert!(!entry.is_read_only());
        entry.set_attribute(true);
        assert!(entry.is_read_only());
        assert!(!entry.is_hidden());
        assert_eq!(entry.extension(), 3);

        let mut dir = file("DOC", EXT_DIRECTORY, 2, 0);
        dir.set_attribute(true);
        assert!(dir.is_directory());
        assert!(dir.is_hidden());
        assert!(!dir.is_read_only());
    }

    #[test]
    fn test_back_reference() {
        let back = DirEntry::back_reference(9);
        assert!(back.is_back_reference());
        assert!(back.is_directory());
        assert_eq!(back.encode(1), b"..  \x7F\x09\x00");
    }

    #[test]
    fn test_matches_unknown_extension() {
        let segments = parse_path("TEXT/TEXT.0/TEXT.4").unwrap();
        let stored = file("TEXT", 0, 1, 1);
        assert!(stored.matches(&segments[0]));
        assert!(stored.matches(&segments[1]));
        assert!(!stored.matches(&segments[2]));

        let dir = file("TEXT", EXT_DIRECTORY, 1, 0);
        assert!(dir.matches(&PathEntry::named(dir.name, EXT_UNKNOWN)));
        assert_eq!(dir.display_name(), "TEXT");
        assert_eq!(stored.display_name(), "TEXT.0");
    }
}
