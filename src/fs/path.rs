//! Path parsing
//!
//! A path is a `/`-separated list of segments. Each segment is a name of at
//! most four printable characters, optionally followed by `.` and a decimal
//! extension in `0..=102`. A segment without an extension may name either a
//! directory or a file with extension 0, so its extension is left as
//! [`EXT_UNKNOWN`] until matched against the media.

use std::fmt;

use crate::common::error::{Error, Result};
use crate::storage::page_constants::{
    EXT_ATTRIBUTE_BIT, EXT_DIRECTORY, EXT_MAX_FILE, EXT_UNKNOWN, NAME_LEN, NAME_PAD,
};

/// One parsed path segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathEntry {
    /// `.`
    Current,
    /// `..`
    Parent,
    /// A named entry
    Name {
        /// Space-padded name
        name: [u8; NAME_LEN],
        /// Extension, `EXT_UNKNOWN` if the segment had none
        ext: u8,
    },
}

impl PathEntry {
    /// A named entry from already-validated parts.
    pub fn named(name: [u8; NAME_LEN], ext: u8) -> Self {
        PathEntry::Name { name, ext }
    }
}

impl fmt::Display for PathEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathEntry::Current => f.write_str("."),
            PathEntry::Parent => f.write_str(".."),
            PathEntry::Name { name, ext } => f.write_str(&display_name(name, *ext)),
        }
    }
}

/// `NAME.ext` for files, `NAME` for directories and unresolved segments.
pub fn display_name(name: &[u8; NAME_LEN], ext: u8) -> String {
    let trimmed: String = name
        .iter()
        .copied()
        .take_while(|&b| b != NAME_PAD)
        .map(char::from)
        .collect();
    match ext & !EXT_ATTRIBUTE_BIT {
        EXT_DIRECTORY | EXT_UNKNOWN => trimmed,
        file_ext => format!("{trimmed}.{file_ext}"),
    }
}

/// `/A/B.1` rendering of a compressed path.
pub fn display_path(entries: &[PathEntry]) -> String {
    if entries.is_empty() {
        return "/".to_string();
    }
    entries.iter().map(|e| format!("/{e}")).collect()
}

fn is_printable(b: u8) -> bool {
    (0x21..=0x7E).contains(&b)
}

fn parse_segment(segment: &str, path: &str) -> Result<PathEntry> {
    match segment {
        "." => return Ok(PathEntry::Current),
        ".." => return Ok(PathEntry::Parent),
        _ => {}
    }
    if let Some(bad) = segment.bytes().find(|&b| !is_printable(b)) {
        return Err(Error::invalid_path(format!(
            "{path}: byte 0x{bad:02X} is not printable"
        )));
    }

    let (name, ext) = match segment.split_once('.') {
        None => (segment, EXT_UNKNOWN),
        Some((name, ext)) => {
            if ext.is_empty() || !ext.bytes().all(|b| b.is_ascii_digit()) {
                return Err(Error::invalid_path(format!(
                    "{path}: malformed extension in '{segment}'"
                )));
            }
            let value: u32 = ext
                .parse()
                .map_err(|_| Error::invalid_path(format!("{path}: extension too long")))?;
            let value = u8::try_from(value)
                .ok()
                .filter(|&v| v <= EXT_MAX_FILE)
                .ok_or_else(|| {
                    Error::invalid_path(format!(
                        "{path}: extension {value} is outside 0..={EXT_MAX_FILE}"
                    ))
                })?;
            (name, value)
        }
    };

    if name.is_empty() || name.len() > NAME_LEN {
        return Err(Error::invalid_path(format!(
            "{path}: name '{name}' must be 1 to {NAME_LEN} characters"
        )));
    }

    let mut padded = [NAME_PAD; NAME_LEN];
    padded[..name.len()].copy_from_slice(name.as_bytes());
    Ok(PathEntry::named(padded, ext))
}

/// Splits `text` into segments.
///
/// A single leading and a single trailing `/` are ignored; `""` and `"/"`
/// name the root.
///
/// # Errors
///
/// Returns `Error::InvalidPath` on an empty segment, a name longer than four
/// characters, a malformed or out-of-range extension, or a byte outside
/// printable ASCII.
pub fn parse_path(text: &str) -> Result<Vec<PathEntry>> {
    let trimmed = text.strip_prefix('/').unwrap_or(text);
    let trimmed = trimmed.strip_suffix('/').unwrap_or(trimmed);
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }
    trimmed
        .split('/')
        .map(|segment| {
            if segment.is_empty() {
                Err(Error::invalid_path(format!("{text}: empty segment")))
            } else {
                parse_segment(segment, text)
            }
        })
        .collect()
}

/// Drops `.` and resolves `..` against the preceding segment.
///
/// # Errors
///
/// Returns `Error::InvalidPath` if `..` climbs above the root.
pub fn compress(entries: &[PathEntry]) -> Result<Vec<PathEntry>> {
    let mut out = Vec::with_capacity(entries.len());
    for entry in entries {
        match entry {
            PathEntry::Current => {}
            PathEntry::Parent => {
                if out.pop().is_none() {
                    return Err(Error::invalid_path("'..' climbs above the root"));
                }
            }
            PathEntry::Name { .. } => out.push(*entry),
        }
    }
    Ok(out)
}

/// Parses and compresses in one go.
///
/// # Errors
///
/// See [`parse_path`] and [`compress`].
pub fn parse_compressed(text: &str) -> Result<Vec<PathEntry>> {
    compress(&parse_path(text)?)
}

/// Whether a path segment names a stored entry.
///
/// Names compare byte for byte. The attribute bit is ignored, and an
/// unknown extension matches both a directory and a file with extension 0.
pub fn entry_equals(
    a_name: &[u8; NAME_LEN],
    a_ext: u8,
    b_name: &[u8; NAME_LEN],
    b_ext: u8,
) -> bool {
    if a_name != b_name {
        return false;
    }
    let a = a_ext & !EXT_ATTRIBUTE_BIT;
    let b = b_ext & !EXT_ATTRIBUTE_BIT;
    match (a, b) {
        (EXT_UNKNOWN, other) | (other, EXT_UNKNOWN) => {
            other == EXT_UNKNOWN || other == EXT_DIRECTORY || other == 0
        }
        _ => a == b,
    }
}
