//! Root directory header
//!
//! The first page of the root directory opens with a header:
//!
//! ```text
//! control  0xA0 | 0xB0 (single | multi device), | 0x0A | 0x0B (1 | 2 byte pointers)
//! flags    0x80 bitmap file, 0x40 device map file, 0x20 satellite, 0x10 device bitmap
//! bitmap   local: 4 bytes | file: start[N] count[N] | device: nothing
//! map      multi-device only. inline: count, count x 8-byte address | file: start[N] count[N]
//! ```
//!
//! A satellite device's root page holds only `control, 0x20, master[8]`.

use crate::bank::DeviceAddress;
use crate::common::error::{Error, Result};
use crate::storage::packet::{read_pointer, write_pointer};
use crate::storage::page_constants::{
    PageId, ADDRESS_LEN, CTRL_LONG_POINTER, CTRL_MULTI_DEVICE, CTRL_SHORT_POINTER,
    CTRL_SINGLE_DEVICE, FLAG_BITMAP_FILE, FLAG_CACHE_BITMAP, FLAG_DEVICE_MAP_FILE,
    FLAG_SATELLITE, LOCAL_BITMAP_LEN,
};
use crate::storage::page_state::BitmapStrategy;

const KNOWN_FLAGS: u8 = FLAG_BITMAP_FILE | FLAG_DEVICE_MAP_FILE | FLAG_SATELLITE | FLAG_CACHE_BITMAP;

/// Where the page bitmap lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BitmapLocation {
    /// Device status memory
    CacheOwned,
    /// Inside this header
    Local([u8; LOCAL_BITMAP_LEN]),
    /// In its own chain
    File {
        /// First page
        start: PageId,
        /// Pages in the chain
        count: usize,
    },
}

impl BitmapLocation {
    /// Strategy this location belongs to.
    pub fn strategy(&self) -> BitmapStrategy {
        match self {
            BitmapLocation::CacheOwned => BitmapStrategy::CacheOwned,
            BitmapLocation::Local(_) => BitmapStrategy::Local,
            BitmapLocation::File { .. } => BitmapStrategy::File,
        }
    }
}

/// Where the device map of a multi-device volume lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceMapLocation {
    /// Inside this header
    Inline(Vec<DeviceAddress>),
    /// In its own chain
    File {
        /// First page
        start: PageId,
        /// Pages in the chain
        count: usize,
    },
}

/// Header of a master (or single-device) root page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RootHeader {
    /// Page-pointer width
    pub pointer_len: usize,
    /// Bitmap location
    pub bitmap: BitmapLocation,
    /// Device map, present on multi-device volumes
    pub device_map: Option<DeviceMapLocation>,
}

/// Decoded root page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RootRecord {
    /// Root of a volume
    Master(RootHeader),
    /// Back-reference from a satellite device to its master
    Satellite {
        /// Page-pointer width of the whole volume
        pointer_len: usize,
        /// Address of the master device
        master: DeviceAddress,
    },
}

/// Outcome of checking a root page against the devices it was read from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeaderCheck {
    /// Header matches; the volume is ready
    Valid,
    /// No filesystem on the root page
    Unformatted,
    /// The volume must be rebuilt over these devices, master first
    Redirect(Vec<DeviceAddress>),
    /// The root page checks but its header is unusable; only a format helps
    Damaged(String),
}

fn width_nibble(pointer_len: usize) -> u8 {
    if pointer_len == 1 {
        CTRL_SHORT_POINTER
    } else {
        CTRL_LONG_POINTER
    }
}

fn take<'a>(data: &'a [u8], at: &mut usize, len: usize, what: &str) -> Result<&'a [u8]> {
    let bytes = data
        .get(*at..*at + len)
        .ok_or_else(|| Error::invalid_filesystem(format!("root header truncated in {what}")))?;
    *at += len;
    Ok(bytes)
}

fn read_address(bytes: &[u8]) -> DeviceAddress {
    let mut raw = [0; ADDRESS_LEN];
    raw.copy_from_slice(&bytes[..ADDRESS_LEN]);
    DeviceAddress::from_le_bytes(raw)
}

/// `count, addresses...` encoding shared by the inline map and the map file.
///
/// # Errors
///
/// Returns `Error::InvalidTopology` with more than 255 devices.
pub fn encode_device_map(addresses: &[DeviceAddress]) -> Result<Vec<u8>> {
    let count = u8::try_from(addresses.len())
        .map_err(|_| Error::invalid_topology("a volume spans at most 255 devices"))?;
    let mut out = Vec::with_capacity(1 + addresses.len() * ADDRESS_LEN);
    out.push(count);
    for address in addresses {
        out.extend_from_slice(&address.to_le_bytes());
    }
    Ok(out)
}

/// Decodes a device map, returning the addresses and the bytes consumed.
///
/// # Errors
///
/// Returns `Error::InvalidFilesystem` if the map is truncated or empty.
pub fn decode_device_map(bytes: &[u8]) -> Result<(Vec<DeviceAddress>, usize)> {
    let mut at = 0;
    let count = usize::from(take(bytes, &mut at, 1, "device map")?[0]);
    if count == 0 {
        return Err(Error::invalid_filesystem("device map is empty"));
    }
    let addresses = (0..count)
        .map(|_| take(bytes, &mut at, ADDRESS_LEN, "device map").map(read_address))
        .collect::<Result<Vec<_>>>()?;
    Ok((addresses, at))
}

impl RootHeader {
    /// Whether the volume spans several devices.
    pub fn is_multi_device(&self) -> bool {
        self.device_map.is_some()
    }

    /// Encoded header.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidTopology` if an inline map is too large.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let topology = if self.is_multi_device() {
            CTRL_MULTI_DEVICE
        } else {
            CTRL_SINGLE_DEVICE
        };
        let n = self.pointer_len;
        let mut out = vec![topology | width_nibble(n), 0];

        match &self.bitmap {
            BitmapLocation::CacheOwned => out[1] |= FLAG_CACHE_BITMAP,
            BitmapLocation::Local(bytes) => out.extend_from_slice(bytes),
            BitmapLocation::File { start, count } => {
                out[1] |= FLAG_BITMAP_FILE;
                push_pair(&mut out, n, *start, *count);
            }
        }

        match &self.device_map {
            None => {}
            Some(DeviceMapLocation::Inline(addresses)) => {
                out.extend_from_slice(&encode_device_map(addresses)?);
            }
            Some(DeviceMapLocation::File { start, count }) => {
                out[1] |= FLAG_DEVICE_MAP_FILE;
                push_pair(&mut out, n, *start, *count);
            }
        }
        Ok(out)
    }
}

fn push_pair(out: &mut Vec<u8>, n: usize, start: PageId, count: usize) {
    let at = out.len();
    out.resize(at + 2 * n, 0);
    write_pointer(&mut out[at..], n, start);
    write_pointer(&mut out[at + n..], n, count);
}

fn read_pair(data: &[u8], at: &mut usize, n: usize, what: &str) -> Result<(PageId, usize)> {
    let bytes = take(data, at, 2 * n, what)?;
    Ok((read_pointer(bytes, n), read_pointer(&bytes[n..], n)))
}

/// Encoded satellite root.
pub fn encode_satellite(pointer_len: usize, master: DeviceAddress) -> Vec<u8> {
    let mut out = vec![CTRL_MULTI_DEVICE | width_nibble(pointer_len), FLAG_SATELLITE];
    out.extend_from_slice(&master.to_le_bytes());
    out
}

impl RootRecord {
    /// Decodes the front of a root page, returning the record and the header
    /// length in bytes.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidFilesystem` on an unknown marker, an
    /// inconsistent flag combination or a truncated header.
    pub fn decode(data: &[u8]) -> Result<(Self, usize)> {
        let mut at = 0;
        let control = take(data, &mut at, 2, "control bytes")?;
        let (control, flags) = (control[0], control[1]);

        let multi = match control & 0xF0 {
            CTRL_SINGLE_DEVICE => false,
            CTRL_MULTI_DEVICE => true,
            other => {
                return Err(Error::invalid_filesystem(format!(
                    "unknown topology marker 0x{other:02X}"
                )))
            }
        };
        let pointer_len = match control & 0x0F {
            CTRL_SHORT_POINTER => 1,
            CTRL_LONG_POINTER => 2,
            other => {
                return Err(Error::invalid_filesystem(format!(
                    "unknown pointer-width marker 0x{other:02X}"
                )))
            }
        };
        if flags & !KNOWN_FLAGS != 0 {
            return Err(Error::invalid_filesystem(format!(
                "unknown root flags 0x{flags:02X}"
            )));
        }

        if flags & FLAG_SATELLITE != 0 {
            if !multi || flags != FLAG_SATELLITE {
                return Err(Error::invalid_filesystem(format!(
                    "satellite root with control 0x{control:02X} flags 0x{flags:02X}"
                )));
            }
            let master = read_address(take(data, &mut at, ADDRESS_LEN, "master address")?);
            return Ok((
                RootRecord::Satellite {
                    pointer_len,
                    master,
                },
                at,
            ));
        }

        let bitmap = match (flags & FLAG_CACHE_BITMAP != 0, flags & FLAG_BITMAP_FILE != 0) {
            (true, true) => {
                return Err(Error::invalid_filesystem(
                    "root claims both a device bitmap and a bitmap file",
                ))
            }
            (true, false) => BitmapLocation::CacheOwned,
            (false, true) => {
                let (start, count) = read_pair(data, &mut at, pointer_len, "bitmap file")?;
                BitmapLocation::File { start, count }
            }
            (false, false) => {
                let mut bytes = [0; LOCAL_BITMAP_LEN];
                bytes.copy_from_slice(take(data, &mut at, LOCAL_BITMAP_LEN, "local bitmap")?);
                BitmapLocation::Local(bytes)
            }
        };

        let device_map = match (multi, flags & FLAG_DEVICE_MAP_FILE != 0) {
            (false, true) => {
                return Err(Error::invalid_filesystem(
                    "single-device root names a device map file",
                ))
            }
            (false, false) => None,
            (true, true) => {
                let (start, count) = read_pair(data, &mut at, pointer_len, "device map file")?;
                Some(DeviceMapLocation::File { start, count })
            }
            (true, false) => {
                let (addresses, used) = decode_device_map(&data[at..])?;
                at += used;
                Some(DeviceMapLocation::Inline(addresses))
            }
        };

        Ok((
            RootRecord::Master(RootHeader {
                pointer_len,
                bitmap,
                device_map,
            }),
            at,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn decode_master(data: &[u8]) -> (RootHeader, usize) {
        match RootRecord::decode(data).unwrap() {
            (RootRecord::Master(header), len) => (header, len),
            (other, _) => panic!("expected master root, got {other:?}"),
        }
    }

    #[test]
    fn test_local_bitmap_header() {
        let header = RootHeader {
            pointer_len: 1,
            bitmap: BitmapLocation::Local([0x03, 0, 0, 0x80]),
            device_map: None,
        };
        let bytes = header.encode().unwrap();
        assert_eq!(bytes, vec![0xAA, 0x00, 0x03, 0x00, 0x00, 0x80]);
        assert_eq!(decode_master(&bytes), (header, 6));
    }

    #[test]
    fn test_bitmap_file_long_pointers() {
        let header = RootHeader {
            pointer_len: 2,
            bitmap: BitmapLocation::File {
                start: 0x0102,
                count: 1,
            },
            device_map: None,
        };
        let bytes = header.encode().unwrap();
        assert_eq!(bytes, vec![0xAB, 0x80, 0x02, 0x01, 0x01, 0x00]);
        assert_eq!(decode_master(&bytes).0, header);
    }

    #[test]
    fn test_multi_device_inline_map() {
        let header = RootHeader {
            pointer_len: 1,
            bitmap: BitmapLocation::CacheOwned,
            device_map: Some(DeviceMapLocation::Inline(vec![0x11, 0x22])),
        };
        let mut bytes = header.encode().unwrap();
        assert_eq!(&bytes[..3], &[0xBA, 0x10, 0x02]);
        assert_eq!(bytes.len(), 3 + 16);

        bytes.push(0x00);
        let (decoded, len) = decode_master(&bytes);
        assert_eq!(decoded, header);
        assert_eq!(len, 19);
    }

    #[test]
    fn test_multi_device_map_file() {
        let header = RootHeader {
            pointer_len: 1,
            bitmap: BitmapLocation::File { start: 1, count: 2 },
            device_map: Some(DeviceMapLocation::File { start: 3, count: 1 }),
        };
        let bytes = header.encode().unwrap();
        assert_eq!(bytes, vec![0xBA, 0xC0, 1, 2, 3, 1]);
        assert_eq!(decode_master(&bytes).0, header);
    }

    #[test]
    fn test_satellite_record() {
        let bytes = encode_satellite(2, 0x0102_0304_0506_0708);
        assert_eq!(&bytes[..2], &[0xBB, 0x20]);
        assert_eq!(
            RootRecord::decode(&bytes).unwrap(),
            (
                RootRecord::Satellite {
                    pointer_len: 2,
                    master: 0x0102_0304_0506_0708
                },
                10
            )
        );
    }

    #[test]
    fn test_invalid_markers() {
        for bad in [
            vec![0xCA, 0x00, 0, 0, 0, 0],
            vec![0xAC, 0x00, 0, 0, 0, 0],
            vec![0xAA, 0x90, 1, 1],
            vec![0xAA, 0x40, 0, 0, 0, 0],
            vec![0xAA, 0x20, 0, 0, 0, 0, 0, 0, 0, 0],
            vec![0xAA, 0x01, 0, 0, 0, 0],
            vec![0xAA, 0x00, 0],
            vec![0xBA, 0x10, 0x00],
        ] {
            let err = RootRecord::decode(&bad).unwrap_err();
            assert!(matches!(err, Error::InvalidFilesystem(_)), "{bad:02X?}");
        }
    }

    #[test]
    fn test_device_map_codec() {
        let bytes = encode_device_map(&[1, 2, 3]).unwrap();
        assert_eq!(bytes.len(), 25);
        assert_eq!(decode_device_map(&bytes).unwrap(), (vec![1, 2, 3], 25));
        assert!(decode_device_map(&bytes[..10]).is_err());
    }
}
