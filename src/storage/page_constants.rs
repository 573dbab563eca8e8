//! On-media constants shared by the cache and the directory layer

/// Volume-wide logical page index
pub type PageId = usize;

/// Page pointer that terminates a chain and marks "not redirected"
pub const NULL_PAGE: PageId = 0;

/// Page holding the root directory header
pub const ROOT_PAGE: PageId = 0;

/// Bytes a packet adds around its payload: length byte + CRC16 footer
pub const PACKET_OVERHEAD: usize = 3;

/// Value of unprogrammed memory
pub const ERASED_BYTE: u8 = 0xFF;

/// Volumes up to this many pages use 1-byte page pointers
pub const SHORT_POINTER_MAX_PAGES: usize = 256;

/// Volumes up to this many pages keep the page bitmap in the root header
pub const LOCAL_BITMAP_MAX_PAGES: usize = 32;

/// Bytes of the local bitmap in the root header
pub const LOCAL_BITMAP_LEN: usize = LOCAL_BITMAP_MAX_PAGES / 8;

/// Characters in an entry name
pub const NAME_LEN: usize = 4;

/// Name plus extension byte
pub const NAME_EXT_LEN: usize = NAME_LEN + 1;

/// Name padding
pub const NAME_PAD: u8 = b' ';

/// Extension of a directory entry
pub const EXT_DIRECTORY: u8 = 0x7F;

/// Extension not yet decided (file extension 0 or directory)
pub const EXT_UNKNOWN: u8 = 0x7E;

/// Highest file extension
pub const EXT_MAX_FILE: u8 = 102;

/// Read-only bit on files, hidden bit on directories
pub const EXT_ATTRIBUTE_BIT: u8 = 0x80;

/// Root control byte: single-device topology
pub const CTRL_SINGLE_DEVICE: u8 = 0xA0;

/// Root control byte: multi-device topology
pub const CTRL_MULTI_DEVICE: u8 = 0xB0;

/// Root control byte: 1-byte page pointers
pub const CTRL_SHORT_POINTER: u8 = 0x0A;

/// Root control byte: 2-byte page pointers
pub const CTRL_LONG_POINTER: u8 = 0x0B;

/// Root flags: bitmap lives in its own file
pub const FLAG_BITMAP_FILE: u8 = 0x80;

/// Root flags: device map lives in its own file
pub const FLAG_DEVICE_MAP_FILE: u8 = 0x40;

/// Root flags: this root is a satellite back-reference
pub const FLAG_SATELLITE: u8 = 0x20;

/// Root flags: bitmap kept by the device status memory
pub const FLAG_CACHE_BITMAP: u8 = 0x10;

/// Bytes of a device address on media
pub const ADDRESS_LEN: usize = 8;

/// Page-pointer width for a volume of `total_pages`
pub fn pointer_len(total_pages: usize) -> usize {
    if total_pages > SHORT_POINTER_MAX_PAGES {
        2
    } else {
        1
    }
}

/// Directory entry width for a pointer width
pub fn entry_len(pointer_len: usize) -> usize {
    NAME_EXT_LEN + 2 * pointer_len
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pointer_width_threshold() {
        assert_eq!(pointer_len(0), 1);
        assert_eq!(pointer_len(256), 1);
        assert_eq!(pointer_len(257), 2);
    }

    #[test]
    fn test_entry_width() {
        assert_eq!(entry_len(1), 7);
        assert_eq!(entry_len(2), 9);
    }

    #[test]
    fn test_local_bitmap_covers_limit() {
        assert_eq!(LOCAL_BITMAP_LEN * 8, LOCAL_BITMAP_MAX_PAGES);
    }

    #[test]
    fn test_control_nibbles_disjoint() {
        assert_eq!(CTRL_SINGLE_DEVICE & 0x0F, 0);
        assert_eq!(CTRL_MULTI_DEVICE & 0x0F, 0);
        assert_eq!(CTRL_SHORT_POINTER & 0xF0, 0);
        assert_eq!(CTRL_LONG_POINTER & 0xF0, 0);
    }
}
