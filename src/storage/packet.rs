//! Page packet codec
//!
//! A page image is `[len][data; len][footer; 2][unprogrammed...]`. The
//! footer is the complemented CRC16 of `[len, data]`. Inside the data, the
//! filesystem keeps its next-page pointer in the last `pointer_len` bytes.

use crate::common::error::{Error, Result};
use crate::storage::checksum::{check_crc16_residue, crc16_footer};
use crate::storage::page_constants::{PageId, ERASED_BYTE, PACKET_OVERHEAD};

/// Builds the physical image of a packet carrying `data`.
///
/// Bytes past the footer keep the erased value so write-once pages are only
/// ever asked to clear bits there.
///
/// # Panics
///
/// Panics if `data` does not fit in `page_length`, or if its length does not
/// fit the length byte. Callers check against `max_packet_data_length` first.
#[allow(clippy::cast_possible_truncation)]
pub fn encode_image(page_length: usize, data: &[u8]) -> Vec<u8> {
    assert!(data.len() + PACKET_OVERHEAD <= page_length);
    assert!(data.len() <= usize::from(u8::MAX));
    let len = data.len() as u8;

    let mut image = vec![ERASED_BYTE; page_length];
    image[0] = len;
    image[1..=data.len()].copy_from_slice(data);
    let footer = crc16_footer(&image[..=data.len()]);
    image[data.len() + 1..data.len() + PACKET_OVERHEAD].copy_from_slice(&footer);
    image
}

/// Extracts and validates the packet data of a physical page image.
///
/// # Errors
///
/// `InvalidLength` if the length byte exceeds `max_data`; `InvalidCrc` if the
/// CRC16 residue does not check.
pub fn decode_image(page: PageId, image: &[u8], max_data: usize) -> Result<Vec<u8>> {
    let len = usize::from(*image.first().ok_or(Error::InvalidLength {
        page,
        length: 0,
        max: max_data,
    })?);
    if len > max_data || len + PACKET_OVERHEAD > image.len() {
        return Err(Error::InvalidLength {
            page,
            length: len,
            max: max_data,
        });
    }
    if !check_crc16_residue(&image[..len + PACKET_OVERHEAD]) {
        return Err(Error::InvalidCrc { page });
    }
    Ok(image[1..=len].to_vec())
}

/// Whether programming `target` over `present` only clears bits.
pub fn is_bit_subset(target: &[u8], present: &[u8]) -> bool {
    target
        .iter()
        .zip(present.iter())
        .all(|(t, p)| t & !p == 0)
}

/// Little-endian page pointer of `pointer_len` bytes.
pub fn read_pointer(bytes: &[u8], pointer_len: usize) -> PageId {
    bytes[..pointer_len]
        .iter()
        .rev()
        .fold(0, |acc, b| (acc << 8) | usize::from(*b))
}

/// Stores a little-endian page pointer.
#[allow(clippy::cast_possible_truncation)]
pub fn write_pointer(bytes: &mut [u8], pointer_len: usize, value: PageId) {
    for (i, slot) in bytes[..pointer_len].iter_mut().enumerate() {
        *slot = ((value >> (8 * i)) & 0xFF) as u8;
    }
}

/// Trailing next-page pointer of packet data; 0 if the data is too short.
pub fn next_pointer(data: &[u8], pointer_len: usize) -> PageId {
    if data.len() < pointer_len {
        return 0;
    }
    read_pointer(&data[data.len() - pointer_len..], pointer_len)
}

/// Rewrites the trailing next-page pointer of packet data.
pub fn set_next_pointer(data: &mut [u8], pointer_len: usize, value: PageId) {
    let at = data.len() - pointer_len;
    write_pointer(&mut data[at..], pointer_len, value);
}

/// Packet data of an empty chain page: only a null next pointer.
pub fn empty_chain_page(pointer_len: usize) -> Vec<u8> {
    vec![0; pointer_len]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_decode() {
        let image = encode_image(32, b"HELLO");
        assert_eq!(image.len(), 32);
        assert_eq!(image[0], 5);
        assert_eq!(image[8..], [ERASED_BYTE; 24]);
        assert_eq!(decode_image(4, &image, 29).unwrap(), b"HELLO");
    }

    #[test]
    fn test_decode_rejects_long_length() {
        let mut image = encode_image(32, b"HELLO");
        image[0] = 30;
        assert_eq!(
            decode_image(4, &image, 29),
            Err(Error::InvalidLength {
                page: 4,
                length: 30,
                max: 29
            })
        );
    }

    #[test]
    fn test_decode_rejects_bad_crc() {
        let mut image = encode_image(32, b"HELLO");
        image[3] ^= 0x40;
        assert_eq!(decode_image(7, &image, 29), Err(Error::InvalidCrc { page: 7 }));
    }

    #[test]
    fn test_erased_page_is_not_a_packet() {
        let image = vec![ERASED_BYTE; 32];
        assert!(decode_image(0, &image, 29).is_err());
    }

    #[test]
    fn test_bit_subset() {
        assert!(is_bit_subset(&[0x0F, 0x00], &[0xFF, 0x12]));
        assert!(!is_bit_subset(&[0x10], &[0x0F]));
        assert!(is_bit_subset(&encode_image(16, b"A"), &[ERASED_BYTE; 16]));
    }

    #[test]
    fn test_pointers() {
        let mut data = vec![0xAA, 0xBB, 0, 0];
        set_next_pointer(&mut data, 2, 0x0123);
        assert_eq!(data, [0xAA, 0xBB, 0x23, 0x01]);
        assert_eq!(next_pointer(&data, 2), 0x0123);
        assert_eq!(next_pointer(&data, 1), 0x01);
        assert_eq!(next_pointer(&[], 1), 0);
        assert_eq!(empty_chain_page(2), [0, 0]);
    }
}
