//! CRC16 for page packets and CRC32 for bank images

use crc::{Crc, CRC_16_ARC};
use crc32fast::Hasher;

/// CRC16 register value left after running a packet through with its
/// complemented footer appended.
pub const CRC16_RESIDUE: u16 = 0xB001;

const CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_ARC);

/// CRC16 (poly 0xA001 reflected, init 0) over `data`.
pub fn crc16(data: &[u8]) -> u16 {
    CRC16.checksum(data)
}

/// Footer bytes stored after a packet: complemented CRC16, LSB first.
pub fn crc16_footer(data: &[u8]) -> [u8; 2] {
    (!crc16(data)).to_le_bytes()
}

/// Checks `[len, data, footer]` against the fixed residue.
pub fn check_crc16_residue(packet_with_footer: &[u8]) -> bool {
    crc16(packet_with_footer) == CRC16_RESIDUE
}

/// Calculate CRC32 checksum for data
pub fn calculate_crc32(data: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(data);
    hasher.finalize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crc16_known_value() {
        // CRC-16/ARC check value
        assert_eq!(crc16(b"123456789"), 0xBB3D);
    }

    #[test]
    fn test_footer_yields_residue() {
        let mut packet = vec![5u8, b'H', b'E', b'L', b'L', b'O'];
        let footer = crc16_footer(&packet);
        packet.extend_from_slice(&footer);
        assert!(check_crc16_residue(&packet));

        packet[2] ^= 0x01;
        assert!(!check_crc16_residue(&packet));
    }

    #[test]
    fn test_empty_packet_residue() {
        let mut packet = vec![0u8];
        packet.extend_from_slice(&crc16_footer(&[0]));
        assert!(check_crc16_residue(&packet));
    }

    #[test]
    fn test_crc32_known_value() {
        let data = b"The quick brown fox jumps over the lazy dog";
        assert_eq!(calculate_crc32(data), 0x414F_A339);
    }
}
