//! Bank image files
//!
//! Saves a simulated bank to disk and maps it back, so a volume formatted in
//! one run can be mounted in the next. Layout: `b"PGFS"`, bincode body,
//! CRC32 of the body (little endian).

use crate::bank::sim::{EepromBank, OtpBank};
use crate::common::error::{Error, Result};
use crate::storage::checksum::calculate_crc32;
use anyhow::{bail, ensure, Context};
use memmap2::MmapOptions;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::path::Path;

const MAGIC: &[u8; 4] = b"PGFS";

/// Serializable snapshot of a simulated bank.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BankImage {
    /// Rewritable bank contents
    Eeprom {
        /// Bytes per page
        page_length: usize,
        /// Raw memory
        memory: Vec<u8>,
    },
    /// Write-once bank contents
    Otp {
        /// Bytes per page
        page_length: usize,
        /// Raw memory
        memory: Vec<u8>,
        /// Redirect bytes, one per page
        redirects: Vec<u8>,
        /// Status bitmap (active low)
        status: Vec<u8>,
        /// Device CRC reads available
        device_crc: bool,
        /// Device redirection available
        device_redirect: bool,
    },
}

impl BankImage {
    /// Snapshot of a rewritable bank.
    pub fn from_eeprom(bank: &EepromBank) -> Self {
        use crate::bank::PagedMemoryBank;
        BankImage::Eeprom {
            page_length: bank.page_length(),
            memory: bank.memory().to_vec(),
        }
    }

    /// Snapshot of a write-once bank.
    pub fn from_otp(bank: &OtpBank) -> Self {
        use crate::bank::PagedMemoryBank;
        let caps = bank.capabilities();
        let (memory, redirects, status) = bank.parts();
        BankImage::Otp {
            page_length: bank.page_length(),
            memory: memory.to_vec(),
            redirects: redirects.to_vec(),
            status: status.to_vec(),
            device_crc: caps.page_auto_crc,
            device_redirect: caps.device_redirect,
        }
    }

    /// Rebuilds a rewritable bank.
    ///
    /// # Errors
    ///
    /// Returns `Error::Io` if the image is of a write-once bank.
    pub fn into_eeprom(self) -> Result<EepromBank> {
        match self {
            BankImage::Eeprom {
                page_length,
                memory,
            } => Ok(EepromBank::from_memory(page_length, memory)),
            BankImage::Otp { .. } => Err(Error::io("image holds a write-once bank")),
        }
    }

    /// Rebuilds a write-once bank.
    ///
    /// # Errors
    ///
    /// Returns `Error::Io` if the image is of a rewritable bank.
    pub fn into_otp(self) -> Result<OtpBank> {
        match self {
            BankImage::Otp {
                page_length,
                memory,
                redirects,
                status,
                device_crc,
                device_redirect,
            } => {
                let mut bank = OtpBank::from_parts(page_length, memory, redirects, status);
                if !device_crc {
                    bank = bank.without_device_crc();
                }
                if !device_redirect {
                    bank = bank.without_device_redirect();
                }
                Ok(bank)
            }
            BankImage::Eeprom { .. } => Err(Error::io("image holds a rewritable bank")),
        }
    }

    /// Writes the image file.
    ///
    /// # Errors
    ///
    /// Returns `Error::Io` if encoding or the file write fails.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let bytes = self.encode().map_err(|e| Error::io(format!("{e:#}")))?;
        std::fs::write(path, bytes)?;
        Ok(())
    }

    /// Maps and decodes an image file.
    ///
    /// # Errors
    ///
    /// Returns `Error::Io` if the file cannot be mapped, is truncated, or
    /// fails its checksum.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path)?;
        // SAFETY: the mapping is read-only and dropped before returning; the
        // image file is not modified while it is being decoded.
        let mmap = unsafe { MmapOptions::new().map(&file)? };
        Self::decode(&mmap).map_err(|e| Error::io(format!("{e:#}")))
    }

    fn encode(&self) -> anyhow::Result<Vec<u8>> {
        let body = bincode::serialize(self).context("encoding bank image")?;
        let mut bytes = Vec::with_capacity(MAGIC.len() + body.len() + 4);
        bytes.extend_from_slice(MAGIC);
        bytes.extend_from_slice(&body);
        bytes.extend_from_slice(&calculate_crc32(&body).to_le_bytes());
        Ok(bytes)
    }

    fn decode(bytes: &[u8]) -> anyhow::Result<Self> {
        ensure!(bytes.len() >= MAGIC.len() + 4, "bank image truncated");
        ensure!(&bytes[..MAGIC.len()] == MAGIC, "not a bank image");

        let (body, trailer) = bytes[MAGIC.len()..].split_at(bytes.len() - MAGIC.len() - 4);
        let stored = u32::from_le_bytes([trailer[0], trailer[1], trailer[2], trailer[3]]);
        let actual = calculate_crc32(body);
        if stored != actual {
            bail!("bank image checksum mismatch: stored {stored:08x}, computed {actual:08x}");
        }
        bincode::deserialize(body).context("decoding bank image")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bank::PagedMemoryBank;
    use tempfile::NamedTempFile;

    #[test]
    fn test_eeprom_image_file() -> Result<()> {
        let mut bank = EepromBank::new(32, 4);
        bank.write_page_packet(3, b"KEEP")?;

        let file = NamedTempFile::new()?;
        BankImage::from_eeprom(&bank).save(file.path())?;
        let restored = BankImage::load(file.path())?.into_eeprom()?;
        assert_eq!(restored.memory(), bank.memory());
        Ok(())
    }

    #[test]
    fn test_otp_image_keeps_capabilities() -> Result<()> {
        let bank = OtpBank::new(32, 8).without_device_crc();
        let file = NamedTempFile::new()?;
        BankImage::from_otp(&bank).save(file.path())?;

        let restored = BankImage::load(file.path())?.into_otp()?;
        assert!(!restored.capabilities().page_auto_crc);
        assert!(restored.capabilities().device_redirect);
        assert_eq!(restored.page_count(), 8);
        Ok(())
    }

    #[test]
    fn test_corrupt_image_rejected() -> Result<()> {
        let bank = EepromBank::new(32, 4);
        let file = NamedTempFile::new()?;
        BankImage::from_eeprom(&bank).save(file.path())?;

        let mut bytes = std::fs::read(file.path())?;
        let mid = bytes.len() / 2;
        bytes[mid] ^= 0xFF;
        std::fs::write(file.path(), &bytes)?;

        let err = BankImage::load(file.path()).unwrap_err();
        assert!(err.is_io());
        Ok(())
    }

    #[test]
    fn test_kind_mismatch() {
        let image = BankImage::from_eeprom(&EepromBank::new(32, 1));
        assert!(image.into_otp().is_err());
    }
}
