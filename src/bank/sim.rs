//! In-memory paged memory banks
//!
//! [`EepromBank`] behaves like rewritable EEPROM. [`OtpBank`] behaves like
//! one-time-programmable EPROM: programming only clears bits, redirect bytes
//! hold the complement of the replacement page, and the status bitmap is
//! active low. Both record the order of physical page writes.

use crate::bank::{BankCapabilities, PagedMemoryBank};
use crate::common::error::{Error, Result};
use crate::storage::packet::encode_image;
use crate::storage::page_constants::{ERASED_BYTE, PACKET_OVERHEAD};

fn check_page(page: usize, page_count: usize) -> Result<()> {
    if page >= page_count {
        return Err(Error::io(format!(
            "bank page {page} out of range ({page_count} pages)"
        )));
    }
    Ok(())
}

fn check_packet(data: &[u8], page_length: usize) -> Result<()> {
    if data.len() + PACKET_OVERHEAD > page_length {
        return Err(Error::io(format!(
            "packet of {} bytes does not fit a {page_length}-byte page",
            data.len()
        )));
    }
    Ok(())
}

/// Rewritable bank.
#[derive(Debug, Clone)]
pub struct EepromBank {
    page_length: usize,
    memory: Vec<u8>,
    non_volatile: bool,
    glitches: Vec<usize>,
    writes: Vec<usize>,
    reads: usize,
}

impl EepromBank {
    /// A blank bank of `page_count` pages.
    pub fn new(page_length: usize, page_count: usize) -> Self {
        Self {
            page_length,
            memory: vec![ERASED_BYTE; page_length * page_count],
            non_volatile: true,
            glitches: Vec::new(),
            writes: Vec::new(),
            reads: 0,
        }
    }

    /// A bank rebuilt from its raw memory.
    pub fn from_memory(page_length: usize, memory: Vec<u8>) -> Self {
        Self {
            memory,
            ..Self::new(page_length, 0)
        }
    }

    /// Marks the bank as scratch memory the filesystem must skip.
    #[must_use]
    pub fn volatile(mut self) -> Self {
        self.non_volatile = false;
        self
    }

    /// The next read of `page` returns garbage once.
    pub fn inject_read_glitch(&mut self, page: usize) {
        self.glitches.push(page);
    }

    /// Overwrites one stored byte, bypassing the packet format.
    pub fn corrupt(&mut self, page: usize, offset: usize, value: u8) {
        self.memory[page * self.page_length + offset] = value;
    }

    /// Pages physically written, in order.
    pub fn physical_writes(&self) -> &[usize] {
        &self.writes
    }

    /// Physical page reads so far.
    pub fn physical_reads(&self) -> usize {
        self.reads
    }

    /// Raw memory.
    pub fn memory(&self) -> &[u8] {
        &self.memory
    }

    fn page_range(&self, page: usize) -> std::ops::Range<usize> {
        page * self.page_length..(page + 1) * self.page_length
    }
}

impl PagedMemoryBank for EepromBank {
    fn capabilities(&self) -> BankCapabilities {
        BankCapabilities {
            general_purpose: true,
            non_volatile: self.non_volatile,
            ..Default::default()
        }
    }

    fn page_length(&self) -> usize {
        self.page_length
    }

    fn page_count(&self) -> usize {
        self.memory.len() / self.page_length
    }

    fn read_page(&mut self, page: usize, _continued: bool, buf: &mut [u8]) -> Result<()> {
        check_page(page, self.page_count())?;
        self.reads += 1;
        buf[..self.page_length].copy_from_slice(&self.memory[self.page_range(page)]);
        if let Some(at) = self.glitches.iter().position(|&p| p == page) {
            self.glitches.swap_remove(at);
            for b in &mut buf[..self.page_length] {
                *b ^= 0x5A;
            }
        }
        Ok(())
    }

    fn write_page_packet(&mut self, page: usize, data: &[u8]) -> Result<()> {
        check_page(page, self.page_count())?;
        check_packet(data, self.page_length)?;
        let image = encode_image(self.page_length, data);
        let range = self.page_range(page);
        let used = data.len() + PACKET_OVERHEAD;
        self.memory[range.start..range.start + used].copy_from_slice(&image[..used]);
        self.writes.push(page);
        Ok(())
    }
}

/// Write-once bank.
#[derive(Debug, Clone)]
pub struct OtpBank {
    page_length: usize,
    memory: Vec<u8>,
    redirects: Vec<u8>,
    status: Vec<u8>,
    device_crc: bool,
    device_redirect: bool,
    status_bitmap: bool,
    write_verification: bool,
    writes: Vec<usize>,
}

impl OtpBank {
    /// A blank bank with device CRC, redirection and a status bitmap.
    pub fn new(page_length: usize, page_count: usize) -> Self {
        Self {
            page_length,
            memory: vec![ERASED_BYTE; page_length * page_count],
            redirects: vec![ERASED_BYTE; page_count],
            status: vec![ERASED_BYTE; page_count.div_ceil(8)],
            device_crc: true,
            device_redirect: true,
            status_bitmap: true,
            write_verification: true,
            writes: Vec::new(),
        }
    }

    /// Drops device-level redirection.
    #[must_use]
    pub fn without_device_redirect(mut self) -> Self {
        self.device_redirect = false;
        self
    }

    /// Drops device-verified page reads.
    #[must_use]
    pub fn without_device_crc(mut self) -> Self {
        self.device_crc = false;
        self
    }

    /// Programs a redirect byte directly, e.g. to build a corrupt chain.
    pub fn force_redirect(&mut self, from: usize, to: usize) {
        self.redirects[from] = redirect_byte(to);
    }

    /// Pages physically written, in order.
    pub fn physical_writes(&self) -> &[usize] {
        &self.writes
    }

    /// Raw memory.
    pub fn memory(&self) -> &[u8] {
        &self.memory
    }

    /// Raw status bitmap (active low).
    pub fn status(&self) -> &[u8] {
        &self.status
    }

    /// Whether device write verification is on.
    pub fn write_verification(&self) -> bool {
        self.write_verification
    }

    pub(crate) fn parts(&self) -> (&[u8], &[u8], &[u8]) {
        (&self.memory, &self.redirects, &self.status)
    }

    pub(crate) fn from_parts(
        page_length: usize,
        memory: Vec<u8>,
        redirects: Vec<u8>,
        status: Vec<u8>,
    ) -> Self {
        Self {
            memory,
            redirects,
            status,
            ..Self::new(page_length, 0)
        }
    }

    fn program(&mut self, offset: usize, bytes: &[u8]) -> Result<()> {
        let target = &mut self.memory[offset..offset + bytes.len()];
        let sets_bits = bytes.iter().zip(target.iter()).any(|(b, t)| b & !t != 0);
        if sets_bits && self.write_verification {
            return Err(Error::io(format!(
                "write-once verification failed at byte {offset}"
            )));
        }
        for (t, b) in target.iter_mut().zip(bytes) {
            *t &= b;
        }
        Ok(())
    }
}

#[allow(clippy::cast_possible_truncation)]
fn redirect_byte(to: usize) -> u8 {
    !(to as u8)
}

impl PagedMemoryBank for OtpBank {
    fn capabilities(&self) -> BankCapabilities {
        BankCapabilities {
            general_purpose: true,
            write_once: true,
            non_volatile: true,
            extra_info: self.device_redirect,
            page_auto_crc: self.device_crc,
            device_redirect: self.device_redirect,
            status_bitmap: self.status_bitmap,
        }
    }

    fn page_length(&self) -> usize {
        self.page_length
    }

    fn page_count(&self) -> usize {
        self.redirects.len()
    }

    fn extra_info_length(&self) -> usize {
        usize::from(self.device_redirect)
    }

    fn read_page(&mut self, page: usize, _continued: bool, buf: &mut [u8]) -> Result<()> {
        check_page(page, self.page_count())?;
        let start = page * self.page_length;
        buf[..self.page_length].copy_from_slice(&self.memory[start..start + self.page_length]);
        Ok(())
    }

    fn read_page_with_crc(
        &mut self,
        page: usize,
        continued: bool,
        buf: &mut [u8],
        extra: Option<&mut [u8]>,
    ) -> Result<()> {
        if !self.device_crc {
            return Err(Error::io("device CRC page read not supported"));
        }
        self.read_page(page, continued, buf)?;
        if let Some(extra) = extra {
            if let Some(slot) = extra.first_mut() {
                *slot = self.redirects[page];
            }
        }
        Ok(())
    }

    fn write_page_packet(&mut self, page: usize, data: &[u8]) -> Result<()> {
        check_page(page, self.page_count())?;
        check_packet(data, self.page_length)?;
        let image = encode_image(self.page_length, data);
        let used = data.len() + PACKET_OVERHEAD;
        self.program(page * self.page_length, &image[..used])?;
        self.writes.push(page);
        Ok(())
    }

    fn get_redirected_page(&mut self, page: usize) -> Result<usize> {
        check_page(page, self.page_count())?;
        if !self.device_redirect {
            return Ok(0);
        }
        let byte = self.redirects[page];
        Ok(if byte == ERASED_BYTE {
            0
        } else {
            usize::from(!byte)
        })
    }

    fn redirect_page(&mut self, from: usize, to: usize) -> Result<()> {
        check_page(from, self.page_count())?;
        check_page(to, self.page_count())?;
        if !self.device_redirect {
            return Err(Error::RedirectUnsupported { page: from });
        }
        let want = redirect_byte(to);
        let slot = &mut self.redirects[from];
        if want & !*slot != 0 {
            return Err(Error::io(format!("page {from} is already redirected")));
        }
        *slot &= want;
        Ok(())
    }

    fn set_write_verification(&mut self, enabled: bool) {
        self.write_verification = enabled;
    }

    fn read_status_bitmap(&mut self, buf: &mut [u8]) -> Result<()> {
        if !self.status_bitmap {
            return Err(Error::io("bank has no status bitmap"));
        }
        let n = buf.len().min(self.status.len());
        buf[..n].copy_from_slice(&self.status[..n]);
        Ok(())
    }

    fn write_status_bitmap(&mut self, index: usize, value: u8) -> Result<()> {
        let slot = self
            .status
            .get_mut(index)
            .ok_or_else(|| Error::io(format!("status byte {index} out of range")))?;
        *slot &= value;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::packet::decode_image;

    #[test]
    fn test_eeprom_packet_round_trip() {
        let mut bank = EepromBank::new(32, 4);
        bank.write_page_packet(2, b"DATA").unwrap();

        let mut buf = vec![0; 32];
        bank.read_page(2, false, &mut buf).unwrap();
        assert_eq!(decode_image(2, &buf, 29).unwrap(), b"DATA");
        assert_eq!(bank.physical_writes(), &[2]);
    }

    #[test]
    fn test_eeprom_glitch_is_one_shot() {
        let mut bank = EepromBank::new(32, 4);
        bank.write_page_packet(1, b"X").unwrap();
        bank.inject_read_glitch(1);

        let mut first = vec![0; 32];
        let mut second = vec![0; 32];
        bank.read_page(1, false, &mut first).unwrap();
        bank.read_page(1, false, &mut second).unwrap();
        assert_ne!(first, second);
        assert!(decode_image(1, &second, 29).is_ok());
    }

    #[test]
    fn test_otp_rejects_setting_bits() {
        let mut bank = OtpBank::new(32, 4);
        bank.write_page_packet(0, &[0x00]).unwrap();
        let err = bank.write_page_packet(0, &[0xFF]).unwrap_err();
        assert!(err.is_io());
    }

    #[test]
    fn test_otp_redirect_bytes() {
        let mut bank = OtpBank::new(32, 8);
        assert_eq!(bank.get_redirected_page(1).unwrap(), 0);
        bank.redirect_page(1, 5).unwrap();
        assert_eq!(bank.get_redirected_page(1).unwrap(), 5);
        assert!(bank.redirect_page(1, 6).is_err());
    }

    #[test]
    fn test_otp_without_redirect() {
        let mut bank = OtpBank::new(32, 8).without_device_redirect();
        assert_eq!(
            bank.redirect_page(1, 2),
            Err(Error::RedirectUnsupported { page: 1 })
        );
        assert!(!bank.capabilities().device_redirect);
    }

    #[test]
    fn test_otp_status_bitmap_only_clears() {
        let mut bank = OtpBank::new(32, 16);
        bank.write_status_bitmap(0, 0xFE).unwrap();
        bank.write_status_bitmap(0, 0xFF).unwrap();
        let mut buf = [0u8; 2];
        bank.read_status_bitmap(&mut buf).unwrap();
        assert_eq!(buf, [0xFE, 0xFF]);
    }
}
