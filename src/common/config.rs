//! Volume configuration.

use crate::common::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// Options shared by every volume a [`CacheManager`](crate::CacheManager) mounts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeOptions {
    /// Resolve attempts for `open()` when the bank reports an I/O error.
    pub open_attempts: usize,
    /// Forwarded to write-once banks; the device re-reads every programmed byte.
    pub write_verification: bool,
    /// `FileHandle::close()` on a writer flushes the volume.
    pub sync_on_close: bool,
    /// Mount-time redirects followed before giving up (satellite hop plus
    /// device-map correction).
    pub max_redirect_hops: usize,
}

impl Default for VolumeOptions {
    fn default() -> Self {
        Self {
            open_attempts: 2,
            write_verification: true,
            sync_on_close: true,
            max_redirect_hops: 2,
        }
    }
}

impl VolumeOptions {
    /// Sets the number of open attempts.
    pub fn with_open_attempts(mut self, attempts: usize) -> Self {
        self.open_attempts = attempts;
        self
    }

    /// Enables or disables device write verification.
    pub fn with_write_verification(mut self, enabled: bool) -> Self {
        self.write_verification = enabled;
        self
    }

    /// Enables or disables the flush on writer close.
    pub fn with_sync_on_close(mut self, enabled: bool) -> Self {
        self.sync_on_close = enabled;
        self
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidConfig` when a bound is outside what the
    /// filesystem supports.
    pub fn validate(&self) -> Result<()> {
        if !(1..=2).contains(&self.open_attempts) {
            return Err(Error::InvalidConfig(format!(
                "open_attempts must be 1 or 2, got {}",
                self.open_attempts
            )));
        }
        if self.max_redirect_hops > 2 {
            return Err(Error::InvalidConfig(format!(
                "max_redirect_hops must be at most 2, got {}",
                self.max_redirect_hops
            )));
        }
        Ok(())
    }

    /// Encodes the options for storage next to a bank image.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).map_err(|e| Error::InvalidConfig(e.to_string()))
    }

    /// Decodes and validates options written by [`VolumeOptions::to_bytes`].
    ///
    /// # Errors
    ///
    /// Returns an error if the bytes do not decode or fail validation.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let options: Self =
            bincode::deserialize(bytes).map_err(|e| Error::InvalidConfig(e.to_string()))?;
        options.validate()?;
        Ok(options)
    }
}
