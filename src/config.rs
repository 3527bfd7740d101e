//! Session tuning knobs

use std::time::Duration;

use crate::error::Result;
use crate::keys::DISPLAY_PAUSE;
use crate::stream::{self, DEVICE_CHUNK_LEN, FILE_CHUNK_LEN, WRITE_ATTEMPTS};
use crate::target::TargetKind;

/// Settings for a single erase session.
///
/// The defaults are what the command-line front end uses. Tests shorten the
/// display pause and shrink the chunk sizes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    file_chunk_len: usize,
    device_chunk_len: usize,
    display_pause: Duration,
    device_confirmed: bool,
    write_attempts: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            file_chunk_len: FILE_CHUNK_LEN,
            device_chunk_len: DEVICE_CHUNK_LEN,
            display_pause: DISPLAY_PAUSE,
            device_confirmed: false,
            write_attempts: WRITE_ATTEMPTS,
        }
    }
}

impl SessionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn file_chunk_len(mut self, len: usize) -> Self {
        self.file_chunk_len = len;
        self
    }

    pub fn device_chunk_len(mut self, len: usize) -> Self {
        self.device_chunk_len = len;
        self
    }

    /// How long to block after showing the key.
    pub fn display_pause(mut self, pause: Duration) -> Self {
        self.display_pause = pause;
        self
    }

    /// Records that the operator confirmed destroying a block device. Only
    /// set this after an explicit "YES" and a mount check.
    pub fn device_confirmed(mut self, confirmed: bool) -> Self {
        self.device_confirmed = confirmed;
        self
    }

    /// Attempts per chunk before a short write becomes an error. Zero is
    /// treated as one.
    pub fn write_attempts(mut self, attempts: usize) -> Self {
        self.write_attempts = attempts;
        self
    }

    pub fn chunk_len_for(&self, kind: TargetKind) -> usize {
        match kind {
            TargetKind::RegularFile => self.file_chunk_len,
            TargetKind::BlockDevice => self.device_chunk_len,
        }
    }

    pub fn pause(&self) -> Duration {
        self.display_pause
    }

    pub fn is_device_confirmed(&self) -> bool {
        self.device_confirmed
    }

    pub fn attempts(&self) -> usize {
        self.write_attempts.max(1)
    }

    /// Checks both chunk sizes.
    pub fn validate(&self) -> Result<()> {
        stream::validate_chunk_len(self.file_chunk_len)
            .map_err(|e| e.with_context("invalid file chunk length"))?;
        stream::validate_chunk_len(self.device_chunk_len)
            .map_err(|e| e.with_context("invalid device chunk length"))?;
        Ok(())
    }
}
