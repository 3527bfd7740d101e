//! Validation and opening of erase targets
//!
//! A target is either a regular file or a block device. Everything else
//! (directories, sockets, missing paths) is rejected before a key exists.

use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Cursor, Write};
use std::path::{Path, PathBuf};

use tracing::info;

use crate::error::{ErrorCategory, ErrorKind, Result, ShredError};
use crate::platform::Platform;
use crate::stream::BLOCK_LEN;

/// What kind of storage is being encrypted. Decides chunking and padding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetKind {
    /// Any length, may grow by up to one cipher block.
    RegularFile,
    /// Fixed length that must be a multiple of the cipher block size.
    BlockDevice,
}

impl fmt::Display for TargetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetKind::RegularFile => f.write_str("regular file"),
            TargetKind::BlockDevice => f.write_str("block device"),
        }
    }
}

/// A validated target path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptionTarget {
    pub path: PathBuf,
    pub kind: TargetKind,
    /// Length observed during validation.
    pub len: u64,
}

impl EncryptionTarget {
    /// Classifies `path` and checks that it can be encrypted.
    ///
    /// Block devices whose size is not a multiple of the cipher block size
    /// are rejected here with `UnalignedDevice`.
    pub fn inspect(path: &Path, platform: &dyn Platform) -> Result<Self> {
        let target = if platform.is_block_device(path)? {
            let len = platform.device_size(path)?;
            if len % BLOCK_LEN as u64 != 0 {
                return Err(unaligned_device(&path.display().to_string(), len));
            }
            Self {
                path: path.to_path_buf(),
                kind: TargetKind::BlockDevice,
                len,
            }
        } else {
            let metadata = fs::metadata(path).map_err(|e| read_error(path, e))?;
            if !metadata.is_file() {
                return Err(ShredError::with_kind(
                    ErrorCategory::User,
                    ErrorKind::Validation,
                    format!("{} is neither a regular file nor a block device", path.display()),
                ));
            }
            Self {
                path: path.to_path_buf(),
                kind: TargetKind::RegularFile,
                len: metadata.len(),
            }
        };
        info!(
            path = %target.path.display(),
            kind = %target.kind,
            bytes = target.len,
            "target validated"
        );
        Ok(target)
    }

    /// Opens the target for in-place rewriting. Never creates or truncates.
    pub fn open(&self) -> Result<File> {
        OpenOptions::new()
            .read(true)
            .write(true)
            .open(&self.path)
            .map_err(|e| {
                let category = match e.kind() {
                    io::ErrorKind::NotFound | io::ErrorKind::PermissionDenied => ErrorCategory::User,
                    _ => ErrorCategory::Internal,
                };
                ShredError::with_kind_and_source(
                    category,
                    ErrorKind::Validation,
                    format!("failed to open {} for writing", self.path.display()),
                    e,
                )
            })
    }
}

/// A seekable byte store that can be rewritten in place and made durable.
pub trait Sink: io::Read + io::Write + io::Seek {
    /// Pushes everything written so far to stable storage.
    fn sync(&mut self) -> io::Result<()>;
}

impl Sink for File {
    fn sync(&mut self) -> io::Result<()> {
        self.flush()?;
        self.sync_all()
    }
}

impl Sink for Cursor<Vec<u8>> {
    fn sync(&mut self) -> io::Result<()> {
        Ok(())
    }
}

pub(crate) fn unaligned_device(what: &str, len: u64) -> ShredError {
    ShredError::with_kind(
        ErrorCategory::User,
        ErrorKind::UnalignedDevice,
        format!("{what} is {len} bytes long, which is not a multiple of the {BLOCK_LEN}-byte cipher block"),
    )
}

fn read_error(path: &Path, err: io::Error) -> ShredError {
    let category = if err.kind() == io::ErrorKind::NotFound {
        ErrorCategory::User
    } else {
        ErrorCategory::Internal
    };
    ShredError::with_kind_and_source(
        category,
        ErrorKind::Validation,
        format!("cannot access {}", path.display()),
        err,
    )
}
