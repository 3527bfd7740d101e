//! In-place chunked AES-256-CBC encryption
//!
//! The target is read sequentially in fixed-size chunks. Each chunk is
//! encrypted and written back at the offset it was read from. A single CBC
//! encryptor is carried across all chunks, so the ciphertext is the same
//! whatever (block-multiple) chunk size is used.
//!
//! Regular files get PKCS#7 padding on the last chunk and may grow by up to
//! one block; an empty file becomes one padding block. Block devices get no
//! padding and must already be block aligned.
//!
//! There is no staging copy. If an I/O error stops the run, the target is
//! left with ciphertext before the reported offset and plaintext after it.

use std::io::{self, Read, Seek, SeekFrom, Write};

use aes::Aes256;
use cbc::cipher::block_padding::Pkcs7;
use cbc::cipher::generic_array::GenericArray;
use cbc::cipher::{BlockEncryptMut, KeyIvInit};
use tracing::{debug, trace, warn};
use zeroize::Zeroizing;

use crate::config::SessionConfig;
use crate::error::{ErrorCategory, ErrorKind, Result, ShredError};
use crate::keys::{Fresh, KeyMaterial};
use crate::target::{TargetKind, unaligned_device};

/// AES block length in bytes.
pub const BLOCK_LEN: usize = 16;

/// Default chunk length for regular files (4 KiB).
pub const FILE_CHUNK_LEN: usize = 4 * 1024;

/// Default chunk length for block devices (1 MiB).
pub const DEVICE_CHUNK_LEN: usize = 1024 * 1024;

/// Default number of attempts for a chunk write that keeps coming up short.
pub const WRITE_ATTEMPTS: usize = 3;

type Aes256CbcEnc = cbc::Encryptor<Aes256>;

/// Checks that `len` can be used as a chunk length.
pub fn validate_chunk_len(len: usize) -> Result<()> {
    if len == 0 || len % BLOCK_LEN != 0 {
        return Err(ShredError::with_kind(
            ErrorCategory::User,
            ErrorKind::Validation,
            format!("chunk length {len} is not a positive multiple of {BLOCK_LEN}"),
        ));
    }
    Ok(())
}

/// One-shot encryptor for a single target.
pub struct StreamCipher {
    enc: Aes256CbcEnc,
    kind: TargetKind,
    chunk_len: usize,
    write_attempts: usize,
}

impl StreamCipher {
    /// Sets up the cipher with a session key.
    pub fn new(key: &KeyMaterial<Fresh>, kind: TargetKind) -> Result<Self> {
        Self::from_slices(key.key(), key.iv(), kind)
    }

    /// Sets up the cipher with raw key and IV bytes.
    pub fn from_slices(key: &[u8], iv: &[u8], kind: TargetKind) -> Result<Self> {
        let enc = Aes256CbcEnc::new_from_slices(key, iv).map_err(|e| {
            ShredError::with_kind_and_source(
                ErrorCategory::Internal,
                ErrorKind::CipherInit,
                "failed to initialize AES-256-CBC",
                e,
            )
        })?;
        Ok(Self {
            enc,
            kind,
            chunk_len: SessionConfig::default().chunk_len_for(kind),
            write_attempts: WRITE_ATTEMPTS,
        })
    }

    /// Overrides the chunk length. Must be a positive multiple of
    /// [`BLOCK_LEN`].
    pub fn with_chunk_len(mut self, chunk_len: usize) -> Result<Self> {
        validate_chunk_len(chunk_len)?;
        self.chunk_len = chunk_len;
        Ok(self)
    }

    /// Overrides how many times a short chunk write is attempted.
    pub fn with_write_attempts(mut self, attempts: usize) -> Self {
        self.write_attempts = attempts.max(1);
        self
    }

    pub fn chunk_len(&self) -> usize {
        self.chunk_len
    }

    /// Encrypts all of `target` in place.
    ///
    /// Returns the number of plaintext bytes consumed. On failure the error
    /// carries the offset of the chunk that could not be completed; every
    /// byte before it has been encrypted.
    pub fn encrypt_in_place<T: Read + Write + Seek + ?Sized>(self, target: &mut T) -> Result<u64> {
        let Self {
            mut enc,
            kind,
            chunk_len,
            write_attempts,
        } = self;

        let total = target
            .seek(SeekFrom::End(0))
            .map_err(|e| io_error("failed to determine target length", e, 0))?;
        if kind == TargetKind::BlockDevice && total % BLOCK_LEN as u64 != 0 {
            return Err(unaligned_device("device", total));
        }
        debug!(bytes = total, chunk_len, %kind, "encrypting target in place");

        let mut buf = Zeroizing::new(vec![0u8; chunk_len + BLOCK_LEN]);
        let mut offset = 0u64;
        loop {
            let remaining = total - offset;
            let last = remaining <= chunk_len as u64;
            let len = if last { remaining as usize } else { chunk_len };

            read_chunk(target, offset, &mut buf[..len])?;

            if last && kind == TargetKind::RegularFile {
                let ciphertext = enc
                    .encrypt_padded_mut::<Pkcs7>(&mut buf[..len + BLOCK_LEN], len)
                    .map_err(|_| {
                        ShredError::with_kind(
                            ErrorCategory::Internal,
                            ErrorKind::InternalInvariant,
                            "padding buffer too small",
                        )
                        .at(offset)
                    })?;
                write_chunk(target, offset, ciphertext, write_attempts)?;
                trace!(offset, len = ciphertext.len(), "final chunk written");
                break;
            }

            for block in buf[..len].chunks_exact_mut(BLOCK_LEN) {
                enc.encrypt_block_mut(GenericArray::from_mut_slice(block));
            }
            write_chunk(target, offset, &buf[..len], write_attempts)?;
            trace!(offset, len, "chunk written");

            offset += len as u64;
            if last {
                break;
            }
        }

        target
            .flush()
            .map_err(|e| io_error("failed to flush target", e, total))?;
        Ok(total)
    }
}

fn read_chunk<T: Read + Seek + ?Sized>(target: &mut T, offset: u64, buf: &mut [u8]) -> Result<()> {
    target
        .seek(SeekFrom::Start(offset))
        .map_err(|e| io_error("failed to seek in target", e, offset))?;
    target
        .read_exact(buf)
        .map_err(|e| io_error("failed to read from target", e, offset))
}

/// Writes `data` at `offset`. A write that comes up short is restarted from
/// `offset` until it succeeds or `attempts` are used up.
fn write_chunk<T: Write + Seek + ?Sized>(
    target: &mut T,
    offset: u64,
    data: &[u8],
    attempts: usize,
) -> Result<()> {
    let mut attempt = 1;
    loop {
        target
            .seek(SeekFrom::Start(offset))
            .map_err(|e| io_error("failed to seek in target", e, offset))?;
        match target.write(data) {
            Ok(n) if n == data.len() => return Ok(()),
            Ok(n) if attempt < attempts => {
                warn!(
                    offset,
                    written = n,
                    expected = data.len(),
                    attempt,
                    "short write; retrying chunk"
                );
                attempt += 1;
            }
            Ok(n) => {
                return Err(ShredError::with_kind(
                    ErrorCategory::Internal,
                    ErrorKind::Io,
                    format!(
                        "short write to target: {} of {} bytes after {} attempts",
                        n,
                        data.len(),
                        attempts
                    ),
                )
                .at(offset));
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(io_error("failed to write to target", e, offset)),
        }
    }
}

fn io_error(msg: &str, err: io::Error, offset: u64) -> ShredError {
    ShredError::with_kind_and_source(
        ErrorCategory::Internal,
        ErrorKind::Io,
        format!("{msg} at offset {offset}"),
        err,
    )
    .at(offset)
}
