//! One-time key material with typestate lifecycle.
//!
//! A session's key and IV live in a single heap allocation so that the
//! address pinned by [`MemoryGuard`] stays valid while the owning value moves
//! between states. The lifecycle is enforced by the type system:
//!
//! ```text
//! KeyMaterial<Fresh> --display_once--> KeyMaterial<Disclosed> --wipe--> WipedKey --release--> ()
//!          \_____________________________wipe_______________________/
//! ```
//!
//! Only a `Fresh` key can feed the cipher or be displayed, and displaying
//! consumes it, so the key cannot be shown twice. None of these types are
//! `Clone`. Whatever state a key is in, dropping it burns the storage before
//! the memory pin (if any) is released.

use std::fmt;
use std::io::Write;
use std::marker::PhantomData;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use rand::rngs::OsRng;
use rand::{CryptoRng, RngCore};
use tracing::debug;

use crate::error::{ErrorCategory, ErrorKind, Result, ShredError};
use crate::memguard::{MemoryGuard, Region};
use crate::platform::Platform;
use crate::render::Disclosure;
use crate::wipe;

/// Length of the AES-256 key in bytes.
pub const KEY_LEN: usize = 32;

/// Length of the CBC initialization vector in bytes.
pub const IV_LEN: usize = 16;

/// How long the operator is given to copy the key down.
pub const DISPLAY_PAUSE: Duration = Duration::from_secs(3);

/// A cryptographically secure random source usable behind `dyn`.
pub trait EntropySource: RngCore + CryptoRng {}

impl<T: RngCore + CryptoRng + ?Sized> EntropySource for T {}

/// Generated and not yet shown.
pub enum Fresh {}

/// Shown to the operator; can only be wiped now.
pub enum Disclosed {}

#[repr(C)]
struct KeyBlock {
    key: [u8; KEY_LEN],
    iv: [u8; IV_LEN],
}

/// Owner of the key storage. Burns it on drop.
struct SecretBlock {
    inner: Box<KeyBlock>,
}

impl SecretBlock {
    fn zeroed() -> Self {
        Self {
            inner: Box::new(KeyBlock {
                key: [0u8; KEY_LEN],
                iv: [0u8; IV_LEN],
            }),
        }
    }

    fn region(&self) -> Region {
        Region::of(&*self.inner)
    }

    fn burn(&mut self) {
        let mut rng = OsRng;
        wipe::burn(&mut self.inner.key, &mut rng);
        wipe::burn(&mut self.inner.iv, &mut rng);
    }
}

impl Drop for SecretBlock {
    fn drop(&mut self) {
        self.burn();
    }
}

/// A 256-bit key and 128-bit IV for a single session.
pub struct KeyMaterial<S = Fresh> {
    // Field order matters: the block is burned before the pin is dropped.
    block: SecretBlock,
    pin: Option<MemoryGuard>,
    _state: PhantomData<S>,
}

impl KeyMaterial<Fresh> {
    /// Generates a key and IV from the operating system's random source.
    pub fn generate() -> Result<Self> {
        Self::generate_from(&mut OsRng)
    }

    /// Generates a key and IV from `rng`.
    ///
    /// Either both fields are filled or an `EntropySource` error is returned
    /// and nothing escapes; there is no fallback source.
    pub fn generate_from<R: EntropySource + ?Sized>(rng: &mut R) -> Result<Self> {
        let mut block = SecretBlock::zeroed();
        rng.try_fill_bytes(&mut block.inner.key)
            .and_then(|()| rng.try_fill_bytes(&mut block.inner.iv))
            .map_err(|e| {
                ShredError::with_kind_and_source(
                    ErrorCategory::Internal,
                    ErrorKind::EntropySource,
                    "secure random source failed; refusing to continue without a key",
                    e,
                )
            })?;
        debug!("generated session key and IV");
        Ok(Self {
            block,
            pin: None,
            _state: PhantomData,
        })
    }

    pub(crate) fn key(&self) -> &[u8; KEY_LEN] {
        &self.block.inner.key
    }

    pub(crate) fn iv(&self) -> &[u8; IV_LEN] {
        &self.block.inner.iv
    }

    /// Pins the key storage in RAM for the rest of this value's life.
    ///
    /// Returns whether the OS honoured the request. A refusal is logged by
    /// the guard and otherwise ignored.
    pub fn pin(&mut self, platform: Arc<dyn Platform>) -> bool {
        let guard = MemoryGuard::acquire(platform, self.block.region());
        let locked = guard.is_locked();
        self.pin = Some(guard);
        locked
    }

    /// Writes the key and IV to `terminal`, then blocks for `pause`.
    ///
    /// This is the only place key bytes are ever rendered. The returned
    /// disclosure is the caller's record of what was shown; it must not be
    /// printed again. If writing fails the key is still considered shown,
    /// since it may already be partially on screen.
    pub fn display_once(
        self,
        terminal: &mut dyn Write,
        pause: Duration,
    ) -> (KeyMaterial<Disclosed>, Result<Disclosure>) {
        let disclosure = Disclosure::new(self.key(), self.iv());
        let written = terminal
            .write_all(disclosure.block().as_bytes())
            .and_then(|()| terminal.flush())
            .map_err(|e| {
                ShredError::with_kind_and_source(
                    ErrorCategory::Internal,
                    ErrorKind::Io,
                    "failed to display the key",
                    e,
                )
            });
        let outcome = written.map(|()| {
            thread::sleep(pause);
            disclosure
        });
        (self.transition(), outcome)
    }
}

impl KeyMaterial<Disclosed> {
    pub fn is_pinned(&self) -> bool {
        self.pin.as_ref().is_some_and(MemoryGuard::is_locked)
    }
}

impl<S> KeyMaterial<S> {
    /// Burns the key and IV. The pin, if any, is kept until
    /// [`WipedKey::release`].
    pub fn wipe(self) -> WipedKey {
        let mut block = self.block;
        block.burn();
        debug!("key storage wiped");
        WipedKey {
            block,
            pin: self.pin,
        }
    }

    fn transition<T>(self) -> KeyMaterial<T> {
        KeyMaterial {
            block: self.block,
            pin: self.pin,
            _state: PhantomData,
        }
    }
}

impl<S> fmt::Debug for KeyMaterial<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeyMaterial([REDACTED])")
    }
}

/// Key storage after the wipe. Only inspection, re-wiping and release remain.
pub struct WipedKey {
    block: SecretBlock,
    pin: Option<MemoryGuard>,
}

impl WipedKey {
    /// Runs the wipe sequence again.
    pub fn wipe(&mut self) {
        self.block.burn();
    }

    /// Current contents of the key storage. All zeros.
    pub fn key_storage(&self) -> &[u8; KEY_LEN] {
        &self.block.inner.key
    }

    /// Current contents of the IV storage. All zeros.
    pub fn iv_storage(&self) -> &[u8; IV_LEN] {
        &self.block.inner.iv
    }

    /// Releases the memory pin and the storage. Returns true if a pin was
    /// held.
    pub fn release(self) -> bool {
        let Self { block, pin } = self;
        drop(block);
        pin.is_some_and(MemoryGuard::release)
    }
}

impl fmt::Debug for WipedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "WipedKey")
    }
}
