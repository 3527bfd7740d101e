//! The encrypt-then-forget workflow
//!
//! A session owns everything needed to destroy one target: the open target,
//! the key, the terminal the key is shown on and the platform hooks. Running
//! it walks a fixed sequence of states:
//!
//! ```text
//! Uninitialized -> KeyGenerated -> MemoryPinned -> Encrypting -> Encrypted
//!               -> KeyDisplayed -> KeyWiped -> MemoryReleased
//! ```
//!
//! There is no way back and no retry. Once a key exists it is always wiped
//! and its pin always released, whatever went wrong in between. When the
//! encryption itself fails the key is still shown, since the part of the
//! target that was already encrypted can only be recovered with it.

use std::fmt;
use std::io::{self, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rand::rngs::OsRng;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::SessionConfig;
use crate::error::{ErrorCategory, ErrorKind, Result, ShredError};
use crate::keys::{EntropySource, Fresh, KeyMaterial};
use crate::platform::{self, Platform};
use crate::render::Disclosure;
use crate::stream::{BLOCK_LEN, StreamCipher};
use crate::target::{EncryptionTarget, Sink, TargetKind, unaligned_device};

/// Where a session is in its lifecycle. Ordered by progression.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SessionState {
    Uninitialized,
    KeyGenerated,
    MemoryPinned,
    Encrypting,
    Encrypted,
    KeyDisplayed,
    KeyWiped,
    MemoryReleased,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Uninitialized => "uninitialized",
            SessionState::KeyGenerated => "key generated",
            SessionState::MemoryPinned => "memory pinned",
            SessionState::Encrypting => "encrypting",
            SessionState::Encrypted => "encrypted",
            SessionState::KeyDisplayed => "key displayed",
            SessionState::KeyWiped => "key wiped",
            SessionState::MemoryReleased => "memory released",
        };
        f.write_str(name)
    }
}

/// Outcome of a session that encrypted the whole target and showed the key.
#[derive(Debug)]
pub struct EncryptedReport {
    /// Plaintext bytes consumed.
    pub bytes_processed: u64,
    /// Length of the target afterwards. Larger than `bytes_processed` for
    /// regular files because of padding.
    pub output_len: u64,
    pub kind: TargetKind,
    /// Whether the OS agreed to keep the key out of swap.
    pub memory_pinned: bool,
    pub states: Vec<SessionState>,
    disclosure: Disclosure,
}

impl EncryptedReport {
    /// Hex key exactly as shown on the terminal. Never print it again.
    pub fn key_hex(&self) -> &str {
        self.disclosure.key_hex()
    }

    /// Hex IV exactly as shown on the terminal. Never print it again.
    pub fn iv_hex(&self) -> &str {
        self.disclosure.iv_hex()
    }
}

/// A session that did not complete.
///
/// `bytes_processed` is the offset up to which the target holds ciphertext.
/// Everything after it is untouched plaintext.
#[derive(Debug, Error)]
#[error("erase session failed")]
pub struct SessionError {
    #[source]
    pub error: ShredError,
    pub bytes_processed: u64,
    /// Present when the key was shown before the session gave up.
    pub disclosure: Option<Disclosure>,
    pub memory_pinned: bool,
    pub states: Vec<SessionState>,
}

impl SessionError {
    pub fn kind(&self) -> Option<ErrorKind> {
        self.error.kind
    }

    /// The last state the session reached.
    pub fn last_state(&self) -> SessionState {
        self.states
            .last()
            .copied()
            .unwrap_or(SessionState::Uninitialized)
    }

    pub fn reached(&self, state: SessionState) -> bool {
        self.states.contains(&state)
    }
}

/// A validated target plus everything needed to destroy it.
pub struct Session {
    path: Option<PathBuf>,
    kind: TargetKind,
    sink: Box<dyn Sink>,
    config: SessionConfig,
    platform: Arc<dyn Platform>,
    terminal: Box<dyn Write>,
    entropy: Box<dyn EntropySource>,
}

/// Validates `path` and opens it for in-place encryption.
///
/// Nothing is written and no key exists yet when this returns.
pub fn begin_session(path: impl AsRef<Path>, config: SessionConfig) -> Result<Session> {
    Session::open(path.as_ref(), config, platform::system())
}

/// Runs `session` to completion. See [`Session::run`].
pub fn run(session: Session) -> std::result::Result<EncryptedReport, SessionError> {
    session.run()
}

impl Session {
    /// Like [`begin_session`] with explicit platform hooks.
    pub fn open(path: &Path, config: SessionConfig, platform: Arc<dyn Platform>) -> Result<Self> {
        config.validate()?;
        let target = EncryptionTarget::inspect(path, &*platform)?;
        let file = target.open()?;
        Ok(Self {
            path: Some(target.path),
            kind: target.kind,
            sink: Box::new(file),
            config,
            platform,
            terminal: Box::new(io::stdout()),
            entropy: Box::new(OsRng),
        })
    }

    /// Builds a session over an already open target.
    pub fn from_sink(
        sink: impl Sink + 'static,
        kind: TargetKind,
        config: SessionConfig,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            path: None,
            kind,
            sink: Box::new(sink),
            config,
            platform: platform::system(),
            terminal: Box::new(io::stdout()),
            entropy: Box::new(OsRng),
        })
    }

    pub fn with_platform(mut self, platform: Arc<dyn Platform>) -> Self {
        self.platform = platform;
        self
    }

    /// Sends the key display somewhere other than stdout.
    pub fn with_terminal(mut self, terminal: impl Write + 'static) -> Self {
        self.terminal = Box::new(terminal);
        self
    }

    pub fn with_entropy(mut self, entropy: impl EntropySource + 'static) -> Self {
        self.entropy = Box::new(entropy);
        self
    }

    /// Marks a block device as confirmed for destruction.
    pub fn confirm_device(&mut self) {
        self.config = self.config.clone().device_confirmed(true);
    }

    pub fn kind(&self) -> TargetKind {
        self.kind
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Generates a key, encrypts the target, shows the key once, then wipes
    /// and releases it.
    pub fn run(mut self) -> std::result::Result<EncryptedReport, SessionError> {
        let mut states = vec![SessionState::Uninitialized];
        match &self.path {
            Some(path) => info!(path = %path.display(), kind = %self.kind, "starting erase session"),
            None => info!(kind = %self.kind, "starting erase session"),
        }

        if let Err(error) = self.preflight() {
            return Err(SessionError::before_key(error, states));
        }

        let mut key = match KeyMaterial::generate_from(&mut *self.entropy) {
            Ok(key) => key,
            Err(error) => return Err(SessionError::before_key(error, states)),
        };
        advance(&mut states, SessionState::KeyGenerated);

        let memory_pinned = key.pin(self.platform.clone());
        advance(&mut states, SessionState::MemoryPinned);

        let cipher = match self.cipher(&key) {
            Ok(cipher) => cipher,
            Err(error) => {
                // Nothing was written, so the key protects nothing.
                let wiped = key.wipe();
                advance(&mut states, SessionState::KeyWiped);
                wiped.release();
                advance(&mut states, SessionState::MemoryReleased);
                return Err(SessionError {
                    error,
                    bytes_processed: 0,
                    disclosure: None,
                    memory_pinned,
                    states,
                });
            }
        };

        advance(&mut states, SessionState::Encrypting);
        let encrypted = self.encrypt(cipher);
        if encrypted.is_ok() {
            advance(&mut states, SessionState::Encrypted);
        }

        let (shown, displayed) = key.display_once(&mut *self.terminal, self.config.pause());
        advance(&mut states, SessionState::KeyDisplayed);
        let wiped = shown.wipe();
        advance(&mut states, SessionState::KeyWiped);
        wiped.release();
        advance(&mut states, SessionState::MemoryReleased);

        match (encrypted, displayed) {
            (Ok(bytes), Ok(disclosure)) => {
                let output_len = match self.kind {
                    TargetKind::RegularFile => (bytes / BLOCK_LEN as u64 + 1) * BLOCK_LEN as u64,
                    TargetKind::BlockDevice => bytes,
                };
                info!(bytes, output_len, "erase session complete");
                Ok(EncryptedReport {
                    bytes_processed: bytes,
                    output_len,
                    kind: self.kind,
                    memory_pinned,
                    states,
                    disclosure,
                })
            }
            (Ok(bytes), Err(error)) => {
                warn!("target was encrypted but the key could not be displayed");
                Err(SessionError {
                    error,
                    bytes_processed: bytes,
                    disclosure: None,
                    memory_pinned,
                    states,
                })
            }
            (Err(error), displayed) => {
                let bytes_processed = error.offset().unwrap_or(0);
                warn!(offset = bytes_processed, "encryption stopped partway");
                Err(SessionError {
                    error,
                    bytes_processed,
                    disclosure: displayed.ok(),
                    memory_pinned,
                    states,
                })
            }
        }
    }

    /// Device checks that must pass before a key exists.
    fn preflight(&mut self) -> Result<()> {
        if self.kind != TargetKind::BlockDevice {
            return Ok(());
        }
        if !self.config.is_device_confirmed() {
            return Err(ShredError::with_kind(
                ErrorCategory::User,
                ErrorKind::ConfirmationMissing,
                "refusing to encrypt a block device without operator confirmation",
            ));
        }
        // The length may have changed since the target was inspected.
        let len = self.sink.seek(SeekFrom::End(0)).map_err(|e| {
            ShredError::with_kind_and_source(
                ErrorCategory::Internal,
                ErrorKind::Io,
                "failed to determine device length",
                e,
            )
        })?;
        if len % BLOCK_LEN as u64 != 0 {
            return Err(unaligned_device("device", len));
        }
        Ok(())
    }

    fn cipher(&self, key: &KeyMaterial<Fresh>) -> Result<StreamCipher> {
        Ok(StreamCipher::new(key, self.kind)?
            .with_chunk_len(self.config.chunk_len_for(self.kind))?
            .with_write_attempts(self.config.attempts()))
    }

    fn encrypt(&mut self, cipher: StreamCipher) -> Result<u64> {
        let bytes = cipher.encrypt_in_place(&mut *self.sink)?;
        self.sink.sync().map_err(|e| {
            ShredError::with_kind_and_source(
                ErrorCategory::Internal,
                ErrorKind::Io,
                "failed to sync target to storage",
                e,
            )
            .at(bytes)
        })?;
        Ok(bytes)
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("path", &self.path)
            .field("kind", &self.kind)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl SessionError {
    fn before_key(error: ShredError, states: Vec<SessionState>) -> Self {
        Self {
            error,
            bytes_processed: 0,
            disclosure: None,
            memory_pinned: false,
            states,
        }
    }
}

fn advance(states: &mut Vec<SessionState>, next: SessionState) {
    debug_assert!(states.last().is_none_or(|last| *last < next));
    debug!(state = %next, "session state");
    states.push(next);
}
