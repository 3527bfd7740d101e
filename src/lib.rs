//! keyshred - Destroy files and block devices by encrypting them in place
//! with a one-time AES-256-CBC key that is shown once and then wiped.

#![deny(unsafe_code)]

pub mod config;
pub mod confirm;
pub mod error;
pub mod keys;
pub mod memguard;
pub mod mounts;
pub mod platform;
pub mod render;
pub mod session;
pub mod stream;
pub mod target;
mod wipe;

pub use config::SessionConfig;
pub use error::{ErrorCategory, ErrorKind, Result, ShredError};
pub use session::{EncryptedReport, Session, SessionError, SessionState, begin_session, run};
pub use target::TargetKind;
