//! Text rendering of key material for the one-time disclosure
//!
//! The disclosure block is exactly three lines:
//!
//! ```text
//! keyshred: write down this key and IV; they will not be shown again.
//! KEY: <64 lowercase hex digits>
//! IV:  <32 lowercase hex digits>
//! ```
//!
//! Every string holding hex digits lives in a `Zeroizing` buffer.

use std::fmt;

use zeroize::Zeroizing;

use crate::error::{ErrorCategory, ErrorKind, Result, ShredError};
use crate::keys::{IV_LEN, KEY_LEN};

/// Width of the rendered key.
pub const KEY_HEX_LEN: usize = KEY_LEN * 2;

/// Width of the rendered IV.
pub const IV_HEX_LEN: usize = IV_LEN * 2;

const HEADER: &str = "keyshred: write down this key and IV; they will not be shown again.";
const KEY_LABEL: &str = "KEY: ";
const IV_LABEL: &str = "IV:  ";

/// Hex rendering of a key and IV, produced once per session.
pub struct Disclosure {
    key_hex: Zeroizing<String>,
    iv_hex: Zeroizing<String>,
}

impl Disclosure {
    pub(crate) fn new(key: &[u8; KEY_LEN], iv: &[u8; IV_LEN]) -> Self {
        Self {
            key_hex: Zeroizing::new(hex::encode(key)),
            iv_hex: Zeroizing::new(hex::encode(iv)),
        }
    }

    pub fn key_hex(&self) -> &str {
        &self.key_hex
    }

    pub fn iv_hex(&self) -> &str {
        &self.iv_hex
    }

    /// The full text block shown to the operator.
    pub(crate) fn block(&self) -> Zeroizing<String> {
        Zeroizing::new(format!(
            "{HEADER}\n{KEY_LABEL}{}\n{IV_LABEL}{}\n",
            self.key_hex.as_str(),
            self.iv_hex.as_str()
        ))
    }
}

impl fmt::Debug for Disclosure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Disclosure([REDACTED])")
    }
}

/// Parses a disclosure block back into raw key and IV bytes.
///
/// Surrounding text is ignored, but the block must contain exactly one key
/// line and one IV line of the expected width.
pub fn parse_block(text: &str) -> Result<(Zeroizing<[u8; KEY_LEN]>, Zeroizing<[u8; IV_LEN]>)> {
    let key_hex = single_line(text, KEY_LABEL, KEY_HEX_LEN)?;
    let iv_hex = single_line(text, IV_LABEL, IV_HEX_LEN)?;

    let mut key = Zeroizing::new([0u8; KEY_LEN]);
    hex::decode_to_slice(key_hex, &mut key[..]).map_err(|e| invalid_hex("key", e))?;
    let mut iv = Zeroizing::new([0u8; IV_LEN]);
    hex::decode_to_slice(iv_hex, &mut iv[..]).map_err(|e| invalid_hex("IV", e))?;
    Ok((key, iv))
}

fn single_line<'a>(text: &'a str, label: &str, width: usize) -> Result<&'a str> {
    let mut values = text.lines().filter_map(|line| line.strip_prefix(label));
    let value = values.next().ok_or_else(|| {
        ShredError::with_kind(
            ErrorCategory::User,
            ErrorKind::Validation,
            format!("no {:?} line found", label.trim_end()),
        )
    })?;
    if values.next().is_some() {
        return Err(ShredError::with_kind(
            ErrorCategory::User,
            ErrorKind::Validation,
            format!("more than one {:?} line found", label.trim_end()),
        ));
    }
    let value = value.trim_end();
    if value.len() != width {
        return Err(ShredError::with_kind(
            ErrorCategory::User,
            ErrorKind::Validation,
            format!(
                "{:?} value has {} characters, expected {}",
                label.trim_end(),
                value.len(),
                width
            ),
        ));
    }
    Ok(value)
}

fn invalid_hex(what: &str, err: hex::FromHexError) -> ShredError {
    ShredError::with_kind_and_source(
        ErrorCategory::User,
        ErrorKind::Validation,
        format!("{what} is not valid hex"),
        err,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_layout() {
        let disclosure = Disclosure::new(&[0xAB; KEY_LEN], &[0x01; IV_LEN]);
        let block = disclosure.block();
        let lines: Vec<&str> = block.lines().collect();

        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], HEADER);
        assert_eq!(lines[1], format!("KEY: {}", "ab".repeat(KEY_LEN)));
        assert_eq!(lines[2], format!("IV:  {}", "01".repeat(IV_LEN)));
        assert_eq!(disclosure.key_hex().len(), KEY_HEX_LEN);
        assert_eq!(disclosure.iv_hex().len(), IV_HEX_LEN);
    }

    #[test]
    fn test_parse_rendered_block() {
        let key: [u8; KEY_LEN] = core::array::from_fn(|i| i as u8);
        let iv: [u8; IV_LEN] = core::array::from_fn(|i| 0xF0 | i as u8);
        let block = Disclosure::new(&key, &iv).block();

        let text = format!("noise before\n{}trailing noise\n", block.as_str());
        let (parsed_key, parsed_iv) = parse_block(&text).unwrap();
        assert_eq!(*parsed_key, key);
        assert_eq!(*parsed_iv, iv);
    }

    #[test]
    fn test_debug_is_redacted() {
        let disclosure = Disclosure::new(&[0xAB; KEY_LEN], &[0xCD; IV_LEN]);
        let debug = format!("{disclosure:?}");
        assert!(!debug.contains("abab"));
        assert!(!debug.contains("cdcd"));
    }

    #[test]
    fn test_parse_missing_iv() {
        let text = format!("KEY: {}\n", "00".repeat(KEY_LEN));
        let err = parse_block(&text).unwrap_err();
        assert_eq!(err.kind, Some(ErrorKind::Validation));
        assert!(err.to_string().contains("no \"IV:\" line"));
    }

    #[test]
    fn test_parse_duplicate_key() {
        let key_line = format!("KEY: {}\n", "00".repeat(KEY_LEN));
        let text = format!("{key_line}{key_line}IV:  {}\n", "00".repeat(IV_LEN));
        let err = parse_block(&text).unwrap_err();
        assert!(err.to_string().contains("more than one"));
    }

    #[test]
    fn test_parse_wrong_width() {
        let text = format!("KEY: {}\nIV:  {}\n", "00".repeat(KEY_LEN - 1), "00".repeat(IV_LEN));
        let err = parse_block(&text).unwrap_err();
        assert!(err.to_string().contains("expected 64"));
    }

    #[test]
    fn test_parse_non_hex() {
        let text = format!("KEY: {}\nIV:  {}\n", "zz".repeat(KEY_LEN), "00".repeat(IV_LEN));
        let err = parse_block(&text).unwrap_err();
        assert!(err.to_string().contains("key is not valid hex"));
    }
}
