//! End-to-end erase sessions with injected failures

use std::cell::{Cell, RefCell};
use std::fs;
use std::io::{self, Cursor, Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

use aes::Aes256;
use cbc::cipher::block_padding::{NoPadding, Pkcs7};
use cbc::cipher::{BlockDecryptMut, KeyIvInit};
use rand::{CryptoRng, RngCore};
use tempfile::TempDir;

use keyshred::memguard::Region;
use keyshred::platform::Platform;
use keyshred::target::Sink;
use keyshred::{
    ErrorCategory, ErrorKind, Session, SessionConfig, SessionState, TargetKind, render,
};

type Aes256CbcDec = cbc::Decryptor<Aes256>;

/// Records every lock and unlock. Can pretend every path is a device.
#[derive(Default)]
struct RecordingPlatform {
    device: bool,
    calls: RefCell<Vec<&'static str>>,
}

impl Platform for RecordingPlatform {
    fn lock(&self, _region: Region) -> keyshred::Result<()> {
        self.calls.borrow_mut().push("lock");
        Ok(())
    }

    fn unlock(&self, _region: Region) -> keyshred::Result<()> {
        self.calls.borrow_mut().push("unlock");
        Ok(())
    }

    fn device_size(&self, path: &Path) -> keyshred::Result<u64> {
        Ok(fs::metadata(path).map(|m| m.len()).unwrap_or(0))
    }

    fn is_block_device(&self, _path: &Path) -> keyshred::Result<bool> {
        Ok(self.device)
    }
}

/// In-memory target that stops accepting writes after `ok_writes` of them.
#[derive(Clone)]
struct FlakyTarget {
    data: Rc<RefCell<Cursor<Vec<u8>>>>,
    ok_writes: usize,
    writes: Rc<Cell<usize>>,
}

impl FlakyTarget {
    fn new(data: &[u8], ok_writes: usize) -> Self {
        Self {
            data: Rc::new(RefCell::new(Cursor::new(data.to_vec()))),
            ok_writes,
            writes: Rc::new(Cell::new(0)),
        }
    }

    fn bytes(&self) -> Vec<u8> {
        self.data.borrow().get_ref().clone()
    }
}

impl Read for FlakyTarget {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.data.borrow_mut().read(buf)
    }
}

impl Write for FlakyTarget {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.writes.get() >= self.ok_writes {
            return Err(io::Error::other("device went away"));
        }
        self.writes.set(self.writes.get() + 1);
        self.data.borrow_mut().write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Seek for FlakyTarget {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.data.borrow_mut().seek(pos)
    }
}

impl Sink for FlakyTarget {
    fn sync(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Terminal whose output the test can read back.
#[derive(Clone, Default)]
struct Screen(Rc<RefCell<Vec<u8>>>);

impl Screen {
    fn text(&self) -> String {
        String::from_utf8(self.0.borrow().clone()).unwrap()
    }
}

impl Write for Screen {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.borrow_mut().write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

struct DeadEntropy;

impl RngCore for DeadEntropy {
    fn next_u32(&mut self) -> u32 {
        0
    }
    fn next_u64(&mut self) -> u64 {
        0
    }
    fn fill_bytes(&mut self, _dest: &mut [u8]) {}
    fn try_fill_bytes(&mut self, _dest: &mut [u8]) -> Result<(), rand::Error> {
        Err(rand::Error::new(io::Error::other("no entropy")))
    }
}

impl CryptoRng for DeadEntropy {}

fn quick() -> SessionConfig {
    SessionConfig::new()
        .display_pause(Duration::ZERO)
        .file_chunk_len(64)
        .device_chunk_len(64)
}

#[test]
fn test_file_on_disk_round_trip() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("secret.txt");
    let plaintext: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
    fs::write(&path, &plaintext).unwrap();

    let platform = Arc::new(RecordingPlatform::default());
    let screen = Screen::default();
    let report = Session::open(&path, quick(), platform.clone())
        .unwrap()
        .with_terminal(screen.clone())
        .run()
        .unwrap();

    assert_eq!(report.kind, TargetKind::RegularFile);
    assert_eq!(report.bytes_processed, 10_000);
    assert_eq!(report.output_len, 10_000 + 16 - (10_000 % 16) as u64);
    assert_eq!(*platform.calls.borrow(), vec!["lock", "unlock"]);

    let mut ciphertext = fs::read(&path).unwrap();
    assert_eq!(ciphertext.len() as u64, report.output_len);
    assert_ne!(&ciphertext[..plaintext.len()], &plaintext[..]);

    let (key, iv) = render::parse_block(&screen.text()).unwrap();
    let recovered = Aes256CbcDec::new_from_slices(&key[..], &iv[..])
        .unwrap()
        .decrypt_padded_mut::<Pkcs7>(&mut ciphertext)
        .unwrap();
    assert_eq!(recovered, &plaintext[..]);
}

#[test]
fn test_io_failure_midway_still_wipes() {
    // Five 64-byte chunks; the third write fails.
    let plaintext = vec![0x5Au8; 320];
    let target = FlakyTarget::new(&plaintext, 2);
    let screen = Screen::default();
    let platform = Arc::new(RecordingPlatform::default());

    let mut session = Session::from_sink(target.clone(), TargetKind::BlockDevice, quick())
        .unwrap()
        .with_terminal(screen.clone())
        .with_platform(platform.clone());
    session.confirm_device();
    let err = session.run().unwrap_err();

    assert_eq!(err.kind(), Some(ErrorKind::Io));
    assert_eq!(err.error.offset(), Some(128));
    assert_eq!(err.bytes_processed, 128);
    assert!(!err.reached(SessionState::Encrypted));
    assert_eq!(
        err.states,
        vec![
            SessionState::Uninitialized,
            SessionState::KeyGenerated,
            SessionState::MemoryPinned,
            SessionState::Encrypting,
            SessionState::KeyDisplayed,
            SessionState::KeyWiped,
            SessionState::MemoryReleased,
        ]
    );
    assert_eq!(*platform.calls.borrow(), vec!["lock", "unlock"]);

    // The key was still shown, and it recovers the encrypted prefix.
    let disclosure = err.disclosure.as_ref().expect("key should have been shown");
    let (key, iv) = render::parse_block(&screen.text()).unwrap();
    assert_eq!(hex::encode(&key[..]), disclosure.key_hex());

    let mut data = FlakyTarget::bytes(&target);
    assert_eq!(&data[128..], &plaintext[128..]);
    let prefix = Aes256CbcDec::new_from_slices(&key[..], &iv[..])
        .unwrap()
        .decrypt_padded_mut::<NoPadding>(&mut data[..128])
        .unwrap();
    assert_eq!(prefix, &plaintext[..128]);
}

#[test]
fn test_entropy_failure_stops_before_anything() {
    let target = FlakyTarget::new(b"untouched", usize::MAX);
    let screen = Screen::default();
    let platform = Arc::new(RecordingPlatform::default());

    let err = Session::from_sink(target.clone(), TargetKind::RegularFile, quick())
        .unwrap()
        .with_terminal(screen.clone())
        .with_platform(platform.clone())
        .with_entropy(DeadEntropy)
        .run()
        .unwrap_err();

    assert_eq!(err.kind(), Some(ErrorKind::EntropySource));
    assert_eq!(err.last_state(), SessionState::Uninitialized);
    assert!(err.disclosure.is_none());
    assert!(platform.calls.borrow().is_empty());
    assert!(screen.text().is_empty());
    assert_eq!(FlakyTarget::bytes(&target), b"untouched");
}

#[test]
fn test_device_needs_confirmation() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("fake-device");
    fs::write(&path, vec![1u8; 4096]).unwrap();
    let platform = Arc::new(RecordingPlatform {
        device: true,
        ..Default::default()
    });

    let err = Session::open(&path, quick(), platform.clone())
        .unwrap()
        .with_terminal(Screen::default())
        .run()
        .unwrap_err();
    assert_eq!(err.kind(), Some(ErrorKind::ConfirmationMissing));
    assert_eq!(err.error.category, ErrorCategory::User);
    assert_eq!(fs::read(&path).unwrap(), vec![1u8; 4096]);

    let mut session = Session::open(&path, quick(), platform.clone())
        .unwrap()
        .with_terminal(Screen::default());
    assert_eq!(session.kind(), TargetKind::BlockDevice);
    session.confirm_device();
    let report = session.run().unwrap();
    assert_eq!(report.output_len, 4096);
    let after = fs::read(&path).unwrap();
    assert_eq!(after.len(), 4096);
    assert_ne!(after, vec![1u8; 4096]);
}

#[test]
fn test_unaligned_device_rejected_at_open() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("odd-device");
    fs::write(&path, vec![1u8; 1000]).unwrap();
    let platform = Arc::new(RecordingPlatform {
        device: true,
        ..Default::default()
    });

    let err = Session::open(&path, quick(), platform.clone()).unwrap_err();
    assert_eq!(err.kind, Some(ErrorKind::UnalignedDevice));
    assert!(platform.calls.borrow().is_empty());
    assert_eq!(fs::read(&path).unwrap(), vec![1u8; 1000]);
}

#[test]
fn test_device_shrunk_after_open_fails_before_key() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("shrinking-device");
    fs::write(&path, vec![1u8; 4096]).unwrap();
    let platform = Arc::new(RecordingPlatform {
        device: true,
        ..Default::default()
    });
    let screen = Screen::default();

    let mut session = Session::open(&path, quick(), platform.clone())
        .unwrap()
        .with_terminal(screen.clone());
    session.confirm_device();
    fs::write(&path, vec![1u8; 4000]).unwrap();
    let err = session.run().unwrap_err();

    assert_eq!(err.kind(), Some(ErrorKind::UnalignedDevice));
    assert_eq!(err.states, vec![SessionState::Uninitialized]);
    assert!(!err.reached(SessionState::KeyGenerated));
    assert!(screen.text().is_empty());
    assert!(platform.calls.borrow().is_empty());
    assert_eq!(fs::read(&path).unwrap(), vec![1u8; 4000]);
}

#[test]
fn test_display_failure_after_encryption() {
    struct Closed;

    impl Write for Closed {
        fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
            Err(io::Error::from(io::ErrorKind::BrokenPipe))
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    let target = FlakyTarget::new(&[9u8; 100], usize::MAX);
    let err = Session::from_sink(target, TargetKind::RegularFile, quick())
        .unwrap()
        .with_terminal(Closed)
        .with_platform(Arc::new(RecordingPlatform::default()))
        .run()
        .unwrap_err();

    assert_eq!(err.kind(), Some(ErrorKind::Io));
    assert_eq!(err.bytes_processed, 100);
    assert!(err.reached(SessionState::Encrypted));
    assert_eq!(err.last_state(), SessionState::MemoryReleased);
    assert!(err.disclosure.is_none());
}

#[test]
fn test_errors_never_mention_key() {
    let target = FlakyTarget::new(&[0u8; 256], 1);
    let screen = Screen::default();
    let mut session = Session::from_sink(target, TargetKind::BlockDevice, quick())
        .unwrap()
        .with_terminal(screen.clone())
        .with_platform(Arc::new(RecordingPlatform::default()));
    session.confirm_device();
    let err = session.run().unwrap_err();

    let disclosure = err.disclosure.as_ref().unwrap();
    let rendered = format!("{err:?} {err} {}", err.error);
    assert!(!rendered.contains(disclosure.key_hex()));
    assert!(!rendered.contains(disclosure.iv_hex()));
}

#[test]
fn test_missing_target() {
    let temp_dir = TempDir::new().unwrap();
    let err = keyshred::begin_session(temp_dir.path().join("nope"), SessionConfig::default())
        .unwrap_err();
    assert_eq!(err.kind, Some(ErrorKind::Validation));
    assert_eq!(err.category, ErrorCategory::User);
}
