//! Scoped pinning of secret memory
//!
//! A [`MemoryGuard`] asks the [`Platform`] to keep a region resident and
//! unpins it exactly once: either through [`MemoryGuard::release`] or when the
//! guard is dropped on an early exit or unwind. A refused pin is not an
//! error for the caller; it is logged and the guard simply has nothing to
//! release.

use std::fmt;
use std::mem;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::platform::Platform;

/// Address range of a value in memory.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Region {
    addr: usize,
    len: usize,
}

impl Region {
    /// The memory occupied by `value`.
    pub fn of<T>(value: &T) -> Self {
        Self {
            addr: value as *const T as usize,
            len: mem::size_of::<T>(),
        }
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.addr as *const u8
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl fmt::Debug for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Region({:#x}, {} bytes)", self.addr, self.len)
    }
}

/// A best-effort pin on a memory region.
pub struct MemoryGuard {
    platform: Arc<dyn Platform>,
    region: Region,
    locked: bool,
}

impl MemoryGuard {
    /// Pins `region`. Never fails; check [`MemoryGuard::is_locked`] to learn
    /// whether the OS honoured the request.
    pub fn acquire(platform: Arc<dyn Platform>, region: Region) -> Self {
        let locked = match platform.lock(region) {
            Ok(()) => {
                debug!(bytes = region.len(), "key storage pinned in RAM");
                true
            }
            Err(e) => {
                warn!(
                    error = %e,
                    source = ?e.source_error().map(|s| s.to_string()),
                    "could not pin key storage; it may be written to swap"
                );
                false
            }
        };
        Self {
            platform,
            region,
            locked,
        }
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    pub fn region(&self) -> Region {
        self.region
    }

    /// Unpins the region. Returns true if a pin was actually held.
    pub fn release(mut self) -> bool {
        self.unlock()
    }

    fn unlock(&mut self) -> bool {
        if !mem::replace(&mut self.locked, false) {
            return false;
        }
        match self.platform.unlock(self.region) {
            Ok(()) => debug!("key storage unpinned"),
            Err(e) => warn!(error = %e, "failed to unpin key storage"),
        }
        true
    }
}

impl Drop for MemoryGuard {
    fn drop(&mut self) {
        self.unlock();
    }
}

impl fmt::Debug for MemoryGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryGuard")
            .field("region", &self.region)
            .field("locked", &self.locked)
            .finish()
    }
}


#[cfg(test)]
mod tests {
    use super::testing::RecordingPlatform;
    use super::*;

    #[test]
    fn test_release_unlocks_once() {
        let platform = Arc::new(RecordingPlatform::default());
        let data = [1u8; 16];
        let guard = MemoryGuard::acquire(platform.clone(), Region::of(&data));
        assert!(guard.is_locked());
        assert!(guard.release());
        assert_eq!(*platform.calls.borrow(), vec!["lock", "unlock"]);
    }

    #[test]
    fn test_drop_unlocks() {
        let platform = Arc::new(RecordingPlatform::default());
        let data = [1u8; 16];
        {
            let _guard = MemoryGuard::acquire(platform.clone(), Region::of(&data));
        }
        assert_eq!(*platform.calls.borrow(), vec!["lock", "unlock"]);
    }

    #[test]
    fn test_refused_lock_never_unlocks() {
        let platform = Arc::new(RecordingPlatform {
            refuse_lock: true,
            ..Default::default()
        });
        let data = [1u8; 16];
        let guard = MemoryGuard::acquire(platform.clone(), Region::of(&data));
        assert!(!guard.is_locked());
        assert!(!guard.release());
        assert_eq!(*platform.calls.borrow(), vec!["lock"]);
    }

    #[test]
    fn test_region_covers_value() {
        let data = [0u8; 48];
        let region = Region::of(&data);
        assert_eq!(region.len(), 48);
        assert_eq!(region.as_ptr(), data.as_ptr());
        assert!(!region.is_empty());
    }
}
