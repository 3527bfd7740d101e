//! Mount table inspection for block device targets
//!
//! Before a device is destroyed the front end checks that neither the device
//! nor any of its partitions is in use: mounted, active as swap, or claimed by
//! a stacked device such as device-mapper (LVM, LUKS) or md RAID. Only Linux
//! (`/proc/mounts`, `/proc/swaps`, `/sys/class/block`) is understood; other
//! hosts get [`MountStatus::Unknown`].

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::{ErrorCategory, ErrorKind, Result, ShredError};

/// Location of the kernel's mount table.
pub const PROC_MOUNTS: &str = "/proc/mounts";

/// Location of the kernel's active swap list.
pub const PROC_SWAPS: &str = "/proc/swaps";

/// Directory with one entry per block device and partition.
pub const SYS_CLASS_BLOCK: &str = "/sys/class/block";

/// One line of the mount table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountEntry {
    pub device: String,
    pub mount_point: String,
    pub fs_type: String,
}

/// Whether a device is in use.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MountStatus {
    Unmounted,
    /// The device or one of its partitions is mounted. `root` is set when one
    /// of them is mounted at `/`.
    Mounted { entries: Vec<MountEntry>, root: bool },
    /// The device or one of its partitions is active swap.
    Swap { devices: Vec<String> },
    /// The device or one of its partitions backs another block device
    /// (device-mapper, LVM, LUKS, md RAID). Holds kernel device names.
    Held { holders: Vec<String> },
    /// The host's tables could not be read.
    Unknown,
}

impl MountStatus {
    /// Turns anything other than [`MountStatus::Unmounted`] into an error.
    pub fn ensure_unmounted(&self, device: &Path) -> Result<()> {
        match self {
            MountStatus::Unmounted => Ok(()),
            MountStatus::Mounted { entries, root } => {
                let points: Vec<&str> = entries.iter().map(|e| e.mount_point.as_str()).collect();
                let what = if *root {
                    "backs the root filesystem"
                } else {
                    "is mounted"
                };
                Err(ShredError::with_kind(
                    ErrorCategory::User,
                    ErrorKind::Validation,
                    format!("{} {} (at {})", device.display(), what, points.join(", ")),
                ))
            }
            MountStatus::Swap { devices } => Err(ShredError::with_kind(
                ErrorCategory::User,
                ErrorKind::Validation,
                format!("{} is in use as swap ({})", device.display(), devices.join(", ")),
            )),
            MountStatus::Held { holders } => Err(ShredError::with_kind(
                ErrorCategory::User,
                ErrorKind::Validation,
                format!(
                    "{} is in use by {} (device-mapper, LVM, LUKS or RAID)",
                    device.display(),
                    holders.join(", ")
                ),
            )),
            MountStatus::Unknown => Err(ShredError::with_kind(
                ErrorCategory::User,
                ErrorKind::Validation,
                format!(
                    "cannot tell whether {} is mounted on this host; refusing to touch it",
                    device.display()
                ),
            )),
        }
    }
}

/// Parses mount table text. Malformed lines are skipped.
pub fn parse_mounts(text: &str) -> Vec<MountEntry> {
    text.lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let device = fields.next()?;
            let mount_point = fields.next()?;
            let fs_type = fields.next()?;
            Some(MountEntry {
                device: unescape(device),
                mount_point: unescape(mount_point),
                fs_type: unescape(fs_type),
            })
        })
        .collect()
}

/// Decodes the `\ooo` octal escapes the kernel uses for whitespace and
/// backslashes.
fn unescape(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 3 < bytes.len() && is_octal_escape(&bytes[i + 1..i + 4]) {
            let value = bytes[i + 1..i + 4]
                .iter()
                .fold(0u32, |acc, digit| acc * 8 + u32::from(digit - b'0'));
            if let Ok(byte) = u8::try_from(value) {
                out.push(byte);
                i += 4;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn is_octal_escape(digits: &[u8]) -> bool {
    digits.len() == 3 && digits.iter().all(|d| (b'0'..=b'7').contains(d))
}

/// True if `candidate` is `device` itself or one of its partitions
/// (`sdb` -> `sdb1`, `nvme0n1` -> `nvme0n1p1`).
pub fn is_same_or_partition(device: &str, candidate: &str) -> bool {
    let Some(rest) = candidate.strip_prefix(device) else {
        return false;
    };
    if rest.is_empty() {
        return true;
    }
    let digits = if device.ends_with(|c: char| c.is_ascii_digit()) {
        match rest.strip_prefix('p') {
            Some(digits) => digits,
            None => return false,
        }
    } else {
        rest
    };
    !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit())
}

/// Checks `device` against already parsed mount entries.
pub fn check_device(device: &str, entries: &[MountEntry]) -> MountStatus {
    let matching: Vec<MountEntry> = entries
        .iter()
        .filter(|e| is_same_or_partition(device, &e.device))
        .cloned()
        .collect();
    if matching.is_empty() {
        MountStatus::Unmounted
    } else {
        let root = matching.iter().any(|e| e.mount_point == "/");
        MountStatus::Mounted {
            entries: matching,
            root,
        }
    }
}

/// Parses `/proc/swaps` text into the swap device paths. The header line
/// is skipped.
pub fn parse_swaps(text: &str) -> Vec<String> {
    text.lines()
        .skip(1)
        .filter_map(|line| line.split_whitespace().next())
        .map(unescape)
        .collect()
}

/// Kernel names of the devices stacked on `name` or any of its partitions,
/// read from the `holders` directories under `sys_class_block`.
pub fn block_holders(sys_class_block: &Path, name: &str) -> io::Result<Vec<String>> {
    let mut holders = Vec::new();
    for entry in fs::read_dir(sys_class_block)? {
        let entry = entry?;
        let entry_name = entry.file_name().to_string_lossy().into_owned();
        if !is_same_or_partition(name, &entry_name) {
            continue;
        }
        let Ok(listing) = fs::read_dir(entry.path().join("holders")) else {
            continue;
        };
        for holder in listing {
            holders.push(holder?.file_name().to_string_lossy().into_owned());
        }
    }
    holders.sort();
    holders.dedup();
    Ok(holders)
}

/// Combines the mount table, the swap list and the device's holders.
///
/// A holder that is itself mounted (root on `/dev/mapper/vg-root` over
/// `/dev/sda2`) is reported as [`MountStatus::Mounted`] so a root filesystem
/// is named as such.
pub fn classify(
    device: &str,
    mounts: &[MountEntry],
    swaps: &[String],
    holders: &[String],
) -> MountStatus {
    let direct = check_device(device, mounts);
    if direct != MountStatus::Unmounted {
        return direct;
    }

    let stacked: Vec<MountEntry> = mounts
        .iter()
        .filter(|e| {
            holders
                .iter()
                .any(|h| is_same_or_partition(&format!("/dev/{h}"), &e.device))
        })
        .cloned()
        .collect();
    if !stacked.is_empty() {
        let root = stacked.iter().any(|e| e.mount_point == "/");
        return MountStatus::Mounted {
            entries: stacked,
            root,
        };
    }

    let swapped: Vec<String> = swaps
        .iter()
        .filter(|s| is_same_or_partition(device, s))
        .cloned()
        .collect();
    if !swapped.is_empty() {
        return MountStatus::Swap { devices: swapped };
    }

    if !holders.is_empty() {
        return MountStatus::Held {
            holders: holders.to_vec(),
        };
    }
    MountStatus::Unmounted
}

/// Checks `device` against the running system.
///
/// Symlinks such as `/dev/disk/by-id/...` and `/dev/mapper/...` are resolved
/// on both sides.
pub fn check_system(device: &Path) -> MountStatus {
    if !cfg!(target_os = "linux") {
        return MountStatus::Unknown;
    }
    let device = resolve(device);
    let Some(name) = device.file_name().map(|n| n.to_string_lossy().into_owned()) else {
        return MountStatus::Unknown;
    };
    let (Some(mounts), Some(swaps)) = (read_table(PROC_MOUNTS), read_table(PROC_SWAPS)) else {
        return MountStatus::Unknown;
    };
    let holders = match block_holders(Path::new(SYS_CLASS_BLOCK), &name) {
        Ok(holders) => holders,
        Err(e) => {
            warn!(error = %e, "failed to read {}", SYS_CLASS_BLOCK);
            return MountStatus::Unknown;
        }
    };

    let mounts: Vec<MountEntry> = parse_mounts(&mounts)
        .into_iter()
        .map(|mut entry| {
            entry.device = resolve_dev(&entry.device);
            entry
        })
        .collect();
    let swaps: Vec<String> = parse_swaps(&swaps).iter().map(|s| resolve_dev(s)).collect();

    let status = classify(&device.display().to_string(), &mounts, &swaps, &holders);
    debug!(device = %device.display(), ?status, "device usage checked");
    status
}

fn read_table(path: &str) -> Option<String> {
    match fs::read_to_string(path) {
        Ok(text) => Some(text),
        Err(e) => {
            warn!(error = %e, "failed to read {}", path);
            None
        }
    }
}

fn resolve_dev(device: &str) -> String {
    if device.starts_with("/dev/") {
        resolve(Path::new(device)).display().to_string()
    } else {
        device.to_string()
    }
}

fn resolve(path: &Path) -> PathBuf {
    fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}
