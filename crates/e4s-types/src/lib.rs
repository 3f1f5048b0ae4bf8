#![forbid(unsafe_code)]
//! Value types exchanged with the ext4shim native engine.
//!
//! Everything here is an immutable, per-call snapshot: a [`DirEntry`] is one
//! element of a directory listing, a [`Stat`] is one path's metadata at the
//! moment it was requested. Neither is cached or refreshed by the binding
//! layer. Field names match the JSON records the engine writes into the
//! caller's output buffer, so both types deserialize directly from that
//! payload.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, SystemTime};
use thiserror::Error;

/// Initial capacity of the directory-listing output buffer.
pub const LIST_INITIAL_CAPACITY: usize = 64 * 1024;
/// Hard ceiling for the directory-listing output buffer.
pub const LIST_MAX_CAPACITY: usize = 8 * 1024 * 1024;
/// Maximum number of listdir calls made for a single listing.
pub const LIST_MAX_ATTEMPTS: u32 = 5;
/// Fixed capacity of the stat output buffer.
pub const STAT_CAPACITY: usize = 2048;
/// Capacity of the side-channel error message buffer.
pub const ERROR_CAPACITY: usize = 512;

/// Permission bits a caller may set; type bits are chosen by the engine.
pub const PERMISSION_MASK: u16 = 0o777;

pub const S_IFMT: u16 = 0o170_000;
pub const S_IFDIR: u16 = 0o040_000;
pub const S_IFREG: u16 = 0o100_000;
pub const S_IFLNK: u16 = 0o120_000;

pub const ROOT_PATH: &str = "/";
pub const PATH_SEPARATOR: char = '/';

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct InodeNumber(pub u64);

impl fmt::Display for InodeNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// File type decoded from the type bits of an ext4 `i_mode`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FileKind {
    RegularFile,
    Directory,
    Symlink,
    Other,
}

impl FileKind {
    #[must_use]
    pub fn from_mode(mode: u16) -> Self {
        match mode & S_IFMT {
            S_IFREG => Self::RegularFile,
            S_IFDIR => Self::Directory,
            S_IFLNK => Self::Symlink,
            _ => Self::Other,
        }
    }
}

/// Mask `mode` down to the bits a caller is allowed to supply.
#[must_use]
pub fn permission_bits(mode: u32) -> u16 {
    // Truncation is intended: only the low nine bits survive the mask.
    #[allow(clippy::cast_possible_truncation)]
    let low = mode as u16;
    low & PERMISSION_MASK
}

/// One entry of a directory listing, in the order the engine returned it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirEntry {
    pub name: String,
    pub inode: InodeNumber,
    pub is_dir: bool,
    /// Size in bytes as recorded in the inode.
    pub size: u64,
    /// Full `i_mode`, type and permission bits.
    pub mode: u16,
}

impl DirEntry {
    #[must_use]
    pub fn kind(&self) -> FileKind {
        FileKind::from_mode(self.mode)
    }

    #[must_use]
    pub fn permissions(&self) -> u16 {
        self.mode & PERMISSION_MASK
    }
}

/// Metadata snapshot for a single path.
///
/// Timestamps are seconds since the Unix epoch exactly as the engine reports
/// them. A second `stat` of the same path may legitimately differ.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stat {
    pub inode: InodeNumber,
    pub is_dir: bool,
    pub size: u64,
    pub mode: u16,
    pub uid: u32,
    pub gid: u32,
    pub atime: i64,
    pub mtime: i64,
    pub ctime: i64,
}

impl Stat {
    #[must_use]
    pub fn kind(&self) -> FileKind {
        FileKind::from_mode(self.mode)
    }

    #[must_use]
    pub fn permissions(&self) -> u16 {
        self.mode & PERMISSION_MASK
    }

    #[must_use]
    pub fn accessed(&self) -> SystemTime {
        epoch_to_system_time(self.atime)
    }

    #[must_use]
    pub fn modified(&self) -> SystemTime {
        epoch_to_system_time(self.mtime)
    }

    #[must_use]
    pub fn changed(&self) -> SystemTime {
        epoch_to_system_time(self.ctime)
    }
}

fn epoch_to_system_time(secs: i64) -> SystemTime {
    if secs >= 0 {
        SystemTime::UNIX_EPOCH + Duration::from_secs(secs.unsigned_abs())
    } else {
        SystemTime::UNIX_EPOCH - Duration::from_secs(secs.unsigned_abs())
    }
}

/// Validated filesystem block size (must be a power of two in 1024..=65536).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub struct BlockSize(u32);

impl BlockSize {
    pub const DEFAULT: Self = Self(4096);

    /// Create a `BlockSize` if `value` is a power of two in [1024, 65536].
    pub fn new(value: u32) -> Result<Self, ArgumentError> {
        if !value.is_power_of_two() || !(1024..=65536).contains(&value) {
            return Err(ArgumentError::InvalidBlockSize(value));
        }
        Ok(Self(value))
    }

    #[must_use]
    pub fn get(self) -> u32 {
        self.0
    }
}

impl Default for BlockSize {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl TryFrom<u32> for BlockSize {
    type Error = ArgumentError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<BlockSize> for u32 {
    fn from(value: BlockSize) -> Self {
        value.0
    }
}

/// Argument errors detected before anything is handed to the engine.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ArgumentError {
    #[error("{what} contains an interior NUL byte")]
    InteriorNul { what: &'static str },
    #[error("name must not be empty")]
    EmptyName,
    #[error("name {0:?} must not contain a path separator")]
    NameHasSeparator(String),
    #[error("block size {0} must be a power of two in 1024..=65536")]
    InvalidBlockSize(u32),
}

// ── Image path helpers ──────────────────────────────────────────────────────
//
// Paths inside an image are always '/'-separated, independent of the host
// platform. These helpers never touch the host filesystem.

/// Reject names the engine would store verbatim as a broken directory entry.
pub fn validate_basename(name: &str) -> Result<(), ArgumentError> {
    if name.is_empty() {
        return Err(ArgumentError::EmptyName);
    }
    if name.contains(PATH_SEPARATOR) {
        return Err(ArgumentError::NameHasSeparator(name.to_owned()));
    }
    if name.contains('\0') {
        return Err(ArgumentError::InteriorNul { what: "name" });
    }
    Ok(())
}

/// Join a directory path and an entry name with exactly one separator.
#[must_use]
pub fn join(dir: &str, name: &str) -> String {
    let dir = dir.trim_end_matches(PATH_SEPARATOR);
    let name = name.trim_start_matches(PATH_SEPARATOR);
    format!("{dir}/{name}")
}

/// Split an absolute image path into `(parent, basename)`.
///
/// The root and paths without a separator have no parent and return `None`.
#[must_use]
pub fn split_parent(path: &str) -> Option<(&str, &str)> {
    let trimmed = path.trim_end_matches(PATH_SEPARATOR);
    let idx = trimmed.rfind(PATH_SEPARATOR)?;
    let base = &trimmed[idx + 1..];
    if base.is_empty() {
        return None;
    }
    let parent = if idx == 0 { ROOT_PATH } else { &trimmed[..idx] };
    Some((parent, base))
}

/// Final component of an image path, if any.
#[must_use]
pub fn file_name(path: &str) -> Option<&str> {
    split_parent(path).map(|(_, base)| base)
}
