#![forbid(unsafe_code)]
//! Error types for the ext4shim binding layer.
//!
//! # Error Taxonomy
//!
//! Failures come from three places, and each has its own shape:
//!
//! | Origin | Type | Examples |
//! |--------|------|----------|
//! | Loader | `ShimError::{ModuleNotFound, LoadFailed, Binding}` | no candidate on disk, missing `ext4_stat` export |
//! | Session state / arguments | `ShimError::{NotOpen, AlreadyOpen, InvalidArgument, NotAFile}` | listing before `open`, NUL byte in a path |
//! | Native engine | `NativeError` wrapped in the per-operation variant | `Mount`, `List`, `Stat`, `Read`, `Write`, `Mkdir`, `Remove`, `Rename`, `Format` |
//!
//! ## Native errors
//!
//! Every entry point returns an integer status (0 = success) and writes a
//! human-readable message into a caller-owned, fixed-capacity buffer. That
//! pair is decoded once at the FFI boundary into a [`NativeError`]; the raw
//! buffer never travels further. An empty message is replaced by a fixed
//! per-operation default such as `"listdir failed"`.
//!
//! The engine has no structured error codes, so [`NativeError::kind`]
//! classifies the message text. A dedicated status,
//! [`STATUS_BUFFER_TOO_SMALL`], is honoured ahead of the text match for
//! engines that provide it.
//!
//! ## Operation failures
//!
//! Listing, stat, read and mount can fail without the engine reporting an
//! error: the payload may not decode, the growth loop may run out of room, or
//! the engine may break its own contract. [`OpFailure`] keeps these apart
//! from native failures so that callers can tell "the engine said no" from
//! "the engine said yes but produced garbage".
//!
//! ## errno Mapping
//!
//! | Variant | errno |
//! |---------|-------|
//! | `ModuleNotFound` / `LoadFailed` | `ENOENT` / `ENOEXEC` |
//! | `Binding` | `ENOEXEC` |
//! | `NotOpen` | `EBADF` |
//! | `AlreadyOpen` | `EBUSY` |
//! | `InvalidArgument` | `EINVAL` |
//! | `NotAFile` | `EISDIR` |
//! | native-backed variants | derived from [`NativeErrorKind`] |
//! | `Io` | raw OS error or `EIO` |

use std::fmt;
use std::os::raw::c_int;
use std::path::PathBuf;
use thiserror::Error;

/// Status an engine may return instead of `-1` when an output buffer is too
/// small for the payload.
pub const STATUS_BUFFER_TOO_SMALL: c_int = -2;

/// Status code plus engine message from one failed native call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct NativeError {
    pub status: c_int,
    pub message: String,
}

/// Coarse classification of a native failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NativeErrorKind {
    BufferTooSmall,
    NotFound,
    NotADirectory,
    IsADirectory,
    AlreadyExists,
    NotEmpty,
    ReadOnly,
    NoSpace,
    InvalidArgument,
    Other,
}

impl NativeError {
    #[must_use]
    pub fn new(status: c_int, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    /// Decode a native status and its message buffer.
    ///
    /// Only bytes before the first NUL are considered; the engine does not
    /// promise termination, so a buffer without one is taken whole. Invalid
    /// UTF-8 is replaced rather than rejected. When nothing is left, the
    /// message becomes `default`.
    #[must_use]
    pub fn from_buffer(status: c_int, buf: &[u8], default: &str) -> Self {
        let message = decode_message(buf);
        if message.is_empty() {
            Self::new(status, default)
        } else {
            Self::new(status, message)
        }
    }

    #[must_use]
    pub fn kind(&self) -> NativeErrorKind {
        if self.status == STATUS_BUFFER_TOO_SMALL {
            return NativeErrorKind::BufferTooSmall;
        }
        let msg = self.message.to_ascii_lowercase();
        // Order matters: "Target exists and is a directory" must classify as
        // IsADirectory, not AlreadyExists.
        if msg.contains("buffer too small") {
            NativeErrorKind::BufferTooSmall
        } else if msg.contains("is a directory") {
            NativeErrorKind::IsADirectory
        } else if msg.contains("not a directory") {
            NativeErrorKind::NotADirectory
        } else if msg.contains("not found") || msg.contains("no such file") {
            NativeErrorKind::NotFound
        } else if msg.contains("already exists") {
            NativeErrorKind::AlreadyExists
        } else if msg.contains("not empty") {
            NativeErrorKind::NotEmpty
        } else if msg.contains("read-only") {
            NativeErrorKind::ReadOnly
        } else if msg.contains("could not allocate") || msg.contains("no free space") {
            NativeErrorKind::NoSpace
        } else if msg.contains("bad args")
            || msg.contains("must be absolute")
            || msg.contains("invalid")
            || msg.contains("empty basename")
            || msg.contains("too small")
        {
            NativeErrorKind::InvalidArgument
        } else {
            NativeErrorKind::Other
        }
    }

    #[must_use]
    pub fn to_errno(&self) -> c_int {
        match self.kind() {
            NativeErrorKind::BufferTooSmall => libc::ERANGE,
            NativeErrorKind::NotFound => libc::ENOENT,
            NativeErrorKind::NotADirectory => libc::ENOTDIR,
            NativeErrorKind::IsADirectory => libc::EISDIR,
            NativeErrorKind::AlreadyExists => libc::EEXIST,
            NativeErrorKind::NotEmpty => libc::ENOTEMPTY,
            NativeErrorKind::ReadOnly => libc::EROFS,
            NativeErrorKind::NoSpace => libc::ENOSPC,
            NativeErrorKind::InvalidArgument => libc::EINVAL,
            NativeErrorKind::Other => libc::EIO,
        }
    }
}

/// Text before the first NUL of an engine-written buffer, lossily decoded.
#[must_use]
pub fn decode_message(buf: &[u8]) -> String {
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    String::from_utf8_lossy(&buf[..end]).into_owned()
}

/// Why a listing, stat, read or mount did not produce a value.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OpFailure {
    /// The engine returned a non-zero status.
    #[error(transparent)]
    Native(NativeError),

    /// The engine reported success but the payload could not be decoded.
    #[error("malformed payload: {detail}")]
    Decode { detail: String, payload: String },

    /// The output buffer never became large enough.
    #[error("output buffer still too small after {attempts} attempts at {capacity} bytes: {last}")]
    BufferExhausted {
        attempts: u32,
        capacity: usize,
        last: NativeError,
    },

    /// The engine violated its calling contract.
    #[error("engine contract violation: {0}")]
    Contract(String),
}

impl OpFailure {
    #[must_use]
    pub fn native(&self) -> Option<&NativeError> {
        match self {
            Self::Native(err) => Some(err),
            Self::BufferExhausted { last, .. } => Some(last),
            Self::Decode { .. } | Self::Contract(_) => None,
        }
    }
}

impl From<NativeError> for OpFailure {
    fn from(err: NativeError) -> Self {
        Self::Native(err)
    }
}

/// Search locations that were probed for the native module.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SearchedPaths(pub Vec<PathBuf>);

impl fmt::Display for SearchedPaths {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return f.write_str("<no candidates>");
        }
        for (i, path) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}", path.display())?;
        }
        Ok(())
    }
}

/// Unified error type for every binding-layer operation.
#[derive(Debug, Error)]
pub enum ShimError {
    /// No candidate path for the native module exists on disk.
    #[error(
        "ext4shim native module not found (searched: {searched}); \
         set EXT4SHIM_DLL or place the library next to the executable"
    )]
    ModuleNotFound { searched: SearchedPaths },

    /// A candidate existed but the dynamic loader rejected it.
    #[error("failed to load native module {}: {detail}", path.display())]
    LoadFailed { path: PathBuf, detail: String },

    /// The module loaded but an entry point is missing.
    #[error("native module {} does not export `{symbol}`: {detail}", library.display())]
    Binding {
        library: PathBuf,
        symbol: &'static str,
        detail: String,
    },

    /// An operation that needs a live handle was issued on a closed session.
    #[error("no image is open in this session")]
    NotOpen,

    /// `open` was called while a handle is still live.
    #[error("session already has {} open; close it first", image.display())]
    AlreadyOpen { image: PathBuf },

    /// An argument cannot be marshaled or violates the call contract.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("cannot open image {}: {source}", image.display())]
    Mount {
        image: PathBuf,
        #[source]
        source: OpFailure,
    },

    #[error("cannot list {path}: {source}")]
    List {
        path: String,
        #[source]
        source: OpFailure,
    },

    #[error("cannot stat {path}: {source}")]
    Stat {
        path: String,
        #[source]
        source: OpFailure,
    },

    /// `read` without a size hint targeted a directory.
    #[error("{path} is not a regular file")]
    NotAFile { path: String },

    #[error("cannot read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: OpFailure,
    },

    #[error("cannot write {path}: {source}")]
    Write {
        path: String,
        #[source]
        source: NativeError,
    },

    #[error("cannot create directory {path}: {source}")]
    Mkdir {
        path: String,
        #[source]
        source: NativeError,
    },

    #[error("cannot remove {path}: {source}")]
    Remove {
        path: String,
        #[source]
        source: NativeError,
    },

    #[error("cannot rename {path} to {new_name}: {source}")]
    Rename {
        path: String,
        new_name: String,
        #[source]
        source: NativeError,
    },

    #[error("cannot format {}: {source}", target.display())]
    Format {
        target: PathBuf,
        #[source]
        source: NativeError,
    },

    /// Host-side I/O outside the native engine (import/export helpers).
    #[error("host I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ShimError {
    /// The native record behind this error, if the engine produced one.
    #[must_use]
    pub fn native(&self) -> Option<&NativeError> {
        match self {
            Self::Mount { source, .. }
            | Self::List { source, .. }
            | Self::Stat { source, .. }
            | Self::Read { source, .. } => source.native(),
            Self::Write { source, .. }
            | Self::Mkdir { source, .. }
            | Self::Remove { source, .. }
            | Self::Rename { source, .. }
            | Self::Format { source, .. } => Some(source),
            Self::ModuleNotFound { .. }
            | Self::LoadFailed { .. }
            | Self::Binding { .. }
            | Self::NotOpen
            | Self::AlreadyOpen { .. }
            | Self::InvalidArgument(_)
            | Self::NotAFile { .. }
            | Self::Io(_) => None,
        }
    }

    /// True when the engine reported that the target does not exist.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        self.native()
            .is_some_and(|err| err.kind() == NativeErrorKind::NotFound)
    }

    /// Convert this error into a POSIX errno.
    ///
    /// The mapping is exhaustive; adding a variant without an arm here is a
    /// compile error.
    #[must_use]
    pub fn to_errno(&self) -> c_int {
        match self {
            Self::ModuleNotFound { .. } => libc::ENOENT,
            Self::LoadFailed { .. } | Self::Binding { .. } => libc::ENOEXEC,
            Self::NotOpen => libc::EBADF,
            Self::AlreadyOpen { .. } => libc::EBUSY,
            Self::InvalidArgument(_) => libc::EINVAL,
            Self::NotAFile { .. } => libc::EISDIR,
            Self::Mount { source, .. }
            | Self::List { source, .. }
            | Self::Stat { source, .. }
            | Self::Read { source, .. } => match source {
                OpFailure::Native(err) => err.to_errno(),
                OpFailure::BufferExhausted { .. } => libc::ERANGE,
                OpFailure::Decode { .. } | OpFailure::Contract(_) => libc::EIO,
            },
            Self::Write { source, .. }
            | Self::Mkdir { source, .. }
            | Self::Remove { source, .. }
            | Self::Rename { source, .. }
            | Self::Format { source, .. } => source.to_errno(),
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
        }
    }
}

/// Result alias using `ShimError`.
pub type Result<T> = std::result::Result<T, ShimError>;
