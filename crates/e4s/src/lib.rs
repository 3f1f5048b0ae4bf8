#![forbid(unsafe_code)]
//! Public API for reading and writing ext4 images through ext4shim.
//!
//! Re-exports the session, loader, value types and error taxonomy from the
//! workspace crates behind one stable path. Downstream consumers (GUI front
//! ends, scripts) depend on this crate only.

pub use e4s_core::{MIN_STAT_CAPACITY, MkfsRequest, Session, SessionOptions, mkfs_with_search};
pub use e4s_error::{
    NativeError, NativeErrorKind, OpFailure, Result, STATUS_BUFFER_TOO_SMALL, SearchedPaths,
    ShimError,
};
pub use e4s_loader::{
    EngineAbi, EngineHandle, LIBRARY_ENV_VAR, LIBRARY_STEM, LibrarySearch, NativeEngine,
    REQUIRED_SYMBOLS,
};
pub use e4s_types::{
    ArgumentError, BlockSize, DirEntry, FileKind, InodeNumber, Stat, file_name, join,
    permission_bits, split_parent,
};
