#![forbid(unsafe_code)]
//! Filesystem sessions over the ext4shim native engine.
//!
//! A [`Session`] owns one engine handle and exposes typed operations on the
//! image behind it. This crate is where the engine's C conventions end:
//! output buffers are sized and regrown here, JSON payloads become
//! [`DirEntry`](e4s_types::DirEntry) and [`Stat`](e4s_types::Stat) values,
//! and status codes plus error-buffer text become [`ShimError`]s.
//!
//! ```no_run
//! use e4s_core::{MkfsRequest, Session};
//! use e4s_loader::LibrarySearch;
//!
//! # fn main() -> e4s_error::Result<()> {
//! let search = LibrarySearch::from_env();
//! e4s_core::mkfs_with_search(&search, &MkfsRequest::new("disk.img", 64 << 20))?;
//!
//! let mut fs = Session::load(&search)?;
//! fs.open("disk.img", true)?;
//! fs.mkdirs("/demo", 0o755)?;
//! fs.write_overwrite("/demo/hello.txt", b"Hello, ext4!", 0o644)?;
//! assert_eq!(fs.read("/demo/hello.txt", None)?, b"Hello, ext4!");
//! fs.close();
//! # Ok(())
//! # }
//! ```

mod marshal;
mod options;
mod session;
mod transfer;

pub use e4s_error::{Result, ShimError};
pub use options::{MIN_STAT_CAPACITY, MkfsRequest, SessionOptions};
pub use session::Session;

use e4s_loader::LibrarySearch;

/// Load the native engine from `search` and format an image with it.
///
/// The engine is loaded for this call only, so an image can be created
/// before any session exists.
pub fn mkfs_with_search(search: &LibrarySearch, request: &MkfsRequest) -> Result<()> {
    let engine = search.load()?;
    Session::mkfs(&engine, request)
}
