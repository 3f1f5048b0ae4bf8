//! Locating, loading and binding the ext4shim native engine.
//!
//! The engine is a prebuilt shared library exporting ten C entry points.
//! This crate turns it into a value:
//!
//! - [`LibrarySearch`] is the unloaded state: an ordered list of places the
//!   library might live.
//! - [`NativeEngine`] is the loaded state: the library plus every entry point
//!   resolved up front. A missing export fails construction, not the first
//!   call that needs it.
//! - [`EngineAbi`] is the seam between the two halves of the binding layer.
//!   Sessions are written against the trait, so an in-memory engine can
//!   stand in for the shared library.
//!
//! There is no process-wide state. A loaded engine is immutable after
//! construction; share it with `Arc` and pass it to each session explicitly.
//!
//! This is the only crate in the workspace that contains `unsafe` code.

pub mod abi;
pub mod native;
pub mod search;

pub use abi::{EngineAbi, EngineHandle, REQUIRED_SYMBOLS};
pub use native::NativeEngine;
pub use search::{LIBRARY_ENV_VAR, LIBRARY_STEM, LibrarySearch};
