//! The ten ext4shim entry points as a Rust trait.
//!
//! Methods mirror the C signatures one-to-one: every call returns the raw
//! status code and writes into caller-owned buffers. Decoding those buffers
//! into typed results is the session's job, so an implementation of this
//! trait only has to move bytes across the boundary.

use std::ffi::{CStr, c_void};
use std::os::raw::c_int;
use std::ptr::NonNull;

/// Opaque reference to one open filesystem inside the engine.
///
/// Never null. Not `Clone`: exactly one owner may release it, and
/// [`EngineAbi::close`] consumes it. Not `Sync`: the engine's thread safety
/// is unknown, so two threads must never use a handle at once.
#[derive(Debug, PartialEq, Eq)]
pub struct EngineHandle(NonNull<c_void>);

// SAFETY: the pointer is an opaque token that this crate never dereferences;
// it is only handed back to the engine that produced it. Moving it to another
// thread is sound as long as calls stay serialized, which the missing `Sync`
// impl enforces.
unsafe impl Send for EngineHandle {}

impl EngineHandle {
    /// Adopt a handle returned by the engine; `None` for null.
    #[must_use]
    pub fn from_raw(ptr: *mut c_void) -> Option<Self> {
        NonNull::new(ptr).map(Self)
    }

    #[must_use]
    pub fn as_ptr(&self) -> *mut c_void {
        self.0.as_ptr()
    }
}

/// Static interface over the native engine ABI.
///
/// `err` is always the fixed-capacity message buffer; the engine may leave it
/// unterminated. Output buffers (`out`, `buf`) are written from the start and
/// their length is the capacity announced to the engine.
pub trait EngineAbi: Send + Sync {
    /// `int ext4_open(const char*, int rw, void** handle, char* err, int errlen)`
    ///
    /// On success `handle` receives the engine's handle. Engines are expected
    /// to leave it `None` on failure.
    fn open(
        &self,
        image: &CStr,
        read_write: bool,
        handle: &mut Option<EngineHandle>,
        err: &mut [u8],
    ) -> c_int;

    /// `int ext4_close(void* handle)`
    fn close(&self, handle: EngineHandle) -> c_int;

    /// `int ext4_listdir(void*, const char*, char* json, int buflen, char* err, int errlen)`
    fn listdir(&self, handle: &EngineHandle, path: &CStr, out: &mut [u8], err: &mut [u8])
    -> c_int;

    /// `int ext4_stat(void*, const char*, char* json, int buflen, char* err, int errlen)`
    fn stat(&self, handle: &EngineHandle, path: &CStr, out: &mut [u8], err: &mut [u8]) -> c_int;

    /// `int ext4_read(void*, const char*, uint8_t* buf, uint64_t bufsize, uint64_t* out_read, char* err, int errlen)`
    fn read(
        &self,
        handle: &EngineHandle,
        path: &CStr,
        buf: &mut [u8],
        out_read: &mut u64,
        err: &mut [u8],
    ) -> c_int;

    /// `int ext4_write_overwrite(void*, const char*, const uint8_t* data, uint64_t size, uint16_t mode, char* err, int errlen)`
    fn write_overwrite(
        &self,
        handle: &EngineHandle,
        path: &CStr,
        data: &[u8],
        mode: u16,
        err: &mut [u8],
    ) -> c_int;

    /// `int ext4_mkdirs(void*, const char*, uint16_t mode, char* err, int errlen)`
    fn mkdirs(&self, handle: &EngineHandle, path: &CStr, mode: u16, err: &mut [u8]) -> c_int;

    /// `int ext4_remove(void*, const char*, char* err, int errlen)`
    fn remove(&self, handle: &EngineHandle, path: &CStr, err: &mut [u8]) -> c_int;

    /// `int ext4_rename(void*, const char* old_path, const char* new_basename, char* err, int errlen)`
    fn rename(
        &self,
        handle: &EngineHandle,
        old_path: &CStr,
        new_basename: &CStr,
        err: &mut [u8],
    ) -> c_int;

    /// `int ext4_mkfs(const char* target, uint64_t bytes, uint32_t block_size, const char* label, const char* uuid, char* err, int errlen)`
    ///
    /// Needs no handle. An empty `uuid` asks the engine for its default.
    fn mkfs(
        &self,
        target: &CStr,
        image_bytes: u64,
        block_size: u32,
        label: &CStr,
        uuid: &CStr,
        err: &mut [u8],
    ) -> c_int;
}

/// Names of the exports every engine must provide, in binding order.
pub const REQUIRED_SYMBOLS: [&str; 10] = [
    "ext4_open",
    "ext4_close",
    "ext4_listdir",
    "ext4_stat",
    "ext4_read",
    "ext4_write_overwrite",
    "ext4_mkdirs",
    "ext4_remove",
    "ext4_rename",
    "ext4_mkfs",
];
