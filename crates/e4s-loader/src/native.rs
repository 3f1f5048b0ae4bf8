//! `EngineAbi` backed by the real ext4shim shared library.

use crate::abi::{EngineAbi, EngineHandle, REQUIRED_SYMBOLS};
use e4s_error::{Result, SearchedPaths, ShimError};
use libloading::Library;
use std::ffi::{CStr, c_void};
use std::fmt;
use std::os::raw::{c_char, c_int};
use std::path::{Path, PathBuf};
use tracing::{debug, info, trace};

type OpenFn =
    unsafe extern "C" fn(*const c_char, c_int, *mut *mut c_void, *mut c_char, c_int) -> c_int;
type CloseFn = unsafe extern "C" fn(*mut c_void) -> c_int;
type JsonQueryFn = unsafe extern "C" fn(
    *mut c_void,
    *const c_char,
    *mut c_char,
    c_int,
    *mut c_char,
    c_int,
) -> c_int;
type ReadFn = unsafe extern "C" fn(
    *mut c_void,
    *const c_char,
    *mut u8,
    u64,
    *mut u64,
    *mut c_char,
    c_int,
) -> c_int;
type WriteFn = unsafe extern "C" fn(
    *mut c_void,
    *const c_char,
    *const u8,
    u64,
    u16,
    *mut c_char,
    c_int,
) -> c_int;
type MkdirsFn = unsafe extern "C" fn(*mut c_void, *const c_char, u16, *mut c_char, c_int) -> c_int;
type RemoveFn = unsafe extern "C" fn(*mut c_void, *const c_char, *mut c_char, c_int) -> c_int;
type RenameFn =
    unsafe extern "C" fn(*mut c_void, *const c_char, *const c_char, *mut c_char, c_int) -> c_int;
type MkfsFn = unsafe extern "C" fn(
    *const c_char,
    u64,
    u32,
    *const c_char,
    *const c_char,
    *mut c_char,
    c_int,
) -> c_int;

/// Resolved entry points. Valid only while the owning `Library` is loaded.
#[derive(Clone, Copy)]
struct EntryPoints {
    open: OpenFn,
    close: CloseFn,
    listdir: JsonQueryFn,
    stat: JsonQueryFn,
    read: ReadFn,
    write_overwrite: WriteFn,
    mkdirs: MkdirsFn,
    remove: RemoveFn,
    rename: RenameFn,
    mkfs: MkfsFn,
}

impl EntryPoints {
    fn bind(library: &Library, path: &Path) -> Result<Self> {
        check_exports(library, path)?;
        Ok(Self {
            open: symbol(library, path, "ext4_open")?,
            close: symbol(library, path, "ext4_close")?,
            listdir: symbol(library, path, "ext4_listdir")?,
            stat: symbol(library, path, "ext4_stat")?,
            read: symbol(library, path, "ext4_read")?,
            write_overwrite: symbol(library, path, "ext4_write_overwrite")?,
            mkdirs: symbol(library, path, "ext4_mkdirs")?,
            remove: symbol(library, path, "ext4_remove")?,
            rename: symbol(library, path, "ext4_rename")?,
            mkfs: symbol(library, path, "ext4_mkfs")?,
        })
    }
}

/// Fail with every missing export named, not just the first.
fn check_exports(library: &Library, path: &Path) -> Result<()> {
    let missing: Vec<&'static str> = REQUIRED_SYMBOLS
        .iter()
        .copied()
        .filter(|name| {
            // SAFETY: only the symbol's presence is checked; the address is
            // never called or dereferenced.
            unsafe { library.get::<*const c_void>(name.as_bytes()) }.is_err()
        })
        .collect();
    match missing.first() {
        None => Ok(()),
        Some(first) => Err(ShimError::Binding {
            library: path.to_path_buf(),
            symbol: *first,
            detail: format!("missing exports: {}", missing.join(", ")),
        }),
    }
}

fn symbol<T: Copy>(library: &Library, path: &Path, name: &'static str) -> Result<T> {
    // SAFETY: `T` is the C signature declared for `name` by the ext4shim ABI.
    // The copied function pointer is stored next to the `Library` in
    // `NativeEngine` and never outlives it.
    let sym = unsafe { library.get::<T>(name.as_bytes()) }.map_err(|err| ShimError::Binding {
        library: path.to_path_buf(),
        symbol: name,
        detail: err.to_string(),
    })?;
    trace!(symbol = name, "bound native entry point");
    Ok(*sym)
}

fn c_len(buf: &[u8]) -> c_int {
    c_int::try_from(buf.len()).unwrap_or(c_int::MAX)
}

/// A loaded ext4shim library with all ten entry points resolved.
///
/// Construction is the only fallible step: once a `NativeEngine` exists,
/// every entry point is known to be present. The value is immutable and can
/// be shared (`Arc<NativeEngine>`) by any number of sessions. The library is
/// never unloaded while the engine is alive.
pub struct NativeEngine {
    path: PathBuf,
    entry: EntryPoints,
    // Keeps the code behind `entry` mapped; dropped last.
    _library: Library,
}

impl fmt::Debug for NativeEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeEngine")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl NativeEngine {
    /// Load the library at `path` and bind every required entry point.
    ///
    /// The library is trusted to implement the ext4shim ABI; symbol names
    /// are checked here, signatures cannot be checked at runtime.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.is_file() {
            return Err(ShimError::ModuleNotFound {
                searched: SearchedPaths(vec![path.to_path_buf()]),
            });
        }

        debug!(path = %path.display(), "loading native engine");
        // SAFETY: loading runs the library's initialisers. The search path is
        // the trust boundary: only a library placed there by the operator is
        // ever loaded.
        let library = unsafe { Library::new(path) }.map_err(|err| ShimError::LoadFailed {
            path: path.to_path_buf(),
            detail: err.to_string(),
        })?;
        let entry = EntryPoints::bind(&library, path)?;

        info!(path = %path.display(), "native engine loaded");
        Ok(Self {
            path: path.to_path_buf(),
            entry,
            _library: library,
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

// SAFETY (all methods below): every pointer comes from a live borrow that
// outlives the call, every length passed is at most the borrowed slice's
// length, and the engine writes no further than the lengths it is given.
impl EngineAbi for NativeEngine {
    fn open(
        &self,
        image: &CStr,
        read_write: bool,
        handle: &mut Option<EngineHandle>,
        err: &mut [u8],
    ) -> c_int {
        let mut raw: *mut c_void = std::ptr::null_mut();
        let status = unsafe {
            (self.entry.open)(
                image.as_ptr(),
                c_int::from(read_write),
                &raw mut raw,
                err.as_mut_ptr().cast(),
                c_len(err),
            )
        };
        *handle = EngineHandle::from_raw(raw);
        status
    }

    fn close(&self, handle: EngineHandle) -> c_int {
        unsafe { (self.entry.close)(handle.as_ptr()) }
    }

    fn listdir(
        &self,
        handle: &EngineHandle,
        path: &CStr,
        out: &mut [u8],
        err: &mut [u8],
    ) -> c_int {
        unsafe {
            (self.entry.listdir)(
                handle.as_ptr(),
                path.as_ptr(),
                out.as_mut_ptr().cast(),
                c_len(out),
                err.as_mut_ptr().cast(),
                c_len(err),
            )
        }
    }

    fn stat(&self, handle: &EngineHandle, path: &CStr, out: &mut [u8], err: &mut [u8]) -> c_int {
        unsafe {
            (self.entry.stat)(
                handle.as_ptr(),
                path.as_ptr(),
                out.as_mut_ptr().cast(),
                c_len(out),
                err.as_mut_ptr().cast(),
                c_len(err),
            )
        }
    }

    fn read(
        &self,
        handle: &EngineHandle,
        path: &CStr,
        buf: &mut [u8],
        out_read: &mut u64,
        err: &mut [u8],
    ) -> c_int {
        unsafe {
            (self.entry.read)(
                handle.as_ptr(),
                path.as_ptr(),
                buf.as_mut_ptr(),
                buf.len() as u64,
                out_read,
                err.as_mut_ptr().cast(),
                c_len(err),
            )
        }
    }

    fn write_overwrite(
        &self,
        handle: &EngineHandle,
        path: &CStr,
        data: &[u8],
        mode: u16,
        err: &mut [u8],
    ) -> c_int {
        unsafe {
            (self.entry.write_overwrite)(
                handle.as_ptr(),
                path.as_ptr(),
                data.as_ptr(),
                data.len() as u64,
                mode,
                err.as_mut_ptr().cast(),
                c_len(err),
            )
        }
    }

    fn mkdirs(&self, handle: &EngineHandle, path: &CStr, mode: u16, err: &mut [u8]) -> c_int {
        unsafe {
            (self.entry.mkdirs)(
                handle.as_ptr(),
                path.as_ptr(),
                mode,
                err.as_mut_ptr().cast(),
                c_len(err),
            )
        }
    }

    fn remove(&self, handle: &EngineHandle, path: &CStr, err: &mut [u8]) -> c_int {
        unsafe {
            (self.entry.remove)(
                handle.as_ptr(),
                path.as_ptr(),
                err.as_mut_ptr().cast(),
                c_len(err),
            )
        }
    }

    fn rename(
        &self,
        handle: &EngineHandle,
        old_path: &CStr,
        new_basename: &CStr,
        err: &mut [u8],
    ) -> c_int {
        unsafe {
            (self.entry.rename)(
                handle.as_ptr(),
                old_path.as_ptr(),
                new_basename.as_ptr(),
                err.as_mut_ptr().cast(),
                c_len(err),
            )
        }
    }

    fn mkfs(
        &self,
        target: &CStr,
        image_bytes: u64,
        block_size: u32,
        label: &CStr,
        uuid: &CStr,
        err: &mut [u8],
    ) -> c_int {
        unsafe {
            (self.entry.mkfs)(
                target.as_ptr(),
                image_bytes,
                block_size,
                label.as_ptr(),
                uuid.as_ptr(),
                err.as_mut_ptr().cast(),
                c_len(err),
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_is_module_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent-ext4shim.so");
        let err = NativeEngine::load(&path).unwrap_err();
        match err {
            ShimError::ModuleNotFound { searched } => assert_eq!(searched.0, vec![path]),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn non_library_file_fails_to_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(libloading::library_filename("ext4shim"));
        std::fs::write(&path, b"definitely not a shared object").unwrap();
        let err = NativeEngine::load(&path).unwrap_err();
        assert!(
            matches!(err, ShimError::LoadFailed { ref path, .. } if path.ends_with(libloading::library_filename("ext4shim"))),
            "unexpected error: {err:?}"
        );
    }

    /// A real shared library without ext4shim exports must fail at load
    /// time with every missing symbol reported.
    #[cfg(target_os = "linux")]
    #[test]
    fn foreign_library_fails_binding() {
        let candidates = [
            "/lib/x86_64-linux-gnu/libc.so.6",
            "/lib/aarch64-linux-gnu/libc.so.6",
            "/usr/lib64/libc.so.6",
            "/lib64/libc.so.6",
            "/usr/lib/libc.so.6",
        ];
        let Some(libc_path) = candidates.iter().map(Path::new).find(|p| p.is_file()) else {
            return;
        };
        let err = NativeEngine::load(libc_path).unwrap_err();
        match err {
            ShimError::Binding {
                symbol, detail, ..
            } => {
                assert_eq!(symbol, "ext4_open");
                for name in REQUIRED_SYMBOLS {
                    assert!(detail.contains(name), "{name} missing from {detail}");
                }
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
