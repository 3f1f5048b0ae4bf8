#![forbid(unsafe_code)]
//! Deterministic in-memory stand-in for the ext4shim engine.
//!
//! [`MemEngine`] implements [`EngineAbi`] with the native engine's
//! observable contract: the same JSON field names, the same status codes and
//! the same error strings. Sessions driven by it behave as they would against
//! the shared library, without needing one.
//!
//! On top of that contract it records every call and can be told to
//! misbehave: fail an entry point, hand back a malformed payload, over-report
//! a read, leave the error buffer unterminated.

mod image;

use e4s_error::STATUS_BUFFER_TOO_SMALL;
use e4s_loader::{EngineAbi, EngineHandle};
use image::{MemImage, OpResult};
use parking_lot::Mutex;
use serde::Deserialize;
use std::collections::{HashMap, VecDeque};
use std::ffi::CStr;
use std::os::raw::c_int;
use std::path::{Path, PathBuf};
use tracing::trace;

/// Generic failure status used by the engine.
pub const STATUS_FAILED: c_int = -1;
/// Smallest image the engine agrees to format.
pub const MIN_IMAGE_BYTES: u64 = 16 * 1024 * 1024;
/// Image size used by [`MemEngine::with_image`].
pub const DEFAULT_IMAGE_BYTES: u64 = 64 * 1024 * 1024;

const MSG_BAD_ARGS: &str = "bad args";
const MSG_BUFFER_TOO_SMALL: &str = "buffer too small";
const MSG_OPEN_MISSING: &str = "ext2fs_open failed: No such file or directory";
const MSG_IMAGE_TOO_SMALL: &str = "image too small (>=16MiB)";
const MSG_CANNOT_CREATE: &str = "Cannot create image file";
const MSG_READ_ONLY: &str = "Attempt to write to filesystem opened read-only";

/// The ten entry points, for call accounting and fault targeting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryPoint {
    Open,
    Close,
    Listdir,
    Stat,
    Read,
    WriteOverwrite,
    Mkdirs,
    Remove,
    Rename,
    Mkfs,
}

/// A one-shot misbehaviour for the next call of an entry point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    /// Return `status` with `message` in the error buffer. An empty message
    /// leaves the buffer empty.
    Fail { status: c_int, message: String },
    /// `open` fails but still writes a live handle.
    FailWithHandle { message: String },
    /// `listdir`/`stat` succeed and write these bytes verbatim.
    RawPayload(Vec<u8>),
    /// `read` succeeds but reports `extra` more bytes than the buffer holds.
    InflateRead { extra: u64 },
}

impl Fault {
    #[must_use]
    pub fn fail(message: impl Into<String>) -> Self {
        Self::Fail {
            status: STATUS_FAILED,
            message: message.into(),
        }
    }
}

/// Files and directories to preload into an image, usually from JSON.
///
/// ```json
/// { "dirs": ["/empty"], "files": [{ "path": "/etc/motd", "content": "hi", "mode": 420 }] }
/// ```
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ImageFixture {
    pub dirs: Vec<String>,
    pub files: Vec<FixtureFile>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FixtureFile {
    pub path: String,
    #[serde(default)]
    pub content: String,
    #[serde(default = "default_file_mode")]
    pub mode: u16,
}

fn default_file_mode() -> u16 {
    0o644
}

impl ImageFixture {
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

#[derive(Debug)]
struct OpenImage {
    image: PathBuf,
    read_write: bool,
}

#[derive(Debug, Default)]
struct State {
    images: HashMap<PathBuf, MemImage>,
    handles: HashMap<usize, OpenImage>,
    next_handle: usize,
    calls: HashMap<EntryPoint, usize>,
    faults: HashMap<EntryPoint, VecDeque<Fault>>,
    listdir_capacities: Vec<usize>,
    read_capacities: Vec<usize>,
    dedicated_buffer_status: bool,
    unterminated_errors: bool,
}

impl State {
    fn enter(&mut self, entry: EntryPoint) -> Option<Fault> {
        *self.calls.entry(entry).or_default() += 1;
        self.faults.get_mut(&entry).and_then(VecDeque::pop_front)
    }

    fn register(&mut self, image: PathBuf, read_write: bool) -> Option<EngineHandle> {
        self.next_handle += 1;
        let id = self.next_handle;
        self.handles.insert(id, OpenImage { image, read_write });
        EngineHandle::from_raw(std::ptr::without_provenance_mut(id))
    }

    /// Run `f` against the image behind `handle`. `write_op` names the
    /// operation when it mutates the image.
    fn with_image<T>(
        &mut self,
        handle: &EngineHandle,
        write_op: Option<&str>,
        f: impl FnOnce(&mut MemImage) -> OpResult<T>,
    ) -> OpResult<T> {
        let open = self
            .handles
            .get(&handle.as_ptr().addr())
            .ok_or_else(|| MSG_BAD_ARGS.to_owned())?;
        if let Some(op) = write_op {
            if !open.read_write {
                return Err(format!("{op} failed: {MSG_READ_ONLY}"));
            }
        }
        let image = self
            .images
            .get_mut(&open.image)
            .ok_or_else(|| MSG_BAD_ARGS.to_owned())?;
        f(image)
    }

    fn set_err(&self, err: &mut [u8], message: &str) {
        if err.is_empty() {
            return;
        }
        let bytes = message.as_bytes();
        let room = if self.unterminated_errors {
            err.len()
        } else {
            err.len() - 1
        };
        let n = bytes.len().min(room);
        err[..n].copy_from_slice(&bytes[..n]);
        if n < err.len() {
            err[n] = 0;
        }
    }

    fn finish(&self, entry: EntryPoint, result: OpResult<()>, err: &mut [u8]) -> c_int {
        match result {
            Ok(()) => {
                self.set_err(err, "");
                0
            }
            Err(message) => self.fail(entry, STATUS_FAILED, &message, err),
        }
    }

    fn fail(&self, entry: EntryPoint, status: c_int, message: &str, err: &mut [u8]) -> c_int {
        trace!(?entry, status, error = message, "mem engine failure");
        self.set_err(err, message);
        status
    }

    fn buffer_too_small(&self, entry: EntryPoint, err: &mut [u8]) -> c_int {
        if self.dedicated_buffer_status {
            self.fail(entry, STATUS_BUFFER_TOO_SMALL, "", err)
        } else {
            self.fail(entry, STATUS_FAILED, MSG_BUFFER_TOO_SMALL, err)
        }
    }
}

/// Copy `payload` plus a terminating NUL into `out`.
fn write_payload(out: &mut [u8], payload: &[u8]) -> bool {
    if payload.len() + 1 > out.len() {
        return false;
    }
    out[..payload.len()].copy_from_slice(payload);
    out[payload.len()] = 0;
    true
}

/// Copy as much of `payload` as fits, terminating only if there is room.
fn write_raw(out: &mut [u8], payload: &[u8]) {
    let n = payload.len().min(out.len());
    out[..n].copy_from_slice(&payload[..n]);
    if n < out.len() {
        out[n] = 0;
    }
}

fn utf8(value: &CStr) -> OpResult<&str> {
    value.to_str().map_err(|_| MSG_BAD_ARGS.to_owned())
}

/// In-memory engine. Cheap to construct; share it with `Arc`.
#[derive(Debug, Default)]
pub struct MemEngine {
    state: Mutex<State>,
}

impl MemEngine {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Engine with one empty, formatted image at `path`.
    #[must_use]
    pub fn with_image(path: impl Into<PathBuf>) -> Self {
        let engine = Self::new();
        engine.format(path, DEFAULT_IMAGE_BYTES, 4096, "");
        engine
    }

    /// Create (or replace) an empty image without going through `mkfs`.
    pub fn format(&self, path: impl Into<PathBuf>, size_bytes: u64, block_size: u32, label: &str) {
        self.state
            .lock()
            .images
            .insert(path.into(), MemImage::new(size_bytes, block_size, label, ""));
    }

    /// Preload `fixture` into the image at `path`.
    pub fn install_fixture(&self, path: &Path, fixture: &ImageFixture) -> Result<(), String> {
        let mut state = self.state.lock();
        let image = state
            .images
            .get_mut(path)
            .ok_or_else(|| MSG_OPEN_MISSING.to_owned())?;
        for dir in &fixture.dirs {
            image.mkdirs(dir, 0o755)?;
        }
        for file in &fixture.files {
            image.write_overwrite(&file.path, file.content.as_bytes(), file.mode)?;
        }
        Ok(())
    }

    #[must_use]
    pub fn has_image(&self, path: &Path) -> bool {
        self.state.lock().images.contains_key(path)
    }

    /// `(size_bytes, block_size, label, uuid)` recorded by the last format.
    #[must_use]
    pub fn image_geometry(&self, path: &Path) -> Option<(u64, u32, String, String)> {
        self.state.lock().images.get(path).map(|img| {
            (
                img.size_bytes,
                img.block_size,
                img.label.clone(),
                img.uuid.clone(),
            )
        })
    }

    /// Queue `fault` for the next call of `entry`.
    pub fn push_fault(&self, entry: EntryPoint, fault: Fault) {
        self.state
            .lock()
            .faults
            .entry(entry)
            .or_default()
            .push_back(fault);
    }

    /// Fail the next `times` calls of `entry` with `message`.
    pub fn fail_next(&self, entry: EntryPoint, times: usize, message: &str) {
        for _ in 0..times {
            self.push_fault(entry, Fault::fail(message));
        }
    }

    /// Report undersized listing buffers with the dedicated status and an
    /// empty message instead of the `buffer too small` text.
    pub fn set_dedicated_buffer_status(&self, enabled: bool) {
        self.state.lock().dedicated_buffer_status = enabled;
    }

    /// Let error messages fill the whole buffer without a terminator.
    pub fn set_unterminated_errors(&self, enabled: bool) {
        self.state.lock().unterminated_errors = enabled;
    }

    #[must_use]
    pub fn calls(&self, entry: EntryPoint) -> usize {
        self.state.lock().calls.get(&entry).copied().unwrap_or(0)
    }

    #[must_use]
    pub fn total_calls(&self) -> usize {
        self.state.lock().calls.values().sum()
    }

    /// Output capacities offered to `listdir`, in call order.
    #[must_use]
    pub fn listdir_capacities(&self) -> Vec<usize> {
        self.state.lock().listdir_capacities.clone()
    }

    /// Buffer sizes offered to `read`, in call order.
    #[must_use]
    pub fn read_capacities(&self) -> Vec<usize> {
        self.state.lock().read_capacities.clone()
    }

    /// Handles opened and not yet closed.
    #[must_use]
    pub fn live_handles(&self) -> usize {
        self.state.lock().handles.len()
    }
}

impl EngineAbi for MemEngine {
    fn open(
        &self,
        image: &CStr,
        read_write: bool,
        handle: &mut Option<EngineHandle>,
        err: &mut [u8],
    ) -> c_int {
        let mut state = self.state.lock();
        let entry = EntryPoint::Open;
        *handle = None;
        let fault = state.enter(entry);
        let path = match utf8(image) {
            Ok(path) => PathBuf::from(path),
            Err(message) => return state.fail(entry, STATUS_FAILED, &message, err),
        };
        match fault {
            Some(Fault::Fail { status, message }) => return state.fail(entry, status, &message, err),
            Some(Fault::FailWithHandle { message }) => {
                *handle = state.register(path, read_write);
                return state.fail(entry, STATUS_FAILED, &message, err);
            }
            _ => {}
        }
        if !state.images.contains_key(&path) {
            return state.fail(entry, STATUS_FAILED, MSG_OPEN_MISSING, err);
        }
        *handle = state.register(path, read_write);
        state.finish(entry, Ok(()), err)
    }

    fn close(&self, handle: EngineHandle) -> c_int {
        let mut state = self.state.lock();
        let fault = state.enter(EntryPoint::Close);
        let known = state.handles.remove(&handle.as_ptr().addr()).is_some();
        match fault {
            Some(Fault::Fail { status, .. }) => status,
            _ if known => 0,
            _ => STATUS_FAILED,
        }
    }

    fn listdir(
        &self,
        handle: &EngineHandle,
        path: &CStr,
        out: &mut [u8],
        err: &mut [u8],
    ) -> c_int {
        let mut state = self.state.lock();
        let entry = EntryPoint::Listdir;
        let fault = state.enter(entry);
        state.listdir_capacities.push(out.len());
        match fault {
            Some(Fault::Fail { status, message }) => return state.fail(entry, status, &message, err),
            Some(Fault::RawPayload(payload)) => {
                write_raw(out, &payload);
                return state.finish(entry, Ok(()), err);
            }
            _ => {}
        }
        if out.len() <= 2 {
            return state.fail(entry, STATUS_FAILED, MSG_BAD_ARGS, err);
        }
        let listing = utf8(path).and_then(|path| {
            state.with_image(handle, None, |img| img.list(path))
        });
        let payload = listing.and_then(|entries| {
            serde_json::to_vec(&entries).map_err(|e| e.to_string())
        });
        match payload {
            Err(message) => state.fail(entry, STATUS_FAILED, &message, err),
            Ok(json) if write_payload(out, &json) => state.finish(entry, Ok(()), err),
            Ok(_) => state.buffer_too_small(entry, err),
        }
    }

    fn stat(&self, handle: &EngineHandle, path: &CStr, out: &mut [u8], err: &mut [u8]) -> c_int {
        let mut state = self.state.lock();
        let entry = EntryPoint::Stat;
        match state.enter(entry) {
            Some(Fault::Fail { status, message }) => return state.fail(entry, status, &message, err),
            Some(Fault::RawPayload(payload)) => {
                write_raw(out, &payload);
                return state.finish(entry, Ok(()), err);
            }
            _ => {}
        }
        if out.len() < 16 {
            return state.fail(entry, STATUS_FAILED, MSG_BAD_ARGS, err);
        }
        let stat = utf8(path).and_then(|path| state.with_image(handle, None, |img| img.stat(path)));
        match stat.and_then(|st| serde_json::to_vec(&st).map_err(|e| e.to_string())) {
            Ok(json) => {
                // snprintf semantics: truncated, still terminated, still success.
                let n = json.len().min(out.len() - 1);
                write_raw(out, &json[..n]);
                state.finish(entry, Ok(()), err)
            }
            Err(message) => state.fail(entry, STATUS_FAILED, &message, err),
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
        let mut state = self.state.lock();
        let entry = EntryPoint::Read;
        let fault = state.enter(entry);
        state.read_capacities.push(buf.len());
        *out_read = 0;
        let extra = match fault {
            Some(Fault::Fail { status, message }) => return state.fail(entry, status, &message, err),
            Some(Fault::InflateRead { extra }) => Some(extra),
            _ => None,
        };
        let capacity = buf.len();
        let copied = utf8(path).and_then(|path| {
            state.with_image(handle, None, |img| {
                let data = img.read(path, capacity)?;
                buf[..data.len()].copy_from_slice(data);
                Ok(data.len() as u64)
            })
        });
        match copied {
            Ok(n) => {
                *out_read = extra.map_or(n, |extra| capacity as u64 + extra);
                state.finish(entry, Ok(()), err)
            }
            Err(message) => state.fail(entry, STATUS_FAILED, &message, err),
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
        let mut state = self.state.lock();
        let entry = EntryPoint::WriteOverwrite;
        if let Some(Fault::Fail { status, message }) = state.enter(entry) {
            return state.fail(entry, status, &message, err);
        }
        let result = utf8(path).and_then(|path| {
            state.with_image(handle, Some("file_write"), |img| {
                img.write_overwrite(path, data, mode)
            })
        });
        state.finish(entry, result, err)
    }

    fn mkdirs(&self, handle: &EngineHandle, path: &CStr, mode: u16, err: &mut [u8]) -> c_int {
        let mut state = self.state.lock();
        let entry = EntryPoint::Mkdirs;
        if let Some(Fault::Fail { status, message }) = state.enter(entry) {
            return state.fail(entry, status, &message, err);
        }
        let result = utf8(path).and_then(|path| {
            state.with_image(handle, Some("mkdir"), |img| img.mkdirs(path, mode).map(drop))
        });
        state.finish(entry, result, err)
    }

    fn remove(&self, handle: &EngineHandle, path: &CStr, err: &mut [u8]) -> c_int {
        let mut state = self.state.lock();
        let entry = EntryPoint::Remove;
        if let Some(Fault::Fail { status, message }) = state.enter(entry) {
            return state.fail(entry, status, &message, err);
        }
        let result = utf8(path)
            .and_then(|path| state.with_image(handle, Some("unlink"), |img| img.remove(path)));
        state.finish(entry, result, err)
    }

    fn rename(
        &self,
        handle: &EngineHandle,
        old_path: &CStr,
        new_basename: &CStr,
        err: &mut [u8],
    ) -> c_int {
        let mut state = self.state.lock();
        let entry = EntryPoint::Rename;
        if let Some(Fault::Fail { status, message }) = state.enter(entry) {
            return state.fail(entry, status, &message, err);
        }
        let result = utf8(old_path).and_then(|old| {
            let new = utf8(new_basename)?;
            if new.is_empty() {
                return Err(MSG_BAD_ARGS.to_owned());
            }
            state.with_image(handle, Some("link(new)"), |img| img.rename(old, new))
        });
        state.finish(entry, result, err)
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
        let mut state = self.state.lock();
        let entry = EntryPoint::Mkfs;
        if let Some(Fault::Fail { status, message }) = state.enter(entry) {
            return state.fail(entry, status, &message, err);
        }
        if image_bytes < MIN_IMAGE_BYTES {
            return state.fail(entry, STATUS_FAILED, MSG_IMAGE_TOO_SMALL, err);
        }
        let target = match utf8(target) {
            Ok("") => return state.fail(entry, STATUS_FAILED, MSG_CANNOT_CREATE, err),
            Ok(target) => PathBuf::from(target),
            Err(message) => return state.fail(entry, STATUS_FAILED, &message, err),
        };
        let block_size = match block_size {
            1024 | 2048 | 4096 => block_size,
            _ => 4096,
        };
        let image = MemImage::new(
            image_bytes,
            block_size,
            &label.to_string_lossy(),
            &uuid.to_string_lossy(),
        );
        state.images.insert(target, image);
        state.finish(entry, Ok(()), err)
    }
}
