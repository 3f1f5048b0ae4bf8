//! The filesystem session: one engine handle and the typed operations on it.

use crate::marshal::{self, check};
use crate::options::{MkfsRequest, SessionOptions};
use e4s_error::{NativeError, NativeErrorKind, OpFailure, Result, ShimError};
use e4s_loader::{EngineAbi, EngineHandle, LibrarySearch, NativeEngine};
use e4s_types::{DirEntry, ERROR_CAPACITY, Stat, permission_bits, validate_basename};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, trace, warn};

fn is_dot_record(name: &str) -> bool {
    name == "." || name == ".."
}

struct LiveHandle {
    handle: EngineHandle,
    image: PathBuf,
    read_write: bool,
}

/// An open (or openable) ext4 image behind a native engine.
///
/// A session owns at most one engine handle. Every operation except
/// [`open`](Self::open) and [`mkfs`](Self::mkfs) needs that handle and fails
/// with [`ShimError::NotOpen`] without calling the engine when there is none.
///
/// Sessions are `Send` but not `Sync`: the engine makes no thread-safety
/// promises, so one handle is only ever used from one thread at a time.
/// Share the engine (`Arc<A>`) and give each thread its own session instead.
///
/// Dropping a session closes it.
pub struct Session<A: EngineAbi = NativeEngine> {
    engine: Arc<A>,
    options: SessionOptions,
    live: Option<LiveHandle>,
}

impl<A: EngineAbi> fmt::Debug for Session<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("image", &self.image_path())
            .field("read_write", &self.is_read_write())
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl Session<NativeEngine> {
    /// Load the native engine from `search` and wrap it in a closed session.
    pub fn load(search: &LibrarySearch) -> Result<Self> {
        Ok(Self::new(Arc::new(search.load()?)))
    }
}

impl<A: EngineAbi> Session<A> {
    /// A closed session over `engine` with default options.
    #[must_use]
    pub fn new(engine: Arc<A>) -> Self {
        Self {
            engine,
            options: SessionOptions::default(),
            live: None,
        }
    }

    pub fn with_options(engine: Arc<A>, options: SessionOptions) -> Result<Self> {
        options.validate()?;
        Ok(Self {
            engine,
            options,
            live: None,
        })
    }

    // ── Accessors ───────────────────────────────────────────────────────────

    #[must_use]
    pub fn is_open(&self) -> bool {
        self.live.is_some()
    }

    #[must_use]
    pub fn image_path(&self) -> Option<&Path> {
        self.live.as_ref().map(|live| live.image.as_path())
    }

    /// `false` when closed.
    #[must_use]
    pub fn is_read_write(&self) -> bool {
        self.live.as_ref().is_some_and(|live| live.read_write)
    }

    #[must_use]
    pub fn options(&self) -> &SessionOptions {
        &self.options
    }

    #[must_use]
    pub fn engine(&self) -> &Arc<A> {
        &self.engine
    }

    fn live(&self) -> Result<&LiveHandle> {
        self.live.as_ref().ok_or(ShimError::NotOpen)
    }

    fn error_buffer(&self) -> Vec<u8> {
        vec![0; self.options.error_capacity]
    }

    // ── Lifecycle ───────────────────────────────────────────────────────────

    /// Attach the image at `image`.
    ///
    /// Fails with [`ShimError::AlreadyOpen`] while a handle is live; the
    /// live handle is left untouched. On failure the session stays closed.
    pub fn open(&mut self, image: impl AsRef<Path>, read_write: bool) -> Result<()> {
        let image = image.as_ref();
        if let Some(live) = &self.live {
            return Err(ShimError::AlreadyOpen {
                image: live.image.clone(),
            });
        }
        let c_image = marshal::host_path("image path", image)?;
        let mut err = self.error_buffer();
        let mut handle = None;
        let status = self.engine.open(&c_image, read_write, &mut handle, &mut err);
        trace!(op = "open", status, "native call returned");

        let mount_error = |source: OpFailure| ShimError::Mount {
            image: image.to_path_buf(),
            source,
        };
        if status != 0 {
            if let Some(stray) = handle {
                let close_status = self.engine.close(stray);
                warn!(
                    image = %image.display(),
                    status = close_status,
                    "released handle returned by a failed open"
                );
            }
            return Err(mount_error(
                NativeError::from_buffer(status, &err, "open failed").into(),
            ));
        }
        let Some(handle) = handle else {
            return Err(mount_error(OpFailure::Contract(
                "open reported success without a handle".to_owned(),
            )));
        };

        info!(image = %image.display(), read_write, "image opened");
        self.live = Some(LiveHandle {
            handle,
            image: image.to_path_buf(),
            read_write,
        });
        Ok(())
    }

    /// Release the handle, if any. Never fails: a native close error is
    /// logged and the handle is dropped regardless.
    pub fn close(&mut self) {
        let Some(live) = self.live.take() else {
            return;
        };
        let status = self.engine.close(live.handle);
        if status == 0 {
            debug!(image = %live.image.display(), "image closed");
        } else {
            warn!(
                image = %live.image.display(),
                status,
                "native close failed; handle discarded"
            );
        }
    }

    // ── Queries ─────────────────────────────────────────────────────────────

    /// Entries of the directory at `path`, in the engine's directory order.
    ///
    /// The engine's `.` and `..` records are dropped, so an empty directory
    /// lists as empty.
    ///
    /// The listing buffer starts at `list_initial_capacity` and doubles, up
    /// to `list_max_capacity`, each time the engine reports it too small.
    /// After `list_max_attempts` calls (or at the ceiling) the listing fails
    /// with [`OpFailure::BufferExhausted`].
    pub fn listdir(&self, path: &str) -> Result<Vec<DirEntry>> {
        let live = self.live()?;
        let c_path = marshal::cstring("path", path)?;
        let list_error = |source: OpFailure| ShimError::List {
            path: path.to_owned(),
            source,
        };

        let mut capacity = self.options.list_initial_capacity;
        let mut attempt = 0_u32;
        loop {
            attempt += 1;
            let mut out = vec![0_u8; capacity];
            let mut err = self.error_buffer();
            let status = self
                .engine
                .listdir(&live.handle, &c_path, &mut out, &mut err);
            trace!(op = "listdir", path, status, capacity, attempt, "native call returned");

            if status == 0 {
                let mut entries: Vec<DirEntry> =
                    marshal::decode_payload(&out).map_err(list_error)?;
                entries.retain(|entry| !is_dot_record(&entry.name));
                return Ok(entries);
            }
            let native = NativeError::from_buffer(status, &err, "listdir failed");
            if native.kind() != NativeErrorKind::BufferTooSmall {
                return Err(list_error(native.into()));
            }
            if attempt >= self.options.list_max_attempts
                || capacity >= self.options.list_max_capacity
            {
                return Err(list_error(OpFailure::BufferExhausted {
                    attempts: attempt,
                    capacity,
                    last: native,
                }));
            }
            capacity = capacity
                .saturating_mul(2)
                .min(self.options.list_max_capacity);
            debug!(path, capacity, attempt, "listing buffer too small, growing");
        }
    }

    /// Metadata for `path`. Files and directories both succeed.
    pub fn stat(&self, path: &str) -> Result<Stat> {
        let live = self.live()?;
        let c_path = marshal::cstring("path", path)?;
        let stat_error = |source: OpFailure| ShimError::Stat {
            path: path.to_owned(),
            source,
        };
        let mut out = vec![0_u8; self.options.stat_capacity];
        let mut err = self.error_buffer();
        let status = self.engine.stat(&live.handle, &c_path, &mut out, &mut err);
        trace!(op = "stat", path, status, "native call returned");
        check(status, &err, "stat failed").map_err(|e| stat_error(e.into()))?;
        marshal::decode_payload(&out).map_err(stat_error)
    }

    /// Whole content of the file at `path`.
    ///
    /// Without `size_hint` the size comes from a `stat` first, so a
    /// directory fails with [`ShimError::NotAFile`] before the engine's read
    /// is called. The result holds exactly the bytes the engine reports,
    /// which may be fewer than the buffer.
    pub fn read(&self, path: &str, size_hint: Option<u64>) -> Result<Vec<u8>> {
        let live = self.live()?;
        let size = match size_hint {
            Some(size) => size,
            None => {
                let st = self.stat(path)?;
                if st.is_dir {
                    return Err(ShimError::NotAFile {
                        path: path.to_owned(),
                    });
                }
                st.size
            }
        };
        let capacity = usize::try_from(size).map_err(|_| {
            ShimError::InvalidArgument(format!("read size {size} exceeds addressable memory"))
        })?;
        let c_path = marshal::cstring("path", path)?;
        let read_error = |source: OpFailure| ShimError::Read {
            path: path.to_owned(),
            source,
        };

        let mut buf = Vec::new();
        buf.try_reserve_exact(capacity).map_err(|e| {
            ShimError::InvalidArgument(format!("cannot allocate a {size}-byte read buffer: {e}"))
        })?;
        buf.resize(capacity, 0_u8);
        let mut out_read = 0_u64;
        let mut err = self.error_buffer();
        let status = self
            .engine
            .read(&live.handle, &c_path, &mut buf, &mut out_read, &mut err);
        trace!(op = "read", path, status, capacity, out_read, "native call returned");
        check(status, &err, "read failed").map_err(|e| read_error(e.into()))?;

        match usize::try_from(out_read) {
            Ok(n) if n <= capacity => {
                buf.truncate(n);
                Ok(buf)
            }
            _ => Err(read_error(OpFailure::Contract(format!(
                "engine reported {out_read} bytes read into a {capacity}-byte buffer"
            )))),
        }
    }

    // ── Mutations ───────────────────────────────────────────────────────────

    /// Replace the content of `path` with `data`, creating it if needed.
    ///
    /// Only the permission bits of `mode` are passed on; the engine decides
    /// the file type.
    pub fn write_overwrite(&self, path: &str, data: &[u8], mode: u32) -> Result<()> {
        let live = self.live()?;
        let c_path = marshal::cstring("path", path)?;
        let mut err = self.error_buffer();
        let status = self.engine.write_overwrite(
            &live.handle,
            &c_path,
            data,
            permission_bits(mode),
            &mut err,
        );
        trace!(op = "write_overwrite", path, status, len = data.len(), "native call returned");
        check(status, &err, "write_overwrite failed").map_err(|source| ShimError::Write {
            path: path.to_owned(),
            source,
        })
    }

    /// Create `path` and any missing parents. Whether an existing directory
    /// is an error is up to the engine.
    pub fn mkdirs(&self, path: &str, mode: u32) -> Result<()> {
        let live = self.live()?;
        let c_path = marshal::cstring("path", path)?;
        let mut err = self.error_buffer();
        let status = self
            .engine
            .mkdirs(&live.handle, &c_path, permission_bits(mode), &mut err);
        trace!(op = "mkdirs", path, status, "native call returned");
        check(status, &err, "mkdirs failed").map_err(|source| ShimError::Mkdir {
            path: path.to_owned(),
            source,
        })
    }

    pub fn remove(&self, path: &str) -> Result<()> {
        let live = self.live()?;
        let c_path = marshal::cstring("path", path)?;
        let mut err = self.error_buffer();
        let status = self.engine.remove(&live.handle, &c_path, &mut err);
        trace!(op = "remove", path, status, "native call returned");
        check(status, &err, "remove failed").map_err(|source| ShimError::Remove {
            path: path.to_owned(),
            source,
        })
    }

    /// Rename `old_path` to `new_basename` inside the same directory.
    ///
    /// `new_basename` is a name, not a path: an empty name or one containing
    /// `/` is rejected before the engine is called. Use
    /// [`move_entry`](Self::move_entry) to move across directories.
    pub fn rename(&self, old_path: &str, new_basename: &str) -> Result<()> {
        let live = self.live()?;
        validate_basename(new_basename).map_err(|e| ShimError::InvalidArgument(e.to_string()))?;
        let c_old = marshal::cstring("path", old_path)?;
        let c_new = marshal::cstring("name", new_basename)?;
        let mut err = self.error_buffer();
        let status = self.engine.rename(&live.handle, &c_old, &c_new, &mut err);
        trace!(op = "rename", path = old_path, new_basename, status, "native call returned");
        check(status, &err, "rename failed").map_err(|source| ShimError::Rename {
            path: old_path.to_owned(),
            new_name: new_basename.to_owned(),
            source,
        })
    }

    // ── Image creation ──────────────────────────────────────────────────────

    /// Format a new image file. Needs no session and no open handle.
    pub fn mkfs(engine: &A, request: &MkfsRequest) -> Result<()> {
        let c_target = marshal::host_path("target path", &request.target)?;
        let c_label = marshal::cstring("label", &request.label)?;
        let c_uuid = marshal::cstring("uuid", request.uuid.as_deref().unwrap_or(""))?;
        let mut err = vec![0_u8; ERROR_CAPACITY];
        let status = engine.mkfs(
            &c_target,
            request.size_bytes,
            request.block_size.get(),
            &c_label,
            &c_uuid,
            &mut err,
        );
        trace!(op = "mkfs", status, "native call returned");
        check(status, &err, "mkfs failed").map_err(|source| ShimError::Format {
            target: request.target.clone(),
            source,
        })?;
        info!(
            target = %request.target.display(),
            size_bytes = request.size_bytes,
            block_size = request.block_size.get(),
            "image formatted"
        );
        Ok(())
    }
}

impl<A: EngineAbi> Drop for Session<A> {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use e4s_error::STATUS_BUFFER_TOO_SMALL;
    use e4s_harness::{EntryPoint, Fault, MemEngine};

    const IMG: &str = "test.img";

    fn open_session() -> (Arc<MemEngine>, Session<MemEngine>) {
        let engine = Arc::new(MemEngine::with_image(IMG));
        let mut session = Session::new(Arc::clone(&engine));
        session.open(IMG, true).unwrap();
        (engine, session)
    }

    #[test]
    fn operations_on_closed_session_fail_without_engine_calls() {
        let engine = Arc::new(MemEngine::with_image(IMG));
        let session = Session::new(Arc::clone(&engine));
        assert!(matches!(session.listdir("/"), Err(ShimError::NotOpen)));
        assert!(matches!(session.stat("/"), Err(ShimError::NotOpen)));
        assert!(matches!(session.read("/f", None), Err(ShimError::NotOpen)));
        assert!(matches!(session.read("/f", Some(4)), Err(ShimError::NotOpen)));
        assert!(matches!(session.write_overwrite("/f", b"x", 0o644), Err(ShimError::NotOpen)));
        assert!(matches!(session.mkdirs("/d", 0o755), Err(ShimError::NotOpen)));
        assert!(matches!(session.remove("/f"), Err(ShimError::NotOpen)));
        assert!(matches!(session.rename("/f", "g"), Err(ShimError::NotOpen)));
        assert_eq!(engine.total_calls(), 0);
    }

    #[test]
    fn open_records_state_and_close_releases_handle() {
        let (engine, mut session) = open_session();
        assert!(session.is_open());
        assert!(session.is_read_write());
        assert_eq!(session.image_path(), Some(Path::new(IMG)));
        assert_eq!(engine.live_handles(), 1);

        session.close();
        assert!(!session.is_open());
        assert_eq!(session.image_path(), None);
        assert_eq!(engine.live_handles(), 0);
        session.close();
        assert_eq!(engine.calls(EntryPoint::Close), 1);
    }

    #[test]
    fn second_open_is_rejected_and_keeps_first_handle() {
        let (engine, mut session) = open_session();
        match session.open("other.img", false).unwrap_err() {
            ShimError::AlreadyOpen { image } => assert_eq!(image, Path::new(IMG)),
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(engine.calls(EntryPoint::Open), 1);
        assert!(session.is_read_write());
        session.stat("/").unwrap();
    }

    #[test]
    fn failed_open_carries_native_message() {
        let engine = Arc::new(MemEngine::new());
        let mut session = Session::new(Arc::clone(&engine));
        let err = session.open("missing.img", true).unwrap_err();
        match &err {
            ShimError::Mount { image, source } => {
                assert_eq!(image, Path::new("missing.img"));
                assert!(source.to_string().contains("No such file or directory"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(!session.is_open());
    }

    #[test]
    fn failed_open_that_leaks_a_handle_releases_it() {
        let engine = Arc::new(MemEngine::with_image(IMG));
        engine.push_fault(
            EntryPoint::Open,
            Fault::FailWithHandle {
                message: String::new(),
            },
        );
        let mut session = Session::new(Arc::clone(&engine));
        let err = session.open(IMG, true).unwrap_err();
        assert_eq!(err.native().map(|n| n.message.as_str()), Some("open failed"));
        assert_eq!(engine.live_handles(), 0);
        assert!(!session.is_open());
        session.open(IMG, true).unwrap();
    }

    #[test]
    fn close_ignores_native_failure() {
        let (engine, mut session) = open_session();
        engine.push_fault(EntryPoint::Close, Fault::fail("flush failed"));
        session.close();
        assert!(!session.is_open());
        assert_eq!(engine.live_handles(), 0);
    }

    #[test]
    fn drop_closes_the_handle() {
        let (engine, session) = open_session();
        drop(session);
        assert_eq!(engine.live_handles(), 0);
    }

    #[test]
    fn listdir_grows_buffer_until_payload_fits() {
        let engine = Arc::new(MemEngine::with_image(IMG));
        let options = SessionOptions {
            list_initial_capacity: 64,
            ..SessionOptions::default()
        };
        let mut session = Session::with_options(Arc::clone(&engine), options).unwrap();
        session.open(IMG, true).unwrap();
        for i in 0..8 {
            session
                .write_overwrite(&format!("/d/file-{i}"), b"x", 0o644)
                .unwrap();
        }
        let entries = session.listdir("/d").unwrap();
        assert_eq!(entries.len(), 8);
        assert_eq!(engine.listdir_capacities(), [64, 128, 256, 512, 1024]);
    }

    #[test]
    fn listdir_exhausts_attempts() {
        let (engine, session) = open_session();
        engine.fail_next(EntryPoint::Listdir, 5, "buffer too small");
        let err = session.listdir("/").unwrap_err();
        match err {
            ShimError::List {
                source:
                    OpFailure::BufferExhausted {
                        attempts,
                        capacity,
                        last,
                    },
                ..
            } => {
                assert_eq!(attempts, 5);
                assert_eq!(capacity, 1024 * 1024);
                assert_eq!(last.message, "buffer too small");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(engine.calls(EntryPoint::Listdir), 5);
    }

    #[test]
    fn listdir_growth_is_clamped_to_ceiling() {
        let engine = Arc::new(MemEngine::with_image(IMG));
        let options = SessionOptions {
            list_initial_capacity: 100,
            list_max_capacity: 300,
            list_max_attempts: 10,
            ..SessionOptions::default()
        };
        let mut session = Session::with_options(Arc::clone(&engine), options).unwrap();
        session.open(IMG, true).unwrap();
        engine.fail_next(EntryPoint::Listdir, 10, "buffer too small");
        let err = session.listdir("/").unwrap_err();
        assert!(matches!(
            err,
            ShimError::List {
                source: OpFailure::BufferExhausted { attempts: 3, capacity: 300, .. },
                ..
            }
        ));
        assert_eq!(engine.listdir_capacities(), [100, 200, 300]);
    }

    #[test]
    fn listdir_recognises_dedicated_status() {
        let engine = Arc::new(MemEngine::with_image(IMG));
        engine.set_dedicated_buffer_status(true);
        let options = SessionOptions {
            list_initial_capacity: 32,
            ..SessionOptions::default()
        };
        let mut session = Session::with_options(Arc::clone(&engine), options).unwrap();
        session.open(IMG, true).unwrap();
        session.write_overwrite("/some-longer-name.txt", b"", 0o644).unwrap();
        assert_eq!(session.listdir("/").unwrap().len(), 1);
        assert!(engine.listdir_capacities().len() > 1);

        engine.push_fault(
            EntryPoint::Listdir,
            Fault::Fail {
                status: STATUS_BUFFER_TOO_SMALL,
                message: String::new(),
            },
        );
        assert_eq!(session.listdir("/").unwrap().len(), 1);
    }

    #[test]
    fn listdir_drops_only_dot_records() {
        let (engine, session) = open_session();
        session.mkdirs("/demo", 0o755).unwrap();
        assert!(session.listdir("/demo").unwrap().is_empty());
        assert!(session.listdir("/").unwrap().iter().all(|e| e.name == "demo"));

        for name in [".hidden", "...", "..x"] {
            session
                .write_overwrite(&format!("/demo/{name}"), b"", 0o644)
                .unwrap();
        }
        let names: Vec<_> = session
            .listdir("/demo")
            .unwrap()
            .into_iter()
            .map(|e| e.name)
            .collect();
        assert_eq!(names, [".hidden", "...", "..x"]);
        assert_eq!(engine.calls(EntryPoint::Listdir), 3);
    }

    #[test]
    fn listdir_other_failures_are_not_retried() {
        let (engine, session) = open_session();
        session.write_overwrite("/f", b"x", 0o644).unwrap();
        let err = session.listdir("/f").unwrap_err();
        assert_eq!(err.native().map(|n| n.message.as_str()), Some("Not a directory"));
        assert_eq!(engine.calls(EntryPoint::Listdir), 1);
    }

    #[test]
    fn malformed_payloads_are_decode_errors() {
        let (engine, session) = open_session();
        engine.push_fault(EntryPoint::Listdir, Fault::RawPayload(b"[{\"name\":".to_vec()));
        assert!(matches!(
            session.listdir("/").unwrap_err(),
            ShimError::List { source: OpFailure::Decode { .. }, .. }
        ));

        engine.push_fault(EntryPoint::Stat, Fault::RawPayload(b"not json".to_vec()));
        let err = session.stat("/").unwrap_err();
        assert!(matches!(err, ShimError::Stat { source: OpFailure::Decode { .. }, .. }));
        assert!(err.native().is_none());
    }

    #[test]
    fn stat_reports_files_and_directories() {
        let (_engine, session) = open_session();
        session.mkdirs("/d", 0o755).unwrap();
        session.write_overwrite("/d/f", b"hello", 0o600).unwrap();
        let dir = session.stat("/d").unwrap();
        assert!(dir.is_dir);
        let file = session.stat("/d/f").unwrap();
        assert!(!file.is_dir);
        assert_eq!(file.size, 5);
        assert_eq!(file.permissions(), 0o600);
    }

    #[test]
    fn read_of_directory_fails_before_native_read() {
        let (engine, session) = open_session();
        session.mkdirs("/d", 0o755).unwrap();
        assert!(matches!(
            session.read("/d", None),
            Err(ShimError::NotAFile { ref path }) if path == "/d"
        ));
        assert_eq!(engine.calls(EntryPoint::Read), 0);

        let err = session.read("/d", Some(16)).unwrap_err();
        assert!(matches!(err, ShimError::Read { .. }));
        assert_eq!(err.native().map(|n| n.message.as_str()), Some("Is a directory"));
    }

    #[test]
    fn read_truncates_to_reported_length() {
        let (engine, session) = open_session();
        session.write_overwrite("/f", b"short", 0o644).unwrap();
        assert_eq!(session.read("/f", Some(4096)).unwrap(), b"short");
        assert_eq!(session.read("/f", None).unwrap(), b"short");
        assert_eq!(session.read("/f", Some(2)).unwrap(), b"sh");
        assert_eq!(engine.read_capacities(), [4096, 5, 2]);
    }

    #[test]
    fn read_with_unallocatable_hint_fails_without_native_call() {
        let (engine, session) = open_session();
        session.write_overwrite("/f", b"x", 0o644).unwrap();
        let err = session.read("/f", Some(u64::MAX >> 1)).unwrap_err();
        assert!(matches!(err, ShimError::InvalidArgument(_)), "{err:?}");
        assert_eq!(engine.calls(EntryPoint::Read), 0);
        assert_eq!(session.read("/f", Some(1)).unwrap(), b"x");
    }

    #[test]
    fn read_rejects_inflated_byte_counts() {
        let (engine, session) = open_session();
        session.write_overwrite("/f", b"abc", 0o644).unwrap();
        engine.push_fault(EntryPoint::Read, Fault::InflateRead { extra: 1 });
        assert!(matches!(
            session.read("/f", None).unwrap_err(),
            ShimError::Read { source: OpFailure::Contract(_), .. }
        ));
    }

    #[test]
    fn empty_native_messages_use_operation_defaults() {
        let (engine, session) = open_session();
        let cases: [(EntryPoint, &str); 6] = [
            (EntryPoint::Stat, "stat failed"),
            (EntryPoint::Listdir, "listdir failed"),
            (EntryPoint::WriteOverwrite, "write_overwrite failed"),
            (EntryPoint::Mkdirs, "mkdirs failed"),
            (EntryPoint::Remove, "remove failed"),
            (EntryPoint::Rename, "rename failed"),
        ];
        for (entry, _) in cases {
            engine.fail_next(entry, 1, "");
        }
        let results = [
            session.stat("/").map(drop),
            session.listdir("/").map(drop),
            session.write_overwrite("/f", b"", 0o644),
            session.mkdirs("/d", 0o755),
            session.remove("/f"),
            session.rename("/f", "g"),
        ];
        for ((_, expected), result) in cases.iter().zip(results) {
            let err = result.unwrap_err();
            assert_eq!(err.native().map(|n| n.message.as_str()), Some(*expected));
        }

        engine.fail_next(EntryPoint::Read, 1, "");
        let err = session.read("/f", Some(1)).unwrap_err();
        assert_eq!(err.native().map(|n| n.message.as_str()), Some("read failed"));

        engine.fail_next(EntryPoint::Mkfs, 1, "");
        let err = Session::mkfs(engine.as_ref(), &MkfsRequest::new("x.img", 64 << 20)).unwrap_err();
        assert_eq!(err.native().map(|n| n.message.as_str()), Some("mkfs failed"));
    }

    #[test]
    fn write_masks_mode_to_permission_bits() {
        let (_engine, session) = open_session();
        session.write_overwrite("/f", b"x", 0o104_755).unwrap();
        assert_eq!(session.stat("/f").unwrap().permissions(), 0o755);
        session.mkdirs("/d", 0o041_700).unwrap();
        assert_eq!(session.stat("/d").unwrap().permissions(), 0o700);
    }

    #[test]
    fn rename_validates_basename_locally() {
        let (engine, session) = open_session();
        session.write_overwrite("/d/f", b"x", 0o644).unwrap();
        for bad in ["", "a/b", "nul\0"] {
            assert!(matches!(
                session.rename("/d/f", bad),
                Err(ShimError::InvalidArgument(_))
            ));
        }
        assert_eq!(engine.calls(EntryPoint::Rename), 0);
        session.rename("/d/f", "g").unwrap();
        assert_eq!(session.read("/d/g", None).unwrap(), b"x");
    }

    #[test]
    fn mutation_errors_carry_native_message_verbatim() {
        let (_engine, mut session) = open_session();
        session.write_overwrite("/d/a", b"", 0o644).unwrap();
        session.write_overwrite("/d/b", b"", 0o644).unwrap();
        match session.rename("/d/a", "b").unwrap_err() {
            ShimError::Rename { path, new_name, source } => {
                assert_eq!(path, "/d/a");
                assert_eq!(new_name, "b");
                assert_eq!(source.message, "Target name already exists");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        let err = session.remove("/d/nope").unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(err.to_errno(), libc::ENOENT);

        session.close();
        session.open(IMG, false).unwrap();
        let err = session.mkdirs("/x", 0o755).unwrap_err();
        assert!(matches!(err, ShimError::Mkdir { .. }));
        assert_eq!(err.to_errno(), libc::EROFS);
    }

    #[test]
    fn interior_nul_is_rejected_before_engine_call() {
        let (engine, session) = open_session();
        let before = engine.total_calls();
        assert!(matches!(session.stat("/a\0b"), Err(ShimError::InvalidArgument(_))));
        assert!(matches!(
            session.write_overwrite("/a\0", b"", 0o644),
            Err(ShimError::InvalidArgument(_))
        ));
        assert_eq!(engine.total_calls(), before);
    }

    #[test]
    fn mkfs_needs_no_session() {
        let engine = MemEngine::new();
        let request = MkfsRequest::new("fresh.img", 64 << 20)
            .block_size(2048)
            .unwrap()
            .label("PYEXT4");
        Session::mkfs(&engine, &request).unwrap();
        assert_eq!(
            engine.image_geometry(Path::new("fresh.img")),
            Some((64 << 20, 2048, "PYEXT4".to_owned(), String::new()))
        );

        let err = Session::mkfs(&engine, &MkfsRequest::new("tiny.img", 1024)).unwrap_err();
        match err {
            ShimError::Format { target, source } => {
                assert_eq!(target, Path::new("tiny.img"));
                assert_eq!(source.message, "image too small (>=16MiB)");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn with_options_validates() {
        let engine = Arc::new(MemEngine::new());
        let bad = SessionOptions {
            list_max_attempts: 0,
            ..SessionOptions::default()
        };
        assert!(matches!(
            Session::with_options(engine, bad),
            Err(ShimError::InvalidArgument(_))
        ));
    }
}
