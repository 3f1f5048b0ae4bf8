//! Compound operations built from single engine calls: existence probes,
//! host file import/export and cross-directory moves.
//!
//! None of these are atomic. A failed `move_entry` across directories can
//! leave the target written and the source still present.

use crate::session::Session;
use e4s_error::{Result, ShimError};
use e4s_loader::EngineAbi;
use e4s_types::{join, split_parent, validate_basename};
use std::path::Path;
use tracing::debug;

fn invalid(msg: String) -> ShimError {
    ShimError::InvalidArgument(msg)
}

impl<A: EngineAbi> Session<A> {
    /// Whether `path` exists. Only a not-found answer from the engine maps
    /// to `false`; every other failure is returned.
    pub fn exists(&self, path: &str) -> Result<bool> {
        match self.stat(path) {
            Ok(_) => Ok(true),
            Err(err) if err.is_not_found() => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// Copy the host file at `host_path` into `target_dir`, keeping its file
    /// name. Returns the image path written.
    pub fn import_file(
        &self,
        host_path: impl AsRef<Path>,
        target_dir: &str,
        mode: u32,
    ) -> Result<String> {
        let host_path = host_path.as_ref();
        let name = host_path
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| invalid(format!("{} has no UTF-8 file name", host_path.display())))?;
        validate_basename(name).map_err(|e| invalid(e.to_string()))?;

        let data = std::fs::read(host_path)?;
        let target = join(target_dir, name);
        self.write_overwrite(&target, &data, mode)?;
        debug!(host = %host_path.display(), target, bytes = data.len(), "imported file");
        Ok(target)
    }

    /// Write the image file at `path` to `host_path`. Returns bytes written.
    pub fn export_file(&self, path: &str, host_path: impl AsRef<Path>) -> Result<u64> {
        let host_path = host_path.as_ref();
        let st = self.stat(path)?;
        if st.is_dir {
            return Err(ShimError::NotAFile {
                path: path.to_owned(),
            });
        }
        let data = self.read(path, Some(st.size))?;
        std::fs::write(host_path, &data)?;
        debug!(path, host = %host_path.display(), bytes = data.len(), "exported file");
        Ok(data.len() as u64)
    }

    /// Move the file at `from` to `to`.
    ///
    /// Within one directory this is a single basename rename. Across
    /// directories it is read, write (permission bits preserved), remove.
    /// Directories can only be renamed in place; moving one elsewhere fails
    /// with [`ShimError::NotAFile`]. An existing `to` is never overwritten.
    /// Trailing separators on either path are ignored.
    pub fn move_entry(&self, from: &str, to: &str) -> Result<()> {
        let from = from.trim_end_matches('/');
        let to = to.trim_end_matches('/');
        let (from_parent, _) =
            split_parent(from).ok_or_else(|| invalid(format!("cannot move {from:?}")))?;
        let (to_parent, to_name) =
            split_parent(to).ok_or_else(|| invalid(format!("cannot move to {to:?}")))?;
        if from_parent == to_parent {
            return self.rename(from, to_name);
        }

        let st = self.stat(from)?;
        if st.is_dir {
            return Err(ShimError::NotAFile {
                path: from.to_owned(),
            });
        }
        if self.exists(to)? {
            return Err(invalid(format!("move target {to} already exists")));
        }
        let data = self.read(from, Some(st.size))?;
        self.write_overwrite(to, &data, u32::from(st.permissions()))?;
        self.remove(from)?;
        debug!(from, to, bytes = data.len(), "moved across directories");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use e4s_harness::{EntryPoint, MemEngine};
    use std::sync::Arc;

    const IMG: &str = "transfer.img";

    fn open_session() -> (Arc<MemEngine>, Session<MemEngine>) {
        let engine = Arc::new(MemEngine::with_image(IMG));
        let mut session = Session::new(Arc::clone(&engine));
        session.open(IMG, true).unwrap();
        (engine, session)
    }

    fn names(session: &Session<MemEngine>, dir: &str) -> Vec<String> {
        session
            .listdir(dir)
            .unwrap()
            .into_iter()
            .map(|e| e.name)
            .collect()
    }

    #[test]
    fn exists_maps_only_not_found_to_false() {
        let (engine, session) = open_session();
        session.write_overwrite("/f", b"", 0o644).unwrap();
        assert!(session.exists("/f").unwrap());
        assert!(session.exists("/").unwrap());
        assert!(!session.exists("/missing").unwrap());

        engine.fail_next(EntryPoint::Stat, 1, "read_inode failed");
        assert!(session.exists("/f").is_err());
    }

    #[test]
    fn import_and_export_round_trip_through_host_files() {
        let (_engine, session) = open_session();
        let dir = tempfile::tempdir().unwrap();
        let host = dir.path().join("notes.txt");
        std::fs::write(&host, b"host bytes").unwrap();

        let target = session.import_file(&host, "/inbox/", 0o600).unwrap();
        assert_eq!(target, "/inbox/notes.txt");
        assert_eq!(session.stat(&target).unwrap().permissions(), 0o600);

        let out = dir.path().join("copy.txt");
        assert_eq!(session.export_file(&target, &out).unwrap(), 10);
        assert_eq!(std::fs::read(&out).unwrap(), b"host bytes");
    }

    #[test]
    fn import_of_missing_host_file_is_io_error() {
        let (engine, session) = open_session();
        let dir = tempfile::tempdir().unwrap();
        let err = session
            .import_file(dir.path().join("absent"), "/", 0o644)
            .unwrap_err();
        assert!(matches!(err, ShimError::Io(_)));
        assert_eq!(err.to_errno(), libc::ENOENT);
        assert_eq!(engine.calls(EntryPoint::WriteOverwrite), 0);
    }

    #[test]
    fn export_refuses_directories() {
        let (_engine, session) = open_session();
        session.mkdirs("/d", 0o755).unwrap();
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            session.export_file("/d", dir.path().join("d")),
            Err(ShimError::NotAFile { .. })
        ));
    }

    #[test]
    fn move_within_directory_is_a_rename() {
        let (engine, session) = open_session();
        session.write_overwrite("/d/a", b"data", 0o640).unwrap();
        session.move_entry("/d/a", "/d/b").unwrap();
        assert_eq!(engine.calls(EntryPoint::Rename), 1);
        assert_eq!(names(&session, "/d"), ["b"]);
    }

    #[test]
    fn move_across_directories_copies_and_removes() {
        let (engine, session) = open_session();
        session.write_overwrite("/src/f", b"payload", 0o640).unwrap();
        session.move_entry("/src/f", "/dst/g").unwrap();
        assert_eq!(engine.calls(EntryPoint::Rename), 0);
        assert!(names(&session, "/src").is_empty());
        assert_eq!(session.read("/dst/g", None).unwrap(), b"payload");
        assert_eq!(session.stat("/dst/g").unwrap().permissions(), 0o640);
    }

    #[test]
    fn move_refuses_directories_and_existing_targets() {
        let (_engine, session) = open_session();
        session.mkdirs("/a/sub", 0o755).unwrap();
        session.write_overwrite("/a/f", b"1", 0o644).unwrap();
        session.write_overwrite("/b/f", b"2", 0o644).unwrap();

        assert!(matches!(
            session.move_entry("/a/sub", "/b/sub"),
            Err(ShimError::NotAFile { .. })
        ));
        assert!(matches!(
            session.move_entry("/a/f", "/b/f"),
            Err(ShimError::InvalidArgument(_))
        ));
        assert_eq!(session.read("/b/f", None).unwrap(), b"2");
        assert!(matches!(
            session.move_entry("/", "/b/x"),
            Err(ShimError::InvalidArgument(_))
        ));
    }

    #[test]
    fn move_ignores_trailing_separators() {
        let (engine, session) = open_session();
        session.write_overwrite("/d/a", b"same dir", 0o644).unwrap();
        session.move_entry("/d/a/", "/d/b").unwrap();
        assert_eq!(engine.calls(EntryPoint::Rename), 1);
        assert_eq!(names(&session, "/d"), ["b"]);

        session.mkdirs("/d/sub", 0o755).unwrap();
        session.move_entry("/d/sub/", "/d/renamed/").unwrap();
        assert!(session.stat("/d/renamed").unwrap().is_dir);

        session.move_entry("/d/b/", "/e/b").unwrap();
        assert_eq!(session.read("/e/b", None).unwrap(), b"same dir");
        assert!(!session.exists("/d/b").unwrap());
    }
}
