//! Ordered search for the native engine module.

use crate::native::NativeEngine;
use e4s_error::{Result, SearchedPaths, ShimError};
use serde::{Deserialize, Serialize};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Environment variable naming an explicit library path.
pub const LIBRARY_ENV_VAR: &str = "EXT4SHIM_DLL";

/// Library stem; the platform prefix and extension are added at runtime.
pub const LIBRARY_STEM: &str = "ext4shim";

/// Where to look for the native engine, in priority order.
///
/// Candidates are produced in this order and the first one that exists and
/// loads wins:
///
/// 1. `explicit`
/// 2. `env_override` (normally `$EXT4SHIM_DLL`)
/// 3. `<install_dir>/<libname>`
/// 4. `<install_dir>/../native/ext4shim/bin/<libname>`
/// 5. `<working_dir>/<libname>`
///
/// `<libname>` is the platform file name for [`LIBRARY_STEM`], for example
/// `ext4shim.dll` or `libext4shim.so`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LibrarySearch {
    pub explicit: Option<PathBuf>,
    pub env_override: Option<PathBuf>,
    pub install_dir: Option<PathBuf>,
    pub working_dir: Option<PathBuf>,
}

impl LibrarySearch {
    /// Search configuration from the process environment: `$EXT4SHIM_DLL`,
    /// the running executable's directory and the current directory.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_parts(
            std::env::var_os(LIBRARY_ENV_VAR),
            std::env::current_exe()
                .ok()
                .and_then(|exe| exe.parent().map(Path::to_path_buf)),
            std::env::current_dir().ok(),
        )
    }

    fn from_parts(
        env_value: Option<OsString>,
        install_dir: Option<PathBuf>,
        working_dir: Option<PathBuf>,
    ) -> Self {
        Self {
            explicit: None,
            env_override: env_value.filter(|v| !v.is_empty()).map(PathBuf::from),
            install_dir,
            working_dir,
        }
    }

    /// Put `path` ahead of every other candidate.
    #[must_use]
    pub fn with_explicit(mut self, path: impl Into<PathBuf>) -> Self {
        self.explicit = Some(path.into());
        self
    }

    /// All candidate paths in priority order. Nothing is checked on disk.
    #[must_use]
    pub fn candidates(&self) -> Vec<PathBuf> {
        let libname = libloading::library_filename(LIBRARY_STEM);
        let mut out = Vec::with_capacity(5);
        out.extend(self.explicit.iter().cloned());
        out.extend(self.env_override.iter().cloned());
        if let Some(dir) = &self.install_dir {
            out.push(dir.join(&libname));
            out.push(
                dir.join("..")
                    .join("native")
                    .join(LIBRARY_STEM)
                    .join("bin")
                    .join(&libname),
            );
        }
        if let Some(dir) = &self.working_dir {
            out.push(dir.join(&libname));
        }
        out
    }

    /// First candidate that exists on disk.
    pub fn locate(&self) -> Result<PathBuf> {
        let candidates = self.candidates();
        candidates
            .iter()
            .find(|path| path.is_file())
            .cloned()
            .ok_or(ShimError::ModuleNotFound {
                searched: SearchedPaths(candidates),
            })
    }

    /// Load the first candidate that exists and binds.
    ///
    /// A candidate that exists but cannot be loaded is skipped with a
    /// warning. A candidate that loads but lacks an entry point stops the
    /// search with `Binding`.
    pub fn load(&self) -> Result<NativeEngine> {
        let candidates = self.candidates();
        let mut last_failure = None;
        for path in &candidates {
            if !path.is_file() {
                debug!(path = %path.display(), "native engine candidate absent");
                continue;
            }
            match NativeEngine::load(path) {
                Ok(engine) => return Ok(engine),
                Err(err @ ShimError::LoadFailed { .. }) => {
                    warn!(path = %path.display(), error = %err, "native engine candidate rejected");
                    last_failure = Some(err);
                }
                Err(err) => return Err(err),
            }
        }
        Err(last_failure.unwrap_or(ShimError::ModuleNotFound {
            searched: SearchedPaths(candidates),
        }))
    }
}
