//! Session tuning and image-creation requests.

use e4s_error::{Result, ShimError};
use e4s_types::{
    BlockSize, ERROR_CAPACITY, LIST_INITIAL_CAPACITY, LIST_MAX_ATTEMPTS, LIST_MAX_CAPACITY,
    STAT_CAPACITY,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Smallest stat buffer the engine accepts.
pub const MIN_STAT_CAPACITY: usize = 16;

/// Buffer sizes and retry bounds used by a [`Session`](crate::Session).
///
/// The defaults match what the native engine is known to need. Override
/// them only to exercise the negotiation paths or for unusually large
/// directories.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionOptions {
    /// First listing buffer offered to the engine.
    pub list_initial_capacity: usize,
    /// Listing buffers never grow past this.
    pub list_max_capacity: usize,
    /// Upper bound on listdir calls per listing, the first one included.
    pub list_max_attempts: u32,
    pub stat_capacity: usize,
    /// Side-channel error buffer size for every call.
    pub error_capacity: usize,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            list_initial_capacity: LIST_INITIAL_CAPACITY,
            list_max_capacity: LIST_MAX_CAPACITY,
            list_max_attempts: LIST_MAX_ATTEMPTS,
            stat_capacity: STAT_CAPACITY,
            error_capacity: ERROR_CAPACITY,
        }
    }
}

impl SessionOptions {
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(ShimError::InvalidArgument(msg));
        if self.list_initial_capacity == 0 || self.error_capacity == 0 {
            return invalid("buffer capacities must be non-zero".to_owned());
        }
        if self.list_initial_capacity > self.list_max_capacity {
            return invalid(format!(
                "list_initial_capacity {} exceeds list_max_capacity {}",
                self.list_initial_capacity, self.list_max_capacity
            ));
        }
        if self.list_max_attempts == 0 {
            return invalid("list_max_attempts must be at least 1".to_owned());
        }
        if self.stat_capacity < MIN_STAT_CAPACITY {
            return invalid(format!(
                "stat_capacity {} is below the engine minimum of {MIN_STAT_CAPACITY}",
                self.stat_capacity
            ));
        }
        Ok(())
    }
}

/// Parameters for formatting a new image file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MkfsRequest {
    pub target: PathBuf,
    pub size_bytes: u64,
    #[serde(default)]
    pub block_size: BlockSize,
    #[serde(default)]
    pub label: String,
    /// `None` lets the engine pick.
    #[serde(default)]
    pub uuid: Option<String>,
}

impl MkfsRequest {
    #[must_use]
    pub fn new(target: impl Into<PathBuf>, size_bytes: u64) -> Self {
        Self {
            target: target.into(),
            size_bytes,
            block_size: BlockSize::default(),
            label: String::new(),
            uuid: None,
        }
    }

    pub fn block_size(mut self, bytes: u32) -> Result<Self> {
        self.block_size =
            BlockSize::new(bytes).map_err(|e| ShimError::InvalidArgument(e.to_string()))?;
        Ok(self)
    }

    #[must_use]
    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    #[must_use]
    pub fn uuid(mut self, uuid: impl Into<String>) -> Self {
        self.uuid = Some(uuid.into());
        self
    }

    #[must_use]
    pub fn target(&self) -> &Path {
        &self.target
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_engine_constants() {
        let opts = SessionOptions::default();
        assert_eq!(opts.list_initial_capacity, 64 * 1024);
        assert_eq!(opts.list_max_capacity, 8 * 1024 * 1024);
        assert_eq!(opts.list_max_attempts, 5);
        assert_eq!(opts.stat_capacity, 2048);
        assert_eq!(opts.error_capacity, 512);
        opts.validate().unwrap();
    }

    #[test]
    fn validate_rejects_inconsistent_options() {
        let cases = [
            SessionOptions {
                list_initial_capacity: 0,
                ..SessionOptions::default()
            },
            SessionOptions {
                list_initial_capacity: 1 << 20,
                list_max_capacity: 1 << 10,
                ..SessionOptions::default()
            },
            SessionOptions {
                list_max_attempts: 0,
                ..SessionOptions::default()
            },
            SessionOptions {
                stat_capacity: 8,
                ..SessionOptions::default()
            },
            SessionOptions {
                error_capacity: 0,
                ..SessionOptions::default()
            },
        ];
        for opts in cases {
            assert!(
                matches!(opts.validate(), Err(ShimError::InvalidArgument(_))),
                "{opts:?} accepted"
            );
        }
    }

    #[test]
    fn options_deserialize_partially() {
        let opts: SessionOptions = serde_json::from_str(r#"{"list_max_attempts":2}"#).unwrap();
        assert_eq!(opts.list_max_attempts, 2);
        assert_eq!(opts.stat_capacity, STAT_CAPACITY);
    }

    #[test]
    fn mkfs_request_builder_and_serde() {
        let req = MkfsRequest::new("img", 64 << 20)
            .block_size(1024)
            .unwrap()
            .label("DATA");
        assert_eq!(req.block_size.get(), 1024);
        assert_eq!(req.uuid, None);

        assert!(MkfsRequest::new("img", 1).block_size(3000).is_err());

        let parsed: MkfsRequest =
            serde_json::from_str(r#"{"target":"x.img","size_bytes":16777216}"#).unwrap();
        assert_eq!(parsed.block_size, BlockSize::DEFAULT);
        assert!(parsed.label.is_empty());
        assert!(serde_json::from_str::<MkfsRequest>(
            r#"{"target":"x.img","size_bytes":1,"block_size":100}"#
        )
        .is_err());
    }
}
