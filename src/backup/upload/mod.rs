//! Remote object store collaborators and the multipart upload coordinator.

pub mod coordinator;
pub mod local;
#[cfg(test)]
pub(crate) mod memory;
pub mod retry;
#[cfg(feature = "s3")]
pub mod s3;

use crate::backup::result_error::result::Result;
use chrono::{DateTime, Utc};
use derive_more::Display;
use getset::{CopyGetters, Getters};
use serde::{Deserialize, Serialize};
use std::result;
use std::sync::Arc;
use thiserror::Error;
use validator::{Validate, ValidationErrors};

/// Whether retrying the failed call may succeed
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum StoreErrorKind {
    #[display("transient")]
    Transient,
    #[display("permanent")]
    Permanent,
}

/// Failure reported by an [`ObjectStore`]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{kind} store error: {message}")]
pub struct StoreError {
    kind: StoreErrorKind,
    message: String,
}

impl StoreError {
    pub fn transient<S: Into<String>>(message: S) -> Self {
        Self {
            kind: StoreErrorKind::Transient,
            message: message.into(),
        }
    }

    pub fn permanent<S: Into<String>>(message: S) -> Self {
        Self {
            kind: StoreErrorKind::Permanent,
            message: message.into(),
        }
    }

    pub fn kind(&self) -> StoreErrorKind {
        self.kind
    }

    pub fn is_transient(&self) -> bool {
        self.kind == StoreErrorKind::Transient
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        use std::io::ErrorKind::*;
        match e.kind() {
            TimedOut | Interrupted | WouldBlock | ConnectionReset | ConnectionAborted => {
                StoreError::transient(e.to_string())
            }
            _ => StoreError::permanent(e.to_string()),
        }
    }
}

pub type StoreResult<T> = result::Result<T, StoreError>;

/// Handle of one open multipart upload
#[derive(Debug, Clone, PartialEq, Eq, Getters)]
#[getset(get = "pub")]
pub struct MultipartSession {
    bucket: String,
    key: String,
    /// Identifier assigned by the store
    session_id: String,
}

impl MultipartSession {
    pub fn new<B: Into<String>, K: Into<String>, I: Into<String>>(
        bucket: B,
        key: K,
        session_id: I,
    ) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
            session_id: session_id.into(),
        }
    }
}

/// Part acknowledged by the store
#[derive(Debug, Clone, PartialEq, Eq, Getters, CopyGetters)]
pub struct CompletedPart {
    #[getset(get_copy = "pub")]
    sequence: u32,
    /// Store-assigned tag (ETag for S3)
    #[getset(get = "pub")]
    tag: String,
}

impl CompletedPart {
    pub fn new<S: Into<String>>(sequence: u32, tag: S) -> Self {
        Self {
            sequence,
            tag: tag.into(),
        }
    }
}

/// Catalogue entry of a stored object
#[derive(Debug, Clone, PartialEq, Eq, Getters, CopyGetters)]
pub struct ObjectInfo {
    #[getset(get = "pub")]
    key: String,
    #[getset(get_copy = "pub")]
    last_modified: DateTime<Utc>,
    #[getset(get_copy = "pub")]
    size: u64,
}

impl ObjectInfo {
    pub fn new<S: Into<String>>(key: S, last_modified: DateTime<Utc>, size: u64) -> Self {
        Self {
            key: key.into(),
            last_modified,
            size,
        }
    }
}

/// Multipart-capable object store
///
/// Implementations are blocking and are called from several upload workers at
/// once. `upload_part` must be safe to repeat for the same sequence number;
/// the last successful call wins.
pub trait ObjectStore: Send + Sync {
    fn open_multipart_upload(&self, bucket: &str, key: &str) -> StoreResult<MultipartSession>;

    /// Uploads one part and returns its tag.
    fn upload_part(
        &self,
        session: &MultipartSession,
        sequence: u32,
        data: &[u8],
    ) -> StoreResult<String>;

    /// Assembles the object from `parts`, which are sorted by sequence number.
    fn complete_multipart_upload(
        &self,
        session: &MultipartSession,
        parts: &[CompletedPart],
    ) -> StoreResult<()>;

    /// Releases the staged parts. Aborting a session that is already aborted
    /// or completed succeeds.
    fn abort_multipart_upload(&self, session: &MultipartSession) -> StoreResult<()>;

    /// Smallest size allowed for every part but the last.
    fn min_part_size(&self) -> u64 {
        0
    }

    fn list_objects(&self, bucket: &str, prefix: &str) -> StoreResult<Vec<ObjectInfo>>;

    fn delete_object(&self, bucket: &str, key: &str) -> StoreResult<()>;
}

/// Which object store the archive goes to
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "store_type")]
#[serde(rename_all = "snake_case")]
#[serde(deny_unknown_fields)]
pub enum StoreConfig {
    Local(local::LocalStoreConfig),
    #[cfg(feature = "s3")]
    S3(s3::S3StoreConfig),
}

impl Validate for StoreConfig {
    fn validate(&self) -> result::Result<(), ValidationErrors> {
        match self {
            StoreConfig::Local(inner) => inner.validate(),
            #[cfg(feature = "s3")]
            StoreConfig::S3(inner) => inner.validate(),
        }
    }
}

impl StoreConfig {
    pub fn build(&self) -> Result<Arc<dyn ObjectStore>> {
        let store: Arc<dyn ObjectStore> = match self {
            StoreConfig::Local(config) => Arc::new(local::LocalDirStore::new(config.root())?),
            #[cfg(feature = "s3")]
            StoreConfig::S3(config) => Arc::new(s3::S3Store::new(config)?),
        };
        Ok(store)
    }
}
