//! Object store emulated on a local directory.
//!
//! Layout under `root`:
//!
//! ```text
//! <bucket>/<key>                                  completed objects
//! <bucket>/.multipart/<session>/key               key of an open upload
//! <bucket>/.multipart/<session>/<sequence>.part   staged parts
//! ```
//!
//! Completion concatenates the staged parts into `<key>.tmp` and renames it
//! over `<key>`, so a reader never sees a half-written object.

use crate::backup::result_error::result::Result;
use crate::backup::upload::{
    CompletedPart, MultipartSession, ObjectInfo, ObjectStore, StoreError, StoreResult,
};
use crate::backup::validate::validate_dir_exist_or_created;
use bon::Builder;
use chrono::{DateTime, Utc};
use getset::Getters;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Component, Path, PathBuf};
use validator::Validate;
use walkdir::WalkDir;

static MULTIPART_DIR: &str = ".multipart";
static SESSION_KEY_FILE: &str = "key";

#[derive(Clone, Debug, Serialize, Deserialize, Validate, Builder, Getters)]
#[serde(deny_unknown_fields)]
pub struct LocalStoreConfig {
    /// Directory holding one sub-directory per bucket
    #[validate(custom(function = validate_dir_exist_or_created))]
    #[builder(into)]
    #[getset(get = "pub")]
    root: PathBuf,
}

#[derive(Debug)]
pub struct LocalDirStore {
    root: PathBuf,
}

impl LocalDirStore {
    pub fn new<P: AsRef<Path>>(root: P) -> Result<Self> {
        fs::create_dir_all(root.as_ref())?;
        Ok(Self {
            root: root.as_ref().to_path_buf(),
        })
    }

    fn bucket_dir(&self, bucket: &str) -> StoreResult<PathBuf> {
        let dir = self.root.join(checked_relative(bucket)?);
        if !dir.is_dir() {
            return Err(StoreError::permanent(format!("bucket {bucket} does not exist")));
        }
        Ok(dir)
    }

    fn session_dir(&self, session: &MultipartSession) -> StoreResult<PathBuf> {
        Ok(self
            .bucket_dir(session.bucket())?
            .join(MULTIPART_DIR)
            .join(checked_relative(session.session_id())?))
    }
}

/// Rejects absolute paths and `..` so a key cannot escape its bucket.
fn checked_relative(name: &str) -> StoreResult<&Path> {
    let path = Path::new(name);
    let escapes = path
        .components()
        .any(|c| !matches!(c, Component::Normal(_)));
    if name.is_empty() || escapes {
        return Err(StoreError::permanent(format!("invalid name {name:?}")));
    }
    Ok(path)
}

fn part_file(session_dir: &Path, sequence: u32) -> PathBuf {
    session_dir.join(format!("{sequence:05}.part"))
}

impl ObjectStore for LocalDirStore {
    fn open_multipart_upload(&self, bucket: &str, key: &str) -> StoreResult<MultipartSession> {
        checked_relative(key)?;
        let staging = self.bucket_dir(bucket)?.join(MULTIPART_DIR);
        fs::create_dir_all(&staging)?;
        let session_dir = tempfile::Builder::new()
            .prefix("upload-")
            .tempdir_in(&staging)?
            .keep();
        fs::write(session_dir.join(SESSION_KEY_FILE), key)?;

        let session_id = session_dir
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| StoreError::permanent("session directory name is not UTF-8"))?;
        tracing::debug!("Opened local upload {} for {}/{}", session_id, bucket, key);
        Ok(MultipartSession::new(bucket, key, session_id))
    }

    fn upload_part(
        &self,
        session: &MultipartSession,
        sequence: u32,
        data: &[u8],
    ) -> StoreResult<String> {
        let session_dir = self.session_dir(session)?;
        if !session_dir.is_dir() {
            return Err(StoreError::permanent(format!(
                "upload {} is not open",
                session.session_id()
            )));
        }
        let target = part_file(&session_dir, sequence);
        let mut staged = tempfile::NamedTempFile::new_in(&session_dir)?;
        staged.write_all(data)?;
        staged.as_file().sync_all()?;
        staged
            .persist(&target)
            .map_err(|e| StoreError::from(e.error))?;
        Ok(hex::encode(Sha256::digest(data)))
    }

    fn complete_multipart_upload(
        &self,
        session: &MultipartSession,
        parts: &[CompletedPart],
    ) -> StoreResult<()> {
        let session_dir = self.session_dir(session)?;
        let object = self
            .bucket_dir(session.bucket())?
            .join(checked_relative(session.key())?);
        if let Some(parent) = object.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut tmp_name = object.as_os_str().to_owned();
        tmp_name.push(".tmp");
        let tmp = PathBuf::from(tmp_name);
        if let Err(e) = assemble(&tmp, &session_dir, parts).and_then(|()| {
            fs::rename(&tmp, &object).map_err(StoreError::from)
        }) {
            let _ = fs::remove_file(&tmp);
            return Err(e);
        }
        fs::remove_dir_all(&session_dir)?;
        tracing::debug!("Completed local upload {:?}", object);
        Ok(())
    }

    fn abort_multipart_upload(&self, session: &MultipartSession) -> StoreResult<()> {
        let session_dir = self.session_dir(session)?;
        match fs::remove_dir_all(&session_dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn list_objects(&self, bucket: &str, prefix: &str) -> StoreResult<Vec<ObjectInfo>> {
        let bucket_dir = self.bucket_dir(bucket)?;
        let mut objects = Vec::new();
        for entry in WalkDir::new(&bucket_dir)
            .min_depth(1)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| e.file_name() != MULTIPART_DIR)
        {
            let entry = entry.map_err(|e| StoreError::permanent(e.to_string()))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let Ok(relative) = entry.path().strip_prefix(&bucket_dir) else {
                continue;
            };
            let Some(key) = relative.to_str() else {
                continue;
            };
            if !key.starts_with(prefix) || key.ends_with(".tmp") {
                continue;
            }
            let metadata = entry.metadata().map_err(|e| StoreError::permanent(e.to_string()))?;
            let last_modified: DateTime<Utc> = metadata.modified()?.into();
            objects.push(ObjectInfo::new(key, last_modified, metadata.len()));
        }
        Ok(objects)
    }

    fn delete_object(&self, bucket: &str, key: &str) -> StoreResult<()> {
        let path = self.bucket_dir(bucket)?.join(checked_relative(key)?);
        fs::remove_file(path)?;
        Ok(())
    }
}

/// Concatenates the staged parts into `tmp`, checking each against its tag.
fn assemble(tmp: &Path, session_dir: &Path, parts: &[CompletedPart]) -> StoreResult<()> {
    let mut out = File::create(tmp)?;
    for part in parts {
        let path = part_file(session_dir, part.sequence());
        let bytes = fs::read(&path).map_err(|e| {
            StoreError::permanent(format!("part {} is missing: {e}", part.sequence()))
        })?;
        if hex::encode(Sha256::digest(&bytes)) != *part.tag() {
            return Err(StoreError::permanent(format!(
                "part {} does not match its tag",
                part.sequence()
            )));
        }
        out.write_all(&bytes)?;
    }
    out.sync_all()?;
    Ok(())
}
