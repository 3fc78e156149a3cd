//! Resolution of the configured backup source to the directory that gets archived.

use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Name of the symlink Back In Time keeps pointing at its newest snapshot
static LAST_SNAPSHOT: &str = "last_snapshot";

/// Where the directory tree to back up comes from
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Eq)]
#[serde(tag = "type")]
#[serde(rename_all = "snake_case")]
#[serde(deny_unknown_fields)]
pub enum SourceConfig {
    /// A plain directory
    Directory { path: PathBuf },

    /// The newest snapshot of a Back In Time backup tree
    ///
    /// The tree is searched for the `last_snapshot` symlink, which is then
    /// resolved to the snapshot directory it points at.
    BackInTime { backup_dir: PathBuf },
}

impl SourceConfig {
    /// Returns the directory to archive.
    ///
    /// Fails with `SourceUnreadable` if it does not exist or is not a directory.
    pub fn resolve(&self) -> Result<PathBuf> {
        let dir = match self {
            SourceConfig::Directory { path } => path.clone(),
            SourceConfig::BackInTime { backup_dir } => find_last_snapshot(backup_dir)?,
        };
        ensure_readable_dir(&dir)?;
        Ok(dir)
    }
}

pub(crate) fn ensure_readable_dir(dir: &Path) -> Result<()> {
    let metadata = std::fs::metadata(dir).map_err(|e| Error::SourceUnreadable {
        path: dir.to_path_buf(),
        reason: e.to_string(),
    })?;
    if !metadata.is_dir() {
        return Err(Error::SourceUnreadable {
            path: dir.to_path_buf(),
            reason: "not a directory".into(),
        });
    }
    std::fs::read_dir(dir).map_err(|e| Error::SourceUnreadable {
        path: dir.to_path_buf(),
        reason: e.to_string(),
    })?;
    Ok(())
}

fn find_last_snapshot(backup_dir: &Path) -> Result<PathBuf> {
    ensure_readable_dir(backup_dir)?;
    let not_back_in_time = |reason: &str| Error::SourceUnreadable {
        path: backup_dir.to_path_buf(),
        reason: format!("not a Back In Time backup directory: {reason}"),
    };

    let link = WalkDir::new(backup_dir)
        .min_depth(1)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|res| res.ok())
        .find(|de| de.file_name() == LAST_SNAPSHOT)
        .ok_or_else(|| not_back_in_time("no last_snapshot entry found"))?;

    if !link.path_is_symlink() {
        return Err(not_back_in_time("last_snapshot is not a symlink"));
    }

    let snapshot = std::fs::canonicalize(link.path()).map_err(|e| Error::SourceUnreadable {
        path: link.path().to_path_buf(),
        reason: format!("cannot resolve last_snapshot: {e}"),
    })?;
    tracing::info!("Resolved Back In Time snapshot {:?}", snapshot);
    Ok(snapshot)
}
