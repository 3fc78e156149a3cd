use crate::backup::archive::{ArchiveEntry, ArchiveEntryIterable, EntryKind};
use crate::backup::function_path;
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use crate::backup::result_error::{WithFnName, WithMsg};
use crate::backup::source::ensure_readable_dir;

use bon::Builder;
use derive_more::{Display, From};
use dyn_iter::{DynIter, IntoDynIterator};
use function_name::named;
use getset::Getters;
use globset::{Glob, GlobBuilder, GlobSet, GlobSetBuilder};
use serde::de::Visitor;
use serde::{Deserialize, Deserializer, Serialize};
use walkdir::{DirEntry, WalkDir};

use std::fmt::Formatter;
use std::path::{Path, PathBuf};
use std::result;

/// Size of a TAR header / data block
const TAR_BLOCK: u64 = 512;

/// A directory tree walked in a deterministic order
///
/// Siblings are visited sorted by file name and directories before their
/// contents, so an unchanged tree always yields the same entry sequence.
/// Symlinks are recorded as links and never followed. Paths matching one of
/// the `exclude` globs (relative to `src_dir`) are skipped, together with
/// everything below an excluded directory.
#[derive(Clone, Debug, Builder, PartialEq, Eq, Getters)]
#[getset(get = "pub")]
pub struct WalkdirAndGlobsetSource {
    #[builder(into)]
    src_dir: PathBuf,
    /// Prefix of every entry inside the archive
    #[builder(default, into)]
    dst_dir: PathBuf,
    #[builder(default, into)]
    exclude: Vec<CustomDeserializedGlob>,
}

/// A glob pattern wrapper that handles custom deserialization
///
/// Wraps the `globset::Glob` type with custom serde support for
/// deserializing glob patterns from strings. Literal separator mode is
/// enabled so `*` never crosses a `/`.
#[derive(Clone, Debug, From, Display, Serialize, PartialEq, Eq, Getters)]
#[serde(transparent)]
#[getset(get = "pub")]
pub struct CustomDeserializedGlob {
    glob: Glob,
}

impl CustomDeserializedGlob {
    pub fn new<S: AsRef<str>>(pattern: S) -> Result<Self> {
        Ok(GlobBuilder::new(pattern.as_ref())
            .literal_separator(true)
            .build()?
            .into())
    }
}

struct CustomGlobVisitor;

impl Visitor<'_> for CustomGlobVisitor {
    type Value = CustomDeserializedGlob;

    fn expecting(&self, formatter: &mut Formatter) -> std::fmt::Result {
        formatter.write_str("a glob pattern")
    }

    fn visit_str<E>(self, v: &str) -> result::Result<Self::Value, E>
    where
        E: serde::de::Error,
    {
        GlobBuilder::new(v)
            .literal_separator(true)
            .build()
            .map(CustomDeserializedGlob::from)
            .map_err(serde::de::Error::custom)
    }
}

impl<'de> Deserialize<'de> for CustomDeserializedGlob {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> result::Result<Self, D::Error> {
        deserializer.deserialize_str(CustomGlobVisitor)
    }
}

impl WalkdirAndGlobsetSource {
    fn exclude_set(&self) -> Result<GlobSet> {
        let mut globset = GlobSetBuilder::new();
        self.exclude.iter().for_each(|g| {
            globset.add(g.glob.clone());
        });
        Ok(globset.build()?)
    }

    /// Rough size of the TAR stream for this tree, used for progress estimates.
    ///
    /// Unreadable entries are ignored here; they fail the real walk instead.
    pub fn estimate_archive_size(&self) -> Option<u64> {
        let entries = self.archive_entry_iterator().ok()?;
        let total = entries
            .filter_map(|res| res.ok())
            .map(|entry| {
                let data = match entry.kind {
                    EntryKind::File => std::fs::symlink_metadata(&entry.src)
                        .map(|m| m.len().div_ceil(TAR_BLOCK) * TAR_BLOCK)
                        .unwrap_or(0),
                    EntryKind::Directory | EntryKind::Symlink => 0,
                };
                TAR_BLOCK + data
            })
            .sum::<u64>();
        Some(total + 2 * TAR_BLOCK)
    }
}

impl ArchiveEntryIterable for WalkdirAndGlobsetSource {
    #[named]
    fn archive_entry_iterator<'a>(&self) -> Result<DynIter<'a, Result<ArchiveEntry>>> {
        ensure_readable_dir(&self.src_dir)?;

        tracing::info!(
            "Starting directory scan: {:?} with {} exclude patterns",
            self.src_dir,
            self.exclude.len()
        );

        let exclude = self.exclude_set()?;
        let src_dir = self.src_dir.to_path_buf();
        let dst_dir = self.dst_dir.to_path_buf();
        let filter_src_dir = self.src_dir.to_path_buf();

        let entries = WalkDir::new(&self.src_dir)
            .min_depth(1)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(move |de| !is_excluded(de, &filter_src_dir, &exclude))
            .filter_map(move |res| match res {
                Ok(de) => process_dir_entry(de, &src_dir, &dst_dir),
                Err(e) => Some(Err(walk_error(e))),
            })
            .map(move |res| res.with_fn_name(function_path!()));

        Ok(entries.into_dyn_iter())
    }
}

fn is_excluded(de: &DirEntry, base_src_dir: &Path, exclude: &GlobSet) -> bool {
    let excluded = de
        .path()
        .strip_prefix(base_src_dir)
        .map(|rel| !rel.as_os_str().is_empty() && exclude.is_match(rel))
        .unwrap_or(false);
    if excluded {
        tracing::debug!("Excluding {:?}", de.path());
    }
    excluded
}

fn walk_error(e: walkdir::Error) -> Error {
    let path = e.path().map(Path::to_path_buf).unwrap_or_default();
    Error::PartialRead {
        path,
        error: Box::new(e.into()),
    }
}

fn process_dir_entry<P1: AsRef<Path>, P2: AsRef<Path>>(
    de: DirEntry,
    base_src_dir: P1,
    base_dst_dir: P2,
) -> Option<Result<ArchiveEntry>> {
    let kind = match EntryKind::from_file_type(de.file_type()) {
        Some(kind) => kind,
        None => {
            tracing::warn!("Skipping {:?}, not a file, directory or symlink", de.path());
            return None;
        }
    };

    let p = de.into_path();
    let res = p
        .strip_prefix(base_src_dir.as_ref())
        .map(|stripped_path| base_dst_dir.as_ref().join(stripped_path))
        .map_err(|e| {
            Error::from(e).with_msg(format!(
                "Stripping {:?} from {:?} failed",
                base_src_dir.as_ref(),
                p
            ))
        });

    Some(res.map(|dst| {
        let entry = ArchiveEntry::new(p, dst, kind);
        tracing::trace!("Including {:?}: {:?} -> {:?}", entry.kind, entry.src, entry.dst);
        entry
    }))
}
