pub mod walkdir_globset;

use crate::backup::result_error::result::Result;
use dyn_iter::DynIter;
use std::fs::FileType;
use std::path::Path;
use std::sync::Arc;

/// Kind of filesystem object an archive entry describes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Directory,
    File,
    Symlink,
}

impl EntryKind {
    /// Maps a non-followed file type; `None` for sockets, fifos and devices.
    pub fn from_file_type(file_type: FileType) -> Option<EntryKind> {
        if file_type.is_symlink() {
            Some(EntryKind::Symlink)
        } else if file_type.is_dir() {
            Some(EntryKind::Directory)
        } else if file_type.is_file() {
            Some(EntryKind::File)
        } else {
            None
        }
    }
}

/// Represents a single file, directory or symlink to be written to the archive
#[derive(Debug)]
pub struct ArchiveEntry {
    /// Source path on the filesystem
    pub src: Arc<Path>,

    /// Path of the entry inside the archive
    pub dst: Arc<Path>,

    pub kind: EntryKind,
}

impl ArchiveEntry {
    pub fn new<A: Into<Arc<Path>>, B: Into<Arc<Path>>>(
        src: A,
        dst: B,
        kind: EntryKind,
    ) -> ArchiveEntry {
        Self {
            src: src.into(),
            dst: dst.into(),
            kind,
        }
    }
}

/// Produces the entries of a source tree in archive order
pub trait ArchiveEntryIterable {
    /// Returns the entries in a stable order.
    ///
    /// Fails up front if the source root cannot be read; failures on
    /// individual entries are yielded in place of the entry.
    fn archive_entry_iterator<'a>(&self) -> Result<DynIter<'a, Result<ArchiveEntry>>>;
}
