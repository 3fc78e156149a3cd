use crate::backup::archive::ArchiveEntry;
use crate::backup::finish::Finish;
use crate::backup::pipeline::cancel::Cancellation;
use crate::backup::progress::ProgressCounters;
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use std::io::Write;
use std::sync::mpsc::SyncSender;
use std::sync::Arc;
use tar::HeaderMode;

/// Size of the blocks handed from the archive writer to the cipher stage
pub const ARCHIVE_BLOCK_SIZE: usize = 256 * 1024;

/// Message on the channel between the directory reader and the cipher stage
///
/// The stream is only complete once `End` arrives; a channel that closes
/// without it means the reader gave up.
#[derive(Debug)]
pub enum ArchiveBlock {
    Data(Vec<u8>),
    End,
}

/// `Write` end of the archive stream
///
/// Buffers archive bytes into blocks of [`ARCHIVE_BLOCK_SIZE`] and hands them
/// to a bounded channel, so a slow consumer blocks the archive writer.
pub struct ChannelWriter {
    tx: SyncSender<ArchiveBlock>,
    buffer: Vec<u8>,
    written: u64,
    cancel: Cancellation,
    counters: Arc<ProgressCounters>,
}

impl ChannelWriter {
    pub fn new(
        tx: SyncSender<ArchiveBlock>,
        cancel: Cancellation,
        counters: Arc<ProgressCounters>,
    ) -> Self {
        Self {
            tx,
            buffer: Vec::with_capacity(ARCHIVE_BLOCK_SIZE),
            written: 0,
            cancel,
            counters,
        }
    }

    fn send_buffer(&mut self) -> std::io::Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        if self.cancel.is_cancelled() {
            return Err(std::io::Error::other("archive stream cancelled"));
        }
        let block = std::mem::replace(&mut self.buffer, Vec::with_capacity(ARCHIVE_BLOCK_SIZE));
        self.tx
            .send(ArchiveBlock::Data(block))
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::BrokenPipe, "cipher stage is gone"))
    }
}

impl Write for ChannelWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let n = buf.len().min(ARCHIVE_BLOCK_SIZE - self.buffer.len());
        self.buffer.extend_from_slice(&buf[..n]);
        self.written += n as u64;
        self.counters.add_read(n as u64);
        if self.buffer.len() >= ARCHIVE_BLOCK_SIZE {
            self.send_buffer()?;
        }
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.send_buffer()
    }
}

impl Finish<u64> for ChannelWriter {
    /// Sends the buffered tail and the end marker; returns the archive length.
    fn finish(mut self) -> std::io::Result<u64> {
        self.send_buffer()?;
        self.tx
            .send(ArchiveBlock::End)
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::BrokenPipe, "cipher stage is gone"))?;
        Ok(self.written)
    }
}

/// Serializes entries as a TAR stream into `writer`
///
/// Entries keep their permissions, ownership and mtime; symlinks are stored
/// as links. An entry that cannot be read fails the whole archive with
/// `PartialRead`, so a partial archive is never finalized.
///
/// Returns the number of archive bytes produced.
pub fn stream_tar_archive<I>(entries: I, writer: ChannelWriter, cancel: &Cancellation) -> Result<u64>
where
    I: IntoIterator<Item = Result<ArchiveEntry>>,
{
    let mut builder = tar::Builder::new(writer);
    builder.follow_symlinks(false);
    builder.mode(HeaderMode::Complete);

    // A write failure caused by cancellation or a vanished cipher stage is
    // not the entry's fault.
    let stopped = |e: &std::io::Error| {
        cancel.is_cancelled() || e.kind() == std::io::ErrorKind::BrokenPipe
    };

    let mut entry_count = 0;
    for entry in entries {
        cancel.check()?;
        let entry = entry?;
        builder
            .append_path_with_name(&entry.src, &entry.dst)
            .map_err(|e| {
                if stopped(&e) {
                    Error::Cancelled(format!("archiving stopped at {:?}", entry.src))
                } else {
                    Error::PartialRead {
                        path: entry.src.to_path_buf(),
                        error: Box::new(e.into()),
                    }
                }
            })?;
        tracing::trace!("Archived {:?}", entry.dst);
        entry_count += 1;
    }
    cancel.check()?;

    // into_inner appends the two zero blocks that end the archive
    let written = builder
        .into_inner()
        .and_then(Finish::finish)
        .map_err(|e| {
            if stopped(&e) {
                Error::Cancelled("archiving stopped before the end marker".into())
            } else {
                e.into()
            }
        })?;
    tracing::info!(
        "Archived {} entries into {} byte TAR stream",
        entry_count,
        written
    );
    Ok(written)
}
