use crate::backup::arcvec::ArcVec;
use crate::backup::finish::Finish;
use crate::backup::progress::ProgressCounters;
use getset::{CopyGetters, Getters};
use sha2::{Digest, Sha256};
use std::io::Write;
use std::sync::mpsc::SyncSender;
use std::sync::Arc;

/// Largest part count a multipart upload accepts
pub const MAX_PARTS: u32 = 10_000;

/// A sealed, immutable slice of the ciphertext stream
#[derive(Debug, Clone, Getters, CopyGetters)]
pub struct Part {
    /// 1-based position in the stream
    #[getset(get_copy = "pub")]
    sequence: u32,

    #[getset(get = "pub")]
    data: ArcVec<u8>,

    /// Hex SHA-256 of `data`
    #[getset(get = "pub")]
    digest: String,
}

impl Part {
    pub fn new<D: Into<ArcVec<u8>>>(sequence: u32, data: D) -> Self {
        let data = data.into();
        let digest = hex::encode(Sha256::digest(data.as_slice()));
        Self {
            sequence,
            data,
            digest,
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Message from the chunker to the upload coordinator
#[derive(Debug)]
pub enum ChunkerOutput {
    Part(Part),
    /// The ciphertext stream is complete
    End { parts: u32, bytes: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkStats {
    pub parts: u32,
    pub bytes: u64,
}

/// Splits the ciphertext written into it into parts of `part_size` bytes
///
/// Every part but the last is exactly `part_size` long. The last one holds the
/// remainder and is only emitted if non-empty. Sending blocks while the
/// coordinator is busy, which is what holds the cipher stage back.
pub struct Chunker {
    tx: SyncSender<ChunkerOutput>,
    part_size: usize,
    buffer: Vec<u8>,
    next_sequence: u32,
    bytes: u64,
    counters: Arc<ProgressCounters>,
}

impl Chunker {
    pub fn new(
        tx: SyncSender<ChunkerOutput>,
        part_size: usize,
        counters: Arc<ProgressCounters>,
    ) -> Self {
        Self {
            tx,
            part_size: part_size.max(1),
            buffer: Vec::new(),
            next_sequence: 1,
            bytes: 0,
            counters,
        }
    }

    fn seal(&mut self) -> std::io::Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        if self.next_sequence > MAX_PARTS {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("archive needs more than {} parts, increase part_size", MAX_PARTS),
            ));
        }
        let data = std::mem::take(&mut self.buffer);
        let part = Part::new(self.next_sequence, data);
        tracing::debug!(
            "Sealed part {} ({} bytes, sha256 {})",
            part.sequence(),
            part.len(),
            part.digest()
        );
        self.tx
            .send(ChunkerOutput::Part(part))
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::BrokenPipe, "upload coordinator is gone"))?;
        self.next_sequence += 1;
        Ok(())
    }
}

impl Write for Chunker {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        if self.buffer.capacity() == 0 {
            self.buffer.reserve_exact(self.part_size);
        }
        let n = buf.len().min(self.part_size - self.buffer.len());
        self.buffer.extend_from_slice(&buf[..n]);
        self.bytes += n as u64;
        self.counters.add_encrypted(n as u64);
        if self.buffer.len() == self.part_size {
            self.seal()?;
        }
        Ok(n)
    }

    /// Parts are only sealed at size boundaries or on finish.
    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl Finish<ChunkStats> for Chunker {
    fn finish(mut self) -> std::io::Result<ChunkStats> {
        self.seal()?;
        let stats = ChunkStats {
            parts: self.next_sequence - 1,
            bytes: self.bytes,
        };
        self.tx
            .send(ChunkerOutput::End {
                parts: stats.parts,
                bytes: stats.bytes,
            })
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::BrokenPipe, "upload coordinator is gone"))?;
        Ok(stats)
    }
}
