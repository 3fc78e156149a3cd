//! Wires the stages of one backup run together.
//!
//! ```text
//! reader --ArchiveBlock--> cipher -> chunker --Part--> upload coordinator --> store
//!        (bounded, 8)                       (rendezvous)   (max_in_flight workers)
//! ```
//!
//! Each stage runs on its own thread. Every channel is bounded, so a slow store
//! stalls the chunker, which stalls the cipher, which stalls the reader. At
//! most `max_in_flight_parts` sealed parts are held by the coordinator, plus
//! the one the chunker is filling.

pub mod cancel;

use crate::backup::archive::walkdir_globset::WalkdirAndGlobsetSource;
use crate::backup::archive::ArchiveEntryIterable;
use crate::backup::backup_config::{archive_root_name, StreamBackupConfig};
use crate::backup::chunker::{Chunker, ChunkerOutput};
use crate::backup::encrypt::{cipher_failure, run_cipher_stage};
use crate::backup::finish::Finish;
use crate::backup::pipeline::cancel::{Cancellation, Stage};
use crate::backup::progress::{ProgressCounters, ProgressReporter, TracingSink};
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use crate::backup::result_error::WithMsg;
use crate::backup::tar::{stream_tar_archive, ArchiveBlock, ChannelWriter};
use crate::backup::upload::coordinator::UploadCoordinator;
use crate::backup::upload::ObjectStore;
use bytesize::ByteSize;
use chrono::Utc;
use getset::{CopyGetters, Getters};
use std::sync::mpsc::sync_channel;
use std::sync::Arc;
use std::thread::ScopedJoinHandle;
use std::time::{Duration, Instant};
use validator::Validate;

/// Archive blocks buffered between the reader and the cipher stage
const ARCHIVE_CHANNEL_BLOCKS: usize = 8;

/// Outcome of a successful run
#[derive(Debug, Clone, Getters, CopyGetters)]
pub struct RunSummary {
    #[getset(get = "pub")]
    key: String,
    #[getset(get = "pub")]
    session_id: String,
    #[getset(get_copy = "pub")]
    parts: u32,
    /// Plaintext TAR bytes
    #[getset(get_copy = "pub")]
    archive_bytes: u64,
    /// Ciphertext bytes, which is the size of the stored object
    #[getset(get_copy = "pub")]
    uploaded_bytes: u64,
    #[getset(get_copy = "pub")]
    elapsed: Duration,
}

/// One backup run of a validated configuration against a store
pub struct StreamBackup {
    config: StreamBackupConfig,
    store: Arc<dyn ObjectStore>,
    part_size: usize,
    cancel: Cancellation,
    counters: Arc<ProgressCounters>,
}

impl StreamBackup {
    pub fn new(config: StreamBackupConfig, store: Arc<dyn ObjectStore>) -> Result<Self> {
        config
            .validate()
            .map_err(Error::from)
            .with_msg("Config validation failed")?;

        let part_size = config.part_size();
        if part_size.as_u64() < store.min_part_size() {
            return Err(Error::Configuration(format!(
                "part_size {} is below the store minimum of {}",
                part_size,
                ByteSize::b(store.min_part_size())
            )));
        }
        let part_size = usize::try_from(part_size.as_u64()).map_err(|_| {
            Error::Configuration(format!("part_size {part_size} does not fit in memory"))
        })?;

        Ok(Self {
            config,
            store,
            part_size,
            cancel: Cancellation::default(),
            counters: Arc::default(),
        })
    }

    /// Uses `cancel` instead of a private handle, e.g. to hook up an interrupt.
    pub fn with_cancellation(mut self, cancel: Cancellation) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancellation(&self) -> &Cancellation {
        &self.cancel
    }

    /// Byte counters of the run, updated live while it runs.
    pub fn counters(&self) -> &Arc<ProgressCounters> {
        &self.counters
    }

    /// Archives, encrypts and uploads the source once.
    ///
    /// On failure the first error reported by any stage is returned, wrapped
    /// with the stage it came from, and an opened upload has been aborted.
    pub fn run(&self) -> Result<RunSummary> {
        let started = Instant::now();
        let source_dir = self.config.source().resolve()?;
        let key = self.config.object_key(&source_dir, Utc::now());
        tracing::info!(
            "Backing up {:?} to {}/{}",
            source_dir,
            self.config.bucket(),
            key
        );

        let source = WalkdirAndGlobsetSource::builder()
            .src_dir(&source_dir)
            .dst_dir(archive_root_name(&source_dir))
            .exclude(self.config.exclude().clone())
            .build();

        let progress = if self.config.progress().enabled() {
            let reporter = ProgressReporter::builder()
                .counters(self.counters.clone())
                .interval(self.config.progress().interval())
                .maybe_estimated_total(source.estimate_archive_size())
                .build();
            Some(reporter.spawn(TracingSink)?)
        } else {
            None
        };

        let coordinator = UploadCoordinator::builder()
            .store(self.store.clone())
            .bucket(self.config.bucket())
            .key(key.as_str())
            .max_in_flight(self.config.max_in_flight_parts())
            .retry(self.config.retry().clone())
            .cancel(self.cancel.clone())
            .counters(self.counters.clone())
            .build();

        let (archive_tx, archive_rx) = sync_channel::<ArchiveBlock>(ARCHIVE_CHANNEL_BLOCKS);
        let (part_tx, part_rx) = sync_channel::<ChunkerOutput>(0);

        let cancel = &self.cancel;
        let counters = &self.counters;
        let source = &source;
        let coordinator = &coordinator;
        let encryptor = self.config.encryptor();
        let part_size = self.part_size;

        let uploaded = std::thread::scope(|s| {
            let reader = s.spawn(move || {
                let writer = ChannelWriter::new(archive_tx, cancel.clone(), counters.clone());
                let result = source
                    .archive_entry_iterator()
                    .and_then(|entries| stream_tar_archive(entries, writer, cancel));
                settle(cancel, Stage::Reader, result)
            });
            let cipher = s.spawn(move || {
                let chunker = Chunker::new(part_tx, part_size, counters.clone());
                let result = run_cipher_stage(archive_rx, encryptor, chunker, cancel)
                    .and_then(|chunker| chunker.finish().map_err(cipher_failure));
                settle(cancel, Stage::Cipher, result)
            });
            let upload = s.spawn(move || settle(cancel, Stage::Upload, coordinator.run(part_rx)));

            join(cancel, Stage::Reader, reader);
            join(cancel, Stage::Cipher, cipher);
            join(cancel, Stage::Upload, upload)
        });

        if let Some(progress) = progress {
            progress.finish();
        }

        // A completed upload stands even if an interrupt arrived afterwards.
        let Some(report) = uploaded else {
            return Err(match self.cancel.take_error() {
                Some((Stage::User, error)) => error,
                Some((stage, error)) => error.with_msg(format!("{stage} stage failed")),
                None => Error::Cancelled("pipeline stopped without a reported cause".into()),
            });
        };

        let summary = RunSummary {
            key,
            session_id: report.session().session_id().clone(),
            parts: report.parts(),
            archive_bytes: self.counters.bytes_read(),
            uploaded_bytes: report.bytes(),
            elapsed: started.elapsed(),
        };
        tracing::info!(
            "Uploaded {}/{}: {} archived, {} stored in {} part(s), took {}",
            self.config.bucket(),
            summary.key,
            ByteSize::b(summary.archive_bytes),
            ByteSize::b(summary.uploaded_bytes),
            summary.parts,
            humantime::format_duration(Duration::from_secs(summary.elapsed.as_secs()))
        );
        Ok(summary)
    }
}

/// Reports a stage failure to the shared cancellation.
fn settle<T>(cancel: &Cancellation, stage: Stage, result: Result<T>) -> Option<T> {
    match result {
        Ok(value) => Some(value),
        Err(error) => {
            cancel.fail(stage, error);
            None
        }
    }
}

fn join<T>(cancel: &Cancellation, stage: Stage, handle: ScopedJoinHandle<'_, Option<T>>) -> Option<T> {
    match handle.join() {
        Ok(value) => value,
        Err(_) => {
            cancel.fail(stage, Error::StagePanicked(stage.to_string()));
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::archive::walkdir_globset::CustomDeserializedGlob;
    use crate::backup::encrypt::age::AgeEncryptorConfig;
    use crate::backup::encrypt::{decrypt, EncryptorConfig};
    use crate::backup::progress::ProgressConfig;
    use crate::backup::result_error::error::ErrorKind;
    use crate::backup::source::SourceConfig;
    use crate::backup::upload::local::LocalStoreConfig;
    use crate::backup::upload::memory::{Call, MemoryStore};
    use crate::backup::upload::retry::RetryConfig;
    use crate::backup::upload::{StoreConfig, StoreError};
    use std::collections::BTreeMap;
    use std::io::Read;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
    use tempfile::TempDir;

    const PASSPHRASE: &str = "correct horse battery";
    const BUCKET: &str = "bucket";
    const KEY: &str = "backups/home.tar.age";

    #[derive(Default)]
    struct Options {
        exclude: Vec<&'static str>,
        source: Option<PathBuf>,
        progress: Option<ProgressConfig>,
    }

    struct Fixture {
        source: TempDir,
        store_root: TempDir,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                source: TempDir::new().unwrap(),
                store_root: TempDir::new().unwrap(),
            }
        }

        fn file(&self, name: &str, content: &[u8]) -> &Self {
            let path = self.source.path().join(name);
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(path, content).unwrap();
            self
        }

        fn config(&self, part_size: ByteSize, max_in_flight: usize) -> StreamBackupConfig {
            self.config_with(part_size, max_in_flight, Options::default())
        }

        fn config_with(
            &self,
            part_size: ByteSize,
            max_in_flight: usize,
            options: Options,
        ) -> StreamBackupConfig {
            let exclude = options
                .exclude
                .iter()
                .map(|pattern| CustomDeserializedGlob::new(pattern).unwrap())
                .collect();
            StreamBackupConfig::builder()
                .source(SourceConfig::Directory {
                    path: options
                        .source
                        .unwrap_or_else(|| self.source.path().to_path_buf()),
                })
                .exclude(exclude)
                .bucket(BUCKET)
                .key(KEY)
                .encryptor(EncryptorConfig::Age(AgeEncryptorConfig::passphrase(PASSPHRASE)))
                .part_size(part_size)
                .max_in_flight_parts(max_in_flight)
                .retry(
                    RetryConfig::builder()
                        .limit(3)
                        .base_delay(Duration::from_millis(1))
                        .max_delay(Duration::from_millis(5))
                        .build(),
                )
                .progress(
                    options
                        .progress
                        .unwrap_or_else(|| ProgressConfig::builder().enabled(false).build()),
                )
                .store(StoreConfig::Local(
                    LocalStoreConfig::builder().root(self.store_root.path()).build(),
                ))
                .build()
        }

        /// Three files big enough to span several 1 KiB parts
        fn with_sample_tree(self) -> Self {
            self.file("a.txt", &[b'a'; 3000])
                .file("b.bin", &[0x5a; 4000])
                .file("sub/c.txt", &[b'c'; 2500]);
            self
        }
    }

    fn backup(config: StreamBackupConfig, store: &Arc<MemoryStore>) -> StreamBackup {
        StreamBackup::new(config, store.clone()).unwrap()
    }

    fn plaintext(store: &MemoryStore) -> Vec<u8> {
        decrypt(&store.object(BUCKET, KEY).unwrap(), PASSPHRASE)
    }

    fn archive_contents(tar_bytes: &[u8]) -> BTreeMap<String, Vec<u8>> {
        let mut archive = tar::Archive::new(tar_bytes);
        archive
            .entries()
            .unwrap()
            .map(|entry| {
                let mut entry = entry.unwrap();
                let path = entry.path().unwrap().to_string_lossy().trim_end_matches('/').to_string();
                let mut data = Vec::new();
                entry.read_to_end(&mut data).unwrap();
                (path, data)
            })
            .collect()
    }

    fn root_name(fixture: &Fixture) -> String {
        archive_root_name(fixture.source.path())
    }

    /// The TAR stream of the fixture tree, produced without cipher or store
    fn direct_archive(fixture: &Fixture) -> Vec<u8> {
        let source = WalkdirAndGlobsetSource::builder()
            .src_dir(fixture.source.path())
            .dst_dir(root_name(fixture))
            .build();
        let (tx, rx) = sync_channel(1024);
        let cancel = Cancellation::default();
        let writer = ChannelWriter::new(tx, cancel.clone(), Arc::default());
        stream_tar_archive(source.archive_entry_iterator().unwrap(), writer, &cancel).unwrap();
        rx.into_iter()
            .filter_map(|block| match block {
                ArchiveBlock::Data(data) => Some(data),
                ArchiveBlock::End => None,
            })
            .flatten()
            .collect()
    }

    #[test]
    fn test_small_tree_is_one_part() {
        let fixture = Fixture::new();
        fixture.file("a.txt", b"alpha").file("b.txt", b"beta").file("c.txt", b"gamma");
        let store = Arc::new(MemoryStore::default());

        let summary = backup(fixture.config(ByteSize::kib(64), 3), &store)
            .run()
            .unwrap();

        assert_eq!(summary.parts(), 1);
        assert_eq!(summary.key(), KEY);
        assert_eq!(
            store.calls(),
            vec![Call::Open, Call::UploadPart(1), Call::Complete(vec![1])]
        );
        assert_eq!(
            summary.uploaded_bytes(),
            store.object(BUCKET, KEY).unwrap().len() as u64
        );
    }

    #[test]
    fn test_round_trip_restores_the_tree() {
        let fixture = Fixture::new().with_sample_tree();
        let store = Arc::new(MemoryStore::default());

        let summary = backup(fixture.config(ByteSize::kib(1), 3), &store)
            .run()
            .unwrap();
        assert!(summary.parts() > 1);

        let tar_bytes = plaintext(&store);
        assert_eq!(tar_bytes.len() as u64, summary.archive_bytes());
        assert_eq!(tar_bytes, direct_archive(&fixture));

        let root = root_name(&fixture);
        let contents = archive_contents(&tar_bytes);
        assert_eq!(contents[&format!("{root}/a.txt")], vec![b'a'; 3000]);
        assert_eq!(contents[&format!("{root}/b.bin")], vec![0x5a; 4000]);
        assert_eq!(contents[&format!("{root}/sub/c.txt")], vec![b'c'; 2500]);
        assert!(contents.contains_key(&format!("{root}/sub")));
    }

    #[test]
    fn test_completion_lists_every_part_in_order() {
        let fixture = Fixture::new().with_sample_tree();
        let store = Arc::new(MemoryStore::with_part_delay(Duration::from_millis(2)));

        let summary = backup(fixture.config(ByteSize::kib(1), 4), &store)
            .run()
            .unwrap();

        let expected: Vec<u32> = (1..=summary.parts()).collect();
        let completes: Vec<_> = store
            .calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Complete(parts) => Some(parts),
                _ => None,
            })
            .collect();
        assert_eq!(completes, vec![expected]);
    }

    #[test]
    fn test_transient_part_failure_is_retried() {
        let fixture = Fixture::new().with_sample_tree();
        let store = Arc::new(MemoryStore::default());
        store.fail_part(2, StoreError::transient("503 slow down"), 1);

        backup(fixture.config(ByteSize::kib(1), 3), &store)
            .run()
            .unwrap();

        assert_eq!(store.part_uploads(2), 2);
        assert_eq!(store.count(|c| matches!(c, Call::Complete(_))), 1);
        assert_eq!(store.count(|c| *c == Call::Abort), 0);
    }

    #[test]
    fn test_permanent_part_failure_aborts_once() {
        let fixture = Fixture::new().with_sample_tree();
        let store = Arc::new(MemoryStore::default());
        store.fail_part(3, StoreError::permanent("403 access denied"), 1);

        let err = backup(fixture.config(ByteSize::kib(1), 3), &store)
            .run()
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::PartUpload);
        assert!(err.to_string().contains("upload stage failed"));
        assert_eq!(store.part_uploads(3), 1);
        assert_eq!(store.count(|c| *c == Call::Abort), 1);
        assert_eq!(store.count(|c| matches!(c, Call::Complete(_))), 0);
        assert_eq!(store.open_sessions(), 0);
    }

    #[test]
    fn test_exhausted_retries_fail_the_run() {
        let fixture = Fixture::new().with_sample_tree();
        let store = Arc::new(MemoryStore::default());
        store.fail_part(3, StoreError::transient("connection reset"), 100);

        let err = backup(fixture.config(ByteSize::kib(1), 2), &store)
            .run()
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::PartUpload);
        // first attempt plus the configured three retries
        assert_eq!(store.part_uploads(3), 4);
        assert_eq!(store.count(|c| *c == Call::Abort), 1);
    }

    #[test]
    fn test_session_open_failure() {
        let fixture = Fixture::new().with_sample_tree();
        let store = Arc::new(MemoryStore::default());
        store.fail_open(StoreError::permanent("no such bucket"));

        let err = backup(fixture.config(ByteSize::kib(1), 3), &store)
            .run()
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::SessionOpen);
        assert_eq!(store.count(|c| matches!(c, Call::UploadPart(_))), 0);
        assert_eq!(store.count(|c| *c == Call::Abort), 0);
    }

    #[test]
    fn test_empty_directory_uploads_empty_archive() {
        let fixture = Fixture::new();
        let store = Arc::new(MemoryStore::default());

        let summary = backup(fixture.config(ByteSize::kib(64), 3), &store)
            .run()
            .unwrap();

        assert_eq!(summary.parts(), 1);
        let tar_bytes = plaintext(&store);
        assert_eq!(tar_bytes.len(), 1024);
        assert!(tar_bytes.iter().all(|b| *b == 0));
        assert!(archive_contents(&tar_bytes).is_empty());
    }

    #[test]
    fn test_unchanged_tree_gives_same_archive_and_part_layout() {
        let fixture = Fixture::new().with_sample_tree();

        let run = || {
            let store = Arc::new(MemoryStore::default());
            let summary = backup(fixture.config(ByteSize::kib(1), 3), &store)
                .run()
                .unwrap();
            (summary.parts(), summary.uploaded_bytes(), plaintext(&store))
        };
        let (parts_a, bytes_a, plain_a) = run();
        let (parts_b, bytes_b, plain_b) = run();

        assert_eq!(plain_a, plain_b);
        assert_eq!(parts_a, parts_b);
        assert_eq!(bytes_a, bytes_b);
    }

    #[test]
    fn test_excluded_paths_are_skipped() {
        let fixture = Fixture::new();
        fixture
            .file("keep.txt", b"keep")
            .file("skip.tmp", b"skip")
            .file("cache/blob", b"blob");
        let config = fixture.config_with(
            ByteSize::kib(64),
            1,
            Options {
                exclude: vec!["*.tmp", "cache"],
                ..Default::default()
            },
        );
        let store = Arc::new(MemoryStore::default());

        backup(config, &store).run().unwrap();

        let root = root_name(&fixture);
        let names: Vec<_> = archive_contents(&plaintext(&store)).into_keys().collect();
        assert_eq!(names, vec![format!("{root}/keep.txt")]);
    }

    #[test]
    fn test_upload_concurrency_is_bounded() {
        let fixture = Fixture::new().with_sample_tree();
        let store = Arc::new(MemoryStore::with_part_delay(Duration::from_millis(10)));

        backup(fixture.config(ByteSize::kib(1), 2), &store)
            .run()
            .unwrap();

        assert!(store.max_in_flight() <= 2);
        assert!(store.max_in_flight() >= 1);
    }

    #[test]
    fn test_buffered_ciphertext_is_bounded() {
        let fixture = Fixture::new();
        fixture.file("big.bin", &vec![0x42; 64 * 1024]);
        let store = Arc::new(MemoryStore::with_part_delay(Duration::from_millis(5)));
        let max_in_flight = 2;
        let part_size = 1024u64;
        let backup = backup(
            fixture.config(ByteSize::b(part_size), max_in_flight),
            &store,
        );

        let done = AtomicBool::new(false);
        let worst = AtomicU64::new(0);
        std::thread::scope(|s| {
            s.spawn(|| {
                while !done.load(Ordering::Relaxed) {
                    let counters = backup.counters();
                    let buffered = counters
                        .bytes_encrypted()
                        .saturating_sub(counters.bytes_uploaded());
                    worst.fetch_max(buffered, Ordering::Relaxed);
                    std::thread::sleep(Duration::from_micros(200));
                }
            });
            backup.run().unwrap();
            done.store(true, Ordering::Relaxed);
        });

        // one part per upload worker plus the one the chunker holds
        let bound = (max_in_flight as u64 + 1) * part_size;
        assert!(
            worst.load(Ordering::Relaxed) <= bound,
            "{} bytes buffered, bound is {bound}",
            worst.load(Ordering::Relaxed)
        );
    }

    #[test]
    fn test_missing_source_is_source_unreadable() {
        let fixture = Fixture::new();
        let config = fixture.config_with(
            ByteSize::kib(64),
            1,
            Options {
                source: Some("/nonexistent/source/dir".into()),
                ..Default::default()
            },
        );
        let store = Arc::new(MemoryStore::default());

        let err = backup(config, &store).run().unwrap_err();

        assert_eq!(err.kind(), ErrorKind::SourceUnreadable);
        assert!(store.calls().is_empty());
    }

    #[test]
    fn test_cancel_before_start() {
        let fixture = Fixture::new().with_sample_tree();
        let store = Arc::new(MemoryStore::default());
        let backup = backup(fixture.config(ByteSize::kib(1), 3), &store);
        backup.cancellation().cancel();

        let err = backup.run().unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Cancelled);
        assert_eq!(store.count(|c| *c == Call::Open), 0);
    }

    #[test]
    fn test_cancel_mid_upload_aborts() {
        let fixture = Fixture::new();
        fixture.file("big.bin", &vec![0x17; 96 * 1024]);
        let store = Arc::new(MemoryStore::with_part_delay(Duration::from_millis(10)));
        let backup = backup(fixture.config(ByteSize::kib(1), 2), &store);

        let err = std::thread::scope(|s| {
            s.spawn(|| {
                for _ in 0..5000 {
                    if store.count(|c| matches!(c, Call::UploadPart(_))) >= 3 {
                        break;
                    }
                    std::thread::sleep(Duration::from_millis(1));
                }
                backup.cancellation().cancel();
            });
            backup.run().unwrap_err()
        });

        assert_eq!(err.kind(), ErrorKind::Cancelled);
        assert_eq!(store.count(|c| *c == Call::Abort), 1);
        assert_eq!(store.count(|c| matches!(c, Call::Complete(_))), 0);
        assert!(store.object(BUCKET, KEY).is_none());
    }

    #[test]
    fn test_file_vanishing_mid_run_aborts_with_partial_read() {
        let fixture = Fixture::new();
        fixture
            .file("a.bin", &vec![0x61; 4 * 1024 * 1024])
            .file("b.bin", b"gone before it is read");
        let store = Arc::new(MemoryStore::with_part_delay(Duration::from_millis(20)));
        let backup = backup(fixture.config(ByteSize::kib(64), 1), &store);
        let vanishing = fixture.source.path().join("b.bin");

        let err = std::thread::scope(|s| {
            s.spawn(|| {
                for _ in 0..5000 {
                    if store.count(|c| matches!(c, Call::UploadPart(_))) >= 1 {
                        break;
                    }
                    std::thread::sleep(Duration::from_millis(1));
                }
                std::fs::remove_file(&vanishing).unwrap();
            });
            backup.run().unwrap_err()
        });

        assert_eq!(err.kind(), ErrorKind::PartialRead);
        assert!(err.to_string().contains("b.bin"));
        assert_eq!(store.count(|c| *c == Call::Abort), 1);
        assert_eq!(store.count(|c| matches!(c, Call::Complete(_))), 0);
        assert!(store.object(BUCKET, KEY).is_none());
    }

    #[test]
    fn test_part_size_below_store_minimum_is_rejected() {
        let fixture = Fixture::new();
        let store: Arc<dyn ObjectStore> = Arc::new(MemoryStore::with_min_part_size(5 * 1024 * 1024));

        let err = StreamBackup::new(fixture.config(ByteSize::kib(1), 3), store)
            .err()
            .unwrap();
        assert_eq!(err.kind(), ErrorKind::Configuration);
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let fixture = Fixture::new();
        let store: Arc<dyn ObjectStore> = Arc::new(MemoryStore::default());

        let err = StreamBackup::new(fixture.config(ByteSize::kib(1), 0), store)
            .err()
            .unwrap();
        assert_eq!(err.kind(), ErrorKind::Configuration);
    }

    #[test]
    fn test_progress_reporting_does_not_change_outcome() {
        let fixture = Fixture::new().with_sample_tree();
        let store = Arc::new(MemoryStore::default());
        let config = fixture.config_with(
            ByteSize::kib(1),
            3,
            Options {
                progress: Some(
                    ProgressConfig::builder()
                        .interval(Duration::from_millis(5))
                        .build(),
                ),
                ..Default::default()
            },
        );
        let backup = backup(config, &store);

        let summary = backup.run().unwrap();

        assert_eq!(backup.counters().bytes_uploaded(), summary.uploaded_bytes());
        assert_eq!(backup.counters().parts_uploaded(), summary.parts() as u64);
        assert_eq!(backup.counters().bytes_read(), summary.archive_bytes());
    }

    #[test]
    fn test_source_with_nested_path() {
        let fixture = Fixture::new();
        fixture.file("deep/er/still/file.txt", b"x");
        let store = Arc::new(MemoryStore::default());
        backup(fixture.config(ByteSize::kib(64), 1), &store)
            .run()
            .unwrap();
        let root = root_name(&fixture);
        let names: Vec<_> = archive_contents(&plaintext(&store)).into_keys().collect();
        assert_eq!(
            names,
            vec![
                format!("{root}/deep"),
                format!("{root}/deep/er"),
                format!("{root}/deep/er/still"),
                format!("{root}/deep/er/still/file.txt"),
            ]
        );
    }
}
