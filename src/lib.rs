//! # k-backup-stream
//!
//! Streams a directory tree into a single encrypted archive and uploads it to
//! an object store with a multipart upload, without ever writing the archive
//! to local disk.
//!
//! ## Features
//!
//! - **Deterministic Archives**: Sorted directory walk serialized as TAR
//! - **Encryption**: Age encryption with passphrase (scrypt salt in the header)
//! - **Multipart Upload**: Fixed-size parts, bounded parallel uploads, retry with backoff
//! - **Bounded Memory**: Every stage is connected by bounded channels
//! - **Clean Failure**: Open uploads are aborted on any error or interrupt
//! - **Retention**: Optional minimum upload interval and pruning of old archives
//!
//! ## Quick Start
//!
//! ```no_run
//! use k_backup_stream::backup::backup_config::StreamBackupConfig;
//! use k_backup_stream::backup::pipeline::cancel::Cancellation;
//!
//! // Load configuration from YAML file
//! let config: StreamBackupConfig = serde_yml::from_reader(std::fs::File::open("config.yml")?)?;
//!
//! // Build the configured object store and run one backup
//! let store = config.store().build()?;
//! let outcome = config.run_once(store, Cancellation::default())?;
//! println!("{outcome:?}");
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod backup;
