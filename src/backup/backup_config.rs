use crate::backup::archive::walkdir_globset::CustomDeserializedGlob;
use crate::backup::encrypt::EncryptorConfig;
use crate::backup::file_ext::FileExtProvider;
use crate::backup::pipeline::cancel::Cancellation;
use crate::backup::pipeline::{RunSummary, StreamBackup};
use crate::backup::progress::ProgressConfig;
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use crate::backup::result_error::WithMsg;
use crate::backup::retention::{newest, ItemWithDateTime, RetentionConfig};
use crate::backup::source::SourceConfig;
use crate::backup::upload::retry::RetryConfig;
use crate::backup::upload::{ObjectStore, StoreConfig, StoreResult};
use crate::backup::validate::{
    validate_bucket_name, validate_key_prefix, validate_object_key, validate_part_size,
};
use bon::Builder;
use bytesize::ByteSize;
use chrono::{DateTime, Utc};
use getset::{CopyGetters, Getters};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use std::fs::File;
use std::path::Path;
use std::sync::{Arc, OnceLock};
use tracing::{info, warn};
use validator::{Validate, ValidationError, ValidationErrors};

static TIME_FORMAT: &str = "%Y-%m-%dT%Hh%Mm%Ss%z";
static TAR_FILE_EXT: OnceLock<Arc<str>> = OnceLock::new();

fn default_part_size() -> ByteSize {
    ByteSize::mib(64)
}

fn default_max_in_flight_parts() -> usize {
    3
}

/// Everything one backup run needs
#[skip_serializing_none]
#[derive(Clone, Debug, Serialize, Deserialize, Validate, Builder, Getters, CopyGetters)]
#[serde(deny_unknown_fields)]
#[validate(schema(function = validate_sections))]
pub struct StreamBackupConfig {
    #[getset(get = "pub")]
    source: SourceConfig,

    /// Globs relative to the source root
    #[serde(default)]
    #[builder(default)]
    #[getset(get = "pub")]
    exclude: Vec<CustomDeserializedGlob>,

    #[validate(custom(function = validate_bucket_name))]
    #[builder(into)]
    #[getset(get = "pub")]
    bucket: String,

    /// Fixed object key; derived from the source name and time when empty
    #[validate(custom(function = validate_object_key))]
    #[serde(default)]
    #[builder(default, into)]
    #[getset(get = "pub")]
    key: String,

    #[validate(custom(function = validate_key_prefix))]
    #[serde(default)]
    #[builder(default, into)]
    #[getset(get = "pub")]
    key_prefix: String,

    #[getset(get = "pub")]
    encryptor: EncryptorConfig,

    #[validate(custom(function = validate_part_size))]
    #[serde(default = "default_part_size")]
    #[builder(default = default_part_size())]
    #[getset(get_copy = "pub")]
    part_size: ByteSize,

    #[validate(range(min = 1, max = 64))]
    #[serde(default = "default_max_in_flight_parts")]
    #[builder(default = default_max_in_flight_parts())]
    #[getset(get_copy = "pub")]
    max_in_flight_parts: usize,

    #[serde(default)]
    #[builder(default)]
    #[getset(get = "pub")]
    retry: RetryConfig,

    #[serde(default)]
    #[builder(default)]
    #[getset(get = "pub")]
    progress: ProgressConfig,

    #[getset(get = "pub")]
    store: StoreConfig,

    #[serde(default)]
    #[getset(get = "pub")]
    retention: Option<RetentionConfig>,
}

fn validate_sections(config: &StreamBackupConfig) -> std::result::Result<(), ValidationError> {
    let sections: [(&str, std::result::Result<(), ValidationErrors>); 5] = [
        ("encryptor", config.encryptor.validate()),
        ("store", config.store.validate()),
        ("retry", config.retry.validate()),
        ("progress", config.progress.validate()),
        (
            "retention",
            config.retention.as_ref().map_or(Ok(()), |r| r.validate()),
        ),
    ];
    for (name, result) in sections {
        if let Err(errors) = result {
            return Err(ValidationError::new("InvalidSection")
                .with_message(format!("{name}: {errors}").into()));
        }
    }

    Ok(())
}

/// What a scheduled run ended up doing
#[derive(Debug, Clone)]
pub enum RunOutcome {
    /// The newest archive is recent enough, nothing was uploaded
    Skipped {
        newest: String,
        next_due: DateTime<Utc>,
    },
    Uploaded(RunSummary),
}

impl FileExtProvider for StreamBackupConfig {
    fn file_ext(&self) -> Option<Arc<str>> {
        Some(
            std::iter::once(TAR_FILE_EXT.get_or_init(|| "tar".into()).clone())
                .chain(self.encryptor.file_ext())
                .join(".")
                .into(),
        )
    }
}

/// Name the source directory gets inside the archive and in derived keys
pub fn archive_root_name(source_dir: &Path) -> String {
    source_dir
        .file_name()
        .map(|name| sanitize_filename::sanitize(name.to_string_lossy()))
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "backup".to_string())
}

impl StreamBackupConfig {
    /// Reads and validates a YAML config file.
    ///
    /// A file that cannot be opened is a configuration error like a malformed one.
    pub fn load(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|e| {
            Error::Configuration(format!("Cannot open config file {:?}: {e}", path))
        })?;
        let config: Self = serde_yml::from_reader(file)
            .map_err(Error::from)
            .with_msg(format!("Parse YAML config failed: {:?}", path))?;
        config
            .validate()
            .map_err(Error::from)
            .with_msg(format!("Config validation failed: {:?}", path))?;
        Ok(config)
    }

    fn archive_suffix(&self) -> String {
        format!(".{}", self.file_ext().unwrap_or("".into()))
    }

    /// Key of the object a run started at `now` uploads to.
    pub fn object_key(&self, source_dir: &Path, now: DateTime<Utc>) -> String {
        if !self.key.is_empty() {
            return self.key.clone();
        }
        format!(
            "{}{}.{}{}",
            self.key_prefix,
            archive_root_name(source_dir),
            now.format(TIME_FORMAT).to_string().replace('+', "_"),
            self.archive_suffix()
        )
    }

    /// Recovers the timestamp embedded in a derived key.
    pub fn get_date_time_from_key(&self, key: &str) -> Option<DateTime<Utc>> {
        let name = key.strip_prefix(self.key_prefix.as_str())?;
        let name = name.strip_suffix(self.archive_suffix().as_str())?;
        let (_, time_string) = name.rsplit_once('.')?;
        DateTime::parse_from_str(time_string.replace('_', "+").as_str(), TIME_FORMAT)
            .ok()
            .map(|dt| dt.to_utc())
    }

    /// Archives stored under `key_prefix`, dated by their last modification.
    pub fn list_archives(&self, store: &dyn ObjectStore) -> StoreResult<Vec<ItemWithDateTime<String>>> {
        let suffix = self.archive_suffix();
        Ok(store
            .list_objects(&self.bucket, &self.key_prefix)?
            .into_iter()
            .filter(|object| object.key().ends_with(suffix.as_str()))
            .map(ItemWithDateTime::from)
            .collect())
    }

    /// Runs one backup unless the newest archive is younger than
    /// `retention.min_interval`, then prunes archives beyond `retention.keep`.
    pub fn run_once(&self, store: Arc<dyn ObjectStore>, cancel: Cancellation) -> Result<RunOutcome> {
        if let Some(skipped) = self.check_interval(store.as_ref(), Utc::now()) {
            return Ok(skipped);
        }

        let summary = StreamBackup::new(self.clone(), store.clone())?
            .with_cancellation(cancel)
            .run()?;

        if let Some(retention) = &self.retention {
            self.prune(retention, store.as_ref(), summary.key());
        }
        Ok(RunOutcome::Uploaded(summary))
    }

    fn check_interval(&self, store: &dyn ObjectStore, now: DateTime<Utc>) -> Option<RunOutcome> {
        let retention = self.retention.as_ref()?;
        retention.min_interval()?;
        let archives = self
            .list_archives(store)
            .inspect_err(|e| warn!("Cannot list existing archives, uploading anyway: {e}"))
            .ok()?;
        let newest = newest(archives)?;
        let next_due = retention.next_upload_due(Some(&newest))?;
        if now >= next_due {
            return None;
        }
        info!(
            "Newest archive {} is from {}, next upload due at {}",
            newest.item, newest.date_time, next_due
        );
        Some(RunOutcome::Skipped {
            newest: newest.item,
            next_due,
        })
    }

    fn prune(&self, retention: &RetentionConfig, store: &dyn ObjectStore, uploaded_key: &str) {
        let archives = match self.list_archives(store) {
            Ok(archives) => archives,
            Err(e) => {
                warn!("Cannot list archives for retention: {e}");
                return;
            }
        };
        retention
            .get_delete(archives)
            .into_iter()
            .filter(|to_delete| to_delete.item != uploaded_key)
            .for_each(|to_delete| {
                info!("Removing out of retention archive {:?}", &to_delete);
                if let Err(e) = store.delete_object(&self.bucket, &to_delete.item) {
                    warn!("Removing {} failed: {e}", to_delete.item);
                }
            });
    }
}
