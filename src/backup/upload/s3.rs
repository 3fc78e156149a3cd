//! S3 (and S3-compatible) store driven through rust-s3.
//!
//! rust-s3 is async; the store owns a small private tokio runtime and blocks
//! on it, so upload workers stay plain threads.

use crate::backup::redacted::RedactedString;
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use crate::backup::upload::{
    CompletedPart, MultipartSession, ObjectInfo, ObjectStore, StoreError, StoreResult,
};
use bon::Builder;
use chrono::{DateTime, Utc};
use getset::Getters;
use s3::creds::Credentials;
use s3::error::S3Error;
use s3::region::Region;
use s3::Bucket;
use serde::{Deserialize, Serialize};
use tokio::runtime::Runtime;
use validator::Validate;

/// S3 rejects parts below this size, except the last one
pub const S3_MIN_PART_SIZE: u64 = 5 * 1024 * 1024;

static CONTENT_TYPE: &str = "application/octet-stream";

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "credential_type")]
#[serde(rename_all = "snake_case")]
#[serde(deny_unknown_fields)]
pub enum CredentialsConfig {
    Static {
        access_key: String,
        secret_key: RedactedString,
    },
    /// Environment variables, then the shared credentials file and profile
    Default,
}

#[derive(Clone, Debug, Serialize, Deserialize, Validate, Builder, Getters)]
#[serde(deny_unknown_fields)]
#[getset(get = "pub")]
pub struct S3StoreConfig {
    #[validate(length(min = 1))]
    #[builder(into)]
    region: String,

    /// Custom endpoint for S3-compatible services
    #[serde(default)]
    #[builder(into)]
    endpoint: Option<String>,

    #[serde(default)]
    #[builder(default)]
    path_style: bool,

    /// Storage class of the uploaded archive, e.g. `STANDARD_IA` or `DEEP_ARCHIVE`
    #[serde(default)]
    #[builder(into)]
    storage_class: Option<String>,

    credentials: CredentialsConfig,
}

pub struct S3Store {
    region: Region,
    credentials: Credentials,
    path_style: bool,
    storage_class: Option<String>,
    runtime: Runtime,
}

impl S3Store {
    pub fn new(config: &S3StoreConfig) -> Result<Self> {
        let credentials = match &config.credentials {
            CredentialsConfig::Static {
                access_key,
                secret_key,
            } => Credentials::new(
                Some(access_key.as_str()),
                Some(secret_key.expose()),
                None,
                None,
                None,
            ),
            CredentialsConfig::Default => Credentials::default(),
        }
        .map_err(|e| Error::Configuration(format!("cannot resolve S3 credentials: {e}")))?;

        let region = Region::Custom {
            region: config.region.clone(),
            endpoint: config
                .endpoint
                .clone()
                .unwrap_or_else(|| format!("https://s3.{}.amazonaws.com", config.region)),
        };
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("s3-io")
            .enable_all()
            .build()?;
        Ok(Self {
            region,
            credentials,
            path_style: config.path_style,
            storage_class: config.storage_class.clone(),
            runtime,
        })
    }

    fn bucket(&self, name: &str) -> StoreResult<Box<Bucket>> {
        let bucket = Bucket::new(name, self.region.clone(), self.credentials.clone())
            .map_err(|e| StoreError::permanent(e.to_string()))?;
        Ok(if self.path_style {
            bucket.with_path_style()
        } else {
            bucket
        })
    }
}

fn store_error(e: S3Error) -> StoreError {
    match &e {
        S3Error::HttpFailWithBody(status, _) if *status >= 500 || *status == 429 || *status == 408 => {
            StoreError::transient(e.to_string())
        }
        S3Error::HttpFailWithBody(..) => StoreError::permanent(e.to_string()),
        _ => StoreError::transient(e.to_string()),
    }
}

/// CompleteMultipartUpload may answer 200 and still carry an `<Error>` body.
fn completion_body_error(body: &[u8]) -> Option<StoreError> {
    let body = String::from_utf8_lossy(body);
    if !body.contains("<Error>") {
        return None;
    }
    let code = body
        .split_once("<Code>")
        .and_then(|(_, rest)| rest.split_once("</Code>"))
        .map_or("unknown", |(code, _)| code);
    Some(StoreError::transient(format!(
        "CompleteMultipartUpload failed with {code}"
    )))
}

impl ObjectStore for S3Store {
    fn open_multipart_upload(&self, bucket: &str, key: &str) -> StoreResult<MultipartSession> {
        let mut target = self.bucket(bucket)?;
        if let Some(class) = &self.storage_class {
            target.add_header("x-amz-storage-class", class);
        }
        let response = self
            .runtime
            .block_on(target.initiate_multipart_upload(key, CONTENT_TYPE))
            .map_err(store_error)?;
        Ok(MultipartSession::new(bucket, key, response.upload_id))
    }

    fn upload_part(
        &self,
        session: &MultipartSession,
        sequence: u32,
        data: &[u8],
    ) -> StoreResult<String> {
        let bucket = self.bucket(session.bucket())?;
        let part = self
            .runtime
            .block_on(bucket.put_multipart_chunk(
                data.to_vec(),
                session.key(),
                sequence,
                session.session_id(),
                CONTENT_TYPE,
            ))
            .map_err(store_error)?;
        Ok(part.etag)
    }

    fn complete_multipart_upload(
        &self,
        session: &MultipartSession,
        parts: &[CompletedPart],
    ) -> StoreResult<()> {
        let bucket = self.bucket(session.bucket())?;
        let parts = parts
            .iter()
            .map(|p| s3::serde_types::Part {
                part_number: p.sequence(),
                etag: p.tag().clone(),
            })
            .collect();
        let response = self
            .runtime
            .block_on(bucket.complete_multipart_upload(session.key(), session.session_id(), parts))
            .map_err(store_error)?;
        match completion_body_error(response.as_slice()) {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn abort_multipart_upload(&self, session: &MultipartSession) -> StoreResult<()> {
        let bucket = self.bucket(session.bucket())?;
        match self
            .runtime
            .block_on(bucket.abort_upload(session.key(), session.session_id()))
        {
            Ok(()) => Ok(()),
            // NoSuchUpload: already aborted or completed
            Err(S3Error::HttpFailWithBody(404, _)) => Ok(()),
            Err(e) => Err(store_error(e)),
        }
    }

    fn min_part_size(&self) -> u64 {
        S3_MIN_PART_SIZE
    }

    fn list_objects(&self, bucket: &str, prefix: &str) -> StoreResult<Vec<ObjectInfo>> {
        let bucket = self.bucket(bucket)?;
        let pages = self
            .runtime
            .block_on(bucket.list(prefix.to_string(), None))
            .map_err(store_error)?;
        let mut objects = Vec::new();
        for object in pages.into_iter().flat_map(|page| page.contents) {
            let last_modified = DateTime::parse_from_rfc3339(&object.last_modified)
                .map_err(|e| StoreError::permanent(format!("bad timestamp on {}: {e}", object.key)))?
                .with_timezone(&Utc);
            objects.push(ObjectInfo::new(object.key, last_modified, object.size));
        }
        Ok(objects)
    }

    fn delete_object(&self, bucket: &str, key: &str) -> StoreResult<()> {
        let bucket = self.bucket(bucket)?;
        self.runtime
            .block_on(bucket.delete_object(key))
            .map_err(store_error)?;
        Ok(())
    }
}
