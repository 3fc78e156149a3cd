//! Validation functions for configuration values.
//!
//! Provides custom validation functions for object keys, bucket names,
//! byte sizes and directories used by the backup configuration.

use bytesize::ByteSize;
use sanitize_filename::{is_sanitized, sanitize};
use validator::ValidationError;

use std::path::Path;

/// Smallest accepted part size.
pub const MIN_PART_SIZE: ByteSize = ByteSize::kib(1);
/// Largest accepted part size (the S3 per-part maximum).
pub const MAX_PART_SIZE: ByteSize = ByteSize::gib(5);

pub fn validate_part_size(size: &ByteSize) -> Result<(), ValidationError> {
    if *size < MIN_PART_SIZE || *size > MAX_PART_SIZE {
        return Err(ValidationError::new("InvalidPartSize").with_message(
            format!(
                "part_size {} is outside {}..={}",
                size, MIN_PART_SIZE, MAX_PART_SIZE
            )
            .into(),
        ));
    }

    Ok(())
}

pub fn validate_bucket_name<S: AsRef<str>>(name: S) -> Result<(), ValidationError> {
    let name = name.as_ref();
    if name.is_empty() || !is_sanitized(name) || name.starts_with('.') {
        return Err(ValidationError::new("InvalidBucketName").with_message(
            format!(
                "Invalid bucket name {:?}, try sanitizing like {:?}",
                name,
                sanitize(name)
            )
            .into(),
        ));
    }

    Ok(())
}

/// An empty key is accepted and means "derive the key from the source name".
pub fn validate_object_key<S: AsRef<str>>(key: S) -> Result<(), ValidationError> {
    let key = key.as_ref();
    if key.is_empty() {
        return Ok(());
    }
    if key.starts_with('/') || key.ends_with('/') {
        return Err(ValidationError::new("InvalidObjectKey")
            .with_message(format!("Object key {key:?} must not start or end with '/'").into()));
    }
    if key
        .split('/')
        .any(|segment| segment.is_empty() || segment == "." || segment == "..")
    {
        return Err(ValidationError::new("InvalidObjectKey").with_message(
            format!("Object key {key:?} must not contain empty, '.' or '..' segments").into(),
        ));
    }

    Ok(())
}

pub fn validate_key_prefix<S: AsRef<str>>(prefix: S) -> Result<(), ValidationError> {
    let prefix = prefix.as_ref();
    if prefix.is_empty() {
        return Ok(());
    }
    validate_object_key(prefix.trim_end_matches('/'))
        .map_err(|_| ValidationError::new("InvalidKeyPrefix")
            .with_message(format!("Invalid key_prefix {prefix:?}").into()))
}

pub fn validate_dir_exist<P: AsRef<Path>>(dir: P) -> Result<(), ValidationError> {
    let dir = dir.as_ref();
    if dir.exists() {
        if !dir.is_dir() {
            return Err(ValidationError::new("InvalidDirectory")
                .with_message(format!("{:?} is not a directory", dir).into()));
        }
    } else {
        return Err(ValidationError::new("InvalidDirectory")
            .with_message(format!("{:?} not found", dir).into()));
    }

    Ok(())
}

pub fn validate_dir_exist_or_created<P: AsRef<Path>>(dir: P) -> Result<(), ValidationError> {
    let dir = dir.as_ref();
    if dir.exists() {
        return validate_dir_exist(dir);
    }
    std::fs::create_dir_all(dir).map_err(|e| {
        ValidationError::new("InvalidDirectory").with_message(
            format!("cannot create or access directory {:?}: {}", dir, e).into(),
        )
    })
}
