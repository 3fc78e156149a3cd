use crate::backup::result_error::{WithDebugObjectAndFnName, WithFnName, WithMsg};
use crate::backup::upload::StoreError;
use derive_more::Display;
use std::fmt::Debug;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    ValidationError(#[from] validator::ValidationErrors),
    #[error(transparent)]
    ThreadPoolBuildError(#[from] rayon::ThreadPoolBuildError),
    #[error(transparent)]
    SerdeYml(#[from] serde_yml::Error),
    #[error(transparent)]
    WalkDir(#[from] walkdir::Error),
    #[error(transparent)]
    Globset(#[from] globset::Error),
    #[error(transparent)]
    StripPrefix(#[from] std::path::StripPrefixError),
    #[error("Invalid configuration: {0}")]
    Configuration(String),
    #[error("Source {path:?} is unreadable: {reason}")]
    SourceUnreadable { path: PathBuf, reason: String },
    #[error("Reading {:?} failed:\n{}", path, indent::indent_all_with("  ", error.to_string()))]
    PartialRead { path: PathBuf, error: Box<Error> },
    #[error("Encryption failed: {0}")]
    Encryption(String),
    #[error("Opening multipart upload for {bucket}/{key} failed: {source}")]
    SessionOpen {
        bucket: String,
        key: String,
        source: StoreError,
    },
    #[error("Uploading part {sequence} failed after {attempts} attempt(s): {source}")]
    PartUpload {
        sequence: u32,
        attempts: u32,
        source: StoreError,
    },
    #[error("Completing upload {session_id} failed: {reason}")]
    Completion { session_id: String, reason: String },
    #[error("Cancelled: {0}")]
    Cancelled(String),
    #[error("{} stage panicked", .0)]
    StagePanicked(String),
    #[error("{}:\n{}", msg, indent::indent_all_with("  ", error.to_string()))]
    WithMsg { msg: String, error: Box<Error> },
    #[error("{:?} {} failed:\n{}", obj_debug, fn_name, indent::indent_all_with("  ", error.to_string()))]
    WithDebugObjAndFnName {
        error: Box<Error>,
        obj_debug: Box<dyn Debug + Send>,
        fn_name: String,
    },
    #[error("{} failed:\n{}", fn_name, indent::indent_all_with("  ", error.to_string()))]
    WithFnName { error: Box<Error>, fn_name: String },
}

/// Classification of a run failure, independent of the context it was wrapped in.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Configuration,
    SourceUnreadable,
    PartialRead,
    Encryption,
    SessionOpen,
    PartUpload,
    Completion,
    Cancelled,
    Internal,
}

impl ErrorKind {
    /// Process exit status reported for a run that ended with this kind of error.
    pub fn exit_code(self) -> i32 {
        match self {
            ErrorKind::Internal => 1,
            ErrorKind::Configuration => 2,
            ErrorKind::SourceUnreadable => 3,
            ErrorKind::PartialRead => 4,
            ErrorKind::Encryption => 5,
            ErrorKind::SessionOpen => 6,
            ErrorKind::PartUpload => 7,
            ErrorKind::Completion => 8,
            ErrorKind::Cancelled => 130,
        }
    }
}

impl<S: Into<String>, O: Debug + Send + 'static> WithDebugObjectAndFnName<S, O> for Error {
    fn with_debug_object_and_fn_name(self, obj: O, fn_name: S) -> Self {
        Error::WithDebugObjAndFnName {
            error: Box::new(self),
            obj_debug: Box::new(obj),
            fn_name: fn_name.into(),
        }
    }
}

impl<S: Into<String>> WithMsg<S> for Error {
    fn with_msg(self, msg: S) -> Self {
        Self::WithMsg {
            msg: msg.into(),
            error: Box::new(self),
        }
    }
}

impl<S: Into<String>> WithFnName<S> for Error {
    fn with_fn_name(self, fn_name: S) -> Self {
        Self::WithFnName {
            error: Box::new(self),
            fn_name: fn_name.into(),
        }
    }
}

impl Error {
    /// Returns the taxonomy kind of this error, looking through context wrappers.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Configuration(_)
            | Error::ValidationError(_)
            | Error::SerdeYml(_)
            | Error::Globset(_) => ErrorKind::Configuration,
            Error::SourceUnreadable { .. } => ErrorKind::SourceUnreadable,
            Error::PartialRead { .. } | Error::WalkDir(_) => ErrorKind::PartialRead,
            Error::Encryption(_) => ErrorKind::Encryption,
            Error::SessionOpen { .. } => ErrorKind::SessionOpen,
            Error::PartUpload { .. } => ErrorKind::PartUpload,
            Error::Completion { .. } => ErrorKind::Completion,
            Error::Cancelled(_) => ErrorKind::Cancelled,
            Error::WithMsg { error, .. }
            | Error::WithDebugObjAndFnName { error, .. }
            | Error::WithFnName { error, .. } => error.kind(),
            Error::Io(_)
            | Error::ThreadPoolBuildError(_)
            | Error::StripPrefix(_)
            | Error::StagePanicked(_) => ErrorKind::Internal,
        }
    }

    pub fn exit_code(&self) -> i32 {
        self.kind().exit_code()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::upload::StoreError;

    #[test]
    fn test_error_from_io_error() {
        let io_error = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let error = Error::from(io_error);

        match error {
            Error::Io(_) => (),
            _ => panic!("Expected Io error"),
        }
    }

    #[test]
    fn test_error_with_msg() {
        let error = Error::Configuration("bad part size".into()).with_msg("Custom message");

        match error {
            Error::WithMsg { msg, .. } => assert_eq!(msg, "Custom message"),
            _ => panic!("Expected WithMsg error"),
        }
    }

    #[test]
    fn test_error_with_debug_object_and_fn_name() {
        let io_error = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let error = Error::from(io_error).with_debug_object_and_fn_name("obj", "test_function");

        match error {
            Error::WithDebugObjAndFnName { fn_name, .. } => assert_eq!(fn_name, "test_function"),
            _ => panic!("Expected WithDebugObjAndFnName error"),
        }
    }

    #[test]
    fn test_kind_sees_through_wrappers() {
        let error = Error::PartUpload {
            sequence: 3,
            attempts: 4,
            source: StoreError::transient("503 slow down"),
        }
        .with_msg("upload stage failed")
        .with_fn_name("upload_worker");

        assert_eq!(error.kind(), ErrorKind::PartUpload);
        assert_eq!(error.exit_code(), 7);
    }

    #[test]
    fn test_exit_codes_are_distinct() {
        let kinds = [
            ErrorKind::Configuration,
            ErrorKind::SourceUnreadable,
            ErrorKind::PartialRead,
            ErrorKind::Encryption,
            ErrorKind::SessionOpen,
            ErrorKind::PartUpload,
            ErrorKind::Completion,
            ErrorKind::Cancelled,
            ErrorKind::Internal,
        ];
        let codes: std::collections::HashSet<_> = kinds.iter().map(|k| k.exit_code()).collect();
        assert_eq!(codes.len(), kinds.len());
        assert!(!codes.contains(&0));
    }

    #[test]
    fn test_partial_read_display() {
        let error = Error::PartialRead {
            path: "/data/secret.db".into(),
            error: Box::new(std::io::Error::other("permission denied").into()),
        };
        let error_str = error.to_string();

        assert!(error_str.contains("secret.db"));
        assert!(error_str.contains("permission denied"));
    }
}
