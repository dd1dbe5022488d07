//! Error taxonomy shared by the Scheduler and FileSystem surfaces.
//!
//! Every variant carries the adaptor that raised it so a caller juggling
//! several back-ends at once can tell them apart without downcasting.

use thiserror::Error;

/// A kind from the error taxonomy, independent of which adaptor raised it.
///
/// Kept separate from [`Error`] so bulk operations (`get_job_statuses`,
/// `get_queue_statuses`) can classify a captured error without matching on
/// the full variant (and its `adaptor_name`/`message` payload).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidJobDescription,
    IncompleteJobDescription,
    NoSuchQueue,
    NoSuchJob,
    JobCanceled,
    NoSuchPath,
    PathAlreadyExists,
    InvalidPath,
    DirectoryNotEmpty,
    PermissionDenied,
    EndOfFile,
    NoSpace,
    NotConnected,
    CopyCancelled,
    NoSuchCopy,
    BadParameter,
    UnknownProperty,
    InvalidProperty,
    UnknownAdaptor,
    InvalidLocation,
    InvalidCredential,
    UnsupportedOperation,
}

#[derive(Debug, Error)]
#[error("[{adaptor_name}] {kind:?}: {message}")]
pub struct Error {
    pub kind: ErrorKind,
    pub adaptor_name: String,
    pub message: String,
    #[source]
    pub source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl Error {
    pub fn new(kind: ErrorKind, adaptor_name: impl Into<String>, message: impl Into<String>) -> Self {
        Error {
            kind,
            adaptor_name: adaptor_name.into(),
            message: message.into(),
            source: None,
        }
    }

    pub fn with_source(
        kind: ErrorKind,
        adaptor_name: impl Into<String>,
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Error {
            kind,
            adaptor_name: adaptor_name.into(),
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }
}

/// Convenience constructors, one per taxonomy entry — keeps call sites
/// (`Err(Error::no_such_job("local", id))`) terse instead of repeating
/// `Error::new(ErrorKind::NoSuchJob, ...)` everywhere.
macro_rules! ctor {
    ($name:ident, $kind:ident) => {
        impl Error {
            pub fn $name(adaptor_name: impl Into<String>, message: impl Into<String>) -> Self {
                Error::new(ErrorKind::$kind, adaptor_name, message)
            }
        }
    };
}

ctor!(invalid_job_description, InvalidJobDescription);
ctor!(incomplete_job_description, IncompleteJobDescription);
ctor!(no_such_queue, NoSuchQueue);
ctor!(no_such_job, NoSuchJob);
ctor!(job_canceled, JobCanceled);
ctor!(no_such_path, NoSuchPath);
ctor!(path_already_exists, PathAlreadyExists);
ctor!(invalid_path, InvalidPath);
ctor!(directory_not_empty, DirectoryNotEmpty);
ctor!(permission_denied, PermissionDenied);
ctor!(end_of_file, EndOfFile);
ctor!(no_space, NoSpace);
ctor!(not_connected, NotConnected);
ctor!(copy_cancelled, CopyCancelled);
ctor!(no_such_copy, NoSuchCopy);
ctor!(bad_parameter, BadParameter);
ctor!(unknown_property, UnknownProperty);
ctor!(invalid_property, InvalidProperty);
ctor!(unknown_adaptor, UnknownAdaptor);
ctor!(invalid_location, InvalidLocation);
ctor!(invalid_credential, InvalidCredential);
ctor!(unsupported_operation, UnsupportedOperation);

pub type Result<T> = std::result::Result<T, Error>;

/// Translate a [`std::io::Error`] into the taxonomy, for back-ends built on
/// `tokio::fs`/`std::fs`. Unknown kinds fall through to a generic
/// `NotConnected`-flavoured wrapper, matching the propagation policy's
/// "unknown codes fall through to a generic transport error" rule.
pub fn from_io_error(adaptor_name: &str, path: &str, err: std::io::Error) -> Error {
    use std::io::ErrorKind as IoKind;
    const ENOSPC: i32 = 28;
    let kind = if err.raw_os_error() == Some(ENOSPC) {
        ErrorKind::NoSpace
    } else {
        match err.kind() {
            IoKind::NotFound => ErrorKind::NoSuchPath,
            IoKind::AlreadyExists => ErrorKind::PathAlreadyExists,
            IoKind::PermissionDenied => ErrorKind::PermissionDenied,
            IoKind::UnexpectedEof => ErrorKind::EndOfFile,
            IoKind::NotConnected | IoKind::ConnectionAborted | IoKind::ConnectionReset => {
                ErrorKind::NotConnected
            }
            _ => ErrorKind::NotConnected,
        }
    };
    Error::with_source(kind, adaptor_name, format!("{path}: {err}"), err)
}
