//! Error types and result aliases for tagsync.
//!
//! Errors returned by cluster clients and image tooling are classified so
//! that callers can decide how to react without string matching:
//!
//! | Class | Variants | Caller behaviour |
//! |-------|----------|------------------|
//! | not-found | [`Error::NotFound`] | no-op, never logged as an error |
//! | conflict | [`Error::Conflict`], [`Error::AlreadyExists`] | debug log, rely on the next event |
//! | terminal | [`Error::InvalidRequest`] | report once, never requeue |
//! | retriable | [`Error::Unavailable`], [`Error::Timeout`], [`Error::Internal`] | requeue with backoff |

use std::fmt;

/// The result type used throughout tagsync.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur when talking to a cluster or an image tool.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The requested resource does not exist.
    #[error("not found: {resource_type} {id}")]
    NotFound {
        /// Kind of resource that was looked up.
        resource_type: &'static str,
        /// Identifier that was looked up.
        id: String,
    },

    /// A write was rejected because the stored object changed underneath it.
    #[error("conflict: {resource_type} {id}: {message}")]
    Conflict {
        /// Kind of resource that was written.
        resource_type: &'static str,
        /// Identifier of the object.
        id: String,
        /// Description of the conflict.
        message: String,
    },

    /// A create was rejected because the object already exists.
    #[error("already exists: {resource_type} {id}")]
    AlreadyExists {
        /// Kind of resource that was created.
        resource_type: &'static str,
        /// Identifier of the object.
        id: String,
    },

    /// The request can never succeed without an external change.
    #[error("invalid request: {message}")]
    InvalidRequest {
        /// Description of what made the request invalid.
        message: String,
    },

    /// The remote endpoint could not be reached or refused to serve.
    #[error("unavailable: {message}")]
    Unavailable {
        /// Description of the failure.
        message: String,
        /// The underlying cause, if any.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// An operation did not finish within its deadline.
    #[error("timed out after {elapsed_ms}ms: {message}")]
    Timeout {
        /// Description of what was being waited on.
        message: String,
        /// How long the caller waited.
        elapsed_ms: u64,
    },

    /// An internal error occurred that should not happen in normal operation.
    #[error("internal error: {message}")]
    Internal {
        /// Description of the internal error.
        message: String,
    },
}

impl Error {
    /// Creates a not-found error.
    #[must_use]
    pub fn not_found(resource_type: &'static str, id: impl fmt::Display) -> Self {
        Self::NotFound {
            resource_type,
            id: id.to_string(),
        }
    }

    /// Creates a conflict error.
    #[must_use]
    pub fn conflict(
        resource_type: &'static str,
        id: impl fmt::Display,
        message: impl Into<String>,
    ) -> Self {
        Self::Conflict {
            resource_type,
            id: id.to_string(),
            message: message.into(),
        }
    }

    /// Creates an already-exists error.
    #[must_use]
    pub fn already_exists(resource_type: &'static str, id: impl fmt::Display) -> Self {
        Self::AlreadyExists {
            resource_type,
            id: id.to_string(),
        }
    }

    /// Creates a terminal invalid-request error.
    #[must_use]
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::InvalidRequest {
            message: message.into(),
        }
    }

    /// Creates an unavailable error.
    #[must_use]
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable {
            message: message.into(),
            source: None,
        }
    }

    /// Creates an unavailable error with a source cause.
    #[must_use]
    pub fn unavailable_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Unavailable {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Returns true for the not-found class.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Returns true for write races that resolve themselves on the next event.
    #[must_use]
    pub const fn is_conflict_or_exists(&self) -> bool {
        matches!(self, Self::Conflict { .. } | Self::AlreadyExists { .. })
    }

    /// Returns true if retrying without an external change cannot help.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::InvalidRequest { .. })
    }

    /// Returns true if the caller should requeue with backoff.
    #[must_use]
    pub const fn is_retriable(&self) -> bool {
        matches!(
            self,
            Self::Unavailable { .. } | Self::Timeout { .. } | Self::Internal { .. }
        )
    }
}

/// Adapters for results whose not-found outcome is an expected state.
pub trait ResultExt<T> {
    /// Converts a not-found error into `Ok(None)`.
    ///
    /// # Errors
    ///
    /// Returns every error other than [`Error::NotFound`] unchanged.
    fn optional(self) -> Result<Option<T>>;

    /// Converts a not-found error into `Ok(())`, discarding the value.
    ///
    /// # Errors
    ///
    /// Returns every error other than [`Error::NotFound`] unchanged.
    fn ignore_not_found(self) -> Result<()>;
}

impl<T> ResultExt<T> for Result<T> {
    fn optional(self) -> Result<Option<T>> {
        match self {
            Ok(value) => Ok(Some(value)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn ignore_not_found(self) -> Result<()> {
        match self {
            Ok(_) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }
}
