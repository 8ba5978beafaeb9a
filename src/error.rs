//! Error types for the test harness
//!
//! Errors carry the identity of whatever failed (resource, command, file) so a
//! test step can report them without extra wrapping. The free functions at the
//! bottom are the classifiers handed to [`crate::retry::retry`].

use std::path::PathBuf;
use std::process::ExitStatus;
use std::time::Duration;

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Why a [`crate::context::Context`] finished
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ContextError {
    /// The context was cancelled explicitly
    #[error("context canceled")]
    Canceled,
    /// The context deadline passed
    #[error("context deadline exceeded")]
    DeadlineExceeded,
}

/// Main error type for harness operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// The governing context finished before the operation did
    #[error(transparent)]
    Context(#[from] ContextError),

    /// A polled condition did not converge in time
    #[error("timed out after {timeout:?} waiting for {operation}")]
    Timeout {
        /// What was being waited for
        operation: String,
        /// The polling bound that elapsed
        timeout: Duration,
    },

    /// A foreground command ran past its effective timeout
    #[error("command {command:?} exceeded {timeout_secs} sec timeout")]
    CommandTimeout {
        /// The command line (or script body) that was running
        command: String,
        /// Effective timeout in seconds
        timeout_secs: u64,
    },

    /// Invalid input rejected before any side effect
    #[error("validation error: {message}")]
    Validation {
        /// Description of what's invalid
        message: String,
        /// The invalid field path (e.g., "spec.names.kind")
        field: Option<String>,
    },

    /// A resource type could not be resolved through discovery
    #[error("discovery error for {resource}: {message}")]
    Discovery {
        /// The group/version/kind that was looked up
        resource: String,
        /// Description of what failed
        message: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
        /// The resource kind or file being processed (if known)
        kind: Option<String>,
    },

    /// The process could not be spawned
    #[error("failed to start command {command:?}: {source}")]
    CommandStart {
        /// The command line (or script body)
        command: String,
        /// Underlying spawn failure
        source: std::io::Error,
    },

    /// The process ran and exited unsuccessfully
    #[error("command {command:?} failed: {status}")]
    CommandFailed {
        /// The command line (or script body)
        command: String,
        /// Exit status reported by the OS
        status: ExitStatus,
    },

    /// Filesystem error
    #[error("io error on {}: {source}", .path.display())]
    Io {
        /// Path being read or walked
        path: PathBuf,
        /// Underlying IO error
        source: std::io::Error,
    },

    /// Upserting a manifest object failed
    #[error("error creating resource {resource}: {source}")]
    Resource {
        /// `Kind:namespace/name` of the object
        resource: String,
        /// What the upsert failed with
        source: Box<Error>,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Where the error occurred (e.g., "retry", "watch")
        context: String,
    },
}

impl Error {
    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error pointing at a field path
    pub fn validation_for_field(field: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
            field: Some(field.into()),
        }
    }

    /// Create a discovery error for a resource type
    pub fn discovery(resource: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Discovery {
            resource: resource.into(),
            message: msg.into(),
        }
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: None,
        }
    }

    /// Create a serialization error with resource kind or file context
    pub fn serialization_for_kind(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: Some(kind.into()),
        }
    }

    /// Create an IO error for a path
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Attach the identity of the object whose upsert failed
    pub fn resource(resource: impl Into<String>, source: Error) -> Self {
        Self::Resource {
            resource: resource.into(),
            source: Box::new(source),
        }
    }

    /// Create an internal error with the given message
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: UNKNOWN_CONTEXT.to_string(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// True for every flavour of "ran out of time"
    ///
    /// Covers context deadlines, poll timeouts and command timeouts, so callers
    /// can tell a slow system apart from a failing one.
    pub fn is_deadline_exceeded(&self) -> bool {
        matches!(
            self,
            Error::Context(ContextError::DeadlineExceeded)
                | Error::Timeout { .. }
                | Error::CommandTimeout { .. }
        )
    }

    /// The HTTP status of an API error, if this is one
    pub fn api_code(&self) -> Option<u16> {
        match self {
            Error::Kube {
                source: kube::Error::Api(ae),
            } => Some(ae.code),
            Error::Resource { source, .. } => source.api_code(),
            _ => None,
        }
    }

    fn api_reason(&self) -> Option<&str> {
        match self {
            Error::Kube {
                source: kube::Error::Api(ae),
            } => Some(ae.reason.as_str()),
            Error::Resource { source, .. } => source.api_reason(),
            _ => None,
        }
    }
}

/// The server responded with a body that isn't valid JSON
///
/// These are transient encoding hiccups; everything the harness sends through
/// [`crate::client::RetryClient`] tolerates them.
pub fn is_json_syntax_error(err: &Error) -> bool {
    match err {
        Error::Kube {
            source: kube::Error::SerdeError(e),
        } => matches!(
            e.classify(),
            serde_json::error::Category::Syntax | serde_json::error::Category::Eof
        ),
        _ => false,
    }
}

/// The object does not exist
pub fn is_not_found(err: &Error) -> bool {
    err.api_code() == Some(404)
}

/// A create lost the race against another creator
pub fn is_already_exists(err: &Error) -> bool {
    err.api_code() == Some(409) && err.api_reason() == Some("AlreadyExists")
}

/// An update carried a stale resource version
pub fn is_conflict(err: &Error) -> bool {
    err.api_code() == Some(409) && err.api_reason() == Some("Conflict")
}

/// Build a Kubernetes API error the way the API server reports it
///
/// Used by in-process stores and tests to speak the same error vocabulary as
/// a real server.
pub fn api_error(code: u16, reason: &str, message: impl Into<String>) -> Error {
    Error::Kube {
        source: kube::Error::Api(kube::core::ErrorResponse {
            status: "Failure".to_string(),
            message: message.into(),
            reason: reason.to_string(),
            code,
        }),
    }
}
