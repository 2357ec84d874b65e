//! Error types for recovery operations
//!
//! Errors are structured with fields so a failed run can be diagnosed (or
//! resumed by hand) from the error alone: every variant that concerns a host,
//! machine or operand carries its name.

use std::time::Duration;

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for recovery operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error that is neither "not found" nor "already exists"
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// The requested object does not exist
    #[error("{kind} {name} not found")]
    NotFound {
        /// Resource kind (Machine, Deployment, ...)
        kind: String,
        /// Object name
        name: String,
    },

    /// An object with the same name already exists
    #[error("{kind} {name} already exists")]
    AlreadyExists {
        /// Resource kind
        kind: String,
        /// Object name
        name: String,
    },

    /// A remote command failed on a host (after the executor's own retries)
    #[error("remote command failed on {host}: {message} (command: {command})")]
    Remote {
        /// Host the command ran on
        host: String,
        /// The command line
        command: String,
        /// Exit status, stderr, or transport failure
        message: String,
    },

    /// A readiness poll did not succeed before its deadline
    #[error("timed out after {timeout:?} waiting for {operation}")]
    PollTimeout {
        /// What was being waited for
        operation: String,
        /// The deadline that elapsed
        timeout: Duration,
    },

    /// A bounded retry gave up
    #[error("{operation} failed after {attempts} attempts: {last_error}")]
    RetriesExhausted {
        /// Operation name
        operation: String,
        /// Number of attempts made
        attempts: u32,
        /// Last observed error
        last_error: String,
    },

    /// Precondition or configuration error
    #[error("validation error: {message}")]
    Validation {
        /// Description of what's invalid
        message: String,
    },

    /// A Node could not be mapped to the Machine backing it
    #[error("cannot resolve machine for node {node}: {message}")]
    MachineReference {
        /// Node name
        node: String,
        /// Why resolution failed
        message: String,
    },

    /// A copied backup archive does not match the authoritative digest
    #[error("backup archive on {host} does not match: expected sha256 {expected}, got {actual}")]
    ArchiveMismatch {
        /// Host holding the mismatching copy
        host: String,
        /// Digest of the authoritative archive
        expected: String,
        /// Digest observed on the host
        actual: String,
    },

    /// The cluster reported a state that contradicts the recovery sequence
    #[error("invariant violation: {message}")]
    InvariantViolation {
        /// What was observed
        message: String,
    },

    /// Operators did not reach steady state
    #[error("operators never settled: {}", unsettled.join(", "))]
    Unsettled {
        /// `namespace/name` of each unsettled operator
        unsettled: Vec<String>,
        /// Rendered diagnostic table
        table: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error for {kind}: {message}")]
    Serialization {
        /// The resource kind being decoded
        kind: String,
        /// Description of what failed
        message: String,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Where the error occurred
        context: String,
    },
}

impl Error {
    /// Create a "not found" error
    pub fn not_found(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self::NotFound {
            kind: kind.into(),
            name: name.into(),
        }
    }

    /// Create an "already exists" error
    pub fn already_exists(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self::AlreadyExists {
            kind: kind.into(),
            name: name.into(),
        }
    }

    /// Create a remote command error
    pub fn remote(
        host: impl Into<String>,
        command: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::Remote {
            host: host.into(),
            command: command.into(),
            message: message.into(),
        }
    }

    /// Create a poll timeout error
    pub fn poll_timeout(operation: impl Into<String>, timeout: Duration) -> Self {
        Self::PollTimeout {
            operation: operation.into(),
            timeout,
        }
    }

    /// Create a validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Create a machine reference error
    pub fn machine_reference(node: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::MachineReference {
            node: node.into(),
            message: msg.into(),
        }
    }

    /// Create an invariant violation error
    pub fn invariant(msg: impl Into<String>) -> Self {
        Self::InvariantViolation {
            message: msg.into(),
        }
    }

    /// Create a serialization error for a resource kind
    pub fn serialization(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Serialization {
            kind: kind.into(),
            message: msg.into(),
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

    /// True if the object did not exist
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::NotFound { .. } => true,
            Error::Kube {
                source: kube::Error::Api(ae),
            } => ae.code == 404,
            _ => false,
        }
    }

    /// True if the object already existed
    pub fn is_already_exists(&self) -> bool {
        match self {
            Error::AlreadyExists { .. } => true,
            Error::Kube {
                source: kube::Error::Api(ae),
            } => ae.code == 409,
            _ => false,
        }
    }

    /// True if this is a readiness poll timeout
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::PollTimeout { .. })
    }

    /// True if this is an invariant violation rather than an ordinary failure
    pub fn is_invariant_violation(&self) -> bool {
        matches!(self, Error::InvariantViolation { .. })
    }

    /// Check if a retry has a reasonable chance of succeeding
    ///
    /// Kubernetes 4xx responses and anything produced by our own checks are
    /// terminal; transport failures and remote command failures are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => !matches!(
                source,
                kube::Error::Api(ae) if (400..500).contains(&ae.code)
            ),
            Error::Remote { .. } => true,
            Error::Internal { .. } => true,
            Error::NotFound { .. }
            | Error::AlreadyExists { .. }
            | Error::PollTimeout { .. }
            | Error::RetriesExhausted { .. }
            | Error::Validation { .. }
            | Error::MachineReference { .. }
            | Error::ArchiveMismatch { .. }
            | Error::InvariantViolation { .. }
            | Error::Unsettled { .. }
            | Error::Serialization { .. } => false,
        }
    }

    /// Host associated with this error, if any
    pub fn host(&self) -> Option<&str> {
        match self {
            Error::Remote { host, .. } | Error::ArchiveMismatch { host, .. } => Some(host),
            _ => None,
        }
    }
}
