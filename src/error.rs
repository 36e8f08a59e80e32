//! Error types for the revstore library
//!
//! This module defines all error types that can occur while loading branches
//! and revisions or while writing commits.
//!
//! A missing branch, revision or availability entry is never an error: lookups
//! return `Option::None` for those, so callers can always tell a miss apart
//! from a failure. Everything in [`RevStoreError`] is a genuine failure:
//!
//! - **Load failures** raised by an injected loader or storage port
//! - **Protocol violations** in the large-object stream
//! - **Invariant violations** detected while validating a commit
//! - **Step failures** wrapping whatever went wrong in one commit step

use crate::commit::CommitStep;
use thiserror::Error;

/// Type alias for Results in the revstore library
pub type Result<T> = std::result::Result<T, RevStoreError>;

/// Main error type for all revstore operations
#[derive(Debug, Error)]
pub enum RevStoreError {
    /// I/O errors while streaming large objects or persisting snapshots
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Errors during JSON serialization/deserialization
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Errors during bincode serialization/deserialization
    #[error("Bincode error: {0}")]
    Bincode(String),

    /// A loader or storage port failed while resolving something
    #[error("Failed to load {what}: {reason}")]
    LoadFailure {
        /// What was being loaded (branch, revision, ...)
        what: String,
        /// Underlying failure description
        reason: String,
    },

    /// A branch id the backend does not know
    #[error("Branch not found: {0}")]
    BranchNotFound(i32),

    /// Malformed large-object stream
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    /// Programmer error detected while validating a commit
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    /// One step of a commit failed; earlier steps are not rolled back
    #[error("Commit step '{step}' failed: {source}")]
    StepFailed {
        /// Step that failed
        step: CommitStep,
        /// Cause of the failure
        #[source]
        source: Box<RevStoreError>,
    },

    /// The commit was canceled before or during the given step
    #[error("Commit canceled during step '{0}'")]
    Canceled(CommitStep),

    /// Commit request that cannot be turned into revisions
    #[error("Invalid commit: {0}")]
    InvalidCommit(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Generic error for unexpected conditions
    #[error("Internal error: {0}")]
    Internal(String),
}

// Implement conversions for bincode 2.0 error types
impl From<bincode::error::DecodeError> for RevStoreError {
    fn from(err: bincode::error::DecodeError) -> Self {
        RevStoreError::Bincode(err.to_string())
    }
}

impl From<bincode::error::EncodeError> for RevStoreError {
    fn from(err: bincode::error::EncodeError) -> Self {
        RevStoreError::Bincode(err.to_string())
    }
}

impl RevStoreError {
    /// Create a load failure for the given subject
    pub fn load_failure(what: impl Into<String>, reason: impl Into<String>) -> Self {
        RevStoreError::LoadFailure {
            what: what.into(),
            reason: reason.into(),
        }
    }

    /// Create a protocol violation with a custom message
    pub fn protocol(msg: impl Into<String>) -> Self {
        RevStoreError::ProtocolViolation(msg.into())
    }

    /// Create an invariant violation with a custom message
    pub fn invariant(msg: impl Into<String>) -> Self {
        RevStoreError::InvariantViolation(msg.into())
    }

    /// Create an internal error with a custom message
    pub fn internal(msg: impl Into<String>) -> Self {
        RevStoreError::Internal(msg.into())
    }

    /// Wrap an error as the failure of a commit step.
    ///
    /// Cancellations and already wrapped failures pass through unchanged.
    pub fn in_step(self, step: CommitStep) -> Self {
        match self {
            err @ (RevStoreError::StepFailed { .. } | RevStoreError::Canceled(_)) => err,
            err => RevStoreError::StepFailed {
                step,
                source: Box::new(err),
            },
        }
    }

    /// The innermost cause, looking through step wrappers
    pub fn root_cause(&self) -> &RevStoreError {
        match self {
            RevStoreError::StepFailed { source, .. } => source.root_cause(),
            other => other,
        }
    }

    /// Check if this error came from a loader or storage port
    pub fn is_load_failure(&self) -> bool {
        matches!(
            self.root_cause(),
            RevStoreError::LoadFailure { .. }
                | RevStoreError::BranchNotFound(_)
                | RevStoreError::Io(_)
                | RevStoreError::Json(_)
                | RevStoreError::Bincode(_)
        )
    }

    /// Check if this error indicates a malformed large-object stream
    pub fn is_protocol_violation(&self) -> bool {
        matches!(self.root_cause(), RevStoreError::ProtocolViolation(_))
    }

    /// Check if this error indicates a programmer error
    pub fn is_invariant_violation(&self) -> bool {
        matches!(self.root_cause(), RevStoreError::InvariantViolation(_))
    }

    /// Check if this error is a cancellation
    pub fn is_canceled(&self) -> bool {
        matches!(self, RevStoreError::Canceled(_))
    }

    /// The commit step this error was raised in, if any
    pub fn failed_step(&self) -> Option<CommitStep> {
        match self {
            RevStoreError::StepFailed { step, .. } | RevStoreError::Canceled(step) => Some(*step),
            _ => None,
        }
    }
}
