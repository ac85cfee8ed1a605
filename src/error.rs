//! Error taxonomy for volume lifecycle operations
//!
//! Remote failures are classified once, at the API transport boundary, into
//! these buckets. Everything above the transport matches on the bucket, not
//! on message strings.

use thiserror::Error;

/// Volume operation errors
#[derive(Debug, Error)]
pub enum VolumeError {
    /// Network-level or rate-limit failure; retried by the API client and
    /// only surfaced once retries are exhausted.
    #[error("transient failure during {what}: {detail}")]
    Transient { what: String, detail: String },

    /// Bad input or failed precondition; never retried.
    #[error("validation failed ({check}): {detail}")]
    Validation { check: String, detail: String },

    /// Remote resource already exists. Treated as success-via-reuse for
    /// idempotent mappings, or as a reroute signal for name allocation.
    #[error("already exists: {resource}")]
    Conflict { resource: String },

    /// Remote resource does not exist. Deletion call sites suppress this;
    /// repeated teardown legitimately observes it.
    #[error("does not exist: {resource}")]
    Absent { resource: String },

    /// Remote mutation succeeded but the local device never appeared
    /// within the bounded wait. The caller may want remote cleanup.
    #[error("{what} not available after {waited_ms} ms (remote state exists)")]
    NotReady { what: String, waited_ms: u64 },

    /// Remote error that fits no other bucket.
    #[error("API call {method} failed (code {code}): {message}")]
    Api {
        method: String,
        code: i64,
        message: String,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for volume operations
pub type VolumeResult<T> = Result<T, VolumeError>;

impl VolumeError {
    pub fn transient(what: impl Into<String>, detail: impl Into<String>) -> Self {
        VolumeError::Transient {
            what: what.into(),
            detail: detail.into(),
        }
    }

    pub fn validation(check: impl Into<String>, detail: impl Into<String>) -> Self {
        VolumeError::Validation {
            check: check.into(),
            detail: detail.into(),
        }
    }

    pub fn conflict(resource: impl Into<String>) -> Self {
        VolumeError::Conflict {
            resource: resource.into(),
        }
    }

    pub fn absent(resource: impl Into<String>) -> Self {
        VolumeError::Absent {
            resource: resource.into(),
        }
    }

    /// Whether the API client may retry this failure.
    pub fn is_transient(&self) -> bool {
        matches!(self, VolumeError::Transient { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, VolumeError::Conflict { .. })
    }

    pub fn is_absent(&self) -> bool {
        matches!(self, VolumeError::Absent { .. })
    }
}
