//! Error types for the checkup framework

use thiserror::Error;

/// Main error type for checkup operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Missing or malformed checkup configuration
    #[error("configuration error: {0}")]
    Config(String),

    /// The Store already carries status from an earlier run
    #[error("configuration error: ConfigMap is already in use")]
    AlreadyInUse,

    /// A duration string could not be parsed
    #[error("invalid duration {0:?}")]
    InvalidDuration(String),

    /// Workload submission was rejected
    #[error("launch error: {0}")]
    Launch(String),

    /// The run deadline elapsed before the operation finished
    #[error("timeout: {0}")]
    Timeout(String),

    /// A platform hiccup that is expected to clear on retry
    #[error("transient platform error: {0}")]
    Transient(String),

    /// A write-once status key already holds a different value
    #[error("status key {0:?} was already written")]
    StatusAlreadyWritten(String),

    /// The terminal status was already reported for this run
    #[error("terminal status was already reported")]
    AlreadyReported,
}

impl Error {
    /// Create a configuration error with the given message
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a launch error with the given message
    pub fn launch(msg: impl Into<String>) -> Self {
        Self::Launch(msg.into())
    }

    /// Create a timeout error with the given message
    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    /// Create a transient error with the given message
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    /// Whether retrying the failed operation may succeed.
    ///
    /// Conflicts, throttling, server-side failures and transport errors are
    /// transient. Everything else (validation, not found, forbidden, bad
    /// configuration) is fatal.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Kube(kube::Error::Api(ae)) => {
                ae.code == 409 || ae.code == 429 || ae.code >= 500
            }
            Error::Kube(kube::Error::HyperError(_)) | Error::Kube(kube::Error::Service(_)) => true,
            Error::Transient(_) => true,
            _ => false,
        }
    }

    /// Whether this is a Kubernetes "not found" response
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::Kube(kube::Error::Api(ae)) if ae.code == 404)
    }

    /// Whether this is a Kubernetes optimistic-concurrency conflict
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Kube(kube::Error::Api(ae)) if ae.code == 409)
    }
}

#[cfg(test)]
pub(crate) fn api_error(code: u16, reason: &str) -> Error {
    Error::Kube(kube::Error::Api(kube::error::ErrorResponse {
        status: "Failure".to_string(),
        message: format!("{reason} ({code})"),
        reason: reason.to_string(),
        code,
    }))
}
