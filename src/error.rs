//! Error types for the PostgreSQL Provisioning Operator

use std::time::Duration;

use thiserror::Error;

/// Result type alias using the operator's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// How the scheduler should treat a failed reconcile pass
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// Requires a spec or configuration change; never retried automatically
    Permanent,
    /// Retry later, optionally after a suggested delay
    Retryable { delay: Option<Duration> },
}

/// Operator error types
#[derive(Error, Debug)]
pub enum Error {
    /// Kubernetes API error
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Validation error
    #[error("Validation error: {0}")]
    Validation(String),

    /// Secret key not found
    #[error("Secret key '{key}' not found in secret '{secret}'")]
    SecretKeyNotFound { secret: String, key: String },

    /// Provider control plane error
    #[error("Provider error: {0}")]
    Provider(String),

    /// Helm invocation error
    #[error("Helm error: {0}")]
    Helm(String),

    /// SQL error
    #[error("SQL error: {0}")]
    Sql(#[from] tokio_postgres::Error),

    /// Not ready yet, retry after the given delay
    #[error("{message}")]
    Temporary { message: String, delay: Duration },

    /// Cannot succeed without a spec change
    #[error("{0}")]
    Permanent(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// YAML error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Finalizer error
    #[error("Finalizer error: {0}")]
    Finalizer(#[source] Box<kube::runtime::finalizer::Error<Error>>),
}

impl Error {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    /// Create a validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        Error::Validation(msg.into())
    }

    /// Create a provider error
    pub fn provider(msg: impl Into<String>) -> Self {
        Error::Provider(msg.into())
    }

    /// Create a helm error
    pub fn helm(msg: impl Into<String>) -> Self {
        Error::Helm(msg.into())
    }

    /// Create a retryable error with a suggested delay
    pub fn temporary(msg: impl Into<String>, delay: Duration) -> Self {
        Error::Temporary {
            message: msg.into(),
            delay,
        }
    }

    /// Create a permanent error
    pub fn permanent(msg: impl Into<String>) -> Self {
        Error::Permanent(msg.into())
    }

    /// Classify this error for the scheduler
    pub fn kind(&self) -> ErrorKind {
        use kube::runtime::finalizer::Error as FinalizerError;

        match self {
            Error::Config(_) | Error::Validation(_) | Error::Permanent(_) => ErrorKind::Permanent,
            Error::Temporary { delay, .. } => ErrorKind::Retryable {
                delay: Some(*delay),
            },
            Error::Finalizer(inner) => match inner.as_ref() {
                FinalizerError::ApplyFailed(e) | FinalizerError::CleanupFailed(e) => e.kind(),
                _ => ErrorKind::Retryable { delay: None },
            },
            _ => ErrorKind::Retryable { delay: None },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_temporary_carries_delay() {
        let err = Error::temporary("Waiting for server", Duration::from_secs(20));
        assert_eq!(
            err.kind(),
            ErrorKind::Retryable {
                delay: Some(Duration::from_secs(20))
            }
        );
        assert_eq!(err.to_string(), "Waiting for server");
    }

    #[test]
    fn test_spec_problems_are_permanent() {
        assert_eq!(Error::validation("bad").kind(), ErrorKind::Permanent);
        assert_eq!(Error::config("missing").kind(), ErrorKind::Permanent);
        assert_eq!(Error::permanent("invalid").kind(), ErrorKind::Permanent);
    }

    #[test]
    fn test_ambient_failures_retry_without_delay() {
        assert_eq!(
            Error::provider("throttled").kind(),
            ErrorKind::Retryable { delay: None }
        );
        assert_eq!(
            Error::helm("timed out").kind(),
            ErrorKind::Retryable { delay: None }
        );
    }

    #[test]
    fn test_finalizer_unwraps_inner_kind() {
        let inner = Error::permanent("invalid");
        let wrapped = Error::Finalizer(Box::new(
            kube::runtime::finalizer::Error::ApplyFailed(inner),
        ));
        assert_eq!(wrapped.kind(), ErrorKind::Permanent);
    }
}
