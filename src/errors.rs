//! Driver error types.
//!
//! Every internal helper returns `Result<T, DriverError>`.  The boundary
//! operations in [`crate::driver`] turn each variant into the sentinel of
//! the call and keep the rendered message in the last-error slot.

use thiserror::Error;

/// Result alias used across the crate.
pub type DriverResult<T> = Result<T, DriverError>;

/// Driver error kinds.
#[derive(Debug, Error)]
pub enum DriverError {
    /// Malformed URI, bad mode, zero element size, unknown seek origin.
    #[error("{message}")]
    InvalidArgument { message: String },

    /// No shard matches a glob, or an object is missing.
    #[error("{message}")]
    NotFound { message: String },

    /// Arithmetic that would leave the signed 64-bit range.
    #[error("signed overflow prevented: {context}")]
    Overflow { context: String },

    /// Anything surfaced by the storage client: network, permission, quota.
    #[error("{context}: {source:#}")]
    Backend {
        context: String,
        #[source]
        source: anyhow::Error,
    },

    /// Remote metadata is unusable, e.g. an empty header line.
    #[error("{message}")]
    InconsistentState { message: String },

    /// Local file failure during a transfer.
    #[error("{message}: {source}")]
    LocalIo {
        message: String,
        #[source]
        source: std::io::Error,
    },

    /// Driver misconfiguration, such as a missing default bucket.
    #[error("{message}")]
    Internal { message: String },

    /// An operation was attempted before `connect` or after `disconnect`.
    #[error("driver is not connected")]
    NotConnected,
}

impl DriverError {
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        DriverError::InvalidArgument {
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        DriverError::NotFound {
            message: message.into(),
        }
    }

    pub fn overflow(context: impl Into<String>) -> Self {
        DriverError::Overflow {
            context: context.into(),
        }
    }

    pub fn inconsistent(message: impl Into<String>) -> Self {
        DriverError::InconsistentState {
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        DriverError::Internal {
            message: message.into(),
        }
    }

    /// Wrap a storage client failure with a short description of the step.
    pub fn backend(context: impl Into<String>, source: anyhow::Error) -> Self {
        DriverError::Backend {
            context: context.into(),
            source,
        }
    }

    pub fn local_io(message: impl Into<String>, source: std::io::Error) -> Self {
        DriverError::LocalIo {
            message: message.into(),
            source,
        }
    }

    /// Stable machine-readable code for this error.
    pub fn code(&self) -> &'static str {
        match self {
            DriverError::InvalidArgument { .. } => "InvalidArgument",
            DriverError::NotFound { .. } => "NotFound",
            DriverError::Overflow { .. } => "Overflow",
            DriverError::Backend { .. } => "BackendFailure",
            DriverError::InconsistentState { .. } => "InconsistentState",
            DriverError::LocalIo { .. } => "LocalIo",
            DriverError::Internal { .. } => "Internal",
            DriverError::NotConnected => "NotConnected",
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, DriverError::NotFound { .. })
    }
}

/// Attach driver context to a backend `anyhow::Result`.
pub trait BackendContext<T> {
    fn backend_context(self, context: impl FnOnce() -> String) -> DriverResult<T>;
}

impl<T> BackendContext<T> for anyhow::Result<T> {
    fn backend_context(self, context: impl FnOnce() -> String) -> DriverResult<T> {
        self.map_err(|source| DriverError::backend(context(), source))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_distinct() {
        let errors = [
            DriverError::invalid_argument("x"),
            DriverError::not_found("x"),
            DriverError::overflow("x"),
            DriverError::backend("x", anyhow::anyhow!("boom")),
            DriverError::inconsistent("x"),
            DriverError::local_io("x", std::io::Error::other("disk full")),
            DriverError::internal("x"),
            DriverError::NotConnected,
        ];
        let mut codes: Vec<&str> = errors.iter().map(|e| e.code()).collect();
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), errors.len());
    }

    #[test]
    fn test_backend_message_includes_context_and_source() {
        let err: DriverResult<()> =
            Err(anyhow::anyhow!("HTTP 503")).backend_context(|| "reading shard-0".to_string());
        let msg = err.unwrap_err().to_string();
        assert!(msg.contains("reading shard-0"));
        assert!(msg.contains("HTTP 503"));
    }

    #[test]
    fn test_overflow_message() {
        let err = DriverError::overflow("seek from current");
        assert_eq!(err.to_string(), "signed overflow prevented: seek from current");
        assert!(!err.is_not_found());
        assert!(DriverError::not_found("gone").is_not_found());
    }
}
