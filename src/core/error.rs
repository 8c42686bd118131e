//! Error types of the cluster management core.
//!
//! Construction of a cluster has a single fallible collaborator (the TLS
//! context manager) and its failure is absorbed by the factory; the rest of
//! these variants surface from configuration and host parsing.

use std::fmt;

#[derive(Debug)]
pub enum ClusterError {
    /// Configuration-related errors
    Configuration(String),

    /// Validation errors
    Validation(String),

    /// Host address could not be parsed
    InvalidAddress(String),

    /// SSL/TLS related errors
    Tls(String),

    /// Internal system errors
    Internal(String),

    /// Pingora framework errors
    Pingora(Box<pingora_error::Error>),
}

impl fmt::Display for ClusterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClusterError::Configuration(msg) => write!(f, "Configuration error: {msg}"),
            ClusterError::Validation(msg) => write!(f, "Validation error: {msg}"),
            ClusterError::InvalidAddress(msg) => write!(f, "Invalid host address: {msg}"),
            ClusterError::Tls(msg) => write!(f, "SSL/TLS error: {msg}"),
            ClusterError::Internal(msg) => write!(f, "Internal error: {msg}"),
            ClusterError::Pingora(err) => write!(f, "Pingora error: {err}"),
        }
    }
}

impl std::error::Error for ClusterError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ClusterError::Pingora(err) => Some(err.as_ref()),
            _ => None,
        }
    }
}

impl From<Box<pingora_error::Error>> for ClusterError {
    fn from(err: Box<pingora_error::Error>) -> Self {
        ClusterError::Pingora(err)
    }
}

impl From<validator::ValidationErrors> for ClusterError {
    fn from(err: validator::ValidationErrors) -> Self {
        ClusterError::Validation(err.to_string())
    }
}

impl From<ClusterError> for Box<pingora_error::Error> {
    fn from(err: ClusterError) -> Self {
        match err {
            ClusterError::Pingora(pingora_err) => pingora_err,
            _ => pingora_error::Error::explain(
                pingora_error::ErrorType::InternalError,
                err.to_string(),
            ),
        }
    }
}

/// Result type alias for cluster operations
pub type ClusterResult<T> = std::result::Result<T, ClusterError>;

/// Helper trait for adding context to errors
pub trait ErrorContext<T> {
    fn with_context(self, context: &str) -> ClusterResult<T>;
}

impl<T, E> ErrorContext<T> for std::result::Result<T, E>
where
    E: fmt::Display,
{
    fn with_context(self, context: &str) -> ClusterResult<T> {
        self.map_err(|e| ClusterError::Internal(format!("{context}: {e}")))
    }
}

#[macro_export]
macro_rules! config_error {
    ($msg:expr) => {
        $crate::core::ClusterError::Configuration($msg.to_string())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::core::ClusterError::Configuration(format!($fmt, $($arg)*))
    };
}

#[macro_export]
macro_rules! tls_error {
    ($msg:expr) => {
        $crate::core::ClusterError::Tls($msg.to_string())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::core::ClusterError::Tls(format!($fmt, $($arg)*))
    };
}
