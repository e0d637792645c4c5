use common::types::backend::ApiKeyError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fmt::Display;
use std::time::Duration;

/// Why a single routing request failed
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum RoutingError {
    /// Network or connection problems, server errors. Worth retrying.
    Transient(String),
    /// The provider throttles us. Retry after backing off.
    RateLimited { retry_after: Option<Duration>, message: String },
    /// The request itself is wrong (bad coordinates, unsupported profile, no route). Never retried.
    Permanent(String),
    /// The request was cancelled because the benchmark ran out of time
    Timeout,
}

impl RoutingError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RoutingError::Transient(_) => ErrorKind::Transient,
            RoutingError::RateLimited { .. } => ErrorKind::RateLimit,
            RoutingError::Permanent(_) => ErrorKind::Permanent,
            RoutingError::Timeout => ErrorKind::Timeout,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, RoutingError::Transient(_) | RoutingError::RateLimited { .. })
    }
}

impl Display for RoutingError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            RoutingError::Transient(message) => write!(f, "Transient error: {}", message),
            RoutingError::RateLimited { retry_after: Some(after), message } => {
                write!(f, "Rate limited (retry after {:?}): {}", after, message)
            }
            RoutingError::RateLimited { retry_after: None, message } => {
                write!(f, "Rate limited: {}", message)
            }
            RoutingError::Permanent(message) => write!(f, "Permanent error: {}", message),
            RoutingError::Timeout => write!(f, "Cancelled because the time budget was exceeded"),
        }
    }
}

#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Transient,
    RateLimit,
    Permanent,
    Timeout,
}

impl ErrorKind {
    pub const ALL: [ErrorKind; 4] = [
        ErrorKind::Transient,
        ErrorKind::RateLimit,
        ErrorKind::Permanent,
        ErrorKind::Timeout,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Transient => "transient",
            ErrorKind::RateLimit => "rate_limit",
            ErrorKind::Permanent => "permanent",
            ErrorKind::Timeout => "timeout",
        }
    }
}

impl Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A backend could not be built from its configuration
#[derive(thiserror::Error, Debug)]
pub enum BackendError {
    ApiKey(#[from] ApiKeyError),
    Client(#[from] reqwest::Error),
    UnknownBackend(String),
    InvalidConfig(String),
}

impl Display for BackendError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            BackendError::ApiKey(err) => write!(f, "{}", err),
            BackendError::Client(err) => write!(f, "{}", err),
            BackendError::UnknownBackend(name) => write!(f, "Unknown backend '{}'", name),
            BackendError::InvalidConfig(message) => write!(f, "Invalid backend configuration: {}", message),
        }
    }
}
