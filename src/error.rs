//! Error handling for the consumer
//!
//! This module provides the error type, the result alias and the error
//! classification consumed by every component's retry policy.

use std::fmt;
use std::io;
use thiserror::Error;

/// Service error code returned when a consumer group is created twice
pub const GROUP_ALREADY_EXISTS: &str = "ConsumerGroupAlreadyExist";

/// HTTP status the log service answers with for forbidden requests
pub const HTTP_FORBIDDEN: u16 = 403;

/// An error answered by the log service itself
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceError {
    /// HTTP status of the response
    pub http_status: u16,
    /// Service error code, e.g. `ConsumerGroupAlreadyExist`
    pub code: String,
    /// Human readable message
    pub message: String,
    /// Request id echoed by the service, if any
    pub request_id: Option<String>,
}

impl ServiceError {
    /// Create a new service error
    pub fn new(http_status: u16, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            http_status,
            code: code.into(),
            message: message.into(),
            request_id: None,
        }
    }

    /// Attach the request id reported by the service
    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }
}

impl fmt::Display for ServiceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}: {}", self.http_status, self.code, self.message)?;
        if let Some(ref id) = self.request_id {
            write!(f, " (request id {})", id)?;
        }
        Ok(())
    }
}

impl std::error::Error for ServiceError {}

/// Coarse classification of an error, consumed by retry policies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// The resource already exists; the operation is idempotent
    Conflict,
    /// Access forbidden, usually an authorization or quota condition
    Forbidden,
    /// Any other error answered by the service
    Transient,
    /// Unclassified failure (transport, local, ...)
    Unknown,
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Conflict => write!(f, "conflict"),
            Self::Forbidden => write!(f, "forbidden"),
            Self::Transient => write!(f, "transient"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

/// Errors that can occur in consumer operations
#[derive(Error, Debug)]
pub enum Error {
    /// The log service answered with an error
    #[error("Service error: {0}")]
    Service(#[from] ServiceError),

    /// The request never got a service answer
    #[error("Transport error: {0}")]
    Transport(String),

    /// Errors related to configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Errors related to serialization/deserialization
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Errors related to I/O operations
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Errors related to shard workers
    #[error("Shard error: {0}")]
    Shard(String),

    /// Errors returned by a log processor
    #[error("Processor error: {0}")]
    Processor(String),

    /// The consumer has been shut down
    #[error("Consumer is closed")]
    Closed,

    /// Generic error type for other cases
    #[error("{0}")]
    Other(String),
}

/// Result type for consumer operations
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create a new service error
    pub fn service(http_status: u16, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Service(ServiceError::new(http_status, code, message))
    }

    /// Create a new transport error
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport(message.into())
    }

    /// Create a new configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Create a new shard error
    pub fn shard(message: impl Into<String>) -> Self {
        Self::Shard(message.into())
    }

    /// Create a new processor error
    pub fn processor(message: impl Into<String>) -> Self {
        Self::Processor(message.into())
    }

    /// Create a new generic error
    pub fn other(message: impl Into<String>) -> Self {
        Self::Other(message.into())
    }

    /// Classify this error for retry decisions
    pub fn classify(&self) -> ErrorClass {
        match self {
            Self::Service(err) if err.code == GROUP_ALREADY_EXISTS => ErrorClass::Conflict,
            Self::Service(err) if err.http_status == HTTP_FORBIDDEN => ErrorClass::Forbidden,
            Self::Service(_) => ErrorClass::Transient,
            _ => ErrorClass::Unknown,
        }
    }

    /// The service error, if the service answered
    pub fn as_service_error(&self) -> Option<&ServiceError> {
        match self {
            Self::Service(err) => Some(err),
            _ => None,
        }
    }

    /// Check if this is a service error
    pub fn is_service_error(&self) -> bool {
        matches!(self, Self::Service(_))
    }

    /// Check if this is a configuration error
    pub fn is_config_error(&self) -> bool {
        matches!(self, Self::Config(_))
    }

    /// Check if this is a closed error
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed)
    }

    /// Get a user-friendly suggestion for resolving the error
    pub fn suggestion(&self) -> Option<String> {
        match self.classify() {
            ErrorClass::Forbidden => {
                Some("Check the access key permissions and the project quota".to_string())
            }
            ErrorClass::Conflict => None,
            _ => match self {
                Self::Config(_) => Some("Check endpoint, credentials, project and logstore".to_string()),
                Self::Transport(_) => Some("Check network connectivity to the endpoint".to_string()),
                _ => None,
            },
        }
    }
}
