//! Error types for the event processor
//!
//! One error enum covers the whole pipeline. The important property is the
//! propagation contract, not the variant count: persistence errors never
//! abort SIP processing, presence-feed errors trigger reconnects internally,
//! and capacity errors are backpressure signals the caller may drop on.

use thiserror::Error;

/// Result type used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for event processor operations
#[derive(Error, Debug, Clone)]
pub enum Error {
    /// Malformed input at an API edge (bad dialog id, empty URI, ...)
    #[error("invalid argument: {message}")]
    InvalidArgument { message: String },

    /// A bounded queue is full; the event was not accepted
    #[error("capacity exceeded: {what}")]
    CapacityExceeded { what: String },

    /// Lookup miss; not an error at higher layers
    #[error("not found: {what}")]
    NotFound { what: String },

    /// An operation exceeded its deadline
    #[error("operation timed out: {operation}")]
    Timeout { operation: String },

    /// Socket error mid-read; handled internally by reconnect logic
    #[error("connection lost: {detail}")]
    ConnectionLost { detail: String },

    /// Malformed frame or parser buffer overflow
    #[error("parse error: {message}")]
    ParseError { message: String },

    /// Document store read/write failure; in-memory state is retained
    #[error("persistence error: {message}")]
    PersistenceError { message: String },

    /// Producer API called during shutdown
    #[error("shutting down")]
    ShuttingDown,

    /// Configuration file or value error
    #[error("configuration error: {message}")]
    ConfigError { message: String },
}

// Convenience constructors for common errors
impl Error {
    /// Create an invalid argument error
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument { message: message.into() }
    }

    /// Create a capacity exceeded error
    pub fn capacity_exceeded(what: impl Into<String>) -> Self {
        Self::CapacityExceeded { what: what.into() }
    }

    /// Create a not found error
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound { what: what.into() }
    }

    /// Create a timeout error
    pub fn timeout(operation: impl Into<String>) -> Self {
        Self::Timeout { operation: operation.into() }
    }

    /// Create a connection lost error
    pub fn connection_lost(detail: impl Into<String>) -> Self {
        Self::ConnectionLost { detail: detail.into() }
    }

    /// Create a parse error
    pub fn parse_error(message: impl Into<String>) -> Self {
        Self::ParseError { message: message.into() }
    }

    /// Create a persistence error
    pub fn persistence_error(message: impl Into<String>) -> Self {
        Self::PersistenceError { message: message.into() }
    }

    /// Create a configuration error
    pub fn config_error(message: impl Into<String>) -> Self {
        Self::ConfigError { message: message.into() }
    }
}
