/// Unified error handling for the router
///
/// The top-level `RouterError` covers everything a route can fail with at
/// runtime; configuration and metadata problems have their own enums and
/// convert into it via `From`.
use std::io;
use std::net::AddrParseError;
use thiserror::Error;

use crate::config::ConfigError;
use crate::metadata::MetadataError;
use crate::net::ConnectError;

/// Main error type for router operations
#[derive(Debug, Error)]
pub enum RouterError {
    /// Network-related errors
    #[error("Network error: {0}")]
    Network(#[from] io::Error),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Errors reaching a destination server
    #[error("Destination error: {0}")]
    Destination(#[from] ConnectError),

    /// The destination strategy had no server to offer
    #[error("no destinations available ({context})")]
    NoDestinations { context: String },

    /// Wire protocol violations while framing packets
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Metadata cache errors
    #[error("Metadata error: {0}")]
    Metadata(#[from] MetadataError),

    /// Address parsing errors
    #[error("Address parsing error: {0}")]
    AddressParse(#[from] AddrParseError),

    /// Timeout errors
    #[error("Operation timed out: {operation}")]
    Timeout { operation: String },
}

/// Result type alias for router operations
pub type RouterResult<T> = Result<T, RouterError>;

impl RouterError {
    /// Create a protocol error
    pub fn protocol<S: Into<String>>(message: S) -> Self {
        RouterError::Protocol(message.into())
    }

    /// Create a timeout error
    pub fn timeout<S: Into<String>>(operation: S) -> Self {
        RouterError::Timeout {
            operation: operation.into(),
        }
    }

    /// Create a no-destinations error
    pub fn no_destinations<S: Into<String>>(context: S) -> Self {
        RouterError::NoDestinations {
            context: context.into(),
        }
    }

    /// Check if this error is recoverable (the route keeps serving)
    pub fn is_recoverable(&self) -> bool {
        match self {
            RouterError::Network(_) => true,
            RouterError::Destination(_) => true,
            RouterError::NoDestinations { .. } => true,
            RouterError::Timeout { .. } => true,
            RouterError::Metadata(_) => true,
            RouterError::Config(_) => false,
            _ => false,
        }
    }
}
