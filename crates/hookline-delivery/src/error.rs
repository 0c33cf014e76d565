//! Error types for queue, ledger and delivery operations.
//!
//! Transport failures are not errors from the worker's point of view: they
//! are recorded on the attempt and feed the retry schedule. The variants here
//! are the failures that stop a handler before it can record an outcome, plus
//! construction and lifecycle errors.

use std::fmt;

use thiserror::Error;

/// Result type alias for delivery operations.
pub type Result<T> = std::result::Result<T, DeliveryError>;

/// Errors raised by the delivery engine.
#[derive(Debug, Clone, Error)]
pub enum DeliveryError {
    /// The task queue's backing store failed.
    #[error("queue error: {message}")]
    Queue {
        /// Backend error message
        message: String,
    },

    /// The ledger failed to read or write.
    #[error("ledger error: {message}")]
    Ledger {
        /// Ledger error message
        message: String,
    },

    /// The request could not be sent or no response arrived.
    #[error("network error: {message}")]
    Network {
        /// Transport error message
        message: String,
    },

    /// An outbound plugin failed.
    #[error("failed to execute {plugin} plugin: {message}")]
    Plugin {
        /// Name of the failing plugin
        plugin: String,
        /// Plugin error message
        message: String,
    },

    /// A task payload could not be encoded or decoded.
    #[error("invalid task payload: {message}")]
    Payload {
        /// Serialization error message
        message: String,
    },

    /// Invalid configuration.
    #[error("invalid configuration: {message}")]
    Configuration {
        /// Configuration error message
        message: String,
    },

    /// A retry strategy was named that has no implementation.
    #[error("retry strategy '{strategy}' is not implemented")]
    UnsupportedStrategy {
        /// Strategy name
        strategy: String,
    },

    /// In-flight handlers did not finish within the shutdown timeout.
    #[error("shutdown timed out after {timeout_secs}s with handlers still running")]
    ShutdownTimeout {
        /// Timeout that elapsed
        timeout_secs: u64,
    },

    /// A task handler panicked.
    #[error("handler panicked: {message}")]
    HandlerPanic {
        /// Panic description
        message: String,
    },

    /// Unexpected internal error.
    #[error("internal delivery error: {message}")]
    Internal {
        /// Internal error message
        message: String,
    },
}

impl DeliveryError {
    /// Creates a queue error.
    pub fn queue(message: impl Into<String>) -> Self {
        Self::Queue { message: message.into() }
    }

    /// Creates a ledger error.
    pub fn ledger(message: impl Into<String>) -> Self {
        Self::Ledger { message: message.into() }
    }

    /// Creates a network error.
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network { message: message.into() }
    }

    /// Creates a plugin error.
    pub fn plugin(plugin: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Plugin { plugin: plugin.into(), message: message.into() }
    }

    /// Creates a payload error.
    pub fn payload(message: impl Into<String>) -> Self {
        Self::Payload { message: message.into() }
    }

    /// Creates a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration { message: message.into() }
    }

    /// Creates an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal { message: message.into() }
    }

    /// Returns true for failures of the queue or ledger stores.
    ///
    /// These are never written to the ledger; the task is left for the
    /// visibility timeout to redeliver.
    pub fn is_infrastructure(&self) -> bool {
        matches!(self, Self::Queue { .. } | Self::Ledger { .. })
    }

    /// Returns the category used in log fields.
    pub fn category(&self) -> ErrorCategory {
        ErrorCategory::from(self)
    }
}

impl From<hookline_core::CoreError> for DeliveryError {
    fn from(err: hookline_core::CoreError) -> Self {
        Self::ledger(err.to_string())
    }
}

impl From<serde_json::Error> for DeliveryError {
    fn from(err: serde_json::Error) -> Self {
        Self::payload(err.to_string())
    }
}

/// Coarse classification of delivery errors for logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Queue or ledger store failures.
    Infrastructure,
    /// Network transport failures.
    Transport,
    /// Plugin failures.
    Plugin,
    /// Malformed tasks.
    Payload,
    /// Configuration problems.
    Configuration,
    /// Lifecycle and internal failures.
    Internal,
}

impl From<&DeliveryError> for ErrorCategory {
    fn from(error: &DeliveryError) -> Self {
        match error {
            DeliveryError::Queue { .. } | DeliveryError::Ledger { .. } => Self::Infrastructure,
            DeliveryError::Network { .. } => Self::Transport,
            DeliveryError::Plugin { .. } => Self::Plugin,
            DeliveryError::Payload { .. } => Self::Payload,
            DeliveryError::Configuration { .. } | DeliveryError::UnsupportedStrategy { .. } => {
                Self::Configuration
            },
            DeliveryError::ShutdownTimeout { .. }
            | DeliveryError::HandlerPanic { .. }
            | DeliveryError::Internal { .. } => Self::Internal,
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Infrastructure => write!(f, "infrastructure"),
            Self::Transport => write!(f, "transport"),
            Self::Plugin => write!(f, "plugin"),
            Self::Payload => write!(f, "payload"),
            Self::Configuration => write!(f, "configuration"),
            Self::Internal => write!(f, "internal"),
        }
    }
}
