//! Error types for the synchronization engine.
//!
//! Only [`CvmError::ConnectionLost`] is recovered inside the engine, and only
//! at the listener/supervisor boundary. Everything else either gets skipped
//! by the dispatcher ([`CvmError::is_skippable`]) or is fatal to the process.

use thiserror::Error;

/// Result type alias for synchronization operations.
pub type CvmResult<T> = Result<T, CvmError>;

/// Exit status for a known error: the process should simply be restarted.
pub const EXIT_RESTART: u8 = 1;

/// Exit status for an unhandled defect (bug, panic, broken composition).
pub const EXIT_DEFECT: u8 = 2;

/// Errors that can occur while synchronizing inventory state.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CvmError {
    /// Transport failure talking to one of the backends.
    #[error("Connection to {backend} lost: {message}")]
    ConnectionLost {
        /// The backend that went away (e.g. "esxi", "vnc").
        backend: String,
        /// Error message.
        message: String,
    },

    /// Every VLAN id in the configured range is allocated.
    #[error("VLAN id pool [{start}, {end}] exhausted")]
    PoolExhausted {
        /// First id of the range.
        start: u16,
        /// Last id of the range.
        end: u16,
    },

    /// A handler's target object is not tracked.
    #[error("Managed object not found: {object}")]
    EntityNotFound {
        /// The managed object reference, formatted.
        object: String,
    },

    /// Business-rule violation raised by the service layer.
    #[error("Domain error: {message}")]
    Domain {
        /// Error message.
        message: String,
    },

    /// A property or event payload could not be parsed.
    #[error("Invalid value for '{property}': {message}")]
    InvalidValue {
        /// Property name or event kind.
        property: String,
        /// Parse error.
        message: String,
    },

    /// Configuration validation error.
    #[error("Invalid configuration for {field}: {message}")]
    InvalidConfig {
        /// The field that failed validation.
        field: String,
        /// Error message.
        message: String,
    },

    /// Two handlers claimed the same property name or event kind.
    #[error("Handler conflict: '{key}' is already claimed by {existing}")]
    HandlerConflict {
        /// The contested property name or event kind.
        key: String,
        /// Name of the handler already registered for it.
        existing: String,
    },

    /// The update queue has no producer or consumer left.
    #[error("Update queue closed")]
    QueueClosed,

    /// Internal error (unexpected state).
    #[error("Internal error: {message}")]
    Internal {
        /// Error message.
        message: String,
    },
}

impl CvmError {
    /// Creates a connection lost error.
    pub fn connection_lost(backend: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ConnectionLost {
            backend: backend.into(),
            message: message.into(),
        }
    }

    /// Creates an entity not found error.
    pub fn not_found(object: impl ToString) -> Self {
        Self::EntityNotFound {
            object: object.to_string(),
        }
    }

    /// Creates a domain error.
    pub fn domain(message: impl Into<String>) -> Self {
        Self::Domain {
            message: message.into(),
        }
    }

    /// Creates an invalid value error.
    pub fn invalid_value(property: impl Into<String>, message: impl ToString) -> Self {
        Self::InvalidValue {
            property: property.into(),
            message: message.to_string(),
        }
    }

    /// Creates an invalid configuration error.
    pub fn invalid_config(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Creates an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Returns true if the supervisor may recover from this error by
    /// reconnecting the backend sessions.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, CvmError::ConnectionLost { .. })
    }

    /// Returns true if a handler failing with this error should be logged
    /// and skipped instead of aborting the update set.
    pub fn is_skippable(&self) -> bool {
        matches!(
            self,
            CvmError::EntityNotFound { .. } | CvmError::InvalidValue { .. }
        )
    }

    /// Process exit status when this error reaches the process boundary.
    pub fn exit_code(&self) -> u8 {
        match self {
            CvmError::HandlerConflict { .. }
            | CvmError::QueueClosed
            | CvmError::Internal { .. } => EXIT_DEFECT,
            _ => EXIT_RESTART,
        }
    }
}
