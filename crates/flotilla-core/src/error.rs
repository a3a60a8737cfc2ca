// Allow unused assignments for diagnostic fields - they're used by the macros
#![allow(unused_assignments)]

use miette::Diagnostic;
use thiserror::Error;

/// Core error type for Flotilla job and node model operations
#[derive(Error, Debug, Diagnostic)]
pub enum FlotillaError {
    /// Job specification rejected at submission
    #[error("Validation failed for {field}: {details}")]
    #[diagnostic(
        code(flotilla::validation_failed),
        help("{help_text}")
    )]
    ValidationFailed {
        #[allow(unused)]
        field: String,
        #[allow(unused)]
        details: String,
        #[allow(unused)]
        help_text: String,
    },

    /// Illegal job state machine transition
    #[error("Invalid transition for job {job_id}: cannot move from {from} to {to}")]
    #[diagnostic(
        code(flotilla::invalid_transition),
        help("Terminal jobs (completed, failed, cancelled) accept no further transitions. Check the job status with `status()` first")
    )]
    InvalidTransition {
        #[allow(unused)]
        job_id: String,
        #[allow(unused)]
        from: String,
        #[allow(unused)]
        to: String,
    },

    /// Invalid configuration value
    #[error("Invalid configuration: {message}")]
    #[diagnostic(
        code(flotilla::invalid_config),
        help("{suggestion}")
    )]
    InvalidConfig {
        #[allow(unused)]
        message: String,
        #[allow(unused)]
        suggestion: String,
    },

    /// Resource quantity could not be parsed
    #[error("Invalid resource quantity '{value}': {reason}")]
    #[diagnostic(
        code(flotilla::invalid_quantity),
        help("CPU accepts cores or millicores (\"2\", \"0.5\", \"500m\"). Memory accepts bytes or Ki/Mi/Gi suffixes (\"512Mi\", \"8Gi\")")
    )]
    InvalidQuantity {
        #[allow(unused)]
        value: String,
        #[allow(unused)]
        reason: String,
    },

    /// Internal error
    #[error("Internal error: {message}")]
    #[diagnostic(
        code(flotilla::internal_error),
        help("This is likely a bug. Please report it with the full error details")
    )]
    InternalError {
        #[allow(unused)]
        message: String,
    },
}

/// Result type alias for Flotilla core operations
pub type Result<T> = std::result::Result<T, FlotillaError>;

impl FlotillaError {
    /// Create a ValidationFailed error
    pub fn validation_failed(
        field: impl Into<String>,
        details: impl Into<String>,
        help_text: impl Into<String>,
    ) -> Self {
        Self::ValidationFailed {
            field: field.into(),
            details: details.into(),
            help_text: help_text.into(),
        }
    }

    /// Create an InvalidTransition error
    pub fn invalid_transition(
        job_id: impl Into<String>,
        from: impl Into<String>,
        to: impl Into<String>,
    ) -> Self {
        Self::InvalidTransition {
            job_id: job_id.into(),
            from: from.into(),
            to: to.into(),
        }
    }

    /// Create an InvalidConfig error
    pub fn invalid_config(message: impl Into<String>, suggestion: impl Into<String>) -> Self {
        Self::InvalidConfig {
            message: message.into(),
            suggestion: suggestion.into(),
        }
    }

    /// Create an InvalidQuantity error
    pub fn invalid_quantity(value: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidQuantity {
            value: value.into(),
            reason: reason.into(),
        }
    }

    /// Create an InternalError
    pub fn internal_error(message: impl Into<String>) -> Self {
        Self::InternalError {
            message: message.into(),
        }
    }
}
