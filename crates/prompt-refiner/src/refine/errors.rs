//! Refinement error taxonomy with recovery classification.
//!
//! Every error raised while driving a session is represented here. The
//! controller decides what to do with a failure by asking `recovery()`
//! instead of string matching.
//!
//! ## Recovery classes
//!
//! | Kind              | Recovery                                  |
//! |-------------------|-------------------------------------------|
//! | Provider          | fatal in Analyze/Generate, fallback in Reflect |
//! | Timeout           | same as Provider                          |
//! | EmptyResponse     | fatal                                     |
//! | StructuredDecode  | fallback verdict                          |
//! | Retrieval         | absorbed by Generate as "no match"        |
//! | Persistence       | logged by the checkpoint writer           |
//! | InvalidInput      | fatal                                     |
//! | Cancelled         | terminal                                  |
//! | Configuration     | startup only                              |

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::refine::types::Stage;

/// Coarse classification of a [`RefineError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Provider,
    Timeout,
    EmptyResponse,
    StructuredDecode,
    Retrieval,
    Persistence,
    InvalidInput,
    Cancelled,
    Configuration,
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Provider => write!(f, "provider"),
            Self::Timeout => write!(f, "timeout"),
            Self::EmptyResponse => write!(f, "empty_response"),
            Self::StructuredDecode => write!(f, "structured_decode"),
            Self::Retrieval => write!(f, "retrieval"),
            Self::Persistence => write!(f, "persistence"),
            Self::InvalidInput => write!(f, "invalid_input"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::Configuration => write!(f, "configuration"),
            Self::Internal => write!(f, "internal"),
        }
    }
}

/// What the controller does when a stage surfaces an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recovery {
    /// Emit a terminal `Error` event and stop the session.
    AbortSession,
    /// Substitute the fallback reflection verdict.
    FallbackVerdict,
}

/// Unified error type for refinement sessions and their collaborators.
#[derive(Debug, Error)]
pub enum RefineError {
    /// Text-generation backend failed (network, HTTP status, malformed body).
    #[error("Provider failure [{provider}]: {message}")]
    Provider { provider: String, message: String },

    /// A capability call exceeded its time budget.
    #[error("{operation} timed out after {}s", .after.as_secs())]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    /// The backend answered but produced no text.
    #[error("{0} produced an empty response")]
    EmptyResponse(Stage),

    /// Structured output could not be decoded into the requested shape.
    #[error("Structured output decode failed: {0}")]
    StructuredDecode(String),

    /// Template lookup failed.
    #[error("Retrieval failure: {0}")]
    Retrieval(String),

    /// Durable storage rejected or could not accept a write.
    #[error("Persistence failure: {0}")]
    Persistence(String),

    /// The caller supplied unusable input.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// The session was cancelled or its consumer went away.
    #[error("cancelled")]
    Cancelled,

    /// Configuration is invalid or missing required fields.
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl RefineError {
    /// Build a `Provider` variant conveniently.
    pub fn provider(provider: impl Into<String>, message: impl fmt::Display) -> Self {
        Self::Provider {
            provider: provider.into(),
            message: message.to_string(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Provider { .. } => ErrorKind::Provider,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::EmptyResponse(_) => ErrorKind::EmptyResponse,
            Self::StructuredDecode(_) => ErrorKind::StructuredDecode,
            Self::Retrieval(_) => ErrorKind::Retrieval,
            Self::Persistence(_) => ErrorKind::Persistence,
            Self::InvalidInput(_) => ErrorKind::InvalidInput,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Configuration(_) => ErrorKind::Configuration,
            Self::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Classify this error for the stage it surfaced in.
    ///
    /// Reflect never aborts a session: anything that stops it from producing
    /// a verdict, short of cancellation, is replaced by the fallback.
    pub fn recovery(&self, stage: Stage) -> Recovery {
        match (self.kind(), stage) {
            (ErrorKind::Cancelled, _) => Recovery::AbortSession,
            (_, Stage::Reflect) => Recovery::FallbackVerdict,
            _ => Recovery::AbortSession,
        }
    }
}
