use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// A convenience `Result` alias using [`LeadflowError`].
pub type LeadflowResult<T> = Result<T, LeadflowError>;

/// Retry classification attached to an error where it is raised.
///
/// Adapters derive the kind from the upstream status code; only errors that
/// arrive as free text fall back to [`ErrorKind::classify_message`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The upstream rejected the call because of rate limits.
    RateLimited,
    /// The upstream (or broker) is temporarily unavailable.
    Overloaded,
    /// The call did not complete in time.
    Timeout,
    /// Anything that will fail again if repeated unchanged.
    Fatal,
}

impl ErrorKind {
    /// Whether a failure of this kind is worth another attempt.
    pub fn is_retryable(self) -> bool {
        !matches!(self, ErrorKind::Fatal)
    }

    /// Map an HTTP status code to a kind.
    pub fn from_status(status: u16) -> Self {
        match status {
            429 => ErrorKind::RateLimited,
            408 | 504 => ErrorKind::Timeout,
            500 | 502 | 503 | 529 => ErrorKind::Overloaded,
            _ => ErrorKind::Fatal,
        }
    }

    /// Keyword classifier for untyped error text.
    ///
    /// Vendors change their wording without notice, so this is only used when
    /// no status code or typed kind is available.
    pub fn classify_message(message: &str) -> Self {
        let lower = message.to_lowercase();
        if lower.contains("rate_limit")
            || lower.contains("rate limit")
            || lower.contains("too many requests")
            || lower.contains("429")
        {
            ErrorKind::RateLimited
        } else if lower.contains("timeout") || lower.contains("timed out") {
            ErrorKind::Timeout
        } else if lower.contains("temporary_failure")
            || lower.contains("overloaded")
            || lower.contains("unavailable")
            || lower.contains("503")
        {
            ErrorKind::Overloaded
        } else {
            ErrorKind::Fatal
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::RateLimited => write!(f, "rate_limited"),
            ErrorKind::Overloaded => write!(f, "overloaded"),
            ErrorKind::Timeout => write!(f, "timeout"),
            ErrorKind::Fatal => write!(f, "fatal"),
        }
    }
}

/// Top-level error type for Leadflow.
///
/// Each variant corresponds to a subsystem that can produce errors.
#[derive(Debug, Error)]
pub enum LeadflowError {
    /// An upstream AI provider call failed.
    #[error("Provider error ({provider}, {kind}): {message}")]
    Provider {
        /// Registered name of the provider.
        provider: String,
        /// Retry classification assigned by the adapter.
        kind: ErrorKind,
        /// Upstream error description.
        message: String,
    },

    /// No registered provider satisfies the request's capability requirements.
    #[error("No suitable provider: {0}")]
    NoSuitableProvider(String),

    /// Every provider in the fallback chain failed.
    #[error("All providers failed after {attempts} attempt(s): {last}")]
    AllProvidersFailed {
        /// Number of providers tried.
        attempts: usize,
        /// The error returned by the last provider tried.
        last: Box<LeadflowError>,
    },

    /// A structured response could not be parsed or is malformed.
    #[error("Validation error: {0}")]
    Validation(String),

    /// A pipeline stage failed.
    #[error("Stage {stage} failed: {source}")]
    Stage {
        /// Stage name.
        stage: String,
        /// Whether the failure aborts the pipeline.
        critical: bool,
        /// Underlying cause.
        #[source]
        source: Box<LeadflowError>,
    },

    /// The queue broker is unavailable or a queue operation was rejected.
    #[error("Queue error: {0}")]
    Queue(String),

    /// Opaque error from the persistence collaborator.
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// A record the pipeline depends on does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// A prompt template is missing or cannot be rendered.
    #[error("Template error: {0}")]
    Template(String),

    /// An operation was attempted in a state that does not allow it.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// An error in configuration parsing or validation.
    #[error("Config error: {0}")]
    Config(String),

    /// An outbound HTTP error without a status code.
    #[error("HTTP error: {0}")]
    Http(String),

    /// A JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl LeadflowError {
    /// Build a [`LeadflowError::Provider`].
    pub fn provider(provider: impl Into<String>, kind: ErrorKind, message: impl Into<String>) -> Self {
        Self::Provider {
            provider: provider.into(),
            kind,
            message: message.into(),
        }
    }

    /// Wrap an error as the failure of a pipeline stage.
    pub fn stage(stage: impl Into<String>, critical: bool, source: LeadflowError) -> Self {
        Self::Stage {
            stage: stage.into(),
            critical,
            source: Box::new(source),
        }
    }

    /// The retry classification of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            LeadflowError::Provider { kind, .. } => *kind,
            LeadflowError::AllProvidersFailed { last, .. } => last.kind(),
            LeadflowError::Stage { source, .. } => source.kind(),
            LeadflowError::Queue(_) => ErrorKind::Overloaded,
            LeadflowError::Http(msg) | LeadflowError::Persistence(msg) => {
                ErrorKind::classify_message(msg)
            }
            LeadflowError::Io(e) if e.kind() == std::io::ErrorKind::TimedOut => ErrorKind::Timeout,
            _ => ErrorKind::Fatal,
        }
    }

    /// Shorthand for `self.kind().is_retryable()`.
    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }
}
