//! Failure classification for remote calls and job-level errors

use crate::item::ItemId;

/// Classified failure of a single remote call.
///
/// Remote interfaces decide the class; the retry controller only matches on it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallError {
    /// Connection reset, timeout, throttling (429/503): safe to repeat after a cooldown.
    Retryable(String),
    /// Malformed request, auth rejection, undecodable response: isolate the item.
    Fatal(String),
}

/// Result of one remote call.
pub type CallResult<T> = Result<T, CallError>;

impl CallError {
    pub fn retryable(reason: impl Into<String>) -> Self {
        Self::Retryable(reason.into())
    }

    pub fn fatal(reason: impl Into<String>) -> Self {
        Self::Fatal(reason.into())
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable(_))
    }

    pub fn reason(&self) -> &str {
        match self {
            Self::Retryable(r) | Self::Fatal(r) => r,
        }
    }
}

impl std::fmt::Display for CallError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Retryable(r) => write!(f, "retryable: {r}"),
            Self::Fatal(r) => write!(f, "fatal: {r}"),
        }
    }
}

impl std::error::Error for CallError {}

/// Error that aborts a whole job.
///
/// Progress already written to the sink stays valid; a rerun resumes from it.
#[derive(Debug)]
pub enum JobError {
    /// Invalid configuration, detected before any work starts
    Config(String),
    /// Listing/enumeration failed fatally (a lost page hides all its items)
    Enumeration(String),
    /// Sink append failed for an item
    Sink { id: ItemId, source: std::io::Error },
    /// Ledger could not be read
    Ledger(std::io::Error),
    /// Persisted job state (batch handles) could not be read or written
    State(String),
}

impl std::fmt::Display for JobError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(m) => write!(f, "invalid configuration: {m}"),
            Self::Enumeration(m) => write!(f, "enumeration failed: {m}"),
            Self::Sink { id, source } => write!(f, "sink write failed for {id}: {source}"),
            Self::Ledger(e) => write!(f, "ledger scan failed: {e}"),
            Self::State(m) => write!(f, "job state: {m}"),
        }
    }
}

impl std::error::Error for JobError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Sink { source, .. } => Some(source),
            Self::Ledger(e) => Some(e),
            _ => None,
        }
    }
}
