use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// Coarse classification of a failure, independent of which variant carries it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Network blip, timeout of a single attempt, or a retryable HTTP status.
    Transient,
    /// The remote store's own quota was exceeded.
    Quota,
    /// Malformed request, auth failure, not found. Never retried.
    Fatal,
    /// The overall deadline of a logical call elapsed.
    Timeout,
    /// The caller aborted the call.
    Cancelled,
    /// The store's state changed underneath a read-compute-write sequence.
    RaceCondition,
    Other,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Transient => "transient",
            ErrorKind::Quota => "quota",
            ErrorKind::Fatal => "fatal",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::RaceCondition => "race-condition",
            ErrorKind::Other => "other",
        };
        f.write_str(name)
    }
}

/// One failed attempt, kept for diagnostics when the retry budget runs out.
#[derive(Debug, Clone, PartialEq)]
pub struct AttemptRecord {
    pub attempt: u32,
    pub kind: ErrorKind,
    pub status: Option<u16>,
    pub message: String,
    /// Backoff scheduled after this attempt, if another one followed.
    pub backoff: Option<Duration>,
}

#[derive(Error, Debug)]
pub enum RowGateError {
    #[error("transient store failure (status {status:?}): {message}")]
    Transient { status: Option<u16>, message: String },

    #[error("store quota exceeded (status {status}): {message}")]
    Quota { status: u16, message: String },

    #[error("fatal store error (status {status:?}): {message}")]
    Fatal { status: Option<u16>, message: String },

    #[error("deadline of {elapsed:?} exceeded after {attempts} attempt(s)")]
    Timeout { elapsed: Duration, attempts: u32 },

    #[error("call cancelled by caller after {attempts} attempt(s)")]
    Cancelled { attempts: u32 },

    #[error("{kind} failure persisted after {attempts} attempt(s): {last}")]
    RetriesExhausted {
        kind: ErrorKind,
        attempts: u32,
        last: Box<RowGateError>,
        history: Vec<AttemptRecord>,
    },

    #[error("{op} on range '{range}' failed after {attempts} attempt(s): {source}")]
    Operation {
        op: &'static str,
        range: String,
        attempts: u32,
        #[source]
        source: Box<RowGateError>,
    },

    #[error("column '{column}' is not in the header of '{range}'")]
    UnknownColumn { range: String, column: String },

    #[error("unexpected store state: {0}")]
    UnexpectedState(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("HTTP client error: {0}")]
    Http(String),
}

pub type Result<T> = std::result::Result<T, RowGateError>;

impl RowGateError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RowGateError::Transient { .. } => ErrorKind::Transient,
            RowGateError::Quota { .. } => ErrorKind::Quota,
            RowGateError::Fatal { .. } => ErrorKind::Fatal,
            RowGateError::Timeout { .. } => ErrorKind::Timeout,
            RowGateError::Cancelled { .. } => ErrorKind::Cancelled,
            RowGateError::RetriesExhausted { kind, .. } => *kind,
            RowGateError::Operation { source, .. } => source.kind(),
            RowGateError::UnknownColumn { .. } => ErrorKind::Fatal,
            RowGateError::UnexpectedState(_) => ErrorKind::RaceCondition,
            RowGateError::Config(_) | RowGateError::Serialization(_) | RowGateError::Http(_) => {
                ErrorKind::Other
            }
        }
    }

    /// Number of network attempts that went into this error, when known.
    pub fn attempts(&self) -> u32 {
        match self {
            RowGateError::Timeout { attempts, .. }
            | RowGateError::Cancelled { attempts }
            | RowGateError::RetriesExhausted { attempts, .. }
            | RowGateError::Operation { attempts, .. } => *attempts,
            RowGateError::Transient { .. }
            | RowGateError::Quota { .. }
            | RowGateError::Fatal { .. } => 1,
            _ => 0,
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            RowGateError::Transient { status, .. } | RowGateError::Fatal { status, .. } => *status,
            RowGateError::Quota { status, .. } => Some(*status),
            RowGateError::RetriesExhausted { last, .. } => last.status(),
            RowGateError::Operation { source, .. } => source.status(),
            _ => None,
        }
    }

    /// Wrap with the logical operation that produced it.
    pub(crate) fn in_operation(self, op: &'static str, range: &str) -> Self {
        let attempts = self.attempts();
        RowGateError::Operation {
            op,
            range: range.to_string(),
            attempts,
            source: Box::new(self),
        }
    }
}

impl From<reqwest::Error> for RowGateError {
    fn from(err: reqwest::Error) -> Self {
        RowGateError::Http(err.to_string())
    }
}
