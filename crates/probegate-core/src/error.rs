//! Error types for the orchestration engine.
//!
//! Three layers:
//!
//! - [`CallError`]: outcome of one call against a target endpoint. This is the
//!   ONLY place HTTP statuses are interpreted.
//! - [`EvalError`]: outcome of an evaluator invocation.
//! - [`GateError`]: run control surface (admission, lookup, configuration).

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Transient failure flavours. All of them are eligible for retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransientKind {
    Timeout,
    Connection,
    Server,
    RateLimited,
}

/// Non-transient failure flavours: the request was at fault, not the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectKind {
    BadRequest,
    Unauthorized,
    NotFound,
    Protocol,
}

impl fmt::Display for TransientKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Timeout => "timeout",
            Self::Connection => "connection",
            Self::Server => "server",
            Self::RateLimited => "rate-limited",
        };
        f.write_str(s)
    }
}

impl fmt::Display for RejectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::BadRequest => "bad request",
            Self::Unauthorized => "unauthorized",
            Self::NotFound => "not found",
            Self::Protocol => "protocol",
        };
        f.write_str(s)
    }
}

/// Failure of a single (possibly retried) call to a target endpoint.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CallError {
    /// The endpoint's breaker is open; no network call was attempted.
    #[error("circuit open for {endpoint}: retry in {retry_in:?}")]
    CircuitOpen {
        endpoint: String,
        retry_in: Duration,
    },

    /// Retryable fault (timeout, connection, 5xx, 429).
    #[error("transient {kind} failure: {message}")]
    Transient {
        kind: TransientKind,
        message: String,
        status: Option<u16>,
        retry_after: Option<Duration>,
    },

    /// Caller/request fault. Never retried, never counted by the breaker.
    #[error("{kind}: {message}")]
    NonTransient {
        kind: RejectKind,
        message: String,
        status: Option<u16>,
    },

    /// Cooperative stop requested by the run.
    #[error("cancelled")]
    Cancelled,
}

impl CallError {
    pub fn transient(kind: TransientKind, message: impl Into<String>) -> Self {
        Self::Transient {
            kind,
            message: message.into(),
            status: None,
            retry_after: None,
        }
    }

    pub fn rejected(kind: RejectKind, message: impl Into<String>) -> Self {
        Self::NonTransient {
            kind,
            message: message.into(),
            status: None,
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::transient(TransientKind::Timeout, message)
    }

    /// Map an HTTP status (non-2xx) to the taxonomy.
    pub fn from_status(status: u16, body: impl Into<String>, retry_after: Option<Duration>) -> Self {
        let message = format!("HTTP {}: {}", status, body.into());
        match status {
            408 => Self::Transient {
                kind: TransientKind::Timeout,
                message,
                status: Some(status),
                retry_after: None,
            },
            429 => Self::Transient {
                kind: TransientKind::RateLimited,
                message,
                status: Some(status),
                retry_after,
            },
            500..=599 => Self::Transient {
                kind: TransientKind::Server,
                message,
                status: Some(status),
                retry_after: None,
            },
            401 | 403 => Self::NonTransient {
                kind: RejectKind::Unauthorized,
                message,
                status: Some(status),
            },
            404 => Self::NonTransient {
                kind: RejectKind::NotFound,
                message,
                status: Some(status),
            },
            _ => Self::NonTransient {
                kind: RejectKind::BadRequest,
                message,
                status: Some(status),
            },
        }
    }

    /// Whether the failure is retryable and counts toward the breaker threshold.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// HTTP status, when the failure came from a response.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Transient { status, .. } | Self::NonTransient { status, .. } => *status,
            _ => None,
        }
    }

    /// Stable machine-readable code, used in case results.
    pub fn code(&self) -> &'static str {
        match self {
            Self::CircuitOpen { .. } => "circuit_open",
            Self::Transient { kind, .. } => match kind {
                TransientKind::Timeout => "target_timeout",
                TransientKind::Connection => "target_connection",
                TransientKind::Server => "target_server",
                TransientKind::RateLimited => "target_rate_limited",
            },
            Self::NonTransient { kind, .. } => match kind {
                RejectKind::BadRequest => "bad_request",
                RejectKind::Unauthorized => "unauthorized",
                RejectKind::NotFound => "not_found",
                RejectKind::Protocol => "protocol",
            },
            Self::Cancelled => "cancelled",
        }
    }
}

impl From<reqwest::Error> for CallError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::transient(TransientKind::Timeout, err.to_string())
        } else if err.is_decode() {
            Self::rejected(RejectKind::Protocol, err.to_string())
        } else if let Some(status) = err.status() {
            Self::from_status(status.as_u16(), err.to_string(), None)
        } else {
            Self::transient(TransientKind::Connection, err.to_string())
        }
    }
}

/// Evaluator failure.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EvalError {
    /// A required optional dependency is missing. The case is skipped.
    #[error("evaluator unavailable: {reason}")]
    Unavailable { reason: String },

    /// The evaluator ran and failed. The case errors; the breaker is untouched.
    #[error("evaluator failed: {message}")]
    Failed { message: String },
}

/// Errors surfaced by the run control surface.
#[derive(Debug, thiserror::Error)]
pub enum GateError {
    /// Admission denied by a rate limiter. Not a run state.
    #[error("throttled: retry after {retry_after:?}")]
    Throttled { retry_after: Duration },

    #[error("run not found: {run_id}")]
    RunNotFound { run_id: String },

    /// The run is still executing and cannot be evicted.
    #[error("run still active: {run_id}")]
    RunActive { run_id: String },

    #[error("configuration error: {message}")]
    Config { message: String },

    #[error("invalid target: {message}")]
    InvalidTarget { message: String },

    #[error("invalid run request: {message}")]
    InvalidRequest { message: String },

    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl GateError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Exit code for CLI.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Throttled { .. } => 3,
            _ => 2,
        }
    }
}

/// Result type for run control operations.
pub type GateResult<T> = Result<T, GateError>;
