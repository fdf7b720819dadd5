//! Shared error type used across all TempoOS crates.
//!
//! Each variant maps onto one wire-level error code so API handlers and SSE
//! error frames can translate without per-call-site tables.

/// Shared error type used across all TempoOS crates.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("flow not found: {0}")]
    FlowNotFound(String),

    #[error("node not found: {0}")]
    NodeNotFound(String),

    #[error("invalid transition: no rule from '{state}' on event '{event}'")]
    InvalidTransition { state: String, event: String },

    /// Atomic FSM advance lost the race beyond the retry budget.
    #[error("conflict: expected state '{expected}' but found '{current}'")]
    Conflict { expected: String, current: String },

    #[error("rate limited: {0}")]
    RateLimited(String),

    /// LLM / data service / object store failure.
    #[error("upstream {service}: {message}")]
    Upstream { service: String, message: String },

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("config: {0}")]
    Config(String),

    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Internal(String),
}

impl Error {
    /// Wire-level error code carried in API bodies and SSE `error` frames.
    pub fn code(&self) -> &'static str {
        match self {
            Error::BadRequest(_) => "BAD_REQUEST",
            Error::Unauthorized(_) => "UNAUTHORIZED",
            Error::Forbidden(_) => "FORBIDDEN",
            Error::SessionNotFound(_) => "SESSION_NOT_FOUND",
            Error::FlowNotFound(_) => "FLOW_NOT_FOUND",
            Error::NodeNotFound(_) => "NODE_NOT_FOUND",
            Error::InvalidTransition { .. } => "INVALID_TRANSITION",
            Error::Conflict { .. } => "CONFLICT",
            Error::RateLimited(_) => "RATE_LIMITED",
            Error::Upstream { .. } | Error::Timeout(_) => "UPSTREAM_ERROR",
            Error::Config(_) | Error::Io(_) | Error::Json(_) | Error::Internal(_) => {
                "INTERNAL_ERROR"
            }
        }
    }

    /// HTTP status for error responses emitted before a stream starts.
    pub fn http_status(&self) -> u16 {
        match self {
            Error::BadRequest(_) => 400,
            Error::Unauthorized(_) => 401,
            Error::Forbidden(_) => 403,
            Error::SessionNotFound(_) | Error::FlowNotFound(_) | Error::NodeNotFound(_) => 404,
            Error::InvalidTransition { .. } => 422,
            Error::Conflict { .. } => 409,
            Error::RateLimited(_) => 429,
            Error::Upstream { .. } | Error::Timeout(_) => 502,
            Error::Config(_) | Error::Io(_) | Error::Json(_) | Error::Internal(_) => 500,
        }
    }

    /// Whether a client may retry the same request unchanged.
    pub fn retryable(&self) -> bool {
        matches!(
            self,
            Error::Conflict { .. }
                | Error::RateLimited(_)
                | Error::Upstream { .. }
                | Error::Timeout(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
