//! Error taxonomy for a sync run.
//!
//! Errors are scoped: auth failures abort the whole run, fetch failures abort
//! one (date, market) partition, and transform failures drop one record.

use crate::credentials::UpstreamApi;
use std::time::Duration;
use thiserror::Error;

/// Errors raised while authenticating, fetching or transforming upstream data.
#[derive(Debug, Clone, Error)]
pub enum SyncError {
    /// Token exchange rejected (bad credentials, revoked access). Aborts the run.
    #[error("{api} token exchange rejected: {reason}")]
    Auth { api: UpstreamApi, reason: String },

    /// Token exchange hit a network error or a 5xx/429.
    #[error("{api} token exchange failed transiently: {reason}")]
    TransientAuth { api: UpstreamApi, reason: String },

    /// Upstream returned HTTP 429.
    #[error("{api} rate limit exceeded (retry after {retry_after:?})")]
    RateLimit {
        api: UpstreamApi,
        retry_after: Option<Duration>,
    },

    /// Data endpoint rejected the bearer token (401). The cached token is
    /// invalidated before this is returned, so a retry re-authenticates.
    #[error("{api} rejected the bearer token")]
    Unauthorized { api: UpstreamApi },

    /// Non-success HTTP status other than 401/429.
    #[error("{api} returned HTTP {status}: {body}")]
    Upstream {
        api: UpstreamApi,
        status: u16,
        body: String,
    },

    /// Connection, timeout or body read failure.
    #[error("network error talking to {api}: {reason}")]
    Network { api: UpstreamApi, reason: String },

    /// Response body did not match the expected shape.
    #[error("malformed {api} response: {reason}")]
    Decode { api: UpstreamApi, reason: String },

    #[error("unknown market code '{0}'")]
    UnknownMarket(String),

    #[error("unmapped ad format '{0}'")]
    UnmappedChannel(String),

    /// Record violates a row invariant (negative figures, split mismatch).
    #[error("inconsistent record: {0}")]
    InconsistentRecord(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("sink error: {0}")]
    Sink(String),
}

impl SyncError {
    /// Whether the retry loop may attempt the operation again.
    ///
    /// 5xx responses are transient; every other HTTP status is not.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::TransientAuth { .. }
            | SyncError::RateLimit { .. }
            | SyncError::Unauthorized { .. }
            | SyncError::Network { .. } => true,
            SyncError::Upstream { status, .. } => *status >= 500,
            _ => false,
        }
    }

    /// Whether no partition can proceed after this error.
    pub fn is_run_fatal(&self) -> bool {
        matches!(self, SyncError::Auth { .. })
    }
}
