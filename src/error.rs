//! Error taxonomy for the worker.
//!
//! [`PlatformError`] covers failures of a single messaging-platform call and
//! decides what the retry wrapper may repeat.  [`WorkerError`] is what the
//! dispatch boundary reports to the parent; every variant maps to a stable
//! `kind` string carried in the outbound `error` event.

use thiserror::Error;

/// Failure of one call against the messaging platform.
#[derive(Debug, Clone, Error)]
pub enum PlatformError {
    /// The credential was rejected (401, or 404 on a token-scoped URL).
    #[error("platform rejected the bot credential: {0}")]
    Auth(String),
    /// Another consumer holds the update subscription (HTTP 409).
    #[error("platform subscription conflict: {0}")]
    Conflict(String),
    /// Non-retryable API error with the platform's own description.
    #[error("platform API returned {code}: {description}")]
    Api { code: u16, description: String },
    /// Network failure, 5xx, or rate limit. `retry_after` is in seconds.
    #[error("transient platform failure: {message}")]
    Transient {
        message: String,
        retry_after: Option<u64>,
    },
    /// The response body could not be decoded.
    #[error("failed to decode platform response: {0}")]
    Decode(String),
}

impl PlatformError {
    pub fn is_transient(&self) -> bool {
        matches!(self, PlatformError::Transient { .. })
    }

    /// The platform refused the call with a retry hint, so nothing was done.
    pub fn is_rate_limited(&self) -> bool {
        matches!(
            self,
            PlatformError::Transient {
                retry_after: Some(_),
                ..
            }
        )
    }

    pub fn transient(message: impl Into<String>) -> Self {
        PlatformError::Transient {
            message: message.into(),
            retry_after: None,
        }
    }
}

impl From<reqwest::Error> for PlatformError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            PlatformError::Decode(e.to_string())
        } else {
            // Connect, timeout, body and request errors are all worth a retry.
            PlatformError::transient(e.to_string())
        }
    }
}

/// Errors surfaced by worker operations.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("setup failed: {0}")]
    Setup(String),
    #[error("network error: {0}")]
    TransientNetwork(String),
    #[error("control channel closed")]
    ChannelClosed,
    #[error("dialog bridge error: {0}")]
    DialogBridge(String),
    #[error("invalid command: {0}")]
    InvalidCommand(String),
    #[error("command not allowed in state `{state}`: {command}")]
    InvalidState { state: String, command: String },
    #[error("hot reload rejected: {0}")]
    Reload(String),
}

impl WorkerError {
    /// Stable identifier used in the `error` event payload.
    pub fn kind(&self) -> &'static str {
        match self {
            WorkerError::Auth(_) => "auth_error",
            WorkerError::Setup(_) => "setup_error",
            WorkerError::TransientNetwork(_) => "transient_network_error",
            WorkerError::ChannelClosed => "channel_closed",
            WorkerError::DialogBridge(_) => "dialog_bridge_error",
            WorkerError::InvalidCommand(_) => "invalid_command",
            WorkerError::InvalidState { .. } => "invalid_state",
            WorkerError::Reload(_) => "reload_error",
        }
    }

    /// Whether this error leaves the worker in the `Failed` state.
    pub fn is_fatal(&self) -> bool {
        matches!(self, WorkerError::Auth(_) | WorkerError::Setup(_))
    }
}

impl From<PlatformError> for WorkerError {
    fn from(e: PlatformError) -> Self {
        match e {
            PlatformError::Auth(msg) => WorkerError::Auth(msg),
            PlatformError::Transient { message, .. } => WorkerError::TransientNetwork(message),
            other => WorkerError::Setup(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn platform_auth_maps_to_fatal_auth() {
        let e: WorkerError = PlatformError::Auth("Unauthorized".into()).into();
        assert_eq!(e.kind(), "auth_error");
        assert!(e.is_fatal());
    }

    #[test]
    fn transient_is_not_fatal() {
        let e: WorkerError = PlatformError::transient("connection reset").into();
        assert_eq!(e.kind(), "transient_network_error");
        assert!(!e.is_fatal());
    }
}
