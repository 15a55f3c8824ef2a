//! Error types for the session core
//!
//! Construction-time failures are returned synchronously and never touch
//! shared state. Asynchronous failures (refusals, storms, lost connections)
//! travel on the state-change notification stream instead; [`SessionError`]
//! still names them so consumers can surface them uniformly.

use crate::engine::EngineError;
use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

/// Main error type for session and connection-manager operations
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Invalid port: {0}")]
    InvalidPort(String),

    #[error("A connection attempt is already in progress")]
    AlreadyConnecting,

    #[error("Already connected")]
    AlreadyConnected,

    #[error("Protocol engine could not be created")]
    EngineCreateFailed(#[source] EngineError),

    #[error("Protocol engine unavailable or already torn down")]
    EngineUnavailable,

    #[error("Engine request failed: {0}")]
    Engine(#[from] EngineError),

    #[error("Connection refused (code {code}): {reason}")]
    ConnectRefused { code: u8, reason: String },

    #[error("Reconnect storm detected after {disconnects} disconnects, connection closed")]
    StormDetected { disconnects: u32 },

    #[error("No active session")]
    NotConnected,

    #[error("Invalid topic: {0:?}")]
    InvalidTopic(String),
}

impl SessionError {
    /// True for failures that arrive asynchronously from the broker side
    pub fn is_async(&self) -> bool {
        matches!(
            self,
            SessionError::ConnectRefused { .. } | SessionError::StormDetected { .. }
        )
    }
}

/// Result type for session operations
pub type SessionResult<T> = Result<T, SessionError>;

static SECRET_PATTERN: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"(?i)(password|passwd|token|key|secret)[=:]\s*\S+").ok());

const MAX_REASON_LEN: usize = 500;
const TRUNCATE_SUFFIX: &str = "...[truncated]";

/// Mask credentials and cap the length of human-readable reasons before they
/// are logged or handed to consumers
pub fn sanitize_reason(reason: &str) -> String {
    let mut sanitized = match SECRET_PATTERN.as_ref() {
        Some(pattern) => pattern.replace_all(reason, "${1}=***").to_string(),
        None => reason.to_string(),
    };

    if sanitized.len() > MAX_REASON_LEN {
        let mut cut = MAX_REASON_LEN - TRUNCATE_SUFFIX.len();
        while !sanitized.is_char_boundary(cut) {
            cut -= 1;
        }
        sanitized.truncate(cut);
        sanitized.push_str(TRUNCATE_SUFFIX);
    }

    sanitized
}
