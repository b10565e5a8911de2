//! Failure classification for completion calls
//!
//! Every failed attempt against the completion service is tagged with a
//! [`FailureClass`]. The retry executor and the session orchestrator decide
//! what to do purely from that tag.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Classification of a failed completion attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    /// Throttled by the service (HTTP 429)
    RateLimited,
    /// Network trouble, timeouts, 5xx responses
    TransientConnection,
    /// Malformed request, auth failure, any other 4xx
    ClientRejected,
    /// The request exceeded the service's context window
    ContextTooLarge,
    /// The caller cancelled the exchange
    Cancelled,
}

impl FailureClass {
    /// Whether the retry executor may re-attempt after this failure
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::RateLimited | Self::TransientConnection)
    }

    /// Classify an HTTP status plus response body.
    ///
    /// The body is consulted because most OpenAI-compatible services report
    /// context overflow as a plain 400.
    pub fn from_status(status: u16, body: &str) -> Self {
        match status {
            429 => Self::RateLimited,
            413 => Self::ContextTooLarge,
            408 | 500..=599 => Self::TransientConnection,
            400..=499 if mentions_context_overflow(body) => Self::ContextTooLarge,
            _ => Self::ClientRejected,
        }
    }
}

impl fmt::Display for FailureClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::RateLimited => "rate limited",
            Self::TransientConnection => "transient connection failure",
            Self::ClientRejected => "client request rejected",
            Self::ContextTooLarge => "context too large",
            Self::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

static CONTEXT_OVERFLOW: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)(context[_ ]length[_ ]exceeded|maximum context length|context window|too many tokens|tokens_limit_reached|request too large|prompt is too long)",
    )
    .expect("context overflow pattern is valid")
});

/// Whether an error body describes an oversized request
pub fn mentions_context_overflow(body: &str) -> bool {
    CONTEXT_OVERFLOW.is_match(body)
}

/// A classified failure from the completion service
#[derive(Debug, Clone, thiserror::Error)]
#[error("{class}: {message}")]
pub struct CompletionError {
    /// Failure class driving retry and recovery
    pub class: FailureClass,
    /// Human-readable description
    pub message: String,
    /// HTTP status when the failure came from a response
    pub status: Option<u16>,
    /// Server-suggested wait, if one was sent
    pub retry_after: Option<Duration>,
}

impl CompletionError {
    /// Create a new classified error
    pub fn new(class: FailureClass, message: impl Into<String>) -> Self {
        Self {
            class,
            message: message.into(),
            status: None,
            retry_after: None,
        }
    }

    /// Build from an HTTP error response
    pub fn from_response(status: u16, body: impl Into<String>) -> Self {
        let body = body.into();
        Self {
            class: FailureClass::from_status(status, &body),
            message: body,
            status: Some(status),
            retry_after: None,
        }
    }

    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self::new(FailureClass::RateLimited, message)
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(FailureClass::TransientConnection, message)
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        Self::new(FailureClass::ClientRejected, message)
    }

    pub fn context_too_large(message: impl Into<String>) -> Self {
        Self::new(FailureClass::ContextTooLarge, message)
    }

    pub fn cancelled() -> Self {
        Self::new(FailureClass::Cancelled, "exchange cancelled by caller")
    }

    /// Attach a server-suggested retry delay
    pub fn with_retry_after(mut self, delay: Duration) -> Self {
        self.retry_after = Some(delay);
        self
    }

    pub fn is_retryable(&self) -> bool {
        self.class.is_retryable()
    }
}

impl From<reqwest::Error> for CompletionError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() || err.is_request() || err.is_body() {
            return Self::transient(err.to_string());
        }
        match err.status() {
            Some(status) => Self::from_response(status.as_u16(), err.to_string()),
            None if err.is_decode() => Self::rejected(err.to_string()),
            None => Self::transient(err.to_string()),
        }
    }
}
