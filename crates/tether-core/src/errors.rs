//! Failure taxonomy shared by every layer.
//!
//! Errors reported inside an otherwise well-formed upstream event and errors
//! raised while consuming the stream both end up in [`TurnFailure`], so the
//! client only ever sees a category tag.

use serde::{Deserialize, Serialize};

use crate::chunks::Chunk;

/// Stable category tag surfaced to the client.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCategory {
    AuthFailed,
    InvalidApiKey,
    RateLimit,
    Overloaded,
    ProcessCrash,
    ExecutableNotFound,
    NetworkError,
    EmptyResponse,
    Unknown,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AuthFailed => "AUTH_FAILED",
            Self::InvalidApiKey => "INVALID_API_KEY",
            Self::RateLimit => "RATE_LIMIT",
            Self::Overloaded => "OVERLOADED",
            Self::ProcessCrash => "PROCESS_CRASH",
            Self::ExecutableNotFound => "EXECUTABLE_NOT_FOUND",
            Self::NetworkError => "NETWORK_ERROR",
            Self::EmptyResponse => "EMPTY_RESPONSE",
            Self::Unknown => "UNKNOWN",
        }
    }

    /// Auth failures are answered with a re-authentication flow instead of a
    /// plain error toast.
    pub fn is_auth(&self) -> bool {
        matches!(self, Self::AuthFailed | Self::InvalidApiKey)
    }

    pub fn notification(&self) -> Notification {
        let (title, message) = match self {
            Self::AuthFailed => (
                "Not signed in",
                "Sign in again and your message will be sent automatically.",
            ),
            Self::InvalidApiKey => (
                "Invalid API key",
                "Check the configured API key, then retry.",
            ),
            Self::RateLimit => (
                "Rate limited",
                "Too many requests. Wait a moment before sending again.",
            ),
            Self::Overloaded => (
                "Service overloaded",
                "The model is at capacity right now. Try again shortly.",
            ),
            Self::ProcessCrash => (
                "Agent crashed",
                "The agent process exited unexpectedly. Partial output was saved.",
            ),
            Self::ExecutableNotFound => (
                "Agent not installed",
                "The agent executable could not be found on this machine.",
            ),
            Self::NetworkError => (
                "Network error",
                "Could not reach the model provider. Check your connection.",
            ),
            Self::EmptyResponse => (
                "No response",
                "The agent finished without producing any output.",
            ),
            Self::Unknown => ("Something went wrong", "The request failed."),
        };
        Notification {
            category: *self,
            title: title.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// User-facing notification derived from a category.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub category: ErrorCategory,
    pub title: String,
    pub message: String,
}

struct ErrorPattern {
    check: fn(&str) -> bool,
    category: ErrorCategory,
}

/// Known patterns, checked in order against the lowercased text.
fn patterns() -> &'static [ErrorPattern] {
    static PATTERNS: &[ErrorPattern] = &[
        ErrorPattern {
            check: |s| {
                s.contains("invalid api key")
                    || s.contains("invalid_api_key")
                    || s.contains("invalid x-api-key")
                    || (s.contains("api key") && s.contains("invalid"))
            },
            category: ErrorCategory::InvalidApiKey,
        },
        ErrorPattern {
            check: |s| {
                s.contains("authentication_failed")
                    || s.contains("authentication_error")
                    || s.contains("authentication failed")
                    || s.contains("not authenticated")
                    || s.contains("not logged in")
                    || s.contains("/login")
                    || s.contains("oauth token has expired")
                    || s.contains("unauthorized")
                    || has_status(s, "401")
            },
            category: ErrorCategory::AuthFailed,
        },
        ErrorPattern {
            check: |s| {
                s.contains("rate_limit")
                    || s.contains("rate limit")
                    || s.contains("too many requests")
                    || has_status(s, "429")
            },
            category: ErrorCategory::RateLimit,
        },
        ErrorPattern {
            check: |s| s.contains("overloaded") || s.contains("at capacity") || has_status(s, "529"),
            category: ErrorCategory::Overloaded,
        },
        ErrorPattern {
            check: |s| {
                s.contains("enoent")
                    || s.contains("command not found")
                    || s.contains("executable not found")
            },
            category: ErrorCategory::ExecutableNotFound,
        },
        ErrorPattern {
            check: |s| {
                s.contains("process exited")
                    || s.contains("exited with code")
                    || s.contains("sigkill")
                    || s.contains("sigterm")
                    || s.contains("crashed")
            },
            category: ErrorCategory::ProcessCrash,
        },
        ErrorPattern {
            check: |s| {
                s.contains("econnrefused")
                    || s.contains("econnreset")
                    || s.contains("etimedout")
                    || s.contains("enotfound")
                    || s.contains("fetch failed")
                    || s.contains("socket hang up")
                    || s.contains("network error")
                    || s.contains("network is unreachable")
                    || s.contains("connection refused")
                    || s.contains("connection reset")
                    || s.contains("connection closed")
                    || s.contains("connection timed out")
                    || s.contains("connection error")
            },
            category: ErrorCategory::NetworkError,
        },
    ];
    PATTERNS
}

/// True when `code` appears as a standalone token, so ids such as
/// `req_4013x` do not read as a status.
fn has_status(s: &str, code: &str) -> bool {
    let is_word = |c: char| c.is_ascii_alphanumeric() || c == '_';
    s.match_indices(code).any(|(at, _)| {
        let before = s[..at].chars().next_back();
        let after = s[at + code.len()..].chars().next();
        !before.is_some_and(is_word) && !after.is_some_and(is_word)
    })
}

/// Map free-form provider or process text onto a category.
pub fn classify_error_text(text: &str) -> ErrorCategory {
    let lowered = text.to_lowercase();
    patterns()
        .iter()
        .find(|p| (p.check)(&lowered))
        .map(|p| p.category)
        .unwrap_or(ErrorCategory::Unknown)
}

/// Failures raised by an upstream agent transport.
#[derive(Clone, Debug, thiserror::Error)]
pub enum UpstreamError {
    #[error("executable not found: {0}")]
    ExecutableNotFound(String),

    #[error("failed to spawn agent: {0}")]
    Spawn(String),

    #[error("agent process exited with code {code:?}: {stderr}")]
    ProcessExited { code: Option<i32>, stderr: String },

    #[error("network error: {0}")]
    Network(String),

    #[error("io error: {0}")]
    Io(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("{0}")]
    Provider(String),

    #[error("cancelled")]
    Cancelled,
}

impl UpstreamError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::ExecutableNotFound(_) => ErrorCategory::ExecutableNotFound,
            Self::Network(_) => ErrorCategory::NetworkError,
            // A crashing CLI often explains itself on stderr; prefer that.
            Self::ProcessExited { stderr, .. } => match classify_error_text(stderr) {
                ErrorCategory::Unknown | ErrorCategory::ProcessCrash => ErrorCategory::ProcessCrash,
                other => other,
            },
            Self::Spawn(msg) => match classify_error_text(msg) {
                ErrorCategory::Unknown => ErrorCategory::ProcessCrash,
                other => other,
            },
            Self::Io(msg) | Self::Provider(msg) => classify_error_text(msg),
            Self::Protocol(_) | Self::Cancelled => ErrorCategory::Unknown,
        }
    }
}

/// A classified turn failure. Exactly one of these is surfaced per failed turn.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TurnFailure {
    pub category: ErrorCategory,
    pub message: String,
}

impl TurnFailure {
    pub fn new(category: ErrorCategory, message: impl Into<String>) -> Self {
        Self {
            category,
            message: message.into(),
        }
    }

    pub fn from_text(text: impl Into<String>) -> Self {
        let message = text.into();
        Self {
            category: classify_error_text(&message),
            message,
        }
    }

    pub fn from_upstream(error: &UpstreamError) -> Self {
        Self {
            category: error.category(),
            message: error.to_string(),
        }
    }

    pub fn empty_response() -> Self {
        Self::new(
            ErrorCategory::EmptyResponse,
            "Agent stream ended without producing any events",
        )
    }

    pub fn is_auth(&self) -> bool {
        self.category.is_auth()
    }

    pub fn to_chunk(&self) -> Chunk {
        if self.is_auth() {
            Chunk::AuthError {
                error_text: self.message.clone(),
                category: self.category,
            }
        } else {
            Chunk::Error {
                error_text: self.message.clone(),
                category: self.category,
            }
        }
    }
}
