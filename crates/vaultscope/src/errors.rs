use serde::Serialize;
use std::fmt;
use thiserror::Error;

/// Coarse classification used by the retry policy and the endpoint pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    RateLimited,
    Transient,
    NotFound,
    Unavailable,
}

impl ErrorClass {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::RateLimited => "rate_limited",
            Self::Transient => "transient",
            Self::NotFound => "not_found",
            Self::Unavailable => "unavailable",
        }
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure of a single upstream interaction (RPC node or price API).
///
/// None of these are fatal to the caller: rate limits trigger rotation, transient errors are
/// retried, `NotFound` is "no data here" and `Unavailable` is a normal empty result once every
/// endpoint or the time budget is exhausted.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum UpstreamError {
    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("transient upstream error: {0}")]
    Transient(String),

    #[error("no data: {0}")]
    NotFound(String),

    #[error("unavailable after {after}: {message}")]
    Unavailable { after: ErrorClass, message: String },
}

const REVERT_MARKERS: &[&str] = &["execution reverted", "revert", "invalid opcode"];

const RATE_LIMIT_MARKERS: &[&str] = &[
    "429",
    "too many requests",
    "rate",
    "limit",
    "unauthorized",
    "forbidden",
    "401",
    "403",
];

impl UpstreamError {
    /// Classify an upstream failure from its rendered message.
    ///
    /// Revert markers win over rate-limit markers: a revert mentioning "limit" is still a revert.
    pub fn classify(message: impl Into<String>) -> Self {
        let message = message.into();
        let lower = message.to_lowercase();
        if REVERT_MARKERS.iter().any(|m| lower.contains(m)) {
            return Self::NotFound(message);
        }
        if RATE_LIMIT_MARKERS.iter().any(|m| lower.contains(m)) {
            return Self::RateLimited(message);
        }
        Self::Transient(message)
    }

    pub fn from_status(status: reqwest::StatusCode, context: &str) -> Self {
        let message = format!("{context}: http status {status}");
        match status.as_u16() {
            401 | 403 | 429 => Self::RateLimited(message),
            400 | 404 | 422 => Self::NotFound(message),
            _ => Self::Transient(message),
        }
    }

    pub fn unavailable(after: ErrorClass, message: impl Into<String>) -> Self {
        Self::Unavailable {
            after,
            message: message.into(),
        }
    }

    pub const fn class(&self) -> ErrorClass {
        match self {
            Self::RateLimited(_) => ErrorClass::RateLimited,
            Self::Transient(_) => ErrorClass::Transient,
            Self::NotFound(_) => ErrorClass::NotFound,
            Self::Unavailable { .. } => ErrorClass::Unavailable,
        }
    }

    pub const fn code(&self) -> &'static str {
        self.class().as_str()
    }

    /// The class of the failure that ultimately exhausted the retry budget, or the own class.
    pub const fn root_class(&self) -> ErrorClass {
        match self {
            Self::Unavailable { after, .. } => *after,
            Self::RateLimited(_) | Self::Transient(_) | Self::NotFound(_) => self.class(),
        }
    }
}

impl From<reqwest::Error> for UpstreamError {
    fn from(e: reqwest::Error) -> Self {
        if let Some(status) = e.status() {
            return Self::from_status(status, "http request");
        }
        if e.is_timeout() || e.is_connect() {
            return Self::Transient(format!("{e}"));
        }
        Self::classify(format!("{e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_rate_limit_signals() {
        for msg in [
            "HTTP error 429 Too Many Requests",
            "daily request limit exceeded",
            "401 Unauthorized",
            "403 Forbidden",
            "Rate exceeded",
        ] {
            assert_eq!(
                UpstreamError::classify(msg).class(),
                ErrorClass::RateLimited,
                "{msg}"
            );
        }
    }

    #[test]
    fn reverts_are_not_found_even_when_mentioning_limits() {
        let e = UpstreamError::classify("execution reverted: borrow limit");
        assert_eq!(e.class(), ErrorClass::NotFound);
    }

    #[test]
    fn everything_else_is_transient() {
        let e = UpstreamError::classify("connection reset by peer");
        assert_eq!(e.class(), ErrorClass::Transient);
        assert_eq!(e.code(), "transient");
    }

    #[test]
    fn unavailable_keeps_root_class() {
        let e = UpstreamError::unavailable(ErrorClass::RateLimited, "gave up");
        assert_eq!(e.class(), ErrorClass::Unavailable);
        assert_eq!(e.root_class(), ErrorClass::RateLimited);
        assert!(e.to_string().contains("rate_limited"));
    }
}
