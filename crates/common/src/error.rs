use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Error type shared by every component of the scraping core.
///
/// Variants are grouped so callers can tell "stale, ignore" (`Cancelled`)
/// from "failed, maybe alert" (everything else) and "install problem"
/// (`BrowserLaunch`) from a transient site failure.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ScrapeError {
    /// Job was superseded by a newer request from the same user.
    #[error("job cancelled: {0}")]
    Cancelled(String),

    /// No browser instance became available within the acquire window.
    #[error("timed out after {0:?} waiting for a browser instance")]
    AcquireTimeout(Duration),

    /// Connection pool admission queue is full.
    #[error("connection pool admission queue is full ({0} waiting)")]
    QueueOverflow(usize),

    /// Target site answered with a non-success status.
    #[error("upstream returned HTTP {status} for {url}")]
    UpstreamStatus { status: u16, url: String },

    /// Transport-level failure (DNS, connect, TLS, reset).
    #[error("network error: {0}")]
    Network(String),

    /// Request exceeded its deadline.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// Response arrived but did not contain what we expected.
    #[error("could not parse upstream content: {0}")]
    Parse(String),

    /// Browser process could not be started. Retrying will not help.
    #[error("browser launch failed: {0}")]
    BrowserLaunch(String),

    /// A running browser session failed (navigation, evaluation, dead tab).
    #[error("browser session error: {0}")]
    Browser(String),

    #[error("cache error: {0}")]
    Cache(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("internal error: {0}")]
    Internal(String),
}

/// Coarse classification surfaced to callers alongside the message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Cancelled,
    ResourceExhausted,
    Upstream,
    Fatal,
    Internal,
}

impl ScrapeError {
    pub fn cancelled(reason: impl Into<String>) -> Self {
        Self::Cancelled(reason.into())
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled(_))
    }

    /// Fatal errors are propagated immediately and never retried.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::BrowserLaunch(_) | Self::Config(_))
    }

    /// Whether the owner of a retry budget should try again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::AcquireTimeout(_)
                | Self::QueueOverflow(_)
                | Self::UpstreamStatus { .. }
                | Self::Network(_)
                | Self::Timeout(_)
                | Self::Parse(_)
                | Self::Browser(_)
        )
    }

    pub fn kind(&self) -> FailureKind {
        match self {
            Self::Cancelled(_) => FailureKind::Cancelled,
            Self::AcquireTimeout(_) | Self::QueueOverflow(_) => FailureKind::ResourceExhausted,
            Self::UpstreamStatus { .. }
            | Self::Network(_)
            | Self::Timeout(_)
            | Self::Parse(_)
            | Self::Browser(_) => FailureKind::Upstream,
            Self::BrowserLaunch(_) | Self::Config(_) => FailureKind::Fatal,
            Self::Cache(_) | Self::Internal(_) => FailureKind::Internal,
        }
    }
}

pub type ScrapeResult<T> = Result<T, ScrapeError>;
