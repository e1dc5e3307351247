//! Upstream data sources.
//!
//! The reconciler only sees the `EarningsSource` trait. Each call can fail on
//! its own; failures come back as `FetchError` values and the batch runner
//! decides what to do with them.

pub mod http;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use std::collections::BTreeMap;
use std::fmt;

use crate::models::{Entity, PriceBar, Symbol};

pub use http::HttpSource;

pub type FetchResult<T> = Result<T, FetchError>;

#[derive(Debug)]
pub enum FetchError {
    /// Transport failure (DNS, connect, reset, TLS).
    Network(String),
    /// The request exceeded its own timeout.
    Timeout,
    /// Upstream answered with a non-success status.
    Status(u16),
    /// Upstream answered, but the payload no longer has the expected shape.
    SourceFormat(String),
    /// Local input (membership file) could not be read.
    Io(std::io::Error),
}

impl FetchError {
    pub fn format(msg: impl Into<String>) -> Self {
        Self::SourceFormat(msg.into())
    }

    /// Transient errors are retried implicitly on the next run.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Network(_) | Self::Timeout | Self::Status(_))
    }
}

impl fmt::Display for FetchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Network(e) => write!(f, "network error: {}", e),
            Self::Timeout => write!(f, "request timed out"),
            Self::Status(code) => write!(f, "upstream status {}", code),
            Self::SourceFormat(e) => write!(f, "unexpected source format: {}", e),
            Self::Io(e) => write!(f, "io error: {}", e),
        }
    }
}

impl std::error::Error for FetchError {}

impl From<reqwest::Error> for FetchError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::Timeout
        } else if let Some(status) = e.status() {
            Self::Status(status.as_u16())
        } else if e.is_decode() {
            Self::SourceFormat(e.to_string())
        } else {
            Self::Network(e.to_string())
        }
    }
}

impl From<serde_json::Error> for FetchError {
    fn from(e: serde_json::Error) -> Self {
        Self::SourceFormat(e.to_string())
    }
}

impl From<std::io::Error> for FetchError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

/// Everything the reconciler needs from the outside world.
#[async_trait]
pub trait EarningsSource: Send + Sync {
    /// Current index membership, sorted by symbol.
    async fn list_active_entities(&self) -> FetchResult<Vec<Entity>>;

    /// Past report timestamps, as returned by the source.
    async fn fetch_historical_events(&self, symbol: &Symbol) -> FetchResult<Vec<DateTime<Utc>>>;

    /// Next scheduled report, if the source knows one.
    async fn fetch_next_event(&self, symbol: &Symbol) -> FetchResult<Option<DateTime<Utc>>>;

    /// Company description; an empty string is a valid answer.
    async fn fetch_description(&self, symbol: &Symbol) -> FetchResult<String>;

    /// Daily bars covering `[start, end]`, ordered by date.
    async fn fetch_price_series(
        &self,
        symbol: &Symbol,
        start: NaiveDate,
        end: NaiveDate,
    ) -> FetchResult<Vec<PriceBar>>;

    /// Last traded price per symbol; `None` where unavailable. Never fails.
    async fn fetch_current_quote(&self, symbols: &[Symbol]) -> BTreeMap<Symbol, Option<f64>>;
}
