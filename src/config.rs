//! Tracker configuration
//!
//! Loaded from a TOML file, then overridden from the environment.

use anyhow::{bail, Context};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::batch::BatchRunner;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Snapshot Store file
    pub snapshot_path: PathBuf,

    /// Local constituents file (JSON array of `{symbol, name}`). When set it
    /// replaces the network membership fetch.
    pub universe_path: Option<PathBuf>,

    /// Worker pool size per batch
    pub max_workers: usize,

    /// Wall-clock deadline per batch (seconds)
    pub batch_timeout_secs: u64,

    /// Past events kept per entity
    pub event_history_cap: usize,

    /// Rows averaged by the aggregate
    pub aggregate_window: usize,

    /// Days fetched on each side of the event range
    pub price_padding_days: i64,

    /// IANA zone used for calendar-day boundaries
    pub reference_timezone: String,

    /// Re-fetch event history when a scheduled report has passed
    pub refresh_history_after_report: bool,

    pub http: HttpConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            snapshot_path: PathBuf::from("earnings_snapshot.db"),
            universe_path: None,
            max_workers: 8,
            batch_timeout_secs: 300,
            event_history_cap: 10,
            aggregate_window: 10,
            price_padding_days: 10,
            reference_timezone: "America/New_York".to_string(),
            refresh_history_after_report: false,
            http: HttpConfig::default(),
        }
    }
}

/// Upstream endpoints. `{symbol}` is substituted per request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub request_timeout_secs: u64,
    pub connect_timeout_secs: u64,
    pub user_agent: String,
    pub membership_url: String,
    pub earnings_url: String,
    pub next_event_url: String,
    pub description_url: String,
    pub price_url: String,
    pub quote_url: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: 27,
            connect_timeout_secs: 5,
            user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
                         (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36"
                .to_string(),
            membership_url: "https://en.wikipedia.org/wiki/List_of_S%26P_500_companies"
                .to_string(),
            earnings_url: "https://www.zacks.com/stock/research/{symbol}/earnings-announcements"
                .to_string(),
            next_event_url: "https://www.zacks.com/stock/quote/{symbol}/detailed-estimates"
                .to_string(),
            description_url: "https://www.marketwatch.com/investing/stock/{symbol}".to_string(),
            price_url: "https://query1.finance.yahoo.com/v8/finance/chart/{symbol}".to_string(),
            quote_url: "https://quote-feed.zacks.com/".to_string(),
        }
    }
}

impl AppConfig {
    /// Load from TOML file
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {:?}", path))?;
        let config: Self = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config {:?}", path))?;
        Ok(config)
    }

    /// Load from TOML file, or defaults when the file does not exist.
    /// A file that exists but cannot be read or parsed is an error.
    pub fn load_or_default(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        match std::fs::metadata(path) {
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!("No config at {:?}, using defaults", path);
                Ok(Self::default())
            }
            _ => Self::load(path),
        }
    }

    /// Config file (or defaults) plus environment overrides.
    pub fn from_env() -> anyhow::Result<Self> {
        let path =
            std::env::var("EARNINGS_CONFIG_PATH").unwrap_or_else(|_| "earnings.toml".to_string());

        let mut config = Self::load_or_default(&path)?;
        config.apply_env();
        Ok(config)
    }

    fn apply_env(&mut self) {
        if let Ok(path) = std::env::var("EARNINGS_SNAPSHOT_PATH") {
            self.snapshot_path = PathBuf::from(path);
        }
        if let Ok(path) = std::env::var("EARNINGS_UNIVERSE_PATH") {
            self.universe_path = Some(PathBuf::from(path));
        }
        if let Ok(v) = std::env::var("EARNINGS_MAX_WORKERS") {
            if let Ok(n) = v.parse() {
                self.max_workers = n;
            }
        }
        if let Ok(v) = std::env::var("EARNINGS_BATCH_TIMEOUT_SECS") {
            if let Ok(secs) = v.parse() {
                self.batch_timeout_secs = secs;
            }
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_workers == 0 {
            bail!("max_workers must be at least 1");
        }
        if self.batch_timeout_secs == 0 {
            bail!("batch_timeout_secs must be positive");
        }
        if self.event_history_cap == 0 || self.aggregate_window == 0 {
            bail!("event_history_cap and aggregate_window must be positive");
        }
        if self.price_padding_days < 0 {
            bail!("price_padding_days cannot be negative");
        }
        self.timezone()?;
        Ok(())
    }

    pub fn timezone(&self) -> anyhow::Result<Tz> {
        self.reference_timezone
            .parse::<Tz>()
            .map_err(|e| anyhow::anyhow!("Unknown reference_timezone {:?}: {}", self.reference_timezone, e))
    }

    pub fn batch_runner(&self) -> BatchRunner {
        BatchRunner::new(self.max_workers, Duration::from_secs(self.batch_timeout_secs))
    }
}
