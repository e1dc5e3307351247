use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Index member identifier, upper-case normalized.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Symbol(String);

impl Symbol {
    pub fn new(raw: &str) -> Self {
        Self(raw.trim().to_uppercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Price feeds use dashes where the index listing uses dots (BRK.B -> BRK-B).
    pub fn price_feed_symbol(&self) -> String {
        self.0.replace('.', "-")
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Symbol {
    fn from(raw: &str) -> Self {
        Self::new(raw)
    }
}

/// One tracked index member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entity {
    pub symbol: Symbol,
    pub name: String,
}

impl Entity {
    pub fn new(symbol: &str, name: &str) -> Self {
        Self {
            symbol: Symbol::new(symbol),
            name: name.to_string(),
        }
    }
}

/// One daily price bar. `date` is the start of the session's calendar day in
/// the reference time zone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceBar {
    pub date: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: u64,
    #[serde(default)]
    pub dividends: f64,
    #[serde(default)]
    pub splits: f64,
}

/// Bars on either side of one event, with the derived change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceReactionRow {
    pub event: DateTime<Utc>,
    pub pre: PriceBar,
    pub post: PriceBar,
    pub point_change: f64,
    /// `None` when the pre-event close is zero or not finite.
    pub percent_change: Option<f64>,
}

/// Rows in the same order as the record's historical events. An empty table is
/// a valid, fully-typed value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PriceReactionTable {
    pub rows: Vec<PriceReactionRow>,
}

impl PriceReactionTable {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Mean absolute point and percent change over the most recent events.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Aggregate {
    pub point_avg: f64,
    pub percent_avg: Option<f64>,
}

/// Upcoming report state. `Unknown` means never fetched; `NoneScheduled`
/// means the source was asked and had nothing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NextEvent {
    #[default]
    Unknown,
    NoneScheduled,
    Scheduled(DateTime<Utc>),
}

impl NextEvent {
    pub fn from_fetch(value: Option<DateTime<Utc>>) -> Self {
        match value {
            Some(ts) => Self::Scheduled(ts),
            None => Self::NoneScheduled,
        }
    }

    pub fn scheduled(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Scheduled(ts) => Some(*ts),
            _ => None,
        }
    }

    /// True when the value cannot be trusted at `now`.
    pub fn needs_refresh(&self, now: DateTime<Utc>) -> bool {
        match self {
            Self::Scheduled(ts) => *ts <= now,
            _ => true,
        }
    }

    /// A report date that has already passed.
    pub fn has_passed(&self, now: DateTime<Utc>) -> bool {
        matches!(self, Self::Scheduled(ts) if *ts < now)
    }
}

/// Descriptive text state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Detail {
    #[default]
    Pending,
    /// A fetch was started and did not complete.
    Attempted,
    /// Fetched; the text may legitimately be empty.
    Fetched(String),
}

impl Detail {
    pub fn is_fetched(&self) -> bool {
        matches!(self, Self::Fetched(_))
    }

    pub fn text(&self) -> &str {
        match self {
            Self::Fetched(text) => text,
            _ => "",
        }
    }
}

/// Persisted state for one entity.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EntityRecord {
    /// `None` until the history has been fetched once.
    pub historical_events: Option<Vec<DateTime<Utc>>>,
    #[serde(default)]
    pub next_event: NextEvent,
    pub price_reaction_table: Option<PriceReactionTable>,
    /// Derived from the table; never written to the snapshot.
    #[serde(skip)]
    pub aggregate: Option<Aggregate>,
    #[serde(default)]
    pub detail: Detail,
}

impl EntityRecord {
    pub fn needs_price_backfill(&self) -> bool {
        self.historical_events.is_some() && self.price_reaction_table.is_none()
    }

    /// Install a table and its aggregate together.
    pub fn set_price_table(&mut self, table: PriceReactionTable, window: usize) {
        self.aggregate = crate::stats::aggregate(&table, window);
        self.price_reaction_table = Some(table);
    }

    pub fn clear_price_table(&mut self) {
        self.price_reaction_table = None;
        self.aggregate = None;
    }

    pub fn recompute_aggregate(&mut self, window: usize) {
        self.aggregate = self
            .price_reaction_table
            .as_ref()
            .and_then(|table| crate::stats::aggregate(table, window));
    }
}

/// Active membership plus the per-symbol records.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Dataset {
    pub entities: Vec<Entity>,
    pub records: BTreeMap<Symbol, EntityRecord>,
}

impl Dataset {
    pub fn record(&self, symbol: &Symbol) -> Option<&EntityRecord> {
        self.records.get(symbol)
    }

    pub fn entity(&self, symbol: &Symbol) -> Option<&Entity> {
        self.entities.iter().find(|e| &e.symbol == symbol)
    }

    pub fn recompute_aggregates(&mut self, window: usize) {
        for record in self.records.values_mut() {
            record.recompute_aggregate(window);
        }
    }
}
