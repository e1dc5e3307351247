//! Read-side view of a reconciled dataset for display consumers.
//!
//! All lookups normalize the symbol first, so `"aapl"` and `"AAPL"` resolve to
//! the same record. Nothing here fetches or mutates; a stale next-report date
//! is reported as [`UpcomingEvent::Stale`] and left for the next update run.

use chrono::{DateTime, Utc};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::str::FromStr;

use crate::models::{Aggregate, Dataset, EntityRecord, NextEvent, Symbol};
use crate::source::EarningsSource;

/// One row of the per-event change view.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeRow {
    pub event: DateTime<Utc>,
    pub close_pre: f64,
    pub close_post: f64,
    pub percent_change: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpcomingEvent {
    Scheduled(DateTime<Utc>),
    NoneScheduled,
    /// Never fetched, or the stored date is not after `now`.
    Stale,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SummarySort {
    #[default]
    Percent,
    NextEvent,
    Symbol,
}

impl FromStr for SummarySort {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "percent" | "pct" => Ok(Self::Percent),
            "next-event" | "next_event" | "next" => Ok(Self::NextEvent),
            "symbol" => Ok(Self::Symbol),
            other => Err(format!(
                "unknown sort '{}', expected percent, next-event or symbol",
                other
            )),
        }
    }
}

/// One ranked line of the overview.
#[derive(Debug, Clone, PartialEq)]
pub struct EntitySummary {
    pub symbol: Symbol,
    pub name: String,
    pub aggregate: Option<Aggregate>,
    pub next_event: Option<DateTime<Utc>>,
    pub event_count: usize,
}

pub struct EarningsBook {
    dataset: Dataset,
}

impl EarningsBook {
    pub fn new(dataset: Dataset) -> Self {
        Self { dataset }
    }

    pub fn dataset(&self) -> &Dataset {
        &self.dataset
    }

    fn lookup(&self, symbol: &str) -> Option<&EntityRecord> {
        self.dataset.record(&Symbol::new(symbol))
    }

    pub fn averages(&self, symbol: &str) -> Option<Aggregate> {
        self.lookup(symbol).and_then(|r| r.aggregate)
    }

    pub fn changes(&self, symbol: &str) -> Option<Vec<ChangeRow>> {
        let table = self.lookup(symbol)?.price_reaction_table.as_ref()?;
        Some(
            table
                .rows
                .iter()
                .map(|row| ChangeRow {
                    event: row.event,
                    close_pre: row.pre.close,
                    close_post: row.post.close,
                    percent_change: row.percent_change,
                })
                .collect(),
        )
    }

    pub fn event_dates(&self, symbol: &str) -> Option<&[DateTime<Utc>]> {
        self.lookup(symbol)?.historical_events.as_deref()
    }

    pub fn next_event(&self, symbol: &str, now: DateTime<Utc>) -> Option<UpcomingEvent> {
        let record = self.lookup(symbol)?;
        Some(match record.next_event {
            NextEvent::Scheduled(ts) if ts > now => UpcomingEvent::Scheduled(ts),
            NextEvent::NoneScheduled => UpcomingEvent::NoneScheduled,
            NextEvent::Scheduled(_) | NextEvent::Unknown => UpcomingEvent::Stale,
        })
    }

    /// Description text; `None` until a fetch has completed.
    pub fn detail(&self, symbol: &str) -> Option<&str> {
        let record = self.lookup(symbol)?;
        record.detail.is_fetched().then(|| record.detail.text())
    }

    pub fn event_range(&self, symbol: &str) -> Option<EventRange> {
        let events = self.event_dates(symbol)?;
        let start = events.iter().min()?;
        let end = events.iter().max()?;
        Some(EventRange {
            start: *start,
            end: *end,
        })
    }

    /// Oldest stored event across every record.
    pub fn earliest_event(&self) -> Option<DateTime<Utc>> {
        self.dataset
            .records
            .values()
            .filter_map(|r| r.historical_events.as_ref())
            .flatten()
            .min()
            .copied()
    }

    pub fn summaries(&self, sort: SummarySort) -> Vec<EntitySummary> {
        let mut rows: Vec<EntitySummary> = self
            .dataset
            .records
            .iter()
            .map(|(symbol, record)| EntitySummary {
                symbol: symbol.clone(),
                name: self
                    .dataset
                    .entity(symbol)
                    .map(|e| e.name.clone())
                    .unwrap_or_default(),
                aggregate: record.aggregate,
                next_event: record.next_event.scheduled(),
                event_count: record.historical_events.as_ref().map_or(0, Vec::len),
            })
            .collect();

        match sort {
            SummarySort::Percent => rows.sort_by(|a, b| {
                let pa = a.aggregate.and_then(|g| g.percent_avg);
                let pb = b.aggregate.and_then(|g| g.percent_avg);
                missing_last(pa, pb, |x, y| y.total_cmp(&x)).then_with(|| a.symbol.cmp(&b.symbol))
            }),
            SummarySort::NextEvent => rows.sort_by(|a, b| {
                missing_last(a.next_event, b.next_event, |x, y| x.cmp(&y))
                    .then_with(|| a.symbol.cmp(&b.symbol))
            }),
            SummarySort::Symbol => rows.sort_by(|a, b| a.symbol.cmp(&b.symbol)),
        }
        rows
    }
}

fn missing_last<T, F>(a: Option<T>, b: Option<T>, cmp: F) -> Ordering
where
    F: Fn(T, T) -> Ordering,
{
    match (a, b) {
        (Some(x), Some(y)) => cmp(x, y),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

/// Latest traded price per symbol. Never fails; unknown symbols map to `None`.
pub async fn current_quotes(
    source: &dyn EarningsSource,
    symbols: &[&str],
) -> BTreeMap<Symbol, Option<f64>> {
    let mut normalized: Vec<Symbol> = symbols.iter().map(|s| Symbol::new(s)).collect();
    normalized.sort();
    normalized.dedup();
    if normalized.is_empty() {
        return BTreeMap::new();
    }
    source.fetch_current_quote(&normalized).await
}
