//! Dataset reconciliation.
//!
//! Brings a persisted `Dataset` in line with the live membership list in
//! strictly ordered phases:
//!
//! 1. prune records for symbols that left the index
//! 2. refresh missing or past next-report dates
//! 3. discover new symbols and fetch their event history
//! 4. flag records whose scheduled report has passed (table re-derivation)
//! 5. backfill price-reaction tables and aggregates
//! 6. backfill descriptions
//!
//! Each fetching phase fans out through the `BatchRunner` and fans back in
//! before the next phase starts. Workers only return values; all mutation of
//! the dataset happens here, between phases. Missing data never fails a run.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::batch::{BatchRunner, BatchStats};
use crate::config::AppConfig;
use crate::models::{Dataset, Detail, Entity, EntityRecord, NextEvent, PriceReactionTable, Symbol};
use crate::source::{EarningsSource, FetchError};
use crate::stats::{self, ReactionError};
use crate::store::SnapshotStore;

#[derive(Debug, Clone)]
pub struct ReconcileSettings {
    pub event_history_cap: usize,
    pub aggregate_window: usize,
    pub price_padding_days: i64,
    pub tz: Tz,
    pub refresh_history_after_report: bool,
}

impl Default for ReconcileSettings {
    fn default() -> Self {
        Self {
            event_history_cap: 10,
            aggregate_window: 10,
            price_padding_days: 10,
            tz: chrono_tz::America::New_York,
            refresh_history_after_report: false,
        }
    }
}

impl ReconcileSettings {
    pub fn from_config(config: &AppConfig) -> Result<Self> {
        Ok(Self {
            event_history_cap: config.event_history_cap,
            aggregate_window: config.aggregate_window,
            price_padding_days: config.price_padding_days,
            tz: config.timezone()?,
            refresh_history_after_report: config.refresh_history_after_report,
        })
    }
}

/// What one reconciliation pass did.
#[derive(Debug, Clone, Default)]
pub struct ReconcileReport {
    pub active: usize,
    pub pruned: Vec<Symbol>,
    pub discovered: Vec<Symbol>,
    pub next_events_updated: usize,
    pub histories_fetched: usize,
    pub recent_reports: Vec<Symbol>,
    pub tables_built: usize,
    pub details_fetched: usize,
    pub batches: Vec<(String, BatchStats)>,
}

impl ReconcileReport {
    fn record_batch(&mut self, phase: &str, stats: BatchStats) {
        self.batches.push((phase.to_string(), stats));
    }

    pub fn format_summary(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!("active symbols:        {}\n", self.active));
        out.push_str(&format!("pruned:                {}\n", self.pruned.len()));
        out.push_str(&format!("discovered:            {}\n", self.discovered.len()));
        out.push_str(&format!("next events updated:   {}\n", self.next_events_updated));
        out.push_str(&format!("histories fetched:     {}\n", self.histories_fetched));
        out.push_str(&format!("recent reports:        {}\n", self.recent_reports.len()));
        out.push_str(&format!("price tables built:    {}\n", self.tables_built));
        out.push_str(&format!("descriptions fetched:  {}\n", self.details_fetched));
        for (phase, stats) in &self.batches {
            out.push_str(&format!(
                "  [{:<16}] {:>4} ok {:>4} failed {:>4} abandoned {:>7} ms{}\n",
                phase,
                stats.succeeded,
                stats.failed,
                stats.abandoned,
                stats.elapsed_ms,
                if stats.deadline_hit { "  (deadline)" } else { "" }
            ));
        }
        out
    }
}

#[derive(Debug)]
enum BackfillError {
    Fetch(FetchError),
    Reaction(ReactionError),
}

impl fmt::Display for BackfillError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fetch(e) => write!(f, "{}", e),
            Self::Reaction(e) => write!(f, "{}", e),
        }
    }
}

pub struct Reconciler {
    source: Arc<dyn EarningsSource>,
    runner: BatchRunner,
    settings: ReconcileSettings,
}

impl Reconciler {
    pub fn new(
        source: Arc<dyn EarningsSource>,
        runner: BatchRunner,
        settings: ReconcileSettings,
    ) -> Self {
        Self {
            source,
            runner,
            settings,
        }
    }

    /// Full run: load, fetch membership, reconcile, persist.
    ///
    /// Fetch problems only leave records partial. A membership failure aborts
    /// before anything is written; a failed save is reported as an error.
    pub async fn run_update(&self, store: &SnapshotStore) -> Result<(Dataset, ReconcileReport)> {
        let persisted = store
            .load_or_default()
            .context("Failed to load snapshot")?;

        let active = match self.source.list_active_entities().await {
            Ok(active) => active,
            Err(e) => {
                if e.is_transient() {
                    warn!(error = %e, "Membership source unavailable, snapshot left untouched");
                } else {
                    error!(error = %e, "Membership source changed shape, snapshot left untouched");
                }
                return Err(anyhow::Error::new(e).context("Failed to fetch index membership"));
            }
        };
        if active.is_empty() {
            bail!("Index membership list is empty, refusing to prune every record");
        }

        let (dataset, report) = self.reconcile(active, persisted).await;

        store
            .save(&dataset)
            .context("Failed to persist snapshot")?;
        info!(records = dataset.records.len(), "💾 Snapshot persisted");

        Ok((dataset, report))
    }

    pub async fn reconcile(&self, active: Vec<Entity>, dataset: Dataset) -> (Dataset, ReconcileReport) {
        self.reconcile_at(active, dataset, Utc::now()).await
    }

    /// Reconcile against an explicit clock.
    pub async fn reconcile_at(
        &self,
        mut active: Vec<Entity>,
        mut dataset: Dataset,
        now: DateTime<Utc>,
    ) -> (Dataset, ReconcileReport) {
        active.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        active.dedup_by(|a, b| a.symbol == b.symbol);

        let mut report = ReconcileReport {
            active: active.len(),
            ..Default::default()
        };

        // Phase 1: prune
        let active_symbols: BTreeSet<Symbol> = active.iter().map(|e| e.symbol.clone()).collect();
        dataset.records.retain(|symbol, _| {
            let keep = active_symbols.contains(symbol);
            if !keep {
                report.pruned.push(symbol.clone());
            }
            keep
        });
        dataset.entities = active;
        if !report.pruned.is_empty() {
            info!(count = report.pruned.len(), symbols = ?report.pruned, "Pruned symbols no longer in the index");
        }

        // Phase 2: upcoming-event refresh for existing records
        let stale: Vec<Symbol> = dataset
            .records
            .iter()
            .filter(|(_, r)| r.next_event.needs_refresh(now))
            .map(|(s, _)| s.clone())
            .collect();
        self.refresh_next_events(&mut dataset, stale, "next_event", &mut report)
            .await;

        // Phase 4 detection runs on the refreshed values, before new records exist.
        let recent: Vec<Symbol> = dataset
            .records
            .iter()
            .filter(|(_, r)| r.next_event.has_passed(now))
            .map(|(s, _)| s.clone())
            .collect();

        // Phase 3: discovery
        let new_symbols: Vec<Symbol> = active_symbols
            .iter()
            .filter(|s| !dataset.records.contains_key(*s))
            .cloned()
            .collect();
        for symbol in &new_symbols {
            dataset.records.insert(symbol.clone(), EntityRecord::default());
        }
        if !new_symbols.is_empty() {
            info!(count = new_symbols.len(), "Discovered new index members");
        }
        report.discovered = new_symbols.clone();

        let mut need_history: BTreeSet<Symbol> = dataset
            .records
            .iter()
            .filter(|(_, r)| r.historical_events.is_none())
            .map(|(s, _)| s.clone())
            .collect();
        if self.settings.refresh_history_after_report {
            need_history.extend(recent.iter().cloned());
        }
        self.fetch_histories(&mut dataset, need_history, &mut report)
            .await;
        self.refresh_next_events(&mut dataset, new_symbols, "next_event_new", &mut report)
            .await;

        // Phase 4: a passed report invalidates the table; history is kept.
        for symbol in &recent {
            if let Some(record) = dataset.records.get_mut(symbol) {
                if record.historical_events.is_some() {
                    record.clear_price_table();
                }
            }
        }
        if !recent.is_empty() {
            info!(count = recent.len(), "Scheduled reports have passed, re-deriving price tables");
        }
        report.recent_reports = recent;

        // Phase 5: price-table backfill
        self.backfill_price_tables(&mut dataset, &mut report).await;

        // Phase 6: detail backfill
        self.backfill_details(&mut dataset, &mut report).await;

        dataset.recompute_aggregates(self.settings.aggregate_window);

        info!(
            active = report.active,
            pruned = report.pruned.len(),
            discovered = report.discovered.len(),
            tables = report.tables_built,
            details = report.details_fetched,
            "Reconciliation complete"
        );

        (dataset, report)
    }

    async fn refresh_next_events(
        &self,
        dataset: &mut Dataset,
        symbols: Vec<Symbol>,
        phase: &str,
        report: &mut ReconcileReport,
    ) {
        if symbols.is_empty() {
            return;
        }
        let source = &*self.source;
        let outcome = self
            .runner
            .run(phase, symbols, move |symbol: Symbol| async move {
                source.fetch_next_event(&symbol).await
            })
            .await;

        for (symbol, next) in outcome.results {
            if let Some(record) = dataset.records.get_mut(&symbol) {
                record.next_event = NextEvent::from_fetch(next);
                report.next_events_updated += 1;
            }
        }
        report.record_batch(phase, outcome.stats);
    }

    async fn fetch_histories(
        &self,
        dataset: &mut Dataset,
        symbols: BTreeSet<Symbol>,
        report: &mut ReconcileReport,
    ) {
        if symbols.is_empty() {
            return;
        }
        let source = &*self.source;
        let outcome = self
            .runner
            .run("history", symbols, move |symbol: Symbol| async move {
                source.fetch_historical_events(&symbol).await
            })
            .await;

        let cap = self.settings.event_history_cap;
        for (symbol, events) in outcome.results {
            let Some(record) = dataset.records.get_mut(&symbol) else {
                continue;
            };
            let events = stats::cap_recent(events, cap);
            debug!(symbol = %symbol, events = events.len(), "Event history fetched");
            if record.historical_events.as_ref() != Some(&events) {
                record.clear_price_table();
            }
            record.historical_events = Some(events);
            report.histories_fetched += 1;
        }
        report.record_batch("history", outcome.stats);
    }

    async fn backfill_price_tables(&self, dataset: &mut Dataset, report: &mut ReconcileReport) {
        let events_by_symbol: BTreeMap<Symbol, Vec<DateTime<Utc>>> = dataset
            .records
            .iter()
            .filter(|(_, r)| r.needs_price_backfill())
            .filter_map(|(s, r)| r.historical_events.clone().map(|events| (s.clone(), events)))
            .collect();
        if events_by_symbol.is_empty() {
            return;
        }

        let source = &*self.source;
        let events_ref = &events_by_symbol;
        let padding = self.settings.price_padding_days;
        let tz = self.settings.tz;

        let outcome = self
            .runner
            .run(
                "price_table",
                events_by_symbol.keys().cloned().collect::<Vec<_>>(),
                move |symbol: Symbol| async move {
                    let events = events_ref.get(&symbol).map(Vec::as_slice).unwrap_or(&[]);
                    build_price_table(source, &symbol, events, padding, tz).await
                },
            )
            .await;

        let window = self.settings.aggregate_window;
        for (symbol, table) in outcome.results {
            if let Some(record) = dataset.records.get_mut(&symbol) {
                record.set_price_table(table, window);
                report.tables_built += 1;
            }
        }
        if outcome.stats.failed + outcome.stats.abandoned > 0 {
            warn!(
                missing = outcome.stats.failed + outcome.stats.abandoned,
                "Some price tables are still missing, will retry next run"
            );
        }
        report.record_batch("price_table", outcome.stats);
    }

    async fn backfill_details(&self, dataset: &mut Dataset, report: &mut ReconcileReport) {
        let mut targets = Vec::new();
        for (symbol, record) in dataset.records.iter_mut() {
            if !record.detail.is_fetched() {
                record.detail = Detail::Attempted;
                targets.push(symbol.clone());
            }
        }
        if targets.is_empty() {
            return;
        }

        let source = &*self.source;
        let outcome = self
            .runner
            .run("detail", targets, move |symbol: Symbol| async move {
                source.fetch_description(&symbol).await
            })
            .await;

        for (symbol, text) in outcome.results {
            if let Some(record) = dataset.records.get_mut(&symbol) {
                record.detail = Detail::Fetched(text.trim().to_string());
                report.details_fetched += 1;
            }
        }
        report.record_batch("detail", outcome.stats);
    }
}

/// Fetch a padded price series and pair it with `events`. No events means an
/// empty table and no network call.
async fn build_price_table(
    source: &dyn EarningsSource,
    symbol: &Symbol,
    events: &[DateTime<Utc>],
    padding_days: i64,
    tz: Tz,
) -> Result<PriceReactionTable, BackfillError> {
    let Some((start, end)) = stats::fetch_window(events, padding_days, tz) else {
        return Ok(PriceReactionTable::empty());
    };

    let bars = source
        .fetch_price_series(symbol, start, end)
        .await
        .map_err(BackfillError::Fetch)?;

    stats::price_reactions(events, &bars, tz).map_err(BackfillError::Reaction)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settings_from_default_config() {
        let settings = ReconcileSettings::from_config(&AppConfig::default()).unwrap();
        assert_eq!(settings.event_history_cap, 10);
        assert_eq!(settings.tz, chrono_tz::America::New_York);
        assert!(!settings.refresh_history_after_report);
    }

    #[test]
    fn test_report_summary_lists_batches() {
        let mut report = ReconcileReport {
            active: 3,
            ..Default::default()
        };
        report.record_batch(
            "detail",
            BatchStats {
                submitted: 3,
                succeeded: 2,
                failed: 1,
                ..Default::default()
            },
        );
        let summary = report.format_summary();
        assert!(summary.contains("active symbols:        3"));
        assert!(summary.contains("[detail"));
    }
}
