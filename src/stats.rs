//! Derived statistics over price-reaction tables.
//!
//! - `aggregate`: mean absolute point/percent change over the first `n` rows
//! - `price_reactions`: pairs each event with the bar before its calendar day
//!   and the first bar at or after the event itself
//! - `fetch_window`: the padded date range a price series must cover

use chrono::{DateTime, Duration, NaiveDate, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use std::fmt;

use crate::models::{Aggregate, PriceBar, PriceReactionRow, PriceReactionTable};

/// Mean absolute changes over the first `n` rows.
///
/// Returns `None` for an empty table (the average is undefined). Rows without
/// a percent change are left out of the percent mean only.
pub fn aggregate(table: &PriceReactionTable, n: usize) -> Option<Aggregate> {
    let rows: Vec<&PriceReactionRow> = table.rows.iter().take(n).collect();
    if rows.is_empty() {
        return None;
    }

    let point_avg = rows.iter().map(|r| r.point_change.abs()).sum::<f64>() / rows.len() as f64;

    let percents: Vec<f64> = rows
        .iter()
        .filter_map(|r| r.percent_change)
        .map(f64::abs)
        .collect();
    let percent_avg = if percents.is_empty() {
        None
    } else {
        Some(percents.iter().sum::<f64>() / percents.len() as f64)
    };

    Some(Aggregate {
        point_avg,
        percent_avg,
    })
}

/// Keep the `cap` most recent distinct events, newest first.
pub fn cap_recent(mut events: Vec<DateTime<Utc>>, cap: usize) -> Vec<DateTime<Utc>> {
    events.sort_unstable_by(|a, b| b.cmp(a));
    events.dedup();
    events.truncate(cap);
    events
}

/// Start of `date` in `tz`, as a UTC instant.
pub fn start_of_day(date: NaiveDate, tz: Tz) -> DateTime<Utc> {
    let local = date.and_time(NaiveTime::MIN);
    tz.from_local_datetime(&local)
        .earliest()
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|| Utc.from_utc_datetime(&local))
}

/// Calendar date range `[min - pad, max + pad]` in `tz`; `None` for no events.
pub fn fetch_window(
    events: &[DateTime<Utc>],
    padding_days: i64,
    tz: Tz,
) -> Option<(NaiveDate, NaiveDate)> {
    let min = events.iter().min()?;
    let max = events.iter().max()?;
    let pad = Duration::days(padding_days);
    Some((
        (min.with_timezone(&tz) - pad).date_naive(),
        (max.with_timezone(&tz) + pad).date_naive(),
    ))
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReactionError {
    /// No bar before the event's calendar day.
    MissingPreBar(DateTime<Utc>),
    /// No bar at or after the event.
    MissingPostBar(DateTime<Utc>),
}

impl fmt::Display for ReactionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingPreBar(ts) => write!(f, "no price bar before event {}", ts),
            Self::MissingPostBar(ts) => write!(f, "no price bar at or after event {}", ts),
        }
    }
}

impl std::error::Error for ReactionError {}

/// Build one row per event, in event order. `bars` need not be sorted.
pub fn price_reactions(
    events: &[DateTime<Utc>],
    bars: &[PriceBar],
    tz: Tz,
) -> Result<PriceReactionTable, ReactionError> {
    if events.is_empty() {
        return Ok(PriceReactionTable::empty());
    }

    let mut sorted: Vec<&PriceBar> = bars.iter().collect();
    sorted.sort_by_key(|b| b.date);

    let mut rows = Vec::with_capacity(events.len());
    for &event in events {
        let day_start = start_of_day(event.with_timezone(&tz).date_naive(), tz);

        let pre = sorted
            .iter()
            .rev()
            .find(|b| b.date < day_start)
            .ok_or(ReactionError::MissingPreBar(event))?;
        let post = sorted
            .iter()
            .find(|b| b.date >= event)
            .ok_or(ReactionError::MissingPostBar(event))?;

        let point_change = post.close - pre.close;
        let percent_change = if pre.close != 0.0 && pre.close.is_finite() {
            Some(point_change * 100.0 / pre.close)
        } else {
            None
        };

        rows.push(PriceReactionRow {
            event,
            pre: (*pre).clone(),
            post: (*post).clone(),
            point_change,
            percent_change,
        });
    }

    Ok(PriceReactionTable { rows })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono_tz::America::New_York;

    fn bar(date: NaiveDate, close: f64) -> PriceBar {
        PriceBar {
            date: start_of_day(date, New_York),
            open: close,
            high: close,
            low: close,
            close,
            volume: 1_000,
            dividends: 0.0,
            splits: 0.0,
        }
    }

    fn day(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn row(point: f64, percent: Option<f64>) -> PriceReactionRow {
        let b = bar(day(2024, 1, 2), 100.0);
        PriceReactionRow {
            event: b.date,
            pre: b.clone(),
            post: b,
            point_change: point,
            percent_change: percent,
        }
    }

    #[test]
    fn test_aggregate_empty_is_undefined() {
        assert!(aggregate(&PriceReactionTable::empty(), 10).is_none());
    }

    #[test]
    fn test_aggregate_uses_all_rows_when_short() {
        let table = PriceReactionTable {
            rows: vec![row(-2.0, Some(-4.0)), row(4.0, Some(2.0))],
        };
        let agg = aggregate(&table, 10).unwrap();
        assert!((agg.point_avg - 3.0).abs() < 1e-12);
        assert!((agg.percent_avg.unwrap() - 3.0).abs() < 1e-12);
    }

    #[test]
    fn test_aggregate_window_limits_rows() {
        let table = PriceReactionTable {
            rows: vec![row(1.0, Some(1.0)), row(3.0, Some(3.0)), row(100.0, Some(100.0))],
        };
        let agg = aggregate(&table, 2).unwrap();
        assert!((agg.point_avg - 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_aggregate_skips_missing_percent() {
        let table = PriceReactionTable {
            rows: vec![row(1.0, None), row(3.0, Some(6.0))],
        };
        let agg = aggregate(&table, 10).unwrap();
        assert!((agg.point_avg - 2.0).abs() < 1e-12);
        assert_eq!(agg.percent_avg, Some(6.0));
    }

    #[test]
    fn test_cap_recent_keeps_newest() {
        let events: Vec<DateTime<Utc>> = (1..=12)
            .map(|d| start_of_day(day(2024, 1, d), New_York))
            .collect();
        let capped = cap_recent(events, 10);
        assert_eq!(capped.len(), 10);
        assert_eq!(capped[0], start_of_day(day(2024, 1, 12), New_York));
        assert_eq!(capped[9], start_of_day(day(2024, 1, 3), New_York));
    }

    #[test]
    fn test_reaction_before_open_event() {
        // Thursday pre-market report: pre = Wednesday, post = Thursday.
        let bars = vec![
            bar(day(2024, 1, 24), 100.0),
            bar(day(2024, 1, 25), 110.0),
            bar(day(2024, 1, 26), 90.0),
        ];
        let event = start_of_day(day(2024, 1, 25), New_York);
        let table = price_reactions(&[event], &bars, New_York).unwrap();
        let r = &table.rows[0];
        assert_eq!(r.pre.close, 100.0);
        assert_eq!(r.post.close, 110.0);
        assert!((r.point_change - 10.0).abs() < 1e-12);
        assert!((r.percent_change.unwrap() - 10.0).abs() < 1e-12);
    }

    #[test]
    fn test_reaction_after_close_event_lands_next_session() {
        // After-close on Friday is offset to Saturday; post bar is Monday.
        let bars = vec![
            bar(day(2024, 1, 26), 50.0),
            bar(day(2024, 1, 29), 45.0),
        ];
        let event = start_of_day(day(2024, 1, 27), New_York);
        let table = price_reactions(&[event], &bars, New_York).unwrap();
        assert_eq!(table.rows[0].pre.close, 50.0);
        assert_eq!(table.rows[0].post.close, 45.0);
    }

    #[test]
    fn test_reaction_zero_pre_close() {
        let bars = vec![bar(day(2024, 1, 24), 0.0), bar(day(2024, 1, 25), 5.0)];
        let event = start_of_day(day(2024, 1, 25), New_York);
        let table = price_reactions(&[event], &bars, New_York).unwrap();
        assert_eq!(table.rows[0].percent_change, None);
        assert_eq!(table.rows[0].point_change, 5.0);
    }

    #[test]
    fn test_reaction_missing_bars() {
        let bars = vec![bar(day(2024, 1, 25), 5.0)];
        let event = start_of_day(day(2024, 1, 25), New_York);
        assert_eq!(
            price_reactions(&[event], &bars, New_York),
            Err(ReactionError::MissingPreBar(event))
        );

        let bars = vec![bar(day(2024, 1, 24), 5.0)];
        assert_eq!(
            price_reactions(&[event], &bars, New_York),
            Err(ReactionError::MissingPostBar(event))
        );
    }

    #[test]
    fn test_empty_events_give_empty_table() {
        let table = price_reactions(&[], &[], New_York).unwrap();
        assert!(table.is_empty());
    }

    #[test]
    fn test_fetch_window_padding() {
        let events = vec![
            start_of_day(day(2024, 1, 25), New_York),
            start_of_day(day(2023, 10, 26), New_York),
        ];
        let (start, end) = fetch_window(&events, 10, New_York).unwrap();
        assert_eq!(start, day(2023, 10, 16));
        assert_eq!(end, day(2024, 2, 4));
        assert!(fetch_window(&[], 10, New_York).is_none());
    }
}
