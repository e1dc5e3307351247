//! HTTP-backed `EarningsSource`.
//!
//! Report dates come from the earnings-announcements page (an embedded JSON
//! table), the next report date and description from quote pages, price bars
//! from a chart JSON API and quotes from a JSON quote feed. Membership comes
//! from the index constituents table, or from a local file when one is set.
//!
//! Page handling is limited to locating a marker and slicing text around it.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use chrono_tz::Tz;
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, warn};

use super::{EarningsSource, FetchError, FetchResult};
use crate::config::HttpConfig;
use crate::models::{Entity, PriceBar, Symbol};
use crate::stats::start_of_day;

const EARNINGS_TABLE_MARKER: &str = "earnings_announcements_earnings_table";
const NEXT_REPORT_MARKER: &str = "Next Report Date";
const NEXT_REPORT_MAX_CHARS: usize = 512;
const MEMBERSHIP_TABLE_MARKER: &str = "id=\"constituents\"";
const MEMBERSHIP_HEADERS: [&str; 2] = ["Symbol", "Security"];
const DESCRIPTION_MARKER: &str = "description__text";
const AFTER_CLOSE: &str = "After Close";

#[derive(Clone)]
pub struct HttpSource {
    client: Client,
    config: HttpConfig,
    universe_path: Option<PathBuf>,
    tz: Tz,
}

impl HttpSource {
    pub fn new(config: HttpConfig, universe_path: Option<PathBuf>, tz: Tz) -> anyhow::Result<Self> {
        use anyhow::Context;

        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .pool_max_idle_per_host(8)
            .pool_idle_timeout(Duration::from_secs(90))
            .user_agent(config.user_agent.clone())
            .default_headers({
                let mut headers = reqwest::header::HeaderMap::new();
                headers.insert(
                    "X-Requested-With",
                    reqwest::header::HeaderValue::from_static("XMLHttpRequest"),
                );
                headers
            })
            .build()
            .context("Failed to build HttpSource client")?;

        Ok(Self {
            client,
            config,
            universe_path,
            tz,
        })
    }

    #[inline]
    fn url(template: &str, symbol: &str) -> String {
        template.replace("{symbol}", symbol)
    }

    async fn get_text(&self, url: &str, query: &[(&str, String)]) -> FetchResult<String> {
        let resp = self.client.get(url).query(query).send().await?;

        let status = resp.status();
        if !status.is_success() {
            debug!(url = %url, status = %status, "upstream returned non-success status");
            return Err(FetchError::Status(status.as_u16()));
        }

        Ok(resp.text().await?)
    }
}

#[async_trait]
impl EarningsSource for HttpSource {
    async fn list_active_entities(&self) -> FetchResult<Vec<Entity>> {
        if let Some(path) = &self.universe_path {
            debug!(path = ?path, "reading membership from local file");
            let raw = tokio::fs::read_to_string(path).await?;
            return parse_universe(&raw);
        }
        let body = self.get_text(&self.config.membership_url, &[]).await?;
        parse_membership_table(&body)
    }

    async fn fetch_historical_events(&self, symbol: &Symbol) -> FetchResult<Vec<DateTime<Utc>>> {
        let url = Self::url(&self.config.earnings_url, symbol.as_str());
        let body = self.get_text(&url, &[]).await?;
        parse_earnings_announcements(&body, self.tz)
    }

    async fn fetch_next_event(&self, symbol: &Symbol) -> FetchResult<Option<DateTime<Utc>>> {
        let url = Self::url(&self.config.next_event_url, symbol.as_str());
        let body = self.get_text(&url, &[]).await?;
        parse_next_report_date(&body, self.tz)
    }

    async fn fetch_description(&self, symbol: &Symbol) -> FetchResult<String> {
        let url = Self::url(&self.config.description_url, &symbol.as_str().to_lowercase());
        let body = self.get_text(&url, &[]).await?;
        Ok(parse_description(&body))
    }

    async fn fetch_price_series(
        &self,
        symbol: &Symbol,
        start: NaiveDate,
        end: NaiveDate,
    ) -> FetchResult<Vec<PriceBar>> {
        let url = Self::url(&self.config.price_url, &symbol.price_feed_symbol());
        let query = [
            ("period1", start_of_day(start, self.tz).timestamp().to_string()),
            ("period2", start_of_day(end, self.tz).timestamp().to_string()),
            ("interval", "1d".to_string()),
            ("events", "div|split".to_string()),
        ];
        let body = self.get_text(&url, &query).await?;
        parse_chart(&body, self.tz)
    }

    async fn fetch_current_quote(&self, symbols: &[Symbol]) -> BTreeMap<Symbol, Option<f64>> {
        let joined = symbols
            .iter()
            .map(Symbol::as_str)
            .collect::<Vec<_>>()
            .join(",");

        match self.get_text(&self.config.quote_url, &[("t", joined)]).await {
            Ok(body) => parse_quotes(&body, symbols),
            Err(e) => {
                warn!(error = %e, count = symbols.len(), "quote feed unavailable");
                symbols.iter().map(|s| (s.clone(), None)).collect()
            }
        }
    }
}

// =============================================================================
// Payload parsing
// =============================================================================

#[derive(Debug, Deserialize)]
struct UniverseRow {
    #[serde(alias = "Symbol")]
    symbol: String,
    #[serde(alias = "Security", alias = "security")]
    name: String,
}

/// Constituents file: a JSON array of `{symbol, name}` objects.
pub fn parse_universe(raw: &str) -> FetchResult<Vec<Entity>> {
    let rows: Vec<UniverseRow> = serde_json::from_str(raw)?;
    let mut entities: Vec<Entity> = rows
        .into_iter()
        .filter(|r| !r.symbol.trim().is_empty())
        .map(|r| Entity::new(&r.symbol, r.name.trim()))
        .collect();
    entities.sort_by(|a, b| a.symbol.cmp(&b.symbol));
    entities.dedup_by(|a, b| a.symbol == b.symbol);
    Ok(entities)
}

/// Cell texts of every `<tag ...>...</tag>` cell in `row`, tags stripped.
fn row_cells(row: &str, tag: &str) -> Vec<String> {
    let open = format!("<{}", tag);
    let close = format!("</{}>", tag);
    row.split(open.as_str())
        .skip(1)
        .map(|cell| {
            let content = cell.find('>').map_or("", |i| &cell[i + 1..]);
            let end = content.find(close.as_str()).unwrap_or(content.len());
            decode_entities(&strip_tags(&content[..end]))
        })
        .collect()
}

/// The constituents table: a header row starting `Symbol | Security`, then one
/// row per member. Any other header layout is a format error.
pub fn parse_membership_table(body: &str) -> FetchResult<Vec<Entity>> {
    let start = body
        .find(MEMBERSHIP_TABLE_MARKER)
        .or_else(|| body.find("<table"))
        .ok_or_else(|| FetchError::format("constituents table not found"))?;
    let table = &body[start..];
    let table = &table[..table.find("</table>").unwrap_or(table.len())];

    let mut rows = table.split("<tr").skip(1);
    let headers = rows
        .next()
        .map(|row| row_cells(row, "th"))
        .unwrap_or_default();
    let matches = headers.len() >= MEMBERSHIP_HEADERS.len()
        && headers
            .iter()
            .zip(MEMBERSHIP_HEADERS)
            .all(|(found, expected)| found.trim_end() == expected);
    if !matches {
        return Err(FetchError::format(format!(
            "constituents table headers changed: {:?}",
            headers
        )));
    }

    let mut entities: Vec<Entity> = rows
        .filter_map(|row| {
            let cells = row_cells(row, "td");
            match cells.as_slice() {
                [symbol, name, ..] if !symbol.trim().is_empty() => {
                    Some(Entity::new(symbol, name.trim()))
                }
                _ => None,
            }
        })
        .collect();
    if entities.is_empty() {
        return Err(FetchError::format("constituents table has no rows"));
    }
    entities.sort_by(|a, b| a.symbol.cmp(&b.symbol));
    entities.dedup_by(|a, b| a.symbol == b.symbol);
    Ok(entities)
}

fn parse_us_date(token: &str) -> Option<NaiveDate> {
    let cleaned = token.trim_matches(|c: char| !c.is_ascii_digit());
    NaiveDate::parse_from_str(cleaned, "%m/%d/%Y").ok()
}

/// Report dates from the embedded announcements table. "After Close" reports
/// are moved to the next day so the post-event bar is the next session.
pub fn parse_earnings_announcements(body: &str, tz: Tz) -> FetchResult<Vec<DateTime<Utc>>> {
    let marker = body
        .find(EARNINGS_TABLE_MARKER)
        .ok_or_else(|| FetchError::format("earnings announcements table not found"))?;

    let script_start = body[..marker].rfind("<script").unwrap_or(0);
    let script_end = body[marker..]
        .find("</script>")
        .map(|i| marker + i)
        .unwrap_or(body.len());
    let script = &body[script_start..script_end];

    let (open, close) = match (script.find('{'), script.rfind('}')) {
        (Some(o), Some(c)) if o < c => (o, c),
        _ => return Err(FetchError::format("earnings announcements object not found")),
    };
    let obj: Value = serde_json::from_str(&script[open..=close])?;

    let rows = obj
        .get(EARNINGS_TABLE_MARKER)
        .and_then(Value::as_array)
        .ok_or_else(|| FetchError::format("earnings announcements table is not an array"))?;

    let mut events = Vec::with_capacity(rows.len());
    for row in rows {
        let cells = row
            .as_array()
            .ok_or_else(|| FetchError::format("earnings announcements row is not an array"))?;
        let date_cell = cells.first().and_then(Value::as_str).unwrap_or_default();
        let date = parse_us_date(date_cell)
            .ok_or_else(|| FetchError::format(format!("unparseable report date {:?}", date_cell)))?;

        let after_close = cells
            .get(6)
            .and_then(Value::as_str)
            .map(|s| s.trim() == AFTER_CLOSE)
            .unwrap_or(false);

        let day = if after_close {
            date.succ_opt()
                .ok_or_else(|| FetchError::format(format!("report date out of range {}", date)))?
        } else {
            date
        };
        events.push(start_of_day(day, tz));
    }

    Ok(events)
}

/// The "Next Report Date" cell; `None` when the source lists no date.
pub fn parse_next_report_date(body: &str, tz: Tz) -> FetchResult<Option<DateTime<Utc>>> {
    let marker = body
        .find(NEXT_REPORT_MARKER)
        .ok_or_else(|| FetchError::format("next report date not found"))?;

    let rest = &body[marker + NEXT_REPORT_MARKER.len()..];
    let row_end = rest.find("</tr>").unwrap_or_else(|| {
        rest.char_indices()
            .nth(NEXT_REPORT_MAX_CHARS)
            .map_or(rest.len(), |(i, _)| i)
    });
    let text = strip_tags(&rest[..row_end]);

    Ok(text
        .split_whitespace()
        .find_map(parse_us_date)
        .map(|date| start_of_day(date, tz)))
}

/// First description paragraph, tags stripped. Empty when the page has none.
pub fn parse_description(body: &str) -> String {
    let Some(marker) = body.find(DESCRIPTION_MARKER) else {
        return String::new();
    };
    let rest = &body[marker..];
    let Some(open_end) = rest.find('>') else {
        return String::new();
    };
    let content = &rest[open_end + 1..];
    let end = content
        .find("</p>")
        .or_else(|| content.find("</div>"))
        .unwrap_or(content.len());
    decode_entities(&strip_tags(&content[..end]))
}

fn strip_tags(html: &str) -> String {
    let mut out = String::with_capacity(html.len());
    let mut in_tag = false;
    for c in html.chars() {
        match c {
            '<' => {
                in_tag = true;
                out.push(' ');
            }
            '>' => in_tag = false,
            _ if !in_tag => out.push(c),
            _ => {}
        }
    }
    out.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn decode_entities(text: &str) -> String {
    text.replace("&amp;", "&")
        .replace("&#39;", "'")
        .replace("&#x27;", "'")
        .replace("&quot;", "\"")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&nbsp;", " ")
}

#[derive(Debug, Deserialize)]
struct ChartEnvelope {
    chart: ChartBody,
}

#[derive(Debug, Deserialize)]
struct ChartBody {
    #[serde(default)]
    result: Option<Vec<ChartResult>>,
    #[serde(default)]
    error: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct ChartResult {
    #[serde(default)]
    timestamp: Vec<i64>,
    indicators: ChartIndicators,
    #[serde(default)]
    events: Option<ChartEvents>,
}

#[derive(Debug, Deserialize)]
struct ChartIndicators {
    quote: Vec<QuoteSeries>,
}

#[derive(Debug, Default, Deserialize)]
struct QuoteSeries {
    #[serde(default)]
    open: Vec<Option<f64>>,
    #[serde(default)]
    high: Vec<Option<f64>>,
    #[serde(default)]
    low: Vec<Option<f64>>,
    #[serde(default)]
    close: Vec<Option<f64>>,
    #[serde(default)]
    volume: Vec<Option<u64>>,
}

#[derive(Debug, Default, Deserialize)]
struct ChartEvents {
    #[serde(default)]
    dividends: HashMap<String, DividendEvent>,
    #[serde(default)]
    splits: HashMap<String, SplitEvent>,
}

#[derive(Debug, Deserialize)]
struct DividendEvent {
    amount: f64,
    date: i64,
}

#[derive(Debug, Deserialize)]
struct SplitEvent {
    numerator: f64,
    denominator: f64,
    date: i64,
}

fn session_date(ts: i64, tz: Tz) -> Option<NaiveDate> {
    Utc.timestamp_opt(ts, 0)
        .single()
        .map(|dt| dt.with_timezone(&tz).date_naive())
}

/// Daily bars from a chart payload, keyed to the session's day start.
/// Sessions with a missing close are dropped.
pub fn parse_chart(body: &str, tz: Tz) -> FetchResult<Vec<PriceBar>> {
    let envelope: ChartEnvelope = serde_json::from_str(body)?;
    if let Some(err) = envelope.chart.error.filter(|e| !e.is_null()) {
        return Err(FetchError::format(format!("chart error: {}", err)));
    }

    let result = envelope
        .chart
        .result
        .and_then(|r| r.into_iter().next())
        .ok_or_else(|| FetchError::format("chart result missing"))?;
    let quote = result.indicators.quote.into_iter().next().unwrap_or_default();
    let events = result.events.unwrap_or_default();

    let dividends: HashMap<NaiveDate, f64> = events
        .dividends
        .values()
        .filter_map(|d| session_date(d.date, tz).map(|day| (day, d.amount)))
        .collect();
    let splits: HashMap<NaiveDate, f64> = events
        .splits
        .values()
        .filter(|s| s.denominator != 0.0)
        .filter_map(|s| session_date(s.date, tz).map(|day| (day, s.numerator / s.denominator)))
        .collect();

    let at = |series: &[Option<f64>], i: usize| series.get(i).copied().flatten();

    let mut bars = Vec::with_capacity(result.timestamp.len());
    for (i, &ts) in result.timestamp.iter().enumerate() {
        let (Some(day), Some(close)) = (session_date(ts, tz), at(&quote.close, i)) else {
            continue;
        };
        bars.push(PriceBar {
            date: start_of_day(day, tz),
            open: at(&quote.open, i).unwrap_or(close),
            high: at(&quote.high, i).unwrap_or(close),
            low: at(&quote.low, i).unwrap_or(close),
            close,
            volume: quote.volume.get(i).copied().flatten().unwrap_or(0),
            dividends: dividends.get(&day).copied().unwrap_or(0.0),
            splits: splits.get(&day).copied().unwrap_or(0.0),
        });
    }

    bars.sort_by_key(|b| b.date);
    bars.dedup_by_key(|b| b.date);
    Ok(bars)
}

/// `{"AAPL": {"last": "189.50", ...}, ...}`; prices may be strings or numbers.
pub fn parse_quotes(body: &str, symbols: &[Symbol]) -> BTreeMap<Symbol, Option<f64>> {
    let parsed: HashMap<String, Value> = serde_json::from_str(body).unwrap_or_default();
    let by_symbol: HashMap<Symbol, &Value> = parsed
        .iter()
        .map(|(k, v)| (Symbol::new(k), v))
        .collect();

    symbols
        .iter()
        .map(|sym| {
            let price = by_symbol
                .get(sym)
                .and_then(|v| v.get("last"))
                .and_then(|last| match last {
                    Value::Number(n) => n.as_f64(),
                    Value::String(s) => s.replace(',', "").trim().parse::<f64>().ok(),
                    _ => None,
                });
            (sym.clone(), price)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono_tz::America::New_York;

    #[test]
    fn test_parse_universe_sorts_and_normalizes() {
        let raw = r#"[
            {"symbol": "msft", "name": "Microsoft"},
            {"Symbol": "AAPL", "Security": "Apple Inc."},
            {"symbol": "MSFT", "name": "Microsoft dup"}
        ]"#;
        let entities = parse_universe(raw).unwrap();
        assert_eq!(entities.len(), 2);
        assert_eq!(entities[0].symbol.as_str(), "AAPL");
        assert_eq!(entities[0].name, "Apple Inc.");
        assert_eq!(entities[1].symbol.as_str(), "MSFT");
    }

    #[test]
    fn test_parse_earnings_announcements() {
        let body = r#"<html><script>var x = 1;</script>
            <script>
            document.obj_data = {"earnings_announcements_earnings_table": [
                ["2/1/2024", "12/2023", "$2.10", "$2.18", "+0.08", "+3.81%", "After Close"],
                ["11/2/2023", "9/2023", "$1.39", "$1.46", "+0.07", "+5.04%", "Before Open"]
            ]};
            </script></html>"#;
        let events = parse_earnings_announcements(body, New_York).unwrap();
        assert_eq!(events.len(), 2);
        let feb2 = start_of_day(NaiveDate::from_ymd_opt(2024, 2, 2).unwrap(), New_York);
        let nov2 = start_of_day(NaiveDate::from_ymd_opt(2023, 11, 2).unwrap(), New_York);
        assert_eq!(events[0], feb2);
        assert_eq!(events[1], nov2);
    }

    #[test]
    fn test_after_close_moves_to_next_local_midnight_across_dst() {
        // 2024-03-09 After Close: the next day starts DST in New York.
        let body = r#"<script>x = {"earnings_announcements_earnings_table": [
                ["3/9/2024", "12/2023", "", "", "", "", "After Close"]
            ]};</script>"#;
        let events = parse_earnings_announcements(body, New_York).unwrap();
        let mar10 = start_of_day(NaiveDate::from_ymd_opt(2024, 3, 10).unwrap(), New_York);
        assert_eq!(events, vec![mar10]);
        assert_eq!(
            events[0].with_timezone(&New_York).format("%H:%M").to_string(),
            "00:00"
        );
    }

    #[test]
    fn test_parse_membership_table() {
        let body = r#"<html><table class="wikitable sortable" id="constituents">
            <tbody><tr><th>Symbol
</th><th>Security</th><th>GICS Sector</th></tr>
            <tr><td><a href="/x">MSFT</a></td><td><a href="/y">Microsoft</a></td><td>IT</td></tr>
            <tr><td>BRK.B</td><td>Berkshire Hathaway</td><td>Financials</td></tr>
            <tr><td>AAPL</td><td>Apple Inc.</td><td>IT</td></tr>
            </tbody></table>
            <table><tr><th>Date</th></tr><tr><td>ZZZ</td><td>Removed</td></tr></table></html>"#;
        let entities = parse_membership_table(body).unwrap();
        let symbols: Vec<&str> = entities.iter().map(|e| e.symbol.as_str()).collect();
        assert_eq!(symbols, vec!["AAPL", "BRK.B", "MSFT"]);
        assert_eq!(entities[2].name, "Microsoft");
    }

    #[test]
    fn test_membership_header_change_is_format_error() {
        let body = r#"<table id="constituents"><tr><th>Ticker</th><th>Company</th></tr>
            <tr><td>AAPL</td><td>Apple Inc.</td></tr></table>"#;
        let err = parse_membership_table(body).unwrap_err();
        assert!(matches!(err, FetchError::SourceFormat(_)));
        assert!(parse_membership_table("<html>no table</html>").is_err());
    }

    #[test]
    fn test_parse_next_report_date_cuts_on_char_boundary() {
        // No closing row tag and a multi-byte quote straddling the cut.
        let body = format!(
            "<th>Next Report Date</th><td>{}\u{2019} 4/25/2024 more text",
            "x".repeat(502)
        );
        assert_eq!(parse_next_report_date(&body, New_York).unwrap(), None);

        let body = format!("<th>Next Report Date</th><td>\u{2019}\u{2019} 4/25/2024{}", "é".repeat(600));
        assert_eq!(
            parse_next_report_date(&body, New_York).unwrap(),
            Some(start_of_day(NaiveDate::from_ymd_opt(2024, 4, 25).unwrap(), New_York))
        );
    }

    #[test]
    fn test_parse_earnings_missing_table_is_format_error() {
        let err = parse_earnings_announcements("<html></html>", New_York).unwrap_err();
        assert!(matches!(err, FetchError::SourceFormat(_)));
        assert!(!err.is_transient());
    }

    #[test]
    fn test_parse_next_report_date() {
        let body = r#"<table><tr><th>Next Report Date</th><td>*AMC 4/25/2024</td></tr></table>"#;
        let next = parse_next_report_date(body, New_York).unwrap();
        assert_eq!(
            next,
            Some(start_of_day(NaiveDate::from_ymd_opt(2024, 4, 25).unwrap(), New_York))
        );

        let body = r#"<tr><th>Next Report Date</th><td>NA</td></tr>"#;
        assert_eq!(parse_next_report_date(body, New_York).unwrap(), None);
    }

    #[test]
    fn test_parse_description() {
        let body = r#"<div><p class="description__text">Apple Inc. designs <b>phones</b> &amp; more.</p></div>"#;
        assert_eq!(parse_description(body), "Apple Inc. designs phones & more.");
        assert_eq!(parse_description("<html></html>"), "");
    }

    #[test]
    fn test_parse_chart() {
        // 2024-01-24 and 2024-01-25 14:30 UTC (09:30 New York).
        let body = r#"{"chart": {"result": [{
            "timestamp": [1706106600, 1706193000, 1706279400],
            "indicators": {"quote": [{
                "open": [100.0, 101.0, null],
                "high": [102.0, 103.0, null],
                "low": [99.0, 100.0, null],
                "close": [101.0, 102.5, null],
                "volume": [1000, 2000, null]
            }]},
            "events": {"dividends": {"1706193000": {"amount": 0.24, "date": 1706193000}}}
        }], "error": null}}"#;
        let bars = parse_chart(body, New_York).unwrap();
        assert_eq!(bars.len(), 2);
        assert_eq!(
            bars[1].date,
            start_of_day(NaiveDate::from_ymd_opt(2024, 1, 25).unwrap(), New_York)
        );
        assert_eq!(bars[1].close, 102.5);
        assert_eq!(bars[1].dividends, 0.24);
        assert_eq!(bars[0].dividends, 0.0);
    }

    #[test]
    fn test_parse_chart_error() {
        let body = r#"{"chart": {"result": null, "error": {"code": "Not Found"}}}"#;
        assert!(matches!(
            parse_chart(body, New_York),
            Err(FetchError::SourceFormat(_))
        ));
    }

    #[test]
    fn test_parse_quotes() {
        let body = r#"{"AAPL": {"last": "189.50"}, "MSFT": {"last": 410.2}}"#;
        let symbols = vec![Symbol::new("AAPL"), Symbol::new("MSFT"), Symbol::new("GOOG")];
        let quotes = parse_quotes(body, &symbols);
        assert_eq!(quotes[&Symbol::new("AAPL")], Some(189.5));
        assert_eq!(quotes[&Symbol::new("MSFT")], Some(410.2));
        assert_eq!(quotes[&Symbol::new("GOOG")], None);
    }
}
