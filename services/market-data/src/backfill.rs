//! Historical backfill
//!
//! Before live streaming starts, each active instrument is seeded with its
//! recent one-minute bars from the broker's historical query so indicators
//! start warm. A failed query for one instrument is logged and skipped; that
//! instrument starts cold once its live ticks arrive.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime};
use rust_decimal::Decimal;
use serde_json::Value;
use tracing::{debug, warn};
use types::ids::InstrumentToken;
use types::numeric::decimal_or;

use crate::candles::Bar;
use crate::error::BackfillError;

/// Minutes added in front of the configured lookback so the first requested
/// minute is complete.
const WINDOW_SLACK_MIN: i64 = 2;

/// Broker historical-bar query.
#[async_trait]
pub trait HistoricalSource: Send + Sync {
    /// Bars for `token` between `from_ms` and `to_ms` (epoch milliseconds),
    /// oldest first.
    async fn bars(
        &self,
        token: InstrumentToken,
        from_ms: i64,
        to_ms: i64,
        interval: &str,
    ) -> Result<Vec<Value>, BackfillError>;
}

/// Parse a bar timestamp: RFC 3339 / ISO text, `YYYY-MM-DD HH:MM:SS` text
/// (read as UTC), or epoch seconds/milliseconds. Returns epoch seconds.
fn parse_timestamp(value: &Value) -> Option<i64> {
    match value {
        Value::String(s) => {
            let s = s.trim();
            DateTime::parse_from_rfc3339(s)
                .map(|dt| dt.timestamp())
                .or_else(|_| DateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%z").map(|dt| dt.timestamp()))
                .or_else(|_| NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S").map(|dt| dt.and_utc().timestamp()))
                .ok()
        }
        Value::Number(n) => {
            let raw = n.as_i64()?;
            Some(if raw > 100_000_000_000 { raw / 1000 } else { raw })
        }
        _ => None,
    }
}

/// Parse one historical row into a finalized bar.
///
/// Rows without a timestamp or a usable close are dropped. Missing
/// open/high/low fall back to the close, missing volume to zero. The VWAP
/// accumulators are `(close·volume, volume)` since intra-minute trades are
/// not available.
pub fn parse_historical_row(row: &Value) -> Option<Bar> {
    let ts = parse_timestamp(row.get("date").or_else(|| row.get("ts"))?)?;
    let close = decimal_or(row.get("close"), Decimal::NEGATIVE_ONE);
    if close.is_sign_negative() {
        return None;
    }
    let open = decimal_or(row.get("open"), close);
    let high = decimal_or(row.get("high"), close).max(open).max(close);
    let low = decimal_or(row.get("low"), close).min(open).min(close);
    let volume = decimal_or(row.get("volume"), Decimal::ZERO).max(Decimal::ZERO);

    Some(Bar {
        minute_start: ts.div_euclid(60) * 60,
        open,
        high,
        low,
        close,
        volume,
        price_qty_sum: close * volume,
        qty_sum: volume,
    })
}

/// Fetches and normalizes historical bars.
pub struct BackfillLoader {
    source: Arc<dyn HistoricalSource>,
    lookback_minutes: i64,
    interval: String,
    bars_cap: usize,
}

impl BackfillLoader {
    pub fn new(
        source: Arc<dyn HistoricalSource>,
        lookback_minutes: i64,
        interval: impl Into<String>,
        bars_cap: usize,
    ) -> Self {
        Self {
            source,
            lookback_minutes,
            interval: interval.into(),
            bars_cap,
        }
    }

    /// Query window ending at `now_ms`.
    pub fn window(&self, now_ms: i64) -> (i64, i64) {
        let from = now_ms - (self.lookback_minutes + WINDOW_SLACK_MIN) * 60_000;
        (from, now_ms)
    }

    /// Bars for one instrument in chronological order, at most `bars_cap` of
    /// the most recent ones, one per minute.
    pub async fn seed(
        &self,
        token: InstrumentToken,
        from_ms: i64,
        to_ms: i64,
    ) -> Result<Vec<Bar>, BackfillError> {
        let rows = self
            .source
            .bars(token, from_ms, to_ms, &self.interval)
            .await?;
        let total = rows.len();
        let mut bars: Vec<Bar> = rows.iter().filter_map(parse_historical_row).collect();
        if bars.len() < total {
            warn!(
                token = token.get(),
                dropped = total - bars.len(),
                "Dropped malformed historical rows"
            );
        }
        bars.sort_by_key(|b| b.minute_start);
        bars.dedup_by_key(|b| b.minute_start);
        if bars.len() > self.bars_cap {
            bars.drain(..bars.len() - self.bars_cap);
        }
        debug!(token = token.get(), bars = bars.len(), "Historical bars loaded");
        Ok(bars)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct FixedSource(Vec<Value>);

    #[async_trait]
    impl HistoricalSource for FixedSource {
        async fn bars(
            &self,
            token: InstrumentToken,
            _from_ms: i64,
            _to_ms: i64,
            _interval: &str,
        ) -> Result<Vec<Value>, BackfillError> {
            if token.get() == 0 {
                return Err(BackfillError::QueryFailed {
                    token,
                    reason: "bad token".into(),
                });
            }
            Ok(self.0.clone())
        }
    }

    #[test]
    fn test_parse_row_rfc3339() {
        let row = json!({
            "date": "2024-03-04T09:15:00+05:30",
            "open": 100, "high": "101.5", "low": 99, "close": 100.5, "volume": 1200
        });
        let bar = parse_historical_row(&row).unwrap();
        assert_eq!(bar.minute_start, 1_709_523_900);
        assert_eq!(bar.high, Decimal::new(1015, 1));
        assert_eq!(bar.qty_sum, Decimal::from(1200));
        assert_eq!(bar.price_qty_sum, Decimal::new(1005, 1) * Decimal::from(1200));
    }

    #[test]
    fn test_parse_row_lenient() {
        let row = json!({"date": 1_709_523_930, "close": "250", "volume": "n/a"});
        let bar = parse_historical_row(&row).unwrap();
        assert_eq!(bar.minute_start, 1_709_523_900);
        assert_eq!(bar.open, Decimal::from(250));
        assert_eq!(bar.volume, Decimal::ZERO);
        assert!(bar.is_valid());

        assert!(parse_historical_row(&json!({"date": "yesterday", "close": 1})).is_none());
        assert!(parse_historical_row(&json!({"date": 60, "close": null})).is_none());
    }

    #[test]
    fn test_window_includes_slack() {
        let loader = BackfillLoader::new(Arc::new(FixedSource(vec![])), 120, "minute", 480);
        let (from, to) = loader.window(10_000_000);
        assert_eq!(to - from, 122 * 60_000);
    }

    #[tokio::test]
    async fn test_seed_sorts_and_caps() {
        let rows: Vec<Value> = (0..10)
            .rev()
            .map(|i| json!({"date": i * 60, "open": i, "high": i, "low": i, "close": i, "volume": 1}))
            .collect();
        let loader = BackfillLoader::new(Arc::new(FixedSource(rows)), 120, "minute", 4);
        let bars = loader.seed(InstrumentToken::new(1), 0, 600_000).await.unwrap();
        let starts: Vec<i64> = bars.iter().map(|b| b.minute_start).collect();
        assert_eq!(starts, vec![360, 420, 480, 540]);
    }

    #[tokio::test]
    async fn test_seed_propagates_query_failure() {
        let loader = BackfillLoader::new(Arc::new(FixedSource(vec![])), 120, "minute", 4);
        assert!(loader.seed(InstrumentToken::new(0), 0, 1).await.is_err());
    }
}
