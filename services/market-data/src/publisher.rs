//! Cache publisher
//!
//! The only path from the engine to the shared cache. Every write failure is
//! logged, counted and dropped here so a cache outage never reaches the tick
//! path.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use rust_decimal::Decimal;
use tracing::warn;
use types::ids::{InstrumentToken, Symbol};
use types::numeric::to_f64;

use crate::cache::{BarRecord, LastPrice, MarketCache};
use crate::candles::Bar;
use crate::config::PublishConfig;
use crate::error::CacheError;
use crate::indicators::Snapshot;
use crate::metrics::EngineMetrics;

pub struct Publisher {
    cache: Arc<dyn MarketCache>,
    config: PublishConfig,
    metrics: Arc<EngineMetrics>,
}

impl Publisher {
    pub fn new(cache: Arc<dyn MarketCache>, config: PublishConfig, metrics: Arc<EngineMetrics>) -> Self {
        Self {
            cache,
            config,
            metrics,
        }
    }

    fn swallow(&self, op: &'static str, symbol: Option<&Symbol>, result: Result<(), CacheError>) -> bool {
        match result {
            Ok(()) => true,
            Err(e) => {
                self.metrics.record_cache_failure();
                match symbol {
                    Some(sym) => warn!(op, symbol = %sym, error = %e, "Cache write failed"),
                    None => warn!(op, error = %e, "Cache write failed"),
                }
                false
            }
        }
    }

    /// Append a finalized bar to the symbol's capped history and to the
    /// archive for its session date.
    pub async fn publish_bar(&self, symbol: &Symbol, bar: &Bar) {
        let Some(record) = BarRecord::from_bar(bar, self.config.session_offset()) else {
            warn!(symbol = %symbol, minute_start = bar.minute_start, "Bar timestamp out of range");
            return;
        };
        let result = self.cache.push_bar(symbol, &record, self.config.bars_cap).await;
        self.swallow("push_bar", Some(symbol), result);

        if let Some(date) = record.session_date() {
            let result = self
                .cache
                .append_daily_bar(symbol, date, &record, self.config.daily_bars_ttl)
                .await;
            self.swallow("append_daily_bar", Some(symbol), result);
        }
    }

    /// Write a snapshot with the live TTL.
    pub async fn publish_snapshot(&self, symbol: &Symbol, snapshot: &Snapshot) {
        self.write_snapshot(symbol, snapshot, self.config.snapshot_ttl).await;
    }

    /// Write a snapshot with the longer post-backfill TTL.
    pub async fn publish_backfill_snapshot(&self, symbol: &Symbol, snapshot: &Snapshot) {
        self.write_snapshot(symbol, snapshot, self.config.backfill_snapshot_ttl).await;
    }

    async fn write_snapshot(&self, symbol: &Symbol, snapshot: &Snapshot, ttl: Duration) {
        let result = self.cache.set_snapshot(symbol, &snapshot.rounded(), ttl).await;
        if self.swallow("set_snapshot", Some(symbol), result) {
            self.metrics.record_snapshot();
        }
    }

    /// Intra-minute last price overlay.
    pub async fn publish_last_price(&self, symbol: &Symbol, price: Decimal, ts_ms: i64) {
        let record = LastPrice {
            last_price: to_f64(price.round_dp(2)),
            ts_ms,
        };
        let result = self
            .cache
            .set_last_price(symbol, &record, self.config.snapshot_ttl)
            .await;
        self.swallow("set_last_price", Some(symbol), result);
    }

    pub async fn publish_active_set(&self, symbols: &[Symbol]) {
        let result = self.cache.replace_active_symbols(symbols).await;
        self.swallow("replace_active_symbols", None, result);
    }

    pub async fn publish_instrument_maps(&self, token_to_symbol: &BTreeMap<InstrumentToken, Symbol>) {
        let result = self.cache.write_instrument_maps(token_to_symbol).await;
        self.swallow("write_instrument_maps", None, result);
    }

    pub async fn heartbeat(&self, now_ms: i64) {
        let result = self.cache.set_heartbeat(now_ms).await;
        self.swallow("set_heartbeat", None, result);
    }

    pub async fn feed_down(&self) {
        let result = self.cache.mark_feed_down().await;
        self.swallow("mark_feed_down", None, result);
    }

    /// Operator-pinned symbols; empty when the cache cannot be read.
    pub async fn pinned_symbols(&self) -> BTreeSet<Symbol> {
        self.cache.pinned_symbols().await.unwrap_or_else(|e| {
            warn!(error = %e, "Could not read pinned symbols");
            BTreeSet::new()
        })
    }

    /// Operator universe limit override, or `default` when unset or
    /// unreadable.
    pub async fn universe_limit(&self, default: usize) -> usize {
        match self.cache.universe_limit().await {
            Ok(Some(limit)) if limit > 0 => limit,
            Ok(_) => default,
            Err(e) => {
                warn!(error = %e, "Could not read universe limit override");
                default
            }
        }
    }
}
