//! Aggregation engine
//!
//! Owns every piece of mutable state (directory, in-progress bars, indicator
//! state, active set) and is driven from a single task: the feed supervisor
//! calls into it one event at a time, so minute finalization, rotation and
//! tick folding are strictly ordered without locks.
//!
//! Per tick batch:
//! 1. advance the minute; finalize every open bar of the previous minute,
//!    fold it into indicators, publish bar and snapshot
//! 2. rotate the active set if a rotation window is open
//! 3. beat the heartbeat
//! 4. fold the batch's ticks into in-progress bars

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use types::ids::{InstrumentToken, Symbol};
use types::tick::Tick;

use crate::backfill::BackfillLoader;
use crate::cache::MarketCache;
use crate::candles::{minute_index, Bar, BarAggregator};
use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::directory::{InstrumentDirectory, InstrumentSource};
use crate::error::EngineError;
use crate::feed::{FeedControl, FeedHandler, FeedSupervisor, FeedTransport, Heartbeat};
use crate::indicators::{IndicatorEngine, Snapshot};
use crate::metrics::EngineMetrics;
use crate::publisher::Publisher;
use crate::subscription::{compute_active, resolve_pinned, ActiveSet, RotationDelta, SubscriptionManager};

pub struct TickerEngine {
    config: EngineConfig,
    directory: InstrumentDirectory,
    aggregator: BarAggregator,
    indicators: IndicatorEngine,
    subscriptions: SubscriptionManager,
    publisher: Publisher,
    clock: Arc<dyn Clock>,
    heartbeat: Heartbeat,
    metrics: Arc<EngineMetrics>,
    /// Tokens subscribed on the current connection.
    subscribed: BTreeSet<InstrumentToken>,
}

impl TickerEngine {
    /// Load the directory, publish its maps and the initial active set.
    ///
    /// Fails if the configuration is invalid or no instrument resolves.
    pub async fn bootstrap(
        config: EngineConfig,
        source: &dyn InstrumentSource,
        cache: Arc<dyn MarketCache>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, EngineError> {
        config.validate()?;
        let directory = InstrumentDirectory::load(source, &config.feed.exchanges).await?;

        let metrics = Arc::new(EngineMetrics::new());
        let publisher = Publisher::new(cache, config.publish.clone(), metrics.clone());
        publisher.publish_instrument_maps(directory.token_to_symbol()).await;

        let pinned = resolve_pinned(&publisher.pinned_symbols().await, &directory);
        let limit = publisher.universe_limit(config.rotation.universe_limit).await;
        let active = compute_active(&pinned, directory.tokens(), limit);

        info!(
            instruments = directory.len(),
            active = active.len(),
            pinned = active.pinned().len(),
            limit,
            "Engine bootstrapped"
        );

        let engine = Self {
            aggregator: BarAggregator::new(),
            indicators: IndicatorEngine::new(config.indicators.clone()),
            subscriptions: SubscriptionManager::new(config.rotation.clone(), active),
            publisher,
            clock,
            heartbeat: Heartbeat::new(),
            metrics,
            subscribed: BTreeSet::new(),
            directory,
            config,
        };
        engine
            .publish_active_set(engine.subscriptions.active().tokens())
            .await;
        Ok(engine)
    }

    /// Seed indicator state for every active instrument from history.
    /// Per-instrument failures are logged and skipped.
    pub async fn backfill(&mut self, loader: &BackfillLoader) {
        let (from_ms, to_ms) = loader.window(self.clock.now_ms());
        let mut seeded = 0usize;

        for token in self.subscriptions.active().tokens() {
            let Some(symbol) = self.directory.resolve_symbol(token).cloned() else {
                continue;
            };
            let bars = match loader.seed(token, from_ms, to_ms).await {
                Ok(bars) => bars,
                Err(e) => {
                    warn!(symbol = %symbol, error = %e, "Backfill failed, starting cold");
                    self.metrics.record_backfill_failure();
                    continue;
                }
            };
            for bar in &bars {
                self.indicators.on_bar_finalized(token, bar);
                self.publisher.publish_bar(&symbol, bar).await;
            }
            if let Some(last) = bars.last() {
                if let Some(snapshot) = self.indicators.snapshot(token) {
                    let snapshot = snapshot.with_ts(last.minute_start * 1000);
                    self.publisher.publish_backfill_snapshot(&symbol, &snapshot).await;
                }
                seeded += 1;
            }
            self.metrics.record_backfill(bars.len() as u64);
        }

        info!(seeded, from_ms, to_ms, "Backfill complete");
    }

    /// Run the live loop until stopped or the session expires.
    pub async fn run<T: FeedTransport>(
        &mut self,
        transport: T,
        stop: watch::Receiver<bool>,
    ) -> Result<(), EngineError> {
        let mut supervisor = FeedSupervisor::new(transport, self.config.feed.retry_delay);
        supervisor.run(self, stop).await?;
        Ok(())
    }

    async fn publish_active_set(&self, tokens: impl IntoIterator<Item = InstrumentToken>) {
        let symbols: Vec<Symbol> = tokens
            .into_iter()
            .filter_map(|t| self.directory.resolve_symbol(t).cloned())
            .collect();
        self.publisher.publish_active_set(&symbols).await;
    }

    /// Active tokens the feed has actually accepted.
    fn live_tokens(&self) -> BTreeSet<InstrumentToken> {
        self.subscriptions
            .active()
            .tokens()
            .intersection(&self.subscribed)
            .copied()
            .collect()
    }

    async fn subscribe(&mut self, control: &dyn FeedControl, tokens: &[InstrumentToken]) {
        if tokens.is_empty() {
            return;
        }
        if let Err(e) = control.subscribe(tokens).await {
            warn!(count = tokens.len(), error = %e, "Subscribe failed");
            return;
        }
        if let Err(e) = control.set_full_mode(tokens).await {
            warn!(count = tokens.len(), error = %e, "Full mode request failed");
        }
        self.subscribed.extend(tokens.iter().copied());
        self.metrics.set_subscribed(self.subscribed.len() as u64);
    }

    async fn unsubscribe(&mut self, control: &dyn FeedControl, tokens: &[InstrumentToken]) {
        if tokens.is_empty() {
            return;
        }
        for token in tokens {
            self.aggregator.discard(*token);
        }
        // kept as subscribed so the next rotation retries
        if let Err(e) = control.unsubscribe(tokens).await {
            warn!(count = tokens.len(), error = %e, "Unsubscribe failed");
            return;
        }
        for token in tokens {
            self.subscribed.remove(token);
        }
        self.metrics.set_subscribed(self.subscribed.len() as u64);
    }

    async fn finalize(&mut self, token: InstrumentToken, bar: Bar, now_ms: i64) {
        self.indicators.on_bar_finalized(token, &bar);
        self.subscriptions.record_turnover(token, bar.turnover());
        let Some(symbol) = self.directory.resolve_symbol(token).cloned() else {
            return;
        };
        self.publisher.publish_bar(&symbol, &bar).await;
        if let Some(snapshot) = self.indicators.snapshot(token) {
            self.publisher
                .publish_snapshot(&symbol, &snapshot.with_ts(now_ms))
                .await;
        }
    }

    /// Re-rank the active set and apply only the subscription deltas.
    ///
    /// Deltas are taken against what the feed actually holds, so a token
    /// whose subscribe failed earlier is requested again.
    async fn rotate(&mut self, control: &dyn FeedControl, now_secs: i64) -> RotationDelta {
        let pinned = resolve_pinned(&self.publisher.pinned_symbols().await, &self.directory);
        let limit = self
            .publisher
            .universe_limit(self.config.rotation.universe_limit)
            .await;
        self.subscriptions.rotate(now_secs, &pinned, self.directory.tokens(), limit);
        self.metrics.record_rotation();

        let delta = RotationDelta::between(&self.subscribed, &self.subscriptions.active().tokens());
        self.subscribe(control, &delta.to_add).await;
        self.unsubscribe(control, &delta.to_remove).await;
        self.publish_active_set(self.live_tokens()).await;
        delta
    }

    pub fn active(&self) -> &ActiveSet {
        self.subscriptions.active()
    }

    pub fn subscribed(&self) -> &BTreeSet<InstrumentToken> {
        &self.subscribed
    }

    pub fn directory(&self) -> &InstrumentDirectory {
        &self.directory
    }

    pub fn snapshot(&self, token: InstrumentToken) -> Option<Snapshot> {
        self.indicators.snapshot(token)
    }

    pub fn current_bar(&self, token: InstrumentToken) -> Option<&Bar> {
        self.aggregator.current_bar(token)
    }

    pub fn metrics(&self) -> Arc<EngineMetrics> {
        self.metrics.clone()
    }

    pub fn heartbeat(&self) -> Heartbeat {
        self.heartbeat.clone()
    }

    /// Whether the feed counts as live right now.
    pub fn is_live(&self) -> bool {
        self.heartbeat
            .is_live(self.clock.now_ms(), self.config.feed.heartbeat_max_age_ms)
    }
}

#[async_trait]
impl FeedHandler for TickerEngine {
    async fn on_connected(&mut self, control: &dyn FeedControl) {
        // a fresh connection carries no subscriptions
        self.subscribed.clear();
        let tokens: Vec<InstrumentToken> = self.subscriptions.active().tokens().into_iter().collect();
        self.subscribe(control, &tokens).await;
        self.publish_active_set(self.live_tokens()).await;
        info!(subscribed = self.subscribed.len(), "Active set subscribed");
    }

    async fn on_ticks(&mut self, ticks: Vec<Value>, control: &dyn FeedControl) {
        let started = Instant::now();
        let now_ms = self.clock.now_ms();

        let finalized = self.aggregator.roll_minute(minute_index(now_ms));
        if !finalized.is_empty() {
            self.metrics.record_bars_finalized(finalized.len() as u64);
            debug!(bars = finalized.len(), "Minute rolled");
            for (token, bar) in finalized {
                self.finalize(token, bar, now_ms).await;
            }
        }

        let now_secs = now_ms.div_euclid(1000);
        if self.subscriptions.rotation_due(now_secs) {
            self.rotate(control, now_secs).await;
        }

        self.heartbeat.beat(now_ms);
        self.publisher.heartbeat(now_ms).await;

        let count = ticks.len() as u64;
        for raw in &ticks {
            let tick = match Tick::from_value(raw, now_ms) {
                Ok(tick) => tick,
                Err(e) => {
                    debug!(error = %e, "Rejected tick");
                    self.metrics.record_rejected_tick();
                    continue;
                }
            };
            // late ticks for instruments already rotated out
            if !self.subscriptions.active().contains(tick.token) {
                continue;
            }
            self.aggregator.on_tick(&tick);
            if let Some(symbol) = self.directory.resolve_symbol(tick.token) {
                self.publisher
                    .publish_last_price(symbol, tick.price, now_ms)
                    .await;
            }
        }

        self.metrics
            .record_batch(count, started.elapsed().as_nanos() as u64);
    }

    async fn on_disconnected(&mut self, reason: &str) {
        warn!(reason, "Feed disconnected");
        self.subscribed.clear();
        self.metrics.record_reconnect();
        self.publisher.feed_down().await;
    }
}
