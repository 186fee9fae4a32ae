//! Shared cache port
//!
//! Everything the engine publishes goes through [`MarketCache`]. Records are
//! stored as JSON strings under fixed key shapes so any adapter (Redis in
//! production, [`InMemoryCache`] in tests and embedded use) exposes the same
//! contract to downstream readers.
//!
//! A snapshot read returns `None` when the key is absent or its TTL has
//! elapsed. Consumers must treat that as "no live data", never as zeroed
//! indicators.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, NaiveDate};
use serde::{Deserialize, Serialize};
use tracing::debug;
use types::ids::{InstrumentToken, Symbol};
use types::numeric::to_f64;

use crate::candles::Bar;
use crate::clock::Clock;
use crate::error::CacheError;
use crate::indicators::Snapshot;

/// Key layout shared by every adapter.
pub mod keys {
    use chrono::NaiveDate;
    use types::ids::Symbol;

    pub const ACTIVE_SYMBOLS: &str = "symbols:active";
    pub const TOKEN_TO_SYMBOL: &str = "inst:token2sym";
    pub const SYMBOL_TO_TOKEN: &str = "inst:sym2token";
    /// Epoch seconds of the last tick batch, `0` once the feed drops.
    pub const ALIVE: &str = "ticker:alive";
    /// Epoch milliseconds of the last tick batch.
    pub const HEARTBEAT: &str = "ticker:heartbeat";
    pub const PINNED: &str = "cfg:pinned";
    pub const UNIVERSE_LIMIT: &str = "cfg:universe_limit";

    pub fn bars(symbol: &Symbol) -> String {
        format!("bars:{}", symbol)
    }

    /// Per-day bar archive, oldest first; `date` is the session date.
    pub fn daily_bars(symbol: &Symbol, date: NaiveDate) -> String {
        format!("bars:{}:{}", symbol, date.format("%Y-%m-%d"))
    }

    pub fn snapshot(symbol: &Symbol) -> String {
        format!("snap:{}", symbol)
    }

    pub fn last_price(symbol: &Symbol) -> String {
        format!("ltp:{}", symbol)
    }
}

/// Published form of a finalized bar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BarRecord {
    /// Minute open as RFC 3339 in the session offset.
    pub ts: String,
    #[serde(alias = "o")]
    pub open: f64,
    #[serde(alias = "h")]
    pub high: f64,
    #[serde(alias = "l")]
    pub low: f64,
    #[serde(alias = "c")]
    pub close: f64,
    #[serde(alias = "v")]
    pub volume: f64,
}

impl BarRecord {
    /// Convert a bar, stamping it in `offset`. `None` if the minute is out of
    /// the representable range.
    pub fn from_bar(bar: &Bar, offset: FixedOffset) -> Option<Self> {
        let ts = DateTime::from_timestamp(bar.minute_start, 0)?
            .with_timezone(&offset)
            .to_rfc3339();
        Some(Self {
            ts,
            open: to_f64(bar.open),
            high: to_f64(bar.high),
            low: to_f64(bar.low),
            close: to_f64(bar.close),
            volume: to_f64(bar.volume),
        })
    }

    /// Session date the bar belongs to, read from its stamped offset.
    pub fn session_date(&self) -> Option<NaiveDate> {
        DateTime::parse_from_rfc3339(&self.ts)
            .ok()
            .map(|ts| ts.date_naive())
    }
}

/// Intra-minute last traded price.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LastPrice {
    pub last_price: f64,
    pub ts_ms: i64,
}

/// Shared cache consumed by downstream services.
#[async_trait]
pub trait MarketCache: Send + Sync {
    /// Prepend a bar to the symbol's history, keeping at most `cap` entries.
    async fn push_bar(&self, symbol: &Symbol, record: &BarRecord, cap: usize) -> Result<(), CacheError>;

    /// Most recent bars first.
    async fn recent_bars(&self, symbol: &Symbol, limit: usize) -> Result<Vec<BarRecord>, CacheError>;

    /// Append a bar to the symbol's archive for `date` and (re)arm the
    /// archive's expiry.
    async fn append_daily_bar(
        &self,
        symbol: &Symbol,
        date: NaiveDate,
        record: &BarRecord,
        ttl: Duration,
    ) -> Result<(), CacheError>;

    /// Archived bars for `date`, oldest first. Empty once expired.
    async fn daily_bars(&self, symbol: &Symbol, date: NaiveDate) -> Result<Vec<BarRecord>, CacheError>;

    async fn set_snapshot(&self, symbol: &Symbol, snapshot: &Snapshot, ttl: Duration) -> Result<(), CacheError>;

    async fn get_snapshot(&self, symbol: &Symbol) -> Result<Option<Snapshot>, CacheError>;

    async fn set_last_price(&self, symbol: &Symbol, price: &LastPrice, ttl: Duration) -> Result<(), CacheError>;

    async fn get_last_price(&self, symbol: &Symbol) -> Result<Option<LastPrice>, CacheError>;

    /// Replace the published active set in one step.
    async fn replace_active_symbols(&self, symbols: &[Symbol]) -> Result<(), CacheError>;

    async fn active_symbols(&self) -> Result<BTreeSet<Symbol>, CacheError>;

    async fn write_instrument_maps(&self, token_to_symbol: &BTreeMap<InstrumentToken, Symbol>) -> Result<(), CacheError>;

    /// Record a received tick batch at `now_ms`.
    async fn set_heartbeat(&self, now_ms: i64) -> Result<(), CacheError>;

    /// Last heartbeat in epoch milliseconds.
    async fn heartbeat(&self) -> Result<Option<i64>, CacheError>;

    /// Flag the feed as down after a close or error.
    async fn mark_feed_down(&self) -> Result<(), CacheError>;

    /// Operator-pinned symbols. Unparseable members are skipped.
    async fn pinned_symbols(&self) -> Result<BTreeSet<Symbol>, CacheError>;

    /// Operator override of the universe limit.
    async fn universe_limit(&self) -> Result<Option<usize>, CacheError>;
}

pub(crate) fn parse_symbols(raw: impl IntoIterator<Item = String>) -> BTreeSet<Symbol> {
    raw.into_iter().filter_map(|s| Symbol::parse(&s).ok()).collect()
}

#[derive(Debug, Default)]
struct Store {
    /// value and optional expiry (epoch ms)
    strings: HashMap<String, (String, Option<i64>)>,
    lists: HashMap<String, VecDeque<String>>,
    /// expiry (epoch ms) of list keys that carry one
    list_expiry: HashMap<String, i64>,
    sets: HashMap<String, BTreeSet<String>>,
    hashes: HashMap<String, BTreeMap<String, String>>,
}

/// In-process cache with the same key layout and TTL semantics as Redis.
pub struct InMemoryCache {
    store: Mutex<Store>,
    clock: Arc<dyn Clock>,
    failing: AtomicBool,
}

impl InMemoryCache {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            store: Mutex::new(Store::default()),
            clock,
            failing: AtomicBool::new(false),
        }
    }

    /// Make every subsequent operation fail, simulating a backend outage.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Write an arbitrary string key (operator-side writes in tests).
    pub fn set_raw(&self, key: &str, value: &str) -> Result<(), CacheError> {
        self.with_store(|s| {
            s.strings.insert(key.to_string(), (value.to_string(), None));
        })
    }

    /// Add members to a set key (operator-side writes in tests).
    pub fn add_to_set(&self, key: &str, members: &[&str]) -> Result<(), CacheError> {
        self.with_store(|s| {
            let set = s.sets.entry(key.to_string()).or_default();
            set.extend(members.iter().map(|m| m.to_string()));
        })
    }

    /// Read a string key, honouring TTL.
    pub fn get_raw(&self, key: &str) -> Result<Option<String>, CacheError> {
        let now = self.clock.now_ms();
        self.with_store(|s| Self::live_string(s, key, now))
    }

    pub fn hash(&self, key: &str) -> Result<BTreeMap<String, String>, CacheError> {
        self.with_store(|s| s.hashes.get(key).cloned().unwrap_or_default())
    }

    fn live_string(store: &mut Store, key: &str, now_ms: i64) -> Option<String> {
        match store.strings.get(key) {
            Some((_, Some(expires))) if *expires <= now_ms => {
                store.strings.remove(key);
                None
            }
            Some((value, _)) => Some(value.clone()),
            None => None,
        }
    }

    fn live_list<'a>(store: &'a mut Store, key: &str, now_ms: i64) -> Option<&'a VecDeque<String>> {
        if matches!(store.list_expiry.get(key), Some(expires) if *expires <= now_ms) {
            store.list_expiry.remove(key);
            store.lists.remove(key);
            return None;
        }
        store.lists.get(key)
    }

    fn with_store<T>(&self, f: impl FnOnce(&mut Store) -> T) -> Result<T, CacheError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(CacheError::Backend("simulated outage".to_string()));
        }
        let mut store = self
            .store
            .lock()
            .map_err(|e| CacheError::Backend(format!("lock poisoned: {}", e)))?;
        Ok(f(&mut store))
    }

    fn set_string(&self, key: String, value: String, ttl: Option<Duration>) -> Result<(), CacheError> {
        let expires = ttl.map(|ttl| self.clock.now_ms() + ttl.as_millis() as i64);
        self.with_store(|s| {
            s.strings.insert(key, (value, expires));
        })
    }
}

#[async_trait]
impl MarketCache for InMemoryCache {
    async fn push_bar(&self, symbol: &Symbol, record: &BarRecord, cap: usize) -> Result<(), CacheError> {
        let json = serde_json::to_string(record)?;
        self.with_store(|s| {
            let list = s.lists.entry(keys::bars(symbol)).or_default();
            list.push_front(json);
            list.truncate(cap);
        })
    }

    async fn recent_bars(&self, symbol: &Symbol, limit: usize) -> Result<Vec<BarRecord>, CacheError> {
        let raw: Vec<String> = self.with_store(|s| {
            s.lists
                .get(&keys::bars(symbol))
                .map(|l| l.iter().take(limit).cloned().collect())
                .unwrap_or_default()
        })?;
        raw.iter()
            .map(|r| serde_json::from_str(r).map_err(CacheError::from))
            .collect()
    }

    async fn append_daily_bar(
        &self,
        symbol: &Symbol,
        date: NaiveDate,
        record: &BarRecord,
        ttl: Duration,
    ) -> Result<(), CacheError> {
        let json = serde_json::to_string(record)?;
        let key = keys::daily_bars(symbol, date);
        let now = self.clock.now_ms();
        self.with_store(|s| {
            // an expired archive starts over
            let _ = Self::live_list(s, &key, now);
            s.lists.entry(key.clone()).or_default().push_back(json);
            s.list_expiry.insert(key, now + ttl.as_millis() as i64);
        })
    }

    async fn daily_bars(&self, symbol: &Symbol, date: NaiveDate) -> Result<Vec<BarRecord>, CacheError> {
        let key = keys::daily_bars(symbol, date);
        let now = self.clock.now_ms();
        let raw: Vec<String> = self.with_store(|s| {
            Self::live_list(s, &key, now)
                .map(|l| l.iter().cloned().collect())
                .unwrap_or_default()
        })?;
        raw.iter()
            .map(|r| serde_json::from_str(r).map_err(CacheError::from))
            .collect()
    }

    async fn set_snapshot(&self, symbol: &Symbol, snapshot: &Snapshot, ttl: Duration) -> Result<(), CacheError> {
        let json = serde_json::to_string(snapshot)?;
        self.set_string(keys::snapshot(symbol), json, Some(ttl))
    }

    async fn get_snapshot(&self, symbol: &Symbol) -> Result<Option<Snapshot>, CacheError> {
        match self.get_raw(&keys::snapshot(symbol))? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    async fn set_last_price(&self, symbol: &Symbol, price: &LastPrice, ttl: Duration) -> Result<(), CacheError> {
        let json = serde_json::to_string(price)?;
        self.set_string(keys::last_price(symbol), json, Some(ttl))
    }

    async fn get_last_price(&self, symbol: &Symbol) -> Result<Option<LastPrice>, CacheError> {
        match self.get_raw(&keys::last_price(symbol))? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    async fn replace_active_symbols(&self, symbols: &[Symbol]) -> Result<(), CacheError> {
        let members: BTreeSet<String> = symbols.iter().map(|s| s.to_string()).collect();
        self.with_store(|s| {
            if members.is_empty() {
                s.sets.remove(keys::ACTIVE_SYMBOLS);
            } else {
                s.sets.insert(keys::ACTIVE_SYMBOLS.to_string(), members);
            }
        })
    }

    async fn active_symbols(&self) -> Result<BTreeSet<Symbol>, CacheError> {
        let raw = self.with_store(|s| s.sets.get(keys::ACTIVE_SYMBOLS).cloned().unwrap_or_default())?;
        Ok(parse_symbols(raw))
    }

    async fn write_instrument_maps(&self, token_to_symbol: &BTreeMap<InstrumentToken, Symbol>) -> Result<(), CacheError> {
        self.with_store(|s| {
            let forward = s.hashes.entry(keys::TOKEN_TO_SYMBOL.to_string()).or_default();
            for (token, symbol) in token_to_symbol {
                forward.insert(token.to_string(), symbol.to_string());
            }
            let reverse = s.hashes.entry(keys::SYMBOL_TO_TOKEN.to_string()).or_default();
            for (token, symbol) in token_to_symbol {
                reverse.insert(symbol.to_string(), token.to_string());
            }
        })
    }

    async fn set_heartbeat(&self, now_ms: i64) -> Result<(), CacheError> {
        self.set_string(keys::ALIVE.to_string(), now_ms.div_euclid(1000).to_string(), None)?;
        self.set_string(keys::HEARTBEAT.to_string(), now_ms.to_string(), None)
    }

    async fn heartbeat(&self) -> Result<Option<i64>, CacheError> {
        Ok(self
            .get_raw(keys::HEARTBEAT)?
            .and_then(|raw| raw.parse::<i64>().ok()))
    }

    async fn mark_feed_down(&self) -> Result<(), CacheError> {
        debug!("Marking feed down");
        self.set_string(keys::ALIVE.to_string(), "0".to_string(), None)
    }

    async fn pinned_symbols(&self) -> Result<BTreeSet<Symbol>, CacheError> {
        let raw = self.with_store(|s| s.sets.get(keys::PINNED).cloned().unwrap_or_default())?;
        Ok(parse_symbols(raw))
    }

    async fn universe_limit(&self) -> Result<Option<usize>, CacheError> {
        Ok(self
            .get_raw(keys::UNIVERSE_LIMIT)?
            .and_then(|raw| raw.trim().parse::<usize>().ok()))
    }
}
