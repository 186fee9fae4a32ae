//! Redis-backed [`MarketCache`]
//!
//! Uses one multiplexed async connection, cloned per call. Bar history is a
//! capped list (LPUSH + LTRIM), the per-day archive an expiring list
//! (RPUSH + EXPIRE), snapshots and last prices are SETEX strings,
//! the active set is swapped inside a MULTI/EXEC block.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use tracing::{debug, info, warn};
use types::ids::{InstrumentToken, Symbol};

use crate::cache::{keys, parse_symbols, BarRecord, LastPrice, MarketCache};
use crate::error::CacheError;
use crate::indicators::Snapshot;

pub struct RedisCache {
    connection: MultiplexedConnection,
}

impl RedisCache {
    pub async fn connect(redis_url: &str) -> Result<Self, CacheError> {
        let client = redis::Client::open(redis_url)?;
        let connection = client.get_multiplexed_async_connection().await?;
        info!(url = %redis_url, "Connected to Redis");
        Ok(Self { connection })
    }

    fn conn(&self) -> MultiplexedConnection {
        self.connection.clone()
    }

    /// TTL in whole seconds, at least one.
    fn ttl_secs(ttl: Duration) -> u64 {
        ttl.as_secs().max(1)
    }
}

#[async_trait]
impl MarketCache for RedisCache {
    async fn push_bar(&self, symbol: &Symbol, record: &BarRecord, cap: usize) -> Result<(), CacheError> {
        let key = keys::bars(symbol);
        let json = serde_json::to_string(record)?;
        let mut conn = self.conn();
        let _: () = redis::pipe()
            .lpush(&key, json)
            .ignore()
            .ltrim(&key, 0, cap as isize - 1)
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn recent_bars(&self, symbol: &Symbol, limit: usize) -> Result<Vec<BarRecord>, CacheError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.conn();
        let raw: Vec<String> = conn.lrange(keys::bars(symbol), 0, limit as isize - 1).await?;
        let mut bars = Vec::with_capacity(raw.len());
        for json in raw {
            match serde_json::from_str::<BarRecord>(&json) {
                Ok(bar) => bars.push(bar),
                Err(e) => warn!(symbol = %symbol, error = %e, "Skipping unreadable bar record"),
            }
        }
        Ok(bars)
    }

    async fn append_daily_bar(
        &self,
        symbol: &Symbol,
        date: NaiveDate,
        record: &BarRecord,
        ttl: Duration,
    ) -> Result<(), CacheError> {
        let key = keys::daily_bars(symbol, date);
        let json = serde_json::to_string(record)?;
        let mut conn = self.conn();
        let _: () = redis::pipe()
            .rpush(&key, json)
            .ignore()
            .expire(&key, Self::ttl_secs(ttl) as i64)
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn daily_bars(&self, symbol: &Symbol, date: NaiveDate) -> Result<Vec<BarRecord>, CacheError> {
        let mut conn = self.conn();
        let raw: Vec<String> = conn.lrange(keys::daily_bars(symbol, date), 0, -1).await?;
        let mut bars = Vec::with_capacity(raw.len());
        for json in raw {
            match serde_json::from_str::<BarRecord>(&json) {
                Ok(bar) => bars.push(bar),
                Err(e) => warn!(symbol = %symbol, error = %e, "Skipping unreadable bar record"),
            }
        }
        Ok(bars)
    }

    async fn set_snapshot(&self, symbol: &Symbol, snapshot: &Snapshot, ttl: Duration) -> Result<(), CacheError> {
        let json = serde_json::to_string(snapshot)?;
        let mut conn = self.conn();
        let _: () = conn
            .set_ex(keys::snapshot(symbol), json, Self::ttl_secs(ttl))
            .await?;
        Ok(())
    }

    async fn get_snapshot(&self, symbol: &Symbol) -> Result<Option<Snapshot>, CacheError> {
        let mut conn = self.conn();
        let raw: Option<String> = conn.get(keys::snapshot(symbol)).await?;
        raw.map(|json| serde_json::from_str(&json).map_err(CacheError::from))
            .transpose()
    }

    async fn set_last_price(&self, symbol: &Symbol, price: &LastPrice, ttl: Duration) -> Result<(), CacheError> {
        let json = serde_json::to_string(price)?;
        let mut conn = self.conn();
        let _: () = conn
            .set_ex(keys::last_price(symbol), json, Self::ttl_secs(ttl))
            .await?;
        Ok(())
    }

    async fn get_last_price(&self, symbol: &Symbol) -> Result<Option<LastPrice>, CacheError> {
        let mut conn = self.conn();
        let raw: Option<String> = conn.get(keys::last_price(symbol)).await?;
        raw.map(|json| serde_json::from_str(&json).map_err(CacheError::from))
            .transpose()
    }

    async fn replace_active_symbols(&self, symbols: &[Symbol]) -> Result<(), CacheError> {
        let members: Vec<String> = symbols.iter().map(|s| s.to_string()).collect();
        let mut pipe = redis::pipe();
        pipe.atomic().del(keys::ACTIVE_SYMBOLS).ignore();
        // SADD with no members is a protocol error
        if !members.is_empty() {
            pipe.sadd(keys::ACTIVE_SYMBOLS, members).ignore();
        }
        let mut conn = self.conn();
        let _: () = pipe.query_async(&mut conn).await?;
        debug!(count = symbols.len(), "Active symbols replaced");
        Ok(())
    }

    async fn active_symbols(&self) -> Result<BTreeSet<Symbol>, CacheError> {
        let mut conn = self.conn();
        let raw: Vec<String> = conn.smembers(keys::ACTIVE_SYMBOLS).await?;
        Ok(parse_symbols(raw))
    }

    async fn write_instrument_maps(&self, token_to_symbol: &BTreeMap<InstrumentToken, Symbol>) -> Result<(), CacheError> {
        if token_to_symbol.is_empty() {
            return Ok(());
        }
        let forward: Vec<(String, String)> = token_to_symbol
            .iter()
            .map(|(t, s)| (t.to_string(), s.to_string()))
            .collect();
        let reverse: Vec<(String, String)> = token_to_symbol
            .iter()
            .map(|(t, s)| (s.to_string(), t.to_string()))
            .collect();
        let mut conn = self.conn();
        let _: () = redis::pipe()
            .hset_multiple(keys::TOKEN_TO_SYMBOL, &forward)
            .ignore()
            .hset_multiple(keys::SYMBOL_TO_TOKEN, &reverse)
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn set_heartbeat(&self, now_ms: i64) -> Result<(), CacheError> {
        let mut conn = self.conn();
        let _: () = redis::pipe()
            .set(keys::ALIVE, now_ms.div_euclid(1000))
            .ignore()
            .set(keys::HEARTBEAT, now_ms)
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn heartbeat(&self) -> Result<Option<i64>, CacheError> {
        let mut conn = self.conn();
        let raw: Option<String> = conn.get(keys::HEARTBEAT).await?;
        Ok(raw.and_then(|r| r.trim().parse::<i64>().ok()))
    }

    async fn mark_feed_down(&self) -> Result<(), CacheError> {
        let mut conn = self.conn();
        let _: () = conn.set(keys::ALIVE, 0).await?;
        Ok(())
    }

    async fn pinned_symbols(&self) -> Result<BTreeSet<Symbol>, CacheError> {
        let mut conn = self.conn();
        let raw: Vec<String> = conn.smembers(keys::PINNED).await?;
        Ok(parse_symbols(raw))
    }

    async fn universe_limit(&self) -> Result<Option<usize>, CacheError> {
        let mut conn = self.conn();
        let raw: Option<String> = conn.get(keys::UNIVERSE_LIMIT).await?;
        Ok(raw.and_then(|r| r.trim().parse::<usize>().ok()))
    }
}
