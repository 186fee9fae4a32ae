//! Engine configuration
//!
//! All tunables are environment-supplied in production. Every value has a
//! default, and a malformed variable falls back to that default rather than
//! aborting startup.

use std::time::Duration;

use chrono::{FixedOffset, Offset, Utc};
use types::numeric::parse_or;

use crate::error::ConfigError;

/// Window lengths and band widths for the rolling indicator engine.
#[derive(Debug, Clone, PartialEq)]
pub struct IndicatorConfig {
    /// Fast EMA length (EMA_FAST).
    pub ema_fast: usize,
    /// Slow EMA length (EMA_SLOW).
    pub ema_slow: usize,
    /// Wilder RSI length (RSI_LEN).
    pub rsi_len: usize,
    /// Wilder ATR length (ATR_LEN).
    pub atr_len: usize,
    /// Bollinger window (BB_LEN).
    pub bb_len: usize,
    /// Bollinger width in standard deviations (BB_STD).
    pub bb_std: f64,
    /// Donchian window (DONCHIAN_LEN).
    pub donchian_len: usize,
    /// Rolling VWAP window in minutes (VWAP_ROLL_MIN).
    pub vwap_roll_min: usize,
    /// Volume baseline window in minutes (VOL_BASELINE_MIN).
    pub vol_baseline_min: usize,
    /// Opening range length in minutes (ORB_WINDOW_MIN).
    pub orb_window_min: i64,
}

impl IndicatorConfig {
    /// Length of the close history: the largest window any close-based
    /// indicator needs.
    pub fn close_history_len(&self) -> usize {
        [
            self.bb_len,
            self.rsi_len,
            self.ema_slow,
            self.atr_len,
            self.donchian_len,
        ]
        .into_iter()
        .max()
        .unwrap_or(1)
    }
}

impl Default for IndicatorConfig {
    fn default() -> Self {
        Self {
            ema_fast: 9,
            ema_slow: 21,
            rsi_len: 14,
            atr_len: 14,
            bb_len: 20,
            bb_std: 2.0,
            donchian_len: 20,
            vwap_roll_min: 60,
            vol_baseline_min: 20,
            orb_window_min: 30,
        }
    }
}

/// Active-set sizing and rotation cadence.
#[derive(Debug, Clone, PartialEq)]
pub struct RotationConfig {
    /// Maximum number of subscribed instruments (UNIVERSE_LIMIT).
    pub universe_limit: usize,
    /// Rotation cadence in seconds (SUB_ROTATE_INTERVAL_SEC).
    pub interval_secs: i64,
    /// Width of the window after each interval mark in which a rotation may
    /// run (SUB_ROTATE_WINDOW_SEC).
    pub window_secs: i64,
    /// Trailing turnover window in minutes (RANK_WINDOW_MIN).
    pub rank_window_min: usize,
}

impl Default for RotationConfig {
    fn default() -> Self {
        Self {
            universe_limit: 200,
            interval_secs: 120,
            window_secs: 2,
            rank_window_min: 10,
        }
    }
}

/// Broker feed and backfill settings.
#[derive(Debug, Clone, PartialEq)]
pub struct FeedConfig {
    /// Exchanges whose equities form the universe (EXCHANGES).
    pub exchanges: Vec<String>,
    /// Fixed delay between reconnect attempts (FEED_RETRY_DELAY_MS).
    pub retry_delay: Duration,
    /// Heartbeat age beyond which the feed counts as not live
    /// (TICKER_HEARTBEAT_MAX_AGE_MS).
    pub heartbeat_max_age_ms: i64,
    /// Minutes of history requested per instrument at startup
    /// (HIST_BACKFILL_MIN).
    pub backfill_minutes: i64,
    /// Historical bar interval name passed to the broker (HIST_INTERVAL).
    pub backfill_interval: String,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            exchanges: vec!["NSE".to_string(), "BSE".to_string()],
            retry_delay: Duration::from_secs(2),
            heartbeat_max_age_ms: 15_000,
            backfill_minutes: 120,
            backfill_interval: "minute".to_string(),
        }
    }
}

/// Cache publication settings.
#[derive(Debug, Clone, PartialEq)]
pub struct PublishConfig {
    /// Per-symbol bar history capacity (BARS_CAP).
    pub bars_cap: usize,
    /// TTL of live snapshots and last-price records (SNAPSHOT_TTL_SEC).
    pub snapshot_ttl: Duration,
    /// TTL of the snapshot written after backfill (BACKFILL_SNAPSHOT_TTL_SEC).
    pub backfill_snapshot_ttl: Duration,
    /// Session offset used for published bar timestamps
    /// (SESSION_UTC_OFFSET_MIN).
    pub utc_offset_minutes: i32,
    /// Retention of the per-day bar archive (DAILY_BARS_TTL_DAYS).
    pub daily_bars_ttl: Duration,
}

impl PublishConfig {
    pub fn session_offset(&self) -> FixedOffset {
        FixedOffset::east_opt(self.utc_offset_minutes * 60).unwrap_or_else(|| Utc.fix())
    }
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            bars_cap: 480,
            snapshot_ttl: Duration::from_secs(120),
            backfill_snapshot_ttl: Duration::from_secs(3600),
            utc_offset_minutes: 330,
            daily_bars_ttl: Duration::from_secs(14 * 86_400),
        }
    }
}

/// Complete engine configuration.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct EngineConfig {
    pub indicators: IndicatorConfig,
    pub rotation: RotationConfig,
    pub feed: FeedConfig,
    pub publish: PublishConfig,
}

impl EngineConfig {
    /// Load from process environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from an arbitrary key lookup. Absent or malformed values keep
    /// their defaults.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let d = Self::default();
        let get = |key: &str| lookup(key);

        let indicators = IndicatorConfig {
            ema_fast: parse_or(get("EMA_FAST").as_deref(), d.indicators.ema_fast),
            ema_slow: parse_or(get("EMA_SLOW").as_deref(), d.indicators.ema_slow),
            rsi_len: parse_or(get("RSI_LEN").as_deref(), d.indicators.rsi_len),
            atr_len: parse_or(get("ATR_LEN").as_deref(), d.indicators.atr_len),
            bb_len: parse_or(get("BB_LEN").as_deref(), d.indicators.bb_len),
            bb_std: parse_or(get("BB_STD").as_deref(), d.indicators.bb_std),
            donchian_len: parse_or(get("DONCHIAN_LEN").as_deref(), d.indicators.donchian_len),
            vwap_roll_min: parse_or(get("VWAP_ROLL_MIN").as_deref(), d.indicators.vwap_roll_min),
            vol_baseline_min: parse_or(
                get("VOL_BASELINE_MIN").as_deref(),
                d.indicators.vol_baseline_min,
            ),
            orb_window_min: parse_or(get("ORB_WINDOW_MIN").as_deref(), d.indicators.orb_window_min),
        };

        let rotation = RotationConfig {
            universe_limit: parse_or(get("UNIVERSE_LIMIT").as_deref(), d.rotation.universe_limit),
            interval_secs: parse_or(
                get("SUB_ROTATE_INTERVAL_SEC").as_deref(),
                d.rotation.interval_secs,
            ),
            window_secs: parse_or(get("SUB_ROTATE_WINDOW_SEC").as_deref(), d.rotation.window_secs),
            rank_window_min: parse_or(get("RANK_WINDOW_MIN").as_deref(), d.rotation.rank_window_min),
        };

        let exchanges: Vec<String> = get("EXCHANGES")
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .filter(|list: &Vec<String>| !list.is_empty())
            .unwrap_or(d.feed.exchanges);

        let feed = FeedConfig {
            exchanges,
            retry_delay: Duration::from_millis(parse_or(
                get("FEED_RETRY_DELAY_MS").as_deref(),
                d.feed.retry_delay.as_millis() as u64,
            )),
            heartbeat_max_age_ms: parse_or(
                get("TICKER_HEARTBEAT_MAX_AGE_MS").as_deref(),
                d.feed.heartbeat_max_age_ms,
            ),
            backfill_minutes: parse_or(get("HIST_BACKFILL_MIN").as_deref(), d.feed.backfill_minutes),
            backfill_interval: get("HIST_INTERVAL")
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .unwrap_or(d.feed.backfill_interval),
        };

        let publish = PublishConfig {
            bars_cap: parse_or(get("BARS_CAP").as_deref(), d.publish.bars_cap),
            snapshot_ttl: Duration::from_secs(parse_or(
                get("SNAPSHOT_TTL_SEC").as_deref(),
                d.publish.snapshot_ttl.as_secs(),
            )),
            backfill_snapshot_ttl: Duration::from_secs(parse_or(
                get("BACKFILL_SNAPSHOT_TTL_SEC").as_deref(),
                d.publish.backfill_snapshot_ttl.as_secs(),
            )),
            utc_offset_minutes: parse_or(
                get("SESSION_UTC_OFFSET_MIN").as_deref(),
                d.publish.utc_offset_minutes,
            ),
            daily_bars_ttl: Duration::from_secs(
                parse_or(
                    get("DAILY_BARS_TTL_DAYS").as_deref(),
                    d.publish.daily_bars_ttl.as_secs() / 86_400,
                ) * 86_400,
            ),
        };

        Self {
            indicators,
            rotation,
            feed,
            publish,
        }
    }

    /// Reject configurations that would make a window or cap degenerate.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let windows = [
            ("EMA_FAST", self.indicators.ema_fast),
            ("EMA_SLOW", self.indicators.ema_slow),
            ("RSI_LEN", self.indicators.rsi_len),
            ("ATR_LEN", self.indicators.atr_len),
            ("BB_LEN", self.indicators.bb_len),
            ("DONCHIAN_LEN", self.indicators.donchian_len),
            ("VWAP_ROLL_MIN", self.indicators.vwap_roll_min),
            ("VOL_BASELINE_MIN", self.indicators.vol_baseline_min),
            ("RANK_WINDOW_MIN", self.rotation.rank_window_min),
            ("UNIVERSE_LIMIT", self.rotation.universe_limit),
            ("BARS_CAP", self.publish.bars_cap),
        ];
        for (name, value) in windows {
            if value == 0 {
                return Err(ConfigError::ZeroWindow { name });
            }
        }
        if self.rotation.interval_secs <= 0 {
            return Err(ConfigError::ZeroWindow {
                name: "SUB_ROTATE_INTERVAL_SEC",
            });
        }
        if self.rotation.window_secs <= 0 {
            return Err(ConfigError::ZeroWindow {
                name: "SUB_ROTATE_WINDOW_SEC",
            });
        }
        if self.feed.exchanges.is_empty() {
            return Err(ConfigError::NoExchanges);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.rotation.universe_limit, 200);
        assert_eq!(cfg.publish.bars_cap, 480);
        assert_eq!(cfg.indicators.close_history_len(), 21);
        assert_eq!(cfg.feed.exchanges, vec!["NSE", "BSE"]);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_from_lookup_overrides() {
        let cfg = EngineConfig::from_lookup(lookup(&[
            ("UNIVERSE_LIMIT", "50"),
            ("BB_STD", "2.5"),
            ("EXCHANGES", " NSE , "),
            ("FEED_RETRY_DELAY_MS", "500"),
        ]));
        assert_eq!(cfg.rotation.universe_limit, 50);
        assert_eq!(cfg.indicators.bb_std, 2.5);
        assert_eq!(cfg.feed.exchanges, vec!["NSE"]);
        assert_eq!(cfg.feed.retry_delay, Duration::from_millis(500));
    }

    #[test]
    fn test_malformed_values_keep_defaults() {
        let cfg = EngineConfig::from_lookup(lookup(&[
            ("RSI_LEN", "fourteen"),
            ("EXCHANGES", ","),
            ("HIST_INTERVAL", "  "),
        ]));
        assert_eq!(cfg.indicators.rsi_len, 14);
        assert_eq!(cfg.feed.exchanges, vec!["NSE", "BSE"]);
        assert_eq!(cfg.feed.backfill_interval, "minute");
    }

    #[test]
    fn test_validate_rejects_zero_window() {
        let cfg = EngineConfig::from_lookup(lookup(&[("BB_LEN", "0")]));
        assert_eq!(
            cfg.validate(),
            Err(ConfigError::ZeroWindow { name: "BB_LEN" })
        );
    }

    #[test]
    fn test_validate_rejects_empty_rotation_window() {
        for raw in ["0", "-3"] {
            let cfg = EngineConfig::from_lookup(lookup(&[("SUB_ROTATE_WINDOW_SEC", raw)]));
            assert_eq!(
                cfg.validate(),
                Err(ConfigError::ZeroWindow {
                    name: "SUB_ROTATE_WINDOW_SEC"
                })
            );
        }
    }

    #[test]
    fn test_daily_bars_ttl_in_days() {
        assert_eq!(
            PublishConfig::default().daily_bars_ttl,
            Duration::from_secs(14 * 86_400)
        );
        let cfg = EngineConfig::from_lookup(lookup(&[("DAILY_BARS_TTL_DAYS", "3")]));
        assert_eq!(cfg.publish.daily_bars_ttl, Duration::from_secs(3 * 86_400));
    }

    #[test]
    fn test_session_offset() {
        let cfg = PublishConfig::default();
        assert_eq!(cfg.session_offset().local_minus_utc(), 330 * 60);
    }
}
