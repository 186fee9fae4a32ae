//! Rolling per-instrument indicator state
//!
//! Consumes finalized one-minute bars (live or backfilled, through the same
//! entry point) and maintains bounded rolling state per instrument. A
//! [`Snapshot`] is derived on demand from that state and the latest bar.
//!
//! Indicator math runs in `f64`; bars are converted at the boundary.
//! Every ratio guards its denominator and falls back to a defined value
//! (0 for multiples and deviations, 50 for RSI, the last close for VWAP).
//!
//! Bollinger and Donchian bands are recomputed from their windows on every
//! snapshot rather than maintained incrementally.

use std::collections::{BTreeMap, VecDeque};

use serde::{Deserialize, Serialize};
use tracing::debug;
use types::ids::InstrumentToken;
use types::numeric::to_f64;

use crate::candles::Bar;
use crate::config::IndicatorConfig;

const NEUTRAL_RSI: f64 = 50.0;

fn push_bounded<T>(buf: &mut VecDeque<T>, value: T, cap: usize) {
    buf.push_back(value);
    while buf.len() > cap {
        buf.pop_front();
    }
}

fn mean(values: impl Iterator<Item = f64>) -> Option<f64> {
    let (sum, n) = values.fold((0.0, 0usize), |(s, n), v| (s + v, n + 1));
    if n == 0 {
        None
    } else {
        Some(sum / n as f64)
    }
}

/// Published indicator bundle for one instrument.
///
/// Field names are canonical; the aliases accept the legacy spellings older
/// producers wrote so consumers only ever read one schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    #[serde(alias = "last_price", alias = "last_close")]
    pub price: f64,
    #[serde(alias = "vwap60")]
    pub vwap: f64,
    pub vwap_delta_pct: f64,
    #[serde(alias = "minute_vol_multiple", alias = "vol_mult")]
    pub volume_multiple: f64,
    #[serde(alias = "ema9")]
    pub ema_fast: f64,
    #[serde(alias = "ema21")]
    pub ema_slow: f64,
    #[serde(alias = "rsi14")]
    pub rsi: f64,
    #[serde(alias = "atr14")]
    pub atr: f64,
    #[serde(alias = "bb_mid")]
    pub bb_middle: f64,
    #[serde(alias = "bb_up")]
    pub bb_upper: f64,
    #[serde(alias = "bb_lo")]
    pub bb_lower: f64,
    #[serde(alias = "donchian_hi", alias = "donchian_upper", alias = "don_u")]
    pub donchian_high: f64,
    #[serde(alias = "donchian_lo", alias = "donchian_lower", alias = "don_l")]
    pub donchian_low: f64,
    /// Absent until the instrument has a bar inside its opening range.
    #[serde(default)]
    pub orb_high: Option<f64>,
    #[serde(default)]
    pub orb_low: Option<f64>,
    pub last_volume: f64,
    /// Finalized bars folded into this instrument's state.
    #[serde(default)]
    pub bar_count: u64,
    /// Epoch milliseconds the snapshot describes.
    #[serde(default)]
    pub ts_ms: i64,
}

impl Snapshot {
    pub fn with_ts(mut self, ts_ms: i64) -> Self {
        self.ts_ms = ts_ms;
        self
    }

    /// Copy rounded for publication: prices and ratios to 2 places, RSI to 1.
    pub fn rounded(&self) -> Self {
        let r2 = |v: f64| (v * 100.0).round() / 100.0;
        Self {
            price: r2(self.price),
            vwap: r2(self.vwap),
            vwap_delta_pct: r2(self.vwap_delta_pct),
            volume_multiple: r2(self.volume_multiple),
            ema_fast: r2(self.ema_fast),
            ema_slow: r2(self.ema_slow),
            rsi: (self.rsi * 10.0).round() / 10.0,
            atr: r2(self.atr),
            bb_middle: r2(self.bb_middle),
            bb_upper: r2(self.bb_upper),
            bb_lower: r2(self.bb_lower),
            donchian_high: r2(self.donchian_high),
            donchian_low: r2(self.donchian_low),
            orb_high: self.orb_high.map(r2),
            orb_low: self.orb_low.map(r2),
            last_volume: r2(self.last_volume),
            bar_count: self.bar_count,
            ts_ms: self.ts_ms,
        }
    }
}

/// Rolling state for one instrument.
#[derive(Debug, Clone)]
pub struct IndicatorState {
    closes: VecDeque<f64>,
    volumes: VecDeque<f64>,
    /// (price·qty, qty) per minute.
    vwap_pairs: VecDeque<(f64, f64)>,
    highs: VecDeque<f64>,
    lows: VecDeque<f64>,
    ema_fast: Option<f64>,
    ema_slow: Option<f64>,
    /// Wilder (average gain, average loss), seeded by the first close change.
    gain_loss: Option<(f64, f64)>,
    atr: f64,
    orb_high: Option<f64>,
    orb_low: Option<f64>,
    first_minute: Option<i64>,
    prev_close: Option<f64>,
    bar_count: u64,
    last_bar: Option<Bar>,
}

impl IndicatorState {
    fn new() -> Self {
        Self {
            closes: VecDeque::new(),
            volumes: VecDeque::new(),
            vwap_pairs: VecDeque::new(),
            highs: VecDeque::new(),
            lows: VecDeque::new(),
            ema_fast: None,
            ema_slow: None,
            gain_loss: None,
            atr: 0.0,
            orb_high: None,
            orb_low: None,
            first_minute: None,
            prev_close: None,
            bar_count: 0,
            last_bar: None,
        }
    }

    fn update(&mut self, bar: &Bar, cfg: &IndicatorConfig) {
        let high = to_f64(bar.high);
        let low = to_f64(bar.low);
        let close = to_f64(bar.close);

        // True range; the first bar has no previous close.
        let tr = match self.prev_close {
            Some(pc) => (high - low).max((high - pc).abs()).max((low - pc).abs()),
            None => high - low,
        }
        .max(0.0);

        self.ema_fast = Some(ema_step(self.ema_fast, close, cfg.ema_fast));
        self.ema_slow = Some(ema_step(self.ema_slow, close, cfg.ema_slow));

        if let Some(pc) = self.prev_close {
            let change = close - pc;
            let gain = change.max(0.0);
            let loss = (-change).max(0.0);
            let len = cfg.rsi_len as f64;
            self.gain_loss = Some(match self.gain_loss {
                None => (gain, loss),
                Some((ag, al)) => (
                    (ag * (len - 1.0) + gain) / len,
                    (al * (len - 1.0) + loss) / len,
                ),
            });
        }

        // ATR starts at the first true range and smooths by 1/L from the
        // second bar on.
        self.atr = if self.bar_count == 0 {
            tr
        } else {
            self.atr + (tr - self.atr) / cfg.atr_len as f64
        };

        push_bounded(
            &mut self.vwap_pairs,
            (to_f64(bar.price_qty_sum), to_f64(bar.qty_sum)),
            cfg.vwap_roll_min,
        );
        push_bounded(&mut self.closes, close, cfg.close_history_len());
        push_bounded(&mut self.highs, high, cfg.donchian_len);
        push_bounded(&mut self.lows, low, cfg.donchian_len);
        push_bounded(&mut self.volumes, to_f64(bar.volume), cfg.vol_baseline_min);

        let minute = bar.minute();
        let first = *self.first_minute.get_or_insert(minute);
        if minute - first < cfg.orb_window_min {
            self.orb_high = Some(self.orb_high.map_or(high, |h| h.max(high)));
            self.orb_low = Some(self.orb_low.map_or(low, |l| l.min(low)));
        }

        self.prev_close = Some(close);
        self.bar_count += 1;
        self.last_bar = Some(bar.clone());
    }

    /// RSI output, neutral until `rsi_len` bars exist.
    pub fn rsi(&self, rsi_len: usize) -> f64 {
        if (self.bar_count as usize) < rsi_len {
            return NEUTRAL_RSI;
        }
        match self.gain_loss {
            Some((ag, al)) if al > 0.0 => 100.0 - 100.0 / (1.0 + ag / al),
            Some((ag, _)) if ag > 0.0 => 100.0,
            _ => NEUTRAL_RSI,
        }
    }

    pub fn ema_fast(&self) -> Option<f64> {
        self.ema_fast
    }

    pub fn ema_slow(&self) -> Option<f64> {
        self.ema_slow
    }

    pub fn atr(&self) -> f64 {
        self.atr
    }

    pub fn bar_count(&self) -> u64 {
        self.bar_count
    }

    pub fn last_bar(&self) -> Option<&Bar> {
        self.last_bar.as_ref()
    }

    fn snapshot(&self, cfg: &IndicatorConfig) -> Option<Snapshot> {
        let last = self.last_bar.as_ref()?;
        let close = to_f64(last.close);
        let last_volume = to_f64(last.volume);

        let (num, den) = self
            .vwap_pairs
            .iter()
            .fold((0.0, 0.0), |(n, d), (pn, pd)| (n + pn, d + pd));
        let vwap = if den > 0.0 { num / den } else { close };
        let vwap_delta_pct = if vwap != 0.0 {
            (close - vwap) / vwap * 100.0
        } else {
            0.0
        };

        let skip = self.closes.len().saturating_sub(cfg.bb_len);
        let window: Vec<f64> = self.closes.iter().skip(skip).copied().collect();
        let bb_middle = mean(window.iter().copied()).unwrap_or(close);
        let variance = mean(window.iter().map(|x| (x - bb_middle).powi(2))).unwrap_or(0.0);
        let band = cfg.bb_std * variance.sqrt();

        let donchian_high = self.highs.iter().copied().fold(f64::MIN, f64::max);
        let donchian_low = self.lows.iter().copied().fold(f64::MAX, f64::min);

        let baseline = mean(self.volumes.iter().copied()).unwrap_or(0.0);
        let volume_multiple = if baseline > 0.0 {
            last_volume / baseline
        } else {
            0.0
        };

        Some(Snapshot {
            price: close,
            vwap,
            vwap_delta_pct,
            volume_multiple,
            ema_fast: self.ema_fast.unwrap_or(close),
            ema_slow: self.ema_slow.unwrap_or(close),
            rsi: self.rsi(cfg.rsi_len),
            atr: self.atr,
            bb_middle,
            bb_upper: bb_middle + band,
            bb_lower: bb_middle - band,
            donchian_high,
            donchian_low,
            orb_high: self.orb_high,
            orb_low: self.orb_low,
            last_volume,
            bar_count: self.bar_count,
            ts_ms: last.minute_start * 1000,
        })
    }
}

fn ema_step(prev: Option<f64>, price: f64, length: usize) -> f64 {
    match prev {
        None => price,
        Some(prev) => {
            let k = 2.0 / (length as f64 + 1.0);
            price * k + prev * (1.0 - k)
        }
    }
}

/// Indicator state for every instrument that has produced a bar.
pub struct IndicatorEngine {
    config: IndicatorConfig,
    states: BTreeMap<InstrumentToken, IndicatorState>,
}

impl IndicatorEngine {
    pub fn new(config: IndicatorConfig) -> Self {
        Self {
            config,
            states: BTreeMap::new(),
        }
    }

    /// Fold a finalized bar into the instrument's state. Bars must arrive in
    /// chronological order per instrument.
    pub fn on_bar_finalized(&mut self, token: InstrumentToken, bar: &Bar) {
        let state = self
            .states
            .entry(token)
            .or_insert_with(IndicatorState::new);
        state.update(bar, &self.config);
        debug!(
            token = token.get(),
            minute_start = bar.minute_start,
            bar_count = state.bar_count,
            "Bar folded into indicators"
        );
    }

    /// Snapshot for an instrument, absent if it has never produced a bar.
    pub fn snapshot(&self, token: InstrumentToken) -> Option<Snapshot> {
        self.states.get(&token)?.snapshot(&self.config)
    }

    pub fn state(&self, token: InstrumentToken) -> Option<&IndicatorState> {
        self.states.get(&token)
    }

    pub fn config(&self) -> &IndicatorConfig {
        &self.config
    }

    /// Number of instruments with state.
    pub fn tracked(&self) -> usize {
        self.states.len()
    }
}
