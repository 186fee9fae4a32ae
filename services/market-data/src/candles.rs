//! One-minute bar aggregation
//!
//! Folds live ticks into one in-progress bar per instrument and finalizes
//! every open bar together when the wall-clock minute index advances.
//!
//! Boundary detection is global, not per instrument: the engine calls
//! [`BarAggregator::roll_minute`] once per tick batch before folding any tick
//! of that batch, so a bar from the previous minute is always finalized
//! before the first tick of the next minute touches the aggregator. This is
//! what keeps at most one in-progress bar per instrument.
//!
//! Uses `Decimal` for all bar arithmetic.

use std::collections::BTreeMap;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::warn;
use types::ids::InstrumentToken;
use types::tick::Tick;

/// Minute index (minutes since the epoch) of a millisecond timestamp.
pub fn minute_index(epoch_ms: i64) -> i64 {
    epoch_ms.div_euclid(60_000)
}

/// A one-minute OHLCV bar with its VWAP accumulators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bar {
    /// Minute open, epoch seconds.
    pub minute_start: i64,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
    /// Sum of price·quantity over ticks with positive quantity.
    pub price_qty_sum: Decimal,
    /// Sum of quantity over ticks with positive quantity.
    pub qty_sum: Decimal,
}

impl Bar {
    /// Open a bar from the first tick of a minute. Volume starts at zero and
    /// the opening tick is folded in by the caller like any other.
    fn open_at(minute_start: i64, price: Decimal) -> Self {
        Self {
            minute_start,
            open: price,
            high: price,
            low: price,
            close: price,
            volume: Decimal::ZERO,
            price_qty_sum: Decimal::ZERO,
            qty_sum: Decimal::ZERO,
        }
    }

    /// Update the bar with a tick.
    fn update(&mut self, price: Decimal, quantity: Decimal) {
        if price > self.high {
            self.high = price;
        }
        if price < self.low {
            self.low = price;
        }
        self.close = price;
        if quantity > Decimal::ZERO {
            let sums = price
                .checked_mul(quantity)
                .and_then(|pq| self.price_qty_sum.checked_add(pq))
                .zip(self.volume.checked_add(quantity))
                .zip(self.qty_sum.checked_add(quantity));
            match sums {
                Some(((price_qty_sum, volume), qty_sum)) => {
                    self.price_qty_sum = price_qty_sum;
                    self.volume = volume;
                    self.qty_sum = qty_sum;
                }
                None => {
                    warn!(%price, %quantity, "Tick volume overflows the bar, ignoring quantity")
                }
            }
        }
    }

    /// Volume-weighted price for the minute, or the close when no quantity
    /// traded.
    pub fn vwap(&self) -> Decimal {
        if self.qty_sum > Decimal::ZERO {
            self.price_qty_sum / self.qty_sum
        } else {
            self.close
        }
    }

    /// Turnover (close × volume) used for liquidity ranking.
    pub fn turnover(&self) -> Decimal {
        self.close.checked_mul(self.volume).unwrap_or(Decimal::MAX)
    }

    /// Minute index of this bar.
    pub fn minute(&self) -> i64 {
        self.minute_start.div_euclid(60)
    }

    /// Validate OHLCV invariants.
    pub fn is_valid(&self) -> bool {
        self.high >= self.open
            && self.high >= self.close
            && self.high >= self.low
            && self.low <= self.open
            && self.low <= self.close
            && self.volume >= Decimal::ZERO
    }
}

/// In-progress bars for every instrument currently ticking.
#[derive(Debug, Default)]
pub struct BarAggregator {
    /// Keyed by token so finalization order is deterministic.
    current: BTreeMap<InstrumentToken, Bar>,
    /// Minute index the in-progress bars belong to.
    current_minute: Option<i64>,
}

impl BarAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Advance to `minute`. When it differs from the minute the open bars
    /// belong to, every open bar is finalized and returned in ascending
    /// token order.
    pub fn roll_minute(&mut self, minute: i64) -> Vec<(InstrumentToken, Bar)> {
        match self.current_minute {
            Some(prev) if prev == minute => Vec::new(),
            _ => {
                self.current_minute = Some(minute);
                std::mem::take(&mut self.current).into_iter().collect()
            }
        }
    }

    /// Fold a tick into the in-progress bar of its instrument, opening one at
    /// the current minute if needed.
    pub fn on_tick(&mut self, tick: &Tick) {
        let minute = match self.current_minute {
            Some(m) => m,
            None => {
                let m = minute_index(tick.arrival_ms);
                self.current_minute = Some(m);
                m
            }
        };
        self.current
            .entry(tick.token)
            .or_insert_with(|| Bar::open_at(minute * 60, tick.price))
            .update(tick.price, tick.quantity);
    }

    /// In-progress bar for a token.
    pub fn current_bar(&self, token: InstrumentToken) -> Option<&Bar> {
        self.current.get(&token)
    }

    /// Number of instruments with an open bar.
    pub fn open_bars(&self) -> usize {
        self.current.len()
    }

    /// Drop the in-progress bar of an instrument leaving the active set.
    pub fn discard(&mut self, token: InstrumentToken) {
        self.current.remove(&token);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dec(s: &str) -> Decimal {
        s.parse().unwrap()
    }

    fn tick(token: u32, price: &str, qty: &str, ms: i64) -> Tick {
        Tick::new(InstrumentToken::new(token), dec(price), dec(qty), ms)
    }

    const MIN_5: i64 = 5 * 60_000;

    #[test]
    fn test_minute_index() {
        assert_eq!(minute_index(MIN_5 + 59_999), 5);
        assert_eq!(minute_index(-1), -1);
    }

    #[test]
    fn test_bar_from_reference_ticks() {
        let mut agg = BarAggregator::new();
        assert!(agg.roll_minute(5).is_empty());
        agg.on_tick(&tick(1, "100", "10", MIN_5));
        agg.on_tick(&tick(1, "102", "5", MIN_5 + 1_000));
        agg.on_tick(&tick(1, "99", "8", MIN_5 + 2_000));

        let finalized = agg.roll_minute(6);
        assert_eq!(finalized.len(), 1);
        let (token, bar) = &finalized[0];
        assert_eq!(token.get(), 1);
        assert_eq!(bar.minute_start, 300);
        assert_eq!(bar.open, dec("100"));
        assert_eq!(bar.high, dec("102"));
        assert_eq!(bar.low, dec("99"));
        assert_eq!(bar.close, dec("99"));
        assert_eq!(bar.volume, dec("23"));
        assert_eq!(bar.price_qty_sum, dec("2302"));
        assert_eq!(bar.vwap().round_dp(2), dec("100.09"));
        assert!(bar.is_valid());
    }

    #[test]
    fn test_zero_quantity_updates_extremes_only() {
        let mut agg = BarAggregator::new();
        agg.roll_minute(5);
        agg.on_tick(&tick(7, "50", "0", MIN_5));
        agg.on_tick(&tick(7, "55", "0", MIN_5));
        let bar = agg.current_bar(InstrumentToken::new(7)).unwrap();
        assert_eq!(bar.high, dec("55"));
        assert_eq!(bar.volume, Decimal::ZERO);
        assert_eq!(bar.vwap(), dec("55"));
    }

    #[test]
    fn test_overflowing_quantity_keeps_price_but_not_volume() {
        let mut agg = BarAggregator::new();
        agg.roll_minute(5);
        agg.on_tick(&tick(7, "100", "10", MIN_5));
        agg.on_tick(&tick(7, "1000000000000000000", "1000000000000000000", MIN_5));
        let bar = agg.current_bar(InstrumentToken::new(7)).unwrap();
        assert_eq!(bar.high, dec("1000000000000000000"));
        assert_eq!(bar.close, dec("1000000000000000000"));
        assert_eq!(bar.volume, dec("10"));
        assert_eq!(bar.price_qty_sum, dec("1000"));
        assert_eq!(bar.turnover(), dec("10000000000000000000"));
        assert!(bar.is_valid());
    }

    #[test]
    fn test_turnover_saturates() {
        let mut bar = Bar::open_at(0, Decimal::MAX);
        bar.volume = dec("2");
        assert_eq!(bar.turnover(), Decimal::MAX);
    }

    #[test]
    fn test_roll_finalizes_all_in_token_order() {
        let mut agg = BarAggregator::new();
        agg.roll_minute(5);
        for token in [30, 10, 20] {
            agg.on_tick(&tick(token, "10", "1", MIN_5));
        }
        assert!(agg.roll_minute(5).is_empty());
        let tokens: Vec<u32> = agg.roll_minute(6).iter().map(|(t, _)| t.get()).collect();
        assert_eq!(tokens, vec![10, 20, 30]);
        assert_eq!(agg.open_bars(), 0);
    }

    #[test]
    fn test_new_minute_tick_opens_fresh_bar() {
        let mut agg = BarAggregator::new();
        agg.roll_minute(5);
        agg.on_tick(&tick(1, "100", "1", MIN_5));
        agg.roll_minute(6);
        agg.on_tick(&tick(1, "101", "2", MIN_5 + 60_000));
        let bar = agg.current_bar(InstrumentToken::new(1)).unwrap();
        assert_eq!(bar.open, dec("101"));
        assert_eq!(bar.minute_start, 360);
        assert_eq!(bar.volume, dec("2"));
    }

    #[test]
    fn test_discard() {
        let mut agg = BarAggregator::new();
        agg.roll_minute(1);
        agg.on_tick(&tick(1, "1", "1", 60_000));
        agg.discard(InstrumentToken::new(1));
        assert!(agg.roll_minute(2).is_empty());
    }
}

#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn prop_bar_matches_tick_sequence(
            ticks in prop::collection::vec((1u32..100_000, 0u32..1_000), 1..50)
        ) {
            let mut agg = BarAggregator::new();
            agg.roll_minute(10);
            for (price, qty) in &ticks {
                agg.on_tick(&Tick::new(
                    InstrumentToken::new(1),
                    Decimal::from(*price),
                    Decimal::from(*qty),
                    600_000,
                ));
            }
            let finalized = agg.roll_minute(11);
            let bar = &finalized[0].1;

            let prices: Vec<Decimal> = ticks.iter().map(|(p, _)| Decimal::from(*p)).collect();
            let volume: u64 = ticks.iter().map(|(_, q)| *q as u64).sum();
            prop_assert_eq!(bar.open, prices[0]);
            prop_assert_eq!(bar.close, *prices.last().unwrap());
            prop_assert_eq!(bar.high, *prices.iter().max().unwrap());
            prop_assert_eq!(bar.low, *prices.iter().min().unwrap());
            prop_assert_eq!(bar.volume, Decimal::from(volume));
            prop_assert!(bar.is_valid());
        }
    }
}
