//! Instrument reference data
//!
//! The broker's instrument dump is loosely shaped: the same concept appears
//! under several field names and the exchange is sometimes only encoded in
//! the segment. `InstrumentRow` resolves those aliases once, here, so the
//! directory only ever sees canonical values.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::{InstrumentToken, Symbol};
use crate::numeric::u32_opt;

/// A tradable instrument: immutable token/symbol pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Instrument {
    pub token: InstrumentToken,
    pub symbol: Symbol,
}

impl Instrument {
    pub fn new(token: InstrumentToken, symbol: Symbol) -> Self {
        Self { token, symbol }
    }
}

/// One row of the broker's instrument list with aliases resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstrumentRow {
    pub token: Option<InstrumentToken>,
    pub trading_symbol: Option<String>,
    pub instrument_type: Option<String>,
    pub segment: String,
    pub exchange: Option<String>,
}

impl InstrumentRow {
    /// Normalize a raw JSON row.
    ///
    /// Token comes from `instrument_token` or `instrumenttoken`, type from
    /// `instrument_type` or `instrumenttype`. A missing exchange is derived
    /// from the segment prefix (`NSE-EQ` -> `NSE`), or the whole segment when
    /// it has no dash.
    pub fn from_value(row: &Value) -> Self {
        let token = u32_opt(row.get("instrument_token").or_else(|| row.get("instrumenttoken")))
            .map(InstrumentToken::new);
        let text = |key: &str| {
            row.get(key)
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        };
        let segment = text("segment").unwrap_or_default();
        let exchange = text("exchange").or_else(|| {
            if segment.is_empty() {
                None
            } else {
                Some(
                    segment
                        .split_once('-')
                        .map(|(ex, _)| ex.to_string())
                        .unwrap_or_else(|| segment.clone()),
                )
            }
        });

        Self {
            token,
            trading_symbol: text("tradingsymbol"),
            instrument_type: text("instrument_type").or_else(|| text("instrumenttype")),
            segment,
            exchange,
        }
    }

    /// Whether this row is a listed equity (indices excluded).
    pub fn is_equity(&self) -> bool {
        self.instrument_type.as_deref() == Some("EQ") && self.segment != "INDICES"
    }

    /// Resolve into an instrument on `expected_exchange`, if the row is a
    /// complete equity listing there.
    pub fn resolve(&self, expected_exchange: &str) -> Option<Instrument> {
        if self.exchange.as_deref() != Some(expected_exchange) || !self.is_equity() {
            return None;
        }
        let tsym = self.trading_symbol.as_deref()?;
        let token = self.token?;
        Some(Instrument::new(token, Symbol::new(expected_exchange, tsym)))
    }
}
