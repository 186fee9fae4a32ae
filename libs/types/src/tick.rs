//! Trade ticks from the live feed

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::TypeError;
use crate::ids::InstrumentToken;
use crate::numeric::{decimal_or, u32_opt};

/// Largest price accepted from the feed (10^9).
pub const MAX_PRICE: Decimal = Decimal::from_parts(1_000_000_000, 0, 0, false, 0);

/// Largest traded quantity accepted from the feed (10^12).
pub const MAX_QUANTITY: Decimal = Decimal::from_parts(3_567_587_328, 232, 0, false, 0);

/// A single trade event. Ephemeral: consumed immediately, never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tick {
    pub token: InstrumentToken,
    pub price: Decimal,
    /// Traded quantity; zero when the feed did not report one.
    pub quantity: Decimal,
    /// Unix milliseconds at which the tick was received.
    pub arrival_ms: i64,
}

impl Tick {
    pub fn new(token: InstrumentToken, price: Decimal, quantity: Decimal, arrival_ms: i64) -> Self {
        Self {
            token,
            price,
            quantity,
            arrival_ms,
        }
    }

    /// Parse a raw feed tick (`instrument_token`, `last_price`,
    /// `last_quantity`).
    ///
    /// A missing or malformed quantity is read as zero; a missing token or
    /// price rejects the tick, as does a price above [`MAX_PRICE`] or a
    /// quantity above [`MAX_QUANTITY`].
    pub fn from_value(raw: &Value, arrival_ms: i64) -> Result<Self, TypeError> {
        let token = u32_opt(raw.get("instrument_token"))
            .filter(|t| *t != 0)
            .ok_or_else(|| TypeError::InvalidTick {
                reason: "missing instrument_token".to_string(),
            })?;
        let price = match raw.get("last_price") {
            Some(v) if !v.is_null() => decimal_or(Some(v), Decimal::NEGATIVE_ONE),
            _ => Decimal::NEGATIVE_ONE,
        };
        if price.is_sign_negative() {
            return Err(TypeError::InvalidTick {
                reason: "missing last_price".to_string(),
            });
        }
        if price > MAX_PRICE {
            return Err(TypeError::InvalidTick {
                reason: format!("last_price {} out of range", price),
            });
        }
        let quantity = decimal_or(raw.get("last_quantity"), Decimal::ZERO).max(Decimal::ZERO);
        if quantity > MAX_QUANTITY {
            return Err(TypeError::InvalidTick {
                reason: format!("last_quantity {} out of range", quantity),
            });
        }

        Ok(Self::new(InstrumentToken::new(token), price, quantity, arrival_ms))
    }
}
