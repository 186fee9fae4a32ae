//! Lenient numeric parsing for loosely typed broker payloads
//!
//! Broker rows and environment tunables arrive as JSON values or strings whose
//! numeric fields may be numbers, numeric strings, null or garbage. These
//! helpers turn them into typed values with an explicit default, so callers
//! never coerce ad hoc at the read site.

use std::str::FromStr;

use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use serde_json::Value;

/// Parse a JSON value as a `Decimal`, returning `default` when it is absent,
/// non-numeric or non-finite.
pub fn decimal_or(value: Option<&Value>, default: Decimal) -> Decimal {
    match value {
        Some(Value::Number(n)) => {
            if let Some(i) = n.as_i64() {
                Decimal::from(i)
            } else {
                n.as_f64()
                    .and_then(Decimal::from_f64)
                    .unwrap_or(default)
            }
        }
        Some(Value::String(s)) => Decimal::from_str(s.trim()).unwrap_or(default),
        _ => default,
    }
}

/// Parse a JSON value as `u32` (numbers or numeric strings), `None` otherwise.
pub fn u32_opt(value: Option<&Value>) -> Option<u32> {
    match value {
        Some(Value::Number(n)) => n.as_u64().and_then(|v| u32::try_from(v).ok()),
        Some(Value::String(s)) => s.trim().parse::<u32>().ok(),
        _ => None,
    }
}

/// Parse an optional string with `FromStr`, returning `default` when absent
/// or malformed.
pub fn parse_or<T: FromStr>(raw: Option<&str>, default: T) -> T {
    raw.and_then(|s| s.trim().parse::<T>().ok()).unwrap_or(default)
}

/// Lossy conversion used where indicator math runs in floating point.
pub fn to_f64(value: Decimal) -> f64 {
    value.to_f64().unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decimal_or_accepts_numbers_and_strings() {
        let v = json!({"a": 101.5, "b": "99.25", "c": 7});
        assert_eq!(decimal_or(v.get("a"), Decimal::ZERO), Decimal::new(1015, 1));
        assert_eq!(decimal_or(v.get("b"), Decimal::ZERO), Decimal::new(9925, 2));
        assert_eq!(decimal_or(v.get("c"), Decimal::ZERO), Decimal::from(7));
    }

    #[test]
    fn test_decimal_or_defaults_on_garbage() {
        let v = json!({"a": "n/a", "b": null, "c": [1]});
        assert_eq!(decimal_or(v.get("a"), Decimal::ONE), Decimal::ONE);
        assert_eq!(decimal_or(v.get("b"), Decimal::ONE), Decimal::ONE);
        assert_eq!(decimal_or(v.get("c"), Decimal::ONE), Decimal::ONE);
        assert_eq!(decimal_or(v.get("missing"), Decimal::ONE), Decimal::ONE);
    }

    #[test]
    fn test_u32_opt() {
        assert_eq!(u32_opt(Some(&json!(408065))), Some(408065));
        assert_eq!(u32_opt(Some(&json!("408065"))), Some(408065));
        assert_eq!(u32_opt(Some(&json!(-1))), None);
        assert_eq!(u32_opt(Some(&json!(5_000_000_000u64))), None);
        assert_eq!(u32_opt(None), None);
    }

    #[test]
    fn test_parse_or() {
        assert_eq!(parse_or(Some(" 42 "), 7usize), 42);
        assert_eq!(parse_or(Some("forty"), 7usize), 7);
        assert_eq!(parse_or::<f64>(None, 2.0), 2.0);
    }
}
