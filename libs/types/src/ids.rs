//! Identifier types for instruments on the broker feed
//!
//! The broker identifies an instrument two ways: a numeric token used on the
//! tick stream and historical queries, and an exchange-qualified trading
//! symbol used by every downstream consumer.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::errors::TypeError;

/// Numeric instrument token as assigned by the broker.
///
/// Ordered so that token collections iterate deterministically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstrumentToken(u32);

impl InstrumentToken {
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    /// Get the raw token value
    pub fn get(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for InstrumentToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for InstrumentToken {
    fn from(raw: u32) -> Self {
        Self(raw)
    }
}

impl FromStr for InstrumentToken {
    type Err = TypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim()
            .parse::<u32>()
            .map(Self)
            .map_err(|_| TypeError::InvalidToken(s.to_string()))
    }
}

/// Exchange-qualified trading symbol
///
/// Format: "EXCHANGE:TRADINGSYMBOL" (e.g., "NSE:RELIANCE", "BSE:TCS")
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Symbol(String);

impl Symbol {
    /// Build a symbol from its exchange and trading symbol parts.
    pub fn new(exchange: &str, trading_symbol: &str) -> Self {
        Self(format!("{}:{}", exchange, trading_symbol))
    }

    /// Parse an already-qualified symbol string.
    pub fn parse(s: &str) -> Result<Self, TypeError> {
        let s = s.trim();
        match s.split_once(':') {
            Some((exchange, tsym)) if !exchange.is_empty() && !tsym.is_empty() => {
                Ok(Self(s.to_string()))
            }
            _ => Err(TypeError::InvalidSymbol(s.to_string())),
        }
    }

    /// Get the symbol string
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Exchange prefix of the symbol
    pub fn exchange(&self) -> &str {
        self.0.split_once(':').map(|(ex, _)| ex).unwrap_or("")
    }

    /// Trading symbol without the exchange prefix
    pub fn trading_symbol(&self) -> &str {
        self.0.split_once(':').map(|(_, t)| t).unwrap_or(&self.0)
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Symbol {
    type Err = TypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_parse() {
        let token: InstrumentToken = " 738561 ".parse().unwrap();
        assert_eq!(token.get(), 738561);
        assert!("abc".parse::<InstrumentToken>().is_err());
        assert!("-5".parse::<InstrumentToken>().is_err());
    }

    #[test]
    fn test_token_ordering() {
        let mut tokens = vec![InstrumentToken::new(30), InstrumentToken::new(10)];
        tokens.sort();
        assert_eq!(tokens[0].get(), 10);
    }

    #[test]
    fn test_symbol_parts() {
        let sym = Symbol::new("NSE", "RELIANCE");
        assert_eq!(sym.as_str(), "NSE:RELIANCE");
        assert_eq!(sym.exchange(), "NSE");
        assert_eq!(sym.trading_symbol(), "RELIANCE");
    }

    #[test]
    fn test_symbol_parse_rejects_unqualified() {
        assert!(Symbol::parse("RELIANCE").is_err());
        assert!(Symbol::parse(":RELIANCE").is_err());
        assert!(Symbol::parse("NSE:").is_err());
        assert_eq!(Symbol::parse("NSE:M&M").unwrap().trading_symbol(), "M&M");
    }

    #[test]
    fn test_symbol_serializes_transparent() {
        let sym = Symbol::new("BSE", "TCS");
        assert_eq!(serde_json::to_string(&sym).unwrap(), "\"BSE:TCS\"");
    }
}
