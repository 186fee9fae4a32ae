//! Error types for the shared type library
//!
//! Parsing of identifiers at the broker boundary is the only fallible
//! operation here; everything downstream works on validated values.

use thiserror::Error;

/// Errors raised when constructing shared types from raw input.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TypeError {
    #[error("Invalid instrument token: {0}")]
    InvalidToken(String),

    #[error("Invalid symbol (expected EXCHANGE:TRADINGSYMBOL): {0}")]
    InvalidSymbol(String),

    #[error("Invalid tick: {reason}")]
    InvalidTick { reason: String },
}
