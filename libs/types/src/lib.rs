//! Types library for the market-data services
//!
//! Shared type definitions used by the tick aggregation engine and the
//! consumers of what it publishes.
//!
//! # Modules
//! - `ids`: Instrument identifiers (InstrumentToken, Symbol)
//! - `instrument`: Instrument reference data and row normalization
//! - `tick`: Live trade ticks
//! - `numeric`: Lenient typed parsing for loosely shaped payloads
//! - `errors`: Error taxonomy

// Public modules
pub mod ids;
pub mod instrument;
pub mod tick;
pub mod numeric;
pub mod errors;

// Library version constant
pub const LIB_VERSION: &str = "1.0.0";

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::ids::*;
    pub use crate::instrument::*;
    pub use crate::tick::*;
    pub use crate::errors::*;
}
