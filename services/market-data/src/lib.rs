//! Market Data Service
//!
//! Long-running tick aggregation engine. Consumes a live broker tick stream
//! for a bounded set of instruments and produces:
//! - One-minute OHLCV bars with VWAP accumulators
//! - Rolling indicator snapshots (EMA, Wilder RSI/ATR, rolling VWAP,
//!   Bollinger, Donchian, opening range)
//! - A turnover-ranked active subscription set, rotated periodically
//! - A liveness heartbeat
//!
//! All of it is published to a shared TTL-bounded cache for downstream
//! consumers.
//!
//! # Architecture
//!
//! ```text
//!  Instrument source ──► Directory ──► Active set ──┐
//!                                                  │ subscribe deltas
//!  Historical source ──► Backfill ─┐          ┌────▼─────┐
//!                                  │          │  Feed    │◄── transport
//!                                  │          │supervisor│
//!                                  │          └────┬─────┘
//!                                  │               │ ticks (one task)
//!                                  │          ┌────▼─────┐
//!                                  │          │  Bars    │
//!                                  │          └────┬─────┘
//!                                  │               │ minute close
//!                                  │          ┌────▼─────┐
//!                                  └─────────►│Indicators│
//!                                             └────┬─────┘
//!                                                  │
//!                                             ┌────▼─────┐
//!                                             │Publisher │──► cache
//!                                             └──────────┘
//! ```

pub mod backfill;
pub mod cache;
pub mod candles;
pub mod clock;
pub mod config;
pub mod directory;
pub mod engine;
pub mod error;
pub mod feed;
pub mod indicators;
pub mod metrics;
pub mod publisher;
pub mod redis_cache;
pub mod subscription;

pub use config::EngineConfig;
pub use engine::TickerEngine;
pub use error::EngineError;

// Library version
pub const SERVICE_VERSION: &str = "0.1.0";
