//! Instrument directory
//!
//! Resolves the tradable equity universe (token ↔ symbol) from the broker's
//! instrument list once at startup. Each configured exchange is queried on
//! its own first; when none of those queries resolve anything, one
//! all-instruments query is tried before giving up.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{info, warn};
use types::ids::{InstrumentToken, Symbol};
use types::instrument::{Instrument, InstrumentRow};

use crate::error::DirectoryError;

/// Reference-data source for the instrument list.
#[async_trait]
pub trait InstrumentSource: Send + Sync {
    /// Raw instrument rows for one exchange, or for every exchange when
    /// `exchange` is `None`.
    async fn instruments(&self, exchange: Option<&str>) -> Result<Vec<Value>, DirectoryError>;
}

/// Resolved token ↔ symbol maps.
#[derive(Debug, Clone, Default)]
pub struct InstrumentDirectory {
    token_to_symbol: BTreeMap<InstrumentToken, Symbol>,
    symbol_to_token: BTreeMap<Symbol, InstrumentToken>,
}

impl InstrumentDirectory {
    /// Build a directory from already-resolved instruments.
    pub fn from_instruments(instruments: impl IntoIterator<Item = Instrument>) -> Self {
        let mut dir = Self::default();
        for inst in instruments {
            dir.insert(inst);
        }
        dir
    }

    fn insert(&mut self, inst: Instrument) {
        self.token_to_symbol.insert(inst.token, inst.symbol.clone());
        self.symbol_to_token.insert(inst.symbol, inst.token);
    }

    /// Load equities on `exchanges` from `source`.
    ///
    /// A failing per-exchange query counts as empty. Fails with
    /// [`DirectoryError::Empty`] if nothing resolves at all.
    pub async fn load(
        source: &dyn InstrumentSource,
        exchanges: &[String],
    ) -> Result<Self, DirectoryError> {
        let mut dir = Self::default();

        for exchange in exchanges {
            let rows = match source.instruments(Some(exchange)).await {
                Ok(rows) => rows,
                Err(e) => {
                    warn!(exchange = %exchange, error = %e, "Instrument query failed");
                    Vec::new()
                }
            };
            for row in &rows {
                if let Some(inst) = InstrumentRow::from_value(row).resolve(exchange) {
                    dir.insert(inst);
                }
            }
        }

        if dir.is_empty() {
            warn!("No instruments from per-exchange queries, trying full list");
            let rows = source.instruments(None).await.unwrap_or_else(|e| {
                warn!(error = %e, "Full instrument query failed");
                Vec::new()
            });
            for row in &rows {
                let row = InstrumentRow::from_value(row);
                let Some(exchange) = row.exchange.as_deref() else {
                    continue;
                };
                if !exchanges.iter().any(|e| e == exchange) {
                    continue;
                }
                if let Some(inst) = row.resolve(exchange) {
                    dir.insert(inst);
                }
            }
        }

        if dir.is_empty() {
            return Err(DirectoryError::Empty {
                exchanges: exchanges.to_vec(),
            });
        }

        info!(
            instruments = dir.len(),
            exchanges = ?exchanges,
            "Instrument directory loaded"
        );
        Ok(dir)
    }

    pub fn resolve_symbol(&self, token: InstrumentToken) -> Option<&Symbol> {
        self.token_to_symbol.get(&token)
    }

    pub fn resolve_token(&self, symbol: &Symbol) -> Option<InstrumentToken> {
        self.symbol_to_token.get(symbol).copied()
    }

    /// All tokens in ascending order.
    pub fn tokens(&self) -> impl Iterator<Item = InstrumentToken> + '_ {
        self.token_to_symbol.keys().copied()
    }

    pub fn token_to_symbol(&self) -> &BTreeMap<InstrumentToken, Symbol> {
        &self.token_to_symbol
    }

    pub fn symbol_to_token(&self) -> &BTreeMap<Symbol, InstrumentToken> {
        &self.symbol_to_token
    }

    pub fn len(&self) -> usize {
        self.token_to_symbol.len()
    }

    pub fn is_empty(&self) -> bool {
        self.token_to_symbol.is_empty()
    }
}
