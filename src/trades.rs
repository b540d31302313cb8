//! Rolling trade cache
//!
//! Keeps a bounded ring of recent trades per symbol plus rolling
//! aggregates. Trade ids are exchange-assigned and monotonic, so a
//! non-increasing id marks a redelivery and is dropped; there is no
//! snapshot primitive to recover trades, so gaps are not tracked here.

use std::collections::VecDeque;

use rust_decimal::Decimal;
use serde::Serialize;
use tracing::debug;

use crate::decoder::TradeEvent;
use crate::error::{Result, SyncError};

/// Rolling aggregates over accepted trades
#[derive(Debug, Clone, Default, Serialize)]
pub struct TradeStats {
    /// Accepted trade count
    pub count: u64,

    /// Total base asset volume
    pub base_volume: Decimal,

    /// Total quote asset volume
    pub quote_volume: Decimal,

    /// Price of the most recent trade
    pub last_price: Option<Decimal>,
}

/// Recent-trade cache for a single symbol
#[derive(Debug)]
pub struct TradeCache {
    symbol: String,
    capacity: usize,
    recent: VecDeque<TradeEvent>,
    last_trade_id: Option<u64>,
    stats: TradeStats,
}

impl TradeCache {
    pub fn new(symbol: &str, capacity: usize) -> Self {
        Self {
            symbol: symbol.to_string(),
            capacity,
            recent: VecDeque::with_capacity(capacity.min(64)),
            last_trade_id: None,
            stats: TradeStats::default(),
        }
    }

    /// Record a trade print
    ///
    /// Returns `Ok(false)` when the trade was a redelivery and was
    /// dropped without changing any state.
    pub fn apply(&mut self, trade: &TradeEvent) -> Result<bool> {
        if trade.symbol != self.symbol {
            return Err(SyncError::SymbolMismatch {
                bound: self.symbol.clone(),
                got: trade.symbol.clone(),
            });
        }

        if let Some(last) = self.last_trade_id {
            if trade.trade_id <= last {
                debug!(
                    symbol = %self.symbol,
                    trade_id = trade.trade_id,
                    last,
                    "out-of-order trade dropped"
                );
                return Ok(false);
            }
        }

        self.last_trade_id = Some(trade.trade_id);
        if self.capacity > 0 && self.recent.len() >= self.capacity {
            self.recent.pop_front();
        }
        self.recent.push_back(trade.clone());

        self.stats.count += 1;
        self.stats.base_volume += trade.quantity;
        self.stats.quote_volume += trade.price * trade.quantity;
        self.stats.last_price = Some(trade.price);

        Ok(true)
    }

    /// Most recent accepted trade
    pub fn latest(&self) -> Option<&TradeEvent> {
        self.recent.back()
    }

    /// Recent trades, oldest first
    pub fn recent(&self) -> impl Iterator<Item = &TradeEvent> {
        self.recent.iter()
    }

    pub fn stats(&self) -> &TradeStats {
        &self.stats
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn len(&self) -> usize {
        self.recent.len()
    }

    pub fn is_empty(&self) -> bool {
        self.recent.is_empty()
    }
}
