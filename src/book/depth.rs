//! Core order book implementation
//!
//! Uses BTreeMap for efficient sorted price level management.

use rust_decimal::Decimal;
use std::cmp::Reverse;
use std::collections::BTreeMap;

use super::{BookView, ChangeSet, Level, Side};
use crate::decoder::{BookSnapshot, DepthUpdate, PriceLevel};
use crate::error::{Result, SyncError};

/// Order book for a single symbol
#[derive(Debug)]
pub struct DepthBook {
    symbol: String,
    /// Bids sorted by price descending (highest first)
    bids: BTreeMap<Reverse<Decimal>, Decimal>,
    /// Asks sorted by price ascending (lowest first)
    asks: BTreeMap<Decimal, Decimal>,
    /// Last update ID reflected in the book
    last_update_id: u64,
    /// Event time of the last applied update
    last_event_time: u64,
}

impl DepthBook {
    /// Create a new empty order book
    pub fn new(symbol: &str) -> Self {
        Self {
            symbol: symbol.to_string(),
            bids: BTreeMap::new(),
            asks: BTreeMap::new(),
            last_update_id: 0,
            last_event_time: 0,
        }
    }

    /// Replace all price levels wholesale from a snapshot
    pub fn apply_snapshot(&mut self, snapshot: &BookSnapshot) {
        self.bids.clear();
        self.asks.clear();

        for level in &snapshot.bids {
            if level.quantity > Decimal::ZERO {
                self.bids.insert(Reverse(level.price), level.quantity);
            }
        }

        for level in &snapshot.asks {
            if level.quantity > Decimal::ZERO {
                self.asks.insert(level.price, level.quantity);
            }
        }

        self.last_update_id = snapshot.last_update_id;
    }

    /// Apply a sequenced depth update
    ///
    /// Every (price, quantity) pair is a last-value-wins patch: quantity
    /// zero removes the level, anything else sets it exactly. The caller
    /// guarantees ordering; the book never sees updates out of order.
    pub fn apply_update(&mut self, update: &DepthUpdate) -> Result<ChangeSet> {
        if update.symbol != self.symbol {
            return Err(SyncError::SymbolMismatch {
                bound: self.symbol.clone(),
                got: update.symbol.clone(),
            });
        }

        for level in &update.bids {
            self.set_level(Side::Bid, level);
        }

        for level in &update.asks {
            self.set_level(Side::Ask, level);
        }

        self.last_update_id = update.last_update_id;
        self.last_event_time = update.event_time;

        Ok(ChangeSet {
            symbol: self.symbol.clone(),
            event_time: update.event_time,
            first_update_id: update.first_update_id,
            last_update_id: update.last_update_id,
            bids: update
                .bids
                .iter()
                .map(|level| Level {
                    price: level.price,
                    quantity: level.quantity,
                })
                .collect(),
            asks: update
                .asks
                .iter()
                .map(|level| Level {
                    price: level.price,
                    quantity: level.quantity,
                })
                .collect(),
        })
    }

    /// Set or remove a single price level
    fn set_level(&mut self, side: Side, level: &PriceLevel) {
        match side {
            Side::Bid => {
                if level.quantity == Decimal::ZERO {
                    self.bids.remove(&Reverse(level.price));
                } else {
                    self.bids.insert(Reverse(level.price), level.quantity);
                }
            }
            Side::Ask => {
                if level.quantity == Decimal::ZERO {
                    self.asks.remove(&level.price);
                } else {
                    self.asks.insert(level.price, level.quantity);
                }
            }
        }
    }

    /// Get best bid price
    pub fn best_bid(&self) -> Option<Decimal> {
        self.bids.first_key_value().map(|(Reverse(p), _)| *p)
    }

    /// Get best ask price
    pub fn best_ask(&self) -> Option<Decimal> {
        self.asks.first_key_value().map(|(p, _)| *p)
    }

    /// Get mid price
    pub fn mid_price(&self) -> Option<Decimal> {
        match (self.best_bid(), self.best_ask()) {
            (Some(bid), Some(ask)) => Some((bid + ask) / Decimal::from(2)),
            _ => None,
        }
    }

    /// Get absolute spread
    pub fn spread(&self) -> Option<Decimal> {
        match (self.best_bid(), self.best_ask()) {
            (Some(bid), Some(ask)) => Some(ask - bid),
            _ => None,
        }
    }

    /// Symbol the book is bound to
    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    /// Last update ID reflected in the book
    pub fn last_update_id(&self) -> u64 {
        self.last_update_id
    }

    /// Number of bid levels
    pub fn bid_levels(&self) -> usize {
        self.bids.len()
    }

    /// Number of ask levels
    pub fn ask_levels(&self) -> usize {
        self.asks.len()
    }

    /// Read-only view, optionally limited to the top `depth` levels per side
    pub fn view(&self, depth: Option<usize>) -> BookView {
        let take = depth.unwrap_or(usize::MAX);
        BookView {
            symbol: self.symbol.clone(),
            event_time: self.last_event_time,
            last_update_id: self.last_update_id,
            bids: self
                .bids
                .iter()
                .take(take)
                .map(|(Reverse(p), q)| Level {
                    price: *p,
                    quantity: *q,
                })
                .collect(),
            asks: self
                .asks
                .iter()
                .take(take)
                .map(|(p, q)| Level {
                    price: *p,
                    quantity: *q,
                })
                .collect(),
        }
    }
}
