//! Event dispatcher
//!
//! Delivers each applied change to the per-subscription callbacks and
//! then to the broadcast handlers, in registration order. A failing
//! callback is logged and never prevents delivery to the rest; failures
//! raised while cancellation is pending are an expected shutdown race
//! and are suppressed.

use tokio_util::sync::CancellationToken;
use tracing::error;

use crate::book::ChangeSet;
use crate::decoder::TradeEvent;

/// Per-subscription or broadcast callback for applied book changes
pub type UpdateCallback = Box<dyn Fn(&ChangeSet) -> anyhow::Result<()> + Send + Sync>;

/// Callback for accepted trade prints
pub type TradeCallback = Box<dyn Fn(&TradeEvent) -> anyhow::Result<()> + Send + Sync>;

/// Notification handler for detected desynchronization
pub type DesyncHandler = Box<dyn Fn(&str) + Send + Sync>;

/// Deliver an applied change to every callback, isolating failures
pub fn dispatch_update(
    change: &ChangeSet,
    callbacks: &[UpdateCallback],
    broadcast: &[UpdateCallback],
    cancel: &CancellationToken,
) {
    for callback in callbacks.iter().chain(broadcast.iter()) {
        if let Err(err) = callback(change) {
            if cancel.is_cancelled() {
                continue;
            }
            error!(
                symbol = %change.symbol,
                last_update_id = change.last_update_id,
                error = %err,
                "update callback failed"
            );
        }
    }
}

/// Deliver a trade print to every callback, isolating failures
pub fn dispatch_trade(
    trade: &TradeEvent,
    callbacks: &[TradeCallback],
    broadcast: &[TradeCallback],
    cancel: &CancellationToken,
) {
    for callback in callbacks.iter().chain(broadcast.iter()) {
        if let Err(err) = callback(trade) {
            if cancel.is_cancelled() {
                continue;
            }
            error!(
                symbol = %trade.symbol,
                trade_id = trade.trade_id,
                error = %err,
                "trade callback failed"
            );
        }
    }
}
