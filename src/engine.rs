//! Synchronization engine
//!
//! Owns one pipeline per subscribed symbol (sequencer + book, or trade
//! cache) and drives the ingestion path: transport message, decode,
//! sequence, apply, dispatch, with one message fully processed before
//! the next. Snapshot fetches run as spawned tasks and report back through
//! a channel, so buffering never blocks on them; each fetch is tagged
//! with the episode epoch and results from a superseded episode are
//! discarded.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::book::{BookView, ChangeSet, DepthBook};
use crate::clock::Clock;
use crate::config::Config;
use crate::decoder::{BookSnapshot, DecodedMessage, DepthUpdate, TradeEvent};
use crate::dispatch::{
    dispatch_trade, dispatch_update, DesyncHandler, TradeCallback, UpdateCallback,
};
use crate::error::{Result, SyncError};
use crate::snapshot::SnapshotProvider;
use crate::sync::{SequenceOutcome, Sequencer, SyncState};
use crate::trades::{TradeCache, TradeStats};
use crate::transport::MessageStream;

/// Completed snapshot fetch, tagged with its episode
struct SnapshotFetched {
    symbol: String,
    epoch: u64,
    result: Result<BookSnapshot>,
}

/// Depth subscription pipeline for one symbol
struct BookPipeline {
    sequencer: Sequencer,
    book: DepthBook,
    callbacks: Vec<UpdateCallback>,
    depth_limit: Option<usize>,
    /// Bumped on every new synchronization episode
    epoch: u64,
}

/// Trade subscription pipeline for one symbol
struct TradePipeline {
    cache: TradeCache,
    callbacks: Vec<TradeCallback>,
}

/// Stream synchronization engine
pub struct SyncEngine {
    config: Config,
    provider: Arc<dyn SnapshotProvider>,
    clock: Arc<dyn Clock>,
    cancel: CancellationToken,
    books: HashMap<String, BookPipeline>,
    trades: HashMap<String, TradePipeline>,
    update_handlers: Vec<UpdateCallback>,
    trade_handlers: Vec<TradeCallback>,
    desync_handlers: Vec<DesyncHandler>,
    snapshot_tx: mpsc::UnboundedSender<SnapshotFetched>,
    snapshot_rx: mpsc::UnboundedReceiver<SnapshotFetched>,
}

impl SyncEngine {
    pub fn new(
        config: Config,
        provider: Arc<dyn SnapshotProvider>,
        clock: Arc<dyn Clock>,
        cancel: CancellationToken,
    ) -> Self {
        let (snapshot_tx, snapshot_rx) = mpsc::unbounded_channel();
        Self {
            config,
            provider,
            clock,
            cancel,
            books: HashMap::new(),
            trades: HashMap::new(),
            update_handlers: Vec::new(),
            trade_handlers: Vec::new(),
            desync_handlers: Vec::new(),
            snapshot_tx,
            snapshot_rx,
        }
    }

    /// Subscribe to depth updates for a symbol
    ///
    /// The first subscription for a symbol starts a synchronization
    /// episode and spawns its snapshot fetch on the current Tokio
    /// runtime; further subscriptions only add callbacks.
    pub fn subscribe<F>(&mut self, symbol: &str, depth_limit: Option<usize>, callback: F)
    where
        F: Fn(&ChangeSet) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let symbol = symbol.to_uppercase();
        if let Some(pipeline) = self.books.get_mut(&symbol) {
            pipeline.callbacks.push(Box::new(callback));
            return;
        }

        info!(symbol = %symbol, "subscribing to depth stream");
        self.books.insert(
            symbol.clone(),
            BookPipeline {
                sequencer: Sequencer::new(&symbol, self.config.buffer_capacity),
                book: DepthBook::new(&symbol),
                callbacks: vec![Box::new(callback)],
                depth_limit,
                epoch: 0,
            },
        );
        self.start_sync(&symbol);
    }

    /// Force a fresh synchronization episode for a symbol
    ///
    /// For the SDK to call after a transport reconnect: the cursor from
    /// the old connection is invalid even when no gap was observed.
    pub fn resynchronize(&mut self, symbol: &str) {
        let symbol = symbol.to_uppercase();
        if let Some(pipeline) = self.books.get_mut(&symbol) {
            info!(symbol = %symbol, "resynchronization requested");
            // Updates buffered on the old connection are not trustworthy.
            pipeline.sequencer.reset();
            self.start_sync(&symbol);
        }
    }

    /// Remove a depth subscription and all of its state
    pub fn unsubscribe(&mut self, symbol: &str) -> bool {
        let symbol = symbol.to_uppercase();
        let removed = self.books.remove(&symbol).is_some();
        if removed {
            info!(symbol = %symbol, "unsubscribed from depth stream");
        }
        removed
    }

    /// Subscribe to trade prints for a symbol
    pub fn subscribe_trades<F>(&mut self, symbol: &str, callback: F)
    where
        F: Fn(&TradeEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let symbol = symbol.to_uppercase();
        match self.trades.get_mut(&symbol) {
            Some(pipeline) => pipeline.callbacks.push(Box::new(callback)),
            None => {
                info!(symbol = %symbol, "subscribing to trade stream");
                self.trades.insert(
                    symbol.clone(),
                    TradePipeline {
                        cache: TradeCache::new(&symbol, self.config.trade_ring_capacity),
                        callbacks: vec![Box::new(callback)],
                    },
                );
            }
        }
    }

    /// Remove a trade subscription and its cache
    pub fn unsubscribe_trades(&mut self, symbol: &str) -> bool {
        self.trades.remove(&symbol.to_uppercase()).is_some()
    }

    /// Register a broadcast handler for every applied change
    pub fn on_update<F>(&mut self, handler: F)
    where
        F: Fn(&ChangeSet) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.update_handlers.push(Box::new(handler));
    }

    /// Register a broadcast handler for every accepted trade
    pub fn on_trade<F>(&mut self, handler: F)
    where
        F: Fn(&TradeEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.trade_handlers.push(Box::new(handler));
    }

    /// Register a handler notified on every detected desynchronization
    pub fn on_desynchronized<F>(&mut self, handler: F)
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.desync_handlers.push(Box::new(handler));
    }

    /// Read-only view of a symbol's book, at its subscribed depth limit
    pub fn book_view(&self, symbol: &str) -> Option<BookView> {
        self.books
            .get(&symbol.to_uppercase())
            .map(|pipeline| pipeline.book.view(pipeline.depth_limit))
    }

    /// Synchronization state of a symbol's depth pipeline
    pub fn sync_state(&self, symbol: &str) -> Option<SyncState> {
        self.books
            .get(&symbol.to_uppercase())
            .map(|pipeline| pipeline.sequencer.state())
    }

    /// Rolling trade statistics for a symbol
    pub fn trade_stats(&self, symbol: &str) -> Option<&TradeStats> {
        self.trades
            .get(&symbol.to_uppercase())
            .map(|pipeline| pipeline.cache.stats())
    }

    /// Symbols with an active depth subscription
    pub fn symbols(&self) -> Vec<String> {
        self.books.keys().cloned().collect()
    }

    /// Drive the ingestion loop until the stream ends or cancellation
    pub async fn run(&mut self, stream: &mut dyn MessageStream) -> Result<()> {
        enum Step {
            Cancelled,
            Snapshot(SnapshotFetched),
            Message(String),
            Ended,
            Idle,
        }

        let cancel = self.cancel.clone();
        loop {
            let step = tokio::select! {
                _ = cancel.cancelled() => Step::Cancelled,
                fetched = self.snapshot_rx.recv() => match fetched {
                    Some(fetched) => Step::Snapshot(fetched),
                    None => Step::Idle,
                },
                message = stream.next_message() => match message? {
                    Some(raw) => Step::Message(raw),
                    None => Step::Ended,
                },
            };

            match step {
                Step::Cancelled => {
                    info!("cancellation requested, stopping ingestion");
                    return Ok(());
                }
                Step::Snapshot(fetched) => self.handle_snapshot(fetched),
                Step::Message(raw) => self.process_message(&raw),
                Step::Ended => {
                    info!("message stream ended");
                    return Ok(());
                }
                Step::Idle => {}
            }
        }
    }

    /// Decode and route a single raw stream message
    ///
    /// Public so an SDK can feed messages directly instead of handing
    /// the engine a [`MessageStream`].
    pub fn process_message(&mut self, raw: &str) {
        match DecodedMessage::decode(raw, self.clock.as_ref()) {
            Ok(DecodedMessage::Diff(update)) => self.handle_diff(update),
            Ok(DecodedMessage::SnapshotShaped(update)) => self.handle_dump(update),
            Ok(DecodedMessage::Trade(trade)) => self.handle_trade(trade),
            Ok(DecodedMessage::Unknown(_)) => {}
            Err(err) => warn!(error = %err, "dropping undecodable message"),
        }
    }

    fn handle_diff(&mut self, update: DepthUpdate) {
        let Some(pipeline) = self.books.get_mut(&update.symbol) else {
            debug!(symbol = %update.symbol, "depth update for unsubscribed symbol dropped");
            return;
        };
        let symbol = update.symbol.clone();
        let outcome = pipeline.sequencer.on_update(update);
        self.apply_outcome(&symbol, outcome);
    }

    fn handle_dump(&mut self, mut update: DepthUpdate) {
        if update.symbol.is_empty() {
            // Raw single-symbol streams omit the symbol for this shape.
            let mut symbols = self.books.keys();
            match (symbols.next(), symbols.next()) {
                (Some(symbol), None) => update.symbol = symbol.clone(),
                _ => {
                    warn!("snapshot-shaped message with no routable symbol dropped");
                    return;
                }
            }
        }
        let Some(pipeline) = self.books.get_mut(&update.symbol) else {
            debug!(symbol = %update.symbol, "book dump for unsubscribed symbol dropped");
            return;
        };
        let symbol = update.symbol.clone();
        let outcome = pipeline.sequencer.on_book_dump(update);
        self.apply_outcome(&symbol, outcome);
    }

    fn handle_trade(&mut self, trade: TradeEvent) {
        let Some(pipeline) = self.trades.get_mut(&trade.symbol) else {
            debug!(symbol = %trade.symbol, "trade for unsubscribed symbol dropped");
            return;
        };
        match pipeline.cache.apply(&trade) {
            Ok(true) => dispatch_trade(
                &trade,
                &pipeline.callbacks,
                &self.trade_handlers,
                &self.cancel,
            ),
            Ok(false) => {}
            Err(err) => error!(symbol = %trade.symbol, error = %err, "trade rejected by cache"),
        }
    }

    fn apply_outcome(&mut self, symbol: &str, outcome: SequenceOutcome) {
        match outcome {
            SequenceOutcome::Buffered | SequenceOutcome::Dropped => {}
            SequenceOutcome::Apply { snapshot, updates } => {
                let Some(pipeline) = self.books.get_mut(symbol) else {
                    return;
                };
                if let Some(snapshot) = snapshot {
                    pipeline.book.apply_snapshot(&snapshot);
                }
                for update in &updates {
                    match pipeline.book.apply_update(update) {
                        Ok(change) => dispatch_update(
                            &change,
                            &pipeline.callbacks,
                            &self.update_handlers,
                            &self.cancel,
                        ),
                        Err(err) => {
                            error!(symbol = %symbol, error = %err, "sequenced update rejected by book")
                        }
                    }
                }
            }
            SequenceOutcome::Desynchronized { expected, got } => {
                let err = SyncError::Desynchronized {
                    symbol: symbol.to_string(),
                    expected,
                    got,
                };
                warn!(error = %err, "depth stream desynchronized, resynchronizing");
                for handler in &self.desync_handlers {
                    handler(symbol);
                }
                self.start_sync(symbol);
            }
            SequenceOutcome::SnapshotStale {
                snapshot_id,
                oldest_first_id,
            } => {
                let err = SyncError::SnapshotRace {
                    snapshot_id,
                    oldest_first_id,
                };
                warn!(symbol = %symbol, error = %err, "requesting a fresh snapshot");
                self.start_sync(symbol);
            }
        }
    }

    /// Begin a new synchronization episode for a symbol
    fn start_sync(&mut self, symbol: &str) {
        let Some(pipeline) = self.books.get_mut(symbol) else {
            return;
        };
        pipeline.sequencer.begin_sync();
        pipeline.epoch += 1;
        let epoch = pipeline.epoch;

        if self.cancel.is_cancelled() {
            debug!(symbol = %symbol, "cancellation requested, snapshot fetch skipped");
            return;
        }
        self.spawn_fetch(symbol.to_string(), epoch, Duration::ZERO);
    }

    /// Fetch a snapshot off the ingestion path and report back
    fn spawn_fetch(&self, symbol: String, epoch: u64, delay: Duration) {
        let provider = Arc::clone(&self.provider);
        let tx = self.snapshot_tx.clone();
        let cancel = self.cancel.clone();
        let limit = self.config.snapshot_depth;

        tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            let result = tokio::select! {
                _ = cancel.cancelled() => return,
                result = provider.fetch_snapshot(&symbol, limit) => result,
            };
            let _ = tx.send(SnapshotFetched {
                symbol,
                epoch,
                result,
            });
        });
    }

    fn handle_snapshot(&mut self, fetched: SnapshotFetched) {
        let SnapshotFetched {
            symbol,
            epoch,
            result,
        } = fetched;

        let Some(pipeline) = self.books.get_mut(&symbol) else {
            debug!(symbol = %symbol, "snapshot for unsubscribed symbol discarded");
            return;
        };
        if epoch != pipeline.epoch {
            debug!(
                symbol = %symbol,
                epoch,
                current = pipeline.epoch,
                "snapshot from a superseded episode discarded"
            );
            return;
        }

        match result {
            Ok(snapshot) => {
                let outcome = pipeline.sequencer.on_snapshot(snapshot);
                self.apply_outcome(&symbol, outcome);
            }
            Err(err) => {
                let delay = Duration::from_millis(self.config.snapshot_retry_delay_ms);
                warn!(
                    symbol = %symbol,
                    error = %err,
                    retry_ms = self.config.snapshot_retry_delay_ms,
                    "snapshot fetch failed, retrying"
                );
                if !self.cancel.is_cancelled() {
                    self.spawn_fetch(symbol, epoch, delay);
                }
            }
        }
    }
}
