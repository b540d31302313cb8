//! marketsync - Stream synchronization and cache-consistency engine
//!
//! Reconciles an authoritative point-in-time order book snapshot with an
//! unordered, possibly-gappy stream of incremental depth updates, detects
//! desynchronization through strict update-id contiguity, and recovers by
//! fetching a fresh snapshot. Transport connections, authentication, and
//! the REST client proper are external collaborators; this crate consumes
//! an abstract message stream and snapshot provider.

pub mod book;
pub mod clock;
pub mod config;
pub mod decoder;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod snapshot;
pub mod sync;
pub mod trades;
pub mod transport;

pub use book::{BookView, ChangeSet, DepthBook, Level, Side};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::Config;
pub use decoder::{BookSnapshot, DecodedMessage, DepthUpdate, PriceLevel, TradeEvent};
pub use engine::SyncEngine;
pub use error::{Result, SyncError};
pub use snapshot::{RestSnapshotProvider, SnapshotProvider};
pub use sync::{SequenceOutcome, Sequencer, SyncState, UpdateBuffer};
pub use trades::{TradeCache, TradeStats};
pub use transport::{MessageStream, WsMessageStream};
