//! Stream synchronization
//!
//! Reconciles an authoritative snapshot with the incremental update
//! stream and exposes a linearized, gap-free sequence to the book.

mod buffer;
mod sequencer;

pub use buffer::UpdateBuffer;
pub use sequencer::{SequenceOutcome, Sequencer, SyncState};
