//! Update sequencer state machine
//!
//! The single gatekeeper between the decoded stream and the book. It
//! buffers updates while a snapshot is fetched, resolves the
//! snapshot/stream race, and enforces strict update-id contiguity once
//! synchronized. A violated contiguity check is the one and only signal
//! that the cache is no longer valid.

use tracing::{debug, info, warn};

use super::UpdateBuffer;
use crate::decoder::{BookSnapshot, DepthUpdate};

/// Externally visible synchronization state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    /// No valid cursor; no episode in progress
    Unsynchronized,
    /// Snapshot requested; incoming updates are buffered
    AwaitingSnapshot,
    /// Snapshot in hand, waiting for an update that straddles it
    Buffering,
    /// Cursor valid; updates stream through contiguously
    Synchronized,
}

/// Internal phase, carrying per-state data
#[derive(Debug)]
enum Phase {
    Unsynchronized,
    AwaitingSnapshot,
    Buffering(BookSnapshot),
    Synchronized { expected_next_id: u64 },
}

/// What the caller must do with a processed message
#[derive(Debug)]
pub enum SequenceOutcome {
    /// Held for later; nothing to apply yet
    Buffered,
    /// Stale or duplicate; dropped without touching the cursor
    Dropped,
    /// Apply to the cache in order: wholesale snapshot first if present,
    /// then the gap-free updates
    Apply {
        snapshot: Option<BookSnapshot>,
        updates: Vec<DepthUpdate>,
    },
    /// Snapshot predates the buffered stream; a fresh one is required
    SnapshotStale {
        snapshot_id: u64,
        oldest_first_id: u64,
    },
    /// Contiguity violated; cursor reset, resynchronization required
    Desynchronized { expected: u64, got: u64 },
}

/// Per-symbol update sequencer
#[derive(Debug)]
pub struct Sequencer {
    symbol: String,
    phase: Phase,
    buffer: UpdateBuffer,
}

impl Sequencer {
    pub fn new(symbol: &str, buffer_capacity: usize) -> Self {
        Self {
            symbol: symbol.to_string(),
            phase: Phase::Unsynchronized,
            buffer: UpdateBuffer::new(buffer_capacity),
        }
    }

    pub fn state(&self) -> SyncState {
        match self.phase {
            Phase::Unsynchronized => SyncState::Unsynchronized,
            Phase::AwaitingSnapshot => SyncState::AwaitingSnapshot,
            Phase::Buffering(_) => SyncState::Buffering,
            Phase::Synchronized { .. } => SyncState::Synchronized,
        }
    }

    /// Smallest update id not yet applied, when synchronized
    pub fn expected_next_id(&self) -> Option<u64> {
        match self.phase {
            Phase::Synchronized { expected_next_id } => Some(expected_next_id),
            _ => None,
        }
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Start a synchronization episode; buffered updates are kept for the
    /// resolution against the incoming snapshot
    pub fn begin_sync(&mut self) {
        self.phase = Phase::AwaitingSnapshot;
    }

    /// Tear down all episode state
    pub fn reset(&mut self) {
        self.phase = Phase::Unsynchronized;
        self.buffer.clear();
    }

    /// Process an incremental depth update
    pub fn on_update(&mut self, update: DepthUpdate) -> SequenceOutcome {
        match std::mem::replace(&mut self.phase, Phase::Unsynchronized) {
            Phase::Unsynchronized => {
                debug!(
                    symbol = %self.symbol,
                    first = update.first_update_id,
                    "update outside a synchronization episode dropped"
                );
                SequenceOutcome::Dropped
            }
            Phase::AwaitingSnapshot => {
                self.phase = Phase::AwaitingSnapshot;
                self.buffer_update(update);
                SequenceOutcome::Buffered
            }
            Phase::Buffering(snapshot) => {
                let next = snapshot.last_update_id + 1;
                if update.last_update_id < next {
                    debug!(
                        symbol = %self.symbol,
                        last = update.last_update_id,
                        snapshot_id = snapshot.last_update_id,
                        "update already reflected in snapshot dropped"
                    );
                    self.phase = Phase::Buffering(snapshot);
                    SequenceOutcome::Dropped
                } else if update.first_update_id <= next {
                    // Straddles the snapshot; synchronization succeeds.
                    let expected = update.last_update_id + 1;
                    self.phase = Phase::Synchronized {
                        expected_next_id: expected,
                    };
                    info!(
                        symbol = %self.symbol,
                        snapshot_id = snapshot.last_update_id,
                        "stream synchronized"
                    );
                    SequenceOutcome::Apply {
                        snapshot: Some(snapshot),
                        updates: vec![update],
                    }
                } else {
                    // The stream is already past the snapshot.
                    let outcome = SequenceOutcome::SnapshotStale {
                        snapshot_id: snapshot.last_update_id,
                        oldest_first_id: update.first_update_id,
                    };
                    self.buffer_update(update);
                    self.phase = Phase::AwaitingSnapshot;
                    outcome
                }
            }
            Phase::Synchronized { expected_next_id } => {
                if update.first_update_id == expected_next_id {
                    let expected = update.last_update_id + 1;
                    self.phase = Phase::Synchronized {
                        expected_next_id: expected,
                    };
                    SequenceOutcome::Apply {
                        snapshot: None,
                        updates: vec![update],
                    }
                } else if update.last_update_id < expected_next_id {
                    debug!(
                        symbol = %self.symbol,
                        first = update.first_update_id,
                        last = update.last_update_id,
                        expected = expected_next_id,
                        "duplicate update dropped"
                    );
                    self.phase = Phase::Synchronized { expected_next_id };
                    SequenceOutcome::Dropped
                } else {
                    // Gap or overlap: the cache is no longer trustworthy.
                    let got = update.first_update_id;
                    self.buffer.clear();
                    self.buffer_update(update);
                    SequenceOutcome::Desynchronized {
                        expected: expected_next_id,
                        got,
                    }
                }
            }
        }
    }

    /// Process an out-of-band snapshot fetched for the current episode
    pub fn on_snapshot(&mut self, snapshot: BookSnapshot) -> SequenceOutcome {
        match std::mem::replace(&mut self.phase, Phase::Unsynchronized) {
            Phase::AwaitingSnapshot => self.resolve(snapshot, None),
            Phase::Buffering(parked) => {
                if snapshot.last_update_id > parked.last_update_id {
                    self.resolve(snapshot, None)
                } else {
                    debug!(
                        symbol = %self.symbol,
                        snapshot_id = snapshot.last_update_id,
                        parked_id = parked.last_update_id,
                        "older snapshot discarded"
                    );
                    self.phase = Phase::Buffering(parked);
                    SequenceOutcome::Dropped
                }
            }
            phase @ (Phase::Unsynchronized | Phase::Synchronized { .. }) => {
                debug!(
                    symbol = %self.symbol,
                    snapshot_id = snapshot.last_update_id,
                    "snapshot outside a synchronization episode discarded"
                );
                self.phase = phase;
                SequenceOutcome::Dropped
            }
        }
    }

    /// Process a snapshot-shaped message delivered in-band
    ///
    /// The dump is authoritative full state: during an episode it resolves
    /// synchronization like a fetched snapshot, and on a synchronized
    /// stream a newer one replaces the book wholesale and re-seats the
    /// cursor. Contiguity is not enforced between dumps.
    pub fn on_book_dump(&mut self, update: DepthUpdate) -> SequenceOutcome {
        let snapshot = BookSnapshot {
            last_update_id: update.last_update_id,
            bids: update.bids.clone(),
            asks: update.asks.clone(),
        };

        match std::mem::replace(&mut self.phase, Phase::Unsynchronized) {
            Phase::Unsynchronized => {
                debug!(
                    symbol = %self.symbol,
                    "book dump outside a synchronization episode dropped"
                );
                SequenceOutcome::Dropped
            }
            Phase::AwaitingSnapshot | Phase::Buffering(_) => self.resolve(snapshot, Some(update)),
            Phase::Synchronized { expected_next_id } => {
                if update.last_update_id < expected_next_id {
                    debug!(
                        symbol = %self.symbol,
                        last = update.last_update_id,
                        expected = expected_next_id,
                        "stale book dump dropped"
                    );
                    self.phase = Phase::Synchronized { expected_next_id };
                    SequenceOutcome::Dropped
                } else {
                    self.phase = Phase::Synchronized {
                        expected_next_id: update.last_update_id + 1,
                    };
                    SequenceOutcome::Apply {
                        snapshot: Some(snapshot),
                        updates: vec![update],
                    }
                }
            }
        }
    }

    /// Resolve a snapshot against the buffered updates
    ///
    /// `dump` carries the originating update when the snapshot arrived
    /// in-band, so consumers still see it as an applied change.
    fn resolve(&mut self, snapshot: BookSnapshot, dump: Option<DepthUpdate>) -> SequenceOutcome {
        let next = snapshot.last_update_id + 1;

        let mut buffered = self.buffer.drain();
        // Stable by first id: earliest-arriving wins among equal ranges.
        buffered.sort_by_key(|u| u.first_update_id);

        let before = buffered.len();
        buffered.retain(|u| u.last_update_id >= next);
        let stale = before - buffered.len();
        if stale > 0 {
            debug!(
                symbol = %self.symbol,
                count = stale,
                snapshot_id = snapshot.last_update_id,
                "buffered updates already reflected in snapshot discarded"
            );
        }

        let oldest_first = match buffered.first() {
            Some(first) => first.first_update_id,
            None => {
                // Nothing usable buffered. A dump synchronizes alone; a
                // fetched snapshot is parked until a straddling update.
                return match dump {
                    Some(dump) => {
                        self.phase = Phase::Synchronized {
                            expected_next_id: next,
                        };
                        info!(
                            symbol = %self.symbol,
                            snapshot_id = snapshot.last_update_id,
                            "stream synchronized from book dump"
                        );
                        SequenceOutcome::Apply {
                            snapshot: Some(snapshot),
                            updates: vec![dump],
                        }
                    }
                    None => {
                        debug!(
                            symbol = %self.symbol,
                            snapshot_id = snapshot.last_update_id,
                            "snapshot accepted, awaiting straddling update"
                        );
                        self.phase = Phase::Buffering(snapshot);
                        SequenceOutcome::Buffered
                    }
                };
            }
        };

        if oldest_first > next {
            // Gap between snapshot and stream: the critical race. Never
            // guess; request a fresh snapshot instead.
            self.buffer.restore(buffered);
            self.phase = Phase::AwaitingSnapshot;
            return SequenceOutcome::SnapshotStale {
                snapshot_id: snapshot.last_update_id,
                oldest_first_id: oldest_first,
            };
        }

        // The oldest survivor straddles `next`; drain the contiguous run.
        let mut expected = next;
        let mut ready: Vec<DepthUpdate> = dump.into_iter().collect();
        let applied_start = ready.len();
        let mut iter = buffered.into_iter();
        let mut gap: Option<DepthUpdate> = None;

        for update in iter.by_ref() {
            if update.last_update_id < expected {
                debug!(
                    symbol = %self.symbol,
                    first = update.first_update_id,
                    last = update.last_update_id,
                    "duplicate buffered update dropped"
                );
                continue;
            }
            if update.first_update_id > expected {
                gap = Some(update);
                break;
            }
            if update.first_update_id < expected && ready.len() > applied_start {
                // Overlapping ranges from duplicate delivery; levels are
                // absolute so applying the whole event is safe.
                warn!(
                    symbol = %self.symbol,
                    first = update.first_update_id,
                    last = update.last_update_id,
                    expected,
                    "overlapping buffered update ranges"
                );
            }
            expected = update.last_update_id + 1;
            ready.push(update);
        }

        if let Some(gap_update) = gap {
            // Data was lost while buffering; abandon the attempt and keep
            // the post-gap run for the next snapshot.
            let oldest = gap_update.first_update_id;
            let mut rest = vec![gap_update];
            rest.extend(iter);
            self.buffer.restore(rest);
            self.phase = Phase::AwaitingSnapshot;
            return SequenceOutcome::SnapshotStale {
                snapshot_id: snapshot.last_update_id,
                oldest_first_id: oldest,
            };
        }

        self.phase = Phase::Synchronized {
            expected_next_id: expected,
        };
        info!(
            symbol = %self.symbol,
            snapshot_id = snapshot.last_update_id,
            applied = ready.len(),
            "stream synchronized"
        );
        SequenceOutcome::Apply {
            snapshot: Some(snapshot),
            updates: ready,
        }
    }

    fn buffer_update(&mut self, update: DepthUpdate) {
        if let Some((first, last)) = self.buffer.push(update) {
            warn!(
                symbol = %self.symbol,
                first,
                last,
                "pre-sync buffer full, discarded oldest update"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn update(first: u64, last: u64) -> DepthUpdate {
        DepthUpdate {
            event_time: first,
            symbol: "BTCUSDT".to_string(),
            first_update_id: first,
            last_update_id: last,
            bids: vec![],
            asks: vec![],
        }
    }

    fn snapshot(last_update_id: u64) -> BookSnapshot {
        BookSnapshot {
            last_update_id,
            bids: vec![],
            asks: vec![],
        }
    }

    fn synced(seq: &mut Sequencer, snapshot_id: u64) {
        seq.begin_sync();
        seq.on_update(update(snapshot_id + 1, snapshot_id + 1));
        let outcome = seq.on_snapshot(snapshot(snapshot_id));
        assert!(matches!(outcome, SequenceOutcome::Apply { .. }));
        assert_eq!(seq.state(), SyncState::Synchronized);
    }

    #[test]
    fn test_updates_buffered_while_awaiting_snapshot() {
        let mut seq = Sequencer::new("BTCUSDT", 16);
        seq.begin_sync();
        assert_eq!(seq.state(), SyncState::AwaitingSnapshot);

        assert!(matches!(
            seq.on_update(update(5, 10)),
            SequenceOutcome::Buffered
        ));
        assert_eq!(seq.buffered(), 1);
    }

    #[test]
    fn test_straddling_buffered_update_synchronizes() {
        // Buffered [{5,10},{11,11}] against a snapshot at 7: the first
        // event straddles 8, the second continues at 11.
        let mut seq = Sequencer::new("BTCUSDT", 16);
        seq.begin_sync();
        seq.on_update(update(5, 10));
        seq.on_update(update(11, 11));

        match seq.on_snapshot(snapshot(7)) {
            SequenceOutcome::Apply { snapshot, updates } => {
                assert_eq!(snapshot.map(|s| s.last_update_id), Some(7));
                assert_eq!(updates.len(), 2);
                assert_eq!(updates[0].first_update_id, 5);
                assert_eq!(updates[1].first_update_id, 11);
            }
            other => panic!("expected Apply, got {:?}", other),
        }
        assert_eq!(seq.state(), SyncState::Synchronized);
        assert_eq!(seq.expected_next_id(), Some(12));
    }

    #[test]
    fn test_buffered_updates_fully_reflected_are_discarded() {
        let mut seq = Sequencer::new("BTCUSDT", 16);
        seq.begin_sync();
        seq.on_update(update(3, 5));
        seq.on_update(update(6, 7));

        // Everything buffered is older than the snapshot; park it.
        assert!(matches!(
            seq.on_snapshot(snapshot(7)),
            SequenceOutcome::Buffered
        ));
        assert_eq!(seq.state(), SyncState::Buffering);
        assert_eq!(seq.buffered(), 0);
    }

    #[test]
    fn test_snapshot_older_than_stream_is_stale() {
        let mut seq = Sequencer::new("BTCUSDT", 16);
        seq.begin_sync();
        seq.on_update(update(20, 25));

        match seq.on_snapshot(snapshot(7)) {
            SequenceOutcome::SnapshotStale {
                snapshot_id,
                oldest_first_id,
            } => {
                assert_eq!(snapshot_id, 7);
                assert_eq!(oldest_first_id, 20);
            }
            other => panic!("expected SnapshotStale, got {:?}", other),
        }
        assert_eq!(seq.state(), SyncState::AwaitingSnapshot);
        // The buffered run is kept for the fresh snapshot.
        assert_eq!(seq.buffered(), 1);

        match seq.on_snapshot(snapshot(21)) {
            SequenceOutcome::Apply { updates, .. } => {
                assert_eq!(updates.len(), 1);
                assert_eq!(updates[0].first_update_id, 20);
            }
            other => panic!("expected Apply, got {:?}", other),
        }
        assert_eq!(seq.expected_next_id(), Some(26));
    }

    #[test]
    fn test_parked_snapshot_resolves_on_straddling_update() {
        let mut seq = Sequencer::new("BTCUSDT", 16);
        seq.begin_sync();
        assert!(matches!(
            seq.on_snapshot(snapshot(100)),
            SequenceOutcome::Buffered
        ));
        assert_eq!(seq.state(), SyncState::Buffering);

        // Already reflected: dropped.
        assert!(matches!(
            seq.on_update(update(99, 100)),
            SequenceOutcome::Dropped
        ));

        match seq.on_update(update(100, 103)) {
            SequenceOutcome::Apply { snapshot, updates } => {
                assert_eq!(snapshot.map(|s| s.last_update_id), Some(100));
                assert_eq!(updates.len(), 1);
            }
            other => panic!("expected Apply, got {:?}", other),
        }
        assert_eq!(seq.expected_next_id(), Some(104));
    }

    #[test]
    fn test_parked_snapshot_raced_by_stream_requests_fresh_one() {
        let mut seq = Sequencer::new("BTCUSDT", 16);
        seq.begin_sync();
        seq.on_snapshot(snapshot(100));

        match seq.on_update(update(105, 110)) {
            SequenceOutcome::SnapshotStale {
                snapshot_id,
                oldest_first_id,
            } => {
                assert_eq!(snapshot_id, 100);
                assert_eq!(oldest_first_id, 105);
            }
            other => panic!("expected SnapshotStale, got {:?}", other),
        }
        assert_eq!(seq.state(), SyncState::AwaitingSnapshot);
        assert_eq!(seq.buffered(), 1);
    }

    #[test]
    fn test_contiguous_updates_advance_cursor() {
        let mut seq = Sequencer::new("BTCUSDT", 16);
        synced(&mut seq, 100);
        assert_eq!(seq.expected_next_id(), Some(102));

        assert!(matches!(
            seq.on_update(update(102, 110)),
            SequenceOutcome::Apply { .. }
        ));
        assert_eq!(seq.expected_next_id(), Some(111));
    }

    #[test]
    fn test_gap_is_fatal_desynchronization() {
        let mut seq = Sequencer::new("BTCUSDT", 16);
        synced(&mut seq, 10);
        assert_eq!(seq.expected_next_id(), Some(12));

        match seq.on_update(update(15, 16)) {
            SequenceOutcome::Desynchronized { expected, got } => {
                assert_eq!(expected, 12);
                assert_eq!(got, 15);
            }
            other => panic!("expected Desynchronized, got {:?}", other),
        }
        assert_eq!(seq.state(), SyncState::Unsynchronized);
        // The violating update is kept for the next episode.
        assert_eq!(seq.buffered(), 1);
    }

    #[test]
    fn test_overlap_is_fatal_desynchronization() {
        let mut seq = Sequencer::new("BTCUSDT", 16);
        synced(&mut seq, 10);

        // first != expected but range reaches into the future.
        assert!(matches!(
            seq.on_update(update(10, 13)),
            SequenceOutcome::Desynchronized { .. }
        ));
    }

    #[test]
    fn test_duplicate_dropped_without_cursor_change() {
        let mut seq = Sequencer::new("BTCUSDT", 16);
        synced(&mut seq, 10);
        assert!(matches!(
            seq.on_update(update(12, 14)),
            SequenceOutcome::Apply { .. }
        ));
        assert_eq!(seq.expected_next_id(), Some(15));

        // Redelivery of the applied event.
        assert!(matches!(
            seq.on_update(update(12, 14)),
            SequenceOutcome::Dropped
        ));
        assert_eq!(seq.expected_next_id(), Some(15));
        assert_eq!(seq.state(), SyncState::Synchronized);
    }

    #[test]
    fn test_duplicate_in_buffer_dropped_during_drain() {
        let mut seq = Sequencer::new("BTCUSDT", 16);
        seq.begin_sync();
        seq.on_update(update(8, 10));
        seq.on_update(update(8, 10));
        seq.on_update(update(11, 12));

        match seq.on_snapshot(snapshot(7)) {
            SequenceOutcome::Apply { updates, .. } => {
                assert_eq!(updates.len(), 2);
                assert_eq!(updates[0].first_update_id, 8);
                assert_eq!(updates[1].first_update_id, 11);
            }
            other => panic!("expected Apply, got {:?}", other),
        }
    }

    #[test]
    fn test_overlapping_buffered_ranges_apply_whole() {
        let mut seq = Sequencer::new("BTCUSDT", 16);
        seq.begin_sync();
        seq.on_update(update(5, 10));
        seq.on_update(update(8, 12));

        match seq.on_snapshot(snapshot(7)) {
            SequenceOutcome::Apply { updates, .. } => {
                assert_eq!(updates.len(), 2);
            }
            other => panic!("expected Apply, got {:?}", other),
        }
        assert_eq!(seq.expected_next_id(), Some(13));
    }

    #[test]
    fn test_gap_inside_buffered_run_abandons_attempt() {
        let mut seq = Sequencer::new("BTCUSDT", 16);
        seq.begin_sync();
        seq.on_update(update(8, 10));
        seq.on_update(update(15, 16));

        match seq.on_snapshot(snapshot(7)) {
            SequenceOutcome::SnapshotStale {
                oldest_first_id, ..
            } => assert_eq!(oldest_first_id, 15),
            other => panic!("expected SnapshotStale, got {:?}", other),
        }
        assert_eq!(seq.state(), SyncState::AwaitingSnapshot);
        assert_eq!(seq.buffered(), 1);

        // A snapshot beyond the gap resolves.
        match seq.on_snapshot(snapshot(14)) {
            SequenceOutcome::Apply { updates, .. } => {
                assert_eq!(updates[0].first_update_id, 15);
            }
            other => panic!("expected Apply, got {:?}", other),
        }
    }

    #[test]
    fn test_book_dump_synchronizes_alone() {
        let mut seq = Sequencer::new("BTCUSDT", 16);
        seq.begin_sync();

        match seq.on_book_dump(update(50, 50)) {
            SequenceOutcome::Apply { snapshot, updates } => {
                assert_eq!(snapshot.map(|s| s.last_update_id), Some(50));
                assert_eq!(updates.len(), 1);
            }
            other => panic!("expected Apply, got {:?}", other),
        }
        assert_eq!(seq.state(), SyncState::Synchronized);
        assert_eq!(seq.expected_next_id(), Some(51));
    }

    #[test]
    fn test_newer_book_dump_reseats_synchronized_cursor() {
        let mut seq = Sequencer::new("BTCUSDT", 16);
        seq.begin_sync();
        seq.on_book_dump(update(50, 50));

        // Dumps carry arbitrary id jumps; no contiguity between them.
        assert!(matches!(
            seq.on_book_dump(update(90, 90)),
            SequenceOutcome::Apply { .. }
        ));
        assert_eq!(seq.expected_next_id(), Some(91));

        // A stale dump is dropped.
        assert!(matches!(
            seq.on_book_dump(update(60, 60)),
            SequenceOutcome::Dropped
        ));
        assert_eq!(seq.expected_next_id(), Some(91));
    }

    #[test]
    fn test_stale_snapshot_result_ignored_when_synchronized() {
        let mut seq = Sequencer::new("BTCUSDT", 16);
        synced(&mut seq, 10);

        assert!(matches!(
            seq.on_snapshot(snapshot(9)),
            SequenceOutcome::Dropped
        ));
        assert_eq!(seq.state(), SyncState::Synchronized);
    }

    #[test]
    fn test_reset_clears_all_episode_state() {
        let mut seq = Sequencer::new("BTCUSDT", 16);
        seq.begin_sync();
        seq.on_update(update(5, 10));
        seq.reset();

        assert_eq!(seq.state(), SyncState::Unsynchronized);
        assert_eq!(seq.buffered(), 0);
        assert_eq!(seq.expected_next_id(), None);
    }
}
