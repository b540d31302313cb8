//! Error types for the stream synchronization engine

use thiserror::Error;

/// Stream synchronization errors
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("failed to decode stream message: {0}")]
    Decode(String),

    #[error("unexpected event type: {0}")]
    UnexpectedEventType(String),

    #[error("desynchronized on {symbol}: expected first update id {expected}, got {got}")]
    Desynchronized {
        symbol: String,
        expected: u64,
        got: u64,
    },

    #[error("snapshot at update id {snapshot_id} predates buffered stream starting at {oldest_first_id}")]
    SnapshotRace {
        snapshot_id: u64,
        oldest_first_id: u64,
    },

    #[error("update for {got} applied to cache bound to {bound}")]
    SymbolMismatch { bound: String, got: String },

    #[error("snapshot fetch failed: {0}")]
    SnapshotFetch(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("operation cancelled")]
    Cancelled,
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::Decode(err.to_string())
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(err: reqwest::Error) -> Self {
        SyncError::SnapshotFetch(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for SyncError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        SyncError::Transport(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;
