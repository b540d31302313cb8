//! Configuration module for the synchronization engine

use serde::Deserialize;
use std::env;

/// Engine configuration
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Trading symbols to track (e.g., ["BTCUSDT", "ETHUSDT"])
    pub symbols: Vec<String>,

    /// REST API endpoint for order book snapshots
    pub rest_endpoint: String,

    /// Depth limit passed to the snapshot fetch
    pub snapshot_depth: usize,

    /// Maximum number of updates buffered while awaiting a snapshot
    pub buffer_capacity: usize,

    /// Number of recent trades retained per symbol
    pub trade_ring_capacity: usize,

    /// Delay before retrying a failed snapshot fetch
    pub snapshot_retry_delay_ms: u64,
}

impl Config {
    /// Load configuration from environment variables
    pub fn load() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let symbols: Vec<String> = env::var("SYMBOLS")
            .unwrap_or_else(|_| "BTCUSDT,ETHUSDT".to_string())
            .split(',')
            .map(|s| s.trim().to_uppercase())
            .collect();

        Ok(Self {
            symbols,
            rest_endpoint: env::var("REST_ENDPOINT")
                .unwrap_or_else(|_| "https://api.binance.com/api/v3".to_string()),
            snapshot_depth: env::var("SNAPSHOT_DEPTH")
                .unwrap_or_else(|_| "1000".to_string())
                .parse()
                .unwrap_or(1000),
            buffer_capacity: env::var("BUFFER_CAPACITY")
                .unwrap_or_else(|_| "1024".to_string())
                .parse()
                .unwrap_or(1024),
            trade_ring_capacity: env::var("TRADE_RING_CAPACITY")
                .unwrap_or_else(|_| "1000".to_string())
                .parse()
                .unwrap_or(1000),
            snapshot_retry_delay_ms: env::var("SNAPSHOT_RETRY_DELAY_MS")
                .unwrap_or_else(|_| "1000".to_string())
                .parse()
                .unwrap_or(1000),
        })
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            symbols: vec!["BTCUSDT".to_string()],
            rest_endpoint: "https://api.binance.com/api/v3".to_string(),
            snapshot_depth: 1000,
            buffer_capacity: 1024,
            trade_ring_capacity: 1000,
            snapshot_retry_delay_ms: 1000,
        }
    }
}
