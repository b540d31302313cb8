//! Snapshot provider
//!
//! The engine only depends on the return contract: a consistent
//! `lastUpdateId` with the full level set at that id.

use async_trait::async_trait;
use tracing::debug;

use crate::decoder::BookSnapshot;
use crate::error::Result;

/// Asynchronous source of authoritative order book snapshots
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SnapshotProvider: Send + Sync {
    async fn fetch_snapshot(&self, symbol: &str, limit: usize) -> Result<BookSnapshot>;
}

/// REST-backed snapshot provider for the exchange `/depth` endpoint
pub struct RestSnapshotProvider {
    client: reqwest::Client,
    endpoint: String,
}

impl RestSnapshotProvider {
    pub fn new(endpoint: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl SnapshotProvider for RestSnapshotProvider {
    async fn fetch_snapshot(&self, symbol: &str, limit: usize) -> Result<BookSnapshot> {
        let url = format!(
            "{}/depth?symbol={}&limit={}",
            self.endpoint, symbol, limit
        );
        debug!(symbol = %symbol, url = %url, "fetching order book snapshot");

        let snapshot = self
            .client
            .get(&url)
            .send()
            .await?
            .error_for_status()?
            .json::<BookSnapshot>()
            .await?;

        debug!(
            symbol = %symbol,
            last_update_id = snapshot.last_update_id,
            bids = snapshot.bids.len(),
            asks = snapshot.asks.len(),
            "snapshot fetched"
        );
        Ok(snapshot)
    }
}
