//! Chain client
//!
//! The stablecoin ledger is read through a narrow trait so the poll sweep
//! and the tests never care whether transfers come from a gateway HTTP API
//! or a fixture. The platform assumes a single ledger with integer
//! minor-unit amounts and an opaque per-transfer memo.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;

/// One observed inbound transfer to a monitored deposit address.
#[derive(Debug, Clone, Deserialize)]
pub struct ChainTransfer {
    pub tx_hash: String,
    pub sender_address: String,
    /// Stablecoin minor units
    pub amount: i64,
    /// Raw memo as carried on the transfer
    pub memo: String,
    /// Gateway-assigned monotone position used as the poll checkpoint
    pub cursor: i64,
}

#[async_trait]
pub trait ChainClient: Send + Sync {
    /// List transfers strictly after the given cursor, oldest first.
    async fn list_transfers(&self, since_cursor: i64) -> Result<Vec<ChainTransfer>>;
}

/// HTTP implementation against the chain gateway's transfer listing API.
pub struct HttpChainClient {
    client: reqwest::Client,
    base_url: String,
}

#[derive(Debug, Deserialize)]
struct TransferListResponse {
    transfers: Vec<ChainTransfer>,
}

impl HttpChainClient {
    pub fn new(base_url: String, timeout_secs: u64) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .user_agent("LocalStable-Monitor/1.0")
            .build()
            .context("Failed to build chain HTTP client")?;
        Ok(Self { client, base_url })
    }
}

#[async_trait]
impl ChainClient for HttpChainClient {
    async fn list_transfers(&self, since_cursor: i64) -> Result<Vec<ChainTransfer>> {
        let url = format!("{}/v1/transfers", self.base_url);
        let response = self
            .client
            .get(&url)
            .query(&[("since", since_cursor.to_string())])
            .send()
            .await
            .context("Chain gateway request failed")?;

        if !response.status().is_success() {
            anyhow::bail!(
                "Chain gateway returned HTTP {} listing transfers",
                response.status()
            );
        }

        let body: TransferListResponse = response
            .json()
            .await
            .context("Failed to decode chain gateway response")?;

        Ok(body.transfers)
    }
}
