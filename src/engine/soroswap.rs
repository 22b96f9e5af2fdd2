//! # engine::soroswap
//!
//! Shared HTTP plumbing for the Soroswap aggregator API.
//!
//! ```text
//! POST /quote        → QuoteClient::get_quote
//! GET  /price        → QuoteClient::get_price
//! POST /quote/build  → TransactionBuilder::build
//! POST /send         → Submitter::submit
//! GET  /send/status  → Submitter::status
//! ```
//!
//! Every request carries `?network=<testnet|mainnet>` and a bearer API key.
//! The trait impls live next to their traits (`quote_client`, `builder`,
//! `submitter`).

use std::time::Duration;

use reqwest::{Method, RequestBuilder};

use crate::config::SoroswapConfig;

#[derive(Clone)]
pub struct SoroswapClient {
    http:   reqwest::Client,
    config: SoroswapConfig,
}

impl SoroswapClient {
    /// `http` is the process-wide client (connection pooling).
    pub fn new(http: reqwest::Client, config: SoroswapConfig) -> Self {
        Self { http, config }
    }

    pub fn config(&self) -> &SoroswapConfig {
        &self.config
    }

    pub(crate) fn request(&self, method: Method, path: &str, timeout: Duration) -> RequestBuilder {
        let url = format!("{}{}", self.config.api_url, path);
        self.http
            .request(method, url)
            .query(&[("network", self.config.network.as_str())])
            .bearer_auth(self.config.api_key.expose())
            .timeout(timeout)
    }
}

impl std::fmt::Debug for SoroswapClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SoroswapClient")
            .field("api_url", &self.config.api_url)
            .field("network", &self.config.network)
            .finish()
    }
}
