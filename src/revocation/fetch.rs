//! CRL retrieval.

use std::time::Duration;

use async_trait::async_trait;
use http::StatusCode;
use tracing::debug;

use crate::egress::EgressClient;
use crate::{Error, Result};

/// Something that returns the raw bytes of the CRL at a URL.
#[async_trait]
pub trait CrlSource: Send + Sync + std::fmt::Debug {
    /// Fetch the CRL published at `url`.
    async fn fetch(&self, url: &str) -> Result<Vec<u8>>;
}

/// Fetches CRLs over HTTP(S) through the egress client.
#[derive(Debug, Clone)]
pub struct HttpCrlSource {
    client: EgressClient,
    timeout: Duration,
    max_size: usize,
}

impl HttpCrlSource {
    /// Create a source bounded by `timeout` per fetch and `max_size` bytes.
    pub fn new(client: EgressClient, timeout: Duration, max_size: usize) -> Self {
        Self {
            client,
            timeout,
            max_size,
        }
    }
}

#[async_trait]
impl CrlSource for HttpCrlSource {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>> {
        let response = self.client.get(url, self.timeout, self.max_size).await?;
        if response.status() != StatusCode::OK {
            return Err(Error::Network(format!(
                "CRL fetch from {url} returned {}",
                response.status()
            )));
        }
        let body = response.into_body();
        if body.is_empty() {
            return Err(Error::Network(format!("CRL fetch from {url} returned an empty body")));
        }
        debug!(url = %url, bytes = body.len(), "Fetched CRL");
        Ok(body.to_vec())
    }
}
