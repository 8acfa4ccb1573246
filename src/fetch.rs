use bytes::Bytes;
use reqwest::blocking;
use std::time::Duration;
use tracing::debug;

use crate::error::{Result, TransitError};

/// Blocking HTTP GET with a per-call timeout.
pub trait Fetcher: Send + Sync {
    fn get(&self, url: &str, timeout: Duration) -> Result<Bytes>;
}

pub struct HttpFetcher {
    client: blocking::Client,
}

impl HttpFetcher {
    pub fn new() -> Result<Self> {
        let client = blocking::Client::builder()
            .user_agent(concat!("next-bus/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| TransitError::Download(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self { client })
    }
}

impl Fetcher for HttpFetcher {
    fn get(&self, url: &str, timeout: Duration) -> Result<Bytes> {
        debug!(url, timeout_secs = timeout.as_secs_f64(), "HTTP GET");

        let response = self.client.get(url)
            .timeout(timeout)
            .send()
            .map_err(|e| TransitError::Download(format!("Failed to fetch {}: {}", url, e)))?;

        if !response.status().is_success() {
            return Err(TransitError::Download(format!(
                "{} returned status: {}",
                url,
                response.status()
            )));
        }

        let body = response.bytes()
            .map_err(|e| TransitError::Download(format!("Failed to read response from {}: {}", url, e)))?;

        debug!(url, bytes = body.len(), "HTTP GET complete");
        Ok(body)
    }
}
