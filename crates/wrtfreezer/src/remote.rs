use std::time::Duration;

use reqwest::blocking::{Client, Response};

use crate::device::DeviceCoordinate;
use crate::error::{Error, Result};

const READ_TIMEOUT: Duration = Duration::from_secs(60);

/// Download server holding manifests, image builders and package feeds.
#[derive(Debug, Clone)]
pub struct RemoteServer {
    base_url: String,
    client: Client,
}

impl RemoteServer {
    pub fn new(base_url: &str) -> Result<Self> {
        let base_url = base_url.trim().trim_end_matches('/').to_string();
        if base_url.is_empty() {
            return Err(Error::config("download base URL is empty"));
        }
        // The blocking client applies `timeout` to the response head and to
        // each body read, not to the whole transfer.
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .timeout(READ_TIMEOUT)
            .build()
            .map_err(|e| Error::network(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { base_url, client })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn url_for(&self, coord: &DeviceCoordinate, filename: &str) -> String {
        coord.remote_file(&self.base_url, filename)
    }

    pub fn get(&self, url: &str) -> Result<Response> {
        self.client
            .get(url)
            .send()
            .map_err(|e| Error::network(format!("GET {url} failed: {e}")))
    }

    pub fn get_with_timeout(&self, url: &str, timeout: Duration) -> Result<Response> {
        self.client
            .get(url)
            .timeout(timeout)
            .send()
            .map_err(|e| Error::network(format!("GET {url} failed: {e}")))
    }
}
