//! Retrieval of remote documents (port mappings, the daemon's own binary).

use std::time::Duration;

use async_trait::async_trait;
use log::warn;
use tokio::time::sleep;

use crate::error::{Error, Result};

const RETRY_DELAY: Duration = Duration::from_secs(2);

#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>>;
}

/// HTTP(S) fetcher with a small fixed number of local retries.
pub struct HttpFetcher {
    client: reqwest::Client,
    retries: u32,
}

impl HttpFetcher {
    pub fn new(retries: u32) -> Self {
        Self {
            client: reqwest::Client::new(),
            retries,
        }
    }

    async fn fetch_once(&self, url: &str) -> Result<Vec<u8>> {
        let to_err = |source| Error::Fetch {
            url: url.to_string(),
            source,
        };
        let response = self.client.get(url).send().await.map_err(to_err)?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::FetchStatus {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }
        let body = response.bytes().await.map_err(to_err)?;
        Ok(body.to_vec())
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>> {
        let mut attempt = 0;
        loop {
            match self.fetch_once(url).await {
                Ok(body) => return Ok(body),
                Err(e) if attempt < self.retries => {
                    attempt += 1;
                    warn!(
                        "Fetch of {} failed ({}), retry {}/{} in {:?}",
                        url, e, attempt, self.retries, RETRY_DELAY
                    );
                    sleep(RETRY_DELAY).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
