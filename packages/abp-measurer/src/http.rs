//! reqwest-backed reachability probe and filter-list download.

use async_trait::async_trait;
use std::time::Duration;
use tracing::debug;

use crate::config::{MeasurerConfig, DEFAULT_USER_AGENT};
use crate::error::FetchError;
use crate::traits::fetcher::SourceFetcher;

/// HTTP fetcher sending a desktop browser User-Agent.
#[derive(Clone)]
pub struct HttpSourceFetcher {
    client: reqwest::Client,
}

impl HttpSourceFetcher {
    pub fn new() -> Result<Self, FetchError> {
        Self::with_user_agent(DEFAULT_USER_AGENT)
    }

    pub fn from_config(config: &MeasurerConfig) -> Result<Self, FetchError> {
        Self::with_user_agent(&config.user_agent)
    }

    pub fn with_user_agent(user_agent: &str) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .user_agent(user_agent)
            .redirect(reqwest::redirect::Policy::limited(10))
            .build()
            .map_err(|e| FetchError::Http(Box::new(e)))?;
        Ok(Self { client })
    }

    async fn get(&self, url: &str, timeout: Duration) -> Result<reqwest::Response, FetchError> {
        let response = self
            .client
            .get(url)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| classify(url, e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }
        Ok(response)
    }
}

fn classify(url: &str, err: reqwest::Error) -> FetchError {
    if err.is_timeout() {
        FetchError::Timeout {
            url: url.to_string(),
        }
    } else {
        FetchError::Http(Box::new(err))
    }
}

#[async_trait]
impl SourceFetcher for HttpSourceFetcher {
    async fn probe(&self, url: &str, timeout: Duration) -> Result<(), FetchError> {
        self.get(url, timeout).await?;
        debug!(url, "probe succeeded");
        Ok(())
    }

    async fn fetch_text(&self, url: &str, timeout: Duration) -> Result<String, FetchError> {
        let response = self.get(url, timeout).await?;
        let text = response.text().await.map_err(|e| classify(url, e))?;
        debug!(url, bytes = text.len(), "fetched filter list");
        Ok(text)
    }
}
