use async_trait::async_trait;
use std::time::Duration;

use crate::error::FetchError;

/// Plain HTTP access used for the reachability probe and filter lists.
#[async_trait]
pub trait SourceFetcher: Send + Sync {
    /// Succeeds if the url answered with a success status in time.
    async fn probe(&self, url: &str, timeout: Duration) -> Result<(), FetchError>;

    /// Fetch a url's body as text.
    async fn fetch_text(&self, url: &str, timeout: Duration) -> Result<String, FetchError>;
}
