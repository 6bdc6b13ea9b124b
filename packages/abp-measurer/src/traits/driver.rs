//! External browser-automation capability.

use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;

use crate::error::DriverError;
use crate::types::RawLogEntry;

/// Arguments for one page visit.
#[derive(Debug, Clone)]
pub struct DriveRequest<'a> {
    pub url: &'a str,
    /// Union of all attached filter-list texts
    pub rule_text: &'a str,
    pub dwell: Duration,
    /// Whether candidate child urls should be collected
    pub collect_children: bool,
}

/// What a page visit produced.
#[derive(Debug, Clone, Default)]
pub struct DriveOutput {
    pub logs: Vec<RawLogEntry>,
    /// Same-host links found on the page, when requested
    pub child_urls: Option<Vec<String>>,
    /// Response body hashes keyed by DevTools request id, for the requests
    /// whose content the driver fetched
    pub content_hashes: HashMap<String, String>,
}

/// Opens exclusive browser sessions.
#[async_trait]
pub trait BrowserDriver: Send + Sync {
    async fn open(&self) -> Result<Box<dyn BrowserSession>, DriverError>;
}

/// A browser session owned by exactly one unit of work.
///
/// Callers must call [`BrowserSession::release`] on every exit path,
/// including after a failed or timed-out `drive`.
#[async_trait]
pub trait BrowserSession: Send {
    async fn drive(&mut self, request: &DriveRequest<'_>) -> Result<DriveOutput, DriverError>;

    async fn release(self: Box<Self>);
}
