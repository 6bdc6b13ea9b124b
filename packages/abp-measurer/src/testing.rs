//! Testing utilities including mock collaborators.
//!
//! These let the scheduler and recorder run end to end without a browser, a
//! network or a real rule-matching engine.

use async_trait::async_trait;
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use url::Url;

use crate::error::{DriverError, FetchError, MatcherError};
use crate::traits::{
    driver::{BrowserDriver, BrowserSession, DriveOutput, DriveRequest},
    fetcher::SourceFetcher,
    matcher::{MatchResult, MatcherFactory, RuleMatcher, TypeMask},
};
use crate::types::RawLogEntry;

/// Build a `Network.requestWillBeSent` log entry the way a browser driver
/// hands it over.
pub fn request_log_entry(
    request_id: &str,
    document_url: &str,
    request_url: &str,
    resource_type: &str,
) -> RawLogEntry {
    let message = json!({
        "message": {
            "method": "Network.requestWillBeSent",
            "params": {
                "requestId": request_id,
                "documentURL": document_url,
                "request": { "url": request_url, "method": "GET" },
                "type": resource_type,
                "initiator": { "type": "parser", "url": document_url },
                "timestamp": 1.0,
            }
        },
        "webview": "mock"
    });
    RawLogEntry {
        level: Some("INFO".to_string()),
        timestamp: None,
        message: message.to_string(),
    }
}

// ============================================================================
// Fetcher
// ============================================================================

/// Record of a call made to the mock fetcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockFetchCall {
    Probe { url: String },
    Fetch { url: String },
}

/// A mock HTTP fetcher.
///
/// Every url is reachable unless marked otherwise; `fetch_text` serves the
/// registered bodies and answers 404 for anything else.
#[derive(Default, Clone)]
pub struct MockFetcher {
    texts: Arc<RwLock<HashMap<String, String>>>,
    unreachable: Arc<RwLock<HashSet<String>>>,
    calls: Arc<RwLock<Vec<MockFetchCall>>>,
}

impl MockFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve `text` for `url`.
    pub fn with_text(self, url: impl Into<String>, text: impl Into<String>) -> Self {
        self.texts.write().unwrap().insert(url.into(), text.into());
        self
    }

    /// Make probes of `url` fail.
    pub fn with_unreachable(self, url: impl Into<String>) -> Self {
        self.unreachable.write().unwrap().insert(url.into());
        self
    }

    pub fn calls(&self) -> Vec<MockFetchCall> {
        self.calls.read().unwrap().clone()
    }

    pub fn probe_count(&self) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, MockFetchCall::Probe { .. }))
            .count()
    }
}

#[async_trait]
impl SourceFetcher for MockFetcher {
    async fn probe(&self, url: &str, _timeout: Duration) -> Result<(), FetchError> {
        self.calls
            .write()
            .unwrap()
            .push(MockFetchCall::Probe { url: url.to_string() });
        if self.unreachable.read().unwrap().contains(url) {
            return Err(FetchError::Status {
                url: url.to_string(),
                status: 503,
            });
        }
        Ok(())
    }

    async fn fetch_text(&self, url: &str, _timeout: Duration) -> Result<String, FetchError> {
        self.calls
            .write()
            .unwrap()
            .push(MockFetchCall::Fetch { url: url.to_string() });
        self.texts
            .read()
            .unwrap()
            .get(url)
            .cloned()
            .ok_or_else(|| FetchError::Status {
                url: url.to_string(),
                status: 404,
            })
    }
}

// ============================================================================
// Browser driver
// ============================================================================

/// What the mock browser observes on one page.
#[derive(Debug, Clone, Default)]
pub struct MockPage {
    pub logs: Vec<RawLogEntry>,
    pub children: Vec<String>,
    pub content_hashes: HashMap<String, String>,
}

impl MockPage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_log(mut self, entry: RawLogEntry) -> Self {
        self.logs.push(entry);
        self
    }

    pub fn with_children<I, S>(mut self, children: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.children.extend(children.into_iter().map(Into::into));
        self
    }

    pub fn with_content_hash(mut self, request_id: &str, hash: &str) -> Self {
        self.content_hashes
            .insert(request_id.to_string(), hash.to_string());
        self
    }
}

#[derive(Debug, Clone)]
enum Failure {
    Crash,
    Hang,
}

/// Record of a page visit made through the mock driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockDriveCall {
    pub url: String,
    pub dwell: Duration,
    pub collect_children: bool,
    pub rule_text: String,
}

/// A mock browser driver.
///
/// Unknown urls load as empty pages. Sessions count opens and releases so
/// tests can assert that every session was given back.
#[derive(Default, Clone)]
pub struct MockDriver {
    pages: Arc<RwLock<HashMap<String, MockPage>>>,
    failures: Arc<RwLock<HashMap<String, Failure>>>,
    fail_open: bool,
    opened: Arc<AtomicUsize>,
    released: Arc<AtomicUsize>,
    calls: Arc<RwLock<Vec<MockDriveCall>>>,
}

impl MockDriver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_page(self, url: impl Into<String>, page: MockPage) -> Self {
        self.pages.write().unwrap().insert(url.into(), page);
        self
    }

    /// The browser crashes while visiting `url`.
    pub fn with_crash(self, url: impl Into<String>) -> Self {
        self.failures
            .write()
            .unwrap()
            .insert(url.into(), Failure::Crash);
        self
    }

    /// Visiting `url` never finishes.
    pub fn with_hang(self, url: impl Into<String>) -> Self {
        self.failures
            .write()
            .unwrap()
            .insert(url.into(), Failure::Hang);
        self
    }

    /// Opening a session fails.
    pub fn with_failing_open(mut self) -> Self {
        self.fail_open = true;
        self
    }

    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> Vec<MockDriveCall> {
        self.calls.read().unwrap().clone()
    }

    pub fn visited(&self) -> Vec<String> {
        self.calls().into_iter().map(|c| c.url).collect()
    }
}

#[async_trait]
impl BrowserDriver for MockDriver {
    async fn open(&self) -> Result<Box<dyn BrowserSession>, DriverError> {
        if self.fail_open {
            return Err(DriverError::Session("no browser available".into()));
        }
        self.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockSession {
            driver: self.clone(),
        }))
    }
}

struct MockSession {
    driver: MockDriver,
}

#[async_trait]
impl BrowserSession for MockSession {
    async fn drive(&mut self, request: &DriveRequest<'_>) -> Result<DriveOutput, DriverError> {
        self.driver.calls.write().unwrap().push(MockDriveCall {
            url: request.url.to_string(),
            dwell: request.dwell,
            collect_children: request.collect_children,
            rule_text: request.rule_text.to_string(),
        });

        let failure = self.driver.failures.read().unwrap().get(request.url).cloned();
        match failure {
            Some(Failure::Crash) => {
                return Err(DriverError::Crashed(format!("renderer died on {}", request.url)))
            }
            Some(Failure::Hang) => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
            None => {}
        }

        let page = self
            .driver
            .pages
            .read()
            .unwrap()
            .get(request.url)
            .cloned()
            .unwrap_or_default();
        Ok(DriveOutput {
            logs: page.logs,
            child_urls: request.collect_children.then_some(page.children),
            content_hashes: page.content_hashes,
        })
    }

    async fn release(self: Box<Self>) {
        self.driver.released.fetch_add(1, Ordering::SeqCst);
    }
}

// ============================================================================
// Rule matcher
// ============================================================================

/// Builds [`MockMatcher`]s and counts builds.
#[derive(Default, Clone)]
pub struct MockMatcherFactory {
    builds: Arc<AtomicUsize>,
    fail: bool,
}

impl MockMatcherFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every build fails.
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn builds(&self) -> usize {
        self.builds.load(Ordering::SeqCst)
    }
}

impl MatcherFactory for MockMatcherFactory {
    fn build(&self, rule_lines: &[String]) -> Result<Arc<dyn RuleMatcher>, MatcherError> {
        self.builds.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(MatcherError::Build("mock matcher configured to fail".into()));
        }
        Ok(Arc::new(MockMatcher::new(rule_lines)))
    }
}

#[derive(Debug, Clone)]
struct MockRule {
    text: String,
    exception: bool,
    anchored_host: Option<String>,
    path: String,
    types: TypeMask,
}

/// A tiny subset of filter syntax: `||host^`, `||host/path`, plain substring
/// patterns, `@@` exceptions and resource-type options. Cosmetic rules are
/// ignored. Enough for deterministic tests, nothing more.
#[derive(Debug, Clone)]
pub struct MockMatcher {
    rules: Vec<MockRule>,
}

const ALL_TYPES: TypeMask = TypeMask(u32::MAX);

impl MockMatcher {
    pub fn new(rule_lines: &[String]) -> Self {
        Self {
            rules: rule_lines.iter().filter_map(|l| parse_rule(l)).collect(),
        }
    }

    fn first_match(&self, exception: bool, url: &Url, types: TypeMask) -> Option<&MockRule> {
        self.rules
            .iter()
            .filter(|r| r.exception == exception)
            .find(|r| r.types.intersects(types) && rule_matches(r, url))
    }
}

impl RuleMatcher for MockMatcher {
    fn matches(&self, url: &str, types: TypeMask, _origin_hostname: Option<&str>) -> MatchResult {
        let Ok(parsed) = Url::parse(url) else {
            return MatchResult::no_match();
        };
        match self.first_match(false, &parsed, types) {
            None => MatchResult::no_match(),
            Some(block) => match self.first_match(true, &parsed, types) {
                Some(exception) => MatchResult::excepted(&block.text, &exception.text),
                None => MatchResult::blocked(&block.text),
            },
        }
    }
}

fn parse_rule(line: &str) -> Option<MockRule> {
    if line.contains("##") || line.contains("#@#") {
        return None;
    }
    let (exception, body) = match line.strip_prefix("@@") {
        Some(rest) => (true, rest),
        None => (false, line),
    };
    let (pattern, options) = match body.split_once('$') {
        Some((pattern, options)) => (pattern, Some(options)),
        None => (body, None),
    };

    let mut types = TypeMask::default();
    for option in options.into_iter().flat_map(|o| o.split(',')) {
        types |= match option {
            "script" => TypeMask::SCRIPT,
            "image" => TypeMask::IMAGE,
            "stylesheet" => TypeMask::STYLESHEET,
            "object" => TypeMask::OBJECT,
            "xmlhttprequest" => TypeMask::XML_HTTP_REQUEST,
            "object-subrequest" => TypeMask::OBJECT_SUBREQUEST,
            "subdocument" => TypeMask::SUBDOCUMENT,
            "document" => TypeMask::DOCUMENT,
            "other" => TypeMask::OTHER,
            _ => TypeMask::default(),
        };
    }
    if types == TypeMask::default() {
        types = ALL_TYPES;
    }

    let pattern = pattern.split('^').next().unwrap_or_default();
    let (anchored_host, path) = match pattern.strip_prefix("||") {
        Some(rest) => match rest.find('/') {
            Some(slash) => (Some(rest[..slash].to_string()), rest[slash..].to_string()),
            None => (Some(rest.to_string()), String::new()),
        },
        None => (None, pattern.trim_matches('*').to_string()),
    };
    if anchored_host.is_none() && path.is_empty() {
        return None;
    }

    Some(MockRule {
        text: line.to_string(),
        exception,
        anchored_host,
        path,
        types,
    })
}

fn rule_matches(rule: &MockRule, url: &Url) -> bool {
    match &rule.anchored_host {
        Some(host) => {
            let url_host = url.host_str().unwrap_or_default();
            let host_matches =
                url_host == host || url_host.ends_with(&format!(".{host}"));
            let path_and_query = match url.query() {
                Some(query) => format!("{}?{}", url.path(), query),
                None => url.path().to_string(),
            };
            host_matches && path_and_query.starts_with(&rule.path)
        }
        None => url.as_str().contains(&rule.path),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matcher(lines: &[&str]) -> MockMatcher {
        MockMatcher::new(&lines.iter().map(|l| l.to_string()).collect::<Vec<_>>())
    }

    #[test]
    fn host_anchor_covers_subdomains_only() {
        let m = matcher(&["||ads.example^"]);
        assert!(m.matches("https://cdn.ads.example/a.js", ALL_TYPES, None).matches);
        assert!(!m.matches("https://badads.example/a.js", ALL_TYPES, None).matches);
    }

    #[test]
    fn cosmetic_rules_never_match() {
        let m = matcher(&["ads.example##.banner"]);
        assert_eq!(
            m.matches("https://ads.example/", ALL_TYPES, None),
            MatchResult::no_match()
        );
    }

    #[tokio::test]
    async fn unknown_pages_load_empty_and_release_is_counted() {
        let driver = MockDriver::new();
        let mut session = driver.open().await.unwrap();
        let output = session
            .drive(&DriveRequest {
                url: "http://site.test",
                rule_text: "",
                dwell: Duration::ZERO,
                collect_children: true,
            })
            .await
            .unwrap();
        session.release().await;

        assert!(output.logs.is_empty());
        assert_eq!(output.child_urls, Some(Vec::new()));
        assert_eq!((driver.opened(), driver.released()), (1, 1));
    }
}
