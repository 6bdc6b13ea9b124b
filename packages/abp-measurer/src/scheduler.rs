//! Top-level crawl coordinator.
//!
//! One call to [`CrawlScheduler::run`] is one unit of work:
//! validate, probe (root jobs only), fetch filter lists, drive the browser,
//! normalize, classify, record, then sample children and enqueue them.
//! Children are never awaited; they run wherever the queue is drained.

use std::collections::HashSet;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde_json::Value;
use tracing::{debug, info, info_span, warn, Instrument};
use url::Url;

use crate::classifier::Classifier;
use crate::config::MeasurerConfig;
use crate::error::{DriverError, MeasureError, Result, StoreResult};
use crate::normalizer::normalize_logs;
use crate::recorder::{CrawlRecord, CrawlRecorder, FilterSource};
use crate::traits::{
    driver::{BrowserDriver, DriveOutput, DriveRequest},
    fetcher::SourceFetcher,
    matcher::MatcherFactory,
    queue::JobQueue,
};
use crate::types::job::CrawlTarget;
use crate::types::{CrawlId, CrawlJob};

/// External collaborators of the scheduler.
#[derive(Clone)]
pub struct MeasurerDeps {
    pub fetcher: Arc<dyn SourceFetcher>,
    pub driver: Arc<dyn BrowserDriver>,
    pub matchers: Arc<dyn MatcherFactory>,
    pub recorder: Arc<dyn CrawlRecorder>,
    pub queue: Arc<dyn JobQueue>,
}

/// Summary of a recorded crawl.
#[derive(Debug, Clone, PartialEq)]
pub struct CrawlReport {
    pub crawl_id: CrawlId,
    pub url: String,
    pub depth: i32,
    pub allowed: usize,
    pub blocked: usize,
    pub exceptions: usize,
    /// Child urls enqueued as new jobs
    pub children: Vec<String>,
}

/// Terminal outcome of one unit of work.
#[derive(Debug, Clone, PartialEq)]
pub enum CrawlOutcome {
    /// The root target failed its probe; an unreachable fact was recorded.
    Unreachable { domain: String, url: String },
    Recorded(CrawlReport),
}

impl CrawlOutcome {
    pub fn crawl_id(&self) -> Option<CrawlId> {
        match self {
            CrawlOutcome::Recorded(report) => Some(report.crawl_id),
            CrawlOutcome::Unreachable { .. } => None,
        }
    }
}

pub struct CrawlScheduler {
    deps: MeasurerDeps,
    config: MeasurerConfig,
    rng: Mutex<StdRng>,
}

impl CrawlScheduler {
    pub fn new(deps: MeasurerDeps, config: MeasurerConfig) -> Self {
        Self {
            deps,
            config,
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    /// Use a deterministic child sampler.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = Mutex::new(StdRng::seed_from_u64(seed));
        self
    }

    pub fn config(&self) -> &MeasurerConfig {
        &self.config
    }

    /// Validate an untyped job message and run it.
    pub async fn run_value(&self, value: Value) -> Result<CrawlOutcome> {
        let job = CrawlJob::from_value(value)?;
        self.run(&job).await
    }

    /// Run one job.
    pub async fn run(&self, job: &CrawlJob) -> Result<CrawlOutcome> {
        let target = job.validate()?;
        let span = info_span!(
            "crawl",
            batch = %job.batch,
            url = %target.url,
            depth = job.depth,
            breadth = job.breadth,
            parent = ?job.parent_crawl_id,
        );
        self.execute(job, target).instrument(span).await
    }

    async fn execute(&self, job: &CrawlJob, target: CrawlTarget) -> Result<CrawlOutcome> {
        if job.is_root() {
            if let Err(e) = self
                .deps
                .fetcher
                .probe(&target.url, self.config.probe_timeout)
                .await
            {
                warn!(error = %e, "target unreachable");
                let record = CrawlRecord::from_job(job, &target, Vec::new());
                bounded(
                    "record_unreachable",
                    self.config.storage_timeout,
                    self.deps.recorder.record_unreachable(&record),
                )
                .await?;
                return Ok(CrawlOutcome::Unreachable {
                    domain: target.domain,
                    url: target.url,
                });
            }
        }

        let lists = self.fetch_filter_lists(job).await?;
        let record = CrawlRecord::from_job(job, &target, lists);
        let rule_text = record.rule_text();
        let classifier = Classifier::build(self.deps.matchers.as_ref(), &rule_text)?;

        let collect_children = job.depth > 1;
        let output = self
            .visit(&target.url, &rule_text, Duration::from_secs(job.secs), collect_children)
            .await?;

        let mut requests = normalize_logs(&output.logs);
        for request in &mut requests {
            if let Some(hash) = output.content_hashes.get(&request.request_id) {
                request.content_hash = Some(hash.clone());
            }
        }
        debug!(entries = output.logs.len(), requests = requests.len(), "normalized logs");

        let buckets = classifier.classify(requests);
        let crawl_id = bounded(
            "record_crawl",
            self.config.storage_timeout,
            self.deps.recorder.record_crawl(&record, &buckets),
        )
        .await?;

        let children = match output.child_urls {
            Some(candidates) if job.depth > 1 && job.breadth > 0 => {
                self.dispatch_children(job, &target, crawl_id, candidates)
                    .await?
            }
            _ => Vec::new(),
        };

        info!(
            crawl = %crawl_id,
            children = children.len(),
            "crawl complete"
        );
        Ok(CrawlOutcome::Recorded(CrawlReport {
            crawl_id,
            url: target.url,
            depth: job.depth,
            allowed: buckets.allowed.len(),
            blocked: buckets.blocked.len(),
            exceptions: buckets.exceptions.len(),
            children,
        }))
    }

    /// Fetch every filter list; any failure aborts the attempt.
    async fn fetch_filter_lists(&self, job: &CrawlJob) -> Result<Vec<FilterSource>> {
        let mut lists = Vec::with_capacity(job.filter_list_urls.len());
        for url in &job.filter_list_urls {
            let text = self
                .deps
                .fetcher
                .fetch_text(url, self.config.fetch_timeout)
                .await
                .map_err(|source| MeasureError::InvalidFilterSource {
                    url: url.clone(),
                    source,
                })?;
            debug!(list = %url, bytes = text.len(), "fetched filter list");
            lists.push(FilterSource {
                url: url.clone(),
                text,
            });
        }
        Ok(lists)
    }

    /// Drive one page visit. The session is released on every path.
    async fn visit(
        &self,
        url: &str,
        rule_text: &str,
        dwell: Duration,
        collect_children: bool,
    ) -> Result<DriveOutput> {
        let automation = |source: DriverError| MeasureError::Automation {
            url: url.to_string(),
            source,
        };

        let limit = self.config.driver_timeout.saturating_add(dwell);
        let mut session = self.deps.driver.open().await.map_err(automation)?;
        let request = DriveRequest {
            url,
            rule_text,
            dwell,
            collect_children,
        };
        let started = Instant::now();
        let result = tokio::time::timeout(limit, session.drive(&request)).await;
        session.release().await;

        match result {
            Ok(Ok(output)) => {
                debug!(
                    elapsed = ?started.elapsed(),
                    logs = output.logs.len(),
                    "page visit finished"
                );
                Ok(output)
            }
            Ok(Err(e)) => Err(automation(e)),
            Err(_) => Err(automation(DriverError::TimedOut(limit))),
        }
    }

    async fn dispatch_children(
        &self,
        job: &CrawlJob,
        target: &CrawlTarget,
        crawl_id: CrawlId,
        candidates: Vec<String>,
    ) -> Result<Vec<String>> {
        let sampled = self.sample_children(&target.url, candidates, job.breadth as usize);
        for url in &sampled {
            let child = job.child(url.clone(), crawl_id);
            let job_id = self.deps.queue.enqueue(&child).await?;
            debug!(child = %url, job = %job_id, "enqueued child crawl");
        }
        Ok(sampled)
    }

    /// Uniformly sample up to `breadth` distinct same-host urls.
    fn sample_children(
        &self,
        page_url: &str,
        candidates: Vec<String>,
        breadth: usize,
    ) -> Vec<String> {
        let host = Url::parse(page_url)
            .ok()
            .and_then(|u| u.host_str().map(str::to_string));
        let Some(host) = host else {
            return Vec::new();
        };

        let mut seen = HashSet::new();
        let eligible: Vec<String> = candidates
            .into_iter()
            .filter(|candidate| candidate != page_url)
            .filter(|candidate| {
                Url::parse(candidate)
                    .map(|u| {
                        matches!(u.scheme(), "http" | "https")
                            && u.host_str() == Some(host.as_str())
                    })
                    .unwrap_or(false)
            })
            .filter(|candidate| seen.insert(candidate.clone()))
            .collect();

        let mut rng = self.rng.lock().unwrap_or_else(PoisonError::into_inner);
        eligible
            .choose_multiple(&mut *rng, breadth.min(eligible.len()))
            .cloned()
            .collect()
    }
}

/// Run a storage call under a deadline.
async fn bounded<T, F>(stage: &'static str, limit: Duration, call: F) -> Result<T>
where
    F: Future<Output = StoreResult<T>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => Ok(result?),
        Err(_) => Err(MeasureError::Timeout {
            stage,
            elapsed: limit,
        }),
    }
}
