//! Shared setup for integration tests.
//!
//! Wires the scheduler to mock collaborators, the in-memory store and the
//! in-memory queue, so every test sees the full pipeline without a browser
//! or a database.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use abp_measurer::testing::{MockDriver, MockFetcher, MockMatcherFactory};
use abp_measurer::{
    CrawlJob, CrawlScheduler, JobWorker, JobWorkerConfig, MeasurerConfig, MeasurerDeps,
    MemoryJobQueue, MemoryStore, ResultRecorder,
};

pub const EASYLIST_URL: &str = "https://lists.test/easylist.txt";
pub const EASYLIST: &str = "! Title: test list\n||ads.example^$script\n@@||ads.example/x.js$script\nexample.com##.banner\n";

/// Initialize tracing once. Run with `RUST_LOG=debug cargo test -- --nocapture`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Test configuration with short deadlines.
pub fn test_config() -> MeasurerConfig {
    MeasurerConfig {
        probe_timeout: Duration::from_millis(200),
        fetch_timeout: Duration::from_millis(200),
        driver_timeout: Duration::from_millis(200),
        storage_timeout: Duration::from_secs(5),
        poll_interval: Duration::from_millis(10),
        ..MeasurerConfig::default()
    }
}

/// A root job against `site.test` with the test list attached and no dwell.
pub fn root_job() -> CrawlJob {
    CrawlJob::new("batch-0001", vec![EASYLIST_URL.to_string()])
        .with_domain("site.test")
        .with_secs(0)
}

/// Mock collaborators plus the scheduler and worker built over them.
pub struct TestHarness {
    pub fetcher: MockFetcher,
    pub driver: MockDriver,
    pub matchers: MockMatcherFactory,
    pub store: MemoryStore,
    pub queue: Arc<MemoryJobQueue>,
    pub scheduler: Arc<CrawlScheduler>,
}

impl TestHarness {
    /// Harness whose fetcher serves [`EASYLIST`].
    pub fn new(driver: MockDriver) -> Self {
        Self::build(
            MockFetcher::new().with_text(EASYLIST_URL, EASYLIST),
            driver,
            MockMatcherFactory::new(),
            test_config(),
        )
    }

    pub fn build(
        fetcher: MockFetcher,
        driver: MockDriver,
        matchers: MockMatcherFactory,
        config: MeasurerConfig,
    ) -> Self {
        init_tracing();

        let store = MemoryStore::new();
        let queue = Arc::new(MemoryJobQueue::new());
        let deps = MeasurerDeps {
            fetcher: Arc::new(fetcher.clone()),
            driver: Arc::new(driver.clone()),
            matchers: Arc::new(matchers.clone()),
            recorder: Arc::new(ResultRecorder::new(Arc::new(store.clone()), &config)),
            queue: queue.clone(),
        };
        let scheduler = Arc::new(CrawlScheduler::new(deps, config).with_seed(42));

        Self {
            fetcher,
            driver,
            matchers,
            store,
            queue,
            scheduler,
        }
    }

    pub fn worker(&self) -> JobWorker {
        JobWorker::with_config(
            self.queue.clone(),
            self.scheduler.clone(),
            JobWorkerConfig {
                worker_id: "test-worker".to_string(),
                poll_interval: Duration::from_millis(10),
            },
        )
    }
}
