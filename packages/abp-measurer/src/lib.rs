//! Filter-list measurement crawler.
//!
//! Visits pages with an external browser driver, classifies every network
//! request the page made against a set of filter lists, and persists the
//! deduplicated, classified results. Crawls fan out recursively over
//! same-site links under depth and breadth limits.
//!
//! # Pipeline
//!
//! ```text
//! CrawlJob ──► CrawlScheduler
//!                 ├─► SourceFetcher   (reachability probe, filter list text)
//!                 ├─► BrowserDriver   (raw network log entries, child urls)
//!                 ├─► normalize_logs  (RequestRecord)
//!                 ├─► Classifier      (allowed / blocked / exception buckets)
//!                 ├─► ResultRecorder  (via DedupStore, returns crawl id)
//!                 └─► JobQueue        (child jobs, depth - 1)
//! ```
//!
//! # Modules
//!
//! - [`types`] - Job specs, request records, rule helpers and row ids
//! - [`traits`] - Collaborator seams (driver, matcher, fetcher, store, queue)
//! - [`normalizer`] - Raw browser log decoding
//! - [`classifier`] - Verdict bucketing over an external matcher
//! - [`dedup`] - Content-addressed get-or-create registration
//! - [`recorder`] - Transactional persistence of one crawl
//! - [`scheduler`] - Top-level coordinator and child fan-out
//! - [`worker`] - Queue-draining job worker
//! - [`stores`] / [`queues`] - Storage and queue backends
//! - [`testing`] - Mock collaborators

pub mod classifier;
pub mod config;
pub mod dedup;
pub mod error;
pub mod http;
pub mod normalizer;
pub mod queues;
pub mod recorder;
pub mod scheduler;
pub mod stores;
pub mod testing;
pub mod traits;
pub mod types;
pub mod worker;

pub use classifier::{resource_type_mask, Buckets, Classifier, Verdict};
pub use config::MeasurerConfig;
pub use dedup::{DedupStore, RegisteredList};
pub use error::{
    DriverError, FetchError, MatcherError, MeasureError, QueueError, StoreError, ValidationError,
};
pub use http::HttpSourceFetcher;
pub use normalizer::normalize_logs;
pub use queues::{JobStatus, MemoryJobQueue};
pub use recorder::{CrawlRecord, CrawlRecorder, FilterSource, ResultRecorder};
pub use scheduler::{CrawlOutcome, CrawlReport, CrawlScheduler, MeasurerDeps};
pub use stores::{MemoryStore, MemoryTables};
pub use traits::{
    driver::{BrowserDriver, BrowserSession, DriveOutput, DriveRequest},
    fetcher::SourceFetcher,
    matcher::{MatchResult, MatcherFactory, RuleMatcher, TypeMask},
    queue::{ClaimedJob, JobQueue},
    store::{BlockedRow, NewCrawl, RequestRow, RuleRef, Store, StoreTx, TypeTable},
};
pub use types::{
    ids::{BatchId, CrawlId, DomainId, JobId, ListId, RuleId, TagId},
    job::CrawlJob,
    request::{RawLogEntry, RequestRecord},
};
pub use worker::{DrainStats, JobRun, JobWorker, JobWorkerConfig};

#[cfg(feature = "postgres")]
pub use queues::PostgresJobQueue;
#[cfg(feature = "postgres")]
pub use stores::PostgresStore;
