//! Relational storage seam.
//!
//! Every statement runs inside a [`StoreTx`]. Single-row inserts report a
//! uniqueness violation as [`StoreError::Conflict`] instead of failing the
//! transaction, so the caller can re-read the existing row in the same unit
//! of work. Dropping a transaction without committing discards its writes.
//!
//! [`StoreError::Conflict`]: crate::error::StoreError::Conflict

use async_trait::async_trait;

use crate::error::StoreResult;
use crate::types::{BatchId, CrawlId, DomainId, ListId, NewRule, RuleId, TagId};

/// Name-to-id lookup tables referenced by request rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TypeTable {
    Resource,
    Initiator,
}

impl TypeTable {
    pub fn table_name(self) -> &'static str {
        match self {
            TypeTable::Resource => "resource_types",
            TypeTable::Initiator => "initiator_types",
        }
    }
}

/// A registered rule and its text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleRef {
    pub id: RuleId,
    pub text: String,
}

/// Scalar attributes of a crawl row.
#[derive(Debug, Clone, PartialEq)]
pub struct NewCrawl {
    pub batch_id: BatchId,
    pub domain_id: DomainId,
    pub url: String,
    pub dwell_secs: i64,
    pub depth: i32,
    pub breadth: i32,
    pub parent_crawl_id: Option<CrawlId>,
}

/// Columns shared by `allowed_requests` and `blocked_requests`.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestRow {
    pub url: String,
    pub base_url: Option<String>,
    pub initiator_url: Option<String>,
    pub resource_type_id: i64,
    pub initiator_type_id: i64,
    pub request_id: String,
    pub hash: Option<String>,
    pub timestamp: Option<f64>,
    pub size: Option<i64>,
}

/// A blocked or excepted request with its rule references.
#[derive(Debug, Clone, PartialEq)]
pub struct BlockedRow {
    pub rule_id: Option<RuleId>,
    pub exception_rule_id: Option<RuleId>,
    pub request: RequestRow,
}

/// Opens units of work against the backing store.
#[async_trait]
pub trait Store: Send + Sync {
    async fn begin(&self) -> StoreResult<Box<dyn StoreTx>>;
}

/// Statements available inside one unit of work.
#[async_trait]
pub trait StoreTx: Send {
    async fn insert_batch(&mut self, uuid: &str) -> StoreResult<BatchId>;
    async fn find_batch(&mut self, uuid: &str) -> StoreResult<Option<BatchId>>;

    async fn insert_domain(&mut self, hostname: &str) -> StoreResult<DomainId>;
    async fn find_domain(&mut self, hostname: &str) -> StoreResult<Option<DomainId>>;

    async fn insert_tag(&mut self, name: &str) -> StoreResult<TagId>;
    async fn find_tag(&mut self, name: &str) -> StoreResult<Option<TagId>>;

    async fn insert_list(&mut self, url: &str, hash: &str) -> StoreResult<ListId>;
    async fn find_list(&mut self, hash: &str) -> StoreResult<Option<ListId>>;

    async fn insert_rule(&mut self, rule: &NewRule) -> StoreResult<RuleId>;
    async fn find_rule(&mut self, text_hash: &str) -> StoreResult<Option<RuleId>>;

    async fn insert_type(&mut self, table: TypeTable, name: &str) -> StoreResult<i64>;
    async fn find_type(&mut self, table: TypeTable, name: &str) -> StoreResult<Option<i64>>;

    /// Insert-or-fetch many tags in one statement.
    async fn upsert_tags(&mut self, names: &[String]) -> StoreResult<Vec<(String, TagId)>>;

    /// Insert-or-fetch many rules in one statement, returning ids for both
    /// newly inserted and already existing rows.
    async fn upsert_rules(&mut self, rules: &[NewRule]) -> StoreResult<Vec<RuleRef>>;

    async fn find_rules(&mut self, text_hashes: &[String]) -> StoreResult<Vec<RuleRef>>;

    async fn rules_for_list(&mut self, list: ListId) -> StoreResult<Vec<RuleRef>>;

    /// Idempotent; duplicate pairs are ignored.
    async fn link_list_rules(&mut self, list: ListId, rules: &[RuleId]) -> StoreResult<()>;

    /// Idempotent; duplicate pairs are ignored.
    async fn link_batch_tags(&mut self, batch: BatchId, tags: &[TagId]) -> StoreResult<()>;

    /// Records the rank once per (batch, domain); later calls are no-ops.
    async fn record_rank(
        &mut self,
        batch: BatchId,
        domain: DomainId,
        rank: i64,
        region: Option<&str>,
    ) -> StoreResult<()>;

    async fn insert_unreachable(&mut self, batch: BatchId, domain: DomainId) -> StoreResult<i64>;

    async fn insert_crawl(&mut self, crawl: &NewCrawl) -> StoreResult<CrawlId>;

    async fn link_crawl_lists(&mut self, crawl: CrawlId, lists: &[ListId]) -> StoreResult<()>;

    async fn insert_blocked(&mut self, crawl: CrawlId, rows: &[BlockedRow]) -> StoreResult<()>;

    async fn insert_allowed(&mut self, crawl: CrawlId, rows: &[RequestRow]) -> StoreResult<()>;

    async fn commit(self: Box<Self>) -> StoreResult<()>;
}
