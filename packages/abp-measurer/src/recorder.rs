//! Transactional persistence of one crawl.
//!
//! Units of work, in order:
//!
//! 1. batch, tags, domain and rank
//! 2. filter lists and their rules
//! 3. request type names (cached, one short unit each on a miss)
//! 4. the crawl row, its list associations and every request row
//!
//! The crawl id only exists once step 4 commits, so a failure never leaves a
//! crawl row without its requests.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::classifier::Buckets;
use crate::config::MeasurerConfig;
use crate::dedup::DedupStore;
use crate::error::StoreResult;
use crate::traits::store::{BlockedRow, NewCrawl, RequestRow, Store, StoreTx, TypeTable};
use crate::types::{
    text_hash, BatchId, CrawlId, CrawlJob, DomainId, ListId, RequestRecord, RuleId,
};
use crate::types::job::CrawlTarget;

/// A fetched filter list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterSource {
    pub url: String,
    pub text: String,
}

/// Scalar attributes of one crawl attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct CrawlRecord {
    pub batch: String,
    pub tags: Vec<String>,
    pub domain: String,
    pub url: String,
    pub dwell_secs: u64,
    pub depth: i32,
    pub breadth: i32,
    pub parent: Option<CrawlId>,
    pub rank: Option<i64>,
    pub region: Option<String>,
    pub filter_lists: Vec<FilterSource>,
}

impl CrawlRecord {
    pub fn from_job(job: &CrawlJob, target: &CrawlTarget, filter_lists: Vec<FilterSource>) -> Self {
        Self {
            batch: job.batch.clone(),
            tags: job.tags.clone(),
            domain: target.domain.clone(),
            url: target.url.clone(),
            dwell_secs: job.secs,
            depth: job.depth,
            breadth: job.breadth,
            parent: job.parent_crawl_id,
            rank: job.rank,
            region: job.region.clone(),
            filter_lists,
        }
    }

    /// Union of all attached filter-list texts.
    pub fn rule_text(&self) -> String {
        self.filter_lists
            .iter()
            .map(|l| l.text.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Persists crawl outcomes.
#[async_trait]
pub trait CrawlRecorder: Send + Sync {
    /// Record that a root target failed its reachability probe.
    async fn record_unreachable(&self, record: &CrawlRecord) -> StoreResult<()>;

    /// Persist a crawl and its classified requests, returning the crawl id.
    async fn record_crawl(&self, record: &CrawlRecord, buckets: &Buckets) -> StoreResult<CrawlId>;
}

/// [`CrawlRecorder`] over a relational [`Store`], resolving every referent
/// through a [`DedupStore`].
pub struct ResultRecorder {
    dedup: DedupStore,
    allowed_chunk_size: usize,
}

impl ResultRecorder {
    pub fn new(store: Arc<dyn Store>, config: &MeasurerConfig) -> Self {
        Self {
            dedup: DedupStore::with_limits(
                store,
                config.rule_chunk_size,
                config.type_cache_capacity,
            ),
            allowed_chunk_size: config.allowed_chunk_size.max(1),
        }
    }

    async fn register_context(
        &self,
        tx: &mut dyn StoreTx,
        record: &CrawlRecord,
    ) -> StoreResult<(BatchId, DomainId)> {
        let batch = self.dedup.batch_id(tx, &record.batch).await?;
        self.dedup.assign_tags(tx, batch, &record.tags).await?;
        let domain = self.dedup.domain_id(tx, &record.domain).await?;
        if let Some(rank) = record.rank {
            tx.record_rank(batch, domain, rank, record.region.as_deref())
                .await?;
        }
        Ok((batch, domain))
    }

    /// Register the attached lists; also registers any rule a verdict
    /// references that none of the lists contained.
    ///
    /// Lists are registered in content-hash order, so two writers sharing
    /// lists lock them in the same order.
    async fn register_lists(
        &self,
        tx: &mut dyn StoreTx,
        record: &CrawlRecord,
        buckets: &Buckets,
    ) -> StoreResult<(Vec<ListId>, HashMap<String, RuleId>)> {
        let mut order: Vec<(String, usize)> = record
            .filter_lists
            .iter()
            .enumerate()
            .map(|(index, source)| (text_hash(&source.text), index))
            .collect();
        order.sort();

        let mut resolved = vec![None; record.filter_lists.len()];
        let mut rules = HashMap::new();
        for (_, index) in order {
            let source = &record.filter_lists[index];
            let list = self.dedup.filter_list(tx, &source.url, &source.text).await?;
            resolved[index] = Some(list.id);
            rules.extend(list.rules);
        }

        let mut list_ids = Vec::with_capacity(resolved.len());
        for id in resolved.into_iter().flatten() {
            if !list_ids.contains(&id) {
                list_ids.push(id);
            }
        }

        let mut unknown: Vec<(String, String)> = buckets
            .referenced_rules()
            .filter(|text| !rules.contains_key(*text))
            .collect::<HashSet<_>>()
            .into_iter()
            .map(|text| (text_hash(text), text.to_string()))
            .collect();
        unknown.sort();
        for (_, text) in unknown {
            debug!(rule = %text, "registering matched rule missing from attached lists");
            let id = self.dedup.rule_id(tx, &text).await?;
            rules.insert(text, id);
        }

        Ok((list_ids, rules))
    }

    async fn resolve_types(&self, buckets: &Buckets) -> StoreResult<TypeIds> {
        let records = buckets
            .allowed
            .iter()
            .chain(buckets.blocked.iter().map(|b| &b.record))
            .chain(buckets.exceptions.iter().map(|e| &e.record));

        let mut ids = TypeIds::default();
        for record in records {
            if !ids.resource.contains_key(&record.resource_type) {
                let id = self
                    .dedup
                    .type_id(TypeTable::Resource, &record.resource_type)
                    .await?;
                ids.resource.insert(record.resource_type.clone(), id);
            }
            if !ids.initiator.contains_key(&record.initiator_type) {
                let id = self
                    .dedup
                    .type_id(TypeTable::Initiator, &record.initiator_type)
                    .await?;
                ids.initiator.insert(record.initiator_type.clone(), id);
            }
        }
        Ok(ids)
    }
}

/// Attempts per unit of work when the backend aborts it for contention.
const CONTENTION_ATTEMPTS: u32 = 5;

/// Run a unit of work, starting it over while the backend aborts it to break
/// a deadlock or serialization conflict. The aborted attempt wrote nothing.
async fn retry_contended<T, F, Fut>(unit: &'static str, mut attempt: F) -> StoreResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = StoreResult<T>>,
{
    let mut tries = 1;
    loop {
        match attempt().await {
            Err(err) if err.should_retry() && tries < CONTENTION_ATTEMPTS => {
                let delay = Duration::from_millis(10 * 2u64.pow(tries));
                warn!(unit, tries, ?delay, error = %err, "unit of work contended, retrying");
                tokio::time::sleep(delay).await;
                tries += 1;
            }
            result => return result,
        }
    }
}

#[derive(Default)]
struct TypeIds {
    resource: HashMap<String, i64>,
    initiator: HashMap<String, i64>,
}

impl TypeIds {
    fn row(&self, record: &RequestRecord) -> RequestRow {
        RequestRow {
            url: record.for_url.clone(),
            base_url: Some(record.from_url.clone()),
            initiator_url: record.initiator_url.clone(),
            resource_type_id: self.resource.get(&record.resource_type).copied().unwrap_or_default(),
            initiator_type_id: self
                .initiator
                .get(&record.initiator_type)
                .copied()
                .unwrap_or_default(),
            request_id: record.request_id.clone(),
            hash: record.content_hash.clone(),
            timestamp: record.timestamp,
            size: record.size,
        }
    }
}

#[async_trait]
impl CrawlRecorder for ResultRecorder {
    async fn record_unreachable(&self, record: &CrawlRecord) -> StoreResult<()> {
        let store = self.dedup.store();
        let id = retry_contended("unreachable", || async move {
            let mut tx = store.begin().await?;
            let (batch, domain) = self.register_context(tx.as_mut(), record).await?;
            let id = tx.insert_unreachable(batch, domain).await?;
            tx.commit().await?;
            Ok(id)
        })
        .await?;
        info!(fact = id, domain = %record.domain, "recorded unreachable domain");
        Ok(())
    }

    async fn record_crawl(&self, record: &CrawlRecord, buckets: &Buckets) -> StoreResult<CrawlId> {
        let store = self.dedup.store();

        let (batch, domain) = retry_contended("context", || async move {
            let mut tx = store.begin().await?;
            let ids = self.register_context(tx.as_mut(), record).await?;
            tx.commit().await?;
            Ok(ids)
        })
        .await?;

        let (list_ids, rules) = retry_contended("lists", || async move {
            let mut tx = store.begin().await?;
            let registered = self.register_lists(tx.as_mut(), record, buckets).await?;
            tx.commit().await?;
            Ok(registered)
        })
        .await?;

        let types = self.resolve_types(buckets).await?;
        let rule_ref = |text: Option<&str>| text.and_then(|t| rules.get(t).copied());

        let blocked: Vec<BlockedRow> = buckets
            .blocked
            .iter()
            .map(|b| BlockedRow {
                rule_id: rule_ref(b.rule.as_deref()),
                exception_rule_id: None,
                request: types.row(&b.record),
            })
            .chain(buckets.exceptions.iter().map(|e| BlockedRow {
                rule_id: rule_ref(e.rule.as_deref()),
                exception_rule_id: rule_ref(Some(e.exception_rule.as_str())),
                request: types.row(&e.record),
            }))
            .collect();
        let allowed: Vec<RequestRow> = buckets.allowed.iter().map(|r| types.row(r)).collect();

        let mut tx = store.begin().await?;
        let crawl_id = tx
            .insert_crawl(&NewCrawl {
                batch_id: batch,
                domain_id: domain,
                url: record.url.clone(),
                dwell_secs: i64::try_from(record.dwell_secs).unwrap_or(i64::MAX),
                depth: record.depth,
                breadth: record.breadth,
                parent_crawl_id: record.parent,
            })
            .await?;
        tx.link_crawl_lists(crawl_id, &list_ids).await?;
        for chunk in blocked.chunks(self.allowed_chunk_size) {
            tx.insert_blocked(crawl_id, chunk).await?;
        }
        for chunk in allowed.chunks(self.allowed_chunk_size) {
            tx.insert_allowed(crawl_id, chunk).await?;
        }
        tx.commit().await?;

        info!(
            crawl = %crawl_id,
            allowed = allowed.len(),
            blocked = buckets.blocked.len(),
            exceptions = buckets.exceptions.len(),
            "recorded crawl"
        );
        Ok(crawl_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::{BlockedRequest, ExceptedRequest};
    use crate::stores::MemoryStore;

    fn record() -> CrawlRecord {
        CrawlRecord {
            batch: "batch-1".into(),
            tags: vec!["alexa".into()],
            domain: "site.test".into(),
            url: "http://site.test".into(),
            dwell_secs: 5,
            depth: 2,
            breadth: 1,
            parent: None,
            rank: Some(12),
            region: Some("global".into()),
            filter_lists: vec![FilterSource {
                url: "https://lists.test/easylist.txt".into(),
                text: "||ads.example^$script\n@@||ads.example/x.js$script\n".into(),
            }],
        }
    }

    fn recorder(store: &MemoryStore, chunk: usize) -> ResultRecorder {
        let config = MeasurerConfig {
            allowed_chunk_size: chunk,
            ..MeasurerConfig::default()
        };
        ResultRecorder::new(Arc::new(store.clone()), &config)
    }

    fn request(url: &str, resource_type: &str) -> RequestRecord {
        RequestRecord::new("http://site.test", url, resource_type)
    }

    #[tokio::test]
    async fn contended_units_are_started_over() {
        use crate::error::StoreError;
        use std::sync::atomic::{AtomicU32, Ordering};

        let calls = &AtomicU32::new(0);
        let value = retry_contended("test", || async move {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(StoreError::Contention("deadlock detected".into()))
            } else {
                Ok(7)
            }
        })
        .await
        .unwrap();
        assert_eq!(value, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        let calls = &AtomicU32::new(0);
        let err = retry_contended("test", || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(StoreError::Database("connection reset".into()))
        })
        .await
        .unwrap_err();
        assert!(!err.should_retry());
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let calls = &AtomicU32::new(0);
        let err = retry_contended("test", || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(StoreError::Contention("deadlock detected".into()))
        })
        .await
        .unwrap_err();
        assert!(err.should_retry());
        assert_eq!(calls.load(Ordering::SeqCst), CONTENTION_ATTEMPTS);
    }

    #[tokio::test]
    async fn empty_buckets_still_yield_a_crawl_row() {
        let store = MemoryStore::new();
        let recorder = recorder(&store, 10);

        let id = recorder
            .record_crawl(&record(), &Buckets::default())
            .await
            .unwrap();

        let tables = store.snapshot().await;
        assert_eq!(tables.crawls.len(), 1);
        assert_eq!(tables.crawl_rows()[0].0, id);
        assert_eq!(tables.request_count(), 0);
        assert_eq!(tables.crawls_lists.len(), 1);
        assert_eq!(tables.batches_tags.len(), 1);
        assert_eq!(tables.ranks.len(), 1);
    }

    #[tokio::test]
    async fn exception_rows_reference_both_rules() {
        let store = MemoryStore::new();
        let recorder = recorder(&store, 10);
        let buckets = Buckets {
            allowed: vec![],
            blocked: vec![],
            exceptions: vec![ExceptedRequest {
                record: request("https://ads.example/x.js", "Script"),
                rule: Some("||ads.example^$script".into()),
                exception_rule: "@@||ads.example/x.js$script".into(),
            }],
        };

        recorder.record_crawl(&record(), &buckets).await.unwrap();

        let tables = store.snapshot().await;
        let (_, row) = &tables.blocked[0];
        assert_eq!(row.rule_id, tables.rule_id_by_text("||ads.example^$script"));
        assert_eq!(
            row.exception_rule_id,
            tables.rule_id_by_text("@@||ads.example/x.js$script")
        );
        assert!(row.rule_id.is_some() && row.exception_rule_id.is_some());
    }

    #[tokio::test]
    async fn matched_rule_outside_lists_is_registered_on_demand() {
        let store = MemoryStore::new();
        let recorder = recorder(&store, 10);
        let buckets = Buckets {
            blocked: vec![BlockedRequest {
                record: request("https://tracker.test/t.gif", "Image"),
                rule: Some("||tracker.test^".into()),
            }],
            ..Buckets::default()
        };

        recorder.record_crawl(&record(), &buckets).await.unwrap();

        let tables = store.snapshot().await;
        let rule = tables.rule_id_by_text("||tracker.test^");
        assert!(rule.is_some());
        assert_eq!(tables.blocked[0].1.rule_id, rule);
    }

    #[tokio::test]
    async fn allowed_rows_are_inserted_in_chunks_without_loss() {
        let store = MemoryStore::new();
        let recorder = recorder(&store, 3);
        let buckets = Buckets {
            allowed: (0..10)
                .map(|i| request(&format!("http://site.test/{i}.png"), "Image"))
                .collect(),
            ..Buckets::default()
        };

        recorder.record_crawl(&record(), &buckets).await.unwrap();

        let tables = store.snapshot().await;
        assert_eq!(tables.allowed.len(), 10);
        assert_eq!(tables.allowed[9].1.url, "http://site.test/9.png");
        assert_eq!(tables.resource_types.len(), 1);
        assert_eq!(tables.initiator_types.len(), 1);
    }

    #[tokio::test]
    async fn unreachable_records_one_fact_and_no_crawl() {
        let store = MemoryStore::new();
        let recorder = recorder(&store, 10);

        recorder.record_unreachable(&record()).await.unwrap();

        let tables = store.snapshot().await;
        assert_eq!(tables.unreachable.len(), 1);
        assert!(tables.crawls.is_empty());
        assert!(tables.lists.is_empty());
        assert_eq!(tables.domains.len(), 1);
    }

    #[tokio::test]
    async fn repeated_lists_attach_once_per_crawl() {
        let store = MemoryStore::new();
        let recorder = recorder(&store, 10);
        let mut record = record();
        let duplicate = FilterSource {
            url: "https://mirror.test/easylist.txt".into(),
            text: record.filter_lists[0].text.clone(),
        };
        record.filter_lists.push(duplicate);

        let first = recorder.record_crawl(&record, &Buckets::default()).await.unwrap();
        let second = recorder.record_crawl(&record, &Buckets::default()).await.unwrap();

        let tables = store.snapshot().await;
        assert_ne!(first, second);
        assert_eq!(tables.lists.len(), 1);
        assert_eq!(tables.rules.len(), 2);
        assert_eq!(tables.crawls_lists.len(), 2);
        assert_eq!(tables.batches.len(), 1);
    }
}
