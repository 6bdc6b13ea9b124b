//! In-memory storage implementation for testing and development.
//!
//! Transactions are serialized: `begin` takes the table lock and works on a
//! copy of the tables, `commit` writes the copy back and dropping the
//! transaction discards it. Holding two transactions from the same task at
//! once deadlocks, as it would on a single-writer database.

use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::error::{StoreError, StoreResult};
use crate::traits::store::{
    BlockedRow, NewCrawl, RequestRow, RuleRef, Store, StoreTx, TypeTable,
};
use crate::types::{BatchId, CrawlId, DomainId, ListId, NewRule, RuleId, TagId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListRow {
    pub url: String,
    pub hash: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RankRow {
    pub rank: i64,
    pub region: Option<String>,
}

/// All tables of the store.
#[derive(Debug, Clone, Default)]
pub struct MemoryTables {
    pub batches: BTreeMap<i64, String>,
    pub domains: BTreeMap<i64, String>,
    pub tags: BTreeMap<i64, String>,
    pub lists: BTreeMap<i64, ListRow>,
    pub rules: BTreeMap<i64, NewRule>,
    pub lists_rules: BTreeSet<(ListId, RuleId)>,
    pub batches_tags: BTreeSet<(BatchId, TagId)>,
    pub ranks: BTreeMap<(BatchId, DomainId), RankRow>,
    pub unreachable: BTreeMap<i64, (BatchId, DomainId)>,
    pub resource_types: BTreeMap<i64, String>,
    pub initiator_types: BTreeMap<i64, String>,
    pub crawls: BTreeMap<i64, NewCrawl>,
    pub crawls_lists: BTreeSet<(CrawlId, ListId)>,
    pub blocked: Vec<(CrawlId, BlockedRow)>,
    pub allowed: Vec<(CrawlId, RequestRow)>,
    unique: HashMap<(&'static str, String), i64>,
    next_id: i64,
}

impl MemoryTables {
    fn lookup(&self, entity: &'static str, key: &str) -> Option<i64> {
        self.unique.get(&(entity, key.to_string())).copied()
    }

    /// Reserve an id for a new unique key, or report a conflict.
    fn claim_unique(&mut self, entity: &'static str, key: &str) -> StoreResult<i64> {
        if self.lookup(entity, key).is_some() {
            return Err(StoreError::Conflict {
                entity,
                key: key.to_string(),
            });
        }
        let id = self.next_serial();
        self.unique.insert((entity, key.to_string()), id);
        Ok(id)
    }

    fn next_serial(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    fn type_table(&mut self, table: TypeTable) -> &mut BTreeMap<i64, String> {
        match table {
            TypeTable::Resource => &mut self.resource_types,
            TypeTable::Initiator => &mut self.initiator_types,
        }
    }

    fn get_or_insert_rule(&mut self, rule: &NewRule) -> RuleId {
        if let Some(id) = self.lookup("rule", &rule.text_hash) {
            return RuleId(id);
        }
        let id = self.next_serial();
        self.unique.insert(("rule", rule.text_hash.clone()), id);
        self.rules.insert(id, rule.clone());
        RuleId(id)
    }

    /// Rule ids linked to a list.
    pub fn list_rule_ids(&self, list: ListId) -> Vec<RuleId> {
        self.lists_rules
            .iter()
            .filter(|(l, _)| *l == list)
            .map(|(_, r)| *r)
            .collect()
    }

    /// Crawl rows in insertion order.
    pub fn crawl_rows(&self) -> Vec<(CrawlId, NewCrawl)> {
        self.crawls
            .iter()
            .map(|(id, crawl)| (CrawlId(*id), crawl.clone()))
            .collect()
    }

    pub fn rule_id_by_text(&self, text: &str) -> Option<RuleId> {
        self.rules
            .iter()
            .find(|(_, rule)| rule.text == text)
            .map(|(id, _)| RuleId(*id))
    }

    /// Total number of request rows across both request tables.
    pub fn request_count(&self) -> usize {
        self.blocked.len() + self.allowed.len()
    }
}

/// In-memory relational store.
///
/// Clones share the same tables.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    tables: Arc<Mutex<MemoryTables>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of the committed tables, for assertions.
    pub async fn snapshot(&self) -> MemoryTables {
        self.tables.lock().await.clone()
    }

    pub async fn rule_count(&self) -> usize {
        self.tables.lock().await.rules.len()
    }

    pub async fn crawl_count(&self) -> usize {
        self.tables.lock().await.crawls.len()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn begin(&self) -> StoreResult<Box<dyn StoreTx>> {
        let guard = self.tables.clone().lock_owned().await;
        let work = guard.clone();
        Ok(Box::new(MemoryTx { guard, work }))
    }
}

struct MemoryTx {
    guard: OwnedMutexGuard<MemoryTables>,
    work: MemoryTables,
}

#[async_trait]
impl StoreTx for MemoryTx {
    async fn insert_batch(&mut self, uuid: &str) -> StoreResult<BatchId> {
        let id = self.work.claim_unique("batch", uuid)?;
        self.work.batches.insert(id, uuid.to_string());
        Ok(BatchId(id))
    }

    async fn find_batch(&mut self, uuid: &str) -> StoreResult<Option<BatchId>> {
        Ok(self.work.lookup("batch", uuid).map(BatchId))
    }

    async fn insert_domain(&mut self, hostname: &str) -> StoreResult<DomainId> {
        let id = self.work.claim_unique("domain", hostname)?;
        self.work.domains.insert(id, hostname.to_string());
        Ok(DomainId(id))
    }

    async fn find_domain(&mut self, hostname: &str) -> StoreResult<Option<DomainId>> {
        Ok(self.work.lookup("domain", hostname).map(DomainId))
    }

    async fn insert_tag(&mut self, name: &str) -> StoreResult<TagId> {
        let id = self.work.claim_unique("tag", name)?;
        self.work.tags.insert(id, name.to_string());
        Ok(TagId(id))
    }

    async fn find_tag(&mut self, name: &str) -> StoreResult<Option<TagId>> {
        Ok(self.work.lookup("tag", name).map(TagId))
    }

    async fn insert_list(&mut self, url: &str, hash: &str) -> StoreResult<ListId> {
        let id = self.work.claim_unique("list", hash)?;
        self.work.lists.insert(
            id,
            ListRow {
                url: url.to_string(),
                hash: hash.to_string(),
            },
        );
        Ok(ListId(id))
    }

    async fn find_list(&mut self, hash: &str) -> StoreResult<Option<ListId>> {
        Ok(self.work.lookup("list", hash).map(ListId))
    }

    async fn insert_rule(&mut self, rule: &NewRule) -> StoreResult<RuleId> {
        let id = self.work.claim_unique("rule", &rule.text_hash)?;
        self.work.rules.insert(id, rule.clone());
        Ok(RuleId(id))
    }

    async fn find_rule(&mut self, text_hash: &str) -> StoreResult<Option<RuleId>> {
        Ok(self.work.lookup("rule", text_hash).map(RuleId))
    }

    async fn insert_type(&mut self, table: TypeTable, name: &str) -> StoreResult<i64> {
        let id = self.work.claim_unique(table.table_name(), name)?;
        self.work.type_table(table).insert(id, name.to_string());
        Ok(id)
    }

    async fn find_type(&mut self, table: TypeTable, name: &str) -> StoreResult<Option<i64>> {
        Ok(self.work.lookup(table.table_name(), name))
    }

    async fn upsert_tags(&mut self, names: &[String]) -> StoreResult<Vec<(String, TagId)>> {
        let mut out = Vec::with_capacity(names.len());
        for name in names {
            let id = match self.work.lookup("tag", name) {
                Some(id) => id,
                None => {
                    let id = self.work.claim_unique("tag", name)?;
                    self.work.tags.insert(id, name.clone());
                    id
                }
            };
            out.push((name.clone(), TagId(id)));
        }
        Ok(out)
    }

    async fn upsert_rules(&mut self, rules: &[NewRule]) -> StoreResult<Vec<RuleRef>> {
        Ok(rules
            .iter()
            .map(|rule| RuleRef {
                id: self.work.get_or_insert_rule(rule),
                text: rule.text.clone(),
            })
            .collect())
    }

    async fn find_rules(&mut self, text_hashes: &[String]) -> StoreResult<Vec<RuleRef>> {
        let mut out = Vec::new();
        for hash in text_hashes {
            if let Some(id) = self.work.lookup("rule", hash) {
                if let Some(rule) = self.work.rules.get(&id) {
                    out.push(RuleRef {
                        id: RuleId(id),
                        text: rule.text.clone(),
                    });
                }
            }
        }
        Ok(out)
    }

    async fn rules_for_list(&mut self, list: ListId) -> StoreResult<Vec<RuleRef>> {
        Ok(self
            .work
            .list_rule_ids(list)
            .into_iter()
            .filter_map(|id| {
                self.work.rules.get(&id.0).map(|rule| RuleRef {
                    id,
                    text: rule.text.clone(),
                })
            })
            .collect())
    }

    async fn link_list_rules(&mut self, list: ListId, rules: &[RuleId]) -> StoreResult<()> {
        self.work
            .lists_rules
            .extend(rules.iter().map(|rule| (list, *rule)));
        Ok(())
    }

    async fn link_batch_tags(&mut self, batch: BatchId, tags: &[TagId]) -> StoreResult<()> {
        self.work
            .batches_tags
            .extend(tags.iter().map(|tag| (batch, *tag)));
        Ok(())
    }

    async fn record_rank(
        &mut self,
        batch: BatchId,
        domain: DomainId,
        rank: i64,
        region: Option<&str>,
    ) -> StoreResult<()> {
        self.work
            .ranks
            .entry((batch, domain))
            .or_insert_with(|| RankRow {
                rank,
                region: region.map(str::to_string),
            });
        Ok(())
    }

    async fn insert_unreachable(&mut self, batch: BatchId, domain: DomainId) -> StoreResult<i64> {
        let id = self.work.next_serial();
        self.work.unreachable.insert(id, (batch, domain));
        Ok(id)
    }

    async fn insert_crawl(&mut self, crawl: &NewCrawl) -> StoreResult<CrawlId> {
        if let Some(parent) = crawl.parent_crawl_id {
            if !self.work.crawls.contains_key(&parent.0) {
                return Err(StoreError::NotFound {
                    entity: "crawl",
                    key: parent.to_string(),
                });
            }
        }
        let id = self.work.next_serial();
        self.work.crawls.insert(id, crawl.clone());
        Ok(CrawlId(id))
    }

    async fn link_crawl_lists(&mut self, crawl: CrawlId, lists: &[ListId]) -> StoreResult<()> {
        self.work
            .crawls_lists
            .extend(lists.iter().map(|list| (crawl, *list)));
        Ok(())
    }

    async fn insert_blocked(&mut self, crawl: CrawlId, rows: &[BlockedRow]) -> StoreResult<()> {
        self.work
            .blocked
            .extend(rows.iter().cloned().map(|row| (crawl, row)));
        Ok(())
    }

    async fn insert_allowed(&mut self, crawl: CrawlId, rows: &[RequestRow]) -> StoreResult<()> {
        self.work
            .allowed
            .extend(rows.iter().cloned().map(|row| (crawl, row)));
        Ok(())
    }

    async fn commit(self: Box<Self>) -> StoreResult<()> {
        let MemoryTx { mut guard, work } = *self;
        *guard = work;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn insert_reports_conflict_on_duplicate_key() {
        let store = MemoryStore::new();
        let mut tx = store.begin().await.unwrap();
        let id = tx.insert_domain("site.test").await.unwrap();
        let err = tx.insert_domain("site.test").await.unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(tx.find_domain("site.test").await.unwrap(), Some(id));
    }

    #[tokio::test]
    async fn uncommitted_writes_are_discarded() {
        let store = MemoryStore::new();
        {
            let mut tx = store.begin().await.unwrap();
            tx.insert_batch("batch-1").await.unwrap();
        }
        assert!(store.snapshot().await.batches.is_empty());

        let mut tx = store.begin().await.unwrap();
        tx.insert_batch("batch-1").await.unwrap();
        tx.commit().await.unwrap();
        assert_eq!(store.snapshot().await.batches.len(), 1);
    }

    #[tokio::test]
    async fn upsert_rules_returns_existing_and_new_ids() {
        let store = MemoryStore::new();
        let mut tx = store.begin().await.unwrap();
        let first = tx
            .upsert_rules(&[NewRule::new("||a.test^")])
            .await
            .unwrap();
        let second = tx
            .upsert_rules(&[NewRule::new("||a.test^"), NewRule::new("||b.test^")])
            .await
            .unwrap();
        tx.commit().await.unwrap();

        assert_eq!(second.len(), 2);
        assert_eq!(second[0].id, first[0].id);
        assert_ne!(second[1].id, first[0].id);
        assert_eq!(store.rule_count().await, 2);
    }

    #[tokio::test]
    async fn rank_is_recorded_once_per_batch_and_domain() {
        let store = MemoryStore::new();
        let mut tx = store.begin().await.unwrap();
        let batch = tx.insert_batch("b").await.unwrap();
        let domain = tx.insert_domain("site.test").await.unwrap();
        tx.record_rank(batch, domain, 3, Some("us")).await.unwrap();
        tx.record_rank(batch, domain, 9, None).await.unwrap();
        tx.commit().await.unwrap();

        let tables = store.snapshot().await;
        assert_eq!(
            tables.ranks.get(&(batch, domain)),
            Some(&RankRow {
                rank: 3,
                region: Some("us".into())
            })
        );
    }

    #[tokio::test]
    async fn crawl_parent_must_exist() {
        let store = MemoryStore::new();
        let mut tx = store.begin().await.unwrap();
        let crawl = NewCrawl {
            batch_id: BatchId(1),
            domain_id: DomainId(1),
            url: "http://site.test".into(),
            dwell_secs: 5,
            depth: 1,
            breadth: 0,
            parent_crawl_id: Some(CrawlId(404)),
        };
        assert!(matches!(
            tx.insert_crawl(&crawl).await,
            Err(StoreError::NotFound { .. })
        ));
    }
}
