//! Content-addressed get-or-create registration.
//!
//! Every registration attempts the insert first and re-reads the existing
//! row when the store reports a uniqueness conflict. Callers only ever see
//! the resolved identifier. Nothing here takes a lock: concurrent writers on
//! independent workers race on the store's unique constraints and converge
//! on the same rows.

use std::collections::{HashMap, HashSet};
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};

use lru::LruCache;
use tracing::{debug, warn};

use crate::config::DEFAULT_RULE_CHUNK_SIZE;
use crate::error::{StoreError, StoreResult};
use crate::traits::store::{RuleRef, Store, StoreTx, TypeTable};
use crate::types::{
    prepare_rule_lines, text_hash, BatchId, DomainId, ListId, NewRule, RuleId, TagId,
};

/// Insert, and on a uniqueness conflict fall back to the lookup.
macro_rules! get_or_create {
    ($insert:expr, $find:expr, $entity:literal, $key:expr) => {
        match $insert.await {
            Ok(id) => Ok(id),
            Err(err) if err.is_conflict() => {
                debug!(entity = $entity, key = %$key, "registration conflict, re-reading");
                $find.await?.ok_or_else(|| StoreError::NotFound {
                    entity: $entity,
                    key: $key.to_string(),
                })
            }
            Err(err) => Err(err),
        }
    };
}

/// A filter list resolved to its row and its rules.
#[derive(Debug, Clone)]
pub struct RegisteredList {
    pub id: ListId,
    /// False when a list with the same content hash already existed
    pub created: bool,
    /// Rule text to rule id, for every rule line of the list
    pub rules: HashMap<String, RuleId>,
}

/// Idempotent registration of batches, domains, tags, filter lists, rules and
/// request type names.
pub struct DedupStore {
    store: Arc<dyn Store>,
    rule_chunk_size: usize,
    type_ids: Mutex<LruCache<(TypeTable, String), i64>>,
}

impl DedupStore {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self::with_limits(store, DEFAULT_RULE_CHUNK_SIZE, 256)
    }

    pub fn with_limits(
        store: Arc<dyn Store>,
        rule_chunk_size: usize,
        type_cache_capacity: usize,
    ) -> Self {
        let capacity = NonZeroUsize::new(type_cache_capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            store,
            rule_chunk_size: rule_chunk_size.max(1),
            type_ids: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub async fn batch_id(&self, tx: &mut dyn StoreTx, uuid: &str) -> StoreResult<BatchId> {
        get_or_create!(tx.insert_batch(uuid), tx.find_batch(uuid), "batch", uuid)
    }

    pub async fn domain_id(&self, tx: &mut dyn StoreTx, hostname: &str) -> StoreResult<DomainId> {
        get_or_create!(
            tx.insert_domain(hostname),
            tx.find_domain(hostname),
            "domain",
            hostname
        )
    }

    pub async fn tag_id(&self, tx: &mut dyn StoreTx, name: &str) -> StoreResult<TagId> {
        get_or_create!(tx.insert_tag(name), tx.find_tag(name), "tag", name)
    }

    /// Resolve tag names to ids with one bulk statement; names the statement
    /// did not return (inserted concurrently) are resolved one by one.
    pub async fn tag_ids(&self, tx: &mut dyn StoreTx, names: &[String]) -> StoreResult<Vec<TagId>> {
        let unique = dedupe(names.iter().map(String::as_str));
        if unique.is_empty() {
            return Ok(Vec::new());
        }

        let resolved: HashMap<String, TagId> = tx.upsert_tags(&unique).await?.into_iter().collect();
        let mut ids = Vec::with_capacity(unique.len());
        for name in &unique {
            let id = match resolved.get(name) {
                Some(id) => *id,
                None => self.tag_id(tx, name).await?,
            };
            ids.push(id);
        }
        Ok(ids)
    }

    /// Register tags and associate them with the batch.
    pub async fn assign_tags(
        &self,
        tx: &mut dyn StoreTx,
        batch: BatchId,
        names: &[String],
    ) -> StoreResult<()> {
        let ids = self.tag_ids(tx, names).await?;
        if !ids.is_empty() {
            tx.link_batch_tags(batch, &ids).await?;
        }
        Ok(())
    }

    /// Resolve a filter list by content hash.
    ///
    /// A list seen before (same text, any url) skips rule registration and
    /// returns its existing associations.
    pub async fn filter_list(
        &self,
        tx: &mut dyn StoreTx,
        url: &str,
        text: &str,
    ) -> StoreResult<RegisteredList> {
        let hash = text_hash(text);
        match tx.insert_list(url, &hash).await {
            Ok(id) => {
                let lines = prepare_rule_lines(text);
                let rules = self.register_rules(tx, id, &lines).await?;
                debug!(list = %id, url, rules = rules.len(), "registered filter list");
                Ok(RegisteredList {
                    id,
                    created: true,
                    rules,
                })
            }
            Err(err) if err.is_conflict() => {
                let id = tx.find_list(&hash).await?.ok_or_else(|| StoreError::NotFound {
                    entity: "list",
                    key: hash.clone(),
                })?;
                let rules = tx
                    .rules_for_list(id)
                    .await?
                    .into_iter()
                    .map(|r| (r.text, r.id))
                    .collect();
                debug!(list = %id, url, "filter list already registered");
                Ok(RegisteredList {
                    id,
                    created: false,
                    rules,
                })
            }
            Err(err) => Err(err),
        }
    }

    /// Register rule lines and associate them with a list.
    ///
    /// Works in chunks: one combined insert-or-fetch statement per chunk,
    /// then one bulk association insert. Rules are written in `text_hash`
    /// order, so concurrent writers take row locks in the same order.
    pub async fn register_rules(
        &self,
        tx: &mut dyn StoreTx,
        list: ListId,
        lines: &[String],
    ) -> StoreResult<HashMap<String, RuleId>> {
        let mut pending: Vec<NewRule> = dedupe(lines.iter().map(String::as_str))
            .into_iter()
            .map(NewRule::new)
            .collect();
        pending.sort_by(|a, b| a.text_hash.cmp(&b.text_hash));
        let mut registered = HashMap::with_capacity(pending.len());

        for rules in pending.chunks(self.rule_chunk_size) {
            let mut resolved: HashMap<String, RuleId> = tx
                .upsert_rules(rules)
                .await?
                .into_iter()
                .map(|r| (r.text, r.id))
                .collect();

            // Rows committed by another writer after this statement's
            // snapshot are skipped by the insert but not returned.
            let missing: Vec<String> = rules
                .iter()
                .filter(|r| !resolved.contains_key(&r.text))
                .map(|r| r.text_hash.clone())
                .collect();
            if !missing.is_empty() {
                debug!(count = missing.len(), "re-reading rules registered concurrently");
                for RuleRef { id, text } in tx.find_rules(&missing).await? {
                    resolved.insert(text, id);
                }
            }

            let mut ids = Vec::with_capacity(rules.len());
            for rule in rules {
                let id = match resolved.get(&rule.text) {
                    Some(id) => *id,
                    None => {
                        warn!(rule = %rule.text, "rule missing after bulk registration");
                        self.rule(tx, rule).await?
                    }
                };
                ids.push(id);
                registered.insert(rule.text.clone(), id);
            }
            tx.link_list_rules(list, &ids).await?;
        }

        Ok(registered)
    }

    /// Get-or-create a single rule.
    pub async fn rule(&self, tx: &mut dyn StoreTx, rule: &NewRule) -> StoreResult<RuleId> {
        get_or_create!(
            tx.insert_rule(rule),
            tx.find_rule(&rule.text_hash),
            "rule",
            rule.text_hash
        )
    }

    pub async fn rule_id(&self, tx: &mut dyn StoreTx, text: &str) -> StoreResult<RuleId> {
        self.rule(tx, &NewRule::new(text)).await
    }

    /// Resolve a resource or initiator type name, caching the id.
    ///
    /// Runs in its own short transaction. Call it while no other transaction
    /// from this task is open.
    pub async fn type_id(&self, table: TypeTable, name: &str) -> StoreResult<i64> {
        let key = (table, name.to_string());
        if let Some(id) = self.cached_type(&key) {
            return Ok(id);
        }

        let mut tx = self.store.begin().await?;
        let id = get_or_create!(
            tx.insert_type(table, name),
            tx.find_type(table, name),
            "type",
            name
        )?;
        tx.commit().await?;

        if let Ok(mut cache) = self.type_ids.lock() {
            cache.put(key, id);
        }
        Ok(id)
    }

    fn cached_type(&self, key: &(TypeTable, String)) -> Option<i64> {
        self.type_ids
            .lock()
            .ok()
            .and_then(|mut cache| cache.get(key).copied())
    }
}

fn dedupe<'a>(items: impl Iterator<Item = &'a str>) -> Vec<String> {
    let mut seen = HashSet::new();
    items
        .filter(|item| seen.insert(*item))
        .map(str::to_string)
        .collect()
}
