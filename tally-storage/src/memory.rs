// Copyright 2025 AgentReplay (https://github.com/agentreplay)
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! In-memory relational store.
//!
//! Two tables (counters, events) plus the tenant policy table, with a unique
//! index on the counter's composite key and generated numeric ids. Used for
//! development, tests and single-process deployments.

use crate::store::{attach_counter_ids, CounterStore, StoreTransaction};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tally_core::{
    AggregateCounter, CounterDelta, CounterFilter, CounterId, CounterKey, EventId, EventRecord,
    FlushBatch, NewEventRecord, StorageError, StorageResult, TenantId, TenantPolicy,
};
use tokio::sync::RwLock;
use tracing::debug;

#[derive(Debug, Default)]
struct Tables {
    counters: BTreeMap<CounterId, AggregateCounter>,
    /// Unique index on (tenant, resource, actor)
    key_index: HashMap<CounterKey, CounterId>,
    events: BTreeMap<EventId, EventRecord>,
    events_by_counter: HashMap<CounterId, Vec<EventId>>,
    policies: HashMap<TenantId, TenantPolicy>,
    last_counter_id: u64,
    last_event_id: u64,
}

impl Tables {
    fn upsert(&mut self, deltas: &[CounterDelta]) -> Vec<AggregateCounter> {
        let mut touched: Vec<CounterId> = Vec::with_capacity(deltas.len());

        for delta in deltas {
            let id = match self.key_index.get(&delta.key) {
                Some(id) => *id,
                None => {
                    self.last_counter_id += 1;
                    let id = CounterId(self.last_counter_id);
                    self.key_index.insert(delta.key, id);
                    self.counters.insert(
                        id,
                        AggregateCounter {
                            id,
                            key: delta.key,
                            count: 0,
                        },
                    );
                    id
                }
            };

            if let Some(counter) = self.counters.get_mut(&id) {
                counter.count += delta.delta;
            }
            if !touched.contains(&id) {
                touched.push(id);
            }
        }

        touched
            .iter()
            .filter_map(|id| self.counters.get(id).cloned())
            .collect()
    }

    fn check_foreign_keys(&self, events: &[NewEventRecord]) -> StorageResult<()> {
        match events
            .iter()
            .find(|e| !self.counters.contains_key(&e.counter_id))
        {
            Some(orphan) => Err(StorageError::Conflict(format!(
                "counter {} does not exist",
                orphan.counter_id
            ))),
            None => Ok(()),
        }
    }

    fn insert_events(&mut self, events: &[NewEventRecord]) -> usize {
        for event in events {
            self.last_event_id += 1;
            let id = EventId(self.last_event_id);
            self.events.insert(
                id,
                EventRecord {
                    id,
                    counter_id: event.counter_id,
                    key: event.key,
                    occurred_at: event.occurred_at,
                },
            );
            self.events_by_counter
                .entry(event.counter_id)
                .or_default()
                .push(id);
        }
        events.len()
    }

    fn matching(&self, filter: &CounterFilter) -> impl Iterator<Item = &AggregateCounter> + '_ {
        let filter = *filter;
        self.counters.values().filter(move |c| filter.matches(&c.key))
    }

    fn delete(&mut self, filter: &CounterFilter) -> Vec<CounterKey> {
        let doomed: Vec<(CounterId, CounterKey)> =
            self.matching(filter).map(|c| (c.id, c.key)).collect();

        for (id, key) in &doomed {
            self.counters.remove(id);
            self.key_index.remove(key);
            for event_id in self.events_by_counter.remove(id).unwrap_or_default() {
                self.events.remove(&event_id);
            }
        }

        doomed.into_iter().map(|(_, key)| key).collect()
    }
}

/// Shared handle to the in-memory tables. Clones see the same data.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    tables: Arc<RwLock<Tables>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of event rows across all tenants
    pub async fn event_row_count(&self) -> usize {
        self.tables.read().await.events.len()
    }

    /// Number of counter rows across all tenants
    pub async fn counter_row_count(&self) -> usize {
        self.tables.read().await.counters.len()
    }
}

#[async_trait]
impl CounterStore for MemoryStore {
    async fn read_counter(&self, key: &CounterKey) -> StorageResult<Option<AggregateCounter>> {
        let tables = self.tables.read().await;
        Ok(tables
            .key_index
            .get(key)
            .and_then(|id| tables.counters.get(id))
            .cloned())
    }

    async fn upsert_counters(
        &self,
        deltas: &[CounterDelta],
    ) -> StorageResult<Vec<AggregateCounter>> {
        Ok(self.tables.write().await.upsert(deltas))
    }

    async fn insert_events(&self, events: &[NewEventRecord]) -> StorageResult<usize> {
        let mut tables = self.tables.write().await;
        tables.check_foreign_keys(events)?;
        Ok(tables.insert_events(events))
    }

    async fn commit_flush(&self, batch: &FlushBatch) -> StorageResult<Vec<AggregateCounter>> {
        let delta_keys: HashSet<&CounterKey> = batch.keys().collect();
        if let Some(orphan) = batch.events.iter().find(|e| !delta_keys.contains(&e.key)) {
            return Err(StorageError::Conflict(format!(
                "event for {} has no counter delta",
                orphan.key
            )));
        }

        let mut tables = self.tables.write().await;
        let counters = tables.upsert(&batch.deltas);
        let records = attach_counter_ids(&counters, batch)?;
        tables.insert_events(&records);
        Ok(counters)
    }

    async fn counters(&self, filter: &CounterFilter) -> StorageResult<Vec<AggregateCounter>> {
        Ok(self.tables.read().await.matching(filter).cloned().collect())
    }

    async fn events_for(&self, counter_ids: &[CounterId]) -> StorageResult<Vec<EventRecord>> {
        let tables = self.tables.read().await;
        let mut events: Vec<EventRecord> = counter_ids
            .iter()
            .filter_map(|id| tables.events_by_counter.get(id))
            .flatten()
            .filter_map(|event_id| tables.events.get(event_id).cloned())
            .collect();
        events.sort_by_key(|e| e.id);
        Ok(events)
    }

    async fn event_times(
        &self,
        tenant: TenantId,
        since: DateTime<Utc>,
    ) -> StorageResult<Vec<DateTime<Utc>>> {
        let tables = self.tables.read().await;
        Ok(tables
            .events
            .values()
            .filter(|e| e.key.tenant == tenant && e.occurred_at >= since)
            .map(|e| e.occurred_at)
            .collect())
    }

    async fn policies(&self) -> StorageResult<Vec<TenantPolicy>> {
        let tables = self.tables.read().await;
        let mut policies: Vec<TenantPolicy> = tables.policies.values().copied().collect();
        policies.sort_by_key(|p| p.tenant);
        Ok(policies)
    }

    async fn begin(&self) -> StorageResult<Box<dyn StoreTransaction>> {
        Ok(Box::new(MemoryTransaction {
            tables: self.tables.clone(),
            policies: HashMap::new(),
            deletes: Vec::new(),
        }))
    }
}

/// Staged writes applied atomically on commit.
pub struct MemoryTransaction {
    tables: Arc<RwLock<Tables>>,
    policies: HashMap<TenantId, TenantPolicy>,
    deletes: Vec<CounterFilter>,
}

#[async_trait]
impl StoreTransaction for MemoryTransaction {
    async fn policy(&mut self, tenant: TenantId) -> StorageResult<Option<TenantPolicy>> {
        if let Some(staged) = self.policies.get(&tenant) {
            return Ok(Some(*staged));
        }
        Ok(self.tables.read().await.policies.get(&tenant).copied())
    }

    async fn put_policy(&mut self, policy: TenantPolicy) -> StorageResult<()> {
        self.policies.insert(policy.tenant, policy);
        Ok(())
    }

    async fn delete_counters(&mut self, filter: &CounterFilter) -> StorageResult<Vec<CounterKey>> {
        let tables = self.tables.read().await;
        let keys = tables
            .matching(filter)
            .map(|c| c.key)
            .filter(|key| !self.deletes.iter().any(|staged| staged.matches(key)))
            .collect();
        drop(tables);

        self.deletes.push(*filter);
        Ok(keys)
    }

    async fn commit(self: Box<Self>) -> StorageResult<()> {
        let MemoryTransaction {
            tables,
            policies,
            deletes,
        } = *self;

        let mut tables = tables.write().await;
        let policy_writes = policies.len();
        tables.policies.extend(policies);
        let mut removed = 0;
        for filter in &deletes {
            removed += tables.delete(filter).len();
        }
        debug!(
            "Committed transaction: {} policy writes, {} counters removed",
            policy_writes, removed
        );
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> StorageResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tally_core::PendingEvent;

    fn batch(key: CounterKey, n: usize) -> FlushBatch {
        let now = Utc::now();
        FlushBatch {
            deltas: vec![CounterDelta {
                key,
                delta: n as u64,
            }],
            events: (0..n)
                .map(|_| PendingEvent {
                    key,
                    occurred_at: now,
                })
                .collect(),
        }
    }

    #[tokio::test]
    async fn test_upsert_creates_then_increments() {
        let store = MemoryStore::new();
        let key = CounterKey::new(1, 2, 3);

        let first = store
            .upsert_counters(&[CounterDelta { key, delta: 3 }])
            .await
            .unwrap();
        let second = store
            .upsert_counters(&[CounterDelta { key, delta: 4 }])
            .await
            .unwrap();

        assert_eq!(first[0].id, second[0].id);
        assert_eq!(second[0].count, 7);
        assert_eq!(store.read_counter(&key).await.unwrap().unwrap().count, 7);
    }

    #[tokio::test]
    async fn test_commit_flush_links_events() {
        let store = MemoryStore::new();
        let key = CounterKey::new(1, 2, 3);

        let counters = store.commit_flush(&batch(key, 5)).await.unwrap();
        assert_eq!(counters[0].count, 5);

        let events = store.events_for(&[counters[0].id]).await.unwrap();
        assert_eq!(events.len(), 5);
        assert!(events.iter().all(|e| e.counter_id == counters[0].id));
        assert!(events.windows(2).all(|w| w[0].id < w[1].id));
    }

    #[tokio::test]
    async fn test_commit_flush_rejects_orphan_events_atomically() {
        let store = MemoryStore::new();
        let mut bad = batch(CounterKey::new(1, 2, 3), 2);
        bad.events.push(PendingEvent {
            key: CounterKey::new(9, 9, 9),
            occurred_at: Utc::now(),
        });

        assert!(store.commit_flush(&bad).await.is_err());
        assert_eq!(store.counter_row_count().await, 0);
        assert_eq!(store.event_row_count().await, 0);
    }

    #[tokio::test]
    async fn test_insert_events_checks_foreign_key() {
        let store = MemoryStore::new();
        let result = store
            .insert_events(&[NewEventRecord {
                counter_id: CounterId(77),
                key: CounterKey::new(1, 1, 1),
                occurred_at: Utc::now(),
            }])
            .await;
        assert!(matches!(result, Err(StorageError::Conflict(_))));
    }

    #[tokio::test]
    async fn test_transaction_delete_is_invisible_until_commit() {
        let store = MemoryStore::new();
        let key = CounterKey::new(1, 2, 3);
        store.commit_flush(&batch(key, 2)).await.unwrap();
        store
            .commit_flush(&batch(CounterKey::new(2, 2, 3), 1))
            .await
            .unwrap();

        let mut tx = store.begin().await.unwrap();
        let deleted = tx
            .delete_counters(&CounterFilter::tenant(TenantId(1)))
            .await
            .unwrap();
        assert_eq!(deleted, vec![key]);
        assert!(store.read_counter(&key).await.unwrap().is_some());

        tx.commit().await.unwrap();
        assert!(store.read_counter(&key).await.unwrap().is_none());
        assert_eq!(store.counter_row_count().await, 1);
        assert_eq!(store.event_row_count().await, 1);
    }

    #[tokio::test]
    async fn test_transaction_rollback_discards_writes() {
        let store = MemoryStore::new();
        let mut tx = store.begin().await.unwrap();
        tx.put_policy(TenantPolicy {
            tenant: TenantId(5),
            enabled: true,
            min_size: 3,
        })
        .await
        .unwrap();

        assert!(tx.policy(TenantId(5)).await.unwrap().unwrap().enabled);
        tx.rollback().await.unwrap();

        assert!(store.policies().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_recreated_counter_gets_new_id() {
        let store = MemoryStore::new();
        let key = CounterKey::new(1, 2, 3);
        let before = store.commit_flush(&batch(key, 1)).await.unwrap()[0].id;

        let mut tx = store.begin().await.unwrap();
        tx.delete_counters(&CounterFilter::tenant(TenantId(1)))
            .await
            .unwrap();
        tx.commit().await.unwrap();

        let after = store.commit_flush(&batch(key, 1)).await.unwrap();
        assert_ne!(after[0].id, before);
        assert_eq!(after[0].count, 1);
    }
}
