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

//! Fault injection decorator for failure drills and tests.

use crate::store::{CounterStore, StoreTransaction};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tally_core::{
    AggregateCounter, CounterDelta, CounterFilter, CounterId, CounterKey, EventRecord, FlushBatch,
    NewEventRecord, StorageError, StorageResult, TenantId, TenantPolicy,
};
use tracing::debug;

/// Shared switchboard controlling which calls fail.
#[derive(Debug, Default)]
pub struct FaultPlan {
    fail_next: AtomicU32,
    fail_all: AtomicBool,
    fail_commits: AtomicBool,
    latency_ms: AtomicU64,
    calls: AtomicU64,
}

impl FaultPlan {
    /// Fail the next `n` data calls with a transient error
    pub fn fail_next(&self, n: u32) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// Fail every data call until switched off
    pub fn fail_all(&self, enabled: bool) {
        self.fail_all.store(enabled, Ordering::SeqCst);
    }

    /// Make transaction commits roll back and report failure
    pub fn fail_commits(&self, enabled: bool) {
        self.fail_commits.store(enabled, Ordering::SeqCst);
    }

    /// Delay every data call
    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    /// Data calls that reached the decorator
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    async fn check(&self, operation: &'static str) -> StorageResult<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        let latency = self.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }

        let scheduled = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if scheduled || self.fail_all.load(Ordering::SeqCst) {
            debug!("Injecting failure into {}", operation);
            return Err(StorageError::Transient(format!(
                "injected failure in {operation}"
            )));
        }
        Ok(())
    }
}

/// Wraps a store and fails calls according to its [`FaultPlan`].
pub struct FaultInjectingStore<S> {
    inner: S,
    plan: Arc<FaultPlan>,
}

impl<S: CounterStore> FaultInjectingStore<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            plan: Arc::new(FaultPlan::default()),
        }
    }

    pub fn plan(&self) -> Arc<FaultPlan> {
        self.plan.clone()
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }
}

#[async_trait]
impl<S: CounterStore> CounterStore for FaultInjectingStore<S> {
    async fn read_counter(&self, key: &CounterKey) -> StorageResult<Option<AggregateCounter>> {
        self.plan.check("read_counter").await?;
        self.inner.read_counter(key).await
    }

    async fn upsert_counters(
        &self,
        deltas: &[CounterDelta],
    ) -> StorageResult<Vec<AggregateCounter>> {
        self.plan.check("upsert_counters").await?;
        self.inner.upsert_counters(deltas).await
    }

    async fn insert_events(&self, events: &[NewEventRecord]) -> StorageResult<usize> {
        self.plan.check("insert_events").await?;
        self.inner.insert_events(events).await
    }

    async fn commit_flush(&self, batch: &FlushBatch) -> StorageResult<Vec<AggregateCounter>> {
        self.plan.check("commit_flush").await?;
        self.inner.commit_flush(batch).await
    }

    async fn counters(&self, filter: &CounterFilter) -> StorageResult<Vec<AggregateCounter>> {
        self.plan.check("counters").await?;
        self.inner.counters(filter).await
    }

    async fn sum_counts(&self, filter: &CounterFilter) -> StorageResult<u64> {
        self.plan.check("sum_counts").await?;
        self.inner.sum_counts(filter).await
    }

    async fn events_for(&self, counter_ids: &[CounterId]) -> StorageResult<Vec<EventRecord>> {
        self.plan.check("events_for").await?;
        self.inner.events_for(counter_ids).await
    }

    async fn event_times(
        &self,
        tenant: TenantId,
        since: DateTime<Utc>,
    ) -> StorageResult<Vec<DateTime<Utc>>> {
        self.plan.check("event_times").await?;
        self.inner.event_times(tenant, since).await
    }

    async fn policies(&self) -> StorageResult<Vec<TenantPolicy>> {
        self.plan.check("policies").await?;
        self.inner.policies().await
    }

    async fn begin(&self) -> StorageResult<Box<dyn StoreTransaction>> {
        self.plan.check("begin").await?;
        let inner = self.inner.begin().await?;
        Ok(Box::new(FaultyTransaction {
            inner,
            plan: self.plan.clone(),
        }))
    }
}

struct FaultyTransaction {
    inner: Box<dyn StoreTransaction>,
    plan: Arc<FaultPlan>,
}

#[async_trait]
impl StoreTransaction for FaultyTransaction {
    async fn policy(&mut self, tenant: TenantId) -> StorageResult<Option<TenantPolicy>> {
        self.inner.policy(tenant).await
    }

    async fn put_policy(&mut self, policy: TenantPolicy) -> StorageResult<()> {
        self.inner.put_policy(policy).await
    }

    async fn delete_counters(&mut self, filter: &CounterFilter) -> StorageResult<Vec<CounterKey>> {
        self.inner.delete_counters(filter).await
    }

    async fn commit(self: Box<Self>) -> StorageResult<()> {
        let FaultyTransaction { inner, plan } = *self;
        if plan.fail_commits.load(Ordering::SeqCst) {
            inner.rollback().await?;
            return Err(StorageError::Transient("injected commit failure".into()));
        }
        inner.commit().await
    }

    async fn rollback(self: Box<Self>) -> StorageResult<()> {
        self.inner.rollback().await
    }
}
