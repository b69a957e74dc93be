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

//! Store wrapper that routes every data call through the resilience chain.

use crate::store::CounterStore;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tally_core::{
    AggregateCounter, CounterDelta, CounterFilter, CounterId, CounterKey, EventRecord, FlushBatch,
    NewEventRecord, ResilienceConfig, ResilienceError, ResiliencePipeline, StorageError, TenantId,
    TenantPolicy,
};

pub type ResilientResult<T> = Result<T, ResilienceError<StorageError>>;

pub struct ResilientStore {
    inner: Arc<dyn CounterStore>,
    pipeline: ResiliencePipeline,
}

impl ResilientStore {
    pub fn new(inner: Arc<dyn CounterStore>, config: ResilienceConfig) -> Self {
        Self {
            inner,
            pipeline: ResiliencePipeline::new("counter-store", config),
        }
    }

    pub fn pipeline(&self) -> &ResiliencePipeline {
        &self.pipeline
    }

    /// The undecorated store, for transactional admin work that must not be
    /// replayed by the retry policy.
    pub fn inner(&self) -> &Arc<dyn CounterStore> {
        &self.inner
    }

    pub async fn read(&self, key: &CounterKey) -> ResilientResult<Option<AggregateCounter>> {
        let store = self.inner.as_ref();
        self.pipeline
            .execute("read_counter", move || store.read_counter(key))
            .await
    }

    pub async fn upsert(&self, deltas: &[CounterDelta]) -> ResilientResult<Vec<AggregateCounter>> {
        let store = self.inner.as_ref();
        self.pipeline
            .execute("upsert_counters", move || store.upsert_counters(deltas))
            .await
    }

    pub async fn bulk_insert(&self, events: &[NewEventRecord]) -> ResilientResult<usize> {
        let store = self.inner.as_ref();
        self.pipeline
            .execute("insert_events", move || store.insert_events(events))
            .await
    }

    pub async fn commit_flush(&self, batch: &FlushBatch) -> ResilientResult<Vec<AggregateCounter>> {
        let store = self.inner.as_ref();
        self.pipeline
            .execute("commit_flush", move || store.commit_flush(batch))
            .await
    }

    pub async fn counters(&self, filter: &CounterFilter) -> ResilientResult<Vec<AggregateCounter>> {
        let store = self.inner.as_ref();
        self.pipeline
            .execute("counters", move || store.counters(filter))
            .await
    }

    pub async fn sum_counts(&self, filter: &CounterFilter) -> ResilientResult<u64> {
        let store = self.inner.as_ref();
        self.pipeline
            .execute("sum_counts", move || store.sum_counts(filter))
            .await
    }

    pub async fn events_for(&self, counter_ids: &[CounterId]) -> ResilientResult<Vec<EventRecord>> {
        let store = self.inner.as_ref();
        self.pipeline
            .execute("events_for", move || store.events_for(counter_ids))
            .await
    }

    pub async fn event_times(
        &self,
        tenant: TenantId,
        since: DateTime<Utc>,
    ) -> ResilientResult<Vec<DateTime<Utc>>> {
        let store = self.inner.as_ref();
        self.pipeline
            .execute("event_times", move || store.event_times(tenant, since))
            .await
    }

    pub async fn policies(&self) -> ResilientResult<Vec<TenantPolicy>> {
        let store = self.inner.as_ref();
        self.pipeline
            .execute("policies", move || store.policies())
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::faults::FaultInjectingStore;
    use crate::memory::MemoryStore;
    use std::time::Duration;
    use tally_core::{CircuitConfig, CircuitState, PendingEvent, RetryPolicy};

    fn config(threshold: u32) -> ResilienceConfig {
        ResilienceConfig {
            retry: RetryPolicy {
                base_delay: Duration::from_millis(10),
                ..RetryPolicy::exponential()
            },
            circuit: CircuitConfig {
                failure_threshold: threshold,
                open_duration: Duration::from_secs(30),
            },
            attempt_timeout: Duration::from_secs(1),
            ..Default::default()
        }
    }

    fn flush(key: CounterKey) -> FlushBatch {
        FlushBatch {
            deltas: vec![CounterDelta { key, delta: 1 }],
            events: vec![PendingEvent {
                key,
                occurred_at: Utc::now(),
            }],
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failures_are_retried() {
        let faulty = Arc::new(FaultInjectingStore::new(MemoryStore::new()));
        let plan = faulty.plan();
        let store = ResilientStore::new(faulty, config(10));
        let key = CounterKey::new(1, 2, 3);

        plan.fail_next(2);
        let counters = store.commit_flush(&flush(key)).await.unwrap();

        assert_eq!(counters[0].count, 1);
        assert_eq!(plan.calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_surface_failure() {
        let faulty = Arc::new(FaultInjectingStore::new(MemoryStore::new()));
        let plan = faulty.plan();
        let store = ResilientStore::new(faulty, config(10));

        plan.fail_all(true);
        let result = store.read(&CounterKey::new(1, 2, 3)).await;

        assert!(matches!(
            result,
            Err(ResilienceError::Exhausted { attempts: 3, .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_circuit_skips_backend() {
        let faulty = Arc::new(FaultInjectingStore::new(MemoryStore::new()));
        let plan = faulty.plan();
        let store = ResilientStore::new(faulty, config(3));
        let key = CounterKey::new(1, 2, 3);

        plan.fail_all(true);
        assert!(store.read(&key).await.is_err());
        assert_eq!(store.pipeline().circuit_breaker().state(), CircuitState::Open);

        let calls = plan.calls();
        plan.fail_all(false);
        assert!(matches!(
            store.read(&key).await,
            Err(ResilienceError::CircuitOpen { .. })
        ));
        assert_eq!(plan.calls(), calls);

        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(store.read(&key).await.unwrap().is_none());
        assert_eq!(
            store.pipeline().circuit_breaker().state(),
            CircuitState::Closed
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_upsert_then_bulk_insert() {
        let memory = MemoryStore::new();
        let faulty = Arc::new(FaultInjectingStore::new(memory.clone()));
        let plan = faulty.plan();
        let store = ResilientStore::new(faulty, config(10));
        let key = CounterKey::new(1, 2, 3);

        plan.fail_next(1);
        let counters = store
            .upsert(&[CounterDelta { key, delta: 2 }])
            .await
            .unwrap();
        assert_eq!(counters[0].count, 2);

        let records = vec![
            NewEventRecord {
                counter_id: counters[0].id,
                key,
                occurred_at: Utc::now(),
            };
            2
        ];
        assert_eq!(store.bulk_insert(&records).await.unwrap(), 2);
        assert_eq!(memory.event_row_count().await, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_bulk_insert_orphan_is_not_retried() {
        let memory = MemoryStore::new();
        let faulty = Arc::new(FaultInjectingStore::new(memory.clone()));
        let plan = faulty.plan();
        let store = ResilientStore::new(faulty, config(10));

        let orphan = NewEventRecord {
            counter_id: CounterId(99),
            key: CounterKey::new(1, 2, 3),
            occurred_at: Utc::now(),
        };
        let result = store.bulk_insert(&[orphan]).await;

        assert!(matches!(
            result,
            Err(ResilienceError::Fatal(StorageError::Conflict(_)))
        ));
        assert_eq!(plan.calls(), 1);
        assert_eq!(memory.event_row_count().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_backend_times_out() {
        let faulty = Arc::new(FaultInjectingStore::new(MemoryStore::new()));
        let plan = faulty.plan();
        let store = ResilientStore::new(faulty, config(10));

        plan.set_latency(Duration::from_secs(5));
        let result = store.policies().await;

        assert!(matches!(
            result,
            Err(ResilienceError::Exhausted {
                last_error: tally_core::AttemptError::Timeout(_),
                ..
            })
        ));
    }
}
