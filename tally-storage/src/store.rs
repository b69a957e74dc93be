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

//! Storage seam for the counting pipeline.
//!
//! The pipeline only needs a handful of relational operations: upsert of
//! counter rows, bulk insert of event rows, scoped reads, and a transaction
//! that can read/write tenant policies and delete counters with their events.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tally_core::{
    AggregateCounter, CounterDelta, CounterFilter, CounterId, CounterKey, EventRecord, FlushBatch,
    NewEventRecord, StorageError, StorageResult, TenantId, TenantPolicy,
};

#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Read one counter by its composite key
    async fn read_counter(&self, key: &CounterKey) -> StorageResult<Option<AggregateCounter>>;

    /// Add each delta to its counter, creating rows that do not exist yet.
    /// Returns the rows as stored after the update.
    async fn upsert_counters(&self, deltas: &[CounterDelta])
        -> StorageResult<Vec<AggregateCounter>>;

    /// Append event rows; every row must reference an existing counter
    async fn insert_events(&self, events: &[NewEventRecord]) -> StorageResult<usize>;

    /// Persist one flush cycle: counter upsert followed by the event bulk insert.
    ///
    /// Backends that can run both statements in one transaction should
    /// override this so a failure leaves neither table touched.
    async fn commit_flush(&self, batch: &FlushBatch) -> StorageResult<Vec<AggregateCounter>> {
        let counters = self.upsert_counters(&batch.deltas).await?;
        let records = attach_counter_ids(&counters, batch)?;
        self.insert_events(&records).await?;
        Ok(counters)
    }

    /// All counters matching the filter
    async fn counters(&self, filter: &CounterFilter) -> StorageResult<Vec<AggregateCounter>>;

    /// Summed count over matching counters
    async fn sum_counts(&self, filter: &CounterFilter) -> StorageResult<u64> {
        Ok(self.counters(filter).await?.iter().map(|c| c.count).sum())
    }

    /// Event rows owned by the given counters, in insertion order
    async fn events_for(&self, counter_ids: &[CounterId]) -> StorageResult<Vec<EventRecord>>;

    /// Timestamps of a tenant's events at or after `since`
    async fn event_times(
        &self,
        tenant: TenantId,
        since: DateTime<Utc>,
    ) -> StorageResult<Vec<DateTime<Utc>>>;

    /// Every persisted tenant policy
    async fn policies(&self) -> StorageResult<Vec<TenantPolicy>>;

    /// Open a read-committed transaction
    async fn begin(&self) -> StorageResult<Box<dyn StoreTransaction>>;
}

/// Read-committed transaction: reads see committed data plus this
/// transaction's own writes; nothing is visible to others before `commit`.
#[async_trait]
pub trait StoreTransaction: Send {
    async fn policy(&mut self, tenant: TenantId) -> StorageResult<Option<TenantPolicy>>;

    async fn put_policy(&mut self, policy: TenantPolicy) -> StorageResult<()>;

    /// Delete matching counters together with their events. Returns the keys
    /// that will be removed on commit.
    async fn delete_counters(&mut self, filter: &CounterFilter) -> StorageResult<Vec<CounterKey>>;

    async fn commit(self: Box<Self>) -> StorageResult<()>;

    async fn rollback(self: Box<Self>) -> StorageResult<()>;
}

/// Resolve the owning counter id for every queued event of a flush.
pub fn attach_counter_ids(
    counters: &[AggregateCounter],
    batch: &FlushBatch,
) -> StorageResult<Vec<NewEventRecord>> {
    let ids: HashMap<CounterKey, CounterId> = counters.iter().map(|c| (c.key, c.id)).collect();

    batch
        .events
        .iter()
        .map(|event| {
            let counter_id = ids.get(&event.key).copied().ok_or_else(|| {
                StorageError::Conflict(format!("event references unknown counter {}", event.key))
            })?;
            Ok(NewEventRecord {
                counter_id,
                key: event.key,
                occurred_at: event.occurred_at,
            })
        })
        .collect()
}
