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

//! Counting service
//!
//! Wires the ingestion filter, write-behind queue, batch aggregator,
//! read-through cache, enablement controller and query side around one
//! backing store, and owns the consumer task's lifetime.

use crate::aggregator::{BatchAggregator, PipelineCounters, PipelineStats};
use crate::cache::{CacheStats, CounterCache};
use crate::config::TallyConfig;
use crate::enablement::EnablementController;
use crate::filter::{IngestionFilter, TenantRegistry};
use crate::query::CountQueries;
use crate::queue::{write_behind_queue, EnqueueError, QueueSender};
use crate::reset::CounterReset;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tally_core::{
    ActivityEvent, ActorId, AggregateCounter, CircuitState, CounterKey, CounterWithEvents,
    DayCount, HourCount, QueryScope, ResourceId, TallyError, TallyResult, TenantId,
};
use tally_storage::{CounterStore, ResilientStore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// What happened to an event handed to [`CountingService::record_event`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IngestOutcome {
    /// Accepted and waiting for the next flush cycle
    Queued,
    /// Tenant disabled or unit of work below its minimum size
    Filtered,
    /// Bounded queue at capacity
    Rejected,
    /// Service is shutting down
    Closed,
}

pub struct CountingService {
    filter: IngestionFilter,
    queue: QueueSender,
    store: Arc<ResilientStore>,
    cache: Arc<CounterCache>,
    queries: CountQueries,
    enablement: EnablementController,
    reset: CounterReset,
    stats: Arc<PipelineCounters>,
    shutdown: CancellationToken,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl CountingService {
    /// Validate the configuration, load persisted tenant policies and start
    /// the consumer task.
    pub async fn start(config: TallyConfig, store: Arc<dyn CounterStore>) -> TallyResult<Self> {
        config
            .validate()
            .map_err(|e| TallyError::Config(e.to_string()))?;

        let store = Arc::new(ResilientStore::new(
            store,
            config.resilience.to_resilience_config(),
        ));
        let cache = Arc::new(CounterCache::new(
            config.cache.ttl(),
            config.cache.max_entries,
        ));
        let registry = Arc::new(TenantRegistry::new());
        let write_gate = Arc::new(tokio::sync::Mutex::new(()));
        let step_timeout = config.admin.transaction_timeout();

        let enablement = EnablementController::new(
            store.clone(),
            registry.clone(),
            cache.clone(),
            write_gate.clone(),
            step_timeout,
        );
        enablement.hydrate().await?;

        let (queue, receiver) = write_behind_queue(config.pipeline.queue_capacity);
        let stats = Arc::new(PipelineCounters::new());
        let shutdown = CancellationToken::new();
        let worker = BatchAggregator::new(
            receiver,
            store.clone(),
            cache.clone(),
            write_gate.clone(),
            config.pipeline.batch_size,
            stats.clone(),
        )
        .spawn(shutdown.clone());

        info!(
            "Counting service started (batch_size={}, queue_capacity={:?}, cache_ttl={:?})",
            config.pipeline.batch_size,
            config.pipeline.queue_capacity,
            config.cache.ttl()
        );

        Ok(Self {
            filter: IngestionFilter::new(registry),
            queue,
            queries: CountQueries::new(store.clone(), cache.clone(), write_gate.clone()),
            reset: CounterReset::new(store.clone(), cache.clone(), write_gate, step_timeout),
            store,
            cache,
            enablement,
            stats,
            shutdown,
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Filter and enqueue one event. Never blocks and never touches storage.
    pub fn record_event(&self, event: ActivityEvent) -> IngestOutcome {
        if self.shutdown.is_cancelled() {
            return IngestOutcome::Closed;
        }
        if !self.filter.should_count(event.tenant, event.size) {
            self.stats.filtered.fetch_add(1, Ordering::Relaxed);
            return IngestOutcome::Filtered;
        }

        match self.queue.enqueue(event.pending()) {
            Ok(()) => {
                self.stats.accepted.fetch_add(1, Ordering::Relaxed);
                IngestOutcome::Queued
            }
            Err(EnqueueError::Full) => {
                self.stats.rejected.fetch_add(1, Ordering::Relaxed);
                warn!("Write-behind queue full, rejecting event for {}", event.key());
                IngestOutcome::Rejected
            }
            Err(EnqueueError::Closed) => {
                debug!("Event for {} arrived after shutdown", event.key());
                IngestOutcome::Closed
            }
        }
    }

    pub async fn get_counter(&self, key: &CounterKey) -> TallyResult<Option<AggregateCounter>> {
        self.queries.counter(key).await
    }

    pub async fn get_count(
        &self,
        scope: QueryScope,
        tenant: TenantId,
        scope_id: u64,
    ) -> TallyResult<u64> {
        self.queries.count(scope, tenant, scope_id).await
    }

    pub async fn get_all_for_entity(
        &self,
        scope: QueryScope,
        scope_id: u64,
        tenant: TenantId,
    ) -> TallyResult<Vec<CounterWithEvents>> {
        self.queries.all_for_entity(scope, scope_id, tenant).await
    }

    pub async fn get_busiest_hours(&self, tenant: TenantId, days: u32) -> TallyResult<Vec<HourCount>> {
        self.queries.busiest_hours(tenant, days).await
    }

    pub async fn get_busiest_days(&self, tenant: TenantId, weeks: u32) -> TallyResult<Vec<DayCount>> {
        self.queries.busiest_days(tenant, weeks).await
    }

    /// Returns the tenant's new enabled state.
    pub async fn toggle_tenant(&self, tenant: TenantId) -> TallyResult<bool> {
        self.enablement.toggle(tenant).await
    }

    pub async fn set_minimum_size(&self, tenant: TenantId, min_size: usize) -> TallyResult<()> {
        self.enablement.set_minimum_size(tenant, min_size).await
    }

    /// Returns false when nothing matched.
    pub async fn reset_counts(
        &self,
        tenant: TenantId,
        actor: Option<ActorId>,
        resource: Option<ResourceId>,
    ) -> TallyResult<bool> {
        self.reset.reset(tenant, actor, resource).await
    }

    pub fn is_enabled(&self, tenant: TenantId) -> bool {
        self.enablement.is_enabled(tenant)
    }

    pub fn stats(&self) -> PipelineStats {
        self.stats.snapshot()
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub fn circuit_state(&self) -> CircuitState {
        self.store.pipeline().circuit_breaker().state()
    }

    /// Stop accepting events, flush what is queued and wait for the consumer
    /// to exit. Safe to call more than once.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                warn!("Batch aggregator task failed: {}", e);
            }
            let stats = self.stats.snapshot();
            info!(
                "Counting service stopped: {} events flushed, {} dropped",
                stats.total_flushed_events, stats.total_dropped_events
            );
        }
    }
}

impl Drop for CountingService {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
