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

//! Tenant enablement controller
//!
//! Toggles counting for a tenant and adjusts its minimum qualifying size.
//! The persisted [`TenantPolicy`] is the source of truth; the in-memory
//! [`TenantRegistry`] mirrors it. Both change inside one storage
//! transaction and the mirror is put back whenever that transaction does
//! not commit.

use crate::cache::CounterCache;
use crate::filter::TenantRegistry;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tally_core::{CounterFilter, StorageResult, TallyError, TallyResult, TenantId, TenantPolicy};
use tally_storage::{ResilientStore, StoreTransaction};
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Run one admin transaction step under its time ceiling.
pub(crate) async fn admin_step<T, F>(timeout: Duration, step: F) -> TallyResult<T>
where
    F: Future<Output = StorageResult<T>>,
{
    match tokio::time::timeout(timeout, step).await {
        Ok(result) => result.map_err(TallyError::from),
        Err(_) => Err(TallyError::AdminTimeout(timeout)),
    }
}

/// Roll back a transaction that did not get to commit. Rollback failures are
/// logged; the original error is what the caller sees.
pub(crate) async fn abandon(tx: Box<dyn StoreTransaction>, timeout: Duration) {
    if let Err(e) = admin_step(timeout, tx.rollback()).await {
        warn!("Rollback failed: {}", e);
    }
}

pub struct EnablementController {
    store: Arc<ResilientStore>,
    registry: Arc<TenantRegistry>,
    cache: Arc<CounterCache>,
    write_gate: Arc<Mutex<()>>,
    /// Serializes admin writes to tenant policies
    toggle_lock: Mutex<()>,
    step_timeout: Duration,
}

impl EnablementController {
    pub(crate) fn new(
        store: Arc<ResilientStore>,
        registry: Arc<TenantRegistry>,
        cache: Arc<CounterCache>,
        write_gate: Arc<Mutex<()>>,
        step_timeout: Duration,
    ) -> Self {
        Self {
            store,
            registry,
            cache,
            write_gate,
            toggle_lock: Mutex::new(()),
            step_timeout,
        }
    }

    /// Load persisted policies into the mirror. Returns the number of enabled
    /// tenants.
    pub async fn hydrate(&self) -> TallyResult<usize> {
        let policies = self.store.policies().await?;
        let mut enabled = 0;
        for policy in policies.iter().filter(|p| p.enabled) {
            self.registry.enable(policy.tenant, policy.min_size);
            enabled += 1;
        }
        info!("Hydrated {} enabled tenants from storage", enabled);
        Ok(enabled)
    }

    /// Flip a tenant between enabled and disabled. Returns the new state.
    pub async fn toggle(&self, tenant: TenantId) -> TallyResult<bool> {
        let _guard = self.toggle_lock.lock().await;
        let previous = self.registry.snapshot(tenant);

        let mut tx = admin_step(self.step_timeout, self.store.inner().begin()).await?;
        let outcome = match self.apply_toggle(tenant, tx.as_mut()).await {
            Ok(enabled) => admin_step(self.step_timeout, tx.commit())
                .await
                .map(|_| enabled),
            Err(e) => {
                abandon(tx, self.step_timeout).await;
                Err(e)
            }
        };

        match outcome {
            Ok(enabled) => {
                if !enabled {
                    self.cache.invalidate_tenant(tenant);
                }
                let state = if enabled { "enabled" } else { "disabled" };
                info!("Tenant {} counting {}", tenant, state);
                Ok(enabled)
            }
            Err(e) => {
                self.registry.restore(tenant, previous);
                warn!("Toggle for tenant {} failed, mirror restored: {}", tenant, e);
                Err(e)
            }
        }
    }

    async fn apply_toggle(
        &self,
        tenant: TenantId,
        tx: &mut dyn StoreTransaction,
    ) -> TallyResult<bool> {
        let policy = admin_step(self.step_timeout, tx.policy(tenant))
            .await?
            .unwrap_or_else(|| TenantPolicy::disabled(tenant));
        let enabled = !policy.enabled;

        if enabled {
            self.registry.enable(tenant, policy.min_size);
            self.warm_cache(tenant).await?;
        } else {
            self.registry.disable(tenant);
        }

        admin_step(
            self.step_timeout,
            tx.put_policy(TenantPolicy { enabled, ..policy }),
        )
        .await?;
        Ok(enabled)
    }

    /// Load a re-enabled tenant's existing counters into the cache.
    async fn warm_cache(&self, tenant: TenantId) -> TallyResult<()> {
        let _gate = self.write_gate.lock().await;
        let counters = self.store.counters(&CounterFilter::tenant(tenant)).await?;
        let loaded = counters.len();
        for counter in counters {
            self.cache.refresh(counter);
        }
        info!("Warmed cache with {} counters for tenant {}", loaded, tenant);
        Ok(())
    }

    /// Change the minimum qualifying size for a tenant. The tenant's enabled
    /// state is left as it is.
    pub async fn set_minimum_size(&self, tenant: TenantId, min_size: usize) -> TallyResult<()> {
        let _guard = self.toggle_lock.lock().await;
        let previous = self.registry.snapshot(tenant);

        let mut tx = admin_step(self.step_timeout, self.store.inner().begin()).await?;
        let outcome = match self.apply_min_size(tenant, min_size, tx.as_mut()).await {
            Ok(()) => admin_step(self.step_timeout, tx.commit()).await,
            Err(e) => {
                abandon(tx, self.step_timeout).await;
                Err(e)
            }
        };

        if let Err(e) = outcome {
            self.registry.restore(tenant, previous);
            warn!("Minimum size update for tenant {} failed: {}", tenant, e);
            return Err(e);
        }
        info!("Tenant {} minimum size set to {}", tenant, min_size);
        Ok(())
    }

    async fn apply_min_size(
        &self,
        tenant: TenantId,
        min_size: usize,
        tx: &mut dyn StoreTransaction,
    ) -> TallyResult<()> {
        let policy = admin_step(self.step_timeout, tx.policy(tenant))
            .await?
            .unwrap_or_else(|| TenantPolicy::disabled(tenant));

        if policy.enabled {
            self.registry.set_min_size(tenant, min_size);
        }

        admin_step(
            self.step_timeout,
            tx.put_policy(TenantPolicy { min_size, ..policy }),
        )
        .await
    }

    pub fn is_enabled(&self, tenant: TenantId) -> bool {
        self.registry.is_enabled(tenant)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tally_core::{CounterDelta, CounterKey, FlushBatch, PendingEvent, ResilienceConfig};
    use tally_storage::{CounterStore, FaultInjectingStore, FaultPlan, MemoryStore};

    fn build(
        store: Arc<dyn CounterStore>,
    ) -> (EnablementController, Arc<TenantRegistry>, Arc<CounterCache>) {
        let registry = Arc::new(TenantRegistry::new());
        let cache = Arc::new(CounterCache::new(Duration::from_secs(60), 100));
        let controller = EnablementController::new(
            Arc::new(ResilientStore::new(store, ResilienceConfig::default())),
            registry.clone(),
            cache.clone(),
            Arc::new(Mutex::new(())),
            Duration::from_secs(5),
        );
        (controller, registry, cache)
    }

    fn faulty() -> (Arc<dyn CounterStore>, Arc<FaultPlan>, MemoryStore) {
        let memory = MemoryStore::new();
        let store = FaultInjectingStore::new(memory.clone());
        let plan = store.plan();
        let store: Arc<dyn CounterStore> = Arc::new(store);
        (store, plan, memory)
    }

    #[tokio::test]
    async fn test_toggle_round_trip() {
        let memory = MemoryStore::new();
        let (controller, registry, _) = build(Arc::new(memory.clone()));

        assert!(controller.toggle(TenantId(1)).await.unwrap());
        assert!(registry.is_enabled(TenantId(1)));
        let stored = memory.policies().await.unwrap();
        assert_eq!(stored.len(), 1);
        assert!(stored[0].enabled);

        assert!(!controller.toggle(TenantId(1)).await.unwrap());
        assert!(!registry.is_enabled(TenantId(1)));
        assert!(!memory.policies().await.unwrap()[0].enabled);
    }

    #[tokio::test]
    async fn test_enable_warms_cache() {
        let memory = MemoryStore::new();
        let key = CounterKey::new(4, 1, 1);
        memory
            .commit_flush(&FlushBatch {
                deltas: vec![CounterDelta { key, delta: 1 }],
                events: vec![PendingEvent {
                    key,
                    occurred_at: Utc::now(),
                }],
            })
            .await
            .unwrap();
        let (controller, _, cache) = build(Arc::new(memory));

        controller.toggle(TenantId(4)).await.unwrap();
        assert!(cache.get(&key).is_some());
    }

    #[tokio::test]
    async fn test_disable_evicts_tenant_from_cache() {
        let memory = MemoryStore::new();
        let mine = CounterKey::new(6, 1, 1);
        let other = CounterKey::new(7, 1, 1);
        for key in [mine, other] {
            memory
                .commit_flush(&FlushBatch {
                    deltas: vec![CounterDelta { key, delta: 1 }],
                    events: vec![PendingEvent {
                        key,
                        occurred_at: Utc::now(),
                    }],
                })
                .await
                .unwrap();
        }
        let (controller, _, cache) = build(Arc::new(memory));

        controller.toggle(TenantId(6)).await.unwrap();
        controller.toggle(TenantId(7)).await.unwrap();
        assert!(cache.get(&mine).is_some());

        assert!(!controller.toggle(TenantId(6)).await.unwrap());
        assert!(cache.get(&mine).is_none());
        assert!(cache.get(&other).is_some());
    }

    #[tokio::test]
    async fn test_failed_disable_keeps_cache() {
        let memory = MemoryStore::new();
        let key = CounterKey::new(8, 1, 1);
        memory
            .commit_flush(&FlushBatch {
                deltas: vec![CounterDelta { key, delta: 1 }],
                events: vec![PendingEvent {
                    key,
                    occurred_at: Utc::now(),
                }],
            })
            .await
            .unwrap();
        let faulty = FaultInjectingStore::new(memory);
        let plan = faulty.plan();
        let (controller, _, cache) = build(Arc::new(faulty));
        controller.toggle(TenantId(8)).await.unwrap();

        plan.fail_commits(true);
        assert!(controller.toggle(TenantId(8)).await.is_err());
        assert!(cache.get(&key).is_some());
    }

    #[tokio::test]
    async fn test_failed_commit_restores_mirror() {
        let (store, plan, memory) = faulty();
        let (controller, registry, _) = build(store);

        plan.fail_commits(true);
        let result = controller.toggle(TenantId(2)).await;
        assert!(result.is_err());
        assert!(!registry.is_enabled(TenantId(2)));
        assert!(memory.policies().await.unwrap().is_empty());

        plan.fail_commits(false);
        assert!(controller.toggle(TenantId(2)).await.unwrap());
        assert!(registry.is_enabled(TenantId(2)));
    }

    #[tokio::test]
    async fn test_failed_disable_keeps_tenant_enabled() {
        let (store, plan, _) = faulty();
        let (controller, registry, _) = build(store);
        controller.toggle(TenantId(3)).await.unwrap();
        controller.set_minimum_size(TenantId(3), 8).await.unwrap();

        plan.fail_commits(true);
        assert!(controller.toggle(TenantId(3)).await.is_err());
        assert!(registry.is_enabled(TenantId(3)));
        assert_eq!(registry.min_size(TenantId(3)), Some(8));
    }

    #[tokio::test]
    async fn test_minimum_size_persists_across_toggle() {
        let memory = MemoryStore::new();
        let (controller, registry, _) = build(Arc::new(memory.clone()));

        controller.set_minimum_size(TenantId(5), 20).await.unwrap();
        assert!(!registry.is_enabled(TenantId(5)));
        assert_eq!(registry.min_size(TenantId(5)), None);

        controller.toggle(TenantId(5)).await.unwrap();
        assert_eq!(registry.min_size(TenantId(5)), Some(20));
    }

    #[tokio::test]
    async fn test_hydrate_loads_enabled_policies() {
        let memory = MemoryStore::new();
        {
            let (controller, _, _) = build(Arc::new(memory.clone()));
            controller.toggle(TenantId(1)).await.unwrap();
            controller.toggle(TenantId(2)).await.unwrap();
            controller.toggle(TenantId(2)).await.unwrap();
        }

        let (controller, registry, _) = build(Arc::new(memory));
        assert_eq!(controller.hydrate().await.unwrap(), 1);
        assert_eq!(registry.enabled_tenants(), vec![TenantId(1)]);
    }
}
