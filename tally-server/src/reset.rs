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

//! Counter reset
//!
//! Deletes counters and their event rows for a tenant, optionally narrowed
//! to one actor or one resource, then evicts the deleted keys from the
//! cache. Runs under the write gate so a concurrent flush cannot recreate a
//! key between the delete and the eviction.

use crate::cache::CounterCache;
use crate::enablement::{abandon, admin_step};
use std::sync::Arc;
use std::time::Duration;
use tally_core::{ActorId, CounterFilter, ResourceId, TallyResult, TenantId};
use tally_storage::ResilientStore;
use tokio::sync::Mutex;
use tracing::info;

pub struct CounterReset {
    store: Arc<ResilientStore>,
    cache: Arc<CounterCache>,
    write_gate: Arc<Mutex<()>>,
    step_timeout: Duration,
}

impl CounterReset {
    pub(crate) fn new(
        store: Arc<ResilientStore>,
        cache: Arc<CounterCache>,
        write_gate: Arc<Mutex<()>>,
        step_timeout: Duration,
    ) -> Self {
        Self {
            store,
            cache,
            write_gate,
            step_timeout,
        }
    }

    /// Returns true when at least one counter was removed.
    pub async fn reset(
        &self,
        tenant: TenantId,
        actor: Option<ActorId>,
        resource: Option<ResourceId>,
    ) -> TallyResult<bool> {
        let mut filter = CounterFilter::tenant(tenant);
        if let Some(actor) = actor {
            filter = filter.with_actor(actor);
        }
        if let Some(resource) = resource {
            filter = filter.with_resource(resource);
        }

        let _gate = self.write_gate.lock().await;
        let mut tx = admin_step(self.step_timeout, self.store.inner().begin()).await?;

        let removed = match admin_step(self.step_timeout, tx.delete_counters(&filter)).await {
            Ok(keys) => keys,
            Err(e) => {
                abandon(tx, self.step_timeout).await;
                return Err(e);
            }
        };
        if removed.is_empty() {
            abandon(tx, self.step_timeout).await;
            return Ok(false);
        }

        admin_step(self.step_timeout, tx.commit()).await?;
        for key in &removed {
            self.cache.invalidate(key);
        }

        info!(
            "Reset {} counters for tenant {} (actor={:?}, resource={:?})",
            removed.len(),
            tenant,
            actor,
            resource
        );
        Ok(true)
    }
}
