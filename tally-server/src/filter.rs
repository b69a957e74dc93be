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

//! Ingestion filter
//!
//! Decides synchronously, on the caller's thread, whether an activity event
//! is counted. The decision reads only the in-memory tenant mirror; storage
//! is never touched on this path.

use dashmap::{DashMap, DashSet};
use std::sync::Arc;
use tally_core::TenantId;

/// In-memory mirror of the persisted tenant policies.
///
/// Written by the enablement controller, read concurrently by every event
/// source through [`IngestionFilter`].
#[derive(Debug, Default)]
pub struct TenantRegistry {
    enabled: DashSet<TenantId>,
    thresholds: DashMap<TenantId, usize>,
}

/// Mirror state of one tenant, captured so a failed admin transaction can
/// put it back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TenantMirror {
    pub enabled: bool,
    pub min_size: Option<usize>,
}

impl TenantRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enable(&self, tenant: TenantId, min_size: usize) {
        // Threshold first so a reader that sees the tenant enabled also sees
        // its minimum size.
        self.thresholds.insert(tenant, min_size);
        self.enabled.insert(tenant);
    }

    pub fn disable(&self, tenant: TenantId) {
        self.enabled.remove(&tenant);
        self.thresholds.remove(&tenant);
    }

    pub fn set_min_size(&self, tenant: TenantId, min_size: usize) {
        self.thresholds.insert(tenant, min_size);
    }

    pub fn is_enabled(&self, tenant: TenantId) -> bool {
        self.enabled.contains(&tenant)
    }

    pub fn min_size(&self, tenant: TenantId) -> Option<usize> {
        self.thresholds.get(&tenant).map(|entry| *entry.value())
    }

    pub fn snapshot(&self, tenant: TenantId) -> TenantMirror {
        TenantMirror {
            enabled: self.is_enabled(tenant),
            min_size: self.min_size(tenant),
        }
    }

    pub fn restore(&self, tenant: TenantId, mirror: TenantMirror) {
        match mirror.min_size {
            Some(min_size) => {
                self.thresholds.insert(tenant, min_size);
            }
            None => {
                self.thresholds.remove(&tenant);
            }
        }
        if mirror.enabled {
            self.enabled.insert(tenant);
        } else {
            self.enabled.remove(&tenant);
        }
    }

    pub fn enabled_tenants(&self) -> Vec<TenantId> {
        let mut tenants: Vec<TenantId> = self.enabled.iter().map(|t| *t).collect();
        tenants.sort();
        tenants
    }
}

/// Synchronous admission check for incoming events.
#[derive(Debug, Clone)]
pub struct IngestionFilter {
    registry: Arc<TenantRegistry>,
}

impl IngestionFilter {
    pub fn new(registry: Arc<TenantRegistry>) -> Self {
        Self { registry }
    }

    /// True when the tenant is enabled and the unit of work meets its
    /// minimum size.
    pub fn should_count(&self, tenant: TenantId, candidate_size: usize) -> bool {
        if !self.registry.is_enabled(tenant) {
            return false;
        }
        let min_size = self.registry.min_size(tenant).unwrap_or(0);
        candidate_size >= min_size
    }
}
