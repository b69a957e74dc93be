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

//! Domain model for the counting pipeline.
//!
//! Counters are keyed by `(tenant, resource, actor)`. Event rows point at
//! their owning counter through a numeric [`CounterId`] instead of holding a
//! reference to it, so the two tables stay independent arenas.

use chrono::{DateTime, Utc, Weekday};
use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub u64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<u64> for $name {
            fn from(value: u64) -> Self {
                Self(value)
            }
        }
    };
}

id_type!(
    /// Top-level scope under which counting is enabled or disabled.
    TenantId
);
id_type!(
    /// Sub-scope inside a tenant where events happen.
    ResourceId
);
id_type!(
    /// Originator of a countable event.
    ActorId
);
id_type!(
    /// Generated primary key of an aggregate counter row.
    CounterId
);
id_type!(
    /// Generated primary key of an event row.
    EventId
);

/// Composite identity of an aggregate counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CounterKey {
    pub tenant: TenantId,
    pub resource: ResourceId,
    pub actor: ActorId,
}

impl CounterKey {
    pub fn new(
        tenant: impl Into<TenantId>,
        resource: impl Into<ResourceId>,
        actor: impl Into<ActorId>,
    ) -> Self {
        Self {
            tenant: tenant.into(),
            resource: resource.into(),
            actor: actor.into(),
        }
    }
}

impl fmt::Display for CounterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.tenant, self.resource, self.actor)
    }
}

/// Durable running total for one key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateCounter {
    pub id: CounterId,
    pub key: CounterKey,
    pub count: u64,
}

/// Immutable, append-only record of one accepted event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventRecord {
    pub id: EventId,
    pub counter_id: CounterId,
    pub key: CounterKey,
    pub occurred_at: DateTime<Utc>,
}

/// Event row ready for bulk insert; the store assigns the [`EventId`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewEventRecord {
    pub counter_id: CounterId,
    pub key: CounterKey,
    pub occurred_at: DateTime<Utc>,
}

/// A qualifying event sitting in the write-behind queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingEvent {
    pub key: CounterKey,
    pub occurred_at: DateTime<Utc>,
}

/// Raw activity notification handed to the pipeline by an event source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityEvent {
    pub tenant: TenantId,
    pub resource: ResourceId,
    pub actor: ActorId,
    /// Size metric of the unit of work (content length for messages).
    #[serde(default)]
    pub size: usize,
    pub occurred_at: DateTime<Utc>,
}

impl ActivityEvent {
    pub fn new(
        tenant: impl Into<TenantId>,
        resource: impl Into<ResourceId>,
        actor: impl Into<ActorId>,
        occurred_at: DateTime<Utc>,
    ) -> Self {
        Self {
            tenant: tenant.into(),
            resource: resource.into(),
            actor: actor.into(),
            size: 0,
            occurred_at,
        }
    }

    pub fn with_size(mut self, size: usize) -> Self {
        self.size = size;
        self
    }

    pub fn key(&self) -> CounterKey {
        CounterKey {
            tenant: self.tenant,
            resource: self.resource,
            actor: self.actor,
        }
    }

    pub fn pending(&self) -> PendingEvent {
        PendingEvent {
            key: self.key(),
            occurred_at: self.occurred_at,
        }
    }
}

/// Persisted per-tenant configuration. Source of truth for the filter mirror.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantPolicy {
    pub tenant: TenantId,
    pub enabled: bool,
    /// Minimum qualifying size; smaller units of work are not counted.
    pub min_size: usize,
}

impl TenantPolicy {
    /// Policy assumed for a tenant that has never been configured.
    pub fn disabled(tenant: TenantId) -> Self {
        Self {
            tenant,
            enabled: false,
            min_size: 0,
        }
    }
}

/// Granularity of a count query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryScope {
    Tenant,
    Resource,
    Actor,
}

/// Row selector over the counter table. Always bound to one tenant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterFilter {
    pub tenant: TenantId,
    pub resource: Option<ResourceId>,
    pub actor: Option<ActorId>,
}

impl CounterFilter {
    pub fn tenant(tenant: TenantId) -> Self {
        Self {
            tenant,
            resource: None,
            actor: None,
        }
    }

    /// Build the filter for a scoped query. For [`QueryScope::Tenant`] the
    /// scope id is the tenant itself and is ignored.
    pub fn for_scope(scope: QueryScope, tenant: TenantId, scope_id: u64) -> Self {
        let filter = Self::tenant(tenant);
        match scope {
            QueryScope::Tenant => filter,
            QueryScope::Resource => filter.with_resource(ResourceId(scope_id)),
            QueryScope::Actor => filter.with_actor(ActorId(scope_id)),
        }
    }

    pub fn with_resource(mut self, resource: ResourceId) -> Self {
        self.resource = Some(resource);
        self
    }

    pub fn with_actor(mut self, actor: ActorId) -> Self {
        self.actor = Some(actor);
        self
    }

    pub fn matches(&self, key: &CounterKey) -> bool {
        key.tenant == self.tenant
            && self.resource.map_or(true, |r| r == key.resource)
            && self.actor.map_or(true, |a| a == key.actor)
    }
}

/// Summed increment for one key within a flush cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterDelta {
    pub key: CounterKey,
    pub delta: u64,
}

/// Everything one flush cycle writes: grouped increments plus the raw events
/// in arrival order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlushBatch {
    pub deltas: Vec<CounterDelta>,
    pub events: Vec<PendingEvent>,
}

impl FlushBatch {
    pub fn is_empty(&self) -> bool {
        self.deltas.is_empty() && self.events.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &CounterKey> + '_ {
        self.deltas.iter().map(|d| &d.key)
    }
}

/// A counter together with the event rows that reference it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterWithEvents {
    pub counter: AggregateCounter,
    pub events: Vec<EventRecord>,
}

/// Event volume for one hour of the day (0-23, UTC).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HourCount {
    pub hour: u32,
    pub count: u64,
}

/// Event volume for one day of the week (UTC).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DayCount {
    pub day: Weekday,
    pub count: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_for_scope() {
        let key = CounterKey::new(1, 2, 3);

        assert!(CounterFilter::for_scope(QueryScope::Tenant, TenantId(1), 99).matches(&key));
        assert!(CounterFilter::for_scope(QueryScope::Resource, TenantId(1), 2).matches(&key));
        assert!(!CounterFilter::for_scope(QueryScope::Resource, TenantId(1), 3).matches(&key));
        assert!(CounterFilter::for_scope(QueryScope::Actor, TenantId(1), 3).matches(&key));
        assert!(!CounterFilter::for_scope(QueryScope::Actor, TenantId(2), 3).matches(&key));
    }

    #[test]
    fn test_filter_combined() {
        let filter = CounterFilter::tenant(TenantId(1))
            .with_resource(ResourceId(2))
            .with_actor(ActorId(3));

        assert!(filter.matches(&CounterKey::new(1, 2, 3)));
        assert!(!filter.matches(&CounterKey::new(1, 2, 4)));
        assert!(!filter.matches(&CounterKey::new(1, 5, 3)));
    }

    #[test]
    fn test_activity_event_key() {
        let event = ActivityEvent::new(7, 8, 9, Utc::now()).with_size(42);
        assert_eq!(event.key(), CounterKey::new(7, 8, 9));
        assert_eq!(event.size, 42);
        assert_eq!(event.pending().key, event.key());
    }

    #[test]
    fn test_ids_serialize_transparently() {
        let json = serde_json::to_string(&CounterKey::new(1, 2, 3)).unwrap();
        assert_eq!(json, r#"{"tenant":1,"resource":2,"actor":3}"#);
    }
}
