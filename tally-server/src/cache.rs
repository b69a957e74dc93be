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

//! Read-through counter cache
//!
//! Holds recently used [`AggregateCounter`] values keyed by [`CounterKey`].
//! Every entry carries its own time-to-live which slides: each read or
//! write restarts the entry's expiry window. Expired entries behave as
//! absent.
//!
//! ## Configuration
//!
//! - TTL: 30 minutes sliding by default
//! - Max entries: 100,000

use moka::sync::Cache;
use moka::Expiry;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tally_core::{AggregateCounter, CounterKey, TenantId};

#[derive(Debug, Clone)]
struct CachedCounter {
    counter: AggregateCounter,
    ttl: Duration,
}

/// Expiry policy that restarts an entry's own TTL on create, read and update.
struct SlidingExpiry;

impl Expiry<CounterKey, CachedCounter> for SlidingExpiry {
    fn expire_after_create(
        &self,
        _key: &CounterKey,
        value: &CachedCounter,
        _created_at: Instant,
    ) -> Option<Duration> {
        Some(value.ttl)
    }

    fn expire_after_read(
        &self,
        _key: &CounterKey,
        value: &CachedCounter,
        _read_at: Instant,
        _duration_until_expiry: Option<Duration>,
        _last_modified_at: Instant,
    ) -> Option<Duration> {
        Some(value.ttl)
    }

    fn expire_after_update(
        &self,
        _key: &CounterKey,
        value: &CachedCounter,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        Some(value.ttl)
    }
}

/// Cache statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    pub entries: u64,
}

/// Sliding-expiration cache of aggregate counters
pub struct CounterCache {
    cache: Cache<CounterKey, CachedCounter>,
    default_ttl: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl CounterCache {
    pub fn new(default_ttl: Duration, max_entries: u64) -> Self {
        let cache = Cache::builder()
            .max_capacity(max_entries)
            .expire_after(SlidingExpiry)
            .build();

        Self {
            cache,
            default_ttl,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Look up a counter. A hit restarts the entry's TTL.
    pub fn get(&self, key: &CounterKey) -> Option<AggregateCounter> {
        match self.cache.get(key) {
            Some(entry) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry.counter)
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Insert or overwrite an entry with an explicit sliding TTL.
    pub fn set(&self, key: CounterKey, counter: AggregateCounter, ttl: Duration) {
        self.cache.insert(key, CachedCounter { counter, ttl });
    }

    /// Insert or overwrite an entry with the default TTL.
    pub fn refresh(&self, counter: AggregateCounter) {
        self.set(counter.key, counter, self.default_ttl);
    }

    pub fn invalidate(&self, key: &CounterKey) {
        self.cache.invalidate(key);
    }

    /// Evict every entry belonging to a tenant.
    pub fn invalidate_tenant(&self, tenant: TenantId) {
        let keys: Vec<CounterKey> = self
            .cache
            .iter()
            .filter(|(key, _)| key.tenant == tenant)
            .map(|(key, _)| *key)
            .collect();
        for key in &keys {
            self.cache.invalidate(key);
        }
    }

    pub fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;

        CacheStats {
            hits,
            misses,
            hit_rate: if total > 0 {
                hits as f64 / total as f64
            } else {
                0.0
            },
            entries: self.cache.entry_count(),
        }
    }
}
