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

//! Count queries
//!
//! Read side of the pipeline. Keyed lookups go through the cache and fall
//! back to the store; scoped sums and analytics read the store directly.
//!
//! A cache miss reads the store and populates the cache under the write
//! gate, so it can never install a value older than a concurrent flush or
//! resurrect a counter a concurrent reset has deleted.

use crate::cache::CounterCache;
use chrono::{DateTime, Datelike, Duration as ChronoDuration, Timelike, Utc, Weekday};
use std::collections::HashMap;
use std::sync::Arc;
use tally_core::{
    AggregateCounter, CounterFilter, CounterId, CounterKey, CounterWithEvents, DayCount,
    EventRecord, HourCount, QueryScope, TallyResult, TenantId,
};
use tally_storage::ResilientStore;
use tokio::sync::Mutex;
use tracing::debug;

pub struct CountQueries {
    store: Arc<ResilientStore>,
    cache: Arc<CounterCache>,
    write_gate: Arc<Mutex<()>>,
}

impl CountQueries {
    pub(crate) fn new(
        store: Arc<ResilientStore>,
        cache: Arc<CounterCache>,
        write_gate: Arc<Mutex<()>>,
    ) -> Self {
        Self {
            store,
            cache,
            write_gate,
        }
    }

    /// Cache first, then the store; a stored counter is put in the cache.
    pub async fn counter(&self, key: &CounterKey) -> TallyResult<Option<AggregateCounter>> {
        if let Some(counter) = self.cache.get(key) {
            return Ok(Some(counter));
        }

        debug!("Cache miss for counter {}", key);
        let _gate = self.write_gate.lock().await;
        let counter = self.store.read(key).await?;
        if let Some(counter) = &counter {
            self.cache.refresh(counter.clone());
        }
        Ok(counter)
    }

    /// Summed count over every counter in scope. Unknown scopes give 0.
    pub async fn count(&self, scope: QueryScope, tenant: TenantId, scope_id: u64) -> TallyResult<u64> {
        let filter = CounterFilter::for_scope(scope, tenant, scope_id);
        Ok(self.store.sum_counts(&filter).await?)
    }

    /// Counters in scope, each with the event rows that reference it.
    pub async fn all_for_entity(
        &self,
        scope: QueryScope,
        scope_id: u64,
        tenant: TenantId,
    ) -> TallyResult<Vec<CounterWithEvents>> {
        let filter = CounterFilter::for_scope(scope, tenant, scope_id);
        let mut counters = self.store.counters(&filter).await?;
        if counters.is_empty() {
            return Ok(Vec::new());
        }
        counters.sort_by_key(|c| c.id);

        let ids: Vec<CounterId> = counters.iter().map(|c| c.id).collect();
        let mut by_counter: HashMap<CounterId, Vec<EventRecord>> = HashMap::new();
        for event in self.store.events_for(&ids).await? {
            by_counter.entry(event.counter_id).or_default().push(event);
        }

        Ok(counters
            .into_iter()
            .map(|counter| {
                let mut events = by_counter.remove(&counter.id).unwrap_or_default();
                events.sort_by_key(|e| e.id);
                CounterWithEvents { counter, events }
            })
            .collect())
    }

    /// Event volume per UTC hour of day over the last `days` days.
    pub async fn busiest_hours(&self, tenant: TenantId, days: u32) -> TallyResult<Vec<HourCount>> {
        let since = window_start(Utc::now(), ChronoDuration::try_days(i64::from(days)));
        let times = self.store.event_times(tenant, since).await?;
        Ok(bucket_by_hour(&times))
    }

    /// Event volume per UTC weekday over the last `weeks` weeks.
    pub async fn busiest_days(&self, tenant: TenantId, weeks: u32) -> TallyResult<Vec<DayCount>> {
        let since = window_start(Utc::now(), ChronoDuration::try_weeks(i64::from(weeks)));
        let times = self.store.event_times(tenant, since).await?;
        Ok(bucket_by_weekday(&times))
    }
}

/// Start of a look-back window. A window reaching past the representable
/// range covers every event.
pub fn window_start(now: DateTime<Utc>, span: Option<ChronoDuration>) -> DateTime<Utc> {
    span.and_then(|span| now.checked_sub_signed(span))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Busiest first; equal counts in hour order. Empty hours are omitted.
pub fn bucket_by_hour(times: &[DateTime<Utc>]) -> Vec<HourCount> {
    let mut buckets = [0u64; 24];
    for time in times {
        buckets[time.hour() as usize] += 1;
    }

    let mut hours: Vec<HourCount> = buckets
        .iter()
        .enumerate()
        .filter(|(_, &count)| count > 0)
        .map(|(hour, &count)| HourCount {
            hour: hour as u32,
            count,
        })
        .collect();
    hours.sort_by(|a, b| b.count.cmp(&a.count).then(a.hour.cmp(&b.hour)));
    hours
}

/// Busiest first; equal counts Monday first. Empty days are omitted.
pub fn bucket_by_weekday(times: &[DateTime<Utc>]) -> Vec<DayCount> {
    let mut buckets = [0u64; 7];
    for time in times {
        buckets[time.weekday().num_days_from_monday() as usize] += 1;
    }

    let mut days: Vec<(usize, u64)> = buckets
        .iter()
        .copied()
        .enumerate()
        .filter(|&(_, count)| count > 0)
        .collect();
    days.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
    days.into_iter()
        .map(|(index, count)| DayCount {
            day: weekday_from_monday(index),
            count,
        })
        .collect()
}

fn weekday_from_monday(index: usize) -> Weekday {
    match index {
        0 => Weekday::Mon,
        1 => Weekday::Tue,
        2 => Weekday::Wed,
        3 => Weekday::Thu,
        4 => Weekday::Fri,
        5 => Weekday::Sat,
        _ => Weekday::Sun,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::time::Duration;
    use tally_core::{CounterDelta, FlushBatch, PendingEvent, ResilienceConfig};
    use tally_storage::{CounterStore, MemoryStore};

    fn at(day: u32, hour: u32) -> DateTime<Utc> {
        // 2024-01-01 was a Monday
        Utc.with_ymd_and_hms(2024, 1, day, hour, 15, 0).unwrap()
    }

    fn queries(memory: &MemoryStore) -> (CountQueries, Arc<CounterCache>) {
        let cache = Arc::new(CounterCache::new(Duration::from_secs(60), 100));
        let store = Arc::new(ResilientStore::new(
            Arc::new(memory.clone()),
            ResilienceConfig::default(),
        ));
        (
            CountQueries::new(store, cache.clone(), Arc::new(Mutex::new(()))),
            cache,
        )
    }

    async fn record(memory: &MemoryStore, key: CounterKey, times: &[DateTime<Utc>]) {
        let batch = FlushBatch {
            deltas: vec![CounterDelta {
                key,
                delta: times.len() as u64,
            }],
            events: times
                .iter()
                .map(|&occurred_at| PendingEvent { key, occurred_at })
                .collect(),
        };
        memory.commit_flush(&batch).await.unwrap();
    }

    #[test]
    fn test_bucket_by_hour_orders_busiest_first() {
        let times = vec![at(1, 9), at(2, 9), at(1, 14), at(3, 14), at(1, 3)];
        let hours = bucket_by_hour(&times);
        assert_eq!(
            hours,
            vec![
                HourCount { hour: 9, count: 2 },
                HourCount { hour: 14, count: 2 },
                HourCount { hour: 3, count: 1 },
            ]
        );
    }

    #[test]
    fn test_bucket_by_weekday() {
        let times = vec![at(3, 1), at(10, 1), at(1, 1), at(7, 1), at(14, 1)];
        let days = bucket_by_weekday(&times);
        assert_eq!(
            days,
            vec![
                DayCount {
                    day: Weekday::Wed,
                    count: 2
                },
                DayCount {
                    day: Weekday::Sun,
                    count: 2
                },
                DayCount {
                    day: Weekday::Mon,
                    count: 1
                },
            ]
        );
        assert!(bucket_by_weekday(&[]).is_empty());
    }

    #[test]
    fn test_window_start_saturates() {
        let now = at(10, 12);
        assert_eq!(window_start(now, ChronoDuration::try_days(0)), now);
        assert_eq!(
            window_start(now, ChronoDuration::try_days(2)),
            at(8, 12)
        );
        assert_eq!(
            window_start(now, ChronoDuration::try_weeks(i64::from(u32::MAX))),
            DateTime::<Utc>::MIN_UTC
        );
        assert_eq!(window_start(now, None), DateTime::<Utc>::MIN_UTC);
    }

    #[tokio::test]
    async fn test_counter_read_through_populates_cache() {
        let memory = MemoryStore::new();
        let key = CounterKey::new(1, 2, 3);
        record(&memory, key, &[Utc::now()]).await;
        let (queries, cache) = queries(&memory);

        assert!(cache.get(&key).is_none());
        let counter = queries.counter(&key).await.unwrap().unwrap();
        assert_eq!(counter.count, 1);
        assert!(cache.get(&key).is_some());

        let missing = CounterKey::new(1, 2, 4);
        assert!(queries.counter(&missing).await.unwrap().is_none());
        assert!(cache.get(&missing).is_none());
    }

    #[tokio::test]
    async fn test_scoped_counts() {
        let memory = MemoryStore::new();
        let now = Utc::now();
        record(&memory, CounterKey::new(1, 10, 100), &[now, now]).await;
        record(&memory, CounterKey::new(1, 10, 101), &[now]).await;
        record(&memory, CounterKey::new(1, 11, 100), &[now]).await;
        record(&memory, CounterKey::new(2, 10, 100), &[now]).await;
        let (queries, _) = queries(&memory);

        assert_eq!(queries.count(QueryScope::Tenant, TenantId(1), 1).await.unwrap(), 4);
        assert_eq!(queries.count(QueryScope::Resource, TenantId(1), 10).await.unwrap(), 3);
        assert_eq!(queries.count(QueryScope::Actor, TenantId(1), 100).await.unwrap(), 3);
        assert_eq!(queries.count(QueryScope::Actor, TenantId(1), 999).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_all_for_entity_attaches_events() {
        let memory = MemoryStore::new();
        let now = Utc::now();
        record(&memory, CounterKey::new(1, 10, 100), &[now, now]).await;
        record(&memory, CounterKey::new(1, 11, 100), &[now]).await;
        record(&memory, CounterKey::new(1, 11, 200), &[now]).await;
        let (queries, _) = queries(&memory);

        let entity = queries
            .all_for_entity(QueryScope::Actor, 100, TenantId(1))
            .await
            .unwrap();
        assert_eq!(entity.len(), 2);
        assert_eq!(entity[0].counter.count, 2);
        assert_eq!(entity[0].events.len(), 2);
        assert_eq!(entity[1].events.len(), 1);
        assert!(entity
            .iter()
            .flat_map(|c| c.events.iter().map(move |e| (c.counter.id, e.counter_id)))
            .all(|(owner, fk)| owner == fk));
    }

    #[tokio::test]
    async fn test_busiest_hours_respects_window() {
        let memory = MemoryStore::new();
        let now = Utc::now();
        let old = now - ChronoDuration::days(30);
        record(&memory, CounterKey::new(1, 1, 1), &[now, now, old]).await;
        let (queries, _) = queries(&memory);

        let hours = queries.busiest_hours(TenantId(1), 7).await.unwrap();
        assert_eq!(hours.len(), 1);
        assert_eq!(hours[0].count, 2);
        assert_eq!(hours[0].hour, now.hour());

        let days = queries.busiest_days(TenantId(1), 8).await.unwrap();
        assert_eq!(days.iter().map(|d| d.count).sum::<u64>(), 3);
    }

    #[tokio::test]
    async fn test_window_boundaries() {
        let memory = MemoryStore::new();
        let recent = Utc::now() - ChronoDuration::seconds(5);
        let ancient = Utc.with_ymd_and_hms(1970, 1, 1, 0, 0, 0).unwrap();
        record(&memory, CounterKey::new(1, 1, 1), &[recent, ancient]).await;
        let (queries, _) = queries(&memory);

        assert!(queries.busiest_hours(TenantId(1), 0).await.unwrap().is_empty());
        assert!(queries.busiest_days(TenantId(1), 0).await.unwrap().is_empty());

        let hours = queries.busiest_hours(TenantId(1), u32::MAX).await.unwrap();
        assert_eq!(hours.iter().map(|h| h.count).sum::<u64>(), 2);
        let days = queries.busiest_days(TenantId(1), u32::MAX).await.unwrap();
        assert_eq!(days.iter().map(|d| d.count).sum::<u64>(), 2);
    }
}
