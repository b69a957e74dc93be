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

//! Batch aggregator
//!
//! Single consumer of the write-behind queue. Each flush cycle drains up to
//! `batch_size` events, groups them by counter key and persists the summed
//! increments together with the raw event rows in one storage commit. The
//! cache is refreshed with the post-increment counters while the write gate
//! is still held.
//!
//! A cycle that fails after exhausting the resilience policies is logged
//! with its keys and dropped; the loop moves on to the next cycle.

use crate::cache::CounterCache;
use crate::queue::QueueReceiver;
use serde::{Deserialize, Serialize};
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tally_core::{CounterDelta, CounterKey, FlushBatch, PendingEvent};
use tally_storage::ResilientStore;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Pipeline statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineStats {
    pub total_accepted: u64,
    pub total_filtered: u64,
    pub total_rejected: u64,
    pub total_flush_cycles: u64,
    pub total_flushed_events: u64,
    pub total_failed_flushes: u64,
    pub total_dropped_events: u64,
    /// Accepted events not yet flushed or dropped
    pub pending: u64,
    pub avg_batch_size: f64,
    pub avg_flush_latency_ms: f64,
    pub throughput: f64,
}

#[derive(Debug)]
pub(crate) struct PipelineCounters {
    pub(crate) accepted: AtomicU64,
    pub(crate) filtered: AtomicU64,
    pub(crate) rejected: AtomicU64,
    flush_cycles: AtomicU64,
    flushed_events: AtomicU64,
    failed_flushes: AtomicU64,
    dropped_events: AtomicU64,
    total_latency_ns: AtomicU64,
    start_time: Instant,
}

impl PipelineCounters {
    pub(crate) fn new() -> Self {
        Self {
            accepted: AtomicU64::new(0),
            filtered: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            flush_cycles: AtomicU64::new(0),
            flushed_events: AtomicU64::new(0),
            failed_flushes: AtomicU64::new(0),
            dropped_events: AtomicU64::new(0),
            total_latency_ns: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    pub(crate) fn snapshot(&self) -> PipelineStats {
        let elapsed = self.start_time.elapsed().as_secs_f64();
        let accepted = self.accepted.load(Ordering::Relaxed);
        let cycles = self.flush_cycles.load(Ordering::Relaxed);
        let failed = self.failed_flushes.load(Ordering::Relaxed);
        let flushed = self.flushed_events.load(Ordering::Relaxed);
        let dropped = self.dropped_events.load(Ordering::Relaxed);
        let latency = self.total_latency_ns.load(Ordering::Relaxed);
        let attempted = cycles + failed;

        PipelineStats {
            total_accepted: accepted,
            total_filtered: self.filtered.load(Ordering::Relaxed),
            total_rejected: self.rejected.load(Ordering::Relaxed),
            total_flush_cycles: cycles,
            total_flushed_events: flushed,
            total_failed_flushes: failed,
            total_dropped_events: dropped,
            pending: accepted.saturating_sub(flushed + dropped),
            avg_batch_size: if cycles > 0 {
                flushed as f64 / cycles as f64
            } else {
                0.0
            },
            avg_flush_latency_ms: if attempted > 0 {
                (latency as f64 / attempted as f64) / 1_000_000.0
            } else {
                0.0
            },
            throughput: if elapsed > 0.0 {
                flushed as f64 / elapsed
            } else {
                0.0
            },
        }
    }
}

/// Group drained events into one increment per key. Deltas keep the order
/// in which each key first appeared; events keep arrival order.
pub fn group_batch(events: Vec<PendingEvent>) -> FlushBatch {
    let mut index: HashMap<CounterKey, usize> = HashMap::new();
    let mut deltas: Vec<CounterDelta> = Vec::new();

    for event in &events {
        match index.entry(event.key) {
            Entry::Occupied(slot) => deltas[*slot.get()].delta += 1,
            Entry::Vacant(slot) => {
                slot.insert(deltas.len());
                deltas.push(CounterDelta {
                    key: event.key,
                    delta: 1,
                });
            }
        }
    }

    FlushBatch { deltas, events }
}

/// The consumer task
pub struct BatchAggregator {
    receiver: QueueReceiver,
    store: Arc<ResilientStore>,
    cache: Arc<CounterCache>,
    write_gate: Arc<Mutex<()>>,
    batch_size: usize,
    stats: Arc<PipelineCounters>,
}

impl BatchAggregator {
    pub(crate) fn new(
        receiver: QueueReceiver,
        store: Arc<ResilientStore>,
        cache: Arc<CounterCache>,
        write_gate: Arc<Mutex<()>>,
        batch_size: usize,
        stats: Arc<PipelineCounters>,
    ) -> Self {
        Self {
            receiver,
            store,
            cache,
            write_gate,
            batch_size: batch_size.max(1),
            stats,
        }
    }

    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    /// Main consumer loop. On cancellation the queue is closed and whatever
    /// was already accepted is flushed before returning.
    pub async fn run(mut self, shutdown: CancellationToken) {
        info!("Batch aggregator started with batch_size={}", self.batch_size);

        let mut buffer: Vec<PendingEvent> = Vec::with_capacity(self.batch_size);

        loop {
            let received = tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    info!("Batch aggregator received shutdown signal");
                    break;
                }
                n = self.receiver.recv_batch(&mut buffer, self.batch_size) => n,
            };

            if received == 0 {
                info!("Write-behind queue closed");
                break;
            }

            self.flush(&mut buffer).await;
        }

        self.receiver.close();
        let mut drained = 0usize;
        loop {
            if buffer.is_empty()
                && self.receiver.recv_batch(&mut buffer, self.batch_size).await == 0
            {
                break;
            }
            drained += buffer.len();
            self.flush(&mut buffer).await;
        }

        info!("Batch aggregator stopped, drained {} events on shutdown", drained);
    }

    async fn flush(&self, buffer: &mut Vec<PendingEvent>) {
        let events = std::mem::replace(buffer, Vec::with_capacity(self.batch_size));
        let batch_size = events.len();
        if batch_size == 0 {
            return;
        }
        let batch = group_batch(events);
        let start = Instant::now();

        let _gate = self.write_gate.lock().await;
        match self.store.commit_flush(&batch).await {
            Ok(counters) => {
                for counter in counters {
                    self.cache.refresh(counter);
                }
                let latency = start.elapsed();
                self.stats.flush_cycles.fetch_add(1, Ordering::Relaxed);
                self.stats
                    .flushed_events
                    .fetch_add(batch_size as u64, Ordering::Relaxed);
                self.stats
                    .total_latency_ns
                    .fetch_add(latency.as_nanos() as u64, Ordering::Relaxed);
                debug!(
                    "Flushed {} events across {} counters in {:?}",
                    batch_size,
                    batch.deltas.len(),
                    latency
                );
            }
            Err(e) => {
                let keys: Vec<String> = batch.keys().map(|k| k.to_string()).collect();
                self.stats.failed_flushes.fetch_add(1, Ordering::Relaxed);
                self.stats
                    .dropped_events
                    .fetch_add(batch_size as u64, Ordering::Relaxed);
                self.stats
                    .total_latency_ns
                    .fetch_add(start.elapsed().as_nanos() as u64, Ordering::Relaxed);
                error!(
                    batch_size,
                    keys = ?keys,
                    error = %e,
                    "Flush cycle failed, dropping batch"
                );
            }
        }
    }
}
