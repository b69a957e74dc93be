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

//! Write-behind queue
//!
//! Multi-producer, single-consumer FIFO between event sources and the batch
//! aggregator. Enqueueing never blocks and never touches storage.

use tally_core::PendingEvent;
use thiserror::Error;
use tokio::sync::mpsc;

/// Why an event could not be queued
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum EnqueueError {
    /// Bounded queue is at capacity
    #[error("Write-behind queue is full")]
    Full,

    /// Consumer has stopped accepting events
    #[error("Write-behind queue is closed")]
    Closed,
}

#[derive(Debug, Clone)]
enum SenderKind {
    Unbounded(mpsc::UnboundedSender<PendingEvent>),
    Bounded(mpsc::Sender<PendingEvent>),
}

#[derive(Debug)]
enum ReceiverKind {
    Unbounded(mpsc::UnboundedReceiver<PendingEvent>),
    Bounded(mpsc::Receiver<PendingEvent>),
}

/// Producer side. Cheap to clone; one per event source if desired.
#[derive(Debug, Clone)]
pub struct QueueSender {
    inner: SenderKind,
}

/// Consumer side, owned by the batch aggregator.
#[derive(Debug)]
pub struct QueueReceiver {
    inner: ReceiverKind,
}

/// Create a queue. `None` gives an unbounded queue.
pub fn write_behind_queue(capacity: Option<usize>) -> (QueueSender, QueueReceiver) {
    match capacity {
        Some(capacity) => {
            let (tx, rx) = mpsc::channel(capacity.max(1));
            (
                QueueSender {
                    inner: SenderKind::Bounded(tx),
                },
                QueueReceiver {
                    inner: ReceiverKind::Bounded(rx),
                },
            )
        }
        None => {
            let (tx, rx) = mpsc::unbounded_channel();
            (
                QueueSender {
                    inner: SenderKind::Unbounded(tx),
                },
                QueueReceiver {
                    inner: ReceiverKind::Unbounded(rx),
                },
            )
        }
    }
}

impl QueueSender {
    pub fn enqueue(&self, event: PendingEvent) -> Result<(), EnqueueError> {
        match &self.inner {
            SenderKind::Unbounded(tx) => tx.send(event).map_err(|_| EnqueueError::Closed),
            SenderKind::Bounded(tx) => tx.try_send(event).map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => EnqueueError::Full,
                mpsc::error::TrySendError::Closed(_) => EnqueueError::Closed,
            }),
        }
    }

    pub fn is_closed(&self) -> bool {
        match &self.inner {
            SenderKind::Unbounded(tx) => tx.is_closed(),
            SenderKind::Bounded(tx) => tx.is_closed(),
        }
    }
}

impl QueueReceiver {
    /// Wait for at least one event, then move up to `limit` queued events
    /// into `buffer` in FIFO order. Returns 0 once the queue is closed and
    /// drained. Cancel safe.
    pub async fn recv_batch(&mut self, buffer: &mut Vec<PendingEvent>, limit: usize) -> usize {
        match &mut self.inner {
            ReceiverKind::Unbounded(rx) => rx.recv_many(buffer, limit).await,
            ReceiverKind::Bounded(rx) => rx.recv_many(buffer, limit).await,
        }
    }

    /// Stop accepting new events. Already queued events stay receivable.
    pub fn close(&mut self) {
        match &mut self.inner {
            ReceiverKind::Unbounded(rx) => rx.close(),
            ReceiverKind::Bounded(rx) => rx.close(),
        }
    }

    pub fn len(&self) -> usize {
        match &self.inner {
            ReceiverKind::Unbounded(rx) => rx.len(),
            ReceiverKind::Bounded(rx) => rx.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
