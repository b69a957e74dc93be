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

//! Bulkhead isolation for calls into a shared backend.

use thiserror::Error;
use tokio::sync::{Semaphore, SemaphorePermit};

#[derive(Debug, Error)]
#[error("Bulkhead {name} rejected request: {max_concurrent} in flight and queue full")]
pub struct BulkheadRejected {
    pub name: String,
    pub max_concurrent: usize,
}

/// Caps concurrent in-flight calls and the number of callers allowed to wait
/// for a slot. Callers beyond both limits are rejected immediately.
pub struct Bulkhead {
    name: String,
    max_concurrent: usize,
    slots: Semaphore,
    admission: Semaphore,
}

/// Held for the duration of a call.
pub struct BulkheadPermit<'a> {
    _slot: SemaphorePermit<'a>,
    _admission: SemaphorePermit<'a>,
}

impl Bulkhead {
    pub fn new(name: impl Into<String>, max_concurrent: usize, max_queued: usize) -> Self {
        Self {
            name: name.into(),
            max_concurrent,
            slots: Semaphore::new(max_concurrent),
            admission: Semaphore::new(max_concurrent + max_queued),
        }
    }

    pub async fn acquire(&self) -> Result<BulkheadPermit<'_>, BulkheadRejected> {
        let admission = self.admission.try_acquire().map_err(|_| self.rejected())?;
        let slot = self.slots.acquire().await.map_err(|_| self.rejected())?;
        Ok(BulkheadPermit {
            _slot: slot,
            _admission: admission,
        })
    }

    /// Free execution slots.
    pub fn available(&self) -> usize {
        self.slots.available_permits()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn rejected(&self) -> BulkheadRejected {
        BulkheadRejected {
            name: self.name.clone(),
            max_concurrent: self.max_concurrent,
        }
    }
}
