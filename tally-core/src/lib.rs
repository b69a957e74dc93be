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

//! Tally Core
//!
//! Domain types, error taxonomy and resilience primitives shared by the
//! storage layer and the counting pipeline.

pub mod error;
pub mod model;
pub mod resilience;

pub use error::{StorageError, StorageResult, TallyError, TallyResult};
pub use model::{
    ActivityEvent, ActorId, AggregateCounter, CounterDelta, CounterFilter, CounterId, CounterKey,
    CounterWithEvents, DayCount, EventId, EventRecord, FlushBatch, HourCount, NewEventRecord,
    PendingEvent, QueryScope, ResourceId, TenantId, TenantPolicy,
};
pub use resilience::{
    AttemptError, CircuitBreaker, CircuitConfig, CircuitState, ResilienceConfig, ResilienceError,
    ResiliencePipeline, RetryPolicy, Transient,
};
