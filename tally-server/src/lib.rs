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

//! Tally Server
//!
//! Event counting pipeline: events pass a synchronous tenant filter, wait in
//! a write-behind queue, and are persisted in grouped batches by a single
//! consumer through the resilient store. Reads go through a sliding-TTL
//! cache.

pub mod aggregator;
pub mod cache;
pub mod config;
pub mod enablement;
pub mod filter;
pub mod query;
pub mod queue;
pub mod reset;
pub mod service;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

pub use aggregator::{group_batch, PipelineStats};
pub use cache::{CacheStats, CounterCache};
pub use config::TallyConfig;
pub use filter::{IngestionFilter, TenantRegistry};
pub use service::{CountingService, IngestOutcome};

/// Install the global tracing subscriber. `RUST_LOG` overrides the default
/// filter.
pub fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tally_server=info,tally_storage=info,tally_core=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}
