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

use anyhow::Result;
use clap::Parser;
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use tally_core::{ActivityEvent, QueryScope, TenantId};
use tally_server::{init_tracing, CountingService, IngestOutcome, TallyConfig};
use tally_storage::{CounterStore, MemoryStore};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};

/// Replay newline-delimited JSON activity events through the counting
/// pipeline and print per-tenant totals.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Events file, one JSON object per line (reads stdin when omitted)
    #[arg(short, long)]
    input: Option<PathBuf>,

    /// Tenants to enable before replaying
    #[arg(long = "enable", value_delimiter = ',')]
    enable: Vec<u64>,

    /// Events per flush cycle (overrides config file)
    #[arg(long, env = "TALLY_BATCH_SIZE")]
    batch_size: Option<usize>,

    /// Bound the write-behind queue (overrides config file)
    #[arg(long, env = "TALLY_QUEUE_CAPACITY")]
    queue_capacity: Option<usize>,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();

    let mut config = TallyConfig::load(args.config)?;
    if let Some(batch_size) = args.batch_size {
        config.pipeline.batch_size = batch_size;
    }
    if let Some(capacity) = args.queue_capacity {
        config.pipeline.queue_capacity = Some(capacity);
    }
    config.validate()?;

    let store: Arc<dyn CounterStore> = Arc::new(MemoryStore::new());
    let service = CountingService::start(config, store).await?;

    for tenant in args.enable.iter().copied().map(TenantId) {
        if !service.is_enabled(tenant) {
            service.toggle_tenant(tenant).await?;
        }
    }

    let reader: Box<dyn AsyncBufRead + Unpin + Send> = match &args.input {
        Some(path) => Box::new(BufReader::new(tokio::fs::File::open(path).await?)),
        None => Box::new(BufReader::new(tokio::io::stdin())),
    };

    let mut tenants = BTreeSet::new();
    let mut lines = reader.lines();
    let mut line_no = 0usize;
    while let Some(line) = lines.next_line().await? {
        line_no += 1;
        if line.trim().is_empty() {
            continue;
        }
        let event: ActivityEvent = match serde_json::from_str(&line) {
            Ok(event) => event,
            Err(e) => {
                tracing::warn!("Skipping malformed event on line {}: {}", line_no, e);
                continue;
            }
        };
        tenants.insert(event.tenant);
        if service.record_event(event) == IngestOutcome::Closed {
            break;
        }
    }

    service.shutdown().await;

    let mut totals = serde_json::Map::new();
    for tenant in tenants {
        let count = service.get_count(QueryScope::Tenant, tenant, tenant.0).await?;
        totals.insert(tenant.to_string(), serde_json::json!(count));
    }

    let report = serde_json::json!({
        "totals": totals,
        "pipeline": service.stats(),
        "cache": service.cache_stats(),
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
