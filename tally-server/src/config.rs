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
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tally_core::{CircuitConfig, ResilienceConfig, RetryPolicy};

/// Counting pipeline configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct TallyConfig {
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub resilience: ResilienceSettings,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub admin: AdminConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PipelineConfig {
    /// Maximum events drained per flush cycle
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Write-behind queue capacity. Unbounded when absent; when set, events
    /// arriving at a full queue are rejected instead of waiting.
    #[serde(default)]
    pub queue_capacity: Option<usize>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ResilienceSettings {
    /// Hard ceiling per storage attempt
    #[serde(default = "default_attempt_timeout_ms")]
    pub attempt_timeout_ms: u64,

    /// Attempts per storage call including the first
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Retry n waits base * 2^n
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,

    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,

    /// Random spread applied to each delay (0.1 = +/-10%)
    #[serde(default)]
    pub retry_jitter: f64,

    /// Consecutive failures that open the circuit
    #[serde(default = "default_breaker_failure_threshold")]
    pub breaker_failure_threshold: u32,

    #[serde(default = "default_breaker_cooldown_ms")]
    pub breaker_cooldown_ms: u64,

    #[serde(default = "default_bulkhead_max_concurrent")]
    pub bulkhead_max_concurrent: usize,

    #[serde(default = "default_bulkhead_max_queued")]
    pub bulkhead_max_queued: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CacheConfig {
    /// Sliding expiration for cached counters
    #[serde(default = "default_cache_ttl_secs")]
    pub ttl_secs: u64,

    #[serde(default = "default_cache_max_entries")]
    pub max_entries: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AdminConfig {
    /// Ceiling on each step of an admin transaction
    #[serde(default = "default_transaction_timeout_ms")]
    pub transaction_timeout_ms: u64,
}

// Default values
fn default_batch_size() -> usize {
    100
}

fn default_attempt_timeout_ms() -> u64 {
    30_000
}

fn default_max_attempts() -> u32 {
    3
}

fn default_retry_base_delay_ms() -> u64 {
    1_000
}

fn default_retry_max_delay_ms() -> u64 {
    60_000
}

fn default_breaker_failure_threshold() -> u32 {
    10
}

fn default_breaker_cooldown_ms() -> u64 {
    30_000
}

fn default_bulkhead_max_concurrent() -> usize {
    100
}

fn default_bulkhead_max_queued() -> usize {
    500
}

fn default_cache_ttl_secs() -> u64 {
    30 * 60
}

fn default_cache_max_entries() -> u64 {
    100_000
}

fn default_transaction_timeout_ms() -> u64 {
    30_000
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            queue_capacity: None,
        }
    }
}

impl Default for ResilienceSettings {
    fn default() -> Self {
        Self {
            attempt_timeout_ms: default_attempt_timeout_ms(),
            max_attempts: default_max_attempts(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
            retry_jitter: 0.0,
            breaker_failure_threshold: default_breaker_failure_threshold(),
            breaker_cooldown_ms: default_breaker_cooldown_ms(),
            bulkhead_max_concurrent: default_bulkhead_max_concurrent(),
            bulkhead_max_queued: default_bulkhead_max_queued(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_cache_ttl_secs(),
            max_entries: default_cache_max_entries(),
        }
    }
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            transaction_timeout_ms: default_transaction_timeout_ms(),
        }
    }
}

impl ResilienceSettings {
    pub fn to_resilience_config(&self) -> ResilienceConfig {
        ResilienceConfig {
            retry: RetryPolicy {
                max_attempts: self.max_attempts,
                base_delay: Duration::from_millis(self.retry_base_delay_ms),
                max_delay: Duration::from_millis(self.retry_max_delay_ms),
                multiplier: 2.0,
                jitter: self.retry_jitter,
            },
            circuit: CircuitConfig {
                failure_threshold: self.breaker_failure_threshold,
                open_duration: Duration::from_millis(self.breaker_cooldown_ms),
            },
            attempt_timeout: Duration::from_millis(self.attempt_timeout_ms),
            bulkhead_max_concurrent: self.bulkhead_max_concurrent,
            bulkhead_max_queued: self.bulkhead_max_queued,
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

impl AdminConfig {
    pub fn transaction_timeout(&self) -> Duration {
        Duration::from_millis(self.transaction_timeout_ms)
    }
}

impl TallyConfig {
    /// Load configuration from TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    /// Load configuration from environment variables
    ///
    /// Supported environment variables:
    /// - TALLY_BATCH_SIZE: Events per flush cycle (default: 100)
    /// - TALLY_QUEUE_CAPACITY: Bound the write-behind queue (default: unbounded)
    /// - TALLY_CACHE_TTL_SECS: Sliding cache expiration (default: 1800)
    /// - TALLY_MAX_ATTEMPTS: Storage attempts per call (default: 3)
    /// - TALLY_BREAKER_THRESHOLD: Failures before the circuit opens (default: 10)
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env();
        config
    }

    /// Load configuration with priority: env > file > defaults.
    ///
    /// Environment overrides are applied on top of the file contents.
    pub fn load(config_file: Option<PathBuf>) -> Result<Self> {
        let mut config = if let Some(path) = config_file {
            if path.exists() {
                tracing::info!("Loading configuration from file: {:?}", path);
                Self::from_file(&path)?
            } else {
                tracing::warn!("Config file not found: {:?}, using defaults", path);
                Self::default()
            }
        } else {
            Self::default()
        };

        config.apply_env();
        Ok(config)
    }

    fn apply_env(&mut self) {
        if let Some(val) = env_parse("TALLY_BATCH_SIZE") {
            self.pipeline.batch_size = val;
        }
        if let Some(val) = env_parse("TALLY_QUEUE_CAPACITY") {
            self.pipeline.queue_capacity = Some(val);
        }
        if let Some(val) = env_parse("TALLY_CACHE_TTL_SECS") {
            self.cache.ttl_secs = val;
        }
        if let Some(val) = env_parse("TALLY_MAX_ATTEMPTS") {
            self.resilience.max_attempts = val;
        }
        if let Some(val) = env_parse("TALLY_BREAKER_THRESHOLD") {
            self.resilience.breaker_failure_threshold = val;
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.pipeline.batch_size == 0 {
            anyhow::bail!("pipeline.batch_size must be greater than zero");
        }
        if self.pipeline.queue_capacity == Some(0) {
            anyhow::bail!("pipeline.queue_capacity must be greater than zero when set");
        }
        if self.resilience.max_attempts == 0 {
            anyhow::bail!("resilience.max_attempts must be at least 1");
        }
        if self.resilience.breaker_failure_threshold == 0 {
            anyhow::bail!("resilience.breaker_failure_threshold must be at least 1");
        }
        if self.resilience.bulkhead_max_concurrent == 0 {
            anyhow::bail!("resilience.bulkhead_max_concurrent must be at least 1");
        }
        if !(0.0..=1.0).contains(&self.resilience.retry_jitter) {
            anyhow::bail!("resilience.retry_jitter must be between 0.0 and 1.0");
        }
        if self.cache.ttl_secs == 0 {
            anyhow::bail!("cache.ttl_secs must be greater than zero");
        }
        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    let raw = std::env::var(name).ok()?;
    match raw.parse() {
        Ok(val) => Some(val),
        Err(_) => {
            tracing::warn!("Ignoring unparsable {}={:?}", name, raw);
            None
        }
    }
}
