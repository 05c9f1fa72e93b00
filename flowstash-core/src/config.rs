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

//! Configuration for the write engine
//!
//! Every section deserializes from TOML with per-field defaults, so a config
//! file only needs the keys it wants to change. Durations are stored as
//! millisecond integers and exposed through `Duration` accessors.

use crate::error::{FlowstashError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Parameter ceiling assumed when the engine does not report one.
pub const DEFAULT_PARAM_LIMIT: usize = 999;

/// Top-level engine configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub stream: StreamBufferConfig,
    #[serde(default)]
    pub insert: InsertBatchConfig,
    #[serde(default)]
    pub index: IndexConfig,
}

/// Which SQL dialect the writer speaks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DialectKind {
    /// Single-file embedded engine with multi-row inserts.
    #[default]
    Embedded,
    /// Networked server fallback: CONCAT appends, row-at-a-time inserts.
    Networked,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageConfig {
    /// Database file
    #[serde(default = "default_db_path")]
    pub path: PathBuf,

    #[serde(default)]
    pub dialect: DialectKind,

    /// Capacity of the shared work queue in front of the writer thread
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// How long the writer waits on a locked database before failing
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,

    /// Override for the bind-parameter ceiling. None = ask the engine.
    #[serde(default)]
    pub param_limit: Option<usize>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StreamBufferConfig {
    /// When false every fragment is written straight through
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Flush once a stream has been quiet this long
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,

    /// Flush a continuously written stream at least this often
    #[serde(default = "default_max_flush_delay_ms")]
    pub max_flush_delay_ms: u64,

    #[serde(default = "default_stream_tick_ms")]
    pub tick_ms: u64,

    /// Empty entries idle this long are evicted
    #[serde(default = "default_idle_ttl_ms")]
    pub idle_ttl_ms: u64,

    /// Pending bytes above which an append flushes inline
    #[serde(default = "default_max_pending_bytes")]
    pub max_pending_bytes: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct InsertBatchConfig {
    #[serde(default = "default_max_batch_rows")]
    pub max_batch_rows: usize,

    #[serde(default = "default_max_wait_ms")]
    pub max_wait_ms: u64,

    /// Submissions beyond this go straight to the work queue
    #[serde(default = "default_insert_channel_capacity")]
    pub channel_capacity: usize,

    /// Attempts for a batch that hits a locked database
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct IndexConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// FTS5 tokenizer for the shadow table
    #[serde(default = "default_tokenizer")]
    pub tokenizer: String,

    #[serde(default = "default_index_batch_size")]
    pub batch_size: usize,

    #[serde(default = "default_index_batch_interval_ms")]
    pub batch_interval_ms: u64,

    #[serde(default = "default_index_channel_capacity")]
    pub channel_capacity: usize,

    /// Work queue depth above which index jobs are deferred.
    /// None = 75% of the queue capacity.
    #[serde(default)]
    pub defer_threshold: Option<usize>,

    #[serde(default = "default_deferred_cap")]
    pub deferred_cap: usize,

    /// Deferred ids moved back per drain tick
    #[serde(default = "default_drain_batch")]
    pub drain_batch: usize,

    #[serde(default = "default_drain_interval_ms")]
    pub drain_interval_ms: u64,

    /// Batches slower than this log payload diagnostics
    #[serde(default = "default_slow_apply_ms")]
    pub slow_apply_ms: u64,
}

// Default values
fn default_true() -> bool {
    true
}

fn default_db_path() -> PathBuf {
    PathBuf::from("./flowstash.db")
}

fn default_queue_capacity() -> usize {
    4096
}

fn default_busy_timeout_ms() -> u64 {
    5000
}

fn default_flush_interval_ms() -> u64 {
    300
}

fn default_max_flush_delay_ms() -> u64 {
    2000
}

fn default_stream_tick_ms() -> u64 {
    100
}

fn default_idle_ttl_ms() -> u64 {
    30_000
}

fn default_max_pending_bytes() -> usize {
    64 * 1024
}

fn default_max_batch_rows() -> usize {
    256
}

fn default_max_wait_ms() -> u64 {
    50
}

fn default_insert_channel_capacity() -> usize {
    4096
}

fn default_max_retries() -> u32 {
    3
}

fn default_tokenizer() -> String {
    "trigram".to_string()
}

fn default_index_batch_size() -> usize {
    256
}

fn default_index_batch_interval_ms() -> u64 {
    200
}

fn default_index_channel_capacity() -> usize {
    8192
}

fn default_deferred_cap() -> usize {
    100_000
}

fn default_drain_batch() -> usize {
    512
}

fn default_drain_interval_ms() -> u64 {
    1000
}

fn default_slow_apply_ms() -> u64 {
    500
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            dialect: DialectKind::default(),
            queue_capacity: default_queue_capacity(),
            busy_timeout_ms: default_busy_timeout_ms(),
            param_limit: None,
        }
    }
}

impl Default for StreamBufferConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            flush_interval_ms: default_flush_interval_ms(),
            max_flush_delay_ms: default_max_flush_delay_ms(),
            tick_ms: default_stream_tick_ms(),
            idle_ttl_ms: default_idle_ttl_ms(),
            max_pending_bytes: default_max_pending_bytes(),
        }
    }
}

impl Default for InsertBatchConfig {
    fn default() -> Self {
        Self {
            max_batch_rows: default_max_batch_rows(),
            max_wait_ms: default_max_wait_ms(),
            channel_capacity: default_insert_channel_capacity(),
            max_retries: default_max_retries(),
        }
    }
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            tokenizer: default_tokenizer(),
            batch_size: default_index_batch_size(),
            batch_interval_ms: default_index_batch_interval_ms(),
            channel_capacity: default_index_channel_capacity(),
            defer_threshold: None,
            deferred_cap: default_deferred_cap(),
            drain_batch: default_drain_batch(),
            drain_interval_ms: default_drain_interval_ms(),
            slow_apply_ms: default_slow_apply_ms(),
        }
    }
}

impl StorageConfig {
    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}

impl StreamBufferConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    pub fn max_flush_delay(&self) -> Duration {
        Duration::from_millis(self.max_flush_delay_ms)
    }

    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms.max(1))
    }

    pub fn idle_ttl(&self) -> Duration {
        Duration::from_millis(self.idle_ttl_ms)
    }
}

impl InsertBatchConfig {
    pub fn max_wait(&self) -> Duration {
        Duration::from_millis(self.max_wait_ms)
    }
}

impl IndexConfig {
    pub fn batch_interval(&self) -> Duration {
        Duration::from_millis(self.batch_interval_ms.max(1))
    }

    pub fn drain_interval(&self) -> Duration {
        Duration::from_millis(self.drain_interval_ms.max(1))
    }

    pub fn slow_apply(&self) -> Duration {
        Duration::from_millis(self.slow_apply_ms)
    }

    /// Queue depth at which index jobs start being deferred.
    pub fn effective_defer_threshold(&self, queue_capacity: usize) -> usize {
        self.defer_threshold
            .unwrap_or_else(|| queue_capacity.saturating_mul(3) / 4)
    }
}

impl EngineConfig {
    /// Config for an in-memory database, mostly useful in tests.
    pub fn in_memory() -> Self {
        let mut config = Self::default();
        config.storage.path = PathBuf::from(":memory:");
        config
    }

    /// Tight timings so background loops fire quickly.
    pub fn fast() -> Self {
        let mut config = Self::default();
        config.stream.flush_interval_ms = 20;
        config.stream.max_flush_delay_ms = 200;
        config.stream.tick_ms = 10;
        config.stream.idle_ttl_ms = 100;
        config.insert.max_wait_ms = 10;
        config.index.batch_interval_ms = 10;
        config.index.drain_interval_ms = 20;
        config
    }

    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.storage.path = path.into();
        self
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(content).map_err(|e| FlowstashError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        tracing::info!("Loading engine configuration from {:?}", path);
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| FlowstashError::Config(e.to_string()))
    }

    /// Apply `FLOWSTASH_*` environment overrides on top of this config.
    ///
    /// - FLOWSTASH_DB_PATH: database file
    /// - FLOWSTASH_QUEUE_CAPACITY: work queue capacity
    /// - FLOWSTASH_BUSY_TIMEOUT_MS: busy timeout
    /// - FLOWSTASH_INDEX_ENABLED: enable the full-text shadow table
    pub fn merge_env(mut self) -> Self {
        if let Ok(path) = std::env::var("FLOWSTASH_DB_PATH") {
            self.storage.path = PathBuf::from(path);
        }
        if let Ok(cap) = std::env::var("FLOWSTASH_QUEUE_CAPACITY") {
            if let Ok(val) = cap.parse() {
                self.storage.queue_capacity = val;
            }
        }
        if let Ok(ms) = std::env::var("FLOWSTASH_BUSY_TIMEOUT_MS") {
            if let Ok(val) = ms.parse() {
                self.storage.busy_timeout_ms = val;
            }
        }
        if let Ok(enabled) = std::env::var("FLOWSTASH_INDEX_ENABLED") {
            self.index.enabled = enabled.parse().unwrap_or(true);
        }
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.storage.queue_capacity == 0 {
            return Err(FlowstashError::Config(
                "storage.queue_capacity must be greater than 0".into(),
            ));
        }
        if self.insert.max_batch_rows == 0 || self.insert.channel_capacity == 0 {
            return Err(FlowstashError::Config(
                "insert.max_batch_rows and insert.channel_capacity must be greater than 0".into(),
            ));
        }
        if self.index.batch_size == 0 || self.index.channel_capacity == 0 {
            return Err(FlowstashError::Config(
                "index.batch_size and index.channel_capacity must be greater than 0".into(),
            ));
        }
        if self.stream.max_flush_delay_ms < self.stream.flush_interval_ms {
            return Err(FlowstashError::Config(format!(
                "stream.max_flush_delay_ms ({}) must be >= stream.flush_interval_ms ({})",
                self.stream.max_flush_delay_ms, self.stream.flush_interval_ms
            )));
        }
        if let Some(0) = self.storage.param_limit {
            return Err(FlowstashError::Config(
                "storage.param_limit must be greater than 0".into(),
            ));
        }
        if self.index.tokenizer.trim().is_empty() {
            return Err(FlowstashError::Config("index.tokenizer must not be empty".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = EngineConfig::default();
        assert_eq!(config.storage.queue_capacity, 4096);
        assert_eq!(config.storage.busy_timeout(), Duration::from_secs(5));
        assert_eq!(config.stream.flush_interval(), Duration::from_millis(300));
        assert_eq!(config.stream.max_pending_bytes, 65536);
        assert_eq!(config.insert.max_batch_rows, 256);
        assert_eq!(config.index.tokenizer, "trigram");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = EngineConfig::from_toml_str(
            r#"
            [storage]
            path = "/tmp/flows.db"
            param_limit = 32

            [stream]
            flush_interval_ms = 50
            "#,
        )
        .unwrap();
        assert_eq!(config.storage.path, PathBuf::from("/tmp/flows.db"));
        assert_eq!(config.storage.param_limit, Some(32));
        assert_eq!(config.storage.queue_capacity, 4096);
        assert_eq!(config.stream.flush_interval_ms, 50);
        assert_eq!(config.stream.max_flush_delay_ms, 2000);
        assert_eq!(config.storage.dialect, DialectKind::Embedded);
    }

    #[test]
    fn test_dialect_from_toml() {
        let config = EngineConfig::from_toml_str("[storage]\ndialect = \"networked\"\n").unwrap();
        assert_eq!(config.storage.dialect, DialectKind::Networked);
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = EngineConfig::default();
        config.storage.queue_capacity = 0;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.stream.max_flush_delay_ms = 10;
        assert!(config.validate().is_err());

        assert!(EngineConfig::from_toml_str("[storage]\nqueue_capacity = \"many\"").is_err());
    }

    #[test]
    fn test_defer_threshold_defaults_to_three_quarters() {
        let config = IndexConfig::default();
        assert_eq!(config.effective_defer_threshold(4096), 3072);

        let config = IndexConfig {
            defer_threshold: Some(10),
            ..IndexConfig::default()
        };
        assert_eq!(config.effective_defer_threshold(4096), 10);
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("flowstash.toml");
        std::fs::write(&path, EngineConfig::fast().to_toml_string().unwrap()).unwrap();

        let loaded = EngineConfig::load(&path).unwrap();
        assert_eq!(loaded.stream.tick_ms, 10);
    }
}
