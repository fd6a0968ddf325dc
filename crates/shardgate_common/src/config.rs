use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Top-level proxy core configuration (`shardgate.toml`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ShardgateConfig {
    #[serde(default)]
    pub merge: MergeConfig,
    #[serde(default)]
    pub xa: XaConfig,
    #[serde(default)]
    pub txn_log: TxnLogConfig,
    #[serde(default)]
    pub recovery: RecoveryConfig,
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

impl ShardgateConfig {
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(s).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let config = Self::from_toml_str(&content)?;
        tracing::info!("Loaded config from {}", path.display());
        Ok(config)
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.merge.queue_capacity == 0 {
            return Err(ConfigError::Parse("merge.queue_capacity must be at least 1".into()));
        }
        if self.xa.xid_prefix.is_empty() {
            return Err(ConfigError::Parse("xa.xid_prefix must not be empty".into()));
        }
        Ok(())
    }
}

/// What a merge session does when one of its sources reports an error.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Any source error fails the whole result.
    #[default]
    Strict,
    /// A failed source is treated as exhausted; the session only fails when
    /// every source has failed.
    BestEffort,
}

/// Result merge configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MergeConfig {
    /// Capacity of each per-source row queue (default: 1024).
    pub queue_capacity: usize,
    /// Source failure handling (default: strict).
    pub failure_policy: FailurePolicy,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1024,
            failure_policy: FailurePolicy::Strict,
        }
    }
}

/// XA coordinator configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct XaConfig {
    /// Prefix of generated xids.
    pub xid_prefix: String,
    /// Park before re-checking an "unknown XID" answer against XA RECOVER (default: 1000).
    pub nota_recheck_delay_ms: u64,
    /// Rollback retry rounds before the transaction is left to the recovery sweeper.
    pub rollback_retry_limit: u32,
    /// Commit retry rounds before the transaction is left to the recovery sweeper.
    pub commit_retry_limit: u32,
    /// Backoff between retry rounds.
    pub retry_backoff_ms: u64,
    /// Drop committed/rolled-back transactions from the arena and the log as
    /// soon as they settle (default: true).
    pub purge_settled: bool,
}

impl Default for XaConfig {
    fn default() -> Self {
        Self {
            xid_prefix: "shardgate".into(),
            nota_recheck_delay_ms: 1000,
            rollback_retry_limit: 3,
            commit_retry_limit: 3,
            retry_backoff_ms: 1000,
            purge_settled: true,
        }
    }
}

impl XaConfig {
    pub fn nota_recheck_delay(&self) -> Duration {
        Duration::from_millis(self.nota_recheck_delay_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

/// Durability of transaction log writes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncMode {
    /// Flush to the OS only. Not crash-safe; tests and benchmarks.
    None,
    Fsync,
    #[default]
    Fdatasync,
}

/// Transaction log configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TxnLogConfig {
    /// Directory holding the log file.
    pub dir: String,
    pub sync_mode: SyncMode,
    /// Superseded records tolerated before the file is compacted (default: 4096).
    pub compact_threshold_records: usize,
}

impl Default for TxnLogConfig {
    fn default() -> Self {
        Self {
            dir: "./shardgate_data/xalog".into(),
            sync_mode: SyncMode::Fdatasync,
            compact_threshold_records: 4096,
        }
    }
}

/// Background recovery sweeper configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    /// Interval between sweeps in milliseconds (default: 5000).
    pub sweep_interval_ms: u64,
    /// Sweeps per transaction before it is left for an operator (default: 10).
    pub max_sweep_attempts: u32,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            sweep_interval_ms: 5000,
            max_sweep_attempts: 10,
        }
    }
}

/// Logging and metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Tracing filter used when `RUST_LOG` is unset.
    pub log_filter: String,
    /// Prometheus listen address; no exporter when unset.
    pub metrics_listen_addr: Option<String>,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_filter: "info,shardgate=debug".into(),
            metrics_listen_addr: None,
        }
    }
}
