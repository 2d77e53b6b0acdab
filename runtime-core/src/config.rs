// runtime-core/src/config.rs

//! Configuration management for the control plane.
//!
//! This module provides configuration parsing from TOML files, environment
//! variable overrides, and validation of configuration values.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::dfg::MfcDef;
use crate::error::{Result, RuntimeError};
use crate::transport::{Handler, ShardId};

// Top-level runtime configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub experiment: ExperimentConfig,
    pub transport: TransportConfig,
    pub name_resolve: NameResolveConfig,
    pub executor: ExecutorConfig,
    pub graph: GraphConfig,
}

// Experiment identity, used to namespace every rendezvous key.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExperimentConfig {
    pub experiment_name: String,
    pub trial_name: String,
}

/// Transport endpoint tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Address to bind and publish. Resolved from the hostname when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bind_host: Option<String>,
    /// How long a worker waits for the coordinator's addresses.
    pub peer_wait_timeout_secs: u64,
    /// Interval between checks of the worker join barrier.
    pub barrier_poll_interval_ms: u64,
    /// Keepalive TTL of a worker's barrier marker.
    pub barrier_ttl_secs: u64,
    /// First backoff delay of a blocking poll.
    pub poll_initial_backoff_ms: u64,
    /// Backoff cap of a blocking poll.
    pub poll_max_backoff_ms: u64,
    /// Yield interval of async polls.
    pub async_poll_interval_ms: u64,
    /// Largest accepted frame body.
    pub max_frame_bytes: usize,
}

/// Naming service backend type.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NameResolveBackend {
    /// In-process map. Only usable when every endpoint lives in one process.
    #[default]
    Memory,
    /// Directory tree on a local or shared filesystem.
    File,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NameResolveConfig {
    pub backend: NameResolveBackend,
    // Root directory of the file backend.
    pub root: PathBuf,
}

// Graph executor options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    // Capacity of the sequence buffer, in samples.
    pub buffer_max_size: usize,
    // Whether to shuffle each loaded batch across data ranks.
    pub shuffle_dataset: bool,
    // Optional seed for reproducible shuffling.
    pub seed: Option<u64>,
    // Pause after a fetch round that returned no data.
    pub load_retry_interval_ms: u64,
}

/// Placement of one model shard on a worker process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardPlacement {
    pub model_name: String,
    #[serde(default)]
    pub dp_rank: u32,
    #[serde(default)]
    pub tp_rank: u32,
    #[serde(default)]
    pub pp_rank: u32,
    pub worker: usize,
}

impl ShardPlacement {
    pub fn shard_id(&self) -> ShardId {
        ShardId::new(self.model_name.clone(), self.dp_rank, self.tp_rank, self.pp_rank)
    }
}

/// Static description of the dataflow graph and its placement.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GraphConfig {
    /// Worker index hosting each data-source rank (`__data{i}__`).
    pub data_workers: Vec<usize>,
    pub mfcs: Vec<MfcDef>,
    pub shards: Vec<ShardPlacement>,
}

impl GraphConfig {
    /// Number of distinct worker processes referenced by the placement.
    pub fn n_workers(&self) -> usize {
        self.shards
            .iter()
            .map(|s| s.worker)
            .chain(self.data_workers.iter().copied())
            .max()
            .map_or(0, |max| max + 1)
    }

    /// Routing table of the coordinator endpoint: every shard and every
    /// data-source handler mapped to its worker.
    pub fn routing(&self) -> HashMap<Handler, usize> {
        self.shards
            .iter()
            .map(|s| (Handler::Shard(s.shard_id()), s.worker))
            .chain(
                self.data_workers
                    .iter()
                    .enumerate()
                    .map(|(dp_rank, &worker)| (Handler::data(dp_rank), worker)),
            )
            .collect()
    }
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        Self {
            experiment_name: "default-experiment".to_string(),
            trial_name: "default-trial".to_string(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            bind_host: None,
            peer_wait_timeout_secs: 300,
            barrier_poll_interval_ms: 100,
            barrier_ttl_secs: 1200,
            poll_initial_backoff_ms: 1,
            poll_max_backoff_ms: 50,
            async_poll_interval_ms: 10,
            max_frame_bytes: 256 * 1024 * 1024, // 256 MB
        }
    }
}

impl TransportConfig {
    pub fn peer_wait_timeout(&self) -> Duration {
        Duration::from_secs(self.peer_wait_timeout_secs)
    }

    pub fn barrier_poll_interval(&self) -> Duration {
        Duration::from_millis(self.barrier_poll_interval_ms)
    }

    pub fn barrier_ttl(&self) -> Duration {
        Duration::from_secs(self.barrier_ttl_secs)
    }

    pub fn async_poll_interval(&self) -> Duration {
        Duration::from_millis(self.async_poll_interval_ms)
    }
}

impl Default for NameResolveConfig {
    fn default() -> Self {
        Self {
            backend: NameResolveBackend::Memory,
            root: std::env::temp_dir().join("dtr-name-resolve"),
        }
    }
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            buffer_max_size: 1024,
            shuffle_dataset: false,
            seed: None,
            load_retry_interval_ms: 1000,
        }
    }
}

impl ExecutorConfig {
    pub fn load_retry_interval(&self) -> Duration {
        Duration::from_millis(self.load_retry_interval_ms)
    }
}

impl FromStr for RuntimeConfig {
    type Err = RuntimeError;

    /// Parse configuration from a TOML string.
    fn from_str(s: &str) -> Result<Self> {
        toml::from_str(s)
            .map_err(|e| RuntimeError::config_with_source("failed to parse TOML config", e))
    }
}

impl RuntimeConfig {
    // Load configuration from a TOML file.
    //
    // # Errors
    //
    // Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            RuntimeError::config_with_source(
                format!("failed to read config file '{}'", path.display()),
                e,
            )
        })?;
        let config: Self = content.parse()?;
        config.validate()?;
        Ok(config)
    }

    // Apply environment variable overrides.
    //
    // Environment variables are prefixed with `DTR_` and use underscores
    // to separate nested fields. For example:
    // - `DTR_EXPERIMENT_NAME` overrides `experiment.experiment_name`
    // - `DTR_TRANSPORT_BIND_HOST` overrides `transport.bind_host`
    // - `DTR_NAME_RESOLVE_BACKEND` overrides `name_resolve.backend`
    // - `DTR_EXECUTOR_SHUFFLE_DATASET` overrides `executor.shuffle_dataset`
    #[must_use]
    pub fn with_env_overrides(mut self) -> Self {
        // Experiment overrides
        if let Ok(val) = std::env::var("DTR_EXPERIMENT_NAME") {
            self.experiment.experiment_name = val;
        }
        if let Ok(val) = std::env::var("DTR_TRIAL_NAME") {
            self.experiment.trial_name = val;
        }

        // Transport overrides
        if let Ok(val) = std::env::var("DTR_TRANSPORT_BIND_HOST") {
            self.transport.bind_host = Some(val);
        }
        if let Ok(val) = std::env::var("DTR_TRANSPORT_PEER_WAIT_TIMEOUT_SECS") {
            if let Ok(v) = val.parse() {
                self.transport.peer_wait_timeout_secs = v;
            }
        }
        if let Ok(val) = std::env::var("DTR_TRANSPORT_BARRIER_POLL_INTERVAL_MS") {
            if let Ok(v) = val.parse() {
                self.transport.barrier_poll_interval_ms = v;
            }
        }
        if let Ok(val) = std::env::var("DTR_TRANSPORT_MAX_FRAME_BYTES") {
            if let Ok(v) = val.parse() {
                self.transport.max_frame_bytes = v;
            }
        }

        // Name resolve overrides
        if let Ok(val) = std::env::var("DTR_NAME_RESOLVE_BACKEND") {
            match val.to_lowercase().as_str() {
                "memory" => self.name_resolve.backend = NameResolveBackend::Memory,
                "file" => self.name_resolve.backend = NameResolveBackend::File,
                _ => {} // ignore invalid values
            }
        }
        if let Ok(val) = std::env::var("DTR_NAME_RESOLVE_ROOT") {
            self.name_resolve.root = PathBuf::from(val);
        }

        // Executor overrides
        if let Ok(val) = std::env::var("DTR_EXECUTOR_BUFFER_MAX_SIZE") {
            if let Ok(v) = val.parse() {
                self.executor.buffer_max_size = v;
            }
        }
        if let Ok(val) = std::env::var("DTR_EXECUTOR_SHUFFLE_DATASET") {
            if let Ok(v) = val.parse() {
                self.executor.shuffle_dataset = v;
            }
        }
        if let Ok(val) = std::env::var("DTR_EXECUTOR_SEED") {
            if let Ok(v) = val.parse() {
                self.executor.seed = Some(v);
            }
        }

        self
    }

    // Validate all configuration values.
    //
    // # Errors
    //
    // Returns an error if any configuration value is invalid.
    pub fn validate(&self) -> Result<()> {
        if self.experiment.experiment_name.is_empty() || self.experiment.trial_name.is_empty() {
            return Err(RuntimeError::config(
                "experiment.experiment_name and experiment.trial_name must not be empty",
            ));
        }
        if self.experiment.experiment_name.contains('/') || self.experiment.trial_name.contains('/') {
            return Err(RuntimeError::config(
                "experiment and trial names must not contain '/'",
            ));
        }

        // Transport validation
        if self.transport.peer_wait_timeout_secs == 0 {
            return Err(RuntimeError::config(
                "transport.peer_wait_timeout_secs must be greater than 0",
            ));
        }
        if self.transport.barrier_poll_interval_ms == 0 {
            return Err(RuntimeError::config(
                "transport.barrier_poll_interval_ms must be greater than 0",
            ));
        }
        if self.transport.poll_initial_backoff_ms > self.transport.poll_max_backoff_ms {
            return Err(RuntimeError::config(
                "transport.poll_initial_backoff_ms must not exceed transport.poll_max_backoff_ms",
            ));
        }
        if self.transport.max_frame_bytes == 0 {
            return Err(RuntimeError::config(
                "transport.max_frame_bytes must be greater than 0",
            ));
        }
        // Frame lengths travel as u32
        if self.transport.max_frame_bytes > u32::MAX as usize {
            return Err(RuntimeError::config(format!(
                "transport.max_frame_bytes must not exceed {}",
                u32::MAX
            )));
        }

        // Executor validation
        if self.executor.buffer_max_size == 0 {
            return Err(RuntimeError::config(
                "executor.buffer_max_size must be greater than 0",
            ));
        }
        if let Some(max_seqs) = self.graph.mfcs.iter().map(|m| m.n_seqs).max() {
            if max_seqs > self.executor.buffer_max_size {
                return Err(RuntimeError::config(format!(
                    "executor.buffer_max_size ({}) is smaller than the largest n_seqs ({})",
                    self.executor.buffer_max_size, max_seqs
                )));
            }
        }

        // Graph placement validation
        let mut seen = std::collections::HashSet::new();
        for shard in &self.graph.shards {
            if !seen.insert(shard.shard_id()) {
                return Err(RuntimeError::config(format!(
                    "shard {} is placed more than once",
                    shard.shard_id()
                )));
            }
        }
        if !self.graph.mfcs.is_empty() && self.graph.data_workers.is_empty() {
            return Err(RuntimeError::config(
                "graph.data_workers must name at least one data-source worker",
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = RuntimeConfig::default();

        assert_eq!(config.experiment.experiment_name, "default-experiment");
        assert_eq!(config.transport.peer_wait_timeout_secs, 300);
        assert_eq!(config.transport.barrier_poll_interval_ms, 100);
        assert_eq!(config.transport.barrier_ttl_secs, 1200);
        assert_eq!(config.transport.poll_max_backoff_ms, 50);
        assert!(config.transport.bind_host.is_none());
        assert_eq!(config.name_resolve.backend, NameResolveBackend::Memory);
        assert_eq!(config.executor.buffer_max_size, 1024);
        assert!(!config.executor.shuffle_dataset);
        assert!(config.graph.mfcs.is_empty());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_str_empty() {
        let config: RuntimeConfig = "".parse().unwrap();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_str_graph() {
        let toml = r#"
            [experiment]
            experiment_name = "ppo"
            trial_name = "run1"

            [executor]
            buffer_max_size = 64
            shuffle_dataset = true
            seed = 7

            [graph]
            data_workers = [0, 1]

            [[graph.mfcs]]
            name = "actor_gen"
            model_name = "actor"
            interface = "generate"
            input_keys = ["prompts"]
            output_keys = ["seqs"]
            n_seqs = 8

            [[graph.mfcs]]
            name = "actor_train"
            model_name = "actor"
            interface = "train_step"
            input_keys = ["seqs"]
            n_seqs = 8

            [[graph.shards]]
            model_name = "actor"
            dp_rank = 0
            worker = 0

            [[graph.shards]]
            model_name = "actor"
            dp_rank = 1
            worker = 1
        "#;
        let config: RuntimeConfig = toml.parse().unwrap();

        assert_eq!(config.experiment.trial_name, "run1");
        assert_eq!(config.executor.seed, Some(7));
        assert_eq!(config.graph.mfcs.len(), 2);
        assert!(config.graph.mfcs[1].output_keys.is_empty());
        assert_eq!(config.graph.shards[1].shard_id(), ShardId::new("actor", 1, 0, 0));
        assert_eq!(config.graph.n_workers(), 2);

        let routing = config.graph.routing();
        assert_eq!(routing.len(), 4);
        assert_eq!(routing[&Handler::Shard(ShardId::new("actor", 1, 0, 0))], 1);
        assert_eq!(routing[&Handler::data(1)], 1);
        // Transport section falls back to defaults
        assert_eq!(config.transport.peer_wait_timeout_secs, 300);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_str_invalid_toml() {
        let result: std::result::Result<RuntimeConfig, _> = "invalid = [".parse();
        assert!(result.is_err());
    }

    #[test]
    fn test_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
            [name_resolve]
            backend = "file"
            root = "/tmp/dtr-test"
            "#
        )
        .unwrap();

        let config = RuntimeConfig::from_file(file.path()).unwrap();
        assert_eq!(config.name_resolve.backend, NameResolveBackend::File);
        assert_eq!(config.name_resolve.root, PathBuf::from("/tmp/dtr-test"));
    }

    #[test]
    fn test_from_file_not_found() {
        let result = RuntimeConfig::from_file("/nonexistent/config.toml");
        assert!(matches!(result, Err(RuntimeError::Config { .. })));
    }

    #[test]
    fn test_validate_buffer_smaller_than_n_seqs() {
        let mut config = RuntimeConfig::default();
        config.executor.buffer_max_size = 4;
        config.graph.data_workers = vec![0];
        config.graph.mfcs.push(MfcDef::new("train", "actor", "train_step", 8));
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("largest n_seqs"));
    }

    #[test]
    fn test_validate_duplicate_shard() {
        let mut config = RuntimeConfig::default();
        let shard = ShardPlacement {
            model_name: "actor".to_string(),
            dp_rank: 0,
            tp_rank: 0,
            pp_rank: 0,
            worker: 0,
        };
        config.graph.shards = vec![shard.clone(), ShardPlacement { worker: 1, ..shard }];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_bad_backoff() {
        let mut config = RuntimeConfig::default();
        config.transport.poll_initial_backoff_ms = 100;
        config.transport.poll_max_backoff_ms = 10;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_frame_limit_fits_length_prefix() {
        let mut config = RuntimeConfig::default();
        config.transport.max_frame_bytes = u32::MAX as usize;
        assert!(config.validate().is_ok());

        config.transport.max_frame_bytes = u32::MAX as usize + 1;
        assert!(matches!(config.validate(), Err(RuntimeError::Config { .. })));
    }

    #[test]
    fn test_validate_slash_in_names() {
        let mut config = RuntimeConfig::default();
        config.experiment.trial_name = "a/b".to_string();
        assert!(config.validate().is_err());
    }

    // Helper to clear all DTR_ environment variables for test isolation
    fn clear_dtr_env_vars() {
        for (key, _) in std::env::vars() {
            if key.starts_with("DTR_") {
                std::env::remove_var(&key);
            }
        }
    }

    // Environment variable tests are combined into a single test since env
    // vars are process-global.
    #[test]
    fn test_env_overrides() {
        clear_dtr_env_vars();

        std::env::set_var("DTR_EXPERIMENT_NAME", "env-exp");
        std::env::set_var("DTR_TRANSPORT_BIND_HOST", "10.0.0.5");
        std::env::set_var("DTR_NAME_RESOLVE_BACKEND", "FILE");
        std::env::set_var("DTR_EXECUTOR_SHUFFLE_DATASET", "true");
        std::env::set_var("DTR_EXECUTOR_SEED", "12345");

        let config = RuntimeConfig::default().with_env_overrides();

        assert_eq!(config.experiment.experiment_name, "env-exp");
        assert_eq!(config.transport.bind_host.as_deref(), Some("10.0.0.5"));
        assert_eq!(config.name_resolve.backend, NameResolveBackend::File);
        assert!(config.executor.shuffle_dataset);
        assert_eq!(config.executor.seed, Some(12345));

        clear_dtr_env_vars();

        // Invalid values are ignored
        std::env::set_var("DTR_EXECUTOR_BUFFER_MAX_SIZE", "not_a_number");
        let config = RuntimeConfig::default().with_env_overrides();
        assert_eq!(config.executor.buffer_max_size, 1024);

        clear_dtr_env_vars();
    }

    #[test]
    fn test_serialize_roundtrip() {
        let mut original = RuntimeConfig::default();
        original.graph.mfcs.push(MfcDef::new("gen", "actor", "generate", 4));
        let toml_str = toml::to_string(&original).unwrap();
        let parsed: RuntimeConfig = toml_str.parse().unwrap();

        assert_eq!(original.experiment.trial_name, parsed.experiment.trial_name);
        assert_eq!(original.transport.max_frame_bytes, parsed.transport.max_frame_bytes);
        assert_eq!(parsed.graph.mfcs[0].name, "gen");
    }
}
