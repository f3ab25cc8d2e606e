use std::env;
use std::fs;

use serde::{Deserialize, Serialize};

use crate::error::{GqdError, Result};

pub const ENV_CLUSTER_HOSTS: &str = "GQD_CLUSTER_HOSTS";
pub const ENV_WORKER_NUM: &str = "GQD_WORKER_NUM";
pub const ENV_BATCH_SIZE: &str = "GQD_BATCH_SIZE";
pub const ENV_MEMORY_LIMIT: &str = "GQD_MEMORY_LIMIT";
pub const ENV_OUTPUT_CAPACITY: &str = "GQD_OUTPUT_CAPACITY";
pub const ENV_TIME_LIMIT_MS: &str = "GQD_TIME_LIMIT_MS";
pub const ENV_JOB_NAME_PREFIX: &str = "GQD_JOB_NAME_PREFIX";
pub const ENV_SINK_BUFFER_FRAMES: &str = "GQD_SINK_BUFFER_FRAMES";
pub const ENV_SESSION_CONCURRENCY: &str = "GQD_SESSION_CONCURRENCY";

/// Cluster job parameters copied into every job descriptor.
///
/// Units of the limits are defined by the cluster protocol; the dispatcher
/// forwards them untouched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Comma-delimited worker endpoints. Its length is the server count.
    pub hosts: String,
    /// Workers per server.
    pub worker_num: u32,
    /// Records per output batch.
    pub batch_size: u32,
    /// Per-job memory limit.
    pub memory_limit: u64,
    /// Output batches buffered per channel.
    pub output_capacity: u32,
    /// Execution time limit enforced by the cluster, in milliseconds.
    pub time_limit_ms: u64,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            hosts: "localhost:1234".to_string(),
            worker_num: 2,
            batch_size: 1024,
            memory_limit: i32::MAX as u64,
            output_capacity: 16,
            time_limit_ms: 240_000,
        }
    }
}

impl ClusterConfig {
    /// Non-empty, trimmed host endpoints in configured order.
    pub fn host_list(&self) -> Vec<String> {
        self.hosts
            .split(',')
            .map(str::trim)
            .filter(|h| !h.is_empty())
            .map(str::to_string)
            .collect()
    }

    /// Number of configured servers.
    pub fn server_count(&self) -> usize {
        self.host_list().len()
    }

    /// Reject configurations that would yield an incomplete job descriptor.
    pub fn validate(&self) -> Result<()> {
        if self.server_count() == 0 {
            return Err(GqdError::InvalidConfig(
                "cluster host list is empty".to_string(),
            ));
        }
        let zero_fields = [
            ("worker_num", self.worker_num as u64),
            ("batch_size", self.batch_size as u64),
            ("memory_limit", self.memory_limit),
            ("output_capacity", self.output_capacity as u64),
            ("time_limit_ms", self.time_limit_ms),
        ];
        if let Some((name, _)) = zero_fields.iter().find(|(_, v)| *v == 0) {
            return Err(GqdError::InvalidConfig(format!("{name} must be > 0")));
        }
        Ok(())
    }
}

/// How many jobs one client session may have in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionConcurrency {
    /// Any number of concurrent jobs per session.
    #[default]
    Unbounded,
    /// At most one job per session; further dispatches are rejected until it terminates.
    SingleFlight,
}

impl SessionConcurrency {
    fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "unbounded" => Some(Self::Unbounded),
            "single_flight" | "single-flight" => Some(Self::SingleFlight),
            _ => None,
        }
    }
}

/// Dispatcher configuration snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    pub cluster: ClusterConfig,
    /// Job names are `<prefix>_<job id>`.
    pub job_name_prefix: String,
    /// Frames buffered between the stream pump and a result sink.
    pub sink_buffer_frames: usize,
    pub session_concurrency: SessionConcurrency,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            cluster: ClusterConfig::default(),
            job_name_prefix: "ir_plan".to_string(),
            sink_buffer_frames: 64,
            session_concurrency: SessionConcurrency::Unbounded,
        }
    }
}

impl DispatchConfig {
    /// Build from `GQD_*` environment variables, falling back to defaults for
    /// unset or unparsable values.
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            cluster: ClusterConfig {
                hosts: env_or_default(ENV_CLUSTER_HOSTS, &d.cluster.hosts),
                worker_num: env_parse_or_default(ENV_WORKER_NUM, d.cluster.worker_num),
                batch_size: env_parse_or_default(ENV_BATCH_SIZE, d.cluster.batch_size),
                memory_limit: env_parse_or_default(ENV_MEMORY_LIMIT, d.cluster.memory_limit),
                output_capacity: env_parse_or_default(
                    ENV_OUTPUT_CAPACITY,
                    d.cluster.output_capacity,
                ),
                time_limit_ms: env_parse_or_default(ENV_TIME_LIMIT_MS, d.cluster.time_limit_ms),
            },
            job_name_prefix: env_or_default(ENV_JOB_NAME_PREFIX, &d.job_name_prefix),
            sink_buffer_frames: env_parse_or_default(
                ENV_SINK_BUFFER_FRAMES,
                d.sink_buffer_frames,
            ),
            session_concurrency: env::var(ENV_SESSION_CONCURRENCY)
                .ok()
                .and_then(|v| SessionConcurrency::parse(&v))
                .unwrap_or(d.session_concurrency),
        }
    }

    /// Load from a JSON file; missing fields take their defaults.
    pub fn load_from_json(path: &str) -> Result<Self> {
        let s = fs::read_to_string(path)?;
        serde_json::from_str(&s).map_err(|e| GqdError::InvalidConfig(e.to_string()))
    }
}

fn env_or_default(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse_or_default<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<T>().ok())
        .unwrap_or(default)
}
