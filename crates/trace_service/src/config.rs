//! Trace configuration (per session) and service configuration (daemon).

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use trace_collector::FillPolicy;

/// Fill policy as written in configs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum FillPolicyConfig {
    #[default]
    RingBuffer,
    Discard,
}

impl From<FillPolicyConfig> for FillPolicy {
    fn from(value: FillPolicyConfig) -> FillPolicy {
        match value {
            FillPolicyConfig::RingBuffer => FillPolicy::RingBuffer,
            FillPolicyConfig::Discard => FillPolicy::Discard,
        }
    }
}

/// One central buffer request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferConfig {
    pub size_kb: u32,
    #[serde(default)]
    pub fill_policy: FillPolicyConfig,
}

/// One data source request within a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataSourceConfig {
    pub name: String,
    /// Index into `buffers`.
    #[serde(default)]
    pub target_buffer: u32,
    /// Opaque bytes handed to the producer at StartDataSource.
    #[serde(default)]
    pub config_bytes: Vec<u8>,
    /// Restrict instantiation to producers whose name matches exactly.
    #[serde(default)]
    pub producer_name_filter: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TriggerMode {
    StartTracing,
    StopTracing,
}

/// Start or stop the session on an external trigger instead of
/// immediately.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerConfig {
    pub mode: TriggerMode,
    pub trigger_names: Vec<String>,
    pub timeout_ms: u32,
}

/// The consumer-supplied session configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceConfig {
    pub buffers: Vec<BufferConfig>,
    pub data_sources: Vec<DataSourceConfig>,
    #[serde(default)]
    pub duration_ms: Option<u32>,
    #[serde(default)]
    pub write_into_file: bool,
    #[serde(default)]
    pub output_path: Option<PathBuf>,
    #[serde(default)]
    pub file_write_period_ms: Option<u32>,
    #[serde(default)]
    pub flush_period_ms: Option<u32>,
    #[serde(default)]
    pub triggers: Option<TriggerConfig>,
}

impl TraceConfig {
    /// Total buffer bytes this config reserves.
    pub fn total_buffer_bytes(&self) -> u64 {
        self.buffers.iter().map(|b| u64::from(b.size_kb) * 1024).sum()
    }

    /// Rejects malformed configs before anything is reserved.
    pub fn validate(&self, budget_bytes: u64) -> Result<(), ConfigError> {
        if self.buffers.is_empty() {
            return Err(ConfigError::NoBuffers);
        }
        for (index, buffer) in self.buffers.iter().enumerate() {
            if buffer.size_kb == 0 {
                return Err(ConfigError::ZeroSizeBuffer { index });
            }
        }
        for (i, ds) in self.data_sources.iter().enumerate() {
            if ds.target_buffer as usize >= self.buffers.len() {
                return Err(ConfigError::BadTargetBuffer {
                    name: ds.name.clone(),
                    target: ds.target_buffer,
                });
            }
            if self.data_sources[..i].iter().any(|d| d.name == ds.name) {
                return Err(ConfigError::DuplicateDataSource {
                    name: ds.name.clone(),
                });
            }
        }
        if self.write_into_file && self.output_path.is_none() {
            return Err(ConfigError::MissingOutputPath);
        }
        if let Some(triggers) = &self.triggers {
            if triggers.trigger_names.is_empty() {
                return Err(ConfigError::EmptyTriggerSet);
            }
        }
        let requested = self.total_buffer_bytes();
        if requested > budget_bytes {
            return Err(ConfigError::OverBudget {
                requested_kb: requested / 1024,
                budget_kb: budget_bytes / 1024,
            });
        }
        Ok(())
    }
}

/// Service-wide settings, normally read from the environment.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Unix socket path for producer connections (`LISTEN_ADDR_PRODUCER`).
    pub producer_addr: String,
    /// Unix socket path for consumer connections (`LISTEN_ADDR_CONSUMER`).
    pub consumer_addr: String,
    /// Admission-control cap over all sessions (`MAX_TOTAL_BUFFER_MB`).
    pub max_total_buffer_bytes: u64,
    /// Default SMB size granted at handshake (`DEFAULT_SHMEM_SIZE_KB`).
    pub default_shmem_size: usize,
    /// SMB page size (`DEFAULT_SHMEM_PAGE_SIZE_KB`).
    pub shmem_page_size: usize,
    /// Periodic full-scan cadence; the safety net behind advisory commit
    /// notifications.
    pub drain_interval: Duration,
    /// Default deadline for start/stop/flush acks.
    pub ack_timeout: Duration,
}

/// Smallest SMB the service will grant.
pub const MIN_SHMEM_SIZE: usize = 128 * 1024;
/// Largest SMB the service will grant; larger hints are clamped and the
/// clamped value surfaced in the handshake reply.
pub const MAX_SHMEM_SIZE: usize = 16 * 1024 * 1024;

impl Default for ServiceConfig {
    fn default() -> Self {
        ServiceConfig {
            producer_addr: "/tmp/tracering-producer.sock".into(),
            consumer_addr: "/tmp/tracering-consumer.sock".into(),
            max_total_buffer_bytes: 256 * 1024 * 1024,
            default_shmem_size: 256 * 1024,
            shmem_page_size: 4096,
            drain_interval: Duration::from_millis(100),
            ack_timeout: Duration::from_secs(5),
        }
    }
}

impl ServiceConfig {
    /// Reads the control surface from the environment; unset variables
    /// keep their defaults.
    pub fn from_env() -> Result<ServiceConfig, ConfigError> {
        let mut cfg = ServiceConfig::default();
        if let Ok(v) = std::env::var("LISTEN_ADDR_PRODUCER") {
            cfg.producer_addr = v;
        }
        if let Ok(v) = std::env::var("LISTEN_ADDR_CONSUMER") {
            cfg.consumer_addr = v;
        }
        if let Ok(v) = std::env::var("MAX_TOTAL_BUFFER_MB") {
            cfg.max_total_buffer_bytes = parse_env("MAX_TOTAL_BUFFER_MB", &v)? * 1024 * 1024;
        }
        if let Ok(v) = std::env::var("DEFAULT_SHMEM_SIZE_KB") {
            cfg.default_shmem_size = parse_env("DEFAULT_SHMEM_SIZE_KB", &v)? as usize * 1024;
        }
        if let Ok(v) = std::env::var("DEFAULT_SHMEM_PAGE_SIZE_KB") {
            cfg.shmem_page_size = parse_env("DEFAULT_SHMEM_PAGE_SIZE_KB", &v)? as usize * 1024;
        }
        Ok(cfg)
    }

    /// Clamps a producer's SMB size hint into the grantable range. A hint
    /// of zero means "service default".
    pub fn clamp_shmem_size(&self, hint: usize) -> usize {
        if hint == 0 {
            return self.default_shmem_size;
        }
        hint.clamp(MIN_SHMEM_SIZE, MAX_SHMEM_SIZE)
    }
}

fn parse_env(name: &'static str, value: &str) -> Result<u64, ConfigError> {
    value.parse().map_err(|_| ConfigError::BadEnvValue {
        name,
        value: value.to_string(),
    })
}
