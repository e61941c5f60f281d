//! Error taxonomy of the session controller.

use thiserror::Error;

/// Config rejections, returned synchronously on `EnableTracing` before any
/// resource is reserved.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("config declares no buffers")]
    NoBuffers,

    #[error("buffer {index} has zero size")]
    ZeroSizeBuffer { index: usize },

    #[error("data source '{name}' targets nonexistent buffer {target}")]
    BadTargetBuffer { name: String, target: u32 },

    #[error("data source '{name}' declared twice")]
    DuplicateDataSource { name: String },

    #[error("requested {requested_kb} KiB of buffers, budget is {budget_kb} KiB")]
    OverBudget { requested_kb: u64, budget_kb: u64 },

    #[error("write_into_file set without an output_path")]
    MissingOutputPath,

    #[error("trigger config has no trigger names")]
    EmptyTriggerSet,

    #[error("environment variable {name} is not valid: {value}")]
    BadEnvValue { name: &'static str, value: String },
}

/// Errors crossing the service boundary.
#[derive(Debug, Error)]
pub enum ServiceError {
    /// The peer broke the wire or ABI contract. Fatal to that connection,
    /// invisible to every other one.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// Budgets exhausted; the trace continues in degraded mode where it
    /// can, and this surfaces where it cannot even start.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// A peer missed an ack deadline. Recorded, never escalated.
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    /// Rejected before Running; nothing was reserved.
    #[error("invalid config: {0}")]
    ConfigInvalid(#[from] ConfigError),

    /// The peer went away mid-operation.
    #[error("peer disconnected")]
    PeerDisconnected,

    /// Command names a session this consumer does not own (or that never
    /// existed).
    #[error("unknown session {0}")]
    UnknownSession(u64),

    /// The service loop is gone; only seen during shutdown.
    #[error("service is shut down")]
    ServiceGone,
}

impl ServiceError {
    /// True if the originating connection must be torn down.
    #[inline]
    pub fn is_fatal_to_connection(&self) -> bool {
        matches!(self, Self::ProtocolViolation(_))
    }

    /// True for conditions a consumer may simply retry or ignore.
    #[inline]
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::ResourceExhausted(_))
    }
}
