//! trace_service - the tracering session controller
//!
//! Binds the shared-memory ABI, the producer writer runtime, and the
//! buffer engine into a tracing service: consumers configure sessions,
//! producers advertise data sources, the controller matches the two,
//! drives Start/Flush/Stop/Read, and applies retention policy.
//!
//! Two transports expose the same endpoint capability sets: the
//! in-process one in [`endpoint`] (tests, embedding) and the socket one
//! in [`ipc`]. The service itself is an explicit value - construct it,
//! spawn [`TracingService::run`], and hand its [`ServiceHandle`] to
//! whichever transports you bind.
//!
//! # Example
//!
//! ```no_run
//! use trace_service::{ServiceConfig, TracingService};
//!
//! # async fn demo() {
//! let (service, handle) = TracingService::new(ServiceConfig::default());
//! tokio::spawn(service.run());
//! // hand `handle` to transports / in-process endpoints
//! # let _ = handle;
//! # }
//! ```

mod config;
mod controller;
mod endpoint;
mod error;
mod ids;
mod observer;
mod service;
mod session;

pub mod ipc;

/// Session identifier, unique within one service.
pub type SessionId = u64;
/// Data-source instance identifier.
pub type InstanceId = u64;
/// Registered data source identifier.
pub type DataSourceId = u64;
/// Consumer connection identifier.
pub type ConsumerId = u64;
/// Request/flush identifier used for acks and dedup.
pub type RequestId = u64;

pub use config::{
    BufferConfig, DataSourceConfig, FillPolicyConfig, ServiceConfig, TraceConfig, TriggerConfig,
    TriggerMode, MAX_SHMEM_SIZE, MIN_SHMEM_SIZE,
};
pub use endpoint::{
    ChannelConsumerPort, ChannelProducerPort, ConnectionGrant, ConsumerCallback, ConsumerHandle,
    ConsumerPort, DataSourceDescriptor, DataSourceStartup, ProducerCallback, ProducerHandle,
    ProducerPort, ReadBatch, ServiceHandle,
};
pub use error::{ConfigError, ServiceError};
pub use observer::{NullObserver, ServiceObserver};
pub use service::TracingService;
