//! Producer and consumer endpoints.
//!
//! Each side of the service is a capability set, not a class hierarchy:
//! the service->peer direction is a trait object the connection supplies
//! ([`ProducerPort`] / [`ConsumerPort`]), and the peer->service direction
//! is a handle ([`ProducerHandle`] / [`ConsumerHandle`]) whose methods
//! enqueue events onto the single service task. The in-process transport
//! below wires ports to plain channels; the IPC transport in `ipc.rs`
//! wires them to socket frames. The controller cannot tell the difference.

use crate::config::TraceConfig;
use crate::error::ServiceError;
use crate::{ConsumerId, DataSourceId, InstanceId, RequestId, SessionId};
use chunkring::{BufferId, PageBitmap, ProducerId, Smb, SmbConfig};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use trace_collector::Record;

/// What a producer advertises per data source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataSourceDescriptor {
    pub name: String,
}

/// Everything a producer needs to start one data-source instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataSourceStartup {
    pub name: String,
    pub config_bytes: Vec<u8>,
    /// Service-global id the instance's writers must stamp into
    /// `target_buffer`.
    pub target_buffer: BufferId,
}

/// Service -> producer capability set.
pub trait ProducerPort: Send {
    fn start_data_source(&mut self, instance_id: InstanceId, startup: DataSourceStartup);
    fn stop_data_source(&mut self, instance_id: InstanceId);
    fn flush(&mut self, flush_id: RequestId, instance_ids: &[InstanceId]);
}

/// Service -> consumer capability set.
pub trait ConsumerPort: Send {
    /// The session left Running other than by this consumer's own command
    /// (duration elapsed, stop trigger, abort).
    fn tracing_disabled(&mut self, _session_id: SessionId, _reason: Option<String>) {}
}

/// Handshake result for a new producer connection.
pub struct ConnectionGrant {
    pub producer_id: ProducerId,
    /// The shared region. In-process transports share this Arc directly;
    /// a cross-process transport maps the same bytes and rebuilds the view
    /// with `Smb::from_raw_parts`.
    pub smb: Arc<Smb>,
    pub smb_config: SmbConfig,
    /// Width of the atomic page-header word; peers must agree (see the
    /// handshake notes in chunkring).
    pub header_word_bits: u8,
}

/// One `ReadBuffers` reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadBatch {
    pub records: Vec<Record>,
    pub has_more: bool,
}

/// Timer events the controller schedules for itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TimerKind {
    SessionDuration { session_id: SessionId },
    FlushDeadline { session_id: SessionId, flush_id: RequestId },
    StopDeadline { session_id: SessionId },
    TriggerTimeout { session_id: SessionId },
    PeriodicFlush { session_id: SessionId },
    FileWritePeriod { session_id: SessionId },
}

/// Everything the service loop consumes.
pub(crate) enum ServiceEvent {
    ConnectProducer {
        name: String,
        shmem_size_hint: usize,
        port: Box<dyn ProducerPort>,
        reply: oneshot::Sender<Result<ConnectionGrant, ServiceError>>,
    },
    ProducerDisconnected {
        producer_id: ProducerId,
    },
    RegisterDataSource {
        producer_id: ProducerId,
        descriptor: DataSourceDescriptor,
        reply: oneshot::Sender<Result<DataSourceId, ServiceError>>,
    },
    UnregisterDataSource {
        producer_id: ProducerId,
        data_source_id: DataSourceId,
    },
    PagesChanged {
        producer_id: ProducerId,
        pages: PageBitmap,
    },
    FlushAck {
        producer_id: ProducerId,
        flush_id: RequestId,
    },
    StopAck {
        producer_id: ProducerId,
        instance_id: InstanceId,
    },
    ActivateTrigger {
        producer_id: ProducerId,
        names: Vec<String>,
    },

    ConnectConsumer {
        port: Box<dyn ConsumerPort>,
        reply: oneshot::Sender<Result<ConsumerId, ServiceError>>,
    },
    ConsumerDisconnected {
        consumer_id: ConsumerId,
    },
    EnableTracing {
        consumer_id: ConsumerId,
        config: TraceConfig,
        reply: oneshot::Sender<Result<SessionId, ServiceError>>,
    },
    DisableTracing {
        consumer_id: ConsumerId,
        session_id: SessionId,
        reply: Option<oneshot::Sender<Result<(), ServiceError>>>,
    },
    FlushSession {
        consumer_id: ConsumerId,
        session_id: SessionId,
        deadline: Duration,
        request_id: RequestId,
        reply: oneshot::Sender<Result<bool, ServiceError>>,
    },
    ReadBuffers {
        consumer_id: ConsumerId,
        session_id: SessionId,
        reply: oneshot::Sender<Result<ReadBatch, ServiceError>>,
    },
    FreeBuffers {
        consumer_id: ConsumerId,
        session_id: SessionId,
        reply: oneshot::Sender<Result<(), ServiceError>>,
    },

    Timer(TimerKind),
    Shutdown,
}

/// Cloneable sender into the service loop.
#[derive(Clone)]
pub struct ServiceHandle {
    pub(crate) tx: mpsc::UnboundedSender<ServiceEvent>,
}

impl ServiceHandle {
    pub(crate) fn send(&self, event: ServiceEvent) -> Result<(), ServiceError> {
        self.tx.send(event).map_err(|_| ServiceError::ServiceGone)
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<Result<T, ServiceError>>) -> ServiceEvent,
    ) -> Result<T, ServiceError> {
        let (tx, rx) = oneshot::channel();
        self.send(build(tx))?;
        rx.await.map_err(|_| ServiceError::ServiceGone)?
    }

    /// Connects a producer, negotiating its shared memory buffer. A size
    /// hint of 0 requests the service default; out-of-range hints come
    /// back clamped in the grant.
    pub async fn connect_producer(
        &self,
        name: impl Into<String>,
        shmem_size_hint: usize,
        port: Box<dyn ProducerPort>,
    ) -> Result<(ProducerHandle, ConnectionGrant), ServiceError> {
        let name = name.into();
        let grant = self
            .request(|reply| ServiceEvent::ConnectProducer {
                name,
                shmem_size_hint,
                port,
                reply,
            })
            .await?;
        Ok((
            ProducerHandle {
                service: self.clone(),
                producer_id: grant.producer_id,
                disconnected: false,
            },
            grant,
        ))
    }

    /// Connects a consumer.
    pub async fn connect_consumer(
        &self,
        port: Box<dyn ConsumerPort>,
    ) -> Result<ConsumerHandle, ServiceError> {
        let consumer_id = self
            .request(|reply| ServiceEvent::ConnectConsumer { port, reply })
            .await?;
        Ok(ConsumerHandle {
            service: self.clone(),
            consumer_id,
            disconnected: false,
        })
    }

    /// Asks the loop to exit after the current event.
    pub fn shutdown(&self) {
        let _ = self.tx.send(ServiceEvent::Shutdown);
    }
}

/// Producer -> service capability set.
pub struct ProducerHandle {
    service: ServiceHandle,
    producer_id: ProducerId,
    disconnected: bool,
}

impl ProducerHandle {
    #[inline]
    pub fn producer_id(&self) -> ProducerId {
        self.producer_id
    }

    pub async fn register_data_source(
        &self,
        descriptor: DataSourceDescriptor,
    ) -> Result<DataSourceId, ServiceError> {
        let producer_id = self.producer_id;
        self.service
            .request(|reply| ServiceEvent::RegisterDataSource {
                producer_id,
                descriptor,
                reply,
            })
            .await
    }

    pub fn unregister_data_source(&self, data_source_id: DataSourceId) {
        let _ = self.service.send(ServiceEvent::UnregisterDataSource {
            producer_id: self.producer_id,
            data_source_id,
        });
    }

    /// Fire-and-forget commit notification; a superset bitmap is fine.
    pub fn notify_pages_changed(&self, pages: PageBitmap) {
        let _ = self.service.send(ServiceEvent::PagesChanged {
            producer_id: self.producer_id,
            pages,
        });
    }

    /// Acks a `FlushRequest` once the named instances' writers finished.
    pub fn flush_reply(&self, flush_id: RequestId) {
        let _ = self.service.send(ServiceEvent::FlushAck {
            producer_id: self.producer_id,
            flush_id,
        });
    }

    /// Acks a `StopDataSource`.
    pub fn stop_data_source_ack(&self, instance_id: InstanceId) {
        let _ = self.service.send(ServiceEvent::StopAck {
            producer_id: self.producer_id,
            instance_id,
        });
    }

    /// Fires named triggers; sessions armed on (or stoppable by) them
    /// react.
    pub fn activate_trigger(&self, names: Vec<String>) {
        let _ = self.service.send(ServiceEvent::ActivateTrigger {
            producer_id: self.producer_id,
            names,
        });
    }

    /// Explicit disconnect; dropping the handle does the same.
    pub fn disconnect(mut self) {
        self.send_disconnect();
    }

    fn send_disconnect(&mut self) {
        if !self.disconnected {
            self.disconnected = true;
            let _ = self.service.send(ServiceEvent::ProducerDisconnected {
                producer_id: self.producer_id,
            });
        }
    }
}

impl Drop for ProducerHandle {
    fn drop(&mut self) {
        self.send_disconnect();
    }
}

/// Consumer -> service capability set.
pub struct ConsumerHandle {
    service: ServiceHandle,
    consumer_id: ConsumerId,
    disconnected: bool,
}

impl ConsumerHandle {
    #[inline]
    pub fn consumer_id(&self) -> ConsumerId {
        self.consumer_id
    }

    pub async fn enable_tracing(&self, config: TraceConfig) -> Result<SessionId, ServiceError> {
        let consumer_id = self.consumer_id;
        self.service
            .request(|reply| ServiceEvent::EnableTracing {
                consumer_id,
                config,
                reply,
            })
            .await
    }

    pub async fn disable_tracing(&self, session_id: SessionId) -> Result<(), ServiceError> {
        let consumer_id = self.consumer_id;
        self.service
            .request(|reply| ServiceEvent::DisableTracing {
                consumer_id,
                session_id,
                reply: Some(reply),
            })
            .await
    }

    /// Returns true iff every producer with live instances acked before
    /// the deadline. Retransmitting the same `request_id` never
    /// double-applies.
    pub async fn flush(
        &self,
        session_id: SessionId,
        deadline: Duration,
        request_id: RequestId,
    ) -> Result<bool, ServiceError> {
        let consumer_id = self.consumer_id;
        self.service
            .request(|reply| ServiceEvent::FlushSession {
                consumer_id,
                session_id,
                deadline,
                request_id,
                reply,
            })
            .await
    }

    /// One batch of reassembled records; call again while `has_more`.
    pub async fn read_buffers(&self, session_id: SessionId) -> Result<ReadBatch, ServiceError> {
        let consumer_id = self.consumer_id;
        self.service
            .request(|reply| ServiceEvent::ReadBuffers {
                consumer_id,
                session_id,
                reply,
            })
            .await
    }

    pub async fn free_buffers(&self, session_id: SessionId) -> Result<(), ServiceError> {
        let consumer_id = self.consumer_id;
        self.service
            .request(|reply| ServiceEvent::FreeBuffers {
                consumer_id,
                session_id,
                reply,
            })
            .await
    }

    pub fn disconnect(mut self) {
        self.send_disconnect();
    }

    fn send_disconnect(&mut self) {
        if !self.disconnected {
            self.disconnected = true;
            let _ = self.service.send(ServiceEvent::ConsumerDisconnected {
                consumer_id: self.consumer_id,
            });
        }
    }
}

impl Drop for ConsumerHandle {
    fn drop(&mut self) {
        self.send_disconnect();
    }
}

// ---------------------------------------------------------------------
// In-process transport: ports backed by plain channels
// ---------------------------------------------------------------------

/// Service->producer callbacks as values, for channel-backed ports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProducerCallback {
    Start {
        instance_id: InstanceId,
        startup: DataSourceStartup,
    },
    Stop {
        instance_id: InstanceId,
    },
    Flush {
        flush_id: RequestId,
        instance_ids: Vec<InstanceId>,
    },
}

/// A [`ProducerPort`] that forwards every callback into a channel; the
/// producer side of the in-process transport.
pub struct ChannelProducerPort {
    tx: mpsc::UnboundedSender<ProducerCallback>,
}

impl ChannelProducerPort {
    pub fn new() -> (ChannelProducerPort, mpsc::UnboundedReceiver<ProducerCallback>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (ChannelProducerPort { tx }, rx)
    }
}

impl ProducerPort for ChannelProducerPort {
    fn start_data_source(&mut self, instance_id: InstanceId, startup: DataSourceStartup) {
        let _ = self.tx.send(ProducerCallback::Start {
            instance_id,
            startup,
        });
    }

    fn stop_data_source(&mut self, instance_id: InstanceId) {
        let _ = self.tx.send(ProducerCallback::Stop { instance_id });
    }

    fn flush(&mut self, flush_id: RequestId, instance_ids: &[InstanceId]) {
        let _ = self.tx.send(ProducerCallback::Flush {
            flush_id,
            instance_ids: instance_ids.to_vec(),
        });
    }
}

/// Service->consumer callbacks as values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsumerCallback {
    TracingDisabled {
        session_id: SessionId,
        reason: Option<String>,
    },
}

/// A [`ConsumerPort`] that forwards callbacks into a channel.
pub struct ChannelConsumerPort {
    tx: mpsc::UnboundedSender<ConsumerCallback>,
}

impl ChannelConsumerPort {
    pub fn new() -> (ChannelConsumerPort, mpsc::UnboundedReceiver<ConsumerCallback>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (ChannelConsumerPort { tx }, rx)
    }
}

impl ConsumerPort for ChannelConsumerPort {
    fn tracing_disabled(&mut self, session_id: SessionId, reason: Option<String>) {
        let _ = self.tx.send(ConsumerCallback::TracingDisabled { session_id, reason });
    }
}
