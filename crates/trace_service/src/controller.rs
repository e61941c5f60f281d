//! The session controller: registries, matchmaking, lifecycle, policy.
//!
//! Every method here runs on the single service task. Methods are async
//! only where they await bounded file-sink writes; nothing blocks on a
//! peer - peers are waited for through deadline timers that come back as
//! events.

use crate::config::ServiceConfig;
use crate::endpoint::{
    ConnectionGrant, ConsumerPort, DataSourceDescriptor, DataSourceStartup, ProducerPort,
    ReadBatch, ServiceEvent, ServiceHandle, TimerKind,
};
use crate::error::ServiceError;
use crate::ids::IdAllocator;
use crate::observer::ServiceObserver;
use crate::session::{Instance, PendingFlush, PendingStop, Session, SessionState};
use crate::{ConsumerId, DataSourceId, InstanceId, RequestId, SessionId};
use chunkring::{BufferId, PageBitmap, ProducerId, Smb, SmbConfig};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use trace_collector::{
    clock_snapshot, BufferEngine, FileSink, Record, ServiceMetadata, SessionStatus,
};

/// Records per `ReadBuffers` batch; `has_more` drives further batches.
const MAX_READ_BATCH: usize = 1024;

/// The page-header word is 64 bits wide in this implementation; surfaced
/// at the handshake so peers agree on the layout.
const HEADER_WORD_BITS: u8 = 64;

struct ProducerState {
    name: String,
    port: Box<dyn ProducerPort>,
    smb: Arc<Smb>,
    sources: HashMap<DataSourceId, DataSourceDescriptor>,
}

struct ConsumerState {
    port: Box<dyn ConsumerPort>,
    sessions: HashSet<SessionId>,
}

pub(crate) struct Controller {
    cfg: ServiceConfig,
    handle: ServiceHandle,
    engine: BufferEngine,
    producers: HashMap<ProducerId, ProducerState>,
    consumers: HashMap<ConsumerId, ConsumerState>,
    sessions: HashMap<SessionId, Session>,
    /// Which session owns each service-global buffer id.
    buffer_owner: HashMap<BufferId, SessionId>,
    producer_ids: IdAllocator,
    consumer_ids: IdAllocator,
    session_ids: IdAllocator,
    source_ids: IdAllocator,
    instance_ids: IdAllocator,
    buffer_ids: IdAllocator,
    next_flush_id: RequestId,
    reserved_bytes: u64,
    observer: Box<dyn ServiceObserver>,
}

impl Controller {
    pub(crate) fn new(
        cfg: ServiceConfig,
        handle: ServiceHandle,
        observer: Box<dyn ServiceObserver>,
    ) -> Controller {
        Controller {
            cfg,
            handle,
            engine: BufferEngine::new(),
            producers: HashMap::new(),
            consumers: HashMap::new(),
            sessions: HashMap::new(),
            buffer_owner: HashMap::new(),
            producer_ids: IdAllocator::new(u64::from(u32::MAX) - 1),
            consumer_ids: IdAllocator::new(u64::MAX - 1),
            session_ids: IdAllocator::new(u64::MAX - 1),
            source_ids: IdAllocator::new(u64::MAX - 1),
            instance_ids: IdAllocator::new(u64::MAX - 1),
            buffer_ids: IdAllocator::new(u64::from(u16::MAX) - 1),
            next_flush_id: 1,
            reserved_bytes: 0,
            observer,
        }
    }

    fn schedule(&self, after: Duration, kind: TimerKind) {
        let handle = self.handle.clone();
        tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let _ = handle.send(ServiceEvent::Timer(kind));
        });
    }

    // ---------------------------------------------------------------------
    // Event dispatch
    // ---------------------------------------------------------------------

    pub(crate) async fn handle_event(&mut self, event: ServiceEvent) {
        match event {
            ServiceEvent::ConnectProducer {
                name,
                shmem_size_hint,
                port,
                reply,
            } => {
                let _ = reply.send(self.connect_producer(name, shmem_size_hint, port));
            }
            ServiceEvent::ProducerDisconnected { producer_id } => {
                self.disconnect_producer(producer_id).await;
            }
            ServiceEvent::RegisterDataSource {
                producer_id,
                descriptor,
                reply,
            } => {
                let _ = reply.send(self.register_data_source(producer_id, descriptor));
            }
            ServiceEvent::UnregisterDataSource {
                producer_id,
                data_source_id,
            } => {
                self.unregister_data_source(producer_id, data_source_id);
            }
            ServiceEvent::PagesChanged { producer_id, pages } => {
                if !self.drain_producer(producer_id, Some(&pages)).await {
                    tracing::warn!(producer_id, "protocol violation while draining; disconnecting");
                    self.disconnect_producer(producer_id).await;
                }
            }
            ServiceEvent::FlushAck {
                producer_id,
                flush_id,
            } => {
                self.flush_ack(producer_id, flush_id).await;
            }
            ServiceEvent::StopAck {
                producer_id,
                instance_id,
            } => {
                self.stop_ack(producer_id, instance_id).await;
            }
            ServiceEvent::ActivateTrigger { producer_id, names } => {
                self.activate_trigger(producer_id, &names).await;
            }

            ServiceEvent::ConnectConsumer { port, reply } => {
                let _ = reply.send(self.connect_consumer(port));
            }
            ServiceEvent::ConsumerDisconnected { consumer_id } => {
                self.disconnect_consumer(consumer_id).await;
            }
            ServiceEvent::EnableTracing {
                consumer_id,
                config,
                reply,
            } => {
                let result = self.enable_tracing(consumer_id, config).await;
                let _ = reply.send(result);
            }
            ServiceEvent::DisableTracing {
                consumer_id,
                session_id,
                reply,
            } => {
                let result = self.disable_tracing(consumer_id, session_id).await;
                if let Some(reply) = reply {
                    let _ = reply.send(result);
                }
            }
            ServiceEvent::FlushSession {
                consumer_id,
                session_id,
                deadline,
                request_id,
                reply,
            } => {
                self.flush_session(consumer_id, session_id, deadline, request_id, reply)
                    .await;
            }
            ServiceEvent::ReadBuffers {
                consumer_id,
                session_id,
                reply,
            } => {
                let result = self.read_buffers(consumer_id, session_id).await;
                let _ = reply.send(result);
            }
            ServiceEvent::FreeBuffers {
                consumer_id,
                session_id,
                reply,
            } => {
                let result = self.free_buffers(consumer_id, session_id).await;
                let _ = reply.send(result);
            }

            ServiceEvent::Timer(kind) => self.timer_fired(kind).await,
            ServiceEvent::Shutdown => unreachable!("handled by the service loop"),
        }
    }

    // ---------------------------------------------------------------------
    // Producer side
    // ---------------------------------------------------------------------

    fn connect_producer(
        &mut self,
        name: String,
        shmem_size_hint: usize,
        port: Box<dyn ProducerPort>,
    ) -> Result<ConnectionGrant, ServiceError> {
        let producer_id = self
            .producer_ids
            .allocate()
            .ok_or_else(|| ServiceError::ResourceExhausted("producer ids".into()))?
            as ProducerId;

        let granted = self.cfg.clamp_shmem_size(shmem_size_hint);
        let smb_config = SmbConfig::for_total_size(granted, self.cfg.shmem_page_size)
            .map_err(|e| ServiceError::ResourceExhausted(e.to_string()))?;
        let smb = Arc::new(Smb::in_process(smb_config));

        tracing::info!(producer_id, name = %name, granted, "producer connected");
        self.producers.insert(
            producer_id,
            ProducerState {
                name,
                port,
                smb: Arc::clone(&smb),
                sources: HashMap::new(),
            },
        );
        self.observer.producer_connected(producer_id);

        Ok(ConnectionGrant {
            producer_id,
            smb,
            smb_config,
            header_word_bits: HEADER_WORD_BITS,
        })
    }

    async fn disconnect_producer(&mut self, producer_id: ProducerId) {
        let Some(state) = self.producers.remove(&producer_id) else {
            return;
        };
        // Salvage chunks the producer completed before going away; chunks
        // it left WriterOwned are simply never ingested.
        let _ = self.drain_smb(producer_id, &state.smb, None).await;
        self.engine.forget_producer(producer_id);

        let session_ids: Vec<SessionId> = self.sessions.keys().copied().collect();
        for session_id in session_ids {
            self.remove_producer_from_session(session_id, producer_id)
                .await;
        }
        self.producer_ids.free(u64::from(producer_id));
        self.observer.producer_disconnected(producer_id);
        tracing::info!(producer_id, "producer disconnected");
    }

    /// Drops a departed producer's instances from one session and settles
    /// any flush/stop that was waiting on it (a disconnect counts as an
    /// ack: there is nothing left to wait for).
    async fn remove_producer_from_session(
        &mut self,
        session_id: SessionId,
        producer_id: ProducerId,
    ) {
        let mut flush_settled = false;
        let mut stop_settled = false;
        {
            let Some(session) = self.sessions.get_mut(&session_id) else {
                return;
            };
            let removed: Vec<InstanceId> = session.instances_of(producer_id);
            for instance_id in &removed {
                if let Some(instance) = session.instances.remove(instance_id) {
                    tracing::debug!(
                        session_id,
                        instance_id,
                        buffer = instance.target_buffer,
                        "instance lost its producer"
                    );
                }
                self.observer.instance_destroyed(session_id, *instance_id);
            }
            if let Some(pending) = session.pending_flush.as_mut() {
                pending.awaiting.remove(&producer_id);
                flush_settled = pending.awaiting.is_empty();
            }
            if let Some(pending) = session.pending_stop.as_mut() {
                for instance_id in &removed {
                    pending.awaiting.remove(instance_id);
                }
                stop_settled = pending.awaiting.is_empty();
            }
        }
        if flush_settled {
            self.finish_flush(session_id, true).await;
        }
        if stop_settled {
            self.finish_stop(session_id).await;
        }
    }

    fn register_data_source(
        &mut self,
        producer_id: ProducerId,
        descriptor: DataSourceDescriptor,
    ) -> Result<DataSourceId, ServiceError> {
        let producer = self
            .producers
            .get_mut(&producer_id)
            .ok_or(ServiceError::PeerDisconnected)?;
        let source_id = self
            .source_ids
            .allocate()
            .ok_or_else(|| ServiceError::ResourceExhausted("data source ids".into()))?;
        tracing::debug!(producer_id, source = %descriptor.name, source_id, "data source registered");
        producer.sources.insert(source_id, descriptor);
        self.observer.data_source_registered(producer_id, source_id);
        self.match_and_start(None, Some(producer_id));
        Ok(source_id)
    }

    fn unregister_data_source(&mut self, producer_id: ProducerId, data_source_id: DataSourceId) {
        let Some(producer) = self.producers.get_mut(&producer_id) else {
            return;
        };
        let Some(descriptor) = producer.sources.remove(&data_source_id) else {
            tracing::warn!(producer_id, data_source_id, "unregister of unknown data source");
            return;
        };
        self.source_ids.free(data_source_id);
        for (session_id, session) in &mut self.sessions {
            let stale: Vec<InstanceId> = session
                .instances
                .iter()
                .filter(|(_, inst)| {
                    inst.producer_id == producer_id && inst.source_name == descriptor.name
                })
                .map(|(id, _)| *id)
                .collect();
            for instance_id in stale {
                session.instances.remove(&instance_id);
                self.observer.instance_destroyed(*session_id, instance_id);
            }
        }
        self.observer
            .data_source_unregistered(producer_id, data_source_id);
    }

    /// Both matchmaking directions share this scan: a new/armed session
    /// against every producer, or a newly-registered source against every
    /// active session. Filters narrow the scan; `None` means "all".
    fn match_and_start(
        &mut self,
        session_filter: Option<SessionId>,
        producer_filter: Option<ProducerId>,
    ) {
        // Collect matches first; instance creation mutates both maps.
        let mut planned: Vec<(SessionId, ProducerId, String, Vec<u8>, BufferId)> = Vec::new();
        for (&session_id, session) in &self.sessions {
            if session_filter.is_some_and(|id| id != session_id) {
                continue;
            }
            if !matches!(session.state, SessionState::Running | SessionState::Flushing) {
                continue;
            }
            for (&producer_id, producer) in &self.producers {
                if producer_filter.is_some_and(|id| id != producer_id) {
                    continue;
                }
                for descriptor in producer.sources.values() {
                    let Some(request) = session
                        .config
                        .data_sources
                        .iter()
                        .find(|ds| ds.name == descriptor.name)
                    else {
                        continue;
                    };
                    if request
                        .producer_name_filter
                        .as_ref()
                        .is_some_and(|f| *f != producer.name)
                    {
                        continue;
                    }
                    let exists = session.instances.values().any(|inst| {
                        inst.producer_id == producer_id && inst.source_name == descriptor.name
                    });
                    if exists {
                        continue;
                    }
                    let Some(target) = session.global_buffer_id(request.target_buffer) else {
                        continue;
                    };
                    planned.push((
                        session_id,
                        producer_id,
                        descriptor.name.clone(),
                        request.config_bytes.clone(),
                        target,
                    ));
                }
            }
        }

        for (session_id, producer_id, name, config_bytes, target_buffer) in planned {
            let Some(instance_id) = self.instance_ids.allocate() else {
                tracing::warn!("instance id space exhausted");
                return;
            };
            let Some(session) = self.sessions.get_mut(&session_id) else {
                continue;
            };
            let Some(producer) = self.producers.get_mut(&producer_id) else {
                continue;
            };
            session.instances.insert(
                instance_id,
                Instance {
                    producer_id,
                    source_name: name.clone(),
                    target_buffer,
                },
            );
            producer.port.start_data_source(
                instance_id,
                DataSourceStartup {
                    name,
                    config_bytes,
                    target_buffer,
                },
            );
            self.observer.instance_created(session_id, instance_id);
            tracing::debug!(session_id, producer_id, instance_id, "instance started");
        }
    }

    // ---------------------------------------------------------------------
    // Draining
    // ---------------------------------------------------------------------

    /// Drains a connected producer's SMB. Returns false on a protocol
    /// violation (the caller disconnects the producer).
    async fn drain_producer(&mut self, producer_id: ProducerId, pages: Option<&PageBitmap>) -> bool {
        let Some(smb) = self.producers.get(&producer_id).map(|p| Arc::clone(&p.smb)) else {
            return true;
        };
        self.drain_smb(producer_id, &smb, pages).await
    }

    async fn drain_smb(
        &mut self,
        producer_id: ProducerId,
        smb: &Arc<Smb>,
        pages: Option<&PageBitmap>,
    ) -> bool {
        let mut frames: Vec<(BufferId, [u8; chunkring::CHUNK_HEADER_LEN], Vec<u8>)> = Vec::new();
        let result = self
            .engine
            .drain_smb(producer_id, smb, pages, |buffer, raw, payload| {
                frames.push((buffer, *raw, payload.to_vec()));
            });

        // Mirror stored chunks into their sessions' output files, in
        // ingestion order.
        for (buffer, raw, payload) in frames {
            let Some(&session_id) = self.buffer_owner.get(&buffer) else {
                continue;
            };
            let Some(session) = self.sessions.get_mut(&session_id) else {
                continue;
            };
            if let Some(sink) = session.file_sink.as_mut() {
                if let Err(e) = sink.append_chunk(&raw, &payload).await {
                    tracing::error!(session_id, error = %e, "output file write failed; aborting file");
                    session.abort_reason = Some(format!("output file write failed: {e}"));
                    session.file_sink = None;
                }
            }
        }

        match result {
            Ok(summary) => {
                if summary.chunks_ingested > 0 {
                    tracing::trace!(producer_id, chunks = summary.chunks_ingested, "drained");
                }
                true
            }
            Err(e) => {
                tracing::warn!(producer_id, error = %e, "ingestion rejected SMB contents");
                false
            }
        }
    }

    /// Flags a producer for disconnection without recursing into the
    /// teardown path (which itself drains); the disconnect arrives as the
    /// next event.
    fn defer_disconnect(&self, producer_id: ProducerId) {
        tracing::warn!(producer_id, "protocol violation; disconnecting producer");
        let _ = self
            .handle
            .send(ServiceEvent::ProducerDisconnected { producer_id });
    }

    async fn drain_session_producers(&mut self, session_id: SessionId) {
        let producers: Vec<ProducerId> = match self.sessions.get(&session_id) {
            Some(session) => session.producers_with_instances().into_iter().collect(),
            None => return,
        };
        for producer_id in producers {
            if !self.drain_producer(producer_id, None).await {
                self.defer_disconnect(producer_id);
            }
        }
    }

    /// Periodic tick: drain everything. Liveness never depends on
    /// notifications arriving.
    pub(crate) async fn drain_all(&mut self) {
        let producer_ids: Vec<ProducerId> = self.producers.keys().copied().collect();
        for producer_id in producer_ids {
            if !self.drain_producer(producer_id, None).await {
                self.defer_disconnect(producer_id);
            }
        }
    }

    // ---------------------------------------------------------------------
    // Consumer side
    // ---------------------------------------------------------------------

    fn connect_consumer(
        &mut self,
        port: Box<dyn ConsumerPort>,
    ) -> Result<ConsumerId, ServiceError> {
        let consumer_id = self
            .consumer_ids
            .allocate()
            .ok_or_else(|| ServiceError::ResourceExhausted("consumer ids".into()))?;
        self.consumers.insert(
            consumer_id,
            ConsumerState {
                port,
                sessions: HashSet::new(),
            },
        );
        tracing::info!(consumer_id, "consumer connected");
        Ok(consumer_id)
    }

    async fn disconnect_consumer(&mut self, consumer_id: ConsumerId) {
        let Some(state) = self.consumers.remove(&consumer_id) else {
            return;
        };
        self.consumer_ids.free(consumer_id);
        tracing::info!(consumer_id, "consumer disconnected");
        for session_id in state.sessions {
            let Some(session_state) = self.sessions.get(&session_id).map(|s| s.state) else {
                continue;
            };
            match session_state {
                SessionState::Running | SessionState::Flushing => {
                    self.begin_stop(session_id, true, Some("consumer disconnected".into()))
                        .await;
                }
                SessionState::Stopping => {
                    if let Some(session) = self.sessions.get_mut(&session_id) {
                        session.dispose_when_stopped = true;
                    }
                }
                SessionState::Configured | SessionState::Armed | SessionState::Stopped => {
                    self.dispose_session(session_id);
                }
            }
        }
    }

    /// Looks up a session, checking consumer ownership.
    fn owned_session(
        &mut self,
        consumer_id: ConsumerId,
        session_id: SessionId,
    ) -> Result<&mut Session, ServiceError> {
        match self.sessions.get_mut(&session_id) {
            Some(session) if session.consumer == consumer_id => Ok(session),
            _ => Err(ServiceError::UnknownSession(session_id)),
        }
    }

    async fn enable_tracing(
        &mut self,
        consumer_id: ConsumerId,
        config: crate::config::TraceConfig,
    ) -> Result<SessionId, ServiceError> {
        if !self.consumers.contains_key(&consumer_id) {
            return Err(ServiceError::PeerDisconnected);
        }
        let budget_left = self
            .cfg
            .max_total_buffer_bytes
            .saturating_sub(self.reserved_bytes);
        config.validate(budget_left)?;

        let session_id = self
            .session_ids
            .allocate()
            .ok_or_else(|| ServiceError::ResourceExhausted("session ids".into()))?;

        // Allocate the central buffers under service-global ids.
        let mut buffer_ids: Vec<BufferId> = Vec::with_capacity(config.buffers.len());
        for buffer in &config.buffers {
            match self.buffer_ids.allocate() {
                Some(id) => {
                    let id = id as BufferId;
                    self.engine.create_buffer(
                        id,
                        buffer.size_kb as usize * 1024,
                        buffer.fill_policy.into(),
                    );
                    self.buffer_owner.insert(id, session_id);
                    buffer_ids.push(id);
                }
                None => {
                    self.release_buffers(&buffer_ids);
                    self.session_ids.free(session_id);
                    return Err(ServiceError::ResourceExhausted("buffer ids".into()));
                }
            }
        }

        let file_sink = if config.write_into_file {
            let path = config.output_path.clone().expect("validated");
            match FileSink::create(&path).await {
                Ok(sink) => Some(sink),
                Err(e) => {
                    self.release_buffers(&buffer_ids);
                    self.session_ids.free(session_id);
                    return Err(ServiceError::ResourceExhausted(format!(
                        "cannot create output file {}: {e}",
                        path.display()
                    )));
                }
            }
        } else {
            None
        };

        let reserved = config.total_buffer_bytes();
        self.reserved_bytes += reserved;

        let armed = config
            .triggers
            .as_ref()
            .is_some_and(|t| matches!(t.mode, crate::config::TriggerMode::StartTracing));
        let trigger_timeout = config.triggers.as_ref().map(|t| t.timeout_ms);

        let session = Session {
            id: session_id,
            consumer: consumer_id,
            config,
            state: SessionState::Configured,
            buffer_ids,
            instances: HashMap::new(),
            pending_flush: None,
            completed_flushes: VecDeque::new(),
            flushes_done: 0,
            metadata: VecDeque::new(),
            file_sink,
            start_clock: clock_snapshot(),
            reserved_bytes: reserved,
            pending_stop: None,
            dispose_when_stopped: false,
            abort_reason: None,
        };
        self.sessions.insert(session_id, session);
        self.consumers
            .get_mut(&consumer_id)
            .expect("checked above")
            .sessions
            .insert(session_id);
        tracing::info!(session_id, consumer_id, armed, "session configured");

        if armed {
            self.sessions.get_mut(&session_id).expect("just inserted").state =
                SessionState::Armed;
            if let Some(timeout_ms) = trigger_timeout {
                self.schedule(
                    Duration::from_millis(u64::from(timeout_ms)),
                    TimerKind::TriggerTimeout { session_id },
                );
            }
        } else {
            self.start_session(session_id);
        }
        Ok(session_id)
    }

    fn release_buffers(&mut self, buffer_ids: &[BufferId]) {
        for &id in buffer_ids {
            self.engine.free_buffer(id);
            self.buffer_owner.remove(&id);
            self.buffer_ids.free(u64::from(id));
        }
    }

    fn start_session(&mut self, session_id: SessionId) {
        let Some(session) = self.sessions.get_mut(&session_id) else {
            return;
        };
        session.state = SessionState::Running;
        session.start_clock = clock_snapshot();
        tracing::info!(session_id, "session running");

        let duration_ms = session.config.duration_ms;
        let flush_period_ms = session.config.flush_period_ms;
        let file_write_period_ms = session.config.file_write_period_ms;
        let has_file_sink = session.file_sink.is_some();

        if let Some(duration_ms) = duration_ms {
            self.schedule(
                Duration::from_millis(u64::from(duration_ms)),
                TimerKind::SessionDuration { session_id },
            );
        }
        if let Some(period_ms) = flush_period_ms {
            self.schedule(
                Duration::from_millis(u64::from(period_ms)),
                TimerKind::PeriodicFlush { session_id },
            );
        }
        if file_write_period_ms.is_some() && has_file_sink {
            let period = file_write_period_ms.expect("checked");
            self.schedule(
                Duration::from_millis(u64::from(period)),
                TimerKind::FileWritePeriod { session_id },
            );
        }

        self.match_and_start(Some(session_id), None);
    }

    async fn disable_tracing(
        &mut self,
        consumer_id: ConsumerId,
        session_id: SessionId,
    ) -> Result<(), ServiceError> {
        let state = self.owned_session(consumer_id, session_id)?.state;
        match state {
            SessionState::Configured | SessionState::Armed => {
                self.dispose_session(session_id);
                Ok(())
            }
            SessionState::Running | SessionState::Flushing => {
                self.begin_stop(session_id, false, None).await;
                Ok(())
            }
            SessionState::Stopping | SessionState::Stopped => Ok(()),
        }
    }

    async fn flush_session(
        &mut self,
        consumer_id: ConsumerId,
        session_id: SessionId,
        deadline: Duration,
        request_id: RequestId,
        reply: oneshot::Sender<Result<bool, ServiceError>>,
    ) {
        let state = match self.owned_session(consumer_id, session_id) {
            Ok(session) => {
                // Retransmission of a completed flush: answer from the
                // window.
                if let Some(done) = session.recall_flush(request_id) {
                    let _ = reply.send(Ok(done));
                    return;
                }
                session.state
            }
            Err(e) => {
                let _ = reply.send(Err(e));
                return;
            }
        };

        match state {
            SessionState::Running => {
                self.begin_flush(session_id, Some(request_id), deadline, vec![reply])
                    .await;
            }
            SessionState::Flushing => {
                let session = self.sessions.get_mut(&session_id).expect("checked above");
                let pending = session.pending_flush.as_mut().expect("state is Flushing");
                if pending.request_id == Some(request_id) {
                    // Retransmission of the in-flight request: coalesce.
                    pending.replies.push(reply);
                } else {
                    let _ = reply.send(Err(ServiceError::ResourceExhausted(
                        "a flush is already in flight".into(),
                    )));
                }
            }
            _ => {
                let _ = reply.send(Err(ServiceError::ResourceExhausted(
                    "session is not running".into(),
                )));
            }
        }
    }

    async fn begin_flush(
        &mut self,
        session_id: SessionId,
        request_id: Option<RequestId>,
        deadline: Duration,
        replies: Vec<oneshot::Sender<Result<bool, ServiceError>>>,
    ) {
        let flush_id = self.next_flush_id;
        self.next_flush_id += 1;

        let awaiting = {
            let Some(session) = self.sessions.get_mut(&session_id) else {
                return;
            };
            let awaiting = session.producers_with_instances();
            session.state = SessionState::Flushing;
            session.pending_flush = Some(PendingFlush {
                flush_id,
                request_id,
                awaiting: awaiting.clone(),
                replies,
            });
            awaiting
        };

        // Fan the request out; each producer acks once its writers have
        // committed everything begun before this point.
        for producer_id in &awaiting {
            let instances = self
                .sessions
                .get(&session_id)
                .map(|s| s.instances_of(*producer_id))
                .unwrap_or_default();
            if let Some(producer) = self.producers.get_mut(producer_id) {
                producer.port.flush(flush_id, &instances);
            }
        }

        if awaiting.is_empty() {
            self.finish_flush(session_id, true).await;
        } else {
            self.schedule(deadline, TimerKind::FlushDeadline { session_id, flush_id });
        }
    }

    async fn flush_ack(&mut self, producer_id: ProducerId, flush_id: RequestId) {
        let mut settled = None;
        for (&session_id, session) in &mut self.sessions {
            if let Some(pending) = session.pending_flush.as_mut() {
                if pending.flush_id == flush_id {
                    // A duplicate ack finds the producer already removed:
                    // nothing double-applies.
                    pending.awaiting.remove(&producer_id);
                    if pending.awaiting.is_empty() {
                        settled = Some(session_id);
                    }
                    break;
                }
            }
        }
        if let Some(session_id) = settled {
            self.finish_flush(session_id, true).await;
        }
    }

    async fn finish_flush(&mut self, session_id: SessionId, success: bool) {
        // Everything producers committed up to their acks is in the SMBs;
        // pull it in before stamping the metadata record.
        self.drain_session_producers(session_id).await;

        let meta = match self.build_metadata(session_id, success) {
            Some(meta) => meta,
            None => return,
        };

        let Some(session) = self.sessions.get_mut(&session_id) else {
            return;
        };
        let Some(pending) = session.pending_flush.take() else {
            return;
        };
        session.flushes_done += 1;
        session.metadata.push_back(Record::metadata(&meta));
        session.remember_flush(pending.request_id, success);
        if session.state == SessionState::Flushing {
            session.state = SessionState::Running;
        }
        for reply in pending.replies {
            let _ = reply.send(Ok(success));
        }
        if let Some(sink) = session.file_sink.as_mut() {
            if let Err(e) = sink.flush().await {
                tracing::warn!(session_id, error = %e, "output file flush failed");
            }
        }
        tracing::debug!(session_id, success, "flush finished");
    }

    /// Builds the per-flush metadata record. `flush_complete` is false
    /// when the deadline expired before every ack - the diagnostic the
    /// trace carries for an unacked flush.
    fn build_metadata(&mut self, session_id: SessionId, flush_complete: bool) -> Option<ServiceMetadata> {
        let session = self.sessions.get(&session_id)?;
        let (loss_bytes, loss_records) = self.engine.loss_totals(&session.buffer_ids);
        let status = if let Some(reason) = &session.abort_reason {
            SessionStatus::Aborted {
                reason: reason.clone(),
            }
        } else if loss_bytes > 0 || loss_records > 0 {
            SessionStatus::Degraded {
                loss_bytes,
                loss_records,
            }
        } else {
            SessionStatus::Ok
        };
        let clock = clock_snapshot();
        Some(ServiceMetadata {
            session_id: session.id,
            flush_id: session.flushes_done + 1,
            wall_clock_ns: clock.wall_clock_ns,
            boot_clock_ns: clock.boot_clock_ns,
            start_wall_clock_ns: session.start_clock.wall_clock_ns,
            start_boot_clock_ns: session.start_clock.boot_clock_ns,
            flush_complete,
            status,
            buffer_stats: self.engine.stats_snapshots(&session.buffer_ids),
        })
    }

    async fn begin_stop(
        &mut self,
        session_id: SessionId,
        dispose_after: bool,
        reason: Option<String>,
    ) {
        // A stop preempts an in-flight flush; its waiters learn the flush
        // did not complete.
        let flush_in_flight = self
            .sessions
            .get(&session_id)
            .is_some_and(|s| s.pending_flush.is_some());
        if flush_in_flight {
            self.finish_flush(session_id, false).await;
        }

        let awaiting: Vec<(ProducerId, InstanceId)> = {
            let Some(session) = self.sessions.get_mut(&session_id) else {
                return;
            };
            if matches!(session.state, SessionState::Stopping | SessionState::Stopped) {
                session.dispose_when_stopped |= dispose_after;
                return;
            }
            session.state = SessionState::Stopping;
            session.dispose_when_stopped |= dispose_after;
            if let Some(reason) = reason {
                session.abort_reason.get_or_insert(reason);
            }
            session
                .instances
                .iter()
                .map(|(&id, inst)| (inst.producer_id, id))
                .collect()
        };
        tracing::info!(session_id, instances = awaiting.len(), "session stopping");

        for (producer_id, instance_id) in &awaiting {
            if let Some(producer) = self.producers.get_mut(producer_id) {
                producer.port.stop_data_source(*instance_id);
            }
        }

        let Some(session) = self.sessions.get_mut(&session_id) else {
            return;
        };
        session.pending_stop = Some(PendingStop {
            awaiting: awaiting.iter().map(|(_, id)| *id).collect(),
        });

        if awaiting.is_empty() {
            self.finish_stop(session_id).await;
        } else {
            self.schedule(self.cfg.ack_timeout, TimerKind::StopDeadline { session_id });
        }
    }

    async fn stop_ack(&mut self, producer_id: ProducerId, instance_id: InstanceId) {
        let mut settled = None;
        for (&session_id, session) in &mut self.sessions {
            let owns = session
                .instances
                .get(&instance_id)
                .is_some_and(|inst| inst.producer_id == producer_id);
            if !owns {
                continue;
            }
            if let Some(pending) = session.pending_stop.as_mut() {
                pending.awaiting.remove(&instance_id);
                if pending.awaiting.is_empty() {
                    settled = Some(session_id);
                }
            }
            break;
        }
        if let Some(session_id) = settled {
            self.finish_stop(session_id).await;
        }
    }

    async fn finish_stop(&mut self, session_id: SessionId) {
        // Final drain so the last committed chunks make the stopped trace.
        self.drain_session_producers(session_id).await;

        let meta = match self.build_metadata(session_id, true) {
            Some(meta) => meta,
            None => return,
        };

        let (consumer_id, dispose, reason) = {
            let Some(session) = self.sessions.get_mut(&session_id) else {
                return;
            };
            session.pending_stop = None;
            let instance_ids: Vec<InstanceId> = session.instances.keys().copied().collect();
            for instance_id in instance_ids {
                session.instances.remove(&instance_id);
                self.observer.instance_destroyed(session_id, instance_id);
            }
            session.flushes_done += 1;
            session.metadata.push_back(Record::metadata(&meta));
            session.state = SessionState::Stopped;
            if let Some(sink) = session.file_sink.take() {
                if let Err(e) = sink.finish(&meta).await {
                    tracing::error!(session_id, error = %e, "closing output file failed");
                }
            }
            (
                session.consumer,
                session.dispose_when_stopped,
                session.abort_reason.clone(),
            )
        };
        tracing::info!(session_id, "session stopped");

        if let Some(consumer) = self.consumers.get_mut(&consumer_id) {
            consumer.port.tracing_disabled(session_id, reason);
        }
        if dispose {
            self.dispose_session(session_id);
        }
    }

    async fn read_buffers(
        &mut self,
        consumer_id: ConsumerId,
        session_id: SessionId,
    ) -> Result<ReadBatch, ServiceError> {
        let active = {
            let session = self.owned_session(consumer_id, session_id)?;
            session.is_active()
        };
        if active {
            self.drain_session_producers(session_id).await;
        }
        let buffer_ids = self
            .sessions
            .get(&session_id)
            .ok_or(ServiceError::UnknownSession(session_id))?
            .buffer_ids
            .clone();
        let (records, has_more) = self.engine.read_buffers(&buffer_ids, MAX_READ_BATCH);
        let session = self.owned_session(consumer_id, session_id)?;
        Ok(session.assemble_batch(records, has_more))
    }

    async fn free_buffers(
        &mut self,
        consumer_id: ConsumerId,
        session_id: SessionId,
    ) -> Result<(), ServiceError> {
        let state = self.owned_session(consumer_id, session_id)?.state;
        match state {
            SessionState::Running | SessionState::Flushing => {
                self.begin_stop(session_id, true, None).await;
            }
            SessionState::Stopping => {
                if let Ok(session) = self.owned_session(consumer_id, session_id) {
                    session.dispose_when_stopped = true;
                }
            }
            SessionState::Configured | SessionState::Armed | SessionState::Stopped => {
                self.dispose_session(session_id);
            }
        }
        Ok(())
    }

    fn dispose_session(&mut self, session_id: SessionId) {
        let Some(session) = self.sessions.remove(&session_id) else {
            return;
        };
        self.release_buffers(&session.buffer_ids);
        self.reserved_bytes = self.reserved_bytes.saturating_sub(session.reserved_bytes);
        self.session_ids.free(session_id);
        if let Some(consumer) = self.consumers.get_mut(&session.consumer) {
            consumer.sessions.remove(&session_id);
        }
        tracing::info!(session_id, "session disposed");
    }

    // ---------------------------------------------------------------------
    // Triggers and timers
    // ---------------------------------------------------------------------

    async fn activate_trigger(&mut self, producer_id: ProducerId, names: &[String]) {
        tracing::debug!(producer_id, ?names, "trigger activated");
        let to_start: Vec<SessionId> = self
            .sessions
            .iter()
            .filter(|(_, s)| s.start_trigger_matches(names))
            .map(|(&id, _)| id)
            .collect();
        let to_stop: Vec<SessionId> = self
            .sessions
            .iter()
            .filter(|(_, s)| s.stop_trigger_matches(names))
            .map(|(&id, _)| id)
            .collect();

        for session_id in to_start {
            self.start_session(session_id);
        }
        for session_id in to_stop {
            self.begin_stop(session_id, false, None).await;
        }
    }

    async fn timer_fired(&mut self, kind: TimerKind) {
        match kind {
            TimerKind::SessionDuration { session_id } => {
                let running = self
                    .sessions
                    .get(&session_id)
                    .is_some_and(|s| matches!(s.state, SessionState::Running | SessionState::Flushing));
                if running {
                    tracing::info!(session_id, "duration elapsed; stopping");
                    self.begin_stop(session_id, false, None).await;
                }
            }
            TimerKind::FlushDeadline { session_id, flush_id } => {
                let expired = self
                    .sessions
                    .get(&session_id)
                    .and_then(|s| s.pending_flush.as_ref())
                    .is_some_and(|p| p.flush_id == flush_id);
                if expired {
                    tracing::warn!(session_id, flush_id, "flush deadline expired");
                    self.finish_flush(session_id, false).await;
                }
            }
            TimerKind::StopDeadline { session_id } => {
                let expired = self
                    .sessions
                    .get(&session_id)
                    .is_some_and(|s| s.state == SessionState::Stopping && s.pending_stop.is_some());
                if expired {
                    tracing::warn!(session_id, "stop acks overdue; proceeding");
                    self.finish_stop(session_id).await;
                }
            }
            TimerKind::TriggerTimeout { session_id } => {
                let armed = self
                    .sessions
                    .get(&session_id)
                    .is_some_and(|s| s.state == SessionState::Armed);
                if armed {
                    tracing::info!(session_id, "start trigger never fired; disposing");
                    let consumer_id = self.sessions[&session_id].consumer;
                    if let Some(consumer) = self.consumers.get_mut(&consumer_id) {
                        consumer
                            .port
                            .tracing_disabled(session_id, Some("trigger timeout".into()));
                    }
                    self.dispose_session(session_id);
                }
            }
            TimerKind::PeriodicFlush { session_id } => {
                let Some((state, period)) = self
                    .sessions
                    .get(&session_id)
                    .map(|s| (s.state, s.config.flush_period_ms))
                else {
                    return;
                };
                match state {
                    SessionState::Running => {
                        self.begin_flush(session_id, None, self.cfg.ack_timeout, Vec::new())
                            .await;
                    }
                    SessionState::Flushing => {} // already flushing; skip this period
                    _ => return,                 // stopping or stopped: timer dies
                }
                if let Some(period_ms) = period {
                    self.schedule(
                        Duration::from_millis(u64::from(period_ms)),
                        TimerKind::PeriodicFlush { session_id },
                    );
                }
            }
            TimerKind::FileWritePeriod { session_id } => {
                let Some(session) = self.sessions.get_mut(&session_id) else {
                    return;
                };
                if !session.is_active() {
                    return;
                }
                if let Some(sink) = session.file_sink.as_mut() {
                    if let Err(e) = sink.flush().await {
                        tracing::warn!(session_id, error = %e, "periodic file flush failed");
                    }
                }
                if let Some(period_ms) = session.config.file_write_period_ms {
                    self.schedule(
                        Duration::from_millis(u64::from(period_ms)),
                        TimerKind::FileWritePeriod { session_id },
                    );
                }
            }
        }
    }
}
