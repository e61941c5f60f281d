//! Per-session state.
//!
//! Lifecycle: `Configured -> (Armed ->) Running -> (Flushing <-> Running)
//! -> Stopping -> Stopped`, terminal. The controller drives every
//! transition; this module only holds the state and the small predicates
//! over it, so the controller code reads as the state machine itself.

use crate::config::TraceConfig;
use crate::endpoint::ReadBatch;
use crate::error::ServiceError;
use crate::{ConsumerId, InstanceId, RequestId, SessionId};
use chunkring::{BufferId, ProducerId};
use std::collections::{HashMap, HashSet, VecDeque};
use tokio::sync::oneshot;
use trace_collector::{ClockSnapshot, FileSink, Record};

/// How many completed flush results are remembered for request
/// deduplication.
const FLUSH_DEDUP_WINDOW: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Validated and reserved, not yet started.
    Configured,
    /// Waiting for a start trigger.
    Armed,
    Running,
    /// A flush is in flight; returns to Running.
    Flushing,
    /// Stop commands sent; waiting for acks or the deadline.
    Stopping,
    /// Terminal. Buffers retained until read or freed.
    Stopped,
}

/// One data-source instance: the (session, producer, source name) triple.
#[derive(Debug, Clone)]
pub struct Instance {
    pub producer_id: ProducerId,
    pub source_name: String,
    pub target_buffer: BufferId,
}

/// A flush in flight.
pub(crate) struct PendingFlush {
    pub flush_id: RequestId,
    /// Consumer request id, for the dedup window. Internal periodic
    /// flushes have none.
    pub request_id: Option<RequestId>,
    pub awaiting: HashSet<ProducerId>,
    pub replies: Vec<oneshot::Sender<Result<bool, ServiceError>>>,
}

/// A stop in flight.
pub(crate) struct PendingStop {
    pub awaiting: HashSet<InstanceId>,
}

pub(crate) struct Session {
    pub id: SessionId,
    pub consumer: ConsumerId,
    pub config: TraceConfig,
    pub state: SessionState,
    /// Service-global buffer ids, one per `config.buffers` entry.
    pub buffer_ids: Vec<BufferId>,
    pub instances: HashMap<InstanceId, Instance>,
    pub pending_flush: Option<PendingFlush>,
    /// Recently completed consumer flushes, for retransmission dedup.
    pub completed_flushes: VecDeque<(RequestId, bool)>,
    pub flushes_done: u64,
    /// Metadata records queued behind the data records.
    pub metadata: VecDeque<Record>,
    pub file_sink: Option<FileSink>,
    pub start_clock: ClockSnapshot,
    pub reserved_bytes: u64,
    pub pending_stop: Option<PendingStop>,
    pub dispose_when_stopped: bool,
    pub abort_reason: Option<String>,
}

impl Session {
    /// Maps a config-relative buffer index to its service-global id.
    pub fn global_buffer_id(&self, index: u32) -> Option<BufferId> {
        self.buffer_ids.get(index as usize).copied()
    }

    /// Producers that currently hold instances of this session.
    pub fn producers_with_instances(&self) -> HashSet<ProducerId> {
        self.instances.values().map(|i| i.producer_id).collect()
    }

    /// Instance ids owned by one producer.
    pub fn instances_of(&self, producer: ProducerId) -> Vec<InstanceId> {
        self.instances
            .iter()
            .filter(|(_, inst)| inst.producer_id == producer)
            .map(|(id, _)| *id)
            .collect()
    }

    /// True while producer-side work can still arrive.
    pub fn is_active(&self) -> bool {
        matches!(
            self.state,
            SessionState::Running | SessionState::Flushing | SessionState::Stopping
        )
    }

    /// Remembers a finished consumer flush for retransmissions.
    pub fn remember_flush(&mut self, request_id: Option<RequestId>, success: bool) {
        if let Some(request_id) = request_id {
            if self.completed_flushes.len() >= FLUSH_DEDUP_WINDOW {
                self.completed_flushes.pop_front();
            }
            self.completed_flushes.push_back((request_id, success));
        }
    }

    /// Looks up a retransmitted flush request.
    pub fn recall_flush(&self, request_id: RequestId) -> Option<bool> {
        self.completed_flushes
            .iter()
            .rev()
            .find(|(id, _)| *id == request_id)
            .map(|(_, ok)| *ok)
    }

    /// Builds one read batch: data records first, queued metadata only
    /// once the data is drained (a flush's metadata record must follow
    /// the records it covers).
    pub fn assemble_batch(&mut self, records: Vec<Record>, data_has_more: bool) -> ReadBatch {
        let mut records = records;
        if !data_has_more {
            records.extend(self.metadata.drain(..));
        }
        ReadBatch {
            has_more: data_has_more,
            records,
        }
    }

    /// Whether a start trigger with any of `names` fires this session.
    pub fn start_trigger_matches(&self, names: &[String]) -> bool {
        self.state == SessionState::Armed
            && self.config.triggers.as_ref().is_some_and(|t| {
                matches!(t.mode, crate::config::TriggerMode::StartTracing)
                    && t.trigger_names.iter().any(|n| names.contains(n))
            })
    }

    /// Whether a stop trigger with any of `names` stops this session.
    pub fn stop_trigger_matches(&self, names: &[String]) -> bool {
        matches!(self.state, SessionState::Running | SessionState::Flushing)
            && self.config.triggers.as_ref().is_some_and(|t| {
                matches!(t.mode, crate::config::TriggerMode::StopTracing)
                    && t.trigger_names.iter().any(|n| names.contains(n))
            })
    }
}
