//! Observation hooks for tests.
//!
//! The controller has no global state, so tests can run several services
//! in one process; the observer gives them visibility into connection and
//! instance churn without widening the public API. Every method defaults
//! to a no-op.

use crate::{DataSourceId, InstanceId, SessionId};
use chunkring::ProducerId;

pub trait ServiceObserver: Send {
    fn producer_connected(&mut self, _producer: ProducerId) {}
    fn producer_disconnected(&mut self, _producer: ProducerId) {}
    fn data_source_registered(&mut self, _producer: ProducerId, _source: DataSourceId) {}
    fn data_source_unregistered(&mut self, _producer: ProducerId, _source: DataSourceId) {}
    fn instance_created(&mut self, _session: SessionId, _instance: InstanceId) {}
    fn instance_destroyed(&mut self, _session: SessionId, _instance: InstanceId) {}
}

/// The default observer: observes nothing.
pub struct NullObserver;

impl ServiceObserver for NullObserver {}
