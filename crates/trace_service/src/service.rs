//! The tracing service: one cooperative task owning all mutable state.
//!
//! Everything the controller touches - registries, sessions, the buffer
//! engine - is mutated only inside [`TracingService::run`], which
//! multiplexes the command channel with the periodic drain tick. Endpoint
//! handles and transports talk to it exclusively through
//! [`ServiceHandle`]. There are no globals: tests run several services in
//! one process by constructing several of these.

use crate::config::ServiceConfig;
use crate::controller::Controller;
use crate::endpoint::{ServiceEvent, ServiceHandle};
use crate::observer::{NullObserver, ServiceObserver};
use tokio::sync::mpsc;

pub struct TracingService {
    controller: Controller,
    rx: mpsc::UnboundedReceiver<ServiceEvent>,
    cfg: ServiceConfig,
}

impl TracingService {
    /// Builds a service and the handle transports use to reach it.
    pub fn new(cfg: ServiceConfig) -> (TracingService, ServiceHandle) {
        Self::with_observer(cfg, Box::new(NullObserver))
    }

    /// As [`TracingService::new`], with test observation hooks.
    pub fn with_observer(
        cfg: ServiceConfig,
        observer: Box<dyn ServiceObserver>,
    ) -> (TracingService, ServiceHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = ServiceHandle { tx };
        let controller = Controller::new(cfg.clone(), handle.clone(), observer);
        (
            TracingService {
                controller,
                rx,
                cfg,
            },
            handle,
        )
    }

    /// Runs the service loop until [`ServiceHandle::shutdown`] or until
    /// every handle (including timers in flight) is gone.
    pub async fn run(mut self) {
        let mut drain_tick = tokio::time::interval(self.cfg.drain_interval);
        drain_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                event = self.rx.recv() => match event {
                    Some(ServiceEvent::Shutdown) | None => break,
                    Some(event) => self.controller.handle_event(event).await,
                },
                _ = drain_tick.tick() => {
                    self.controller.drain_all().await;
                }
            }
        }
        tracing::info!("service loop exited");
    }
}
