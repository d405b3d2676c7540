//! In-process event bus.
//!
//! Channels, process supervisors and the specialization manager publish
//! [`HostEvent`]s; the dispatcher and the host composition root subscribe to
//! the subset they act on. Publishing never blocks and never fails: an event
//! with no live subscriber is dropped.

use std::time::Instant;
use stratus_rpc_core::{Error, types::WorkerId};
use tokio::sync::broadcast;

const EVENT_BUS_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub enum HostEvent {
    /// A channel finished its init handshake.
    ChannelReady { language: String, worker_id: WorkerId },
    /// A worker faulted; subject to the restart cap.
    WorkerError(WorkerHealthEvent),
    /// A worker asked to be replaced; never capped.
    WorkerRestart(WorkerHealthEvent),
    /// The host must rebuild its dispatcher (e.g. after specialization).
    HostRestart,
}

#[derive(Debug, Clone)]
pub struct WorkerHealthEvent {
    pub language: String,
    pub worker_id: WorkerId,
    pub created_at: Instant,
    /// Set for `WorkerError`, empty for `WorkerRestart`.
    pub fault: Option<Error>,
}

impl WorkerHealthEvent {
    pub fn error(language: impl Into<String>, worker_id: impl Into<WorkerId>, fault: Error) -> Self {
        Self {
            language: language.into(),
            worker_id: worker_id.into(),
            created_at: Instant::now(),
            fault: Some(fault),
        }
    }

    pub fn restart(language: impl Into<String>, worker_id: impl Into<WorkerId>) -> Self {
        Self {
            language: language.into(),
            worker_id: worker_id.into(),
            created_at: Instant::now(),
            fault: None,
        }
    }
}

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<HostEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_BUS_CAPACITY);
        Self { tx }
    }

    pub fn publish(&self, event: HostEvent) {
        tracing::trace!(?event, "publishing host event");
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HostEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn every_subscriber_sees_every_event() {
        let bus = EventBus::new();
        let mut first = bus.subscribe();
        let mut second = bus.subscribe();

        bus.publish(HostEvent::ChannelReady {
            language: "node".into(),
            worker_id: "w1".into(),
        });
        bus.publish(HostEvent::WorkerRestart(WorkerHealthEvent::restart("node", "w1")));

        for rx in [&mut first, &mut second] {
            assert!(matches!(rx.recv().await.unwrap(), HostEvent::ChannelReady { .. }));
            match rx.recv().await.unwrap() {
                HostEvent::WorkerRestart(event) => {
                    assert_eq!(event.worker_id, "w1");
                    assert!(event.fault.is_none());
                }
                other => panic!("unexpected event: {other:?}"),
            }
        }
    }

    #[test]
    fn publishing_without_subscribers_is_silent() {
        EventBus::new().publish(HostEvent::HostRestart);
    }
}
