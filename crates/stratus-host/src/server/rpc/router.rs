//! Pairs inbound worker streams with the channels waiting for them.
//!
//! A channel registers its worker id before launching the process. When the
//! worker connects and sends `StartStream`, [`RpcRouter::connect`] creates the
//! two frame queues, hands the host side to the waiting channel and returns
//! the worker side to whoever carries the transport (the gRPC service, or an
//! in-process worker in tests).

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use stratus_rpc_core::{Error, Result, proto::StreamingMessage, types::WorkerId};
use tokio::sync::{mpsc, oneshot};

const FRAME_BUFFER_SIZE: usize = 64;

/// Host side of a worker stream.
#[derive(Debug)]
pub struct WorkerConnection {
    pub inbound: mpsc::Receiver<StreamingMessage>,
    pub outbound: mpsc::Sender<StreamingMessage>,
}

/// Worker side of a worker stream.
#[derive(Debug)]
pub struct WorkerEndpoint {
    pub from_host: mpsc::Receiver<StreamingMessage>,
    pub to_host: mpsc::Sender<StreamingMessage>,
}

#[derive(Clone, Default)]
pub struct RpcRouter {
    pending: Arc<Mutex<HashMap<WorkerId, oneshot::Sender<WorkerConnection>>>>,
}

impl RpcRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserves `worker_id`; the receiver resolves when the worker connects.
    ///
    /// Registering an id twice replaces the earlier reservation, whose
    /// receiver then observes a closed channel.
    pub fn register(&self, worker_id: &str) -> oneshot::Receiver<WorkerConnection> {
        let (tx, rx) = oneshot::channel();
        if self.pending.lock().insert(worker_id.to_string(), tx).is_some() {
            tracing::warn!(%worker_id, "replacing pending worker registration");
        }
        rx
    }

    pub fn unregister(&self, worker_id: &str) {
        self.pending.lock().remove(worker_id);
    }

    pub fn is_pending(&self, worker_id: &str) -> bool {
        self.pending.lock().contains_key(worker_id)
    }

    /// Completes the handshake for `worker_id`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownWorker`] if nobody registered the id or the
    /// registering channel stopped waiting.
    pub fn connect(&self, worker_id: &str) -> Result<WorkerEndpoint> {
        let waiter = self
            .pending
            .lock()
            .remove(worker_id)
            .ok_or_else(|| Error::UnknownWorker {
                worker_id: worker_id.to_string(),
            })?;

        let (to_host, inbound) = mpsc::channel(FRAME_BUFFER_SIZE);
        let (outbound, from_host) = mpsc::channel(FRAME_BUFFER_SIZE);

        waiter
            .send(WorkerConnection { inbound, outbound })
            .map_err(|_| Error::UnknownWorker {
                worker_id: worker_id.to_string(),
            })?;

        tracing::debug!(%worker_id, "worker stream connected");
        Ok(WorkerEndpoint { from_host, to_host })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stratus_rpc_core::proto::{StartStream, streaming_message::Content};

    #[tokio::test]
    async fn connect_pairs_both_directions() {
        let router = RpcRouter::new();
        let pending = router.register("w1");
        assert!(router.is_pending("w1"));

        let mut endpoint = router.connect("w1").unwrap();
        let mut connection = pending.await.unwrap();
        assert!(!router.is_pending("w1"));

        let frame = StreamingMessage::new(
            "",
            Content::StartStream(StartStream {
                worker_id: "w1".into(),
            }),
        );
        endpoint.to_host.send(frame.clone()).await.unwrap();
        assert_eq!(connection.inbound.recv().await.unwrap(), frame);

        connection.outbound.send(frame.clone()).await.unwrap();
        assert_eq!(endpoint.from_host.recv().await.unwrap(), frame);
    }

    #[test]
    fn unknown_or_abandoned_ids_are_rejected() {
        let router = RpcRouter::new();
        assert!(matches!(
            router.connect("missing"),
            Err(Error::UnknownWorker { .. })
        ));

        drop(router.register("gone"));
        assert!(matches!(
            router.connect("gone"),
            Err(Error::UnknownWorker { .. })
        ));

        let _pending = router.register("w2");
        router.unregister("w2");
        assert!(router.connect("w2").is_err());
    }
}
