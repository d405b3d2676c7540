//! gRPC entry point for language workers.
//!
//! [`FunctionRpcService`] implements the generated `FunctionRpc` service. Each
//! worker opens exactly one `EventStream`; the first frame must be
//! `StartStream` naming the worker id the host launched it with. After that
//! the service is a pipe: inbound frames go to the channel that registered the
//! id, and the channel's outbound frames are streamed back.

use crate::server::rpc::router::RpcRouter;
use core::pin::Pin;
use futures::StreamExt;
use stratus_rpc_core::{
    Error,
    proto::{StreamingMessage, function_rpc_server::FunctionRpc, streaming_message::Content},
};
use tokio_stream::{Stream, wrappers::ReceiverStream};
use tonic::{Request, Response, Status, Streaming};

#[derive(Clone)]
pub struct FunctionRpcService {
    router: RpcRouter,
}

impl FunctionRpcService {
    pub fn new(router: RpcRouter) -> Self {
        Self { router }
    }
}

#[tonic::async_trait]
impl FunctionRpc for FunctionRpcService {
    type EventStreamStream = Pin<Box<dyn Stream<Item = Result<StreamingMessage, Status>> + Send>>;

    #[tracing::instrument(skip_all)]
    async fn event_stream(
        &self,
        req: Request<Streaming<StreamingMessage>>,
    ) -> Result<Response<Self::EventStreamStream>, Status> {
        let mut inbound = req.into_inner();

        let first = inbound
            .message()
            .await?
            .ok_or_else(|| Error::protocol("stream closed before StartStream"))?;
        let worker_id = match first.content {
            Some(Content::StartStream(start)) if !start.worker_id.is_empty() => start.worker_id,
            _ => {
                return Err(Error::protocol(format!(
                    "expected StartStream as first frame, got {}",
                    first.kind()
                ))
                .into());
            }
        };

        let endpoint = self.router.connect(&worker_id)?;
        let to_host = endpoint.to_host;

        tokio::spawn(async move {
            loop {
                match inbound.message().await {
                    Ok(Some(frame)) => {
                        if to_host.send(frame).await.is_err() {
                            tracing::debug!(%worker_id, "channel dropped, closing inbound pipe");
                            break;
                        }
                    }
                    Ok(None) => {
                        tracing::debug!(%worker_id, "worker closed its stream");
                        break;
                    }
                    Err(status) => {
                        tracing::warn!(%worker_id, %status, "worker stream failed");
                        break;
                    }
                }
            }
        });

        let outbound = ReceiverStream::new(endpoint.from_host).map(Ok);
        Ok(Response::new(Box::pin(outbound)))
    }
}
