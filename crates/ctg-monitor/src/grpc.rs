//! gRPC fan-out surface: the immediate per-sample stream and the periodic
//! batch stream, both backed by hub subscriptions.

use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::sync::mpsc;
use tokio_stream::Stream;
use tokio_util::sync::CancellationToken;
use tonic::transport::Server;
use tonic::{Request, Response, Status};
use tracing::info;

use ctg_grpc::ctg::ctg_stream_service_server::{CtgStreamService, CtgStreamServiceServer};
use ctg_grpc::ctg::{CtgBatchResponse, CtgDataResponse, StreamRequest};

use crate::hub::{FanoutHub, SubscriberFilter, SubscriberKind};

/// Server-streaming adapter over a hub subscription. Dropping it (client
/// disconnect or stream end) deregisters the subscriber, which closes the
/// hub-side channel exactly once.
pub struct SubscriberStream<T> {
    rx: mpsc::Receiver<T>,
    hub: Arc<FanoutHub>,
    kind: SubscriberKind,
    id: u64,
}

impl<T> Stream for SubscriberStream<T> {
    type Item = Result<T, Status>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx).map(|item| item.map(Ok))
    }
}

impl<T> Drop for SubscriberStream<T> {
    fn drop(&mut self) {
        let hub = self.hub.clone();
        let kind = self.kind;
        let id = self.id;
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move { hub.unsubscribe(kind, id).await });
        }
    }
}

pub struct CtgStreamServer {
    hub: Arc<FanoutHub>,
}

impl CtgStreamServer {
    pub fn new(hub: Arc<FanoutHub>) -> Self {
        Self { hub }
    }
}

#[tonic::async_trait]
impl CtgStreamService for CtgStreamServer {
    type StreamCTGDataStream = SubscriberStream<CtgDataResponse>;

    async fn stream_ctg_data(
        &self,
        request: Request<StreamRequest>,
    ) -> Result<Response<Self::StreamCTGDataStream>, Status> {
        let req = request.into_inner();
        info!(devices = ?req.device_ids, types = ?req.data_types, "stream client connected");
        let filter = SubscriberFilter {
            device_ids: req.device_ids,
            data_types: req.data_types,
        };
        let (id, rx) = self.hub.subscribe_stream(filter).await;
        Ok(Response::new(SubscriberStream {
            rx,
            hub: self.hub.clone(),
            kind: SubscriberKind::Stream,
            id,
        }))
    }

    type StreamBatchCTGDataStream = SubscriberStream<CtgBatchResponse>;

    async fn stream_batch_ctg_data(
        &self,
        request: Request<StreamRequest>,
    ) -> Result<Response<Self::StreamBatchCTGDataStream>, Status> {
        let req = request.into_inner();
        info!(devices = ?req.device_ids, "batch client connected");
        // Batch delivery filters by device only; batches are whole slices.
        let filter = SubscriberFilter {
            device_ids: req.device_ids,
            data_types: Vec::new(),
        };
        let (id, rx) = self.hub.subscribe_batch(filter).await;
        Ok(Response::new(SubscriberStream {
            rx,
            hub: self.hub.clone(),
            kind: SubscriberKind::Batch,
            id,
        }))
    }
}

pub async fn serve(
    hub: Arc<FanoutHub>,
    listen: SocketAddr,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    info!(%listen, "gRPC stream server listening");
    Server::builder()
        .add_service(CtgStreamServiceServer::new(CtgStreamServer::new(hub)))
        .serve_with_shutdown(listen, cancel.cancelled_owned())
        .await?;
    info!("gRPC stream server stopped");
    Ok(())
}
