//! Embedded tonic server feeding inbound streams to a handler.

use crate::proto::TransportServer;
use crate::socket::{GrpcStream, InboundGrpcSocket};
use async_trait::async_trait;
use mice_transport::dispatch::Gate;
use mice_transport::{Context, Dispatch, Handler, Listener, Result, TransportError};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio_stream::wrappers::TcpListenerStream;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tonic::transport::Server;
use tracing::{debug, info, warn};

/// A bound gRPC endpoint. The server starts on [`Listener::accept`] and stops
/// on [`Listener::close`].
pub struct GrpcListener {
    local_addr: SocketAddr,
    listener: Mutex<Option<tokio::net::TcpListener>>,
    dispatch: Dispatch,
    shutdown: CancellationToken,
    tasks: TaskTracker,
}

impl GrpcListener {
    pub(crate) fn new(listener: tokio::net::TcpListener, dispatch: Dispatch) -> Result<Self> {
        Ok(Self {
            local_addr: listener.local_addr()?,
            listener: Mutex::new(Some(listener)),
            dispatch,
            shutdown: CancellationToken::new(),
            tasks: TaskTracker::new(),
        })
    }
}

#[async_trait]
impl Listener for GrpcListener {
    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    async fn accept(&self, ctx: &Context, handler: Handler) -> Result<()> {
        let listener = self.listener.lock().take().ok_or_else(|| {
            if self.shutdown.is_cancelled() {
                TransportError::ListenerClosed
            } else {
                TransportError::AlreadyAccepting
            }
        })?;

        let gate = self.dispatch.gate();
        let tasks = self.tasks.clone();
        let streams_shutdown = self.shutdown.clone();
        let service = TransportServer::new(move |stream: GrpcStream| {
            tasks.spawn(serve_stream(
                stream,
                Arc::clone(&handler),
                gate.clone(),
                streams_shutdown.clone(),
            ));
        });

        let shutdown = self.shutdown.clone();
        let ctx = ctx.clone();
        let stop = async move {
            tokio::select! {
                () = shutdown.cancelled() => {}
                err = ctx.done() => {
                    debug!("Stopping gRPC server: {}", err);
                    shutdown.cancel();
                }
            }
        };

        info!("gRPC transport serving on {}", self.local_addr);
        Server::builder()
            .add_service(service)
            .serve_with_incoming_shutdown(TcpListenerStream::new(listener), stop)
            .await
            .map_err(|e| TransportError::Grpc(e.to_string()))?;

        info!("gRPC server on {} stopped", self.local_addr);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.shutdown.cancel();
        drop(self.listener.lock().take());
        self.tasks.close();
        self.tasks.wait().await;
        info!("Closed gRPC listener on {}", self.local_addr);
        Ok(())
    }
}

async fn serve_stream(
    mut stream: GrpcStream,
    handler: Handler,
    gate: Gate,
    shutdown: CancellationToken,
) {
    loop {
        let next = tokio::select! {
            () = shutdown.cancelled() => break,
            next = stream.next_message() => next,
        };
        let first = match next {
            Ok(msg) => msg,
            Err(TransportError::ConnectionClosed) => {
                debug!("gRPC stream half-closed by client");
                break;
            }
            Err(e) => {
                warn!("Ending gRPC stream: {}", e);
                break;
            }
        };

        let slot = tokio::select! {
            slot = gate.enter() => slot,
            () = shutdown.cancelled() => break,
        };

        let (release, returned) = oneshot::channel();
        handler
            .handle(Box::new(InboundGrpcSocket::new(stream, first, release)))
            .await;

        stream = tokio::select! {
            () = shutdown.cancelled() => break,
            returned = returned => match returned {
                Ok(stream) => stream,
                Err(_) => {
                    debug!("gRPC stream released by handler");
                    break;
                }
            },
        };
        drop(slot);
    }
}
