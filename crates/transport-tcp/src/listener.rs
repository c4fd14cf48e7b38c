//! TCP accept loop and per-connection serving.

use crate::socket::{InboundTcpSocket, TcpSocket};
use async_trait::async_trait;
use mice_transport::dispatch::Gate;
use mice_transport::{Context, Dispatch, Handler, Listener, Result, TransportError};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

/// A bound TCP endpoint.
///
/// Every accepted connection gets a serving task. The task reads the first
/// frame of an exchange, hands the handler an inbound socket primed with it,
/// and waits for the socket to be closed before reading the next exchange,
/// so one client connection can carry many sequential exchanges. The
/// dispatch policy bounds exchanges, not connections.
pub struct TcpListener {
    local_addr: SocketAddr,
    listener: Mutex<Option<Arc<tokio::net::TcpListener>>>,
    dispatch: Dispatch,
    max_frame_size: usize,
    shutdown: CancellationToken,
    tasks: TaskTracker,
}

impl TcpListener {
    pub(crate) fn new(
        listener: tokio::net::TcpListener,
        dispatch: Dispatch,
        max_frame_size: usize,
    ) -> Result<Self> {
        Ok(Self {
            local_addr: listener.local_addr()?,
            listener: Mutex::new(Some(Arc::new(listener))),
            dispatch,
            max_frame_size,
            shutdown: CancellationToken::new(),
            tasks: TaskTracker::new(),
        })
    }
}

#[async_trait]
impl Listener for TcpListener {
    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    async fn accept(&self, ctx: &Context, handler: Handler) -> Result<()> {
        let listener = self
            .listener
            .lock()
            .clone()
            .ok_or(TransportError::ListenerClosed)?;
        let gate = self.dispatch.gate();

        info!("Accepting TCP connections on {}", self.local_addr);

        loop {
            let (stream, peer) = tokio::select! {
                () = self.shutdown.cancelled() => break,
                err = ctx.done() => {
                    debug!("Stopped accepting on {}: {}", self.local_addr, err);
                    break;
                }
                accepted = listener.accept() => match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        error!("Failed to accept connection on {}: {}", self.local_addr, e);
                        return Err(TransportError::Io(e));
                    }
                },
            };

            let socket = match TcpSocket::new(stream, self.max_frame_size) {
                Ok(socket) => socket,
                Err(e) => {
                    warn!("Dropping connection from {}: {}", peer, e);
                    continue;
                }
            };
            debug!("Accepted connection from {}", peer);

            let handler = Arc::clone(&handler);
            let gate = gate.clone();
            let shutdown = self.shutdown.clone();
            self.tasks.spawn(serve_connection(socket, handler, gate, shutdown));
        }

        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if self.listener.lock().take().is_none() {
            return Ok(());
        }
        self.shutdown.cancel();
        self.tasks.close();
        self.tasks.wait().await;
        info!("Closed TCP listener on {}", self.local_addr);
        Ok(())
    }
}

/// Serve exchanges on one connection until the peer leaves or the listener
/// closes. A dispatch slot is held only while an exchange is in the handler's
/// hands, never while the connection sits idle between exchanges.
async fn serve_connection(
    mut socket: TcpSocket,
    handler: Handler,
    gate: Gate,
    shutdown: CancellationToken,
) {
    let peer = socket.peer_addr();

    loop {
        let next = tokio::select! {
            () = shutdown.cancelled() => break,
            next = socket.next_frame() => next,
        };
        let first = match next {
            Ok(msg) => msg,
            Err(TransportError::ConnectionClosed) => {
                debug!("Connection from {} closed by peer", peer);
                break;
            }
            Err(e) => {
                warn!("Closing connection from {}: {}", peer, e);
                break;
            }
        };

        let slot = tokio::select! {
            () = shutdown.cancelled() => break,
            slot = gate.enter() => slot,
        };

        let (release, returned) = oneshot::channel();
        handler
            .handle(Box::new(InboundTcpSocket::new(socket, first, release)))
            .await;

        let returned = tokio::select! {
            () = shutdown.cancelled() => break,
            returned = returned => returned,
        };
        drop(slot);

        socket = match returned {
            Ok(socket) => socket,
            Err(_) => {
                debug!("Connection from {} released by handler", peer);
                break;
            }
        };
    }
}
