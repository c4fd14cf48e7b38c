//! axum server exposing `POST /request`.

use crate::REQUEST_PATH;
use crate::headers;
use crate::socket::IncomingHttpSocket;
use axum::Router;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use async_trait::async_trait;
use bytes::Bytes;
use mice_transport::dispatch::Gate;
use mice_transport::{Context, Dispatch, Handler, Listener, Message, Result, TransportError};
use parking_lot::Mutex;
use std::net::SocketAddr;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Clone)]
struct AppState {
    handler: Handler,
    gate: Gate,
}

/// A bound HTTP endpoint. Every request to `POST /request` becomes one
/// inbound socket.
pub struct HttpListener {
    local_addr: SocketAddr,
    listener: Mutex<Option<tokio::net::TcpListener>>,
    dispatch: Dispatch,
    shutdown: CancellationToken,
}

impl HttpListener {
    pub(crate) fn new(listener: tokio::net::TcpListener, dispatch: Dispatch) -> Result<Self> {
        Ok(Self {
            local_addr: listener.local_addr()?,
            listener: Mutex::new(Some(listener)),
            dispatch,
            shutdown: CancellationToken::new(),
        })
    }
}

#[async_trait]
impl Listener for HttpListener {
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

        let state = AppState {
            handler,
            gate: self.dispatch.gate(),
        };
        let router = Router::new()
            .route(REQUEST_PATH, post(handle_request))
            .with_state(state);

        let shutdown = self.shutdown.clone();
        let ctx = ctx.clone();
        let stop = async move {
            tokio::select! {
                () = shutdown.cancelled() => {}
                err = ctx.done() => debug!("Stopping HTTP server: {}", err),
            }
        };

        info!("HTTP transport serving on {}", self.local_addr);
        axum::serve(listener, router)
            .with_graceful_shutdown(stop)
            .await
            .map_err(|e| TransportError::Http(e.to_string()))?;

        info!("HTTP server on {} stopped", self.local_addr);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.shutdown.cancel();
        drop(self.listener.lock().take());
        info!("Closed HTTP listener on {}", self.local_addr);
        Ok(())
    }
}

async fn handle_request(
    State(state): State<AppState>,
    request_headers: HeaderMap,
    body: Bytes,
) -> Response {
    let request = Message {
        headers: headers::from_http(&request_headers),
        data: body,
    };

    let _slot = state.gate.enter().await;
    let (respond, response) = oneshot::channel();
    state
        .handler
        .handle(Box::new(IncomingHttpSocket::new(request, respond)))
        .await;

    match response.await {
        Ok((headers, data)) => (StatusCode::OK, headers, data).into_response(),
        Err(_) => {
            warn!("Inbound exchange closed without a response");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "exchange closed without a response",
            )
                .into_response()
        }
    }
}
