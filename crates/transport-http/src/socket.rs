//! One-shot sockets over a single HTTP request/response exchange.

use crate::headers;
use async_trait::async_trait;
use bytes::Bytes;
use http::HeaderMap;
use mice_transport::{Context, Message, Result, Socket, TransportError};
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::debug;

/// Client side of one `POST /request`.
///
/// `send` performs the request and stores the response; `receive` returns it.
/// Each may succeed at most once.
pub struct OutgoingHttpSocket {
    client: reqwest::Client,
    url: String,
    response_tx: Mutex<Option<oneshot::Sender<Result<Message>>>>,
    response_rx: tokio::sync::Mutex<Option<oneshot::Receiver<Result<Message>>>>,
}

impl OutgoingHttpSocket {
    pub(crate) fn new(client: reqwest::Client, url: String) -> Self {
        let (tx, rx) = oneshot::channel();
        Self {
            client,
            url,
            response_tx: Mutex::new(Some(tx)),
            response_rx: tokio::sync::Mutex::new(Some(rx)),
        }
    }

    /// Target URL.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    async fn post(&self, msg: &Message, headers: HeaderMap) -> Result<Result<Message>> {
        let response = self
            .client
            .post(&self.url)
            .headers(headers)
            .body(msg.data.clone())
            .send()
            .await
            .map_err(|e| TransportError::Http(e.to_string()))?;

        let status = response.status();
        let headers = headers::from_http(response.headers());
        let data = response
            .bytes()
            .await
            .map_err(|e| TransportError::Http(e.to_string()))?;

        if !status.is_success() {
            debug!("POST {} answered {}", self.url, status);
            return Ok(Err(TransportError::Http(format!(
                "{} answered {status}",
                self.url
            ))));
        }
        Ok(Ok(Message { headers, data }))
    }
}

#[async_trait]
impl Socket for OutgoingHttpSocket {
    async fn send(&self, ctx: &Context, msg: &Message) -> Result<()> {
        let headers = headers::to_http(&msg.headers)?;
        let Some(tx) = self.response_tx.lock().take() else {
            return Err(TransportError::AlreadySent);
        };

        // On failure `tx` is dropped and a pending receive sees
        // `ConnectionClosed`.
        let outcome = ctx.run(self.post(msg, headers)).await?;
        let _ = tx.send(outcome);
        Ok(())
    }

    async fn receive(&self, ctx: &Context) -> Result<Message> {
        let mut slot = ctx.run(async { Ok(self.response_rx.lock().await) }).await?;
        let Some(rx) = slot.as_mut() else {
            return Err(TransportError::AlreadyReceived);
        };

        let outcome = ctx
            .run(async { rx.await.map_err(|_| TransportError::ConnectionClosed) })
            .await?;
        *slot = None;
        outcome
    }

    async fn close(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

/// Server side of one accepted HTTP request.
///
/// `receive` yields the request once; `send` answers it once. Closing or
/// dropping without sending answers with status 500.
pub struct IncomingHttpSocket {
    request: Mutex<Option<Message>>,
    respond: Mutex<Option<oneshot::Sender<(HeaderMap, Bytes)>>>,
}

impl IncomingHttpSocket {
    pub(crate) fn new(request: Message, respond: oneshot::Sender<(HeaderMap, Bytes)>) -> Self {
        Self {
            request: Mutex::new(Some(request)),
            respond: Mutex::new(Some(respond)),
        }
    }
}

#[async_trait]
impl Socket for IncomingHttpSocket {
    async fn send(&self, _ctx: &Context, msg: &Message) -> Result<()> {
        let headers = headers::to_http(&msg.headers)?;
        let Some(respond) = self.respond.lock().take() else {
            return Err(TransportError::AlreadySent);
        };
        respond
            .send((headers, msg.data.clone()))
            .map_err(|_| TransportError::ConnectionClosed)
    }

    async fn receive(&self, _ctx: &Context) -> Result<Message> {
        self.request
            .lock()
            .take()
            .ok_or(TransportError::AlreadyReceived)
    }

    async fn close(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_incoming_is_single_shot() {
        let (tx, rx) = oneshot::channel();
        let socket = IncomingHttpSocket::new(Message::from("req"), tx);
        let ctx = Context::background();

        assert_eq!(socket.receive(&ctx).await.unwrap().data, "req");
        assert!(matches!(
            socket.receive(&ctx).await,
            Err(TransportError::AlreadyReceived)
        ));

        socket
            .send(&ctx, &Message::from("first").with_header("k", "v"))
            .await
            .unwrap();
        assert!(matches!(
            socket.send(&ctx, &Message::from("second")).await,
            Err(TransportError::AlreadySent)
        ));

        let (headers, body) = rx.await.unwrap();
        assert_eq!(body, "first");
        assert_eq!(headers["x-mice-k"], "v");
    }

    #[tokio::test]
    async fn test_incoming_close_without_send_drops_responder() {
        let (tx, rx) = oneshot::channel();
        let socket = Box::new(IncomingHttpSocket::new(Message::default(), tx));
        socket.close().await.unwrap();
        assert!(rx.await.is_err());
    }

    #[tokio::test]
    async fn test_outgoing_receive_after_failed_send() {
        let socket = OutgoingHttpSocket::new(reqwest::Client::new(), "http://127.0.0.1:1/request".into());
        let ctx = Context::background();

        assert!(socket.send(&ctx, &Message::from("x")).await.is_err());
        assert!(matches!(
            socket.receive(&ctx).await,
            Err(TransportError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_outgoing_invalid_header_keeps_socket_usable() {
        let socket = OutgoingHttpSocket::new(reqwest::Client::new(), "http://127.0.0.1:1/request".into());
        let msg = Message::default().with_header("bad key", "v");

        let err = socket.send(&Context::background(), &msg).await.unwrap_err();
        assert!(matches!(err, TransportError::InvalidHeader { .. }));
        assert!(socket.response_tx.lock().is_some());
    }
}
