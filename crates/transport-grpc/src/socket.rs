//! Sockets tunnelled over one long-lived `Stream` call.

use crate::proto::{WireMessage, open_stream, status_error};
use async_trait::async_trait;
use futures::FutureExt;
use mice_transport::{Context, Manager, Message, Pooled, Result, Socket, TransportError};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, mpsc, oneshot};
use tonic::Streaming;
use tonic::transport::{Channel, Endpoint};
use tracing::debug;

/// Both halves of one bidirectional `Stream` call.
///
/// The outgoing half is a bounded channel feeding the request (client) or
/// response (server) body; the incoming half is tonic's decoded stream behind
/// a receive guard.
pub struct GrpcStream {
    outbound: mpsc::Sender<WireMessage>,
    inbound: Mutex<Streaming<WireMessage>>,
    poisoned: AtomicBool,
    unanswered: AtomicUsize,
    _channel: Option<Channel>,
}

impl GrpcStream {
    pub(crate) fn new(
        outbound: mpsc::Sender<WireMessage>,
        inbound: Streaming<WireMessage>,
        channel: Option<Channel>,
    ) -> Self {
        Self {
            outbound,
            inbound: Mutex::new(inbound),
            poisoned: AtomicBool::new(false),
            unanswered: AtomicUsize::new(0),
            _channel: channel,
        }
    }

    /// Whether an earlier error ended this stream.
    #[must_use]
    pub fn is_poisoned(&self) -> bool {
        self.poisoned.load(Ordering::Acquire)
    }

    /// Whether a sent request has not been matched by a received reply.
    #[must_use]
    pub fn awaiting_reply(&self) -> bool {
        self.unanswered.load(Ordering::Acquire) > 0
    }

    /// Whether the stream can go back to a pool.
    #[must_use]
    pub fn is_reusable(&self) -> bool {
        !self.is_poisoned() && !self.awaiting_reply()
    }

    fn track<T>(&self, result: Result<T>) -> Result<T> {
        match &result {
            Err(e) if e.is_fatal() => {
                if !self.poisoned.swap(true, Ordering::AcqRel) {
                    debug!("Poisoned gRPC stream: {}", e);
                }
            }
            _ => {}
        }
        result
    }

    /// Next message with no cancellation; used by the server loop between
    /// exchanges.
    pub(crate) async fn next_message(&self) -> Result<Message> {
        self.receive(&Context::background()).await
    }

    /// Non-blocking check that an idle stream can carry another exchange.
    ///
    /// # Errors
    ///
    /// Returns why the stream is unusable: it has ended, failed, delivered
    /// an unsolicited message, or its outgoing half is closed.
    pub fn probe(&self) -> Result<()> {
        if !self.is_reusable() || self.outbound.is_closed() {
            return Err(TransportError::ConnectionClosed);
        }
        let Ok(mut inbound) = self.inbound.try_lock() else {
            return Err(TransportError::ConnectionClosed);
        };

        match inbound.message().now_or_never() {
            None => Ok(()),
            Some(Ok(None)) => Err(TransportError::ConnectionClosed),
            Some(Ok(Some(_))) => Err(TransportError::Grpc(
                "unsolicited message on idle stream".into(),
            )),
            Some(Err(status)) => Err(status_error(&status)),
        }
    }
}

#[async_trait]
impl Socket for GrpcStream {
    async fn send(&self, ctx: &Context, msg: &Message) -> Result<()> {
        let wire = WireMessage::from(msg.clone());
        let result = ctx
            .run(async {
                self.outbound
                    .send(wire)
                    .await
                    .map_err(|_| TransportError::ConnectionClosed)
            })
            .await;
        if result.is_ok() {
            self.unanswered.fetch_add(1, Ordering::AcqRel);
        }
        self.track(result)
    }

    async fn receive(&self, ctx: &Context) -> Result<Message> {
        let mut inbound = ctx.run(async { Ok(self.inbound.lock().await) }).await?;
        let result = ctx
            .run(async {
                match inbound.message().await {
                    Ok(Some(wire)) => Ok(Message::from(wire)),
                    Ok(None) => Err(TransportError::ConnectionClosed),
                    Err(status) => Err(status_error(&status)),
                }
            })
            .await;
        if result.is_ok() {
            let _ = self
                .unanswered
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        }
        self.track(result)
    }

    async fn close(self: Box<Self>) -> Result<()> {
        debug!("Closing gRPC stream");
        Ok(())
    }
}

/// Pool manager that opens a channel and a `Stream` call per connection.
#[derive(Debug, Clone)]
pub struct GrpcConnector {
    addr: String,
    connect_timeout: Duration,
}

impl GrpcConnector {
    /// Create a connector for `addr` (`host:port`).
    #[must_use]
    pub fn new(addr: impl Into<String>, connect_timeout: Duration) -> Self {
        Self {
            addr: addr.into(),
            connect_timeout,
        }
    }
}

#[async_trait]
impl Manager for GrpcConnector {
    type Connection = GrpcStream;

    async fn create(&self) -> Result<GrpcStream> {
        let endpoint = Endpoint::from_shared(format!("http://{}", self.addr))
            .map_err(|e| TransportError::InvalidAddress(format!("{}: {}", self.addr, e)))?
            .connect_timeout(self.connect_timeout);
        let channel = endpoint
            .connect()
            .await
            .map_err(|e| TransportError::connect(&self.addr, e))?;

        let (outbound, inbound) = open_stream(channel.clone()).await?;
        debug!("Opened gRPC stream to {}", self.addr);
        Ok(GrpcStream::new(outbound, inbound, Some(channel)))
    }

    async fn is_valid(&self, conn: &mut GrpcStream) -> Result<()> {
        conn.probe()
    }

    fn has_broken(&self, conn: &mut GrpcStream) -> bool {
        !conn.is_reusable()
    }
}

/// A [`GrpcStream`] borrowed from a pool. Closing returns it unless it is
/// poisoned or still owes a reply.
pub struct PooledGrpcSocket {
    conn: Pooled<GrpcConnector>,
}

impl PooledGrpcSocket {
    pub(crate) const fn new(conn: Pooled<GrpcConnector>) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl Socket for PooledGrpcSocket {
    async fn send(&self, ctx: &Context, msg: &Message) -> Result<()> {
        self.conn.send(ctx, msg).await
    }

    async fn receive(&self, ctx: &Context) -> Result<Message> {
        self.conn.receive(ctx).await
    }

    async fn close(self: Box<Self>) -> Result<()> {
        let conn = self.conn;
        if conn.is_poisoned() {
            debug!("Destroying poisoned gRPC stream to {}", conn.addr());
            conn.discard();
        } else if conn.awaiting_reply() {
            debug!("Destroying gRPC stream to {} closed mid-exchange", conn.addr());
            conn.discard();
        } else {
            conn.release();
        }
        Ok(())
    }
}

/// Server side of one exchange on a kept-open stream.
///
/// Closing hands the stream back to the serving task so the client can run
/// its next exchange on it; dropping without closing ends the call.
pub struct InboundGrpcSocket {
    stream: GrpcStream,
    first: parking_lot::Mutex<Option<Message>>,
    release: oneshot::Sender<GrpcStream>,
}

impl InboundGrpcSocket {
    pub(crate) fn new(stream: GrpcStream, first: Message, release: oneshot::Sender<GrpcStream>) -> Self {
        Self {
            stream,
            first: parking_lot::Mutex::new(Some(first)),
            release,
        }
    }
}

#[async_trait]
impl Socket for InboundGrpcSocket {
    async fn send(&self, ctx: &Context, msg: &Message) -> Result<()> {
        self.stream.send(ctx, msg).await
    }

    async fn receive(&self, ctx: &Context) -> Result<Message> {
        let first = self.first.lock().take();
        match first {
            Some(msg) => Ok(msg),
            None => self.stream.receive(ctx).await,
        }
    }

    async fn close(self: Box<Self>) -> Result<()> {
        let Self {
            stream, release, ..
        } = *self;
        if !stream.is_poisoned() {
            // A send error means the serving task is gone; the stream ends
            // with it.
            let _ = release.send(stream);
        }
        Ok(())
    }
}
