//! Framed TCP sockets: outbound (plain or pooled) and inbound.

use crate::codec::MessageCodec;
use async_trait::async_trait;
use futures::{FutureExt, SinkExt, StreamExt};
use mice_transport::{Context, Manager, Message, Pooled, Result, Socket, TransportError};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{Mutex, oneshot};
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, trace};

/// One TCP connection carrying length-prefixed frames.
///
/// The read and write halves sit behind separate locks so one task can send
/// while another receives. Any I/O or framing error poisons the socket; a
/// poisoned socket is never reused. Neither is one with a request still
/// waiting for its reply, since that reply would reach the next borrower.
#[derive(Debug)]
pub struct TcpSocket {
    reader: Mutex<FramedRead<OwnedReadHalf, MessageCodec>>,
    writer: Mutex<FramedWrite<OwnedWriteHalf, MessageCodec>>,
    peer_addr: SocketAddr,
    poisoned: AtomicBool,
    unanswered: AtomicUsize,
}

impl TcpSocket {
    /// Wrap a connected stream.
    ///
    /// # Errors
    ///
    /// Fails if the stream is no longer connected.
    pub fn new(stream: TcpStream, max_frame_size: usize) -> Result<Self> {
        let peer_addr = stream.peer_addr()?;
        stream.set_nodelay(true)?;
        let (read, write) = stream.into_split();
        let codec = MessageCodec::with_max_frame_size(max_frame_size);

        Ok(Self {
            reader: Mutex::new(FramedRead::new(read, codec)),
            writer: Mutex::new(FramedWrite::new(write, codec)),
            peer_addr,
            poisoned: AtomicBool::new(false),
            unanswered: AtomicUsize::new(0),
        })
    }

    /// Address of the remote end.
    #[must_use]
    pub const fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Whether an earlier error left this connection unusable.
    #[must_use]
    pub fn is_poisoned(&self) -> bool {
        self.poisoned.load(Ordering::Acquire)
    }

    /// Whether a sent request has not been matched by a received reply.
    #[must_use]
    pub fn awaiting_reply(&self) -> bool {
        self.unanswered.load(Ordering::Acquire) > 0
    }

    /// Whether the connection can go back to a pool.
    #[must_use]
    pub fn is_reusable(&self) -> bool {
        !self.is_poisoned() && !self.awaiting_reply()
    }

    fn track<T>(&self, result: Result<T>) -> Result<T> {
        match &result {
            Err(e) if e.is_fatal() => {
                if !self.poisoned.swap(true, Ordering::AcqRel) {
                    debug!("Poisoned connection to {}: {}", self.peer_addr, e);
                }
            }
            _ => {}
        }
        result
    }

    async fn write_frame(&self, ctx: &Context, msg: &Message) -> Result<()> {
        let mut writer = ctx.run(async { Ok(self.writer.lock().await) }).await?;
        let result = ctx.run(writer.send(msg)).await;
        if result.is_ok() {
            self.unanswered.fetch_add(1, Ordering::AcqRel);
            trace!("Sent frame of {} bytes to {}", msg.data.len(), self.peer_addr);
        }
        self.track(result)
    }

    async fn read_frame(&self, ctx: &Context) -> Result<Message> {
        let mut reader = ctx.run(async { Ok(self.reader.lock().await) }).await?;
        let result = ctx
            .run(async {
                match reader.next().await {
                    Some(frame) => frame,
                    None => Err(TransportError::ConnectionClosed),
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

    /// Next frame with no cancellation; used by the server loop between
    /// exchanges.
    pub(crate) async fn next_frame(&self) -> Result<Message> {
        self.read_frame(&Context::background()).await
    }

    /// Non-blocking check that an idle connection is still usable.
    ///
    /// An idle connection must have nothing to read: end of stream, an error,
    /// or unsolicited bytes all mean it can no longer carry a clean exchange.
    ///
    /// # Errors
    ///
    /// Returns why the connection is unusable.
    pub fn probe(&self) -> Result<()> {
        if !self.is_reusable() {
            return Err(TransportError::ConnectionClosed);
        }
        let Ok(mut reader) = self.reader.try_lock() else {
            return Err(TransportError::ConnectionClosed);
        };
        if !reader.read_buffer().is_empty() {
            return Err(TransportError::MalformedFrame(
                "unsolicited data on idle connection".into(),
            ));
        }

        let mut byte = [0u8; 1];
        match reader.get_mut().peek(&mut byte).now_or_never() {
            None => Ok(()),
            Some(Ok(0)) => Err(TransportError::ConnectionClosed),
            Some(Ok(_)) => Err(TransportError::MalformedFrame(
                "unsolicited data on idle connection".into(),
            )),
            Some(Err(e)) => Err(TransportError::Io(e)),
        }
    }

    async fn shutdown(self) -> Result<()> {
        let mut writer = self.writer.into_inner().into_inner();
        match writer.shutdown().await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotConnected => Ok(()),
            Err(e) => Err(TransportError::Io(e)),
        }
    }
}

#[async_trait]
impl Socket for TcpSocket {
    async fn send(&self, ctx: &Context, msg: &Message) -> Result<()> {
        self.write_frame(ctx, msg).await
    }

    async fn receive(&self, ctx: &Context) -> Result<Message> {
        self.read_frame(ctx).await
    }

    async fn close(self: Box<Self>) -> Result<()> {
        debug!("Closing connection to {}", self.peer_addr);
        self.shutdown().await
    }
}

/// Open a new framed connection to `addr`.
pub(crate) async fn connect(
    addr: &str,
    connect_timeout: Duration,
    max_frame_size: usize,
) -> Result<TcpSocket> {
    let stream = tokio::time::timeout(connect_timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| {
            TransportError::connect(addr, format!("timed out after {connect_timeout:?}"))
        })?
        .map_err(|e| TransportError::connect(addr, e))?;

    debug!("Connected to {}", addr);
    TcpSocket::new(stream, max_frame_size)
}

/// Pool manager that opens and probes TCP connections for one address.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    addr: String,
    connect_timeout: Duration,
    max_frame_size: usize,
}

impl TcpConnector {
    /// Create a connector for `addr`.
    #[must_use]
    pub fn new(addr: impl Into<String>, connect_timeout: Duration, max_frame_size: usize) -> Self {
        Self {
            addr: addr.into(),
            connect_timeout,
            max_frame_size,
        }
    }
}

#[async_trait]
impl Manager for TcpConnector {
    type Connection = TcpSocket;

    async fn create(&self) -> Result<TcpSocket> {
        connect(&self.addr, self.connect_timeout, self.max_frame_size).await
    }

    async fn is_valid(&self, conn: &mut TcpSocket) -> Result<()> {
        conn.probe()
    }

    fn has_broken(&self, conn: &mut TcpSocket) -> bool {
        !conn.is_reusable()
    }
}

/// A [`TcpSocket`] borrowed from a pool. Closing returns it unless it is
/// poisoned or still owes a reply, in which case the connection is destroyed.
pub struct PooledTcpSocket {
    conn: Pooled<TcpConnector>,
}

impl PooledTcpSocket {
    pub(crate) const fn new(conn: Pooled<TcpConnector>) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl Socket for PooledTcpSocket {
    async fn send(&self, ctx: &Context, msg: &Message) -> Result<()> {
        self.conn.send(ctx, msg).await
    }

    async fn receive(&self, ctx: &Context) -> Result<Message> {
        self.conn.receive(ctx).await
    }

    async fn close(self: Box<Self>) -> Result<()> {
        let conn = self.conn;
        if conn.is_poisoned() {
            debug!("Destroying poisoned pooled connection to {}", conn.addr());
            conn.discard();
        } else if conn.awaiting_reply() {
            debug!("Destroying pooled connection to {} closed mid-exchange", conn.addr());
            conn.discard();
        } else {
            conn.release();
        }
        Ok(())
    }
}

/// Server side of one exchange on a kept-alive connection.
///
/// Holds the frame the serving loop already read. Closing hands the
/// connection back to the loop for the next exchange; dropping it without
/// closing ends the connection.
pub struct InboundTcpSocket {
    socket: TcpSocket,
    first: parking_lot::Mutex<Option<Message>>,
    release: oneshot::Sender<TcpSocket>,
}

impl InboundTcpSocket {
    pub(crate) fn new(socket: TcpSocket, first: Message, release: oneshot::Sender<TcpSocket>) -> Self {
        Self {
            socket,
            first: parking_lot::Mutex::new(Some(first)),
            release,
        }
    }
}

#[async_trait]
impl Socket for InboundTcpSocket {
    async fn send(&self, ctx: &Context, msg: &Message) -> Result<()> {
        self.socket.send(ctx, msg).await
    }

    async fn receive(&self, ctx: &Context) -> Result<Message> {
        let first = self.first.lock().take();
        match first {
            Some(msg) => Ok(msg),
            None => self.socket.receive(ctx).await,
        }
    }

    async fn close(self: Box<Self>) -> Result<()> {
        let Self {
            socket, release, ..
        } = *self;
        if socket.is_poisoned() {
            return socket.shutdown().await;
        }
        if let Err(socket) = release.send(socket) {
            return socket.shutdown().await;
        }
        Ok(())
    }
}
