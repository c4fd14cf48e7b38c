//! Generic transport abstraction for point-to-point message exchange.
//!
//! This crate provides the backend-agnostic interface. Specific transport
//! implementations (raw TCP, gRPC, HTTP) are provided in separate crates.
//!
//! A caller [`Transport::dial`]s an address and gets a [`Socket`], sends one
//! [`Message`], receives the reply and closes the socket. A server
//! [`Transport::listen`]s on an address and hands every inbound exchange to a
//! [`SocketHandler`] through [`Listener::accept`].
//!
//! Transports handle:
//! - Wire framing for their backend
//! - Per-destination connection pooling (TCP and gRPC)
//! - Cancellation through [`Context`]
//!
//! Transports never retry. Retry and backoff belong to the caller.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod context;
pub mod dispatch;
pub mod error;
pub mod message;
pub mod pool;

use async_trait::async_trait;
use std::future::Future;
use std::net::SocketAddr;

pub use context::Context;
pub use dispatch::Dispatch;
pub use error::{Result, TransportError};
pub use message::Message;
pub use pool::{Manager, Pool, PoolConfig, PoolRegistry, PoolStatus, Pooled};

pub use error::TransportError as Error;

/// One logical bidirectional exchange channel.
///
/// Sends and receives are guarded independently: one task may send while
/// another receives, but two concurrent sends (or two concurrent receives)
/// on the same socket are serialized.
#[async_trait]
pub trait Socket: Send + Sync {
    /// Send one message.
    async fn send(&self, ctx: &Context, msg: &Message) -> Result<()>;

    /// Receive the next message.
    async fn receive(&self, ctx: &Context) -> Result<Message>;

    /// Release the socket: return it to its pool, hand the connection back to
    /// the server loop, or terminate it, depending on the backend.
    async fn close(self: Box<Self>) -> Result<()>;
}

/// A bound server endpoint that yields inbound sockets.
#[async_trait]
pub trait Listener: Send + Sync {
    /// The bound address.
    fn local_addr(&self) -> SocketAddr;

    /// Serve inbound exchanges until the listener is closed, `ctx` is
    /// cancelled, or the binding fails.
    async fn accept(&self, ctx: &Context, handler: Handler) -> Result<()>;

    /// Unbind and release all resources.
    async fn close(&self) -> Result<()>;
}

/// Entry point for one wire backend.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Bind a server endpoint.
    async fn listen(&self, ctx: &Context, addr: &str) -> Result<Box<dyn Listener>>;

    /// Establish or borrow a client socket.
    async fn dial(&self, ctx: &Context, addr: &str) -> Result<Box<dyn Socket>>;
}

/// Callback invoked with every inbound socket.
#[async_trait]
pub trait SocketHandler: Send + Sync + 'static {
    /// Perform one exchange on `socket`.
    async fn handle(&self, socket: Box<dyn Socket>);
}

#[async_trait]
impl<F, Fut> SocketHandler for F
where
    F: Fn(Box<dyn Socket>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    async fn handle(&self, socket: Box<dyn Socket>) {
        (self)(socket).await;
    }
}

/// Shared handle to a [`SocketHandler`].
pub type Handler = std::sync::Arc<dyn SocketHandler>;

/// Wrap a closure or handler type into a [`Handler`].
pub fn handler<H: SocketHandler>(handler: H) -> Handler {
    std::sync::Arc::new(handler)
}
