//! Raw TCP transport with length-prefixed framing.
//!
//! Each message travels as one binary frame (see [`codec`]). Outbound
//! connections are pooled per destination by default; a pooled socket goes
//! back to its pool on close and is reused by the next dial. The server keeps
//! each connection open across exchanges so pooled clients can reuse it.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod codec;
pub mod listener;
pub mod socket;

use async_trait::async_trait;
use mice_transport::{
    Context, Dispatch, Listener, PoolConfig, PoolRegistry, PoolStatus, Result, Socket, Transport,
    TransportError,
};
use std::time::Duration;
use tracing::{debug, info, instrument};

pub use codec::{MAX_FRAME_SIZE, MessageCodec};
pub use listener::TcpListener;
pub use socket::{InboundTcpSocket, PooledTcpSocket, TcpConnector, TcpSocket};

/// Configuration for [`TcpTransport`].
#[derive(Debug, Clone)]
pub struct TcpConfig {
    /// Reuse outbound connections through a per-address pool.
    pub pooling: bool,
    /// Settings for each per-address pool.
    pub pool: PoolConfig,
    /// Timeout for establishing a new connection.
    pub connect_timeout: Duration,
    /// Largest frame accepted or produced.
    pub max_frame_size: usize,
    /// How inbound connections are scheduled.
    pub dispatch: Dispatch,
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            pooling: true,
            pool: PoolConfig::default(),
            connect_timeout: Duration::from_secs(5),
            max_frame_size: MAX_FRAME_SIZE,
            dispatch: Dispatch::default(),
        }
    }
}

impl TcpConfig {
    /// Enable or disable connection pooling.
    #[must_use]
    pub const fn with_pooling(mut self, pooling: bool) -> Self {
        self.pooling = pooling;
        self
    }

    /// Replace the pool settings.
    #[must_use]
    pub fn with_pool(mut self, pool: PoolConfig) -> Self {
        self.pool = pool;
        self
    }

    /// Destroy pooled connections idle for longer than `timeout`.
    #[must_use]
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.pool = self.pool.with_idle_timeout(timeout);
        self
    }

    /// Set the connect timeout.
    #[must_use]
    pub const fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the frame size limit.
    #[must_use]
    pub const fn with_max_frame_size(mut self, max: usize) -> Self {
        self.max_frame_size = max;
        self
    }

    /// Set the inbound scheduling policy.
    #[must_use]
    pub const fn with_dispatch(mut self, dispatch: Dispatch) -> Self {
        self.dispatch = dispatch;
        self
    }
}

/// TCP transport implementation.
#[derive(Debug)]
pub struct TcpTransport {
    config: TcpConfig,
    pools: PoolRegistry<TcpConnector>,
}

impl TcpTransport {
    /// Create a new TCP transport.
    #[must_use]
    pub fn new(config: TcpConfig) -> Self {
        let pools = PoolRegistry::new(config.pool.clone());
        Self { config, pools }
    }

    /// The transport's configuration.
    #[must_use]
    pub const fn config(&self) -> &TcpConfig {
        &self.config
    }

    /// Counters for the pool serving `addr`, if one has been created.
    pub async fn pool_status(&self, addr: &str) -> Option<PoolStatus> {
        self.pools.get(addr).await.map(|pool| pool.status())
    }

    /// Close every connection pool.
    pub async fn shutdown(&self) {
        self.pools.close_all().await;
        info!("TCP transport shut down");
    }
}

impl Default for TcpTransport {
    fn default() -> Self {
        Self::new(TcpConfig::default())
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn listen(&self, ctx: &Context, addr: &str) -> Result<Box<dyn Listener>> {
        let listener = ctx
            .run(async {
                tokio::net::TcpListener::bind(addr)
                    .await
                    .map_err(|source| TransportError::Bind {
                        addr: addr.to_string(),
                        source,
                    })
            })
            .await?;

        let listener = TcpListener::new(listener, self.config.dispatch, self.config.max_frame_size)?;
        info!("TCP transport listening on {}", listener.local_addr());
        Ok(Box::new(listener))
    }

    #[instrument(skip(self, ctx))]
    async fn dial(&self, ctx: &Context, addr: &str) -> Result<Box<dyn Socket>> {
        if !self.config.pooling {
            let socket = ctx
                .run(socket::connect(
                    addr,
                    self.config.connect_timeout,
                    self.config.max_frame_size,
                ))
                .await?;
            return Ok(Box::new(socket));
        }

        let pool = self
            .pools
            .get_or_create(addr, || {
                TcpConnector::new(addr, self.config.connect_timeout, self.config.max_frame_size)
            })
            .await;
        let conn = pool.get(ctx).await?;
        debug!("Borrowed pooled connection to {}", addr);
        Ok(Box::new(PooledTcpSocket::new(conn)))
    }
}
