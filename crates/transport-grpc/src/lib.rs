//! gRPC-tunnelled transport.
//!
//! Messages travel over the bidirectional `mice.Transport/Stream` call. Each
//! client socket owns one open call; pooled sockets keep their call open
//! between exchanges, and the server keeps its side open until the client
//! half-closes.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod listener;
pub mod proto;
pub mod socket;

use async_trait::async_trait;
use mice_transport::{
    Context, Dispatch, Listener, PoolConfig, PoolRegistry, PoolStatus, Result, Socket, Transport,
    TransportError,
};
use std::time::Duration;
use tracing::{debug, info, instrument};

pub use listener::GrpcListener;
pub use proto::{SERVICE_NAME, STREAM_PATH, WireMessage};
pub use socket::{GrpcConnector, GrpcStream, InboundGrpcSocket, PooledGrpcSocket};

/// Configuration for [`GrpcTransport`].
#[derive(Debug, Clone)]
pub struct GrpcConfig {
    /// Settings for each per-address pool.
    pub pool: PoolConfig,
    /// Timeout for establishing a channel.
    pub connect_timeout: Duration,
    /// How inbound exchanges are scheduled.
    pub dispatch: Dispatch,
}

impl Default for GrpcConfig {
    fn default() -> Self {
        Self {
            pool: PoolConfig::default(),
            connect_timeout: Duration::from_secs(5),
            dispatch: Dispatch::default(),
        }
    }
}

impl GrpcConfig {
    /// Replace the pool settings.
    #[must_use]
    pub fn with_pool(mut self, pool: PoolConfig) -> Self {
        self.pool = pool;
        self
    }

    /// Set the connect timeout.
    #[must_use]
    pub const fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the inbound scheduling policy.
    #[must_use]
    pub const fn with_dispatch(mut self, dispatch: Dispatch) -> Self {
        self.dispatch = dispatch;
        self
    }
}

/// gRPC transport implementation.
#[derive(Debug)]
pub struct GrpcTransport {
    config: GrpcConfig,
    pools: PoolRegistry<GrpcConnector>,
}

impl GrpcTransport {
    /// Create a new gRPC transport.
    #[must_use]
    pub fn new(config: GrpcConfig) -> Self {
        let pools = PoolRegistry::new(config.pool.clone());
        Self { config, pools }
    }

    /// Counters for the pool serving `addr`, if one has been created.
    pub async fn pool_status(&self, addr: &str) -> Option<PoolStatus> {
        self.pools.get(addr).await.map(|pool| pool.status())
    }

    /// Close every connection pool.
    pub async fn shutdown(&self) {
        self.pools.close_all().await;
        info!("gRPC transport shut down");
    }
}

impl Default for GrpcTransport {
    fn default() -> Self {
        Self::new(GrpcConfig::default())
    }
}

#[async_trait]
impl Transport for GrpcTransport {
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

        let listener = GrpcListener::new(listener, self.config.dispatch)?;
        info!("gRPC transport listening on {}", listener.local_addr());
        Ok(Box::new(listener))
    }

    #[instrument(skip(self, ctx))]
    async fn dial(&self, ctx: &Context, addr: &str) -> Result<Box<dyn Socket>> {
        let pool = self
            .pools
            .get_or_create(addr, || GrpcConnector::new(addr, self.config.connect_timeout))
            .await;
        let conn = pool.get(ctx).await?;
        debug!("Borrowed pooled gRPC stream to {}", addr);
        Ok(Box::new(PooledGrpcSocket::new(conn)))
    }
}
