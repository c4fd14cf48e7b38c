//! HTTP request/response transport.
//!
//! One outgoing socket is one `POST http://<addr>/request`; one inbound
//! socket is one accepted request. Message headers travel as `X-Mice-<key>`
//! HTTP headers and the payload is the raw body. Sockets are single-shot and
//! never pooled.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod headers;
pub mod listener;
pub mod socket;

use async_trait::async_trait;
use mice_transport::{Context, Dispatch, Listener, Result, Socket, Transport, TransportError};
use reqwest::Client;
use std::time::Duration;
use tracing::{info, warn};

pub use headers::HEADER_PREFIX;
pub use listener::HttpListener;
pub use socket::{IncomingHttpSocket, OutgoingHttpSocket};

/// Path every exchange is posted to.
pub const REQUEST_PATH: &str = "/request";

/// Configuration for [`HttpTransport`].
#[derive(Debug, Clone)]
pub struct HttpConfig {
    /// Timeout for establishing a connection.
    pub connect_timeout: Duration,
    /// Timeout for a whole request, response body included.
    pub request_timeout: Option<Duration>,
    /// How inbound requests are scheduled.
    pub dispatch: Dispatch,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            request_timeout: None,
            dispatch: Dispatch::default(),
        }
    }
}

impl HttpConfig {
    /// Set the connect timeout.
    #[must_use]
    pub const fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Bound every request by `timeout`.
    #[must_use]
    pub const fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    /// Set the inbound scheduling policy.
    #[must_use]
    pub const fn with_dispatch(mut self, dispatch: Dispatch) -> Self {
        self.dispatch = dispatch;
        self
    }
}

/// HTTP transport implementation.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    config: HttpConfig,
    client: Client,
}

impl HttpTransport {
    /// Create a new HTTP transport.
    ///
    /// # Errors
    ///
    /// Fails if the HTTP client cannot be built with the configured
    /// timeouts.
    pub fn try_new(config: HttpConfig) -> Result<Self> {
        let mut builder = Client::builder().connect_timeout(config.connect_timeout);
        if let Some(timeout) = config.request_timeout {
            builder = builder.timeout(timeout);
        }
        let client = builder
            .build()
            .map_err(|e| TransportError::Http(format!("failed to build HTTP client: {e}")))?;

        Ok(Self { config, client })
    }

    /// Create a new HTTP transport, falling back to a client without the
    /// configured timeouts if building one fails.
    #[must_use]
    pub fn new(config: HttpConfig) -> Self {
        match Self::try_new(config.clone()) {
            Ok(transport) => transport,
            Err(e) => {
                warn!("{}; using default client settings", e);
                Self {
                    config,
                    client: Client::new(),
                }
            }
        }
    }
}

impl Default for HttpTransport {
    fn default() -> Self {
        Self::new(HttpConfig::default())
    }
}

#[async_trait]
impl Transport for HttpTransport {
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

        let listener = HttpListener::new(listener, self.config.dispatch)?;
        info!("HTTP transport listening on {}", listener.local_addr());
        Ok(Box::new(listener))
    }

    async fn dial(&self, ctx: &Context, addr: &str) -> Result<Box<dyn Socket>> {
        if let Some(err) = ctx.err() {
            return Err(err);
        }
        if addr.is_empty() || addr.contains('/') {
            return Err(TransportError::InvalidAddress(addr.to_string()));
        }

        let url = format!("http://{addr}{REQUEST_PATH}");
        Ok(Box::new(OutgoingHttpSocket::new(self.client.clone(), url)))
    }
}
