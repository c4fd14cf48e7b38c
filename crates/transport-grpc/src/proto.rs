//! Wire types and the hand-written `mice.Transport` service.
//!
//! Equivalent protobuf definition:
//!
//! ```protobuf
//! package mice;
//!
//! message Message {
//!     map<string, string> headers = 1;
//!     bytes data = 2;
//! }
//!
//! service Transport {
//!     rpc Stream(stream Message) returns (stream Message);
//! }
//! ```

use crate::socket::GrpcStream;
use bytes::Bytes;
use futures::StreamExt;
use mice_transport::{Message, Result, TransportError};
use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::codec::{ProstCodec, Streaming};
use tonic::codegen::http::uri::PathAndQuery;
use tonic::codegen::{Body, BoxFuture, BoxStream, Service, StdError, http};
use tonic::transport::Channel;
use tonic::{Code, Status};

/// Fully qualified service name.
pub const SERVICE_NAME: &str = "mice.Transport";

/// Path of the bidirectional streaming method.
pub const STREAM_PATH: &str = "/mice.Transport/Stream";

/// Messages buffered per stream direction before `send` waits.
pub(crate) const STREAM_BUFFER: usize = 16;

/// `mice.Message` on the wire.
#[derive(Clone, PartialEq, prost::Message)]
pub struct WireMessage {
    /// Header map.
    #[prost(map = "string, string", tag = "1")]
    pub headers: HashMap<String, String>,
    /// Opaque payload.
    #[prost(bytes = "bytes", tag = "2")]
    pub data: Bytes,
}

impl From<Message> for WireMessage {
    fn from(msg: Message) -> Self {
        Self {
            headers: msg.headers,
            data: msg.data,
        }
    }
}

impl From<WireMessage> for Message {
    fn from(wire: WireMessage) -> Self {
        Self {
            headers: wire.headers,
            data: wire.data,
        }
    }
}

pub(crate) fn status_error(status: &Status) -> TransportError {
    TransportError::Grpc(format!("{}: {}", status.code(), status.message()))
}

/// Open a `Stream` call on `channel`.
///
/// Returns the request half as a channel sender and the response half as a
/// message stream.
pub(crate) async fn open_stream(
    channel: Channel,
) -> Result<(mpsc::Sender<WireMessage>, Streaming<WireMessage>)> {
    let mut grpc = tonic::client::Grpc::new(channel);
    grpc.ready()
        .await
        .map_err(|e| TransportError::Grpc(format!("channel not ready: {e}")))?;

    let (tx, rx) = mpsc::channel(STREAM_BUFFER);
    let codec: ProstCodec<WireMessage, WireMessage> = ProstCodec::default();
    let response = grpc
        .streaming(
            tonic::Request::new(ReceiverStream::new(rx)),
            PathAndQuery::from_static(STREAM_PATH),
            codec,
        )
        .await
        .map_err(|status| status_error(&status))?;

    Ok((tx, response.into_inner()))
}

/// Server for `mice.Transport`. Every accepted `Stream` call is handed to
/// `on_stream` as a [`GrpcStream`]; the call stays open until that stream is
/// dropped.
pub struct TransportServer<F> {
    on_stream: Arc<F>,
}

impl<F> TransportServer<F>
where
    F: Fn(GrpcStream) + Send + Sync + 'static,
{
    /// Create a server that hands streams to `on_stream`.
    pub fn new(on_stream: F) -> Self {
        Self {
            on_stream: Arc::new(on_stream),
        }
    }
}

impl<F> Clone for TransportServer<F> {
    fn clone(&self) -> Self {
        Self {
            on_stream: Arc::clone(&self.on_stream),
        }
    }
}

impl<F> tonic::server::NamedService for TransportServer<F> {
    const NAME: &'static str = SERVICE_NAME;
}

impl<F, B> Service<http::Request<B>> for TransportServer<F>
where
    F: Fn(GrpcStream) + Send + Sync + 'static,
    B: Body + Send + 'static,
    B::Error: Into<StdError> + Send + 'static,
{
    type Response = http::Response<tonic::body::BoxBody>;
    type Error = Infallible;
    type Future = BoxFuture<Self::Response, Self::Error>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<std::result::Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: http::Request<B>) -> Self::Future {
        if req.uri().path() != STREAM_PATH {
            return Box::pin(async { Ok(unimplemented()) });
        }

        let method = StreamMethod {
            on_stream: Arc::clone(&self.on_stream),
        };
        Box::pin(async move {
            let codec: ProstCodec<WireMessage, WireMessage> = ProstCodec::default();
            let mut grpc = tonic::server::Grpc::new(codec);
            Ok(grpc.streaming(method, req).await)
        })
    }
}

struct StreamMethod<F> {
    on_stream: Arc<F>,
}

impl<F> tonic::server::StreamingService<WireMessage> for StreamMethod<F>
where
    F: Fn(GrpcStream) + Send + Sync + 'static,
{
    type Response = WireMessage;
    type ResponseStream = BoxStream<WireMessage>;
    type Future = BoxFuture<tonic::Response<Self::ResponseStream>, Status>;

    fn call(&mut self, request: tonic::Request<Streaming<WireMessage>>) -> Self::Future {
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        (self.on_stream)(GrpcStream::new(tx, request.into_inner(), None));

        let responses: Self::ResponseStream = Box::pin(ReceiverStream::new(rx).map(Ok));
        Box::pin(async move { Ok(tonic::Response::new(responses)) })
    }
}

fn unimplemented() -> http::Response<tonic::body::BoxBody> {
    let mut response = http::Response::new(tonic::body::empty_body());
    let headers = response.headers_mut();
    headers.insert(Status::GRPC_STATUS, http::HeaderValue::from(Code::Unimplemented as i32));
    headers.insert(
        http::header::CONTENT_TYPE,
        http::HeaderValue::from_static("application/grpc"),
    );
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use prost::Message as _;

    #[test]
    fn test_wire_message_round_trip() {
        let msg = Message::from("payload").with_header("k", "v");
        let encoded = WireMessage::from(msg.clone()).encode_to_vec();
        let decoded = WireMessage::decode(encoded.as_slice()).unwrap();
        assert_eq!(Message::from(decoded), msg);
    }

    #[test]
    fn test_wire_field_tags() {
        // headers = 1 (length-delimited map entry), data = 2 (bytes)
        let wire = WireMessage {
            headers: HashMap::new(),
            data: Bytes::from_static(b"x"),
        };
        assert_eq!(wire.encode_to_vec(), vec![0x12, 0x01, b'x']);
    }

    #[test]
    fn test_unknown_method_is_unimplemented() {
        let response = unimplemented();
        assert_eq!(response.headers()["grpc-status"], "12");
        assert_eq!(response.headers()[http::header::CONTENT_TYPE], "application/grpc");
    }
}
