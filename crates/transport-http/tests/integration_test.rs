//! Integration tests for HTTP transport

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures::future::join_all;
use mice_transport::{
    Context, Dispatch, Handler, Listener, Message, Socket, Transport, TransportError, handler,
};
use mice_transport_http::{HttpConfig, HttpTransport};

async fn serve(transport: &HttpTransport, on_socket: Handler) -> (Arc<dyn Listener>, String) {
    let listener: Arc<dyn Listener> = Arc::from(
        transport
            .listen(&Context::background(), "127.0.0.1:0")
            .await
            .unwrap(),
    );
    let addr = listener.local_addr().to_string();

    let serving = Arc::clone(&listener);
    tokio::spawn(async move {
        serving.accept(&Context::background(), on_socket).await.unwrap();
    });

    (listener, addr)
}

fn echo() -> Handler {
    handler(|socket: Box<dyn Socket>| async move {
        let ctx = Context::background();
        let request = socket.receive(&ctx).await.unwrap();
        let reply = Message::new(request.data.clone()).with_header(
            "echo-of",
            request.header("request-id").unwrap_or_default().to_string(),
        );
        socket.send(&ctx, &reply).await.unwrap();
        socket.close().await.unwrap();
    })
}

#[tokio::test]
async fn test_http_exchange() {
    let _ = tracing_subscriber::fmt::try_init();

    let transport = HttpTransport::default();
    let (listener, addr) = serve(&transport, echo()).await;

    let ctx = Context::background();
    let socket = transport.dial(&ctx, &addr).await.unwrap();
    socket
        .send(&ctx, &Message::from("hello").with_header("Request-Id", "42"))
        .await
        .unwrap();
    let reply = socket.receive(&ctx).await.unwrap();
    assert_eq!(reply.data, "hello");
    // Header keys come back lower-cased.
    assert_eq!(reply.header("echo-of"), Some("42"));
    socket.close().await.unwrap();

    listener.close().await.unwrap();
}

#[tokio::test]
async fn test_http_second_send_rejected() {
    let _ = tracing_subscriber::fmt::try_init();

    let transport = HttpTransport::default();
    let (listener, addr) = serve(&transport, echo()).await;

    let ctx = Context::background();
    let socket = transport.dial(&ctx, &addr).await.unwrap();
    socket.send(&ctx, &Message::from("first")).await.unwrap();

    let err = socket.send(&ctx, &Message::from("second")).await.unwrap_err();
    assert!(matches!(err, TransportError::AlreadySent));

    let reply = socket.receive(&ctx).await.unwrap();
    assert_eq!(reply.data, "first");

    let err = socket.receive(&ctx).await.unwrap_err();
    assert!(matches!(err, TransportError::AlreadyReceived));

    listener.close().await.unwrap();
}

#[tokio::test]
async fn test_http_close_without_reply_is_server_error() {
    let _ = tracing_subscriber::fmt::try_init();

    let transport = HttpTransport::default();
    let silent = handler(|socket: Box<dyn Socket>| async move {
        let _ = socket.receive(&Context::background()).await;
        socket.close().await.unwrap();
    });
    let (listener, addr) = serve(&transport, silent).await;

    let ctx = Context::background();
    let socket = transport.dial(&ctx, &addr).await.unwrap();
    socket.send(&ctx, &Message::from("anyone?")).await.unwrap();

    let err = socket.receive(&ctx).await.unwrap_err();
    assert!(matches!(err, TransportError::Http(msg) if msg.contains("500")));

    listener.close().await.unwrap();
}

#[tokio::test]
async fn test_http_bounded_dispatch() {
    let _ = tracing_subscriber::fmt::try_init();

    let active = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let (active_h, peak_h) = (Arc::clone(&active), Arc::clone(&peak));
    let slow = handler(move |socket: Box<dyn Socket>| {
        let active = Arc::clone(&active_h);
        let peak = Arc::clone(&peak_h);
        async move {
            let now = active.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            let ctx = Context::background();
            let request = socket.receive(&ctx).await.unwrap();
            tokio::time::sleep(Duration::from_millis(30)).await;
            active.fetch_sub(1, Ordering::SeqCst);
            socket.send(&ctx, &request).await.unwrap();
        }
    });

    let server = HttpTransport::new(HttpConfig::default().with_dispatch(Dispatch::Bounded(2)));
    let (listener, addr) = serve(&server, slow).await;

    let client = Arc::new(HttpTransport::default());
    let calls = (0..6).map(|i| {
        let client = Arc::clone(&client);
        let addr = addr.clone();
        tokio::spawn(async move {
            let ctx = Context::background();
            let socket = client.dial(&ctx, &addr).await.unwrap();
            socket.send(&ctx, &Message::new(format!("{i}"))).await.unwrap();
            socket.receive(&ctx).await.unwrap()
        })
    });
    for call in join_all(calls).await {
        call.unwrap();
    }

    assert!(peak.load(Ordering::SeqCst) <= 2);
    listener.close().await.unwrap();
}

#[tokio::test]
async fn test_http_dial_cancelled() {
    let transport = HttpTransport::default();
    let ctx = Context::background();
    ctx.cancel();

    let err = transport.dial(&ctx, "127.0.0.1:80").await.err().unwrap();
    assert!(matches!(err, TransportError::Cancelled));
}

#[tokio::test]
async fn test_http_invalid_address() {
    let transport = HttpTransport::default();
    let err = transport
        .dial(&Context::background(), "host/path")
        .await
        .err()
        .unwrap();
    assert!(matches!(err, TransportError::InvalidAddress(_)));
}

#[tokio::test]
async fn test_http_request_timeout_applies() {
    let _ = tracing_subscriber::fmt::try_init();

    let stalling = handler(|socket: Box<dyn Socket>| async move {
        let ctx = Context::background();
        let request = socket.receive(&ctx).await.unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;
        let _ = socket.send(&ctx, &request).await;
    });
    let server = HttpTransport::default();
    let (listener, addr) = serve(&server, stalling).await;

    let client = HttpTransport::try_new(
        HttpConfig::default().with_request_timeout(Duration::from_millis(100)),
    )
    .unwrap();
    let ctx = Context::background();
    let socket = client.dial(&ctx, &addr).await.unwrap();

    let err = socket.send(&ctx, &Message::from("slow")).await.unwrap_err();
    assert!(matches!(err, TransportError::Http(_)));

    listener.close().await.unwrap();
}
