use std::{net::SocketAddr, time::Duration};

use haru_ws::{
    client, close::CloseCode, Connection, Message, Options, RateLimit, Routes, Server,
    ServerConfig, ServerHandle, WebSocketError,
};
use tokio::task::JoinHandle;

fn init_logger() {
    let _ = simple_logger::SimpleLogger::new()
        .with_level(log::LevelFilter::Debug)
        .init();
}

const TIMEOUT: Option<Duration> = Some(Duration::from_secs(5));

type Running = JoinHandle<haru_ws::Result<()>>;

async fn start(config: ServerConfig, routes: Routes) -> (ServerHandle, Running) {
    init_logger();
    let server = Server::bind("127.0.0.1:0", config)
        .await
        .expect("bind")
        .routes(routes);
    let handle = server.handle();
    (handle, tokio::spawn(server.run()))
}

async fn serve_routes(routes: Routes) -> (ServerHandle, Running) {
    start(ServerConfig::default(), routes).await
}

async fn connect(addr: SocketAddr, path: &str) -> Connection {
    connect_with(addr, path, Options::default()).await
}

async fn connect_with(addr: SocketAddr, path: &str, options: Options) -> Connection {
    let url = format!("ws://{addr}{path}").parse().expect("url");
    client::connect(url, options).await.expect("connect")
}

/// Polls `condition` until it holds, panicking after two seconds.
async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

fn closed_code(result: haru_ws::Result<Message>) -> Option<u16> {
    match result {
        Err(WebSocketError::ConnectionClosed { code, .. }) => code,
        other => panic!("expected a closed connection, got {other:?}"),
    }
}

async fn echo(ws: Connection) -> haru_ws::Result<()> {
    loop {
        let message = ws.recv(None).await?;
        ws.send(message).await?;
    }
}

async fn idle(ws: Connection) -> haru_ws::Result<()> {
    ws.closed().await;
    Ok(())
}

async fn echo_once(ws: Connection) -> haru_ws::Result<()> {
    let message = ws.recv(None).await?;
    ws.send(message).await
}

async fn failing(_ws: Connection) -> haru_ws::Result<()> {
    Err(WebSocketError::Protocol("handler gave up".to_string()))
}

#[tokio::test]
async fn test_echo_text_and_binary() {
    let (handle, _running) = serve_routes(Routes::new().route("/echo", echo)).await;
    let ws = connect(handle.local_addr(), "/echo").await;

    ws.send("Hello, WebSocket!").await.expect("send text");
    assert_eq!(
        ws.recv(None).await.expect("recv text"),
        Message::Text("Hello, WebSocket!".to_string())
    );

    ws.send(vec![1u8, 2, 3, 4, 5]).await.expect("send binary");
    assert_eq!(
        ws.recv(None).await.expect("recv binary").as_bytes(),
        &[1u8, 2, 3, 4, 5][..]
    );

    ws.send("").await.expect("send empty");
    assert_eq!(
        ws.recv(None).await.expect("recv empty"),
        Message::Text(String::new())
    );

    ws.close(CloseCode::Normal, "bye").await.expect("close");
    assert!(ws.is_closed());
    assert_eq!(ws.close_code(), Some(CloseCode::Normal));
    assert!(matches!(
        ws.close(CloseCode::Normal, "again").await,
        Err(WebSocketError::ConnectionClosed { .. })
    ));
}

#[tokio::test]
async fn test_large_message_roundtrip() {
    let (handle, _running) = serve_routes(Routes::new().fallback(echo)).await;
    let ws = connect(handle.local_addr(), "/").await;

    let payload: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
    ws.send(payload.clone()).await.expect("send");
    let reply = ws.recv(TIMEOUT).await.expect("recv");
    assert_eq!(reply.as_bytes(), &payload[..]);
}

#[tokio::test]
async fn test_ping_is_answered_transparently() {
    let (handle, _running) = serve_routes(Routes::new().fallback(echo)).await;
    let ws = connect(handle.local_addr(), "/").await;

    ws.ping(&b"are you there"[..]).await.expect("ping");
    ws.send("after ping").await.expect("send");
    assert_eq!(
        ws.recv(None).await.expect("recv"),
        Message::Text("after ping".to_string())
    );
}

#[tokio::test]
async fn test_concurrent_sends_do_not_interleave() {
    let (handle, _running) = serve_routes(Routes::new().fallback(echo)).await;
    let ws = connect(handle.local_addr(), "/").await;

    let senders: Vec<_> = (0..8u8)
        .map(|id| {
            let ws = ws.clone();
            tokio::spawn(async move {
                for _ in 0..25 {
                    ws.send(vec![id; 16 * 1024]).await.expect("send");
                }
            })
        })
        .collect();
    for sender in senders {
        sender.await.expect("sender task");
    }

    let mut counts = [0usize; 8];
    for _ in 0..200 {
        let message = ws.recv(TIMEOUT).await.expect("recv");
        let data = message.as_bytes();
        assert_eq!(data.len(), 16 * 1024);
        assert!(data.iter().all(|b| *b == data[0]), "frame payloads were mixed");
        counts[data[0] as usize] += 1;
    }
    assert!(counts.iter().all(|count| *count == 25));
}

#[tokio::test]
async fn test_unknown_path_closes_with_1003() {
    let (handle, _running) = serve_routes(Routes::new().route("/echo", echo)).await;
    let ws = connect(handle.local_addr(), "/missing").await;

    assert_eq!(closed_code(ws.recv(TIMEOUT).await), Some(1003));
    assert_eq!(ws.close_reason().as_deref(), Some("Unknown path"));
}

#[tokio::test]
async fn test_routes_ignore_query_string() {
    let (handle, _running) = serve_routes(Routes::new().route("/echo", echo)).await;
    let ws = connect(handle.local_addr(), "/echo?token=abc").await;

    ws.send("query").await.expect("send");
    assert_eq!(
        ws.recv(TIMEOUT).await.expect("recv"),
        Message::Text("query".to_string())
    );
}

#[tokio::test]
async fn test_handler_error_closes_with_1011() {
    let (handle, _running) = serve_routes(Routes::new().fallback(failing)).await;
    let ws = connect(handle.local_addr(), "/").await;

    assert_eq!(closed_code(ws.recv(TIMEOUT).await), Some(1011));
}

#[tokio::test]
async fn test_handler_return_closes_with_1000() {
    let (handle, _running) = serve_routes(Routes::new().fallback(echo_once)).await;
    let ws = connect(handle.local_addr(), "/").await;

    ws.send("only one").await.expect("send");
    assert_eq!(
        ws.recv(TIMEOUT).await.expect("recv"),
        Message::Text("only one".to_string())
    );
    assert_eq!(closed_code(ws.recv(TIMEOUT).await), Some(1000));
}

#[tokio::test]
async fn test_capacity_closes_with_1013() {
    let config = ServerConfig::default().with_max_connections(1);
    let (handle, _running) = start(config, Routes::new().fallback(idle)).await;

    let first = connect(handle.local_addr(), "/").await;
    wait_until(|| handle.connection_count() == 1).await;

    let second = connect(handle.local_addr(), "/").await;
    assert_eq!(closed_code(second.recv(TIMEOUT).await), Some(1013));
    assert_eq!(second.close_reason().as_deref(), Some("Server is at capacity"));

    assert!(!first.is_closed());
    assert_eq!(handle.connection_count(), 1);
}

#[tokio::test]
async fn test_oversize_message_closes_with_1009() {
    let options = Options::default().with_max_message_size(1024);
    let config = ServerConfig::default().with_options(options);
    let (handle, _running) = start(config, Routes::new().fallback(echo)).await;
    let ws = connect(handle.local_addr(), "/").await;

    ws.send(vec![0u8; 2048]).await.expect("send");
    assert_eq!(closed_code(ws.recv(TIMEOUT).await), Some(1009));
}

#[tokio::test]
async fn test_broadcast_reaches_every_connection() {
    let (handle, _running) = serve_routes(Routes::new().fallback(idle)).await;
    let clients = [
        connect(handle.local_addr(), "/").await,
        connect(handle.local_addr(), "/").await,
        connect(handle.local_addr(), "/").await,
    ];
    wait_until(|| handle.connection_count() == 3).await;

    assert_eq!(handle.broadcast("news").await, 3);
    for ws in &clients {
        assert_eq!(
            ws.recv(TIMEOUT).await.expect("recv"),
            Message::Text("news".to_string())
        );
    }

    clients[0].close(CloseCode::Normal, "").await.expect("close");
    wait_until(|| handle.connection_count() == 2).await;
    assert_eq!(handle.broadcast(&b"binary news"[..]).await, 2);
}

#[tokio::test]
async fn test_shutdown_closes_with_1001() {
    let (handle, running) = serve_routes(Routes::new().fallback(idle)).await;
    let addr = handle.local_addr();
    let ws = connect(addr, "/").await;
    wait_until(|| handle.connection_count() == 1).await;

    handle.shutdown().await;
    assert_eq!(closed_code(ws.recv(TIMEOUT).await), Some(1001));
    assert_eq!(handle.connection_count(), 0);

    running.await.expect("server task").expect("server run");
    assert!(client::connect(
        format!("ws://{addr}/").parse().expect("url"),
        Options::default()
    )
    .await
    .is_err());
}

#[tokio::test]
async fn test_recv_timeout_then_closed() {
    let (handle, _running) = serve_routes(Routes::new().fallback(echo_once)).await;
    let ws = connect(handle.local_addr(), "/").await;

    assert!(matches!(
        ws.recv(Some(Duration::from_millis(50))).await,
        Err(WebSocketError::Timeout)
    ));
    assert!(!ws.is_closed());

    ws.send("last").await.expect("send");
    ws.recv(TIMEOUT).await.expect("echo");
    assert_eq!(closed_code(ws.recv(TIMEOUT).await), Some(1000));
    ws.closed().await;
    assert!(matches!(
        ws.send("too late").await,
        Err(WebSocketError::ConnectionClosed { .. })
    ));
}

#[tokio::test]
async fn test_client_rate_limit() {
    let (handle, _running) = serve_routes(Routes::new().fallback(echo)).await;
    let options = Options::default().with_rate_limit(RateLimit::new(2, Duration::from_secs(60)));
    let ws = connect_with(handle.local_addr(), "/", options).await;

    ws.send("one").await.expect("first send");
    ws.send("two").await.expect("second send");
    assert!(matches!(ws.send("three").await, Err(WebSocketError::Security(_))));
}

#[tokio::test]
async fn test_serve_sends_every_path_to_handler() {
    init_logger();
    let handle = haru_ws::serve("127.0.0.1:0", echo).await.expect("serve");
    let ws = connect(handle.local_addr(), "/any/path").await;

    ws.send("served").await.expect("send");
    assert_eq!(
        ws.recv(TIMEOUT).await.expect("recv"),
        Message::Text("served".to_string())
    );
    handle.shutdown().await;
}
