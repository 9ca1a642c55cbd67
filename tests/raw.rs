//! Drives a server with hand-built frames through [`FrameCodec`], to exercise fragmentation and
//! the failure paths a well-behaved client never triggers.

use std::time::Duration;

use anyhow::{ensure, Context};
use bytes::BytesMut;
use futures::{SinkExt, StreamExt};
use haru_ws::{
    close::CloseCode,
    codec::FrameCodec,
    decode_close_payload,
    http::{self, Headers},
    mask::apply_mask,
    util::compute_accept_key,
    Connection, Frame, Handler, OpCode, Options, Role, Server, ServerConfig, ServerHandle,
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
};
use tokio_util::codec::Framed;

const KEY: &str = "dGhlIHNhbXBsZSBub25jZQ==";

type RawClient = Framed<TcpStream, FrameCodec>;

async fn echo(ws: Connection) -> haru_ws::Result<()> {
    loop {
        let message = ws.recv(None).await?;
        ws.send(message).await?;
    }
}

/// Never looks at the connection, so only an abort stops it.
async fn oblivious(_ws: Connection) -> haru_ws::Result<()> {
    loop {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

/// Sends until the connection fails.
async fn flood(ws: Connection) -> haru_ws::Result<()> {
    loop {
        ws.send(vec![0u8; 512 * 1024]).await?;
    }
}

async fn start() -> anyhow::Result<ServerHandle> {
    start_with(ServerConfig::default(), echo).await
}

async fn start_with(config: ServerConfig, handler: impl Handler) -> anyhow::Result<ServerHandle> {
    let server = Server::bind("127.0.0.1:0", config).await?.fallback(handler);
    let handle = server.handle();
    tokio::spawn(server.run());
    Ok(handle)
}

/// A config whose close handshake and shutdown both give up after 200ms.
fn impatient() -> ServerConfig {
    let options = Options::default().with_close_timeout(Duration::from_millis(200));
    ServerConfig::default()
        .with_options(options)
        .with_shutdown_timeout(Duration::from_millis(200))
}

/// Opens a TCP connection and completes the upgrade by hand.
async fn raw_client(handle: &ServerHandle) -> anyhow::Result<RawClient> {
    let mut stream = TcpStream::connect(handle.local_addr()).await?;

    let headers: Headers = [
        ("Host", "localhost"),
        ("Upgrade", "websocket"),
        ("Connection", "Upgrade"),
        ("Sec-WebSocket-Key", KEY),
        ("Sec-WebSocket-Version", "13"),
    ]
    .into_iter()
    .collect();
    stream.write_all(&http::build_request("/", &headers)).await?;

    // the server stays silent after its 101 until we send a frame
    let mut buf = BytesMut::new();
    while http::find_head_end(&buf).is_none() {
        ensure!(stream.read_buf(&mut buf).await? != 0, "closed during handshake");
    }
    let (response, consumed) = http::parse_response(&buf)?;
    ensure!(consumed == buf.len(), "unexpected bytes after the 101");
    ensure!(response.status_code == 101, "status {}", response.status_code);
    ensure!(response.headers.get("Sec-WebSocket-Accept")? == compute_accept_key(KEY));
    ensure!(response.headers.get("Sec-WebSocket-Version")? == "13");

    Ok(Framed::new(stream, FrameCodec::new(Role::Client, None)))
}

/// Waits until the server has registered `count` connections.
async fn registered(handle: &ServerHandle, count: usize) -> anyhow::Result<()> {
    tokio::time::timeout(Duration::from_secs(2), async {
        while handle.connection_count() != count {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .context("connection not registered in time")
}

async fn next_frame(framed: &mut RawClient) -> anyhow::Result<Frame> {
    let frame = tokio::time::timeout(Duration::from_secs(5), framed.next())
        .await
        .context("no frame in time")?
        .context("stream ended")??;
    Ok(frame)
}

async fn expect_close(framed: &mut RawClient, code: CloseCode) -> anyhow::Result<()> {
    let frame = next_frame(framed).await?;
    ensure!(frame.opcode() == OpCode::Close, "got {:?}", frame.opcode());
    let (received, _) = decode_close_payload(frame.payload())?;
    ensure!(received == code, "closed with {received}, expected {code}");
    Ok(())
}

/// Writes bytes straight to the socket, bypassing the encoder.
async fn write_raw(framed: &mut RawClient, bytes: &[u8]) -> anyhow::Result<()> {
    framed.get_mut().write_all(bytes).await?;
    Ok(())
}

#[tokio::test]
async fn test_fragmented_message_with_interleaved_ping() -> anyhow::Result<()> {
    let handle = start().await?;
    let mut framed = raw_client(&handle).await?;

    framed.send(Frame::new(false, OpCode::Text, "Hel")?).await?;
    framed.send(Frame::ping("mid-message")?).await?;
    framed.send(Frame::continuation(false, "lo, ")).await?;
    framed.send(Frame::continuation(true, "world")).await?;

    let pong = next_frame(&mut framed).await?;
    assert_eq!(pong.opcode(), OpCode::Pong);
    assert_eq!(&pong.payload()[..], b"mid-message");

    let message = next_frame(&mut framed).await?;
    assert_eq!(message, Frame::text("Hello, world"));
    Ok(())
}

#[tokio::test]
async fn test_close_is_echoed_with_peer_code() -> anyhow::Result<()> {
    let handle = start().await?;
    let mut framed = raw_client(&handle).await?;

    framed
        .send(Frame::close(CloseCode::GoingAway, "leaving")?)
        .await?;
    let frame = next_frame(&mut framed).await?;
    assert_eq!(
        decode_close_payload(frame.payload())?,
        (CloseCode::GoingAway, "leaving".to_string())
    );
    Ok(())
}

#[tokio::test]
async fn test_invalid_utf8_closes_with_1007() -> anyhow::Result<()> {
    let handle = start().await?;
    let mut framed = raw_client(&handle).await?;

    framed
        .send(Frame::new(true, OpCode::Text, &[0xffu8, 0xfe][..])?)
        .await?;
    expect_close(&mut framed, CloseCode::InvalidPayload).await
}

#[tokio::test]
async fn test_unexpected_continuation_closes_with_1002() -> anyhow::Result<()> {
    let handle = start().await?;
    let mut framed = raw_client(&handle).await?;

    framed.send(Frame::continuation(true, "orphan")).await?;
    expect_close(&mut framed, CloseCode::Protocol).await
}

#[tokio::test]
async fn test_new_message_inside_fragmented_one_closes_with_1002() -> anyhow::Result<()> {
    let handle = start().await?;
    let mut framed = raw_client(&handle).await?;

    framed.send(Frame::new(false, OpCode::Text, "first")?).await?;
    framed.send(Frame::text("second")).await?;
    expect_close(&mut framed, CloseCode::Protocol).await
}

#[tokio::test]
async fn test_reserved_bits_close_with_1002() -> anyhow::Result<()> {
    let handle = start().await?;
    let mut framed = raw_client(&handle).await?;

    // FIN | RSV1 | Text, masked, two byte payload
    let mask = [1u8, 2, 3, 4];
    let mut frame = vec![0xc1, 0x82];
    frame.extend_from_slice(&mask);
    let mut payload = *b"hi";
    apply_mask(&mut payload, mask);
    frame.extend_from_slice(&payload);

    write_raw(&mut framed, &frame).await?;
    expect_close(&mut framed, CloseCode::Protocol).await
}

#[tokio::test]
async fn test_fragmented_control_frame_closes_with_1002() -> anyhow::Result<()> {
    let handle = start().await?;
    let mut framed = raw_client(&handle).await?;

    // Ping without FIN, masked, empty payload
    write_raw(&mut framed, &[0x09, 0x80, 0, 0, 0, 0]).await?;
    expect_close(&mut framed, CloseCode::Protocol).await
}

#[tokio::test]
async fn test_shutdown_aborts_handler_ignoring_close() -> anyhow::Result<()> {
    let handle = start_with(impatient(), oblivious).await?;
    let mut framed = raw_client(&handle).await?;
    registered(&handle, 1).await?;

    // the raw client never answers the close frame either
    tokio::time::timeout(Duration::from_secs(5), handle.shutdown())
        .await
        .context("shutdown did not finish")?;
    assert!(handle.is_shutdown());
    assert_eq!(handle.connection_count(), 0);

    expect_close(&mut framed, CloseCode::GoingAway).await
}

#[tokio::test]
async fn test_shutdown_with_stalled_writer() -> anyhow::Result<()> {
    let handle = start_with(impatient(), flood).await?;
    // never read from, so the handler blocks once the socket buffers fill
    let _framed = raw_client(&handle).await?;
    registered(&handle, 1).await?;
    tokio::time::sleep(Duration::from_millis(200)).await;

    tokio::time::timeout(Duration::from_secs(5), handle.shutdown())
        .await
        .context("shutdown did not finish")?;
    assert_eq!(handle.connection_count(), 0);
    Ok(())
}
