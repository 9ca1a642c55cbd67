//! Client side of the opening handshake.
//!
//! [`connect`] dials a `ws://` URL over TCP; [`handshake`] runs the upgrade over a transport the
//! caller already has. Both return a [`Connection`] in the client role, whose outgoing frames are
//! masked.
//!
//! ```no_run
//! use haru_ws::{client, Options};
//!
//! # async fn example() -> haru_ws::Result<()> {
//! let ws = client::connect("ws://localhost:8765/chat".parse()?, Options::default()).await?;
//! ws.send("hi").await?;
//! # Ok(())
//! # }
//! ```

use std::net::SocketAddr;

use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt},
    net::TcpStream,
};
use url::Url;

use crate::{
    connection::{read_http, BoxedWrite, Connection},
    http::{
        self, Headers, CONNECTION, HOST, SEC_WEBSOCKET_ACCEPT, SEC_WEBSOCKET_KEY,
        SEC_WEBSOCKET_VERSION, UPGRADE,
    },
    options::Options,
    protocol::Role,
    util::{compare_digest, compute_accept_key, generate_key, Deadline},
    Result, WebSocketError,
};

/// Connects to a `ws://` URL.
///
/// The TCP connection and the handshake together are bounded by `options.handshake_timeout`.
///
/// # Errors
/// - [`WebSocketError::InvalidHttpScheme`] for any scheme other than `ws`.
/// - I/O errors from dialing, and every error [`handshake`] can return.
pub async fn connect(url: Url, options: Options) -> Result<Connection> {
    if url.scheme() != "ws" {
        return Err(WebSocketError::InvalidHttpScheme);
    }
    let host = url
        .host_str()
        .ok_or_else(|| WebSocketError::Handshake(format!("no host in {url}")))?;
    let port = url.port_or_known_default().unwrap_or(80);

    let deadline = Deadline::new(options.handshake_timeout);
    let stream = deadline.run(TcpStream::connect((host, port))).await??;
    if options.no_delay {
        stream.set_nodelay(true)?;
    }
    let peer_addr = stream.peer_addr().ok();

    let options = Options {
        handshake_timeout: deadline.remaining(),
        ..options
    };
    upgrade(&url, stream, peer_addr, options).await
}

/// Performs the client handshake over `io` and returns the open connection.
///
/// Sends `GET` for the URL's path and query with a fresh random key, then reads the response
/// and checks the status, the upgrade headers and the accept value, the latter in constant time.
///
/// # Errors
/// - [`WebSocketError::InvalidStatusCode`] when the server does not answer 101.
/// - [`WebSocketError::Header`] for a missing or wrong upgrade header.
/// - [`WebSocketError::Security`] when the accept value does not match the key.
/// - [`WebSocketError::Timeout`] when `options.handshake_timeout` elapses.
pub async fn handshake<S>(url: &Url, io: S, options: Options) -> Result<Connection>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    upgrade(url, io, None, options).await
}

async fn upgrade<S>(
    url: &Url,
    io: S,
    peer_addr: Option<SocketAddr>,
    options: Options,
) -> Result<Connection>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let host = url
        .host_str()
        .ok_or_else(|| WebSocketError::Handshake(format!("no host in {url}")))?;
    let host = match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    };
    let target = &url[url::Position::BeforePath..];
    let key = generate_key();

    let headers: Headers = [
        (HOST, host),
        (UPGRADE, "websocket".to_string()),
        (CONNECTION, "Upgrade".to_string()),
        (SEC_WEBSOCKET_KEY, key.clone()),
        (SEC_WEBSOCKET_VERSION, "13".to_string()),
    ]
    .into_iter()
    .collect();

    let (mut reader, writer) = tokio::io::split(io);
    let mut writer: BoxedWrite = Box::pin(writer);
    let deadline = Deadline::new(options.handshake_timeout);

    let handshake = async {
        writer
            .write_all(&http::build_request(target, &headers))
            .await?;
        writer.flush().await?;

        let (response, leftover) = read_http(&mut reader, http::parse_response).await?;
        if response.status_code != 101 {
            return Err(WebSocketError::InvalidStatusCode(response.status_code));
        }
        http::validate_handshake(&response.headers, Role::Client)?;

        let accept = response.headers.get(SEC_WEBSOCKET_ACCEPT)?;
        if !compare_digest(accept, compute_accept_key(&key)) {
            return Err(WebSocketError::Security(format!(
                "{SEC_WEBSOCKET_ACCEPT} does not match the key"
            )));
        }
        Ok::<_, WebSocketError>(leftover)
    };

    let leftover = match deadline.run(handshake).await.and_then(|result| result) {
        Ok(leftover) => leftover,
        Err(err) => {
            log::warn!("handshake with {url} failed: {err}");
            return Err(err);
        }
    };
    log::debug!("connected to {url} in {:?}", deadline.elapsed());

    Connection::open(
        Role::Client,
        reader,
        writer,
        leftover,
        None,
        peer_addr,
        options,
    )
}
