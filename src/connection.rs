//! Tokio transport around [`WebSocketProtocol`].
//!
//! A [`Connection`] owns one transport split in two halves. The read half belongs to a reader
//! task that feeds the protocol and forwards complete messages to a FIFO channel. The write half
//! sits behind an async lock: every write takes the lock, drains whatever frames the protocol has
//! queued and writes them out whole, so frames from concurrent tasks never interleave.

use std::{
    fmt,
    future::Future,
    net::SocketAddr,
    pin::Pin,
    sync::{Arc, Weak},
    time::{Duration, Instant},
};

use bytes::{Bytes, BytesMut};
use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    sync::{mpsc, watch, Mutex as AsyncMutex},
    task::AbortHandle,
};
use tokio_util::sync::CancellationToken;

use crate::{
    close::CloseCode,
    http::{
        self, Headers, Request, CONNECTION, SEC_WEBSOCKET_ACCEPT, SEC_WEBSOCKET_KEY,
        SEC_WEBSOCKET_VERSION, UPGRADE,
    },
    options::{Options, RateLimit},
    protocol::{ConnectionState, Message, Role, State, WebSocketProtocol},
    util::{compute_accept_key, Deadline},
    Result, WebSocketError,
};

/// Largest HTTP header block accepted during the handshake.
pub(crate) const MAX_HANDSHAKE_SIZE: usize = 64 * 1024;

pub(crate) type BoxedWrite = Pin<Box<dyn AsyncWrite + Send>>;

/// Application code run for every accepted connection.
///
/// Implemented for any `Fn(Connection) -> impl Future<Output = Result<()>>`, so plain async
/// closures work:
///
/// ```rust
/// use haru_ws::{Connection, Handler};
///
/// fn echo() -> impl Handler {
///     |ws: Connection| async move {
///         loop {
///             let message = ws.recv(None).await?;
///             ws.send(message).await?;
///         }
///     }
/// }
/// ```
///
/// Returning `Ok(())` closes the connection with 1000. Returning an error or panicking closes it
/// with 1011, except for [`WebSocketError::ConnectionClosed`], which just means the peer left.
pub trait Handler: Send + Sync + 'static {
    fn call(&self, connection: Connection) -> BoxFuture<'static, Result<()>>;
}

impl<F, Fut> Handler for F
where
    F: Fn(Connection) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    fn call(&self, connection: Connection) -> BoxFuture<'static, Result<()>> {
        Box::pin(self(connection))
    }
}

/// Fixed-window counter behind [`RateLimit`].
#[derive(Debug)]
struct RateLimiter {
    limit: RateLimit,
    window_start: Instant,
    count: u32,
}

impl RateLimiter {
    fn new(limit: RateLimit) -> Self {
        Self {
            limit,
            window_start: Instant::now(),
            count: 0,
        }
    }

    fn check(&mut self) -> Result<()> {
        let now = Instant::now();
        if now.duration_since(self.window_start) >= self.limit.window {
            self.window_start = now;
            self.count = 0;
        }
        if self.count >= self.limit.messages {
            return Err(WebSocketError::Security(format!(
                "rate limit of {} messages per {:?} exceeded",
                self.limit.messages, self.limit.window
            )));
        }
        self.count += 1;
        Ok(())
    }
}

struct Inner {
    id: u64,
    role: Role,
    peer_addr: Option<SocketAddr>,
    request: Option<Request>,
    options: Options,
    state: Arc<ConnectionState>,
    protocol: Mutex<WebSocketProtocol>,
    /// The send lock. `None` once the transport has been released.
    writer: AsyncMutex<Option<BoxedWrite>>,
    /// Cancelled on teardown; pending writes give the send lock up.
    teardown: CancellationToken,
    messages: AsyncMutex<mpsc::UnboundedReceiver<Message>>,
    /// Flips to `true` when the reader task is done.
    closed: watch::Sender<bool>,
    rate_limiter: Option<Mutex<RateLimiter>>,
    reader: Mutex<Option<AbortHandle>>,
    handler: Mutex<HandlerSlot>,
}

/// The running handler task, or a note that it was aborted before it started.
#[derive(Default)]
struct HandlerSlot {
    task: Option<AbortHandle>,
    aborted: bool,
}

/// Handle to an open WebSocket connection.
///
/// Cheap to clone; every clone talks to the same connection. All methods take `&self` and may be
/// called from several tasks at once.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

/// A [`Connection`] reference that does not keep the connection alive.
#[derive(Clone)]
pub struct WeakConnection {
    inner: Weak<Inner>,
}

impl WeakConnection {
    pub fn upgrade(&self) -> Option<Connection> {
        self.inner.upgrade().map(|inner| Connection { inner })
    }
}

impl Connection {
    /// Runs the server side of a connection on `io`: performs the handshake, then drives
    /// `handler` until it returns and the connection is closed.
    ///
    /// This is the entry point for code that already owns a transport, e.g. a router that has
    /// just read an upgrade request's socket out of its accept loop.
    ///
    /// # Errors
    /// Handshake failures. The transport is dropped without sending any frame.
    pub async fn accept<S, H>(io: S, handler: H, options: Options) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
        H: Handler,
    {
        let connection = Self::upgrade(io, None, options).await?;
        connection.run(Arc::new(handler)).await;
        Ok(())
    }

    /// Performs the server handshake on `io` and returns the open connection.
    ///
    /// The request is read until its header terminator (at most 64 KiB), validated, and answered
    /// with `101 Switching Protocols`, all within `options.handshake_timeout`. Bytes that
    /// followed the request are handed to the protocol as the start of the frame stream.
    pub async fn upgrade<S>(io: S, peer_addr: Option<SocketAddr>, options: Options) -> Result<Self>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (mut reader, writer) = tokio::io::split(io);
        let mut writer: BoxedWrite = Box::pin(writer);
        let deadline = Deadline::new(options.handshake_timeout);

        let handshake = async {
            let (request, leftover) = read_http(&mut reader, http::parse_request).await?;
            http::validate_handshake(&request.headers, Role::Server)?;

            let accept = compute_accept_key(request.headers.get(SEC_WEBSOCKET_KEY)?);
            let headers: Headers = [
                (UPGRADE, "websocket".to_string()),
                (CONNECTION, "Upgrade".to_string()),
                (SEC_WEBSOCKET_ACCEPT, accept),
                (SEC_WEBSOCKET_VERSION, "13".to_string()),
            ]
            .into_iter()
            .collect();

            writer
                .write_all(&http::build_response(101, headers, None))
                .await?;
            writer.flush().await?;
            Ok::<_, WebSocketError>((request, leftover))
        };

        let (request, leftover) = match deadline.run(handshake).await.and_then(|result| result) {
            Ok(upgraded) => upgraded,
            Err(err) => {
                log::warn!("handshake with {} failed: {err}", display_peer(peer_addr));
                return Err(err);
            }
        };
        log::debug!(
            "handshake with {} for {} completed in {:?}",
            display_peer(peer_addr),
            request.target,
            deadline.elapsed()
        );

        Self::open(
            Role::Server,
            reader,
            writer,
            leftover,
            Some(request),
            peer_addr,
            options,
        )
    }

    /// Wraps a transport whose handshake is complete and starts the reader task.
    pub(crate) fn open<R>(
        role: Role,
        reader: R,
        writer: BoxedWrite,
        leftover: Bytes,
        request: Option<Request>,
        peer_addr: Option<SocketAddr>,
        options: Options,
    ) -> Result<Self>
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        let protocol = WebSocketProtocol::new(role, options.max_message_size);
        let state = Arc::clone(protocol.state());
        state.transition(State::Open)?;

        let (tx, rx) = mpsc::unbounded_channel();
        let (closed, _) = watch::channel(false);
        let rate_limiter = options
            .rate_limit
            .map(|limit| Mutex::new(RateLimiter::new(limit)));

        let connection = Self {
            inner: Arc::new(Inner {
                id: rand::random(),
                role,
                peer_addr,
                request,
                options,
                state,
                protocol: Mutex::new(protocol),
                writer: AsyncMutex::new(Some(writer)),
                teardown: CancellationToken::new(),
                messages: AsyncMutex::new(rx),
                closed,
                rate_limiter,
                reader: Mutex::new(None),
                handler: Mutex::new(HandlerSlot::default()),
            }),
        };

        let reader_task = tokio::spawn(connection.clone().read_loop(reader, tx, leftover));
        *connection.inner.reader.lock() = Some(reader_task.abort_handle());

        log::debug!("{connection:?} opened");
        Ok(connection)
    }

    async fn read_loop<R>(self, mut reader: R, tx: mpsc::UnboundedSender<Message>, leftover: Bytes)
    where
        R: AsyncRead + Unpin,
    {
        let buffer_size = self.inner.options.read_buffer_size;
        let mut result = if leftover.is_empty() {
            Ok(())
        } else {
            self.feed(&leftover, &tx).await
        };

        let mut buf = BytesMut::with_capacity(buffer_size);
        while result.is_ok() && !self.inner.state.is_closed() {
            buf.clear();
            buf.reserve(buffer_size);
            result = match reader.read_buf(&mut buf).await {
                Ok(0) => {
                    self.inner.protocol.lock().connection_lost();
                    break;
                }
                Ok(_) => self.feed(&buf, &tx).await,
                Err(err) => Err(err.into()),
            };
        }

        if let Err(err) = result {
            log::debug!("{self:?} stopped reading: {err}");
            self.inner.protocol.lock().connection_lost();
        }

        drop(tx);
        self.release_transport().await;
        self.inner.closed.send_replace(true);
        log::debug!("{self:?} closed");
    }

    /// Hands bytes to the protocol, forwards complete messages and flushes whatever the protocol
    /// queued in response (pongs, close frames).
    async fn feed(&self, data: &[u8], tx: &mpsc::UnboundedSender<Message>) -> Result<()> {
        let (received, pending) = {
            let mut protocol = self.inner.protocol.lock();
            let received = protocol.receive_data(data);
            while let Some(message) = protocol.next_message() {
                // the receiver lives in `Inner`, so it outlives this task
                let _ = tx.send(message);
            }
            (received, protocol.has_outgoing())
        };

        // the send lock may be held by a writer waiting on the peer, which in turn may be
        // waiting on us to read
        if !pending {
            return received;
        }
        let flushed = self.flush().await;
        received.and(flushed)
    }

    /// Runs `f` on the protocol and writes out everything it queued, all under the send lock.
    ///
    /// Both the wait for the lock and the write give up once the connection is torn down.
    async fn write_with<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut WebSocketProtocol) -> Result<T> + Send,
    {
        let teardown = &self.inner.teardown;
        let mut writer = tokio::select! {
            writer = self.inner.writer.lock() => writer,
            _ = teardown.cancelled() => return Err(self.inner.state.closed_error()),
        };
        let (value, data) = {
            let mut protocol = self.inner.protocol.lock();
            let value = f(&mut protocol)?;
            (value, protocol.take_outgoing())
        };

        if !data.is_empty() {
            let Some(writer) = writer.as_mut() else {
                return Err(self.inner.state.closed_error());
            };
            let write = async {
                writer.write_all(&data).await?;
                writer.flush().await
            };
            tokio::select! {
                written = write => written?,
                _ = teardown.cancelled() => return Err(self.inner.state.closed_error()),
            }
        }
        Ok(value)
    }

    async fn flush(&self) -> Result<()> {
        self.write_with(|_| Ok(())).await
    }

    /// Sends a message as a single frame: text as `Text`, bytes as `Binary`.
    ///
    /// # Errors
    /// - [`WebSocketError::Payload`] when the message exceeds `max_message_size`.
    /// - [`WebSocketError::Security`] when the rate limit is exhausted.
    /// - [`WebSocketError::ConnectionClosed`] once the closing handshake has started.
    pub async fn send(&self, message: impl Into<Message>) -> Result<()> {
        let message = message.into();
        if let Some(max) = self.inner.options.max_message_size {
            if message.len() > max {
                return Err(WebSocketError::Payload {
                    size: message.len() as u64,
                    max,
                });
            }
        }
        if let Some(limiter) = &self.inner.rate_limiter {
            limiter.lock().check()?;
        }

        let state = &self.inner.state;
        self.write_with(move |protocol| {
            if !state.is_open() {
                return Err(state.closed_error());
            }
            protocol.send_message(message)
        })
        .await
    }

    /// Waits for the next message.
    ///
    /// Messages already received stay available after the connection closes, until drained.
    ///
    /// # Errors
    /// - [`WebSocketError::Timeout`] when `timeout` elapses first.
    /// - [`WebSocketError::ConnectionClosed`] with the close code and reason once the connection
    ///   is closed and no message is left.
    pub async fn recv(&self, timeout: Option<Duration>) -> Result<Message> {
        let next = async {
            let mut messages = self.inner.messages.lock().await;
            messages.recv().await
        };
        let next = match timeout {
            Some(timeout) => tokio::time::timeout(timeout, next)
                .await
                .map_err(|_| WebSocketError::Timeout)?,
            None => next.await,
        };
        next.ok_or_else(|| self.inner.state.closed_error())
    }

    /// Sends a ping. The matching pong is consumed by the protocol.
    pub async fn ping(&self, payload: impl Into<Bytes>) -> Result<()> {
        let payload = payload.into();
        let state = &self.inner.state;
        self.write_with(move |protocol| {
            if !state.is_open() {
                return Err(state.closed_error());
            }
            protocol.ping(payload)
        })
        .await
    }

    /// Closes the connection.
    ///
    /// Sends a close frame (unless one went out already), waits for the peer's answer and
    /// releases the transport. The whole exchange, including the wait for a send lock held by a
    /// stalled writer, is bounded by `close_timeout`. The transport is released even when this
    /// returns an error.
    ///
    /// # Errors
    /// - [`WebSocketError::ConnectionClosed`] if the connection was already closed.
    /// - [`WebSocketError::Timeout`] if the close frame could not be written in time. The
    ///   connection is torn down without a closing handshake.
    pub async fn close(&self, code: impl Into<CloseCode>, reason: &str) -> Result<()> {
        let code = code.into();
        let deadline = Deadline::new(Some(self.inner.options.close_timeout));
        let result = deadline
            .run(self.write_with(|protocol| protocol.close(code, reason)))
            .await
            .and_then(|result| result);

        if matches!(result, Err(WebSocketError::Timeout)) {
            log::debug!("{self:?} could not send the close frame in time");
            self.stop_reader();
        } else if !self
            .wait_reader(deadline.remaining().unwrap_or_default())
            .await
        {
            log::debug!("{self:?} peer did not answer the close frame in time");
            self.stop_reader();
        }
        self.release_transport().await;
        result
    }

    /// Waits until the connection is closed.
    pub async fn closed(&self) {
        let mut closed = self.inner.closed.subscribe();
        // the sender lives in `Inner`, which `self` keeps alive
        let _ = closed.wait_for(|done| *done).await;
    }

    async fn wait_reader(&self, timeout: Duration) -> bool {
        let mut closed = self.inner.closed.subscribe();
        let waited = tokio::time::timeout(timeout, closed.wait_for(|done| *done)).await;
        matches!(waited, Ok(Ok(_)))
    }

    fn stop_reader(&self) {
        if let Some(reader) = self.inner.reader.lock().take() {
            reader.abort();
        }
        self.inner.protocol.lock().terminate();
        self.inner.closed.send_replace(true);
    }

    /// Forces the state to `CLOSED`, cancels pending writes and shuts the write half down.
    /// Idempotent.
    async fn release_transport(&self) {
        self.inner.protocol.lock().terminate();
        self.inner.teardown.cancel();
        let writer = self.inner.writer.lock().await.take();
        if let Some(mut writer) = writer {
            if let Err(err) = writer.shutdown().await {
                log::debug!("{self:?} shutdown failed: {err}");
            }
        }
    }

    /// Tears the connection down at once, cancelling both the handler and the reader.
    ///
    /// A handler that has not been spawned yet is aborted as soon as [`Connection::run`] starts
    /// it.
    pub(crate) async fn abort(&self) {
        {
            let mut slot = self.inner.handler.lock();
            slot.aborted = true;
            if let Some(task) = slot.task.take() {
                task.abort();
            }
        }
        self.stop_reader();
        self.release_transport().await;
    }

    /// Runs `handler` on its own task and closes the connection once it finishes.
    ///
    /// A normal return closes with 1000; an error or a panic is logged and closes with 1011.
    pub async fn run(&self, handler: Arc<dyn Handler>) {
        let task = tokio::spawn(handler.call(self.clone()));
        {
            let mut slot = self.inner.handler.lock();
            if slot.aborted {
                task.abort();
            } else {
                slot.task = Some(task.abort_handle());
            }
        }

        let (code, reason) = match task.await {
            Ok(Ok(())) => (CloseCode::Normal, ""),
            Ok(Err(err)) if err.is_closed() => {
                log::debug!("{self:?} handler stopped: {err}");
                (CloseCode::Normal, "")
            }
            Ok(Err(err)) => {
                log::error!("{self:?} handler failed: {err}");
                (CloseCode::Internal, "Internal server error")
            }
            Err(err) if err.is_cancelled() => (CloseCode::GoingAway, ""),
            Err(err) => {
                log::error!("{self:?} handler panicked: {err}");
                (CloseCode::Internal, "Internal server error")
            }
        };

        if let Err(err) = self.close(code, reason).await {
            if !err.is_closed() {
                log::debug!("{self:?} close after handler failed: {err}");
            }
        }
    }

    /// Random identifier, stable for the lifetime of the connection.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn role(&self) -> Role {
        self.inner.role
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.inner.peer_addr
    }

    /// The upgrade request, for server-side connections.
    pub fn request(&self) -> Option<&Request> {
        self.inner.request.as_ref()
    }

    pub fn state(&self) -> State {
        self.inner.state.state()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state.is_closed()
    }

    pub fn close_code(&self) -> Option<CloseCode> {
        self.inner.state.close_code()
    }

    pub fn close_reason(&self) -> Option<String> {
        self.inner.state.close_reason()
    }

    pub fn downgrade(&self) -> WeakConnection {
        WeakConnection {
            inner: Arc::downgrade(&self.inner),
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("role", &self.inner.role)
            .field("peer", &display_peer(self.inner.peer_addr))
            .field("state", &self.state())
            .finish()
    }
}

fn display_peer(peer_addr: Option<SocketAddr>) -> String {
    peer_addr.map_or_else(|| "peer".to_string(), |addr| addr.to_string())
}

/// Reads from `reader` until `parse` finds a complete HTTP message. Returns the message and the
/// bytes read past it.
pub(crate) async fn read_http<R, T>(
    reader: &mut R,
    parse: fn(&[u8]) -> Result<(T, usize)>,
) -> Result<(T, Bytes)>
where
    R: AsyncRead + Unpin,
{
    let mut buf = BytesMut::with_capacity(4096);
    loop {
        match parse(&buf) {
            Ok((message, consumed)) => {
                let _ = buf.split_to(consumed);
                return Ok((message, buf.freeze()));
            }
            Err(WebSocketError::IncompleteHttp) => {}
            Err(err) => return Err(err),
        }

        if buf.len() >= MAX_HANDSHAKE_SIZE {
            return Err(WebSocketError::Handshake(format!(
                "HTTP header block exceeds {MAX_HANDSHAKE_SIZE} bytes"
            )));
        }
        buf.reserve(4096);
        if reader.read_buf(&mut buf).await? == 0 {
            return Err(WebSocketError::Handshake(
                "connection closed during handshake".to_string(),
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{parse_frame, Frame, OpCode};
    use tokio::io::{duplex, DuplexStream};

    const REQUEST: &[u8] = b"GET /chat HTTP/1.1\r\n\
        Host: localhost\r\n\
        Upgrade: websocket\r\n\
        Connection: Upgrade\r\n\
        Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
        Sec-WebSocket-Version: 13\r\n\r\n";

    /// Reads the 101 response off `io` and returns the bytes that followed it.
    async fn read_response(io: &mut DuplexStream) -> Bytes {
        let (response, rest) = read_http(io, http::parse_response).await.unwrap();
        assert_eq!(response.status_code, 101);
        assert_eq!(
            response.headers.get("Sec-WebSocket-Accept").unwrap(),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
        rest
    }

    /// Reads frames until a close frame arrives.
    async fn read_until_close(io: &mut DuplexStream, mut buf: BytesMut) -> Vec<Frame> {
        let mut frames = Vec::new();
        loop {
            while let Some((frame, consumed)) = parse_frame(&buf, None).unwrap() {
                let _ = buf.split_to(consumed);
                let is_close = frame.opcode() == OpCode::Close;
                frames.push(frame);
                if is_close {
                    return frames;
                }
            }
            if io.read_buf(&mut buf).await.unwrap() == 0 {
                return frames;
            }
        }
    }

    fn masked(frame: Frame) -> Bytes {
        frame.serialize(true)
    }

    #[tokio::test]
    async fn test_echo_over_duplex() {
        let (mut client, server) = duplex(4096);
        let task = tokio::spawn(Connection::accept(
            server,
            |ws: Connection| async move {
                let message = ws.recv(None).await?;
                ws.send(message).await
            },
            Options::default(),
        ));

        client.write_all(REQUEST).await.unwrap();
        let rest = read_response(&mut client).await;
        client.write_all(&masked(Frame::text("ping me"))).await.unwrap();

        let frames = read_until_close(&mut client, BytesMut::from(&rest[..])).await;
        assert_eq!(frames[0], Frame::text("ping me"));
        let close = frames.last().unwrap();
        assert_eq!(
            crate::decode_close_payload(close.payload()).unwrap().0,
            CloseCode::Normal
        );

        client
            .write_all(&masked(Frame::close(CloseCode::Normal, "").unwrap()))
            .await
            .unwrap();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_leftover_bytes_are_frames() {
        let (mut client, server) = duplex(4096);
        let task = tokio::spawn(Connection::accept(
            server,
            |ws: Connection| async move {
                let message = ws.recv(None).await?;
                assert_eq!(message, Message::Text("early".into()));
                Ok(())
            },
            Options::default().with_close_timeout(Duration::from_millis(100)),
        ));

        let mut data = REQUEST.to_vec();
        data.extend_from_slice(&masked(Frame::text("early")));
        client.write_all(&data).await.unwrap();

        let rest = read_response(&mut client).await;
        let frames = read_until_close(&mut client, BytesMut::from(&rest[..])).await;
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].opcode(), OpCode::Close);
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_invalid_handshake_sends_nothing() {
        let (mut client, server) = duplex(4096);
        let task = tokio::spawn(Connection::accept(
            server,
            |_ws: Connection| async move { Ok(()) },
            Options::default(),
        ));

        client
            .write_all(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n")
            .await
            .unwrap();
        assert!(matches!(
            task.await.unwrap(),
            Err(WebSocketError::Header { .. })
        ));

        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn test_handshake_timeout() {
        let (mut client, server) = duplex(4096);
        let options = Options::default().with_handshake_timeout(Duration::from_millis(50));
        let task = tokio::spawn(Connection::accept(
            server,
            |_ws: Connection| async move { Ok(()) },
            options,
        ));

        client.write_all(&REQUEST[..20]).await.unwrap();
        assert!(matches!(task.await.unwrap(), Err(WebSocketError::Timeout)));
    }

    #[tokio::test]
    async fn test_handler_error_closes_with_1011() {
        let (mut client, server) = duplex(4096);
        let task = tokio::spawn(Connection::accept(
            server,
            |_ws: Connection| async move { Err(WebSocketError::Protocol("boom".into())) },
            Options::default().with_close_timeout(Duration::from_millis(100)),
        ));

        client.write_all(REQUEST).await.unwrap();
        let rest = read_response(&mut client).await;
        let frames = read_until_close(&mut client, BytesMut::from(&rest[..])).await;
        let (code, _) = crate::decode_close_payload(frames[0].payload()).unwrap();
        assert_eq!(code, CloseCode::Internal);
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_handler_panic_closes_with_1011() {
        let (mut client, server) = duplex(4096);
        let task = tokio::spawn(Connection::accept(
            server,
            |_ws: Connection| async move {
                if true {
                    panic!("handler blew up");
                }
                Ok(())
            },
            Options::default().with_close_timeout(Duration::from_millis(100)),
        ));

        client.write_all(REQUEST).await.unwrap();
        let rest = read_response(&mut client).await;
        let frames = read_until_close(&mut client, BytesMut::from(&rest[..])).await;
        let (code, _) = crate::decode_close_payload(frames[0].payload()).unwrap();
        assert_eq!(code, CloseCode::Internal);
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_oversize_send_rejected() {
        let (mut client, server) = duplex(4096);
        let (result_tx, result_rx) = tokio::sync::oneshot::channel();
        let result_tx = Mutex::new(Some(result_tx));
        let task = tokio::spawn(Connection::accept(
            server,
            move |ws: Connection| {
                let result_tx = result_tx.lock().take();
                async move {
                    let result = ws.send(vec![0u8; 11]).await;
                    if let Some(tx) = result_tx {
                        let _ = tx.send(result);
                    }
                    Ok(())
                }
            },
            Options::default()
                .with_max_message_size(10)
                .with_close_timeout(Duration::from_millis(100)),
        ));

        client.write_all(REQUEST).await.unwrap();
        read_response(&mut client).await;
        assert!(matches!(
            result_rx.await.unwrap(),
            Err(WebSocketError::Payload { size: 11, max: 10 })
        ));
        task.await.unwrap().unwrap();
    }

    /// Upgrades the server end of a duplex pair and returns the open connection.
    async fn upgraded(
        client: &mut DuplexStream,
        server: DuplexStream,
        options: Options,
    ) -> Connection {
        let upgrading = tokio::spawn(Connection::upgrade(server, None, options));
        client.write_all(REQUEST).await.unwrap();
        read_response(client).await;
        upgrading.await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_close_bounded_by_stalled_writer() {
        let (mut client, server) = duplex(4096);
        let options = Options::default().with_close_timeout(Duration::from_millis(100));
        let ws = upgraded(&mut client, server, options).await;

        // the client never reads, so the first large send holds the send lock
        let sender = ws.clone();
        let sending = tokio::spawn(async move {
            loop {
                if let Err(err) = sender.send(vec![0u8; 512 * 1024]).await {
                    return err;
                }
            }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        let closed = tokio::time::timeout(
            Duration::from_secs(2),
            ws.close(CloseCode::GoingAway, ""),
        )
        .await
        .expect("close returned in time");
        assert!(matches!(closed, Err(WebSocketError::Timeout)));
        assert!(ws.is_closed());
        assert_eq!(ws.close_code(), Some(CloseCode::Abnormal));

        let err = tokio::time::timeout(Duration::from_secs(2), sending)
            .await
            .expect("sender released")
            .unwrap();
        assert!(err.is_closed());
        drop(client);
    }

    #[tokio::test]
    async fn test_abort_before_run_cancels_handler() {
        let (mut client, server) = duplex(4096);
        let options = Options::default().with_close_timeout(Duration::from_millis(100));
        let ws = upgraded(&mut client, server, options).await;

        ws.abort().await;
        assert!(ws.is_closed());
        let handler: Arc<dyn Handler> = Arc::new(|_ws: Connection| async move {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(())
        });
        tokio::time::timeout(Duration::from_secs(2), ws.run(handler))
            .await
            .expect("aborted handler never ran to completion");
    }

    #[test]
    fn test_rate_limiter() {
        let mut limiter = RateLimiter::new(RateLimit::new(2, Duration::from_secs(60)));
        limiter.check().unwrap();
        limiter.check().unwrap();
        assert!(matches!(limiter.check(), Err(WebSocketError::Security(_))));

        let mut limiter = RateLimiter::new(RateLimit::new(1, Duration::ZERO));
        limiter.check().unwrap();
        limiter.check().unwrap();
    }
}
