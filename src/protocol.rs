//! # Protocol
//!
//! [`WebSocketProtocol`] is the per-connection state machine. It performs no I/O: bytes read from
//! the transport go in through [`WebSocketProtocol::receive_data`], reassembled messages come out
//! of [`WebSocketProtocol::next_message`], and every frame it wants to send (replies to pings,
//! close echoes, application messages) piles up until [`WebSocketProtocol::take_outgoing`]
//! drains it.
//!
//! ```rust
//! use haru_ws::{Message, Role, State, WebSocketProtocol};
//!
//! let mut client = WebSocketProtocol::new(Role::Client, None);
//! let mut server = WebSocketProtocol::new(Role::Server, None);
//! client.state().transition(State::Open).unwrap();
//! server.state().transition(State::Open).unwrap();
//!
//! client.send_message("hello").unwrap();
//! server.receive_data(&client.take_outgoing()).unwrap();
//! assert_eq!(server.next_message(), Some(Message::Text("hello".into())));
//! ```
//!
//! ## Lifecycle
//!
//! ```text
//! CONNECTING -> OPEN -> CLOSING -> CLOSED
//!      |          |                  ^
//!      +----------+------------------+
//! ```
//!
//! Any violation of the framing rules fails the connection: a close frame with a matching code
//! is queued (unless one was already sent), the state jumps to `CLOSED` and the error is returned
//! to the caller.

use std::{
    collections::{HashSet, VecDeque},
    fmt,
    sync::Arc,
};

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tokio_util::codec::{Decoder, Encoder};

use crate::{
    close::{decode_close_payload, truncate_reason, CloseCode},
    codec::FrameCodec,
    frame::{Frame, OpCode},
    Result, WebSocketError,
};

/// Lifecycle state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum State {
    Connecting,
    Open,
    Closing,
    Closed,
}

impl State {
    fn can_transition_to(self, to: State) -> bool {
        matches!(
            (self, to),
            (State::Connecting, State::Open | State::Closed)
                | (State::Open, State::Closing | State::Closed)
                | (State::Closing, State::Closed)
        )
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            State::Connecting => "CONNECTING",
            State::Open => "OPEN",
            State::Closing => "CLOSING",
            State::Closed => "CLOSED",
        })
    }
}

#[derive(Debug)]
struct StateInner {
    state: State,
    close_code: Option<CloseCode>,
    close_reason: Option<String>,
}

/// Connection state shared between the tasks of a connection.
///
/// The state, close code and close reason sit under one lock, so readers always observe a
/// consistent triple.
#[derive(Debug)]
pub struct ConnectionState {
    inner: Mutex<StateInner>,
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self::new(State::Connecting)
    }
}

impl ConnectionState {
    pub fn new(initial: State) -> Self {
        Self {
            inner: Mutex::new(StateInner {
                state: initial,
                close_code: None,
                close_reason: None,
            }),
        }
    }

    pub fn state(&self) -> State {
        self.inner.lock().state
    }

    pub fn is_open(&self) -> bool {
        self.state() == State::Open
    }

    pub fn is_closed(&self) -> bool {
        self.state() == State::Closed
    }

    /// Close code recorded when the connection entered `CLOSED`.
    pub fn close_code(&self) -> Option<CloseCode> {
        self.inner.lock().close_code
    }

    pub fn close_reason(&self) -> Option<String> {
        self.inner.lock().close_reason.clone()
    }

    /// Moves to `to` without recording a close code.
    ///
    /// # Errors
    /// [`WebSocketError::InvalidStateTransition`] when the lifecycle forbids the move. Nothing
    /// leaves `CLOSED`.
    pub fn transition(&self, to: State) -> Result<()> {
        self.transition_inner(to, None, None)
    }

    /// Moves to `CLOSED`, recording `code` and `reason`.
    pub fn transition_to_closed(&self, code: CloseCode, reason: impl Into<String>) -> Result<()> {
        self.transition_inner(State::Closed, Some(code), Some(reason.into()))
    }

    fn transition_inner(
        &self,
        to: State,
        code: Option<CloseCode>,
        reason: Option<String>,
    ) -> Result<()> {
        let mut inner = self.inner.lock();
        let from = inner.state;
        if !from.can_transition_to(to) {
            return Err(WebSocketError::InvalidStateTransition { from, to });
        }

        log::trace!("state {from} -> {to}");
        inner.state = to;
        if to == State::Closed {
            inner.close_code = code;
            inner.close_reason = reason;
        }
        Ok(())
    }

    /// Moves to `CLOSED` unless already there, in one step. Returns whether it moved.
    pub(crate) fn close_if_not_closed(&self, code: CloseCode, reason: &str) -> bool {
        let mut inner = self.inner.lock();
        if inner.state == State::Closed {
            return false;
        }
        log::trace!("state {} -> {}", inner.state, State::Closed);
        inner.state = State::Closed;
        inner.close_code = Some(code);
        inner.close_reason = Some(reason.to_string());
        true
    }

    /// The error returned by operations attempted on a closed connection.
    pub fn closed_error(&self) -> WebSocketError {
        let inner = self.inner.lock();
        WebSocketError::ConnectionClosed {
            code: inner.close_code.map(u16::from),
            reason: inner.close_reason.clone(),
        }
    }
}

/// Which end of the connection this is. Clients mask every outgoing frame, servers never do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Server,
    Client,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Role::Server => "server",
            Role::Client => "client",
        })
    }
}

/// A complete application message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Text(String),
    Binary(Bytes),
}

impl Message {
    pub fn is_text(&self) -> bool {
        matches!(self, Message::Text(_))
    }

    pub fn is_binary(&self) -> bool {
        matches!(self, Message::Binary(_))
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Message::Text(text) => Some(text),
            Message::Binary(_) => None,
        }
    }

    /// Payload bytes, whatever the message type.
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Message::Text(text) => text.as_bytes(),
            Message::Binary(data) => data,
        }
    }

    pub fn len(&self) -> usize {
        self.as_bytes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Single final frame carrying the message: `Text` for text, `Binary` for bytes.
    pub fn into_frame(self) -> Frame {
        match self {
            Message::Text(text) => Frame::text(text),
            Message::Binary(data) => Frame::binary(data),
        }
    }
}

impl From<String> for Message {
    fn from(text: String) -> Self {
        Message::Text(text)
    }
}

impl From<&str> for Message {
    fn from(text: &str) -> Self {
        Message::Text(text.to_string())
    }
}

impl From<Bytes> for Message {
    fn from(data: Bytes) -> Self {
        Message::Binary(data)
    }
}

impl From<Vec<u8>> for Message {
    fn from(data: Vec<u8>) -> Self {
        Message::Binary(data.into())
    }
}

impl From<&[u8]> for Message {
    fn from(data: &[u8]) -> Self {
        Message::Binary(Bytes::copy_from_slice(data))
    }
}

/// A data message being reassembled from fragments.
#[derive(Debug)]
struct Fragment {
    opcode: OpCode,
    parts: Vec<Bytes>,
    size: usize,
}

impl Fragment {
    fn concat(self) -> Bytes {
        if self.parts.len() == 1 {
            return self.parts.into_iter().next().unwrap_or_default();
        }
        let mut buf = BytesMut::with_capacity(self.size);
        for part in self.parts {
            buf.extend_from_slice(&part);
        }
        buf.freeze()
    }
}

/// Sans-IO WebSocket protocol state machine for one connection.
#[derive(Debug)]
pub struct WebSocketProtocol {
    role: Role,
    max_size: Option<usize>,
    state: Arc<ConnectionState>,
    codec: FrameCodec,
    incoming: BytesMut,
    outgoing: BytesMut,
    messages: VecDeque<Message>,
    fragment: Option<Fragment>,
    /// Code and reason of the close frame this side sent.
    close_sent: Option<(CloseCode, String)>,
    close_received: bool,
    pending_pings: HashSet<Bytes>,
}

impl WebSocketProtocol {
    /// Creates a protocol in the `CONNECTING` state.
    ///
    /// `max_size` bounds both single frames and reassembled messages; `None` disables the check.
    pub fn new(role: Role, max_size: Option<usize>) -> Self {
        Self {
            role,
            max_size,
            state: Arc::new(ConnectionState::default()),
            codec: FrameCodec::new(role, max_size),
            incoming: BytesMut::new(),
            outgoing: BytesMut::new(),
            messages: VecDeque::new(),
            fragment: None,
            close_sent: None,
            close_received: false,
            pending_pings: HashSet::new(),
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn max_size(&self) -> Option<usize> {
        self.max_size
    }

    /// Shared handle to the connection state.
    pub fn state(&self) -> &Arc<ConnectionState> {
        &self.state
    }

    pub fn close_sent(&self) -> bool {
        self.close_sent.is_some()
    }

    pub fn close_received(&self) -> bool {
        self.close_received
    }

    /// Feeds bytes read from the transport.
    ///
    /// Complete frames are dispatched immediately; a trailing partial frame stays buffered until
    /// the next call. Data received once the connection is `CLOSED` is dropped.
    ///
    /// # Errors
    /// Any framing or protocol violation. The connection has been failed by the time the error
    /// is returned: a close frame is queued and the state is `CLOSED`.
    pub fn receive_data(&mut self, data: &[u8]) -> Result<()> {
        if self.state.is_closed() {
            return Ok(());
        }

        self.incoming.extend_from_slice(data);
        if let Err(err) = self.process_incoming() {
            self.fail(&err);
            return Err(err);
        }
        Ok(())
    }

    fn process_incoming(&mut self) -> Result<()> {
        while !self.state.is_closed() {
            let Some(frame) = self.codec.decode(&mut self.incoming)? else {
                break;
            };
            log::trace!(
                "{} received {:?} frame (fin={}, {} bytes)",
                self.role,
                frame.opcode(),
                frame.fin(),
                frame.payload().len()
            );
            self.handle_frame(frame)?;
        }
        Ok(())
    }

    fn handle_frame(&mut self, frame: Frame) -> Result<()> {
        match frame.opcode() {
            OpCode::Close => {
                let (code, reason) = decode_close_payload(frame.payload())?;
                self.handle_close(code, reason)
            }
            OpCode::Ping => {
                if self.state.is_closed() {
                    return Ok(());
                }
                self.pong(frame.into_payload())
            }
            OpCode::Pong => {
                self.pending_pings.remove(frame.payload());
                Ok(())
            }
            OpCode::Continuation | OpCode::Text | OpCode::Binary => self.handle_data_frame(frame),
        }
    }

    fn handle_data_frame(&mut self, frame: Frame) -> Result<()> {
        let fin = frame.fin();
        let opcode = frame.opcode();

        if opcode != OpCode::Continuation {
            if self.fragment.is_some() {
                return Err(WebSocketError::Protocol(
                    "expected continuation frame".to_string(),
                ));
            }
            let payload = frame.into_payload();
            if fin {
                return self.push_message(opcode, payload);
            }
            self.fragment = Some(Fragment {
                opcode,
                size: payload.len(),
                parts: vec![payload],
            });
            return Ok(());
        }

        let Some(fragment) = self.fragment.as_mut() else {
            return Err(WebSocketError::Protocol(
                "unexpected continuation frame".to_string(),
            ));
        };

        fragment.size += frame.payload().len();
        if let Some(max) = self.max_size {
            if fragment.size > max {
                return Err(WebSocketError::Protocol(format!(
                    "message size {} exceeds limit {max}",
                    fragment.size
                )));
            }
        }
        fragment.parts.push(frame.into_payload());

        if fin {
            if let Some(fragment) = self.fragment.take() {
                let opcode = fragment.opcode;
                return self.push_message(opcode, fragment.concat());
            }
        }
        Ok(())
    }

    fn push_message(&mut self, opcode: OpCode, payload: Bytes) -> Result<()> {
        let message = match opcode {
            OpCode::Text => Message::Text(
                String::from_utf8(payload.to_vec()).map_err(|_| WebSocketError::InvalidUTF8)?,
            ),
            _ => Message::Binary(payload),
        };
        self.messages.push_back(message);
        Ok(())
    }

    fn handle_close(&mut self, code: CloseCode, reason: String) -> Result<()> {
        log::debug!("{} received close frame (code={code}, reason={reason:?})", self.role);
        self.close_received = true;

        if self.close_sent.is_none() {
            self.close(code, &reason)?;
        }
        self.state.close_if_not_closed(code, &reason);
        Ok(())
    }

    /// Fails the connection after `err`: queues a close frame if none was sent and goes straight
    /// to `CLOSED`.
    fn fail(&mut self, err: &WebSocketError) {
        let code = err.close_code();
        let message = err.to_string();
        let reason = truncate_reason(&message);
        log::debug!("{} failing connection with {code}: {err}", self.role);

        if self.close_sent.is_none() && !self.state.is_closed() {
            if let Err(err) = self.queue_close(code, reason) {
                log::debug!("unable to queue close frame: {err}");
            }
        }
        self.incoming.clear();
        self.fragment = None;
        self.state.close_if_not_closed(code, reason);
    }

    fn write_frame(&mut self, frame: Frame) -> Result<()> {
        self.codec.encode(frame, &mut self.outgoing)
    }

    fn queue_close(&mut self, code: CloseCode, reason: &str) -> Result<()> {
        self.write_frame(Frame::close(code, reason)?)?;
        self.close_sent = Some((code, reason.to_string()));
        Ok(())
    }

    /// Queues a frame, masked according to the role.
    ///
    /// # Errors
    /// [`WebSocketError::ConnectionClosed`] once the connection is `CLOSED`.
    pub fn send_frame(&mut self, frame: Frame) -> Result<()> {
        if self.state.is_closed() {
            return Err(self.state.closed_error());
        }
        self.write_frame(frame)
    }

    /// Queues a message as a single `Text` or `Binary` frame.
    pub fn send_message(&mut self, message: impl Into<Message>) -> Result<()> {
        self.send_frame(message.into().into_frame())
    }

    /// Queues a ping and remembers its payload until the matching pong arrives.
    ///
    /// # Errors
    /// [`WebSocketError::Frame`] for a payload over 125 bytes, or `ConnectionClosed`.
    pub fn ping(&mut self, payload: impl Into<Bytes>) -> Result<()> {
        let frame = Frame::ping(payload)?;
        let payload = frame.payload().clone();
        self.send_frame(frame)?;
        self.pending_pings.insert(payload);
        Ok(())
    }

    pub fn pong(&mut self, payload: impl Into<Bytes>) -> Result<()> {
        self.send_frame(Frame::pong(payload)?)
    }

    /// Whether a ping with this payload is still waiting for its pong.
    pub fn is_ping_pending(&self, payload: &[u8]) -> bool {
        self.pending_pings.contains(payload)
    }

    pub fn pending_pings(&self) -> usize {
        self.pending_pings.len()
    }

    /// Starts or completes the closing handshake.
    ///
    /// The close frame is queued at most once. The state becomes `CLOSING` while the peer's close
    /// is outstanding and `CLOSED` once it has been received. Closing a connection that never
    /// opened skips the frame and goes straight to `CLOSED`.
    ///
    /// # Errors
    /// [`WebSocketError::ConnectionClosed`] if already `CLOSED`; close code or reason errors
    /// from [`crate::encode_close_payload`].
    pub fn close(&mut self, code: impl Into<CloseCode>, reason: &str) -> Result<()> {
        let code = code.into();
        match self.state.state() {
            State::Closed => return Err(self.state.closed_error()),
            State::Connecting => return self.state.transition_to_closed(code, reason),
            State::Open | State::Closing => {}
        }

        if self.close_sent.is_none() {
            log::debug!("{} sending close frame (code={code}, reason={reason:?})", self.role);
            self.queue_close(code, reason)?;
        }

        if self.close_received {
            self.state.transition_to_closed(code, reason)
        } else if self.state.state() == State::Open {
            self.state.transition(State::Closing)
        } else {
            Ok(())
        }
    }

    /// Records that the transport ended without a completed closing handshake.
    pub fn connection_lost(&mut self) {
        if self.state.close_if_not_closed(CloseCode::Protocol, "") {
            log::debug!("{} connection lost before the closing handshake", self.role);
        }
    }

    /// Forces `CLOSED` after the peer failed to answer our close frame in time. The code recorded
    /// is the one this side sent, or 1006 when no close frame went out.
    pub fn terminate(&mut self) {
        let (code, reason) = self
            .close_sent
            .clone()
            .unwrap_or((CloseCode::Abnormal, String::new()));
        self.state.close_if_not_closed(code, &reason);
    }

    /// Drains every queued outgoing byte, in queue order.
    pub fn take_outgoing(&mut self) -> Bytes {
        self.outgoing.split().freeze()
    }

    pub fn has_outgoing(&self) -> bool {
        !self.outgoing.is_empty()
    }

    /// Pops the oldest complete message.
    pub fn next_message(&mut self) -> Option<Message> {
        self.messages.pop_front()
    }
}
