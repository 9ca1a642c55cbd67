//! # haru-ws
//! Implementation of the WebSocket protocol (RFC 6455) used by the Haru web toolkit: a binary
//! frame codec, the HTTP upgrade handshake, a sans-IO protocol state machine handling
//! fragmentation, control frames and the close handshake, and a connection server.
//!
//! The crate is layered, leaves first:
//!
//! - [`mask`] and [`util`]: payload masking, handshake keys, constant-time comparison, deadlines.
//! - [`frame`], [`close`] and [`codec`]: frame parsing/serialization and close payloads.
//! - [`http`]: the minimal HTTP/1.1 parser and builder used by the upgrade handshake.
//! - [`protocol`]: the per-connection state machine, free of any I/O.
//! - [`Connection`], [`Server`] and [`client`]: tokio-driven transports around the state machine.
//!
//! # Server Example
//! ```no_run
//! use haru_ws::{Connection, Message, Server, ServerConfig};
//!
//! #[tokio::main]
//! async fn main() -> haru_ws::Result<()> {
//!     let config = ServerConfig::default().with_max_connections(128);
//!     let server = Server::bind("127.0.0.1:8765", config)
//!         .await?
//!         .route("/echo", |ws: Connection| async move {
//!             loop {
//!                 match ws.recv(None).await? {
//!                     Message::Text(text) => ws.send(text).await?,
//!                     Message::Binary(data) => ws.send(data).await?,
//!                 }
//!             }
//!         });
//!
//!     server.run().await
//! }
//! ```
//!
//! # Client Example
//! ```no_run
//! use haru_ws::{client, Options};
//!
//! #[tokio::main]
//! async fn main() -> haru_ws::Result<()> {
//!     let ws = client::connect("ws://127.0.0.1:8765/echo".parse()?, Options::default()).await?;
//!     ws.send("hello").await?;
//!     let reply = ws.recv(None).await?;
//!     println!("{reply:?}");
//!     ws.close(haru_ws::close::CloseCode::Normal, "bye").await
//! }
//! ```
//!
//! # Concurrency Model
//! Every connection owns one reader task that feeds the [`protocol::WebSocketProtocol`] and one
//! task running the user handler. Decoded messages travel over an unbounded FIFO channel, and
//! writes are serialized through a per-connection async lock, so frames produced by concurrent
//! `send`, `ping` and `close` calls are never interleaved on the wire.

#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod client;
pub mod close;
pub mod codec;
pub mod frame;
pub mod http;
pub mod mask;
pub mod protocol;
pub mod util;

mod connection;
mod options;
mod server;

use thiserror::Error;

pub use close::{decode_close_payload, encode_close_payload, CloseCode};
pub use connection::{Connection, Handler, WeakConnection};
pub use frame::{create_frame, parse_frame, Frame, OpCode};
pub use options::{
    Options, RateLimit, ServerConfig, CLOSE_TIMEOUT, HANDSHAKE_TIMEOUT, MAX_CONNECTIONS,
    MAX_MESSAGE_SIZE, READ_BUFFER_SIZE, SHUTDOWN_TIMEOUT,
};
pub use protocol::{ConnectionState, Message, Role, State, WebSocketProtocol};
pub use server::{serve, Routes, Server, ServerHandle};

/// A result type for WebSocket operations, using `WebSocketError` as the error type.
pub type Result<T> = std::result::Result<T, WebSocketError>;

/// Represents errors that can occur during WebSocket operations.
///
/// The variants fall into a few families:
///
/// - Frame and payload errors raised by the codec ([`WebSocketError::Frame`],
///   [`WebSocketError::Payload`]).
/// - Protocol violations detected by the state machine ([`WebSocketError::Protocol`],
///   [`WebSocketError::InvalidUTF8`], close payload errors).
/// - Handshake failures ([`WebSocketError::Handshake`], [`WebSocketError::Header`],
///   [`WebSocketError::Security`]).
/// - Lifecycle signals ([`WebSocketError::ConnectionClosed`], [`WebSocketError::Timeout`]).
/// - I/O and URL errors from the transport.
#[derive(Error, Debug)]
pub enum WebSocketError {
    /// A frame is malformed: unknown opcode, reserved bits set, or a control frame that is
    /// fragmented or carries more than 125 bytes.
    #[error("Invalid frame: {0}")]
    Frame(String),

    /// A frame declares a payload larger than the configured maximum, or an outgoing message
    /// exceeds it.
    #[error("Payload length {size} exceeds maximum size {max}")]
    Payload { size: u64, max: usize },

    /// The peer violated the framing rules, e.g. an unexpected continuation frame or a
    /// fragmented message that grew past the size limit.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// A text message or a close reason is not valid UTF-8.
    ///
    /// Counts as a protocol violation ([`WebSocketError::is_protocol_error`] is `true`), but
    /// the connection fails with 1007 rather than 1002.
    #[error("Invalid UTF-8 in text message")]
    InvalidUTF8,

    /// A close code outside of the `1000..=4999` range.
    #[error("Invalid close code: {0}")]
    InvalidCloseCode(u16),

    /// A close payload that cannot be encoded or decoded.
    #[error("Invalid close frame: {0}")]
    InvalidCloseFrame(String),

    /// The HTTP upgrade request or response is malformed.
    #[error("Handshake error: {0}")]
    Handshake(String),

    /// The HTTP message ended before the header terminator; more bytes are needed.
    #[error("Incomplete HTTP message")]
    IncompleteHttp,

    /// A required handshake header is missing, duplicated or carries an unexpected value.
    #[error("{}", header_message(.name, .value.as_deref()))]
    Header { name: String, value: Option<String> },

    /// A security check failed: bad key or accept encoding, accept mismatch, or a rate limit.
    #[error("Security error: {0}")]
    Security(String),

    /// The handshake response did not switch protocols.
    #[error("Invalid status code: {0}")]
    InvalidStatusCode(u16),

    /// The connection reached its terminal state. Carries the close code and reason when known.
    #[error("Connection is closed{}", closed_suffix(*.code, .reason.as_deref()))]
    ConnectionClosed {
        code: Option<u16>,
        reason: Option<String>,
    },

    /// A bounded wait elapsed: handshake deadline or `recv` timeout.
    #[error("Operation timed out")]
    Timeout,

    /// A connection state transition that the lifecycle does not allow.
    #[error("Invalid state transition: {from} -> {to}")]
    InvalidStateTransition { from: State, to: State },

    /// Only `ws://` URLs can be dialed directly.
    #[error("Invalid http scheme")]
    InvalidHttpScheme,

    /// Wraps errors from URL parsing.
    #[error(transparent)]
    UrlParseError(#[from] url::ParseError),

    /// Wraps transport I/O errors.
    #[error(transparent)]
    IoError(#[from] std::io::Error),
}

impl WebSocketError {
    /// Returns the close code this side sends when the error fails an open connection.
    pub fn close_code(&self) -> CloseCode {
        match self {
            WebSocketError::Payload { .. } => CloseCode::Size,
            WebSocketError::InvalidUTF8 => CloseCode::InvalidPayload,
            WebSocketError::Frame(_)
            | WebSocketError::Protocol(_)
            | WebSocketError::InvalidCloseCode(_)
            | WebSocketError::InvalidCloseFrame(_) => CloseCode::Protocol,
            WebSocketError::Security(_) => CloseCode::Policy,
            _ => CloseCode::Internal,
        }
    }

    /// Returns `true` for the variants that signal a violation of the framing protocol.
    ///
    /// This is the way to recognise a failed connection whatever its close code:
    /// [`WebSocketError::InvalidUTF8`] and [`WebSocketError::Payload`] count, even though they
    /// close with 1007 and 1009.
    pub fn is_protocol_error(&self) -> bool {
        matches!(
            self,
            WebSocketError::Frame(_)
                | WebSocketError::Payload { .. }
                | WebSocketError::Protocol(_)
                | WebSocketError::InvalidUTF8
                | WebSocketError::InvalidCloseCode(_)
                | WebSocketError::InvalidCloseFrame(_)
        )
    }

    /// Returns `true` if this is a [`WebSocketError::ConnectionClosed`].
    pub fn is_closed(&self) -> bool {
        matches!(self, WebSocketError::ConnectionClosed { .. })
    }
}

fn header_message(name: &str, value: Option<&str>) -> String {
    match value {
        Some(value) => format!("Invalid {name} header: {value}"),
        None => format!("Missing {name} header"),
    }
}

fn closed_suffix(code: Option<u16>, reason: Option<&str>) -> String {
    let mut suffix = String::new();
    if let Some(code) = code {
        suffix.push_str(&format!(" (code={code})"));
    }
    if let Some(reason) = reason.filter(|reason| !reason.is_empty()) {
        suffix.push_str(&format!(", reason={reason:?}"));
    }
    suffix
}
