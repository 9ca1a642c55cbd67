//! Close codes and close frame payloads, see [RFC 6455 Section 7.4](https://datatracker.ietf.org/doc/html/rfc6455#section-7.4).
//!
//! A close payload is either empty or a 2-byte big-endian status code followed by an optional
//! UTF-8 reason. Control frames carry at most 125 bytes, which leaves 123 bytes for the reason.

use bytes::{BufMut, Bytes, BytesMut};

use crate::{Result, WebSocketError};

/// Longest reason that fits a close frame.
pub const MAX_REASON_LEN: usize = 123;

/// Status code carried by a close frame.
///
/// Codes without a named variant are kept verbatim in [`CloseCode::Other`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CloseCode {
    /// 1000, the purpose of the connection has been fulfilled.
    Normal,
    /// 1001, the endpoint is going away (server shutdown, page navigation).
    GoingAway,
    /// 1002, the peer violated the protocol.
    Protocol,
    /// 1003, the endpoint cannot accept this kind of data.
    Unsupported,
    /// 1005, no status code was present. Never sent on the wire.
    NoStatusReceived,
    /// 1006, the connection dropped without a close frame. Never sent on the wire.
    Abnormal,
    /// 1007, a message payload was inconsistent with its type (e.g. non UTF-8 text).
    InvalidPayload,
    /// 1008, a message violated the endpoint's policy.
    Policy,
    /// 1009, a message was too big to process.
    Size,
    /// 1010, the client expected an extension the server did not negotiate.
    MandatoryExtension,
    /// 1011, the server hit an unexpected condition.
    Internal,
    /// 1012, the service is restarting.
    ServiceRestart,
    /// 1013, try again later, e.g. the server is at capacity.
    TryAgainLater,
    /// 1014, a gateway received an invalid response upstream.
    BadGateway,
    /// 1015, TLS handshake failure. Never sent on the wire.
    TlsHandshake,
    /// Any other code, including the application range 3000-4999.
    Other(u16),
}

impl CloseCode {
    /// Returns `true` when the code lies in the range a close frame may carry, `1000..=4999`.
    pub fn is_allowed(self) -> bool {
        (1000..=4999).contains(&u16::from(self))
    }
}

impl From<u16> for CloseCode {
    fn from(code: u16) -> Self {
        match code {
            1000 => Self::Normal,
            1001 => Self::GoingAway,
            1002 => Self::Protocol,
            1003 => Self::Unsupported,
            1005 => Self::NoStatusReceived,
            1006 => Self::Abnormal,
            1007 => Self::InvalidPayload,
            1008 => Self::Policy,
            1009 => Self::Size,
            1010 => Self::MandatoryExtension,
            1011 => Self::Internal,
            1012 => Self::ServiceRestart,
            1013 => Self::TryAgainLater,
            1014 => Self::BadGateway,
            1015 => Self::TlsHandshake,
            other => Self::Other(other),
        }
    }
}

impl From<CloseCode> for u16 {
    fn from(code: CloseCode) -> Self {
        match code {
            CloseCode::Normal => 1000,
            CloseCode::GoingAway => 1001,
            CloseCode::Protocol => 1002,
            CloseCode::Unsupported => 1003,
            CloseCode::NoStatusReceived => 1005,
            CloseCode::Abnormal => 1006,
            CloseCode::InvalidPayload => 1007,
            CloseCode::Policy => 1008,
            CloseCode::Size => 1009,
            CloseCode::MandatoryExtension => 1010,
            CloseCode::Internal => 1011,
            CloseCode::ServiceRestart => 1012,
            CloseCode::TryAgainLater => 1013,
            CloseCode::BadGateway => 1014,
            CloseCode::TlsHandshake => 1015,
            CloseCode::Other(code) => code,
        }
    }
}

impl std::fmt::Display for CloseCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", u16::from(*self))
    }
}

/// Builds a close payload from a code and a reason.
///
/// # Errors
/// - [`WebSocketError::InvalidCloseCode`] when the code is outside `1000..=4999`.
/// - [`WebSocketError::InvalidCloseFrame`] when the reason is longer than 123 bytes.
pub fn encode_close_payload(code: impl Into<CloseCode>, reason: &str) -> Result<Bytes> {
    let code = code.into();
    if !code.is_allowed() {
        return Err(WebSocketError::InvalidCloseCode(code.into()));
    }
    if reason.len() > MAX_REASON_LEN {
        return Err(WebSocketError::InvalidCloseFrame(format!(
            "close reason is {} bytes, at most {MAX_REASON_LEN} allowed",
            reason.len()
        )));
    }

    let mut payload = BytesMut::with_capacity(2 + reason.len());
    payload.put_u16(code.into());
    payload.put_slice(reason.as_bytes());
    Ok(payload.freeze())
}

/// Splits a close payload into its code and reason.
///
/// An empty payload means a normal closure without a reason.
///
/// # Errors
/// - [`WebSocketError::InvalidCloseFrame`] for a 1-byte payload.
/// - [`WebSocketError::InvalidCloseCode`] for a code outside `1000..=4999`.
/// - [`WebSocketError::InvalidUTF8`] when the reason is not valid UTF-8.
pub fn decode_close_payload(payload: &[u8]) -> Result<(CloseCode, String)> {
    match payload {
        [] => Ok((CloseCode::Normal, String::new())),
        [_] => Err(WebSocketError::InvalidCloseFrame(
            "close payload must be empty or at least 2 bytes".to_string(),
        )),
        [hi, lo, reason @ ..] => {
            let code = CloseCode::from(u16::from_be_bytes([*hi, *lo]));
            if !code.is_allowed() {
                return Err(WebSocketError::InvalidCloseCode(code.into()));
            }
            let reason = std::str::from_utf8(reason).map_err(|_| WebSocketError::InvalidUTF8)?;
            Ok((code, reason.to_string()))
        }
    }
}

/// Cuts `reason` down to the longest prefix that fits a close frame, on a char boundary.
pub(crate) fn truncate_reason(reason: &str) -> &str {
    if reason.len() <= MAX_REASON_LEN {
        return reason;
    }
    let mut end = MAX_REASON_LEN;
    while !reason.is_char_boundary(end) {
        end -= 1;
    }
    &reason[..end]
}
