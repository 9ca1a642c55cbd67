//! # Frame
//!
//! The `frame` module implements WebSocket frames as defined in [RFC 6455 Section 5.2](https://datatracker.ietf.org/doc/html/rfc6455#section-5.2).
//! Each frame is an atomic unit of transmission carrying a payload and protocol metadata.
//!
//! ### Frame Binary Format
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! |F|R|R|R| opcode|M| Payload len |    Extended payload length    |
//! |I|S|S|S|  (4)  |A|     (7)     |         (16 or 64 bits)       |
//! |N|V|V|V|       |S|             |                               |
//! | |1|2|3|       |K|             |                               |
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! |        Extended payload length continued, if payload len == 127|
//! +---------------------------------------------------------------+
//! |                               |   Masking-key, if MASK set to 1|
//! +-------------------------------+-------------------------------+
//! |     Masking-key (continued)       |          Payload Data      |
//! +-----------------------------------+ - - - - - - - - - - - - - -+
//! :                     Payload Data continued ...                :
//! +---------------------------------------------------------------+
//! ```
//!
//! Frames come in two categories:
//!
//! - **Data Frames**: `Text`, `Binary` and `Continuation` (the tail of a fragmented message).
//! - **Control Frames**: `Close`, `Ping` and `Pong`. They are never fragmented and carry at most
//!   125 bytes of payload.
//!
//! A [`Frame`] is validated when it is built, so every frame in circulation is well formed:
//!
//! ```rust
//! use haru_ws::frame::{Frame, OpCode};
//!
//! let text = Frame::text("Hello, WebSocket!");
//! let ping = Frame::ping("are you there?").unwrap();
//! assert!(Frame::new(false, OpCode::Ping, vec![]).is_err());
//!
//! let wire = text.serialize(false);
//! let (parsed, consumed) = haru_ws::parse_frame(&wire, None).unwrap().unwrap();
//! assert_eq!(parsed, text);
//! assert_eq!(consumed, wire.len());
//! ```
use bytes::{BufMut, Bytes, BytesMut};

use crate::{mask::apply_mask, Result, WebSocketError};

/// Largest payload a control frame may carry.
pub const MAX_CONTROL_PAYLOAD: usize = 125;

/// 2 bytes of header, 8 bytes of extended length and 4 bytes of masking key.
pub(crate) const MAX_HEAD_SIZE: usize = 14;

/// WebSocket operation code (OpCode) that determines the semantic meaning and handling of a frame.
///
/// The numeric values are defined in [RFC 6455, Section 11.8](https://datatracker.ietf.org/doc/html/rfc6455#section-11.8).
/// The ranges 0x3-0x7 and 0xB-0xF are reserved and rejected when parsing.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum OpCode {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
}

impl OpCode {
    /// Returns `true` if the `OpCode` represents a control frame (`Close`, `Ping`, or `Pong`).
    ///
    /// Control frames cannot be fragmented and their payload must not exceed 125 bytes.
    pub fn is_control(&self) -> bool {
        matches!(*self, OpCode::Close | OpCode::Ping | OpCode::Pong)
    }

    /// Returns `true` for `Continuation`, `Text` and `Binary`.
    pub fn is_data(&self) -> bool {
        !self.is_control()
    }
}

impl TryFrom<u8> for OpCode {
    type Error = WebSocketError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0x0 => Ok(Self::Continuation),
            0x1 => Ok(Self::Text),
            0x2 => Ok(Self::Binary),
            0x8 => Ok(Self::Close),
            0x9 => Ok(Self::Ping),
            0xA => Ok(Self::Pong),
            _ => Err(WebSocketError::Frame(format!("invalid opcode: {value:#x}"))),
        }
    }
}

impl From<OpCode> for u8 {
    fn from(val: OpCode) -> Self {
        match val {
            OpCode::Continuation => 0x0,
            OpCode::Text => 0x1,
            OpCode::Binary => 0x2,
            OpCode::Close => 0x8,
            OpCode::Ping => 0x9,
            OpCode::Pong => 0xA,
        }
    }
}

/// A validated WebSocket frame.
///
/// Frames are immutable once built. The constructors enforce the framing rules, so a `Frame`
/// value always satisfies them:
///
/// - control frames have `fin` set and a payload of at most 125 bytes,
/// - the reserved bits are clear, since no extension is ever negotiated.
///
/// The masking key is not part of the value: it is picked when the frame is serialized and
/// removed when it is parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    fin: bool,
    opcode: OpCode,
    payload: Bytes,
    rsv1: bool,
    rsv2: bool,
    rsv3: bool,
}

impl Frame {
    /// Creates a frame with the reserved bits clear.
    ///
    /// # Errors
    /// [`WebSocketError::Frame`] when a control frame is fragmented or its payload exceeds
    /// 125 bytes.
    pub fn new(fin: bool, opcode: OpCode, payload: impl Into<Bytes>) -> Result<Self> {
        Self::with_reserved(fin, opcode, payload, false, false, false)
    }

    /// Creates a frame with explicit reserved bits.
    ///
    /// # Errors
    /// Besides the checks of [`Frame::new`], any reserved bit set is rejected.
    pub fn with_reserved(
        fin: bool,
        opcode: OpCode,
        payload: impl Into<Bytes>,
        rsv1: bool,
        rsv2: bool,
        rsv3: bool,
    ) -> Result<Self> {
        let payload = payload.into();
        validate_header(fin, opcode, payload.len() as u64, rsv1 || rsv2 || rsv3)?;
        Ok(Self {
            fin,
            opcode,
            payload,
            rsv1,
            rsv2,
            rsv3,
        })
    }

    /// A final text frame. The caller guarantees the payload is UTF-8.
    pub fn text(payload: impl Into<Bytes>) -> Self {
        Self::data(true, OpCode::Text, payload.into())
    }

    /// A final binary frame.
    pub fn binary(payload: impl Into<Bytes>) -> Self {
        Self::data(true, OpCode::Binary, payload.into())
    }

    /// A continuation frame, `fin` marking the last fragment.
    pub fn continuation(fin: bool, payload: impl Into<Bytes>) -> Self {
        Self::data(fin, OpCode::Continuation, payload.into())
    }

    pub fn ping(payload: impl Into<Bytes>) -> Result<Self> {
        Self::new(true, OpCode::Ping, payload)
    }

    pub fn pong(payload: impl Into<Bytes>) -> Result<Self> {
        Self::new(true, OpCode::Pong, payload)
    }

    /// A close frame carrying `code` and `reason`, see [`crate::encode_close_payload`].
    pub fn close(code: impl Into<crate::CloseCode>, reason: &str) -> Result<Self> {
        Self::new(
            true,
            OpCode::Close,
            crate::encode_close_payload(code, reason)?,
        )
    }

    // Data frames have no payload limit, so they cannot fail validation.
    fn data(fin: bool, opcode: OpCode, payload: Bytes) -> Self {
        Self {
            fin,
            opcode,
            payload,
            rsv1: false,
            rsv2: false,
            rsv3: false,
        }
    }

    #[inline]
    pub fn fin(&self) -> bool {
        self.fin
    }

    #[inline]
    pub fn opcode(&self) -> OpCode {
        self.opcode
    }

    #[inline]
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Consumes the frame, returning its payload.
    #[inline]
    pub fn into_payload(self) -> Bytes {
        self.payload
    }

    pub fn rsv1(&self) -> bool {
        self.rsv1
    }

    pub fn rsv2(&self) -> bool {
        self.rsv2
    }

    pub fn rsv3(&self) -> bool {
        self.rsv3
    }

    /// Checks if the frame payload is valid UTF-8.
    #[inline]
    pub fn is_utf8(&self) -> bool {
        is_utf8(&self.payload)
    }

    /// Serializes the frame into its wire layout.
    ///
    /// With `mask` set, a fresh random masking key is generated for this frame and applied to the
    /// payload; keys are never reused across frames.
    pub fn serialize(&self, mask: bool) -> Bytes {
        let mut dst = BytesMut::with_capacity(MAX_HEAD_SIZE + self.payload.len());
        self.encode_into(&mut dst, mask.then(rand::random));
        dst.freeze()
    }

    /// Appends the wire layout to `dst`, masking with `mask` when given.
    pub(crate) fn encode_into(&self, dst: &mut BytesMut, mask: Option<[u8; 4]>) {
        let mut head = [0u8; MAX_HEAD_SIZE];
        let size = self.fmt_head(&mut head, mask);

        dst.reserve(size + self.payload.len());
        dst.put_slice(&head[..size]);

        let start = dst.len();
        dst.put_slice(&self.payload);
        if let Some(mask) = mask {
            apply_mask(&mut dst[start..], mask);
        }
    }

    /// Formats the frame header into `head` and returns its size: 2 bytes, plus 2 or 8 bytes of
    /// extended length, plus 4 bytes when masked.
    fn fmt_head(&self, head: &mut [u8; MAX_HEAD_SIZE], mask: Option<[u8; 4]>) -> usize {
        head[0] = (self.fin as u8) << 7
            | (self.rsv1 as u8) << 6
            | (self.rsv2 as u8) << 5
            | (self.rsv3 as u8) << 4
            | u8::from(self.opcode);

        let len = self.payload.len();
        let size = if len < 126 {
            head[1] = len as u8;
            2
        } else if len < 65536 {
            head[1] = 126;
            head[2..4].copy_from_slice(&(len as u16).to_be_bytes());
            4
        } else {
            head[1] = 127;
            head[2..10].copy_from_slice(&(len as u64).to_be_bytes());
            10
        };

        if let Some(mask) = mask {
            head[1] |= 0x80;
            head[size..size + 4].copy_from_slice(&mask);
            size + 4
        } else {
            size
        }
    }
}

fn validate_header(fin: bool, opcode: OpCode, len: u64, reserved: bool) -> Result<()> {
    if reserved {
        return Err(WebSocketError::Frame("reserved bits must be zero".to_string()));
    }
    if opcode.is_control() {
        if !fin {
            return Err(WebSocketError::Frame(format!(
                "control frame {opcode:?} must not be fragmented"
            )));
        }
        if len > MAX_CONTROL_PAYLOAD as u64 {
            return Err(WebSocketError::Frame(format!(
                "control frame {opcode:?} payload is {len} bytes, at most {MAX_CONTROL_PAYLOAD} allowed"
            )));
        }
    }
    Ok(())
}

/// Parses one frame from the front of `buf`.
///
/// Returns `Ok(None)` when `buf` does not hold the complete header, extended length, masking key
/// or payload yet; the caller keeps the bytes and retries once more data has arrived. On success
/// the frame comes back together with the number of bytes it occupied.
///
/// The header is validated before the payload is awaited, so an oversize or malformed frame is
/// rejected as soon as its first bytes are seen.
///
/// # Errors
/// - [`WebSocketError::Payload`] when the declared length exceeds `max_size`.
/// - [`WebSocketError::Frame`] for an invalid opcode, reserved bits set, or a fragmented or
///   oversize control frame.
pub fn parse_frame(buf: &[u8], max_size: Option<usize>) -> Result<Option<(Frame, usize)>> {
    if buf.len() < 2 {
        return Ok(None);
    }

    let fin = buf[0] & 0b1000_0000 != 0;
    let rsv1 = buf[0] & 0b0100_0000 != 0;
    let rsv2 = buf[0] & 0b0010_0000 != 0;
    let rsv3 = buf[0] & 0b0001_0000 != 0;
    let opcode = OpCode::try_from(buf[0] & 0b0000_1111)?;
    let masked = buf[1] & 0b1000_0000 != 0;
    let length_code = buf[1] & 0x7F;

    let (payload_len, mut offset) = match length_code {
        126 => {
            let Some(bytes) = buf.get(2..4) else {
                return Ok(None);
            };
            (u16::from_be_bytes([bytes[0], bytes[1]]) as u64, 4)
        }
        127 => {
            let Some(bytes) = buf.get(2..10) else {
                return Ok(None);
            };
            let mut be = [0u8; 8];
            be.copy_from_slice(bytes);
            (u64::from_be_bytes(be), 10)
        }
        len => (len as u64, 2),
    };

    validate_header(fin, opcode, payload_len, rsv1 || rsv2 || rsv3)?;

    let payload_len = match max_size {
        Some(max) if payload_len > max as u64 => {
            return Err(WebSocketError::Payload {
                size: payload_len,
                max,
            });
        }
        _ => usize::try_from(payload_len).map_err(|_| WebSocketError::Payload {
            size: payload_len,
            max: usize::MAX,
        })?,
    };

    let mask = if masked {
        let Some(bytes) = buf.get(offset..offset + 4) else {
            return Ok(None);
        };
        offset += 4;
        Some([bytes[0], bytes[1], bytes[2], bytes[3]])
    } else {
        None
    };

    let end = match offset.checked_add(payload_len) {
        Some(end) if end <= buf.len() => end,
        _ => return Ok(None),
    };

    let mut payload = BytesMut::from(&buf[offset..end]);
    if let Some(mask) = mask {
        apply_mask(&mut payload, mask);
    }

    let frame = Frame {
        fin,
        opcode,
        payload: payload.freeze(),
        rsv1,
        rsv2,
        rsv3,
    };
    Ok(Some((frame, end)))
}

/// Builds, validates and serializes a frame in one step.
pub fn create_frame(
    opcode: OpCode,
    payload: impl Into<Bytes>,
    fin: bool,
    mask: bool,
) -> Result<Bytes> {
    Ok(Frame::new(fin, opcode, payload)?.serialize(mask))
}

#[inline]
pub(crate) fn is_utf8(bytes: &[u8]) -> bool {
    std::str::from_utf8(bytes).is_ok()
}
