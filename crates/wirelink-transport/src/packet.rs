//! Packet codec: one logical message unit to and from its wire form.
//!
//! Three encodings exist for a packet, chosen by what the transport can carry:
//!
//! - text: one ASCII digit (the kind ordinal) followed by the payload text
//! - base64 fallback: `b` + digit + base64 of the payload bytes, for binary
//!   payloads on transports that only carry text
//! - binary: a single leading byte holding the kind ordinal, then the raw bytes

use std::fmt;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Diagnostic carried by ERROR packets produced on decode failure.
pub const PARSER_ERROR: &str = "parser error";

/// Prefix marking a base64-encoded binary packet inside a text frame.
const BASE64_PREFIX: char = 'b';

/// Codec error
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("empty packet")]
    Empty,

    #[error("unknown packet kind: {0:?}")]
    UnknownKind(String),

    #[error("invalid base64 payload: {0}")]
    InvalidBase64(String),

    #[error("invalid utf-8 in text record")]
    InvalidUtf8,

    #[error("invalid length field: {0}")]
    InvalidLength(String),

    #[error("declared length {declared} exceeds remaining {remaining} bytes")]
    Truncated { declared: usize, remaining: usize },

    #[error("error packets are never transmitted")]
    Unencodable,
}

/// Packet kinds. The discriminant is the wire ordinal; `Error` has none.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PacketKind {
    Open,
    Close,
    Ping,
    Pong,
    Message,
    Upgrade,
    Noop,
    /// Produced locally on decode failure, never sent.
    Error,
}

impl PacketKind {
    /// Wire ordinal (0-6), `None` for `Error`.
    pub fn ordinal(self) -> Option<u8> {
        match self {
            PacketKind::Open => Some(0),
            PacketKind::Close => Some(1),
            PacketKind::Ping => Some(2),
            PacketKind::Pong => Some(3),
            PacketKind::Message => Some(4),
            PacketKind::Upgrade => Some(5),
            PacketKind::Noop => Some(6),
            PacketKind::Error => None,
        }
    }

    /// Kind for a wire ordinal.
    pub fn from_ordinal(ordinal: u8) -> Option<Self> {
        match ordinal {
            0 => Some(PacketKind::Open),
            1 => Some(PacketKind::Close),
            2 => Some(PacketKind::Ping),
            3 => Some(PacketKind::Pong),
            4 => Some(PacketKind::Message),
            5 => Some(PacketKind::Upgrade),
            6 => Some(PacketKind::Noop),
            _ => None,
        }
    }

    fn from_digit(c: char) -> Option<Self> {
        c.to_digit(10)
            .and_then(|d| u8::try_from(d).ok())
            .and_then(Self::from_ordinal)
    }

}

impl fmt::Display for PacketKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PacketKind::Open => "open",
            PacketKind::Close => "close",
            PacketKind::Ping => "ping",
            PacketKind::Pong => "pong",
            PacketKind::Message => "message",
            PacketKind::Upgrade => "upgrade",
            PacketKind::Noop => "noop",
            PacketKind::Error => "error",
        };
        f.write_str(name)
    }
}

/// Packet payload: exactly one of text or bytes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PacketData {
    Text(String),
    Binary(Bytes),
}

impl PacketData {
    /// Payload length in bytes
    pub fn len(&self) -> usize {
        match self {
            PacketData::Text(s) => s.len(),
            PacketData::Binary(b) => b.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_binary(&self) -> bool {
        matches!(self, PacketData::Binary(_))
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            PacketData::Text(s) => Some(s),
            PacketData::Binary(_) => None,
        }
    }
}

impl From<String> for PacketData {
    fn from(s: String) -> Self {
        PacketData::Text(s)
    }
}

impl From<&str> for PacketData {
    fn from(s: &str) -> Self {
        PacketData::Text(s.to_string())
    }
}

impl From<Bytes> for PacketData {
    fn from(b: Bytes) -> Self {
        PacketData::Binary(b)
    }
}

impl From<Vec<u8>> for PacketData {
    fn from(b: Vec<u8>) -> Self {
        PacketData::Binary(Bytes::from(b))
    }
}

impl From<&[u8]> for PacketData {
    fn from(b: &[u8]) -> Self {
        PacketData::Binary(Bytes::copy_from_slice(b))
    }
}

/// One logical message unit.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Packet {
    pub kind: PacketKind,
    /// `None` when the packet has no payload. Empty text is not a payload.
    pub data: Option<PacketData>,
}

impl Packet {
    /// Build a packet. Empty text becomes `None`, the only form it can take
    /// on the wire.
    pub fn new(kind: PacketKind, data: Option<PacketData>) -> Self {
        let data = data.filter(|d| !matches!(d, PacketData::Text(text) if text.is_empty()));
        Self { kind, data }
    }

    /// Packet without payload
    pub fn bare(kind: PacketKind) -> Self {
        Self { kind, data: None }
    }

    /// MESSAGE packet carrying application data
    pub fn message(data: impl Into<PacketData>) -> Self {
        Self::new(PacketKind::Message, Some(data.into()))
    }

    pub fn ping() -> Self {
        Self::bare(PacketKind::Ping)
    }

    pub fn pong() -> Self {
        Self::bare(PacketKind::Pong)
    }

    pub fn close() -> Self {
        Self::bare(PacketKind::Close)
    }

    pub fn upgrade() -> Self {
        Self::bare(PacketKind::Upgrade)
    }

    /// Locally produced decode failure
    pub fn error(diagnostic: impl Into<String>) -> Self {
        Self::new(PacketKind::Error, Some(PacketData::Text(diagnostic.into())))
    }

    pub fn is_error(&self) -> bool {
        self.kind == PacketKind::Error
    }

    /// Text payload, if any
    pub fn text(&self) -> Option<&str> {
        self.data.as_ref().and_then(PacketData::as_text)
    }

    pub fn is_binary(&self) -> bool {
        self.data.as_ref().is_some_and(PacketData::is_binary)
    }
}

/// Encoded wire form of a packet or payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Bytes),
}

impl Frame {
    /// Length in bytes
    pub fn len(&self) -> usize {
        match self {
            Frame::Text(s) => s.len(),
            Frame::Binary(b) => b.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Raw bytes of the frame
    pub fn into_bytes(self) -> Bytes {
        match self {
            Frame::Text(s) => Bytes::from(s),
            Frame::Binary(b) => b,
        }
    }
}

/// Encode a packet for a transport.
///
/// Binary payloads use the raw binary form when `supports_binary` is set,
/// the base64 fallback otherwise. ERROR packets cannot be encoded.
pub fn encode_packet(packet: &Packet, supports_binary: bool) -> Result<Frame, CodecError> {
    let ordinal = packet.kind.ordinal().ok_or(CodecError::Unencodable)?;
    let digit = char::from(b'0' + ordinal);

    match &packet.data {
        None => Ok(Frame::Text(digit.to_string())),
        Some(PacketData::Text(text)) => {
            let mut out = String::with_capacity(1 + text.len());
            out.push(digit);
            out.push_str(text);
            Ok(Frame::Text(out))
        }
        Some(PacketData::Binary(bytes)) if supports_binary => {
            let mut out = BytesMut::with_capacity(1 + bytes.len());
            out.put_u8(ordinal);
            out.extend_from_slice(bytes);
            Ok(Frame::Binary(out.freeze()))
        }
        Some(PacketData::Binary(bytes)) => {
            let mut out = String::with_capacity(2 + bytes.len() * 4 / 3 + 4);
            out.push(BASE64_PREFIX);
            out.push(digit);
            STANDARD.encode_string(bytes, &mut out);
            Ok(Frame::Text(out))
        }
    }
}

/// Decode a packet, reporting why decoding failed.
pub fn try_decode_packet(frame: &Frame) -> Result<Packet, CodecError> {
    match frame {
        Frame::Text(text) => decode_text(text),
        Frame::Binary(bytes) => {
            let (&first, _) = bytes.split_first().ok_or(CodecError::Empty)?;
            let kind = PacketKind::from_ordinal(first)
                .ok_or_else(|| CodecError::UnknownKind(first.to_string()))?;
            Ok(Packet::new(kind, Some(PacketData::Binary(bytes.slice(1..)))))
        }
    }
}

/// Decode a packet. Failures yield an ERROR packet.
pub fn decode_packet(frame: &Frame) -> Packet {
    try_decode_packet(frame).unwrap_or_else(|e| {
        tracing::debug!("packet decode failed: {e}");
        Packet::error(PARSER_ERROR)
    })
}

fn decode_text(text: &str) -> Result<Packet, CodecError> {
    let mut chars = text.chars();
    let first = chars.next().ok_or(CodecError::Empty)?;

    if first == BASE64_PREFIX {
        let digit = chars.next().ok_or(CodecError::Empty)?;
        let kind = PacketKind::from_digit(digit)
            .ok_or_else(|| CodecError::UnknownKind(digit.to_string()))?;
        let bytes = STANDARD
            .decode(chars.as_str())
            .map_err(|e| CodecError::InvalidBase64(e.to_string()))?;
        return Ok(Packet::new(kind, Some(PacketData::Binary(Bytes::from(bytes)))));
    }

    let kind =
        PacketKind::from_digit(first).ok_or_else(|| CodecError::UnknownKind(first.to_string()))?;
    let rest = chars.as_str();
    let data = if rest.is_empty() {
        None
    } else {
        Some(PacketData::Text(rest.to_string()))
    };
    Ok(Packet::new(kind, data))
}
