//! Payload codec: a batch of packets framed into one transport frame.
//!
//! Long-polling does not preserve message boundaries across requests, so
//! every request/response body carries a length-prefixed sequence of packets.
//!
//! Text framing: `<length>:<encoded packet>` repeated, where the length counts
//! UTF-16 code units of the encoded packet.
//!
//! Binary framing, one record per packet:
//! `<flag: 0 text | 1 binary><one byte per decimal digit of length><0xFF><bytes>`

use bytes::{BufMut, Bytes, BytesMut};

use crate::packet::{
    decode_packet, encode_packet, CodecError, Frame, Packet, PacketKind, PARSER_ERROR,
};

/// Upper bound on the number of length digits in one binary record.
pub const MAX_LENGTH_DIGITS: usize = 310;

const TEXT_RECORD: u8 = 0;
const BINARY_RECORD: u8 = 1;
const LENGTH_TERMINATOR: u8 = 0xFF;

/// Encode a batch of packets into one frame.
///
/// Binary framing is used when the transport supports binary and at least
/// one packet carries bytes; otherwise text framing with base64 fallback.
/// An empty batch encodes to an empty frame.
pub fn encode_payload(packets: &[Packet], supports_binary: bool) -> Result<Frame, CodecError> {
    if packets.is_empty() {
        return Ok(Frame::Text(String::new()));
    }

    if supports_binary && packets.iter().any(Packet::is_binary) {
        return encode_binary_payload(packets).map(Frame::Binary);
    }

    let mut out = String::new();
    for packet in packets {
        match encode_packet(packet, false)? {
            Frame::Text(encoded) => {
                out.push_str(&encoded.encode_utf16().count().to_string());
                out.push(':');
                out.push_str(&encoded);
            }
            // text-only encoding never yields bytes
            Frame::Binary(_) => return Err(CodecError::Unencodable),
        }
    }
    Ok(Frame::Text(out))
}

fn encode_binary_payload(packets: &[Packet]) -> Result<Bytes, CodecError> {
    let mut out = BytesMut::new();
    for packet in packets {
        let (flag, body) = match encode_packet(packet, true)? {
            Frame::Text(s) => (TEXT_RECORD, Bytes::from(s)),
            Frame::Binary(b) => (BINARY_RECORD, b),
        };
        out.put_u8(flag);
        for digit in body.len().to_string().bytes() {
            out.put_u8(digit - b'0');
        }
        out.put_u8(LENGTH_TERMINATOR);
        out.extend_from_slice(&body);
    }
    Ok(out.freeze())
}

/// Decode a frame into its packets.
///
/// Any malformed record fails the whole frame.
pub fn decode_payload_packets(frame: &Frame) -> Result<Vec<Packet>, CodecError> {
    if frame.is_empty() {
        return Err(CodecError::Empty);
    }
    match frame {
        Frame::Text(text) => decode_text_payload(text),
        Frame::Binary(bytes) => decode_binary_payload(bytes),
    }
}

/// Decode a frame, invoking `callback(packet, index, total)` per packet.
///
/// Returning `false` from the callback stops delivery of the rest of the
/// batch. A malformed frame (including an empty one) invokes the callback
/// exactly once with an ERROR packet, index 0 and total 1.
pub fn decode_payload<F>(frame: &Frame, mut callback: F)
where
    F: FnMut(Packet, usize, usize) -> bool,
{
    let packets = match decode_payload_packets(frame) {
        Ok(packets) => packets,
        Err(e) => {
            tracing::debug!("payload decode failed: {e}");
            callback(Packet::error(PARSER_ERROR), 0, 1);
            return;
        }
    };

    let total = packets.len();
    for (index, packet) in packets.into_iter().enumerate() {
        if !callback(packet, index, total) {
            break;
        }
    }
}

fn decode_text_payload(text: &str) -> Result<Vec<Packet>, CodecError> {
    let mut packets = Vec::new();
    let mut rest = text;

    while !rest.is_empty() {
        let colon = rest
            .find(':')
            .ok_or_else(|| CodecError::InvalidLength(rest.chars().take(16).collect()))?;
        let length = parse_decimal(&rest[..colon])?;
        let body = &rest[colon + 1..];
        let (record, tail) = split_utf16(body, length).ok_or(CodecError::Truncated {
            declared: length,
            remaining: body.encode_utf16().count(),
        })?;

        packets.push(decode_record(Frame::Text(record.to_string()))?);
        rest = tail;
    }

    Ok(packets)
}

fn decode_binary_payload(bytes: &Bytes) -> Result<Vec<Packet>, CodecError> {
    let mut packets = Vec::new();
    let mut pos = 0;

    while pos < bytes.len() {
        let flag = bytes[pos];
        if flag != TEXT_RECORD && flag != BINARY_RECORD {
            return Err(CodecError::InvalidLength(format!("record flag {flag}")));
        }
        pos += 1;

        let mut length: usize = 0;
        let mut digits = 0;
        loop {
            let byte = *bytes
                .get(pos)
                .ok_or_else(|| CodecError::InvalidLength("missing terminator".into()))?;
            pos += 1;
            if byte == LENGTH_TERMINATOR {
                break;
            }
            if byte > 9 || digits == MAX_LENGTH_DIGITS {
                return Err(CodecError::InvalidLength(format!("length byte {byte}")));
            }
            digits += 1;
            length = length
                .checked_mul(10)
                .and_then(|l| l.checked_add(usize::from(byte)))
                .ok_or_else(|| CodecError::InvalidLength("length overflow".into()))?;
        }
        if digits == 0 {
            return Err(CodecError::InvalidLength("no length digits".into()));
        }

        let remaining = bytes.len() - pos;
        if length > remaining {
            return Err(CodecError::Truncated { declared: length, remaining });
        }
        let body = bytes.slice(pos..pos + length);
        pos += length;

        let frame = if flag == TEXT_RECORD {
            let text = std::str::from_utf8(&body).map_err(|_| CodecError::InvalidUtf8)?;
            Frame::Text(text.to_string())
        } else {
            Frame::Binary(body)
        };
        packets.push(decode_record(frame)?);
    }

    Ok(packets)
}

/// Zero-length records are an empty MESSAGE; anything else must be a valid packet.
fn decode_record(frame: Frame) -> Result<Packet, CodecError> {
    if frame.is_empty() {
        return Ok(match frame {
            Frame::Text(_) => Packet::bare(PacketKind::Message),
            Frame::Binary(_) => Packet::message(Bytes::new()),
        });
    }

    let packet = decode_packet(&frame);
    if packet.is_error() {
        return Err(CodecError::UnknownKind(match frame {
            Frame::Text(s) => s.chars().take(16).collect(),
            Frame::Binary(b) => format!("{:?}", b.first()),
        }));
    }
    Ok(packet)
}

fn parse_decimal(field: &str) -> Result<usize, CodecError> {
    if field.is_empty() || !field.bytes().all(|b| b.is_ascii_digit()) {
        return Err(CodecError::InvalidLength(field.to_string()));
    }
    field
        .parse()
        .map_err(|_| CodecError::InvalidLength(field.to_string()))
}

/// Split `s` after `units` UTF-16 code units. `None` if `s` is too short or
/// the split would land inside a surrogate pair.
fn split_utf16(s: &str, units: usize) -> Option<(&str, &str)> {
    let mut counted = 0;
    for (idx, ch) in s.char_indices() {
        if counted == units {
            return Some(s.split_at(idx));
        }
        counted += ch.len_utf16();
        if counted > units {
            return None;
        }
    }
    (counted == units).then_some((s, ""))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::PacketData;
    use proptest::prelude::*;

    fn collect(frame: &Frame) -> Vec<(Packet, usize, usize)> {
        let mut seen = Vec::new();
        decode_payload(frame, |p, i, n| {
            seen.push((p, i, n));
            true
        });
        seen
    }

    #[test]
    fn test_text_framing() {
        let packets = vec![Packet::message("hello"), Packet::ping()];
        let frame = encode_payload(&packets, false).unwrap();
        assert_eq!(frame, Frame::Text("6:4hello1:2".into()));
        assert_eq!(decode_payload_packets(&frame).unwrap(), packets);
    }

    #[test]
    fn test_text_length_counts_utf16_units() {
        let packets = vec![Packet::message("🚀é")];
        let frame = encode_payload(&packets, false).unwrap();
        // '4' + surrogate pair + 'é'
        assert_eq!(frame, Frame::Text("4:4🚀é".into()));
        assert_eq!(decode_payload_packets(&frame).unwrap(), packets);
    }

    #[test]
    fn test_binary_framing() {
        let packets = vec![Packet::message("abc"), Packet::message(vec![9u8, 8])];
        let frame = encode_payload(&packets, true).unwrap();
        let expected: &[u8] = &[0, 4, 0xFF, b'4', b'a', b'b', b'c', 1, 3, 0xFF, 4, 9, 8];
        assert_eq!(frame, Frame::Binary(Bytes::from_static(expected)));
        assert_eq!(decode_payload_packets(&frame).unwrap(), packets);
    }

    #[test]
    fn test_binary_length_multiple_digits() {
        let body = vec![7u8; 1234];
        let frame = encode_payload(&[Packet::message(body.clone())], true).unwrap();
        let Frame::Binary(bytes) = &frame else {
            panic!("expected binary framing");
        };
        assert_eq!(&bytes[..6], &[1, 1, 2, 3, 5, 0xFF]);
        assert_eq!(decode_payload_packets(&frame).unwrap(), vec![Packet::message(body)]);
    }

    #[test]
    fn test_text_only_batch_stays_text_on_binary_transport() {
        let frame = encode_payload(&[Packet::message("x")], true).unwrap();
        assert_eq!(frame, Frame::Text("2:4x".into()));
    }

    #[test]
    fn test_base64_inside_text_payload() {
        let packets = vec![Packet::message(vec![1u8, 2, 3])];
        let frame = encode_payload(&packets, false).unwrap();
        assert_eq!(frame, Frame::Text("6:b4AQID".into()));
        assert_eq!(decode_payload_packets(&frame).unwrap(), packets);
    }

    #[test]
    fn test_empty_batch() {
        let frame = encode_payload(&[], true).unwrap();
        assert!(frame.clone().into_bytes().is_empty());
    }

    #[test]
    fn test_empty_input_yields_single_error() {
        for frame in [Frame::Text(String::new()), Frame::Binary(Bytes::new())] {
            let seen = collect(&frame);
            assert_eq!(seen.len(), 1);
            assert!(seen[0].0.is_error());
            assert_eq!((seen[0].1, seen[0].2), (0, 1));
        }
    }

    #[test]
    fn test_truncated_record_yields_single_error() {
        let text = Frame::Text("6:4hello1:2 10:4abc".into());
        let binary = Frame::Binary(Bytes::from_static(&[0, 9, 0xFF, b'4', b'a']));
        for frame in [text, binary] {
            let seen = collect(&frame);
            assert_eq!(seen.len(), 1);
            assert!(seen[0].0.is_error());
            assert_eq!((seen[0].1, seen[0].2), (0, 1));
        }
    }

    #[test]
    fn test_malformed_lengths() {
        for bad in ["x:4a", "-1:4", ":4a", "2", "3:4ab"] {
            assert!(decode_payload_packets(&Frame::Text(bad.into())).is_err(), "{bad:?}");
        }
        let no_terminator = Frame::Binary(Bytes::from_static(&[0, 1, 2]));
        assert!(decode_payload_packets(&no_terminator).is_err());
        let bad_flag = Frame::Binary(Bytes::from_static(&[2, 1, 0xFF, b'4']));
        assert!(decode_payload_packets(&bad_flag).is_err());
        let too_many_digits: Vec<u8> = std::iter::once(0)
            .chain(std::iter::repeat(1).take(MAX_LENGTH_DIGITS + 1))
            .chain(std::iter::once(0xFF))
            .collect();
        assert!(decode_payload_packets(&Frame::Binary(Bytes::from(too_many_digits))).is_err());
    }

    #[test]
    fn test_zero_length_record_is_empty_message() {
        let packets = decode_payload_packets(&Frame::Text("0:1:2".into())).unwrap();
        assert_eq!(
            packets,
            vec![
                Packet::bare(PacketKind::Message),
                Packet::ping(),
            ]
        );
        let binary = decode_payload_packets(&Frame::Binary(Bytes::from_static(&[1, 0, 0xFF])));
        assert_eq!(
            binary.unwrap(),
            vec![Packet::new(PacketKind::Message, Some(PacketData::Binary(Bytes::new())))]
        );
    }

    #[test]
    fn test_callback_can_stop_batch() {
        let packets = vec![Packet::message("a"), Packet::close(), Packet::message("b")];
        let frame = encode_payload(&packets, false).unwrap();
        let mut seen = Vec::new();
        decode_payload(&frame, |p, i, n| {
            assert_eq!(n, 3);
            seen.push((p.kind, i));
            p.kind != PacketKind::Close
        });
        assert_eq!(seen, vec![(PacketKind::Message, 0), (PacketKind::Close, 1)]);
    }

    fn packet_strategy() -> impl Strategy<Value = Packet> {
        let kind = (0u8..=6).prop_map(|o| PacketKind::from_ordinal(o).unwrap());
        let data = prop_oneof![
            Just(None),
            ".*".prop_map(|s: String| Some(PacketData::Text(s))),
            prop::collection::vec(any::<u8>(), 0..64)
                .prop_map(|b| Some(PacketData::Binary(Bytes::from(b)))),
        ];
        (kind, data).prop_map(|(kind, data)| Packet::new(kind, data))
    }

    proptest! {
        #[test]
        fn prop_payload_round_trip(
            packets in prop::collection::vec(packet_strategy(), 1..50),
            supports_binary in any::<bool>(),
        ) {
            let frame = encode_payload(&packets, supports_binary)?;
            prop_assert_eq!(decode_payload_packets(&frame)?, packets);
        }
    }
}
