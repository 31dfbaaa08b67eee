//! Engine console wire format — length-framed JSON with an optional
//! binary attachment.
//!
//! Every frame starts with a big-endian header:
//!
//! ```text
//! u32 message_type     0 = Json, 1 = JsonWithBinary
//! u32 total_length     bytes following this field
//! [u32 binary_offset]  JsonWithBinary only; counted inside total_length
//!                      and includes its own 4 bytes
//! bytes json           UTF-8, NUL-padded
//! [bytes binary]       JsonWithBinary only
//! ```
//!
//! Encoding always produces one contiguous buffer so the caller can put
//! the whole frame on the socket with a single write; the engine-side
//! parser cannot survive a header split across TCP segments.

use crate::error::ConsoleError;

/// Size of the fixed frame header (message type + total length).
pub const HEADER_LEN: usize = 8;

/// Frame discriminant on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    /// JSON payload only.
    Json,
    /// JSON payload followed by a binary blob.
    JsonWithBinary,
}

impl MessageType {
    fn from_wire(raw: u32) -> Result<Self, ConsoleError> {
        match raw {
            0 => Ok(MessageType::Json),
            1 => Ok(MessageType::JsonWithBinary),
            other => Err(ConsoleError::UnknownMessageType(other)),
        }
    }
}

/// A fully decoded console message.
#[derive(Debug, Clone, PartialEq)]
pub struct ConsoleMessage {
    /// The JSON section, already parsed.
    pub json: serde_json::Value,
    /// The binary attachment, if the frame carried one.
    pub binary: Option<Vec<u8>>,
}

/// Encode a JSON-only frame into a single contiguous buffer.
pub fn encode_json(value: &serde_json::Value) -> Vec<u8> {
    let body = serde_json::to_vec(value).unwrap_or_default();
    let mut buf = Vec::with_capacity(HEADER_LEN + body.len());
    buf.extend_from_slice(&0u32.to_be_bytes());
    buf.extend_from_slice(&(body.len() as u32).to_be_bytes());
    buf.extend_from_slice(&body);
    buf
}

/// Encode a JSON frame with a binary attachment.
///
/// `total_length` covers the binary-offset field, the JSON section and
/// the blob; `binary_offset` is `4 + json_byte_length`.
pub fn encode_json_with_binary(value: &serde_json::Value, binary: &[u8]) -> Vec<u8> {
    let body = serde_json::to_vec(value).unwrap_or_default();
    let binary_offset = 4 + body.len() as u32;
    let total = binary_offset as usize + binary.len();
    let mut buf = Vec::with_capacity(HEADER_LEN + total);
    buf.extend_from_slice(&1u32.to_be_bytes());
    buf.extend_from_slice(&(total as u32).to_be_bytes());
    buf.extend_from_slice(&binary_offset.to_be_bytes());
    buf.extend_from_slice(&body);
    buf.extend_from_slice(binary);
    buf
}

/// Incremental frame reassembler.
///
/// Bytes arrive in whatever chunks the socket hands us; `extend` queues
/// them and `next_message` pops complete frames in order. Feeding the
/// same bytes one at a time or all at once yields the same message
/// sequence.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
    pos: usize,
}

impl FrameDecoder {
    /// Create an empty decoder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue incoming bytes.
    pub fn extend(&mut self, bytes: &[u8]) {
        // Drop consumed prefix before it grows without bound.
        if self.pos > 0 && self.pos == self.buf.len() {
            self.buf.clear();
            self.pos = 0;
        } else if self.pos > 4096 {
            self.buf.drain(..self.pos);
            self.pos = 0;
        }
        self.buf.extend_from_slice(bytes);
    }

    /// Number of bytes queued but not yet consumed.
    pub fn pending_len(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// Pop the next complete message, or `None` if more bytes are needed.
    ///
    /// An unrecognized message type or a self-contradictory header is a
    /// hard error; the stream cannot be re-synchronized afterwards.
    pub fn next_message(&mut self) -> Result<Option<ConsoleMessage>, ConsoleError> {
        let avail = &self.buf[self.pos..];
        if avail.len() < HEADER_LEN {
            return Ok(None);
        }

        let message_type = MessageType::from_wire(read_u32(avail, 0))?;
        let total_length = read_u32(avail, 4) as usize;
        if avail.len() < HEADER_LEN + total_length {
            return Ok(None);
        }
        let body = &avail[HEADER_LEN..HEADER_LEN + total_length];

        let message = match message_type {
            MessageType::Json => ConsoleMessage {
                json: parse_json_section(body)?,
                binary: None,
            },
            MessageType::JsonWithBinary => {
                if body.len() < 4 {
                    return Err(ConsoleError::MalformedFrame(
                        "binary frame too short for offset field".into(),
                    ));
                }
                let binary_offset = read_u32(body, 0) as usize;
                if binary_offset < 4 || binary_offset > body.len() {
                    return Err(ConsoleError::MalformedFrame(format!(
                        "binary offset {} outside frame of {} bytes",
                        binary_offset,
                        body.len()
                    )));
                }
                let json_len = binary_offset - 4;
                let json = parse_json_section(&body[4..4 + json_len])?;
                let binary = body[binary_offset..].to_vec();
                ConsoleMessage {
                    json,
                    binary: Some(binary),
                }
            }
        };

        self.pos += HEADER_LEN + total_length;
        Ok(Some(message))
    }
}

fn read_u32(bytes: &[u8], offset: usize) -> u32 {
    u32::from_be_bytes([
        bytes[offset],
        bytes[offset + 1],
        bytes[offset + 2],
        bytes[offset + 3],
    ])
}

/// Strip NUL padding and parse the JSON section of a frame.
fn parse_json_section(bytes: &[u8]) -> Result<serde_json::Value, ConsoleError> {
    let end = bytes
        .iter()
        .rposition(|&b| b != 0)
        .map_or(0, |last| last + 1);
    Ok(serde_json::from_slice(&bytes[..end])?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn decode_all(bytes: &[u8]) -> Vec<ConsoleMessage> {
        let mut decoder = FrameDecoder::new();
        decoder.extend(bytes);
        let mut out = Vec::new();
        while let Some(msg) = decoder.next_message().unwrap() {
            out.push(msg);
        }
        out
    }

    #[test]
    fn frame_json_round_trip() {
        let value = json!({"type": "command", "command": "help", "arg": [1, "two", null]});
        let encoded = encode_json(&value);
        let messages = decode_all(&encoded);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].json, value);
        assert!(messages[0].binary.is_none());
    }

    #[test]
    fn frame_json_with_binary_round_trip() {
        let value = json!({"type": "frame_capture", "width": 4});
        let blob = vec![0u8, 1, 2, 3, 255, 254];
        let encoded = encode_json_with_binary(&value, &blob);
        let messages = decode_all(&encoded);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].json, value);
        assert_eq!(messages[0].binary.as_deref(), Some(blob.as_slice()));
    }

    #[test]
    fn frame_header_invariants() {
        let value = json!({"k": "v"});
        let json_len = serde_json::to_vec(&value).unwrap().len();

        let encoded = encode_json(&value);
        let total = u32::from_be_bytes(encoded[4..8].try_into().unwrap()) as usize;
        assert_eq!(total, encoded.len() - HEADER_LEN);

        let blob = [9u8; 17];
        let encoded = encode_json_with_binary(&value, &blob);
        let total = u32::from_be_bytes(encoded[4..8].try_into().unwrap()) as usize;
        let offset = u32::from_be_bytes(encoded[8..12].try_into().unwrap()) as usize;
        assert_eq!(total, encoded.len() - HEADER_LEN);
        assert_eq!(offset, 4 + json_len);
    }

    #[test]
    fn frame_byte_at_a_time_matches_all_at_once() {
        let mut bytes = encode_json(&json!({"a": 1}));
        bytes.extend(encode_json_with_binary(&json!({"b": [1, 2]}), b"blob"));
        bytes.extend(encode_json(&json!("end")));

        let all_at_once = decode_all(&bytes);

        let mut decoder = FrameDecoder::new();
        let mut trickled = Vec::new();
        for b in &bytes {
            decoder.extend(std::slice::from_ref(b));
            while let Some(msg) = decoder.next_message().unwrap() {
                trickled.push(msg);
            }
        }
        assert_eq!(all_at_once, trickled);
        assert_eq!(trickled.len(), 3);
    }

    #[test]
    fn frame_three_binary_frames_in_one_read() {
        let mut bytes = Vec::new();
        let frames: Vec<(serde_json::Value, Vec<u8>)> = (0..3)
            .map(|i| (json!({"seq": i}), vec![i as u8; (i + 1) as usize]))
            .collect();
        for (value, blob) in &frames {
            bytes.extend(encode_json_with_binary(value, blob));
        }

        let messages = decode_all(&bytes);
        assert_eq!(messages.len(), 3);
        for (msg, (value, blob)) in messages.iter().zip(&frames) {
            assert_eq!(&msg.json, value);
            assert_eq!(msg.binary.as_deref(), Some(blob.as_slice()));
        }
    }

    #[test]
    fn frame_nul_padding_stripped() {
        let body = b"{\"ok\":true}\0\0\0";
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&0u32.to_be_bytes());
        bytes.extend_from_slice(&(body.len() as u32).to_be_bytes());
        bytes.extend_from_slice(body);

        let messages = decode_all(&bytes);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].json, json!({"ok": true}));
    }

    #[test]
    fn frame_unknown_type_is_fatal() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&9u32.to_be_bytes());
        bytes.extend_from_slice(&2u32.to_be_bytes());
        bytes.extend_from_slice(b"{}");

        let mut decoder = FrameDecoder::new();
        decoder.extend(&bytes);
        let err = decoder.next_message().unwrap_err();
        assert!(matches!(err, ConsoleError::UnknownMessageType(9)));
    }

    #[test]
    fn frame_bad_binary_offset_rejected() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&1u32.to_be_bytes());
        bytes.extend_from_slice(&6u32.to_be_bytes());
        // Offset claims to point past the end of the frame.
        bytes.extend_from_slice(&40u32.to_be_bytes());
        bytes.extend_from_slice(b"{}");

        let mut decoder = FrameDecoder::new();
        decoder.extend(&bytes);
        let err = decoder.next_message().unwrap_err();
        assert!(matches!(err, ConsoleError::MalformedFrame(_)));
    }

    #[test]
    fn frame_incomplete_header_waits() {
        let encoded = encode_json(&json!({"x": 1}));
        let mut decoder = FrameDecoder::new();
        decoder.extend(&encoded[..5]);
        assert!(decoder.next_message().unwrap().is_none());
        decoder.extend(&encoded[5..]);
        assert!(decoder.next_message().unwrap().is_some());
    }

    #[test]
    fn frame_empty_binary_blob() {
        let encoded = encode_json_with_binary(&json!({"n": 0}), b"");
        let messages = decode_all(&encoded);
        assert_eq!(messages[0].binary.as_deref(), Some(&[] as &[u8]));
    }
}
