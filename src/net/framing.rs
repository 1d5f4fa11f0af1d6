use arrayvec::ArrayVec;
use serde::Serialize;
use simd_json::prelude::*;
use simd_json::OwnedValue;
use thiserror::Error;

/// 2 fixed bytes + 8-byte extended length + 4-byte masking key.
const MAX_HEADER_LEN: usize = 14;

const FIN_BIT: u8 = 0x80;
const MASK_BIT: u8 = 0x80;
const LEN_16: u8 = 126;
const LEN_64: u8 = 127;
const MASK_KEY_LEN: usize = 4;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("frame payload of {len} bytes exceeds the {max} byte limit")]
    TooLarge { len: u64, max: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpCode {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
    Reserved(u8),
}

impl OpCode {
    /// Text and binary frames are handed to the application; everything else is control traffic.
    pub fn carries_message(self) -> bool {
        matches!(self, OpCode::Text | OpCode::Binary)
    }
}

impl From<u8> for OpCode {
    fn from(byte: u8) -> Self {
        match byte & 0x0F {
            0x0 => OpCode::Continuation,
            0x1 => OpCode::Text,
            0x2 => OpCode::Binary,
            0x8 => OpCode::Close,
            0x9 => OpCode::Ping,
            0xA => OpCode::Pong,
            other => OpCode::Reserved(other),
        }
    }
}

impl From<OpCode> for u8 {
    fn from(opcode: OpCode) -> Self {
        match opcode {
            OpCode::Continuation => 0x0,
            OpCode::Text => 0x1,
            OpCode::Binary => 0x2,
            OpCode::Close => 0x8,
            OpCode::Ping => 0x9,
            OpCode::Pong => 0xA,
            OpCode::Reserved(bits) => bits & 0x0F,
        }
    }
}

/// One complete WebSocket frame. `payload` is always stored unmasked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub fin: bool,
    pub opcode: OpCode,
    pub mask_key: Option<[u8; 4]>,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn text(payload: impl Into<Vec<u8>>) -> Self {
        Self {
            fin: true,
            opcode: OpCode::Text,
            mask_key: None,
            payload: payload.into(),
        }
    }

    pub fn masked(mut self, key: [u8; 4]) -> Self {
        self.mask_key = Some(key);
        self
    }

    pub fn is_masked(&self) -> bool {
        self.mask_key.is_some()
    }

    /// Serializes the frame, masking the payload on the wire when a key is set.
    pub fn encode(&self) -> Vec<u8> {
        let header = frame_header(self.fin, self.opcode, self.mask_key, self.payload.len());
        let mut out = Vec::with_capacity(header.len() + self.payload.len());
        out.extend_from_slice(&header);
        let start = out.len();
        out.extend_from_slice(&self.payload);
        if let Some(key) = self.mask_key {
            apply_mask(&mut out[start..], key);
        }
        out
    }
}

/// A decoded message body: a structured document when the bytes parse as JSON,
/// otherwise the raw text.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Payload {
    Json(OwnedValue),
    Text(String),
}

impl Payload {
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        // simd-json parses in place, so keep the original bytes for the text fallback.
        let mut scratch = bytes.clone();
        match simd_json::to_owned_value(&mut scratch) {
            Ok(value) => Payload::Json(value),
            Err(_) => Payload::Text(String::from_utf8_lossy(&bytes).into_owned()),
        }
    }

    pub fn as_json(&self) -> Option<&OwnedValue> {
        match self {
            Payload::Json(value) => Some(value),
            Payload::Text(_) => None,
        }
    }

    /// String field of a structured payload, `None` for text or a missing/non-string field.
    pub fn str_field(&self, key: &str) -> Option<&str> {
        self.as_json()?.get(key)?.as_str()
    }
}

/// Result of one decode pass over an accumulated buffer.
#[derive(Debug, PartialEq)]
pub enum Decoded<'a> {
    /// Not enough bytes yet; the buffer must be left untouched.
    Incomplete,
    /// A close frame sits at the head of the buffer. Nothing after it is decoded.
    Close,
    Message {
        payload: Payload,
        remainder: &'a [u8],
    },
    /// A complete frame that carries no message (ping, pong, continuation, reserved).
    Ignored {
        opcode: OpCode,
        remainder: &'a [u8],
    },
}

impl Decoded<'_> {
    /// Bytes of `buf` this result consumed, so callers can drain their own buffer.
    pub fn consumed(&self, buf: &[u8]) -> usize {
        match self {
            Decoded::Message { remainder, .. } | Decoded::Ignored { remainder, .. } => {
                buf.len() - remainder.len()
            }
            Decoded::Incomplete | Decoded::Close => 0,
        }
    }
}

/// Decodes the next frame from `buf` with no limit on its declared size.
pub fn decode_frame(buf: &[u8]) -> Decoded<'_> {
    match decode_frame_within(buf, usize::MAX) {
        Ok(decoded) => decoded,
        // Only reachable when the declared length cannot be addressed at all.
        Err(_) => Decoded::Incomplete,
    }
}

/// Decodes the next frame from `buf`, rejecting frames whose declared payload exceeds `max_payload`.
pub fn decode_frame_within(buf: &[u8], max_payload: usize) -> Result<Decoded<'_>, FrameError> {
    if buf.len() < 2 {
        return Ok(Decoded::Incomplete);
    }
    if OpCode::from(buf[0]) == OpCode::Close {
        return Ok(Decoded::Close);
    }

    let Some((frame, consumed)) = parse_frame(buf, max_payload)? else {
        return Ok(Decoded::Incomplete);
    };
    let remainder = &buf[consumed..];

    if frame.opcode.carries_message() {
        Ok(Decoded::Message {
            payload: Payload::from_bytes(frame.payload),
            remainder,
        })
    } else {
        Ok(Decoded::Ignored {
            opcode: frame.opcode,
            remainder,
        })
    }
}

/// Parses one raw frame from the head of `buf`.
/// Returns Ok(Some((frame, bytes_consumed))) if a full frame is available.
/// Returns Ok(None) if more data is needed, including a truncated extended length.
pub fn parse_frame(buf: &[u8], max_payload: usize) -> Result<Option<(Frame, usize)>, FrameError> {
    if buf.len() < 2 {
        return Ok(None);
    }

    let first_byte = buf[0];
    let second_byte = buf[1];

    let fin = (first_byte & FIN_BIT) != 0;
    let opcode = OpCode::from(first_byte);
    let masked = (second_byte & MASK_BIT) != 0;

    let mut payload_len = u64::from(second_byte & 0x7F);
    let mut header_len = 2;

    if payload_len == u64::from(LEN_16) {
        if buf.len() < 4 {
            return Ok(None);
        }
        payload_len = u64::from(u16::from_be_bytes([buf[2], buf[3]]));
        header_len += 2;
    } else if payload_len == u64::from(LEN_64) {
        if buf.len() < 10 {
            return Ok(None);
        }
        let mut len_bytes = [0u8; 8];
        len_bytes.copy_from_slice(&buf[2..10]);
        payload_len = u64::from_be_bytes(len_bytes);
        header_len += 8;
    }

    let payload_len = match usize::try_from(payload_len) {
        Ok(len) if len <= max_payload => len,
        _ => {
            return Err(FrameError::TooLarge {
                len: payload_len,
                max: max_payload,
            })
        }
    };

    let mask_key = if masked {
        if buf.len() < header_len + MASK_KEY_LEN {
            return Ok(None);
        }
        let key = [
            buf[header_len],
            buf[header_len + 1],
            buf[header_len + 2],
            buf[header_len + 3],
        ];
        header_len += MASK_KEY_LEN;
        Some(key)
    } else {
        None
    };

    // A declared length near usize::MAX must not wrap the frame end.
    let Some(total_len) = header_len.checked_add(payload_len) else {
        return Err(FrameError::TooLarge {
            len: payload_len as u64,
            max: max_payload,
        });
    };
    if buf.len() < total_len {
        return Ok(None);
    }

    let mut payload = buf[header_len..total_len].to_vec();
    if let Some(key) = mask_key {
        apply_mask(&mut payload, key);
    }

    Ok(Some((
        Frame {
            fin,
            opcode,
            mask_key,
            payload,
        },
        total_len,
    )))
}

/// XORs `payload` in place with the rotating 4-byte key. Applying it twice restores the input.
pub fn apply_mask(payload: &mut [u8], key: [u8; 4]) {
    for (i, byte) in payload.iter_mut().enumerate() {
        *byte ^= key[i % 4];
    }
}

/// Encodes a final, unmasked text frame (server -> client).
pub fn encode_text_frame(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 10);
    encode_text_frame_into(payload, &mut out);
    out
}

/// Appends a final, unmasked text frame to `dst`, so a connection's outbound queue
/// can grow without an intermediate allocation.
pub fn encode_text_frame_into(payload: &[u8], dst: &mut Vec<u8>) {
    let header = frame_header(true, OpCode::Text, None, payload.len());
    dst.reserve(header.len() + payload.len());
    dst.extend_from_slice(&header);
    dst.extend_from_slice(payload);
}

fn frame_header(
    fin: bool,
    opcode: OpCode,
    mask_key: Option<[u8; 4]>,
    payload_len: usize,
) -> ArrayVec<u8, MAX_HEADER_LEN> {
    let mut header = ArrayVec::new();
    let fin_bit = if fin { FIN_BIT } else { 0 };
    header.push(fin_bit | u8::from(opcode));

    let mask_bit = if mask_key.is_some() { MASK_BIT } else { 0 };
    if payload_len <= 125 {
        header.push(mask_bit | payload_len as u8);
    } else if let Ok(len) = u16::try_from(payload_len) {
        header.push(mask_bit | LEN_16);
        header.extend(len.to_be_bytes());
    } else {
        header.push(mask_bit | LEN_64);
        header.extend((payload_len as u64).to_be_bytes());
    }

    if let Some(key) = mask_key {
        header.extend(key);
    }
    header
}
