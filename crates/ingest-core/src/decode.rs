//! Best-effort diagnostic decoding of opaque payloads.
//!
//! The event schema belongs to the producer, so nothing here knows field
//! names. [`ProtobufWireDecoder`] walks the protobuf wire format and reports
//! field numbers, wire types and values, which is enough to eyeball a
//! payload in the logs. Decoders must be pure: no I/O, no shared state.

use bytes::Buf;
use prost::encoding::{decode_key, decode_varint, WireType};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::errors::DecodeError;

const MAX_DEPTH: usize = 8;
const MAX_FIELDS: usize = 512;
const PREVIEW_BYTES: usize = 16;

/// A loggable view of a payload.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct DecodedPayload {
    pub format: &'static str,
    pub summary: Value,
}

impl std::fmt::Display for DecodedPayload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.format, self.summary)
    }
}

/// Pure function from bytes to a loggable value.
pub trait PayloadDecoder: Send + Sync {
    fn decode(&self, payload: &[u8]) -> Result<DecodedPayload, DecodeError>;

    fn name(&self) -> &'static str;
}

/// Which decoder to run after each durability write.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecoderKind {
    #[default]
    Protobuf,
    Hex,
    None,
}

impl DecoderKind {
    /// Instantiate the decoder, or `None` when decoding is switched off.
    pub fn build(self) -> Option<std::sync::Arc<dyn PayloadDecoder>> {
        match self {
            Self::Protobuf => Some(std::sync::Arc::new(ProtobufWireDecoder::default())),
            Self::Hex => Some(std::sync::Arc::new(HexPreviewDecoder::default())),
            Self::None => None,
        }
    }
}

impl std::str::FromStr for DecoderKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "protobuf" => Ok(Self::Protobuf),
            "hex" => Ok(Self::Hex),
            "none" => Ok(Self::None),
            other => Err(format!("unknown decoder: {other}")),
        }
    }
}

/// Schema-free protobuf wire-format walker.
#[derive(Clone, Debug, Default)]
pub struct ProtobufWireDecoder;

impl PayloadDecoder for ProtobufWireDecoder {
    fn decode(&self, payload: &[u8]) -> Result<DecodedPayload, DecodeError> {
        let fields = walk_message(payload, 0, 0)?;
        Ok(DecodedPayload {
            format: "protobuf",
            summary: Value::Array(fields),
        })
    }

    fn name(&self) -> &'static str {
        "protobuf"
    }
}

/// Length plus a hex preview of the leading bytes.
#[derive(Clone, Debug)]
pub struct HexPreviewDecoder {
    pub preview_len: usize,
}

impl Default for HexPreviewDecoder {
    fn default() -> Self {
        Self {
            preview_len: PREVIEW_BYTES * 2,
        }
    }
}

impl PayloadDecoder for HexPreviewDecoder {
    fn decode(&self, payload: &[u8]) -> Result<DecodedPayload, DecodeError> {
        let shown = payload.len().min(self.preview_len);
        Ok(DecodedPayload {
            format: "hex",
            summary: json!({
                "len": payload.len(),
                "head": hex::encode(&payload[..shown]),
            }),
        })
    }

    fn name(&self) -> &'static str {
        "hex"
    }
}

fn walk_message(buf: &[u8], base: usize, depth: usize) -> Result<Vec<Value>, DecodeError> {
    if depth > MAX_DEPTH {
        return Err(DecodeError::Malformed {
            offset: base,
            detail: "nesting too deep".into(),
        });
    }

    let mut cur = buf;
    let offset = |cur: &[u8]| base + buf.len() - cur.len();
    let mut fields = Vec::new();
    while cur.has_remaining() {
        if fields.len() >= MAX_FIELDS {
            fields.push(json!({ "truncated": cur.len() }));
            break;
        }

        let at = offset(cur);
        check_varint(cur, base + buf.len())?;
        let (field, wire) = decode_key(&mut cur).map_err(|e| malformed(at, e))?;

        let (wire, value) = match wire {
            WireType::Varint => {
                let at = offset(cur);
                check_varint(cur, base + buf.len())?;
                let v = decode_varint(&mut cur).map_err(|e| malformed(at, e))?;
                ("varint", json!(v))
            }
            WireType::SixtyFourBit => {
                ensure(cur, 8, base + buf.len())?;
                ("fixed64", json!(cur.get_u64_le()))
            }
            WireType::LengthDelimited => {
                let at = offset(cur);
                check_varint(cur, base + buf.len())?;
                let len = decode_varint(&mut cur).map_err(|e| malformed(at, e))?;
                let len = usize::try_from(len).unwrap_or(usize::MAX);
                ensure(cur, len, base + buf.len())?;
                let start = offset(cur);
                let (raw, rest) = cur.split_at(len);
                cur = rest;
                ("len", describe_len_delimited(raw, start, depth))
            }
            WireType::ThirtyTwoBit => {
                ensure(cur, 4, base + buf.len())?;
                ("fixed32", json!(cur.get_u32_le()))
            }
            WireType::StartGroup | WireType::EndGroup => {
                let code = if wire == WireType::StartGroup { 3 } else { 4 };
                return Err(DecodeError::Malformed {
                    offset: offset(cur),
                    detail: format!("unsupported wire type {code}"),
                });
            }
        };

        fields.push(json!({ "field": field, "wire": wire, "value": value }));
    }
    Ok(fields)
}

/// A length-delimited field is a string, a nested message or raw bytes;
/// the wire format does not say which, so guess in that order.
fn describe_len_delimited(raw: &[u8], base: usize, depth: usize) -> Value {
    if let Ok(s) = std::str::from_utf8(raw) {
        if !s.is_empty() && s.chars().all(|c| !c.is_control() || c.is_whitespace()) {
            return Value::String(s.to_string());
        }
    }
    if !raw.is_empty() {
        if let Ok(nested) = walk_message(raw, base, depth + 1) {
            return Value::Array(nested);
        }
    }
    let shown = raw.len().min(PREVIEW_BYTES);
    json!({ "bytes": raw.len(), "head": hex::encode(&raw[..shown]) })
}

/// prost reports a varint that runs off the end of the buffer the same way
/// as an overlong one; split the two so short reads surface as truncation.
fn check_varint(cur: &[u8], end: usize) -> Result<(), DecodeError> {
    if cur.len() < 10 && cur.iter().all(|b| b & 0x80 != 0) {
        return Err(DecodeError::Truncated { offset: end });
    }
    Ok(())
}

fn ensure(cur: &[u8], len: usize, end: usize) -> Result<(), DecodeError> {
    if cur.remaining() < len {
        return Err(DecodeError::Truncated { offset: end });
    }
    Ok(())
}

fn malformed(offset: usize, err: prost::DecodeError) -> DecodeError {
    DecodeError::Malformed {
        offset,
        detail: err.to_string(),
    }
}
