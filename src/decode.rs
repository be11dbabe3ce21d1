//! Payload decoding.
//!
//! Messages carry their data in a transport encoding named by the encoding
//! tag. Only `base64` is decoded; an absent tag means the data is already in
//! its native form, and unknown tags pass through untouched.

use std::fmt;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde_json::Value;
use thiserror::Error;

/// Encoding tag for base64-transported payloads.
pub const BASE64_ENCODING: &str = "base64";

/// Error decoding a payload under a known encoding.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// Malformed base64 input.
    #[error("base64: {0}")]
    Base64(String),
}

/// A payload after decoding.
#[derive(Debug, Clone, PartialEq)]
pub enum DecodedPayload {
    /// No data.
    Null,
    /// Textual data.
    Text(String),
    /// Decoded bytes that are not valid UTF-8.
    Binary(Vec<u8>),
    /// Structured data passed through as JSON.
    Json(Value),
}

impl DecodedPayload {
    /// Raw bytes of textual or binary payloads.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Text(text) => Some(text.as_bytes()),
            Self::Binary(bytes) => Some(bytes),
            Self::Null | Self::Json(_) => None,
        }
    }

    fn from_bytes(bytes: Vec<u8>) -> Self {
        match String::from_utf8(bytes) {
            Ok(text) => Self::Text(text),
            Err(e) => Self::Binary(e.into_bytes()),
        }
    }

    fn from_value(value: &Value) -> Self {
        match value {
            Value::Null => Self::Null,
            Value::String(text) => Self::Text(text.clone()),
            other => Self::Json(other.clone()),
        }
    }
}

impl fmt::Display for DecodedPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str("null"),
            Self::Text(text) => f.write_str(text),
            Self::Json(value) => write!(f, "{value}"),
            Self::Binary(bytes) => {
                write!(f, "<{} bytes: ", bytes.len())?;
                for byte in bytes {
                    write!(f, "{byte:02x}")?;
                }
                f.write_str(">")
            }
        }
    }
}

/// Decodes `data` according to `encoding`.
///
/// Base64 applies only to string data; everything else passes through.
pub fn decode(data: Option<&Value>, encoding: Option<&str>) -> Result<DecodedPayload, DecodeError> {
    let Some(data) = data else {
        return Ok(DecodedPayload::Null);
    };

    match (encoding, data) {
        (Some(BASE64_ENCODING), Value::String(text)) => STANDARD
            .decode(text.trim())
            .map(DecodedPayload::from_bytes)
            .map_err(|e| DecodeError::Base64(e.to_string())),
        _ => Ok(DecodedPayload::from_value(data)),
    }
}

/// Decodes and formats a payload, turning failures into an inline diagnostic.
pub fn decode_or_diagnostic(data: Option<&Value>, encoding: Option<&str>) -> String {
    match decode(data, encoding) {
        Ok(payload) => payload.to_string(),
        Err(e) => diagnostic(&e),
    }
}

/// Inline text shown in place of a payload that failed to decode.
pub fn diagnostic(err: &DecodeError) -> String {
    format!("<decode error: {err}>")
}
