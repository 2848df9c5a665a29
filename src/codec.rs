//! Wire codec for broker messages.
//!
//! Frames a routing header plus an arbitrary key-value body into a single
//! colon-delimited string:
//!
//! ```text
//! <version>:<context>:<channel>:<plugin_id>:(null | dk:<dk>:<body> | :<body>)
//! ```
//!
//! Examples:
//!
//! ```text
//! 1:in:prices:scraper_af749dc3:null
//! 1:in:prices:scraper_af749dc3:dk:NzIzODk0NTcz:eyJpZCI6Ij...
//! 1:in:prices:scraper_af749dc3::eyJpZCI6Ij...
//! ```
//!
//! The optional data key duplicates one string value of the body into the
//! header (base64) so consumers can inspect it without decoding the full
//! payload. Channel names and plugin ids must not contain `:`; this is a
//! caller contract and is not validated here.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde_json::Value;
use thiserror::Error;

use crate::message::{Body, InternalMessage, MessageContext};

/// The single supported wire version.
pub const WIRE_VERSION: &str = "1";

/// Body key that names the data key in multi-entry maps.
const DATA_KEY_FIELD: &str = "_dk";

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("unsupported wire version {0:?}")]
    UnsupportedVersion(String),
    #[error("wire message is missing the {0} field")]
    MissingField(&'static str),
    #[error("invalid message context {0:?}")]
    InvalidContext(String),
    #[error("unrecognized body marker {0:?}")]
    BadMarker(String),
    #[error("wire message has no body")]
    EmptyBody,
    #[error("payload is not valid base64: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("payload is not valid UTF-8: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),
    #[error("payload is not a JSON object: {0}")]
    Json(#[from] serde_json::Error),
}

/// Encodes a message into its wire form.
pub fn encode(message: &InternalMessage) -> Result<String, CodecError> {
    let fields = [
        WIRE_VERSION.to_string(),
        message.context().to_string(),
        message.channel().to_string(),
        message.plugin_id().to_string(),
        encode_body(message.body())?,
    ];
    Ok(fields.join(":"))
}

fn encode_body(body: Option<&Body>) -> Result<String, CodecError> {
    let Some(map) = body else {
        return Ok("null".to_string());
    };
    let mut out = String::new();
    if let Some(data_key) = resolve_data_key(map) {
        if let Some(Value::String(value)) = map.get(&data_key) {
            out.push_str("dk:");
            out.push_str(&BASE64.encode(value.as_bytes()));
        }
    }
    out.push(':');
    let payload = serde_json::to_string(map)?;
    out.push_str(&BASE64.encode(payload.as_bytes()));
    Ok(out)
}

/// Single-entry maps promote their only key to the data key; other maps can
/// name one explicitly under `_dk`.
fn resolve_data_key(map: &Body) -> Option<String> {
    if map.len() == 1 {
        return map.keys().next().cloned();
    }
    match map.get(DATA_KEY_FIELD) {
        Some(Value::String(named)) => Some(named.clone()),
        _ => None,
    }
}

/// Decodes a wire message received from the broker.
///
/// `message_id` is the broker-assigned id, if any; it is bookkeeping state,
/// not wire content. The returned message carries a fresh internal key.
/// Any failure yields an error and no partial result; callers are expected
/// to log and drop the offending message.
pub fn decode(message_id: Option<String>, wire: &str) -> Result<InternalMessage, CodecError> {
    let parts: Vec<&str> = wire.split(':').collect();
    let version = *parts.first().ok_or(CodecError::MissingField("version"))?;
    if version != WIRE_VERSION {
        return Err(CodecError::UnsupportedVersion(version.to_string()));
    }
    let context = *parts.get(1).ok_or(CodecError::MissingField("context"))?;
    let context: MessageContext = context
        .parse()
        .map_err(|_| CodecError::InvalidContext(context.to_string()))?;
    let channel = *parts.get(2).ok_or(CodecError::MissingField("channel"))?;
    let plugin_id = *parts.get(3).ok_or(CodecError::MissingField("plugin_id"))?;
    let marker = *parts.get(4).ok_or(CodecError::MissingField("body"))?;
    let payload = match marker {
        "null" => return Err(CodecError::EmptyBody),
        "dk" => *parts.get(6).ok_or(CodecError::MissingField("payload"))?,
        "" => *parts.get(5).ok_or(CodecError::MissingField("payload"))?,
        other => return Err(CodecError::BadMarker(other.to_string())),
    };
    let json = String::from_utf8(BASE64.decode(payload)?)?;
    let body: Body = serde_json::from_str(&json)?;
    Ok(InternalMessage::received(
        context,
        channel,
        plugin_id,
        message_id,
        Some(body),
    ))
}
