//! WRP message envelope
//!
//! The Web Routing Protocol message exchanged between the hub and devices.
//! Devices speak MessagePack with named fields, one message per binary
//! WebSocket frame. The HTTP side additionally accepts JSON.

use std::collections::BTreeMap;
use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Content type for MessagePack-encoded WRP.
pub const MSGPACK_CONTENT_TYPE: &str = "application/msgpack";

/// Content type for JSON-encoded WRP.
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Status carried by an authorization status message when the device is accepted.
pub const AUTH_STATUS_AUTHORIZED: i64 = 200;

/// Codec errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WrpError {
    #[error("failed to encode WRP message as {format}: {message}")]
    Encode { format: Format, message: String },

    #[error("failed to decode WRP message as {format}: {message}")]
    Decode { format: Format, message: String },

    #[error("unsupported WRP content type: {0}")]
    UnsupportedContentType(String),
}

/// Wire formats a WRP message can be serialized in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Format {
    #[default]
    Msgpack,
    Json,
}

impl Format {
    pub fn content_type(self) -> &'static str {
        match self {
            Format::Msgpack => MSGPACK_CONTENT_TYPE,
            Format::Json => JSON_CONTENT_TYPE,
        }
    }

    /// Resolve a format from an HTTP `Content-Type` value.
    ///
    /// Parameters after `;` are ignored. An empty value means MessagePack.
    pub fn from_content_type(value: &str) -> Result<Self, WrpError> {
        let media = value.split(';').next().unwrap_or("").trim();
        if media.is_empty() || media.eq_ignore_ascii_case(MSGPACK_CONTENT_TYPE) {
            return Ok(Format::Msgpack);
        }
        if media.eq_ignore_ascii_case(JSON_CONTENT_TYPE) {
            return Ok(Format::Json);
        }
        Err(WrpError::UnsupportedContentType(value.to_string()))
    }
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Format::Msgpack => write!(f, "msgpack"),
            Format::Json => write!(f, "json"),
        }
    }
}

/// WRP message types. Encoded on the wire as their integer code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(into = "i64", try_from = "i64")]
pub enum MessageType {
    Authorization,
    #[default]
    SimpleRequestResponse,
    SimpleEvent,
    Create,
    Retrieve,
    Update,
    Delete,
    ServiceRegistration,
    ServiceAlive,
    Unknown,
}

impl MessageType {
    pub fn code(self) -> i64 {
        match self {
            MessageType::Authorization => 2,
            MessageType::SimpleRequestResponse => 3,
            MessageType::SimpleEvent => 4,
            MessageType::Create => 5,
            MessageType::Retrieve => 6,
            MessageType::Update => 7,
            MessageType::Delete => 8,
            MessageType::ServiceRegistration => 9,
            MessageType::ServiceAlive => 10,
            MessageType::Unknown => 11,
        }
    }

    /// Whether messages of this type take part in request/reply exchanges.
    pub fn supports_transaction(self) -> bool {
        matches!(
            self,
            MessageType::SimpleRequestResponse
                | MessageType::Create
                | MessageType::Retrieve
                | MessageType::Update
                | MessageType::Delete
        )
    }
}

impl From<MessageType> for i64 {
    fn from(value: MessageType) -> Self {
        value.code()
    }
}

impl TryFrom<i64> for MessageType {
    type Error = String;

    fn try_from(code: i64) -> Result<Self, Self::Error> {
        Ok(match code {
            2 => MessageType::Authorization,
            3 => MessageType::SimpleRequestResponse,
            4 => MessageType::SimpleEvent,
            5 => MessageType::Create,
            6 => MessageType::Retrieve,
            7 => MessageType::Update,
            8 => MessageType::Delete,
            9 => MessageType::ServiceRegistration,
            10 => MessageType::ServiceAlive,
            11 => MessageType::Unknown,
            other => return Err(format!("invalid WRP message type {other}")),
        })
    }
}

/// A WRP message
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "msg_type")]
    pub message_type: MessageType,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub source: String,

    #[serde(rename = "dest", default, skip_serializing_if = "String::is_empty")]
    pub destination: String,

    /// Correlation key linking a request to its reply
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub transaction_uuid: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub content_type: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub accept: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<i64>,

    /// Request delivery response code
    #[serde(rename = "rdr", default, skip_serializing_if = "Option::is_none")]
    pub request_delivery_response: Option<i64>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub headers: Vec<String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub path: String,

    #[serde(default, with = "payload", skip_serializing_if = "Bytes::is_empty")]
    pub payload: Bytes,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub partner_ids: Vec<String>,
}

impl Message {
    /// Build a simple request/response message.
    pub fn request(
        source: impl Into<String>,
        destination: impl Into<String>,
        transaction_uuid: impl Into<String>,
        payload: impl Into<Bytes>,
    ) -> Self {
        Self {
            message_type: MessageType::SimpleRequestResponse,
            source: source.into(),
            destination: destination.into(),
            transaction_uuid: transaction_uuid.into(),
            payload: payload.into(),
            ..Default::default()
        }
    }

    /// Build a fire-and-forget event message.
    pub fn event(
        source: impl Into<String>,
        destination: impl Into<String>,
        payload: impl Into<Bytes>,
    ) -> Self {
        Self {
            message_type: MessageType::SimpleEvent,
            source: source.into(),
            destination: destination.into(),
            payload: payload.into(),
            ..Default::default()
        }
    }

    /// Authorization status notification sent to a freshly connected device.
    pub fn authorization_status(status: i64) -> Self {
        Self {
            message_type: MessageType::Authorization,
            status: Some(status),
            ..Default::default()
        }
    }

    /// A message is a transaction part when its type supports transactions
    /// and it carries a correlation key.
    pub fn is_transaction_part(&self) -> bool {
        self.message_type.supports_transaction() && !self.transaction_uuid.is_empty()
    }

    pub fn transaction_key(&self) -> Option<&str> {
        if self.is_transaction_part() {
            Some(self.transaction_uuid.as_str())
        } else {
            None
        }
    }
}

/// Encode a message in the given format.
pub fn encode(message: &Message, format: Format) -> Result<Vec<u8>, WrpError> {
    match format {
        Format::Msgpack => rmp_serde::to_vec_named(message).map_err(|e| WrpError::Encode {
            format,
            message: e.to_string(),
        }),
        Format::Json => serde_json::to_vec(message).map_err(|e| WrpError::Encode {
            format,
            message: e.to_string(),
        }),
    }
}

/// Decode a message from the given format.
pub fn decode(data: &[u8], format: Format) -> Result<Message, WrpError> {
    match format {
        Format::Msgpack => rmp_serde::from_slice(data).map_err(|e| WrpError::Decode {
            format,
            message: e.to_string(),
        }),
        Format::Json => serde_json::from_slice(data).map_err(|e| WrpError::Decode {
            format,
            message: e.to_string(),
        }),
    }
}

/// Transcode raw bytes from one format into another.
pub fn transcode(data: &[u8], from: Format, to: Format) -> Result<Vec<u8>, WrpError> {
    if from == to {
        return Ok(data.to_vec());
    }
    encode(&decode(data, from)?, to)
}

/// Payload bytes: MessagePack bin on the wire, base64 string in JSON.
mod payload {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use bytes::Bytes;
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
        if serializer.is_human_readable() {
            serializer.serialize_str(&STANDARD.encode(value))
        } else {
            serializer.serialize_bytes(value)
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
        if deserializer.is_human_readable() {
            let text = String::deserialize(deserializer)?;
            STANDARD
                .decode(text.as_bytes())
                .map(Bytes::from)
                .map_err(D::Error::custom)
        } else {
            Bytes::deserialize(deserializer)
        }
    }
}
