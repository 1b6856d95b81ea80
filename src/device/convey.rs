//! Optional connection metadata carried in the `X-Webpa-Convey` header.
//!
//! The header value is a base64 encoded JSON object. It is advisory: a
//! malformed value is logged by the caller and the connection proceeds.

use axum::http::HeaderMap;
use base64::engine::general_purpose::{STANDARD, URL_SAFE};
use base64::Engine;
use serde_json::{Map, Value};
use thiserror::Error;

pub const CONVEY_HEADER: &str = "X-Webpa-Convey";

pub type Convey = Map<String, Value>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConveyError {
    #[error("convey header is not valid UTF-8")]
    NotUtf8,

    #[error("convey header is not valid base64: {0}")]
    Base64(String),

    #[error("convey header is not a JSON object: {0}")]
    Json(String),
}

/// Decode a raw convey value.
pub fn decode(value: &str) -> Result<Convey, ConveyError> {
    let value = value.trim();
    let raw = STANDARD
        .decode(value)
        .or_else(|_| URL_SAFE.decode(value))
        .map_err(|e| ConveyError::Base64(e.to_string()))?;
    match serde_json::from_slice::<Value>(&raw) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(other) => Err(ConveyError::Json(format!("expected object, got {other}"))),
        Err(e) => Err(ConveyError::Json(e.to_string())),
    }
}

/// Extract convey metadata from request headers. `Ok(None)` when absent.
pub fn from_headers(headers: &HeaderMap) -> Result<Option<Convey>, ConveyError> {
    let Some(value) = headers.get(CONVEY_HEADER) else {
        return Ok(None);
    };
    let value = value.to_str().map_err(|_| ConveyError::NotUtf8)?;
    decode(value).map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn encoded(json: &str) -> String {
        STANDARD.encode(json)
    }

    #[test]
    fn test_absent_header() {
        assert_eq!(from_headers(&HeaderMap::new()), Ok(None));
    }

    #[test]
    fn test_decodes_object() {
        let mut headers = HeaderMap::new();
        headers.insert(
            CONVEY_HEADER,
            HeaderValue::from_str(&encoded(r#"{"hw-model":"TG1682","fw-name":"1.0"}"#)).unwrap(),
        );
        let convey = from_headers(&headers).unwrap().unwrap();
        assert_eq!(convey["hw-model"], "TG1682");
        assert_eq!(convey.len(), 2);
    }

    #[test]
    fn test_rejects_non_object() {
        assert!(matches!(decode(&encoded("[1,2]")), Err(ConveyError::Json(_))));
    }

    #[test]
    fn test_rejects_bad_base64() {
        assert!(matches!(decode("%%%"), Err(ConveyError::Base64(_))));
    }
}
