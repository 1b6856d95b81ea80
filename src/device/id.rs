//! Device identifiers.

use std::fmt;

use serde::{Serialize, Serializer};

use super::DeviceError;

const MAC_PREFIX: &str = "mac";
const MAC_LENGTH: usize = 12;

/// The canonical identifier of a connected device.
///
/// Identifiers are opaque to the hub apart from normalization: `mac:` ids are
/// lowercased with separators removed so the same device is always keyed the
/// same way, whatever form the client sent.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceId(String);

impl DeviceId {
    /// Parse and normalize a device identifier.
    pub fn parse(value: &str) -> Result<Self, DeviceError> {
        let value = value.trim();
        if value.is_empty() {
            return Err(DeviceError::InvalidDeviceName(value.to_string()));
        }

        match value.split_once(':') {
            Some((scheme, rest)) if scheme.eq_ignore_ascii_case(MAC_PREFIX) => {
                let mac: String = rest
                    .chars()
                    .filter(|c| !matches!(c, ':' | '-' | '.'))
                    .map(|c| c.to_ascii_lowercase())
                    .collect();
                if mac.len() != MAC_LENGTH || !mac.chars().all(|c| c.is_ascii_hexdigit()) {
                    return Err(DeviceError::InvalidDeviceName(value.to_string()));
                }
                Ok(Self(format!("{MAC_PREFIX}:{mac}")))
            }
            Some((scheme, rest)) => {
                if scheme.is_empty() || rest.is_empty() {
                    return Err(DeviceError::InvalidDeviceName(value.to_string()));
                }
                Ok(Self(format!("{}:{}", scheme.to_ascii_lowercase(), rest)))
            }
            None => Ok(Self(value.to_string())),
        }
    }

    /// Extract the device id from a WRP destination such as
    /// `mac:112233445566/config`.
    pub fn from_destination(destination: &str) -> Result<Self, DeviceError> {
        let authority = destination.split('/').next().unwrap_or_default();
        Self::parse(authority)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Serialize for DeviceId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mac_normalization() {
        let expected = "mac:112233445566";
        for input in [
            "mac:112233445566",
            "MAC:11:22:33:44:55:66",
            "mac:11-22-33-44-55-66",
            "mac:1122.3344.5566",
            "  mac:AABBCCDDEEFF  ",
        ] {
            let id = DeviceId::parse(input).unwrap();
            if input.contains("AABB") {
                assert_eq!(id.as_str(), "mac:aabbccddeeff");
            } else {
                assert_eq!(id.as_str(), expected, "input {input}");
            }
        }
    }

    #[test]
    fn test_invalid_mac_rejected() {
        assert!(DeviceId::parse("mac:1122").is_err());
        assert!(DeviceId::parse("mac:11223344556g").is_err());
        assert!(DeviceId::parse("").is_err());
        assert!(DeviceId::parse("uuid:").is_err());
        assert!(DeviceId::parse(":abc").is_err());
    }

    #[test]
    fn test_opaque_ids_pass_through() {
        assert_eq!(DeviceId::parse("dev-1").unwrap().as_str(), "dev-1");
        assert_eq!(
            DeviceId::parse("UUID:ABC-123").unwrap().as_str(),
            "uuid:ABC-123"
        );
    }

    #[test]
    fn test_from_destination() {
        let id = DeviceId::from_destination("mac:11:22:33:44:55:66/config/x").unwrap();
        assert_eq!(id.as_str(), "mac:112233445566");
        assert_eq!(DeviceId::from_destination("dev-1").unwrap().as_str(), "dev-1");
        assert!(DeviceId::from_destination("/config").is_err());
    }
}
