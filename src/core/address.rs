//! Backend addresses and the one-shot result of deploying an artifact.

use crate::core::artifact::ArtifactId;
use crate::core::error::KeystoneError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// A 20-byte address assigned by the backend.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Address([u8; Address::LEN]);

impl Address {
    pub const LEN: usize = 20;
    /// Width of the hex rendering, which is also the width of a link placeholder.
    pub const HEX_LEN: usize = Address::LEN * 2;
    pub const ZERO: Address = Address([0u8; Address::LEN]);

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, KeystoneError> {
        let raw: [u8; Address::LEN] = bytes.try_into().map_err(|_| {
            KeystoneError::InvalidAddress(format!(
                "expected {} bytes, got {}",
                Address::LEN,
                bytes.len()
            ))
        })?;
        Ok(Address(raw))
    }

    pub fn as_bytes(&self) -> &[u8; Address::LEN] {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; Address::LEN]
    }

    pub fn to_hex(&self) -> String {
        hex::encode_upper(self.0)
    }
}

impl FromStr for Address {
    type Err = KeystoneError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s
            .strip_prefix("0x")
            .or_else(|| s.strip_prefix("0X"))
            .unwrap_or(s);
        if trimmed.len() != Address::HEX_LEN {
            return Err(KeystoneError::InvalidAddress(format!(
                "'{}' is not {} hex characters",
                s,
                Address::HEX_LEN
            )));
        }
        let bytes = hex::decode(trimmed)
            .map_err(|e| KeystoneError::InvalidAddress(format!("'{}': {}", s, e)))?;
        Address::from_bytes(&bytes)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({})", self.to_hex())
    }
}

impl Serialize for Address {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Address::from_str(&s).map_err(serde::de::Error::custom)
    }
}

/// The address an artifact received when it was deployed.
///
/// Only the deployer creates these, exactly once per artifact per run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolvedAddress {
    artifact: ArtifactId,
    address: Address,
}

impl ResolvedAddress {
    pub(crate) fn new(artifact: ArtifactId, address: Address) -> Self {
        Self { artifact, address }
    }

    pub fn artifact(&self) -> &ArtifactId {
        &self.artifact
    }

    pub fn address(&self) -> Address {
        self.address
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_accepts_prefix_and_lowercase() {
        let upper: Address = "0x00000000000000000000000000000000000000AB".parse().unwrap();
        let lower: Address = "00000000000000000000000000000000000000ab".parse().unwrap();
        assert_eq!(upper, lower);
        assert_eq!(upper.as_bytes()[19], 0xAB);
    }

    #[test]
    fn test_display_is_uppercase_hex() {
        let addr = Address::from_bytes(&[0xcd; 20]).unwrap();
        assert_eq!(addr.to_string(), "CD".repeat(20));
    }

    #[test]
    fn test_rejects_wrong_width() {
        assert!("ABCD".parse::<Address>().is_err());
        assert!(Address::from_bytes(&[1, 2, 3]).is_err());
    }

    #[test]
    fn test_rejects_non_hex() {
        let bad = "Z".repeat(40);
        assert!(matches!(
            bad.parse::<Address>(),
            Err(KeystoneError::InvalidAddress(_))
        ));
    }

    #[test]
    fn test_zero() {
        assert!(Address::ZERO.is_zero());
        assert!(!Address::from_bytes(&[1; 20]).unwrap().is_zero());
    }

    #[test]
    fn test_serde_as_hex_string() {
        let addr = Address::from_bytes(&[0x11; 20]).unwrap();
        let json = serde_json::to_string(&addr).unwrap();
        assert_eq!(json, format!("\"{}\"", "11".repeat(20)));
        let back: Address = serde_json::from_str(&json).unwrap();
        assert_eq!(back, addr);
    }
}
