//! Fixed-width Primitives
//!
//! 32-byte values (hashes, padded addresses) and chain-qualified addresses.

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// A 32-byte value rendered as `0x`-prefixed lowercase hex
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Bytes32(pub [u8; 32]);

impl Bytes32 {
    pub const ZERO: Bytes32 = Bytes32([0u8; 32]);

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Parse exactly 32 bytes of hex, with or without `0x`
    pub fn from_hex(s: &str) -> Result<Self, String> {
        let bytes = decode_hex(s)?;
        if bytes.len() != 32 {
            return Err(format!("expected 32 bytes, got {}", bytes.len()));
        }
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }

    /// Left-pad a shorter big-endian value (e.g. a 20-byte EVM address)
    pub fn left_padded(bytes: &[u8]) -> Result<Self, String> {
        if bytes.len() > 32 {
            return Err(format!("value too long: {} bytes", bytes.len()));
        }
        let mut arr = [0u8; 32];
        arr[32 - bytes.len()..].copy_from_slice(bytes);
        Ok(Self(arr))
    }

    pub fn to_hex(&self) -> String {
        format!("0x{}", hex::encode(self.0))
    }
}

impl std::fmt::Display for Bytes32 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl std::str::FromStr for Bytes32 {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

impl From<[u8; 32]> for Bytes32 {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl Serialize for Bytes32 {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Bytes32 {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

fn decode_hex(s: &str) -> Result<Vec<u8>, String> {
    let trimmed = s.trim();
    let stripped = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);
    hex::decode(stripped).map_err(|e| format!("invalid hex: {}", e))
}

/// Address qualified by its SLIP-44 chain id, padded to 32 bytes
///
/// EVM addresses occupy the low 20 bytes; non-EVM chains may use all 32.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UniversalAddress {
    pub chain_id: u32,
    pub data: Bytes32,
}

impl UniversalAddress {
    pub fn new(chain_id: u32, data: Bytes32) -> Self {
        Self { chain_id, data }
    }

    /// Parse a hex address of up to 32 bytes
    pub fn parse(chain_id: u32, address: &str) -> Result<Self, String> {
        let bytes = decode_hex(address)?;
        if bytes.is_empty() {
            return Err("empty address".to_string());
        }
        Ok(Self {
            chain_id,
            data: Bytes32::left_padded(&bytes)?,
        })
    }

    /// Short EVM form (last 20 bytes) when the upper 12 bytes are zero
    pub fn evm_address(&self) -> Option<String> {
        if self.data.0[..12].iter().all(|b| *b == 0) {
            Some(format!("0x{}", hex::encode(&self.data.0[12..])))
        } else {
            None
        }
    }
}

impl std::fmt::Display for UniversalAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.evm_address() {
            Some(short) => write!(f, "{}:{}", self.chain_id, short),
            None => write!(f, "{}:{}", self.chain_id, self.data),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_evm_address_padding() {
        let addr = UniversalAddress::parse(714, "0x6f3995e2e40ca58adcbd47a2edad192e43d98638").unwrap();
        assert_eq!(
            addr.data.to_hex(),
            "0x0000000000000000000000006f3995e2e40ca58adcbd47a2edad192e43d98638"
        );
        assert_eq!(
            addr.to_string(),
            "714:0x6f3995e2e40ca58adcbd47a2edad192e43d98638"
        );
    }

    #[test]
    fn test_bytes32_rejects_wrong_width() {
        assert!(Bytes32::from_hex("0x1234").is_err());
        assert!(Bytes32::from_hex("not hex").is_err());
        assert!(Bytes32::left_padded(&[1u8; 33]).is_err());
    }

    #[test]
    fn test_full_width_address() {
        let raw = "0x".to_string() + &"ab".repeat(32);
        let addr = UniversalAddress::parse(195, &raw).unwrap();
        assert!(addr.evm_address().is_none());
        assert_eq!(addr.data.to_hex(), raw);
    }
}
