//! Token Amount Utilities
//!
//! Token amounts are carried in base units (wei-style, 18 decimals for most
//! EVM tokens) and encoded as 32-byte big-endian integers wherever they are
//! hashed.

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Decimals used when formatting amounts for humans
pub const DEFAULT_DECIMALS: u32 = 18;

/// Amount of a token in base units
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TokenAmount(pub u128);

impl TokenAmount {
    pub const ZERO: TokenAmount = TokenAmount(0);

    pub fn new(units: u128) -> Self {
        Self(units)
    }

    pub fn units(&self) -> u128 {
        self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }

    /// 32-byte big-endian encoding used by commitments and nullifiers
    pub fn to_be256(&self) -> [u8; 32] {
        let mut out = [0u8; 32];
        out[16..].copy_from_slice(&self.0.to_be_bytes());
        out
    }

    pub fn checked_add(self, other: TokenAmount) -> Option<TokenAmount> {
        self.0.checked_add(other.0).map(TokenAmount)
    }

    /// Sum a list of amounts, `None` on overflow
    pub fn sum<I: IntoIterator<Item = TokenAmount>>(amounts: I) -> Option<TokenAmount> {
        amounts
            .into_iter()
            .try_fold(TokenAmount::ZERO, |acc, a| acc.checked_add(a))
    }
}

impl std::fmt::Display for TokenAmount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for TokenAmount {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_units(s).ok_or_else(|| format!("invalid token amount: {}", s))
    }
}

impl From<u128> for TokenAmount {
    fn from(units: u128) -> Self {
        Self(units)
    }
}

// Serialized as a decimal string so JSON consumers never lose precision.
impl Serialize for TokenAmount {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0.to_string())
    }
}

impl<'de> Deserialize<'de> for TokenAmount {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Parse a base-unit amount, tolerating `,` and `_` separators
pub fn parse_units(s: &str) -> Option<TokenAmount> {
    s.trim()
        .replace(',', "")
        .replace('_', "")
        .parse::<u128>()
        .ok()
        .map(TokenAmount)
}

/// Format base units as a decimal token amount
/// e.g., 1_500_000_000_000_000_000 with 18 decimals -> "1.5"
pub fn format_units(amount: TokenAmount, decimals: u32) -> String {
    let divisor = 10u128.pow(decimals);
    let whole = amount.0 / divisor;
    let frac = amount.0 % divisor;

    if frac == 0 {
        return format_with_commas(whole);
    }

    let frac_str = format!("{:0width$}", frac, width = decimals as usize);
    format!("{}.{}", format_with_commas(whole), frac_str.trim_end_matches('0'))
}

/// Format number with thousands separators
fn format_with_commas(n: u128) -> String {
    let s = n.to_string();
    let mut result = String::new();
    let chars: Vec<char> = s.chars().collect();

    for (i, c) in chars.iter().enumerate() {
        if i > 0 && (chars.len() - i) % 3 == 0 {
            result.push(',');
        }
        result.push(*c);
    }

    result
}
