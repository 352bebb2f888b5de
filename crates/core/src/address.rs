use crate::error::ValidationError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A 20-byte chain address in canonical form: `0x` followed by 40 lower-case hex digits.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Address(String);

impl Address {
    pub fn parse(raw: &str) -> Result<Self, ValidationError> {
        let trimmed = raw.trim();
        let invalid = |reason| ValidationError::InvalidAddress {
            value: raw.to_string(),
            reason,
        };

        let digits = trimmed
            .strip_prefix("0x")
            .or_else(|| trimmed.strip_prefix("0X"))
            .ok_or_else(|| invalid("missing 0x prefix"))?;
        if digits.len() != 40 {
            return Err(invalid("expected 20 bytes of hex"));
        }
        let bytes = hex::decode(digits).map_err(|_| invalid("non-hex characters"))?;

        Ok(Self(format!("0x{}", hex::encode(bytes))))
    }

    pub fn is_valid(raw: &str) -> bool {
        Self::parse(raw).is_ok()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Left-padded 32-byte log topic form, as used for indexed address arguments.
    pub fn to_topic(&self) -> String {
        format!("0x{}{}", "0".repeat(24), &self.0[2..])
    }

    /// Recover an address from an indexed 32-byte log topic.
    pub fn from_topic(topic: &str) -> Result<Self, ValidationError> {
        let digits = topic.trim().trim_start_matches("0x");
        match digits.get(24..) {
            Some(tail) if digits.len() == 64 && digits.is_ascii() => Self::parse(&format!("0x{tail}")),
            _ => Err(ValidationError::InvalidAddress {
                value: topic.to_string(),
                reason: "topic is not 32 bytes",
            }),
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Address {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Address {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Address> for String {
    fn from(value: Address) -> Self {
        value.0
    }
}
