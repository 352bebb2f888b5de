use crate::error::ValidationError;
use crate::models::BaseUnits;
use sha2::{Digest, Sha256};

/// rBTC carries 18 fractional digits.
pub const DECIMALS: u32 = 18;

pub fn compute_sha256_hex(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    let bytes = hasher.finalize();
    hex::encode(bytes)
}

fn invalid(value: &str, reason: &'static str) -> ValidationError {
    ValidationError::InvalidAmount {
        value: value.to_string(),
        reason,
    }
}

/// Convert a human decimal amount such as `"0.0015"` into base units.
pub fn to_base_units(human: &str) -> Result<BaseUnits, ValidationError> {
    let s = human.trim();
    let (whole, frac) = s.split_once('.').unwrap_or((s, ""));
    if whole.is_empty() && frac.is_empty() {
        return Err(invalid(human, "empty amount"));
    }
    if !whole.chars().all(|c| c.is_ascii_digit()) || !frac.chars().all(|c| c.is_ascii_digit()) {
        return Err(invalid(human, "not a decimal number"));
    }
    if frac.len() > DECIMALS as usize {
        return Err(invalid(human, "more than 18 fractional digits"));
    }

    let whole_units: BaseUnits = if whole.is_empty() {
        0
    } else {
        whole.parse().map_err(|_| invalid(human, "amount too large"))?
    };
    let frac_units: BaseUnits = if frac.is_empty() {
        0
    } else {
        format!("{:0<width$}", frac, width = DECIMALS as usize)
            .parse()
            .map_err(|_| invalid(human, "not a decimal number"))?
    };

    whole_units
        .checked_mul(10u128.pow(DECIMALS))
        .and_then(|w| w.checked_add(frac_units))
        .ok_or_else(|| invalid(human, "amount too large"))
}

/// Render base units as a human decimal string without trailing zeros.
pub fn format_base_units(units: BaseUnits) -> String {
    let scale = 10u128.pow(DECIMALS);
    let whole = units / scale;
    let frac = units % scale;
    if frac == 0 {
        return whole.to_string();
    }
    let frac = format!("{:018}", frac);
    format!("{}.{}", whole, frac.trim_end_matches('0'))
}

/// Parse an integer base-unit string.
pub fn parse_base_units(raw: &str) -> Result<BaseUnits, ValidationError> {
    let s = raw.trim();
    if s.is_empty() || !s.chars().all(|c| c.is_ascii_digit()) {
        return Err(invalid(raw, "not an integer base-unit amount"));
    }
    s.parse().map_err(|_| invalid(raw, "amount too large"))
}

/// Requested amounts were historically stored either as base-unit integers or as
/// human decimals. A decimal point marks the legacy form.
pub fn parse_requested_amount(raw: &str) -> Result<BaseUnits, ValidationError> {
    if raw.contains('.') {
        to_base_units(raw)
    } else {
        parse_base_units(raw)
    }
}

/// Parse a JSON-RPC quantity: `0x`-prefixed hex, or a plain decimal string.
pub fn parse_quantity(raw: &str) -> Result<u128, ValidationError> {
    let s = raw.trim();
    match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some("") => Ok(0),
        Some(digits) => {
            u128::from_str_radix(digits, 16).map_err(|_| invalid(raw, "not a hex quantity"))
        }
        None => parse_base_units(s),
    }
}

pub fn to_quantity(value: u64) -> String {
    format!("0x{:x}", value)
}

/// Serde adapter storing base units as an integer string, accepting the legacy
/// decimal form and bare JSON numbers on the way in.
pub mod base_units {
    use super::parse_requested_amount;
    use crate::models::BaseUnits;
    use serde::{de, Deserialize, Deserializer, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    pub(crate) enum RawAmount {
        Text(String),
        Number(u64),
    }

    impl RawAmount {
        pub(crate) fn into_units<E: de::Error>(self) -> Result<BaseUnits, E> {
            match self {
                RawAmount::Text(s) => parse_requested_amount(&s).map_err(E::custom),
                RawAmount::Number(n) => Ok(n as BaseUnits),
            }
        }
    }

    pub fn serialize<S: Serializer>(value: &BaseUnits, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<BaseUnits, D::Error> {
        RawAmount::deserialize(deserializer)?.into_units()
    }
}

pub mod opt_base_units {
    use super::base_units::RawAmount;
    use crate::models::BaseUnits;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        value: &Option<BaseUnits>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(v) => serializer.serialize_some(&v.to_string()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<BaseUnits>, D::Error> {
        Option::<RawAmount>::deserialize(deserializer)?
            .map(RawAmount::into_units)
            .transpose()
    }
}
