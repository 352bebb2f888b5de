//! Wire format of the payment stream.

use rbtc_inv_core::parsing::parse_quantity;
use rbtc_inv_core::BaseUnits;
use serde::{de, Deserialize, Deserializer, Serialize};
use serde_json::value::RawValue;

/// Heartbeat frame sent while connected.
pub const HEARTBEAT_PAYLOAD: &str = "ping";

/// Inbound transfer pushed for a watched address.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TransactionNotice {
    pub address: String,
    pub hash: String,
    #[serde(default)]
    pub from: String,
    #[serde(deserialize_with = "flexible_amount")]
    pub value: BaseUnits,
    #[serde(
        default,
        rename = "blockNumber",
        alias = "block_number",
        deserialize_with = "flexible_block"
    )]
    pub block_number: Option<u64>,
    /// Unix seconds.
    #[serde(default)]
    pub timestamp: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamMessage {
    Transaction(TransactionNotice),
    NewBlock { height: u64 },
    Subscribed { address: String },
    Unsubscribed { address: String },
    Pong,
    Error { message: String },
    /// A known kind whose body could not be decoded.
    Malformed { kind: String, reason: String },
    /// Anything else; logged and dropped by the monitor.
    Unrecognized(String),
}

#[derive(Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
}

const TRANSACTION_KIND: &str = "transaction";
const KNOWN_KINDS: [&str; 6] = [
    TRANSACTION_KIND,
    "new_block",
    "subscribed",
    "unsubscribed",
    "pong",
    "error",
];

// Transactions are decoded straight from the text: buffering through a tagged
// enum would squeeze amounts above u64 into floats.
#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireMessage {
    NewBlock {
        #[serde(deserialize_with = "flexible_height")]
        height: u64,
    },
    Subscribed {
        address: String,
    },
    Unsubscribed {
        address: String,
    },
    Pong,
    Error {
        message: String,
    },
}

impl StreamMessage {
    pub fn parse(text: &str) -> Self {
        if text.trim().eq_ignore_ascii_case("pong") {
            return StreamMessage::Pong;
        }
        let kind = match serde_json::from_str::<Envelope>(text) {
            Ok(envelope) if KNOWN_KINDS.contains(&envelope.kind.as_str()) => envelope.kind,
            _ => return StreamMessage::Unrecognized(text.to_string()),
        };
        let parsed = if kind == TRANSACTION_KIND {
            serde_json::from_str::<TransactionNotice>(text).map(StreamMessage::Transaction)
        } else {
            serde_json::from_str::<WireMessage>(text).map(StreamMessage::from)
        };
        parsed.unwrap_or_else(|e| StreamMessage::Malformed {
            kind,
            reason: e.to_string(),
        })
    }
}

impl From<WireMessage> for StreamMessage {
    fn from(wire: WireMessage) -> Self {
        match wire {
            WireMessage::NewBlock { height } => StreamMessage::NewBlock { height },
            WireMessage::Subscribed { address } => StreamMessage::Subscribed { address },
            WireMessage::Unsubscribed { address } => StreamMessage::Unsubscribed { address },
            WireMessage::Pong => StreamMessage::Pong,
            WireMessage::Error { message } => StreamMessage::Error { message },
        }
    }
}

/// Outbound control frames.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage<'a> {
    Subscribe { address: &'a str },
    Unsubscribe { address: &'a str },
}

impl ControlMessage<'_> {
    pub fn to_text(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Stream producers disagree on number encoding: JSON numbers, decimal strings
/// and `0x` quantities all show up.
#[derive(Deserialize)]
#[serde(untagged)]
enum Flexible {
    Number(u64),
    Text(String),
}

impl Flexible {
    fn into_u128<E: de::Error>(self) -> Result<u128, E> {
        match self {
            Flexible::Number(n) => Ok(n as u128),
            Flexible::Text(s) => parse_quantity(&s).map_err(E::custom),
        }
    }
}

/// Reads the raw token so JSON numbers wider than u64 keep every digit.
fn flexible_amount<'de, D: Deserializer<'de>>(deserializer: D) -> Result<BaseUnits, D::Error> {
    let raw = Box::<RawValue>::deserialize(deserializer)?;
    let token = raw.get().trim();
    if token.starts_with('"') {
        let text: String = serde_json::from_str(token).map_err(de::Error::custom)?;
        parse_quantity(&text).map_err(de::Error::custom)
    } else {
        token
            .parse::<u128>()
            .map_err(|_| de::Error::custom(format!("amount {token} is not a whole number of base units")))
    }
}

fn flexible_height<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
    let n = Flexible::deserialize(deserializer)?.into_u128()?;
    u64::try_from(n).map_err(de::Error::custom)
}

fn flexible_block<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<u64>, D::Error> {
    match Option::<Flexible>::deserialize(deserializer)? {
        Some(f) => {
            let n = f.into_u128()?;
            u64::try_from(n).map(Some).map_err(de::Error::custom)
        }
        None => Ok(None),
    }
}
