use crate::{ChainTransaction, ChainTransfer, RpcError};
use rbtc_inv_core::parsing::parse_quantity;
use rbtc_inv_core::Address;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// keccak256("Transfer(address,address,uint256)")
pub const TRANSFER_TOPIC: &str =
    "0xddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef";

#[derive(Debug, Serialize)]
pub struct JsonRpcRequest<'a> {
    pub jsonrpc: &'static str,
    pub id: u64,
    pub method: &'a str,
    pub params: &'a Value,
}

impl<'a> JsonRpcRequest<'a> {
    pub fn new(id: u64, method: &'a str, params: &'a Value) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            method,
            params,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct JsonRpcErrorObject {
    pub code: i64,
    pub message: String,
}

#[derive(Debug, Deserialize)]
pub struct JsonRpcResponse {
    #[serde(default)]
    pub jsonrpc: Option<String>,
    #[serde(default)]
    pub id: Option<Value>,
    /// `Some(Value::Null)` when the node explicitly answered `null`.
    #[serde(default, deserialize_with = "present")]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<JsonRpcErrorObject>,
}

fn present<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Value>, D::Error> {
    Value::deserialize(deserializer).map(Some)
}

impl JsonRpcResponse {
    pub fn into_result(self, method: &str) -> Result<Value, RpcError> {
        if let Some(err) = self.error {
            return Err(RpcError::Rpc {
                code: err.code,
                message: err.message,
            });
        }
        self.result.ok_or_else(|| RpcError::EmptyResult {
            method: method.to_string(),
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawLog {
    pub transaction_hash: String,
    #[serde(default)]
    pub block_number: Option<String>,
    #[serde(default)]
    pub topics: Vec<String>,
    #[serde(default)]
    pub data: String,
}

impl RawLog {
    pub fn into_transfer(self) -> Result<ChainTransfer, RpcError> {
        const METHOD: &str = "eth_getLogs";
        if self.topics.len() < 3 {
            return Err(RpcError::decode(METHOD, "transfer log without indexed parties"));
        }
        let from = Address::from_topic(&self.topics[1])?;
        let to = Address::from_topic(&self.topics[2])?;
        let value = parse_quantity(&self.data)?;
        let block_number = self
            .block_number
            .as_deref()
            .map(|b| decode_block(METHOD, b))
            .transpose()?;

        Ok(ChainTransfer {
            hash: self.transaction_hash.to_lowercase(),
            from,
            to,
            value,
            block_number,
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawTransaction {
    pub hash: String,
    pub from: String,
    #[serde(default)]
    pub to: Option<String>,
    pub value: String,
    #[serde(default)]
    pub block_number: Option<String>,
}

impl RawTransaction {
    pub fn normalize(self) -> Result<ChainTransaction, RpcError> {
        const METHOD: &str = "eth_getTransactionByHash";
        Ok(ChainTransaction {
            hash: self.hash.to_lowercase(),
            from: self.from.to_lowercase(),
            to: self.to.map(|t| t.to_lowercase()),
            value: parse_quantity(&self.value)?,
            block_number: self
                .block_number
                .as_deref()
                .map(|b| decode_block(METHOD, b))
                .transpose()?,
        })
    }
}

pub fn decode_block(method: &str, raw: &str) -> Result<u64, RpcError> {
    let n = parse_quantity(raw)?;
    u64::try_from(n).map_err(|_| RpcError::decode(method, "block number out of range"))
}

pub fn decode_quantity(method: &str, value: &Value) -> Result<u128, RpcError> {
    let raw = value
        .as_str()
        .ok_or_else(|| RpcError::decode(method, format!("expected hex string, got {value}")))?;
    Ok(parse_quantity(raw)?)
}
