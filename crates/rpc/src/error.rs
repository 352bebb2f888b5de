use rbtc_inv_core::ValidationError;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RpcError {
    #[error("transport failure calling {method}: {message}")]
    Transport { method: String, message: String },
    #[error("node answered {method} with HTTP {status}: {body}")]
    Http {
        method: String,
        status: u16,
        body: String,
    },
    #[error("{method} did not complete within {limit:?}")]
    Timeout { method: String, limit: Duration },
    #[error("rpc error {code}: {message}")]
    Rpc { code: i64, message: String },
    #[error("node returned no result for {method}")]
    EmptyResult { method: String },
    #[error("could not decode {method} response: {reason}")]
    Decode { method: String, reason: String },
    #[error("no asset contract configured, transfer history is unavailable")]
    NoAssetContract,
    #[error(transparent)]
    Validation(#[from] ValidationError),
}

impl RpcError {
    /// Network-level failures worth another attempt. A well-formed RPC error is a
    /// semantic answer and is never retried.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            RpcError::Transport { .. } | RpcError::Http { .. } | RpcError::Timeout { .. }
        )
    }

    pub(crate) fn decode(method: &str, reason: impl ToString) -> Self {
        RpcError::Decode {
            method: method.to_string(),
            reason: reason.to_string(),
        }
    }
}
