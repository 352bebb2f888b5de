use async_trait::async_trait;
use rbtc_inv_core::{Address, BaseUnits};
use serde::{Deserialize, Serialize};

pub use error::RpcError;

/// An inbound transfer recovered from the chain's log history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainTransfer {
    pub hash: String,
    pub from: Address,
    pub to: Address,
    pub value: BaseUnits,
    pub block_number: Option<u64>,
}

/// Normalized `eth_getTransactionByHash` record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainTransaction {
    pub hash: String,
    pub from: String,
    pub to: Option<String>,
    pub value: BaseUnits,
    /// `None` while the transaction is still in the mempool.
    pub block_number: Option<u64>,
}

#[async_trait]
pub trait ChainRpc: Send + Sync {
    async fn get_address_balance(&self, address: &str) -> Result<BaseUnits, RpcError>;
    async fn get_address_transactions(
        &self,
        address: &str,
        from_block: Option<u64>,
    ) -> Result<Vec<ChainTransfer>, RpcError>;
    async fn get_transaction(&self, hash: &str) -> Result<Option<ChainTransaction>, RpcError>;
    async fn get_latest_block_number(&self) -> Result<u64, RpcError>;
}

pub mod error;
pub mod http;
pub mod mock;
pub mod scan;
pub mod types;
