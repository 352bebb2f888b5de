use super::{ChainRpc, ChainTransaction, ChainTransfer, RpcError};
use async_trait::async_trait;
use rbtc_inv_core::{Address, BaseUnits};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Default)]
struct MockState {
    balances: HashMap<Address, BaseUnits>,
    transfers: Vec<ChainTransfer>,
    transactions: HashMap<String, ChainTransaction>,
    latest_block: u64,
    history_unsupported: bool,
    balance_failures: u32,
}

/// In-memory chain used by tests and by the daemon's `mock` provider.
#[derive(Clone, Default)]
pub struct MockChain {
    state: Arc<RwLock<MockState>>,
}

impl MockChain {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn set_balance(&self, address: &str, units: BaseUnits) {
        if let Ok(addr) = Address::parse(address) {
            self.state.write().await.balances.insert(addr, units);
        }
    }

    /// Record an inbound transfer and credit the recipient's balance.
    pub async fn push_transfer(&self, transfer: ChainTransfer) {
        let mut state = self.state.write().await;
        *state.balances.entry(transfer.to.clone()).or_default() += transfer.value;
        state.transactions.insert(
            transfer.hash.clone(),
            ChainTransaction {
                hash: transfer.hash.clone(),
                from: transfer.from.to_string(),
                to: Some(transfer.to.to_string()),
                value: transfer.value,
                block_number: transfer.block_number,
            },
        );
        if let Some(block) = transfer.block_number {
            state.latest_block = state.latest_block.max(block);
        }
        state.transfers.push(transfer);
    }

    pub async fn set_latest_block(&self, block: u64) {
        self.state.write().await.latest_block = block;
    }

    /// Make history queries fail the way nodes without log indexing do.
    pub async fn set_history_unsupported(&self, unsupported: bool) {
        self.state.write().await.history_unsupported = unsupported;
    }

    /// Fail the next `n` balance queries with a transport error.
    pub async fn fail_next_balance_calls(&self, n: u32) {
        self.state.write().await.balance_failures = n;
    }
}

#[async_trait]
impl ChainRpc for MockChain {
    async fn get_address_balance(&self, address: &str) -> Result<BaseUnits, RpcError> {
        let address = Address::parse(address)?;
        let mut state = self.state.write().await;
        if state.balance_failures > 0 {
            state.balance_failures -= 1;
            return Err(RpcError::Transport {
                method: "eth_getBalance".to_string(),
                message: "mock connection refused".to_string(),
            });
        }
        Ok(state.balances.get(&address).copied().unwrap_or(0))
    }

    async fn get_address_transactions(
        &self,
        address: &str,
        from_block: Option<u64>,
    ) -> Result<Vec<ChainTransfer>, RpcError> {
        let address = Address::parse(address)?;
        let state = self.state.read().await;
        if state.history_unsupported {
            return Err(RpcError::Rpc {
                code: -32601,
                message: "the method eth_getLogs does not exist/is not available".to_string(),
            });
        }
        let start = from_block.unwrap_or(0);
        Ok(state
            .transfers
            .iter()
            .filter(|t| t.to == address && t.block_number.map_or(true, |b| b >= start))
            .cloned()
            .collect())
    }

    async fn get_transaction(&self, hash: &str) -> Result<Option<ChainTransaction>, RpcError> {
        Ok(self
            .state
            .read()
            .await
            .transactions
            .get(&hash.to_lowercase())
            .cloned())
    }

    async fn get_latest_block_number(&self) -> Result<u64, RpcError> {
        Ok(self.state.read().await.latest_block)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TO: &str = "0x00000000000000000000000000000000000000aa";
    const FROM: &str = "0x00000000000000000000000000000000000000bb";

    #[tokio::test]
    async fn transfers_credit_balance_and_history() {
        let chain = MockChain::new();
        chain
            .push_transfer(ChainTransfer {
                hash: "0x01".into(),
                from: Address::parse(FROM).unwrap(),
                to: Address::parse(TO).unwrap(),
                value: 250,
                block_number: Some(12),
            })
            .await;

        assert_eq!(chain.get_address_balance(TO).await.unwrap(), 250);
        assert_eq!(chain.get_address_transactions(TO, None).await.unwrap().len(), 1);
        assert!(chain.get_address_transactions(FROM, None).await.unwrap().is_empty());
        assert_eq!(chain.get_latest_block_number().await.unwrap(), 12);
        assert!(chain.get_transaction("0x01").await.unwrap().is_some());
        assert!(chain.get_transaction("0x02").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn scripted_failures() {
        let chain = MockChain::new();
        chain.fail_next_balance_calls(1).await;
        assert!(chain.get_address_balance(TO).await.unwrap_err().is_transient());
        assert_eq!(chain.get_address_balance(TO).await.unwrap(), 0);

        chain.set_history_unsupported(true).await;
        assert!(matches!(
            chain.get_address_transactions(TO, None).await,
            Err(RpcError::Rpc { code: -32601, .. })
        ));
    }
}
