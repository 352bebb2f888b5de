use chrono::{DateTime, Utc};
use rbtc_inv_core::InvoiceStatus;
use rpc::RpcError;
use std::time::Duration;
use thiserror::Error;

/// Expected business outcomes and chain failures of a payment check.
#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("invoice {invoice_id} has no valid payment address")]
    NoPaymentAddress { invoice_id: String },
    #[error("invoice {invoice_id} expired at {expires_at}")]
    InvoiceExpired {
        invoice_id: String,
        expires_at: DateTime<Utc>,
    },
    #[error("invoice {invoice_id} is {} and can no longer be paid", .status.as_str())]
    InvoiceClosed {
        invoice_id: String,
        status: InvoiceStatus,
    },
    #[error("chain query for {address} failed: {source}")]
    Chain {
        address: String,
        #[source]
        source: RpcError,
    },
    #[error("payment check for {invoice_id} did not finish within {limit:?}")]
    TimedOut { invoice_id: String, limit: Duration },
    #[error("ledger update failed: {0}")]
    Ledger(#[source] anyhow::Error),
}

impl ReconcileError {
    /// True for outcomes the caller should present as a business condition rather
    /// than a fault.
    pub fn is_business(&self) -> bool {
        matches!(
            self,
            ReconcileError::NoPaymentAddress { .. }
                | ReconcileError::InvoiceExpired { .. }
                | ReconcileError::InvoiceClosed { .. }
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("gave up reconnecting to {url} after {attempts} attempts")]
pub struct FatalConnectionError {
    pub url: String,
    pub attempts: u32,
}

#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("subscription monitor is already running")]
    AlreadyRunning,
    #[error("stream url must use ws:// or wss://, got {0}")]
    InvalidUrl(String),
    #[error("not connected to the payment stream")]
    NotConnected,
    #[error("websocket error: {0}")]
    WebSocket(String),
    #[error("connection timeout after {0:?}")]
    Timeout(Duration),
    #[error(transparent)]
    Fatal(#[from] FatalConnectionError),
}

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("invoice not found: {0}")]
    NotFound(String),
    #[error(transparent)]
    Reconcile(#[from] ReconcileError),
    #[error(transparent)]
    Ledger(#[from] anyhow::Error),
}
