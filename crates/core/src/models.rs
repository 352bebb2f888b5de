use crate::address::Address;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Smallest integer denomination of the native asset.
pub type BaseUnits = u128;

/// Prefix that marks a locally synthesized transaction reference.
pub const PLACEHOLDER_HASH_PREFIX: &str = "local-";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InvoiceStatus {
    Pending,
    Paid,
    Cancelled,
    Expired,
}

impl InvoiceStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, InvoiceStatus::Pending)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            InvoiceStatus::Pending => "pending",
            InvoiceStatus::Paid => "paid",
            InvoiceStatus::Cancelled => "cancelled",
            InvoiceStatus::Expired => "expired",
        }
    }
}

/// Caller input for a new invoice.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InvoiceForm {
    pub client_name: String,
    pub client_code: String,
    /// Human decimal amount, e.g. `"0.0025"`.
    pub amount: String,
    pub currency: String,
    #[serde(default)]
    pub description: Option<String>,
    /// Merchant's primary address.
    pub address: String,
    #[serde(default)]
    pub pay_to_address: Option<String>,
    #[serde(default, with = "crate::parsing::opt_base_units")]
    pub balance_at_creation: Option<BaseUnits>,
    #[serde(default)]
    pub created_block: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Invoice {
    pub id: String,
    pub client_name: String,
    pub client_code: String,
    pub amount: String,
    pub currency: String,
    #[serde(default)]
    pub description: Option<String>,
    pub address: String,
    #[serde(with = "crate::parsing::base_units")]
    pub requested_amount: BaseUnits,
    #[serde(default)]
    pub pay_to_address: Option<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub status: InvoiceStatus,
    #[serde(default, with = "crate::parsing::opt_base_units")]
    pub balance_at_creation: Option<BaseUnits>,
    /// Chain height when the draft was created; history before it never counts.
    #[serde(default)]
    pub created_block: Option<u64>,
    #[serde(default, with = "crate::parsing::opt_base_units")]
    pub observed_amount: Option<BaseUnits>,
    #[serde(default)]
    pub payment_tx: Option<String>,
    #[serde(default)]
    pub paid_at: Option<DateTime<Utc>>,
    pub sync_pending: bool,
    #[serde(default)]
    pub chain_id: Option<u64>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl Invoice {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }

    /// The address funds are expected at: the explicit pay-to address when it is a
    /// valid chain address, else the primary address.
    pub fn payment_address(&self) -> Option<Address> {
        self.pay_to_address
            .as_deref()
            .and_then(|a| Address::parse(a).ok())
            .or_else(|| Address::parse(&self.address).ok())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TxStatus {
    Pending,
    Confirmed,
    Failed,
}

impl TxStatus {
    pub fn from_confirmations(confirmations: u64) -> Self {
        if confirmations >= 1 {
            TxStatus::Confirmed
        } else {
            TxStatus::Pending
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredTransaction {
    pub hash: String,
    pub invoice_id: String,
    pub from: String,
    pub to: String,
    #[serde(with = "crate::parsing::base_units")]
    pub amount: BaseUnits,
    #[serde(default)]
    pub block_number: Option<u64>,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
    pub confirmations: u64,
    pub status: TxStatus,
    pub detected_at: DateTime<Utc>,
}

impl StoredTransaction {
    pub fn is_placeholder(&self) -> bool {
        is_placeholder_hash(&self.hash)
    }
}

pub fn is_placeholder_hash(hash: &str) -> bool {
    hash.starts_with(PLACEHOLDER_HASH_PREFIX)
}

/// Interest registered with the subscription monitor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressSubscription {
    pub address: Address,
    pub invoice_id: String,
    #[serde(default, with = "crate::parsing::opt_base_units")]
    pub expected_amount: Option<BaseUnits>,
    #[serde(default)]
    pub creator: Option<String>,
}
