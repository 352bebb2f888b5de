use rbtc_inv_core::parsing::base_units;
use rbtc_inv_core::{BaseUnits, Invoice, InvoiceStatus};
use serde::Serialize;

/// A request for the external chain-write layer. The engine never submits
/// transactions itself; receipts come back through
/// [`PaymentService::apply_chain_receipt`](crate::PaymentService::apply_chain_receipt).
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "call", rename_all = "snake_case")]
pub enum ChainWriteIntent {
    CreateInvoice {
        invoice_id: String,
        recipient: String,
        #[serde(with = "base_units")]
        amount: BaseUnits,
        description: String,
        address: String,
        client_name: String,
        client_code: String,
        /// Unix seconds.
        expires_at: i64,
        pay_to_address: Option<String>,
        currency: String,
        #[serde(with = "base_units")]
        balance_snapshot: BaseUnits,
    },
    ConfirmPayment {
        invoice_id: String,
        chain_id: Option<u64>,
        tx_ref: String,
        #[serde(with = "base_units")]
        amount: BaseUnits,
    },
}

impl ChainWriteIntent {
    pub fn create_invoice(inv: &Invoice) -> Option<Self> {
        let address = inv.payment_address()?;
        Some(ChainWriteIntent::CreateInvoice {
            invoice_id: inv.id.clone(),
            recipient: inv.address.clone(),
            amount: inv.requested_amount,
            description: inv.description.clone().unwrap_or_default(),
            address: address.to_string(),
            client_name: inv.client_name.clone(),
            client_code: inv.client_code.clone(),
            expires_at: inv.expires_at.timestamp(),
            pay_to_address: inv.pay_to_address.clone(),
            currency: inv.currency.clone(),
            balance_snapshot: inv.balance_at_creation.unwrap_or(0),
        })
    }

    /// Only meaningful once the invoice is paid and carries a payment reference.
    pub fn confirm_payment(inv: &Invoice) -> Option<Self> {
        if inv.status != InvoiceStatus::Paid {
            return None;
        }
        Some(ChainWriteIntent::ConfirmPayment {
            invoice_id: inv.id.clone(),
            chain_id: inv.chain_id,
            tx_ref: inv.payment_tx.clone()?,
            amount: inv.observed_amount.unwrap_or(inv.requested_amount),
        })
    }

    pub fn invoice_id(&self) -> &str {
        match self {
            ChainWriteIntent::CreateInvoice { invoice_id, .. }
            | ChainWriteIntent::ConfirmPayment { invoice_id, .. } => invoice_id,
        }
    }
}
