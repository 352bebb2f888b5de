//! Pull path: decide from balances and log history whether an invoice has been
//! paid. Used for manual confirmation and whenever the stream is degraded.

use crate::error::ReconcileError;
use crate::events::{EventBus, MonitorEvent};
use crate::intents::ChainWriteIntent;
use chrono::{DateTime, Utc};
use ledger::{Ledger, Transition};
use rbtc_inv_core::parsing::{compute_sha256_hex, format_base_units};
use rbtc_inv_core::{
    Address, BaseUnits, Invoice, InvoiceStatus, StoredTransaction, TxStatus,
    PLACEHOLDER_HASH_PREFIX,
};
use rpc::{ChainRpc, ChainTransfer};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Shortfall {
    pub received: BaseUnits,
    pub requested: BaseUnits,
}

impl Shortfall {
    pub fn missing(&self) -> BaseUnits {
        self.requested.saturating_sub(self.received)
    }
}

impl fmt::Display for Shortfall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "received {} of {} requested, {} still missing",
            format_base_units(self.received),
            format_base_units(self.requested),
            format_base_units(self.missing())
        )
    }
}

/// Result of a completed check. "Not yet paid" is a normal outcome here, not an error.
#[derive(Debug, Clone, PartialEq)]
pub struct PaymentCheck {
    pub confirmed: bool,
    pub amount: BaseUnits,
    pub shortfall: Option<Shortfall>,
    pub transaction: Option<StoredTransaction>,
}

impl PaymentCheck {
    fn nothing_yet() -> Self {
        Self {
            confirmed: false,
            amount: 0,
            shortfall: None,
            transaction: None,
        }
    }
}

/// Decision rule over already-fetched figures.
///
/// With a non-zero creation snapshot the received amount is the larger of the
/// balance increase and the history sum. Without one, only history counts: the
/// raw balance may hold unrelated earlier funds.
pub fn evaluate(
    requested: BaseUnits,
    snapshot: Option<BaseUnits>,
    current_balance: BaseUnits,
    from_history: BaseUnits,
) -> PaymentCheck {
    let received = match snapshot {
        Some(creation) if creation > 0 => current_balance.saturating_sub(creation).max(from_history),
        _ => from_history,
    };
    if received == 0 {
        return PaymentCheck::nothing_yet();
    }
    if received >= requested {
        PaymentCheck {
            confirmed: true,
            amount: received,
            shortfall: None,
            transaction: None,
        }
    } else {
        PaymentCheck {
            confirmed: false,
            amount: received,
            shortfall: Some(Shortfall {
                received,
                requested,
            }),
            transaction: None,
        }
    }
}

/// Progress of a check started with [`Reconciler::spawn_check`].
#[derive(Debug, Clone)]
pub enum CheckState {
    Checking,
    Finished(Result<PaymentCheck, Arc<ReconcileError>>),
}

impl CheckState {
    pub fn is_finished(&self) -> bool {
        matches!(self, CheckState::Finished(_))
    }
}

#[derive(Clone)]
pub struct Reconciler {
    rpc: Arc<dyn ChainRpc>,
    ledger: Ledger,
    events: EventBus,
    check_timeout: Duration,
}

impl Reconciler {
    pub fn new(rpc: Arc<dyn ChainRpc>, ledger: Ledger, events: EventBus) -> Self {
        Self {
            rpc,
            ledger,
            events,
            check_timeout: Duration::from_secs(60),
        }
    }

    pub fn with_check_timeout(mut self, limit: Duration) -> Self {
        self.check_timeout = limit;
        self
    }

    pub async fn confirm_invoice_paid(&self, invoice: &Invoice) -> Result<PaymentCheck, ReconcileError> {
        let limit = self.check_timeout;
        tokio::time::timeout(limit, self.confirm_invoice_paid_at(invoice, Utc::now()))
            .await
            .map_err(|_| ReconcileError::TimedOut {
                invoice_id: invoice.id.clone(),
                limit,
            })?
    }

    /// Run the check in the background; the receiver reads `Checking` until it
    /// completes.
    pub fn spawn_check(&self, invoice: Invoice) -> watch::Receiver<CheckState> {
        let (tx, rx) = watch::channel(CheckState::Checking);
        let reconciler = self.clone();
        tokio::spawn(async move {
            let result = reconciler
                .confirm_invoice_paid(&invoice)
                .await
                .map_err(Arc::new);
            let _ = tx.send(CheckState::Finished(result));
        });
        rx
    }

    pub async fn confirm_invoice_paid_at(
        &self,
        invoice: &Invoice,
        now: DateTime<Utc>,
    ) -> Result<PaymentCheck, ReconcileError> {
        let stored = self
            .ledger
            .drafts()
            .get_by_id(&invoice.id)
            .map_err(ReconcileError::Ledger)?;
        let tracked = stored.is_some();
        let invoice = stored.unwrap_or_else(|| invoice.clone());

        if invoice.status == InvoiceStatus::Paid {
            return self.already_paid(&invoice);
        }

        let address = invoice
            .payment_address()
            .ok_or_else(|| ReconcileError::NoPaymentAddress {
                invoice_id: invoice.id.clone(),
            })?;

        match invoice.status {
            InvoiceStatus::Cancelled => {
                return Err(ReconcileError::InvoiceClosed {
                    invoice_id: invoice.id.clone(),
                    status: invoice.status,
                })
            }
            InvoiceStatus::Expired => {
                return Err(ReconcileError::InvoiceExpired {
                    invoice_id: invoice.id.clone(),
                    expires_at: invoice.expires_at,
                })
            }
            _ => {}
        }
        if invoice.is_expired_at(now) {
            return Err(ReconcileError::InvoiceExpired {
                invoice_id: invoice.id.clone(),
                expires_at: invoice.expires_at,
            });
        }

        let current_balance = self
            .rpc
            .get_address_balance(address.as_str())
            .await
            .map_err(|source| ReconcileError::Chain {
                address: address.to_string(),
                source,
            })?;

        // Blocks up to the creation height are already inside the snapshot.
        let from_block = invoice.created_block.map(|height| height.saturating_add(1));
        let inbound = match self
            .rpc
            .get_address_transactions(address.as_str(), from_block)
            .await
        {
            Ok(transfers) => self.unclaimed(&invoice.id, &address, transfers)?,
            Err(e) => {
                tracing::warn!(address=%address, error=%e, "history lookup failed, counting it as zero");
                Vec::new()
            }
        };
        let from_history = inbound
            .iter()
            .fold(0u128, |acc, t| acc.saturating_add(t.value));

        let mut check = evaluate(
            invoice.requested_amount,
            invoice.balance_at_creation,
            current_balance,
            from_history,
        );
        tracing::info!(
            invoice_id=%invoice.id,
            address=%address,
            current_balance=%current_balance,
            snapshot=?invoice.balance_at_creation,
            from_history=%from_history,
            requested=%invoice.requested_amount,
            confirmed = check.confirmed,
            "payment check evaluated"
        );
        if !check.confirmed {
            if let Some(shortfall) = &check.shortfall {
                tracing::info!(invoice_id=%invoice.id, "partial payment: {shortfall}");
            }
            return Ok(check);
        }

        let transaction = StoredTransaction {
            hash: placeholder_hash(&invoice.id, address.as_str(), check.amount),
            invoice_id: invoice.id.clone(),
            from: String::new(),
            to: address.to_string(),
            amount: check.amount,
            block_number: None,
            timestamp: None,
            confirmations: 1,
            status: TxStatus::Confirmed,
            detected_at: now,
        };

        let mut applied = None;
        if tracked {
            let transition = self
                .ledger
                .drafts()
                .mark_as_paid(&invoice.id, Some(check.amount), Some(transaction.hash.clone()))
                .map_err(ReconcileError::Ledger)?;
            match transition {
                Transition::Applied(inv) => applied = Some(inv),
                Transition::Unchanged(inv) if inv.status == InvoiceStatus::Paid => {
                    // Another path recorded the payment first.
                    return self.already_paid(&inv);
                }
                Transition::Unchanged(inv) => {
                    return Err(ReconcileError::InvoiceClosed {
                        invoice_id: inv.id,
                        status: inv.status,
                    })
                }
            }
        }

        let added = self
            .ledger
            .transactions()
            .add_transaction(transaction.clone())
            .map_err(ReconcileError::Ledger)?;
        let transaction = self
            .ledger
            .transactions()
            .get(&transaction.hash)
            .map_err(ReconcileError::Ledger)?
            .unwrap_or(transaction);

        self.claim(&invoice.id, &inbound, now)?;

        if added {
            self.events.publish(MonitorEvent::PaymentDetected {
                invoice_id: invoice.id.clone(),
                transaction: transaction.clone(),
            });
        }
        if let Some(intent) = applied.as_ref().and_then(ChainWriteIntent::confirm_payment) {
            self.events.publish(MonitorEvent::ChainWriteRequested { intent });
        }
        tracing::info!(invoice_id=%invoice.id, amount=%check.amount, hash=%transaction.hash, "payment confirmed from balance");

        check.transaction = Some(transaction);
        Ok(check)
    }

    /// Inbound transfers to `address` that no other invoice has recorded yet.
    fn unclaimed(
        &self,
        invoice_id: &str,
        address: &Address,
        transfers: Vec<ChainTransfer>,
    ) -> Result<Vec<ChainTransfer>, ReconcileError> {
        let ledger = self.ledger.transactions();
        let mut out = Vec::with_capacity(transfers.len());
        for transfer in transfers {
            if transfer.to != *address || transfer.value == 0 {
                continue;
            }
            match ledger.get(&transfer.hash).map_err(ReconcileError::Ledger)? {
                Some(stored) if stored.invoice_id != invoice_id => {
                    tracing::debug!(hash=%transfer.hash, owner=%stored.invoice_id, "transfer already counted for another invoice");
                }
                _ => out.push(transfer),
            }
        }
        Ok(out)
    }

    /// Attribute the counted transfers to `invoice_id` so later checks on the same
    /// address skip them.
    fn claim(
        &self,
        invoice_id: &str,
        transfers: &[ChainTransfer],
        now: DateTime<Utc>,
    ) -> Result<(), ReconcileError> {
        for transfer in transfers {
            self.ledger
                .transactions()
                .add_transaction(StoredTransaction {
                    hash: transfer.hash.clone(),
                    invoice_id: invoice_id.to_string(),
                    from: transfer.from.to_string(),
                    to: transfer.to.to_string(),
                    amount: transfer.value,
                    block_number: transfer.block_number,
                    timestamp: None,
                    confirmations: 1,
                    status: TxStatus::Confirmed,
                    detected_at: now,
                })
                .map_err(ReconcileError::Ledger)?;
        }
        Ok(())
    }

    fn already_paid(&self, invoice: &Invoice) -> Result<PaymentCheck, ReconcileError> {
        let transaction = match &invoice.payment_tx {
            Some(hash) => self
                .ledger
                .transactions()
                .get(hash)
                .map_err(ReconcileError::Ledger)?,
            None => None,
        };
        Ok(PaymentCheck {
            confirmed: true,
            amount: invoice.observed_amount.unwrap_or(invoice.requested_amount),
            shortfall: None,
            transaction,
        })
    }
}

/// Stable per invoice, so a repeated confirmation lands on the same ledger key.
fn placeholder_hash(invoice_id: &str, address: &str, amount: BaseUnits) -> String {
    let digest = compute_sha256_hex(&format!("{invoice_id}:{address}:{amount}"));
    format!("{PLACEHOLDER_HASH_PREFIX}{digest}")
}
