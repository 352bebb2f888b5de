use crate::error::ServiceError;
use crate::events::{EventBus, MonitorEvent};
use crate::intents::ChainWriteIntent;
use crate::reconciler::{CheckState, PaymentCheck, Reconciler};
use crate::subscription::SubscriptionMonitor;
use chrono::Utc;
use ledger::{Ledger, Transition};
use rbtc_inv_core::{Address, Invoice, InvoiceForm};
use rpc::ChainRpc;
use std::sync::Arc;
use tokio::sync::{broadcast, watch};

/// Metadata key holding the chain-write receipt hash.
pub const CHAIN_TX_KEY: &str = "chain_tx";

/// Entry point for callers: wires the ledger, push path and pull path together.
#[derive(Clone)]
pub struct PaymentService {
    rpc: Arc<dyn ChainRpc>,
    ledger: Ledger,
    monitor: SubscriptionMonitor,
    reconciler: Reconciler,
    events: EventBus,
}

impl PaymentService {
    pub fn new(
        rpc: Arc<dyn ChainRpc>,
        ledger: Ledger,
        monitor: SubscriptionMonitor,
        events: EventBus,
    ) -> Self {
        let reconciler = Reconciler::new(Arc::clone(&rpc), ledger.clone(), events.clone());
        Self {
            rpc,
            ledger,
            monitor,
            reconciler,
            events,
        }
    }

    pub fn with_reconciler(mut self, reconciler: Reconciler) -> Self {
        self.reconciler = reconciler;
        self
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn monitor(&self) -> &SubscriptionMonitor {
        &self.monitor
    }

    pub fn reconciler(&self) -> &Reconciler {
        &self.reconciler
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<MonitorEvent> {
        self.events.subscribe()
    }

    /// Snapshot the pay-to balance and chain height, store the draft, start watching
    /// it and ask the chain-write layer to record it.
    pub async fn create_invoice(
        &self,
        mut form: InvoiceForm,
        creator: Option<String>,
    ) -> Result<Invoice, ServiceError> {
        if form.created_block.is_none() {
            match self.rpc.get_latest_block_number().await {
                Ok(height) => form.created_block = Some(height),
                Err(e) => tracing::warn!(error=%e, "chain height unavailable, history scan falls back to the lookback window"),
            }
        }
        if form.balance_at_creation.is_none() {
            let target = form
                .pay_to_address
                .as_deref()
                .and_then(|a| Address::parse(a).ok())
                .or_else(|| Address::parse(&form.address).ok());
            if let Some(address) = target {
                match self.rpc.get_address_balance(address.as_str()).await {
                    Ok(balance) => form.balance_at_creation = Some(balance),
                    Err(e) => {
                        tracing::warn!(address=%address, error=%e, "balance snapshot unavailable, relying on history")
                    }
                }
            }
        }

        let invoice = self.ledger.drafts().create_draft(&form)?;
        if let Some(address) = invoice.payment_address() {
            self.monitor
                .subscribe(
                    address.as_str(),
                    &invoice.id,
                    Some(invoice.requested_amount),
                    creator,
                )
                .await;
        }
        if let Some(intent) = ChainWriteIntent::create_invoice(&invoice) {
            self.events
                .publish(MonitorEvent::ChainWriteRequested { intent });
        }
        Ok(invoice)
    }

    pub async fn cancel_invoice(&self, id: &str) -> Result<Transition, ServiceError> {
        self.require(id)?;
        let transition = self.ledger.drafts().mark_cancelled(id)?;
        if transition.applied() {
            self.stop_watching(transition.invoice()).await;
            tracing::info!(invoice_id = id, "invoice cancelled");
        }
        Ok(transition)
    }

    /// Manual "mark as paid": runs the pull-path check now.
    pub async fn confirm_invoice(&self, id: &str) -> Result<PaymentCheck, ServiceError> {
        let invoice = self.require(id)?;
        let check = self.reconciler.confirm_invoice_paid(&invoice).await?;
        if check.confirmed {
            self.stop_watching(&invoice).await;
        }
        Ok(check)
    }

    pub fn check_invoice(&self, id: &str) -> Result<watch::Receiver<CheckState>, ServiceError> {
        let invoice = self.require(id)?;
        Ok(self.reconciler.spawn_check(invoice))
    }

    /// Receipt from the chain-write layer for the draft with `client_code`.
    pub fn apply_chain_receipt(
        &self,
        client_code: &str,
        chain_id: u64,
        tx_hash: &str,
    ) -> Result<Invoice, ServiceError> {
        let drafts = self.ledger.drafts();
        let invoice = drafts
            .find_by_client_code(client_code)?
            .ok_or_else(|| ServiceError::NotFound(client_code.to_string()))?;
        drafts.mark_synced(&invoice.id, chain_id)?;
        let invoice = drafts
            .set_metadata(&invoice.id, CHAIN_TX_KEY, &tx_hash.to_lowercase())?
            .into_invoice();
        tracing::info!(invoice_id=%invoice.id, chain_id, tx_hash, "chain receipt applied");
        Ok(invoice)
    }

    /// Re-register every live pending invoice, e.g. after a restart.
    pub async fn resume_watching(&self) -> Result<usize, ServiceError> {
        let now = Utc::now();
        let mut count = 0;
        for invoice in self.ledger.drafts().pending()? {
            if invoice.is_expired_at(now) {
                continue;
            }
            let Some(address) = invoice.payment_address() else {
                continue;
            };
            if self
                .monitor
                .subscribe(
                    address.as_str(),
                    &invoice.id,
                    Some(invoice.requested_amount),
                    None,
                )
                .await
            {
                count += 1;
            }
        }
        tracing::info!(count, "resumed watching pending invoices");
        Ok(count)
    }

    fn require(&self, id: &str) -> Result<Invoice, ServiceError> {
        self.ledger
            .drafts()
            .get_by_id(id)?
            .ok_or_else(|| ServiceError::NotFound(id.to_string()))
    }

    async fn stop_watching(&self, invoice: &Invoice) {
        if let Some(address) = invoice.payment_address() {
            self.monitor
                .unsubscribe_for(address.as_str(), &invoice.id)
                .await;
        }
    }
}
