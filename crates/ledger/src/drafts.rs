use crate::audit::{AuditEvent, AuditLog};
use crate::{load, load_all, lock, store, LedgerChange, LedgerSettings};
use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use rbtc_inv_core::parsing::to_base_units;
use rbtc_inv_core::validation::validate;
use rbtc_inv_core::{BaseUnits, Invoice, InvoiceForm, InvoiceStatus};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;

/// Outcome of a status change request.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    Applied(Invoice),
    /// The invoice was already terminal; nothing was written.
    Unchanged(Invoice),
}

impl Transition {
    pub fn applied(&self) -> bool {
        matches!(self, Transition::Applied(_))
    }

    pub fn invoice(&self) -> &Invoice {
        match self {
            Transition::Applied(inv) | Transition::Unchanged(inv) => inv,
        }
    }

    pub fn into_invoice(self) -> Invoice {
        match self {
            Transition::Applied(inv) | Transition::Unchanged(inv) => inv,
        }
    }
}

#[derive(Clone)]
pub struct DraftStore {
    tree: sled::Tree,
    write_lock: Arc<Mutex<()>>,
    settings: LedgerSettings,
    changes: broadcast::Sender<LedgerChange>,
    audit: AuditLog,
}

impl DraftStore {
    pub(crate) fn new(
        tree: sled::Tree,
        settings: LedgerSettings,
        changes: broadcast::Sender<LedgerChange>,
        audit: AuditLog,
    ) -> Self {
        Self {
            tree,
            write_lock: Arc::new(Mutex::new(())),
            settings,
            changes,
            audit,
        }
    }

    pub fn create_draft(&self, form: &InvoiceForm) -> Result<Invoice> {
        self.create_draft_at(form, Utc::now())
    }

    pub fn create_draft_at(&self, form: &InvoiceForm, now: DateTime<Utc>) -> Result<Invoice> {
        validate(form).map_err(|errs| anyhow!("Invalid invoice: {}", errs.join("; ")))?;
        let requested_amount = to_base_units(&form.amount)?;

        let invoice = Invoice {
            id: uuid::Uuid::new_v4().to_string(),
            client_name: form.client_name.trim().to_string(),
            client_code: form.client_code.trim().to_string(),
            amount: form.amount.trim().to_string(),
            currency: form.currency.trim().to_uppercase(),
            description: form.description.clone(),
            address: form.address.trim().to_lowercase(),
            requested_amount,
            pay_to_address: form.pay_to_address.as_ref().map(|a| a.trim().to_lowercase()),
            created_at: now,
            expires_at: now + self.settings.expiry_window,
            status: InvoiceStatus::Pending,
            balance_at_creation: form.balance_at_creation,
            created_block: form.created_block,
            observed_amount: None,
            payment_tx: None,
            paid_at: None,
            sync_pending: true,
            chain_id: None,
            metadata: BTreeMap::new(),
        };

        {
            let _guard = lock(&self.write_lock)?;
            store(&self.tree, &invoice.id, &invoice)?;
        }
        self.notify(&invoice);
        self.audit.record(
            AuditEvent::new("draft_created", &invoice.id, invoice.status.as_str())
                .with_amount(invoice.requested_amount.to_string()),
        );
        tracing::info!(invoice_id=%invoice.id, client_code=%invoice.client_code, "draft invoice created");
        Ok(invoice)
    }

    pub fn get_by_id(&self, id: &str) -> Result<Option<Invoice>> {
        load(&self.tree, id)
    }

    /// All drafts, newest first.
    pub fn list_drafts(&self) -> Result<Vec<Invoice>> {
        let mut out: Vec<Invoice> = load_all(&self.tree)?;
        out.sort_by_key(|r| r.created_at);
        out.reverse();
        Ok(out)
    }

    pub fn pending(&self) -> Result<Vec<Invoice>> {
        Ok(self
            .list_drafts()?
            .into_iter()
            .filter(|inv| inv.status == InvoiceStatus::Pending)
            .collect())
    }

    pub fn find_by_client_code(&self, client_code: &str) -> Result<Option<Invoice>> {
        Ok(self
            .list_drafts()?
            .into_iter()
            .find(|inv| inv.client_code == client_code))
    }

    pub fn mark_as_paid(
        &self,
        id: &str,
        observed_amount: Option<BaseUnits>,
        tx_ref: Option<String>,
    ) -> Result<Transition> {
        let transition = self.transition(id, |inv| match inv.status {
            InvoiceStatus::Pending => {
                inv.status = InvoiceStatus::Paid;
                inv.observed_amount = observed_amount.or(inv.observed_amount);
                inv.payment_tx = tx_ref.clone().or(inv.payment_tx.take());
                inv.paid_at = Some(Utc::now());
                true
            }
            InvoiceStatus::Paid => false,
            other => {
                tracing::warn!(invoice_id=%inv.id, status=other.as_str(), "payment observed for a closed invoice, leaving it unchanged");
                false
            }
        })?;

        if let Transition::Applied(inv) = &transition {
            let mut event = AuditEvent::new("invoice_paid", &inv.id, inv.status.as_str());
            if let Some(tx) = &inv.payment_tx {
                event = event.with_tx(tx.clone());
            }
            if let Some(amount) = inv.observed_amount {
                event = event.with_amount(amount.to_string());
            }
            self.audit.record(event);
        }
        Ok(transition)
    }

    pub fn mark_cancelled(&self, id: &str) -> Result<Transition> {
        let transition = self.transition(id, |inv| match inv.status {
            InvoiceStatus::Pending => {
                inv.status = InvoiceStatus::Cancelled;
                true
            }
            InvoiceStatus::Paid => {
                tracing::warn!(invoice_id=%inv.id, "refusing to cancel a paid invoice");
                false
            }
            _ => false,
        })?;
        self.audit_transition("invoice_cancelled", &transition);
        Ok(transition)
    }

    pub fn mark_expired(&self, id: &str) -> Result<Transition> {
        let transition = self.transition(id, |inv| {
            if inv.status == InvoiceStatus::Pending {
                inv.status = InvoiceStatus::Expired;
                true
            } else {
                false
            }
        })?;
        self.audit_transition("invoice_expired", &transition);
        Ok(transition)
    }

    pub fn set_balance_snapshot(&self, id: &str, balance: BaseUnits) -> Result<Transition> {
        self.transition(id, |inv| {
            if inv.status == InvoiceStatus::Pending {
                inv.balance_at_creation = Some(balance);
                true
            } else {
                false
            }
        })
    }

    /// Record that the chain write for this draft landed.
    pub fn mark_synced(&self, id: &str, chain_id: u64) -> Result<Transition> {
        let transition = self.transition(id, |inv| {
            if !inv.sync_pending && inv.chain_id == Some(chain_id) {
                return false;
            }
            inv.sync_pending = false;
            inv.chain_id = Some(chain_id);
            true
        })?;
        if let Transition::Applied(inv) = &transition {
            self.audit.record(
                AuditEvent::new("draft_synced", &inv.id, inv.status.as_str())
                    .with_detail(format!("chain_id={chain_id}")),
            );
        }
        Ok(transition)
    }

    pub fn set_metadata(&self, id: &str, key: &str, value: &str) -> Result<Transition> {
        self.transition(id, |inv| {
            if inv.metadata.get(key).map(String::as_str) == Some(value) {
                return false;
            }
            inv.metadata.insert(key.to_string(), value.to_string());
            true
        })
    }

    /// Replace the draft sharing `record.client_code` with the chain-confirmed record,
    /// keeping everything only this side knows about. Without a matching draft the
    /// record is stored as-is.
    pub fn apply_chain_record(&self, record: Invoice) -> Result<Invoice> {
        let merged = {
            let _guard = lock(&self.write_lock)?;
            let existing = load_all::<Invoice>(&self.tree)?
                .into_iter()
                .find(|inv| inv.client_code == record.client_code);

            let merged = match existing {
                Some(local) => merge_chain_record(local, record),
                None => Invoice {
                    sync_pending: false,
                    ..record
                },
            };
            store(&self.tree, &merged.id, &merged)?;
            merged
        };

        self.notify(&merged);
        self.audit.record(
            AuditEvent::new("chain_record_applied", &merged.id, merged.status.as_str())
                .with_detail(format!("client_code={}", merged.client_code)),
        );
        Ok(merged)
    }

    /// Move every overdue pending draft to `expired`.
    pub fn expire_overdue(&self, now: DateTime<Utc>) -> Result<Vec<Invoice>> {
        let mut expired = Vec::new();
        for inv in self.pending()? {
            if inv.is_expired_at(now) {
                if let Transition::Applied(inv) = self.mark_expired(&inv.id)? {
                    expired.push(inv);
                }
            }
        }
        Ok(expired)
    }

    /// Delete drafts older than the retention horizon unless they were paid.
    pub fn prune(&self, now: DateTime<Utc>) -> Result<usize> {
        let cutoff = now - self.settings.retention;
        let mut removed = Vec::new();
        {
            let _guard = lock(&self.write_lock)?;
            for inv in load_all::<Invoice>(&self.tree)? {
                if inv.created_at < cutoff && inv.status != InvoiceStatus::Paid {
                    self.tree.remove(inv.id.as_bytes())?;
                    removed.push(inv.id);
                }
            }
        }

        for id in &removed {
            let _ = self.changes.send(LedgerChange::DraftRemoved { id: id.clone() });
        }
        if !removed.is_empty() {
            tracing::info!(count = removed.len(), "pruned old drafts");
        }
        Ok(removed.len())
    }

    fn transition<F>(&self, id: &str, apply: F) -> Result<Transition>
    where
        F: FnOnce(&mut Invoice) -> bool,
    {
        let transition = {
            let _guard = lock(&self.write_lock)?;
            let mut inv: Invoice =
                load(&self.tree, id)?.ok_or_else(|| anyhow!("invoice not found: {id}"))?;
            if apply(&mut inv) {
                store(&self.tree, id, &inv)?;
                Transition::Applied(inv)
            } else {
                Transition::Unchanged(inv)
            }
        };

        if let Transition::Applied(inv) = &transition {
            self.notify(inv);
        }
        Ok(transition)
    }

    fn audit_transition(&self, event_type: &str, transition: &Transition) {
        if let Transition::Applied(inv) = transition {
            self.audit
                .record(AuditEvent::new(event_type, &inv.id, inv.status.as_str()));
        }
    }

    fn notify(&self, inv: &Invoice) {
        let _ = self.changes.send(LedgerChange::DraftUpdated {
            id: inv.id.clone(),
            status: inv.status,
        });
    }
}

fn merge_chain_record(local: Invoice, record: Invoice) -> Invoice {
    let mut metadata = local.metadata;
    metadata.extend(record.metadata);

    // A locally observed terminal outcome outranks a chain record that has not
    // caught up yet.
    let status = if local.status.is_terminal() {
        local.status
    } else {
        record.status
    };

    Invoice {
        id: local.id,
        pay_to_address: record.pay_to_address.or(local.pay_to_address),
        balance_at_creation: record.balance_at_creation.or(local.balance_at_creation),
        created_block: local.created_block.or(record.created_block),
        observed_amount: local.observed_amount.or(record.observed_amount),
        payment_tx: local.payment_tx.or(record.payment_tx),
        paid_at: local.paid_at.or(record.paid_at),
        chain_id: record.chain_id.or(local.chain_id),
        sync_pending: false,
        status,
        metadata,
        ..record
    }
}
