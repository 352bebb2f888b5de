use crate::audit::{AuditEvent, AuditLog};
use crate::{load, load_all, lock, store, LedgerChange};
use anyhow::Result;
use chrono::Utc;
use rbtc_inv_core::{StoredTransaction, TxStatus};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;

/// Deduplicated store of detected transactions keyed by hash.
#[derive(Clone)]
pub struct TransactionLedger {
    tree: sled::Tree,
    write_lock: Arc<Mutex<()>>,
    changes: broadcast::Sender<LedgerChange>,
    audit: AuditLog,
}

impl TransactionLedger {
    pub(crate) fn new(
        tree: sled::Tree,
        changes: broadcast::Sender<LedgerChange>,
        audit: AuditLog,
    ) -> Self {
        Self {
            tree,
            write_lock: Arc::new(Mutex::new(())),
            changes,
            audit,
        }
    }

    /// Append `tx` unless its hash is already known. Returns whether it was new.
    pub fn add_transaction(&self, mut tx: StoredTransaction) -> Result<bool> {
        tx.hash = tx.hash.to_lowercase();
        {
            let _guard = lock(&self.write_lock)?;
            if self.tree.contains_key(tx.hash.as_bytes())? {
                tracing::debug!(hash=%tx.hash, "transaction already recorded");
                return Ok(false);
            }
            tx.detected_at = Utc::now();
            store(&self.tree, &tx.hash, &tx)?;
        }

        let _ = self.changes.send(LedgerChange::TransactionAdded {
            hash: tx.hash.clone(),
            invoice_id: tx.invoice_id.clone(),
        });
        self.audit.record(
            AuditEvent::new("transaction_recorded", &tx.invoice_id, status_str(tx.status))
                .with_tx(tx.hash.clone())
                .with_amount(tx.amount.to_string()),
        );
        tracing::info!(hash=%tx.hash, invoice_id=%tx.invoice_id, amount=%tx.amount, "transaction recorded");
        Ok(true)
    }

    /// Set the confirmation count and derive the status from it.
    pub fn update_confirmations(
        &self,
        hash: &str,
        confirmations: u64,
    ) -> Result<Option<StoredTransaction>> {
        let hash = hash.to_lowercase();
        let updated = {
            let _guard = lock(&self.write_lock)?;
            let Some(mut tx) = load::<StoredTransaction>(&self.tree, &hash)? else {
                return Ok(None);
            };
            let status = match tx.status {
                TxStatus::Failed => TxStatus::Failed,
                _ => TxStatus::from_confirmations(confirmations),
            };
            if tx.confirmations == confirmations && tx.status == status {
                return Ok(Some(tx));
            }
            tx.confirmations = confirmations;
            tx.status = status;
            store(&self.tree, &hash, &tx)?;
            tx
        };

        let _ = self.changes.send(LedgerChange::ConfirmationsUpdated {
            hash: updated.hash.clone(),
            confirmations,
        });
        Ok(Some(updated))
    }

    pub fn get(&self, hash: &str) -> Result<Option<StoredTransaction>> {
        load(&self.tree, &hash.to_lowercase())
    }

    /// All transactions, most recently detected first.
    pub fn list(&self) -> Result<Vec<StoredTransaction>> {
        let mut out: Vec<StoredTransaction> = load_all(&self.tree)?;
        out.sort_by_key(|t| t.detected_at);
        out.reverse();
        Ok(out)
    }

    pub fn for_invoice(&self, invoice_id: &str) -> Result<Vec<StoredTransaction>> {
        Ok(self
            .list()?
            .into_iter()
            .filter(|t| t.invoice_id == invoice_id)
            .collect())
    }

    pub fn pending(&self) -> Result<Vec<StoredTransaction>> {
        Ok(self
            .list()?
            .into_iter()
            .filter(|t| t.status == TxStatus::Pending)
            .collect())
    }

    /// Drop every stored transaction.
    pub fn clear(&self) -> Result<usize> {
        let removed = {
            let _guard = lock(&self.write_lock)?;
            let n = self.tree.len();
            self.tree.clear()?;
            n
        };
        let _ = self.changes.send(LedgerChange::TransactionsCleared);
        tracing::info!(count = removed, "transaction ledger cleared");
        Ok(removed)
    }
}

fn status_str(status: TxStatus) -> &'static str {
    match status {
        TxStatus::Pending => "pending",
        TxStatus::Confirmed => "confirmed",
        TxStatus::Failed => "failed",
    }
}

#[cfg(test)]
mod tests {
    use crate::{Ledger, LedgerSettings};
    use chrono::Utc;
    use rbtc_inv_core::{StoredTransaction, TxStatus};

    fn tx(hash: &str, amount: u128) -> StoredTransaction {
        StoredTransaction {
            hash: hash.into(),
            invoice_id: "inv-1".into(),
            from: "0x00000000000000000000000000000000000000bb".into(),
            to: "0x00000000000000000000000000000000000000aa".into(),
            amount,
            block_number: Some(100),
            timestamp: None,
            confirmations: 0,
            status: TxStatus::Pending,
            detected_at: Utc::now(),
        }
    }

    #[test]
    fn re_adding_a_hash_is_a_no_op() {
        let ledger = Ledger::temporary(LedgerSettings::default()).unwrap();
        let txs = ledger.transactions();

        assert!(txs.add_transaction(tx("0xAA01", 100)).unwrap());
        assert!(!txs.add_transaction(tx("0xaa01", 999)).unwrap());

        let all = txs.list().unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].amount, 100);
    }

    #[test]
    fn confirmations_drive_status_and_replay_is_idempotent() {
        let ledger = Ledger::temporary(LedgerSettings::default()).unwrap();
        let txs = ledger.transactions();
        txs.add_transaction(tx("0x01", 100)).unwrap();

        let updated = txs.update_confirmations("0x01", 0).unwrap().unwrap();
        assert_eq!(updated.status, TxStatus::Pending);

        let updated = txs.update_confirmations("0x01", 3).unwrap().unwrap();
        assert_eq!(updated.status, TxStatus::Confirmed);
        let again = txs.update_confirmations("0x01", 3).unwrap().unwrap();
        assert_eq!(updated, again);

        assert!(txs.pending().unwrap().is_empty());
        assert!(txs.update_confirmations("0x02", 1).unwrap().is_none());
    }

    #[test]
    fn clear_removes_everything() {
        let ledger = Ledger::temporary(LedgerSettings::default()).unwrap();
        let txs = ledger.transactions();
        txs.add_transaction(tx("0x01", 1)).unwrap();
        txs.add_transaction(tx("0x02", 2)).unwrap();
        assert_eq!(txs.for_invoice("inv-1").unwrap().len(), 2);
        assert_eq!(txs.clear().unwrap(), 2);
        assert!(txs.list().unwrap().is_empty());
    }
}
