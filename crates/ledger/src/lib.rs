mod audit;
mod drafts;
mod transactions;

pub use audit::{AuditEvent, AuditLog};
pub use drafts::{DraftStore, Transition};
pub use transactions::TransactionLedger;

use anyhow::{anyhow, Context, Result};
use chrono::Duration;
use rbtc_inv_core::InvoiceStatus;
use serde::{de::DeserializeOwned, Serialize};
use sled::Db;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tokio::sync::broadcast;

/// Notification emitted after every committed ledger write.
#[derive(Debug, Clone, PartialEq)]
pub enum LedgerChange {
    DraftUpdated { id: String, status: InvoiceStatus },
    DraftRemoved { id: String },
    TransactionAdded { hash: String, invoice_id: String },
    ConfirmationsUpdated { hash: String, confirmations: u64 },
    TransactionsCleared,
}

#[derive(Debug, Clone)]
pub struct LedgerSettings {
    /// Time from creation until a draft expires.
    pub expiry_window: Duration,
    /// Age after which non-paid drafts are pruned.
    pub retention: Duration,
}

impl Default for LedgerSettings {
    fn default() -> Self {
        Self {
            expiry_window: Duration::hours(1),
            retention: Duration::days(30),
        }
    }
}

/// Durable home of draft invoices and detected transactions.
#[derive(Clone)]
pub struct Ledger {
    db: Db,
    drafts: DraftStore,
    transactions: TransactionLedger,
    changes: broadcast::Sender<LedgerChange>,
}

impl Ledger {
    pub fn open(path: impl AsRef<Path>, settings: LedgerSettings, audit: AuditLog) -> Result<Self> {
        let path = path.as_ref();
        let db = sled::open(path)
            .with_context(|| format!("Failed to open ledger at {}", path.display()))?;
        Self::from_db(db, settings, audit)
    }

    /// Throwaway in-memory ledger.
    pub fn temporary(settings: LedgerSettings) -> Result<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::from_db(db, settings, AuditLog::disabled())
    }

    fn from_db(db: Db, settings: LedgerSettings, audit: AuditLog) -> Result<Self> {
        let (changes, _) = broadcast::channel(256);
        let drafts = DraftStore::new(db.open_tree("drafts")?, settings, changes.clone(), audit.clone());
        let transactions =
            TransactionLedger::new(db.open_tree("transactions")?, changes.clone(), audit);
        Ok(Self {
            db,
            drafts,
            transactions,
            changes,
        })
    }

    pub fn drafts(&self) -> &DraftStore {
        &self.drafts
    }

    pub fn transactions(&self) -> &TransactionLedger {
        &self.transactions
    }

    pub fn subscribe_changes(&self) -> broadcast::Receiver<LedgerChange> {
        self.changes.subscribe()
    }

    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }
}

pub(crate) fn lock(m: &Mutex<()>) -> Result<MutexGuard<'_, ()>> {
    m.lock().map_err(|_| anyhow!("ledger writer lock poisoned"))
}

pub(crate) fn load<T: DeserializeOwned>(tree: &sled::Tree, key: &str) -> Result<Option<T>> {
    match tree.get(key.as_bytes())? {
        Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        None => Ok(None),
    }
}

pub(crate) fn store<T: Serialize>(tree: &sled::Tree, key: &str, value: &T) -> Result<()> {
    tree.insert(key.as_bytes(), serde_json::to_vec(value)?)?;
    Ok(())
}

pub(crate) fn load_all<T: DeserializeOwned>(tree: &sled::Tree) -> Result<Vec<T>> {
    let mut out = Vec::new();
    for item in tree.iter() {
        let (_k, v) = item?;
        out.push(serde_json::from_slice(&v)?);
    }
    Ok(out)
}
