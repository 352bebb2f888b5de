use anyhow::Result;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub timestamp: String,
    pub event_type: String,
    pub invoice_id: String,
    pub status: String,
    pub tx_hash: Option<String>,
    pub amount: Option<String>,
    pub detail: Option<String>,
}

impl AuditEvent {
    pub fn new(event_type: &str, invoice_id: &str, status: &str) -> Self {
        Self {
            timestamp: Utc::now().to_rfc3339(),
            event_type: event_type.to_string(),
            invoice_id: invoice_id.to_string(),
            status: status.to_string(),
            tx_hash: None,
            amount: None,
            detail: None,
        }
    }

    pub fn with_tx(mut self, hash: String) -> Self {
        self.tx_hash = Some(hash);
        self
    }

    pub fn with_amount(mut self, amount: String) -> Self {
        self.amount = Some(amount);
        self
    }

    pub fn with_detail(mut self, detail: String) -> Self {
        self.detail = Some(detail);
        self
    }
}

/// Append-only JSON-lines trail of ledger changes.
#[derive(Debug, Clone, Default)]
pub struct AuditLog {
    path: Option<PathBuf>,
}

impl AuditLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
        }
    }

    pub fn disabled() -> Self {
        Self { path: None }
    }

    pub fn write(&self, event: &AuditEvent) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;

        let json = serde_json::to_string(event)?;
        writeln!(file, "{}", json)?;
        tracing::debug!(event_type=%event.event_type, invoice_id=%event.invoice_id, "Audit event written");
        Ok(())
    }

    /// Audit failures never fail the ledger operation that produced them.
    pub(crate) fn record(&self, event: AuditEvent) {
        if let Err(e) = self.write(&event) {
            tracing::warn!(event_type=%event.event_type, error=%e, "failed to write audit event");
        }
    }
}
