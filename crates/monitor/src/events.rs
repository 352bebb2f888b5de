use crate::intents::ChainWriteIntent;
use rbtc_inv_core::StoredTransaction;
use serde::Serialize;
use tokio::sync::broadcast;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Connected,
    Disconnected,
    Reconnecting,
}

/// Everything the engine reports to its consumers.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum MonitorEvent {
    PaymentDetected {
        invoice_id: String,
        transaction: StoredTransaction,
    },
    PaymentConfirmed {
        invoice_id: String,
        transaction: StoredTransaction,
    },
    ConnectionStatus {
        status: ConnectionStatus,
    },
    ConnectionFailed {
        attempts: u32,
    },
    InvoiceExpired {
        invoice_id: String,
    },
    ChainWriteRequested {
        intent: ChainWriteIntent,
    },
}

impl MonitorEvent {
    pub fn name(&self) -> &'static str {
        match self {
            MonitorEvent::PaymentDetected { .. } => "payment_detected",
            MonitorEvent::PaymentConfirmed { .. } => "payment_confirmed",
            MonitorEvent::ConnectionStatus { .. } => "connection_status",
            MonitorEvent::ConnectionFailed { .. } => "connection_failed",
            MonitorEvent::InvoiceExpired { .. } => "invoice_expired",
            MonitorEvent::ChainWriteRequested { .. } => "chain_write_requested",
        }
    }

    pub fn invoice_id(&self) -> Option<&str> {
        match self {
            MonitorEvent::PaymentDetected { invoice_id, .. }
            | MonitorEvent::PaymentConfirmed { invoice_id, .. }
            | MonitorEvent::InvoiceExpired { invoice_id } => Some(invoice_id),
            MonitorEvent::ChainWriteRequested { intent } => Some(intent.invoice_id()),
            MonitorEvent::ConnectionStatus { .. } | MonitorEvent::ConnectionFailed { .. } => None,
        }
    }
}

/// Fan-out of [`MonitorEvent`]s; every subscriber sees every event.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<MonitorEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MonitorEvent> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: MonitorEvent) {
        tracing::debug!(event = event.name(), invoice_id = ?event.invoice_id(), "publishing event");
        // No subscribers is fine; events are advisory.
        let _ = self.tx.send(event);
    }
}
