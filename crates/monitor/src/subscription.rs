use crate::backoff::{ReconnectDecision, ReconnectPolicy, ReconnectTracker};
use crate::error::{FatalConnectionError, MonitorError};
use crate::events::{ConnectionStatus, EventBus, MonitorEvent};
use crate::intents::ChainWriteIntent;
use crate::stream::{ControlMessage, StreamMessage, TransactionNotice, HEARTBEAT_PAYLOAD};
use anyhow::Result;
use chrono::{DateTime, Utc};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use ledger::{Ledger, Transition};
use rbtc_inv_core::{Address, AddressSubscription, BaseUnits, StoredTransaction, TxStatus};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsWriter = SplitSink<WsStream, Message>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub url: String,
    pub heartbeat_interval: Duration,
    pub connect_timeout: Duration,
    pub reconnect: ReconnectPolicy,
}

impl MonitorConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            heartbeat_interval: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            reconnect: ReconnectPolicy::default(),
        }
    }
}

struct Inner {
    config: MonitorConfig,
    state: RwLock<ConnectionState>,
    writer: Mutex<Option<WsWriter>>,
    registry: RwLock<HashMap<Address, AddressSubscription>>,
    ledger: Ledger,
    events: EventBus,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<Result<(), FatalConnectionError>>>>,
}

/// Push path: one WebSocket connection plus the address → invoice registry.
#[derive(Clone)]
pub struct SubscriptionMonitor {
    inner: Arc<Inner>,
}

impl SubscriptionMonitor {
    pub fn new(config: MonitorConfig, ledger: Ledger, events: EventBus) -> Result<Self, MonitorError> {
        if !(config.url.starts_with("ws://") || config.url.starts_with("wss://")) {
            return Err(MonitorError::InvalidUrl(config.url));
        }
        let (shutdown, _) = watch::channel(false);
        Ok(Self {
            inner: Arc::new(Inner {
                config,
                state: RwLock::new(ConnectionState::Disconnected),
                writer: Mutex::new(None),
                registry: RwLock::new(HashMap::new()),
                ledger,
                events,
                shutdown,
                task: Mutex::new(None),
            }),
        })
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.inner.config
    }

    /// Spawn the connection task. Calling it again after a fatal give-up resumes
    /// with the registry intact.
    pub async fn start(&self) -> Result<(), MonitorError> {
        let mut task = self.inner.task.lock().await;
        if task.as_ref().is_some_and(|h| !h.is_finished()) {
            return Err(MonitorError::AlreadyRunning);
        }
        self.inner.shutdown.send_replace(false);
        let monitor = self.clone();
        *task = Some(tokio::spawn(async move { monitor.run().await }));
        tracing::info!(url=%self.inner.config.url, "subscription monitor started");
        Ok(())
    }

    pub async fn stop(&self) {
        self.inner.shutdown.send_replace(true);
        let handle = self.inner.task.lock().await.take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::warn!(error=%e, "monitor task ended abnormally");
            }
        }
        if let Some(mut writer) = self.inner.writer.lock().await.take() {
            let _ = writer.close().await;
        }
        self.set_state(ConnectionState::Disconnected).await;
        tracing::info!("subscription monitor stopped");
    }

    /// Wait for the connection task to finish on its own.
    pub async fn wait(&self) -> Result<(), MonitorError> {
        let handle = self.inner.task.lock().await.take();
        match handle {
            Some(handle) => handle
                .await
                .map_err(|e| MonitorError::WebSocket(e.to_string()))?
                .map_err(MonitorError::from),
            None => Ok(()),
        }
    }

    pub async fn state(&self) -> ConnectionState {
        *self.inner.state.read().await
    }

    pub async fn is_connected(&self) -> bool {
        self.state().await == ConnectionState::Connected
    }

    /// Register interest in `address`. Invalid addresses are logged and ignored.
    pub async fn subscribe(
        &self,
        address: &str,
        invoice_id: &str,
        expected_amount: Option<BaseUnits>,
        creator: Option<String>,
    ) -> bool {
        let address = match Address::parse(address) {
            Ok(a) => a,
            Err(e) => {
                tracing::warn!(address, invoice_id, error=%e, "not subscribing to invalid address");
                return false;
            }
        };
        let subscription = AddressSubscription {
            address: address.clone(),
            invoice_id: invoice_id.to_string(),
            expected_amount,
            creator,
        };
        let replaced = self
            .inner
            .registry
            .write()
            .await
            .insert(address.clone(), subscription);
        if let Some(previous) = replaced {
            tracing::debug!(address=%address, previous=%previous.invoice_id, "subscription overwritten");
        }

        if self.is_connected().await {
            let frame = ControlMessage::Subscribe {
                address: address.as_str(),
            };
            if let Err(e) = self.send_text(frame.to_text()).await {
                tracing::warn!(address=%address, error=%e, "subscribe frame not sent, will resend on reconnect");
            }
        }
        tracing::info!(address=%address, invoice_id, "watching address");
        true
    }

    pub async fn unsubscribe(&self, address: &str) -> Option<AddressSubscription> {
        let address = Address::parse(address).ok()?;
        let removed = self.inner.registry.write().await.remove(&address);
        self.release(&address, removed).await
    }

    /// Drop the subscription on `address` only while it still belongs to
    /// `invoice_id`; a newer invoice that took the address over keeps it.
    pub async fn unsubscribe_for(
        &self,
        address: &str,
        invoice_id: &str,
    ) -> Option<AddressSubscription> {
        let address = Address::parse(address).ok()?;
        let removed = {
            let mut registry = self.inner.registry.write().await;
            match registry.get(&address) {
                Some(sub) if sub.invoice_id == invoice_id => registry.remove(&address),
                Some(sub) => {
                    tracing::debug!(address=%address, invoice_id, owner=%sub.invoice_id, "address now watched for another invoice, keeping it");
                    None
                }
                None => None,
            }
        };
        self.release(&address, removed).await
    }

    async fn release(
        &self,
        address: &Address,
        removed: Option<AddressSubscription>,
    ) -> Option<AddressSubscription> {
        if removed.is_some() && self.is_connected().await {
            let frame = ControlMessage::Unsubscribe {
                address: address.as_str(),
            };
            if let Err(e) = self.send_text(frame.to_text()).await {
                tracing::debug!(address=%address, error=%e, "unsubscribe frame not sent");
            }
        }
        removed
    }

    pub async fn subscriptions(&self) -> Vec<AddressSubscription> {
        self.inner.registry.read().await.values().cloned().collect()
    }

    pub async fn is_subscribed(&self, address: &str) -> bool {
        match Address::parse(address) {
            Ok(a) => self.inner.registry.read().await.contains_key(&a),
            Err(_) => false,
        }
    }

    pub async fn handle_text(&self, text: &str) {
        self.handle_message(StreamMessage::parse(text)).await;
    }

    pub async fn handle_message(&self, message: StreamMessage) {
        match message {
            StreamMessage::Transaction(notice) => self.handle_transaction(notice).await,
            StreamMessage::NewBlock { height } => self.handle_new_block(height).await,
            StreamMessage::Subscribed { address } => {
                tracing::debug!(address, "subscription acknowledged")
            }
            StreamMessage::Unsubscribed { address } => {
                tracing::debug!(address, "unsubscription acknowledged")
            }
            StreamMessage::Pong => tracing::trace!("heartbeat acknowledged"),
            StreamMessage::Error { message } => {
                tracing::warn!(message, "payment stream reported an error")
            }
            StreamMessage::Malformed { kind, reason } => {
                tracing::warn!(kind = %kind, reason = %reason, "dropping undecodable stream message")
            }
            StreamMessage::Unrecognized(raw) => {
                tracing::debug!(raw, "dropping unrecognized stream message")
            }
        }
    }

    async fn handle_transaction(&self, notice: TransactionNotice) {
        let Ok(address) = Address::parse(&notice.address) else {
            tracing::debug!(address=%notice.address, "transaction for malformed address");
            return;
        };
        let Some(subscription) = self.inner.registry.read().await.get(&address).cloned() else {
            tracing::debug!(address=%address, hash=%notice.hash, "transaction for unwatched address");
            return;
        };
        if notice.value == 0 {
            tracing::debug!(address=%address, hash=%notice.hash, "ignoring zero-value transfer");
            return;
        }
        if let Some(expected) = subscription.expected_amount {
            if notice.value < expected {
                tracing::warn!(
                    invoice_id=%subscription.invoice_id,
                    received=%notice.value,
                    expected=%expected,
                    hash=%notice.hash,
                    "underpayment received, still watching"
                );
                return;
            }
            if notice.value > expected {
                tracing::info!(
                    invoice_id=%subscription.invoice_id,
                    received=%notice.value,
                    expected=%expected,
                    "overpayment received"
                );
            }
        }

        let transaction = StoredTransaction {
            hash: notice.hash.to_lowercase(),
            invoice_id: subscription.invoice_id.clone(),
            from: notice.from.to_lowercase(),
            to: address.to_string(),
            amount: notice.value,
            block_number: notice.block_number,
            timestamp: notice
                .timestamp
                .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0)),
            confirmations: 0,
            status: TxStatus::Pending,
            detected_at: Utc::now(),
        };
        if let Err(e) = self.record_payment(&subscription, transaction).await {
            tracing::error!(invoice_id=%subscription.invoice_id, error=%e, "failed to record streamed payment");
        }
    }

    async fn record_payment(
        &self,
        subscription: &AddressSubscription,
        transaction: StoredTransaction,
    ) -> Result<()> {
        let ledger = &self.inner.ledger;
        let invoice_id = subscription.invoice_id.as_str();
        let added = ledger.transactions().add_transaction(transaction.clone())?;
        let stored = ledger
            .transactions()
            .get(&transaction.hash)?
            .unwrap_or(transaction);
        if stored.invoice_id != invoice_id {
            tracing::warn!(
                invoice_id,
                hash=%stored.hash,
                owner=%stored.invoice_id,
                "transaction already paid another invoice, still watching"
            );
            return Ok(());
        }

        let transition = match ledger.drafts().get_by_id(invoice_id)? {
            Some(_) => Some(ledger.drafts().mark_as_paid(
                invoice_id,
                Some(stored.amount),
                Some(stored.hash.clone()),
            )?),
            None => {
                tracing::warn!(invoice_id, "payment for an invoice with no local draft");
                None
            }
        };
        self.unsubscribe_for(subscription.address.as_str(), invoice_id)
            .await;

        let applied = matches!(transition, Some(Transition::Applied(_)));
        if !added && !applied {
            tracing::debug!(hash=%stored.hash, "payment already recorded");
            return Ok(());
        }
        tracing::info!(invoice_id, hash=%stored.hash, amount=%stored.amount, "payment detected on stream");
        self.inner.events.publish(MonitorEvent::PaymentDetected {
            invoice_id: invoice_id.to_string(),
            transaction: stored,
        });
        if let Some(Transition::Applied(invoice)) = transition {
            if let Some(intent) = ChainWriteIntent::confirm_payment(&invoice) {
                self.inner
                    .events
                    .publish(MonitorEvent::ChainWriteRequested { intent });
            }
        }
        Ok(())
    }

    async fn handle_new_block(&self, height: u64) {
        let transactions = self.inner.ledger.transactions();
        let pending = match transactions.pending() {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!(height, error=%e, "could not load pending transactions");
                return;
            }
        };
        for tx in pending {
            let Some(block) = tx.block_number else {
                continue;
            };
            if height < block {
                continue;
            }
            let confirmations = height - block + 1;
            match transactions.update_confirmations(&tx.hash, confirmations) {
                Ok(Some(updated)) if updated.status == TxStatus::Confirmed => {
                    tracing::info!(hash=%updated.hash, confirmations, "payment confirmed");
                    self.inner.events.publish(MonitorEvent::PaymentConfirmed {
                        invoice_id: updated.invoice_id.clone(),
                        transaction: updated,
                    });
                }
                Ok(_) => {}
                Err(e) => tracing::warn!(hash=%tx.hash, error=%e, "confirmation update failed"),
            }
        }
    }

    async fn run(self) -> Result<(), FatalConnectionError> {
        let mut shutdown = self.inner.shutdown.subscribe();
        let mut tracker =
            ReconnectTracker::new(self.inner.config.reconnect.clone(), &self.inner.config.url);

        loop {
            if *shutdown.borrow_and_update() {
                break;
            }
            self.set_state(ConnectionState::Connecting).await;
            match self.connect().await {
                Ok(stream) => {
                    tracker.on_connected();
                    let outcome = self.serve(stream, &mut shutdown).await;
                    self.inner.writer.lock().await.take();
                    if *shutdown.borrow() {
                        break;
                    }
                    match outcome {
                        Ok(()) => tracing::info!("payment stream closed"),
                        Err(e) => tracing::warn!(error=%e, "payment stream dropped"),
                    }
                }
                Err(e) => tracing::warn!(url=%self.inner.config.url, error=%e, "stream connect failed"),
            }

            match tracker.on_failure() {
                ReconnectDecision::Retry { attempt, delay } => {
                    self.set_state(ConnectionState::Reconnecting).await;
                    tracing::info!(attempt, delay_ms = delay.as_millis() as u64, "reconnecting to payment stream");
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = shutdown.changed() => {}
                    }
                }
                ReconnectDecision::GiveUp(fatal) => {
                    self.set_state(ConnectionState::Disconnected).await;
                    tracing::error!(url=%fatal.url, attempts = fatal.attempts, "giving up on payment stream");
                    self.inner.events.publish(MonitorEvent::ConnectionFailed {
                        attempts: fatal.attempts,
                    });
                    return Err(fatal);
                }
                ReconnectDecision::Exhausted => break,
            }
        }

        self.set_state(ConnectionState::Disconnected).await;
        Ok(())
    }

    async fn connect(&self) -> Result<WsStream, MonitorError> {
        let limit = self.inner.config.connect_timeout;
        match tokio::time::timeout(limit, connect_async(self.inner.config.url.as_str())).await {
            Ok(Ok((stream, _response))) => Ok(stream),
            Ok(Err(e)) => Err(MonitorError::WebSocket(e.to_string())),
            Err(_) => Err(MonitorError::Timeout(limit)),
        }
    }

    async fn serve(
        &self,
        stream: WsStream,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<(), MonitorError> {
        let (writer, mut reader) = stream.split();
        *self.inner.writer.lock().await = Some(writer);
        self.set_state(ConnectionState::Connected).await;
        tracing::info!(url=%self.inner.config.url, "connected to payment stream");
        self.resubscribe_all().await;

        let mut heartbeat = tokio::time::interval(self.inner.config.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        heartbeat.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if let Some(mut writer) = self.inner.writer.lock().await.take() {
                        let _ = writer.close().await;
                    }
                    return Ok(());
                }
                _ = heartbeat.tick() => {
                    self.send_text(HEARTBEAT_PAYLOAD.to_string()).await?;
                }
                frame = reader.next() => match frame {
                    Some(Ok(Message::Text(text))) => self.handle_text(&text).await,
                    Some(Ok(Message::Close(frame))) => {
                        tracing::debug!(?frame, "server closed the stream");
                        return Ok(());
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(MonitorError::WebSocket(e.to_string())),
                    None => return Ok(()),
                },
            }
        }
    }

    async fn resubscribe_all(&self) {
        let addresses: Vec<Address> = self.inner.registry.read().await.keys().cloned().collect();
        for address in &addresses {
            let frame = ControlMessage::Subscribe {
                address: address.as_str(),
            };
            if let Err(e) = self.send_text(frame.to_text()).await {
                tracing::warn!(address=%address, error=%e, "resubscribe failed");
                return;
            }
        }
        if !addresses.is_empty() {
            tracing::info!(count = addresses.len(), "resubscribed watched addresses");
        }
    }

    async fn send_text(&self, text: String) -> Result<(), MonitorError> {
        let mut writer = self.inner.writer.lock().await;
        let writer = writer.as_mut().ok_or(MonitorError::NotConnected)?;
        writer
            .send(Message::Text(text))
            .await
            .map_err(|e| MonitorError::WebSocket(e.to_string()))
    }

    async fn set_state(&self, next: ConnectionState) {
        {
            let mut state = self.inner.state.write().await;
            if *state == next {
                return;
            }
            *state = next;
        }
        let status = match next {
            ConnectionState::Connected => ConnectionStatus::Connected,
            ConnectionState::Disconnected => ConnectionStatus::Disconnected,
            ConnectionState::Reconnecting => ConnectionStatus::Reconnecting,
            ConnectionState::Connecting => return,
        };
        self.inner
            .events
            .publish(MonitorEvent::ConnectionStatus { status });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ledger::LedgerSettings;
    use rbtc_inv_core::{InvoiceForm, InvoiceStatus};
    use tokio::net::TcpListener;
    use tokio::sync::broadcast;

    const PAY_TO: &str = "0x00000000000000000000000000000000000000aa";

    fn monitor(url: &str) -> (SubscriptionMonitor, Ledger, EventBus) {
        let ledger = Ledger::temporary(LedgerSettings::default()).unwrap();
        let events = EventBus::default();
        let mut config = MonitorConfig::new(url);
        config.heartbeat_interval = Duration::from_secs(60);
        config.connect_timeout = Duration::from_secs(2);
        config.reconnect = ReconnectPolicy {
            base_delay: Duration::from_millis(10),
            max_attempts: 2,
        };
        let m = SubscriptionMonitor::new(config, ledger.clone(), events.clone()).unwrap();
        (m, ledger, events)
    }

    fn draft(ledger: &Ledger) -> rbtc_inv_core::Invoice {
        ledger
            .drafts()
            .create_draft(&InvoiceForm {
                client_name: "Acme".into(),
                client_code: "C-1".into(),
                amount: "0.000000000000000500".into(),
                currency: "RBTC".into(),
                address: PAY_TO.into(),
                ..Default::default()
            })
            .unwrap()
    }

    fn tx_frame(hash: &str, value: u64, block: u64) -> String {
        format!(
            r#"{{"type":"transaction","address":"{PAY_TO}","hash":"{hash}","from":"0xbb","value":{value},"blockNumber":{block}}}"#
        )
    }

    fn drain(rx: &mut broadcast::Receiver<MonitorEvent>) -> Vec<MonitorEvent> {
        let mut out = Vec::new();
        while let Ok(e) = rx.try_recv() {
            out.push(e);
        }
        out
    }

    #[test]
    fn rejects_non_websocket_urls() {
        let ledger = Ledger::temporary(LedgerSettings::default()).unwrap();
        let err = SubscriptionMonitor::new(
            MonitorConfig::new("http://node"),
            ledger,
            EventBus::default(),
        )
        .err()
        .unwrap();
        assert!(matches!(err, MonitorError::InvalidUrl(_)));
    }

    #[tokio::test]
    async fn subscribe_validates_and_overwrites() {
        let (m, _ledger, _events) = monitor("ws://127.0.0.1:9");
        assert!(!m.subscribe("not-an-address", "inv-1", None, None).await);
        assert!(m.subscriptions().await.is_empty());

        assert!(m.subscribe(PAY_TO, "inv-1", Some(10), None).await);
        assert!(m.subscribe(&PAY_TO.to_uppercase().replace("0X", "0x"), "inv-2", Some(20), None).await);
        let subs = m.subscriptions().await;
        assert_eq!(subs.len(), 1);
        assert_eq!(subs[0].invoice_id, "inv-2");

        assert!(m.unsubscribe(PAY_TO).await.is_some());
        assert!(m.unsubscribe(PAY_TO).await.is_none());
    }

    #[tokio::test]
    async fn unsubscribe_for_keeps_a_newer_owner() {
        let (m, _ledger, _events) = monitor("ws://127.0.0.1:9");
        m.subscribe(PAY_TO, "inv-1", Some(10), None).await;
        m.subscribe(PAY_TO, "inv-2", Some(20), None).await;

        assert!(m.unsubscribe_for(PAY_TO, "inv-1").await.is_none());
        assert!(m.is_subscribed(PAY_TO).await);

        let removed = m.unsubscribe_for(PAY_TO, "inv-2").await.unwrap();
        assert_eq!(removed.invoice_id, "inv-2");
        assert!(!m.is_subscribed(PAY_TO).await);
    }

    #[tokio::test]
    async fn transaction_owned_by_another_invoice_pays_nothing() {
        let (m, ledger, events) = monitor("ws://127.0.0.1:9");
        let first = draft(&ledger);
        let second = draft(&ledger);
        m.subscribe(PAY_TO, &first.id, Some(first.requested_amount), None).await;
        m.handle_text(&tx_frame("0xabc", 500, 10)).await;

        let mut rx = events.subscribe();
        m.subscribe(PAY_TO, &second.id, Some(second.requested_amount), None).await;
        m.handle_text(&tx_frame("0xabc", 500, 10)).await;

        let stored = ledger.drafts().get_by_id(&second.id).unwrap().unwrap();
        assert_eq!(stored.status, InvoiceStatus::Pending);
        assert!(m.is_subscribed(PAY_TO).await);
        assert_eq!(ledger.transactions().get("0xabc").unwrap().unwrap().invoice_id, first.id);
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn underpayment_keeps_invoice_open() {
        let (m, ledger, events) = monitor("ws://127.0.0.1:9");
        let mut rx = events.subscribe();
        let inv = draft(&ledger);
        m.subscribe(PAY_TO, &inv.id, Some(inv.requested_amount), None).await;

        m.handle_text(&tx_frame("0x01", 499, 10)).await;

        let stored = ledger.drafts().get_by_id(&inv.id).unwrap().unwrap();
        assert_eq!(stored.status, InvoiceStatus::Pending);
        assert!(m.is_subscribed(PAY_TO).await);
        assert!(ledger.transactions().list().unwrap().is_empty());
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn qualifying_payment_marks_paid_once() {
        let (m, ledger, events) = monitor("ws://127.0.0.1:9");
        let mut rx = events.subscribe();
        let inv = draft(&ledger);
        m.subscribe(PAY_TO, &inv.id, Some(inv.requested_amount), None).await;

        m.handle_text(&tx_frame("0xABC", 650, 10)).await;

        let stored = ledger.drafts().get_by_id(&inv.id).unwrap().unwrap();
        assert_eq!(stored.status, InvoiceStatus::Paid);
        assert_eq!(stored.observed_amount, Some(650));
        assert_eq!(stored.payment_tx.as_deref(), Some("0xabc"));
        assert!(!m.is_subscribed(PAY_TO).await);

        let emitted = drain(&mut rx);
        let names: Vec<_> = emitted.iter().map(|e| e.name()).collect();
        assert_eq!(names, vec!["payment_detected", "chain_write_requested"]);

        // A replay after re-subscribing must not double count.
        m.subscribe(PAY_TO, &inv.id, Some(inv.requested_amount), None).await;
        m.handle_text(&tx_frame("0xabc", 650, 10)).await;
        assert_eq!(ledger.transactions().list().unwrap().len(), 1);
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn large_numeric_payment_is_detected() {
        let (m, ledger, _events) = monitor("ws://127.0.0.1:9");
        let inv = draft(&ledger);
        m.subscribe(PAY_TO, &inv.id, Some(inv.requested_amount), None).await;

        m.handle_text(&format!(
            r#"{{"type":"transaction","address":"{PAY_TO}","hash":"0xb16","value":20000000000000000000}}"#
        ))
        .await;

        let stored = ledger.drafts().get_by_id(&inv.id).unwrap().unwrap();
        assert_eq!(stored.status, InvoiceStatus::Paid);
        assert_eq!(stored.observed_amount, Some(20_000_000_000_000_000_000));
    }

    #[tokio::test]
    async fn new_blocks_confirm_pending_transactions() {
        let (m, ledger, events) = monitor("ws://127.0.0.1:9");
        let inv = draft(&ledger);
        m.subscribe(PAY_TO, &inv.id, Some(inv.requested_amount), None).await;
        m.handle_text(&tx_frame("0x01", 500, 100)).await;
        let mut rx = events.subscribe();

        m.handle_text(r#"{"type":"new_block","height":99}"#).await;
        assert!(drain(&mut rx).is_empty());

        m.handle_text(r#"{"type":"new_block","height":"0x66"}"#).await;
        let tx = ledger.transactions().get("0x01").unwrap().unwrap();
        assert_eq!(tx.confirmations, 3);
        assert_eq!(tx.status, TxStatus::Confirmed);
        let emitted = drain(&mut rx);
        assert!(matches!(
            emitted.as_slice(),
            [MonitorEvent::PaymentConfirmed { invoice_id, .. }] if invoice_id == &inv.id
        ));

        m.handle_text(r#"{"type":"new_block","height":103}"#).await;
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn streams_payment_from_live_socket() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(socket).await.unwrap();
            let first = loop {
                match ws.next().await {
                    Some(Ok(Message::Text(t))) => break t,
                    Some(Ok(_)) => continue,
                    other => panic!("unexpected frame {other:?}"),
                }
            };
            ws.send(Message::Text(tx_frame("0xfeed", 500, 7)))
                .await
                .unwrap();
            // Keep the socket open until the client goes away.
            while let Some(Ok(_)) = ws.next().await {}
            first
        });

        let (m, ledger, events) = monitor(&format!("ws://{addr}"));
        let mut rx = events.subscribe();
        let inv = draft(&ledger);
        m.subscribe(PAY_TO, &inv.id, Some(inv.requested_amount), None).await;
        m.start().await.unwrap();

        let detected = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let MonitorEvent::PaymentDetected { transaction, .. } = rx.recv().await.unwrap() {
                    break transaction;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(detected.hash, "0xfeed");
        assert_eq!(m.state().await, ConnectionState::Connected);

        m.stop().await;
        assert_eq!(m.state().await, ConnectionState::Disconnected);
        let first = server.await.unwrap();
        assert_eq!(first, format!(r#"{{"type":"subscribe","address":"{PAY_TO}"}}"#));
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts_with_one_fatal_event() {
        let port = {
            let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
            l.local_addr().unwrap().port()
        };
        let (m, _ledger, events) = monitor(&format!("ws://127.0.0.1:{port}"));
        let mut rx = events.subscribe();
        m.subscribe(PAY_TO, "inv-1", None, None).await;
        m.start().await.unwrap();

        let result = tokio::time::timeout(Duration::from_secs(10), m.wait())
            .await
            .unwrap();
        assert!(matches!(
            result,
            Err(MonitorError::Fatal(FatalConnectionError { attempts: 2, .. }))
        ));

        let failures = drain(&mut rx)
            .into_iter()
            .filter(|e| matches!(e, MonitorEvent::ConnectionFailed { .. }))
            .count();
        assert_eq!(failures, 1);
        assert_eq!(m.state().await, ConnectionState::Disconnected);
        assert!(m.is_subscribed(PAY_TO).await);
    }
}
