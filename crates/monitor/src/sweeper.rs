use crate::events::{EventBus, MonitorEvent};
use crate::reconciler::Reconciler;
use crate::subscription::SubscriptionMonitor;
use anyhow::Result;
use chrono::{DateTime, Utc};
use ledger::Ledger;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

#[derive(Debug, Clone)]
pub struct SweeperConfig {
    pub interval: Duration,
    /// Poll balances even while the stream is up.
    pub poll_when_connected: bool,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            poll_when_connected: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub expired: Vec<String>,
    pub polled: usize,
    pub confirmed: Vec<String>,
}

impl SweepReport {
    pub fn is_quiet(&self) -> bool {
        self.expired.is_empty() && self.confirmed.is_empty()
    }
}

/// Periodic expiry sweep plus the balance-polling fallback for a degraded stream.
#[derive(Clone)]
pub struct Sweeper {
    config: SweeperConfig,
    ledger: Ledger,
    monitor: SubscriptionMonitor,
    reconciler: Reconciler,
    events: EventBus,
}

impl Sweeper {
    pub fn new(
        config: SweeperConfig,
        ledger: Ledger,
        monitor: SubscriptionMonitor,
        reconciler: Reconciler,
        events: EventBus,
    ) -> Self {
        Self {
            config,
            ledger,
            monitor,
            reconciler,
            events,
        }
    }

    pub async fn run_once(&self, now: DateTime<Utc>) -> Result<SweepReport> {
        let mut report = SweepReport::default();

        for invoice in self.ledger.drafts().expire_overdue(now)? {
            if let Some(address) = invoice.payment_address() {
                self.monitor
                    .unsubscribe_for(address.as_str(), &invoice.id)
                    .await;
            }
            tracing::info!(invoice_id=%invoice.id, expires_at=%invoice.expires_at, "invoice expired");
            self.events.publish(MonitorEvent::InvoiceExpired {
                invoice_id: invoice.id.clone(),
            });
            report.expired.push(invoice.id);
        }

        if !self.config.poll_when_connected && self.monitor.is_connected().await {
            return Ok(report);
        }

        for invoice in self.ledger.drafts().pending()? {
            report.polled += 1;
            match self.reconciler.confirm_invoice_paid_at(&invoice, now).await {
                Ok(check) if check.confirmed => {
                    if let Some(address) = invoice.payment_address() {
                        self.monitor
                            .unsubscribe_for(address.as_str(), &invoice.id)
                            .await;
                    }
                    report.confirmed.push(invoice.id);
                }
                Ok(_) => {}
                Err(e) if e.is_business() => {
                    tracing::debug!(invoice_id=%invoice.id, error=%e, "skipping invoice during poll")
                }
                Err(e) => tracing::warn!(invoice_id=%invoice.id, error=%e, "balance poll failed"),
            }
        }
        Ok(report)
    }

    pub fn start(&self) -> SweeperHandle {
        let (stop, mut stopped) = watch::channel(false);
        let sweeper = self.clone();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(sweeper.config.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => match sweeper.run_once(Utc::now()).await {
                        Ok(report) if !report.is_quiet() => tracing::info!(
                            expired = report.expired.len(),
                            confirmed = report.confirmed.len(),
                            polled = report.polled,
                            "sweep finished"
                        ),
                        Ok(_) => {}
                        Err(e) => tracing::warn!(error=%e, "sweep failed"),
                    },
                    _ = stopped.changed() => break,
                }
            }
        });
        SweeperHandle { stop, task }
    }
}

pub struct SweeperHandle {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SweeperHandle {
    pub async fn stop(self) {
        let _ = self.stop.send(true);
        if let Err(e) = self.task.await {
            tracing::warn!(error=%e, "sweeper task ended abnormally");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subscription::MonitorConfig;
    use chrono::Duration as ChronoDuration;
    use ledger::LedgerSettings;
    use rbtc_inv_core::{Address, InvoiceForm, InvoiceStatus};
    use rpc::mock::MockChain;
    use rpc::ChainTransfer;
    use std::sync::Arc;

    const OLD_ADDR: &str = "0x00000000000000000000000000000000000000a1";
    const NEW_ADDR: &str = "0x00000000000000000000000000000000000000a2";

    struct Fixture {
        chain: Arc<MockChain>,
        ledger: Ledger,
        monitor: SubscriptionMonitor,
        events: EventBus,
        sweeper: Sweeper,
    }

    fn fixture(interval: Duration) -> Fixture {
        let chain = MockChain::new();
        let ledger = Ledger::temporary(LedgerSettings::default()).unwrap();
        let events = EventBus::default();
        let monitor = SubscriptionMonitor::new(
            MonitorConfig::new("ws://127.0.0.1:9"),
            ledger.clone(),
            events.clone(),
        )
        .unwrap();
        let reconciler = Reconciler::new(chain.clone(), ledger.clone(), events.clone());
        let sweeper = Sweeper::new(
            SweeperConfig {
                interval,
                poll_when_connected: false,
            },
            ledger.clone(),
            monitor.clone(),
            reconciler,
            events.clone(),
        );
        Fixture {
            chain,
            ledger,
            monitor,
            events,
            sweeper,
        }
    }

    fn form(code: &str, address: &str) -> InvoiceForm {
        InvoiceForm {
            client_name: "Acme".into(),
            client_code: code.into(),
            amount: "0.000000000000000500".into(),
            currency: "RBTC".into(),
            address: address.into(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn expires_overdue_and_polls_the_rest() {
        let f = fixture(Duration::from_secs(60));
        let mut rx = f.events.subscribe();
        let now = Utc::now();

        let old = f
            .ledger
            .drafts()
            .create_draft_at(&form("C-OLD", OLD_ADDR), now - ChronoDuration::hours(2))
            .unwrap();
        f.monitor.subscribe(OLD_ADDR, &old.id, Some(500), None).await;
        let fresh = f.ledger.drafts().create_draft(&form("C-NEW", NEW_ADDR)).unwrap();
        f.monitor.subscribe(NEW_ADDR, &fresh.id, Some(500), None).await;
        f.chain
            .push_transfer(ChainTransfer {
                hash: "0x01".into(),
                from: Address::parse("0x00000000000000000000000000000000000000bb").unwrap(),
                to: Address::parse(NEW_ADDR).unwrap(),
                value: 500,
                block_number: Some(3),
            })
            .await;

        let report = f.sweeper.run_once(now).await.unwrap();
        assert_eq!(report.expired, vec![old.id.clone()]);
        assert_eq!(report.polled, 1);
        assert_eq!(report.confirmed, vec![fresh.id.clone()]);

        assert!(f.monitor.subscriptions().await.is_empty());
        let old = f.ledger.drafts().get_by_id(&old.id).unwrap().unwrap();
        assert_eq!(old.status, InvoiceStatus::Expired);
        let fresh = f.ledger.drafts().get_by_id(&fresh.id).unwrap().unwrap();
        assert_eq!(fresh.status, InvoiceStatus::Paid);
        assert_eq!(rx.recv().await.unwrap().name(), "invoice_expired");

        let again = f.sweeper.run_once(now).await.unwrap();
        assert!(again.is_quiet());
        assert_eq!(again.polled, 0);
    }

    #[tokio::test]
    async fn expiry_leaves_a_reused_address_watched() {
        let f = fixture(Duration::from_secs(60));
        let now = Utc::now();
        let old = f
            .ledger
            .drafts()
            .create_draft_at(&form("C-OLD", OLD_ADDR), now - ChronoDuration::hours(2))
            .unwrap();
        f.monitor.subscribe(OLD_ADDR, &old.id, Some(500), None).await;
        let fresh = f.ledger.drafts().create_draft(&form("C-NEW", OLD_ADDR)).unwrap();
        f.monitor.subscribe(OLD_ADDR, &fresh.id, Some(500), None).await;

        let report = f.sweeper.run_once(now).await.unwrap();
        assert_eq!(report.expired, vec![old.id]);
        let subs = f.monitor.subscriptions().await;
        assert_eq!(subs.len(), 1);
        assert_eq!(subs[0].invoice_id, fresh.id);
    }

    #[tokio::test]
    async fn background_sweeps_until_stopped() {
        let f = fixture(Duration::from_millis(20));
        let mut rx = f.events.subscribe();
        f.ledger
            .drafts()
            .create_draft_at(
                &form("C-OLD", OLD_ADDR),
                Utc::now() - ChronoDuration::hours(2),
            )
            .unwrap();

        let handle = f.sweeper.start();
        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.name(), "invoice_expired");
        handle.stop().await;
    }
}
