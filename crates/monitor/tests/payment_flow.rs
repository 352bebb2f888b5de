use chrono::Utc;
use ledger::{Ledger, LedgerSettings};
use monitor::{
    ChainWriteIntent, EventBus, MonitorConfig, MonitorEvent, PaymentService, Reconciler,
    SubscriptionMonitor, Sweeper, SweeperConfig,
};
use rbtc_inv_core::{Address, InvoiceForm, InvoiceStatus, TxStatus};
use rpc::mock::MockChain;
use rpc::ChainTransfer;
use std::sync::Arc;
use tokio::sync::broadcast;

const MERCHANT: &str = "0x1111111111111111111111111111111111111111";
const PAY_TO: &str = "0x2222222222222222222222222222222222222222";
const PAYER: &str = "0x3333333333333333333333333333333333333333";

struct Harness {
    chain: Arc<MockChain>,
    service: PaymentService,
    sweeper: Sweeper,
}

fn harness() -> Harness {
    let chain = MockChain::new();
    let ledger = Ledger::temporary(LedgerSettings::default()).unwrap();
    let events = EventBus::default();
    let monitor = SubscriptionMonitor::new(
        MonitorConfig::new("ws://127.0.0.1:9"),
        ledger.clone(),
        events.clone(),
    )
    .unwrap();
    let service = PaymentService::new(chain.clone(), ledger.clone(), monitor.clone(), events.clone());
    let sweeper = Sweeper::new(
        SweeperConfig::default(),
        ledger,
        monitor,
        Reconciler::new(chain.clone(), service.ledger().clone(), events.clone()),
        events,
    );
    Harness {
        chain,
        service,
        sweeper,
    }
}

fn form(code: &str) -> InvoiceForm {
    InvoiceForm {
        client_name: "Satoshi Supplies".into(),
        client_code: code.into(),
        amount: "0.0001".into(),
        currency: "RBTC".into(),
        description: Some("hardware wallet".into()),
        address: MERCHANT.into(),
        pay_to_address: Some(PAY_TO.into()),
        ..Default::default()
    }
}

fn names(rx: &mut broadcast::Receiver<MonitorEvent>) -> Vec<&'static str> {
    let mut out = Vec::new();
    while let Ok(e) = rx.try_recv() {
        out.push(e.name());
    }
    out
}

#[tokio::test]
async fn streamed_payment_is_detected_and_confirmed() {
    let h = harness();
    let mut rx = h.service.subscribe_events();
    let invoice = h.service.create_invoice(form("SS-1"), None).await.unwrap();
    assert_eq!(invoice.requested_amount, 100_000_000_000_000);

    let monitor = h.service.monitor();
    monitor
        .handle_text(&format!(
            r#"{{"type":"transaction","address":"{PAY_TO}","hash":"0xDEAD","from":"{PAYER}","value":"0x5af3107a4000","blockNumber":"0x10"}}"#
        ))
        .await;
    monitor.handle_text(r#"{"type":"new_block","height":16}"#).await;

    let stored = h.service.ledger().drafts().get_by_id(&invoice.id).unwrap().unwrap();
    assert_eq!(stored.status, InvoiceStatus::Paid);
    assert_eq!(stored.observed_amount, Some(100_000_000_000_000));

    let tx = h.service.ledger().transactions().get("0xdead").unwrap().unwrap();
    assert_eq!(tx.status, TxStatus::Confirmed);
    assert_eq!(tx.confirmations, 1);

    assert_eq!(
        names(&mut rx),
        vec![
            "chain_write_requested",
            "payment_detected",
            "chain_write_requested",
            "payment_confirmed"
        ]
    );
}

#[tokio::test]
async fn degraded_stream_falls_back_to_polling() {
    let h = harness();
    let invoice = h.service.create_invoice(form("SS-2"), None).await.unwrap();

    // The push never arrives; the funds show up in the log history only.
    h.chain
        .push_transfer(ChainTransfer {
            hash: "0xbeef".into(),
            from: Address::parse(PAYER).unwrap(),
            to: Address::parse(PAY_TO).unwrap(),
            value: 100_000_000_000_000,
            block_number: Some(20),
        })
        .await;

    let report = h.sweeper.run_once(Utc::now()).await.unwrap();
    assert_eq!(report.confirmed, vec![invoice.id.clone()]);

    let stored = h.service.ledger().drafts().get_by_id(&invoice.id).unwrap().unwrap();
    assert_eq!(stored.status, InvoiceStatus::Paid);
    let tx = stored.payment_tx.unwrap();
    assert!(tx.starts_with("local-"));
    assert!(!h.service.monitor().is_subscribed(PAY_TO).await);
    let counted = h.service.ledger().transactions().get("0xbeef").unwrap().unwrap();
    assert_eq!(counted.invoice_id, invoice.id);

    // A late push for the same invoice is ignored.
    h.service
        .monitor()
        .handle_text(&format!(
            r#"{{"type":"transaction","address":"{PAY_TO}","hash":"0xbeef","value":"100000000000000"}}"#
        ))
        .await;
    assert_eq!(h.service.ledger().transactions().list().unwrap().len(), 2);
}

#[tokio::test]
async fn receipt_round_trip_for_intents() {
    let h = harness();
    let mut rx = h.service.subscribe_events();
    let invoice = h.service.create_invoice(form("SS-3"), None).await.unwrap();

    let intent = match rx.recv().await.unwrap() {
        MonitorEvent::ChainWriteRequested { intent } => intent,
        other => panic!("unexpected {other:?}"),
    };
    let client_code = match &intent {
        ChainWriteIntent::CreateInvoice { client_code, .. } => client_code.clone(),
        other => panic!("unexpected {other:?}"),
    };
    let synced = h.service.apply_chain_receipt(&client_code, 7, "0xfeed").unwrap();
    assert_eq!(synced.id, invoice.id);
    assert_eq!(synced.chain_id, Some(7));
    assert!(!synced.sync_pending);
}
