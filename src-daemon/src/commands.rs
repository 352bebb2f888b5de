use crate::{create_rpc_client, Command, ConfigCommand, CreateArgs};
use anyhow::{bail, Context, Result};
use chrono::Utc;
use config::AppConfig;
use ledger::{AuditLog, Ledger, LedgerSettings};
use monitor::{
    CheckState, EventBus, MonitorConfig, PaymentService, ReconnectPolicy, Reconciler,
    SubscriptionMonitor, Sweeper, SweeperConfig,
};
use rbtc_inv_core::parsing::format_base_units;
use rbtc_inv_core::{Invoice, InvoiceForm};
use serde::Serialize;
use std::time::Duration;

// Monitor needs a well-formed URL even when streaming is switched off.
const STREAM_DISABLED_URL: &str = "ws://127.0.0.1:0";

pub async fn run(command: Command, cfg: AppConfig) -> Result<()> {
    match command {
        Command::Watch => watch(cfg).await,
        Command::Create(args) => create(cfg, args).await,
        Command::List {
            status,
            transactions,
        } => list(cfg, status, transactions),
        Command::Confirm { id } => confirm(cfg, &id).await,
        Command::Cancel { id } => cancel(cfg, &id).await,
        Command::Receipt {
            client_code,
            chain_id,
            tx_hash,
        } => {
            let service = build_service(&cfg)?;
            let invoice = service.apply_chain_receipt(&client_code, chain_id, &tx_hash)?;
            print_json(&InvoiceRow::from(&invoice))
        }
        Command::Prune => {
            let ledger = open_ledger(&cfg)?;
            let removed = ledger.drafts().prune(Utc::now())?;
            ledger.flush()?;
            println!("pruned {removed} draft(s)");
            Ok(())
        }
        Command::Config(action) => config_command(cfg, action),
    }
}

fn open_ledger(cfg: &AppConfig) -> Result<Ledger> {
    let settings = LedgerSettings {
        expiry_window: chrono::Duration::minutes(cfg.invoices.expiry_minutes),
        retention: chrono::Duration::days(cfg.invoices.retention_days),
    };
    let audit = match &cfg.storage.audit_log {
        Some(path) => {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create {}", parent.display()))?;
            }
            AuditLog::new(path)
        }
        None => AuditLog::disabled(),
    };
    Ledger::open(&cfg.storage.db_path, settings, audit)
}

fn build_service(cfg: &AppConfig) -> Result<PaymentService> {
    let rpc = create_rpc_client(cfg)?;
    let ledger = open_ledger(cfg)?;
    let events = EventBus::default();

    let mut monitor_cfg =
        MonitorConfig::new(cfg.stream.url.as_deref().unwrap_or(STREAM_DISABLED_URL));
    monitor_cfg.heartbeat_interval = cfg.stream.heartbeat_interval();
    monitor_cfg.reconnect = ReconnectPolicy {
        base_delay: cfg.stream.reconnect_base_delay(),
        max_attempts: cfg.stream.max_reconnect_attempts,
    };
    let monitor = SubscriptionMonitor::new(monitor_cfg, ledger.clone(), events.clone())?;

    let reconciler = Reconciler::new(rpc.clone(), ledger.clone(), events.clone())
        .with_check_timeout(cfg.invoices.check_timeout());
    Ok(PaymentService::new(rpc, ledger, monitor, events).with_reconciler(reconciler))
}

async fn watch(cfg: AppConfig) -> Result<()> {
    let service = build_service(&cfg)?;
    let mut events = service.subscribe_events();
    let printer = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => match serde_json::to_string(&event) {
                    Ok(line) => println!("{line}"),
                    Err(e) => tracing::warn!(error=%e, "unprintable event"),
                },
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(skipped = n, "event printer lagged")
                }
                Err(_) => break,
            }
        }
    });

    let watched = service.resume_watching().await?;
    let streaming = cfg.stream.url.is_some();
    if streaming {
        service.monitor().start().await?;
    } else {
        tracing::warn!("no stream url configured, relying on balance polling");
    }

    let sweeper = Sweeper::new(
        SweeperConfig {
            interval: cfg.invoices.sweep_interval(),
            poll_when_connected: cfg.invoices.poll_when_connected,
        },
        service.ledger().clone(),
        service.monitor().clone(),
        service.reconciler().clone(),
        service.events().clone(),
    );
    let sweeps = sweeper.start();
    tracing::info!(watched, streaming, "watching invoices, press Ctrl+C to stop");

    tokio::select! {
        res = tokio::signal::ctrl_c() => {
            res.context("Failed to listen for Ctrl+C")?;
            tracing::info!("shutting down");
        }
        res = service.monitor().wait(), if streaming => {
            // Polling keeps going after the stream gives up.
            if let Err(e) = res {
                tracing::error!(error=%e, "payment stream unavailable, continuing with polling only");
            }
            tokio::signal::ctrl_c().await.context("Failed to listen for Ctrl+C")?;
        }
    }

    sweeps.stop().await;
    service.monitor().stop().await;
    printer.abort();
    service.ledger().flush()?;
    Ok(())
}

async fn create(cfg: AppConfig, args: CreateArgs) -> Result<()> {
    let service = build_service(&cfg)?;
    let form = InvoiceForm {
        client_name: args.client_name,
        client_code: args.client_code,
        amount: args.amount,
        currency: args.currency,
        description: args.description,
        address: args.address,
        pay_to_address: args.pay_to,
        balance_at_creation: None,
        created_block: None,
    };
    let invoice = service.create_invoice(form, None).await?;
    service.ledger().flush()?;
    print_json(&InvoiceRow::from(&invoice))
}

fn list(cfg: AppConfig, status: Option<String>, transactions: bool) -> Result<()> {
    let ledger = open_ledger(&cfg)?;
    if transactions {
        for tx in ledger.transactions().list()? {
            println!(
                "{}  {:<10} {:>24}  conf={}  invoice={}",
                tx.hash,
                format!("{:?}", tx.status).to_lowercase(),
                format_base_units(tx.amount),
                tx.confirmations,
                tx.invoice_id
            );
        }
        return Ok(());
    }

    for invoice in ledger.drafts().list_drafts()? {
        if let Some(wanted) = &status {
            if !invoice.status.as_str().eq_ignore_ascii_case(wanted) {
                continue;
            }
        }
        println!(
            "{}  {:<9} {:>24} {}  {}  expires {}",
            invoice.id,
            invoice.status.as_str(),
            format_base_units(invoice.requested_amount),
            invoice.currency,
            invoice.client_code,
            invoice.expires_at.to_rfc3339()
        );
    }
    Ok(())
}

async fn confirm(cfg: AppConfig, id: &str) -> Result<()> {
    let service = build_service(&cfg)?;
    let mut progress = service.check_invoice(id)?;
    let mut ticker = tokio::time::interval(Duration::from_secs(2));
    ticker.tick().await;

    loop {
        if progress.borrow().is_finished() {
            break;
        }
        tokio::select! {
            changed = progress.changed() => {
                if changed.is_err() {
                    bail!("payment check was abandoned");
                }
            }
            _ = ticker.tick() => eprintln!("still checking {id}..."),
        }
    }

    let state = progress.borrow().clone();
    let CheckState::Finished(result) = state else {
        bail!("payment check did not finish");
    };
    match result {
        Ok(check) if check.confirmed => {
            println!("paid: {} received", format_base_units(check.amount));
            if let Some(tx) = &check.transaction {
                println!("recorded as {}", tx.hash);
            }
        }
        Ok(check) => match check.shortfall {
            Some(shortfall) => println!("not paid yet: {shortfall}"),
            None => println!("not paid yet: nothing received"),
        },
        Err(e) if e.is_business() => println!("cannot confirm: {e}"),
        Err(e) => bail!("payment check failed: {e}"),
    }
    service.ledger().flush()?;
    Ok(())
}

async fn cancel(cfg: AppConfig, id: &str) -> Result<()> {
    let service = build_service(&cfg)?;
    let transition = service.cancel_invoice(id).await?;
    if transition.applied() {
        println!("cancelled {id}");
    } else {
        println!(
            "{id} is {} and was left unchanged",
            transition.invoice().status.as_str()
        );
    }
    service.ledger().flush()?;
    Ok(())
}

fn config_command(cfg: AppConfig, action: ConfigCommand) -> Result<()> {
    match action {
        ConfigCommand::Show => print_json(&cfg),
        ConfigCommand::Path => {
            println!("{}", config::config_path()?.display());
            Ok(())
        }
        ConfigCommand::SetApiKey { key } => {
            config::store_secret(config::RPC_API_KEY_SECRET, &key)?;
            println!("API key stored in the OS keychain");
            Ok(())
        }
        ConfigCommand::ClearApiKey => {
            config::delete_secret(config::RPC_API_KEY_SECRET)?;
            println!("API key removed");
            Ok(())
        }
    }
}

#[derive(Serialize)]
struct InvoiceRow<'a> {
    id: &'a str,
    client_code: &'a str,
    status: &'a str,
    amount: String,
    currency: &'a str,
    pay_to: String,
    expires_at: String,
    sync_pending: bool,
}

impl<'a> From<&'a Invoice> for InvoiceRow<'a> {
    fn from(inv: &'a Invoice) -> Self {
        Self {
            id: &inv.id,
            client_code: &inv.client_code,
            status: inv.status.as_str(),
            amount: format_base_units(inv.requested_amount),
            currency: &inv.currency,
            pay_to: inv
                .payment_address()
                .map(|a| a.to_string())
                .unwrap_or_default(),
            expires_at: inv.expires_at.to_rfc3339(),
            sync_pending: inv.sync_pending,
        }
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
