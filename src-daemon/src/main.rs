mod commands;

use clap::{Args, Parser, Subcommand};
use config::AppConfig;
use rpc::http::{HttpRpcClient, HttpRpcConfig, RetryPolicy};
use rpc::mock::MockChain;
use rbtc_inv_core::Address;
use rpc::ChainRpc;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "rbtc-invoice-daemon", version, about = "Detects and reconciles rBTC invoice payments")]
struct Cli {
    /// Read settings from this file instead of the per-user config.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Watch pending invoices until interrupted.
    Watch,
    /// Create a draft invoice and start watching its address.
    Create(CreateArgs),
    /// List draft invoices.
    List {
        /// Only show invoices with this status.
        #[arg(long)]
        status: Option<String>,
        /// List detected transactions instead.
        #[arg(long)]
        transactions: bool,
    },
    /// Check the chain now and mark the invoice paid if funds arrived.
    Confirm { id: String },
    Cancel { id: String },
    /// Apply a chain-write receipt to the draft with this client code.
    Receipt {
        client_code: String,
        chain_id: u64,
        tx_hash: String,
    },
    /// Delete drafts past the retention horizon.
    Prune,
    #[command(subcommand)]
    Config(ConfigCommand),
}

#[derive(Args)]
pub struct CreateArgs {
    #[arg(long)]
    pub client_name: String,
    #[arg(long)]
    pub client_code: String,
    /// Human amount, e.g. 0.0025
    #[arg(long)]
    pub amount: String,
    #[arg(long, default_value = "RBTC")]
    pub currency: String,
    #[arg(long)]
    pub description: Option<String>,
    /// Merchant's primary address.
    #[arg(long)]
    pub address: String,
    #[arg(long)]
    pub pay_to: Option<String>,
}

#[derive(Subcommand)]
pub enum ConfigCommand {
    Show,
    Path,
    /// Store the RPC API key in the OS keychain.
    SetApiKey { key: String },
    ClearApiKey,
}

fn init_tracing() {
    let env_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(env_filter))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn create_rpc_client(cfg: &AppConfig) -> anyhow::Result<Arc<dyn ChainRpc>> {
    match cfg.rpc.kind.as_str() {
        "http" => {
            let primary_url = cfg
                .rpc
                .primary_url
                .clone()
                .ok_or_else(|| anyhow::anyhow!("RPC primary_url not configured"))?;

            let mut http = HttpRpcConfig::new(primary_url);
            http.fallback_url = cfg.rpc.fallback_url.clone();
            http.log_window = cfg.rpc.log_window;
            http.lookback_blocks = cfg.rpc.lookback_blocks;
            http.asset_contract = cfg
                .rpc
                .asset_contract
                .as_deref()
                .map(Address::parse)
                .transpose()?;
            if http.asset_contract.is_none() {
                tracing::warn!("no rpc.asset_contract set, payments without a balance snapshot cannot be confirmed from history");
            }
            http.retry = RetryPolicy {
                max_retries: cfg.rpc.max_retries,
                base_delay: cfg.rpc.base_delay(),
                request_timeout: cfg.rpc.request_timeout(),
                total_timeout: cfg.rpc.total_timeout(),
            };

            // API key from env or keychain; public nodes need none
            if let Ok(api_key) = std::env::var("RBTC_RPC_API_KEY")
                .or_else(|_| config::get_secret(config::RPC_API_KEY_SECRET))
            {
                tracing::info!("Using HTTP RPC with API key auth");
                http.api_key = Some(api_key);
            } else {
                tracing::info!("Using HTTP RPC without auth");
            }
            Ok(HttpRpcClient::new(http)?)
        }
        _ => {
            tracing::info!("Using mock chain");
            Ok(MockChain::new())
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let cfg = match &cli.config {
        Some(path) => config::load_from(path)?,
        None => config::load().unwrap_or_else(|e| {
            tracing::warn!(error=%e, "falling back to default config");
            AppConfig::default()
        }),
    };
    cfg.validate()?;

    commands::run(cli.command, cfg).await
}
