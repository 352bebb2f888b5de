use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

const APP_NAME: &str = "rbtc-invoice-monitor";
const KEYCHAIN_SERVICE: &str = "rbtc.invoice.credentials";

/// Keychain entry holding the RPC provider's API key.
pub const RPC_API_KEY_SECRET: &str = "rpc_api_key";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub rpc: RpcSettings,
    #[serde(default)]
    pub stream: StreamSettings,
    #[serde(default)]
    pub invoices: InvoiceSettings,
    #[serde(default)]
    pub storage: StorageSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcSettings {
    #[serde(default = "default_rpc_kind")]
    pub kind: String, // "mock" | "http"
    #[serde(default)]
    pub primary_url: Option<String>,
    #[serde(default)]
    pub fallback_url: Option<String>,
    /// Token contract whose `Transfer` logs are summed as payment history.
    #[serde(default)]
    pub asset_contract: Option<String>,
    #[serde(default = "default_log_window")]
    pub log_window: u64,
    #[serde(default = "default_lookback_blocks")]
    pub lookback_blocks: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_total_timeout_secs")]
    pub total_timeout_secs: u64,
}

impl Default for RpcSettings {
    fn default() -> Self {
        Self {
            kind: default_rpc_kind(),
            primary_url: None,
            fallback_url: None,
            asset_contract: None,
            log_window: default_log_window(),
            lookback_blocks: default_lookback_blocks(),
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            request_timeout_secs: default_request_timeout_secs(),
            total_timeout_secs: default_total_timeout_secs(),
        }
    }
}

impl RpcSettings {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn total_timeout(&self) -> Duration {
        Duration::from_secs(self.total_timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamSettings {
    /// `ws://` or `wss://` endpoint; without one only balance polling runs.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,
    #[serde(default = "default_reconnect_base_ms")]
    pub reconnect_base_ms: u64,
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            url: None,
            heartbeat_secs: default_heartbeat_secs(),
            reconnect_base_ms: default_reconnect_base_ms(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
        }
    }
}

impl StreamSettings {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs)
    }

    pub fn reconnect_base_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_base_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvoiceSettings {
    #[serde(default = "default_expiry_minutes")]
    pub expiry_minutes: i64,
    #[serde(default = "default_retention_days")]
    pub retention_days: i64,
    #[serde(default = "default_sweep_secs")]
    pub sweep_secs: u64,
    #[serde(default)]
    pub poll_when_connected: bool,
    #[serde(default = "default_check_timeout_secs")]
    pub check_timeout_secs: u64,
}

impl Default for InvoiceSettings {
    fn default() -> Self {
        Self {
            expiry_minutes: default_expiry_minutes(),
            retention_days: default_retention_days(),
            sweep_secs: default_sweep_secs(),
            poll_when_connected: false,
            check_timeout_secs: default_check_timeout_secs(),
        }
    }
}

impl InvoiceSettings {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_secs)
    }

    pub fn check_timeout(&self) -> Duration {
        Duration::from_secs(self.check_timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageSettings {
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
    /// JSON-lines audit trail; disabled when unset.
    #[serde(default = "default_audit_log")]
    pub audit_log: Option<PathBuf>,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            audit_log: default_audit_log(),
        }
    }
}

fn default_rpc_kind() -> String {
    "mock".to_string()
}
fn default_log_window() -> u64 {
    2_000
}
fn default_lookback_blocks() -> u64 {
    10_000
}
fn default_max_retries() -> u32 {
    2
}
fn default_base_delay_ms() -> u64 {
    1_000
}
fn default_request_timeout_secs() -> u64 {
    10
}
fn default_total_timeout_secs() -> u64 {
    30
}
fn default_heartbeat_secs() -> u64 {
    30
}
fn default_reconnect_base_ms() -> u64 {
    5_000
}
fn default_max_reconnect_attempts() -> u32 {
    10
}
fn default_expiry_minutes() -> i64 {
    60
}
fn default_retention_days() -> i64 {
    30
}
fn default_sweep_secs() -> u64 {
    60
}
fn default_check_timeout_secs() -> u64 {
    60
}
fn default_db_path() -> PathBuf {
    PathBuf::from("data/ledger")
}
fn default_audit_log() -> Option<PathBuf> {
    Some(PathBuf::from("data/audit.jsonl"))
}

impl AppConfig {
    /// Reject settings the services cannot start with.
    pub fn validate(&self) -> Result<()> {
        match self.rpc.kind.as_str() {
            "mock" => {}
            "http" => {
                if self.rpc.primary_url.as_deref().map_or(true, str::is_empty) {
                    bail!("rpc.primary_url is required for the http provider");
                }
            }
            other => bail!("unknown rpc.kind {other:?}, expected \"mock\" or \"http\""),
        }
        if let Some(url) = &self.stream.url {
            if !(url.starts_with("ws://") || url.starts_with("wss://")) {
                bail!("stream.url must start with ws:// or wss://");
            }
        }
        if let Some(contract) = &self.rpc.asset_contract {
            let hex = contract.strip_prefix("0x").unwrap_or_default();
            if hex.len() != 40 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
                bail!("rpc.asset_contract must be a 0x-prefixed 20-byte address");
            }
        }
        if self.rpc.log_window == 0 {
            bail!("rpc.log_window must be positive");
        }
        if self.invoices.expiry_minutes <= 0 || self.invoices.retention_days <= 0 {
            bail!("invoice expiry and retention must be positive");
        }
        Ok(())
    }
}

pub fn load() -> Result<AppConfig> {
    let cfg: AppConfig = confy::load(APP_NAME, None).context("Failed to load app config")?;
    Ok(cfg)
}

pub fn store(cfg: &AppConfig) -> Result<()> {
    confy::store(APP_NAME, None, cfg).context("Failed to store app config")?;
    Ok(())
}

pub fn load_from(path: &Path) -> Result<AppConfig> {
    let cfg: AppConfig = confy::load_path(path)
        .with_context(|| format!("Failed to load config from {}", path.display()))?;
    Ok(cfg)
}

pub fn store_to(path: &Path, cfg: &AppConfig) -> Result<()> {
    confy::store_path(path, cfg)
        .with_context(|| format!("Failed to store config to {}", path.display()))?;
    Ok(())
}

/// Where [`load`] reads from.
pub fn config_path() -> Result<PathBuf> {
    confy::get_configuration_file_path(APP_NAME, None).context("Failed to resolve config path")
}

/// Store a secret in the OS keychain
pub fn store_secret(key: &str, value: &str) -> Result<()> {
    let entry = keyring::Entry::new(KEYCHAIN_SERVICE, key)?;
    entry.set_password(value)?;
    Ok(())
}

/// Retrieve a secret from the OS keychain
pub fn get_secret(key: &str) -> Result<String> {
    let entry = keyring::Entry::new(KEYCHAIN_SERVICE, key)?;
    let password = entry.get_password()?;
    Ok(password)
}

pub fn delete_secret(key: &str) -> Result<()> {
    let entry = keyring::Entry::new(KEYCHAIN_SERVICE, key)?;
    entry.delete_password()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_usable() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.rpc.kind, "mock");
        assert_eq!(cfg.rpc.log_window, 2_000);
        assert_eq!(cfg.rpc.total_timeout(), Duration::from_secs(30));
        assert_eq!(cfg.stream.reconnect_base_delay(), Duration::from_secs(5));
        assert_eq!(cfg.stream.max_reconnect_attempts, 10);
        assert_eq!(cfg.invoices.expiry_minutes, 60);
        cfg.validate().unwrap();
    }

    #[test]
    fn missing_sections_fall_back_to_defaults() {
        let cfg: AppConfig =
            serde_json::from_str(r#"{"rpc":{"kind":"http","primary_url":"https://node"}}"#).unwrap();
        assert_eq!(cfg.rpc.max_retries, 2);
        assert_eq!(cfg.invoices.retention_days, 30);
        assert!(cfg.stream.url.is_none());
        cfg.validate().unwrap();
    }

    #[test]
    fn validate_catches_bad_settings() {
        let mut cfg = AppConfig::default();
        cfg.rpc.kind = "http".into();
        assert!(cfg.validate().is_err());

        let mut cfg = AppConfig::default();
        cfg.stream.url = Some("https://node".into());
        assert!(cfg.validate().is_err());

        let mut cfg = AppConfig::default();
        cfg.rpc.kind = "grpc".into();
        assert!(cfg.validate().is_err());

        let mut cfg = AppConfig::default();
        cfg.rpc.asset_contract = Some("0x1234".into());
        assert!(cfg.validate().is_err());
        cfg.rpc.asset_contract = Some(format!("0x{}", "ab".repeat(20)));
        cfg.validate().unwrap();
    }

    #[test]
    fn store_and_load_round_trip_through_a_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("monitor.toml");
        let mut cfg = AppConfig::default();
        cfg.stream.url = Some("wss://stream.example".into());
        cfg.invoices.sweep_secs = 15;

        store_to(&path, &cfg).unwrap();
        assert_eq!(load_from(&path).unwrap(), cfg);
    }
}
