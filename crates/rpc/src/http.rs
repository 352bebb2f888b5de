use super::{
    scan::scan_windows,
    types::{
        decode_block, decode_quantity, JsonRpcRequest, JsonRpcResponse, RawLog, RawTransaction,
        TRANSFER_TOPIC,
    },
    ChainRpc, ChainTransaction, ChainTransfer, RpcError,
};
use async_trait::async_trait;
use rbtc_inv_core::parsing::to_quantity;
use rbtc_inv_core::{Address, BaseUnits, ValidationError};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout};

/// Retry budget for a single logical call.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Extra attempts after the first one.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub request_timeout: Duration,
    /// Upper bound on the whole call, backoff sleeps included.
    pub total_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_secs(1),
            request_timeout: Duration::from_secs(10),
            total_timeout: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt + 1`: `base * 2^attempt`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(2u32.saturating_pow(attempt))
    }
}

#[derive(Debug, Clone)]
pub struct HttpRpcConfig {
    pub primary_url: String,
    pub fallback_url: Option<String>,
    pub api_key: Option<String>,
    pub retry: RetryPolicy,
    /// Widest block range sent in one `eth_getLogs` query.
    pub log_window: u64,
    /// How far back a history scan starts when the caller gives no start block.
    pub lookback_blocks: u64,
    /// Token contract whose `Transfer` logs count as payments. History scans are
    /// refused without one.
    pub asset_contract: Option<Address>,
}

impl HttpRpcConfig {
    pub fn new(primary_url: impl Into<String>) -> Self {
        Self {
            primary_url: primary_url.into(),
            fallback_url: None,
            api_key: None,
            retry: RetryPolicy::default(),
            log_window: 2_000,
            lookback_blocks: 10_000,
            asset_contract: None,
        }
    }
}

/// JSON-RPC 2.0 client for an EVM-compatible node over HTTP.
#[derive(Clone)]
pub struct HttpRpcClient {
    config: HttpRpcConfig,
    http_client: reqwest::Client,
    next_id: Arc<AtomicU64>,
}

impl HttpRpcClient {
    pub fn new(config: HttpRpcConfig) -> Result<Arc<Self>, RpcError> {
        let http_client = reqwest::Client::builder()
            .timeout(config.retry.request_timeout)
            .tcp_keepalive(Duration::from_secs(60))
            .build()
            .map_err(|e| RpcError::Transport {
                method: "client_init".to_string(),
                message: e.to_string(),
            })?;

        Ok(Arc::new(Self {
            config,
            http_client,
            next_id: Arc::new(AtomicU64::new(rand::random::<u32>() as u64)),
        }))
    }

    pub fn config(&self) -> &HttpRpcConfig {
        &self.config
    }

    /// Call `method` on the primary node.
    pub async fn call(&self, method: &str, params: Value) -> Result<Value, RpcError> {
        self.call_at(&self.config.primary_url, method, &params).await
    }

    async fn call_at(&self, url: &str, method: &str, params: &Value) -> Result<Value, RpcError> {
        let limit = self.config.retry.total_timeout;
        match timeout(limit, self.call_with_retry(url, method, params)).await {
            Ok(result) => result,
            Err(_) => Err(RpcError::Timeout {
                method: method.to_string(),
                limit,
            }),
        }
    }

    async fn call_with_retry(
        &self,
        url: &str,
        method: &str,
        params: &Value,
    ) -> Result<Value, RpcError> {
        let mut attempt = 0;
        loop {
            match self.send_once(url, method, params).await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() && attempt < self.config.retry.max_retries => {
                    let delay = self.config.retry.delay_for(attempt);
                    tracing::warn!(
                        %method,
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "transient RPC failure, backing off"
                    );
                    sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn send_once(&self, url: &str, method: &str, params: &Value) -> Result<Value, RpcError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = JsonRpcRequest::new(id, method, params);

        let mut req = self.http_client.post(url).json(&request);
        if let Some(key) = &self.config.api_key {
            req = req.bearer_auth(key);
        }

        let resp = req.send().await.map_err(|e| {
            if e.is_timeout() {
                RpcError::Timeout {
                    method: method.to_string(),
                    limit: self.config.retry.request_timeout,
                }
            } else {
                RpcError::Transport {
                    method: method.to_string(),
                    message: e.to_string(),
                }
            }
        })?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(RpcError::Http {
                method: method.to_string(),
                status,
                body,
            });
        }

        let envelope: JsonRpcResponse = resp
            .json()
            .await
            .map_err(|e| RpcError::decode(method, e))?;

        tracing::debug!(%method, id, "rpc call completed");
        envelope.into_result(method)
    }

    async fn fetch_logs(&self, params: Value) -> Result<Vec<ChainTransfer>, RpcError> {
        let value = self.call("eth_getLogs", params).await?;
        let logs: Vec<RawLog> =
            serde_json::from_value(value).map_err(|e| RpcError::decode("eth_getLogs", e))?;

        let mut out = Vec::with_capacity(logs.len());
        for log in logs {
            match log.into_transfer() {
                Ok(transfer) => out.push(transfer),
                Err(err) => tracing::warn!(error = %err, "skipping undecodable transfer log"),
            }
        }
        Ok(out)
    }
}

fn validate_hash(hash: &str) -> Result<String, ValidationError> {
    let lower = hash.trim().to_lowercase();
    let ok = lower
        .strip_prefix("0x")
        .map(|digits| digits.len() == 64 && digits.chars().all(|c| c.is_ascii_hexdigit()))
        .unwrap_or(false);
    if ok {
        Ok(lower)
    } else {
        Err(ValidationError::InvalidHash(hash.to_string()))
    }
}

#[async_trait]
impl ChainRpc for HttpRpcClient {
    async fn get_address_balance(&self, address: &str) -> Result<BaseUnits, RpcError> {
        const METHOD: &str = "eth_getBalance";
        let address = Address::parse(address)?;
        let params = json!([address.as_str(), "latest"]);

        let value = match self.call_at(&self.config.primary_url, METHOD, &params).await {
            Ok(value) => value,
            Err(err) => match &self.config.fallback_url {
                Some(fallback) => {
                    tracing::warn!(%address, error = %err, "primary node failed, trying fallback");
                    self.call_at(fallback, METHOD, &params).await?
                }
                None => return Err(err),
            },
        };

        decode_quantity(METHOD, &value)
    }

    async fn get_address_transactions(
        &self,
        address: &str,
        from_block: Option<u64>,
    ) -> Result<Vec<ChainTransfer>, RpcError> {
        let address = Address::parse(address)?;
        let contract = self
            .config
            .asset_contract
            .as_ref()
            .ok_or(RpcError::NoAssetContract)?;
        let latest = self.get_latest_block_number().await?;
        let start = from_block.unwrap_or_else(|| latest.saturating_sub(self.config.lookback_blocks));
        let topic = address.to_topic();
        let client = self;

        let transfers = scan_windows(start, latest, self.config.log_window, move |from, to| {
            let params = json!([{
                "address": contract.as_str(),
                "fromBlock": to_quantity(from),
                "toBlock": to_quantity(to),
                "topics": [TRANSFER_TOPIC, Value::Null, topic],
            }]);
            client.fetch_logs(params)
        })
        .await;

        tracing::debug!(%address, start, latest, found = transfers.len(), "history scan finished");
        Ok(transfers.into_iter().filter(|t| t.to == address).collect())
    }

    async fn get_transaction(&self, hash: &str) -> Result<Option<ChainTransaction>, RpcError> {
        const METHOD: &str = "eth_getTransactionByHash";
        let hash = validate_hash(hash)?;
        let value = self.call(METHOD, json!([hash])).await?;
        if value.is_null() {
            return Ok(None);
        }
        let raw: RawTransaction =
            serde_json::from_value(value).map_err(|e| RpcError::decode(METHOD, e))?;
        raw.normalize().map(Some)
    }

    async fn get_latest_block_number(&self) -> Result<u64, RpcError> {
        const METHOD: &str = "eth_blockNumber";
        let value = self.call(METHOD, json!([])).await?;
        let raw = value
            .as_str()
            .ok_or_else(|| RpcError::decode(METHOD, "expected hex string"))?;
        decode_block(METHOD, raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    type Bodies = Arc<Mutex<Vec<String>>>;

    /// Minimal HTTP responder: answers the n-th request with `responses[n]`
    /// (the last entry repeats).
    async fn serve(responses: Vec<(u16, String)>) -> (String, Arc<AtomicUsize>) {
        let (url, hits, _) = serve_recording(responses).await;
        (url, hits)
    }

    /// Like [`serve`], also keeping every request body.
    async fn serve_recording(responses: Vec<(u16, String)>) -> (String, Arc<AtomicUsize>, Bodies) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        let bodies: Bodies = Arc::default();
        let recorded = Arc::clone(&bodies);

        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else { break };
                let n = counter.fetch_add(1, Ordering::SeqCst);
                let (status, body) = responses[n.min(responses.len() - 1)].clone();
                let recorded = Arc::clone(&recorded);
                tokio::spawn(async move {
                    let request = read_request(&mut socket).await;
                    recorded.lock().unwrap().push(request);
                    let reply = format!(
                        "HTTP/1.1 {} X\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                        status,
                        body.len(),
                        body
                    );
                    let _ = socket.write_all(reply.as_bytes()).await;
                    let _ = socket.shutdown().await;
                });
            }
        });

        (url, hits, bodies)
    }

    /// Reads one request and returns its body.
    async fn read_request(socket: &mut tokio::net::TcpStream) -> String {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 4096];
        loop {
            let Ok(n) = socket.read(&mut chunk).await else { return String::new() };
            if n == 0 {
                return String::new();
            }
            buf.extend_from_slice(&chunk[..n]);
            let text = String::from_utf8_lossy(&buf).to_string();
            if let Some(split) = text.find("\r\n\r\n") {
                let len = text[..split]
                    .lines()
                    .find_map(|l| {
                        let lower = l.to_ascii_lowercase();
                        lower
                            .strip_prefix("content-length:")
                            .and_then(|v| v.trim().parse::<usize>().ok())
                    })
                    .unwrap_or(0);
                if buf.len() >= split + 4 + len {
                    return text[split + 4..].to_string();
                }
            }
        }
    }

    fn fast(url: &str) -> HttpRpcConfig {
        let mut cfg = HttpRpcConfig::new(url);
        cfg.retry.base_delay = Duration::from_millis(5);
        cfg.retry.request_timeout = Duration::from_secs(2);
        cfg.retry.total_timeout = Duration::from_secs(5);
        cfg
    }

    const ADDR: &str = "0x00000000000000000000000000000000000000aa";

    #[test]
    fn backoff_doubles_from_base() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(0), Duration::from_secs(1));
        assert_eq!(policy.delay_for(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for(2), Duration::from_secs(4));
    }

    #[tokio::test]
    async fn malformed_address_never_reaches_the_node() {
        let (url, hits) = serve(vec![(200, r#"{"jsonrpc":"2.0","id":1,"result":"0x1"}"#.into())]).await;
        let client = HttpRpcClient::new(fast(&url)).unwrap();
        let err = client.get_address_balance("0x1234").await.unwrap_err();
        assert!(matches!(err, RpcError::Validation(_)));
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn retries_transient_http_failures() {
        let (url, hits) = serve(vec![
            (503, "busy".into()),
            (502, "busy".into()),
            (200, r#"{"jsonrpc":"2.0","id":1,"result":"0x3e8"}"#.into()),
        ])
        .await;
        let client = HttpRpcClient::new(fast(&url)).unwrap();
        assert_eq!(client.get_address_balance(ADDR).await.unwrap(), 1000);
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_retry_budget() {
        let (url, hits) = serve(vec![(500, "down".into())]).await;
        let client = HttpRpcClient::new(fast(&url)).unwrap();
        let err = client.get_latest_block_number().await.unwrap_err();
        assert!(matches!(err, RpcError::Http { status: 500, .. }));
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn rpc_error_is_not_retried() {
        let (url, hits) = serve(vec![(
            200,
            r#"{"jsonrpc":"2.0","id":1,"error":{"code":-32000,"message":"header not found"}}"#.into(),
        )])
        .await;
        let client = HttpRpcClient::new(fast(&url)).unwrap();
        let err = client.get_latest_block_number().await.unwrap_err();
        assert!(matches!(err, RpcError::Rpc { code: -32000, .. }));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn balance_falls_back_to_secondary_node() {
        let (primary, _) = serve(vec![(500, "down".into())]).await;
        let (secondary, hits) =
            serve(vec![(200, r#"{"jsonrpc":"2.0","id":1,"result":"0x64"}"#.into())]).await;
        let mut cfg = fast(&primary);
        cfg.fallback_url = Some(secondary);
        let client = HttpRpcClient::new(cfg).unwrap();
        assert_eq!(client.get_address_balance(ADDR).await.unwrap(), 100);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn log_scan_is_scoped_to_the_asset_contract() {
        const TOKEN: &str = "0x00000000000000000000000000000000000000cc";
        let (url, _, bodies) = serve_recording(vec![
            (200, r#"{"jsonrpc":"2.0","id":1,"result":"0x64"}"#.into()),
            (200, r#"{"jsonrpc":"2.0","id":2,"result":[]}"#.into()),
        ])
        .await;
        let mut cfg = fast(&url);
        cfg.asset_contract = Some(Address::parse(TOKEN).unwrap());
        let client = HttpRpcClient::new(cfg).unwrap();

        assert!(client.get_address_transactions(ADDR, None).await.unwrap().is_empty());

        let bodies = bodies.lock().unwrap().clone();
        assert_eq!(bodies.len(), 2);
        let request: Value = serde_json::from_str(&bodies[1]).unwrap();
        assert_eq!(request["method"], "eth_getLogs");
        let filter = &request["params"][0];
        assert_eq!(filter["address"], TOKEN);
        assert_eq!(filter["fromBlock"], "0x0");
        assert_eq!(filter["toBlock"], "0x64");
        assert_eq!(filter["topics"][0], TRANSFER_TOPIC);
        assert_eq!(filter["topics"][2], Address::parse(ADDR).unwrap().to_topic());
    }

    #[tokio::test]
    async fn history_without_asset_contract_sends_nothing() {
        let (url, hits) = serve(vec![(200, r#"{"jsonrpc":"2.0","id":1,"result":"0x64"}"#.into())]).await;
        let client = HttpRpcClient::new(fast(&url)).unwrap();
        let err = client.get_address_transactions(ADDR, None).await.unwrap_err();
        assert!(matches!(err, RpcError::NoAssetContract));
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn unknown_transaction_is_none() {
        let (url, _) = serve(vec![(200, r#"{"jsonrpc":"2.0","id":1,"result":null}"#.into())]).await;
        let client = HttpRpcClient::new(fast(&url)).unwrap();
        let hash = format!("0x{}", "ab".repeat(32));
        assert!(client.get_transaction(&hash).await.unwrap().is_none());
        assert!(matches!(
            client.get_transaction("0x12").await,
            Err(RpcError::Validation(_))
        ));
    }
}
