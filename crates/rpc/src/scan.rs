use crate::RpcError;
use std::future::Future;

/// Walk `[from, to]` in windows of at most `window` blocks, collecting what each
/// window yields. Providers cap the block range of a single log query, and one
/// failing window must not discard what the others found, so failures are logged
/// and skipped.
pub async fn scan_windows<T, F, Fut>(from: u64, to: u64, window: u64, mut fetch: F) -> Vec<T>
where
    F: FnMut(u64, u64) -> Fut,
    Fut: Future<Output = Result<Vec<T>, RpcError>>,
{
    let window = window.max(1);
    let mut out = Vec::new();
    let mut start = from;

    while start <= to {
        let end = start.saturating_add(window - 1).min(to);
        match fetch(start, end).await {
            Ok(mut items) => out.append(&mut items),
            Err(err) => {
                tracing::warn!(from = start, to = end, error = %err, "log window failed, skipping");
            }
        }
        if end == to {
            break;
        }
        start = end + 1;
    }

    out
}
