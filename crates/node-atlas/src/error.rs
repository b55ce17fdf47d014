use backon::{ConstantBuilder, Retryable};
use solana_client::{
    client_error::{ClientError, ClientErrorKind},
    rpc_request::RpcError,
};
use std::{
    future::Future,
    sync::atomic::{AtomicUsize, Ordering},
    time::Duration,
};
use thiserror::Error;
use tracing::warn;

pub type Result<T = ()> = std::result::Result<T, Error>;

// JSON-RPC server errors for slots with no block available
const SLOT_SKIPPED: i64 = -32007;
const LONG_TERM_STORAGE_SLOT_SKIPPED: i64 = -32009;

#[derive(Debug, Error)]
pub enum Error {
    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),
    #[error("invalid geo database row {row}: {reason}")]
    GeoRow { row: usize, reason: String },
    #[error("invalid address matcher: {0}")]
    InvalidMatcher(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("rpc client error: {0}")]
    RpcClient(Box<ClientError>),
    #[error("slot {0} was skipped or is unavailable")]
    SlotSkipped(u64),
    #[error("snapshot receiver dropped")]
    SnapshotChannelClosed,
    #[error("task join error: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl From<ClientError> for Error {
    fn from(err: ClientError) -> Self {
        Error::RpcClient(Box::new(err))
    }
}

/// Whether a `getBlock` failure means the slot holds no readable block.
pub fn is_skipped_slot(err: &ClientError) -> bool {
    if let ClientErrorKind::RpcError(RpcError::RpcResponseError { code, .. }) = err.kind()
        && (*code == SLOT_SKIPPED || *code == LONG_TERM_STORAGE_SLOT_SKIPPED)
    {
        return true;
    }
    err.to_string().contains("skipped")
}

/// Runs `operation` up to `attempts` times in total, sleeping a fixed `delay`
/// between attempts. The last error is returned once attempts run out.
pub async fn with_fixed_retry<F, Fut, T>(
    operation: F,
    attempts: usize,
    delay: Duration,
    label: &'static str,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut op = operation;
    let failures = AtomicUsize::new(0);
    let backoff = ConstantBuilder::default()
        .with_delay(delay)
        .with_max_times(attempts.saturating_sub(1));

    (move || op())
        .retry(backoff)
        .notify(|err: &Error, delay: Duration| {
            let attempt = failures.fetch_add(1, Ordering::Relaxed) + 1;
            warn!(attempt, retry_in = ?delay, error = ?err, operation = label, "attempt failed");
            metrics::counter!("node_atlas_retry", "operation" => label).increment(1);
        })
        .await
}
