use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use arbiter_types::{RetryPolicy, UsageTotals};

pub mod mock;
pub mod openrouter;

pub use mock::MockBackend;
pub use openrouter::OpenRouterBackend;

#[derive(Debug, Clone)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CallOptions {
    pub retry: RetryPolicy,
    pub signal: CancellationToken,
}

#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    /// Decode parameters merged into the wire payload (temperature, top_p, ...).
    pub params: BTreeMap<String, f64>,
    pub options: CallOptions,
}

#[derive(Debug, Clone)]
pub struct CallSuccess {
    pub actual_model: Option<String>,
    pub content: String,
    pub request_payload: Value,
    pub response_body: Value,
    pub usage: Option<UsageTotals>,
    pub latency_ms: u64,
    pub retry_count: u32,
}

#[derive(Debug, Clone)]
pub struct EmbedRequest {
    pub model: String,
    pub text: String,
    pub options: CallOptions,
}

#[derive(Debug, Clone)]
pub struct EmbedSuccess {
    pub vector: Vec<f32>,
    pub model: String,
    pub generation_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureCode {
    Network,
    Http,
    Timeout,
    ModelUnavailable,
    Cancelled,
    BadResponse,
}

impl FailureCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureCode::Network => "network",
            FailureCode::Http => "http",
            FailureCode::Timeout => "timeout",
            FailureCode::ModelUnavailable => "model_unavailable",
            FailureCode::Cancelled => "cancelled",
            FailureCode::BadResponse => "bad_response",
        }
    }
}

/// Terminal outcome of a backend call after the retry policy is exhausted.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{}: {message}", .code.as_str())]
pub struct BackendFailure {
    pub code: FailureCode,
    pub message: String,
    pub retryable: bool,
    pub model_unavailable: bool,
    pub retry_count: u32,
    pub latency_ms: Option<u64>,
}

impl BackendFailure {
    pub fn new(code: FailureCode, message: impl Into<String>, retryable: bool) -> Self {
        Self {
            code,
            message: message.into(),
            retryable,
            model_unavailable: code == FailureCode::ModelUnavailable,
            retry_count: 0,
            latency_ms: None,
        }
    }

    pub fn cancelled() -> Self {
        Self::new(FailureCode::Cancelled, "call cancelled by signal", false)
    }
}

/// Chat-completion and embedding backend. Implementations must be pure with
/// respect to runner state: everything they need arrives in the request.
#[async_trait]
pub trait Backend: Send + Sync {
    fn name(&self) -> &str;
    async fn chat(&self, request: ChatRequest) -> Result<CallSuccess, BackendFailure>;
    async fn embed(&self, request: EmbedRequest) -> Result<EmbedSuccess, BackendFailure>;
}

/// Drive one attempt function under the retry policy. Backoff doubles per
/// retry and aborts early when the cancellation signal fires. Returns the
/// successful value together with the number of retries spent.
pub async fn with_retries<T, F, Fut>(
    retry: &RetryPolicy,
    signal: &CancellationToken,
    mut attempt: F,
) -> Result<(T, u32), BackendFailure>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, BackendFailure>>,
{
    let mut retry_count = 0u32;
    loop {
        if signal.is_cancelled() {
            let mut failure = BackendFailure::cancelled();
            failure.retry_count = retry_count;
            return Err(failure);
        }

        match attempt(retry_count).await {
            Ok(value) => return Ok((value, retry_count)),
            Err(failure) if failure.retryable && retry_count < retry.max_retries => {
                retry_count += 1;
                let exponent = (retry_count - 1).min(16);
                let backoff =
                    Duration::from_millis(retry.backoff_ms.saturating_mul(1u64 << exponent));
                tracing::debug!(
                    target: "arbiter.backend",
                    retry = retry_count,
                    backoff_ms = backoff.as_millis() as u64,
                    "retrying backend call: {}",
                    failure.message
                );
                tokio::select! {
                    _ = tokio::time::sleep(backoff) => {}
                    _ = signal.cancelled() => {
                        let mut cancelled = BackendFailure::cancelled();
                        cancelled.retry_count = retry_count;
                        return Err(cancelled);
                    }
                }
            }
            Err(mut failure) => {
                failure.retry_count = retry_count;
                return Err(failure);
            }
        }
    }
}
