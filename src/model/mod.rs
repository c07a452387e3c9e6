//! Generative model boundary.
//!
//! The model itself is an external text-completion service; the engine only
//! depends on the [`ModelClient`] trait. Every call is bounded by a
//! caller-supplied timeout and is cancellable, and a failed call is retried
//! once with backoff before the orchestrator degrades or surfaces the error.
pub mod http;
pub mod mock;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Errors from the model boundary.
#[derive(Error, Debug, Clone)]
pub enum ModelError {
    #[error("request timed out")]
    Timeout,

    #[error("request cancelled")]
    Cancelled,

    #[error("rate limited")]
    RateLimited,

    #[error("malformed response: {0}")]
    Malformed(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("unexpected status {0}")]
    Status(u16),
}

/// A single completion request.
#[derive(Debug, Clone)]
pub struct ModelRequest {
    pub model: String,
    pub system: String,
    pub prompt: String,
    pub max_tokens: Option<u32>,
}

/// A complete response with token accounting for provenance.
#[derive(Debug, Clone)]
pub struct ModelResponse {
    pub text: String,
    pub prompt_tokens: usize,
    pub completion_tokens: usize,
    pub model: String,
}

/// Trait for text-completion backends.
#[async_trait]
pub trait ModelClient: Send + Sync {
    /// A human-readable name for this client.
    fn name(&self) -> &str;

    /// Send a request and get a complete response.
    async fn complete(&self, request: ModelRequest) -> Result<ModelResponse, ModelError>;
}

const RETRY_BACKOFF: Duration = Duration::from_millis(500);

/// Run a completion with timeout, cancellation, and one backoff retry.
///
/// Timeout and transport errors retry once; cancellation never retries.
pub async fn complete_with_retry(
    client: &dyn ModelClient,
    request: ModelRequest,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<ModelResponse, ModelError> {
    match complete_once(client, request.clone(), timeout, cancel).await {
        Ok(response) => Ok(response),
        Err(ModelError::Cancelled) => Err(ModelError::Cancelled),
        Err(first) => {
            warn!(
                "Model call via {} failed ({first}), retrying after backoff",
                client.name()
            );
            tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(ModelError::Cancelled),
                () = tokio::time::sleep(RETRY_BACKOFF) => {}
            }
            complete_once(client, request, timeout, cancel).await
        }
    }
}

async fn complete_once(
    client: &dyn ModelClient,
    request: ModelRequest,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<ModelResponse, ModelError> {
    // Biased polling: an already-cancelled token must win even when the
    // completion future is immediately ready, so no call is dispatched
    // after cancellation
    tokio::select! {
        biased;
        () = cancel.cancelled() => Err(ModelError::Cancelled),
        result = tokio::time::timeout(timeout, client.complete(request)) => {
            match result {
                Ok(inner) => inner,
                Err(_) => Err(ModelError::Timeout),
            }
        }
    }
}
