//! One-retry wrapper around any LLM client.
//!
//! A transient provider failure (timeout, 5xx, dropped connection) gets a
//! single retry after a jittered backoff. The second failure propagates;
//! the caller decides what the conversation does next.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tracing::warn;

use switchboard_core::error::Result;

use crate::{Completion, CompletionRequest, LlmClient};

pub struct RetryClient {
    inner: Arc<dyn LlmClient>,
    backoff: Duration,
}

impl RetryClient {
    pub fn new(inner: Arc<dyn LlmClient>, backoff: Duration) -> Self {
        Self { inner, backoff }
    }

    /// Base backoff plus up to 50% jitter.
    fn jittered_backoff(&self) -> Duration {
        let base = self.backoff.as_millis() as u64;
        let jitter = rand::rng().random_range(0..=base / 2);
        Duration::from_millis(base + jitter)
    }
}

#[async_trait]
impl LlmClient for RetryClient {
    fn id(&self) -> &str {
        self.inner.id()
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<Completion> {
        let first_err = match self.inner.complete(request).await {
            Ok(completion) => return Ok(completion),
            Err(e) => e,
        };

        let delay = self.jittered_backoff();
        warn!(
            provider = %self.inner.id(),
            error = %first_err,
            delay_ms = delay.as_millis() as u64,
            "LLM call failed; retrying once"
        );
        tokio::time::sleep(delay).await;

        self.inner.complete(request).await.map_err(|second_err| {
            warn!(provider = %self.inner.id(), error = %second_err, "Retry failed");
            second_err
        })
    }
}
