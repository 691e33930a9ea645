use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tracing::warn;

use quill_core::provider::{
    LlmProvider, ModelSpec, ProviderError, ProviderStream, StreamOptions, StreamRequest,
};

/// Retry policy for establishing a provider stream.
#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Total attempts, first try included.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            jitter_factor: 0.2,
        }
    }
}

/// Wraps a provider with bounded exponential backoff on transient errors.
///
/// - Fatal and non-retryable errors surface immediately
/// - `retry_after` hints from rate limit responses are honoured
/// - Once a stream is established, mid-stream events are never retried —
///   the turn engine owns terminal error handling
pub struct RetryProvider<P: LlmProvider> {
    inner: P,
    config: RetryConfig,
    total_retries: AtomicU64,
}

impl<P: LlmProvider> RetryProvider<P> {
    pub fn new(inner: P, config: RetryConfig) -> Self {
        Self {
            inner,
            config,
            total_retries: AtomicU64::new(0),
        }
    }

    pub fn with_defaults(inner: P) -> Self {
        Self::new(inner, RetryConfig::default())
    }

    pub fn total_retries(&self) -> u64 {
        self.total_retries.load(Ordering::Relaxed)
    }

    /// Exponential backoff with jitter, capped, unless the server suggested
    /// its own delay.
    fn retry_delay(&self, attempt: u32, suggested: Option<Duration>) -> Duration {
        if let Some(delay) = suggested {
            return delay.min(self.config.max_delay);
        }
        let exp = self.config.base_delay.as_millis() as f64 * 2.0_f64.powi(attempt as i32);
        let capped = exp.min(self.config.max_delay.as_millis() as f64);
        let jitter_range = capped * self.config.jitter_factor;
        let jitter = (random_u64() % (jitter_range as u64 * 2 + 1)) as f64 - jitter_range;
        Duration::from_millis((capped + jitter).max(50.0) as u64)
    }
}

/// Non-cryptographic xorshift random, per thread.
fn random_u64() -> u64 {
    use std::cell::Cell;
    use std::time::SystemTime;

    thread_local! {
        static STATE: Cell<u64> = Cell::new(
            SystemTime::now()
                .duration_since(SystemTime::UNIX_EPOCH)
                .unwrap_or_default()
                .as_nanos() as u64
                | 1,
        );
    }

    STATE.with(|s| {
        let mut x = s.get();
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        s.set(x);
        x
    })
}

#[async_trait]
impl<P: LlmProvider> LlmProvider for RetryProvider<P> {
    fn spec(&self) -> &ModelSpec {
        self.inner.spec()
    }

    async fn stream(
        &self,
        request: &StreamRequest,
        options: &StreamOptions,
    ) -> Result<ProviderStream, ProviderError> {
        let mut attempt = 0;
        loop {
            match self.inner.stream(request, options).await {
                Ok(stream) => return Ok(stream),
                Err(e) => {
                    attempt += 1;
                    if e.is_fatal() || !e.is_retryable() || attempt >= self.config.max_attempts {
                        return Err(e);
                    }

                    let delay = self.retry_delay(attempt - 1, e.suggested_delay());
                    self.total_retries.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        attempt,
                        max_attempts = self.config.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "provider stream failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}
