use crate::chain::{Plugin, RequestHandler};
use crate::config::{ExponentialBackoff, RetryConfig};
use crate::error::HttpError;
use crate::message::{Request, Response, clone_request};
use crate::promise::Promise;
use rand::Rng;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Decides whether a failed attempt is worth retrying.
pub type ErrorDecider = Arc<dyn Fn(&Request, &HttpError) -> bool + Send + Sync>;
/// Delay before the retry following failed attempt number `attempt` (0-based).
pub type ErrorDelay = Arc<dyn Fn(&Request, &HttpError, usize) -> Duration + Send + Sync>;
/// Decides whether a response should be treated as a failed attempt.
pub type ResponseDecider = Arc<dyn Fn(&Request, &Response) -> bool + Send + Sync>;
/// Delay before retrying after an error response.
pub type ResponseDelay = Arc<dyn Fn(&Request, &Response, usize) -> Duration + Send + Sync>;

static NEXT_RETRY_PLUGIN: AtomicU64 = AtomicU64::new(1);

/// Attempt counters of one dispatch, per retry plugin instance.
#[derive(Debug, Clone, Default)]
struct RetryCounters(HashMap<u64, usize>);

/// Calculate backoff duration for a given attempt.
///
/// Non-finite or negative inputs are sanitized; the result never exceeds
/// `backoff.max` (itself capped at one day).
#[must_use]
pub fn calculate_backoff(backoff: &ExponentialBackoff, attempt: usize) -> Duration {
    const MAX_BACKOFF_SECS: f64 = 86_400.0;

    let attempt = i32::try_from(attempt).unwrap_or(i32::MAX);

    let multiplier = if backoff.multiplier.is_finite() && backoff.multiplier >= 0.0 {
        backoff.multiplier
    } else {
        1.0
    };
    let initial_secs = backoff.initial.as_secs_f64();
    let max_secs = backoff.max.as_secs_f64().min(MAX_BACKOFF_SECS);

    let base = initial_secs * multiplier.powi(attempt);
    let clamped = if base.is_finite() {
        base.clamp(0.0, max_secs)
    } else {
        max_secs
    };
    let duration = Duration::from_secs_f64(clamped);

    let duration = if backoff.jitter {
        let jitter_factor = rand::rng().random_range(0.0..=0.25);
        duration + duration.mul_f64(jitter_factor)
    } else {
        duration
    };

    duration.min(Duration::from_secs_f64(max_secs))
}

/// Re-sends failed requests.
///
/// A failure is retried while the attempt counter is below `retries` and
/// the decider agrees. A decider refusal ends the request immediately
/// without consuming budget. Error responses (5xx by default) count as
/// failures too, but once the budget is spent the last response is
/// returned as-is.
#[derive(Clone)]
pub struct RetryPlugin {
    id: u64,
    retries: usize,
    error_decider: ErrorDecider,
    error_delay: ErrorDelay,
    response_decider: ResponseDecider,
    response_delay: ResponseDelay,
}

impl RetryPlugin {
    #[must_use]
    pub fn new(config: RetryConfig) -> Self {
        let error_backoff = config.backoff.clone();
        let response_backoff = config.backoff;
        Self {
            id: NEXT_RETRY_PLUGIN.fetch_add(1, Ordering::Relaxed),
            retries: config.retries,
            error_decider: Arc::new(|_, _| true),
            error_delay: Arc::new(move |_, _, attempt| calculate_backoff(&error_backoff, attempt)),
            response_decider: Arc::new(|_, response| response.status().is_server_error()),
            response_delay: Arc::new(move |_, _, attempt| calculate_backoff(&response_backoff, attempt)),
        }
    }

    /// Only retry network failures (connect, resolve, TLS, timeout).
    #[must_use]
    pub fn network_only(config: RetryConfig) -> Self {
        Self::new(config).with_error_decider(|_, error| error.is_network())
    }

    #[must_use]
    pub fn with_error_decider(
        mut self,
        decider: impl Fn(&Request, &HttpError) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.error_decider = Arc::new(decider);
        self
    }

    #[must_use]
    pub fn with_error_delay(
        mut self,
        delay: impl Fn(&Request, &HttpError, usize) -> Duration + Send + Sync + 'static,
    ) -> Self {
        self.error_delay = Arc::new(delay);
        self
    }

    #[must_use]
    pub fn with_response_decider(
        mut self,
        decider: impl Fn(&Request, &Response) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.response_decider = Arc::new(decider);
        self
    }

    #[must_use]
    pub fn with_response_delay(
        mut self,
        delay: impl Fn(&Request, &Response, usize) -> Duration + Send + Sync + 'static,
    ) -> Self {
        self.response_delay = Arc::new(delay);
        self
    }

    fn attempts(&self, next: &RequestHandler) -> usize {
        next.with_state(|counters: &mut RetryCounters| counters.0.get(&self.id).copied().unwrap_or(0))
    }

    fn increment(&self, next: &RequestHandler) {
        next.with_state(|counters: &mut RetryCounters| *counters.0.entry(self.id).or_insert(0) += 1);
    }

    fn clear(&self, next: &RequestHandler) {
        next.with_state(|counters: &mut RetryCounters| {
            counters.0.remove(&self.id);
        });
    }
}

impl Default for RetryPlugin {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}

impl Plugin for RetryPlugin {
    fn process(&self, request: Request, next: RequestHandler) -> Promise {
        let this = self.clone();
        // The first attempt is dispatched right away so batching transports
        // see it before the promise is polled.
        let mut pending = next.handle(clone_request(&request));
        Promise::new(async move {
            loop {
                let outcome = pending.await;
                let attempt = this.attempts(&next);

                let delay = match &outcome {
                    Ok(response) => {
                        if attempt >= this.retries || !(this.response_decider)(&request, response) {
                            this.clear(&next);
                            return outcome;
                        }
                        (this.response_delay)(&request, response, attempt)
                    }
                    Err(error) => {
                        if attempt >= this.retries {
                            tracing::debug!(chain = %next.chain_id(), attempts = attempt + 1, error = %error, "retries exhausted");
                            this.clear(&next);
                            return outcome;
                        }
                        if !(this.error_decider)(&request, error) {
                            tracing::debug!(chain = %next.chain_id(), error = %error, "failure not retryable");
                            this.clear(&next);
                            return outcome;
                        }
                        (this.error_delay)(&request, error, attempt)
                    }
                };

                tracing::debug!(
                    chain = %next.chain_id(),
                    retry = attempt + 1,
                    max_retries = this.retries,
                    backoff_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    method = %request.method(),
                    uri = %request.uri(),
                    "retrying request"
                );
                tokio::time::sleep(delay).await;
                this.increment(&next);
                pending = next.handle(clone_request(&request));
            }
        })
    }
}
