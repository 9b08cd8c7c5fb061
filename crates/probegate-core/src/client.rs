//! Resilient target client: timeout, jittered retry, circuit breaker.
//!
//! One top-level [`ResilientClient::call`] takes one breaker permit and
//! settles it exactly once, however many attempts it made:
//!
//! - success: `succeed`
//! - transient failure after the last attempt: `fail`
//! - non-transient rejection or cancellation: `release` (no verdict)

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::cancel::CancelToken;
use crate::circuit_breaker::CircuitBreaker;
use crate::config::RetryConfig;
use crate::error::CallError;
use crate::target::{TargetAdapter, TargetRequest, TargetResponse};

/// Successful call plus what it took to get it.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub response: TargetResponse,
    /// 1 + number of retries.
    pub attempts: u32,
    pub latency: Duration,
}

enum Step {
    Done(Result<TargetResponse, CallError>),
    Cancelled,
}

#[derive(Clone)]
pub struct ResilientClient {
    adapter: Arc<dyn TargetAdapter>,
    breaker: Arc<CircuitBreaker>,
    retry: RetryConfig,
}

impl std::fmt::Debug for ResilientClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResilientClient")
            .field("endpoint", &self.adapter.endpoint())
            .field("retry", &self.retry)
            .finish()
    }
}

impl ResilientClient {
    pub fn new(
        adapter: Arc<dyn TargetAdapter>,
        breaker: Arc<CircuitBreaker>,
        retry: RetryConfig,
    ) -> Self {
        Self {
            adapter,
            breaker,
            retry,
        }
    }

    pub fn endpoint(&self) -> &str {
        self.adapter.endpoint()
    }

    pub fn provider_id(&self) -> String {
        self.adapter.provider_id()
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub async fn call(
        &self,
        request: &TargetRequest,
        cancel: &CancelToken,
    ) -> Result<Delivery, CallError> {
        cancel.checkpoint()?;
        // Open circuit: fail before any timer starts.
        let permit = self.breaker.try_acquire()?;

        let started = Instant::now();
        let deadline = started + self.retry.total_budget();
        let mut attempts: u32 = 0;

        loop {
            if cancel.is_cancelled() {
                permit.release();
                return Err(CallError::Cancelled);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                permit.fail();
                return Err(CallError::timeout("retry budget exhausted"));
            }
            let per_attempt = self.retry.attempt_timeout().min(remaining);
            attempts += 1;

            let step = tokio::select! {
                biased;
                _ = cancel.cancelled() => Step::Cancelled,
                r = tokio::time::timeout(per_attempt, self.adapter.invoke(request)) => match r {
                    Ok(outcome) => Step::Done(outcome),
                    Err(_) => Step::Done(Err(CallError::timeout(format!(
                        "no response within {}ms",
                        per_attempt.as_millis()
                    )))),
                },
            };

            let err = match step {
                Step::Cancelled | Step::Done(Err(CallError::Cancelled)) => {
                    permit.release();
                    return Err(CallError::Cancelled);
                }
                Step::Done(Ok(response)) => {
                    permit.succeed();
                    return Ok(Delivery {
                        response,
                        attempts,
                        latency: started.elapsed(),
                    });
                }
                Step::Done(Err(e)) if !e.is_transient() => {
                    debug!(endpoint = %self.endpoint(), code = e.code(), "call rejected, not retrying");
                    permit.release();
                    return Err(e);
                }
                Step::Done(Err(e)) => e,
            };

            let retries = attempts - 1;
            if retries >= self.retry.max_retries {
                permit.fail();
                return Err(err);
            }
            let backoff = self.backoff(retries, &err);
            if Instant::now() + backoff >= deadline {
                warn!(
                    endpoint = %self.endpoint(),
                    error = %err,
                    attempt = attempts,
                    "retry budget too small for backoff, giving up"
                );
                permit.fail();
                return Err(err);
            }

            warn!(
                endpoint = %self.endpoint(),
                error = %err,
                attempt = attempts,
                max_retries = self.retry.max_retries,
                backoff_ms = backoff.as_millis() as u64,
                "retrying target call"
            );

            let cancelled = tokio::select! {
                biased;
                _ = cancel.cancelled() => true,
                _ = tokio::time::sleep(backoff) => false,
            };
            if cancelled {
                permit.release();
                return Err(CallError::Cancelled);
            }
        }
    }

    /// `min(max_delay, base * 2^retry)`, stretched to a target's Retry-After
    /// (capped at `max_delay`), plus uniform jitter.
    fn backoff(&self, retry: u32, err: &CallError) -> Duration {
        let mut delay = self.retry.backoff(retry);
        if let CallError::Transient {
            retry_after: Some(after),
            ..
        } = err
        {
            let max = Duration::from_millis(self.retry.max_delay_ms);
            delay = delay.max((*after).min(max));
        }
        let window = self.retry.jitter_window().as_millis() as u64;
        let jitter = if window == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=window)
        };
        delay + Duration::from_millis(jitter)
    }
}
