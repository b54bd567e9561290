//! Drives one operation through breaker → limiter → fetch → extract,
//! retrying transient failures with backoff.
//!
//! Circuit rejections after the first attempt do not consume an attempt:
//! the failure is about the target, not the operation. The executor waits
//! for the breaker only while the wait fits inside the remaining backoff
//! horizon, and never more than `max_attempts` times.

use std::time::Duration;

use chrono::Utc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::backoff::BackoffPolicy;
use crate::config::Budget;
use crate::error::FetchError;
use crate::models::{AttemptRecord, Execution, Operation, Outcome, TerminalOutcome};
use crate::registry::TargetGuard;
use crate::traits::{Extractor, Fetcher};

/// Map a fetch failure onto the retry taxonomy.
pub fn classify_failure(error: &FetchError) -> Outcome {
    let reason = error.to_string();
    if error.is_retryable() {
        Outcome::RetryableFailure {
            reason,
            retry_after: error.retry_after(),
        }
    } else {
        Outcome::FatalFailure { reason }
    }
}

/// Sleep unless cancelled first. Returns false on cancellation.
async fn sleep_or_cancel(duration: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        biased;
        () = cancel.cancelled() => false,
        () = tokio::time::sleep(duration) => true,
    }
}

/// Executes operations with retries, rate limiting and circuit breaking.
///
/// Generic over the external collaborators so tests can inject scripted
/// fetchers without real network calls.
pub struct RetryingExecutor<F, E>
where
    F: Fetcher,
    E: Extractor,
{
    fetcher: F,
    extractor: E,
}

impl<F, E> RetryingExecutor<F, E>
where
    F: Fetcher,
    E: Extractor,
{
    pub fn new(fetcher: F, extractor: E) -> Self {
        Self { fetcher, extractor }
    }

    /// Run `operation` to a terminal outcome.
    ///
    /// Never returns an error: every failure is folded into the
    /// [`TerminalOutcome`], with the full attempt history alongside.
    pub async fn execute(
        &self,
        operation: &Operation,
        budget: &Budget,
        guard: &TargetGuard,
        cancel: &CancellationToken,
    ) -> Execution {
        let started = Instant::now();
        let backoff = BackoffPolicy::from_budget(budget);
        let max_attempts = budget.max_attempts.max(1);
        let mut attempts: Vec<AttemptRecord> = Vec::new();
        let mut pending_delay = Duration::ZERO;
        let mut circuit_waits = 0u32;

        let finish = |outcome: TerminalOutcome, attempts: Vec<AttemptRecord>| Execution {
            outcome,
            attempts,
            elapsed: started.elapsed(),
        };

        loop {
            if cancel.is_cancelled() {
                return finish(TerminalOutcome::Cancelled, attempts);
            }

            let attempt = attempts.len() as u32 + 1;

            // 1. Breaker gate.
            let permit = match guard.breaker.acquire() {
                Ok(permit) => permit,
                Err(open) => {
                    if attempts.is_empty() {
                        tracing::info!(
                            key = %operation.key(),
                            circuit = %open.name,
                            retry_after_ms = %open.retry_after.as_millis(),
                            "Circuit open, rejecting operation"
                        );
                        return finish(
                            TerminalOutcome::CircuitRejected {
                                retry_after: open.retry_after,
                            },
                            attempts,
                        );
                    }

                    let remaining = max_attempts - attempts.len() as u32;
                    let horizon = backoff.max_delay().saturating_mul(remaining);
                    if open.retry_after > horizon || circuit_waits >= max_attempts {
                        tracing::warn!(
                            key = %operation.key(),
                            circuit = %open.name,
                            attempts = attempts.len(),
                            circuit_waits,
                            "Circuit stays open beyond the retry budget"
                        );
                        return finish(
                            TerminalOutcome::Exhausted {
                                reason: open.to_string(),
                                fatal: false,
                            },
                            attempts,
                        );
                    }

                    circuit_waits += 1;
                    let wait = open.retry_after.max(budget.base_delay);
                    tracing::debug!(
                        key = %operation.key(),
                        circuit = %open.name,
                        wait_ms = %wait.as_millis(),
                        "Circuit open mid-sequence, waiting without consuming an attempt"
                    );
                    if !sleep_or_cancel(wait, cancel).await {
                        return finish(TerminalOutcome::Cancelled, attempts);
                    }
                    pending_delay += wait;
                    continue;
                }
            };

            // 2. Rate limiter.
            let acquired = tokio::select! {
                biased;
                () = cancel.cancelled() => false,
                () = guard.limiter.acquire() => true,
            };
            if !acquired {
                guard.breaker.release(permit);
                return finish(TerminalOutcome::Cancelled, attempts);
            }

            // 3-4. Fetch and classify.
            let at = Utc::now();
            tracing::debug!(
                key = %operation.key(),
                attempt,
                max_attempts,
                "Fetching {}",
                operation.target()
            );
            let Some(outcome) = self.attempt(operation, budget, cancel).await else {
                guard.breaker.release(permit);
                return finish(TerminalOutcome::Cancelled, attempts);
            };

            // 5. Report to the breaker.
            match outcome.failure_reason() {
                None => guard.breaker.record_success(permit),
                Some(reason) => guard.breaker.record_failure(permit, reason),
            }

            attempts.push(AttemptRecord {
                attempt,
                at,
                delay_before: pending_delay,
                outcome: outcome.clone(),
            });
            pending_delay = Duration::ZERO;

            // 6. Decide.
            match outcome {
                Outcome::Success(record) => {
                    if attempt > 1 {
                        tracing::info!(
                            key = %operation.key(),
                            attempts = attempt,
                            "Succeeded after retries"
                        );
                    }
                    return finish(TerminalOutcome::Success(record), attempts);
                }
                Outcome::FatalFailure { reason } => {
                    tracing::warn!(
                        key = %operation.key(),
                        attempt,
                        error = %reason,
                        "Permanent failure, not retrying"
                    );
                    return finish(
                        TerminalOutcome::Exhausted {
                            reason,
                            fatal: true,
                        },
                        attempts,
                    );
                }
                Outcome::RetryableFailure {
                    reason,
                    retry_after,
                } => {
                    if attempt >= max_attempts {
                        tracing::warn!(
                            key = %operation.key(),
                            attempts = attempt,
                            error = %reason,
                            "Retry budget exhausted"
                        );
                        return finish(
                            TerminalOutcome::Exhausted {
                                reason,
                                fatal: false,
                            },
                            attempts,
                        );
                    }

                    let delay = backoff.delay_for(attempt, retry_after);
                    tracing::warn!(
                        key = %operation.key(),
                        attempt,
                        max_attempts,
                        error = %reason,
                        delay_ms = %delay.as_millis(),
                        "Attempt failed, retrying"
                    );
                    if !sleep_or_cancel(delay, cancel).await {
                        return finish(TerminalOutcome::Cancelled, attempts);
                    }
                    pending_delay = delay;
                }
            }
        }
    }

    /// One fetch + extract. `None` means the operation was cancelled.
    async fn attempt(
        &self,
        operation: &Operation,
        budget: &Budget,
        cancel: &CancellationToken,
    ) -> Option<Outcome> {
        let timeout = budget.request_timeout;
        let fetch = tokio::time::timeout(
            timeout,
            self.fetcher.fetch(operation.target(), timeout, cancel),
        );

        let result = tokio::select! {
            biased;
            () = cancel.cancelled() => return None,
            result = fetch => result.unwrap_or(Err(FetchError::Timeout(timeout))),
        };

        match result {
            Err(FetchError::Cancelled) => None,
            Err(error) => Some(classify_failure(&error)),
            Ok(raw) => {
                tracing::debug!(key = %operation.key(), bytes = raw.len(), "Fetched content");
                match self.extractor.extract(&raw) {
                    Ok(record) => Some(Outcome::Success(record)),
                    Err(error) => Some(Outcome::FatalFailure {
                        reason: error.to_string(),
                    }),
                }
            }
        }
    }
}
