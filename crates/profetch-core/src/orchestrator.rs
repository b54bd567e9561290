//! Drives many operations through the executor with bounded concurrency.
//!
//! [`OrchestrationLoop::run`] consumes the loop and returns a lazy stream of
//! [`RunResult`]s in completion order. Operations sharing a target key share
//! one limiter and one breaker from the injected [`TargetRegistry`].

use std::pin::pin;
use std::sync::Arc;

use futures::{Stream, StreamExt};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::Budget;
use crate::error::AppError;
use crate::executor::RetryingExecutor;
use crate::models::{Operation, OutcomeStatus, TerminalOutcome, TimingSummary};
use crate::quality::{QualityAnalyzer, QualityReport, QualitySchema};
use crate::registry::TargetRegistry;
use crate::traits::{Exporter, Extractor, Fetcher};

/// Default threshold below which a scored record is flagged.
pub const DEFAULT_MIN_QUALITY: f64 = 0.5;

/// Final result of one operation in a run.
#[derive(Debug, Clone)]
pub struct RunResult {
    pub operation: Operation,
    pub outcome: TerminalOutcome,
    /// Present for successful operations when scoring is enabled.
    pub quality: Option<QualityReport>,
    pub timing: TimingSummary,
}

impl RunResult {
    pub fn status(&self) -> OutcomeStatus {
        self.outcome.status()
    }

    pub fn is_below_quality(&self, min_quality: f64) -> bool {
        self.quality
            .as_ref()
            .is_some_and(|report| !report.passes(min_quality))
    }
}

/// Events emitted by the loop for monitoring/logging.
#[derive(Debug, Clone)]
pub enum RunEvent<'a> {
    RunStarted {
        run_id: Uuid,
        concurrency: usize,
    },
    OperationStarted {
        run_id: Uuid,
        key: &'a str,
        target_key: &'a str,
    },
    OperationFinished {
        run_id: Uuid,
        result: &'a RunResult,
    },
    LowQuality {
        run_id: Uuid,
        key: &'a str,
        score: f64,
        min_quality: f64,
    },
}

/// Trait for receiving run events (decoupled logging).
pub trait RunReporter: Send + Sync {
    fn report(&self, event: RunEvent<'_>) {
        let _ = event;
    }
}

/// Reporter that uses the `tracing` crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingRunReporter;

impl RunReporter for TracingRunReporter {
    fn report(&self, event: RunEvent<'_>) {
        match event {
            RunEvent::RunStarted {
                run_id,
                concurrency,
            } => {
                tracing::info!(%run_id, concurrency, "Run started");
            }
            RunEvent::OperationStarted {
                run_id,
                key,
                target_key,
            } => {
                tracing::debug!(%run_id, %key, %target_key, "Operation started");
            }
            RunEvent::OperationFinished { run_id, result } => {
                let key = result.operation.key();
                let status = result.status();
                let attempts = result.timing.attempts;
                let elapsed_ms = result.timing.elapsed.as_millis();
                match &result.outcome {
                    TerminalOutcome::Success(_) => {
                        let score = result.quality.as_ref().map(|q| q.overall_score);
                        tracing::info!(
                            %run_id, %key, %status, attempts, %elapsed_ms, ?score,
                            "Operation finished"
                        );
                    }
                    TerminalOutcome::Cancelled => {
                        tracing::debug!(%run_id, %key, %status, attempts, "Operation cancelled");
                    }
                    other => {
                        let reason = other.reason().unwrap_or_default();
                        tracing::warn!(
                            %run_id, %key, %status, attempts, %elapsed_ms, %reason,
                            "Operation failed"
                        );
                    }
                }
            }
            RunEvent::LowQuality {
                run_id,
                key,
                score,
                min_quality,
            } => {
                tracing::warn!(%run_id, %key, score, min_quality, "Record below quality threshold");
            }
        }
    }
}

struct RunContext<F, E, R>
where
    F: Fetcher,
    E: Extractor,
{
    run_id: Uuid,
    executor: RetryingExecutor<F, E>,
    registry: TargetRegistry,
    budget: Budget,
    schema: Option<QualitySchema>,
    analyzer: QualityAnalyzer,
    min_quality: f64,
    reporter: R,
}

impl<F, E, R> RunContext<F, E, R>
where
    F: Fetcher,
    E: Extractor,
    R: RunReporter,
{
    async fn execute_one(&self, operation: Operation, cancel: &CancellationToken) -> RunResult {
        let result = if cancel.is_cancelled() {
            RunResult {
                operation,
                outcome: TerminalOutcome::Cancelled,
                quality: None,
                timing: TimingSummary::default(),
            }
        } else {
            let guard = self.registry.guard_for(&operation);
            self.reporter.report(RunEvent::OperationStarted {
                run_id: self.run_id,
                key: operation.key(),
                target_key: guard.breaker.name(),
            });

            let execution = self
                .executor
                .execute(&operation, &self.budget, &guard, cancel)
                .await;
            let timing = execution.summary();

            let quality = match (&execution.outcome, &self.schema) {
                (TerminalOutcome::Success(record), Some(schema)) => {
                    Some(self.analyzer.score(record, schema))
                }
                _ => None,
            };
            if let Some(report) = &quality
                && !report.passes(self.min_quality)
            {
                self.reporter.report(RunEvent::LowQuality {
                    run_id: self.run_id,
                    key: operation.key(),
                    score: report.overall_score,
                    min_quality: self.min_quality,
                });
            }

            RunResult {
                operation,
                outcome: execution.outcome,
                quality,
                timing,
            }
        };

        self.reporter.report(RunEvent::OperationFinished {
            run_id: self.run_id,
            result: &result,
        });
        result
    }
}

/// Runs a batch of operations with shared per-target guards.
pub struct OrchestrationLoop<F, E, R = TracingRunReporter>
where
    F: Fetcher,
    E: Extractor,
{
    executor: RetryingExecutor<F, E>,
    registry: TargetRegistry,
    budget: Budget,
    schema: Option<QualitySchema>,
    analyzer: QualityAnalyzer,
    min_quality: f64,
    reporter: R,
}

impl<F, E> OrchestrationLoop<F, E, TracingRunReporter>
where
    F: Fetcher,
    E: Extractor,
{
    /// Loop scoring successes against the built-in profile schema.
    pub fn new(executor: RetryingExecutor<F, E>, registry: TargetRegistry, budget: Budget) -> Self {
        Self {
            executor,
            registry,
            budget,
            schema: Some(QualitySchema::profile()),
            analyzer: QualityAnalyzer::default(),
            min_quality: DEFAULT_MIN_QUALITY,
            reporter: TracingRunReporter,
        }
    }
}

impl<F, E, R> OrchestrationLoop<F, E, R>
where
    F: Fetcher + 'static,
    E: Extractor + 'static,
    R: RunReporter + 'static,
{
    pub fn with_schema(mut self, schema: QualitySchema) -> Self {
        self.schema = Some(schema);
        self
    }

    /// Skip quality scoring; results carry no report.
    pub fn without_scoring(mut self) -> Self {
        self.schema = None;
        self
    }

    pub fn with_analyzer(mut self, analyzer: QualityAnalyzer) -> Self {
        self.analyzer = analyzer;
        self
    }

    pub fn with_min_quality(mut self, min_quality: f64) -> Self {
        self.min_quality = min_quality;
        self
    }

    pub fn with_reporter<R2: RunReporter + 'static>(self, reporter: R2) -> OrchestrationLoop<F, E, R2> {
        OrchestrationLoop {
            executor: self.executor,
            registry: self.registry,
            budget: self.budget,
            schema: self.schema,
            analyzer: self.analyzer,
            min_quality: self.min_quality,
            reporter,
        }
    }

    pub fn registry(&self) -> &TargetRegistry {
        &self.registry
    }

    /// Start the run. At most `budget.concurrency` operations are in flight;
    /// results arrive in completion order, one per input operation.
    ///
    /// Once `cancel` fires, in-flight operations stop at their next
    /// suspension point and operations not yet started yield `Cancelled`
    /// without touching the fetcher.
    pub fn run<I>(
        self,
        operations: I,
        cancel: CancellationToken,
    ) -> impl Stream<Item = RunResult> + Send + 'static
    where
        I: IntoIterator<Item = Operation>,
        I::IntoIter: Send + 'static,
    {
        let concurrency = self.budget.concurrency.max(1);
        let context = Arc::new(RunContext {
            run_id: Uuid::new_v4(),
            executor: self.executor,
            registry: self.registry,
            budget: self.budget,
            schema: self.schema,
            analyzer: self.analyzer,
            min_quality: self.min_quality,
            reporter: self.reporter,
        });

        context.reporter.report(RunEvent::RunStarted {
            run_id: context.run_id,
            concurrency,
        });

        futures::stream::iter(operations)
            .map(move |operation| {
                let context = Arc::clone(&context);
                let cancel = cancel.clone();
                async move { context.execute_one(operation, &cancel).await }
            })
            .buffer_unordered(concurrency)
    }
}

/// Aggregate counters for a finished run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunStats {
    pub total: u64,
    pub succeeded: u64,
    pub exhausted: u64,
    pub fatal: u64,
    pub circuit_rejected: u64,
    pub cancelled: u64,
    /// Fetch attempts across all operations.
    pub attempts: u64,
    pub below_quality: u64,
    pub breaker_trips: u64,
}

impl RunStats {
    pub fn record(&mut self, result: &RunResult, min_quality: f64) {
        self.total += 1;
        self.attempts += u64::from(result.timing.attempts);
        match result.status() {
            OutcomeStatus::Success => self.succeeded += 1,
            OutcomeStatus::Exhausted => self.exhausted += 1,
            OutcomeStatus::Fatal => self.fatal += 1,
            OutcomeStatus::CircuitRejected => self.circuit_rejected += 1,
            OutcomeStatus::Cancelled => self.cancelled += 1,
        }
        if result.is_below_quality(min_quality) {
            self.below_quality += 1;
        }
    }

    pub fn with_breaker_trips(mut self, trips: u64) -> Self {
        self.breaker_trips = trips;
        self
    }

    pub fn success_rate(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.succeeded as f64 / self.total as f64
        }
    }
}

/// Drain a result stream into `exporter`, collecting statistics.
///
/// Stops at the first export error; results already exported stay exported.
pub async fn export_all<S, X>(
    results: S,
    exporter: &mut X,
    min_quality: f64,
) -> Result<RunStats, AppError>
where
    S: Stream<Item = RunResult>,
    X: Exporter + ?Sized,
{
    let mut results = pin!(results);
    let mut stats = RunStats::default();
    while let Some(result) = results.next().await {
        stats.record(&result, min_quality);
        exporter.export(&result)?;
    }
    exporter.finish()?;
    Ok(stats)
}
