pub mod backoff;
pub mod circuit_breaker;
pub mod config;
pub mod error;
pub mod executor;
pub mod limiter;
pub mod models;
pub mod orchestrator;
pub mod quality;
pub mod registry;
pub mod traits;
pub mod util;

#[cfg(test)]
pub(crate) mod testutil;

pub use backoff::BackoffPolicy;
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitPermit, CircuitState};
pub use config::{Budget, BudgetOverrides};
pub use error::{AppError, CircuitOpenError, ExtractError, FetchError};
pub use executor::RetryingExecutor;
pub use limiter::TokenBucketLimiter;
pub use models::{
    Execution, Operation, Outcome, OutcomeStatus, Record, TerminalOutcome, TimingSummary,
    compute_hash, record_hash,
};
pub use orchestrator::{
    OrchestrationLoop, RunEvent, RunReporter, RunResult, RunStats, TracingRunReporter,
    export_all,
};
pub use quality::{QualityAnalyzer, QualityReport, QualitySchema};
pub use registry::{TargetGuard, TargetRegistry};
pub use traits::{Exporter, Extractor, Fetcher, NullExporter};
