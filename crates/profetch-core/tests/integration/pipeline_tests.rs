use std::time::Duration;

use futures::StreamExt;
use tokio_util::sync::CancellationToken;

use profetch_core::{
    Budget, BudgetOverrides, NullExporter, Operation, OrchestrationLoop, OutcomeStatus,
    RetryingExecutor, RunResult, TargetRegistry, export_all,
};

use crate::integration::common::{HostileFetcher, JsonObjectExtractor};

fn profile_ops(host: &str, n: usize) -> Vec<Operation> {
    (0..n)
        .map(|i| Operation::from_target(format!("https://{host}/in/user-{i}")))
        .collect()
}

#[tokio::test(start_paused = true)]
async fn rate_limited_source_trips_breaker_and_recovers() {
    let budget = Budget::default()
        .with_max_attempts(3)
        .with_rate(100.0, 10)
        .with_breaker(5, Duration::from_secs(10), 1)
        .with_concurrency(3);
    budget.validate().unwrap();

    let fetcher = HostileFetcher::rate_limiting_first(5);
    let registry = TargetRegistry::new(&budget);
    let orchestration = OrchestrationLoop::new(
        RetryingExecutor::new(fetcher.clone(), JsonObjectExtractor),
        registry.clone(),
        budget.clone(),
    );

    let results: Vec<RunResult> = orchestration
        .run(profile_ops("www.example.com", 10), CancellationToken::new())
        .collect()
        .await;

    assert_eq!(results.len(), 10);
    assert!(
        results
            .iter()
            .all(|r| r.status() != OutcomeStatus::Cancelled)
    );
    assert!(
        results
            .iter()
            .all(|r| r.timing.attempts <= budget.max_attempts),
        "an operation exceeded its attempt budget"
    );
    assert!(registry.total_trips() >= 1);
    assert!(results.iter().all(|r| r.outcome.is_success()));
    assert!(fetcher.calls() >= 15);

    let mut keys: Vec<_> = results.iter().map(|r| r.operation.key().to_string()).collect();
    keys.sort();
    keys.dedup();
    assert_eq!(keys.len(), 10);
}

#[tokio::test(start_paused = true)]
async fn blocked_host_is_isolated_from_healthy_host() {
    let budget = Budget::default()
        .with_max_attempts(3)
        .with_rate(100.0, 10)
        .with_breaker(3, Duration::from_secs(600), 1)
        .with_concurrency(1);
    let fetcher = HostileFetcher::blocking_host("blocked.example");
    let registry = TargetRegistry::new(&budget);
    let orchestration = OrchestrationLoop::new(
        RetryingExecutor::new(fetcher.clone(), JsonObjectExtractor),
        registry.clone(),
        budget,
    );

    let mut operations = profile_ops("blocked.example", 4);
    operations.extend(profile_ops("healthy.example", 3));

    let statuses: Vec<_> = orchestration
        .run(operations, CancellationToken::new())
        .map(|r| r.status())
        .collect()
        .await;

    assert_eq!(
        statuses,
        vec![
            OutcomeStatus::Exhausted,
            OutcomeStatus::CircuitRejected,
            OutcomeStatus::CircuitRejected,
            OutcomeStatus::CircuitRejected,
            OutcomeStatus::Success,
            OutcomeStatus::Success,
            OutcomeStatus::Success,
        ]
    );
    // Three attempts on the blocked host, then only the healthy host is fetched.
    assert_eq!(fetcher.calls(), 6);
    assert_eq!(registry.total_trips(), 1);
    assert_eq!(registry.len(), 2);
}

#[tokio::test(start_paused = true)]
async fn overrides_file_drives_a_full_run() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("budget.json");
    std::fs::write(
        &path,
        r#"{"max_attempts": 2, "base_delay_ms": 50, "concurrency": 4, "tokens_per_second": 50.0}"#,
    )
    .unwrap();
    let budget = BudgetOverrides::load(&path)
        .unwrap()
        .apply(Budget::default())
        .unwrap();
    assert_eq!(budget.max_attempts, 2);
    assert_eq!(budget.concurrency, 4);

    let fetcher = HostileFetcher::rate_limiting_first(0);
    let registry = TargetRegistry::new(&budget);
    let stream = OrchestrationLoop::new(
        RetryingExecutor::new(fetcher, JsonObjectExtractor),
        registry.clone(),
        budget,
    )
    .run(profile_ops("www.example.com", 8), CancellationToken::new());

    let stats = export_all(stream, &mut NullExporter, 0.5)
        .await
        .unwrap()
        .with_breaker_trips(registry.total_trips());

    assert_eq!(stats.total, 8);
    assert_eq!(stats.succeeded, 8);
    assert_eq!(stats.attempts, 8);
    assert_eq!(stats.below_quality, 0);
    assert_eq!(stats.breaker_trips, 0);
}
