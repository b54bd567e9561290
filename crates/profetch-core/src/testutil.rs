//! Test utilities: mock implementations of the core traits.
//!
//! Handwritten mocks for dependency injection in unit tests.
//! Shared state sits behind `Arc` so clones handed to the executor
//! still record into the same counters the test asserts on.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::error::{ExtractError, FetchError};
use crate::models::Record;
use crate::orchestrator::{RunEvent, RunReporter};
use crate::traits::{Extractor, Fetcher};

/// A complete profile that passes the built-in quality schema.
pub const PROFILE_JSON: &str = r#"{
    "name": "Jane Doe",
    "headline": "Staff Engineer at Acme",
    "location": "Milan, Lombardy, Italy",
    "about": "I build reliable distributed systems and mentor engineers.",
    "experience": [{"title": "Staff Engineer", "company": "Acme"}],
    "education": [{"school": "Politecnico di Milano"}],
    "skills": ["Rust", "Distributed Systems"]
}"#;

// ---------------------------------------------------------------------------
// MockFetcher
// ---------------------------------------------------------------------------

#[derive(Default)]
struct FetchCounters {
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

/// Decrements the in-flight counter even when the fetch future is dropped.
struct InFlight<'a>(&'a FetchCounters);

impl<'a> InFlight<'a> {
    fn enter(counters: &'a FetchCounters) -> Self {
        let now = counters.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        counters.max_in_flight.fetch_max(now, Ordering::SeqCst);
        Self(counters)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Mock fetcher with a scripted response queue.
///
/// Each call pops the next scripted response; once the queue is empty
/// every call gets the fallback.
#[derive(Clone)]
pub struct MockFetcher {
    responses: Arc<Mutex<VecDeque<Result<String, FetchError>>>>,
    fallback: Result<String, FetchError>,
    latency: Duration,
    target_latency: Arc<HashMap<String, Duration>>,
    counters: Arc<FetchCounters>,
}

impl MockFetcher {
    /// Always returns `body`.
    pub fn new(body: &str) -> Self {
        Self::always(Ok(body.to_string()))
    }

    /// Every call gets `response`.
    pub fn always(response: Result<String, FetchError>) -> Self {
        Self {
            responses: Arc::new(Mutex::new(VecDeque::new())),
            fallback: response,
            latency: Duration::ZERO,
            target_latency: Arc::new(HashMap::new()),
            counters: Arc::new(FetchCounters::default()),
        }
    }

    /// First call fails with `error`, later calls succeed.
    pub fn with_error(error: FetchError) -> Self {
        Self::with_responses(vec![Err(error)])
    }

    /// Scripted responses in call order, then [`PROFILE_JSON`].
    pub fn with_responses(responses: Vec<Result<String, FetchError>>) -> Self {
        let fetcher = Self::new(PROFILE_JSON);
        *fetcher.responses.lock().unwrap() = responses.into();
        fetcher
    }

    /// Simulated network time for every call.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Simulated network time for one target, overriding the default.
    pub fn with_target_latency(mut self, target: &str, latency: Duration) -> Self {
        let mut map = (*self.target_latency).clone();
        map.insert(target.to_string(), latency);
        self.target_latency = Arc::new(map);
        self
    }

    pub fn calls(&self) -> usize {
        self.counters.calls.load(Ordering::SeqCst)
    }

    /// Highest number of concurrent calls observed.
    pub fn max_in_flight(&self) -> usize {
        self.counters.max_in_flight.load(Ordering::SeqCst)
    }
}

impl Fetcher for MockFetcher {
    async fn fetch(
        &self,
        target: &str,
        _timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<String, FetchError> {
        self.counters.calls.fetch_add(1, Ordering::SeqCst);
        let response = self
            .responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone());

        let _in_flight = InFlight::enter(&self.counters);
        let latency = self
            .target_latency
            .get(target)
            .copied()
            .unwrap_or(self.latency);
        if !latency.is_zero() {
            tokio::select! {
                () = cancel.cancelled() => return Err(FetchError::Cancelled),
                () = tokio::time::sleep(latency) => {}
            }
        }
        response
    }
}

// ---------------------------------------------------------------------------
// MockExtractor
// ---------------------------------------------------------------------------

/// Mock extractor that parses JSON objects or returns a fixed error.
#[derive(Clone)]
pub struct MockExtractor {
    error: Option<ExtractError>,
}

impl MockExtractor {
    /// Parses the body as a JSON object.
    pub fn json() -> Self {
        Self { error: None }
    }

    /// Fails every extraction with `error`.
    pub fn with_error(error: ExtractError) -> Self {
        Self { error: Some(error) }
    }
}

impl Extractor for MockExtractor {
    fn extract(&self, raw: &str) -> Result<Record, ExtractError> {
        if let Some(error) = &self.error {
            return Err(error.clone());
        }
        match serde_json::from_str(raw) {
            Ok(serde_json::Value::Object(record)) => Ok(record),
            Ok(other) => Err(ExtractError::UnexpectedShape(format!(
                "expected object, got {other}"
            ))),
            Err(e) => Err(ExtractError::Malformed(e.to_string())),
        }
    }
}

// ---------------------------------------------------------------------------
// MockReporter
// ---------------------------------------------------------------------------

/// Reporter that records a compact string per event.
#[derive(Clone, Default)]
pub struct MockReporter {
    events: Arc<Mutex<Vec<String>>>,
}

impl MockReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.starts_with(prefix))
            .count()
    }
}

impl RunReporter for MockReporter {
    fn report(&self, event: RunEvent<'_>) {
        let line = match event {
            RunEvent::RunStarted { concurrency, .. } => format!("run_started:{concurrency}"),
            RunEvent::OperationStarted { key, .. } => format!("started:{key}"),
            RunEvent::OperationFinished { result, .. } => {
                format!("finished:{}:{}", result.operation.key(), result.status())
            }
            RunEvent::LowQuality { key, .. } => format!("low_quality:{key}"),
        };
        self.events.lock().unwrap().push(line);
    }
}
