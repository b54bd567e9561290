use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::util::target_key;

/// A partially-filled profile record produced by an [`Extractor`](crate::traits::Extractor).
pub type Record = serde_json::Map<String, serde_json::Value>;

/// One logical unit of work, e.g. one profile URL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operation {
    key: String,
    target: String,
}

impl Operation {
    pub fn new(key: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            target: target.into(),
        }
    }

    /// Operation keyed by its own target.
    pub fn from_target(target: impl Into<String>) -> Self {
        let target = target.into();
        Self {
            key: target.clone(),
            target,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Opaque payload handed to the fetcher.
    pub fn target(&self) -> &str {
        &self.target
    }

    /// Key of the shared limiter/breaker pair this operation runs under.
    pub fn target_key(&self) -> String {
        target_key(&self.target)
    }
}

/// Classified result of a single attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Success(Record),
    RetryableFailure {
        reason: String,
        retry_after: Option<Duration>,
    },
    FatalFailure {
        reason: String,
    },
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success(_))
    }

    pub fn failure_reason(&self) -> Option<&str> {
        match self {
            Outcome::Success(_) => None,
            Outcome::RetryableFailure { reason, .. } | Outcome::FatalFailure { reason } => {
                Some(reason)
            }
        }
    }
}

/// One entry in an operation's attempt history.
#[derive(Debug, Clone, PartialEq)]
pub struct AttemptRecord {
    /// 1-based attempt number.
    pub attempt: u32,
    pub at: DateTime<Utc>,
    /// Wait applied before this attempt (backoff plus any breaker waits).
    pub delay_before: Duration,
    pub outcome: Outcome,
}

/// Final result of an operation after all attempts and gating are resolved.
#[derive(Debug, Clone, PartialEq)]
pub enum TerminalOutcome {
    Success(Record),
    /// No data. `fatal` separates "never existed / malformed" from "kept failing".
    Exhausted { reason: String, fatal: bool },
    /// The target's breaker was open before any attempt could run.
    CircuitRejected { retry_after: Duration },
    Cancelled,
}

impl TerminalOutcome {
    pub fn status(&self) -> OutcomeStatus {
        match self {
            TerminalOutcome::Success(_) => OutcomeStatus::Success,
            TerminalOutcome::Exhausted { fatal: true, .. } => OutcomeStatus::Fatal,
            TerminalOutcome::Exhausted { fatal: false, .. } => OutcomeStatus::Exhausted,
            TerminalOutcome::CircuitRejected { .. } => OutcomeStatus::CircuitRejected,
            TerminalOutcome::Cancelled => OutcomeStatus::Cancelled,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, TerminalOutcome::Success(_))
    }

    pub fn record(&self) -> Option<&Record> {
        match self {
            TerminalOutcome::Success(record) => Some(record),
            _ => None,
        }
    }

    /// Human-readable reason for a non-success outcome.
    pub fn reason(&self) -> Option<String> {
        match self {
            TerminalOutcome::Success(_) => None,
            TerminalOutcome::Exhausted { reason, .. } => Some(reason.clone()),
            TerminalOutcome::CircuitRejected { retry_after } => Some(format!(
                "circuit open, retry after {}ms",
                retry_after.as_millis()
            )),
            TerminalOutcome::Cancelled => Some("cancelled".to_string()),
        }
    }
}

/// Flat classification of a [`TerminalOutcome`] for logs and exports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    Success,
    Exhausted,
    Fatal,
    CircuitRejected,
    Cancelled,
}

impl OutcomeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutcomeStatus::Success => "success",
            OutcomeStatus::Exhausted => "exhausted",
            OutcomeStatus::Fatal => "fatal",
            OutcomeStatus::CircuitRejected => "circuit_rejected",
            OutcomeStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for OutcomeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for OutcomeStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "success" => Ok(OutcomeStatus::Success),
            "exhausted" => Ok(OutcomeStatus::Exhausted),
            "fatal" => Ok(OutcomeStatus::Fatal),
            "circuit_rejected" => Ok(OutcomeStatus::CircuitRejected),
            "cancelled" => Ok(OutcomeStatus::Cancelled),
            _ => Err(format!("Unknown outcome status: {}", s)),
        }
    }
}

/// Everything the executor knows about one finished operation.
#[derive(Debug, Clone)]
pub struct Execution {
    pub outcome: TerminalOutcome,
    pub attempts: Vec<AttemptRecord>,
    pub elapsed: Duration,
}

impl Execution {
    /// Collapse the attempt history into the summary that outlives it.
    pub fn summary(&self) -> TimingSummary {
        TimingSummary {
            attempts: self.attempts.len() as u32,
            total_delay: self.attempts.iter().map(|a| a.delay_before).sum(),
            elapsed: self.elapsed,
        }
    }
}

/// Timing summary kept after the attempt history is discarded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TimingSummary {
    pub attempts: u32,
    pub total_delay: Duration,
    pub elapsed: Duration,
}

/// Compute a SHA-256 hash of a string, returned as 64-char hex.
pub fn compute_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Stable hash of a record (keys are serialized in sorted order).
pub fn record_hash(record: &Record) -> String {
    compute_hash(&serde_json::Value::Object(record.clone()).to_string())
}
