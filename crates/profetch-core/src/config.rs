//! Execution budget: the immutable knobs of the resilience core.
//!
//! [`Budget::default`] documents every default. Overrides come from a
//! JSON file or the CLI via [`BudgetOverrides`], applied field by field.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::AppError;

/// Extra randomized multiplier applied on top of backoff jitter to make
/// retry timing look less mechanical. Drawn uniformly from `[min, max]`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Humanize {
    pub min: f64,
    pub max: f64,
}

/// Immutable configuration for executing operations.
#[derive(Debug, Clone, PartialEq)]
pub struct Budget {
    /// Attempts per operation, including the first. Default 3.
    pub max_attempts: u32,
    /// Backoff before the second attempt. Default 1s.
    pub base_delay: Duration,
    /// Upper bound for any computed backoff. Default 60s.
    pub max_delay: Duration,
    /// Lower bound for any backoff, including server hints. Default 0.
    pub min_delay: Duration,
    /// Backoff jitter as a fraction of the delay, in `[0, 1]`. Default 0.25.
    pub jitter_fraction: f64,
    /// Optional human-like delay multiplier. Default off.
    pub humanize: Option<Humanize>,
    /// Token refill rate per target. Default 10 per minute.
    pub tokens_per_second: f64,
    /// Token bucket capacity (burst size) per target. Default 3.
    pub bucket_capacity: u32,
    /// Consecutive failures that open a target's breaker. Default 5.
    pub failure_threshold: u32,
    /// How long a freshly opened breaker rejects calls. Default 60s.
    pub open_duration: Duration,
    /// Cap for the open duration after repeated failed probes. Default 300s.
    pub max_open_duration: Duration,
    /// Growth factor for the open duration when a probe fails. Default 2.0.
    pub open_backoff_multiplier: f64,
    /// Calls admitted while half-open; all must succeed to close. Default 2.
    pub half_open_trials: u32,
    /// Operations in flight at once. Default 3.
    pub concurrency: usize,
    /// Per-call timeout handed to the fetcher. Default 30s.
    pub request_timeout: Duration,
}

impl Default for Budget {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            min_delay: Duration::ZERO,
            jitter_fraction: 0.25,
            humanize: None,
            tokens_per_second: 10.0 / 60.0,
            bucket_capacity: 3,
            failure_threshold: 5,
            open_duration: Duration::from_secs(60),
            max_open_duration: Duration::from_secs(300),
            open_backoff_multiplier: 2.0,
            half_open_trials: 2,
            concurrency: 3,
            request_timeout: Duration::from_secs(30),
        }
    }
}

impl Budget {
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_delays(mut self, base: Duration, max: Duration) -> Self {
        self.base_delay = base;
        self.max_delay = max;
        self
    }

    pub fn with_jitter(mut self, fraction: f64) -> Self {
        self.jitter_fraction = fraction;
        self
    }

    pub fn with_humanize(mut self, min: f64, max: f64) -> Self {
        self.humanize = Some(Humanize { min, max });
        self
    }

    pub fn with_rate(mut self, tokens_per_second: f64, bucket_capacity: u32) -> Self {
        self.tokens_per_second = tokens_per_second;
        self.bucket_capacity = bucket_capacity;
        self
    }

    pub fn with_breaker(
        mut self,
        failure_threshold: u32,
        open_duration: Duration,
        half_open_trials: u32,
    ) -> Self {
        self.failure_threshold = failure_threshold;
        self.open_duration = open_duration;
        self.half_open_trials = half_open_trials;
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Reject budgets the core cannot honour.
    pub fn validate(&self) -> Result<(), AppError> {
        let mut issues = Vec::new();

        if self.max_attempts == 0 {
            issues.push("max_attempts must be at least 1".to_string());
        }
        if self.base_delay > self.max_delay {
            issues.push("base_delay must not exceed max_delay".to_string());
        }
        if self.min_delay > self.max_delay {
            issues.push("min_delay must not exceed max_delay".to_string());
        }
        if !(0.0..=1.0).contains(&self.jitter_fraction) {
            issues.push("jitter_fraction must be within [0, 1]".to_string());
        }
        if let Some(h) = self.humanize
            && !(h.min.is_finite() && h.max.is_finite() && 0.0 < h.min && h.min <= h.max)
        {
            issues.push("humanize range must satisfy 0 < min <= max".to_string());
        }
        if !(self.tokens_per_second.is_finite() && self.tokens_per_second > 0.0) {
            issues.push("tokens_per_second must be positive".to_string());
        }
        if self.bucket_capacity == 0 {
            issues.push("bucket_capacity must be at least 1".to_string());
        }
        if self.failure_threshold == 0 {
            issues.push("failure_threshold must be at least 1".to_string());
        }
        if self.half_open_trials == 0 {
            issues.push("half_open_trials must be at least 1".to_string());
        }
        if self.open_duration > self.max_open_duration {
            issues.push("open_duration must not exceed max_open_duration".to_string());
        }
        if !(self.open_backoff_multiplier.is_finite() && self.open_backoff_multiplier >= 1.0) {
            issues.push("open_backoff_multiplier must be at least 1.0".to_string());
        }
        if self.concurrency == 0 {
            issues.push("concurrency must be at least 1".to_string());
        }
        if self.request_timeout.is_zero() {
            issues.push("request_timeout must be positive".to_string());
        }

        if issues.is_empty() {
            Ok(())
        } else {
            Err(AppError::Config(issues.join("; ")))
        }
    }
}

/// Partial budget, as found in a config file or on the command line.
///
/// Durations are in milliseconds. Unset fields leave the base value alone.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BudgetOverrides {
    pub max_attempts: Option<u32>,
    pub base_delay_ms: Option<u64>,
    pub max_delay_ms: Option<u64>,
    pub min_delay_ms: Option<u64>,
    pub jitter_fraction: Option<f64>,
    pub humanize_min: Option<f64>,
    pub humanize_max: Option<f64>,
    pub tokens_per_second: Option<f64>,
    pub bucket_capacity: Option<u32>,
    pub failure_threshold: Option<u32>,
    pub open_duration_ms: Option<u64>,
    pub max_open_duration_ms: Option<u64>,
    pub open_backoff_multiplier: Option<f64>,
    pub half_open_trials: Option<u32>,
    pub concurrency: Option<usize>,
    pub request_timeout_ms: Option<u64>,
}

impl BudgetOverrides {
    pub fn from_json(json: &str) -> Result<Self, AppError> {
        serde_json::from_str(json)
            .map_err(|e| AppError::Config(format!("Invalid budget overrides: {e}")))
    }

    pub fn load(path: &Path) -> Result<Self, AppError> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            AppError::Config(format!(
                "Failed to read config file {}: {e}",
                path.display()
            ))
        })?;
        Self::from_json(&text)
    }

    /// Layer `other` on top of `self`; fields set in `other` win.
    pub fn merge(self, other: BudgetOverrides) -> Self {
        Self {
            max_attempts: other.max_attempts.or(self.max_attempts),
            base_delay_ms: other.base_delay_ms.or(self.base_delay_ms),
            max_delay_ms: other.max_delay_ms.or(self.max_delay_ms),
            min_delay_ms: other.min_delay_ms.or(self.min_delay_ms),
            jitter_fraction: other.jitter_fraction.or(self.jitter_fraction),
            humanize_min: other.humanize_min.or(self.humanize_min),
            humanize_max: other.humanize_max.or(self.humanize_max),
            tokens_per_second: other.tokens_per_second.or(self.tokens_per_second),
            bucket_capacity: other.bucket_capacity.or(self.bucket_capacity),
            failure_threshold: other.failure_threshold.or(self.failure_threshold),
            open_duration_ms: other.open_duration_ms.or(self.open_duration_ms),
            max_open_duration_ms: other.max_open_duration_ms.or(self.max_open_duration_ms),
            open_backoff_multiplier: other
                .open_backoff_multiplier
                .or(self.open_backoff_multiplier),
            half_open_trials: other.half_open_trials.or(self.half_open_trials),
            concurrency: other.concurrency.or(self.concurrency),
            request_timeout_ms: other.request_timeout_ms.or(self.request_timeout_ms),
        }
    }

    /// Apply the overrides to `base` and validate the result.
    pub fn apply(&self, base: Budget) -> Result<Budget, AppError> {
        let ms = Duration::from_millis;
        let mut budget = base;

        if let Some(v) = self.max_attempts {
            budget.max_attempts = v;
        }
        if let Some(v) = self.base_delay_ms {
            budget.base_delay = ms(v);
        }
        if let Some(v) = self.max_delay_ms {
            budget.max_delay = ms(v);
        }
        if let Some(v) = self.min_delay_ms {
            budget.min_delay = ms(v);
        }
        if let Some(v) = self.jitter_fraction {
            budget.jitter_fraction = v;
        }
        match (self.humanize_min, self.humanize_max) {
            (None, None) => {}
            (Some(min), Some(max)) => budget.humanize = Some(Humanize { min, max }),
            _ => {
                return Err(AppError::Config(
                    "humanize_min and humanize_max must be set together".to_string(),
                ));
            }
        }
        if let Some(v) = self.tokens_per_second {
            budget.tokens_per_second = v;
        }
        if let Some(v) = self.bucket_capacity {
            budget.bucket_capacity = v;
        }
        if let Some(v) = self.failure_threshold {
            budget.failure_threshold = v;
        }
        if let Some(v) = self.open_duration_ms {
            budget.open_duration = ms(v);
        }
        if let Some(v) = self.max_open_duration_ms {
            budget.max_open_duration = ms(v);
        }
        if let Some(v) = self.open_backoff_multiplier {
            budget.open_backoff_multiplier = v;
        }
        if let Some(v) = self.half_open_trials {
            budget.half_open_trials = v;
        }
        if let Some(v) = self.concurrency {
            budget.concurrency = v;
        }
        if let Some(v) = self.request_timeout_ms {
            budget.request_timeout = ms(v);
        }

        budget.validate()?;
        Ok(budget)
    }
}
