use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStats};
use crate::config::Budget;
use crate::limiter::TokenBucketLimiter;
use crate::models::Operation;

/// The limiter and breaker shared by every operation against one target.
pub struct TargetGuard {
    pub limiter: TokenBucketLimiter,
    pub breaker: CircuitBreaker,
}

impl TargetGuard {
    pub fn new(key: impl Into<String>, budget: &Budget) -> Self {
        Self {
            limiter: TokenBucketLimiter::from_budget(budget),
            breaker: CircuitBreaker::new(key, CircuitBreakerConfig::from_budget(budget)),
        }
    }
}

/// Lazily creates one [`TargetGuard`] per target key.
///
/// Owned by the caller and injected into the orchestration loop, so
/// separate runs and tests never share breaker or limiter state.
#[derive(Clone)]
pub struct TargetRegistry {
    budget: Budget,
    guards: Arc<Mutex<HashMap<String, Arc<TargetGuard>>>>,
}

impl TargetRegistry {
    pub fn new(budget: &Budget) -> Self {
        Self {
            budget: budget.clone(),
            guards: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn lock_guards(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<TargetGuard>>> {
        self.guards.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("Recovered from poisoned target registry");
            poisoned.into_inner()
        })
    }

    /// Guard for the operation's target, created on first use.
    pub fn guard_for(&self, operation: &Operation) -> Arc<TargetGuard> {
        let key = operation.target_key();
        let mut guards = self.lock_guards();
        guards
            .entry(key)
            .or_insert_with_key(|key| {
                tracing::debug!(target_key = %key, "Creating limiter and breaker for target");
                Arc::new(TargetGuard::new(key.clone(), &self.budget))
            })
            .clone()
    }

    /// Existing guard for a target key, if any operation has used it.
    pub fn get(&self, key: &str) -> Option<Arc<TargetGuard>> {
        self.lock_guards().get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock_guards().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Breaker statistics for every known target, sorted by key.
    pub fn breaker_stats(&self) -> Vec<CircuitBreakerStats> {
        let guards: Vec<_> = self.lock_guards().values().cloned().collect();
        let mut stats: Vec<_> = guards.iter().map(|g| g.breaker.stats()).collect();
        stats.sort_by(|a, b| a.name.cmp(&b.name));
        stats
    }

    /// Total number of times any breaker in this registry has opened.
    pub fn total_trips(&self) -> u64 {
        self.breaker_stats().iter().map(|s| s.trips).sum()
    }
}
