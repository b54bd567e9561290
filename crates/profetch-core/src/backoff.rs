//! Exponential backoff with jitter.
//!
//! ```text
//! delay(n) = clamp(min(max_delay, base_delay * 2^(n-1)) * jitter * humanize, min_delay, max_delay)
//! ```
//!
//! `n` is 1-based: `delay(1)` is the wait before the second attempt.
//! A server-supplied retry-after hint replaces the computed delay.

use std::time::Duration;

use rand::Rng;

use crate::config::{Budget, Humanize};

/// Computes the wait between attempts of one operation.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    base_delay: Duration,
    max_delay: Duration,
    min_delay: Duration,
    jitter_fraction: f64,
    humanize: Option<Humanize>,
}

impl BackoffPolicy {
    /// Pure exponential policy without jitter.
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
            min_delay: Duration::ZERO,
            jitter_fraction: 0.0,
            humanize: None,
        }
    }

    pub fn from_budget(budget: &Budget) -> Self {
        Self {
            base_delay: budget.base_delay,
            max_delay: budget.max_delay,
            min_delay: budget.min_delay,
            jitter_fraction: budget.jitter_fraction.clamp(0.0, 1.0),
            humanize: budget.humanize,
        }
    }

    /// Multiply each delay by a uniform factor in `[1 - fraction, 1 + fraction]`.
    pub fn with_jitter(mut self, fraction: f64) -> Self {
        self.jitter_fraction = fraction.clamp(0.0, 1.0);
        self
    }

    pub fn with_min_delay(mut self, min_delay: Duration) -> Self {
        self.min_delay = min_delay;
        self
    }

    /// Add a human-like multiplier drawn from `[min, max]`.
    pub fn with_humanize(mut self, min: f64, max: f64) -> Self {
        self.humanize = Some(Humanize { min, max });
        self
    }

    pub fn max_delay(&self) -> Duration {
        self.max_delay
    }

    /// The deterministic exponential part, before jitter.
    pub fn nominal_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.max(1).saturating_sub(1).min(62) as i32;
        let secs = self.base_delay.as_secs_f64() * 2f64.powi(exponent);
        Duration::from_secs_f64(secs.min(self.max_delay.as_secs_f64()))
    }

    /// Delay before attempt `attempt + 1`, using the thread-local rng.
    pub fn delay(&self, attempt: u32) -> Duration {
        self.delay_with(attempt, &mut rand::thread_rng())
    }

    /// Delay before attempt `attempt + 1`, drawing randomness from `rng`.
    pub fn delay_with<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let mut secs = self.nominal_delay(attempt).as_secs_f64();

        if self.jitter_fraction > 0.0 {
            secs *= rng.gen_range(1.0 - self.jitter_fraction..=1.0 + self.jitter_fraction);
        }
        if let Some(Humanize { min, max }) = self.humanize
            && min <= max
        {
            secs *= rng.gen_range(min..=max);
        }

        let floor = self.min_delay.as_secs_f64();
        let ceiling = self.max_delay.as_secs_f64();
        Duration::from_secs_f64(secs.max(0.0).max(floor).min(ceiling))
    }

    /// Delay honouring a server hint when one is present.
    ///
    /// A hint is never shortened; it is only raised to `min_delay`.
    pub fn delay_for(&self, attempt: u32, hint: Option<Duration>) -> Duration {
        match hint {
            Some(hint) => hint.max(self.min_delay),
            None => self.delay(attempt),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn exponential_schedule_without_jitter() {
        let policy = BackoffPolicy::new(ms(100), ms(1000));
        assert_eq!(policy.delay(1), ms(100));
        assert_eq!(policy.delay(2), ms(200));
        assert_eq!(policy.delay(3), ms(400));
        assert_eq!(policy.delay(4), ms(800));
        assert_eq!(policy.delay(5), ms(1000));
        assert_eq!(policy.delay(60), ms(1000));
    }

    #[test]
    fn attempt_zero_is_treated_as_first() {
        let policy = BackoffPolicy::new(ms(100), ms(1000));
        assert_eq!(policy.delay(0), policy.delay(1));
    }

    #[test]
    fn huge_attempt_numbers_do_not_overflow() {
        let policy = BackoffPolicy::new(ms(100), Duration::from_secs(60));
        assert_eq!(policy.delay(u32::MAX), Duration::from_secs(60));
    }

    #[test]
    fn delay_never_exceeds_max_with_jitter_and_humanize() {
        let policy = BackoffPolicy::new(ms(100), ms(2000))
            .with_jitter(0.5)
            .with_humanize(0.5, 2.0);
        let mut rng = StdRng::seed_from_u64(7);
        for attempt in 1..40 {
            for _ in 0..50 {
                assert!(policy.delay_with(attempt, &mut rng) <= ms(2000));
            }
        }
    }

    #[test]
    fn jitter_stays_within_fraction() {
        let policy = BackoffPolicy::new(ms(1000), Duration::from_secs(60)).with_jitter(0.25);
        let mut rng = StdRng::seed_from_u64(42);
        for _ in 0..200 {
            let d = policy.delay_with(1, &mut rng);
            assert!(d >= ms(750) && d <= ms(1250), "out of range: {d:?}");
        }
    }

    #[test]
    fn full_jitter_is_floored_at_zero_or_min() {
        let policy = BackoffPolicy::new(ms(100), ms(1000))
            .with_jitter(1.0)
            .with_min_delay(ms(20));
        let mut rng = StdRng::seed_from_u64(3);
        for _ in 0..200 {
            assert!(policy.delay_with(1, &mut rng) >= ms(20));
        }
    }

    #[test]
    fn mean_delay_grows_with_attempts() {
        let policy = BackoffPolicy::new(ms(100), Duration::from_secs(30)).with_jitter(0.25);
        let mut rng = StdRng::seed_from_u64(11);
        let mean = |attempt: u32, rng: &mut StdRng| -> f64 {
            (0..200)
                .map(|_| policy.delay_with(attempt, rng).as_secs_f64())
                .sum::<f64>()
                / 200.0
        };
        let mut previous = 0.0;
        for attempt in 1..=8 {
            let m = mean(attempt, &mut rng);
            assert!(m >= previous, "mean for attempt {attempt} decreased");
            previous = m;
        }
    }

    #[test]
    fn hint_overrides_computed_delay() {
        let policy = BackoffPolicy::new(ms(100), ms(1000));
        assert_eq!(policy.delay_for(1, Some(ms(5000))), ms(5000));
        assert_eq!(policy.delay_for(3, None), ms(400));
    }

    #[test]
    fn hint_is_raised_to_min_delay() {
        let policy = BackoffPolicy::new(ms(100), ms(1000)).with_min_delay(ms(250));
        assert_eq!(policy.delay_for(1, Some(ms(10))), ms(250));
    }

    #[test]
    fn from_budget_copies_fields() {
        let budget = Budget::default()
            .with_delays(ms(50), ms(500))
            .with_jitter(0.0);
        let policy = BackoffPolicy::from_budget(&budget);
        assert_eq!(policy.delay(2), ms(100));
        assert_eq!(policy.max_delay(), ms(500));
    }
}
