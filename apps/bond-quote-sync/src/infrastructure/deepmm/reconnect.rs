//! Reconnection Policy
//!
//! Exponential backoff with jitter between connection attempts. Retries are
//! unlimited by default; after `notify_after` consecutive failures the
//! caller surfaces a persistent-failure notice once per failure streak.

use std::time::Duration;

use rand::Rng;

/// Backoff tuning.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Upper bound for any delay.
    pub max_delay: Duration,
    /// Growth factor per failed attempt.
    pub multiplier: f64,
    /// Jitter as a fraction of the delay (0.1 = ±10%).
    pub jitter_factor: f64,
    /// Give up after this many attempts (0 = never).
    pub max_attempts: u32,
    /// Consecutive failures before the persistent-failure notice.
    pub notify_after: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
            jitter_factor: 0.1,
            max_attempts: 0,
            notify_after: 5,
        }
    }
}

/// Backoff state for one session.
#[derive(Debug)]
pub struct ReconnectPolicy {
    config: ReconnectConfig,
    current_delay: Duration,
    attempt_count: u32,
}

impl ReconnectPolicy {
    /// Create a policy at its initial delay.
    #[must_use]
    pub const fn new(config: ReconnectConfig) -> Self {
        let current_delay = config.initial_delay;
        Self {
            config,
            current_delay,
            attempt_count: 0,
        }
    }

    /// Delay before the next attempt, or `None` once attempts are exhausted.
    #[must_use]
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.config.max_attempts > 0 && self.attempt_count >= self.config.max_attempts {
            return None;
        }
        self.attempt_count += 1;

        let delay = self.apply_jitter(self.current_delay);
        self.current_delay = self
            .current_delay
            .mul_f64(self.config.multiplier.max(1.0))
            .min(self.config.max_delay);
        Some(delay)
    }

    /// A connection authenticated; start over.
    pub const fn reset(&mut self) {
        self.current_delay = self.config.initial_delay;
        self.attempt_count = 0;
    }

    /// Consecutive failed attempts so far.
    #[must_use]
    pub const fn attempt_count(&self) -> u32 {
        self.attempt_count
    }

    /// Whether the latest attempt crossed the notification threshold.
    ///
    /// True exactly once per failure streak.
    #[must_use]
    pub const fn crossed_notify_threshold(&self) -> bool {
        self.config.notify_after > 0 && self.attempt_count == self.config.notify_after
    }

    fn apply_jitter(&self, delay: Duration) -> Duration {
        if self.config.jitter_factor <= 0.0 {
            return delay;
        }
        let factor = rand::rng()
            .random_range(-self.config.jitter_factor..=self.config.jitter_factor);
        delay.mul_f64((1.0 + factor).max(0.0)).max(Duration::from_millis(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_jitter(max_attempts: u32) -> ReconnectConfig {
        ReconnectConfig {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(500),
            multiplier: 2.0,
            jitter_factor: 0.0,
            max_attempts,
            notify_after: 3,
        }
    }

    #[test]
    fn doubles_until_capped() {
        let mut policy = ReconnectPolicy::new(no_jitter(0));
        let delays: Vec<u128> = (0..5)
            .map(|_| policy.next_delay().unwrap().as_millis())
            .collect();
        assert_eq!(delays, vec![100, 200, 400, 500, 500]);
    }

    #[test]
    fn reset_restarts_the_schedule() {
        let mut policy = ReconnectPolicy::new(no_jitter(0));
        let _ = policy.next_delay();
        let _ = policy.next_delay();
        policy.reset();

        assert_eq!(policy.attempt_count(), 0);
        assert_eq!(policy.next_delay(), Some(Duration::from_millis(100)));
    }

    #[test]
    fn bounded_attempts_run_out() {
        let mut policy = ReconnectPolicy::new(no_jitter(2));
        assert!(policy.next_delay().is_some());
        assert!(policy.next_delay().is_some());
        assert!(policy.next_delay().is_none());
    }

    #[test]
    fn notify_threshold_fires_once_per_streak() {
        let mut policy = ReconnectPolicy::new(no_jitter(0));
        let crossings: Vec<bool> = (0..6)
            .map(|_| {
                let _ = policy.next_delay();
                policy.crossed_notify_threshold()
            })
            .collect();
        assert_eq!(crossings, vec![false, false, true, false, false, false]);

        policy.reset();
        for _ in 0..3 {
            let _ = policy.next_delay();
        }
        assert!(policy.crossed_notify_threshold());
    }

    #[test]
    fn jitter_stays_within_bounds() {
        for _ in 0..100 {
            let mut policy = ReconnectPolicy::new(ReconnectConfig {
                initial_delay: Duration::from_millis(1000),
                ..ReconnectConfig::default()
            });
            let millis = policy.next_delay().unwrap().as_millis();
            assert!((900..=1100).contains(&millis), "delay {millis}ms out of range");
        }
    }
}
