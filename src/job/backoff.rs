use rand::Rng;
use tokio::time::Duration;

/// Delay schedule between consecutive status polls.
#[derive(Clone, Debug, PartialEq)]
pub struct BackoffConfig {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter_factor: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 2000,
            max_delay_ms: 30_000,
            jitter_factor: 0.2,
        }
    }
}

impl BackoffConfig {
    /// Exponential backoff with jitter, clamped to `max_delay_ms`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.base_delay_ms as f64 * 2.0_f64.powi(attempt.min(30) as i32);
        let clamped = base.min(self.max_delay_ms as f64);

        // ±jitter_factor of the delay
        let jitter_range = clamped * self.jitter_factor.clamp(0.0, 1.0);
        let jitter: f64 = if jitter_range > 0.0 {
            rand::thread_rng().gen_range(-jitter_range..=jitter_range)
        } else {
            0.0
        };
        let final_delay = (clamped + jitter).max(0.0);

        Duration::from_millis(final_delay as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_calculation() {
        let config = BackoffConfig {
            base_delay_ms: 100,
            max_delay_ms: 1000,
            jitter_factor: 0.0, // no jitter for deterministic test
        };

        assert_eq!(config.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(config.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(config.delay_for_attempt(2), Duration::from_millis(400));
        assert_eq!(config.delay_for_attempt(3), Duration::from_millis(800));
        assert_eq!(config.delay_for_attempt(4), Duration::from_millis(1000)); // clamped
        assert_eq!(config.delay_for_attempt(u32::MAX), Duration::from_millis(1000));
    }

    #[test]
    fn test_jitter_stays_in_band() {
        let config = BackoffConfig {
            base_delay_ms: 1000,
            max_delay_ms: 1000,
            jitter_factor: 0.3,
        };
        for _ in 0..100 {
            let d = config.delay_for_attempt(0).as_millis();
            assert!((700..=1300).contains(&d), "delay {} out of band", d);
        }
    }
}
