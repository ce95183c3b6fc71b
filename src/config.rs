use std::time::Duration;

use crate::job::backoff::BackoffConfig;
use crate::job::PollPolicy;

#[derive(Clone, Debug)]
pub struct Config {
    pub api_base: String,
    pub status_path: String,
    pub trigger_path: String,
    pub benchmark_path: String,
    pub timeout_secs: u64,
    /// Delay between an accepted trigger and the first status read
    pub settle_ms: u64,
    pub poll_base_ms: u64,
    pub poll_max_ms: u64,
    pub poll_jitter: f64,
    /// Consecutive failed status reads tolerated before a run is failed
    pub max_attempts: u32,
    pub max_polls: u32,
    pub cache_max_age_secs: Option<u64>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_base: "http://localhost:8000".to_string(),
            status_path: "/api/v1/data/calibration-status".to_string(),
            trigger_path: "/api/v1/data/calibrate".to_string(),
            benchmark_path: "/api/v1/benchmarks/ahr".to_string(),
            timeout_secs: 30,
            settle_ms: 5000,
            poll_base_ms: 2000,
            poll_max_ms: 30_000,
            poll_jitter: 0.2,
            max_attempts: 5,
            max_polls: 120,
            cache_max_age_secs: None,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            api_base: std::env::var("DASH_API_BASE").unwrap_or(d.api_base),
            status_path: std::env::var("DASH_STATUS_PATH").unwrap_or(d.status_path),
            trigger_path: std::env::var("DASH_TRIGGER_PATH").unwrap_or(d.trigger_path),
            benchmark_path: std::env::var("DASH_BENCHMARK_PATH").unwrap_or(d.benchmark_path),
            timeout_secs: std::env::var("DASH_TIMEOUT_SECS").ok().and_then(|v| v.parse().ok()).unwrap_or(d.timeout_secs),
            settle_ms: std::env::var("DASH_SETTLE_MS").ok().and_then(|v| v.parse().ok()).unwrap_or(d.settle_ms),
            poll_base_ms: std::env::var("DASH_POLL_BASE_MS").ok().and_then(|v| v.parse().ok()).unwrap_or(d.poll_base_ms),
            poll_max_ms: std::env::var("DASH_POLL_MAX_MS").ok().and_then(|v| v.parse().ok()).unwrap_or(d.poll_max_ms),
            poll_jitter: std::env::var("DASH_POLL_JITTER").ok().and_then(|v| v.parse().ok()).unwrap_or(d.poll_jitter),
            max_attempts: std::env::var("DASH_MAX_ATTEMPTS").ok().and_then(|v| v.parse().ok()).unwrap_or(d.max_attempts),
            max_polls: std::env::var("DASH_MAX_POLLS").ok().and_then(|v| v.parse().ok()).unwrap_or(d.max_polls),
            cache_max_age_secs: std::env::var("DASH_CACHE_MAX_AGE_SECS").ok().and_then(|v| v.parse().ok()),
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn cache_max_age(&self) -> Option<Duration> {
        self.cache_max_age_secs.map(Duration::from_secs)
    }

    pub fn poll_policy(&self) -> PollPolicy {
        PollPolicy {
            settle_delay: Duration::from_millis(self.settle_ms),
            backoff: BackoffConfig {
                base_delay_ms: self.poll_base_ms,
                max_delay_ms: self.poll_max_ms,
                jitter_factor: self.poll_jitter,
            },
            max_attempts: self.max_attempts.max(1),
            max_polls: self.max_polls.max(1),
        }
    }
}
