use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::cache::{CacheEntry, Fetcher, QueryCache};
use crate::config::Config;
use crate::error::{DashboardError, TransportError};
use crate::gateway::{ApiResult, Endpoint, Gateway, GatewayKind};
use crate::job::{JobController, JobSnapshot};
use crate::logging::{log, obj, v_str, Domain, Level};
use crate::schema::{parse_benchmarks, BenchmarkPoint, CalibrationStatus};

/// Fetches the per-state benchmark series for one measure.
pub struct BenchmarkFetcher {
    gateway: Arc<dyn Gateway>,
}

impl BenchmarkFetcher {
    pub fn new(gateway: Arc<dyn Gateway>) -> Self {
        Self { gateway }
    }
}

#[async_trait]
impl Fetcher for BenchmarkFetcher {
    type Key = String;
    type Data = Vec<BenchmarkPoint>;

    async fn fetch(&self, measure: &String) -> Result<Vec<BenchmarkPoint>, TransportError> {
        self.gateway
            .read(Endpoint::Benchmark, &[("measure", measure.as_str())])
            .await
            .and_then(parse_benchmarks)
    }
}

pub type BenchmarkEntry = CacheEntry<String, Vec<BenchmarkPoint>>;

/// Session context shared by the dashboard views.
///
/// Built once per session and passed to whoever renders; `teardown` (or
/// dropping it) cancels every fetch and poll still scheduled.
pub struct Dashboard {
    config: Config,
    gateway: Arc<dyn Gateway>,
    benchmarks: QueryCache<BenchmarkFetcher>,
    job: JobController,
    torn_down: AtomicBool,
}

impl Dashboard {
    pub fn new(config: Config, kind: GatewayKind) -> Result<Self, TransportError> {
        let gateway = kind.build(&config)?;
        Ok(Self::with_gateway(config, gateway))
    }

    pub fn with_gateway(config: Config, gateway: Arc<dyn Gateway>) -> Self {
        log(
            Level::Info,
            Domain::System,
            "dashboard.start",
            obj(&[("api_base", v_str(&config.api_base))]),
        );
        let benchmarks = QueryCache::with_max_age(BenchmarkFetcher::new(Arc::clone(&gateway)), config.cache_max_age());
        let job = JobController::new(Arc::clone(&gateway), config.poll_policy());
        Self {
            config,
            gateway,
            benchmarks,
            job,
            torn_down: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn gateway(&self) -> &Arc<dyn Gateway> {
        &self.gateway
    }

    pub fn benchmarks(&self) -> &QueryCache<BenchmarkFetcher> {
        &self.benchmarks
    }

    pub fn job(&self) -> &JobController {
        &self.job
    }

    pub fn select_measure(&self, measure: &str) -> BenchmarkEntry {
        self.benchmarks.select(measure.to_string())
    }

    pub async fn fetch_status(&self) -> ApiResult<CalibrationStatus> {
        self.job.fetch_status().await.into()
    }

    pub async fn recalibrate(&self) -> Result<u64, DashboardError> {
        self.job.trigger().await
    }

    /// Cancel all pending fetches and polls for this session.
    pub fn teardown(&self) {
        if self.torn_down.swap(true, Ordering::SeqCst) {
            return;
        }
        self.benchmarks.shutdown();
        self.job.shutdown();
        log(Level::Info, Domain::System, "dashboard.teardown", obj(&[]));
    }

    /// State consumed by the calibration status card.
    pub fn status_view(&self) -> Value {
        job_view(&self.job.snapshot())
    }

    /// State consumed by the benchmark map for the active measure.
    pub fn benchmark_view(&self) -> Value {
        match self.benchmarks.active() {
            Some(entry) => benchmark_view(&entry),
            None => json!({ "measure": null, "status": "idle" }),
        }
    }
}

impl Drop for Dashboard {
    fn drop(&mut self) {
        self.teardown();
    }
}

pub fn job_view(snapshot: &JobSnapshot) -> Value {
    let lifecycle = &snapshot.lifecycle;
    let features: Vec<Value> = snapshot
        .status
        .as_ref()
        .map(|s| s.features.iter().map(|f| json!(f)).collect())
        .unwrap_or_default();
    json!({
        "run": snapshot.run,
        "state": lifecycle.state,
        "started_at": lifecycle.started_at.map(|t| t.to_rfc3339()),
        "attempts": lifecycle.attempts,
        "last_error": lifecycle.last_error.as_ref().map(|e| json!({
            "message": e.to_string(),
            "detail": e,
        })),
        "can_trigger": snapshot.can_trigger(),
        "last_updated": snapshot.status.as_ref().map(|s| s.last_updated_label()).unwrap_or_else(|| "Never".to_string()),
        "features": features,
    })
}

pub fn benchmark_view(entry: &BenchmarkEntry) -> Value {
    let result: Option<ApiResult<&Vec<BenchmarkPoint>>> = match (entry.data(), &entry.error) {
        (_, Some(err)) => Some(ApiResult::Err(err.clone())),
        (Some(data), None) => Some(ApiResult::Ok(data)),
        (None, None) => None,
    };
    json!({
        "measure": entry.key,
        "status": entry.status,
        "generation": entry.generation,
        "fetched_at": entry.result.as_ref().map(|r| r.fetched_at.to_rfc3339()),
        "result": result.map(|r| r.to_json()),
    })
}
