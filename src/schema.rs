//! Typed backend payloads.
//!
//! Everything coming off the wire is parsed here, at the gateway boundary,
//! so the cache and the lifecycle controller only ever see checked types.
//! A payload that does not match fails with `TransportError::Malformed`.

use std::collections::BTreeMap;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::TransportError;

pub const DEFAULT_MEASURE: &str = "Maternal Mortality";

/// Measures offered by the benchmark view.
pub const MEASURES: [&str; 4] = [
    "Maternal Mortality",
    "Preterm Birth",
    "Low Birthweight",
    "Severe Maternal Morbidity",
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationFeatureSummary {
    pub name: String,
    pub distribution_family: String,
    #[serde(default)]
    pub params: BTreeMap<String, f64>,
    pub source_label: String,
}

/// Optional progress hint the backend may attach to the status payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobReport {
    pub state: String,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationStatus {
    /// Epoch seconds of the last completed calibration
    #[serde(default)]
    pub last_updated: Option<i64>,
    #[serde(default)]
    pub features: Vec<CalibrationFeatureSummary>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job: Option<JobReport>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobProgress {
    Running,
    Completed,
    Failed(String),
}

impl CalibrationStatus {
    /// Progress as reported by the backend's own `job.state` hint, if any.
    pub fn reported_progress(&self) -> Option<JobProgress> {
        let job = self.job.as_ref()?;
        match job.state.to_ascii_lowercase().as_str() {
            "running" | "queued" | "pending" | "started" => Some(JobProgress::Running),
            "completed" | "succeeded" | "success" | "done" => Some(JobProgress::Completed),
            "failed" | "error" => Some(JobProgress::Failed(
                job.error.clone().unwrap_or_else(|| "calibration failed".to_string()),
            )),
            _ => None,
        }
    }

    /// Where a run stands given the `last_updated` seen before it started.
    ///
    /// An explicit `job.state` wins. Without one, the run counts as complete
    /// once the server's `last_updated` has moved past `previous`. Only
    /// server timestamps are compared.
    pub fn progress(&self, previous: Option<i64>) -> JobProgress {
        if let Some(reported) = self.reported_progress() {
            return reported;
        }
        match (self.last_updated, previous) {
            (Some(now), Some(prev)) if now > prev => JobProgress::Completed,
            (Some(_), None) => JobProgress::Completed,
            _ => JobProgress::Running,
        }
    }

    pub fn last_updated_at(&self) -> Option<DateTime<Utc>> {
        self.last_updated.and_then(|ts| Utc.timestamp_opt(ts, 0).single())
    }

    /// Label for the status card header.
    pub fn last_updated_label(&self) -> String {
        match self.last_updated_at() {
            Some(at) => at.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
            None => "Never".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BenchmarkPoint {
    pub state: String,
    pub value: f64,
}

pub fn parse_status(body: Value) -> Result<CalibrationStatus, TransportError> {
    serde_json::from_value(body)
        .map_err(|e| TransportError::malformed(format!("calibration status: {}", e)))
}

pub fn parse_benchmarks(body: Value) -> Result<Vec<BenchmarkPoint>, TransportError> {
    serde_json::from_value(body)
        .map_err(|e| TransportError::malformed(format!("benchmark series: {}", e)))
}
