//! Client-side core of the calibration dashboard: a request gateway, a
//! parameterized query cache for benchmark series, and the recalibration
//! job lifecycle controller.

pub mod cache;
pub mod config;
pub mod dashboard;
pub mod error;
pub mod gateway;
pub mod job;
pub mod logging;
pub mod schema;

pub use cache::{CacheEntry, CacheStatus, Fetcher, QueryCache, QueryResult};
pub use config::Config;
pub use dashboard::{BenchmarkFetcher, Dashboard};
pub use error::{DashboardError, LifecycleError, TransportError};
pub use gateway::{ApiResult, Endpoint, Gateway, GatewayKind, HttpGateway, ScriptedGateway};
pub use job::lifecycle::{JobEvent, JobLifecycle, JobState};
pub use job::{JobController, JobSnapshot, PollPolicy};
pub use schema::{BenchmarkPoint, CalibrationFeatureSummary, CalibrationStatus};
