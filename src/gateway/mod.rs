use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Value};

use crate::config::Config;
use crate::error::TransportError;

mod http;
pub mod scripted;

pub use http::HttpGateway;
pub use scripted::ScriptedGateway;

/// Logical backend operations the dashboard talks to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Endpoint {
    Status,
    Trigger,
    Benchmark,
}

impl Endpoint {
    pub fn as_str(&self) -> &'static str {
        match self {
            Endpoint::Status => "status",
            Endpoint::Trigger => "trigger",
            Endpoint::Benchmark => "benchmark",
        }
    }

    pub fn path<'a>(&self, cfg: &'a Config) -> &'a str {
        match self {
            Endpoint::Status => &cfg.status_path,
            Endpoint::Trigger => &cfg.trigger_path,
            Endpoint::Benchmark => &cfg.benchmark_path,
        }
    }
}

/// Narrow transport seam. Implementations serialize params, decode JSON and
/// translate every failure into a `TransportError`. They never retry and
/// never cache.
#[async_trait]
pub trait Gateway: Send + Sync {
    async fn read(&self, endpoint: Endpoint, params: &[(&str, &str)]) -> Result<Value, TransportError>;
    async fn write(&self, endpoint: Endpoint, body: Option<Value>) -> Result<Value, TransportError>;
}

#[derive(Clone, Copy, Debug)]
pub enum GatewayKind {
    Http,
    Offline,
}

impl GatewayKind {
    pub fn build(self, cfg: &Config) -> Result<Arc<dyn Gateway>, TransportError> {
        match self {
            GatewayKind::Http => Ok(Arc::new(HttpGateway::new(cfg)?)),
            GatewayKind::Offline => Ok(Arc::new(ScriptedGateway::demo())),
        }
    }
}

/// Result shape handed to the rendering layer.
#[derive(Debug, Clone, PartialEq)]
pub enum ApiResult<T> {
    Ok(T),
    Err(TransportError),
}

impl<T> From<Result<T, TransportError>> for ApiResult<T> {
    fn from(r: Result<T, TransportError>) -> Self {
        match r {
            Ok(v) => ApiResult::Ok(v),
            Err(e) => ApiResult::Err(e),
        }
    }
}

impl<T: Serialize> ApiResult<T> {
    pub fn is_ok(&self) -> bool {
        matches!(self, ApiResult::Ok(_))
    }

    pub fn to_json(&self) -> Value {
        match self {
            ApiResult::Ok(v) => match serde_json::to_value(v) {
                Ok(value) => json!({ "ok": true, "value": value }),
                Err(err) => json!({
                    "ok": false,
                    "error": TransportError::malformed(format!("unserializable value: {}", err)),
                }),
            },
            ApiResult::Err(e) => json!({ "ok": false, "error": e }),
        }
    }
}
