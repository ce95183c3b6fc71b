use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::time::sleep;

use super::{Endpoint, Gateway};
use crate::error::TransportError;
use crate::schema::MEASURES;

#[derive(Clone, Debug)]
struct Scripted {
    delay: Duration,
    outcome: Result<Value, TransportError>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Call {
    pub endpoint: Endpoint,
    pub params: Vec<(String, String)>,
}

#[derive(Default)]
struct Script {
    queues: HashMap<String, VecDeque<Scripted>>,
    fallback: HashMap<Endpoint, Scripted>,
    calls: Vec<Call>,
}

/// Deterministic stand-in for the backend.
///
/// Responses are queued per endpoint and query string and handed out in
/// order; once a queue is empty the endpoint's fallback (if any) repeats.
/// Every call is recorded when it is issued, before its delay elapses.
#[derive(Default)]
pub struct ScriptedGateway {
    script: Mutex<Script>,
}

fn script_key(endpoint: Endpoint, params: &[(&str, &str)]) -> String {
    let query: Vec<String> = params.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
    format!("{}?{}", endpoint.as_str(), query.join("&"))
}

impl ScriptedGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, endpoint: Endpoint, params: &[(&str, &str)], outcome: Result<Value, TransportError>) {
        self.push_delayed(endpoint, params, Duration::ZERO, outcome);
    }

    pub fn push_delayed(
        &self,
        endpoint: Endpoint,
        params: &[(&str, &str)],
        delay: Duration,
        outcome: Result<Value, TransportError>,
    ) {
        if let Ok(mut script) = self.script.lock() {
            script
                .queues
                .entry(script_key(endpoint, params))
                .or_default()
                .push_back(Scripted { delay, outcome });
        }
    }

    pub fn set_fallback(&self, endpoint: Endpoint, outcome: Result<Value, TransportError>) {
        if let Ok(mut script) = self.script.lock() {
            script.fallback.insert(endpoint, Scripted { delay: Duration::ZERO, outcome });
        }
    }

    pub fn calls(&self, endpoint: Endpoint) -> usize {
        self.call_log().iter().filter(|c| c.endpoint == endpoint).count()
    }

    pub fn call_log(&self) -> Vec<Call> {
        self.script.lock().map(|s| s.calls.clone()).unwrap_or_default()
    }

    fn next(&self, endpoint: Endpoint, params: &[(&str, &str)]) -> Scripted {
        let unscripted = Scripted {
            delay: Duration::ZERO,
            outcome: Err(TransportError::unreachable(format!(
                "no scripted response for {}",
                script_key(endpoint, params)
            ))),
        };
        let Ok(mut script) = self.script.lock() else {
            return unscripted;
        };
        script.calls.push(Call {
            endpoint,
            params: params.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
        });
        let queued = script
            .queues
            .get_mut(&script_key(endpoint, params))
            .and_then(|q| q.pop_front());
        queued
            .or_else(|| script.fallback.get(&endpoint).cloned())
            .unwrap_or(unscripted)
    }

    async fn respond(&self, endpoint: Endpoint, params: &[(&str, &str)]) -> Result<Value, TransportError> {
        let step = self.next(endpoint, params);
        if !step.delay.is_zero() {
            sleep(step.delay).await;
        }
        step.outcome
    }

    /// Canned backend for running the CLI without a server.
    pub fn demo() -> Self {
        let gw = Self::new();
        let features = json!([
            {
                "name": "maternal_age",
                "distribution_family": "normal",
                "params": {"mu": 28.5, "sigma": 4.2},
                "source_label": "NCHS Natality 2023"
            },
            {
                "name": "gestational_weeks",
                "distribution_family": "skew_normal",
                "params": {"loc": 39.1, "scale": 2.3, "shape": -3.0},
                "source_label": "CDC WONDER D149"
            },
            {
                "name": "prior_cesarean",
                "distribution_family": "bernoulli",
                "params": {"p": 0.16},
                "source_label": "NCHS Natality 2023"
            }
        ]);
        gw.set_fallback(
            Endpoint::Status,
            Ok(json!({"last_updated": 1_700_000_000, "features": features, "job": {"state": "completed"}})),
        );
        gw.set_fallback(Endpoint::Trigger, Ok(Value::Null));
        for _ in 0..2 {
            gw.push(
                Endpoint::Status,
                &[],
                Ok(json!({"last_updated": 1_690_000_000, "features": features, "job": {"state": "running"}})),
            );
        }
        let states = ["CA", "TX", "NY", "FL", "GA"];
        for (m, measure) in MEASURES.iter().enumerate() {
            let series: Vec<Value> = states
                .iter()
                .enumerate()
                .map(|(i, s)| json!({"state": s, "value": 5.0 + m as f64 * 2.5 + i as f64 * 0.7}))
                .collect();
            gw.push_delayed(
                Endpoint::Benchmark,
                &[("measure", *measure)],
                Duration::from_millis(50),
                Ok(Value::Array(series)),
            );
        }
        gw
    }
}

#[async_trait]
impl Gateway for ScriptedGateway {
    async fn read(&self, endpoint: Endpoint, params: &[(&str, &str)]) -> Result<Value, TransportError> {
        self.respond(endpoint, params).await
    }

    async fn write(&self, endpoint: Endpoint, _body: Option<Value>) -> Result<Value, TransportError> {
        self.respond(endpoint, &[]).await
    }
}
