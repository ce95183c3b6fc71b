use async_trait::async_trait;
use reqwest::{Client, Response};
use serde_json::Value;
use url::Url;

use super::{Endpoint, Gateway};
use crate::config::Config;
use crate::error::TransportError;
use crate::logging::{log, obj, v_str, Domain, Level, ProfileScope};

pub struct HttpGateway {
    client: Client,
    base: Url,
    cfg: Config,
}

impl HttpGateway {
    pub fn new(cfg: &Config) -> Result<Self, TransportError> {
        let base = Url::parse(&cfg.api_base)
            .map_err(|e| TransportError::unreachable(format!("bad api base {}: {}", cfg.api_base, e)))?;
        let client = Client::builder()
            .timeout(cfg.timeout())
            .build()
            .map_err(|e| TransportError::unreachable(e.to_string()))?;
        Ok(Self {
            client,
            base,
            cfg: cfg.clone(),
        })
    }

    fn url(&self, endpoint: Endpoint) -> Result<Url, TransportError> {
        self.base
            .join(endpoint.path(&self.cfg))
            .map_err(|e| TransportError::unreachable(format!("bad {} path: {}", endpoint.as_str(), e)))
    }

    async fn decode(resp: Response) -> Result<Value, TransportError> {
        let status = resp.status();
        if !status.is_success() {
            return Err(TransportError::HttpStatus { code: status.as_u16() });
        }
        let bytes = resp.bytes().await.map_err(|e| translate(&e))?;
        if bytes.iter().all(u8::is_ascii_whitespace) {
            // 202-style acknowledgements carry no body
            return Ok(Value::Null);
        }
        serde_json::from_slice(&bytes).map_err(|e| TransportError::malformed(e.to_string()))
    }
}

/// Map a reqwest failure onto the transport taxonomy.
pub(crate) fn translate(err: &reqwest::Error) -> TransportError {
    if err.is_timeout() {
        TransportError::Timeout
    } else if err.is_decode() || err.is_body() {
        TransportError::malformed(err.to_string())
    } else if let Some(status) = err.status() {
        TransportError::HttpStatus { code: status.as_u16() }
    } else {
        TransportError::unreachable(err.to_string())
    }
}

fn log_outcome(endpoint: Endpoint, outcome: &Result<Value, TransportError>) {
    if let Err(e) = outcome {
        log(
            Level::Warn,
            Domain::Gateway,
            "gateway.error",
            obj(&[
                ("endpoint", v_str(endpoint.as_str())),
                ("kind", v_str(e.kind())),
                ("msg", v_str(&e.to_string())),
            ]),
        );
    }
}

#[async_trait]
impl Gateway for HttpGateway {
    async fn read(&self, endpoint: Endpoint, params: &[(&str, &str)]) -> Result<Value, TransportError> {
        let url = self.url(endpoint)?;
        let _scope = ProfileScope::with_context("gateway.read", &[("endpoint", v_str(endpoint.as_str()))]);
        let outcome = match self.client.get(url).query(params).send().await {
            Ok(resp) => Self::decode(resp).await,
            Err(e) => Err(translate(&e)),
        };
        log_outcome(endpoint, &outcome);
        outcome
    }

    async fn write(&self, endpoint: Endpoint, body: Option<Value>) -> Result<Value, TransportError> {
        let url = self.url(endpoint)?;
        let _scope = ProfileScope::with_context("gateway.write", &[("endpoint", v_str(endpoint.as_str()))]);
        let mut req = self.client.post(url);
        if let Some(body) = body {
            req = req.json(&body);
        }
        let outcome = match req.send().await {
            Ok(resp) => Self::decode(resp).await,
            Err(e) => Err(translate(&e)),
        };
        log_outcome(endpoint, &outcome);
        outcome
    }
}
