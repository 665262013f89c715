//! JSON-RPC transport against the monitored Bitcoin Core node.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::collector::error::CollectError;
use crate::config::RpcConfig;

/// RPC transport seam: accepts a method name and ordered argument list,
/// returns the call's `result` value. Any non-success status or malformed
/// envelope surfaces as `CollectError::Transient`.
pub trait RpcTransport: Send + Sync {
    fn call(
        &self,
        method: &str,
        params: &[Value],
    ) -> impl Future<Output = Result<Value, CollectError>> + Send;
}

/// HTTP JSON-RPC transport.
///
/// Opens a fresh connection per call: every cycle is independent, so a
/// wedged connection cannot stall future cycles.
pub struct HttpTransport {
    url: String,
    user: String,
    password: String,
    timeout: Duration,
}

impl HttpTransport {
    pub fn new(cfg: &RpcConfig) -> Self {
        Self {
            url: format!("http://{}:{}/", cfg.host, cfg.port),
            user: cfg.user.clone(),
            password: cfg.password.clone(),
            timeout: cfg.timeout,
        }
    }
}

#[derive(Serialize)]
struct RpcRequest<'a> {
    jsonrpc: &'static str,
    id: u32,
    method: &'a str,
    params: &'a [Value],
}

#[derive(Deserialize)]
struct RpcEnvelope {
    result: Option<Value>,
    error: Option<RpcErrorObject>,
}

#[derive(Deserialize)]
struct RpcErrorObject {
    code: i64,
    message: String,
}

impl RpcTransport for HttpTransport {
    async fn call(&self, method: &str, params: &[Value]) -> Result<Value, CollectError> {
        debug!(method, "initiating RPC call");

        let client = reqwest::Client::builder()
            .timeout(self.timeout)
            .build()
            .map_err(|e| CollectError::Transient(format!("building HTTP client: {e}")))?;

        let request = RpcRequest {
            jsonrpc: "2.0",
            id: 1,
            method,
            params,
        };

        let response = client
            .post(&self.url)
            .basic_auth(&self.user, Some(&self.password))
            .json(&request)
            .send()
            .await
            .map_err(|e| CollectError::Transient(format!("{method} request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(CollectError::Transient(format!(
                "{method} returned status {status}: {body}",
            )));
        }

        let envelope: RpcEnvelope = response
            .json()
            .await
            .map_err(|e| CollectError::Transient(format!("decoding {method} response: {e}")))?;

        if let Some(err) = envelope.error {
            return Err(CollectError::Transient(format!(
                "{method} RPC error {}: {}",
                err.code, err.message,
            )));
        }

        envelope
            .result
            .ok_or_else(|| CollectError::Transient(format!("{method}: envelope has no result")))
    }
}
