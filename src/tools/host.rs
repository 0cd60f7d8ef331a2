use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::config::ToolHostConfig;
use crate::error::{RedpilotError, Result, TransportError};
use crate::llm::backoff_with_jitter;
use crate::utils::truncate_with_marker;

use super::types::{ToolOutcome, ToolSpec};

/// The tool host port: discovery plus deadline-bounded invocation.
///
/// Implementations must be safe against arbitrarily large tool output;
/// the contract is that `call_tool` never returns more than the
/// configured byte budget.
#[async_trait]
pub trait ToolHost: Send + Sync {
    async fn list_tools(&self) -> Result<Vec<ToolSpec>>;

    /// Invoke a tool. Exceeding `deadline` yields `ToolOutcome::TimedOut`;
    /// transport failures surface as errors only after the retry budget.
    async fn call_tool(&self, name: &str, args: &Value, deadline: Duration) -> Result<ToolOutcome>;
}

/// JSON-RPC tool host transport (MCP-style `tools/list` / `tools/call`).
pub struct HttpToolHost {
    http: reqwest::Client,
    config: ToolHostConfig,
    next_id: AtomicU64,
}

impl HttpToolHost {
    pub fn new(config: ToolHostConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| RedpilotError::Config(e.to_string()))?;
        Ok(Self {
            http,
            config,
            next_id: AtomicU64::new(1),
        })
    }

    async fn rpc(&self, method: &str, params: Value) -> std::result::Result<Value, TransportError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });

        let response = self
            .http
            .post(&self.config.base_url)
            .json(&body)
            .send()
            .await
            .map_err(|e| TransportError::from_reqwest(&e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TransportError::Http {
                status: status.as_u16(),
                body: truncate_with_marker(&body, 500),
            });
        }

        let payload: Value = response
            .json()
            .await
            .map_err(|e| TransportError::Protocol(e.to_string()))?;
        if let Some(error) = payload.get("error") {
            return Err(TransportError::Protocol(error.to_string()));
        }
        Ok(payload.get("result").cloned().unwrap_or(Value::Null))
    }

    /// Retry transient transport failures with backoff; hand anything
    /// else straight back.
    async fn rpc_with_retry(&self, method: &str, params: Value) -> Result<Value> {
        let base = Duration::from_millis(self.config.backoff_base_ms);
        let mut last = None;
        for attempt in 0..=self.config.transport_retries {
            match self.rpc(method, params.clone()).await {
                Ok(result) => return Ok(result),
                Err(err) if err.is_transient() && attempt < self.config.transport_retries => {
                    let delay = backoff_with_jitter(err.suggested_delay(base), attempt);
                    warn!(method, attempt, error = %err, "transient tool host failure, retrying");
                    tokio::time::sleep(delay).await;
                    last = Some(err);
                }
                Err(err) => return Err(err.into()),
            }
        }
        Err(last
            .map(RedpilotError::Transport)
            .unwrap_or_else(|| RedpilotError::Fatal("retry loop exited without error".into())))
    }

    fn cap_output(&self, output: &str) -> (String, bool) {
        if output.len() > self.config.max_output_bytes {
            (
                truncate_with_marker(output, self.config.max_output_bytes),
                true,
            )
        } else {
            (output.to_string(), false)
        }
    }
}

#[async_trait]
impl ToolHost for HttpToolHost {
    async fn list_tools(&self) -> Result<Vec<ToolSpec>> {
        let result = self.rpc_with_retry("tools/list", json!({})).await?;
        let tools = result["tools"]
            .as_array()
            .cloned()
            .unwrap_or_default()
            .into_iter()
            .filter_map(|t| {
                Some(ToolSpec {
                    name: t["name"].as_str()?.to_string(),
                    description: t["description"].as_str().unwrap_or_default().to_string(),
                    schema: t.get("inputSchema").cloned().unwrap_or(Value::Null),
                })
            })
            .collect();
        Ok(tools)
    }

    async fn call_tool(&self, name: &str, args: &Value, deadline: Duration) -> Result<ToolOutcome> {
        let params = json!({ "name": name, "arguments": args });
        let call = self.rpc_with_retry("tools/call", params);

        let result = match tokio::time::timeout(deadline, call).await {
            Ok(result) => result?,
            Err(_) => {
                debug!(tool = name, deadline_secs = deadline.as_secs(), "tool call deadline elapsed");
                return Ok(ToolOutcome::TimedOut);
            }
        };

        // MCP-style result: content blocks plus an isError flag.
        let text = result["content"]
            .as_array()
            .map(|blocks| {
                blocks
                    .iter()
                    .filter_map(|b| b["text"].as_str())
                    .collect::<Vec<_>>()
                    .join("\n")
            })
            .unwrap_or_else(|| result.to_string());

        if result["isError"].as_bool().unwrap_or(false) {
            return Ok(ToolOutcome::Failure {
                message: truncate_with_marker(&text, self.config.max_output_bytes),
            });
        }

        let (output, truncated) = self.cap_output(&text);
        Ok(ToolOutcome::Success { output, truncated })
    }
}
