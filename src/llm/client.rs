use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use serde_json::json;
use tracing::{debug, warn};

use crate::config::{LlmConfig, ModelConfig};
use crate::error::{RedpilotError, Result, TransportError};

use super::reply::Role;

/// The model transport port. The runtime only needs role-annotated text
/// completion; everything structured sits above this seam, so tests drive
/// the whole runtime from a scripted fake.
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(&self, role: Role, prompt: &str) -> Result<String>;
}

/// Chat-completions transport over HTTP.
pub struct HttpLlmClient {
    http: reqwest::Client,
    config: LlmConfig,
    models: ModelConfig,
    api_key: String,
}

impl HttpLlmClient {
    pub fn new(config: LlmConfig, models: ModelConfig) -> Result<Self> {
        let api_key = std::env::var(&config.api_key_env).map_err(|_| {
            RedpilotError::Config(format!(
                "API key environment variable {} is not set",
                config.api_key_env
            ))
        })?;
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| RedpilotError::Config(e.to_string()))?;
        Ok(Self {
            http,
            config,
            models,
            api_key,
        })
    }

    async fn request_once(&self, model: &str, prompt: &str) -> std::result::Result<String, TransportError> {
        let url = format!(
            "{}/chat/completions",
            self.config.base_url.trim_end_matches('/')
        );
        let body = json!({
            "model": model,
            "messages": [{ "role": "user", "content": prompt }],
        });

        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| TransportError::from_reqwest(&e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TransportError::Http {
                status: status.as_u16(),
                body: crate::utils::truncate_with_marker(&body, 500),
            });
        }

        let payload: serde_json::Value = response
            .json()
            .await
            .map_err(|e| TransportError::Protocol(e.to_string()))?;
        payload["choices"][0]["message"]["content"]
            .as_str()
            .map(|s| s.to_string())
            .ok_or_else(|| TransportError::Protocol("reply has no message content".to_string()))
    }
}

#[async_trait]
impl LlmClient for HttpLlmClient {
    async fn complete(&self, role: Role, prompt: &str) -> Result<String> {
        let model = self.models.resolve(role).to_string();
        let base = Duration::from_millis(self.config.backoff_base_ms);

        let mut last = None;
        for attempt in 0..=self.config.transport_retries {
            match self.request_once(&model, prompt).await {
                Ok(reply) => {
                    debug!(%role, %model, attempt, bytes = reply.len(), "llm reply received");
                    return Ok(reply);
                }
                Err(err) if err.is_transient() && attempt < self.config.transport_retries => {
                    let delay = backoff_with_jitter(err.suggested_delay(base), attempt);
                    warn!(%role, attempt, error = %err, delay_ms = delay.as_millis() as u64,
                        "transient llm transport failure, retrying");
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
}

/// Exponential backoff with jitter so parallel workers do not retry in
/// lockstep.
pub(crate) fn backoff_with_jitter(base: Duration, attempt: u32) -> Duration {
    let scaled = base.saturating_mul(1u32 << attempt.min(6));
    let jitter = rand::thread_rng().gen_range(0..=100);
    scaled + Duration::from_millis(jitter)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_with_attempts() {
        let base = Duration::from_millis(100);
        let first = backoff_with_jitter(base, 0);
        let third = backoff_with_jitter(base, 2);
        assert!(first >= base);
        assert!(third >= Duration::from_millis(400));
    }
}
