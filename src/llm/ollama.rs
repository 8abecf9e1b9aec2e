use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::debug;
use url::Url;

use super::{GenerateRequest, LlmBackend, LlmError, ModelTag};
use crate::config::LlmConfig;

/// Model pulls download gigabytes; they get far more time than a generate call
const PULL_TIMEOUT: Duration = Duration::from_secs(3600);

/// HTTP client for a local Ollama server
pub struct OllamaProvider {
    base: Url,
    client: Client,
    probe_timeout: Duration,
}

#[derive(Debug, Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<ModelTag>,
}

impl OllamaProvider {
    pub fn new(config: &LlmConfig) -> Result<Self, LlmError> {
        let mut base = Url::parse(&config.base_url)
            .map_err(|e| LlmError::Transport(format!("invalid base URL {}: {}", config.base_url, e)))?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            base,
            client,
            probe_timeout: Duration::from_secs(config.probe_timeout_secs),
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base
    }

    fn endpoint(&self, path: &str) -> Result<Url, LlmError> {
        self.base
            .join(path)
            .map_err(|e| LlmError::Transport(format!("bad endpoint {}: {}", path, e)))
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response, LlmError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(LlmError::Http {
            status: status.as_u16(),
            body,
        })
    }
}

#[async_trait]
impl LlmBackend for OllamaProvider {
    async fn ping(&self) -> Result<(), LlmError> {
        let response = self
            .client
            .get(self.base.clone())
            .timeout(self.probe_timeout)
            .send()
            .await?;
        Self::check(response).await.map(|_| ())
    }

    async fn list_models(&self) -> Result<Vec<ModelTag>, LlmError> {
        let response = self
            .client
            .get(self.endpoint("api/tags")?)
            .timeout(self.probe_timeout)
            .send()
            .await?;
        let tags: TagsResponse = Self::check(response).await?.json().await?;
        Ok(tags.models)
    }

    async fn generate(&self, request: &GenerateRequest) -> Result<Value, LlmError> {
        debug!(
            "Sending generate request for {} (num_ctx={}, num_predict={})",
            request.model, request.options.num_ctx, request.options.num_predict
        );

        let response = self
            .client
            .post(self.endpoint("api/generate")?)
            .json(request)
            .send()
            .await?;

        Ok(Self::check(response).await?.json().await?)
    }

    async fn pull(&self, model: &str) -> Result<(), LlmError> {
        let response = self
            .client
            .post(self.endpoint("api/pull")?)
            .timeout(PULL_TIMEOUT)
            .json(&json!({ "name": model, "stream": false }))
            .send()
            .await?;

        let body: Value = Self::check(response).await?.json().await?;
        if let Some(error) = body.get("error").and_then(Value::as_str) {
            return Err(LlmError::Transport(format!("pull of {} failed: {}", model, error)));
        }
        Ok(())
    }
}
