pub mod ollama;
pub mod rewrite;
pub mod text;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use ollama::OllamaProvider;
pub use rewrite::{is_resource_exhaustion, BatchItem, BatchRewrites, RewriteOutput, RewriteRequest, Rewriter};

/// Transport-level failures talking to the LLM service
#[derive(thiserror::Error, Debug, Clone)]
pub enum LlmError {
    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("request timed out")]
    Timeout,

    #[error("could not decode response: {0}")]
    Decode(String),
}

impl LlmError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, LlmError::Http { status: 404, .. })
    }
}

impl From<reqwest::Error> for LlmError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            LlmError::Timeout
        } else if err.is_decode() {
            LlmError::Decode(err.to_string())
        } else {
            LlmError::Transport(err.to_string())
        }
    }
}

/// Sampling and resource options sent with every generate request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerateOptions {
    /// Context window
    pub num_ctx: u32,
    /// Max output tokens
    pub num_predict: u32,
    pub temperature: f32,
    pub top_p: f32,
    pub top_k: u32,
    pub num_thread: u32,
}

impl Default for GenerateOptions {
    fn default() -> Self {
        Self {
            num_ctx: 1024,
            num_predict: 512,
            temperature: 0.7,
            top_p: 0.9,
            top_k: 40,
            num_thread: num_cpus::get().min(4) as u32,
        }
    }
}

impl GenerateOptions {
    /// Halve context and output length, never going below the given floors
    pub fn shrunk(&self, min_ctx: u32, min_predict: u32) -> Self {
        Self {
            num_ctx: (self.num_ctx / 2).max(min_ctx),
            num_predict: (self.num_predict / 2).max(min_predict),
            ..self.clone()
        }
    }
}

/// Body of a non-streaming generate call
#[derive(Debug, Clone, Serialize)]
pub struct GenerateRequest {
    pub model: String,
    pub prompt: String,
    pub system: String,
    pub stream: bool,
    pub options: GenerateOptions,
}

/// Installed model as listed by the service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelTag {
    pub name: String,
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub modified_at: Option<String>,
}

/// Narrow contract the rewrite stage needs from an LLM service
#[async_trait]
pub trait LlmBackend: Send + Sync {
    /// Cheap liveness check
    async fn ping(&self) -> Result<(), LlmError>;

    async fn list_models(&self) -> Result<Vec<ModelTag>, LlmError>;

    /// Raw JSON body of a successful generate call
    async fn generate(&self, request: &GenerateRequest) -> Result<serde_json::Value, LlmError>;

    /// Provision a model and wait until the service reports completion
    async fn pull(&self, model: &str) -> Result<(), LlmError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shrunk_respects_floors() {
        let options = GenerateOptions {
            num_ctx: 1024,
            num_predict: 300,
            ..GenerateOptions::default()
        };

        let once = options.shrunk(512, 256);
        assert_eq!((once.num_ctx, once.num_predict), (512, 256));

        let twice = once.shrunk(512, 256);
        assert_eq!((twice.num_ctx, twice.num_predict), (512, 256));
        assert_eq!(twice.top_k, options.top_k);
    }

    #[test]
    fn test_http_error_display() {
        let err = LlmError::Http {
            status: 404,
            body: "model 'qwen2:1.5b' not found".to_string(),
        };
        assert!(err.is_not_found());
        assert_eq!(err.to_string(), "HTTP 404: model 'qwen2:1.5b' not found");
        assert!(!LlmError::Timeout.is_not_found());
    }
}
