use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::text::{ensure_same_opening, extract_response_text, strip_boilerplate};
use super::{GenerateOptions, GenerateRequest, LlmBackend, LlmError};
use crate::cancellation::CancellationToken;
use crate::config::LlmConfig;
use crate::error::{Result, StageError};
use crate::progress::ProgressReporter;
use crate::stage::{Stage, StageResult};

/// Styles used by [`Rewriter::rewrite_styles`] when none are given
pub const DEFAULT_STYLES: &[&str] = &[
    "保持原有风格，但优化表达",
    "更加生动有趣，增加感染力",
    "更加专业正式，突出重点",
    "更加简洁明了，便于理解",
];

/// Error text signatures of the service running out of memory for a model
const EXHAUSTION_PATTERNS: &[&str] = &["memory layout cannot be allocated", "unable to allocate"];

/// Does this error text mean the service could not fit the request in memory?
pub fn is_resource_exhaustion(message: &str) -> bool {
    EXHAUSTION_PATTERNS.iter().any(|p| message.contains(p))
}

fn build_prompt(text: &str) -> String {
    format!(
        "请严格根据系统提示词进行仿写。\n要求：只输出仿写后的文案，不要输出任何解释或多余内容。\n原文如下：\n{}\n",
        text
    )
}

/// Input of the rewrite stage
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RewriteRequest {
    pub text: String,
    /// Overrides the configured model
    pub model: Option<String>,
    /// Overrides the configured system prompt
    pub system_prompt: Option<String>,
}

/// Successful rewrite
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RewriteOutput {
    pub rewritten_text: String,
    pub original_text: String,
    pub model_used: String,
    /// In characters
    pub original_length: usize,
    /// In characters
    pub rewritten_length: usize,
    /// Seconds spent in the successful request
    pub processing_time: f64,
}

/// Result of [`Rewriter::test_connection`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionReport {
    pub connected: bool,
    pub available_models: Vec<String>,
    pub current_model: String,
    pub model_available: bool,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StyleRewrite {
    pub style: String,
    pub text: String,
    pub model: String,
    pub processing_time: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StyleRewrites {
    pub original_text: String,
    pub results: Vec<StyleRewrite>,
    pub total_styles: usize,
}

/// One entry of [`Rewriter::rewrite_batch`]; exactly one of `output` and `error` is set
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchItem {
    pub index: usize,
    pub output: Option<RewriteOutput>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchRewrites {
    pub total_texts: usize,
    pub successful_texts: usize,
    pub results: Vec<BatchItem>,
}

impl BatchRewrites {
    /// Share of texts rewritten; 0.0 for an empty batch
    pub fn success_rate(&self) -> f64 {
        if self.total_texts == 0 {
            0.0
        } else {
            self.successful_texts as f64 / self.total_texts as f64
        }
    }
}

/// Rewrite stage: retry with backoff, then degrade before giving up
pub struct Rewriter {
    backend: Arc<dyn LlmBackend>,
    config: LlmConfig,
    classifier: fn(&str) -> bool,
}

impl Rewriter {
    pub fn new(backend: Arc<dyn LlmBackend>, config: LlmConfig) -> Self {
        Self {
            backend,
            config,
            classifier: is_resource_exhaustion,
        }
    }

    /// Replace the resource-exhaustion classifier
    pub fn with_classifier(mut self, classifier: fn(&str) -> bool) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn config(&self) -> &LlmConfig {
        &self.config
    }

    /// Probe the service and list installed models
    pub async fn test_connection(&self) -> ConnectionReport {
        let mut report = ConnectionReport {
            connected: false,
            available_models: Vec::new(),
            current_model: self.config.model.clone(),
            model_available: false,
            error: None,
        };

        if let Err(e) = self.backend.ping().await {
            report.error = Some(format!("cannot reach LLM service: {}", e));
            return report;
        }
        report.connected = true;

        match self.backend.list_models().await {
            Ok(models) => {
                report.available_models = models.into_iter().map(|m| m.name).collect();
                report.model_available = report.available_models.contains(&self.config.model);
            }
            Err(e) => report.error = Some(format!("could not list models: {}", e)),
        }

        report
    }

    pub async fn rewrite(
        &self,
        text: &str,
        model: Option<&str>,
        system_prompt: Option<&str>,
        token: &CancellationToken,
        progress: &ProgressReporter,
    ) -> Result<RewriteOutput> {
        if text.trim().is_empty() {
            return Err(StageError::InvalidInput("text to rewrite is empty".to_string()));
        }
        token.checkpoint()?;

        let model = model.unwrap_or(&self.config.model).to_string();
        let system = system_prompt.unwrap_or(&self.config.system_prompt).to_string();
        info!("🦙 Starting rewrite with {} ({} chars)", model, text.chars().count());

        let report = tokio::select! {
            _ = token.cancelled() => return Err(StageError::Cancelled),
            report = self.test_connection() => report,
        };
        if !report.connected {
            return Err(StageError::Connectivity(
                report.error.unwrap_or_else(|| "LLM service unavailable".to_string()),
            ));
        }
        if !report.available_models.contains(&model) {
            warn!("⚠️  Model {} is not listed by the service", model);
        }

        progress.report(10, "Preparing rewrite...")?;
        progress.report(30, "Sending request to LLM service...")?;

        let mut request = GenerateRequest {
            model,
            prompt: build_prompt(text),
            system,
            stream: false,
            options: self.config.options.clone(),
        };

        let (body, elapsed) = self.generate_with_fallbacks(&mut request, token, progress).await?;

        progress.report(90, "Processing LLM response...")?;
        let extracted = extract_response_text(&body);
        let cleaned = strip_boilerplate(&extracted);
        if cleaned.is_empty() {
            return Err(StageError::EmptyRewrite);
        }
        let rewritten = ensure_same_opening(text, cleaned);

        info!("✅ Rewrite finished: {} chars", rewritten.chars().count());
        progress.report(100, "Rewrite complete")?;

        Ok(RewriteOutput {
            original_length: text.chars().count(),
            rewritten_length: rewritten.chars().count(),
            rewritten_text: rewritten,
            original_text: text.to_string(),
            model_used: request.model,
            processing_time: elapsed.as_secs_f64(),
        })
    }

    /// Rewrite once per style, appending the style to the system prompt.
    /// Failed styles are skipped; cancellation stops the whole batch.
    pub async fn rewrite_styles(
        &self,
        text: &str,
        styles: &[String],
        token: &CancellationToken,
        progress: &ProgressReporter,
    ) -> Result<StyleRewrites> {
        let total = styles.len();
        let mut results = Vec::new();

        for (i, style) in styles.iter().enumerate() {
            progress.report(
                (i * 100 / total.max(1)) as u32,
                format!("Style {}/{}: {}", i + 1, total, style.chars().take(20).collect::<String>()),
            )?;

            let prompt = format!("{}\n\n改写风格：{}", self.config.system_prompt, style);
            let inner = ProgressReporter::silent(token.clone());
            match self.rewrite(text, None, Some(&prompt), token, &inner).await {
                Ok(output) => results.push(StyleRewrite {
                    style: style.clone(),
                    text: output.rewritten_text,
                    model: output.model_used,
                    processing_time: output.processing_time,
                }),
                Err(StageError::Cancelled) => return Err(StageError::Cancelled),
                Err(e) => warn!("Style {} failed: {}", i + 1, e),
            }
        }

        progress.report(100, "Multi-style rewrite complete")?;
        Ok(StyleRewrites {
            original_text: text.to_string(),
            results,
            total_styles: total,
        })
    }

    /// Rewrite several texts in order with the configured model and prompt.
    /// Per-text failures are recorded; cancellation stops the whole batch.
    pub async fn rewrite_batch(
        &self,
        texts: &[String],
        token: &CancellationToken,
        progress: &ProgressReporter,
    ) -> Result<BatchRewrites> {
        let total = texts.len();
        let mut results = Vec::with_capacity(total);

        for (index, text) in texts.iter().enumerate() {
            progress.report(
                (index * 100 / total.max(1)) as u32,
                format!("Rewriting text {}/{}", index + 1, total),
            )?;

            let inner = ProgressReporter::silent(token.clone());
            let item = match self.rewrite(text, None, None, token, &inner).await {
                Ok(output) => BatchItem {
                    index,
                    output: Some(output),
                    error: None,
                },
                Err(StageError::Cancelled) => return Err(StageError::Cancelled),
                Err(e) => {
                    warn!("Text {} failed: {}", index + 1, e);
                    BatchItem {
                        index,
                        output: None,
                        error: Some(e.to_string()),
                    }
                }
            };
            results.push(item);
        }

        let successful_texts = results.iter().filter(|r| r.output.is_some()).count();
        info!("📦 Batch rewrite finished: {}/{} succeeded", successful_texts, total);
        progress.report(100, "Batch rewrite complete")?;
        Ok(BatchRewrites {
            total_texts: total,
            successful_texts,
            results,
        })
    }

    fn is_exhaustion(&self, err: &StageError) -> bool {
        matches!(err, StageError::Llm(e) if (self.classifier)(&e.to_string()))
    }

    /// Backoff sequence, then context shrink, then fallback model (pulled on 404)
    async fn generate_with_fallbacks(
        &self,
        request: &mut GenerateRequest,
        token: &CancellationToken,
        progress: &ProgressReporter,
    ) -> Result<(Value, Duration)> {
        let mut attempts = 0;

        let mut last = match self.generate_with_retry(request, &mut attempts, token, progress).await {
            Ok(done) => return Ok(done),
            Err(e) => e,
        };

        if last.is_retryable() && self.is_exhaustion(&last) {
            request.options = shrink(&request.options, &self.config);
            warn!(
                "🔻 Out of memory, retrying with num_ctx={} num_predict={}",
                request.options.num_ctx, request.options.num_predict
            );
            last = match self.generate_with_retry(request, &mut attempts, token, progress).await {
                Ok(done) => return Ok(done),
                Err(e) => e,
            };
        }

        if last.is_retryable() && self.is_exhaustion(&last) {
            let fallback = self.config.fallback_model.clone();
            warn!("🔻 {} still out of memory, switching to {}", request.model, fallback);
            request.model = fallback;
            last = match self.generate_with_retry(request, &mut attempts, token, progress).await {
                Ok(done) => return Ok(done),
                Err(e) => e,
            };

            if matches!(&last, StageError::Llm(e) if e.is_not_found()) {
                progress.report(35, format!("Model {} not found, pulling...", request.model))?;
                let pulled = tokio::select! {
                    _ = token.cancelled() => return Err(StageError::Cancelled),
                    pulled = self.backend.pull(&request.model) => pulled,
                };
                match pulled {
                    Ok(()) => {
                        info!("📥 Pulled {}, retrying", request.model);
                        last = match self.generate_with_retry(request, &mut attempts, token, progress).await {
                            Ok(done) => return Ok(done),
                            Err(e) => e,
                        };
                    }
                    Err(e) => warn!("Model pull failed: {}", e),
                }
            }
        }

        if last.is_cancelled() {
            return Err(last);
        }
        Err(StageError::RetriesExhausted {
            stage: "rewrite",
            attempts,
            last: Box::new(last),
        })
    }

    /// Up to `max_retries` attempts with `delay * 2^attempt` between them
    async fn generate_with_retry(
        &self,
        request: &GenerateRequest,
        attempts: &mut u32,
        token: &CancellationToken,
        progress: &ProgressReporter,
    ) -> Result<(Value, Duration)> {
        let max = self.config.max_retries.max(1);
        let mut last: Option<LlmError> = None;

        for attempt in 0..max {
            progress.report(50, format!("LLM processing (attempt {}/{})", attempt + 1, max))?;

            let started = Instant::now();
            let outcome = tokio::select! {
                _ = token.cancelled() => return Err(StageError::Cancelled),
                outcome = self.backend.generate(request) => outcome,
            };
            *attempts += 1;

            match outcome {
                Ok(body) => {
                    debug!("LLM answered in {:.1}s", started.elapsed().as_secs_f64());
                    return Ok((body, started.elapsed()));
                }
                Err(e) => {
                    warn!("Request failed (attempt {}/{}): {}", attempt + 1, max, e);
                    last = Some(e);
                }
            }

            if attempt + 1 < max {
                let wait = self.config.retry_delay().mul_f64(2f64.powi(attempt as i32));
                info!("⏳ Retrying in {:.1}s", wait.as_secs_f64());
                token.sleep(wait).await?;
            }
        }

        Err(last
            .map(StageError::Llm)
            .unwrap_or_else(|| StageError::Internal("no request attempted".to_string())))
    }
}

fn shrink(options: &GenerateOptions, config: &LlmConfig) -> GenerateOptions {
    options.shrunk(config.min_num_ctx, config.min_num_predict)
}

#[async_trait]
impl Stage for Rewriter {
    type Input = RewriteRequest;
    type Output = RewriteOutput;

    fn name(&self) -> &'static str {
        "rewrite"
    }

    async fn run(
        &self,
        input: RewriteRequest,
        token: &CancellationToken,
        progress: &ProgressReporter,
    ) -> StageResult<RewriteOutput> {
        let result = self
            .rewrite(
                &input.text,
                input.model.as_deref(),
                input.system_prompt.as_deref(),
                token,
                progress,
            )
            .await;
        StageResult::from_result(self.name(), result)
    }
}
