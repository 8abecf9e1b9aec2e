use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

use super::{DecodeOptions, Device, ModelCache};
use crate::cancellation::{wait_blocking, CancellationToken, Waited};
use crate::config::WhisperConfig;
use crate::error::{Result, StageError};
use crate::progress::ProgressReporter;
use crate::stage::{Stage, StageResult};

/// Input of the transcription stage
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptionRequest {
    pub audio_path: PathBuf,
    /// Overrides the configured model
    pub model: Option<String>,
    /// Overrides the configured language hint
    pub language: Option<String>,
}

impl TranscriptionRequest {
    pub fn new(audio_path: PathBuf) -> Self {
        Self {
            audio_path,
            model: None,
            language: None,
        }
    }
}

/// Successful transcription
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptionOutput {
    pub text: String,
    pub language: Option<String>,
    /// End of the last segment, in seconds
    pub duration: Option<f64>,
    /// Non-whitespace characters; Chinese text has no word separators
    pub word_count: usize,
    pub model_used: String,
    pub device_used: Device,
    /// 1-based attempt that succeeded
    pub attempt: u32,
}

/// Synthetic progress while inference runs: 30% rising to at most 90%
pub fn estimated_progress(elapsed: Duration, timeout: Duration) -> u32 {
    if timeout.is_zero() {
        return 90;
    }
    let share = (elapsed.as_secs_f64() / timeout.as_secs_f64() * 60.0).floor() as u32;
    (30 + share).min(90)
}

/// Transcription stage: cached model, bounded inference, fixed-delay retries
pub struct Transcriber {
    cache: Arc<ModelCache>,
    config: WhisperConfig,
}

impl Transcriber {
    pub fn new(cache: Arc<ModelCache>, config: WhisperConfig) -> Self {
        Self { cache, config }
    }

    pub fn cache(&self) -> &Arc<ModelCache> {
        &self.cache
    }

    pub async fn transcribe(
        &self,
        request: &TranscriptionRequest,
        token: &CancellationToken,
        progress: &ProgressReporter,
    ) -> Result<TranscriptionOutput> {
        let metadata = tokio::fs::metadata(&request.audio_path).await.map_err(|_| {
            StageError::InvalidInput(format!("audio file not found: {}", request.audio_path.display()))
        })?;
        if metadata.len() == 0 {
            return Err(StageError::InvalidInput(format!(
                "audio file is empty: {}",
                request.audio_path.display()
            )));
        }

        let attempts = self.config.max_retries + 1;
        let mut last = None;

        for attempt in 1..=attempts {
            token.checkpoint()?;
            if attempt > 1 {
                progress.status(format!("Retrying transcription ({}/{})...", attempt, attempts))?;
            }

            match self.attempt(request, attempt, token, progress).await {
                Ok(output) => return Ok(output),
                Err(e) if !e.is_retryable() => return Err(e),
                Err(e) => {
                    warn!("⚠️  Transcription attempt {}/{} failed: {}", attempt, attempts, e);
                    last = Some(e);
                }
            }

            if attempt < attempts {
                token.sleep(self.config.retry_delay()).await?;
            }
        }

        Err(StageError::RetriesExhausted {
            stage: "transcription",
            attempts,
            last: Box::new(last.unwrap_or_else(|| StageError::Internal("no attempt made".to_string()))),
        })
    }

    async fn attempt(
        &self,
        request: &TranscriptionRequest,
        attempt: u32,
        token: &CancellationToken,
        progress: &ProgressReporter,
    ) -> Result<TranscriptionOutput> {
        let model_name = request.model.as_deref().unwrap_or(&self.config.model);
        let device = Device::resolve(self.config.device);
        let force_reload = self.config.force_reload && attempt == 1;

        let loaded = self
            .cache
            .get_or_load(model_name, device, force_reload, token, progress)
            .await?;

        progress.report(30, "Transcribing...")?;

        // The deadline also covers waiting for the inference slot, which an
        // abandoned inference from an earlier attempt may still hold.
        let timeout = self.config.timeout();
        let deadline = Instant::now() + timeout;
        let permit = match tokio::time::timeout_at(deadline, self.cache.acquire_inference(token)).await {
            Ok(permit) => permit?,
            Err(_) => {
                warn!(
                    "⏰ Inference slot still busy after {:.1}s; giving up on this attempt",
                    timeout.as_secs_f64()
                );
                return Err(StageError::TranscriptionTimeout(timeout));
            }
        };

        let options = DecodeOptions {
            language: request.language.clone().or_else(|| self.config.language.clone()),
            temperature: self.config.temperature,
            threads: self.config.threads,
        };
        let model = loaded.model.clone();
        let audio = request.audio_path.clone();
        info!("🎤 Transcribing {} with {} (attempt {})", audio.display(), loaded.name, attempt);

        // The permit travels with the call so an abandoned inference keeps the slot.
        let mut handle = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            model.transcribe(&audio, &options)
        });

        let waited = wait_blocking(
            &mut handle,
            token,
            self.config.poll_interval(),
            Some(deadline),
            |elapsed| {
                progress.report(
                    estimated_progress(elapsed, timeout),
                    format!("Transcribing... {}s elapsed", elapsed.as_secs()),
                )
            },
        )
        .await;

        let raw = match waited {
            Waited::Finished(joined) => joined?.map_err(|e| StageError::Transcription(format!("{:#}", e)))?,
            Waited::Cancelled => {
                info!("🛑 Transcription cancelled; in-flight inference will be discarded");
                return Err(StageError::Cancelled);
            }
            Waited::TimedOut => {
                warn!("⏰ Transcription exceeded {:.1}s; abandoning inference", timeout.as_secs_f64());
                return Err(StageError::TranscriptionTimeout(timeout));
            }
        };

        token.checkpoint()?;
        let text = raw.text.trim();
        if text.is_empty() {
            return Err(StageError::NoSpeech);
        }

        let output = TranscriptionOutput {
            text: text.to_string(),
            language: raw.language.clone(),
            duration: raw.duration(),
            word_count: text.chars().filter(|c| !c.is_whitespace()).count(),
            model_used: loaded.name.clone(),
            device_used: loaded.device,
            attempt,
        };

        progress.report(100, "Transcription complete")?;
        info!(
            "✅ Transcribed {} characters (attempt {})",
            output.word_count, output.attempt
        );
        Ok(output)
    }
}

#[async_trait]
impl Stage for Transcriber {
    type Input = TranscriptionRequest;
    type Output = TranscriptionOutput;

    fn name(&self) -> &'static str {
        "transcription"
    }

    async fn run(
        &self,
        input: TranscriptionRequest,
        token: &CancellationToken,
        progress: &ProgressReporter,
    ) -> StageResult<TranscriptionOutput> {
        let result = self.transcribe(&input, token, progress).await;
        StageResult::from_result(self.name(), result)
    }
}
