use anyhow::Result;
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{error, info};

use crate::audio::{AudioExtractor, ExtractedAudio, ExtractionRequest};
use crate::cancellation::CancellationToken;
use crate::llm::{RewriteOutput, RewriteRequest, Rewriter};
use crate::stage::{Stage, StageResult};
use crate::transcription::{Transcriber, TranscriptionOutput, TranscriptionRequest};
use crate::worker::{ShutdownPolicy, StageWorker, StopOutcome, WorkerEvent};

/// One video-to-script run
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineRequest {
    pub video_path: PathBuf,
    /// Where to write the extracted audio; a temp path by default
    pub output_audio_path: Option<PathBuf>,
    /// Stop after transcription
    pub skip_rewrite: bool,
    /// Speech model override
    pub whisper_model: Option<String>,
    /// LLM model override
    pub model: Option<String>,
    /// Style prompt override
    pub system_prompt: Option<String>,
}

/// Forwarded to the controller while a run is in flight
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum PipelineEvent {
    StageStarted(&'static str),
    Progress {
        stage: &'static str,
        percent: u8,
        message: String,
    },
    Status {
        stage: &'static str,
        message: String,
    },
}

/// Everything a successful run produced
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineReport {
    pub video_path: PathBuf,
    pub audio: ExtractedAudio,
    pub transcription: TranscriptionOutput,
    pub rewrite: Option<RewriteOutput>,
    pub started_at: DateTime<Local>,
    pub elapsed_secs: f64,
}

impl PipelineReport {
    /// Rewritten script when available, else the transcript
    pub fn final_text(&self) -> &str {
        self.rewrite
            .as_ref()
            .map_or(&self.transcription.text, |r| &r.rewritten_text)
    }

    /// Write `<ts>.json`, `<ts>.orig.txt` and (if rewritten) `<ts>.rewritten.txt`
    pub fn save(&self, dir: &Path) -> Result<PathBuf> {
        std::fs::create_dir_all(dir)?;
        let stem = format!("script_{}", self.started_at.format("%Y%m%d_%H%M%S"));

        let json_path = dir.join(format!("{}.json", stem));
        std::fs::write(&json_path, serde_json::to_string_pretty(self)?)?;
        std::fs::write(dir.join(format!("{}.orig.txt", stem)), &self.transcription.text)?;
        if let Some(rewrite) = &self.rewrite {
            std::fs::write(dir.join(format!("{}.rewritten.txt", stem)), &rewrite.rewritten_text)?;
        }

        info!("💾 Saved run report to {}", json_path.display());
        Ok(json_path)
    }
}

/// Terminal result of a run
#[derive(Debug, Clone)]
pub enum PipelineOutcome {
    Completed(PipelineReport),
    Failed { stage: &'static str, message: String },
    Cancelled { stage: &'static str },
}

impl PipelineOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, PipelineOutcome::Completed(_))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, PipelineOutcome::Cancelled { .. })
    }
}

/// Runs extraction, transcription and rewriting strictly in sequence,
/// one background worker at a time.
pub struct Coordinator<E = AudioExtractor, T = Transcriber, R = Rewriter> {
    extractor: Arc<E>,
    transcriber: Arc<T>,
    rewriter: Arc<R>,
    policy: ShutdownPolicy,
    current: Mutex<Option<StageWorker>>,
    token: Mutex<CancellationToken>,
}

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl<E, T, R> Coordinator<E, T, R>
where
    E: Stage<Input = ExtractionRequest, Output = ExtractedAudio>,
    T: Stage<Input = TranscriptionRequest, Output = TranscriptionOutput>,
    R: Stage<Input = RewriteRequest, Output = RewriteOutput>,
{
    pub fn new(extractor: Arc<E>, transcriber: Arc<T>, rewriter: Arc<R>, policy: ShutdownPolicy) -> Self {
        Self {
            extractor,
            transcriber,
            rewriter,
            policy,
            current: Mutex::new(None),
            token: Mutex::new(CancellationToken::new()),
        }
    }

    /// Whether a stage worker is currently active
    pub fn is_busy(&self) -> bool {
        locked(&self.current)
            .as_ref()
            .map_or(false, StageWorker::is_running)
    }

    /// Run the whole pipeline. Progress goes to `events`; the return value is the only terminal report.
    ///
    /// The run's token is installed when this is called, not when the future
    /// is first polled, so a `stop()` issued in between still cancels it.
    pub fn process(
        &self,
        request: PipelineRequest,
        events: UnboundedSender<PipelineEvent>,
    ) -> impl Future<Output = PipelineOutcome> + '_ {
        let token = CancellationToken::new();
        *locked(&self.token) = token.clone();
        self.run_pipeline(request, events, token)
    }

    async fn run_pipeline(
        &self,
        request: PipelineRequest,
        events: UnboundedSender<PipelineEvent>,
        token: CancellationToken,
    ) -> PipelineOutcome {
        if token.is_cancelled() {
            info!("🛑 Stopped before {} started", request.video_path.display());
            return PipelineOutcome::Cancelled {
                stage: self.extractor.name(),
            };
        }

        let started = Instant::now();
        let started_at = Local::now();
        info!("🚀 Processing {}", request.video_path.display());

        let extraction = ExtractionRequest {
            video_path: request.video_path.clone(),
            output_path: request.output_audio_path.clone(),
        };
        let audio = match self.run_stage(&self.extractor, extraction, &token, &events).await {
            StageResult::Success(audio) => audio,
            StageResult::Failure(message) => return failed(self.extractor.name(), message),
            StageResult::Cancelled => {
                return PipelineOutcome::Cancelled {
                    stage: self.extractor.name(),
                }
            }
        };

        if token.is_cancelled() {
            return PipelineOutcome::Cancelled {
                stage: self.transcriber.name(),
            };
        }
        let transcription_request = TranscriptionRequest {
            audio_path: audio.audio_path.clone(),
            model: request.whisper_model.clone(),
            language: None,
        };
        let transcription = match self
            .run_stage(&self.transcriber, transcription_request, &token, &events)
            .await
        {
            StageResult::Success(transcription) => transcription,
            StageResult::Failure(message) => return failed(self.transcriber.name(), message),
            StageResult::Cancelled => {
                return PipelineOutcome::Cancelled {
                    stage: self.transcriber.name(),
                }
            }
        };

        let rewrite = if request.skip_rewrite {
            None
        } else {
            if token.is_cancelled() {
                return PipelineOutcome::Cancelled {
                    stage: self.rewriter.name(),
                };
            }
            let rewrite_request = RewriteRequest {
                text: transcription.text.clone(),
                model: request.model.clone(),
                system_prompt: request.system_prompt.clone(),
            };
            match self.run_stage(&self.rewriter, rewrite_request, &token, &events).await {
                StageResult::Success(rewrite) => Some(rewrite),
                StageResult::Failure(message) => return failed(self.rewriter.name(), message),
                StageResult::Cancelled => {
                    return PipelineOutcome::Cancelled {
                        stage: self.rewriter.name(),
                    }
                }
            }
        };

        info!("🎉 Pipeline finished in {:.1}s", started.elapsed().as_secs_f64());
        PipelineOutcome::Completed(PipelineReport {
            video_path: request.video_path,
            audio,
            transcription,
            rewrite,
            started_at,
            elapsed_secs: started.elapsed().as_secs_f64(),
        })
    }

    /// Cancel the current run and wait (bounded) for its worker to wind down
    pub async fn stop(&self) -> StopOutcome {
        locked(&self.token).cancel();
        let current = locked(&self.current).clone();
        match current {
            Some(worker) => worker.stop(&self.policy).await,
            None => StopOutcome::Stopped,
        }
    }

    async fn run_stage<S: Stage>(
        &self,
        stage: &Arc<S>,
        input: S::Input,
        token: &CancellationToken,
        events: &UnboundedSender<PipelineEvent>,
    ) -> StageResult<S::Output> {
        let name = stage.name();
        let (worker, mut rx) = StageWorker::spawn(stage.clone(), input, token.clone());
        *locked(&self.current) = Some(worker.clone());
        let _ = events.send(PipelineEvent::StageStarted(name));

        let mut result = None;
        while let Some(event) = rx.recv().await {
            match event {
                WorkerEvent::Progress(progress) => {
                    let _ = events.send(PipelineEvent::Progress {
                        stage: name,
                        percent: progress.percent,
                        message: progress.message,
                    });
                }
                WorkerEvent::Status(message) => {
                    let _ = events.send(PipelineEvent::Status { stage: name, message });
                }
                WorkerEvent::Completed(value) => result = Some(StageResult::Success(value)),
                WorkerEvent::Failed(message) => result = Some(StageResult::Failure(message)),
                WorkerEvent::Cancelled => result = Some(StageResult::Cancelled),
            }
        }

        worker.wait().await;
        *locked(&self.current) = None;
        result.unwrap_or_else(|| StageResult::Failure(format!("{} ended without a result", name)))
    }
}

fn failed(stage: &'static str, message: String) -> PipelineOutcome {
    error!("❌ Pipeline stopped at {}: {}", stage, message);
    PipelineOutcome::Failed { stage, message }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transcription::Device;
    use tempfile::TempDir;

    fn report(rewrite: Option<RewriteOutput>) -> PipelineReport {
        PipelineReport {
            video_path: PathBuf::from("clip.mp4"),
            audio: ExtractedAudio {
                audio_path: PathBuf::from("temp/clip_extracted.wav"),
                duration: Some(30.0),
            },
            transcription: TranscriptionOutput {
                text: "你好，今天天气不错。".to_string(),
                language: Some("zh".to_string()),
                duration: Some(30.0),
                word_count: 10,
                model_used: "small".to_string(),
                device_used: Device::Cpu,
                attempt: 1,
            },
            rewrite,
            started_at: Local::now(),
            elapsed_secs: 1.0,
        }
    }

    #[test]
    fn test_save_without_rewrite() {
        let temp_dir = TempDir::new().unwrap();
        let report = report(None);

        let json_path = report.save(temp_dir.path()).unwrap();
        let saved: PipelineReport =
            serde_json::from_str(&std::fs::read_to_string(&json_path).unwrap()).unwrap();
        assert_eq!(saved.transcription.text, "你好，今天天气不错。");
        assert_eq!(report.final_text(), "你好，今天天气不错。");

        let files: Vec<_> = std::fs::read_dir(temp_dir.path()).unwrap().collect();
        assert_eq!(files.len(), 2);
    }

    #[test]
    fn test_save_with_rewrite() {
        let temp_dir = TempDir::new().unwrap();
        let report = report(Some(RewriteOutput {
            rewritten_text: "你好，今天天气不错。出去走走吧。".to_string(),
            original_text: "你好，今天天气不错。".to_string(),
            model_used: "deepseek-r1:8b".to_string(),
            original_length: 10,
            rewritten_length: 16,
            processing_time: 3.2,
        }));

        let json_path = report.save(temp_dir.path()).unwrap();
        let rewritten = json_path.with_extension("rewritten.txt");
        assert_eq!(
            std::fs::read_to_string(rewritten).unwrap(),
            "你好，今天天气不错。出去走走吧。"
        );
        assert!(report.final_text().ends_with("出去走走吧。"));
    }
}
