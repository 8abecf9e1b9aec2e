use anyhow::{anyhow, bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};
use url::Url;

use super::{model_info, DecodeOptions, Device, RawTranscript, Segment, SpeechModel, SpeechRuntime, MODEL_CATALOGUE};
use crate::cancellation::CancellationToken;
use crate::error::StageError;
use crate::progress::ProgressReporter;

/// Executable names tried, in order, when none is configured
const CANDIDATE_BINARIES: &[&str] = &["whisper-cli", "whisper-cpp", "whisper"];

/// Speech runtime backed by the whisper.cpp command line tool
pub struct WhisperCliRuntime {
    binary: Option<String>,
}

impl WhisperCliRuntime {
    pub fn new(binary: Option<String>) -> Self {
        Self { binary }
    }

    /// First whisper.cpp executable that answers `--help`
    pub fn detect_binary() -> Option<String> {
        CANDIDATE_BINARIES
            .iter()
            .find(|name| check_command_available(name))
            .map(|name| name.to_string())
    }

    pub fn model_path(cache_dir: &Path, name: &str) -> PathBuf {
        cache_dir.join(format!("ggml-{}.bin", name))
    }

    /// Catalogue models whose weights are present in `cache_dir`
    pub fn installed_models(cache_dir: &Path) -> Vec<String> {
        MODEL_CATALOGUE
            .iter()
            .map(|m| m.name)
            .filter(|name| Self::model_path(cache_dir, name).exists())
            .map(str::to_string)
            .collect()
    }

    /// Delete model files not named in `keep`; returns the removed model names
    pub fn cleanup_models(cache_dir: &Path, keep: &[&str]) -> Result<Vec<String>> {
        let mut removed = Vec::new();
        if !cache_dir.is_dir() {
            return Ok(removed);
        }

        for entry in std::fs::read_dir(cache_dir)? {
            let path = entry?.path();
            let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let Some(name) = file_name
                .strip_prefix("ggml-")
                .and_then(|rest| rest.strip_suffix(".bin"))
            else {
                continue;
            };
            if keep.contains(&name) || !path.is_file() {
                continue;
            }

            match std::fs::remove_file(&path) {
                Ok(()) => {
                    info!("🗑️  Removed unused model {}", name);
                    removed.push(name.to_string());
                }
                Err(e) => warn!("Failed to remove {}: {}", path.display(), e),
            }
        }

        removed.sort();
        Ok(removed)
    }

    fn binary(&self) -> Result<String> {
        match &self.binary {
            Some(binary) => Ok(binary.clone()),
            None => Self::detect_binary()
                .ok_or_else(|| anyhow!("no whisper.cpp executable found (tried {:?})", CANDIDATE_BINARIES)),
        }
    }
}

fn check_command_available(cmd_name: &str) -> bool {
    Command::new(cmd_name)
        .arg("--help")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|status| status.success())
        .unwrap_or(false)
}

impl SpeechRuntime for WhisperCliRuntime {
    fn load(&self, name: &str, device: Device, cache_dir: &Path) -> Result<Arc<dyn SpeechModel>> {
        let model_path = Self::model_path(cache_dir, name);
        let metadata = std::fs::metadata(&model_path)
            .with_context(|| format!("model file {} not found", model_path.display()))?;
        let binary = self.binary()?;

        info!(
            "✅ Found model: {} ({:.1} MB), runner {}",
            model_path.display(),
            metadata.len() as f64 / 1_000_000.0,
            binary
        );

        Ok(Arc::new(WhisperCliModel {
            binary,
            model_path,
            device,
        }))
    }
}

/// Fetches `ggml-<model>.bin` weights into a model directory
pub struct ModelDownloader {
    client: reqwest::Client,
    base: Url,
}

impl ModelDownloader {
    pub fn new(base_url: &str) -> Result<Self> {
        let mut base = Url::parse(base_url).with_context(|| format!("invalid download URL {}", base_url))?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        Ok(Self {
            client: reqwest::Client::builder().build()?,
            base,
        })
    }

    /// Download a catalogue model unless it is already present.
    ///
    /// The file is written to `<name>.part` and renamed when complete, so an
    /// interrupted download never looks installed.
    pub async fn download(
        &self,
        name: &str,
        cache_dir: &Path,
        token: &CancellationToken,
        progress: &ProgressReporter,
    ) -> crate::error::Result<PathBuf> {
        if model_info(name).is_none() {
            return Err(StageError::InvalidInput(format!("unknown whisper model: {}", name)));
        }

        let target = WhisperCliRuntime::model_path(cache_dir, name);
        if target.is_file() {
            info!("Model {} already present at {}", name, target.display());
            progress.report(100, format!("Model {} already downloaded", name))?;
            return Ok(target);
        }

        tokio::fs::create_dir_all(cache_dir).await?;
        let partial = target.with_extension("bin.part");

        match self.fetch(name, &partial, token, progress).await {
            Ok(()) => {
                tokio::fs::rename(&partial, &target).await?;
                info!("✅ Downloaded model {} to {}", name, target.display());
                progress.report(100, format!("Model {} downloaded", name))?;
                Ok(target)
            }
            Err(e) => {
                let _ = tokio::fs::remove_file(&partial).await;
                Err(e)
            }
        }
    }

    async fn fetch(
        &self,
        name: &str,
        partial: &Path,
        token: &CancellationToken,
        progress: &ProgressReporter,
    ) -> crate::error::Result<()> {
        let url = self
            .base
            .join(&format!("ggml-{}.bin", name))
            .map_err(|e| StageError::Internal(e.to_string()))?;
        info!("📥 Downloading whisper model {} from {}", name, url);
        progress.report(0, format!("Downloading model {}...", name))?;

        let mut response = tokio::select! {
            _ = token.cancelled() => return Err(StageError::Cancelled),
            response = self.client.get(url).send() => response
                .map_err(|e| StageError::ModelLoad(format!("download of {} failed: {}", name, e)))?,
        };
        if !response.status().is_success() {
            return Err(StageError::ModelLoad(format!(
                "download of {} failed: HTTP {}",
                name,
                response.status().as_u16()
            )));
        }

        let total = response.content_length();
        let mut file = tokio::fs::File::create(partial).await?;
        let mut received: u64 = 0;

        loop {
            let chunk = tokio::select! {
                _ = token.cancelled() => return Err(StageError::Cancelled),
                chunk = response.chunk() => chunk
                    .map_err(|e| StageError::ModelLoad(format!("download of {} failed: {}", name, e)))?,
            };
            let Some(bytes) = chunk else { break };

            file.write_all(&bytes).await?;
            received += bytes.len() as u64;
            if let Some(total) = total.filter(|t| *t > 0) {
                let percent = (received * 99 / total).min(99) as u32;
                progress.report(percent, format!("Downloading model {}... {}%", name, percent))?;
            }
        }
        file.flush().await?;

        if let Some(total) = total {
            if received != total {
                return Err(StageError::ModelLoad(format!(
                    "download of {} truncated: {} of {} bytes",
                    name, received, total
                )));
            }
        }
        Ok(())
    }
}

/// A model file plus the executable that runs it
pub struct WhisperCliModel {
    binary: String,
    model_path: PathBuf,
    device: Device,
}

impl WhisperCliModel {
    fn command(&self, audio: &Path, output_base: &Path, options: &DecodeOptions) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.arg("-f")
            .arg(audio)
            .arg("-m")
            .arg(&self.model_path)
            .arg("-oj")
            .arg("-of")
            .arg(output_base)
            .arg("-t")
            .arg(options.threads.max(1).to_string())
            .arg("-tp")
            .arg(options.temperature.to_string());

        if let Some(language) = &options.language {
            cmd.arg("-l").arg(language);
        }
        if self.device == Device::Cpu {
            cmd.arg("-ng");
        }
        cmd.stdin(Stdio::null());
        cmd
    }
}

impl SpeechModel for WhisperCliModel {
    fn transcribe(&self, audio: &Path, options: &DecodeOptions) -> Result<RawTranscript> {
        let work_dir = tempfile::tempdir()?;
        let output_base = work_dir.path().join("transcript");
        let mut cmd = self.command(audio, &output_base, options);
        debug!("Executing command: {:?}", cmd);

        let output = cmd.output().with_context(|| format!("failed to run {}", self.binary))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let tail: Vec<&str> = stderr.lines().rev().take(5).collect();
            bail!(
                "{} exited with {}: {}",
                self.binary,
                output.status,
                tail.into_iter().rev().collect::<Vec<_>>().join(" | ")
            );
        }

        let json_path = output_base.with_extension("json");
        let json = std::fs::read_to_string(&json_path)
            .with_context(|| format!("missing whisper output {}", json_path.display()))?;
        parse_whisper_json(&json)
    }
}

/// Parse any of the JSON layouts whisper front-ends emit
pub fn parse_whisper_json(json: &str) -> Result<RawTranscript> {
    let output: WhisperOutput = serde_json::from_str(json)?;

    if !output.transcription.is_empty() {
        let segments: Vec<Segment> = output
            .transcription
            .iter()
            .map(|seg| Segment {
                start: parse_timestamp(&seg.timestamps.from).unwrap_or(0.0),
                end: parse_timestamp(&seg.timestamps.to).unwrap_or(0.0),
                text: seg.text.trim().to_string(),
            })
            .collect();
        let text: String = output.transcription.iter().map(|seg| seg.text.as_str()).collect();
        let language = output
            .result
            .as_ref()
            .and_then(|r| r.language.clone())
            .or(output.language);

        return Ok(RawTranscript {
            text: text.trim().to_string(),
            language,
            segments,
        });
    }

    let (text, language, raw_segments) = match output.result {
        Some(result) => (result.text, result.language, result.segments),
        None => (output.text, output.language, output.segments),
    };
    let segments: Vec<Segment> = raw_segments
        .into_iter()
        .map(|seg| Segment {
            start: seg.start,
            end: seg.end,
            text: seg.text.trim().to_string(),
        })
        .collect();
    let text = text.unwrap_or_else(|| segments.iter().map(|s| s.text.as_str()).collect());

    Ok(RawTranscript {
        text: text.trim().to_string(),
        language,
        segments,
    })
}

/// "00:01:23,456" -> 83.456
pub fn parse_timestamp(timestamp: &str) -> Result<f64> {
    let (time_part, millis) = timestamp
        .split_once(',')
        .ok_or_else(|| anyhow!("Invalid timestamp format: {}", timestamp))?;
    let milliseconds: f64 = millis.parse::<f64>()? / 1000.0;

    let components: Vec<&str> = time_part.split(':').collect();
    if components.len() != 3 {
        bail!("Invalid time format: {}", time_part);
    }

    let hours: f64 = components[0].parse()?;
    let minutes: f64 = components[1].parse()?;
    let seconds: f64 = components[2].parse()?;
    Ok(hours * 3600.0 + minutes * 60.0 + seconds + milliseconds)
}

#[derive(Debug, Clone, Deserialize)]
struct WhisperOutput {
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    language: Option<String>,
    #[serde(default)]
    segments: Vec<WhisperSegment>,
    #[serde(default)]
    transcription: Vec<WhisperTranscriptionSegment>,
    #[serde(default)]
    result: Option<WhisperResult>,
}

#[derive(Debug, Clone, Deserialize)]
struct WhisperResult {
    #[serde(default)]
    language: Option<String>,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    segments: Vec<WhisperSegment>,
}

#[derive(Debug, Clone, Deserialize)]
struct WhisperTranscriptionSegment {
    timestamps: WhisperTimestamps,
    text: String,
}

#[derive(Debug, Clone, Deserialize)]
struct WhisperTimestamps {
    from: String,
    to: String,
}

#[derive(Debug, Clone, Deserialize)]
struct WhisperSegment {
    start: f64,
    end: f64,
    text: String,
}
