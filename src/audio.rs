use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::cancellation::CancellationToken;
use crate::config::AudioConfig;
use crate::error::{Result, StageError};
use crate::progress::ProgressReporter;
use crate::stage::{Stage, StageResult};

/// Characters dropped from file stems when naming extracted audio
const STEM_NOISE: &[&str] = &["！", "？", "……", "——", "---"];
const MAX_STEM_CHARS: usize = 30;
const PROBE_TIMEOUT: Duration = Duration::from_secs(30);
/// Stderr lines kept for the failure log
const STDERR_TAIL: usize = 8;

/// Input of the extraction stage
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionRequest {
    pub video_path: PathBuf,
    /// Defaults to `<temp_dir>/<clean stem>_extracted.<format>`
    pub output_path: Option<PathBuf>,
}

/// Successful extraction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedAudio {
    pub audio_path: PathBuf,
    /// Seconds; `None` when the duration probe is unavailable
    pub duration: Option<f64>,
}

/// Result of [`AudioExtractor::validate_audio_file`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioFileCheck {
    pub path: PathBuf,
    pub size_bytes: u64,
    pub duration: Option<f64>,
}

/// Turns transcoder diagnostics into a percentage
pub struct ProgressParser {
    duration_re: Regex,
    time_re: Regex,
    total: Option<f64>,
}

impl ProgressParser {
    pub fn new() -> std::result::Result<Self, regex::Error> {
        Ok(Self {
            duration_re: Regex::new(r"Duration:\s*(\d{2}):(\d{2}):(\d{2}(?:\.\d+)?)")?,
            time_re: Regex::new(r"time=\s*(\d{2}):(\d{2}):(\d{2}(?:\.\d+)?)")?,
            total: None,
        })
    }

    pub fn total_seconds(&self) -> Option<f64> {
        self.total
    }

    /// Feed one line; returns a percentage once both markers have been seen
    pub fn feed(&mut self, line: &str) -> Option<u32> {
        if self.total.is_none() {
            if let Some(total) = capture_seconds(&self.duration_re, line) {
                self.total = Some(total);
                return None;
            }
        }

        let position = capture_seconds(&self.time_re, line)?;
        let total = self.total.filter(|t| *t > 0.0)?;
        Some((position / total * 100.0).round().clamp(0.0, 100.0) as u32)
    }
}

fn capture_seconds(re: &Regex, line: &str) -> Option<f64> {
    let caps = re.captures(line)?;
    let hours: f64 = caps.get(1)?.as_str().parse().ok()?;
    let minutes: f64 = caps.get(2)?.as_str().parse().ok()?;
    let seconds: f64 = caps.get(3)?.as_str().parse().ok()?;
    Some(hours * 3600.0 + minutes * 60.0 + seconds)
}

/// Decode whatever bytes the transcoder printed, dropping anything undecodable
pub fn decode_lossy(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).replace('\u{FFFD}', "")
}

/// Split a chunk of output on `\r` or `\n`, carrying partial lines over in `pending`
pub fn split_progress_lines(pending: &mut Vec<u8>, chunk: &[u8]) -> Vec<String> {
    let mut lines = Vec::new();
    for &byte in chunk {
        if byte == b'\r' || byte == b'\n' {
            if !pending.is_empty() {
                lines.push(decode_lossy(pending));
                pending.clear();
            }
        } else {
            pending.push(byte);
        }
    }
    lines
}

/// File stem with noisy punctuation removed, capped at 30 characters
pub fn clean_stem(stem: &str) -> String {
    let mut cleaned = stem.to_string();
    for noise in STEM_NOISE {
        cleaned = cleaned.replace(noise, "");
    }
    let cleaned: String = cleaned.trim().chars().take(MAX_STEM_CHARS).collect();
    if cleaned.is_empty() {
        "audio".to_string()
    } else {
        cleaned
    }
}

/// Media extraction stage over an external ffmpeg
#[derive(Clone)]
pub struct AudioExtractor {
    config: AudioConfig,
}

impl AudioExtractor {
    pub fn new(config: AudioConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &AudioConfig {
        &self.config
    }

    pub fn default_output_path(&self, video_path: &Path) -> PathBuf {
        let stem = video_path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        self.config
            .temp_dir
            .join(format!("{}_extracted.{}", clean_stem(&stem), self.config.format))
    }

    /// Transcoder arguments; identical inputs give identical command lines
    pub fn build_args(&self, input: &Path, output: &Path) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec!["-i".into(), input.as_os_str().to_owned()];
        for arg in [
            "-vn".to_string(),
            "-acodec".to_string(),
            self.config.codec.clone(),
            "-ar".to_string(),
            self.config.sample_rate.to_string(),
            "-ac".to_string(),
            self.config.channels.to_string(),
            "-q:a".to_string(),
            self.config.quality.qscale().to_string(),
            "-y".to_string(),
        ] {
            args.push(arg.into());
        }
        args.push(output.as_os_str().to_owned());
        args
    }

    /// Extract the audio track, streaming progress, with one plain retry on failure
    pub async fn extract(
        &self,
        video_path: &Path,
        output_path: Option<&Path>,
        token: &CancellationToken,
        progress: &ProgressReporter,
    ) -> Result<ExtractedAudio> {
        if !video_path.is_file() {
            return Err(StageError::InvalidInput(format!(
                "video file not found: {}",
                video_path.display()
            )));
        }
        token.checkpoint()?;

        let audio_path = output_path
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.default_output_path(video_path));
        if let Some(parent) = audio_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }

        info!("🎵 Extracting audio: {} -> {}", video_path.display(), audio_path.display());
        progress.report(0, "Starting audio extraction...")?;

        match self.run_with_progress(video_path, &audio_path, token, progress).await {
            Ok(()) => {}
            Err(StageError::Cancelled) => return Err(StageError::Cancelled),
            Err(e) => {
                warn!("⚠️  Progress-mode extraction failed ({}), retrying without progress", e);
                token.checkpoint()?;
                progress.status("Retrying audio extraction...")?;
                self.run_plain(video_path, &audio_path, token).await?;
            }
        }

        if !audio_path.is_file() {
            return Err(StageError::Transcoder(format!(
                "transcoder reported success but {} is missing",
                audio_path.display()
            )));
        }

        let duration = self.probe_duration(&audio_path).await;
        progress.report(100, "Audio extraction complete")?;
        info!(
            "✅ Audio extracted: {} ({})",
            audio_path.display(),
            duration.map_or("unknown length".to_string(), |d| format!("{:.1}s", d))
        );

        Ok(ExtractedAudio { audio_path, duration })
    }

    async fn run_with_progress(
        &self,
        input: &Path,
        output: &Path,
        token: &CancellationToken,
        progress: &ProgressReporter,
    ) -> Result<()> {
        let mut child = Command::new(&self.config.ffmpeg_path)
            .args(self.build_args(input, output))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| StageError::Transcoder(format!("cannot start {}: {}", self.config.ffmpeg_path, e)))?;

        let mut stderr = child
            .stderr
            .take()
            .ok_or_else(|| StageError::Internal("transcoder stderr not captured".to_string()))?;

        match stream_progress(&mut stderr, token, progress).await {
            Ok(tail) => {
                let status = child.wait().await?;
                if status.success() {
                    Ok(())
                } else {
                    debug!("Transcoder stderr tail:\n{}", tail.join("\n"));
                    Err(StageError::Transcoder(format!("transcoder exited with {}", status)))
                }
            }
            Err(StageError::Cancelled) => {
                // Let the process finish on its own; only stop listening.
                tokio::spawn(async move {
                    let _ = tokio::io::copy(&mut stderr, &mut tokio::io::sink()).await;
                    let _ = child.wait().await;
                });
                Err(StageError::Cancelled)
            }
            Err(e) => {
                let _ = tokio::io::copy(&mut stderr, &mut tokio::io::sink()).await;
                let _ = child.wait().await;
                Err(e)
            }
        }
    }

    async fn run_plain(&self, input: &Path, output: &Path, token: &CancellationToken) -> Result<()> {
        let limit = self.config.timeout();
        let mut command = Command::new(&self.config.ffmpeg_path);
        command
            .args(self.build_args(input, output))
            .stdin(Stdio::null())
            .kill_on_drop(true);

        // Spawned so that cancellation stops the wait without dropping the process.
        let mut handle = tokio::spawn(async move { tokio::time::timeout(limit, command.output()).await });

        let joined = tokio::select! {
            _ = token.cancelled() => return Err(StageError::Cancelled),
            joined = &mut handle => joined?,
        };

        let output = joined.map_err(|_| StageError::TranscoderTimeout(limit))??;
        if output.status.success() {
            Ok(())
        } else {
            let stderr = decode_lossy(&output.stderr);
            let tail: Vec<&str> = stderr.lines().rev().take(STDERR_TAIL).collect();
            debug!("Transcoder stderr tail:\n{}", tail.into_iter().rev().collect::<Vec<_>>().join("\n"));
            Err(StageError::Transcoder(format!("transcoder exited with {}", output.status)))
        }
    }

    /// Duration in seconds via ffprobe. Missing tooling is only a warning.
    pub async fn probe_duration(&self, path: &Path) -> Option<f64> {
        let probe = Command::new(&self.config.ffprobe_path)
            .args(["-v", "quiet", "-print_format", "json", "-show_format"])
            .arg(path)
            .kill_on_drop(true)
            .output();

        let output = match tokio::time::timeout(PROBE_TIMEOUT, probe).await {
            Ok(Ok(output)) if output.status.success() => output,
            Ok(Ok(output)) => {
                warn!("Duration probe failed for {} ({})", path.display(), output.status);
                return None;
            }
            Ok(Err(e)) => {
                warn!("Duration probe unavailable ({}): {}", self.config.ffprobe_path, e);
                return None;
            }
            Err(_) => {
                warn!("Duration probe timed out for {}", path.display());
                return None;
            }
        };

        let json: serde_json::Value = serde_json::from_slice(&output.stdout).ok()?;
        json["format"]["duration"]
            .as_str()
            .and_then(|s| s.parse::<f64>().ok())
    }

    /// Check that an audio file exists, is non-empty, and report its length
    pub async fn validate_audio_file(&self, path: &Path) -> Result<AudioFileCheck> {
        let metadata = tokio::fs::metadata(path)
            .await
            .map_err(|_| StageError::InvalidInput(format!("audio file not found: {}", path.display())))?;

        if !metadata.is_file() || metadata.len() == 0 {
            return Err(StageError::InvalidInput(format!(
                "audio file is empty: {}",
                path.display()
            )));
        }

        Ok(AudioFileCheck {
            path: path.to_path_buf(),
            size_bytes: metadata.len(),
            duration: self.probe_duration(path).await,
        })
    }

    /// Remove one file, or every `*_extracted.*` file in the temp directory
    pub async fn cleanup_temp_files(&self, specific: Option<&Path>) -> Result<usize> {
        if let Some(path) = specific {
            if path.exists() {
                tokio::fs::remove_file(path).await?;
                info!("🧹 Removed temporary audio {}", path.display());
                return Ok(1);
            }
            return Ok(0);
        }

        if !self.config.temp_dir.exists() {
            return Ok(0);
        }

        let mut entries = tokio::fs::read_dir(&self.config.temp_dir).await?;
        let mut cleaned_files = 0;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let is_extracted = path
                .file_name()
                .map_or(false, |name| name.to_string_lossy().contains("_extracted."));
            if !is_extracted {
                continue;
            }
            match tokio::fs::remove_file(&path).await {
                Ok(()) => cleaned_files += 1,
                Err(e) => warn!("Failed to remove temp file {}: {}", path.display(), e),
            }
        }

        if cleaned_files > 0 {
            info!("🧹 Cleaned up {} temporary audio files", cleaned_files);
        }
        Ok(cleaned_files)
    }
}

/// Read transcoder stderr until EOF, reporting progress; returns the last lines
async fn stream_progress<R>(
    stderr: &mut R,
    token: &CancellationToken,
    progress: &ProgressReporter,
) -> Result<Vec<String>>
where
    R: AsyncRead + Unpin,
{
    let mut parser = ProgressParser::new().map_err(|e| StageError::Internal(e.to_string()))?;
    let mut pending = Vec::new();
    let mut tail: Vec<String> = Vec::new();
    let mut buf = [0u8; 4096];

    loop {
        let read = tokio::select! {
            biased;
            _ = token.cancelled() => return Err(StageError::Cancelled),
            read = stderr.read(&mut buf) => read?,
        };
        if read == 0 {
            break;
        }

        for line in split_progress_lines(&mut pending, &buf[..read]) {
            if let Some(percent) = parser.feed(&line) {
                progress.report(percent, format!("Extracting audio... {}%", percent))?;
            }
            tail.push(line);
            if tail.len() > STDERR_TAIL {
                tail.remove(0);
            }
        }
    }

    if !pending.is_empty() {
        tail.push(decode_lossy(&pending));
    }
    Ok(tail)
}

#[async_trait]
impl Stage for AudioExtractor {
    type Input = ExtractionRequest;
    type Output = ExtractedAudio;

    fn name(&self) -> &'static str {
        "extraction"
    }

    async fn run(
        &self,
        input: ExtractionRequest,
        token: &CancellationToken,
        progress: &ProgressReporter,
    ) -> StageResult<ExtractedAudio> {
        let result = self
            .extract(&input.video_path, input.output_path.as_deref(), token, progress)
            .await;
        StageResult::from_result(self.name(), result)
    }
}
