pub mod model_cache;
pub mod transcriber;
pub mod whisper;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::config::DeviceSetting;

pub use model_cache::{LoadedModel, ModelCache};
pub use transcriber::{TranscriptionOutput, TranscriptionRequest, Transcriber};
pub use whisper::{ModelDownloader, WhisperCliRuntime};

/// Device a model is actually loaded on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Device {
    Cpu,
    Cuda,
}

impl Device {
    /// `auto` picks CUDA when the environment advertises a GPU
    pub fn resolve(setting: DeviceSetting) -> Self {
        match setting {
            DeviceSetting::Cpu => Device::Cpu,
            DeviceSetting::Cuda => Device::Cuda,
            DeviceSetting::Auto => {
                if detect_gpu_support() {
                    Device::Cuda
                } else {
                    Device::Cpu
                }
            }
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Device::Cpu => "cpu",
            Device::Cuda => "cuda",
        }
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn detect_gpu_support() -> bool {
    let cuda_visible = std::env::var("CUDA_VISIBLE_DEVICES")
        .map_or(false, |v| !v.trim().is_empty() && v.trim() != "-1");
    cuda_visible || std::env::var("WHISPER_USE_GPU").map_or(false, |v| v == "1" || v.to_lowercase() == "true")
}

/// Decoding parameters passed to every inference call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecodeOptions {
    pub language: Option<String>,
    pub temperature: f32,
    pub threads: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    pub start: f64,
    pub end: f64,
    pub text: String,
}

/// What a speech runtime hands back
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawTranscript {
    pub text: String,
    pub language: Option<String>,
    pub segments: Vec<Segment>,
}

impl RawTranscript {
    /// End of the last segment, in seconds
    pub fn duration(&self) -> Option<f64> {
        self.segments.iter().map(|s| s.end).fold(None, |acc, end| match acc {
            Some(max) if max >= end => Some(max),
            _ => Some(end),
        })
    }
}

/// A loaded speech-recognition model.
///
/// Calls block and cannot be interrupted; callers run them on the blocking pool.
pub trait SpeechModel: Send + Sync {
    fn transcribe(&self, audio: &Path, options: &DecodeOptions) -> anyhow::Result<RawTranscript>;
}

/// Loads speech models. Blocking.
pub trait SpeechRuntime: Send + Sync {
    fn load(&self, name: &str, device: Device, cache_dir: &Path) -> anyhow::Result<Arc<dyn SpeechModel>>;
}

/// Static facts about a standard Whisper model
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ModelInfo {
    pub name: &'static str,
    pub size_mb: u32,
    pub vram_gb: u32,
    /// Processing time as a multiple of audio length on CPU
    pub cpu_factor: f64,
    pub description: &'static str,
}

pub const MODEL_CATALOGUE: &[ModelInfo] = &[
    ModelInfo {
        name: "tiny",
        size_mb: 75,
        vram_gb: 1,
        cpu_factor: 2.0,
        description: "Fastest, lowest accuracy; good for quick previews",
    },
    ModelInfo {
        name: "base",
        size_mb: 142,
        vram_gb: 2,
        cpu_factor: 5.0,
        description: "Balanced default for everyday use",
    },
    ModelInfo {
        name: "small",
        size_mb: 466,
        vram_gb: 4,
        cpu_factor: 10.0,
        description: "High accuracy, recommended for real work",
    },
    ModelInfo {
        name: "medium",
        size_mb: 1530,
        vram_gb: 8,
        cpu_factor: 20.0,
        description: "Professional accuracy, needs strong hardware",
    },
    ModelInfo {
        name: "large",
        size_mb: 2950,
        vram_gb: 16,
        cpu_factor: 40.0,
        description: "Best accuracy, slowest",
    },
];

pub fn model_info(name: &str) -> Option<&'static ModelInfo> {
    let base = name.split('-').next().unwrap_or(name);
    MODEL_CATALOGUE.iter().find(|m| m.name == base)
}

/// Pick a model for the hardware: CPU gets `base`, GPUs scale with memory
pub fn recommend_model(device: Device, gpu_memory_gb: Option<f64>) -> &'static str {
    match (device, gpu_memory_gb) {
        (Device::Cpu, _) => "base",
        (Device::Cuda, Some(mem)) if mem >= 8.0 => "medium",
        (Device::Cuda, Some(mem)) if mem >= 4.0 => "small",
        (Device::Cuda, _) => "base",
    }
}

/// Rough wall-clock estimate for transcribing `audio_duration`
pub fn estimate_processing_time(model: &str, device: Device, audio_duration: Duration) -> Duration {
    let factor = model_info(model).map_or(10.0, |m| m.cpu_factor);
    let gpu_factor = match device {
        Device::Cuda => 0.3,
        Device::Cpu => 1.0,
    };
    Duration::from_secs_f64(audio_duration.as_secs_f64() * factor * gpu_factor)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_explicit_devices_are_honoured() {
        assert_eq!(Device::resolve(DeviceSetting::Cpu), Device::Cpu);
        assert_eq!(Device::resolve(DeviceSetting::Cuda), Device::Cuda);
        assert_eq!(Device::Cuda.to_string(), "cuda");
    }

    #[test]
    fn test_catalogue_and_recommendation() {
        assert_eq!(model_info("large-v3").map(|m| m.size_mb), Some(2950));
        assert!(model_info("huge").is_none());

        assert_eq!(recommend_model(Device::Cpu, Some(24.0)), "base");
        assert_eq!(recommend_model(Device::Cuda, Some(12.0)), "medium");
        assert_eq!(recommend_model(Device::Cuda, Some(6.0)), "small");
        assert_eq!(recommend_model(Device::Cuda, None), "base");
    }

    #[test]
    fn test_processing_time_estimation() {
        let minute = Duration::from_secs(60);
        assert_eq!(estimate_processing_time("tiny", Device::Cpu, minute), Duration::from_secs(120));
        assert!(
            estimate_processing_time("small", Device::Cuda, minute)
                < estimate_processing_time("small", Device::Cpu, minute)
        );
    }

    #[test]
    fn test_transcript_duration_is_last_end() {
        let transcript = RawTranscript {
            text: "a b".to_string(),
            language: Some("zh".to_string()),
            segments: vec![
                Segment { start: 0.0, end: 4.5, text: "a".to_string() },
                Segment { start: 4.5, end: 3.0, text: "b".to_string() },
            ],
        };
        assert_eq!(transcript.duration(), Some(4.5));
        assert_eq!(RawTranscript::default().duration(), None);
    }
}
