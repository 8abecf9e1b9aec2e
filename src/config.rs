use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::llm::GenerateOptions;

/// Configuration for the script rewriter
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Audio extraction settings
    pub audio: AudioConfig,

    /// Speech recognition settings
    pub whisper: WhisperConfig,

    /// LLM rewriting settings
    pub llm: LlmConfig,

    /// Background worker shutdown settings
    pub worker: WorkerConfig,

    /// Output and logging settings
    pub output: OutputConfig,
}

/// Transcoder quality preset, mapped to `-q:a`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioQuality {
    High,
    Medium,
    Low,
}

impl AudioQuality {
    pub fn qscale(&self) -> &'static str {
        match self {
            AudioQuality::High => "0",
            AudioQuality::Medium => "2",
            AudioQuality::Low => "4",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Target sample rate (16kHz suits Whisper)
    pub sample_rate: u32,

    /// Target channel count
    pub channels: u32,

    /// Audio codec passed to the transcoder
    pub codec: String,

    /// Output container/extension
    pub format: String,

    /// Quality preset
    pub quality: AudioQuality,

    /// Where extracted audio lands when no output path is given
    pub temp_dir: PathBuf,

    /// Upper bound for a plain (non-streaming) transcoder run
    pub timeout_secs: f64,

    /// Transcoder executable
    pub ffmpeg_path: String,

    /// Duration probe executable
    pub ffprobe_path: String,

    /// Remove extracted audio once the pipeline finishes
    pub cleanup_temp_files: bool,
}

/// Requested inference device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceSetting {
    Auto,
    Cpu,
    #[serde(alias = "gpu")]
    Cuda,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WhisperConfig {
    /// Model name (tiny, base, small, medium, large...)
    pub model: String,

    /// Language hint; `None` lets the model detect it
    pub language: Option<String>,

    /// Inference device
    pub device: DeviceSetting,

    /// Decoding temperature (0.0 = deterministic)
    pub temperature: f32,

    /// Directory holding model files
    pub model_dir: PathBuf,

    /// Explicit whisper.cpp executable; auto-detected when unset
    pub binary: Option<String>,

    /// Where `ggml-<model>.bin` weights are downloaded from
    pub download_url: String,

    /// Inference threads
    pub threads: u32,

    /// Wall-clock limit per transcription attempt
    pub timeout_secs: f64,

    /// Extra attempts after the first one
    pub max_retries: u32,

    /// Fixed pause between attempts
    pub retry_delay_secs: f64,

    /// How often waiting code wakes up to report progress
    pub poll_interval_secs: f64,

    /// How long a cancelled model load is given to finish
    pub load_grace_secs: f64,

    /// Reload the model even if it is already resident
    pub force_reload: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// Service root, e.g. http://localhost:11434
    pub base_url: String,

    /// Model used for rewriting
    pub model: String,

    /// Smaller model substituted when the main one runs out of memory
    pub fallback_model: String,

    /// Request timeout in seconds
    pub timeout_secs: u64,

    /// Liveness probe timeout in seconds
    pub probe_timeout_secs: u64,

    /// Total attempts per request sequence
    pub max_retries: u32,

    /// Base delay for exponential backoff
    pub retry_delay_secs: f64,

    /// Persona/style prompt sent as the system message
    pub system_prompt: String,

    /// Sampling and resource options
    pub options: GenerateOptions,

    /// Floor for context window when degrading
    pub min_num_ctx: u32,

    /// Floor for max output tokens when degrading
    pub min_num_predict: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Wait increment while stopping a worker
    pub stop_step_secs: f64,

    /// Give up waiting (without killing) after this long
    pub stop_ceiling_secs: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// Directory for saved run reports
    pub dir: PathBuf,

    /// Save a report after every successful run
    pub auto_save: bool,

    /// Log level
    pub log_level: String,
}

const DEFAULT_SYSTEM_PROMPT: &str = "你是一位创作过1000多个爆款短视频专家，请你从以下几个角度拆解。\n\
1.脚本结构：从开篇、中间发展、结尾的逻辑层次进行详细剖析；\n\
2.表述风格：通过具体语言风格的分析，提炼出让文案更贴近目标受众的写作技巧；\n\
3.爆款逻辑：解析文案如何通过痛点刺激、数据支撑等逻辑驱动用户行动；\n\
4.开头三秒：聚焦文案开头，分析如何迅速抓住读者的注意力；\n\
5.钩子设计：识别出文章中多处钩子设计，不断吸引用户继续阅读；\n\
6.爆款表达方法论：总结出文案成功的关键要素，并提炼出可操作的写作建议。\n\
在拆解完文案以后，请你结合下面的要求，帮我对该文案进行仿写：\n\
1.文案的开头必须与原文一致，不得更改；\n\
2.避免使用过于常见的广告语或套路化的表达，确保内容的新颖性和独特性；\n\
3.文案必须保证50%的原创度，但整体内容的意思禁止改变。\n\
严格要求：只输出仿写后的文案，不要输出任何解释、分析或多余内容。";

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16000,
            channels: 1,
            codec: "pcm_s16le".to_string(),
            format: "wav".to_string(),
            quality: AudioQuality::High,
            temp_dir: PathBuf::from("temp"),
            timeout_secs: 300.0,
            ffmpeg_path: "ffmpeg".to_string(),
            ffprobe_path: "ffprobe".to_string(),
            cleanup_temp_files: false,
        }
    }
}

impl Default for WhisperConfig {
    fn default() -> Self {
        Self {
            model: "small".to_string(),
            language: Some("zh".to_string()),
            device: DeviceSetting::Auto,
            temperature: 0.0,
            model_dir: PathBuf::from("models/whisper"),
            binary: None,
            download_url: "https://huggingface.co/ggerganov/whisper.cpp/resolve/main/".to_string(),
            threads: num_cpus::get().min(8) as u32,
            timeout_secs: 600.0,
            max_retries: 2,
            retry_delay_secs: 3.0,
            poll_interval_secs: 0.5,
            load_grace_secs: 2.0,
            force_reload: false,
        }
    }
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:11434".to_string(),
            model: "deepseek-r1:8b".to_string(),
            fallback_model: "qwen2:1.5b".to_string(),
            timeout_secs: 600,
            probe_timeout_secs: 5,
            max_retries: 3,
            retry_delay_secs: 2.0,
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            options: GenerateOptions::default(),
            min_num_ctx: 512,
            min_num_predict: 256,
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            stop_step_secs: 1.0,
            stop_ceiling_secs: 30.0,
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("output"),
            auto_save: false,
            log_level: "info".to_string(),
        }
    }
}

impl AudioConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs_f64(self.timeout_secs)
    }
}

impl WhisperConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs_f64(self.timeout_secs)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs_f64(self.retry_delay_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs_f64(self.poll_interval_secs)
    }

    pub fn load_grace(&self) -> Duration {
        Duration::from_secs_f64(self.load_grace_secs)
    }
}

impl LlmConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs_f64(self.retry_delay_secs)
    }
}

impl WorkerConfig {
    pub fn stop_step(&self) -> Duration {
        Duration::from_secs_f64(self.stop_step_secs)
    }

    pub fn stop_ceiling(&self) -> Duration {
        Duration::from_secs_f64(self.stop_ceiling_secs)
    }
}

impl Config {
    /// Load configuration from the first readable config file, else the environment
    pub fn load() -> Result<Self> {
        let mut config_paths = vec![
            PathBuf::from("script-rewriter.toml"),
            PathBuf::from("config/script-rewriter.toml"),
        ];
        if let Some(dir) = user_config_dir() {
            config_paths.push(dir.join("script-rewriter").join("config.toml"));
        }

        for path in &config_paths {
            if !path.exists() {
                continue;
            }
            match Self::load_from(path) {
                Ok(config) => {
                    tracing::info!("📄 Loaded configuration from: {}", path.display());
                    return Ok(config);
                }
                Err(e) => {
                    tracing::warn!("Failed to parse config file {}: {}", path.display(), e);
                }
            }
        }

        Self::from_env()
    }

    /// Load configuration from a specific TOML file
    pub fn load_from(path: &Path) -> Result<Self> {
        let config_str = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&config_str)?;
        Ok(config.with_env_overrides())
    }

    /// Defaults with environment overrides applied
    pub fn from_env() -> Result<Self> {
        Ok(Self::default().with_env_overrides())
    }

    fn with_env_overrides(mut self) -> Self {
        if let Ok(model) = std::env::var("SCRIPT_REWRITER_WHISPER_MODEL") {
            self.whisper.model = model;
        }

        if let Ok(device) = std::env::var("SCRIPT_REWRITER_DEVICE") {
            match device.to_lowercase().as_str() {
                "cpu" => self.whisper.device = DeviceSetting::Cpu,
                "cuda" | "gpu" => self.whisper.device = DeviceSetting::Cuda,
                "auto" => self.whisper.device = DeviceSetting::Auto,
                other => tracing::warn!("Ignoring unknown device override: {}", other),
            }
        }

        if let Ok(url) = std::env::var("SCRIPT_REWRITER_LLM_URL") {
            self.llm.base_url = url;
        }

        if let Ok(model) = std::env::var("SCRIPT_REWRITER_LLM_MODEL") {
            self.llm.model = model;
        }

        if let Ok(output_dir) = std::env::var("SCRIPT_REWRITER_OUTPUT_DIR") {
            self.output.dir = PathBuf::from(output_dir);
        }

        if let Ok(log_level) = std::env::var("SCRIPT_REWRITER_LOG_LEVEL") {
            self.output.log_level = log_level;
        }

        self
    }

    /// Save configuration to file
    pub fn save(&self, path: &Path) -> Result<()> {
        let config_str = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, config_str)?;
        tracing::info!("💾 Configuration saved to: {}", path.display());
        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.audio.sample_rate == 0 {
            return Err(anyhow!("audio.sample_rate must be greater than 0"));
        }

        if self.audio.channels == 0 {
            return Err(anyhow!("audio.channels must be greater than 0"));
        }

        if self.audio.timeout_secs <= 0.0 {
            return Err(anyhow!("audio.timeout_secs must be positive"));
        }

        if self.whisper.model.trim().is_empty() {
            return Err(anyhow!("whisper.model must not be empty"));
        }

        if self.whisper.timeout_secs <= 0.0 || self.whisper.poll_interval_secs <= 0.0 {
            return Err(anyhow!("whisper timeouts and poll interval must be positive"));
        }

        if self.whisper.retry_delay_secs < 0.0 {
            return Err(anyhow!("whisper.retry_delay_secs must not be negative"));
        }

        url::Url::parse(&self.llm.base_url)
            .map_err(|e| anyhow!("llm.base_url is not a valid URL: {}", e))?;

        if self.llm.max_retries == 0 {
            return Err(anyhow!("llm.max_retries must be at least 1"));
        }

        if self.llm.options.num_ctx < self.llm.min_num_ctx
            || self.llm.options.num_predict < self.llm.min_num_predict
        {
            return Err(anyhow!("llm options must not start below their degradation floors"));
        }

        if self.worker.stop_step_secs <= 0.0 || self.worker.stop_ceiling_secs < self.worker.stop_step_secs {
            return Err(anyhow!("worker.stop_ceiling_secs must be at least worker.stop_step_secs"));
        }

        tracing::debug!("✅ Configuration validation passed");
        Ok(())
    }

    /// Read-only dotted-path lookup, e.g. `whisper.timeout_secs`
    pub fn lookup(&self, key: &str) -> Option<toml::Value> {
        let mut value = toml::Value::try_from(self).ok()?;
        for part in key.split('.') {
            value = value.as_table()?.get(part)?.clone();
        }
        Some(value)
    }

    /// Get runtime configuration summary
    pub fn summary(&self) -> String {
        format!(
            "Script Rewriter Configuration:\n\
            - Audio: {}Hz, {} channel(s), quality {:?}\n\
            - Whisper Model: {} ({:?}, language {})\n\
            - Whisper Timeout: {}s, retries {}\n\
            - LLM: {} @ {} (fallback {})\n\
            - Output Directory: {}",
            self.audio.sample_rate,
            self.audio.channels,
            self.audio.quality,
            self.whisper.model,
            self.whisper.device,
            self.whisper.language.as_deref().unwrap_or("auto"),
            self.whisper.timeout_secs,
            self.whisper.max_retries,
            self.llm.model,
            self.llm.base_url,
            self.llm.fallback_model,
            self.output.dir.display(),
        )
    }
}

fn user_config_dir() -> Option<PathBuf> {
    std::env::var_os("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .or_else(|| std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".config")))
}

/// Configuration builder for programmatic config creation
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: Config::default(),
        }
    }

    pub fn with_whisper_model(mut self, model: impl Into<String>) -> Self {
        self.config.whisper.model = model.into();
        self
    }

    pub fn with_device(mut self, device: DeviceSetting) -> Self {
        self.config.whisper.device = device;
        self
    }

    pub fn with_language(mut self, language: Option<String>) -> Self {
        self.config.whisper.language = language;
        self
    }

    pub fn with_llm_model(mut self, model: impl Into<String>) -> Self {
        self.config.llm.model = model.into();
        self
    }

    pub fn with_llm_url(mut self, url: impl Into<String>) -> Self {
        self.config.llm.base_url = url.into();
        self
    }

    pub fn with_quality(mut self, quality: AudioQuality) -> Self {
        self.config.audio.quality = quality;
        self
    }

    pub fn with_temp_dir(mut self, dir: PathBuf) -> Self {
        self.config.audio.temp_dir = dir;
        self
    }

    pub fn with_output_dir(mut self, dir: PathBuf) -> Self {
        self.config.output.dir = dir;
        self
    }

    pub fn enable_auto_save(mut self, enable: bool) -> Self {
        self.config.output.auto_save = enable;
        self
    }

    pub fn build(self) -> Config {
        self.config
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.audio.sample_rate, 16000);
        assert_eq!(config.audio.quality, AudioQuality::High);
        assert_eq!(config.whisper.max_retries, 2);
        assert_eq!(config.whisper.timeout(), Duration::from_secs(600));
        assert_eq!(config.llm.max_retries, 3);
        assert_eq!(config.llm.fallback_model, "qwen2:1.5b");
        assert_eq!(config.worker.stop_ceiling(), Duration::from_secs(30));
    }

    #[test]
    fn test_config_builder() {
        let config = ConfigBuilder::new()
            .with_whisper_model("base")
            .with_device(DeviceSetting::Cpu)
            .with_quality(AudioQuality::Low)
            .with_llm_model("qwen:7b")
            .build();

        assert_eq!(config.whisper.model, "base");
        assert_eq!(config.whisper.device, DeviceSetting::Cpu);
        assert_eq!(config.audio.quality.qscale(), "4");
        assert_eq!(config.llm.model, "qwen:7b");
    }

    #[test]
    fn test_config_validation() {
        let config = Config::default();
        assert!(config.validate().is_ok());

        let broken = ConfigBuilder::new().with_llm_url("not a url").build();
        assert!(broken.validate().is_err());
    }

    #[test]
    fn test_dotted_lookup() {
        let config = Config::default();
        assert_eq!(
            config.lookup("whisper.model").and_then(|v| v.as_str().map(String::from)),
            Some("small".to_string())
        );
        assert_eq!(
            config.lookup("llm.options.num_ctx").and_then(|v| v.as_integer()),
            Some(1024)
        );
        assert!(config.lookup("whisper.nope").is_none());
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("script-rewriter.toml");
        std::fs::write(
            &path,
            "[whisper]\nmodel = \"medium\"\ndevice = \"gpu\"\n\n[audio]\nquality = \"medium\"\n",
        )
        .unwrap();

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.whisper.device, DeviceSetting::Cuda);
        assert_eq!(config.audio.quality, AudioQuality::Medium);
        assert_eq!(config.audio.sample_rate, 16000);
        assert_eq!(config.llm.model, "deepseek-r1:8b");
    }

    #[test]
    fn test_save_roundtrip() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("nested").join("config.toml");
        let config = ConfigBuilder::new().with_whisper_model("tiny").build();

        config.save(&path).unwrap();
        let loaded = Config::load_from(&path).unwrap();
        assert_eq!(loaded.whisper.model, "tiny");
    }
}
