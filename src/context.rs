use anyhow::Result;
use std::sync::Arc;
use tracing::info;

use crate::audio::AudioExtractor;
use crate::config::Config;
use crate::coordinator::Coordinator;
use crate::llm::{LlmBackend, OllamaProvider, Rewriter};
use crate::transcription::{ModelCache, SpeechRuntime, Transcriber, WhisperCliRuntime};
use crate::worker::ShutdownPolicy;

/// Long-lived owner of the shared services.
///
/// The speech model cache lives here so that consecutive runs reuse a
/// loaded model.
pub struct AppContext {
    config: Config,
    model_cache: Arc<ModelCache>,
    llm: Arc<dyn LlmBackend>,
}

impl AppContext {
    /// Wire up whisper.cpp and Ollama from configuration
    pub fn new(config: Config) -> Result<Self> {
        let runtime = Arc::new(WhisperCliRuntime::new(config.whisper.binary.clone()));
        let llm = Arc::new(OllamaProvider::new(&config.llm)?);
        Ok(Self::with_services(config, runtime, llm))
    }

    /// Use custom collaborators
    pub fn with_services(config: Config, runtime: Arc<dyn SpeechRuntime>, llm: Arc<dyn LlmBackend>) -> Self {
        let model_cache = ModelCache::new(runtime, config.whisper.model_dir.clone())
            .with_timing(config.whisper.poll_interval(), config.whisper.load_grace());

        info!("🔧 Application context ready");
        Self {
            config,
            model_cache: Arc::new(model_cache),
            llm,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn model_cache(&self) -> &Arc<ModelCache> {
        &self.model_cache
    }

    pub fn extractor(&self) -> AudioExtractor {
        AudioExtractor::new(self.config.audio.clone())
    }

    pub fn transcriber(&self) -> Transcriber {
        Transcriber::new(self.model_cache.clone(), self.config.whisper.clone())
    }

    pub fn rewriter(&self) -> Rewriter {
        Rewriter::new(self.llm.clone(), self.config.llm.clone())
    }

    /// A fresh coordinator sharing this context's services
    pub fn coordinator(&self) -> Coordinator {
        Coordinator::new(
            Arc::new(self.extractor()),
            Arc::new(self.transcriber()),
            Arc::new(self.rewriter()),
            ShutdownPolicy::from(&self.config.worker),
        )
    }
}
