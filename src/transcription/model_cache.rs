use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};

use super::{Device, SpeechModel, SpeechRuntime};
use crate::cancellation::{wait_blocking, CancellationToken, Waited};
use crate::error::{Result, StageError};
use crate::progress::ProgressReporter;

/// The resident model
#[derive(Clone)]
pub struct LoadedModel {
    pub name: String,
    pub device: Device,
    pub model: Arc<dyn SpeechModel>,
}

impl std::fmt::Debug for LoadedModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadedModel")
            .field("name", &self.name)
            .field("device", &self.device)
            .finish()
    }
}

/// Holds at most one speech model and serializes loads.
///
/// Owned by the application context and shared by every transcription stage.
/// Inference is single-flight through [`ModelCache::acquire_inference`].
pub struct ModelCache {
    runtime: Arc<dyn SpeechRuntime>,
    cache_dir: PathBuf,
    poll_interval: Duration,
    load_grace: Duration,
    state: Mutex<Option<LoadedModel>>,
    inference: Arc<Semaphore>,
}

impl ModelCache {
    pub fn new(runtime: Arc<dyn SpeechRuntime>, cache_dir: PathBuf) -> Self {
        Self {
            runtime,
            cache_dir,
            poll_interval: Duration::from_millis(500),
            load_grace: Duration::from_secs(2),
            state: Mutex::new(None),
            inference: Arc::new(Semaphore::new(1)),
        }
    }

    pub fn with_timing(mut self, poll_interval: Duration, load_grace: Duration) -> Self {
        self.poll_interval = poll_interval;
        self.load_grace = load_grace;
        self
    }

    /// Name and device of the resident model
    pub async fn current(&self) -> Option<(String, Device)> {
        self.state
            .lock()
            .await
            .as_ref()
            .map(|loaded| (loaded.name.clone(), loaded.device))
    }

    /// Drop the resident model; returns its name
    pub async fn evict(&self) -> Option<String> {
        let evicted = self.state.lock().await.take().map(|loaded| loaded.name);
        if let Some(name) = &evicted {
            info!("🗑️  Unloaded speech model {}", name);
        }
        evicted
    }

    /// Return the cached model, loading (and replacing) it when needed.
    ///
    /// A cancelled load is abandoned: its result is never adopted, and the
    /// loader thread gets a short grace period before we stop waiting on it.
    pub async fn get_or_load(
        &self,
        name: &str,
        device: Device,
        force_reload: bool,
        token: &CancellationToken,
        progress: &ProgressReporter,
    ) -> Result<LoadedModel> {
        token.checkpoint()?;
        let mut state = tokio::select! {
            _ = token.cancelled() => return Err(StageError::Cancelled),
            guard = self.state.lock() => guard,
        };

        if let Some(loaded) = state.as_ref() {
            if !force_reload && loaded.name == name && loaded.device == device {
                debug!("Reusing loaded model {} on {}", name, device);
                return Ok(loaded.clone());
            }
        }

        if let Some(previous) = state.take() {
            info!("🔄 Replacing model {} with {}", previous.name, name);
        }

        info!("📥 Loading speech model {} on {}", name, device);
        progress.report(10, format!("Loading model {}...", name))?;

        let runtime = self.runtime.clone();
        let cache_dir = self.cache_dir.clone();
        let model_name = name.to_string();
        let mut handle =
            tokio::task::spawn_blocking(move || runtime.load(&model_name, device, &cache_dir));

        let waited = wait_blocking(&mut handle, token, self.poll_interval, None, |elapsed| {
            let percent = 10 + (elapsed.as_secs() as u32).min(15);
            progress.report(percent, format!("Loading model {}...", name))
        })
        .await;

        match waited {
            Waited::Finished(joined) => {
                let model = joined?.map_err(|e| StageError::ModelLoad(format!("{}: {:#}", name, e)))?;
                let loaded = LoadedModel {
                    name: name.to_string(),
                    device,
                    model,
                };
                *state = Some(loaded.clone());
                info!("✅ Model {} loaded", name);
                progress.report(30, "Model loaded")?;
                Ok(loaded)
            }
            Waited::Cancelled => {
                warn!("🛑 Model load of {} cancelled; result will be discarded", name);
                if tokio::time::timeout(self.load_grace, &mut handle).await.is_err() {
                    debug!("Loader for {} still running after grace period", name);
                }
                Err(StageError::Cancelled)
            }
            Waited::TimedOut => Err(StageError::ModelLoad(format!("{}: load timed out", name))),
        }
    }

    /// Wait for the single inference slot
    pub async fn acquire_inference(&self, token: &CancellationToken) -> Result<OwnedSemaphorePermit> {
        tokio::select! {
            _ = token.cancelled() => Err(StageError::Cancelled),
            permit = self.inference.clone().acquire_owned() => {
                permit.map_err(|_| StageError::Internal("inference slot closed".to_string()))
            }
        }
    }
}
