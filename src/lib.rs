//! Script Rewriter
//!
//! Turns a video into a rewritten promotional script: audio extraction with
//! ffmpeg, local speech recognition, then stylistic rewriting through a local
//! LLM service. Every stage is cancellable and runs on a background worker.

pub mod audio;
pub mod cancellation;
pub mod config;
pub mod context;
pub mod coordinator;
pub mod error;
pub mod llm;
pub mod progress;
pub mod stage;
pub mod transcription;
pub mod worker;

// Re-export main types for easy access
pub use crate::audio::{AudioExtractor, ExtractedAudio, ExtractionRequest};
pub use crate::cancellation::CancellationToken;
pub use crate::config::{Config, ConfigBuilder};
pub use crate::context::AppContext;
pub use crate::coordinator::{Coordinator, PipelineEvent, PipelineOutcome, PipelineReport, PipelineRequest};
pub use crate::error::StageError;
pub use crate::llm::{LlmBackend, LlmError, OllamaProvider, RewriteOutput, RewriteRequest, Rewriter};
pub use crate::progress::{ProgressEvent, ProgressReporter, ProgressSink};
pub use crate::stage::{Stage, StageResult};
pub use crate::transcription::{
    Device, ModelCache, SpeechModel, SpeechRuntime, Transcriber, TranscriptionOutput, TranscriptionRequest,
    WhisperCliRuntime,
};
pub use crate::worker::{ShutdownPolicy, StageWorker, StopOutcome, WorkerEvent};
