use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::cancellation::CancellationToken;
use crate::error::{Result, StageError};

/// Progress update from a running stage
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressEvent {
    /// 0..=100, within the emitting stage's own timeline
    pub percent: u8,
    pub message: String,
}

/// Receiver side went away
#[derive(Debug, thiserror::Error)]
#[error("progress sink closed")]
pub struct SinkClosed;

/// Where a stage's progress and status text go.
///
/// Implementations must not block. A failing sink is treated by the stage as
/// a request to cancel.
pub trait ProgressSink: Send + Sync {
    fn progress(&self, event: ProgressEvent) -> std::result::Result<(), SinkClosed>;
    fn status(&self, message: String) -> std::result::Result<(), SinkClosed>;
}

/// Discards everything
pub struct NullSink;

impl ProgressSink for NullSink {
    fn progress(&self, _event: ProgressEvent) -> std::result::Result<(), SinkClosed> {
        Ok(())
    }

    fn status(&self, _message: String) -> std::result::Result<(), SinkClosed> {
        Ok(())
    }
}

/// Per-stage progress handle given to stage code.
///
/// Reported percentages are clamped to 100 and never go backwards. Every
/// report first checks the cancellation token.
#[derive(Clone)]
pub struct ProgressReporter {
    sink: Arc<dyn ProgressSink>,
    token: CancellationToken,
    high_water: Arc<AtomicU8>,
}

impl ProgressReporter {
    pub fn new(sink: Arc<dyn ProgressSink>, token: CancellationToken) -> Self {
        Self {
            sink,
            token,
            high_water: Arc::new(AtomicU8::new(0)),
        }
    }

    /// Reporter that only carries the token
    pub fn silent(token: CancellationToken) -> Self {
        Self::new(Arc::new(NullSink), token)
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Highest percentage reported so far
    pub fn percent(&self) -> u8 {
        self.high_water.load(Ordering::SeqCst)
    }

    pub fn report(&self, percent: u32, message: impl Into<String>) -> Result<()> {
        self.token.checkpoint()?;

        let clamped = percent.min(100) as u8;
        let previous = self.high_water.fetch_max(clamped, Ordering::SeqCst);
        let event = ProgressEvent {
            percent: previous.max(clamped),
            message: message.into(),
        };

        self.sink.progress(event).map_err(|_| self.sink_failed())
    }

    pub fn status(&self, message: impl Into<String>) -> Result<()> {
        self.token.checkpoint()?;
        self.sink.status(message.into()).map_err(|_| self.sink_failed())
    }

    fn sink_failed(&self) -> StageError {
        self.token.cancel();
        StageError::Cancelled
    }
}
