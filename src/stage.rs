use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::cancellation::CancellationToken;
use crate::error::StageError;
use crate::progress::ProgressReporter;

/// Terminal outcome of one stage run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StageResult<T> {
    Success(T),
    Failure(String),
    Cancelled,
}

impl<T> StageResult<T> {
    pub fn is_success(&self) -> bool {
        matches!(self, StageResult::Success(_))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, StageResult::Cancelled)
    }

    pub fn success(self) -> Option<T> {
        match self {
            StageResult::Success(value) => Some(value),
            _ => None,
        }
    }

    pub fn failure_message(&self) -> Option<&str> {
        match self {
            StageResult::Failure(message) => Some(message),
            _ => None,
        }
    }

    /// Convert a stage's internal result, logging the full error once.
    pub fn from_result(stage: &str, result: Result<T, StageError>) -> Self {
        match result {
            Ok(value) => StageResult::Success(value),
            Err(StageError::Cancelled) => {
                info!("🛑 {} cancelled", stage);
                StageResult::Cancelled
            }
            Err(e) => {
                error!("❌ {} failed: {:?}", stage, e);
                StageResult::Failure(e.to_string())
            }
        }
    }
}

/// A cancellable pipeline phase.
///
/// Implementations catch everything internally and hand back a
/// [`StageResult`]; they never panic or return raw errors to the caller.
#[async_trait]
pub trait Stage: Send + Sync + 'static {
    type Input: Send + 'static;
    type Output: Send + 'static;

    /// Short name used in logs and events
    fn name(&self) -> &'static str;

    async fn run(
        &self,
        input: Self::Input,
        token: &CancellationToken,
        progress: &ProgressReporter,
    ) -> StageResult<Self::Output>;
}
