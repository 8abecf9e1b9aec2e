//! Cooperative cancellation shared between a controller and the stages it runs.
//!
//! A token only ever moves from "running" to "cancelled". Stages poll it at
//! every suspension point; blocking helpers that cannot be interrupted are
//! awaited through [`wait_blocking`], which stops *waiting* on cancellation or
//! timeout but never aborts the helper itself.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{Instant, MissedTickBehavior};

use crate::error::{Result, StageError};

/// Shared cancellation flag. Clones observe the same state.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    inner: Arc<TokenState>,
}

#[derive(Debug, Default)]
struct TokenState {
    cancelled: AtomicBool,
    notify: Notify,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the flag. Idempotent; there is no way back.
    pub fn cancel(&self) {
        if !self.inner.cancelled.swap(true, Ordering::SeqCst) {
            self.inner.notify.notify_waiters();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// `Err(Cancelled)` once the token is set.
    pub fn checkpoint(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(StageError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Resolves when the token is set.
    pub async fn cancelled(&self) {
        loop {
            // Registered before the flag check so a concurrent cancel() cannot be missed.
            let notified = self.inner.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }

    /// Sleep that ends early with `Err(Cancelled)` when the token is set.
    pub async fn sleep(&self, duration: Duration) -> Result<()> {
        tokio::select! {
            _ = self.cancelled() => Err(StageError::Cancelled),
            _ = tokio::time::sleep(duration) => self.checkpoint(),
        }
    }
}

/// How a wait on a blocking helper ended.
#[derive(Debug)]
pub enum Waited<T> {
    Finished(std::result::Result<T, JoinError>),
    Cancelled,
    TimedOut,
}

/// Wait for a blocking helper task while staying responsive.
///
/// Returns as soon as the helper finishes, the token is set, or `deadline`
/// passes. `on_tick` runs every `interval` with the elapsed time; an `Err`
/// from it is treated as cancellation. The helper is left running when the
/// wait is abandoned.
pub async fn wait_blocking<T, F>(
    handle: &mut JoinHandle<T>,
    token: &CancellationToken,
    interval: Duration,
    deadline: Option<Instant>,
    mut on_tick: F,
) -> Waited<T>
where
    F: FnMut(Duration) -> Result<()>,
{
    let started = Instant::now();
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately.
    ticker.tick().await;

    loop {
        let expiry = async {
            match deadline {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            biased;
            _ = token.cancelled() => return Waited::Cancelled,
            joined = &mut *handle => return Waited::Finished(joined),
            _ = expiry => return Waited::TimedOut,
            _ = ticker.tick() => {
                if on_tick(started.elapsed()).is_err() {
                    return Waited::Cancelled;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_never_resets() {
        let token = CancellationToken::new();
        let observer = token.clone();
        assert!(!observer.is_cancelled());

        token.cancel();
        token.cancel();
        for _ in 0..10 {
            assert!(observer.is_cancelled());
            assert!(observer.checkpoint().is_err());
        }
    }

    #[test]
    fn test_already_cancelled_returns_immediately() {
        let token = CancellationToken::new();
        token.cancel();
        tokio_test::block_on(async {
            token.cancelled().await;
            assert!(token.sleep(Duration::from_secs(60)).await.is_err());
        });
    }

    #[tokio::test]
    async fn test_cancelled_wakes_waiter() {
        let token = CancellationToken::new();
        let waiter = {
            let token = token.clone();
            tokio::spawn(async move { token.cancelled().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        token.cancel();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should wake")
            .unwrap();
    }

    #[tokio::test]
    async fn test_sleep_interrupted_by_cancel() {
        let token = CancellationToken::new();
        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });

        let started = std::time::Instant::now();
        let result = token.sleep(Duration::from_secs(10)).await;
        assert!(matches!(result, Err(StageError::Cancelled)));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_wait_blocking_finishes() {
        let token = CancellationToken::new();
        let mut handle = tokio::task::spawn_blocking(|| 7);
        let waited =
            wait_blocking(&mut handle, &token, Duration::from_millis(10), None, |_| Ok(())).await;
        assert!(matches!(waited, Waited::Finished(Ok(7))));
    }

    #[tokio::test]
    async fn test_wait_blocking_times_out_without_blocking() {
        let token = CancellationToken::new();
        let mut handle = tokio::task::spawn_blocking(|| {
            std::thread::sleep(Duration::from_millis(500));
        });
        let deadline = Instant::now() + Duration::from_millis(50);
        let started = std::time::Instant::now();
        let waited = wait_blocking(
            &mut handle,
            &token,
            Duration::from_millis(10),
            Some(deadline),
            |_| Ok(()),
        )
        .await;
        assert!(matches!(waited, Waited::TimedOut));
        assert!(started.elapsed() < Duration::from_millis(400));
    }

    #[tokio::test]
    async fn test_wait_blocking_tick_error_is_cancellation() {
        let token = CancellationToken::new();
        let mut handle = tokio::task::spawn_blocking(|| {
            std::thread::sleep(Duration::from_millis(300));
        });
        let waited = wait_blocking(&mut handle, &token, Duration::from_millis(10), None, |_| {
            Err(StageError::Cancelled)
        })
        .await;
        assert!(matches!(waited, Waited::Cancelled));
    }
}
