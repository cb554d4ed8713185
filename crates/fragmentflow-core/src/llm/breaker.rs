//! Per-provider circuit breaker.
//!
//! closed -> open after `failure_threshold` consecutive failures;
//! open -> half-open once `recovery_timeout` has elapsed since the last
//! failure; half-open admits a single trial call whose outcome closes or
//! re-opens the circuit.

use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

use fragmentflow_types::config::BreakerConfig;
use fragmentflow_types::provider::{CircuitState, ProviderError};
use tokio::time::Instant;

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    last_failure: Option<Instant>,
    /// A half-open trial call is in flight.
    trial_in_flight: bool,
}

/// How a call was admitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Admission {
    Normal,
    Trial,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    provider: String,
    failure_threshold: u32,
    recovery_timeout: Duration,
    inner: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(provider: impl Into<String>, config: &BreakerConfig) -> Self {
        Self {
            provider: provider.into(),
            failure_threshold: config.failure_threshold.max(1),
            recovery_timeout: Duration::from_millis(config.recovery_timeout_ms),
            inner: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                failure_count: 0,
                last_failure: None,
                trial_in_flight: false,
            }),
        }
    }

    pub fn provider(&self) -> &str {
        &self.provider
    }

    /// Current state as a caller would observe it: an open circuit whose
    /// recovery timeout has elapsed reports half-open.
    pub fn state(&self) -> CircuitState {
        let inner = self.lock();
        match inner.state {
            CircuitState::Open if self.recovery_elapsed(&inner) => CircuitState::HalfOpen,
            state => state,
        }
    }

    pub fn failure_count(&self) -> u32 {
        self.lock().failure_count
    }

    /// True while calls are being rejected without reaching the provider.
    pub fn is_open(&self) -> bool {
        self.state() == CircuitState::Open
    }

    /// Run `operation` through the breaker.
    ///
    /// An open circuit rejects with [`ProviderError::CircuitOpen`] without
    /// invoking `operation`.
    pub async fn call<T, F, Fut>(&self, operation: F) -> Result<T, ProviderError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let admission = self.admit()?;
        let mut guard = TrialGuard {
            breaker: self,
            armed: admission == Admission::Trial,
        };

        let result = operation().await;
        guard.armed = false;
        match &result {
            Ok(_) => self.record_success(),
            Err(_) => self.record_failure(),
        }
        result
    }

    /// Return to the initial closed state.
    pub fn reset(&self) {
        let mut inner = self.lock();
        *inner = BreakerState {
            state: CircuitState::Closed,
            failure_count: 0,
            last_failure: None,
            trial_in_flight: false,
        };
        tracing::info!(provider = %self.provider, "circuit breaker reset");
    }

    fn admit(&self) -> Result<Admission, ProviderError> {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed => Ok(Admission::Normal),
            CircuitState::Open if self.recovery_elapsed(&inner) => {
                inner.state = CircuitState::HalfOpen;
                inner.trial_in_flight = true;
                tracing::info!(provider = %self.provider, "circuit breaker half-open, admitting trial call");
                Ok(Admission::Trial)
            }
            CircuitState::HalfOpen if !inner.trial_in_flight => {
                inner.trial_in_flight = true;
                Ok(Admission::Trial)
            }
            CircuitState::Open | CircuitState::HalfOpen => Err(ProviderError::CircuitOpen {
                provider: self.provider.clone(),
            }),
        }
    }

    fn record_success(&self) {
        let mut inner = self.lock();
        inner.failure_count = 0;
        inner.trial_in_flight = false;
        if inner.state != CircuitState::Closed {
            inner.state = CircuitState::Closed;
            tracing::info!(provider = %self.provider, "circuit breaker closed after successful recovery");
        }
    }

    fn record_failure(&self) {
        let mut inner = self.lock();
        inner.failure_count = inner.failure_count.saturating_add(1);
        inner.last_failure = Some(Instant::now());
        inner.trial_in_flight = false;

        match inner.state {
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Open;
                tracing::warn!(provider = %self.provider, "trial call failed, circuit breaker re-opened");
            }
            CircuitState::Closed if inner.failure_count >= self.failure_threshold => {
                inner.state = CircuitState::Open;
                tracing::warn!(
                    provider = %self.provider,
                    failures = inner.failure_count,
                    "circuit breaker opened"
                );
            }
            _ => {}
        }
    }

    fn recovery_elapsed(&self, inner: &BreakerState) -> bool {
        inner
            .last_failure
            .is_none_or(|at| at.elapsed() >= self.recovery_timeout)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BreakerState> {
        // State stays consistent under poisoning: every write is a single assignment.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Releases a half-open trial slot if the trial call is dropped before it
/// reports an outcome, so the next caller can try again.
struct TrialGuard<'a> {
    breaker: &'a CircuitBreaker,
    armed: bool,
}

impl Drop for TrialGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            let mut inner = self.breaker.lock();
            inner.trial_in_flight = false;
            inner.state = CircuitState::Open;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn breaker(threshold: u32, recovery_ms: u64) -> CircuitBreaker {
        CircuitBreaker::new(
            "openai",
            &BreakerConfig {
                failure_threshold: threshold,
                recovery_timeout_ms: recovery_ms,
            },
        )
    }

    async fn fail(b: &CircuitBreaker) -> Result<(), ProviderError> {
        b.call(|| async {
            Err::<(), _>(ProviderError::Provider {
                message: "boom".into(),
            })
        })
        .await
    }

    async fn succeed(b: &CircuitBreaker) -> Result<u32, ProviderError> {
        b.call(|| async { Ok(7) }).await
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_after_threshold() {
        let b = breaker(5, 60_000);
        for i in 1..5 {
            assert!(fail(&b).await.is_err());
            assert_eq!(b.state(), CircuitState::Closed, "after {i} failures");
        }
        assert!(fail(&b).await.is_err());
        assert_eq!(b.state(), CircuitState::Open);
        assert_eq!(b.failure_count(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_rejects_without_invoking() {
        let b = breaker(1, 60_000);
        let _ = fail(&b).await;

        let invoked = AtomicU32::new(0);
        let err = b
            .call(|| async {
                invoked.fetch_add(1, Ordering::SeqCst);
                Ok::<_, ProviderError>(())
            })
            .await
            .unwrap_err();
        assert_eq!(
            err,
            ProviderError::CircuitOpen {
                provider: "openai".into()
            }
        );
        assert_eq!(invoked.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_success_closes() {
        let b = breaker(5, 60_000);
        for _ in 0..5 {
            let _ = fail(&b).await;
        }
        tokio::time::advance(Duration::from_millis(59_999)).await;
        assert!(succeed(&b).await.is_err(), "still inside recovery window");

        tokio::time::advance(Duration::from_millis(1)).await;
        assert_eq!(b.state(), CircuitState::HalfOpen);
        assert_eq!(succeed(&b).await.unwrap(), 7);
        assert_eq!(b.state(), CircuitState::Closed);
        assert_eq!(b.failure_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_failure_reopens_and_restarts_timer() {
        let b = breaker(2, 1_000);
        let _ = fail(&b).await;
        let _ = fail(&b).await;
        tokio::time::advance(Duration::from_millis(1_000)).await;

        assert!(fail(&b).await.is_err());
        assert_eq!(b.state(), CircuitState::Open);

        tokio::time::advance(Duration::from_millis(500)).await;
        assert!(matches!(
            succeed(&b).await,
            Err(ProviderError::CircuitOpen { .. })
        ));
        tokio::time::advance(Duration::from_millis(500)).await;
        assert!(succeed(&b).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_admits_single_trial() {
        let b = Arc::new(breaker(1, 1_000));
        let _ = fail(&b).await;
        tokio::time::advance(Duration::from_millis(1_000)).await;

        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let trial = {
            let b = Arc::clone(&b);
            tokio::spawn(async move {
                b.call(|| async {
                    let _ = release_rx.await;
                    Ok::<_, ProviderError>(())
                })
                .await
            })
        };
        tokio::task::yield_now().await;

        assert!(matches!(
            succeed(&b).await,
            Err(ProviderError::CircuitOpen { .. })
        ));
        release_tx.send(()).unwrap();
        trial.await.unwrap().unwrap();
        assert_eq!(b.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_failure_count() {
        let b = breaker(3, 1_000);
        let _ = fail(&b).await;
        let _ = fail(&b).await;
        succeed(&b).await.unwrap();
        assert_eq!(b.failure_count(), 0);
        let _ = fail(&b).await;
        assert_eq!(b.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset() {
        let b = breaker(1, 60_000);
        let _ = fail(&b).await;
        assert!(b.is_open());
        b.reset();
        assert_eq!(b.state(), CircuitState::Closed);
        assert!(succeed(&b).await.is_ok());
    }
}
