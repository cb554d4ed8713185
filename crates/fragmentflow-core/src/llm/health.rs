//! Provider health monitor.
//!
//! Owns one `CircuitBreaker` and one `ProviderHealth` record per provider,
//! shared by every caller in the process. Every call routed through
//! [`ProviderHealthMonitor::call`] updates both; an optional background
//! probe refreshes health outside the request path.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use fragmentflow_types::config::{BreakerConfig, HealthConfig};
use fragmentflow_types::provider::{CircuitState, HealthStatus, ProviderError, ProviderHealth};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::breaker::CircuitBreaker;

/// Out-of-band liveness check for a provider.
///
/// Uses native async fn in traits (RPITIT, Rust 2024 edition).
pub trait HealthProbe: Send + Sync {
    fn check(&self, provider: &str) -> impl Future<Output = Result<(), ProviderError>> + Send;
}

enum Outcome<'a> {
    Success,
    Failure(&'a str),
}

pub struct ProviderHealthMonitor {
    config: HealthConfig,
    breaker_config: BreakerConfig,
    health: DashMap<String, ProviderHealth>,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
}

impl ProviderHealthMonitor {
    pub fn new(config: HealthConfig, breaker_config: BreakerConfig) -> Self {
        Self {
            config,
            breaker_config,
            health: DashMap::new(),
            breakers: DashMap::new(),
        }
    }

    /// Breaker for `provider`, created closed on first use.
    pub fn breaker(&self, provider: &str) -> Arc<CircuitBreaker> {
        self.breakers
            .entry(provider.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(provider, &self.breaker_config)))
            .clone()
    }

    /// Run `operation` through the provider's breaker and record the outcome.
    ///
    /// A breaker rejection refreshes the provider's status to
    /// `circuit_open` without counting as a failure.
    pub async fn call<T, F, Fut>(&self, provider: &str, operation: F) -> Result<T, ProviderError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let breaker = self.breaker(provider);
        let started = Instant::now();
        let result = breaker.call(operation).await;
        let elapsed = started.elapsed();

        match &result {
            Ok(_) => self.record_success(provider, elapsed),
            Err(ProviderError::CircuitOpen { .. }) => self.record_rejection(provider),
            Err(e) => self.record_failure(provider, elapsed, &e.to_string()),
        }
        result
    }

    pub fn record_success(&self, provider: &str, response_time: Duration) {
        self.update(provider, response_time, Outcome::Success);
    }

    pub fn record_failure(&self, provider: &str, response_time: Duration, error: &str) {
        self.update(provider, response_time, Outcome::Failure(error));
    }

    /// Mark the provider `circuit_open` after a fast-fail rejection.
    pub fn record_rejection(&self, provider: &str) {
        let mut entry = self
            .health
            .entry(provider.to_string())
            .or_insert_with(|| ProviderHealth::new(provider));
        entry.last_check = Utc::now();
        if entry.status != HealthStatus::CircuitOpen {
            tracing::warn!(provider, from = %entry.status, "provider circuit open");
            entry.status = HealthStatus::CircuitOpen;
        }
    }

    fn update(&self, provider: &str, response_time: Duration, outcome: Outcome<'_>) {
        let breaker_open = self.breaker(provider).state() == CircuitState::Open;
        let response_ms = response_time.as_millis() as u64;

        let mut entry = self
            .health
            .entry(provider.to_string())
            .or_insert_with(|| ProviderHealth::new(provider));
        let previous = entry.status;

        entry.total_calls += 1;
        match outcome {
            Outcome::Success => {
                entry.consecutive_failures = 0;
                entry.status = if response_ms > self.config.slow_response_ms {
                    HealthStatus::Degraded
                } else {
                    HealthStatus::Healthy
                };
            }
            Outcome::Failure(error) => {
                entry.total_failures += 1;
                entry.consecutive_failures += 1;
                entry.last_error = Some(error.to_string());
                entry.status = if entry.consecutive_failures >= self.config.unhealthy_after {
                    HealthStatus::Unhealthy
                } else if entry.consecutive_failures >= self.config.degraded_after {
                    HealthStatus::Degraded
                } else {
                    HealthStatus::Healthy
                };
            }
        }
        if breaker_open {
            entry.status = HealthStatus::CircuitOpen;
        }
        entry.success_rate =
            (entry.total_calls - entry.total_failures) as f64 / entry.total_calls as f64;
        entry.last_check = Utc::now();
        entry.response_time_ms = response_ms;

        if entry.status != previous {
            tracing::info!(
                provider,
                from = %previous,
                to = %entry.status,
                consecutive_failures = entry.consecutive_failures,
                "provider health changed"
            );
        }
    }

    pub fn provider_health(&self, provider: &str) -> Option<ProviderHealth> {
        self.health.get(provider).map(|h| h.clone())
    }

    /// Snapshot of every tracked provider, sorted by name.
    pub fn all_provider_health(&self) -> Vec<ProviderHealth> {
        let mut all: Vec<ProviderHealth> = self.health.iter().map(|h| h.clone()).collect();
        all.sort_by(|a, b| a.provider.cmp(&b.provider));
        all
    }

    /// Providers whose status is exactly `healthy`, sorted by name.
    pub fn healthy_providers(&self) -> Vec<String> {
        let mut healthy: Vec<String> = self
            .health
            .iter()
            .filter(|h| h.status == HealthStatus::Healthy)
            .map(|h| h.provider.clone())
            .collect();
        healthy.sort();
        healthy
    }

    /// Whether fallback chains should skip this provider.
    ///
    /// Unknown providers are not excluded. A `circuit_open` provider whose
    /// breaker is ready for a trial call is let through.
    pub fn is_excluded(&self, provider: &str) -> bool {
        let Some(status) = self.health.get(provider).map(|h| h.status) else {
            return false;
        };
        match status {
            HealthStatus::CircuitOpen => self.breaker(provider).state() == CircuitState::Open,
            other => other.is_excluded(),
        }
    }

    /// Probe every configured provider once. Failures are recorded, never raised.
    pub async fn probe_once<P: HealthProbe>(&self, probe: &P) {
        for provider in &self.config.probe_providers {
            let started = Instant::now();
            let result = probe.check(provider).await;
            let elapsed = started.elapsed();
            match result {
                Ok(()) => self.record_success(provider, elapsed),
                Err(e) => {
                    tracing::warn!(provider = %provider, error = %e, "health probe failed");
                    self.record_failure(provider, elapsed, &e.to_string());
                }
            }
        }
    }

    /// Probe on `health.probe_interval_secs` until `cancel` fires.
    ///
    /// The first probe runs one interval after spawning.
    pub fn spawn_probe_loop<P: HealthProbe + 'static>(
        self: &Arc<Self>,
        probe: Arc<P>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let monitor = Arc::clone(self);
        let period = Duration::from_secs(self.config.probe_interval_secs.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            tracing::info!(interval_secs = period.as_secs(), "provider health probe started");
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => monitor.probe_once(probe.as_ref()).await,
                }
            }
            tracing::info!("provider health probe stopped");
        })
    }
}
