use std::future::Future;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use tracing::{debug, warn};

use super::{ClientError, ServiceKind};
use crate::utils::clock::Clock;
use crate::utils::context::RequestContext;
use crate::utils::metrics::Metrics;

/// Default budget for a single outbound call attempt.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, serde::Deserialize, PartialEq)]
#[serde(default)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    #[serde(with = "crate::providers::breaker::serde_secs")]
    pub window: Duration,
    #[serde(with = "crate::providers::breaker::serde_secs")]
    pub reset_timeout: Duration,
    pub max_probes: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            window: Duration::from_secs(10),
            reset_timeout: Duration::from_secs(30),
            max_probes: 1,
        }
    }
}

pub(crate) mod serde_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Closed,
    Open,
    HalfOpen,
}

impl State {
    fn name(self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half-open",
        }
    }
}

#[derive(Debug)]
struct StateData {
    state: State,
    window_start: Option<Instant>,
    opened_at: Option<Instant>,
    probes_in_flight: u32,
}

/// Admission token; the outcome must be reported back so probe
/// accounting stays balanced.
#[derive(Debug)]
struct Permit {
    probe: bool,
}

/// Per-service open/half-open/closed failure gate.
///
/// Failures counted toward the breaker are the retriable kinds only:
/// a `NotFound` proves the service is reachable and therefore counts as
/// a success for breaker purposes.
#[derive(Debug)]
pub struct CircuitBreaker {
    service: ServiceKind,
    config: BreakerConfig,
    clock: Arc<dyn Clock>,
    failures: AtomicU32,
    state: Mutex<StateData>,
}

impl CircuitBreaker {
    pub fn new(service: ServiceKind, config: BreakerConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            service,
            config,
            clock,
            failures: AtomicU32::new(0),
            state: Mutex::new(StateData {
                state: State::Closed,
                window_start: None,
                opened_at: None,
                probes_in_flight: 0,
            }),
        }
    }

    pub fn service(&self) -> ServiceKind {
        self.service
    }

    /// Run `f` through the breaker: reject immediately when open,
    /// otherwise record the outcome.
    pub async fn call<T, Fut>(
        &self,
        metrics: &Metrics,
        f: impl FnOnce() -> Fut,
    ) -> Result<T, ClientError>
    where
        Fut: Future<Output = Result<T, ClientError>>,
    {
        let permit = match self.admit() {
            Ok(permit) => permit,
            Err(err) => {
                metrics.breaker_rejections.increment();
                return Err(err);
            },
        };
        let result = f().await;
        match &result {
            Err(err) if err.counts_toward_breaker() => self.record_failure(permit),
            _ => self.record_success(permit),
        }
        result
    }

    fn admit(&self) -> Result<Permit, ClientError> {
        let mut data = self.state.lock().expect("breaker state lock poisoned");
        let now = self.clock.now();
        match data.state {
            State::Closed => Ok(Permit { probe: false }),
            State::Open => {
                let elapsed = data
                    .opened_at
                    .map(|at| now.duration_since(at))
                    .unwrap_or_default();
                if elapsed < self.config.reset_timeout {
                    return Err(ClientError::BreakerOpen {
                        service: self.service,
                    });
                }
                self.transition(&mut data, State::HalfOpen, now);
                data.probes_in_flight = 1;
                Ok(Permit { probe: true })
            },
            State::HalfOpen => {
                if data.probes_in_flight >= self.config.max_probes {
                    return Err(ClientError::BreakerOpen {
                        service: self.service,
                    });
                }
                data.probes_in_flight += 1;
                Ok(Permit { probe: true })
            },
        }
    }

    fn record_success(&self, permit: Permit) {
        if !permit.probe {
            return;
        }
        let mut data = self.state.lock().expect("breaker state lock poisoned");
        data.probes_in_flight = data.probes_in_flight.saturating_sub(1);
        if data.state == State::HalfOpen {
            let now = self.clock.now();
            self.transition(&mut data, State::Closed, now);
            self.failures.store(0, Ordering::SeqCst);
            data.window_start = None;
        }
    }

    fn record_failure(&self, permit: Permit) {
        let mut data = self.state.lock().expect("breaker state lock poisoned");
        let now = self.clock.now();
        if permit.probe {
            data.probes_in_flight = data.probes_in_flight.saturating_sub(1);
            if data.state == State::HalfOpen {
                self.transition(&mut data, State::Open, now);
            }
            return;
        }
        if data.state != State::Closed {
            return;
        }
        let in_window = data
            .window_start
            .is_some_and(|start| now.duration_since(start) <= self.config.window);
        let failures = if in_window {
            self.failures.fetch_add(1, Ordering::SeqCst) + 1
        } else {
            data.window_start = Some(now);
            self.failures.store(1, Ordering::SeqCst);
            1
        };
        if failures >= self.config.failure_threshold {
            self.transition(&mut data, State::Open, now);
        }
    }

    fn transition(&self, data: &mut StateData, to: State, now: Instant) {
        let from = data.state;
        data.state = to;
        match to {
            State::Open => data.opened_at = Some(now),
            State::HalfOpen => data.probes_in_flight = 0,
            State::Closed => data.opened_at = None,
        }
        warn!(
            service = %self.service,
            from = from.name(),
            to = to.name(),
            "circuit breaker state change"
        );
    }
}

/// One breaker per logical service, shared across the run.
#[derive(Debug)]
pub struct Breakers {
    source: Arc<CircuitBreaker>,
    target_store: Arc<CircuitBreaker>,
    blob_store: Arc<CircuitBreaker>,
    discovery: Arc<CircuitBreaker>,
}

impl Breakers {
    pub fn new(config: &BreakerConfig, clock: Arc<dyn Clock>) -> Self {
        let breaker = |service| {
            Arc::new(CircuitBreaker::new(
                service,
                config.clone(),
                Arc::clone(&clock),
            ))
        };
        Self {
            source: breaker(ServiceKind::Source),
            target_store: breaker(ServiceKind::TargetStore),
            blob_store: breaker(ServiceKind::BlobStore),
            discovery: breaker(ServiceKind::Discovery),
        }
    }

    pub fn get(&self, service: ServiceKind) -> Arc<CircuitBreaker> {
        match service {
            ServiceKind::Source => Arc::clone(&self.source),
            ServiceKind::TargetStore => Arc::clone(&self.target_store),
            ServiceKind::BlobStore => Arc::clone(&self.blob_store),
            ServiceKind::Discovery => Arc::clone(&self.discovery),
        }
    }
}

/// Exponential backoff with jitter.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub base: Duration,
    pub factor: f64,
    pub jitter: f64,
    pub cap: Duration,
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(100),
            factor: 2.0,
            jitter: 0.2,
            cap: Duration::from_secs(30),
            max_attempts: 3,
        }
    }
}

impl RetryPolicy {
    /// Backoff before the retry following `attempt` (1-based), jittered.
    fn backoff(&self, attempt: u32) -> Duration {
        let exp = self.base.as_secs_f64() * self.factor.powi(attempt.saturating_sub(1) as i32);
        let capped = exp.min(self.cap.as_secs_f64());
        let jittered = if self.jitter > 0.0 {
            capped * rand::rng().random_range(1.0 - self.jitter..=1.0 + self.jitter)
        } else {
            capped
        };
        Duration::from_secs_f64(jittered.max(0.0))
    }
}

/// Retry `f` under `policy`, checking the context between attempts.
///
/// Each attempt is bounded by [`DEFAULT_CALL_TIMEOUT`] or the remaining
/// deadline, whichever is shorter; an attempt that times out counts as a
/// transient failure. Backoff sleeps never extend past the deadline:
/// when the remaining budget is smaller than the computed backoff the
/// last error is returned instead.
pub async fn retry<T, F, Fut>(
    policy: &RetryPolicy,
    ctx: &RequestContext,
    metrics: &Metrics,
    operation: &'static str,
    mut f: F,
) -> Result<T, ClientError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ClientError>>,
{
    let mut attempt = 1;
    loop {
        ctx.check()?;
        let budget = match ctx.remaining() {
            Some(remaining) => remaining.min(DEFAULT_CALL_TIMEOUT),
            None => DEFAULT_CALL_TIMEOUT,
        };
        let result = match tokio::time::timeout(budget, f()).await {
            Ok(result) => result,
            Err(_) => Err(ClientError::transient(operation, "call timed out")),
        };
        match result {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retriable() && attempt < policy.max_attempts => {
                let delay = policy.backoff(attempt);
                if let Some(remaining) = ctx.remaining() {
                    if remaining < delay {
                        return Err(err);
                    }
                }
                metrics.retries.increment();
                debug!(
                    operation,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    request_id = %ctx.request_id(),
                    error = %err,
                    "retrying after transient failure"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            },
            Err(err) => return Err(err),
        }
    }
}
