// 🛡️ Ingestion Resilience - retry + circuit breaker per upstream account
//
// CLOSED ──N consecutive transient failures──▶ OPEN ──recovery timeout──▶ HALF_OPEN
//   ▲                                           ▲                            │
//   └──────────────── trial call succeeds ──────┼────── trial call fails ────┘
//
// Retries: exponential backoff (base, doubling, capped), transient errors only.
// Backoff sleeps end early when shutdown is triggered.

use crate::config::ResilienceConfig;
use crate::error::{FetchError, Result, UnifyError};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

// ============================================================================
// RETRY POLICY
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts per call, first one included (default: 3)
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        RetryPolicy {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay,
        }
    }

    pub fn from_config(config: &ResilienceConfig) -> Self {
        Self::new(
            config.retry_max_attempts,
            config.retry_base_delay(),
            config.retry_max_delay(),
        )
    }

    /// Delay after the `attempt`-th failed attempt: base * 2^(attempt-1), capped.
    /// A longer Retry-After from the upstream wins (still capped).
    pub fn delay_for(&self, attempt: u32, error: &FetchError) -> Duration {
        let exponent = attempt.saturating_sub(1);
        let backoff = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(exponent));

        let delay = match error {
            FetchError::RateLimited { retry_after_secs } => {
                backoff.max(Duration::from_secs(*retry_after_secs))
            }
            _ => backoff,
        };

        delay.min(self.max_delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&ResilienceConfig::default())
    }
}

// ============================================================================
// CIRCUIT BREAKER
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
struct BreakerInner {
    state: BreakerState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
}

/// One upstream account's breaker. Shared by reference; state behind a mutex.
#[derive(Debug)]
pub struct CircuitBreaker {
    account: String,
    failure_threshold: u32,
    recovery_timeout: Duration,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(account: &str, failure_threshold: u32, recovery_timeout: Duration) -> Self {
        CircuitBreaker {
            account: account.to_string(),
            failure_threshold: failure_threshold.max(1),
            recovery_timeout,
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                trial_in_flight: false,
            }),
        }
    }

    pub fn from_config(account: &str, config: &ResilienceConfig) -> Self {
        Self::new(account, config.failure_threshold, config.recovery_timeout())
    }

    pub fn account(&self) -> &str {
        &self.account
    }

    pub fn state(&self) -> BreakerState {
        self.inner.lock().state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.inner.lock().consecutive_failures
    }

    /// Permission for one call. Fails fast with ServiceUnavailable while OPEN.
    pub fn try_acquire(&self) -> Result<()> {
        let mut inner = self.inner.lock();

        match inner.state {
            BreakerState::Closed => Ok(()),
            BreakerState::Open => {
                let elapsed = inner
                    .opened_at
                    .map(|at| at.elapsed())
                    .unwrap_or(self.recovery_timeout);

                if elapsed >= self.recovery_timeout {
                    inner.state = BreakerState::HalfOpen;
                    inner.trial_in_flight = true;
                    info!(account = %self.account, "circuit half-open, allowing trial call");
                    Ok(())
                } else {
                    let remaining = self.recovery_timeout - elapsed;
                    Err(UnifyError::service_unavailable(
                        &self.account,
                        format!("circuit open, retry in {}s", remaining.as_secs()),
                    ))
                }
            }
            BreakerState::HalfOpen if inner.trial_in_flight => Err(UnifyError::service_unavailable(
                &self.account,
                "circuit half-open, trial call in flight",
            )),
            BreakerState::HalfOpen => {
                inner.trial_in_flight = true;
                Ok(())
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        if inner.state != BreakerState::Closed {
            info!(account = %self.account, "circuit closed");
        }
        inner.state = BreakerState::Closed;
        inner.consecutive_failures = 0;
        inner.opened_at = None;
        inner.trial_in_flight = false;
    }

    /// A transient failure.
    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
        inner.trial_in_flight = false;

        let trips = match inner.state {
            BreakerState::HalfOpen => true,
            BreakerState::Closed => inner.consecutive_failures >= self.failure_threshold,
            BreakerState::Open => false,
        };

        if trips {
            inner.state = BreakerState::Open;
            inner.opened_at = Some(Instant::now());
            warn!(
                account = %self.account,
                failures = inner.consecutive_failures,
                recovery_secs = self.recovery_timeout.as_secs(),
                "circuit opened"
            );
        }
    }

    /// The call finished with a non-transient error: counts neither way,
    /// but frees the half-open trial slot.
    pub fn release(&self) {
        self.inner.lock().trial_in_flight = false;
    }
}

// ============================================================================
// BREAKER REGISTRY
// ============================================================================

/// One independent breaker per upstream account.
#[derive(Debug)]
pub struct BreakerRegistry {
    config: ResilienceConfig,
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
}

impl BreakerRegistry {
    pub fn new(config: ResilienceConfig) -> Self {
        BreakerRegistry {
            config,
            breakers: Mutex::new(HashMap::new()),
        }
    }

    /// Breaker for `account`, created CLOSED on first use.
    pub fn get(&self, account: &str) -> Arc<CircuitBreaker> {
        self.breakers
            .lock()
            .entry(account.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::from_config(account, &self.config)))
            .clone()
    }

    pub fn states(&self) -> Vec<(String, BreakerState)> {
        let mut states: Vec<(String, BreakerState)> = self
            .breakers
            .lock()
            .iter()
            .map(|(account, breaker)| (account.clone(), breaker.state()))
            .collect();
        states.sort_by(|a, b| a.0.cmp(&b.0));
        states
    }
}

impl Default for BreakerRegistry {
    fn default() -> Self {
        Self::new(ResilienceConfig::default())
    }
}

// ============================================================================
// SHUTDOWN
// ============================================================================

/// Process-wide shutdown signal.
#[derive(Debug)]
pub struct Shutdown {
    tx: watch::Sender<bool>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Shutdown { tx }
    }

    pub fn trigger(&self) {
        // send_replace never fails, even with no receivers
        self.tx.send_replace(true);
    }

    pub fn token(&self) -> ShutdownToken {
        ShutdownToken {
            rx: self.tx.subscribe(),
        }
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone)]
pub struct ShutdownToken {
    rx: watch::Receiver<bool>,
}

impl ShutdownToken {
    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once shutdown is triggered. Never resolves if the Shutdown is dropped untriggered.
    pub async fn cancelled(&mut self) {
        while !*self.rx.borrow_and_update() {
            if self.rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

// ============================================================================
// RESILIENT CALL
// ============================================================================

/// Run `op` under the breaker and retry policy.
///
/// - transient error → record failure, back off, retry (until attempts run out)
/// - other error     → propagate immediately as `Upstream`
/// - breaker OPEN (before a call or after a failure trips it) / attempts
///   exhausted → `ServiceUnavailable`
/// - shutdown during backoff → `Cancelled`
pub async fn call_with_resilience<T, F, Fut>(
    breaker: &CircuitBreaker,
    policy: &RetryPolicy,
    shutdown: &mut ShutdownToken,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, FetchError>>,
{
    let mut attempt: u32 = 0;

    loop {
        if shutdown.is_triggered() {
            return Err(UnifyError::Cancelled);
        }

        breaker.try_acquire()?;
        attempt += 1;

        match op().await {
            Ok(value) => {
                breaker.record_success();
                return Ok(value);
            }
            Err(err) if err.is_transient() => {
                breaker.record_failure();

                if breaker.state() == BreakerState::Open {
                    return Err(UnifyError::service_unavailable(
                        breaker.account(),
                        format!("circuit opened after attempt {}: {}", attempt, err),
                    ));
                }

                if attempt >= policy.max_attempts {
                    return Err(UnifyError::service_unavailable(
                        breaker.account(),
                        format!("retries exhausted after {} attempts: {}", attempt, err),
                    ));
                }

                let delay = policy.delay_for(attempt, &err);
                warn!(
                    account = %breaker.account(),
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "transient failure, backing off"
                );

                tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => {
                        debug!(account = %breaker.account(), "backoff interrupted by shutdown");
                        return Err(UnifyError::Cancelled);
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            Err(err) => {
                breaker.release();
                return Err(UnifyError::from_fetch(err));
            }
        }
    }
}
