//! Per-backend circuit breaker.
//!
//! ```text
//! Closed   --(requests >= min_requests && failures/requests >= ratio)--> Open
//! Open     --(timeout elapsed, next call)-------------------------------> HalfOpen
//! HalfOpen --(max_requests consecutive successes)-----------------------> Closed
//! HalfOpen --(any failure)----------------------------------------------> Open
//! ```
//!
//! Counts belong to a *generation*. A new generation starts on every state
//! change and on each interval rollover while closed; outcomes reported for an
//! older generation are dropped. The protected operation always runs outside
//! the lock.
use std::{fmt, future::Future, time::Duration};

use parking_lot::Mutex;
use thiserror::Error;
use tokio::time::Instant;

use crate::{config::CircuitBreakerConfig, metrics};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    HalfOpen,
    Open,
}

impl CircuitState {
    /// Numeric encoding used for the state gauge.
    pub fn as_gauge(self) -> f64 {
        match self {
            CircuitState::Closed => 0.0,
            CircuitState::HalfOpen => 1.0,
            CircuitState::Open => 2.0,
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::HalfOpen => write!(f, "half-open"),
            CircuitState::Open => write!(f, "open"),
        }
    }
}

/// Outcome counters for the current generation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Counts {
    pub requests: u32,
    pub total_successes: u32,
    pub total_failures: u32,
    pub consecutive_successes: u32,
    pub consecutive_failures: u32,
}

impl Counts {
    fn on_request(&mut self) {
        self.requests = self.requests.saturating_add(1);
    }

    fn on_success(&mut self) {
        self.total_successes = self.total_successes.saturating_add(1);
        self.consecutive_successes = self.consecutive_successes.saturating_add(1);
        self.consecutive_failures = 0;
    }

    fn on_failure(&mut self) {
        self.total_failures = self.total_failures.saturating_add(1);
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.consecutive_successes = 0;
    }

    fn clear(&mut self) {
        *self = Counts::default();
    }
}

#[derive(Error, Debug)]
pub enum CircuitBreakerError<E> {
    /// Rejected without running the operation
    #[error("circuit breaker is open")]
    Open,

    /// Half-open trial slots are all taken
    #[error("too many requests while circuit breaker is half-open")]
    TooManyRequests,

    /// The operation ran and failed
    #[error(transparent)]
    Inner(E),
}

impl<E> CircuitBreakerError<E> {
    /// True when the breaker refused the call instead of running it.
    pub fn is_rejection(&self) -> bool {
        !matches!(self, CircuitBreakerError::Inner(_))
    }
}

#[derive(Debug, Clone)]
struct Settings {
    max_requests: u32,
    interval: Duration,
    timeout: Duration,
    min_requests: u32,
    failure_ratio: f64,
}

impl Settings {
    fn ready_to_trip(&self, counts: &Counts) -> bool {
        counts.requests >= self.min_requests
            && f64::from(counts.total_failures) / f64::from(counts.requests) >= self.failure_ratio
    }
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    generation: u64,
    counts: Counts,
    expiry: Option<Instant>,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    settings: Settings,
    inner: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: &CircuitBreakerConfig) -> Self {
        let settings = Settings {
            max_requests: config.max_requests.max(1),
            interval: config.interval(),
            timeout: config.timeout(),
            min_requests: config.min_requests.max(1),
            failure_ratio: config.failure_ratio,
        };
        let breaker = Self {
            name: name.into(),
            inner: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                generation: 0,
                counts: Counts::default(),
                expiry: None,
            }),
            settings,
        };
        breaker.inner.lock().new_generation(&breaker.settings, Instant::now());
        metrics::set_circuit_breaker_state(&breaker.name, CircuitState::Closed);
        breaker
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current state, applying any pending time-based transition.
    pub fn state(&self) -> CircuitState {
        let mut inner = self.inner.lock();
        self.current_state(&mut inner, Instant::now())
    }

    pub fn counts(&self) -> Counts {
        let mut inner = self.inner.lock();
        self.current_state(&mut inner, Instant::now());
        inner.counts
    }

    /// Run `operation` if the breaker admits it and record the outcome.
    ///
    /// A rejected call never invokes `operation`. If the returned future is
    /// dropped before the operation finishes, the admission is released and
    /// no outcome is recorded.
    pub async fn execute<F, Fut, T, E>(&self, operation: F) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let generation = self.before_request()?;
        let mut admission = Admission {
            breaker: self,
            generation,
            settled: false,
        };

        let result = operation().await;

        admission.settled = true;
        self.after_request(generation, result.is_ok());
        result.map_err(CircuitBreakerError::Inner)
    }

    fn before_request<E>(&self) -> Result<u64, CircuitBreakerError<E>> {
        let mut inner = self.inner.lock();
        let state = self.current_state(&mut inner, Instant::now());

        match state {
            CircuitState::Open => return Err(CircuitBreakerError::Open),
            CircuitState::HalfOpen if inner.counts.requests >= self.settings.max_requests => {
                return Err(CircuitBreakerError::TooManyRequests);
            }
            _ => {}
        }

        inner.counts.on_request();
        Ok(inner.generation)
    }

    fn after_request(&self, before: u64, success: bool) {
        let mut inner = self.inner.lock();
        let now = Instant::now();
        let state = self.current_state(&mut inner, now);
        if inner.generation != before {
            return;
        }

        if success {
            self.on_success(&mut inner, state, now);
        } else {
            self.on_failure(&mut inner, state, now);
        }
    }

    fn release(&self, before: u64) {
        let mut inner = self.inner.lock();
        self.current_state(&mut inner, Instant::now());
        if inner.generation == before {
            inner.counts.requests = inner.counts.requests.saturating_sub(1);
        }
    }

    fn on_success(&self, inner: &mut BreakerState, state: CircuitState, now: Instant) {
        match state {
            CircuitState::Closed => {
                inner.counts.on_success();
                if self.settings.ready_to_trip(&inner.counts) {
                    self.set_state(inner, CircuitState::Open, now);
                }
            }
            CircuitState::HalfOpen => {
                inner.counts.on_success();
                if inner.counts.consecutive_successes >= self.settings.max_requests {
                    self.set_state(inner, CircuitState::Closed, now);
                }
            }
            CircuitState::Open => {}
        }
    }

    fn on_failure(&self, inner: &mut BreakerState, state: CircuitState, now: Instant) {
        match state {
            CircuitState::Closed => {
                inner.counts.on_failure();
                if self.settings.ready_to_trip(&inner.counts) {
                    self.set_state(inner, CircuitState::Open, now);
                }
            }
            CircuitState::HalfOpen => self.set_state(inner, CircuitState::Open, now),
            CircuitState::Open => {}
        }
    }

    fn current_state(&self, inner: &mut BreakerState, now: Instant) -> CircuitState {
        match inner.state {
            CircuitState::Closed => {
                if inner.expiry.is_some_and(|expiry| expiry <= now) {
                    inner.new_generation(&self.settings, now);
                }
            }
            CircuitState::Open => {
                if inner.expiry.is_some_and(|expiry| expiry <= now) {
                    self.set_state(inner, CircuitState::HalfOpen, now);
                }
            }
            CircuitState::HalfOpen => {}
        }
        inner.state
    }

    fn set_state(&self, inner: &mut BreakerState, to: CircuitState, now: Instant) {
        let from = inner.state;
        if from == to {
            return;
        }
        let counts = inner.counts;
        inner.state = to;
        inner.new_generation(&self.settings, now);

        match to {
            CircuitState::Open => tracing::warn!(
                breaker = %self.name,
                %from,
                %to,
                requests = counts.requests,
                failures = counts.total_failures,
                "Circuit breaker state changed"
            ),
            _ => tracing::info!(breaker = %self.name, %from, %to, "Circuit breaker state changed"),
        }
        metrics::set_circuit_breaker_state(&self.name, to);
    }
}

impl BreakerState {
    fn new_generation(&mut self, settings: &Settings, now: Instant) {
        self.generation = self.generation.wrapping_add(1);
        self.counts.clear();
        self.expiry = match self.state {
            CircuitState::Closed if settings.interval.is_zero() => None,
            CircuitState::Closed => now.checked_add(settings.interval),
            CircuitState::Open => now.checked_add(settings.timeout),
            CircuitState::HalfOpen => None,
        };
    }
}

/// Releases the admission slot if the caller goes away mid-operation.
struct Admission<'a> {
    breaker: &'a CircuitBreaker,
    generation: u64,
    settled: bool,
}

impl Drop for Admission<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.breaker.release(self.generation);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    };

    use futures_util::FutureExt;
    use tokio::sync::{mpsc, oneshot};

    use super::*;

    fn breaker() -> CircuitBreaker {
        CircuitBreaker::new("test", &CircuitBreakerConfig::default())
    }

    async fn succeed(breaker: &CircuitBreaker) -> Result<(), CircuitBreakerError<&'static str>> {
        breaker.execute(|| async { Ok(()) }).await
    }

    async fn fail(breaker: &CircuitBreaker) -> Result<(), CircuitBreakerError<&'static str>> {
        breaker.execute(|| async { Err("boom") }).await
    }

    async fn trip(breaker: &CircuitBreaker) {
        for _ in 0..5 {
            let _ = fail(breaker).await;
        }
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn opens_after_three_failures_in_five() {
        let breaker = breaker();

        fail(&breaker).await.unwrap_err();
        succeed(&breaker).await.unwrap();
        fail(&breaker).await.unwrap_err();
        succeed(&breaker).await.unwrap();
        assert_eq!(breaker.state(), CircuitState::Closed);
        fail(&breaker).await.unwrap_err();
        assert_eq!(breaker.state(), CircuitState::Open);

        let calls = AtomicUsize::new(0);
        let result: Result<(), CircuitBreakerError<&str>> = breaker
            .execute(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await;
        assert!(matches!(result, Err(CircuitBreakerError::Open)));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn trip_is_checked_after_successes_too() {
        let breaker = breaker();

        for _ in 0..3 {
            fail(&breaker).await.unwrap_err();
        }
        succeed(&breaker).await.unwrap();
        assert_eq!(breaker.state(), CircuitState::Closed);
        succeed(&breaker).await.unwrap();
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn stays_closed_below_min_requests() {
        let breaker = breaker();
        for _ in 0..4 {
            fail(&breaker).await.unwrap_err();
        }
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.counts().total_failures, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn interval_rollover_resets_counts() {
        let breaker = breaker();
        for _ in 0..4 {
            fail(&breaker).await.unwrap_err();
        }

        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(breaker.counts(), Counts::default());

        fail(&breaker).await.unwrap_err();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn oversized_windows_do_not_overflow() {
        let breaker = CircuitBreaker::new(
            "test",
            &CircuitBreakerConfig {
                interval_secs: u64::MAX,
                timeout_secs: u64::MAX,
                ..CircuitBreakerConfig::default()
            },
        );
        trip(&breaker).await;

        tokio::time::advance(Duration::from_secs(3600)).await;
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_after_timeout() {
        let breaker = breaker();
        trip(&breaker).await;

        tokio::time::advance(Duration::from_secs(9)).await;
        assert!(matches!(
            succeed(&breaker).await,
            Err(CircuitBreakerError::Open)
        ));

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_admits_exactly_max_requests_trials() {
        let breaker = Arc::new(breaker());
        trip(&breaker).await;
        tokio::time::advance(Duration::from_secs(10)).await;

        let (started_tx, mut started_rx) = mpsc::channel(8);
        let mut releases = Vec::new();
        let mut trials = Vec::new();
        for _ in 0..5 {
            let (release_tx, release_rx) = oneshot::channel::<()>();
            releases.push(release_tx);
            let breaker = breaker.clone();
            let started_tx = started_tx.clone();
            trials.push(tokio::spawn(async move {
                breaker
                    .execute(|| async move {
                        started_tx.send(()).await.unwrap();
                        release_rx.await.unwrap();
                        Ok::<_, &str>(())
                    })
                    .await
            }));
        }
        for _ in 0..5 {
            started_rx.recv().await.unwrap();
        }

        let calls = AtomicUsize::new(0);
        let extra: Result<(), CircuitBreakerError<&str>> = breaker
            .execute(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await;
        assert!(matches!(extra, Err(CircuitBreakerError::TooManyRequests)));
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        for release in releases {
            release.send(()).unwrap();
        }
        for trial in trials {
            trial.await.unwrap().unwrap();
        }
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.counts(), Counts::default());
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_failure_reopens() {
        let breaker = breaker();
        trip(&breaker).await;
        tokio::time::advance(Duration::from_secs(10)).await;

        succeed(&breaker).await.unwrap();
        succeed(&breaker).await.unwrap();
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        fail(&breaker).await.unwrap_err();
        assert_eq!(breaker.state(), CircuitState::Open);

        // Timeout restarts from the reopen.
        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_generation_outcome_is_ignored() {
        let breaker = Arc::new(breaker());
        let (release_tx, release_rx) = oneshot::channel::<()>();

        let slow = {
            let breaker = breaker.clone();
            tokio::spawn(async move {
                breaker
                    .execute(|| async move {
                        release_rx.await.unwrap();
                        Err::<(), _>("late failure")
                    })
                    .await
            })
        };
        tokio::task::yield_now().await;
        assert_eq!(breaker.counts().requests, 1);

        tokio::time::advance(Duration::from_secs(31)).await;
        release_tx.send(()).unwrap();
        assert!(slow.await.unwrap().is_err());

        assert_eq!(breaker.counts(), Counts::default());
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_call_releases_its_slot() {
        let breaker = breaker();
        trip(&breaker).await;
        tokio::time::advance(Duration::from_secs(10)).await;

        for _ in 0..5 {
            let pending = breaker
                .execute(|| std::future::pending::<Result<(), &str>>())
                .now_or_never();
            assert!(pending.is_none());
        }
        assert_eq!(breaker.counts().requests, 0);

        succeed(&breaker).await.unwrap();
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        assert_eq!(breaker.counts().consecutive_successes, 1);
    }

    #[test]
    fn rejection_errors_are_distinguished() {
        assert!(CircuitBreakerError::<()>::Open.is_rejection());
        assert!(CircuitBreakerError::<()>::TooManyRequests.is_rejection());
        assert!(!CircuitBreakerError::Inner(()).is_rejection());
    }
}
