//! 서킷 브레이커.
//!
//! 실패가 누적된 소스를 일정 시간 호출하지 않아 연쇄 실패를 막습니다.
//!
//! # 상태 전이
//!
//! ```text
//! Closed ──[연속 실패 failure_threshold회]──> Open
//!    ↑                                          │
//!    │                      [마지막 실패 후 recovery_timeout 경과]
//!    │                                          ↓
//!    └──[연속 성공 success_threshold회]── HalfOpen ──[실패 1회]──> Open
//! ```
//!
//! 모든 전이는 하나의 mutex 안에서 일어나므로 여러 태스크가 동시에
//! 호출해도 안전합니다.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use stockpile_core::FetchError;
use tokio::time::Instant;

/// 서킷 브레이커 상태.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// 정상 - 모든 요청 허용
    Closed,
    /// 장애 - 모든 요청 즉시 거부
    Open,
    /// 복구 확인 중 - 요청 허용, 실패 1회로 다시 Open
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// 서킷 브레이커 설정.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Closed → Open 연속 실패 횟수
    pub failure_threshold: u32,
    /// 마지막 실패 이후 Open 유지 시간
    pub recovery_timeout: Duration,
    /// HalfOpen → Closed 연속 성공 횟수
    pub success_threshold: u32,
    /// 한 번의 실행에서 이 횟수만큼 열리면 영구 장애로 간주 (0 = 제한 없음)
    pub max_open_cycles: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(60),
            success_threshold: 2,
            max_open_cycles: 3,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn new(failure_threshold: u32, recovery_timeout: Duration, success_threshold: u32) -> Self {
        Self {
            failure_threshold,
            recovery_timeout,
            success_threshold,
            ..Default::default()
        }
    }

    pub fn with_max_open_cycles(mut self, cycles: u32) -> Self {
        self.max_open_cycles = cycles;
        self
    }

    /// 스크래핑 소스용 (낮은 임계치, 긴 복구 시간).
    pub fn conservative() -> Self {
        Self {
            failure_threshold: 3,
            recovery_timeout: Duration::from_secs(300),
            success_threshold: 2,
            max_open_cycles: 3,
        }
    }

    /// 공식 API용 (높은 임계치, 짧은 복구 시간).
    pub fn lenient() -> Self {
        Self {
            failure_threshold: 10,
            recovery_timeout: Duration::from_secs(30),
            success_threshold: 1,
            max_open_cycles: 5,
        }
    }
}

struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    last_failure: Option<Instant>,
    last_state_change: Instant,
}

/// 서킷 브레이커.
///
/// ```ignore
/// let breaker = CircuitBreaker::new("naver", CircuitBreakerConfig::conservative());
/// let metrics = breaker.execute(|| source.metrics(&ticker)).await?;
/// ```
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    state: Mutex<BreakerState>,
    total_failures: AtomicU64,
    total_successes: AtomicU64,
    open_count: AtomicU64,
    /// `max_open_cycles`에 도달한 순간 설정되고 `reset` 전까지 유지
    exhausted: AtomicBool,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            state: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                failure_count: 0,
                success_count: 0,
                last_failure: None,
                last_state_change: Instant::now(),
            }),
            total_failures: AtomicU64::new(0),
            total_successes: AtomicU64::new(0),
            open_count: AtomicU64::new(0),
            exhausted: AtomicBool::new(false),
        }
    }

    pub fn with_defaults(name: impl Into<String>) -> Self {
        Self::new(name, CircuitBreakerConfig::default())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn lock(&self) -> MutexGuard<'_, BreakerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// 현재 상태. Open 유지 시간이 지났으면 HalfOpen으로 전이한 뒤 반환합니다.
    pub fn state(&self) -> CircuitState {
        let mut state = self.lock();
        self.maybe_half_open(&mut state);
        state.state
    }

    /// 요청 허용 여부 확인.
    ///
    /// Open이면 남은 대기 시간을 담은 `CircuitOpen` 에러를 반환합니다.
    pub fn check(&self) -> Result<(), FetchError> {
        let mut state = self.lock();
        self.maybe_half_open(&mut state);

        if state.state == CircuitState::Open {
            let elapsed = state
                .last_failure
                .map(|t| t.elapsed())
                .unwrap_or(Duration::ZERO);
            return Err(FetchError::CircuitOpen {
                name: self.name.clone(),
                remaining: self.config.recovery_timeout.saturating_sub(elapsed),
            });
        }
        Ok(())
    }

    /// 상태를 확인한 뒤 작업을 실행하고 결과를 기록합니다.
    ///
    /// 데이터 없음/검증 실패처럼 소스 상태와 무관한 에러는 기록하지 않습니다.
    pub async fn execute<T, F, Fut>(&self, operation: F) -> Result<T, FetchError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, FetchError>>,
    {
        self.check()?;

        let result = operation().await;
        match &result {
            Ok(_) => self.record_success(),
            Err(e) if e.counts_as_failure() => self.record_failure(),
            Err(_) => {}
        }
        result
    }

    /// 성공 기록.
    pub fn record_success(&self) {
        self.total_successes.fetch_add(1, Ordering::Relaxed);
        let mut state = self.lock();

        match state.state {
            CircuitState::HalfOpen => {
                state.success_count += 1;
                if state.success_count >= self.config.success_threshold {
                    self.transition_to(&mut state, CircuitState::Closed);
                    tracing::info!(
                        circuit_breaker = %self.name,
                        "Circuit breaker recovered: HalfOpen -> Closed"
                    );
                }
            }
            CircuitState::Closed => {
                state.failure_count = 0;
            }
            CircuitState::Open => {}
        }
    }

    /// 실패 기록.
    pub fn record_failure(&self) {
        self.total_failures.fetch_add(1, Ordering::Relaxed);
        let mut state = self.lock();
        state.last_failure = Some(Instant::now());

        match state.state {
            CircuitState::Closed => {
                state.failure_count += 1;
                if state.failure_count >= self.config.failure_threshold {
                    self.transition_to(&mut state, CircuitState::Open);
                    let opened = self.count_open();
                    tracing::warn!(
                        circuit_breaker = %self.name,
                        failure_count = state.failure_count,
                        open_count = opened,
                        "Circuit breaker tripped: Closed -> Open"
                    );
                }
            }
            CircuitState::HalfOpen => {
                self.transition_to(&mut state, CircuitState::Open);
                let opened = self.count_open();
                tracing::warn!(
                    circuit_breaker = %self.name,
                    open_count = opened,
                    "Circuit breaker recovery failed: HalfOpen -> Open"
                );
            }
            CircuitState::Open => {}
        }
    }

    /// Open 전이 횟수를 올리고, 한도에 닿으면 소진 상태로 고정합니다.
    fn count_open(&self) -> u64 {
        let opened = self.open_count.fetch_add(1, Ordering::Relaxed) + 1;
        let limit = u64::from(self.config.max_open_cycles);
        if limit > 0 && opened >= limit && !self.exhausted.swap(true, Ordering::Relaxed) {
            tracing::error!(
                circuit_breaker = %self.name,
                open_count = opened,
                "Circuit breaker exhausted: no further recovery this run"
            );
        }
        opened
    }

    /// 수동 리셋. 소진 상태와 Open 횟수도 지웁니다.
    pub fn reset(&self) {
        let mut state = self.lock();
        self.transition_to(&mut state, CircuitState::Closed);
        state.last_failure = None;
        self.open_count.store(0, Ordering::Relaxed);
        self.exhausted.store(false, Ordering::Relaxed);
        tracing::info!(circuit_breaker = %self.name, "Circuit breaker manually reset");
    }

    /// 이번 실행 중 한 번이라도 열렸는지 여부.
    pub fn has_tripped(&self) -> bool {
        self.open_count.load(Ordering::Relaxed) > 0
    }

    /// `max_open_cycles`만큼 열려 더 이상 복구를 기대하지 않는 상태.
    ///
    /// 한도에 닿은 뒤에는 복구 시간이 지나 HalfOpen이 되어도 유지됩니다.
    pub fn is_exhausted(&self) -> bool {
        self.exhausted.load(Ordering::Relaxed)
    }

    pub fn metrics(&self) -> CircuitBreakerMetrics {
        let mut state = self.lock();
        self.maybe_half_open(&mut state);
        CircuitBreakerMetrics {
            name: self.name.clone(),
            state: state.state,
            failure_count: state.failure_count,
            total_failures: self.total_failures.load(Ordering::Relaxed),
            total_successes: self.total_successes.load(Ordering::Relaxed),
            open_count: self.open_count.load(Ordering::Relaxed),
            time_in_current_state: state.last_state_change.elapsed(),
        }
    }

    fn maybe_half_open(&self, state: &mut BreakerState) {
        if state.state != CircuitState::Open {
            return;
        }
        let since = state.last_failure.unwrap_or(state.last_state_change);
        if since.elapsed() >= self.config.recovery_timeout {
            self.transition_to(state, CircuitState::HalfOpen);
            tracing::info!(
                circuit_breaker = %self.name,
                "Circuit breaker timeout: Open -> HalfOpen"
            );
        }
    }

    fn transition_to(&self, state: &mut BreakerState, new_state: CircuitState) {
        state.state = new_state;
        state.last_state_change = Instant::now();
        match new_state {
            CircuitState::Closed => {
                state.failure_count = 0;
                state.success_count = 0;
            }
            CircuitState::HalfOpen => state.success_count = 0,
            CircuitState::Open => {}
        }
    }
}

/// 서킷 브레이커 메트릭.
#[derive(Debug, Clone)]
pub struct CircuitBreakerMetrics {
    pub name: String,
    pub state: CircuitState,
    /// 현재 연속 실패 횟수
    pub failure_count: u32,
    pub total_failures: u64,
    pub total_successes: u64,
    /// Open 전이 횟수
    pub open_count: u64,
    pub time_in_current_state: Duration,
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::advance;

    fn breaker(failures: u32, recovery_ms: u64, successes: u32) -> CircuitBreaker {
        CircuitBreaker::new(
            "test",
            CircuitBreakerConfig::new(failures, Duration::from_millis(recovery_ms), successes),
        )
    }

    async fn fail(cb: &CircuitBreaker) -> Result<(), FetchError> {
        cb.execute(|| async { Err::<(), _>(FetchError::Network("down".into())) })
            .await
    }

    async fn succeed(cb: &CircuitBreaker) -> Result<u32, FetchError> {
        cb.execute(|| async { Ok(7) }).await
    }

    #[test]
    fn test_initial_state() {
        let cb = CircuitBreaker::with_defaults("test");
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.check().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_after_exact_threshold() {
        let cb = breaker(3, 30_000, 1);

        let _ = fail(&cb).await;
        let _ = fail(&cb).await;
        assert_eq!(cb.state(), CircuitState::Closed);

        let _ = fail(&cb).await;
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(cb.has_tripped());
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_rejects_with_remaining_wait() {
        let cb = breaker(1, 1_000, 1);
        let _ = fail(&cb).await;

        advance(Duration::from_millis(400)).await;

        let mut called = false;
        let err = cb
            .execute(|| {
                called = true;
                async { Ok::<_, FetchError>(()) }
            })
            .await
            .unwrap_err();

        assert!(!called);
        assert!(!err.is_retryable());
        assert_eq!(err.retry_after(), Some(Duration::from_millis(600)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_failure_count() {
        let cb = breaker(3, 30_000, 1);

        let _ = fail(&cb).await;
        let _ = fail(&cb).await;
        succeed(&cb).await.unwrap();
        let _ = fail(&cb).await;
        let _ = fail(&cb).await;
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_failure_reopens() {
        let cb = breaker(2, 100, 2);
        let _ = fail(&cb).await;
        let _ = fail(&cb).await;

        advance(Duration::from_millis(101)).await;
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        let _ = fail(&cb).await;
        assert_eq!(cb.state(), CircuitState::Open);
        assert_eq!(cb.metrics().open_count, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_closes_after_success_threshold() {
        let cb = breaker(1, 100, 2);
        let _ = fail(&cb).await;
        advance(Duration::from_millis(100)).await;

        assert_eq!(succeed(&cb).await.unwrap(), 7);
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        succeed(&cb).await.unwrap();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_not_found_does_not_trip() {
        let cb = breaker(1, 30_000, 1);
        let result = cb
            .execute(|| async { Err::<(), _>(FetchError::NotFound("delisted".into())) })
            .await;

        assert!(result.is_err());
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_after_max_open_cycles() {
        let cb = CircuitBreaker::new(
            "test",
            CircuitBreakerConfig::new(1, Duration::from_millis(50), 1).with_max_open_cycles(2),
        );

        let _ = fail(&cb).await;
        assert!(!cb.is_exhausted());

        advance(Duration::from_millis(60)).await;
        let _ = fail(&cb).await;
        assert!(cb.is_exhausted());

        cb.reset();
        assert!(!cb.is_exhausted());
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_survives_recovery_timeout() {
        let cb = CircuitBreaker::new(
            "test",
            CircuitBreakerConfig::new(1, Duration::from_millis(50), 1).with_max_open_cycles(2),
        );

        let _ = fail(&cb).await;
        advance(Duration::from_millis(60)).await;
        let _ = fail(&cb).await;

        // 단계가 끝나기 전에 복구 시간이 지나도 소진 상태는 남아 있어야 함
        advance(Duration::from_millis(60)).await;
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert!(cb.is_exhausted());
    }
}
