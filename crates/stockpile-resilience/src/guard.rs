//! 소스 호출 보호막.
//!
//! 재시도가 가장 바깥에 있고, 시도마다 rate limiter 토큰을 받은 뒤
//! 서킷 브레이커를 통과시켜 실행합니다. 서킷이 열리면 `CircuitOpen`은
//! 재시도 불가능한 에러이므로 재시도 루프도 즉시 멈춥니다.

use std::future::Future;
use std::sync::Arc;

use stockpile_core::FetchError;

use crate::circuit_breaker::CircuitBreaker;
use crate::rate_limiter::TokenBucketRateLimiter;
use crate::retry::RetryExecutor;

/// 소스 하나에 대한 rate limiter + 서킷 브레이커 + 재시도 조합.
///
/// limiter와 breaker는 `Arc`로 공유되어 실행 동안 소스별 싱글턴으로 씁니다.
#[derive(Clone)]
pub struct SourceGuard {
    name: String,
    limiter: Option<Arc<TokenBucketRateLimiter>>,
    breaker: Option<Arc<CircuitBreaker>>,
    retry: Option<RetryExecutor>,
}

impl SourceGuard {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            limiter: None,
            breaker: None,
            retry: None,
        }
    }

    /// 아무 보호 없이 그대로 실행.
    pub fn passthrough(name: impl Into<String>) -> Self {
        Self::new(name)
    }

    pub fn with_rate_limiter(mut self, limiter: Arc<TokenBucketRateLimiter>) -> Self {
        self.limiter = Some(limiter);
        self
    }

    pub fn with_circuit_breaker(mut self, breaker: Arc<CircuitBreaker>) -> Self {
        self.breaker = Some(breaker);
        self
    }

    pub fn with_retry(mut self, retry: RetryExecutor) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn circuit_breaker(&self) -> Option<&Arc<CircuitBreaker>> {
        self.breaker.as_ref()
    }

    /// 서킷이 한 번이라도 열렸는지.
    pub fn circuit_tripped(&self) -> bool {
        self.breaker.as_ref().is_some_and(|b| b.has_tripped())
    }

    /// 서킷이 영구 장애 상태인지.
    pub fn circuit_exhausted(&self) -> bool {
        self.breaker.as_ref().is_some_and(|b| b.is_exhausted())
    }

    pub async fn call<T, F, Fut>(&self, operation: F) -> Result<T, FetchError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, FetchError>>,
    {
        let this = self;
        let operation = &operation;
        let attempt = move || async move {
            if let Some(limiter) = &this.limiter {
                limiter.acquire(1).await;
            }
            match &this.breaker {
                Some(breaker) => breaker.execute(operation).await,
                None => operation().await,
            }
        };

        match &self.retry {
            Some(retry) => retry.execute(attempt).await,
            None => attempt().await,
        }
    }
}

impl std::fmt::Debug for SourceGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceGuard")
            .field("name", &self.name)
            .field("rate_limited", &self.limiter.is_some())
            .field("circuit_breaker", &self.breaker.is_some())
            .field("retry", &self.retry.as_ref().map(|r| r.policy().max_retries))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::CircuitBreakerConfig;
    use crate::retry::RetryPolicy;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;
    use stockpile_core::ErrorKind;

    fn retry(max_retries: u32) -> RetryExecutor {
        RetryExecutor::new(
            "test",
            RetryPolicy {
                max_retries,
                base_delay: Duration::from_millis(10),
                max_delay: Duration::from_millis(100),
                multiplier: 2.0,
                jitter: 0.0,
            },
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_passthrough() {
        let guard = SourceGuard::passthrough("test");
        assert_eq!(guard.call(|| async { Ok::<_, FetchError>(1) }).await, Ok(1));
        assert!(!guard.circuit_tripped());
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_circuit_stops_retry_loop() {
        let calls = AtomicU32::new(0);
        let breaker = Arc::new(CircuitBreaker::new(
            "test",
            CircuitBreakerConfig::new(1, Duration::from_secs(60), 1),
        ));
        let guard = SourceGuard::new("test")
            .with_circuit_breaker(breaker)
            .with_retry(retry(5));

        let result: Result<(), _> = guard
            .call(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(FetchError::Network("connection reset".into())) }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(result.unwrap_err().kind(), ErrorKind::CircuitOpen);
        assert!(guard.circuit_tripped());
    }

    #[tokio::test(start_paused = true)]
    async fn test_each_attempt_takes_a_token() {
        let calls = AtomicU32::new(0);
        let limiter = Arc::new(TokenBucketRateLimiter::new(10.0, 5));
        let guard = SourceGuard::new("test")
            .with_rate_limiter(Arc::clone(&limiter))
            .with_retry(retry(2));

        let result = guard
            .call(|| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n == 0 {
                        Err(FetchError::Timeout("slow".into()))
                    } else {
                        Ok(n)
                    }
                }
            })
            .await;

        assert_eq!(result, Ok(1));
        assert!(limiter.available() < 4.0);
    }
}
