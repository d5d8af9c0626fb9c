//! 재시도 유틸리티.
//!
//! 타임아웃, 연결 오류, rate limit처럼 일시적인 에러만 지수 백오프로
//! 재시도합니다.
//!
//! ```rust,ignore
//! let retry = RetryExecutor::new("yahoo", RetryPolicy::default());
//! let bars = retry.execute(|| source.history(&ticker, 300)).await?;
//! ```

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use stockpile_core::FetchError;
use tracing::{debug, warn};

/// 재시도 설정.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// 최대 재시도 횟수 (첫 시도 제외)
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// 백오프 배수
    pub multiplier: f64,
    /// ±비율 지터 (0.0 ~ 1.0)
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: 0.25,
        }
    }
}

impl RetryPolicy {
    /// 짧은 지연, 적은 재시도.
    pub fn fast() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            ..Default::default()
        }
    }

    /// 스크래핑 소스용 긴 대기.
    pub fn patient() -> Self {
        Self {
            max_retries: 4,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(60),
            ..Default::default()
        }
    }

    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    /// `attempt`(0부터) 이후의 지터 없는 대기 시간.
    pub fn base_delay_for(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.powi(attempt.min(32) as i32);
        let secs = (self.base_delay.as_secs_f64() * factor).min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(secs)
    }

    pub fn delay_for(&self, attempt: u32) -> Duration {
        let delay = self.base_delay_for(attempt);
        if self.jitter <= 0.0 {
            return delay;
        }
        let factor = 1.0 + rand::thread_rng().gen_range(-self.jitter..=self.jitter);
        Duration::from_secs_f64((delay.as_secs_f64() * factor).max(0.0))
    }
}

/// 재시도 실행기.
#[derive(Debug, Clone)]
pub struct RetryExecutor {
    name: String,
    policy: RetryPolicy,
}

impl RetryExecutor {
    pub fn new(name: impl Into<String>, policy: RetryPolicy) -> Self {
        Self {
            name: name.into(),
            policy,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// 최대 `max_retries + 1`번 실행합니다.
    ///
    /// 재시도 불가능한 에러나 재시도 소진 시 마지막 에러를 그대로 반환합니다.
    pub async fn execute<T, F, Fut>(&self, mut operation: F) -> Result<T, FetchError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, FetchError>>,
    {
        let mut attempt = 0;
        loop {
            match operation().await {
                Ok(value) => {
                    if attempt > 0 {
                        debug!(source = %self.name, attempts = attempt + 1, "재시도 후 성공");
                    }
                    return Ok(value);
                }
                Err(e) => {
                    if !e.is_retryable() {
                        debug!(source = %self.name, error = %e, "재시도 불가능한 에러");
                        return Err(e);
                    }
                    if attempt >= self.policy.max_retries {
                        warn!(
                            source = %self.name,
                            attempts = attempt + 1,
                            error = %e,
                            "재시도 소진"
                        );
                        return Err(e);
                    }

                    let delay = self.policy.delay_for(attempt);
                    warn!(
                        source = %self.name,
                        attempt = attempt + 1,
                        max_retries = self.policy.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "일시적 에러, 재시도 예정"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
            multiplier: 2.0,
            jitter: 0.0,
        }
    }

    #[test]
    fn test_delay_curve_is_capped() {
        let p = policy(5);
        assert_eq!(p.base_delay_for(0), Duration::from_millis(100));
        assert_eq!(p.base_delay_for(2), Duration::from_millis(400));
        assert_eq!(p.base_delay_for(10), Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let executor = RetryExecutor::new("test", policy(3));

        let result = executor
            .execute(|| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 3 {
                        Err(FetchError::Timeout("slow".into()))
                    } else {
                        Ok(n)
                    }
                }
            })
            .await;

        assert_eq!(result, Ok(3));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_returns_last_error() {
        let calls = AtomicU32::new(0);
        let executor = RetryExecutor::new("test", policy(2));

        let result: Result<(), _> = executor
            .execute(|| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move { Err(FetchError::RateLimited(format!("attempt {n}"))) }
            })
            .await;

        assert_eq!(result, Err(FetchError::RateLimited("attempt 2".into())));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retryable_called_once() {
        let calls = AtomicU32::new(0);
        let executor = RetryExecutor::new("test", policy(5));

        let result: Result<(), _> = executor
            .execute(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(FetchError::NotFound("delisted".into())) }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
