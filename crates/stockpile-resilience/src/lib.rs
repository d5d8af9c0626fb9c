//! 적대적인 rate limit 환경에서 외부 소스를 호출하기 위한 복원력 도구.
//!
//! - [`CircuitBreaker`]: 3상태 서킷 브레이커
//! - [`TokenBucketRateLimiter`]: 토큰 버킷 기반 요청 제한
//! - [`RetryExecutor`]: 지수 백오프 + 지터 재시도
//! - [`AdaptiveBatchStrategy`]: 연속 rate limit 감지 시 배치 단위 백오프
//! - [`SourceGuard`]: 위 요소를 소스/단계별로 조합

pub mod adaptive_batch;
pub mod backoff;
pub mod circuit_breaker;
pub mod classify;
pub mod guard;
pub mod rate_limiter;
pub mod retry;

pub use adaptive_batch::{
    AdaptiveBatchConfig, AdaptiveBatchStrategy, BatchOutcome, HaltReason, ItemOutcome,
};
pub use backoff::BackoffPolicy;
pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerMetrics, CircuitState,
};
pub use classify::FailureClass;
pub use guard::SourceGuard;
pub use rate_limiter::TokenBucketRateLimiter;
pub use retry::{RetryExecutor, RetryPolicy};
