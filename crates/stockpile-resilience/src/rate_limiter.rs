//! Token Bucket 기반 rate limiter.
//!
//! 소스마다 하나씩 만들어 실행 동안 모든 워커가 공유합니다.

use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use tokio::time::Instant;

#[derive(Debug)]
struct Bucket {
    /// 현재 토큰 수. 대기 중인 예약이 있으면 음수가 될 수 있습니다.
    tokens: f64,
    last_refill: Instant,
}

/// Token Bucket rate limiter.
///
/// 리필과 차감은 하나의 lock 안에서 처리하고, 대기(sleep)는 lock 밖에서
/// 합니다. 부족한 토큰은 먼저 예약(음수 잔고)해 두므로 동시에 대기하는
/// 호출자들이 같은 토큰을 두 번 받는 일이 없습니다. 대기 중에 future가
/// 취소되면(종목 타임아웃 등) 예약한 토큰은 되돌려집니다.
#[derive(Debug)]
pub struct TokenBucketRateLimiter {
    /// 초당 리필되는 토큰 수
    rate: f64,
    /// 버킷 용량
    burst: f64,
    bucket: Mutex<Bucket>,
}

impl TokenBucketRateLimiter {
    /// 새 rate limiter 생성. 버킷은 가득 찬 상태로 시작합니다.
    pub fn new(rate: f64, burst: u32) -> Self {
        let burst = f64::from(burst.max(1));
        Self {
            rate: if rate > 0.0 { rate } else { 1.0 },
            burst,
            bucket: Mutex::new(Bucket {
                tokens: burst,
                last_refill: Instant::now(),
            }),
        }
    }

    /// 분당 요청 수로 생성.
    pub fn per_minute(requests_per_minute: u32, burst: u32) -> Self {
        Self::new(f64::from(requests_per_minute) / 60.0, burst)
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }

    pub fn burst(&self) -> u32 {
        self.burst as u32
    }

    fn lock(&self) -> MutexGuard<'_, Bucket> {
        self.bucket.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn refill(&self, bucket: &mut Bucket) {
        let now = Instant::now();
        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.rate).min(self.burst);
        bucket.last_refill = now;
    }

    /// 토큰 `n`개를 얻을 때까지 대기합니다.
    ///
    /// 반환값은 실제로 기다린 시간입니다.
    pub async fn acquire(&self, n: u32) -> Duration {
        let wait = {
            let mut bucket = self.lock();
            self.refill(&mut bucket);
            bucket.tokens -= f64::from(n);
            if bucket.tokens >= 0.0 {
                Duration::ZERO
            } else {
                Duration::from_secs_f64(-bucket.tokens / self.rate)
            }
        };

        if !wait.is_zero() {
            tracing::trace!(wait_ms = wait.as_millis() as u64, "Rate limiter waiting");
            let reservation = Reservation {
                limiter: self,
                tokens: f64::from(n),
            };
            tokio::time::sleep(wait).await;
            std::mem::forget(reservation);
        }
        wait
    }

    fn refund(&self, tokens: f64) {
        let mut bucket = self.lock();
        self.refill(&mut bucket);
        bucket.tokens = (bucket.tokens + tokens).min(self.burst);
    }

    /// 대기 없이 토큰 `n`개 획득 시도.
    pub fn try_acquire(&self, n: u32) -> bool {
        let mut bucket = self.lock();
        self.refill(&mut bucket);

        let needed = f64::from(n);
        if bucket.tokens >= needed {
            bucket.tokens -= needed;
            true
        } else {
            false
        }
    }

    /// 현재 사용 가능한 토큰 수.
    pub fn available(&self) -> f64 {
        let mut bucket = self.lock();
        self.refill(&mut bucket);
        bucket.tokens.max(0.0)
    }
}

/// 대기가 끝나기 전에 drop되면 예약을 취소합니다.
struct Reservation<'a> {
    limiter: &'a TokenBucketRateLimiter,
    tokens: f64,
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        tracing::trace!(tokens = self.tokens, "Rate limiter reservation cancelled");
        self.limiter.refund(self.tokens);
    }
}
